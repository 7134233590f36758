//! Multi-party rooms over the structured-routing relay wire.
//!
//! Where a [`super::channel::Channel`] speaks the framed two-party
//! protocol through an opaque relay, a [`Room`] speaks newline-delimited
//! JSON through a routing relay. Public keys travel inside the relay's
//! membership messages, every present pair of members derives its own
//! X25519 shared key, and each payload is sealed separately per
//! recipient, so the relay still only ever sees ciphertext.

use crate::crypto::{aead, EphemeralKeypair, PublicKey};
use crate::error::{Error, Result};
use crate::messaging::channel::Transport;
use crate::messaging::sink::MessageSink;
use crate::messaging::transfer::{self, IncomingFile, CHUNK_SIZE};
use crate::protocol::FileMetadata;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroizing;

type BoxedTransport = Box<dyn Transport>;

/// How to enter a session.
pub enum RoomCommand {
    /// Create a session, optionally under a chosen id.
    Create {
        /// Requested session id; empty lets the relay mint one.
        session_id: Option<String>,
    },
    /// Join an existing session.
    Join {
        /// The session to join.
        session_id: String,
    },
}

/// Room construction parameters.
pub struct RoomConfig {
    /// Nickname announced in the admission command.
    pub nickname: String,
    /// Cap on offered file size in bytes.
    pub max_file_bytes: u64,
    /// Directory incoming files are written to.
    pub download_dir: PathBuf,
}

impl RoomConfig {
    /// Config with default limits and the current directory as the
    /// download target.
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            max_file_bytes: super::channel::DEFAULT_MAX_FILE_BYTES,
            download_dir: PathBuf::from("."),
        }
    }
}

struct PeerEntry {
    nickname: String,
    key: Zeroizing<[u8; 32]>,
}

#[derive(Default)]
struct RoomTransferSlot {
    /// Incoming offer awaiting the UI's decision: offering member's id
    /// plus the metadata.
    pending_in: Option<(String, FileMetadata)>,
    /// Our outgoing offer: recipient id plus the metadata.
    pending_out: Option<(String, FileMetadata)>,
    /// Open receive sink.
    incoming: Option<IncomingFile>,
    /// An accepted outgoing transfer is streaming.
    sending: bool,
}

impl RoomTransferSlot {
    fn busy(&self) -> bool {
        self.pending_in.is_some()
            || self.pending_out.is_some()
            || self.incoming.is_some()
            || self.sending
    }
}

struct RoomInner {
    writer: Mutex<WriteHalf<BoxedTransport>>,
    keypair: EphemeralKeypair,
    peers: Mutex<HashMap<String, PeerEntry>>,
    sink: Arc<dyn MessageSink>,
    transfer: Mutex<RoomTransferSlot>,
    max_file_bytes: u64,
    download_dir: PathBuf,
}

/// Handle to a joined multi-party session. Cheap to clone.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
    session_id: String,
}

impl Room {
    /// Connect through a routing relay: send the admission command with
    /// our public key, parse the reply, and spawn the reader loop.
    pub async fn connect(
        stream: impl Transport + 'static,
        command: RoomCommand,
        config: RoomConfig,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Self> {
        let keypair = EphemeralKeypair::generate();

        let boxed: BoxedTransport = Box::new(stream);
        let (read_half, mut write_half) = tokio::io::split(boxed);
        let mut reader = BufReader::new(read_half);

        sink.send_connected();

        let (command_name, requested_id) = match &command {
            RoomCommand::Create { session_id } => {
                ("CREATE", session_id.clone().unwrap_or_default())
            }
            RoomCommand::Join { session_id } => ("JOIN", session_id.clone()),
        };
        let hello = json!({
            "command": command_name,
            "sessionID": requested_id,
            "nickname": config.nickname,
            "publicKey": BASE64.encode(keypair.public_key().as_bytes()),
        });
        let mut line = serde_json::to_vec(&hello)
            .map_err(|e| Error::Protocol(format!("encode admission command: {e}")))?;
        line.push(b'\n');
        write_half.write_all(&line).await?;

        let mut reply = String::new();
        if reader.read_line(&mut reply).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
        let session_id = parse_admission_reply(reply.trim())?;

        sink.send_my_public_key(keypair.public_key().as_bytes());
        info!(session = %session_id, "joined routed session");

        let inner = Arc::new(RoomInner {
            writer: Mutex::new(write_half),
            keypair,
            peers: Mutex::new(HashMap::new()),
            sink,
            transfer: Mutex::new(RoomTransferSlot::default()),
            max_file_bytes: config.max_file_bytes,
            download_dir: config.download_dir,
        });

        tokio::spawn(Self::read_loop(Arc::clone(&inner), reader));

        Ok(Self { inner, session_id })
    }

    /// The session this room is part of.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send a chat message to every present member, sealed separately
    /// under each pairwise key.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        for (id, key) in self.inner.peer_keys().await {
            let ciphertext = aead::seal(&key, text.as_bytes())?;
            self.inner
                .send_json(&json!({
                    "type": "message",
                    "recipient": id,
                    "ciphertext": BASE64.encode(&ciphertext),
                }))
                .await?;
        }
        Ok(())
    }

    /// Offer a file to one member.
    pub async fn offer_file(&self, recipient: &str, path: &Path) -> Result<()> {
        {
            let slot = self.inner.transfer.lock().await;
            if slot.busy() {
                let err = Error::OfferFailed("another transfer is in progress".into());
                self.inner.sink.send_file_offer_failed(err.to_string());
                return Err(err);
            }
        }

        let metadata = match transfer::prepare_offer(path, self.inner.max_file_bytes).await {
            Ok(m) => m,
            Err(e) => {
                self.inner.sink.send_file_offer_failed(e.to_string());
                return Err(e);
            }
        };

        {
            let mut slot = self.inner.transfer.lock().await;
            slot.pending_out = Some((recipient.to_string(), metadata.clone()));
        }

        self.inner
            .send_sealed_field(recipient, "file_offer", "metadata", &metadata.to_json()?)
            .await?;
        debug!(file = %metadata.file_name, to = %recipient, "file offered");
        Ok(())
    }

    /// Accept the pending incoming offer and open the receive sink.
    pub async fn accept_offer(&self) -> Result<()> {
        let (sender, metadata) = {
            let mut slot = self.inner.transfer.lock().await;
            let Some((sender, metadata)) = slot.pending_in.take() else {
                let err = Error::OfferFailed("no pending file offer".into());
                self.inner.sink.send_file_offer_failed(err.to_string());
                return Err(err);
            };

            let incoming = IncomingFile::create(&self.inner.download_dir, &metadata).await?;
            slot.incoming = Some(incoming);
            (sender, metadata)
        };

        self.inner
            .send_sealed_field(&sender, "file_accept", "metadata", &metadata.to_json()?)
            .await
    }

    /// Reject the pending incoming offer.
    pub async fn reject_offer(&self) -> Result<()> {
        let sender = {
            let mut slot = self.inner.transfer.lock().await;
            match slot.pending_in.take() {
                Some((sender, _)) => sender,
                None => return Ok(()),
            }
        };
        self.inner
            .send_json(&json!({"type": "file_reject", "recipient": sender}))
            .await
    }

    /// Shut the connection down, unblocking the reader loop.
    pub async fn close(&self) -> Result<()> {
        self.inner.writer.lock().await.shutdown().await?;
        Ok(())
    }

    async fn read_loop(inner: Arc<RoomInner>, mut reader: BufReader<ReadHalf<BoxedTransport>>) {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    inner.sink.send_connection_closed();
                    return;
                }
                Ok(_) => {
                    if let Err(e) = Self::dispatch(&inner, line.trim()).await {
                        inner.sink.send_error(e.to_string());
                        return;
                    }
                }
                Err(e) => {
                    inner.sink.send_error(Error::from(e).to_string());
                    return;
                }
            }
        }
    }

    /// Handle one routed message. `Err` ends the connection; everything
    /// recoverable is reported and swallowed.
    async fn dispatch(inner: &Arc<RoomInner>, line: &str) -> Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        let Ok(msg) = serde_json::from_str::<Value>(line) else {
            inner.sink.send_error("malformed message from relay".into());
            return Ok(());
        };

        let msg_type = msg.get("type").and_then(Value::as_str).unwrap_or_default();
        match msg_type {
            "user_joined" => {
                if let Some((id, nickname, public_key)) = inner.register_peer(&msg).await {
                    inner.sink.send_user_joined(id, nickname, &public_key);
                }
            }
            "public_key" => {
                if let Some((id, nickname, public_key)) = inner.register_peer(&msg).await {
                    inner.sink.send_public_key(id, nickname, &public_key);
                }
            }
            "user_left" => {
                let Some(id) = msg.get("userID").and_then(Value::as_str) else {
                    return Ok(());
                };
                inner.peers.lock().await.remove(id);
                inner.sink.send_user_left(id.to_string());
            }
            "message" => {
                let Some(plaintext) = inner.open_field(&msg, "ciphertext").await else {
                    return Ok(());
                };
                let sender = inner.sender_nickname(&msg).await;
                let text = String::from_utf8_lossy(&plaintext).into_owned();
                inner.sink.send_received_text(sender, text);
            }
            "file_offer" => {
                let Some(plaintext) = inner.open_field(&msg, "metadata").await else {
                    return Ok(());
                };
                let Ok(metadata) = FileMetadata::from_json(&plaintext) else {
                    inner.sink.send_error("malformed file offer".into());
                    return Ok(());
                };
                let Some(sender_id) = msg.get("sender").and_then(Value::as_str) else {
                    return Ok(());
                };

                let busy = {
                    let mut slot = inner.transfer.lock().await;
                    if slot.busy() {
                        true
                    } else {
                        slot.pending_in = Some((sender_id.to_string(), metadata.clone()));
                        false
                    }
                };

                if busy {
                    inner
                        .sink
                        .send_file_offer_failed("offer dropped: a transfer is in progress".into());
                    inner
                        .send_json(&json!({"type": "file_reject", "recipient": sender_id}))
                        .await?;
                } else {
                    let sender = inner.sender_nickname(&msg).await;
                    inner.sink.send_file_offer(metadata, sender);
                }
            }
            "file_accept" => {
                let Some(plaintext) = inner.open_field(&msg, "metadata").await else {
                    return Ok(());
                };
                let Ok(metadata) = FileMetadata::from_json(&plaintext) else {
                    inner.sink.send_error("malformed file acceptance".into());
                    return Ok(());
                };
                let Some(sender_id) = msg.get("sender").and_then(Value::as_str) else {
                    return Ok(());
                };

                let offered = {
                    let mut slot = inner.transfer.lock().await;
                    match slot.pending_out.take() {
                        Some((recipient, offered))
                            if recipient == sender_id
                                && offered.file_name == metadata.file_name =>
                        {
                            slot.sending = true;
                            Some(offered)
                        }
                        other => {
                            slot.pending_out = other;
                            None
                        }
                    }
                };

                let Some(offered) = offered else {
                    inner.sink.send_error("acceptance for an unknown offer".into());
                    return Ok(());
                };

                inner.sink.send_file_offer_accepted(metadata);
                let path = offered.original_path.clone().unwrap_or_default();
                let total = offered.file_size.max(0) as u64;
                tokio::spawn(Self::send_file(
                    Arc::clone(inner),
                    sender_id.to_string(),
                    PathBuf::from(path),
                    total,
                ));
            }
            "file_reject" => {
                {
                    let mut slot = inner.transfer.lock().await;
                    slot.pending_out = None;
                }
                let sender = inner.sender_nickname(&msg).await;
                inner.sink.send_file_offer_rejected(sender);
            }
            "file_chunk" => {
                let Some(chunk) = inner.open_field(&msg, "chunk").await else {
                    return Ok(());
                };
                let mut slot = inner.transfer.lock().await;
                match slot.incoming.as_mut() {
                    Some(incoming) => {
                        incoming.append(&chunk).await?;
                        let progress = incoming.progress();
                        drop(slot);
                        inner.sink.send_file_chunk(chunk.len());
                        inner.sink.send_progress(progress);
                    }
                    None => {
                        drop(slot);
                        inner.sink.send_error("file chunk with no transfer open".into());
                    }
                }
            }
            "file_done" => {
                let finished = {
                    let mut slot = inner.transfer.lock().await;
                    slot.incoming.take()
                };
                match finished {
                    Some(incoming) => {
                        let path = incoming.finish().await?;
                        inner.sink.send_file_done();
                        inner.sink.send_info(format!("saved {}", path.display()));
                    }
                    None => {
                        inner.sink.send_error("file done with no transfer open".into());
                    }
                }
            }
            other => {
                inner
                    .sink
                    .send_error(format!("received unknown message type: {other}"));
            }
        }

        Ok(())
    }

    /// Stream an accepted file to one recipient as sealed chunks.
    async fn send_file(inner: Arc<RoomInner>, recipient: String, path: PathBuf, total: u64) {
        let result = Self::send_chunks(&inner, &recipient, &path, total).await;

        {
            let mut slot = inner.transfer.lock().await;
            slot.sending = false;
        }

        match result {
            Ok(sent) => {
                info!(file = %path.display(), bytes = sent, to = %recipient, "file sent");
                inner.sink.send_info(format!("sent {}", path.display()));
            }
            Err(e) => inner.sink.send_error(format!("file send failed: {e}")),
        }
    }

    async fn send_chunks(
        inner: &Arc<RoomInner>,
        recipient: &str,
        path: &Path,
        total: u64,
    ) -> Result<u64> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::OfferFailed(format!("could not reopen file: {e}")))?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent: u64 = 0;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            inner
                .send_sealed_field(recipient, "file_chunk", "chunk", &buf[..n])
                .await?;
            sent += n as u64;
            let progress = if total == 0 {
                1.0
            } else {
                (sent as f64 / total as f64).min(1.0)
            };
            inner.sink.send_progress(progress);
        }

        inner
            .send_json(&json!({"type": "file_done", "recipient": recipient}))
            .await?;
        Ok(sent)
    }
}

fn parse_admission_reply(reply: &str) -> Result<String> {
    if let Some(id) = reply.strip_prefix("Joined session: ") {
        return Ok(id.to_string());
    }
    if let Some(message) = reply.strip_prefix("Error: ") {
        return Err(Error::Protocol(format!("relay refused: {message}")));
    }
    if let Ok(value) = serde_json::from_str::<Value>(reply) {
        if value.get("type").and_then(Value::as_str) == Some("session_created") {
            if let Some(id) = value.get("sessionID").and_then(Value::as_str) {
                return Ok(id.to_string());
            }
        }
    }
    Err(Error::Protocol(format!("unexpected relay reply: {reply}")))
}

/// Decode a declared public key: base64 first, raw 32 bytes as fallback.
fn decode_public_key(encoded: &str) -> Option<PublicKey> {
    if let Ok(decoded) = BASE64.decode(encoded) {
        if let Ok(bytes) = <[u8; 32]>::try_from(decoded.as_slice()) {
            return Some(PublicKey::from_bytes(bytes));
        }
    }
    <[u8; 32]>::try_from(encoded.as_bytes())
        .ok()
        .map(PublicKey::from_bytes)
}

impl RoomInner {
    /// Derive and store the pairwise key for a member announced by the
    /// relay. Returns the identity triple for the sink, or `None` (with
    /// an error event) when the announcement is unusable.
    async fn register_peer(&self, msg: &Value) -> Option<(String, String, Vec<u8>)> {
        let id = msg.get("userID").and_then(Value::as_str)?.to_string();
        let nickname = msg
            .get("nickname")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let encoded = msg.get("publicKey").and_then(Value::as_str)?;

        let Some(public_key) = decode_public_key(encoded) else {
            self.sink
                .send_error(format!("unusable public key for member {id}"));
            return None;
        };

        let shared = self.keypair.diffie_hellman(&public_key);
        if shared.as_bytes().iter().all(|&b| b == 0) {
            self.sink
                .send_error(format!("degenerate shared secret with member {id}"));
            return None;
        }

        self.peers.lock().await.insert(
            id.clone(),
            PeerEntry {
                nickname: nickname.clone(),
                key: Zeroizing::new(*shared.as_bytes()),
            },
        );

        Some((id, nickname, public_key.as_bytes().to_vec()))
    }

    async fn peer_keys(&self) -> Vec<(String, Zeroizing<[u8; 32]>)> {
        self.peers
            .lock()
            .await
            .iter()
            .map(|(id, peer)| (id.clone(), peer.key.clone()))
            .collect()
    }

    async fn peer_key(&self, id: &str) -> Option<Zeroizing<[u8; 32]>> {
        self.peers.lock().await.get(id).map(|peer| peer.key.clone())
    }

    async fn sender_nickname(&self, msg: &Value) -> String {
        let Some(id) = msg.get("sender").and_then(Value::as_str) else {
            return "peer".to_string();
        };
        let peers = self.peers.lock().await;
        peers
            .get(id)
            .map(|peer| peer.nickname.clone())
            .filter(|nickname| !nickname.is_empty())
            .unwrap_or_else(|| id.to_string())
    }

    /// Decode and open a sealed base64 field from a message stamped with
    /// `sender`. Emits a non-fatal error and returns `None` on failure.
    async fn open_field(&self, msg: &Value, field: &str) -> Option<Zeroizing<Vec<u8>>> {
        let Some(sender) = msg.get("sender").and_then(Value::as_str) else {
            self.sink.send_error("message without a sender stamp".into());
            return None;
        };
        let Some(key) = self.peer_key(sender).await else {
            self.sink
                .send_error(format!("message from unknown member {sender}"));
            return None;
        };
        let Some(encoded) = msg.get(field).and_then(Value::as_str) else {
            self.sink.send_error(format!("message missing {field}"));
            return None;
        };
        let Ok(blob) = BASE64.decode(encoded) else {
            self.sink.send_error(format!("undecodable {field} payload"));
            return None;
        };
        match aead::open(&key, &blob) {
            Ok(plaintext) => Some(plaintext),
            Err(_) => {
                self.sink
                    .send_error("failed to decrypt a message from the peer".into());
                None
            }
        }
    }

    async fn send_json(&self, value: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(value)
            .map_err(|e| Error::Protocol(format!("encode message: {e}")))?;
        line.push(b'\n');
        self.writer.lock().await.write_all(&line).await?;
        Ok(())
    }

    /// Seal `plaintext` for `recipient` and send it as a base64 `field`.
    async fn send_sealed_field(
        &self,
        recipient: &str,
        msg_type: &str,
        field: &str,
        plaintext: &[u8],
    ) -> Result<()> {
        let Some(key) = self.peer_key(recipient).await else {
            let err = Error::Protocol(format!("no such member: {recipient}"));
            self.sink.send_error(err.to_string());
            return Err(err);
        };
        let sealed = aead::seal(&key, plaintext)?;
        self.send_json(&json!({
            "type": msg_type,
            "recipient": recipient,
            field: BASE64.encode(&sealed),
        }))
        .await
    }
}
