//! The secure channel: one connection, end to end.
//!
//! A [`Channel`] owns an admitted relay connection. Establishing it runs
//! the key exchange by role, announces our nickname, and spawns the
//! long-running reader loop that unseals and dispatches every incoming
//! frame. The handle it returns drives the outbound side: text, file
//! offers, accept/reject decisions.

use crate::crypto::{aead, fingerprint};
use crate::error::{Error, Result};
use crate::logging::RedactedHex;
use crate::messaging::handshake::{self, Role};
use crate::messaging::sink::MessageSink;
use crate::messaging::transfer::{self, IncomingFile, CHUNK_SIZE};
use crate::protocol::{FileMetadata, FrameReader, FrameWriter, MessageType, RawFrame};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Default cap on offered file size (10 MiB).
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Byte stream a channel can run over: plain TCP, TLS, or an in-memory
/// pipe in tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type BoxedTransport = Box<dyn Transport>;

/// Connection lifecycle as observed by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not yet connected.
    Idle,
    /// Transport connected, session admitted.
    Connecting,
    /// Key exchange frames in flight.
    KeyExchange,
    /// Encrypted channel live, nicknames being exchanged.
    NicknameExchange,
    /// Chat and transfer requests accepted.
    Ready,
    /// Streaming an accepted outgoing file.
    SendingFile,
    /// Writing an accepted incoming file.
    ReceivingFile,
    /// Our offer is awaiting the peer's decision.
    AwaitingAcceptance,
    /// Reader loop exited; the channel is dead.
    Closed,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Channel construction parameters.
pub struct ChannelConfig {
    /// Handshake role: the session creator initiates.
    pub role: Role,
    /// Nickname announced to the peer after the key exchange.
    pub nickname: String,
    /// Cap on offered file size in bytes.
    pub max_file_bytes: u64,
    /// Directory incoming files are written to.
    pub download_dir: PathBuf,
}

impl ChannelConfig {
    /// Config with default limits and the current directory as the
    /// download target.
    pub fn new(role: Role, nickname: impl Into<String>) -> Self {
        Self {
            role,
            nickname: nickname.into(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            download_dir: PathBuf::from("."),
        }
    }
}

#[derive(Default)]
struct TransferSlot {
    /// Incoming offer awaiting the UI's accept/reject.
    pending_in: Option<FileMetadata>,
    /// Our outgoing offer awaiting the peer's decision.
    pending_out: Option<FileMetadata>,
    /// Open receive sink.
    incoming: Option<IncomingFile>,
    /// An accepted outgoing transfer is streaming.
    sending: bool,
}

impl TransferSlot {
    fn busy(&self) -> bool {
        self.pending_in.is_some()
            || self.pending_out.is_some()
            || self.incoming.is_some()
            || self.sending
    }
}

struct ChannelInner {
    writer: Mutex<FrameWriter<WriteHalf<BoxedTransport>>>,
    key: Zeroizing<[u8; 32]>,
    sink: Arc<dyn MessageSink>,
    state: Arc<Mutex<ChannelState>>,
    peer_nickname: Mutex<Option<String>>,
    transfer: Mutex<TransferSlot>,
    max_file_bytes: u64,
    download_dir: PathBuf,
}

/// Handle to an established secure channel. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Establish a channel over an admitted connection.
    ///
    /// Runs the key exchange by role, announces the nickname, and spawns
    /// the reader loop. Everything the connection does from here on is
    /// reported through `sink`.
    pub async fn establish(
        stream: impl Transport + 'static,
        config: ChannelConfig,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Self> {
        let boxed: BoxedTransport = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        let state = Arc::new(Mutex::new(ChannelState::Connecting));
        sink.send_connected();

        *state.lock().await = ChannelState::KeyExchange;
        let outcome = handshake::perform(&mut reader, &mut writer, config.role).await?;
        sink.send_my_public_key(outcome.my_public.as_bytes());
        sink.send_peer_public_key(outcome.peer_public.as_bytes());
        sink.send_shared_key();
        info!(
            peer = %RedactedHex(&fingerprint(outcome.peer_public.as_bytes())),
            "encrypted channel established"
        );

        *state.lock().await = ChannelState::NicknameExchange;
        let inner = Arc::new(ChannelInner {
            writer: Mutex::new(writer),
            key: Zeroizing::new(*outcome.shared.as_bytes()),
            sink,
            state,
            peer_nickname: Mutex::new(None),
            transfer: Mutex::new(TransferSlot::default()),
            max_file_bytes: config.max_file_bytes,
            download_dir: config.download_dir,
        });

        let channel = Self { inner };
        channel.send_nickname(&config.nickname).await?;

        tokio::spawn(Self::read_loop(Arc::clone(&channel.inner), reader));

        Ok(channel)
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ChannelState {
        *self.inner.state.lock().await
    }

    /// Announce a nickname to the peer.
    pub async fn send_nickname(&self, nickname: &str) -> Result<()> {
        self.inner
            .write_sealed(MessageType::Nickname, nickname.as_bytes())
            .await
    }

    /// Send a chat message.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.inner
            .write_sealed(MessageType::Text, text.as_bytes())
            .await
    }

    /// Offer a file to the peer.
    ///
    /// Validates size and readability first; nothing is sent when the
    /// offer fails or another transfer is already in flight. Failures are
    /// also reported on the sink as `OfferFailed`.
    pub async fn offer_file(&self, path: &Path) -> Result<()> {
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
            slot.pending_out = Some(metadata.clone());
        }
        self.inner.set_state(ChannelState::AwaitingAcceptance).await;

        self.inner
            .write_sealed(MessageType::FileOffer, &metadata.to_json()?)
            .await?;
        debug!(file = %metadata.file_name, size = metadata.file_size, "file offered");
        Ok(())
    }

    /// Accept the pending incoming offer and open the receive sink.
    pub async fn accept_offer(&self) -> Result<()> {
        let metadata = {
            let mut slot = self.inner.transfer.lock().await;
            let Some(metadata) = slot.pending_in.take() else {
                let err = Error::OfferFailed("no pending file offer".into());
                self.inner.sink.send_file_offer_failed(err.to_string());
                return Err(err);
            };

            let incoming = IncomingFile::create(&self.inner.download_dir, &metadata).await?;
            slot.incoming = Some(incoming);
            metadata
        };

        self.inner.set_state(ChannelState::ReceivingFile).await;
        self.inner
            .write_sealed(MessageType::FileAccept, &metadata.to_json()?)
            .await
    }

    /// Reject the pending incoming offer.
    pub async fn reject_offer(&self) -> Result<()> {
        {
            let mut slot = self.inner.transfer.lock().await;
            if slot.pending_in.take().is_none() {
                return Ok(());
            }
        }
        self.inner.write_sealed(MessageType::FileReject, b"").await
    }

    /// Shut the connection down, unblocking the reader loop.
    pub async fn close(&self) -> Result<()> {
        self.inner.set_state(ChannelState::Closed).await;
        self.inner.writer.lock().await.shutdown().await
    }

    async fn read_loop(inner: Arc<ChannelInner>, mut reader: FrameReader<ReadHalf<BoxedTransport>>) {
        loop {
            match reader.read_frame().await {
                Ok(frame) => {
                    if let Err(e) = Self::dispatch(&inner, frame).await {
                        inner.sink.send_error(e.to_string());
                        break;
                    }
                }
                Err(Error::ConnectionClosed) => {
                    inner.sink.send_connection_closed();
                    break;
                }
                Err(e) => {
                    inner.sink.send_error(e.to_string());
                    break;
                }
            }
        }
        inner.set_state(ChannelState::Closed).await;
    }

    /// Handle one frame. `Err` means the connection must die; recoverable
    /// conditions are reported to the sink and swallowed here.
    async fn dispatch(inner: &Arc<ChannelInner>, frame: RawFrame) -> Result<()> {
        let kind = match MessageType::from_byte(frame.kind) {
            Ok(kind) => kind,
            Err(e) => {
                inner.sink.send_error(e.to_string());
                return Ok(());
            }
        };

        if kind == MessageType::KeyExchange {
            inner
                .sink
                .send_error("unexpected key exchange frame on established channel".into());
            return Ok(());
        }

        let plaintext = match aead::open(&inner.key, &frame.payload) {
            Ok(p) => p,
            Err(_) => {
                inner
                    .sink
                    .send_error("failed to decrypt a message from the peer".into());
                return Ok(());
            }
        };

        match kind {
            MessageType::Nickname => {
                let nickname = String::from_utf8_lossy(&plaintext).into_owned();
                *inner.peer_nickname.lock().await = Some(nickname.clone());
                {
                    let mut state = inner.state.lock().await;
                    if *state == ChannelState::NicknameExchange {
                        *state = ChannelState::Ready;
                    }
                }
                inner.sink.send_info(format!("{nickname} joined the chat"));
            }
            MessageType::Text => {
                let text = String::from_utf8_lossy(&plaintext).into_owned();
                inner.sink.send_received_text(inner.peer_name().await, text);
            }
            MessageType::FileOffer => {
                let Ok(metadata) = FileMetadata::from_json(&plaintext) else {
                    inner.sink.send_error("malformed file offer".into());
                    return Ok(());
                };

                let busy = {
                    let mut slot = inner.transfer.lock().await;
                    if slot.busy() {
                        true
                    } else {
                        slot.pending_in = Some(metadata.clone());
                        false
                    }
                };

                if busy {
                    inner
                        .sink
                        .send_file_offer_failed("offer dropped: a transfer is in progress".into());
                    inner.write_sealed(MessageType::FileReject, b"").await?;
                } else {
                    inner.sink.send_file_offer(metadata, inner.peer_name().await);
                }
            }
            MessageType::FileAccept => {
                let Ok(metadata) = FileMetadata::from_json(&plaintext) else {
                    inner.sink.send_error("malformed file acceptance".into());
                    return Ok(());
                };

                // The echoed metadata only confirms which offer was taken;
                // the path we stream from is the one we stored at offer
                // time, never the peer's copy.
                let offered = {
                    let mut slot = inner.transfer.lock().await;
                    match slot.pending_out.take() {
                        Some(offered) if offered.file_name == metadata.file_name => {
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

                inner.set_state(ChannelState::SendingFile).await;
                inner.sink.send_file_offer_accepted(metadata);

                let path = offered.original_path.clone().unwrap_or_default();
                let total = offered.file_size.max(0) as u64;
                tokio::spawn(Self::send_file(
                    Arc::clone(inner),
                    PathBuf::from(path),
                    total,
                ));
            }
            MessageType::FileReject => {
                {
                    let mut slot = inner.transfer.lock().await;
                    slot.pending_out = None;
                }
                inner.set_state(ChannelState::Ready).await;
                inner.sink.send_file_offer_rejected(inner.peer_name().await);
            }
            MessageType::FileChunk => {
                let mut slot = inner.transfer.lock().await;
                match slot.incoming.as_mut() {
                    Some(incoming) => {
                        incoming.append(&plaintext).await?;
                        let progress = incoming.progress();
                        drop(slot);
                        inner.sink.send_file_chunk(plaintext.len());
                        inner.sink.send_progress(progress);
                    }
                    None => {
                        drop(slot);
                        inner.sink.send_error("file chunk with no transfer open".into());
                    }
                }
            }
            MessageType::FileDone => {
                let finished = {
                    let mut slot = inner.transfer.lock().await;
                    slot.incoming.take()
                };
                match finished {
                    Some(incoming) => {
                        let path = incoming.finish().await?;
                        inner.set_state(ChannelState::Ready).await;
                        inner.sink.send_file_done();
                        inner.sink.send_info(format!("saved {}", path.display()));
                    }
                    None => {
                        inner.sink.send_error("file done with no transfer open".into());
                    }
                }
            }
            MessageType::KeyExchange => unreachable!("handled above"),
        }

        Ok(())
    }

    /// Stream an accepted file as sealed 4 KiB chunks, then the done
    /// marker.
    async fn send_file(inner: Arc<ChannelInner>, path: PathBuf, total: u64) {
        let result = Self::send_chunks(&inner, &path, total).await;

        {
            let mut slot = inner.transfer.lock().await;
            slot.sending = false;
        }
        inner.set_state(ChannelState::Ready).await;

        match result {
            Ok(sent) => {
                info!(file = %path.display(), bytes = sent, "file sent");
                inner.sink.send_info(format!("sent {}", path.display()));
            }
            Err(e) => inner.sink.send_error(format!("file send failed: {e}")),
        }
    }

    async fn send_chunks(inner: &Arc<ChannelInner>, path: &Path, total: u64) -> Result<u64> {
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
            inner.write_sealed(MessageType::FileChunk, &buf[..n]).await?;
            sent += n as u64;
            let progress = if total == 0 {
                1.0
            } else {
                (sent as f64 / total as f64).min(1.0)
            };
            inner.sink.send_progress(progress);
        }

        inner.write_sealed(MessageType::FileDone, b"").await?;
        Ok(sent)
    }
}

impl ChannelInner {
    async fn write_sealed(&self, kind: MessageType, plaintext: &[u8]) -> Result<()> {
        let blob = aead::seal(&self.key, plaintext)?;
        self.writer.lock().await.write_frame(kind, &blob).await
    }

    async fn set_state(&self, state: ChannelState) {
        *self.state.lock().await = state;
    }

    async fn peer_name(&self) -> String {
        self.peer_nickname
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| "peer".to_string())
    }
}
