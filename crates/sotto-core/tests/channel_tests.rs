//! End-to-end tests for the secure channel over in-memory transport.
//!
//! Two channels talk through a `tokio::io::duplex` pipe, exactly as they
//! would through the relay's opaque forwarding; a few tests drive one end
//! by hand with raw frames to exercise hostile-peer behavior.

use sotto_core::crypto::{aead, fingerprint};
use sotto_core::messaging::handshake::{self, Role};
use sotto_core::messaging::{Channel, ChannelConfig, ChannelSink, ChatEvent};
use sotto_core::protocol::{FileMetadata, FrameReader, FrameWriter, MessageType};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::UnboundedReceiver;

type Events = UnboundedReceiver<ChatEvent>;

async fn next_event(rx: &mut Events) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

/// Wait for a specific event, skipping others.
async fn wait_for<F: Fn(&ChatEvent) -> bool>(rx: &mut Events, pred: F) -> ChatEvent {
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

fn config(role: Role, nickname: &str, dir: &Path) -> ChannelConfig {
    let mut config = ChannelConfig::new(role, nickname);
    config.download_dir = dir.to_path_buf();
    config
}

async fn establish_pair(
    alice_dir: &Path,
    bob_dir: &Path,
) -> (Channel, Events, Channel, Events) {
    let (a_stream, b_stream) = tokio::io::duplex(256 * 1024);

    let (a_sink, a_events) = ChannelSink::new();
    let (b_sink, b_events) = ChannelSink::new();

    let a_config = config(Role::Initiator, "alice", alice_dir);
    let b_config = config(Role::Responder, "bob", bob_dir);

    let a_task =
        tokio::spawn(async move { Channel::establish(a_stream, a_config, Arc::new(a_sink)).await });
    let b_task =
        tokio::spawn(async move { Channel::establish(b_stream, b_config, Arc::new(b_sink)).await });

    let alice = a_task.await.expect("join").expect("alice establish");
    let bob = b_task.await.expect("join").expect("bob establish");

    (alice, a_events, bob, b_events)
}

fn test_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[tokio::test]
async fn test_establish_reports_keys_then_shared_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_alice, mut a_events, _bob, mut b_events) =
        establish_pair(dir.path(), dir.path()).await;

    assert_eq!(next_event(&mut a_events).await, ChatEvent::Connected);
    let ChatEvent::MyPublicKey(a_my) = next_event(&mut a_events).await else {
        panic!("expected my public key");
    };
    let ChatEvent::PeerPublicKey(a_peer) = next_event(&mut a_events).await else {
        panic!("expected peer public key");
    };
    assert_eq!(next_event(&mut a_events).await, ChatEvent::SharedKeyEstablished);

    assert_eq!(next_event(&mut b_events).await, ChatEvent::Connected);
    let ChatEvent::MyPublicKey(b_my) = next_event(&mut b_events).await else {
        panic!("expected my public key");
    };
    let ChatEvent::PeerPublicKey(b_peer) = next_event(&mut b_events).await else {
        panic!("expected peer public key");
    };

    // Each side's own key is the other's peer key, so the displayed
    // fingerprints can be compared out-of-band.
    assert_eq!(fingerprint(&a_my), fingerprint(&b_peer));
    assert_eq!(fingerprint(&b_my), fingerprint(&a_peer));
}

#[tokio::test]
async fn test_text_arrives_in_order_with_nickname() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (alice, _a_events, _bob, mut b_events) = establish_pair(dir.path(), dir.path()).await;

    for i in 0..5 {
        alice.send_text(&format!("message {i}")).await.expect("send");
    }

    let mut seen = 0;
    while seen < 5 {
        if let ChatEvent::ReceivedText { sender, text } = next_event(&mut b_events).await {
            assert_eq!(sender, "alice");
            assert_eq!(text, format!("message {seen}"));
            seen += 1;
        }
    }
}

#[tokio::test]
async fn test_file_transfer_happy_path() {
    let a_dir = tempfile::tempdir().expect("tempdir");
    let b_dir = tempfile::tempdir().expect("tempdir");
    let (alice, mut a_events, bob, mut b_events) =
        establish_pair(a_dir.path(), b_dir.path()).await;

    let content = test_payload(256 * 1024);
    let source = a_dir.path().join("payload.bin");
    tokio::fs::write(&source, &content).await.expect("write source");

    alice.offer_file(&source).await.expect("offer");

    let offer = wait_for(&mut b_events, |e| matches!(e, ChatEvent::FileOffer { .. })).await;
    let ChatEvent::FileOffer { metadata, sender } = offer else {
        unreachable!()
    };
    assert_eq!(sender, "alice");
    assert_eq!(metadata.file_name, "payload.bin");
    assert_eq!(metadata.file_size, content.len() as i64);

    bob.accept_offer().await.expect("accept");

    wait_for(&mut a_events, |e| matches!(e, ChatEvent::FileOfferAccepted(_))).await;

    // Receiver progress must be monotone and end at 1.0.
    let mut last = 0.0f64;
    loop {
        match next_event(&mut b_events).await {
            ChatEvent::Progress(fraction) => {
                assert!(fraction >= last, "progress went backwards");
                last = fraction;
            }
            ChatEvent::FileDone => break,
            _ => {}
        }
    }
    assert!((last - 1.0).abs() < f64::EPSILON);

    let received = tokio::fs::read(b_dir.path().join("payload.bin"))
        .await
        .expect("read received");
    assert_eq!(sha256(&received), sha256(&content));
}

#[tokio::test]
async fn test_reject_returns_sender_to_ready() {
    let a_dir = tempfile::tempdir().expect("tempdir");
    let b_dir = tempfile::tempdir().expect("tempdir");
    let (alice, mut a_events, bob, mut b_events) =
        establish_pair(a_dir.path(), b_dir.path()).await;

    let source = a_dir.path().join("unwanted.bin");
    tokio::fs::write(&source, b"some bytes").await.expect("write");

    alice.offer_file(&source).await.expect("offer");
    wait_for(&mut b_events, |e| matches!(e, ChatEvent::FileOffer { .. })).await;

    bob.reject_offer().await.expect("reject");
    wait_for(&mut a_events, |e| matches!(e, ChatEvent::FileOfferRejected(_))).await;

    assert_eq!(
        alice.state().await,
        sotto_core::messaging::ChannelState::Ready
    );
    assert!(!b_dir.path().join("unwanted.bin").exists());

    // The pair is usable again afterwards.
    alice.send_text("still here").await.expect("send");
    let event = wait_for(&mut b_events, |e| matches!(e, ChatEvent::ReceivedText { .. })).await;
    assert_eq!(
        event,
        ChatEvent::ReceivedText {
            sender: "alice".into(),
            text: "still here".into()
        }
    );
}

#[tokio::test]
async fn test_oversize_offer_sends_no_frame() {
    let a_dir = tempfile::tempdir().expect("tempdir");
    let b_dir = tempfile::tempdir().expect("tempdir");

    let (a_stream, b_stream) = tokio::io::duplex(256 * 1024);
    let (a_sink, mut a_events) = ChannelSink::new();
    let (b_sink, mut b_events) = ChannelSink::new();

    let mut a_config = config(Role::Initiator, "alice", a_dir.path());
    a_config.max_file_bytes = 1024;
    let b_config = config(Role::Responder, "bob", b_dir.path());

    let a_task =
        tokio::spawn(async move { Channel::establish(a_stream, a_config, Arc::new(a_sink)).await });
    let b_task =
        tokio::spawn(async move { Channel::establish(b_stream, b_config, Arc::new(b_sink)).await });
    let alice = a_task.await.expect("join").expect("alice");
    let _bob = b_task.await.expect("join").expect("bob");

    let source = a_dir.path().join("big.bin");
    tokio::fs::write(&source, vec![0u8; 4096]).await.expect("write");

    alice.offer_file(&source).await.expect_err("must refuse");
    wait_for(&mut a_events, |e| matches!(e, ChatEvent::FileOfferFailed(_))).await;

    // Barrier: a text sent after the failed offer must be the next thing
    // bob sees; no offer frame ever went out.
    alice.send_text("barrier").await.expect("send");
    let event = wait_for(&mut b_events, |e| {
        matches!(e, ChatEvent::ReceivedText { .. } | ChatEvent::FileOffer { .. })
    })
    .await;
    assert!(matches!(event, ChatEvent::ReceivedText { text, .. } if text == "barrier"));
}

#[tokio::test]
async fn test_second_offer_while_busy_fails() {
    let a_dir = tempfile::tempdir().expect("tempdir");
    let b_dir = tempfile::tempdir().expect("tempdir");
    let (alice, _a_events, _bob, mut b_events) = establish_pair(a_dir.path(), b_dir.path()).await;

    let first = a_dir.path().join("first.bin");
    let second = a_dir.path().join("second.bin");
    tokio::fs::write(&first, b"one").await.expect("write");
    tokio::fs::write(&second, b"two").await.expect("write");

    alice.offer_file(&first).await.expect("offer");
    let err = alice.offer_file(&second).await.expect_err("busy");
    assert!(matches!(err, sotto_core::Error::OfferFailed(_)));

    // Only the first offer reaches the peer.
    let ChatEvent::FileOffer { metadata, .. } =
        wait_for(&mut b_events, |e| matches!(e, ChatEvent::FileOffer { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(metadata.file_name, "first.bin");
}

/// A hand-driven peer: performs the handshake and speaks raw frames.
struct RawPeer {
    reader: FrameReader<tokio::io::ReadHalf<DuplexStream>>,
    writer: FrameWriter<tokio::io::WriteHalf<DuplexStream>>,
    key: [u8; 32],
}

impl RawPeer {
    async fn handshake(stream: DuplexStream, role: Role) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);
        let outcome = handshake::perform(&mut reader, &mut writer, role)
            .await
            .expect("raw peer handshake");
        Self {
            reader,
            writer,
            key: *outcome.shared.as_bytes(),
        }
    }

    async fn send_sealed(&mut self, kind: MessageType, plaintext: &[u8]) {
        let blob = aead::seal(&self.key, plaintext).expect("seal");
        self.writer.write_frame(kind, &blob).await.expect("write");
    }

    async fn read_kind(&mut self) -> u8 {
        self.reader.read_frame().await.expect("read").kind
    }
}

#[tokio::test]
async fn test_receive_side_strips_path_components() {
    let b_dir = tempfile::tempdir().expect("tempdir");
    let (a_stream, b_stream) = tokio::io::duplex(64 * 1024);

    let (b_sink, mut b_events) = ChannelSink::new();
    let b_config = config(Role::Responder, "bob", b_dir.path());
    let b_task =
        tokio::spawn(async move { Channel::establish(b_stream, b_config, Arc::new(b_sink)).await });

    let mut peer = RawPeer::handshake(a_stream, Role::Initiator).await;
    let bob = b_task.await.expect("join").expect("bob");

    peer.send_sealed(MessageType::Nickname, b"mallory").await;

    let metadata = FileMetadata {
        file_name: "../../escape.bin".into(),
        file_size: 4,
        original_path: None,
        sender_id: None,
    };
    peer.send_sealed(MessageType::FileOffer, &metadata.to_json().expect("json"))
        .await;

    wait_for(&mut b_events, |e| matches!(e, ChatEvent::FileOffer { .. })).await;
    bob.accept_offer().await.expect("accept");

    // Skip the nickname frame echoed by bob's establish, then expect the
    // acceptance.
    loop {
        let kind = peer.read_kind().await;
        if kind == MessageType::FileAccept.to_byte() {
            break;
        }
    }

    peer.send_sealed(MessageType::FileChunk, b"data").await;
    peer.send_sealed(MessageType::FileDone, b"").await;
    wait_for(&mut b_events, |e| matches!(e, ChatEvent::FileDone)).await;

    // The file lands at the base name inside the download dir; nothing
    // escapes upward.
    assert_eq!(
        tokio::fs::read(b_dir.path().join("escape.bin"))
            .await
            .expect("read"),
        b"data"
    );
    assert!(!b_dir.path().parent().expect("parent").join("escape.bin").exists());
}

#[tokio::test]
async fn test_tampered_and_unknown_frames_are_nonfatal() {
    let b_dir = tempfile::tempdir().expect("tempdir");
    let (a_stream, b_stream) = tokio::io::duplex(64 * 1024);

    let (b_sink, mut b_events) = ChannelSink::new();
    let b_config = config(Role::Responder, "bob", b_dir.path());
    let b_task =
        tokio::spawn(async move { Channel::establish(b_stream, b_config, Arc::new(b_sink)).await });

    let mut peer = RawPeer::handshake(a_stream, Role::Initiator).await;
    let _bob = b_task.await.expect("join").expect("bob");

    peer.send_sealed(MessageType::Nickname, b"mallory").await;

    // A frame that will not authenticate.
    peer.writer
        .write_frame(MessageType::Text, &[0u8; 64])
        .await
        .expect("write garbage");

    let error = wait_for(&mut b_events, |e| matches!(e, ChatEvent::Error(_))).await;
    let ChatEvent::Error(message) = error else { unreachable!() };
    assert!(message.contains("decrypt"));

    // The stream survives and later frames still arrive.
    peer.send_sealed(MessageType::Text, b"still alive").await;
    let event = wait_for(&mut b_events, |e| matches!(e, ChatEvent::ReceivedText { .. })).await;
    assert!(matches!(event, ChatEvent::ReceivedText { text, .. } if text == "still alive"));
}

#[tokio::test]
async fn test_unknown_frame_type_is_nonfatal() {
    use sotto_core::crypto::{EphemeralKeypair, PublicKey};
    use tokio::io::AsyncReadExt;

    let b_dir = tempfile::tempdir().expect("tempdir");
    let (mut a_stream, b_stream) = tokio::io::duplex(64 * 1024);

    let (b_sink, mut b_events) = ChannelSink::new();
    let b_config = config(Role::Responder, "bob", b_dir.path());
    let b_task =
        tokio::spawn(async move { Channel::establish(b_stream, b_config, Arc::new(b_sink)).await });

    // Hand-rolled initiator handshake: key frame out, key frame in.
    fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![kind];
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    let keypair = EphemeralKeypair::generate();
    a_stream
        .write_all(&frame(
            MessageType::KeyExchange.to_byte(),
            keypair.public_key().as_bytes(),
        ))
        .await
        .expect("send key");

    let mut reply = [0u8; 1 + 4 + 32];
    a_stream.read_exact(&mut reply).await.expect("peer key");
    assert_eq!(reply[0], MessageType::KeyExchange.to_byte());
    let peer_key = PublicKey::from_bytes(reply[5..].try_into().expect("32 bytes"));
    let shared = keypair.diffie_hellman(&peer_key);
    let key = *shared.as_bytes();

    let _bob = b_task.await.expect("join").expect("bob");

    let nickname = aead::seal(&key, b"mallory").expect("seal");
    a_stream
        .write_all(&frame(MessageType::Nickname.to_byte(), &nickname))
        .await
        .expect("send nickname");

    // 0x07 is not an assigned message type.
    a_stream
        .write_all(&frame(0x07, b"mystery"))
        .await
        .expect("send unknown");

    let error = wait_for(&mut b_events, |e| matches!(e, ChatEvent::Error(_))).await;
    let ChatEvent::Error(message) = error else { unreachable!() };
    assert!(message.contains("unknown message type"));

    // The reader loop keeps going.
    let text = aead::seal(&key, b"after the noise").expect("seal");
    a_stream
        .write_all(&frame(MessageType::Text.to_byte(), &text))
        .await
        .expect("send text");
    let event = wait_for(&mut b_events, |e| matches!(e, ChatEvent::ReceivedText { .. })).await;
    assert!(matches!(event, ChatEvent::ReceivedText { text, .. } if text == "after the noise"));
}
