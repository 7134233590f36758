//! The one-way event boundary between the transport and the UI.
//!
//! The engine never talks to a terminal; it reports through a
//! [`MessageSink`] injected at channel construction. Production code wires
//! in a [`ChannelSink`] feeding the UI's event loop; tests inject a
//! recording sink.

use crate::protocol::FileMetadata;
use tokio::sync::mpsc;

/// Capability set the transport needs from the UI boundary.
///
/// All methods are fire-and-forget; a sink must never block the reader
/// loop.
pub trait MessageSink: Send + Sync {
    /// A non-fatal or fatal error, already rendered for display.
    fn send_error(&self, message: String);

    /// Informational status line.
    fn send_info(&self, message: String);

    /// The transport is connected and admitted to a session.
    fn send_connected(&self);

    /// The key exchange completed and an encrypted channel is live.
    /// Key material itself stays inside the engine.
    fn send_shared_key(&self);

    /// Our own public key, for fingerprint display.
    fn send_my_public_key(&self, public_key: &[u8]);

    /// The peer's public key, for fingerprint display.
    fn send_peer_public_key(&self, public_key: &[u8]);

    /// Decrypted chat text from a peer.
    fn send_received_text(&self, sender: String, text: String);

    /// A file offer awaiting an accept/reject decision.
    fn send_file_offer(&self, metadata: FileMetadata, sender: String);

    /// The peer accepted our offer; sending begins.
    fn send_file_offer_accepted(&self, metadata: FileMetadata);

    /// The peer rejected our offer.
    fn send_file_offer_rejected(&self, sender: String);

    /// An offer could not be made or taken (too large, unreadable, busy).
    fn send_file_offer_failed(&self, reason: String);

    /// A chunk of the incoming file was written.
    fn send_file_chunk(&self, chunk_len: usize);

    /// The incoming file is complete and closed.
    fn send_file_done(&self);

    /// Transfer progress in `[0.0, 1.0]`.
    fn send_progress(&self, fraction: f64);

    /// The stream reached EOF or was torn down.
    fn send_connection_closed(&self);

    /// A member joined the session (multi-party).
    fn send_user_joined(&self, user_id: String, nickname: String, public_key: &[u8]);

    /// A member left the session (multi-party).
    fn send_user_left(&self, user_id: String);

    /// Introduction of a member already present when we joined
    /// (multi-party).
    fn send_public_key(&self, user_id: String, nickname: String, public_key: &[u8]);
}

/// Events as delivered to the UI event loop by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// See [`MessageSink::send_error`].
    Error(String),
    /// See [`MessageSink::send_info`].
    Info(String),
    /// See [`MessageSink::send_connected`].
    Connected,
    /// See [`MessageSink::send_shared_key`].
    SharedKeyEstablished,
    /// See [`MessageSink::send_my_public_key`].
    MyPublicKey(Vec<u8>),
    /// See [`MessageSink::send_peer_public_key`].
    PeerPublicKey(Vec<u8>),
    /// See [`MessageSink::send_received_text`].
    ReceivedText {
        /// Display name of the sender.
        sender: String,
        /// Decrypted message body.
        text: String,
    },
    /// See [`MessageSink::send_file_offer`].
    FileOffer {
        /// Offered file's metadata.
        metadata: FileMetadata,
        /// Display name of the offering peer.
        sender: String,
    },
    /// See [`MessageSink::send_file_offer_accepted`].
    FileOfferAccepted(FileMetadata),
    /// See [`MessageSink::send_file_offer_rejected`].
    FileOfferRejected(String),
    /// See [`MessageSink::send_file_offer_failed`].
    FileOfferFailed(String),
    /// See [`MessageSink::send_file_chunk`].
    FileChunk(usize),
    /// See [`MessageSink::send_file_done`].
    FileDone,
    /// See [`MessageSink::send_progress`].
    Progress(f64),
    /// See [`MessageSink::send_connection_closed`].
    ConnectionClosed,
    /// See [`MessageSink::send_user_joined`].
    UserJoined {
        /// Joining member's id.
        user_id: String,
        /// Joining member's nickname.
        nickname: String,
        /// Joining member's public key.
        public_key: Vec<u8>,
    },
    /// See [`MessageSink::send_user_left`].
    UserLeft(String),
    /// See [`MessageSink::send_public_key`].
    PeerIntroduced {
        /// Introduced member's id.
        user_id: String,
        /// Introduced member's nickname.
        nickname: String,
        /// Introduced member's public key.
        public_key: Vec<u8>,
    },
}

/// A [`MessageSink`] that forwards every event into an unbounded channel.
///
/// Unbounded by design: the reader loop must never stall on a slow UI, and
/// event volume is bounded by frame volume.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiving end for the UI loop.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: ChatEvent) {
        // A dropped receiver means the UI is gone; nothing left to notify.
        let _ = self.tx.send(event);
    }
}

impl MessageSink for ChannelSink {
    fn send_error(&self, message: String) {
        self.emit(ChatEvent::Error(message));
    }

    fn send_info(&self, message: String) {
        self.emit(ChatEvent::Info(message));
    }

    fn send_connected(&self) {
        self.emit(ChatEvent::Connected);
    }

    fn send_shared_key(&self) {
        self.emit(ChatEvent::SharedKeyEstablished);
    }

    fn send_my_public_key(&self, public_key: &[u8]) {
        self.emit(ChatEvent::MyPublicKey(public_key.to_vec()));
    }

    fn send_peer_public_key(&self, public_key: &[u8]) {
        self.emit(ChatEvent::PeerPublicKey(public_key.to_vec()));
    }

    fn send_received_text(&self, sender: String, text: String) {
        self.emit(ChatEvent::ReceivedText { sender, text });
    }

    fn send_file_offer(&self, metadata: FileMetadata, sender: String) {
        self.emit(ChatEvent::FileOffer { metadata, sender });
    }

    fn send_file_offer_accepted(&self, metadata: FileMetadata) {
        self.emit(ChatEvent::FileOfferAccepted(metadata));
    }

    fn send_file_offer_rejected(&self, sender: String) {
        self.emit(ChatEvent::FileOfferRejected(sender));
    }

    fn send_file_offer_failed(&self, reason: String) {
        self.emit(ChatEvent::FileOfferFailed(reason));
    }

    fn send_file_chunk(&self, chunk_len: usize) {
        self.emit(ChatEvent::FileChunk(chunk_len));
    }

    fn send_file_done(&self) {
        self.emit(ChatEvent::FileDone);
    }

    fn send_progress(&self, fraction: f64) {
        self.emit(ChatEvent::Progress(fraction));
    }

    fn send_connection_closed(&self) {
        self.emit(ChatEvent::ConnectionClosed);
    }

    fn send_user_joined(&self, user_id: String, nickname: String, public_key: &[u8]) {
        self.emit(ChatEvent::UserJoined {
            user_id,
            nickname,
            public_key: public_key.to_vec(),
        });
    }

    fn send_user_left(&self, user_id: String) {
        self.emit(ChatEvent::UserLeft(user_id));
    }

    fn send_public_key(&self, user_id: String, nickname: String, public_key: &[u8]) {
        self.emit(ChatEvent::PeerIntroduced {
            user_id,
            nickname,
            public_key: public_key.to_vec(),
        });
    }
}
