//! Ephemeral X25519 key exchange over the framed stream.
//!
//! Exactly two `KeyExchange` frames, each a raw 32-byte public key. The
//! initiator (session creator) writes first and then reads; the responder
//! (joiner) reads first and then writes. Both sides then derive the shared
//! AEAD key by Diffie-Hellman. Any deviation fails the session.

use crate::crypto::{EphemeralKeypair, PublicKey, SharedSecret};
use crate::error::{Error, Result};
use crate::protocol::{FrameReader, FrameWriter, MessageType};
use tokio::io::{AsyncRead, AsyncWrite};

/// Which side of the exchange this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Session creator: sends its public key first.
    Initiator,
    /// Session joiner: reads the peer's key first.
    Responder,
}

/// Result of a completed key exchange.
pub struct HandshakeOutcome {
    /// The derived shared secret, used directly as the AEAD key.
    pub shared: SharedSecret,
    /// Our public key, for fingerprint display.
    pub my_public: PublicKey,
    /// The peer's public key, for fingerprint display.
    pub peer_public: PublicKey,
}

impl std::fmt::Debug for HandshakeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeOutcome")
            .field("shared", &"<redacted>")
            .field("my_public", &self.my_public)
            .field("peer_public", &self.peer_public)
            .finish()
    }
}

/// Run the two-frame exchange by role.
pub async fn perform<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    role: Role,
) -> Result<HandshakeOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let keypair = EphemeralKeypair::generate();
    let my_public = *keypair.public_key();

    let peer_public = match role {
        Role::Initiator => {
            send_public_key(writer, &my_public).await?;
            read_public_key(reader).await?
        }
        Role::Responder => {
            let peer = read_public_key(reader).await?;
            send_public_key(writer, &my_public).await?;
            peer
        }
    };

    let shared = keypair.diffie_hellman(&peer_public);

    // A low-order peer point collapses the curve product to all zeros.
    if shared.as_bytes().iter().all(|&b| b == 0) {
        return Err(Error::Handshake("degenerate shared secret".into()));
    }

    Ok(HandshakeOutcome {
        shared,
        my_public,
        peer_public,
    })
}

async fn send_public_key<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    public: &PublicKey,
) -> Result<()> {
    writer
        .write_frame(MessageType::KeyExchange, public.as_bytes())
        .await
        .map_err(|e| Error::Handshake(format!("sending public key: {e}")))
}

async fn read_public_key<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Result<PublicKey> {
    let frame = reader
        .read_frame()
        .await
        .map_err(|e| Error::Handshake(format!("reading public key: {e}")))?;

    if frame.kind != MessageType::KeyExchange.to_byte() {
        return Err(Error::Handshake(format!(
            "expected key exchange frame, got type {:#04x}",
            frame.kind
        )));
    }

    let bytes: [u8; 32] = frame
        .payload
        .as_slice()
        .try_into()
        .map_err(|_| Error::Handshake("public key must be 32 bytes".into()))?;

    Ok(PublicKey::from_bytes(bytes))
}
