//! Error types for sotto.
//!
//! Errors are split along the fatality boundary the protocol engine cares
//! about: transport and handshake failures end the connection, while
//! decryption and offer failures are surfaced and the stream continues.

use thiserror::Error;

/// Core error type for sotto operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The peer or relay closed the stream (EOF).
    #[error("connection closed")]
    ConnectionClosed,

    /// Any other stream-level I/O failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Wire protocol violation: framing cap exceeded, malformed control
    /// JSON, or an unexpected message type where a specific one is required.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Key exchange failed: wrong frame type, wrong key size, or the DH
    /// computation itself.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// AEAD open failed. Details are intentionally vague; a tag mismatch
    /// and a truncated blob are indistinguishable to the caller.
    #[error("decryption failed")]
    Decryption,

    /// A file offer could not be made or accepted.
    #[error("file offer failed: {0}")]
    OfferFailed(String),

    /// A session with the requested id already exists.
    #[error("session already exists")]
    SessionExists,

    /// No session with the requested id.
    #[error("session not found")]
    SessionNotFound,

    /// The session is at its member cap.
    #[error("session is full")]
    SessionFull,

    /// The client id is in the session's banned set.
    #[error("banned from session")]
    Banned,

    /// The session relayed more than its byte budget.
    #[error("session bandwidth limit exceeded")]
    BandwidthExceeded,

    /// No bytes moved for the inactivity window.
    #[error("session timed out due to inactivity")]
    InactivityTimeout,
}

/// Result type alias using sotto's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error ends the connection.
    ///
    /// Decryption failures and offer failures are surfaced to the sink and
    /// the reader loop keeps going; everything else tears the stream down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Decryption | Error::OfferFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_split() {
        assert!(!Error::Decryption.is_fatal());
        assert!(!Error::OfferFailed("busy".into()).is_fatal());
        assert!(Error::ConnectionClosed.is_fatal());
        assert!(Error::Protocol("bad length".into()).is_fatal());
        assert!(Error::Handshake("wrong type".into()).is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: Error = io.into();
        assert!(matches!(err, Error::Transport(_)));
    }
}
