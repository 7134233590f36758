//! Connection admission: the one-shot opening command.
//!
//! A fresh connection gets a single deadline-bounded chance to send one
//! newline-terminated JSON object naming `CREATE` or `JOIN`. The read is
//! both time-bounded (denies Slowloris stalls) and size-bounded (denies
//! unbounded buffer growth), and consumes nothing past the newline so the
//! framed protocol that follows stays intact.

use serde::Deserialize;
use sotto_core::{Error, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Cap on the opening command line.
pub const MAX_HELLO_BYTES: usize = 8 * 1024;

/// The opening command from a client.
#[derive(Debug, Deserialize)]
pub struct HelloCommand {
    /// `CREATE` or `JOIN`.
    pub command: String,
    /// Session to create (optional) or join (required).
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    /// Declared nickname, used in routed-mode introductions.
    #[serde(default)]
    pub nickname: String,
    /// Declared public key material, opaque to the relay.
    #[serde(rename = "publicKey", default)]
    pub public_key: String,
}

/// Read and parse the opening command within `timeout`.
pub async fn read_hello<R: AsyncRead + Unpin>(
    stream: &mut R,
    timeout: Duration,
) -> Result<HelloCommand> {
    let line = tokio::time::timeout(timeout, read_line_raw(stream))
        .await
        .map_err(|_| Error::InactivityTimeout)??;

    serde_json::from_slice(&line)
        .map_err(|e| Error::Protocol(format!("malformed opening command: {e}")))
}

/// Read up to and including one newline, byte by byte.
///
/// Byte-at-a-time is deliberate: buffering here could swallow the first
/// frames of the opaque protocol that follows the command. The command is
/// sent once per connection, so the cost is irrelevant.
async fn read_line_raw<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    loop {
        match stream.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        }
        if byte[0] == b'\n' {
            return Ok(line);
        }
        line.push(byte[0]);
        if line.len() > MAX_HELLO_BYTES {
            return Err(Error::Protocol("opening command too long".into()));
        }
    }
}

/// Render an admission failure as the client-facing reply line.
pub fn error_reply(err: &Error) -> String {
    match err {
        Error::SessionNotFound => "Error: Session not found\n".to_string(),
        Error::SessionFull => "Error: Session is full\n".to_string(),
        Error::SessionExists => "Error: Session already exists\n".to_string(),
        Error::Banned => "Error: You are banned from this session\n".to_string(),
        other => format!("Error: {other}\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_reads_one_command_and_nothing_more() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"{\"command\":\"JOIN\",\"sessionID\":\"abc\"}\nEXTRA")
            .await
            .expect("write");

        let hello = read_hello(&mut server, Duration::from_secs(1))
            .await
            .expect("hello");
        assert_eq!(hello.command, "JOIN");
        assert_eq!(hello.session_id, "abc");

        // The bytes after the newline must still be on the stream.
        let mut rest = [0u8; 5];
        server.read_exact(&mut rest).await.expect("read rest");
        assert_eq!(&rest, b"EXTRA");
    }

    #[tokio::test]
    async fn test_optional_fields_default_empty() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"{\"command\":\"CREATE\"}\n")
            .await
            .expect("write");

        let hello = read_hello(&mut server, Duration::from_secs(1))
            .await
            .expect("hello");
        assert_eq!(hello.command, "CREATE");
        assert!(hello.session_id.is_empty());
        assert!(hello.nickname.is_empty());
        assert!(hello.public_key.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_client_times_out() {
        let (_client, mut server) = tokio::io::duplex(1024);

        let err = read_hello(&mut server, Duration::from_millis(50))
            .await
            .expect_err("must time out");
        assert!(matches!(err, Error::InactivityTimeout));
    }

    #[tokio::test]
    async fn test_oversize_command_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let long = vec![b'x'; MAX_HELLO_BYTES + 2];
        client.write_all(&long).await.expect("write");

        let err = read_hello(&mut server, Duration::from_secs(1))
            .await
            .expect_err("must reject");
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_malformed_json_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"not json\n").await.expect("write");

        let err = read_hello(&mut server, Duration::from_secs(1))
            .await
            .expect_err("must reject");
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_error_reply_wording() {
        assert_eq!(error_reply(&Error::SessionFull), "Error: Session is full\n");
        assert_eq!(
            error_reply(&Error::SessionNotFound),
            "Error: Session not found\n"
        );
    }
}
