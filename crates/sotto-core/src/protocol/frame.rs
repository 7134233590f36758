//! Async framing codec: `type (1) ‖ length (u32 BE) ‖ payload`.
//!
//! The reader validates the length header against [`MAX_FRAME_BYTES`]
//! before allocating a buffer, so an absurd header cannot drive memory
//! consumption. Key-exchange frames must carry exactly 32 bytes.

use crate::error::{Error, Result};
use crate::protocol::types::MessageType;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Hard cap on frame payload length (10 MiB).
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// A frame as read off the wire.
///
/// The type byte is kept raw so an unknown value can be surfaced as a
/// non-fatal protocol error by the dispatcher instead of killing the read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Wire type byte.
    pub kind: u8,
    /// Frame payload.
    pub payload: Vec<u8>,
}

/// Buffered frame reader over any async byte stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a stream in a buffered frame reader.
    pub fn new(stream: R) -> Self {
        Self {
            inner: BufReader::new(stream),
        }
    }

    /// Read one complete frame.
    ///
    /// Fails with [`Error::ConnectionClosed`] on clean EOF at a frame
    /// boundary, [`Error::Transport`] on mid-frame EOF or I/O failure, and
    /// [`Error::Protocol`] when the length header violates the caps.
    pub async fn read_frame(&mut self) -> Result<RawFrame> {
        let mut kind_buf = [0u8; 1];
        match self.inner.read_exact(&mut kind_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        }
        let kind = kind_buf[0];

        let length = self.inner.read_u32().await? as usize;

        if kind == MessageType::KeyExchange.to_byte() {
            if length != 32 {
                return Err(Error::Protocol(format!(
                    "key exchange payload must be 32 bytes, got {length}"
                )));
            }
        } else if length > MAX_FRAME_BYTES {
            return Err(Error::Protocol(format!(
                "frame length {length} exceeds cap {MAX_FRAME_BYTES}"
            )));
        }

        let mut payload = vec![0u8; length];
        self.inner.read_exact(&mut payload).await?;

        Ok(RawFrame { kind, payload })
    }
}

/// Frame writer over any async byte stream.
///
/// Each frame is assembled into one buffer and written with a single call,
/// so a frame is never interleaved with another as long as writers are
/// serialized by the caller.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a stream in a frame writer.
    pub fn new(stream: W) -> Self {
        Self { inner: stream }
    }

    /// Write one frame of the given type.
    pub async fn write_frame(&mut self, kind: MessageType, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_BYTES {
            return Err(Error::Protocol(format!(
                "refusing to write frame of {} bytes (cap {MAX_FRAME_BYTES})",
                payload.len()
            )));
        }

        let mut buf = Vec::with_capacity(1 + 4 + payload.len());
        buf.push(kind.to_byte());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);

        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the underlying stream, unblocking the peer's reader.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer
            .write_frame(MessageType::Text, b"hello frame")
            .await
            .expect("write");

        let frame = reader.read_frame().await.expect("read");
        assert_eq!(frame.kind, MessageType::Text.to_byte());
        assert_eq!(frame.payload, b"hello frame");
    }

    #[tokio::test]
    async fn test_empty_payload_roundtrip() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer
            .write_frame(MessageType::FileDone, b"")
            .await
            .expect("write");

        let frame = reader.read_frame().await.expect("read");
        assert_eq!(frame.kind, MessageType::FileDone.to_byte());
        assert!(frame.payload.is_empty());
    }

    #[tokio::test]
    async fn test_writer_rejects_oversize() {
        let (client, _server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client);

        let oversize = vec![0u8; MAX_FRAME_BYTES + 1];
        let err = writer
            .write_frame(MessageType::FileChunk, &oversize)
            .await
            .expect_err("must refuse");
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_reader_rejects_oversize_header() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        // Hand-rolled header declaring a payload beyond the cap.
        let mut bytes = vec![MessageType::Text.to_byte()];
        bytes.extend_from_slice(&((MAX_FRAME_BYTES as u32) + 1).to_be_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut client, &bytes)
            .await
            .expect("write");

        let err = reader.read_frame().await.expect_err("must reject");
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_key_exchange_length_must_be_32() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        let mut bytes = vec![MessageType::KeyExchange.to_byte()];
        bytes.extend_from_slice(&31u32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 31]);
        tokio::io::AsyncWriteExt::write_all(&mut client, &bytes)
            .await
            .expect("write");

        let err = reader.read_frame().await.expect_err("must reject");
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_eof_at_boundary_is_connection_closed() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        drop(client);

        let err = reader.read_frame().await.expect_err("must fail");
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_transport_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        // Header promises 10 bytes, stream delivers 3 then closes.
        let mut bytes = vec![MessageType::Text.to_byte()];
        bytes.extend_from_slice(&10u32.to_be_bytes());
        bytes.extend_from_slice(b"abc");
        tokio::io::AsyncWriteExt::write_all(&mut client, &bytes)
            .await
            .expect("write");
        drop(client);

        let err = reader.read_frame().await.expect_err("must fail");
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_back_to_back_frames_preserve_order() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        for i in 0u8..5 {
            writer
                .write_frame(MessageType::Text, &[i; 16])
                .await
                .expect("write");
        }

        for i in 0u8..5 {
            let frame = reader.read_frame().await.expect("read");
            assert_eq!(frame.payload, vec![i; 16]);
        }
    }
}
