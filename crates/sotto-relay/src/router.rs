//! Per-session data pumps.
//!
//! Two modes. Opaque: a two-party session becomes a symmetric pair of
//! byte pumps with an inactivity deadline and a shared byte budget; any
//! failure tears both connections and the session down together. Routed:
//! each member's stream is newline-delimited JSON that the router stamps
//! with `sender` and forwards by `recipient` or broadcast, never looking
//! at payload fields.

use crate::registry::{Session, SessionRegistry};
use serde_json::{json, Value};
use sotto_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Copy granularity for opaque pumps; also the slack a session may
/// overshoot its byte budget by before teardown.
pub const RELAY_CHUNK: usize = 4096;

/// Cap on one routed-mode JSON line.
pub const MAX_ROUTED_LINE: usize = 10 * 1024 * 1024;

/// Message types delivered to their `recipient` only; everything else is
/// broadcast to the rest of the session.
const DIRECTED_TYPES: [&str; 6] = [
    "message",
    "file_offer",
    "file_accept",
    "file_reject",
    "file_chunk",
    "file_done",
];

/// Drive a two-party opaque session to completion.
///
/// Runs both directional pumps concurrently; the first error cancels the
/// other pump, which closes both sockets, and the session is removed.
pub async fn run_opaque_pair(
    registry: SessionRegistry,
    session: Arc<Session>,
    first: TcpStream,
    second: TcpStream,
) {
    let idle = registry.config().idle_timeout;
    let (first_read, first_write) = first.into_split();
    let (second_read, second_write) = second.into_split();

    let result = tokio::try_join!(
        pump(first_read, second_write, &session, idle),
        pump(second_read, first_write, &session, idle),
    );

    match result {
        Err(Error::InactivityTimeout) => {
            info!(session = %session.id, "session timed out due to inactivity")
        }
        Err(Error::BandwidthExceeded) => {
            info!(session = %session.id, bytes = session.bytes_relayed(), "session hit its byte budget")
        }
        Err(_) | Ok(_) => debug!(session = %session.id, "relay finished"),
    }

    registry.remove(&session.id).await;
}

/// Copy bytes from `src` to `dst` in [`RELAY_CHUNK`] units until EOF,
/// error, inactivity, or budget exhaustion.
///
/// Generic over the stream halves so tests can drive it with in-memory
/// pipes.
pub async fn pump<R, W>(mut src: R, mut dst: W, session: &Session, idle: Duration) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_CHUNK];
    loop {
        let n = tokio::time::timeout(idle, src.read(&mut buf))
            .await
            .map_err(|_| Error::InactivityTimeout)??;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        dst.write_all(&buf[..n]).await?;
        if !session.add_relayed(n as u64) {
            return Err(Error::BandwidthExceeded);
        }
    }
}

/// Drive one routed-mode member until it disconnects, is dropped on a
/// failed delivery, or its session is torn down.
pub async fn run_routed_member(
    registry: SessionRegistry,
    session: Arc<Session>,
    client_id: String,
    read_half: OwnedReadHalf,
) {
    let idle = registry.config().idle_timeout;
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = tokio::time::timeout(idle, read_json_line(&mut reader, &mut line)).await;

        let parsed = match read {
            Err(_) => {
                info!(session = %session.id, "session timed out due to inactivity");
                teardown_session(&registry, &session).await;
                return;
            }
            Ok(Err(e)) => {
                debug!(session = %session.id, client = %client_id, error = %e, "member stream ended");
                break;
            }
            Ok(Ok(())) => serde_json::from_slice::<Value>(&line),
        };

        if !session.add_relayed(line.len() as u64 + 1) {
            info!(session = %session.id, "session hit its byte budget");
            teardown_session(&registry, &session).await;
            return;
        }

        // A member dropped on a failed delivery still has its reader
        // task running until its next message; drop it here.
        if !session.is_member(&client_id).await {
            return;
        }

        let Ok(value) = parsed else {
            debug!(session = %session.id, client = %client_id, "malformed routed message");
            break;
        };

        route(&session, &client_id, value).await;
    }

    if registry.leave(&session.id, &client_id).await {
        session
            .broadcast(&json!({"type": "user_left", "userID": client_id}), None)
            .await;
    }
}

/// Forward one stamped message. Only `type`, `sender`, and `recipient`
/// are ever inspected.
async fn route(session: &Arc<Session>, sender: &str, mut value: Value) {
    let Some(obj) = value.as_object_mut() else {
        debug!(session = %session.id, "routed message is not an object");
        return;
    };
    obj.insert("sender".to_string(), json!(sender));

    let msg_type = obj.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
    let recipient = obj
        .get("recipient")
        .and_then(Value::as_str)
        .map(str::to_string);

    if DIRECTED_TYPES.contains(&msg_type.as_str()) {
        match recipient {
            Some(recipient) => {
                session.send_to(&recipient, &value).await;
            }
            None => debug!(session = %session.id, kind = %msg_type, "directed message without recipient"),
        }
    } else {
        session.broadcast(&value, Some(sender)).await;
    }
}

/// Remove the session and shut down every member's write side.
async fn teardown_session(registry: &SessionRegistry, session: &Arc<Session>) {
    registry.remove(&session.id).await;
    let mut members = session.members.lock().await;
    for member in members.drain(..) {
        if let Some(writer) = member.writer {
            let _ = writer.lock().await.shutdown().await;
        }
    }
}

/// Read one newline-terminated line with a hard size cap.
async fn read_json_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    line: &mut Vec<u8>,
) -> Result<()> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Err(Error::ConnectionClosed);
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                line.extend_from_slice(&available[..pos]);
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                line.extend_from_slice(available);
                reader.consume(len);
                if line.len() > MAX_ROUTED_LINE {
                    return Err(Error::Protocol("routed message too long".into()));
                }
            }
        }
    }
}
