//! Accept loop and per-connection admission flow.

use crate::admission::{self, HelloCommand};
use crate::config::{RelayConfig, RelayMode};
use crate::registry::{Member, SessionRegistry};
use crate::router;
use serde_json::json;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The relay server: a registry plus an accept loop.
pub struct RelayServer {
    registry: SessionRegistry,
}

impl RelayServer {
    /// Build a server. Opaque mode pins the member cap to 2; pumps are
    /// pairwise by construction.
    pub fn new(mut config: RelayConfig) -> Self {
        if config.mode == RelayMode::Opaque {
            config.max_members = 2;
        }
        Self {
            registry: SessionRegistry::new(config),
        }
    }

    /// Handle to the session registry, mainly for tests.
    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Accept connections forever.
    pub async fn run(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "relay listening");

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            debug!(%addr, "connection accepted");

            let registry = self.registry.clone();
            tokio::spawn(async move {
                handle_connection(registry, stream).await;
            });
        }
    }
}

async fn handle_connection(registry: SessionRegistry, mut stream: TcpStream) {
    let config = registry.config().clone();

    let hello = match admission::read_hello(&mut stream, config.admission_timeout).await {
        Ok(hello) => hello,
        Err(e) => {
            // Stalled or garbled before admission: close without a reply.
            debug!(error = %e, "connection dropped during admission");
            return;
        }
    };

    let client_id = SessionRegistry::mint_client_id();

    match (hello.command.as_str(), config.mode) {
        ("CREATE", RelayMode::Opaque) => create_opaque(registry, stream, hello, client_id).await,
        ("JOIN", RelayMode::Opaque) => join_opaque(registry, stream, hello, client_id).await,
        ("CREATE", RelayMode::Routed) => create_routed(registry, stream, hello, client_id).await,
        ("JOIN", RelayMode::Routed) => join_routed(registry, stream, hello, client_id).await,
        _ => {
            debug!(command = %hello.command, "unknown admission command");
            let _ = stream.write_all(b"Error: Unknown command\n").await;
        }
    }
}

fn member_from_hello(hello: &HelloCommand, client_id: &str, writer: Option<Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>>) -> Member {
    Member {
        id: client_id.to_string(),
        nickname: hello.nickname.clone(),
        public_key: hello.public_key.clone(),
        writer,
    }
}

async fn create_opaque(
    registry: SessionRegistry,
    mut stream: TcpStream,
    hello: HelloCommand,
    client_id: String,
) {
    let member = member_from_hello(&hello, &client_id, None);
    let session = match registry.create(&hello.session_id, member).await {
        Ok(session) => session,
        Err(e) => {
            let _ = stream.write_all(admission::error_reply(&e).as_bytes()).await;
            return;
        }
    };

    let reply = format!("Session created: {}\n", session.id);
    if stream.write_all(reply.as_bytes()).await.is_err() {
        registry.remove(&session.id).await;
        return;
    }

    // Park the creator's socket until a partner joins. A session whose
    // partner never arrives is reaped after the idle window.
    *session.parked.lock().await = Some(stream);

    let reaper_registry = registry.clone();
    let reaper_session = Arc::clone(&session);
    tokio::spawn(async move {
        tokio::time::sleep(reaper_registry.config().idle_timeout).await;
        let still_parked = reaper_session.parked.lock().await.take().is_some();
        if still_parked {
            info!(session = %reaper_session.id, "unjoined session reaped");
            reaper_registry.remove(&reaper_session.id).await;
        }
    });
}

async fn join_opaque(
    registry: SessionRegistry,
    mut stream: TcpStream,
    hello: HelloCommand,
    client_id: String,
) {
    let member = member_from_hello(&hello, &client_id, None);
    let session = match registry.join(&hello.session_id, member).await {
        Ok((session, _prior)) => session,
        Err(e) => {
            let _ = stream.write_all(admission::error_reply(&e).as_bytes()).await;
            return;
        }
    };

    let parked = session.parked.lock().await.take();
    let Some(first) = parked else {
        // The creator vanished between parking and this join.
        let _ = stream
            .write_all(admission::error_reply(&sotto_core::Error::SessionNotFound).as_bytes())
            .await;
        registry.remove(&session.id).await;
        return;
    };

    let reply = format!("Joined session: {}\n", session.id);
    if stream.write_all(reply.as_bytes()).await.is_err() {
        registry.remove(&session.id).await;
        return;
    }

    router::run_opaque_pair(registry, session, first, stream).await;
}

async fn create_routed(
    registry: SessionRegistry,
    stream: TcpStream,
    hello: HelloCommand,
    client_id: String,
) {
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(write_half));

    let member = member_from_hello(&hello, &client_id, Some(Arc::clone(&writer)));
    let session = match registry.create(&hello.session_id, member).await {
        Ok(session) => session,
        Err(e) => {
            let _ = writer
                .lock()
                .await
                .write_all(admission::error_reply(&e).as_bytes())
                .await;
            return;
        }
    };

    let mut reply = match serde_json::to_vec(&json!({
        "type": "session_created",
        "sessionID": session.id,
    })) {
        Ok(reply) => reply,
        Err(_) => return,
    };
    reply.push(b'\n');
    if writer.lock().await.write_all(&reply).await.is_err() {
        registry.remove(&session.id).await;
        return;
    }

    router::run_routed_member(registry, session, client_id, read_half).await;
}

async fn join_routed(
    registry: SessionRegistry,
    stream: TcpStream,
    hello: HelloCommand,
    client_id: String,
) {
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(write_half));

    let member = member_from_hello(&hello, &client_id, Some(Arc::clone(&writer)));
    let (session, prior) = match registry.join(&hello.session_id, member).await {
        Ok(joined) => joined,
        Err(e) => {
            let _ = writer
                .lock()
                .await
                .write_all(admission::error_reply(&e).as_bytes())
                .await;
            return;
        }
    };

    let joined_ok = {
        let mut w = writer.lock().await;
        let mut ok = w
            .write_all(format!("Joined session: {}\n", session.id).as_bytes())
            .await
            .is_ok();

        // Introduce everyone already present to the newcomer.
        for snapshot in &prior {
            if !ok {
                break;
            }
            let mut line = match serde_json::to_vec(&json!({
                "type": "public_key",
                "userID": snapshot.id,
                "nickname": snapshot.nickname,
                "publicKey": snapshot.public_key,
            })) {
                Ok(line) => line,
                Err(_) => continue,
            };
            line.push(b'\n');
            ok = w.write_all(&line).await.is_ok();
        }
        ok
    };

    if !joined_ok {
        if registry.leave(&session.id, &client_id).await {
            session
                .broadcast(&json!({"type": "user_left", "userID": client_id}), None)
                .await;
        }
        return;
    }

    session
        .broadcast(
            &json!({
                "type": "user_joined",
                "userID": client_id,
                "nickname": hello.nickname,
                "publicKey": hello.public_key,
            }),
            Some(client_id.as_str()),
        )
        .await;

    router::run_routed_member(registry, session, client_id, read_half).await;
}
