//! Session registry: the process-wide map of live rendezvous sessions.
//!
//! One mutex guards the map itself and is held only for O(1) operations;
//! each session guards its own member set. Sessions disappear the moment
//! their last member leaves, so the registry never accumulates garbage.

use crate::config::RelayConfig;
use sotto_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Opaque client identifier, minted at accept time.
pub type ClientId = String;

/// One admitted client, as the registry sees it.
#[derive(Debug)]
pub struct Member {
    /// Client id.
    pub id: ClientId,
    /// Declared nickname, empty when the client sent none.
    pub nickname: String,
    /// Declared long-lived public key material, opaque to the relay.
    pub public_key: String,
    /// Write side of the client's connection, present in routed mode.
    /// Opaque-mode members have no writer here; their sockets belong to
    /// the pumps.
    pub writer: Option<Arc<Mutex<OwnedWriteHalf>>>,
}

/// A live rendezvous session.
#[derive(Debug)]
pub struct Session {
    /// Opaque session id.
    pub id: String,
    /// Client id of the creator.
    pub owner: ClientId,
    /// Insertion-ordered member set.
    pub members: Mutex<Vec<Member>>,
    /// Client ids barred from joining.
    pub banned: Mutex<HashSet<ClientId>>,
    /// Cumulative bytes relayed across all members.
    bytes_relayed: AtomicU64,
    /// Budget the session may relay before teardown.
    max_session_bytes: u64,
    /// First member's socket, parked until its partner arrives
    /// (opaque mode only).
    pub parked: Mutex<Option<TcpStream>>,
}

impl Session {
    /// Account `n` relayed bytes. Returns `false` once the budget is
    /// exhausted; the caller tears the session down.
    pub fn add_relayed(&self, n: u64) -> bool {
        let total = self.bytes_relayed.fetch_add(n, Ordering::Relaxed) + n;
        total <= self.max_session_bytes
    }

    /// Bytes relayed so far.
    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.load(Ordering::Relaxed)
    }

    /// Serialize `value` as one JSON line to every member except `except`.
    ///
    /// Holds the member lock across the writes, serializing deliveries
    /// against membership changes. Members whose write fails are dropped
    /// from the session and returned.
    pub async fn broadcast(&self, value: &serde_json::Value, except: Option<&str>) -> Vec<ClientId> {
        let line = match to_line(value) {
            Ok(line) => line,
            Err(_) => return Vec::new(),
        };

        let mut failed = Vec::new();
        let mut members = self.members.lock().await;
        for member in members.iter() {
            if Some(member.id.as_str()) == except {
                continue;
            }
            if let Some(writer) = &member.writer {
                if writer.lock().await.write_all(&line).await.is_err() {
                    failed.push(member.id.clone());
                }
            }
        }
        members.retain(|m| !failed.contains(&m.id));
        failed
    }

    /// Serialize `value` as one JSON line to the member with `id`.
    ///
    /// Returns `false` (and drops the member) when the write fails, and
    /// `true` otherwise, including when no such member exists.
    pub async fn send_to(&self, id: &str, value: &serde_json::Value) -> bool {
        let Ok(line) = to_line(value) else {
            return true;
        };

        let mut members = self.members.lock().await;
        let Some(member) = members.iter().find(|m| m.id == id) else {
            return true;
        };
        let Some(writer) = member.writer.clone() else {
            return true;
        };

        if writer.lock().await.write_all(&line).await.is_err() {
            members.retain(|m| m.id != id);
            return false;
        }
        true
    }

    /// Whether `id` is currently a member.
    pub async fn is_member(&self, id: &str) -> bool {
        self.members.lock().await.iter().any(|m| m.id == id)
    }
}

fn to_line(value: &serde_json::Value) -> std::result::Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

/// Snapshot of a member for intro messages to a newcomer.
#[derive(Clone, Debug)]
pub struct MemberSnapshot {
    /// Client id.
    pub id: ClientId,
    /// Declared nickname.
    pub nickname: String,
    /// Declared public key material.
    pub public_key: String,
}

/// Handle to the process-wide session map. Cheap to clone; tests build
/// isolated instances.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    config: RelayConfig,
}

impl SessionRegistry {
    /// Build a registry with the given limits.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Create a session and admit `owner` as its first member.
    ///
    /// An empty `requested_id` mints a UUID; a supplied id that is already
    /// taken fails with [`Error::SessionExists`].
    pub async fn create(&self, requested_id: &str, owner: Member) -> Result<Arc<Session>> {
        let id = if requested_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            requested_id.to_string()
        };

        let mut sessions = self.inner.sessions.lock().await;
        if sessions.contains_key(&id) {
            return Err(Error::SessionExists);
        }

        let session = Arc::new(Session {
            id: id.clone(),
            owner: owner.id.clone(),
            members: Mutex::new(vec![owner]),
            banned: Mutex::new(HashSet::new()),
            bytes_relayed: AtomicU64::new(0),
            max_session_bytes: self.inner.config.max_session_bytes,
            parked: Mutex::new(None),
        });
        sessions.insert(id.clone(), Arc::clone(&session));
        info!(session = %id, total = sessions.len(), "session created");

        Ok(session)
    }

    /// Admit `member` into the session with `id`.
    ///
    /// Returns the session and a snapshot of the members present before
    /// the join, for routed-mode introductions.
    pub async fn join(&self, id: &str, member: Member) -> Result<(Arc<Session>, Vec<MemberSnapshot>)> {
        let session = self.get(id).await.ok_or(Error::SessionNotFound)?;

        if session.banned.lock().await.contains(&member.id) {
            return Err(Error::Banned);
        }

        let prior = {
            let mut members = session.members.lock().await;
            if members.len() >= self.inner.config.max_members {
                return Err(Error::SessionFull);
            }
            let prior: Vec<MemberSnapshot> = members
                .iter()
                .map(|m| MemberSnapshot {
                    id: m.id.clone(),
                    nickname: m.nickname.clone(),
                    public_key: m.public_key.clone(),
                })
                .collect();
            members.push(member);
            prior
        };

        debug!(session = %id, members = prior.len() + 1, "member joined");
        Ok((session, prior))
    }

    /// Remove a member; the session itself is destroyed once empty.
    ///
    /// Returns `true` when the session survived (so the caller can
    /// broadcast the departure).
    pub async fn leave(&self, session_id: &str, client_id: &str) -> bool {
        let Some(session) = self.get(session_id).await else {
            return false;
        };

        let now_empty = {
            let mut members = session.members.lock().await;
            members.retain(|m| m.id != client_id);
            members.is_empty()
        };

        if now_empty {
            self.remove(session_id).await;
            return false;
        }
        true
    }

    /// Unconditional teardown: drop the session from the map.
    pub async fn remove(&self, session_id: &str) {
        let mut sessions = self.inner.sessions.lock().await;
        if sessions.remove(session_id).is_some() {
            info!(session = %session_id, total = sessions.len(), "session closed");
        }
    }

    /// Look a session up by id.
    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.lock().await.get(id).cloned()
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// The limits this registry was built with.
    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Mint a fresh client id.
    pub fn mint_client_id() -> ClientId {
        Uuid::new_v4().to_string()
    }
}
