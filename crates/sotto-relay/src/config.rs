//! Relay server configuration.

use std::time::Duration;

/// How the relay treats post-admission traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RelayMode {
    /// Two-party sessions; bytes are forwarded verbatim between the pair.
    Opaque,
    /// Multi-party sessions; newline-delimited JSON is routed by
    /// `recipient` or broadcast.
    Routed,
}

/// Limits and timeouts for a relay instance.
///
/// Tests construct these directly with short timeouts; `main` builds them
/// from the CLI surface.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Traffic handling mode.
    pub mode: RelayMode,
    /// Member cap per session. Opaque mode pins this to 2.
    pub max_members: usize,
    /// Byte budget per session before teardown.
    pub max_session_bytes: u64,
    /// How long a fresh connection may take to send its opening command.
    pub admission_timeout: Duration,
    /// Read inactivity window after which a session is torn down.
    pub idle_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::Opaque,
            max_members: 2,
            max_session_bytes: 50 * 1024 * 1024,
            admission_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        }
    }
}
