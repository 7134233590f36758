//! # sotto core library
//!
//! End-to-end encrypted terminal chat and file transfer over an untrusted
//! relay. Two peers meet in a relay session, run an ephemeral X25519 key
//! exchange through the forwarder, and speak a length-prefixed framed
//! protocol whose payloads are sealed with AES-256-GCM. The relay only ever
//! sees ciphertext.
//!
//! ## Security Model
//!
//! - The relay is untrusted: it forwards opaque bytes and can at worst drop
//!   or tamper (tampering fails authentication on the receiving side).
//! - Peer identity is Trust-On-First-Use: both sides display short key
//!   fingerprints for out-of-band comparison.
//! - Keys are ephemeral per connection and zeroized on drop; nothing is
//!   persisted.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            UI (MessageSink)             │
//! ├─────────────────────────────────────────┤
//! │   messaging: channel │ transfer │ sink  │
//! ├─────────────────────────────────────────┤
//! │         protocol (frame, types)         │
//! ├─────────────────────────────────────────┤
//! │          crypto (aead, keys)            │
//! └─────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod crypto;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod protocol;

pub use error::{Error, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
