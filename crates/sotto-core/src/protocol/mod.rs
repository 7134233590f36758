//! Wire protocol: typed, length-prefixed frames on a byte stream.
//!
//! ## Frame Structure
//!
//! ```text
//! ┌─────────┬──────────┬───────────────────┐
//! │  Type   │  Length  │      Payload      │
//! │ (1 byte)│(4 bytes, │     (variable)    │
//! │         │  BE u32) │                   │
//! └─────────┴──────────┴───────────────────┘
//! ```
//!
//! All payloads are AEAD envelopes except the two `KeyExchange` frames at
//! the start of a connection, which carry raw 32-byte public keys. The
//! relay forwards frames verbatim and never parses them.

mod frame;
mod types;

pub use frame::{FrameReader, FrameWriter, RawFrame, MAX_FRAME_BYTES};
pub use types::{FileMetadata, MessageType};
