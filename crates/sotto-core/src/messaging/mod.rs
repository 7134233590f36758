//! Client-side messaging: the secure channel engine and its collaborators.
//!
//! [`channel::Channel`] owns a two-party connection end-to-end: it runs
//! the key exchange, seals and unseals every frame, multiplexes chat and
//! file transfer, and reports everything that happens to a
//! [`sink::MessageSink`]. [`room::Room`] is its multi-party counterpart
//! over the structured-routing relay wire. The two are incompatible on
//! the wire and a process speaks exactly one of them per connection.

pub mod channel;
pub mod handshake;
pub mod room;
pub mod sink;
pub mod transfer;

pub use channel::{Channel, ChannelConfig, ChannelState};
pub use handshake::Role;
pub use room::{Room, RoomCommand, RoomConfig};
pub use sink::{ChannelSink, ChatEvent, MessageSink};
