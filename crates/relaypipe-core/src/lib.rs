//! relaypipe-core — shared message type, ARQ wire format, and configuration.
//! All other relaypipe crates depend on this one.

pub mod config;
pub mod message;
pub mod wire;

pub use message::ByteMessage;
pub use wire::{checksum, ControlCode, PacketHeader, PacketState, WireError};
