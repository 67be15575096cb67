//! Device farm protocol layer.
//!
//! Envelope codec, message routing, channel expiry, identity matching,
//! device backends and the per-device session loop, on top of
//! `farm-transport`.
//!
//! Wire format: MessagePack (compact binary).

pub mod backend;
pub mod channels;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod router;
pub mod session;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use backend::{
    parse_getprop, spawn_stream, AdbBackend, DeviceBackend, LocalBackend, ShellEvent, ShellStream,
};
pub use channels::{ChannelManager, Registration, Ttl};
pub use envelope::{decode, encode, Envelope, Message};
pub use error::ProtocolError;
pub use identity::{matches, Identity, Requirement, RequirementKind};
pub use router::{Dispatch, Handler, Router};
pub use session::{Bus, DeviceSession, SessionConfig, SessionEffect, SessionInput, SessionState};
pub use store::{BusStore, DeviceStore, LogStore, MemoryStore, StoreRecord};
pub use types::{make_private_channel, DeviceStatus, MessageType, DEFAULT_GLOBAL_CHANNEL};
