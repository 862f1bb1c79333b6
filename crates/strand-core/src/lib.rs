//! Core strand primitives shared across crates.
//!
//! Includes process/namespace identifiers, log positions, the packet and
//! broadcast-option model replicated between processes, recoverable
//! sessions, and base errors.

pub mod error;
pub mod packet;
pub mod session;
pub mod types;

pub use error::StrandError;
pub use packet::{BroadcastFlags, BroadcastOptions, Packet, PacketKind, RemoteSocket};
pub use session::Session;
pub use types::{now_millis, LogPosition, NamespaceName, OriginId, RequestId, EMITTER_UID};
