//! Cluster adapter for strand.
//!
//! Each process attaches its namespaces to a [`Cluster`], which follows the
//! shared log's change feed and routes peer records to the matching
//! [`NamespaceAdapter`]. Local socket bookkeeping stays behind the
//! [`LocalAdapter`] trait.

pub mod ack;
pub mod cluster;
pub mod config;
pub mod emitter;
pub mod error;
pub mod feed;
pub mod heartbeat;
pub mod liveness;
pub mod local;
pub mod namespace;
pub mod publish;
pub mod request;
pub mod session;

pub use ack::{AckFn, ClientCountFn};
pub use cluster::Cluster;
pub use config::AdapterConfig;
pub use emitter::{Emitter, RESERVED_EVENTS};
pub use error::{AdapterError, RequestError, RestoreError};
pub use feed::{FeedState, FEED_RECONNECT_BACKOFF};
pub use local::{LocalAdapter, LocalSocket, MemoryLocalAdapter, Responder};
pub use namespace::NamespaceAdapter;
