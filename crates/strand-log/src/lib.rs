//! Shared log abstractions for strand.
//!
//! Adapters depend only on the [`LogStore`] trait defined here. [`MemoryLog`]
//! is the in-process implementation used by tests and the demo node.

pub mod memory;
pub mod store;

pub use memory::{MemoryLog, Retention};
pub use store::{
    ChangeEvent, ChangeFeed, ChangeOperation, FeedError, FeedFilter, LogError,
    LogHealthSnapshot, LogQuery, LogStore,
};
