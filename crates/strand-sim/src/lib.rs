//! Multi-process cluster simulations over one in-memory log.

pub mod scenarios;

pub use scenarios::{wait_until, SimCluster, SimConfig, SimNode};
