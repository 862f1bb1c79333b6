use std::collections::HashMap;
use std::time::{Duration, Instant};

use strand_core::OriginId;

/// Last-seen bookkeeping for peer processes.
#[derive(Debug)]
pub struct PeerLiveness {
    own: OriginId,
    timeout: Duration,
    peers: HashMap<OriginId, Instant>,
}

impl PeerLiveness {
    pub fn new(own: OriginId, timeout: Duration) -> Self {
        Self {
            own,
            timeout,
            peers: HashMap::new(),
        }
    }

    /// Refreshes `origin`'s last-seen time. Self and the emitter are never
    /// peers.
    pub fn observe(&mut self, origin: &OriginId, now: Instant) {
        if *origin == self.own || origin.is_emitter() {
            return;
        }
        self.peers.insert(origin.clone(), now);
    }

    /// Drops peers silent for longer than the timeout and returns how many
    /// remain.
    pub fn expected_peer_count(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        self.peers
            .retain(|_, last_seen| now.saturating_duration_since(*last_seen) <= timeout);
        self.peers.len()
    }
}
