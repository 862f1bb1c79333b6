use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use strand_core::RequestId;
use tracing::debug;

use crate::request::RequestTable;

/// Receives the number of clients a peer delivered an acknowledged
/// broadcast to.
pub type ClientCountFn = Arc<dyn Fn(usize) + Send + Sync>;
/// Receives one client acknowledgement.
pub type AckFn = Arc<dyn Fn(Value) + Send + Sync>;

struct PendingAck {
    on_client_count: ClientCountFn,
    on_ack: AckFn,
}

/// Routes remote client counts and acks of acknowledged broadcasts back to
/// the caller's callbacks.
///
/// The number of answering peers is unknown, so entries live until their
/// timeout and late records are dropped.
#[derive(Clone, Default)]
pub struct AckAggregator {
    table: RequestTable<PendingAck>,
}

impl AckAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers callbacks for `id` and schedules their removal after
    /// `timeout`. Must be called inside a tokio runtime.
    pub fn register(
        &self,
        id: RequestId,
        timeout: Duration,
        on_client_count: ClientCountFn,
        on_ack: AckFn,
    ) {
        self.table.insert(
            id.clone(),
            PendingAck {
                on_client_count,
                on_ack,
            },
        );
        let table = self.table.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if table.remove(&id).is_some() {
                debug!(request_id = %id, "broadcast ack window closed");
            }
        });
    }

    /// Forgets `id` before its timeout, e.g. when publishing failed.
    pub fn cancel(&self, id: &RequestId) {
        self.table.remove(id);
    }

    pub fn on_client_count(&self, id: &RequestId, count: usize) -> bool {
        let callback = self.table.with(id, |p| Arc::clone(&p.on_client_count));
        match callback {
            Some(callback) => {
                callback(count);
                true
            }
            None => {
                debug!(request_id = %id, "dropping client count for unknown broadcast");
                false
            }
        }
    }

    pub fn on_ack(&self, id: &RequestId, response: Value) -> bool {
        let callback = self.table.with(id, |p| Arc::clone(&p.on_ack));
        match callback {
            Some(callback) => {
                callback(response);
                true
            }
            None => {
                debug!(request_id = %id, "dropping ack for unknown broadcast");
                false
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.table.len()
    }
}
