use std::sync::Arc;
use std::time::Duration;

use strand_codec::EventPayload;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::publish::Publisher;

/// Publishes a HEARTBEAT whenever `interval` passes without any publish.
///
/// The task ends once the publisher is closed.
pub fn spawn_heartbeat(publisher: Arc<Publisher>, interval: Duration) -> JoinHandle<()> {
    let mut activity = publisher.activity();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = activity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    if publisher.is_closed() {
                        break;
                    }
                    debug!(namespace = %publisher.namespace(), "sending heartbeat");
                    if let Err(err) = publisher.publish(EventPayload::Heartbeat).await {
                        warn!(namespace = %publisher.namespace(), error = %err, "heartbeat publish failed");
                    }
                }
            }
        }
    })
}
