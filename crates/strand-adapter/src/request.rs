use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use strand_core::RequestId;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{AdapterError, RequestError};

/// Outcome of applying a response to a [`RequestTable`] entry.
#[derive(Debug)]
pub enum Update<S> {
    /// No pending entry for that id (late or foreign response).
    Unknown,
    /// Entry updated and still waiting.
    Pending,
    /// Entry completed and removed.
    Completed(S),
}

/// Shared map of in-flight requests keyed by correlation id.
///
/// Every operation is a short synchronous critical section.
#[derive(Debug)]
pub struct RequestTable<S> {
    inner: Arc<Mutex<HashMap<RequestId, S>>>,
}

impl<S> Clone for RequestTable<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Default for RequestTable<S> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<S> RequestTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, id: RequestId, state: S) {
        self.lock().insert(id, state);
    }

    pub fn remove(&self, id: &RequestId) -> Option<S> {
        self.lock().remove(id)
    }

    /// Runs `f` on the entry for `id`, if any, and returns its result.
    pub fn with<R>(&self, id: &RequestId, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        self.lock().get_mut(id).map(f)
    }

    /// Applies `f` to the entry for `id`; the entry is removed when `f`
    /// reports completion.
    pub fn update(&self, id: &RequestId, f: impl FnOnce(&mut S) -> bool) -> Update<S> {
        let mut map = self.lock();
        let Some(state) = map.get_mut(id) else {
            return Update::Unknown;
        };
        if !f(state) {
            return Update::Pending;
        }
        match map.remove(id) {
            Some(state) => Update::Completed(state),
            None => Update::Unknown,
        }
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<S> {
        self.lock().drain().map(|(_, state)| state).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct PendingRequest<T> {
    expected: usize,
    received: usize,
    responses: Vec<T>,
    tx: oneshot::Sender<Vec<T>>,
}

/// Fan-out/fan-in over a known number of expected responders.
#[derive(Debug)]
pub struct Correlator<T> {
    table: RequestTable<PendingRequest<T>>,
}

impl<T> Clone for Correlator<T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
        }
    }
}

impl<T> Default for Correlator<T> {
    fn default() -> Self {
        Self {
            table: RequestTable::new(),
        }
    }
}

impl<T: Send + 'static> Correlator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request waiting on `expected` responses, seeded with
    /// results that are already known locally.
    pub fn register(&self, id: RequestId, expected: usize, seed: Vec<T>) -> PendingResponse<T> {
        let (tx, rx) = oneshot::channel();
        self.table.insert(
            id.clone(),
            PendingRequest {
                expected,
                received: 0,
                responses: seed,
                tx,
            },
        );
        PendingResponse {
            id,
            table: self.table.clone(),
            rx,
        }
    }

    /// Counts one response for `id`. Returns false when no request is
    /// pending for it.
    pub fn on_response(&self, id: &RequestId, items: impl IntoIterator<Item = T>) -> bool {
        let update = self.table.update(id, |pending| {
            pending.received += 1;
            pending.responses.extend(items);
            pending.received >= pending.expected
        });
        match update {
            Update::Unknown => {
                debug!(request_id = %id, "dropping response for unknown request");
                false
            }
            Update::Pending => true,
            Update::Completed(pending) => {
                let _ = pending.tx.send(pending.responses);
                true
            }
        }
    }

    /// Drops every pending request; their waiters fail with
    /// [`AdapterError::Closed`]. Returns how many were pending.
    pub fn close_all(&self) -> usize {
        self.table.drain().len()
    }

    /// Requests still waiting on responses.
    pub fn pending(&self) -> usize {
        self.table.len()
    }
}

/// Caller side of a registered request.
///
/// Dropping it without waiting leaves the entry until a response or a
/// [`PendingResponse::cancel`].
#[derive(Debug)]
pub struct PendingResponse<T> {
    id: RequestId,
    table: RequestTable<PendingRequest<T>>,
    rx: oneshot::Receiver<Vec<T>>,
}

impl<T> PendingResponse<T> {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Forgets the request, e.g. when publishing it failed.
    pub fn cancel(self) {
        self.table.remove(&self.id);
    }

    /// Waits for every expected response or the deadline, whichever is
    /// first. On deadline the entry is removed and the partial results are
    /// returned in the error.
    pub async fn wait(mut self, deadline: Duration) -> Result<Vec<T>, RequestError<T>> {
        match tokio::time::timeout(deadline, &mut self.rx).await {
            Ok(Ok(responses)) => Ok(responses),
            Ok(Err(_)) => Err(AdapterError::Closed.into()),
            Err(_) => match self.table.remove(&self.id) {
                Some(pending) => Err(RequestError::Timeout {
                    received: pending.received,
                    expected: pending.expected,
                    partial: pending.responses,
                }),
                // completed between the deadline and the removal
                None => self
                    .rx
                    .try_recv()
                    .map_err(|_| RequestError::Adapter(AdapterError::Closed)),
            },
        }
    }
}
