use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use strand_codec::{decode_record_cbor, encode_record_cbor, EventRecord};
use strand_core::{now_millis, LogPosition};
use tokio::sync::mpsc;
use tracing::debug;

use crate::store::{
    ChangeEvent, ChangeFeed, ChangeOperation, FeedError, FeedFilter, LogError,
    LogHealthSnapshot, LogQuery, LogStore,
};

/// Log growth bound applied by [`MemoryLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    #[default]
    Unbounded,
    /// Size-based: keep at most `max_records`, evicting the oldest first.
    Capped { max_records: usize },
    /// Time-based: evict records whose `created_at` is older than `ttl`.
    ///
    /// Records without `created_at` never expire.
    Ttl { ttl: Duration },
}

#[derive(Debug)]
struct StoredRecord {
    bytes: Vec<u8>,
    created_at: Option<u64>,
}

#[derive(Debug)]
struct Subscriber {
    filter: FeedFilter,
    tx: mpsc::UnboundedSender<Result<ChangeEvent, FeedError>>,
}

#[derive(Debug)]
struct MemoryLogInner {
    retention: Retention,
    next_position: u64,
    records: BTreeMap<LogPosition, StoredRecord>,
    highest_evicted: Option<LogPosition>,
    subscribers: Vec<Subscriber>,
    unavailable: Option<String>,
    closed: bool,
    appended: u64,
    evicted: u64,
    feeds_opened: u64,
}

impl MemoryLogInner {
    fn check_available(&self) -> Result<(), LogError> {
        if self.closed {
            return Err(LogError::Closed);
        }
        if let Some(reason) = &self.unavailable {
            return Err(LogError::Unavailable(reason.clone()));
        }
        Ok(())
    }

    fn evict(&mut self, position: LogPosition) {
        if self.records.remove(&position).is_some() {
            self.evicted += 1;
            self.highest_evicted = Some(self.highest_evicted.map_or(position, |p| p.max(position)));
        }
    }

    fn apply_retention(&mut self) {
        match self.retention {
            Retention::Unbounded => {}
            Retention::Capped { max_records } => {
                while self.records.len() > max_records {
                    let Some(oldest) = self.records.keys().next().copied() else {
                        break;
                    };
                    self.evict(oldest);
                }
            }
            Retention::Ttl { ttl } => {
                let cutoff = now_millis().saturating_sub(ttl.as_millis() as u64);
                let expired: Vec<LogPosition> = self
                    .records
                    .iter()
                    .filter(|(_, stored)| stored.created_at.is_some_and(|at| at < cutoff))
                    .map(|(position, _)| *position)
                    .collect();
                for position in expired {
                    self.evict(position);
                }
            }
        }
    }

    fn notify(&mut self, change: &ChangeEvent) {
        self.subscribers.retain(|sub| {
            if !sub.filter.matches(change) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(Ok(change.clone())).is_ok()
        });
    }
}

/// In-process [`LogStore`] used by tests, simulations, and the demo node.
///
/// Records are stored CBOR-encoded so every reader decodes its own copy.
#[derive(Debug)]
pub struct MemoryLog {
    inner: Mutex<MemoryLogInner>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::with_retention(Retention::Unbounded)
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Retention) -> Self {
        Self {
            inner: Mutex::new(MemoryLogInner {
                retention,
                next_position: 1,
                records: BTreeMap::new(),
                highest_evicted: None,
                subscribers: Vec::new(),
                unavailable: None,
                closed: false,
                appended: 0,
                evicted: 0,
                feeds_opened: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryLogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ends every open change feed, as an upstream connection drop would.
    pub fn disconnect_feeds(&self) {
        let mut inner = self.lock();
        debug!(feeds = inner.subscribers.len(), "disconnecting change feeds");
        inner.subscribers.clear();
    }

    /// Delivers `error` on every open change feed, then ends them.
    pub fn fail_feeds(&self, error: FeedError) {
        let mut inner = self.lock();
        for sub in inner.subscribers.drain(..) {
            let _ = sub.tx.send(Err(error.clone()));
        }
    }

    /// Makes every operation fail with [`LogError::Unavailable`] until
    /// called again with `None`.
    pub fn set_unavailable(&self, reason: Option<String>) {
        self.lock().unavailable = reason;
    }

    /// Closes the store and ends all feeds.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }
}

#[async_trait]
impl LogStore for MemoryLog {
    async fn append(&self, record: &EventRecord) -> Result<LogPosition, LogError> {
        let bytes = encode_record_cbor(record)?;
        let mut inner = self.lock();
        inner.check_available()?;

        let position = LogPosition(inner.next_position);
        inner.next_position += 1;
        inner.appended += 1;
        inner.records.insert(
            position,
            StoredRecord {
                bytes,
                created_at: record.created_at,
            },
        );
        inner.apply_retention();
        inner.notify(&ChangeEvent {
            operation: ChangeOperation::Insert,
            position,
            record: Some(record.clone()),
        });
        Ok(position)
    }

    async fn open_change_feed(
        &self,
        filter: FeedFilter,
        resume_after: Option<LogPosition>,
    ) -> Result<ChangeFeed, LogError> {
        let mut inner = self.lock();
        inner.check_available()?;
        inner.apply_retention();
        inner.feeds_opened += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(after) = resume_after {
            if inner.highest_evicted.is_some_and(|evicted| evicted > after) {
                let _ = tx.send(Err(FeedError::NonResumable(format!(
                    "resume position {after} is no longer in the log"
                ))));
                return Ok(ChangeFeed::new(rx));
            }
            for (position, stored) in inner
                .records
                .range((Bound::Excluded(after), Bound::Unbounded))
            {
                let change = ChangeEvent {
                    operation: ChangeOperation::Insert,
                    position: *position,
                    record: Some(decode_record_cbor(&stored.bytes)?),
                };
                if filter.matches(&change) {
                    let _ = tx.send(Ok(change));
                }
            }
        }
        inner.subscribers.push(Subscriber { filter, tx });
        Ok(ChangeFeed::new(rx))
    }

    async fn find_one_and_delete(
        &self,
        query: &LogQuery,
    ) -> Result<Option<(LogPosition, EventRecord)>, LogError> {
        let mut inner = self.lock();
        inner.check_available()?;
        inner.apply_retention();

        let mut found = None;
        for (position, stored) in &inner.records {
            let record = decode_record_cbor(&stored.bytes)?;
            if query.matches(&record) {
                found = Some((*position, record));
                break;
            }
        }
        if let Some((position, _)) = &found {
            inner.records.remove(position);
            inner.notify(&ChangeEvent {
                operation: ChangeOperation::Delete,
                position: *position,
                record: None,
            });
        }
        Ok(found)
    }

    async fn find_at(
        &self,
        position: LogPosition,
        query: &LogQuery,
    ) -> Result<Option<EventRecord>, LogError> {
        let mut inner = self.lock();
        inner.check_available()?;
        inner.apply_retention();

        let Some(stored) = inner.records.get(&position) else {
            return Ok(None);
        };
        let record = decode_record_cbor(&stored.bytes)?;
        Ok(query.matches(&record).then_some(record))
    }

    async fn find_after(
        &self,
        after: LogPosition,
        query: &LogQuery,
    ) -> Result<Vec<(LogPosition, EventRecord)>, LogError> {
        let mut inner = self.lock();
        inner.check_available()?;
        inner.apply_retention();

        let mut out = Vec::new();
        for (position, stored) in inner
            .records
            .range((Bound::Excluded(after), Bound::Unbounded))
        {
            let record = decode_record_cbor(&stored.bytes)?;
            if query.matches(&record) {
                out.push((*position, record));
            }
        }
        Ok(out)
    }

    fn health_snapshot(&self) -> LogHealthSnapshot {
        let inner = self.lock();
        LogHealthSnapshot {
            records_appended: inner.appended,
            records_retained: inner.records.len() as u64,
            records_evicted: inner.evicted,
            feeds_opened: inner.feeds_opened,
            feeds_active: inner
                .subscribers
                .iter()
                .filter(|sub| !sub.tx.is_closed())
                .count() as u64,
        }
    }
}
