use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Stream;
use strand_codec::{CodecError, EventKind, EventPayload, EventRecord};
use strand_core::{LogPosition, NamespaceName, OriginId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors returned by log store operations.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log store is closed")]
    Closed,
    #[error("record codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("log store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced on an open change feed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// The resume position is still reachable; re-subscribing after it is safe.
    #[error("resumable feed error: {0}")]
    Resumable(String),
    /// The resume position is gone (e.g. overwritten by retention).
    #[error("non-resumable feed error: {0}")]
    NonResumable(String),
}

impl FeedError {
    pub fn is_resumable(&self) -> bool {
        matches!(self, FeedError::Resumable(_))
    }
}

/// Coarse per-store health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogHealthSnapshot {
    pub records_appended: u64,
    pub records_retained: u64,
    pub records_evicted: u64,
    pub feeds_opened: u64,
    pub feeds_active: u64,
}

/// Change feed operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Insert,
    Delete,
}

/// One change feed notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub position: LogPosition,
    /// Inserted record; `None` for deletes.
    pub record: Option<EventRecord>,
}

/// Server-side filter applied to a change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedFilter {
    /// Drop changes whose record was published by this origin.
    pub exclude_origin: Option<OriginId>,
    /// Deliver insert notifications only.
    pub inserts_only: bool,
}

impl FeedFilter {
    /// Inserts from everyone but `origin`.
    pub fn peers_of(origin: OriginId) -> Self {
        Self {
            exclude_origin: Some(origin),
            inserts_only: true,
        }
    }

    pub fn matches(&self, change: &ChangeEvent) -> bool {
        if self.inserts_only && change.operation != ChangeOperation::Insert {
            return false;
        }
        match (&self.exclude_origin, &change.record) {
            (Some(origin), Some(record)) => record.origin != *origin,
            _ => true,
        }
    }
}

/// Record selector for point lookups and scans.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub kind: Option<EventKind>,
    pub namespace: Option<NamespaceName>,
    /// Matches SESSION records carrying this private id.
    pub session_private_id: Option<String>,
}

impl LogQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn namespace(mut self, namespace: NamespaceName) -> Self {
        self.namespace = Some(namespace);
        self
    }

    pub fn session(mut self, private_id: impl Into<String>) -> Self {
        self.kind = Some(EventKind::Session);
        self.session_private_id = Some(private_id.into());
        self
    }

    pub fn matches(&self, record: &EventRecord) -> bool {
        if self.kind.is_some_and(|kind| record.kind() != kind) {
            return false;
        }
        if self
            .namespace
            .as_ref()
            .is_some_and(|ns| record.namespace != *ns)
        {
            return false;
        }
        match &self.session_private_id {
            Some(private_id) => matches!(
                &record.payload,
                EventPayload::Session(session) if session.private_id == *private_id
            ),
            None => true,
        }
    }
}

/// Subscription handle for a log change feed.
///
/// The feed ends (`None`) when the store closes the subscription; dropping
/// the handle releases it.
#[derive(Debug)]
pub struct ChangeFeed {
    rx: mpsc::UnboundedReceiver<Result<ChangeEvent, FeedError>>,
}

impl ChangeFeed {
    pub fn new(rx: mpsc::UnboundedReceiver<Result<ChangeEvent, FeedError>>) -> Self {
        Self { rx }
    }
}

impl Stream for ChangeFeed {
    type Item = Result<ChangeEvent, FeedError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Append-only shared log with a subscribable change feed.
///
/// Storage, durability, and retention belong to the implementation.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Appends a record and returns its position.
    async fn append(&self, record: &EventRecord) -> Result<LogPosition, LogError>;

    /// Opens a change feed, replaying matching changes after `resume_after`
    /// when given, otherwise starting from now.
    ///
    /// An unreachable resume position is reported as a
    /// [`FeedError::NonResumable`] item, after which the feed ends.
    async fn open_change_feed(
        &self,
        filter: FeedFilter,
        resume_after: Option<LogPosition>,
    ) -> Result<ChangeFeed, LogError>;

    /// Atomically removes and returns the first record matching `query`.
    async fn find_one_and_delete(
        &self,
        query: &LogQuery,
    ) -> Result<Option<(LogPosition, EventRecord)>, LogError>;

    /// Returns the record stored at exactly `position` if it matches `query`.
    async fn find_at(
        &self,
        position: LogPosition,
        query: &LogQuery,
    ) -> Result<Option<EventRecord>, LogError>;

    /// Returns every record after `after` matching `query`, in log order.
    async fn find_after(
        &self,
        after: LogPosition,
        query: &LogQuery,
    ) -> Result<Vec<(LogPosition, EventRecord)>, LogError>;

    /// Best-effort store health counters.
    fn health_snapshot(&self) -> LogHealthSnapshot {
        LogHealthSnapshot::default()
    }
}
