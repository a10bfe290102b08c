//! Sources: the entities on whose behalf requests fetch data.
//!
//! A request never owns its source. It only touches the source through the
//! [`Source`] trait: the busy counter is bumped on `start()` and dropped on every
//! terminal transition, and started requests are recorded in the source's
//! [`RequestHistory`] when the source keeps one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::request::{Request, RequestId, WeakRequest};

/// Number of started requests a source history remembers.
pub const HISTORY_LIMIT: usize = 20;

/// Unique identifier for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub Uuid);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for SourceId {
    fn from(uuid: Uuid) -> Self {
        SourceId(uuid)
    }
}

impl std::ops::Deref for SourceId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Flattened parameters handed to a transport.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FetchParams {
    /// Index (or index pattern) to fetch from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Request body
    pub body: serde_json::Value,
}

/// The capability set a request needs from its source.
///
/// Implementations must use interior mutability: requests share their source
/// behind an `Arc` and call these hooks from whichever task drives them.
pub trait Source: Send + Sync + std::fmt::Debug {
    /// Stable identifier, used for logs and for selecting queued requests.
    fn id(&self) -> SourceId;

    /// Add one running request to the busy counter.
    fn increment_busy(&self);

    /// Remove one running request from the busy counter.
    fn decrement_busy(&self);

    /// Current number of running requests.
    fn busy_count(&self) -> i64;

    /// History of started requests, if this source keeps one.
    fn history(&self) -> Option<&RequestHistory> {
        None
    }

    /// Returns true when requests for this source must not start.
    fn fetch_disabled(&self) -> bool {
        false
    }

    /// Flatten the source state into fetch parameters.
    fn flatten(&self) -> Result<FetchParams>;
}

/// Bounded, newest-first list of requests started for a source.
///
/// Entries hold weak references: the history never keeps a request (and through
/// it, the source) alive.
#[derive(Debug)]
pub struct RequestHistory {
    limit: usize,
    entries: Mutex<VecDeque<(RequestId, WeakRequest)>>,
}

impl RequestHistory {
    pub fn new() -> Self {
        Self::with_limit(HISTORY_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            entries: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    /// Prepend `request` and drop the oldest entries beyond the limit.
    pub fn record(&self, request: &Request) {
        let mut entries = self.entries.lock();
        entries.push_front((request.id(), request.downgrade()));
        entries.truncate(self.limit);
    }

    /// Ids of the recorded requests, newest first.
    pub fn ids(&self) -> Vec<RequestId> {
        self.entries.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Recorded requests that are still alive, newest first.
    pub fn requests(&self) -> Vec<Request> {
        self.entries
            .lock()
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for RequestHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// A search source: an index and a query body.
///
/// This is the bundled [`Source`] implementation. Fetching can be toggled at
/// runtime, and history tracking is opt-in.
#[derive(Debug)]
pub struct SearchSource {
    id: SourceId,
    busy: AtomicI64,
    fetch_disabled: AtomicBool,
    history: Option<RequestHistory>,
    params: Mutex<FetchParams>,
}

impl SearchSource {
    pub fn new(index: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: SourceId::from(Uuid::new_v4()),
            busy: AtomicI64::new(0),
            fetch_disabled: AtomicBool::new(false),
            history: None,
            params: Mutex::new(FetchParams {
                index: Some(index.into()),
                body,
            }),
        }
    }

    /// Build a source from a query body given as JSON text.
    pub fn from_query(index: impl Into<String>, query: &str) -> Result<Self> {
        let body = serde_json::from_str(query)?;
        Ok(Self::new(index, body))
    }

    /// Keep a history of the last [`HISTORY_LIMIT`] started requests.
    pub fn with_history(mut self) -> Self {
        self.history = Some(RequestHistory::new());
        self
    }

    pub fn set_fetch_disabled(&self, disabled: bool) {
        self.fetch_disabled.store(disabled, Ordering::SeqCst);
    }

    /// Replace the query body sent by future requests.
    pub fn set_body(&self, body: serde_json::Value) {
        self.params.lock().body = body;
    }
}

impl Source for SearchSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn increment_busy(&self) {
        self.busy.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_busy(&self) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }

    fn busy_count(&self) -> i64 {
        self.busy.load(Ordering::SeqCst)
    }

    fn history(&self) -> Option<&RequestHistory> {
        self.history.as_ref()
    }

    fn fetch_disabled(&self) -> bool {
        self.fetch_disabled.load(Ordering::SeqCst)
    }

    fn flatten(&self) -> Result<FetchParams> {
        Ok(self.params.lock().clone())
    }
}
