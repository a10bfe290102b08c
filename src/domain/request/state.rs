//! Request handle and lifecycle state.
//!
//! A [`Request`] is a cheap, cloneable handle to one attempt at fetching data for
//! a source. All handles to the same attempt share its state; equality is
//! identity. Mutable state lives behind a single lock that is never held while
//! calling out to sources, the queue, abort callbacks or the deferred result.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deferred::Deferred;
use crate::queue::RequestQueue;
use crate::source::Source;

use super::kind::RequestKind;

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Coarse lifecycle state of a request.
///
/// ```text
/// Pending ──start()──> Running ──complete()──> Completed
///    │                    │
///    └──abort()/retry()───┴──abort()/retry()──> Aborted
/// ```
///
/// `Completed` and `Aborted` are terminal and mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Pending,
    Running,
    Completed,
    Aborted,
}

impl Lifecycle {
    /// Check if this is a terminal state (Completed or Aborted).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Lifecycle::Completed | Lifecycle::Aborted)
    }
}

pub(crate) type AbortCallback = Box<dyn FnOnce() + Send>;

/// Mutable per-request state. Every flag is monotonic.
pub(crate) struct RequestState {
    pub(crate) started: bool,
    pub(crate) stopped: bool,
    pub(crate) aborted: bool,
    pub(crate) completed: bool,
    pub(crate) success: bool,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) started_instant: Option<Instant>,
    pub(crate) elapsed: Option<Duration>,
    pub(crate) response: Option<serde_json::Value>,
    pub(crate) deferred: Option<Deferred>,
    pub(crate) abort_callbacks: Vec<(u64, AbortCallback)>,
    pub(crate) next_subscription: u64,
    pub(crate) successor: Option<Request>,
}

impl RequestState {
    pub(crate) fn new(deferred: Option<Deferred>) -> Self {
        Self {
            started: false,
            stopped: false,
            aborted: false,
            completed: false,
            success: false,
            started_at: None,
            started_instant: None,
            elapsed: None,
            response: None,
            deferred,
            abort_callbacks: Vec::new(),
            next_subscription: 0,
            successor: None,
        }
    }
}

pub(crate) struct RequestInner {
    pub(crate) id: RequestId,
    pub(crate) attempt: u32,
    pub(crate) kind: Arc<dyn RequestKind>,
    pub(crate) source: Arc<dyn Source>,
    pub(crate) queue: RequestQueue,
    pub(crate) state: Mutex<RequestState>,
}

/// A request to fetch data for a source.
///
/// There is no way to build a bare `Request`: every request is created as a
/// concrete variant ([`Request::search`], [`Request::doc`],
/// [`Request::segmented`] or [`Request::of_kind`]) and joins its queue on
/// creation. See [`transitions`](super::transitions) for the state machine.
#[derive(Clone)]
pub struct Request {
    pub(crate) inner: Arc<RequestInner>,
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Request {}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind.name())
            .field("attempt", &self.inner.attempt)
            .field("source", &self.inner.source.id())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

/// A non-owning reference to a request, as kept by source histories.
#[derive(Clone)]
pub struct WeakRequest(Weak<RequestInner>);

impl WeakRequest {
    pub fn upgrade(&self) -> Option<Request> {
        self.0.upgrade().map(|inner| Request { inner })
    }
}

impl std::fmt::Debug for WeakRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WeakRequest")
    }
}

impl Request {
    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    /// Name of the concrete variant (`"search"`, `"doc"`, ...).
    pub fn kind(&self) -> &'static str {
        self.inner.kind.name()
    }

    /// 0 for a fresh request, incremented by one for each retry clone.
    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    pub fn source(&self) -> &Arc<dyn Source> {
        &self.inner.source
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.inner.queue
    }

    pub fn started(&self) -> bool {
        self.inner.state.lock().started
    }

    pub fn stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }

    pub fn aborted(&self) -> bool {
        self.inner.state.lock().aborted
    }

    pub fn completed(&self) -> bool {
        self.inner.state.lock().completed
    }

    pub fn success(&self) -> bool {
        self.inner.state.lock().success
    }

    /// Last payload received, or the payload embedded in the last failure.
    pub fn response(&self) -> Option<serde_json::Value> {
        self.inner.state.lock().response.clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().started_at
    }

    /// Time between `start()` and `complete()`. Only set on completion.
    pub fn elapsed(&self) -> Option<Duration> {
        self.inner.state.lock().elapsed
    }

    /// Whether this request still owns the right to resolve the caller's result.
    pub fn has_deferred(&self) -> bool {
        self.inner.state.lock().deferred.is_some()
    }

    /// The retry clone that replaced this request, if it was retried.
    pub fn successor(&self) -> Option<Request> {
        self.inner.state.lock().successor.clone()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        let state = self.inner.state.lock();
        if state.aborted {
            Lifecycle::Aborted
        } else if state.completed {
            Lifecycle::Completed
        } else if state.started {
            Lifecycle::Running
        } else {
            Lifecycle::Pending
        }
    }

    pub fn downgrade(&self) -> WeakRequest {
        WeakRequest(Arc::downgrade(&self.inner))
    }
}
