//! The queue of live requests.
//!
//! A request is a member from the moment it is created until it reaches a
//! terminal state. Requests push themselves on creation and remove themselves
//! on `abort()`/`complete()`; nothing else mutates the queue.

use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

use crate::request::Request;
use crate::source::SourceId;

static GLOBAL: LazyLock<RequestQueue> = LazyLock::new(RequestQueue::new);

/// Ordered collection of live requests, in insertion order.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone, Default)]
pub struct RequestQueue {
    inner: Arc<Mutex<Vec<Request>>>,
}

impl RequestQueue {
    /// Create an isolated queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide queue.
    pub fn global() -> RequestQueue {
        GLOBAL.clone()
    }

    pub(crate) fn push(&self, request: Request) {
        self.inner.lock().push(request);
    }

    /// Remove the first entry matching `request`. No-op if absent.
    pub(crate) fn remove(&self, request: &Request) -> bool {
        let mut requests = self.inner.lock();
        match requests.iter().position(|r| r == request) {
            Some(pos) => {
                requests.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Remove `old` and append `new` under a single lock, so observers never
    /// see both or neither.
    pub(crate) fn replace(&self, old: &Request, new: Request) {
        let mut requests = self.inner.lock();
        if let Some(pos) = requests.iter().position(|r| r == old) {
            requests.remove(pos);
        }
        requests.push(new);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn contains(&self, request: &Request) -> bool {
        self.inner.lock().iter().any(|r| r == request)
    }

    /// All live requests, in insertion order.
    pub fn snapshot(&self) -> Vec<Request> {
        self.inner.lock().clone()
    }

    /// Live requests that have not started yet, in insertion order.
    pub fn pending(&self) -> Vec<Request> {
        self.snapshot()
            .into_iter()
            .filter(|r| !r.started())
            .collect()
    }

    /// Live requests bound to `source`, in insertion order.
    pub fn for_source(&self, source: SourceId) -> Vec<Request> {
        self.snapshot()
            .into_iter()
            .filter(|r| r.source().id() == source)
            .collect()
    }
}
