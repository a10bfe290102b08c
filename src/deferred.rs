//! Single-resolution result handles.
//!
//! A [`Deferred`] is the right to resolve a caller's result. It is owned by
//! exactly one request at a time and moves to the retry clone when a request is
//! retried. The caller keeps the matching [`DeferredResult`].

use tokio::sync::oneshot;

use crate::error::{CourierError, Result};

/// The resolving side of a deferred result.
///
/// Not `Clone`: resolution rights can only be moved.
#[derive(Debug)]
pub struct Deferred {
    tx: oneshot::Sender<serde_json::Value>,
}

/// State of a [`DeferredResult`] observed without waiting.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Not resolved yet, and still owned by a live request
    Pending,
    /// Resolved with this payload
    Resolved(serde_json::Value),
    /// Dropped without being resolved
    Abandoned,
}

impl Deferred {
    /// Create a deferred handle and the result the caller waits on.
    pub fn channel() -> (Deferred, DeferredResult) {
        let (tx, rx) = oneshot::channel();
        (Deferred { tx }, DeferredResult { rx })
    }

    /// Resolve the caller's result, consuming the handle.
    ///
    /// Returns false when the caller no longer waits for the result.
    pub fn resolve(self, value: serde_json::Value) -> bool {
        self.tx.send(value).is_ok()
    }
}

/// The caller side of a deferred result.
#[derive(Debug)]
pub struct DeferredResult {
    rx: oneshot::Receiver<serde_json::Value>,
}

impl DeferredResult {
    /// Wait for the request (or its retry clones) to resolve the result.
    ///
    /// Fails with [`CourierError::Abandoned`] when the last owner was aborted.
    pub async fn wait(self) -> Result<serde_json::Value> {
        self.rx.await.map_err(|_| CourierError::Abandoned)
    }

    /// Inspect the result without waiting.
    ///
    /// A resolved value is handed out once; later calls report `Abandoned`.
    pub fn try_resolution(&mut self) -> Resolution {
        match self.rx.try_recv() {
            Ok(value) => Resolution::Resolved(value),
            Err(oneshot::error::TryRecvError::Empty) => Resolution::Pending,
            Err(oneshot::error::TryRecvError::Closed) => Resolution::Abandoned,
        }
    }
}
