//! State transitions for requests.
//!
//! ```text
//! Request (Pending) ──start()──> Running ──handle_response()──> Running ──complete()──> Completed
//!        │                          │
//!        │                          └──handle_failure()──> retry() ──> Aborted  (+ clone, Pending)
//!        └──abort()/retry()──> Aborted
//! ```
//!
//! # Stop transitions
//!
//! `abort()` and `complete()` share a prologue: the `stopped` flag is checked and
//! flipped under the request lock before anything else happens, so a second stop
//! always fails with [`CourierError::AlreadyStopped`]. The prologue then drops
//! the source busy counter by one (only for requests that started, pairing the
//! increment in `start()`) and removes the request from its queue.
//!
//! - `abort()` drops the deferred result (the request can never resolve it),
//!   marks the request aborted and runs abort callbacks in registration order.
//! - `complete()` records the elapsed time and resolves the deferred result with
//!   the stored response.
//!
//! # Retry
//!
//! `retry()` builds a clone bound to the same source, moves the deferred result
//! into it and aborts the original. The queue swap happens under one queue lock,
//! so the queue size is unchanged across a retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use uuid::Uuid;

use crate::deferred::Deferred;
use crate::error::{CourierError, FetchError, Result};
use crate::handler::FailureHandler;
use crate::queue::RequestQueue;
use crate::source::{FetchParams, Source};

use super::kind::{DocKind, RequestKind, SearchKind, SegmentedKind};
use super::state::{Request, RequestId, RequestInner, RequestState};

/// Handle returned by [`Request::when_aborted`].
///
/// Dropping the handle keeps the callback registered; call
/// [`unsubscribe`](AbortSubscription::unsubscribe) to withdraw it.
#[derive(Debug)]
pub struct AbortSubscription {
    request: super::state::WeakRequest,
    id: u64,
}

impl AbortSubscription {
    /// Withdraw the callback. Returns false if it already ran or was withdrawn.
    pub fn unsubscribe(self) -> bool {
        let Some(request) = self.request.upgrade() else {
            return false;
        };
        let mut state = request.inner.state.lock();
        let before = state.abort_callbacks.len();
        state.abort_callbacks.retain(|(id, _)| *id != self.id);
        state.abort_callbacks.len() != before
    }
}

impl Request {
    /// Create a plain search request and add it to `queue`.
    pub fn search(queue: &RequestQueue, source: Arc<dyn Source>, deferred: Deferred) -> Request {
        Self::of_kind(queue, source, Arc::new(SearchKind), deferred)
    }

    /// Create a single document request and add it to `queue`.
    pub fn doc(queue: &RequestQueue, source: Arc<dyn Source>, deferred: Deferred) -> Request {
        Self::of_kind(queue, source, Arc::new(DocKind), deferred)
    }

    /// Create a request fetching `segments` one at a time and add it to `queue`.
    pub fn segmented(
        queue: &RequestQueue,
        source: Arc<dyn Source>,
        deferred: Deferred,
        segments: Vec<String>,
    ) -> Request {
        Self::of_kind(queue, source, Arc::new(SegmentedKind::new(segments)), deferred)
    }

    /// Create a request of a custom variant and add it to `queue`.
    pub fn of_kind(
        queue: &RequestQueue,
        source: Arc<dyn Source>,
        kind: Arc<dyn RequestKind>,
        deferred: Deferred,
    ) -> Request {
        let request = Self::build(queue.clone(), source, kind, Some(deferred), 0);
        queue.push(request.clone());
        request
    }

    fn build(
        queue: RequestQueue,
        source: Arc<dyn Source>,
        kind: Arc<dyn RequestKind>,
        deferred: Option<Deferred>,
        attempt: u32,
    ) -> Request {
        let request = Request {
            inner: Arc::new(RequestInner {
                id: RequestId::from(Uuid::new_v4()),
                attempt,
                kind,
                source,
                queue,
                state: parking_lot::Mutex::new(RequestState::new(deferred)),
            }),
        };
        tracing::trace!(
            request_id = %request.id(),
            source_id = %request.source().id(),
            kind = request.kind(),
            attempt,
            "Request created"
        );
        request
    }

    /// Build a clone without enqueueing it. Takes the deferred result from
    /// `state`, which must be this request's locked state.
    fn spawn_clone(&self, state: &mut RequestState) -> Request {
        Self::build(
            self.inner.queue.clone(),
            self.inner.source.clone(),
            self.inner.kind.fork(),
            state.deferred.take(),
            self.inner.attempt + 1,
        )
    }

    /// Whether the request may start: not stopped, not aborted and the source
    /// has not disabled fetching. Advisory; `start()` does not check it.
    pub fn can_start(&self) -> bool {
        let (stopped, aborted) = {
            let state = self.inner.state.lock();
            (state.stopped, state.aborted)
        };
        !stopped && !aborted && !self.inner.source.fetch_disabled()
    }

    /// Mark the request as running.
    ///
    /// Increments the source busy counter and records the request in the
    /// source history, if the source keeps one.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.started {
                return Err(CourierError::AlreadyStarted(self.id()));
            }
            state.started = true;
            state.started_at = Some(chrono::Utc::now());
            state.started_instant = Some(Instant::now());
        }

        let source = &self.inner.source;
        source.increment_busy();
        if let Some(history) = source.history() {
            history.record(self);
        }

        counter!("courier_requests_started_total", "kind" => self.kind()).increment(1);
        gauge!("courier_source_busy", "source" => source.id().to_string())
            .set(source.busy_count() as f64);
        tracing::debug!(
            request_id = %self.id(),
            source_id = %source.id(),
            busy = source.busy_count(),
            "Request started"
        );
        Ok(())
    }

    /// Parameters for the fetch, flattened from the source and shaped by the variant.
    pub fn fetch_params(&self) -> Result<FetchParams> {
        let params = self.inner.source.flatten()?;
        Ok(self.inner.kind.fetch_params(params))
    }

    pub fn transform_response(&self, response: serde_json::Value) -> serde_json::Value {
        self.inner.kind.transform_response(response)
    }

    /// Record a successful payload. The request stays running until `complete()`.
    pub fn handle_response(&self, response: serde_json::Value) {
        let mut state = self.inner.state.lock();
        state.success = true;
        state.response = Some(response);
    }

    /// Record a failure, replace this request with a retry clone and let
    /// `handler` decide what happens next.
    ///
    /// The handler runs after the retry: this request is already aborted and
    /// its [`successor`](Request::successor) is pending in the queue.
    pub fn handle_failure<H>(&self, error: FetchError, handler: &H) -> Result<H::Output>
    where
        H: FailureHandler + ?Sized,
    {
        {
            let mut state = self.inner.state.lock();
            state.success = false;
            state.response = error.response().cloned();
        }

        counter!(
            "courier_fetch_failures_total",
            "kind" => self.kind(),
            "reason" => error.label()
        )
        .increment(1);
        tracing::info!(
            request_id = %self.id(),
            source_id = %self.source().id(),
            attempt = self.attempt(),
            error = %error,
            "Request failed, replacing with a retry clone"
        );

        self.retry()?;
        Ok(handler.handle(self, &error))
    }

    pub fn is_incomplete(&self) -> bool {
        self.inner.kind.is_incomplete()
    }

    /// Advance a multi-part request to its next part.
    pub fn continue_fetch(&self) -> Result<()> {
        self.inner.kind.continue_fetch()
    }

    /// Replace this request with a fresh clone and abort it.
    ///
    /// The clone inherits the source and the deferred result and takes this
    /// request's place in the queue. Fails without cloning if this request has
    /// already stopped.
    pub fn retry(&self) -> Result<Request> {
        let successor = self.stop_aborted(true)?;
        // stop_aborted(true) always yields a clone
        let successor = successor.ok_or(CourierError::AlreadyStopped(self.id()))?;

        counter!("courier_request_retries_total", "kind" => self.kind()).increment(1);
        tracing::debug!(
            request_id = %self.id(),
            retry_id = %successor.id(),
            attempt = successor.attempt(),
            "Request retried"
        );
        Ok(successor)
    }

    /// Stop the request without resolving its result.
    pub fn abort(&self) -> Result<()> {
        self.stop_aborted(false).map(|_| ())
    }

    fn stop_aborted(&self, retry: bool) -> Result<Option<Request>> {
        let (was_running, deferred, successor, callbacks) = {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return Err(CourierError::AlreadyStopped(self.id()));
            }
            state.stopped = true;
            let was_running = state.started;

            let successor = retry.then(|| self.spawn_clone(&mut state));
            state.successor = successor.clone();
            state.aborted = true;
            (
                was_running,
                state.deferred.take(),
                successor,
                std::mem::take(&mut state.abort_callbacks),
            )
        };

        if was_running {
            self.inner.source.decrement_busy();
        }
        match &successor {
            Some(next) => self.inner.queue.replace(self, next.clone()),
            None => {
                self.inner.queue.remove(self);
            }
        }
        drop(deferred);

        counter!("courier_requests_total", "kind" => self.kind(), "outcome" => "aborted")
            .increment(1);
        self.report_busy();
        tracing::debug!(
            request_id = %self.id(),
            callbacks = callbacks.len(),
            "Request aborted"
        );

        for (_, callback) in callbacks {
            callback();
        }
        Ok(successor)
    }

    /// Stop the request and resolve its result with the stored response.
    pub fn complete(&self) -> Result<()> {
        let (was_running, deferred, response, elapsed, callbacks) = {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return Err(CourierError::AlreadyStopped(self.id()));
            }
            state.stopped = true;
            let was_running = state.started;

            let elapsed = state
                .started_instant
                .map(|started| started.elapsed())
                .unwrap_or(Duration::ZERO);
            state.elapsed = Some(elapsed);
            state.completed = true;
            (
                was_running,
                state.deferred.take(),
                state.response.clone().unwrap_or(serde_json::Value::Null),
                elapsed,
                // never run after completion
                std::mem::take(&mut state.abort_callbacks),
            )
        };
        drop(callbacks);

        if was_running {
            self.inner.source.decrement_busy();
        }
        self.inner.queue.remove(self);

        match deferred {
            Some(deferred) => {
                if !deferred.resolve(response) {
                    tracing::trace!(request_id = %self.id(), "Caller stopped waiting for result");
                }
            }
            None => {
                tracing::warn!(
                    request_id = %self.id(),
                    "Request completed after handing its result to a clone"
                );
            }
        }

        counter!("courier_requests_total", "kind" => self.kind(), "outcome" => "completed")
            .increment(1);
        histogram!("courier_request_duration_seconds", "kind" => self.kind())
            .record(elapsed.as_secs_f64());
        self.report_busy();
        tracing::debug!(
            request_id = %self.id(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Request completed"
        );
        Ok(())
    }

    /// Run `callback` once if and when this request is aborted.
    ///
    /// Callbacks run synchronously inside `abort()`, in registration order, and
    /// never run for a request that completes. A callback registered after the
    /// request stopped never runs.
    pub fn when_aborted<F>(&self, callback: F) -> AbortSubscription
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        let id = state.next_subscription;
        state.next_subscription += 1;
        if state.stopped {
            tracing::debug!(
                request_id = %self.id(),
                "Abort callback registered on a stopped request, it will not run"
            );
        } else {
            state.abort_callbacks.push((id, Box::new(callback)));
        }
        AbortSubscription {
            request: self.downgrade(),
            id,
        }
    }

    /// Create a new request of the same variant, bound to the same source, and
    /// hand it the deferred result. The clone joins the queue as pending.
    pub fn clone_request(&self) -> Request {
        let clone = {
            let mut state = self.inner.state.lock();
            self.spawn_clone(&mut state)
        };
        self.inner.queue.push(clone.clone());
        clone
    }

    fn report_busy(&self) {
        let source = &self.inner.source;
        gauge!("courier_source_busy", "source" => source.id().to_string())
            .set(source.busy_count() as f64);
    }
}
