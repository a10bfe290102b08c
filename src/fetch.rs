//! Transport abstraction for executing fetches.
//!
//! This module defines the `Transport` trait so the dispatch loop can be driven
//! without a network. The request lifecycle never calls a transport directly.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::FetchError;
use crate::source::FetchParams;

/// Result of a single fetch.
pub type FetchResult = std::result::Result<serde_json::Value, FetchError>;

/// Trait for executing fetches.
///
/// # Example
/// ```ignore
/// let payload = transport.execute(&request.fetch_params()?).await?;
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute a fetch with the given parameters.
    ///
    /// # Errors
    /// Returns a [`FetchError`] if the remote answered with an error status or
    /// the fetch failed at the transport level.
    async fn execute(&self, params: &FetchParams) -> FetchResult;
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Mock transport for testing.
///
/// Responses are configured per index and returned in FIFO order.
///
/// # Example
/// ```ignore
/// let mock = MockTransport::new();
/// mock.add_response("logs-*", Ok(json!({"hits": {"total": 1}})));
/// ```
#[derive(Clone, Default)]
pub struct MockTransport {
    responses: Arc<Mutex<HashMap<String, VecDeque<MockResponse>>>>,
    calls: Arc<Mutex<Vec<FetchParams>>>,
    in_flight: Arc<AtomicUsize>,
}

/// A mock response that can optionally wait for a trigger before completing.
enum MockResponse {
    /// Immediate response
    Immediate(FetchResult),
    /// Response that waits for a trigger signal before completing
    Triggered {
        response: FetchResult,
        trigger: oneshot::Receiver<()>,
    },
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a predetermined response for fetches against `index`.
    pub fn add_response(&self, index: &str, response: FetchResult) {
        self.responses
            .lock()
            .entry(index.to_string())
            .or_default()
            .push_back(MockResponse::Immediate(response));
    }

    /// Add a response that waits for a manual trigger before completing.
    ///
    /// Sending `()` or dropping the returned sender releases the response.
    pub fn add_response_with_trigger(&self, index: &str, response: FetchResult) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses
            .lock()
            .entry(index.to_string())
            .or_default()
            .push_back(MockResponse::Triggered {
                response,
                trigger: rx,
            });
        tx
    }

    /// Parameters of every fetch executed so far.
    pub fn calls(&self) -> Vec<FetchParams> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of fetches currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, params: &FetchParams) -> FetchResult {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
        };

        self.calls.lock().push(params.clone());

        let index = params.index.clone().unwrap_or_default();
        let mock_response = self
            .responses
            .lock()
            .get_mut(&index)
            .and_then(|queue| queue.pop_front());

        match mock_response {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Triggered { response, trigger }) => {
                // proceed whether triggered or dropped
                let _ = trigger.await;
                response
            }
            None => Err(FetchError::Transport {
                message: format!("No mock response configured for index '{}'", index),
            }),
        }
    }
}

/// Guard that decrements the in-flight counter when dropped, including when
/// the fetch future is cancelled.
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
