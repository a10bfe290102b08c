//! Dispatch loop driving requests through a transport.
//!
//! Requests within a round are fetched concurrently on the current task and
//! settle in whatever order their fetches complete. Failed requests are
//! replaced by their retry clones, which run in the next round once the
//! failure handler agrees.
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::error::{CourierError, FetchError, Result};
use crate::fetch::Transport;
use crate::handler::{Disposition, FailureHandler, RetryConfig};
use crate::queue::RequestQueue;
use crate::request::Request;
use crate::source::SourceId;

/// Configuration for the dispatcher.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Timeout for each individual fetch in milliseconds
    pub timeout_ms: u64,

    /// Maximum number of retry clones issued for one original request
    pub max_retries: u32,

    /// Base backoff duration in milliseconds (will be exponentially increased)
    pub backoff_ms: u64,

    /// Factor by which the backoff_ms is increased with each retry
    pub backoff_factor: u64,

    /// Maximum backoff time in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 3,
            backoff_ms: 250,
            backoff_factor: 2,
            max_backoff_ms: 10_000,
        }
    }
}

impl From<&DispatchConfig> for RetryConfig {
    fn from(config: &DispatchConfig) -> Self {
        RetryConfig {
            max_retries: config.max_retries,
            backoff_ms: config.backoff_ms,
            backoff_factor: config.backoff_factor,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

/// How a single request ended within a round.
#[derive(Debug)]
enum Outcome {
    Completed,
    Retry(Request),
    Failed,
    Aborted,
    Skipped,
}

/// Totals for one call to [`Dispatcher::fetch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub completed: usize,
    pub failed: usize,
    pub aborted: usize,
    pub skipped: usize,
    pub retried: usize,
}

/// Drives requests from pending to a terminal state.
pub struct Dispatcher<T, H> {
    queue: RequestQueue,
    transport: Arc<T>,
    handler: H,
    config: DispatchConfig,
}

impl<T, H> Dispatcher<T, H>
where
    T: Transport,
    H: FailureHandler<Output = Disposition>,
{
    pub fn new(queue: RequestQueue, transport: Arc<T>, handler: H, config: DispatchConfig) -> Self {
        Self {
            queue,
            transport,
            handler,
            config,
        }
    }

    /// Fetch every request in the queue that has not started yet.
    pub async fn fetch_pending(&self) -> Result<DispatchSummary> {
        self.fetch(self.queue.pending()).await
    }

    /// Fetch the not yet started requests of one source.
    pub async fn fetch_pending_for(&self, source: SourceId) -> Result<DispatchSummary> {
        let requests = self
            .queue
            .for_source(source)
            .into_iter()
            .filter(|r| !r.started())
            .collect();
        self.fetch(requests).await
    }

    /// Abort every live request of `source`, in queue order.
    ///
    /// Returns how many requests were aborted.
    pub fn abort_all_for(&self, source: SourceId) -> usize {
        let mut aborted = 0;
        for request in self.queue.for_source(source) {
            match request.abort() {
                Ok(()) => aborted += 1,
                // stopped concurrently, nothing left to do
                Err(CourierError::AlreadyStopped(_)) => {}
                Err(e) => tracing::error!(request_id = %request.id(), error = %e, "Failed to abort request"),
            }
        }
        tracing::info!(source_id = %source, aborted, "Aborted requests for source");
        aborted
    }

    /// Fetch `requests` until each one, or its last retry clone, is terminal.
    ///
    /// A request that errors after starting is aborted. The remaining requests
    /// still run to the end and the first error is returned afterwards.
    #[tracing::instrument(skip_all, fields(count = requests.len()))]
    pub async fn fetch(&self, requests: Vec<Request>) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary::default();
        let mut first_error = None;
        let mut round = requests;

        while !round.is_empty() {
            let outcomes = join_all(round.iter().map(|request| self.fetch_one(request))).await;

            let mut next_round = Vec::new();
            for outcome in outcomes {
                match outcome {
                    Ok(Outcome::Completed) => summary.completed += 1,
                    Ok(Outcome::Failed) => summary.failed += 1,
                    Ok(Outcome::Aborted) => summary.aborted += 1,
                    Ok(Outcome::Skipped) => summary.skipped += 1,
                    Ok(Outcome::Retry(next)) => {
                        summary.retried += 1;
                        next_round.push(next);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Request dispatch failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
            round = next_round;
        }

        tracing::debug!(?summary, "Dispatch finished");
        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    async fn fetch_one(&self, request: &Request) -> Result<Outcome> {
        if request.attempt() > 0 {
            let delay = RetryConfig::from(&self.config).backoff_for(request.attempt());
            tokio::time::sleep(delay).await;
        }

        if !request.can_start() {
            tracing::debug!(request_id = %request.id(), "Request cannot start, skipping");
            return Ok(Outcome::Skipped);
        }
        request.start()?;

        let outcome = self.run_started(request).await;
        match &outcome {
            Err(e) if !request.stopped() => {
                tracing::warn!(request_id = %request.id(), error = %e, "Aborting request after dispatch error");
                if let Err(abort_err) = request.abort() {
                    tracing::debug!(request_id = %request.id(), error = %abort_err, "Request stopped concurrently");
                }
            }
            _ => {}
        }
        outcome
    }

    async fn run_started(&self, request: &Request) -> Result<Outcome> {
        let cancelled = CancellationToken::new();
        let subscription = {
            let cancelled = cancelled.clone();
            request.when_aborted(move || cancelled.cancel())
        };

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut parts = Vec::new();
        loop {
            let params = request.fetch_params()?;
            let result = tokio::select! {
                _ = cancelled.cancelled() => {
                    tracing::info!(request_id = %request.id(), "Request aborted while in flight");
                    return Ok(Outcome::Aborted);
                }
                result = tokio::time::timeout(timeout, self.transport.execute(&params)) => {
                    result.unwrap_or(Err(FetchError::Timeout { timeout_ms: self.config.timeout_ms }))
                }
            };

            match result {
                Ok(payload) => {
                    parts.push(request.transform_response(payload));
                    if request.is_incomplete() {
                        request.continue_fetch()?;
                        continue;
                    }
                    break;
                }
                Err(error) => {
                    subscription.unsubscribe();
                    if request.stopped() {
                        return Ok(Outcome::Aborted);
                    }
                    return match request.handle_failure(error, &self.handler)? {
                        Disposition::Retry(next) => Ok(Outcome::Retry(next)),
                        Disposition::GiveUp => {
                            if let Some(next) = request.successor() {
                                next.abort()?;
                            }
                            Ok(Outcome::Failed)
                        }
                    };
                }
            }
        }

        subscription.unsubscribe();
        if request.stopped() {
            return Ok(Outcome::Aborted);
        }
        let payload = match parts.len() {
            1 => parts.remove(0),
            _ => serde_json::Value::Array(parts),
        };
        request.handle_response(payload);
        request.complete()?;
        tracing::info!(request_id = %request.id(), "Request completed successfully");
        Ok(Outcome::Completed)
    }
}
