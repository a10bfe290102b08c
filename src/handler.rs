//! Failure handling policy.
//!
//! [`Request::handle_failure`](crate::request::Request::handle_failure) always
//! retries and aborts the failed request first; what happens to the retry
//! clone is up to a [`FailureHandler`]. Any `Fn(&Request, &FetchError) -> T`
//! closure is a handler, and [`RetryHandler`] is the bundled policy.

use std::time::Duration;

use metrics::counter;

use crate::error::FetchError;
use crate::request::Request;

/// Decides what to do after a request failed.
pub trait FailureHandler {
    type Output;

    /// Called once per failure, after `request` has been aborted and replaced
    /// by its [`successor`](Request::successor).
    fn handle(&self, request: &Request, error: &FetchError) -> Self::Output;
}

impl<F, T> FailureHandler for F
where
    F: Fn(&Request, &FetchError) -> T,
{
    type Output = T;

    fn handle(&self, request: &Request, error: &FetchError) -> T {
        self(request, error)
    }
}

/// Outcome chosen by [`RetryHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Issue this retry clone.
    Retry(Request),
    /// Stop retrying. The retry clone should be aborted.
    GiveUp,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 250,
            backoff_factor: 2,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryConfig {
    /// Delay before issuing retry number `retry_attempt` (1-based).
    ///
    /// `backoff_ms * backoff_factor ^ (retry_attempt - 1)`, capped at `max_backoff_ms`.
    pub fn backoff_for(&self, retry_attempt: u32) -> Duration {
        let exponent = retry_attempt.saturating_sub(1);
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(exponent));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }
}

/// Retries retriable failures until `max_retries` clones have been issued.
#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl FailureHandler for RetryHandler {
    type Output = Disposition;

    fn handle(&self, request: &Request, error: &FetchError) -> Disposition {
        let Some(successor) = request.successor() else {
            tracing::warn!(request_id = %request.id(), "Failed request has no retry clone");
            return Disposition::GiveUp;
        };

        if !error.is_retriable() {
            counter!("courier_retry_denied_total", "reason" => "not_retriable").increment(1);
            tracing::warn!(
                request_id = %request.id(),
                error = %error,
                "Request failed with non-retriable error, not retrying"
            );
            return Disposition::GiveUp;
        }

        if request.attempt() >= self.config.max_retries {
            counter!("courier_retry_denied_total", "reason" => "max_retries").increment(1);
            tracing::warn!(
                request_id = %request.id(),
                attempt = request.attempt(),
                max_retries = self.config.max_retries,
                "No retries remaining (reached max_retries)"
            );
            return Disposition::GiveUp;
        }

        tracing::info!(
            request_id = %request.id(),
            retry_id = %successor.id(),
            retry_attempt = successor.attempt(),
            "Retrying failed request"
        );
        Disposition::Retry(successor)
    }
}
