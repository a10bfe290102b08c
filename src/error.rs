//! Error types for the request lifecycle.

use thiserror::Error;

use crate::request::RequestId;

/// Result type alias using the courier error type.
pub type Result<T> = std::result::Result<T, CourierError>;

/// Main error type for request lifecycle operations.
///
/// The first three variants are programming errors: they indicate a caller drove
/// a request through an invalid transition and are surfaced immediately.
/// Fetch-level failures are not represented here; they are [`FetchError`] values
/// that flow through [`Request::handle_failure`](crate::request::Request::handle_failure).
#[derive(Error, Debug)]
pub enum CourierError {
    /// `start()` was called on a request that has already started
    #[error("Unable to start request {0} because it has already started")]
    AlreadyStarted(RequestId),

    /// `abort()` or `complete()` was called on a request that has already stopped
    #[error("Unable to stop request {0} because it has already stopped")]
    AlreadyStopped(RequestId),

    /// `continue_fetch()` was called on a variant without multi-part responses
    #[error("Unable to continue {kind} request")]
    UnsupportedContinuation { kind: &'static str },

    /// `continue_fetch()` was called after every part was fetched
    #[error("Nothing left to continue for {kind} request")]
    ContinuationExhausted { kind: &'static str },

    /// The deferred handle was dropped without being resolved
    #[error("Request was aborted before producing a result")]
    Abandoned,

    /// The source failed to flatten its fetch parameters
    #[error("Source error: {0}")]
    Source(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Reason a fetch failed.
///
/// Produced by a [`Transport`](crate::fetch::Transport) and handed to
/// [`Request::handle_failure`](crate::request::Request::handle_failure).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// The remote answered with an error status. The payload is kept so the
    /// failed request can expose it as its response.
    #[error("Fetch returned error status {status}")]
    Status {
        status: u16,
        response: serde_json::Value,
    },

    /// Network error or other transport-level failure.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The fetch did not settle within the configured timeout.
    #[error("Fetch timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl FetchError {
    /// The response payload embedded in this error, if any.
    pub fn response(&self) -> Option<&serde_json::Value> {
        match self {
            FetchError::Status { response, .. } => Some(response),
            FetchError::Transport { .. } | FetchError::Timeout { .. } => None,
        }
    }

    /// Returns true if a retry of the request might succeed.
    ///
    /// Server errors, rate limits and request timeouts are retriable; other
    /// client errors indicate a problem with the request itself.
    pub fn is_retriable(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            FetchError::Transport { .. } => true,
            FetchError::Timeout { .. } => true,
        }
    }

    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FetchError::Status { .. } => "status",
            FetchError::Transport { .. } => "transport",
            FetchError::Timeout { .. } => "timeout",
        }
    }
}
