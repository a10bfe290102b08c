//! Request lifecycle tracking for data-fetch sources.
//!
//! Every fetch a [`Source`] issues is a [`Request`]: it joins a shared
//! [`RequestQueue`] when created, moves through `start()` and leaves the queue on
//! `complete()` or `abort()`. Failed requests are replaced by retry clones that
//! inherit the caller's [`DeferredResult`], so a caller waiting on a result
//! never has to track retries. The [`Dispatcher`] drives requests through a
//! [`Transport`] with timeouts, backoff and a pluggable failure policy.

pub mod deferred;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod handler;
pub mod queue;
pub mod request;
pub mod source;

// Re-export commonly used types
pub use deferred::{Deferred, DeferredResult, Resolution};
pub use dispatch::{DispatchConfig, DispatchSummary, Dispatcher};
pub use error::{CourierError, FetchError, Result};
pub use fetch::{FetchResult, MockTransport, Transport};
pub use handler::{Disposition, FailureHandler, RetryConfig, RetryHandler};
pub use queue::RequestQueue;
pub use request::*;
pub use source::{FetchParams, HISTORY_LIMIT, RequestHistory, SearchSource, Source, SourceId};
