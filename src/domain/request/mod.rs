//! Request aggregate - lifecycle state and transitions.
//!
//! This module contains the core domain logic for requests:
//! - The request handle and its lifecycle state
//! - Request variants (search, doc, segmented)
//! - State transition methods

pub mod kind;
pub mod state;
pub mod transitions;

// Re-export commonly used types
pub use kind::{DocKind, RequestKind, SearchKind, SegmentedKind};
pub use state::*;
pub use transitions::AbortSubscription;
