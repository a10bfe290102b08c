//! Core domain types for courier.
//!
//! This module contains the request aggregate: the request handle, its
//! lifecycle state machine and its variants. Queue and source types live at
//! the crate root because they are shared with callers that never touch
//! requests directly.

pub mod request;
