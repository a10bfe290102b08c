//! Request variants.
//!
//! The lifecycle is shared by every request; what differs between variants is
//! how parameters and responses are shaped and whether a response can arrive in
//! several parts. Those points are the [`RequestKind`] trait.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{CourierError, Result};
use crate::source::FetchParams;

/// Behavior that varies between request variants.
///
/// Every method except [`name`](RequestKind::name) and
/// [`fork`](RequestKind::fork) has a default matching a plain single-part fetch.
pub trait RequestKind: Send + Sync + std::fmt::Debug {
    /// Short name used in logs, metrics and errors.
    fn name(&self) -> &'static str;

    /// Adjust the parameters flattened from the source.
    fn fetch_params(&self, params: FetchParams) -> FetchParams {
        params
    }

    /// Reshape a raw payload before it is delivered. Must be pure.
    fn transform_response(&self, response: serde_json::Value) -> serde_json::Value {
        response
    }

    /// Whether the response received so far is partial.
    fn is_incomplete(&self) -> bool {
        false
    }

    /// Move on to the next part of a multi-part response.
    ///
    /// Custom variants report their own failures as [`CourierError::Other`].
    fn continue_fetch(&self) -> Result<()> {
        Err(CourierError::UnsupportedContinuation { kind: self.name() })
    }

    /// A fresh instance of the same variant, used by retry clones.
    fn fork(&self) -> Arc<dyn RequestKind>;
}

/// Plain search request.
#[derive(Debug, Default)]
pub struct SearchKind;

impl RequestKind for SearchKind {
    fn name(&self) -> &'static str {
        "search"
    }

    fn fork(&self) -> Arc<dyn RequestKind> {
        Arc::new(SearchKind)
    }
}

/// Single document lookup. Delivers the stored document rather than the
/// lookup envelope when one is present.
#[derive(Debug, Default)]
pub struct DocKind;

impl RequestKind for DocKind {
    fn name(&self) -> &'static str {
        "doc"
    }

    fn transform_response(&self, response: serde_json::Value) -> serde_json::Value {
        match response.get("_source") {
            Some(doc) => doc.clone(),
            None => response,
        }
    }

    fn fork(&self) -> Arc<dyn RequestKind> {
        Arc::new(DocKind)
    }
}

/// Search spread over index segments, fetched one segment at a time.
#[derive(Debug)]
pub struct SegmentedKind {
    segments: Vec<String>,
    cursor: AtomicUsize,
}

impl SegmentedKind {
    pub fn new(segments: Vec<String>) -> Self {
        Self {
            segments,
            cursor: AtomicUsize::new(0),
        }
    }

    /// The segment the next fetch targets.
    pub fn current_segment(&self) -> Option<&str> {
        self.segments
            .get(self.cursor.load(Ordering::SeqCst))
            .map(String::as_str)
    }
}

impl RequestKind for SegmentedKind {
    fn name(&self) -> &'static str {
        "segmented"
    }

    fn fetch_params(&self, mut params: FetchParams) -> FetchParams {
        if let Some(segment) = self.current_segment() {
            params.index = Some(segment.to_string());
        }
        params
    }

    fn is_incomplete(&self) -> bool {
        self.cursor.load(Ordering::SeqCst) + 1 < self.segments.len()
    }

    fn continue_fetch(&self) -> Result<()> {
        let advanced = self
            .cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cursor| {
                (cursor + 1 < self.segments.len()).then_some(cursor + 1)
            });
        match advanced {
            Ok(_) => Ok(()),
            Err(_) => Err(CourierError::ContinuationExhausted { kind: self.name() }),
        }
    }

    fn fork(&self) -> Arc<dyn RequestKind> {
        Arc::new(SegmentedKind::new(self.segments.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_search_rejects_continuation() {
        let kind = SearchKind;
        assert!(!kind.is_incomplete());
        assert!(matches!(
            kind.continue_fetch(),
            Err(CourierError::UnsupportedContinuation { kind: "search" })
        ));
    }

    #[test]
    fn test_doc_unwraps_source() {
        let kind = DocKind;
        let response = json!({"_id": "1", "found": true, "_source": {"title": "x"}});
        assert_eq!(kind.transform_response(response), json!({"title": "x"}));

        let missing = json!({"_id": "2", "found": false});
        assert_eq!(kind.transform_response(missing.clone()), missing);
    }

    #[test]
    fn test_segmented_walks_segments() {
        let kind = SegmentedKind::new(vec!["logs-1".into(), "logs-2".into(), "logs-3".into()]);
        let base = FetchParams {
            index: Some("logs-*".into()),
            body: json!({}),
        };

        assert_eq!(kind.fetch_params(base.clone()).index.as_deref(), Some("logs-1"));
        assert!(kind.is_incomplete());

        kind.continue_fetch().unwrap();
        kind.continue_fetch().unwrap();
        assert_eq!(kind.fetch_params(base).index.as_deref(), Some("logs-3"));
        assert!(!kind.is_incomplete());

        assert!(matches!(
            kind.continue_fetch(),
            Err(CourierError::ContinuationExhausted { kind: "segmented" })
        ));
    }

    #[test]
    fn test_segmented_fork_restarts() {
        let kind = SegmentedKind::new(vec!["a".into(), "b".into()]);
        kind.continue_fetch().unwrap();
        assert_eq!(kind.current_segment(), Some("b"));

        let forked = kind.fork();
        assert_eq!(forked.name(), "segmented");
        assert!(forked.is_incomplete());
    }
}
