use courier::{
    CourierError, Deferred, DispatchConfig, Dispatcher, FetchError, FetchParams, Lifecycle,
    MockTransport, Request, RequestKind, RequestQueue, RetryConfig, RetryHandler, SearchSource,
    Source, SourceId,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// Source whose parameters can never be built.
#[derive(Debug)]
struct UnflattenableSource {
    id: SourceId,
    busy: AtomicI64,
}

impl UnflattenableSource {
    fn new() -> Self {
        Self {
            id: SourceId::from(Uuid::new_v4()),
            busy: AtomicI64::new(0),
        }
    }
}

impl Source for UnflattenableSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn increment_busy(&self) {
        self.busy.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_busy(&self) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }

    fn busy_count(&self) -> i64 {
        self.busy.load(Ordering::SeqCst)
    }

    fn flatten(&self) -> courier::Result<FetchParams> {
        Err(CourierError::Source("index pattern was deleted".into()))
    }
}

/// Multi-part variant whose cursor expires after the first part.
#[derive(Debug)]
struct ExpiringCursorKind;

impl RequestKind for ExpiringCursorKind {
    fn name(&self) -> &'static str {
        "expiring-cursor"
    }

    fn is_incomplete(&self) -> bool {
        true
    }

    fn continue_fetch(&self) -> courier::Result<()> {
        Err(anyhow::anyhow!("scroll cursor expired").into())
    }

    fn fork(&self) -> Arc<dyn RequestKind> {
        Arc::new(ExpiringCursorKind)
    }
}

fn config() -> DispatchConfig {
    DispatchConfig {
        timeout_ms: 1_000,
        max_retries: 2,
        backoff_ms: 1,
        backoff_factor: 2,
        max_backoff_ms: 5,
    }
}

fn dispatcher(
    queue: &RequestQueue,
    transport: &Arc<MockTransport>,
) -> Dispatcher<MockTransport, RetryHandler> {
    let config = config();
    let handler = RetryHandler::new(RetryConfig::from(&config));
    Dispatcher::new(queue.clone(), transport.clone(), handler, config)
}

#[test_log::test(tokio::test)]
async fn completes_pending_requests() {
    let queue = RequestQueue::new();
    let transport = Arc::new(MockTransport::new());
    transport.add_response("logs", Ok(json!({"hits": 1})));
    transport.add_response("logs", Ok(json!({"hits": 2})));

    let source = Arc::new(SearchSource::new("logs", json!({})).with_history());
    let (d1, r1) = Deferred::channel();
    let (d2, r2) = Deferred::channel();
    Request::search(&queue, source.clone(), d1);
    Request::search(&queue, source.clone(), d2);

    let summary = dispatcher(&queue, &transport).fetch_pending().await.unwrap();

    assert_eq!(summary.completed, 2);
    assert_eq!(r1.wait().await.unwrap(), json!({"hits": 1}));
    assert_eq!(r2.wait().await.unwrap(), json!({"hits": 2}));
    assert!(queue.is_empty());
    assert_eq!(source.busy_count(), 0);
    assert_eq!(source.history().unwrap().len(), 2);
}

#[test_log::test(tokio::test)]
async fn retries_transient_failures_with_clone() {
    let queue = RequestQueue::new();
    let transport = Arc::new(MockTransport::new());
    transport.add_response(
        "logs",
        Err(FetchError::Status {
            status: 503,
            response: json!({"error": "unavailable"}),
        }),
    );
    transport.add_response("logs", Ok(json!({"hits": 9})));

    let source = Arc::new(SearchSource::new("logs", json!({})));
    let (deferred, result) = Deferred::channel();
    let original = Request::search(&queue, source.clone(), deferred);

    let summary = dispatcher(&queue, &transport).fetch_pending().await.unwrap();

    assert_eq!(summary.retried, 1);
    assert_eq!(summary.completed, 1);
    assert!(original.aborted());
    assert_eq!(original.successor().unwrap().attempt(), 1);
    assert_eq!(result.wait().await.unwrap(), json!({"hits": 9}));
    assert_eq!(transport.call_count(), 2);
    assert!(queue.is_empty());
}

#[test_log::test(tokio::test)]
async fn gives_up_and_abandons_caller() {
    let queue = RequestQueue::new();
    let transport = Arc::new(MockTransport::new());
    transport.add_response(
        "logs",
        Err(FetchError::Status {
            status: 400,
            response: json!({"error": "bad query"}),
        }),
    );

    let source = Arc::new(SearchSource::new("logs", json!({})));
    let (deferred, result) = Deferred::channel();
    let original = Request::search(&queue, source.clone(), deferred);

    let summary = dispatcher(&queue, &transport).fetch_pending().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(original.response(), Some(json!({"error": "bad query"})));
    assert!(original.successor().unwrap().aborted());
    assert!(matches!(result.wait().await, Err(CourierError::Abandoned)));
    assert!(queue.is_empty());
    assert_eq!(source.busy_count(), 0);
}

#[test_log::test(tokio::test)]
async fn stops_after_max_retries() {
    let queue = RequestQueue::new();
    let transport = Arc::new(MockTransport::new());
    for _ in 0..5 {
        transport.add_response(
            "logs",
            Err(FetchError::Transport {
                message: "reset".into(),
            }),
        );
    }

    let source = Arc::new(SearchSource::new("logs", json!({})));
    let (deferred, result) = Deferred::channel();
    Request::search(&queue, source.clone(), deferred);

    let summary = dispatcher(&queue, &transport).fetch_pending().await.unwrap();

    assert_eq!(summary.retried, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(transport.call_count(), 3);
    assert!(result.wait().await.is_err());
    assert!(queue.is_empty());
}

#[test_log::test(tokio::test)]
async fn skips_sources_with_fetch_disabled() {
    let queue = RequestQueue::new();
    let transport = Arc::new(MockTransport::new());
    let source = Arc::new(SearchSource::new("logs", json!({})));
    source.set_fetch_disabled(true);

    let (deferred, _result) = Deferred::channel();
    let request = Request::search(&queue, source.clone(), deferred);

    let summary = dispatcher(&queue, &transport).fetch_pending().await.unwrap();

    assert_eq!(summary.skipped, 1);
    assert!(!request.started());
    assert!(queue.contains(&request));
    assert_eq!(transport.call_count(), 0);
}

#[test_log::test(tokio::test)]
async fn segmented_requests_collect_every_segment() {
    let queue = RequestQueue::new();
    let transport = Arc::new(MockTransport::new());
    transport.add_response("logs-1", Ok(json!({"segment": 1})));
    transport.add_response("logs-2", Ok(json!({"segment": 2})));

    let source = Arc::new(SearchSource::new("logs-*", json!({})));
    let (deferred, result) = Deferred::channel();
    Request::segmented(
        &queue,
        source.clone(),
        deferred,
        vec!["logs-1".into(), "logs-2".into()],
    );

    let summary = dispatcher(&queue, &transport).fetch_pending().await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(
        result.wait().await.unwrap(),
        json!([{"segment": 1}, {"segment": 2}])
    );
}

#[test_log::test(tokio::test)]
async fn external_abort_cancels_in_flight_fetch() {
    let queue = RequestQueue::new();
    let transport = Arc::new(MockTransport::new());
    let _trigger = transport.add_response_with_trigger("logs", Ok(json!({"late": true})));

    let source = Arc::new(SearchSource::new("logs", json!({})));
    let (deferred, result) = Deferred::channel();
    let request = Request::search(&queue, source.clone(), deferred);

    let dispatcher = dispatcher(&queue, &transport);
    let fetch = dispatcher.fetch(vec![request.clone()]);
    let abort = async {
        while transport.in_flight_count() == 0 {
            tokio::task::yield_now().await;
        }
        request.abort().unwrap();
    };

    let (summary, ()) = tokio::join!(fetch, abort);
    let summary = summary.unwrap();

    assert_eq!(summary.aborted, 1);
    assert_eq!(transport.in_flight_count(), 0);
    assert!(matches!(result.wait().await, Err(CourierError::Abandoned)));
    assert_eq!(source.busy_count(), 0);
}

#[test_log::test(tokio::test)]
async fn abort_all_for_source_leaves_other_sources() {
    let queue = RequestQueue::new();
    let transport = Arc::new(MockTransport::new());
    let logs = Arc::new(SearchSource::new("logs", json!({})));
    let metrics = Arc::new(SearchSource::new("metrics", json!({})));

    for _ in 0..3 {
        let (deferred, _result) = Deferred::channel();
        Request::search(&queue, logs.clone(), deferred);
    }
    let (deferred, _result) = Deferred::channel();
    let kept = Request::search(&queue, metrics.clone(), deferred);

    let dispatcher = dispatcher(&queue, &transport);
    assert_eq!(dispatcher.abort_all_for(logs.id()), 3);
    assert_eq!(queue.snapshot(), vec![kept]);

    transport.add_response("metrics", Ok(json!({})));
    let summary = dispatcher.fetch_pending_for(metrics.id()).await.unwrap();
    assert_eq!(summary.completed, 1);
    assert!(queue.is_empty());
}

#[test_log::test(tokio::test)]
async fn source_error_aborts_request_and_round_finishes() {
    let queue = RequestQueue::new();
    let transport = Arc::new(MockTransport::new());
    transport.add_response(
        "logs",
        Err(FetchError::Status {
            status: 503,
            response: json!({"error": "unavailable"}),
        }),
    );
    transport.add_response("logs", Ok(json!({"hits": 9})));

    let broken = Arc::new(UnflattenableSource::new());
    let (deferred, broken_result) = Deferred::channel();
    let broken_request = Request::search(&queue, broken.clone(), deferred);

    let logs = Arc::new(SearchSource::new("logs", json!({})));
    let (deferred, logs_result) = Deferred::channel();
    let logs_request = Request::search(&queue, logs.clone(), deferred);

    let err = dispatcher(&queue, &transport)
        .fetch_pending()
        .await
        .unwrap_err();
    assert!(matches!(err, CourierError::Source(_)));

    assert_eq!(broken_request.lifecycle(), Lifecycle::Aborted);
    assert!(!queue.contains(&broken_request));
    assert_eq!(broken.busy_count(), 0);
    assert!(matches!(broken_result.wait().await, Err(CourierError::Abandoned)));

    // the retry clone of the other request still ran to completion
    assert_eq!(logs_request.successor().unwrap().lifecycle(), Lifecycle::Completed);
    assert_eq!(logs_result.wait().await.unwrap(), json!({"hits": 9}));
    assert_eq!(logs.busy_count(), 0);
    assert!(queue.is_empty());
}

#[test_log::test(tokio::test)]
async fn continuation_error_aborts_request() {
    let queue = RequestQueue::new();
    let transport = Arc::new(MockTransport::new());
    transport.add_response("logs", Ok(json!({"page": 1})));

    let source = Arc::new(SearchSource::new("logs", json!({})));
    let (deferred, result) = Deferred::channel();
    let request = Request::of_kind(&queue, source.clone(), Arc::new(ExpiringCursorKind), deferred);

    let err = dispatcher(&queue, &transport)
        .fetch_pending()
        .await
        .unwrap_err();
    assert!(matches!(err, CourierError::Other(_)));
    assert_eq!(err.to_string(), "scroll cursor expired");

    assert!(request.aborted());
    assert_eq!(source.busy_count(), 0);
    assert!(queue.is_empty());
    assert!(matches!(result.wait().await, Err(CourierError::Abandoned)));
}
