mod common;

use common::{config, harness, provider};
use http::{HeaderName, HeaderValue};
use serde_json::json;
use std::sync::Arc;
use traffic_control::telemetry::TrafficEvent;
use traffic_control::{
    BlockingTrafficClient, ClientError, MetricsReport, RequestOptions, TrafficClient,
    TrafficController,
};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn scope_counters(
    controller: &TrafficController,
    scope: &str,
) -> traffic_control::metrics::MetricsSnapshot {
    match controller.metrics(Some(scope)).unwrap() {
        MetricsReport::Scope(snapshot) => snapshot.counters,
        MetricsReport::Global(_) => panic!("expected scope metrics"),
    }
}

async fn mount(server: &MockServer, status: u16, times: Option<u64>) {
    let mock = Mock::given(method("GET")).and(path("/resource"));
    let mock = match times {
        Some(n) => mock.respond_with(ResponseTemplate::new(status)).up_to_n_times(n),
        None => mock.respond_with(ResponseTemplate::new(status)),
    };
    mock.mount(server).await;
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let server = MockServer::start().await;
    mount(&server, 503, Some(2)).await;
    mount(&server, 200, None).await;

    let mut cfg = config();
    cfg.providers.insert("flaky".into(), provider(10, 5, 3));
    let h = harness(cfg);
    let client = TrafficClient::new("flaky", h.controller.clone());

    let url = format!("{}/resource", server.uri());
    let response = client.get(&url, RequestOptions::new()).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    let counters = scope_counters(&h.controller, "outbound:flaky");
    assert_eq!(counters.total_requests, 1, "one permit per operation");
    assert_eq!(counters.total_retries, 2);
    assert_eq!(counters.total_2xx, 1);
    assert_eq!(counters.total_5xx, 0, "only the final outcome is recorded");

    let attempts: Vec<usize> = h
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            TrafficEvent::RetryScheduled { attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    mount(&server, 404, None).await;

    let mut cfg = config();
    cfg.providers.insert("flaky".into(), provider(10, 5, 3));
    let h = harness(cfg);
    let client = TrafficClient::new("flaky", h.controller.clone());

    let err = client
        .get(&format!("{}/resource", server.uri()), RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert!(!err.is_refusal());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    let counters = scope_counters(&h.controller, "flaky");
    assert_eq!(counters.total_retries, 0);
    assert_eq!(counters.total_4xx, 1);
}

#[tokio::test]
async fn exhausted_retries_surface_the_last_status() {
    let server = MockServer::start().await;
    mount(&server, 500, None).await;

    let mut cfg = config();
    cfg.providers.insert("flaky".into(), provider(10, 5, 3));
    let h = harness(cfg);
    let client = TrafficClient::new("flaky", h.controller.clone());

    let err = client
        .get(&format!("{}/resource", server.uri()), RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(500));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    let counters = scope_counters(&h.controller, "flaky");
    assert_eq!(counters.total_retries, 2);
    assert_eq!(counters.total_5xx, 1);
}

#[tokio::test]
async fn open_breaker_short_circuits_without_io() {
    let server = MockServer::start().await;
    mount(&server, 503, None).await;

    let mut cfg = config();
    cfg.providers.insert("flaky".into(), provider(10, 2, 1));
    let h = harness(cfg);
    let client = TrafficClient::new("flaky", h.controller.clone());
    let url = format!("{}/resource", server.uri());

    for _ in 0..2 {
        let err = client.get(&url, RequestOptions::new()).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
    }

    let err = client.get(&url, RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, ClientError::CircuitBreakerOpen { ref scope } if scope == "flaky"));
    assert!(err.is_refusal());
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    let counters = scope_counters(&h.controller, "flaky");
    assert_eq!(counters.total_circuit_open_rejections, 1);
}

#[tokio::test]
async fn rate_limit_is_checked_before_any_io() {
    let server = MockServer::start().await;
    mount(&server, 200, None).await;

    let mut cfg = config();
    cfg.providers.insert("tiny".into(), provider(1, 5, 3));
    let h = harness(cfg);
    let client = TrafficClient::new("tiny", h.controller.clone());
    let url = format!("{}/resource", server.uri());

    client.get(&url, RequestOptions::new()).await.unwrap();
    let err = client.get(&url, RequestOptions::new()).await.unwrap_err();
    match &err {
        ClientError::RateLimitExceeded { scope, wait } => {
            assert_eq!(scope, "tiny");
            assert_eq!(*wait, None, "a bucket that never refills has no wait");
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert!(err.to_string().contains("'tiny'"));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn transport_errors_are_retried_and_reported() {
    let mut cfg = config();
    cfg.providers.insert("offline".into(), provider(10, 5, 3));
    let h = harness(cfg);
    let client = TrafficClient::new("offline", h.controller.clone());

    let err = client.get("http://127.0.0.1:1/", RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(_)));
    assert_eq!(err.status(), None);

    let counters = scope_counters(&h.controller, "offline");
    assert_eq!(counters.total_retries, 2);
    assert_eq!(counters.total_2xx + counters.total_4xx + counters.total_5xx, 0);

    let breaker = match h.controller.metrics(Some("offline")).unwrap() {
        MetricsReport::Scope(snapshot) => snapshot.circuit_breaker.unwrap(),
        MetricsReport::Global(_) => unreachable!(),
    };
    assert_eq!(breaker.failure_count, 1, "transport failures count against the breaker");
}

#[tokio::test]
async fn malformed_urls_never_count_against_the_provider() {
    let mut cfg = config();
    cfg.global.degraded_mode_failure_threshold = 1;
    cfg.providers.insert("strict".into(), provider(10, 1, 3));
    let h = harness(cfg);
    let client = TrafficClient::new("strict", h.controller.clone());

    for _ in 0..2 {
        let err = client.get("not a url", RequestOptions::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(ref e) if e.is_builder()));
    }
    assert!(!h.controller.is_degraded());

    let MetricsReport::Scope(snapshot) = h.controller.metrics(Some("strict")).unwrap() else {
        panic!("expected scope metrics");
    };
    let breaker = snapshot.circuit_breaker.unwrap();
    assert_eq!(breaker.state, traffic_control::CircuitState::Closed);
    assert_eq!(breaker.failure_count, 0);
    assert_eq!(snapshot.counters.total_requests, 2);
    assert_eq!(snapshot.counters.total_retries, 0);
}

#[tokio::test]
async fn request_options_reach_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "secret"))
        .and(query_param("stream", "false"))
        .and(body_json(json!({ "prompt": "hello" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "msg_1" })))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(config());
    let client = TrafficClient::new("anthropic", h.controller.clone());
    let options = RequestOptions::new()
        .header(HeaderName::from_static("x-api-key"), HeaderValue::from_static("secret"))
        .query("stream", "false")
        .json(json!({ "prompt": "hello" }))
        .tokens(2);

    let response = client
        .post(&format!("{}/v1/messages", server.uri()), options)
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["id"], "msg_1");

    let MetricsReport::Scope(snapshot) = h.controller.metrics(Some("anthropic")).unwrap() else {
        panic!("expected scope metrics");
    };
    assert_eq!(snapshot.bucket.capacity, 50);
    assert!(snapshot.bucket.available_tokens <= 48.0);
}

#[tokio::test]
async fn degraded_mode_disables_retries_until_a_success() {
    let server = MockServer::start().await;
    mount(&server, 503, None).await;

    let mut cfg = config();
    cfg.global.degraded_mode_failure_threshold = 2;
    cfg.providers.insert("flaky".into(), provider(100, 50, 3));
    let h = harness(cfg);
    let client = TrafficClient::new("flaky", h.controller.clone());
    let url = format!("{}/resource", server.uri());

    for _ in 0..2 {
        client.get(&url, RequestOptions::new()).await.unwrap_err();
    }
    assert!(h.controller.is_degraded());
    assert_eq!(server.received_requests().await.unwrap().len(), 6);

    client.get(&url, RequestOptions::new()).await.unwrap_err();
    assert_eq!(server.received_requests().await.unwrap().len(), 7, "single attempt");

    server.reset().await;
    mount(&server, 200, None).await;
    client.get(&url, RequestOptions::new()).await.unwrap();
    assert!(!h.controller.is_degraded());

    let events = h.sink.events();
    assert!(events.iter().any(|e| matches!(e, TrafficEvent::DegradedModeEntered { .. })));
    assert!(events.iter().any(|e| matches!(e, TrafficEvent::DegradedModeExited)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_client_shares_the_same_policy() {
    let server = MockServer::start().await;
    mount(&server, 503, Some(1)).await;
    mount(&server, 200, None).await;

    let mut cfg = config();
    cfg.providers.insert("sync".into(), provider(1, 5, 3));
    let h = harness(cfg);
    let controller = Arc::clone(&h.controller);
    let url = format!("{}/resource", server.uri());

    let (first, second) = tokio::task::spawn_blocking(move || {
        let client = BlockingTrafficClient::new("sync", controller);
        let first = client.get(&url, RequestOptions::new()).map(|r| r.status().as_u16());
        let second = client.get(&url, RequestOptions::new()).map(|r| r.status().as_u16());
        (first, second)
    })
    .await
    .unwrap();

    assert_eq!(first.unwrap(), 200);
    assert!(matches!(second, Err(ClientError::RateLimitExceeded { .. })));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    let counters = scope_counters(&h.controller, "outbound:sync");
    assert_eq!(counters.total_retries, 1);
    assert_eq!(counters.total_rate_limited, 1);
}
