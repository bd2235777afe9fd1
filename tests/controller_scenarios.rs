mod common;

use common::{config, harness, provider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use traffic_control::config::TrafficControlConfig;
use traffic_control::telemetry::TrafficEvent;
use traffic_control::{CircuitState, MetricsReport, Outcome, Rejection};

#[test]
fn half_open_admits_a_bounded_number_of_probes() {
    let mut cfg = config();
    cfg.providers.insert("vendor".into(), provider(100, 3, 3));
    let h = harness(cfg);
    let c = &h.controller;

    for _ in 0..3 {
        c.check_outbound("vendor", 1).unwrap();
        c.record_outbound_response("vendor", Outcome::Status(503));
    }
    assert_eq!(c.check_outbound("vendor", 1), Err(Rejection::CircuitOpen));

    h.clock.advance(Duration::from_secs(60));
    for _ in 0..3 {
        c.check_outbound("vendor", 1).unwrap();
    }
    assert_eq!(c.check_outbound("vendor", 1), Err(Rejection::CircuitOpen), "probe budget spent");

    c.record_outbound_response("vendor", Outcome::Status(200));
    c.record_outbound_response("vendor", Outcome::Status(204));
    for _ in 0..5 {
        c.check_outbound("vendor", 1).unwrap();
    }

    let states: Vec<CircuitState> = h
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            TrafficEvent::CircuitTransition { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![CircuitState::Open, CircuitState::Closed]);
}

#[test]
fn failed_probe_reopens_the_breaker() {
    let mut cfg = config();
    cfg.providers.insert("vendor".into(), provider(100, 1, 3));
    let h = harness(cfg);
    let c = &h.controller;

    c.check_outbound("vendor", 1).unwrap();
    c.record_outbound_response("vendor", Outcome::TransportError);
    assert_eq!(c.check_outbound("vendor", 1), Err(Rejection::CircuitOpen));

    h.clock.advance(Duration::from_secs(61));
    c.check_outbound("vendor", 1).unwrap();
    c.record_outbound_response("vendor", Outcome::Status(502));
    assert_eq!(c.check_outbound("vendor", 1), Err(Rejection::CircuitOpen));

    let MetricsReport::Scope(snapshot) = c.metrics(Some("outbound:vendor")).unwrap() else {
        panic!("expected scope metrics");
    };
    assert_eq!(snapshot.circuit_breaker.unwrap().state, CircuitState::Open);
    assert_eq!(snapshot.counters.total_circuit_open_rejections, 2);
}

#[test]
fn scopes_do_not_share_budgets_under_contention() {
    let mut cfg = config();
    for name in ["a", "b", "c", "d"] {
        cfg.providers.insert(name.into(), provider(10, 5, 3));
    }
    let h = harness(cfg);
    let granted = [(); 4].map(|_| AtomicUsize::new(0));

    std::thread::scope(|s| {
        for (i, name) in ["a", "b", "c", "d"].into_iter().enumerate() {
            for _ in 0..3 {
                let controller = &h.controller;
                let granted = &granted[i];
                s.spawn(move || {
                    for _ in 0..10 {
                        if controller.check_outbound(name, 1).is_ok() {
                            granted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        }
    });

    for count in &granted {
        assert_eq!(count.load(Ordering::Relaxed), 10);
    }
    let MetricsReport::Global(global) = h.controller.metrics(None).unwrap() else {
        panic!("expected global metrics");
    };
    assert_eq!(global.totals.total_requests, 40);
    assert_eq!(global.totals.total_rate_limited, 80);
    assert_eq!(global.outbound_scopes, vec!["a", "b", "c", "d"]);
}

#[test]
fn global_ceiling_spans_every_outbound_scope() {
    let mut cfg = config();
    cfg.global.max_requests_per_minute_global = Some(4);
    let h = harness(cfg);
    let c = &h.controller;

    for scope in ["openai", "github", "openai", "huggingface"] {
        c.check_outbound(scope, 1).unwrap();
    }
    let refused = c.check_outbound("anthropic", 1).unwrap_err();
    assert_eq!(refused, Rejection::GlobalLimit { wait: Some(Duration::from_secs(15)) });
    assert_eq!(refused.retry_after_secs(), 15);

    c.check_inbound("api", 1).unwrap();

    h.clock.advance(Duration::from_secs(16));
    c.check_outbound("anthropic", 1).unwrap();

    let MetricsReport::Global(global) = c.metrics(None).unwrap() else {
        panic!("expected global metrics");
    };
    assert_eq!(global.global_rate_limit_rejections, 1);
    assert_eq!(global.totals.total_requests, 6);
}

#[test]
fn environment_overrides_flow_into_new_scopes() {
    let cfg = TrafficControlConfig::from_env_vars([
        ("TRAFFIC_CONTROL_PROVIDER_STRIPE_CAPACITY", "2"),
        ("TRAFFIC_CONTROL_PROVIDER_STRIPE_REFILL_RATE", "0"),
        ("TRAFFIC_CONTROL_PROVIDER_STRIPE_FAILURE_THRESHOLD", "1"),
        ("TRAFFIC_CONTROL_MAX_REQUESTS_PER_MINUTE_GLOBAL", "none"),
        ("TRAFFIC_CONTROL_GROUP_UPLOADS_CAPACITY", "1"),
        ("UNRELATED", "ignored"),
    ])
    .unwrap();
    let h = harness(cfg);
    let c = &h.controller;

    c.check_outbound("stripe", 1).unwrap();
    c.check_outbound("stripe", 1).unwrap();
    assert_eq!(c.check_outbound("stripe", 1), Err(Rejection::RateLimited { wait: None }));

    c.check_inbound("uploads", 1).unwrap();
    assert!(c.check_inbound("uploads", 1).unwrap_err().is_rate_limited());

    let MetricsReport::Scope(snapshot) = c.metrics(Some("stripe")).unwrap() else {
        panic!("expected scope metrics");
    };
    assert_eq!(snapshot.circuit_breaker.unwrap().failure_threshold, 1);
}

#[test]
fn json_file_replaces_the_built_in_presets() {
    let path = std::env::temp_dir().join(format!("traffic-control-{}.json", std::process::id()));
    std::fs::write(
        &path,
        r#"{
            "providers": { "batch": { "bucket": { "capacity": 1, "refill_rate": 1.0 } } },
            "telemetry_enabled": false
        }"#,
    )
    .unwrap();

    let cfg = TrafficControlConfig::from_env_vars([(
        "TRAFFIC_CONTROL_CONFIG_FILE",
        path.to_string_lossy().to_string(),
    )])
    .unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(!cfg.telemetry_enabled);
    assert!(!cfg.providers.contains_key("openai"));
    assert_eq!(cfg.providers["batch"].bucket.capacity, 1);

    let h = harness(cfg);
    h.controller.check_outbound("batch", 1).unwrap();
    let refused = h.controller.check_outbound("batch", 1).unwrap_err();
    assert_eq!(refused.wait(), Some(Duration::from_secs(1)));

    h.controller.check_outbound("openai", 1).unwrap();
    let MetricsReport::Scope(openai) = h.controller.metrics(Some("openai")).unwrap() else {
        panic!("expected scope metrics");
    };
    let fallback = TrafficControlConfig::default().outbound_default;
    assert_eq!(openai.bucket.capacity, fallback.bucket.capacity);
}

#[test]
fn reset_scope_restores_a_tripped_provider() {
    let mut cfg = config();
    cfg.providers.insert("vendor".into(), provider(1, 1, 3));
    let h = harness(cfg);
    let c = &h.controller;

    c.check_outbound("vendor", 1).unwrap();
    c.record_outbound_response("vendor", Outcome::Status(500));
    assert!(c.check_outbound("vendor", 1).unwrap_err().is_circuit_open());

    c.reset_scope("outbound:vendor").unwrap();
    c.check_outbound("vendor", 1).unwrap();
    assert!(c.reset_scope("outbound:never-seen").unwrap_err().is_unknown_scope());
}
