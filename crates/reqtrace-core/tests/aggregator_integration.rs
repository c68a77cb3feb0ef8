//! End-to-end flows through the aggregator facade: lifecycle reconstruction,
//! capture correlation, persistence round trips, and session summaries.

use std::collections::HashMap;
use std::sync::Arc;

use reqtrace_core::aggregator::RequestAggregator;
use reqtrace_core::clock::{Clock, ManualClock};
use reqtrace_core::config::Config;
use reqtrace_core::correlate::CorrelationOutcome;
use reqtrace_core::events::{CaptureMessage, ObserverMessage};
use reqtrace_core::persist::{KeyValuePort, MemoryKv, SqliteKv};
use reqtrace_core::record::RequestState;

fn new_aggregator(clock: Arc<ManualClock>) -> RequestAggregator {
    let port: Arc<dyn KeyValuePort> = Arc::new(MemoryKv::new());
    RequestAggregator::new(&Config::default(), port, clock).unwrap()
}

fn started(id: &str, url: &str, ts: i64) -> ObserverMessage {
    ObserverMessage::RequestStarted {
        request_id: id.to_string(),
        url: url.to_string(),
        method: "GET".to_string(),
        time_stamp: ts,
        post_data: None,
    }
}

fn headers_sent(id: &str, url: &str, ts: i64, headers: &[(&str, &str)]) -> ObserverMessage {
    ObserverMessage::HeadersSent {
        request_id: id.to_string(),
        url: url.to_string(),
        method: "GET".to_string(),
        time_stamp: ts,
        request_headers: headers
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
    }
}

fn completed(id: &str, url: &str, ts: i64) -> ObserverMessage {
    ObserverMessage::RequestCompleted {
        request_id: id.to_string(),
        url: url.to_string(),
        method: "GET".to_string(),
        time_stamp: ts,
        status_code: Some(200),
        status_line: Some("OK".to_string()),
        response_size: Some(1024),
        response_headers: None,
    }
}

fn capture(url: &str, ts: i64) -> CaptureMessage {
    CaptureMessage {
        request_id: None,
        url: url.to_string(),
        method: Some("GET".to_string()),
        status: 200,
        status_text: Some("OK".to_string()),
        response_body: "{\"balance\":1234}".to_string(),
        timestamp: ts,
        headers: None,
        correlation_token: None,
        page_url: None,
    }
}

#[test]
fn out_of_order_lifecycle_still_converges() {
    let clock = Arc::new(ManualClock::new(0));
    let aggregator = new_aggregator(clock);

    // Completion arrives before the start event.
    aggregator
        .handle_message(&completed("r1", "https://bank.example/accounts", 1_400))
        .unwrap();
    aggregator
        .handle_message(&started("r1", "https://bank.example/accounts", 1_000))
        .unwrap();

    let record = aggregator.get_record("r1").unwrap().unwrap();
    // Terminal state is sticky and end_time is set exactly once.
    assert_eq!(record.state, RequestState::Completed);
    assert_eq!(record.end_time, Some(1_400));
    assert_eq!(aggregator.record_count().unwrap(), 1);
}

#[test]
fn capture_inside_window_merges_instead_of_duplicating() {
    let clock = Arc::new(ManualClock::new(0));
    let aggregator = new_aggregator(clock);

    aggregator
        .handle_message(&headers_sent(
            "r1",
            "https://bank.example/logonUser?ws1",
            1_000,
            &[("X-Session-Token", "abc")],
        ))
        .unwrap();

    // Capture at t=2000 for the same URL: inside the 30s window, no id.
    let outcome = aggregator
        .handle_message(&ObserverMessage::ResponseCaptured(capture(
            "https://bank.example/logonUser?ws1",
            2_000,
        )))
        .unwrap();

    assert_eq!(
        outcome,
        Some(CorrelationOutcome::MergedByWindow {
            request_id: "r1".to_string(),
            diff_ms: 1_000
        })
    );
    assert_eq!(aggregator.record_count().unwrap(), 1);
    let record = aggregator.get_record("r1").unwrap().unwrap();
    assert!(record.response_body.is_some());
    assert!(!record.is_synthetic);
    assert_eq!(record.correlation_token.as_deref(), Some("abc"));
}

#[test]
fn capture_outside_window_synthesizes_and_login_dedup_prefers_it() {
    let clock = Arc::new(ManualClock::new(0));
    let aggregator = new_aggregator(clock);

    // Tokened login request so the session has an active token.
    aggregator
        .handle_message(&headers_sent(
            "r1",
            "https://bank.example/logonUser?ws1",
            400_000,
            &[("X-Session-Token", "abc")],
        ))
        .unwrap();

    // Capture 40s later, outside the 30s window: a synthetic record appears.
    let mut msg = capture("https://bank.example/logonUser?ws1", 440_000);
    msg.correlation_token = Some("abc".to_string());
    let outcome = aggregator
        .handle_message(&ObserverMessage::ResponseCaptured(msg))
        .unwrap()
        .unwrap();
    let CorrelationOutcome::Synthesized { request_id } = &outcome else {
        panic!("expected synthesis, got {outcome:?}");
    };
    assert_eq!(aggregator.record_count().unwrap(), 2);

    let synthetic = aggregator.get_record(request_id).unwrap().unwrap();
    assert!(synthetic.is_synthetic);
    assert!(synthetic.is_login_request);

    // The summary keeps exactly one login record: the synthetic one with a
    // body outranks the primary observation.
    let summary = aggregator.summarize("bank.example").unwrap().unwrap();
    assert_eq!(summary.session_id, "abc");
    assert_eq!(summary.requests.len(), 1);
    assert_eq!(&summary.requests[0].request_id, request_id);
}

#[test]
fn session_window_is_padded_five_minutes() {
    let clock = Arc::new(ManualClock::new(0));
    let aggregator = new_aggregator(clock);

    aggregator
        .handle_message(&headers_sent(
            "r1",
            "https://bank.example/accounts",
            1_000_000,
            &[("X-Session-Token", "abc")],
        ))
        .unwrap();
    aggregator
        .handle_message(&completed("r1", "https://bank.example/accounts", 1_010_000))
        .unwrap();

    let summary = aggregator.summarize("bank.example").unwrap().unwrap();
    assert_eq!(summary.start_time, 1_000_000 - 300_000);
    assert_eq!(summary.end_time, 1_010_000 + 300_000);
}

#[test]
fn window_anchored_by_capture_merged_into_tokenless_request() {
    let clock = Arc::new(ManualClock::new(0));
    let aggregator = new_aggregator(clock);

    // r1 never carries a token; its capture merges by id.
    aggregator
        .handle_message(&started("r1", "https://bank.example/logonUser?ws1", 1_000))
        .unwrap();
    let mut msg = capture("https://bank.example/logonUser?ws1", 1_500);
    msg.request_id = Some("r1".to_string());
    let outcome = aggregator
        .handle_message(&ObserverMessage::ResponseCaptured(msg))
        .unwrap();
    assert_eq!(
        outcome,
        Some(CorrelationOutcome::MergedById {
            request_id: "r1".to_string()
        })
    );

    // r2 establishes the active token.
    aggregator
        .handle_message(&headers_sent(
            "r2",
            "https://bank.example/accounts",
            2_000,
            &[("X-Session-Token", "abc")],
        ))
        .unwrap();

    let summary = aggregator.summarize("bank.example").unwrap().unwrap();
    assert_eq!(summary.session_id, "abc");
    // The window starts at r1's start_time even though r1 has no token.
    assert_eq!(summary.start_time, 1_000 - 300_000);
    // The request list stays token-filtered.
    assert_eq!(summary.requests.len(), 1);
    assert_eq!(summary.requests[0].request_id, "r2");
}

#[test]
fn token_rotation_drops_older_session_traffic() {
    let clock = Arc::new(ManualClock::new(0));
    let aggregator = new_aggregator(clock);

    aggregator
        .handle_message(&headers_sent(
            "r1",
            "https://bank.example/accounts",
            1_000,
            &[("X-Session-Token", "first")],
        ))
        .unwrap();
    aggregator
        .handle_message(&headers_sent(
            "r2",
            "https://bank.example/accounts",
            50_000,
            &[("X-Session-Token", "second")],
        ))
        .unwrap();

    let summary = aggregator.summarize("bank.example").unwrap().unwrap();
    assert_eq!(summary.session_id, "second");
    assert_eq!(summary.requests.len(), 1);
    assert_eq!(summary.requests[0].request_id, "r2");
}

#[test]
fn staging_and_offset_metadata_flow_into_summary() {
    let clock = Arc::new(ManualClock::new(0));
    let aggregator = new_aggregator(clock);

    aggregator
        .handle_message(&headers_sent(
            "r1",
            "https://uat.bank.example/accounts",
            1_000,
            &[("X-Session-Token", "abc"), ("X-UTC-Offset", "UTC+5:30")],
        ))
        .unwrap();

    let summary = aggregator.summarize("uat.bank.example").unwrap().unwrap();
    assert!(summary.is_staging);
    assert_eq!(summary.utc_offset.as_deref(), Some("+0530"));
}

#[test]
fn eviction_holds_store_at_capacity_under_load() {
    let mut config = Config::default();
    config.store.max_records = 50;
    config.store.evict_batch = 10;
    let port: Arc<dyn KeyValuePort> = Arc::new(MemoryKv::new());
    let clock = Arc::new(ManualClock::new(0));
    let aggregator = RequestAggregator::new(&config, port, clock).unwrap();

    for i in 0..500i64 {
        aggregator
            .handle_message(&started(
                &format!("r{i:04}"),
                "https://bank.example/poll",
                i * 10,
            ))
            .unwrap();
    }

    // Bounded overshoot only: capacity plus at most one eviction batch.
    let count = aggregator.record_count().unwrap();
    assert!(count <= 50 + 10, "store grew to {count}");
    // The newest record always survives.
    assert!(aggregator.get_record("r0499").unwrap().is_some());
    assert!(aggregator.get_record("r0000").unwrap().is_none());
}

#[test]
fn snapshot_survives_process_restart_via_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("reqtrace.db");
    let db_str = db_path.to_string_lossy().to_string();

    {
        let clock = Arc::new(ManualClock::new(10_000));
        let port: Arc<dyn KeyValuePort> = Arc::new(SqliteKv::open(&db_str).unwrap());
        let aggregator = RequestAggregator::new(&Config::default(), port, clock).unwrap();
        aggregator
            .handle_message(&started("r1", "https://bank.example/accounts", 9_000))
            .unwrap();
        aggregator.flush_now().unwrap();
    }

    let clock = Arc::new(ManualClock::new(20_000));
    let port: Arc<dyn KeyValuePort> = Arc::new(SqliteKv::open(&db_str).unwrap());
    let aggregator = RequestAggregator::new(&Config::default(), port, clock).unwrap();
    assert_eq!(aggregator.restore().unwrap(), 1);
    let record = aggregator.get_record("r1").unwrap().unwrap();
    assert_eq!(record.start_time, 9_000);
    assert_eq!(record.url, "https://bank.example/accounts");

    let meta = aggregator.snapshot_meta().unwrap().unwrap();
    assert_eq!(meta.record_count, 1);
}

#[test]
fn mutations_after_last_flush_are_lost_on_restore() {
    let clock = Arc::new(ManualClock::new(0));
    let port = Arc::new(MemoryKv::new());
    let kv: Arc<dyn KeyValuePort> = port.clone();
    let manual: Arc<dyn Clock> = clock.clone();
    let aggregator = RequestAggregator::new(&Config::default(), kv, manual).unwrap();

    aggregator
        .handle_message(&started("r1", "https://bank.example/a", 100))
        .unwrap();
    aggregator.flush_now().unwrap();
    aggregator
        .handle_message(&started("r2", "https://bank.example/b", 200))
        .unwrap();
    // No flush for r2 before the simulated crash.

    let kv: Arc<dyn KeyValuePort> = port.clone();
    let restarted = RequestAggregator::new(&Config::default(), kv, clock).unwrap();
    assert_eq!(restarted.restore().unwrap(), 1);
    assert!(restarted.get_record("r1").unwrap().is_some());
    assert!(restarted.get_record("r2").unwrap().is_none());
}

#[test]
fn messages_round_trip_through_json_lines() {
    let clock = Arc::new(ManualClock::new(0));
    let aggregator = new_aggregator(clock);

    let lines = [
        r#"{"type":"request_started","request_id":"r1","url":"https://bank.example/logonUser","method":"POST","time_stamp":1000}"#,
        r#"{"type":"headers_sent","request_id":"r1","url":"https://bank.example/logonUser","method":"POST","time_stamp":1010,"request_headers":{"X-Session-Token":"abc"}}"#,
        r#"{"type":"request_completed","request_id":"r1","url":"https://bank.example/logonUser","method":"POST","time_stamp":1400,"status_code":200}"#,
        r#"{"type":"response_captured","url":"https://bank.example/logonUser","status":200,"response_body":"{}","timestamp":1500}"#,
    ];
    for line in lines {
        let msg: ObserverMessage = serde_json::from_str(line).unwrap();
        aggregator.handle_message(&msg).unwrap();
    }

    assert_eq!(aggregator.record_count().unwrap(), 1);
    let record = aggregator.get_record("r1").unwrap().unwrap();
    assert_eq!(record.state, RequestState::Completed);
    assert!(record.is_login_request);
    assert!(record.response_body.is_some());

    let summary = aggregator.summarize("bank.example").unwrap().unwrap();
    assert_eq!(summary.session_id, "abc");
}

#[test]
fn headers_extraction_is_case_insensitive() {
    let clock = Arc::new(ManualClock::new(0));
    let aggregator = new_aggregator(clock);

    let mut headers = HashMap::new();
    headers.insert("x-session-token".to_string(), "tok".to_string());
    headers.insert("X-WORKSTATION-ID".to_string(), "WS-9".to_string());
    aggregator
        .handle_message(&ObserverMessage::HeadersSent {
            request_id: "r1".to_string(),
            url: "https://bank.example/a".to_string(),
            method: "GET".to_string(),
            time_stamp: 1_000,
            request_headers: headers,
        })
        .unwrap();

    let record = aggregator.get_record("r1").unwrap().unwrap();
    assert_eq!(record.correlation_token.as_deref(), Some("tok"));
    assert_eq!(record.workstation_id.as_deref(), Some("WS-9"));
}
