// End-to-end session behavior against a scripted transport: correlation,
// timeout, cancellation and the connection event sequence.

mod common;

use common::{cc2_printer_info, connect_params, init_tracing, EventLog, FakeTransport};
use elink::adapter::elegoo_cc2::Cc2Adapter;
use elink::adapter::Adapter;
use elink::errors::ErrorCode;
use elink::session::PrinterSession;
use elink::transport::Transport;
use elink::types::Method;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn build_session(transport: Arc<FakeTransport>) -> Arc<PrinterSession> {
    init_tracing();
    let adapter: Arc<dyn Adapter> = Arc::new(Cc2Adapter::new(cc2_printer_info()));
    PrinterSession::new(cc2_printer_info(), adapter, transport as Arc<dyn Transport>)
}

/// Answer the bounded post-connect status poll so it stops interfering
/// with the payload counts the test asserts on.
async fn settle_status_poll(transport: &FakeTransport) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    for payload in transport.drain_sent() {
        let parsed: Value = serde_json::from_str(&payload).unwrap();
        let id = parsed["id"].as_str().unwrap().to_string();
        transport.inject(
            &json!({
                "id": id,
                "method": 1001,
                "result": {"full": true, "machine_status": {"status": 0}},
                "error_code": 0,
            })
            .to_string(),
        );
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    transport.drain_sent();
}

#[tokio::test]
async fn concurrent_requests_resolve_without_crosstalk() {
    let transport = FakeTransport::new();
    let session = build_session(transport.clone());
    session.connect(&connect_params()).await.unwrap();
    settle_status_poll(&transport).await;

    let s1 = session.clone();
    let first = tokio::spawn(async move {
        s1.execute(
            Method::GetPrinterStatus,
            json!({"tag": "a"}),
            "test a",
            Duration::from_secs(3),
        )
        .await
    });
    let s2 = session.clone();
    let second = tokio::spawn(async move {
        s2.execute(
            Method::GetPrinterStatus,
            json!({"tag": "b"}),
            "test b",
            Duration::from_secs(3),
        )
        .await
    });

    // Wait until both requests hit the wire, then answer them in reverse
    // order with distinct payloads.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let sent = transport.sent_payloads();
    assert_eq!(sent.len(), 2);

    let mut id_by_tag = std::collections::HashMap::new();
    for payload in &sent {
        let parsed: Value = serde_json::from_str(payload).unwrap();
        let tag = parsed["params"]["tag"].as_str().unwrap().to_string();
        let id = parsed["id"].as_str().unwrap().to_string();
        id_by_tag.insert(tag, id);
    }

    transport.inject(
        &json!({
            "id": id_by_tag["b"],
            "method": 6000,
            "result": {"full": true, "who": "b"},
            "error_code": 0,
        })
        .to_string(),
    );
    transport.inject(
        &json!({
            "id": id_by_tag["a"],
            "method": 6000,
            "result": {"full": true, "who": "a"},
            "error_code": 0,
        })
        .to_string(),
    );

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first["who"], "a");
    assert_eq!(second["who"], "b");
}

#[tokio::test]
async fn unanswered_request_times_out_and_frees_the_entry() {
    let transport = FakeTransport::new();
    let session = build_session(transport.clone());
    session.connect(&connect_params()).await.unwrap();
    settle_status_poll(&transport).await;

    let started = std::time::Instant::now();
    let err = session
        .execute(
            Method::PausePrint,
            json!({}),
            "test timeout",
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::OperationTimeout);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(450), "timed out too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2000), "timed out too late: {:?}", elapsed);

    // The entry is gone: a late reply is treated as noise, not delivered.
    let sent = transport.drain_sent();
    let parsed: Value = serde_json::from_str(&sent[0]).unwrap();
    transport.inject(
        &json!({"id": parsed["id"], "method": 1101, "error_code": 0}).to_string(),
    );
    // Nothing to assert beyond "does not panic / does not resolve twice";
    // the exactly-once property is that the caller saw one timeout.
}

#[tokio::test]
async fn teardown_settles_pending_requests_with_cancelled() {
    let transport = FakeTransport::new();
    let session = build_session(transport.clone());
    session.connect(&connect_params()).await.unwrap();
    settle_status_poll(&transport).await;

    let s = session.clone();
    let waiting = tokio::spawn(async move {
        s.execute(Method::StopPrint, json!({}), "test cancel", Duration::from_secs(10))
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    session.shutdown().await;

    let err = waiting.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::OperationCancelled);
}

#[tokio::test]
async fn connect_and_disconnect_emit_the_event_sequence() {
    let transport = FakeTransport::new();
    let session = build_session(transport.clone());
    let log = EventLog::new();
    session.set_event_callback(log.recorder());

    session.connect(&connect_params()).await.unwrap();
    assert!(session.is_connected());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.count_of(Method::OnConnectionStatus), 1);
    let connected = &log.events()[0];
    assert_eq!(connected.data["status"], "CONNECTED");

    session.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(log.count_of(Method::OnConnectionStatus), 2);
    assert_eq!(log.count_of(Method::OnPrinterStatus), 1);

    let events = log.events();
    let disconnected = events
        .iter()
        .find(|e| e.method == Method::OnConnectionStatus && e.data["status"] == "DISCONNECTED")
        .expect("disconnect event missing");
    assert_eq!(disconnected.data["printerId"], "lan_F01NZQQZJS2ASC8");

    let offline = events
        .iter()
        .find(|e| e.method == Method::OnPrinterStatus)
        .expect("offline status missing");
    assert_eq!(offline.data["printerStatus"]["state"], "OFFLINE");
}

#[tokio::test]
async fn status_events_flow_through_to_the_callback() {
    let transport = FakeTransport::new();
    let session = build_session(transport.clone());
    let log = EventLog::new();
    session.set_event_callback(log.recorder());

    session.connect(&connect_params()).await.unwrap();
    settle_status_poll(&transport).await;

    transport.inject(
        &json!({
            "id": 0,
            "method": 6000,
            "result": {"full": true, "machine_status": {"status": 1}},
        })
        .to_string(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status_events: Vec<_> = log
        .events()
        .into_iter()
        .filter(|e| e.method == Method::OnPrinterStatus)
        .collect();
    let last = status_events.last().expect("no status event");
    assert_eq!(last.data["printerStatus"]["machine_status"]["status"], 1);

    // The adapter cache holds the merged view and empties on disconnect.
    assert_eq!(
        session.adapter().cached_full_status()["machine_status"]["status"],
        1
    );
    session.shutdown().await;
    assert_eq!(session.adapter().cached_full_status(), json!({}));
}

#[tokio::test]
async fn requests_fail_fast_when_not_connected() {
    let transport = FakeTransport::new();
    let session = build_session(transport);
    let err = session
        .execute(Method::GetPrinterStatus, json!({}), "test", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PrinterConnectionError);
}
