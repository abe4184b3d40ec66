// Connection manager lifecycle: fail-fast connects, auto-reconnect cadence
// and the delayed-reconnect debounce. Paused time keeps the 5 s reconnect
// interval out of the wall clock.

mod common;

use common::{connect_params, FakeTransport};
use elink::connection::ConnectionManager;
use elink::errors::ErrorCode;
use elink::transport::Transport;
use elink::types::ConnectionState;
use std::sync::Arc;
use std::time::Duration;

async fn wait_until<F: Fn() -> bool>(condition: F, max: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + max;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    condition()
}

#[tokio::test(start_paused = true)]
async fn reconnect_worker_retries_until_success() {
    // First two opens fail; the third (second reconnect attempt) succeeds.
    let transport = FakeTransport::failing_first(2);
    let manager = ConnectionManager::new(transport.clone() as Arc<dyn Transport>);

    let mut params = connect_params();
    params.auto_reconnect = true;
    let err = manager.connect(params, true).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PrinterConnectionError);
    assert!(!manager.is_connected());

    assert!(wait_until(|| manager.is_connected(), Duration::from_secs(30)).await);
    assert_eq!(transport.open_attempts(), 3);
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn no_reconnect_worker_without_auto_reconnect() {
    let transport = FakeTransport::failing_first(usize::MAX);
    let manager = ConnectionManager::new(transport.clone() as Arc<dyn Transport>);

    let mut params = connect_params();
    params.auto_reconnect = false;
    let err = manager.connect(params, false).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PrinterConnectionError);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.open_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn check_connection_never_starts_the_worker() {
    let transport = FakeTransport::failing_first(usize::MAX);
    let manager = ConnectionManager::new(transport.clone() as Arc<dyn Transport>);

    let mut params = connect_params();
    params.auto_reconnect = true;
    params.check_connection = true;
    let _ = manager.connect(params, true).await.unwrap_err();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.open_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn connecting_twice_fails_fast() {
    let transport = FakeTransport::new();
    let manager = ConnectionManager::new(transport.clone() as Arc<dyn Transport>);

    let mut params = connect_params();
    params.auto_reconnect = false;
    manager.connect(params.clone(), false).await.unwrap();
    assert!(manager.is_connected());

    let err = manager.connect(params, false).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PrinterAlreadyConnected);

    manager.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent() {
    let transport = FakeTransport::new();
    let manager = ConnectionManager::new(transport.clone() as Arc<dyn Transport>);

    let mut params = connect_params();
    params.auto_reconnect = false;
    manager.connect(params, false).await.unwrap();

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    manager.disconnect().await;
    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn link_interruption_debounces_then_reconnects() {
    let transport = FakeTransport::new();
    let manager = ConnectionManager::new(transport.clone() as Arc<dyn Transport>);

    let mut params = connect_params();
    params.auto_reconnect = true;
    manager.connect(params, true).await.unwrap();
    assert_eq!(transport.open_attempts(), 1);

    transport.drop_link();
    assert!(wait_until(|| manager.is_connected(), Duration::from_secs(30)).await);
    assert_eq!(transport.open_attempts(), 2);

    manager.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn recovery_inside_the_debounce_window_cancels_the_reconnect() {
    let transport = FakeTransport::new();
    let manager = ConnectionManager::new(transport.clone() as Arc<dyn Transport>);

    let mut params = connect_params();
    params.auto_reconnect = true;
    manager.connect(params.clone(), true).await.unwrap();

    transport.drop_link();
    // Recover immediately, well inside the 500 ms window.
    let _ = transport.open(&params).await;
    manager.notify_connection_recovered();

    tokio::time::sleep(Duration::from_secs(30)).await;
    // No reconnect attempt beyond the original open and the manual
    // recovery open above.
    assert_eq!(transport.open_attempts(), 2);
    assert!(manager.is_connected());

    manager.disconnect().await;
}
