// Discovery lifecycle against the real UDP socket path. No printers are
// expected on the test network; these tests pin down run/stop semantics
// and the completion contract.

use elink::config::DiscoveryParams;
use elink::errors::ErrorCode;
use elink::lan::LanService;
use elink::LanConfig;
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
#[serial]
async fn discovery_completes_once_with_the_accumulated_set() {
    let service = LanService::new();
    service.initialize(LanConfig::default()).unwrap();

    let events = Arc::new(AtomicUsize::new(0));
    let seen = events.clone();
    service.set_event_callback(Arc::new(move |event| {
        if event.method == elink::Method::OnPrinterDiscovery {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let params = DiscoveryParams {
        timeout_ms: 1200,
        broadcast_interval_ms: 500,
        enable_auto_retry: true,
        preferred_listen_ports: vec![],
    };
    let printers = service.start_printer_discovery(params).await.unwrap();

    // The completion set equals the set of unique ids seen incrementally.
    assert_eq!(printers.len(), events.load(Ordering::SeqCst));
    assert_eq!(service.get_discovered_printers().len(), printers.len());

    service.cleanup().await;
}

#[tokio::test]
#[serial]
async fn concurrent_discovery_runs_are_rejected() {
    let service = LanService::new();
    service.initialize(LanConfig::default()).unwrap();

    let service_for_first = service.clone();
    let first = tokio::spawn(async move {
        service_for_first
            .start_printer_discovery(DiscoveryParams {
                timeout_ms: 2000,
                broadcast_interval_ms: 500,
                enable_auto_retry: false,
                preferred_listen_ports: vec![],
            })
            .await
    });

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let err = service
        .start_printer_discovery(DiscoveryParams::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::OperationInProgress);

    service.stop_printer_discovery().await.unwrap();
    let _ = first.await.unwrap();
    service.cleanup().await;
}

#[tokio::test]
#[serial]
async fn stop_on_idle_discovery_is_silent_and_runs_can_repeat() {
    let service = LanService::new();
    service.initialize(LanConfig::default()).unwrap();

    service.stop_printer_discovery().await.unwrap();
    service.stop_printer_discovery().await.unwrap();

    for _ in 0..2 {
        let printers = service
            .start_printer_discovery(DiscoveryParams {
                timeout_ms: 600,
                broadcast_interval_ms: 200,
                enable_auto_retry: false,
                preferred_listen_ports: vec![41999],
            })
            .await
            .unwrap();
        let _ = printers;
    }

    service.cleanup().await;
}
