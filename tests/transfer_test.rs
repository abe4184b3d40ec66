// File transfer strategies against a mock printer HTTP server: chunked
// session uploads, cancellation mid-transfer, and streaming downloads with
// partial-file cleanup.

use elink::errors::ErrorCode;
use elink::transfer::elegoo_ccs::CcsHttpTransfer;
use elink::transfer::moonraker::MoonrakerHttpTransfer;
use elink::transfer::{CancelToken, FileTransfer, UploadProgressCallback};
use elink::types::{
    AuthMode, FileDownloadParams, FileUploadParams, GetDownloadUrlParams, PrinterInfo, PrinterType,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ccs_printer(host: &str) -> PrinterInfo {
    PrinterInfo {
        printer_id: "lan_F01NZQQZJS2ASC8".to_string(),
        serial_number: "F01NZQQZJS2ASC8".to_string(),
        printer_type: PrinterType::ElegooFdmCc2,
        brand: "Elegoo".to_string(),
        name: "CC2".to_string(),
        model: "CC2".to_string(),
        host: host.to_string(),
        web_url: None,
        auth_mode: AuthMode::AccessCode,
        mainboard_id: None,
    }
}

fn moonraker_printer(host: &str) -> PrinterInfo {
    PrinterInfo {
        printer_id: "lan_voron-01".to_string(),
        serial_number: "voron-01".to_string(),
        printer_type: PrinterType::GenericFdmKlipper,
        brand: "Generic".to_string(),
        name: "voron-01".to_string(),
        model: "Klipper".to_string(),
        host: host.to_string(),
        web_url: None,
        auth_mode: AuthMode::None,
        mainboard_id: None,
    }
}

fn mock_host(server: &MockServer) -> String {
    server.uri().trim_start_matches("http://").to_string()
}

#[tokio::test]
async fn ccs_upload_sends_one_chunk_per_megabyte() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/uploadFile/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"code": 0})))
        .expect(3)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("model.gcode");
    tokio::fs::write(&file_path, vec![7u8; 2_500_000]).await.unwrap();

    let transfer = CcsHttpTransfer::new();
    let last_progress = Arc::new(AtomicU8::new(0));
    let seen = last_progress.clone();
    let progress: UploadProgressCallback = Arc::new(move |update| {
        seen.store(update.progress, Ordering::SeqCst);
        true
    });

    let result = transfer
        .upload_file(
            &ccs_printer(&mock_host(&server)),
            &FileUploadParams {
                printer_id: "lan_F01NZQQZJS2ASC8".to_string(),
                local_file_path: file_path.to_str().unwrap().to_string(),
                file_name: None,
            },
            progress,
            CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.file_name, "model.gcode");
    assert_eq!(last_progress.load(Ordering::SeqCst), 100);
}

#[tokio::test]
async fn ccs_upload_cancels_at_the_progress_callback_and_can_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/uploadFile/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"code": 0})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("model.gcode");
    // 2.5 MB: the first 1 MB chunk lands exactly at 40%.
    tokio::fs::write(&file_path, vec![7u8; 2_500_000]).await.unwrap();

    let transfer = CcsHttpTransfer::new();
    let printer = ccs_printer(&mock_host(&server));
    let params = FileUploadParams {
        printer_id: "lan_F01NZQQZJS2ASC8".to_string(),
        local_file_path: file_path.to_str().unwrap().to_string(),
        file_name: None,
    };

    let peak = Arc::new(AtomicU8::new(0));
    let seen = peak.clone();
    let progress: UploadProgressCallback = Arc::new(move |update| {
        seen.fetch_max(update.progress, Ordering::SeqCst);
        update.progress < 40
    });

    let err = transfer
        .upload_file(&printer, &params, progress, CancelToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::OperationCancelled);
    // No progress report beyond the cancel point.
    assert!(peak.load(Ordering::SeqCst) <= 40);

    // A fresh upload on the same printer succeeds: cancellation is
    // per-operation, not sticky.
    let result = transfer
        .upload_file(&printer, &params, Arc::new(|_| true), CancelToken::new())
        .await
        .unwrap();
    assert_eq!(result.printer_id, "lan_F01NZQQZJS2ASC8");
}

#[tokio::test]
async fn ccs_upload_surfaces_printer_chunk_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/uploadFile/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"code": 7})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("model.gcode");
    tokio::fs::write(&file_path, vec![1u8; 1024]).await.unwrap();

    let transfer = CcsHttpTransfer::new();
    let err = transfer
        .upload_file(
            &ccs_printer(&mock_host(&server)),
            &FileUploadParams {
                printer_id: "lan_F01NZQQZJS2ASC8".to_string(),
                local_file_path: file_path.to_str().unwrap().to_string(),
                file_name: None,
            },
            Arc::new(|_| true),
            CancelToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::FileTransferFailed);
}

#[tokio::test]
async fn moonraker_small_upload_posts_one_multipart_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/server/files/upload"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(serde_json::json!({"result": "ok"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("small.gcode");
    tokio::fs::write(&file_path, vec![2u8; 64 * 1024]).await.unwrap();

    let transfer = MoonrakerHttpTransfer::new();
    let result = transfer
        .upload_file(
            &moonraker_printer(&mock_host(&server)),
            &FileUploadParams {
                printer_id: "lan_voron-01".to_string(),
                local_file_path: file_path.to_str().unwrap().to_string(),
                file_name: Some("renamed.gcode".to_string()),
            },
            Arc::new(|_| true),
            CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.file_name, "renamed.gcode");
}

#[tokio::test]
async fn moonraker_download_streams_to_disk() {
    let server = MockServer::start().await;
    let body = vec![9u8; 32 * 1024];
    Mock::given(method("HEAD"))
        .and(path("/server/files/gcodes/benchy.gcode"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-length", "32768"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/server/files/gcodes/benchy.gcode"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("benchy.gcode");

    let transfer = MoonrakerHttpTransfer::new();
    let result = transfer
        .download_file(
            &moonraker_printer(&mock_host(&server)),
            &FileDownloadParams {
                printer_id: "lan_voron-01".to_string(),
                remote_file_path: "benchy.gcode".to_string(),
                local_file_path: local.to_str().unwrap().to_string(),
            },
            Arc::new(|_, _| true),
            CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.total_bytes, 32 * 1024);
    let written = tokio::fs::read(&local).await.unwrap();
    assert_eq!(written, body);
}

#[tokio::test]
async fn failed_download_removes_the_partial_file() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/server/files/gcodes/missing.gcode"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/server/files/gcodes/missing.gcode"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("missing.gcode");

    let transfer = MoonrakerHttpTransfer::new();
    let err = transfer
        .download_file(
            &moonraker_printer(&mock_host(&server)),
            &FileDownloadParams {
                printer_id: "lan_voron-01".to_string(),
                remote_file_path: "missing.gcode".to_string(),
                local_file_path: local.to_str().unwrap().to_string(),
            },
            Arc::new(|_, _| true),
            CancelToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::FileNotFound);
    assert!(!local.exists());
}

#[test]
fn download_urls_point_at_the_family_endpoints() {
    let ccs = CcsHttpTransfer::new();
    let url = ccs.download_url(
        &ccs_printer("192.168.1.50"),
        &GetDownloadUrlParams {
            printer_id: "lan_F01NZQQZJS2ASC8".to_string(),
            remote_file_path: "/local/a.gcode".to_string(),
        },
    );
    assert_eq!(url, "http://192.168.1.50:3030/downloadFile?path=/local/a.gcode");

    let moonraker = MoonrakerHttpTransfer::new();
    let url = moonraker.download_url(
        &moonraker_printer("192.168.1.60"),
        &GetDownloadUrlParams {
            printer_id: "lan_voron-01".to_string(),
            remote_file_path: "a.gcode".to_string(),
        },
    );
    assert_eq!(url, "http://192.168.1.60:7125/server/files/gcodes/a.gcode");
}
