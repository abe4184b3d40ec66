use super::{
    resolve_file_name, stream_download, AuthCredentials, CancelToken, DownloadProgressCallback,
    FileTransfer, UploadProgressCallback,
};
use crate::errors::{ErrorCode, Result, SdkError};
use crate::types::{
    mask, FileDownloadData, FileDownloadParams, FileUploadData, FileUploadParams,
    FileUploadProgressData, GetDownloadUrlParams, PrinterInfo, PrinterType,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use self::bytes_stream_support::chunked_file_stream;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Files above this size stream through the chunked reader instead of being
/// buffered whole.
const LARGE_FILE_THRESHOLD: u64 = 1024 * 1024;
const DEFAULT_API_PORT: u16 = 7125;

/// Multipart upload strategy for Moonraker printers: one in-memory POST for
/// small files, a streaming multipart POST with an 8 KB chunked reader for
/// everything else.
pub struct MoonrakerHttpTransfer {
    client: reqwest::Client,
    credentials: AuthCredentials,
}

impl MoonrakerHttpTransfer {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            credentials: AuthCredentials::default(),
        }
    }

    fn endpoint(&self, printer: &PrinterInfo) -> String {
        let host = &printer.host;
        if host.contains("://") {
            return host.trim_end_matches('/').to_string();
        }
        if host.contains(':') {
            return format!("http://{}", host);
        }
        format!("http://{}:{}", host, DEFAULT_API_PORT)
    }

    fn auth_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(token) = self.credentials.get("token") {
            headers.push(("X-Api-Key".to_string(), token));
        } else if let Some(username) = self.credentials.get("username") {
            let password = self.credentials.get("password").unwrap_or_default();
            let encoded = BASE64.encode(format!("{}:{}", username, password));
            headers.push(("Authorization".to_string(), format!("Basic {}", encoded)));
        }
        headers
    }

    fn apply_auth(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in self.auth_headers() {
            request = request.header(name, value);
        }
        request
    }

    async fn upload_small(
        &self,
        printer: &PrinterInfo,
        params: &FileUploadParams,
        file_name: &str,
        total_size: u64,
        progress: &UploadProgressCallback,
        cancel: &CancelToken,
    ) -> Result<()> {
        let bytes = tokio::fs::read(&params.local_file_path).await?;
        if cancel.is_cancelled() {
            return Err(SdkError::cancelled("upload cancelled"));
        }

        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("root", "gcodes")
            .text("print", "false")
            .part("file", part);

        let request = self
            .apply_auth(self.client.post(format!("{}/server/files/upload", self.endpoint(printer))))
            .multipart(form);
        let response = request.send().await.map_err(|e| {
            SdkError::new(ErrorCode::FileTransferFailed, format!("upload failed: {}", e))
        })?;
        if !response.status().is_success() {
            return Err(map_upload_status(response.status().as_u16()));
        }

        let _ = progress(&FileUploadProgressData {
            printer_id: printer.printer_id.clone(),
            file_name: file_name.to_string(),
            progress: 100,
        });
        debug!("small upload completed ({} bytes)", total_size);
        Ok(())
    }

    async fn upload_streaming(
        &self,
        printer: &PrinterInfo,
        params: &FileUploadParams,
        file_name: &str,
        total_size: u64,
        progress: &UploadProgressCallback,
        cancel: &CancelToken,
    ) -> Result<()> {
        let file = tokio::fs::File::open(&params.local_file_path).await?;
        let stream = chunked_file_stream(
            file,
            total_size,
            printer.printer_id.clone(),
            file_name.to_string(),
            progress.clone(),
            cancel.clone(),
        );

        let body = reqwest::Body::wrap_stream(stream);
        let part = reqwest::multipart::Part::stream_with_length(body, total_size)
            .file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("root", "gcodes")
            .text("print", "false")
            .part("file", part);

        let request = self
            .apply_auth(self.client.post(format!("{}/server/files/upload", self.endpoint(printer))))
            .multipart(form);
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                if cancel.is_cancelled() {
                    return Err(SdkError::cancelled("upload cancelled"));
                }
                return Err(SdkError::new(
                    ErrorCode::FileTransferFailed,
                    format!("upload failed: {}", err),
                ));
            }
        };
        if !response.status().is_success() {
            return Err(map_upload_status(response.status().as_u16()));
        }

        let _ = progress(&FileUploadProgressData {
            printer_id: printer.printer_id.clone(),
            file_name: file_name.to_string(),
            progress: 100,
        });
        debug!("streaming upload completed ({} bytes)", total_size);
        Ok(())
    }
}

impl Default for MoonrakerHttpTransfer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileTransfer for MoonrakerHttpTransfer {
    fn set_auth_credentials(&self, credentials: HashMap<String, String>) {
        self.credentials.replace(credentials);
    }

    fn supported_printer_types(&self) -> Vec<PrinterType> {
        vec![PrinterType::GenericFdmKlipper, PrinterType::ElegooFdmKlipper]
    }

    fn transfer_info(&self) -> &'static str {
        "GENERIC_MOONRAKER_HTTP_TRANSFER"
    }

    async fn upload_file(
        &self,
        printer: &PrinterInfo,
        params: &FileUploadParams,
        progress: UploadProgressCallback,
        cancel: CancelToken,
    ) -> Result<FileUploadData> {
        let file_name = resolve_file_name(params)?;
        let total_size = tokio::fs::metadata(&params.local_file_path).await?.len();
        if total_size == 0 {
            return Err(SdkError::invalid_parameter("cannot upload an empty file"));
        }

        info!(
            "uploading {} ({} bytes) to printer {}",
            file_name,
            total_size,
            mask(&printer.printer_id)
        );

        if total_size <= LARGE_FILE_THRESHOLD {
            self.upload_small(printer, params, &file_name, total_size, &progress, &cancel)
                .await?;
        } else {
            self.upload_streaming(printer, params, &file_name, total_size, &progress, &cancel)
                .await?;
        }

        Ok(FileUploadData {
            printer_id: printer.printer_id.clone(),
            file_name,
        })
    }

    async fn download_file(
        &self,
        printer: &PrinterInfo,
        params: &FileDownloadParams,
        progress: DownloadProgressCallback,
        cancel: CancelToken,
    ) -> Result<FileDownloadData> {
        let url = self.download_url(
            printer,
            &GetDownloadUrlParams {
                printer_id: params.printer_id.clone(),
                remote_file_path: params.remote_file_path.clone(),
            },
        );
        let headers = self.auth_headers();

        let total = stream_download(
            &self.client,
            &url,
            &headers,
            &params.local_file_path,
            progress,
            cancel,
        )
        .await?;

        Ok(FileDownloadData {
            printer_id: printer.printer_id.clone(),
            local_file_path: params.local_file_path.clone(),
            total_bytes: total,
        })
    }

    fn download_url(&self, printer: &PrinterInfo, params: &GetDownloadUrlParams) -> String {
        let path = params.remote_file_path.trim_start_matches('/');
        format!("{}/server/files/gcodes/{}", self.endpoint(printer), path)
    }
}

fn map_upload_status(status: u16) -> SdkError {
    match status {
        401 | 403 => SdkError::new(ErrorCode::FileAccessDenied, "printer rejected upload auth"),
        other => SdkError::new(
            ErrorCode::FileTransferFailed,
            format!("upload failed with status {}", other),
        ),
    }
}

/// The 8 KB chunked reader behind the streaming multipart body.
mod bytes_stream_support {
    use super::{CancelToken, FileUploadProgressData, UploadProgressCallback};
    use futures_util::Stream;
    use tokio::io::AsyncReadExt;

    const CHUNK_SIZE: usize = 8192;

    pub fn chunked_file_stream(
        file: tokio::fs::File,
        total_size: u64,
        printer_id: String,
        file_name: String,
        progress: UploadProgressCallback,
        cancel: CancelToken,
    ) -> impl Stream<Item = std::io::Result<Vec<u8>>> + Send {
        futures_util::stream::unfold(
            (file, 0u64, printer_id, file_name, progress, cancel),
            move |(mut file, mut sent, printer_id, file_name, progress, cancel)| async move {
                if cancel.is_cancelled() {
                    return Some((
                        Err(std::io::Error::new(std::io::ErrorKind::Other, "upload cancelled")),
                        (file, sent, printer_id, file_name, progress, cancel),
                    ));
                }

                let mut buffer = vec![0u8; CHUNK_SIZE];
                match file.read(&mut buffer).await {
                    Ok(0) => None,
                    Ok(read) => {
                        buffer.truncate(read);
                        sent += read as u64;

                        // Hold 100 back for the final acknowledgement.
                        let percent = ((sent * 100 / total_size.max(1)) as u8).min(99);
                        let update = FileUploadProgressData {
                            printer_id: printer_id.clone(),
                            file_name: file_name.clone(),
                            progress: percent,
                        };
                        if !progress(&update) {
                            cancel.cancel();
                            return Some((
                                Err(std::io::Error::new(std::io::ErrorKind::Other, "upload cancelled by progress callback")),
                                (file, sent, printer_id, file_name, progress, cancel),
                            ));
                        }
                        Some((Ok(buffer), (file, sent, printer_id, file_name, progress, cancel)))
                    }
                    Err(err) => Some((Err(err), (file, sent, printer_id, file_name, progress, cancel))),
                }
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuthMode;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    fn test_printer() -> PrinterInfo {
        PrinterInfo {
            printer_id: "lan_voron-01".to_string(),
            serial_number: "voron-01".to_string(),
            printer_type: PrinterType::GenericFdmKlipper,
            brand: "Generic".to_string(),
            name: "voron-01".to_string(),
            model: "Klipper".to_string(),
            host: "192.168.1.60".to_string(),
            web_url: None,
            auth_mode: AuthMode::None,
            mainboard_id: None,
        }
    }

    #[test]
    fn download_url_uses_gcodes_root() {
        let transfer = MoonrakerHttpTransfer::new();
        let url = transfer.download_url(
            &test_printer(),
            &GetDownloadUrlParams {
                printer_id: "lan_voron-01".to_string(),
                remote_file_path: "/benchy.gcode".to_string(),
            },
        );
        assert_eq!(url, "http://192.168.1.60:7125/server/files/gcodes/benchy.gcode");
    }

    #[test]
    fn endpoint_respects_explicit_port() {
        let transfer = MoonrakerHttpTransfer::new();
        let mut printer = test_printer();
        printer.host = "192.168.1.60:7126".to_string();
        assert_eq!(transfer.endpoint(&printer), "http://192.168.1.60:7126");
    }

    #[tokio::test]
    async fn chunked_stream_reports_progress_and_honours_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("large.gcode");
        tokio::fs::write(&path, vec![0u8; 40 * 1024]).await.unwrap();

        let last_percent = Arc::new(AtomicU8::new(0));
        let seen = last_percent.clone();
        let progress: UploadProgressCallback = Arc::new(move |update| {
            seen.store(update.progress, Ordering::SeqCst);
            true
        });

        let file = tokio::fs::File::open(&path).await.unwrap();
        let stream = bytes_stream_support::chunked_file_stream(
            file,
            40 * 1024,
            "lan_voron-01".to_string(),
            "large.gcode".to_string(),
            progress,
            CancelToken::new(),
        );
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 5); // 40 KB in 8 KB chunks
        assert!(chunks.iter().all(|c| c.is_ok()));
        assert_eq!(last_percent.load(Ordering::SeqCst), 99);

        // A cancelling callback aborts the stream mid-flight.
        let progress: UploadProgressCallback = Arc::new(|update| update.progress < 40);
        let file = tokio::fs::File::open(&path).await.unwrap();
        let cancel = CancelToken::new();
        let stream = bytes_stream_support::chunked_file_stream(
            file,
            40 * 1024,
            "lan_voron-01".to_string(),
            "large.gcode".to_string(),
            progress,
            cancel.clone(),
        );
        let chunks: Vec<_> = stream.collect().await;
        assert!(chunks.last().unwrap().is_err());
        assert!(cancel.is_cancelled());
    }
}
