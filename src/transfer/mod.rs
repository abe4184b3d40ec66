pub mod elegoo_ccs;
pub mod moonraker;

use crate::errors::{ErrorCode, Result, SdkError};
use crate::types::{
    FileDownloadData, FileDownloadParams, FileUploadData, FileUploadParams, FileUploadProgressData,
    GetDownloadUrlParams, PrinterInfo, PrinterType,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Returning false from a progress callback requests cancellation.
pub type UploadProgressCallback = Arc<dyn Fn(&FileUploadProgressData) -> bool + Send + Sync>;
pub type DownloadProgressCallback = Arc<dyn Fn(u64, u64) -> bool + Send + Sync>;

/// Per-operation cancellation latch. Each upload/download gets its own
/// token, so concurrent transfers to distinct printers never cross-cancel.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// One transfer strategy per printer family.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Opaque key/value auth material ("accessCode", "token", ...).
    fn set_auth_credentials(&self, credentials: HashMap<String, String>);

    fn supported_printer_types(&self) -> Vec<PrinterType>;
    fn transfer_info(&self) -> &'static str;

    /// Upload a local file; the strategy polls the cancel token between
    /// chunks and reports progress 0-100 (100 exactly once, on success).
    async fn upload_file(
        &self,
        printer: &PrinterInfo,
        params: &FileUploadParams,
        progress: UploadProgressCallback,
        cancel: CancelToken,
    ) -> Result<FileUploadData>;

    /// Download to a local file; a partial file is deleted on failure.
    async fn download_file(
        &self,
        printer: &PrinterInfo,
        params: &FileDownloadParams,
        progress: DownloadProgressCallback,
        cancel: CancelToken,
    ) -> Result<FileDownloadData>;

    fn download_url(&self, printer: &PrinterInfo, params: &GetDownloadUrlParams) -> String;
}

/// Credential map shared by the strategies.
#[derive(Default)]
pub(crate) struct AuthCredentials {
    values: Mutex<HashMap<String, String>>,
}

impl AuthCredentials {
    pub fn replace(&self, credentials: HashMap<String, String>) {
        *self.values.lock().unwrap() = credentials;
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }
}

/// File name to present to the printer: explicit override or the local
/// file's name.
pub(crate) fn resolve_file_name(params: &FileUploadParams) -> Result<String> {
    if let Some(name) = params.file_name.as_deref().filter(|n| !n.is_empty()) {
        return Ok(name.to_string());
    }
    Path::new(&params.local_file_path)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| SdkError::invalid_parameter("cannot derive file name from local path"))
}

/// HEAD for the content length, then stream the body to a local file with
/// progress and cancellation; the partial file is removed on any failure.
pub(crate) async fn stream_download(
    client: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    local_path: &str,
    progress: DownloadProgressCallback,
    cancel: CancelToken,
) -> Result<u64> {
    let mut head = client.head(url);
    for (name, value) in headers {
        head = head.header(name.as_str(), value.as_str());
    }
    let total = match head.send().await {
        Ok(response) if response.status().is_success() => response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0),
        Ok(response) => {
            debug!("HEAD {} returned {}", url, response.status());
            0
        }
        Err(err) => {
            warn!("HEAD {} failed: {}", url, err);
            0
        }
    };

    let result = async {
        let mut get = client.get(url);
        for (name, value) in headers {
            get = get.header(name.as_str(), value.as_str());
        }
        let response = get.send().await.map_err(|e| {
            SdkError::new(ErrorCode::FileTransferFailed, format!("download failed: {}", e))
        })?;
        if response.status().as_u16() == 404 {
            return Err(SdkError::new(ErrorCode::FileNotFound, "remote file not found"));
        }
        if !response.status().is_success() {
            return Err(SdkError::new(
                ErrorCode::FileTransferFailed,
                format!("download failed with status {}", response.status()),
            ));
        }

        let mut file = tokio::fs::File::create(local_path).await?;
        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(SdkError::cancelled("download cancelled"));
            }
            let chunk = chunk.map_err(|e| {
                SdkError::new(ErrorCode::FileTransferFailed, format!("download stream error: {}", e))
            })?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if !progress(received, total.max(received)) {
                cancel.cancel();
                return Err(SdkError::cancelled("download cancelled by progress callback"));
            }
        }
        file.flush().await?;
        Ok(received)
    }
    .await;

    if result.is_err() {
        if let Err(err) = tokio::fs::remove_file(local_path).await {
            debug!("failed to remove partial download {}: {}", local_path, err);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_tokens_are_independent() {
        let a = CancelToken::new();
        let b = CancelToken::new();
        a.cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());

        let a2 = a.clone();
        assert!(a2.is_cancelled());
    }

    #[test]
    fn file_name_falls_back_to_local_path() {
        let params = FileUploadParams {
            printer_id: "lan_x".into(),
            local_file_path: "/tmp/models/benchy.gcode".into(),
            file_name: None,
        };
        assert_eq!(resolve_file_name(&params).unwrap(), "benchy.gcode");

        let params = FileUploadParams {
            printer_id: "lan_x".into(),
            local_file_path: "/tmp/models/benchy.gcode".into(),
            file_name: Some("renamed.gcode".into()),
        };
        assert_eq!(resolve_file_name(&params).unwrap(), "renamed.gcode");
    }
}
