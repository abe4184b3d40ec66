use super::{
    resolve_file_name, stream_download, AuthCredentials, CancelToken, DownloadProgressCallback,
    FileTransfer, UploadProgressCallback,
};
use crate::adapter::elegoo_cc2::host_of;
use crate::errors::{ErrorCode, Result, SdkError};
use crate::types::{
    mask, FileDownloadData, FileDownloadParams, FileUploadData, FileUploadParams,
    FileUploadProgressData, GetDownloadUrlParams, PrinterInfo, PrinterType,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// Chunk size of the CCS session upload protocol.
const CHUNK_SIZE: usize = 1024 * 1024;
const CCS_HTTP_PORT: u16 = 3030;

/// Chunked upload strategy shared by the Elegoo CC and CC2 families: one
/// session uuid per upload, whole-file MD5 fingerprint, 1 MB multipart
/// chunks against the printer's embedded HTTP server.
pub struct CcsHttpTransfer {
    client: reqwest::Client,
    credentials: AuthCredentials,
}

impl CcsHttpTransfer {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            credentials: AuthCredentials::default(),
        }
    }

    /// An explicit port in the printer host wins; otherwise the CCS server
    /// listens on its well-known port.
    fn endpoint(&self, printer: &PrinterInfo) -> Result<String> {
        let host = host_of(&printer.host)
            .ok_or_else(|| SdkError::invalid_parameter("printer host is empty"))?;
        let port = printer
            .host
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(CCS_HTTP_PORT);
        Ok(format!("http://{}:{}", host, port))
    }

    fn token_header(&self) -> Option<String> {
        self.credentials
            .get("accessCode")
            .or_else(|| self.credentials.get("token"))
            .or_else(|| self.credentials.get("password"))
    }

    /// Whole-file MD5, streamed in chunks so large files never sit in
    /// memory at once.
    async fn file_md5(path: &str) -> Result<(String, u64)> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut context = md5::Context::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut total: u64 = 0;
        loop {
            let read = read_full_chunk(&mut file, &mut buffer).await?;
            if read == 0 {
                break;
            }
            context.consume(&buffer[..read]);
            total += read as u64;
        }
        Ok((format!("{:x}", context.compute()), total))
    }

    async fn upload_chunk(
        &self,
        endpoint: &str,
        chunk: Vec<u8>,
        offset: u64,
        total_size: u64,
        file_md5: &str,
        session_uuid: &str,
        file_name: &str,
    ) -> Result<()> {
        let part = reqwest::multipart::Part::bytes(chunk).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("TotalSize", total_size.to_string())
            .text("Uuid", session_uuid.to_string())
            .text("Offset", offset.to_string())
            .text("Check", file_md5.to_string())
            .part("File", part);

        let mut request = self
            .client
            .post(format!("{}/uploadFile/upload", endpoint))
            .header("S-File-MD5", file_md5)
            .multipart(form);
        if let Some(token) = self.token_header() {
            request = request.header("X-Token", token);
        }

        let response = request.send().await.map_err(|e| {
            SdkError::new(ErrorCode::FileTransferFailed, format!("chunk upload failed: {}", e))
        })?;
        if !response.status().is_success() {
            return Err(SdkError::new(
                ErrorCode::FileTransferFailed,
                format!("chunk upload failed with status {}", response.status()),
            ));
        }
        let body: serde_json::Value = response.json().await.map_err(|e| {
            SdkError::new(ErrorCode::FileTransferFailed, format!("invalid chunk ack: {}", e))
        })?;
        let code = body.get("code").and_then(serde_json::Value::as_u64).unwrap_or(0);
        if code != 0 {
            return Err(SdkError::new(
                ErrorCode::FileTransferFailed,
                format!("printer rejected chunk at offset {} with code {}", offset, code),
            ));
        }
        Ok(())
    }
}

impl Default for CcsHttpTransfer {
    fn default() -> Self {
        Self::new()
    }
}

/// Fill the buffer completely unless EOF comes first; chunk boundaries
/// must be stable for the session protocol's offsets.
async fn read_full_chunk(file: &mut tokio::fs::File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

#[async_trait]
impl FileTransfer for CcsHttpTransfer {
    fn set_auth_credentials(&self, credentials: HashMap<String, String>) {
        self.credentials.replace(credentials);
    }

    fn supported_printer_types(&self) -> Vec<PrinterType> {
        vec![PrinterType::ElegooFdmCc, PrinterType::ElegooFdmCc2]
    }

    fn transfer_info(&self) -> &'static str {
        "ELEGOO_CCS_HTTP_TRANSFER"
    }

    async fn upload_file(
        &self,
        printer: &PrinterInfo,
        params: &FileUploadParams,
        progress: UploadProgressCallback,
        cancel: CancelToken,
    ) -> Result<FileUploadData> {
        let endpoint = self.endpoint(printer)?;
        let file_name = resolve_file_name(params)?;

        let (file_md5, total_size) = Self::file_md5(&params.local_file_path).await?;
        if total_size == 0 {
            return Err(SdkError::invalid_parameter("cannot upload an empty file"));
        }
        let session_uuid = uuid::Uuid::new_v4().to_string();

        info!(
            "uploading {} ({} bytes) to printer {}",
            file_name,
            total_size,
            mask(&printer.printer_id)
        );

        let mut file = tokio::fs::File::open(&params.local_file_path).await?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut offset: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(SdkError::cancelled("upload cancelled"));
            }
            let read = read_full_chunk(&mut file, &mut buffer).await?;
            if read == 0 {
                break;
            }

            self.upload_chunk(
                &endpoint,
                buffer[..read].to_vec(),
                offset,
                total_size,
                &file_md5,
                &session_uuid,
                &file_name,
            )
            .await?;
            offset += read as u64;

            // Hold 100 back until the whole file is acknowledged.
            let percent = ((offset * 100 / total_size) as u8).min(99);
            let update = FileUploadProgressData {
                printer_id: printer.printer_id.clone(),
                file_name: file_name.clone(),
                progress: percent,
            };
            if !progress(&update) {
                cancel.cancel();
                return Err(SdkError::cancelled("upload cancelled by progress callback"));
            }
        }

        let done = FileUploadProgressData {
            printer_id: printer.printer_id.clone(),
            file_name: file_name.clone(),
            progress: 100,
        };
        progress(&done);

        debug!("upload session {} completed", session_uuid);
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
        let headers: Vec<(String, String)> = self
            .token_header()
            .map(|token| vec![("X-Token".to_string(), token)])
            .unwrap_or_default();

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
        let endpoint = self
            .endpoint(printer)
            .unwrap_or_else(|_| format!("http://{}:{}", printer.host, CCS_HTTP_PORT));
        format!("{}/downloadFile?path={}", endpoint, params.remote_file_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuthMode;

    fn test_printer() -> PrinterInfo {
        PrinterInfo {
            printer_id: "lan_F01NZQQZJS2ASC8".to_string(),
            serial_number: "F01NZQQZJS2ASC8".to_string(),
            printer_type: PrinterType::ElegooFdmCc2,
            brand: "Elegoo".to_string(),
            name: "CC2".to_string(),
            model: "CC2".to_string(),
            host: "192.168.1.50".to_string(),
            web_url: None,
            auth_mode: AuthMode::AccessCode,
            mainboard_id: None,
        }
    }

    #[test]
    fn download_url_targets_the_embedded_server() {
        let transfer = CcsHttpTransfer::new();
        let url = transfer.download_url(
            &test_printer(),
            &GetDownloadUrlParams {
                printer_id: "lan_F01NZQQZJS2ASC8".to_string(),
                remote_file_path: "/local/benchy.gcode".to_string(),
            },
        );
        assert_eq!(
            url,
            "http://192.168.1.50:3030/downloadFile?path=/local/benchy.gcode"
        );
    }

    #[tokio::test]
    async fn file_md5_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let (digest, size) = CcsHttpTransfer::file_md5(path.to_str().unwrap()).await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn upload_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.gcode");
        tokio::fs::write(&path, b"").await.unwrap();

        let transfer = CcsHttpTransfer::new();
        let params = FileUploadParams {
            printer_id: "lan_F01NZQQZJS2ASC8".to_string(),
            local_file_path: path.to_str().unwrap().to_string(),
            file_name: None,
        };
        let err = transfer
            .upload_file(
                &test_printer(),
                &params,
                std::sync::Arc::new(|_| true),
                CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
    }
}
