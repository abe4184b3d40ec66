use crate::config::CloudConfig;
use crate::errors::{ErrorCode, Result, SdkError};
use crate::transfer::CancelToken;
use serde_json::Value;
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Progress callback for binary uploads; return false to cancel.
pub type PutProgressCallback = std::sync::Arc<dyn Fn(u64, u64) -> bool + Send + Sync>;

/// HTTP client for the vendor cloud. Plain-HTTP base URLs are rewritten to
/// HTTPS; the trust anchor comes from the configured CA bundle when one is
/// given, otherwise from the default root store.
pub struct CloudHttpClient {
    client: reqwest::Client,
    base_url: RwLock<String>,
    bearer: RwLock<Option<String>>,
}

impl CloudHttpClient {
    pub fn new(config: &CloudConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(config.user_agent.clone());

        if !config.ca_cert_path.is_empty() {
            match std::fs::read(&config.ca_cert_path) {
                Ok(pem) => match reqwest::Certificate::from_pem(&pem) {
                    Ok(certificate) => {
                        info!("using CA bundle from {}", config.ca_cert_path);
                        builder = builder.add_root_certificate(certificate);
                    }
                    Err(err) => {
                        warn!("invalid CA bundle {}: {}", config.ca_cert_path, err);
                    }
                },
                Err(err) => {
                    warn!("cannot read CA bundle {}: {}", config.ca_cert_path, err);
                }
            }
        } else {
            debug!("no CA bundle configured, using default roots");
        }

        let client = builder
            .build()
            .map_err(|e| SdkError::network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: RwLock::new(enforce_https(&config.api_base_url())),
            bearer: RwLock::new(None),
        })
    }

    pub fn set_base_url(&self, base_url: &str) {
        *self.base_url.write().unwrap() = enforce_https(base_url.trim_end_matches('/'));
    }

    pub fn set_bearer_token(&self, token: Option<String>) {
        *self.bearer.write().unwrap() = token;
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.read().unwrap(), path)
    }

    fn authorized(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = self.bearer.read().unwrap().clone() {
            request = request.bearer_auth(token);
        }
        request
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        let request = self.authorized(self.client.get(self.url(path)));
        Self::unwrap_envelope(request.send().await).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let request = self.authorized(self.client.post(self.url(path))).json(body);
        Self::unwrap_envelope(request.send().await).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<Value> {
        let request = self.authorized(self.client.put(self.url(path))).json(body);
        Self::unwrap_envelope(request.send().await).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        let request = self.authorized(self.client.delete(self.url(path)));
        Self::unwrap_envelope(request.send().await).await
    }

    /// Streaming binary PUT to an absolute URL (typically a pre-signed
    /// storage target) with progress and cancellation.
    pub async fn put_binary(
        &self,
        url: &str,
        local_file_path: &str,
        progress: PutProgressCallback,
        cancel: CancelToken,
    ) -> Result<()> {
        let total = tokio::fs::metadata(local_file_path).await?.len();
        let file = tokio::fs::File::open(local_file_path).await?;

        let cancel_for_stream = cancel.clone();
        let stream = futures_util::stream::unfold(
            (file, 0u64, progress.clone(), cancel_for_stream),
            move |(mut file, mut sent, progress, cancel)| async move {
                if cancel.is_cancelled() {
                    return Some((
                        Err(std::io::Error::new(std::io::ErrorKind::Other, "upload cancelled")),
                        (file, sent, progress, cancel),
                    ));
                }
                let mut buffer = vec![0u8; UPLOAD_CHUNK_SIZE];
                match file.read(&mut buffer).await {
                    Ok(0) => None,
                    Ok(read) => {
                        buffer.truncate(read);
                        sent += read as u64;
                        if !progress(sent, total) {
                            cancel.cancel();
                            return Some((
                                Err(std::io::Error::new(
                                    std::io::ErrorKind::Other,
                                    "upload cancelled by progress callback",
                                )),
                                (file, sent, progress, cancel),
                            ));
                        }
                        Some((Ok(buffer), (file, sent, progress, cancel)))
                    }
                    Err(err) => Some((Err(err), (file, sent, progress, cancel))),
                }
            },
        );

        // The client-wide timeout is sized for API calls; a binary upload
        // runs as long as the file needs.
        let request = self
            .client
            .put(enforce_https(url))
            .timeout(Duration::from_secs(3600))
            .header(reqwest::header::CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(stream));

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                if cancel.is_cancelled() {
                    return Err(SdkError::cancelled("upload cancelled"));
                }
                return Err(SdkError::new(
                    ErrorCode::FileTransferFailed,
                    format!("binary upload failed: {}", err),
                ));
            }
        };
        if !response.status().is_success() {
            return Err(SdkError::new(
                ErrorCode::FileTransferFailed,
                format!("binary upload failed with status {}", response.status()),
            ));
        }
        Ok(())
    }

    /// Map transport + HTTP + envelope layers into the server error space
    /// and return the envelope's `data`.
    async fn unwrap_envelope(
        response: std::result::Result<reqwest::Response, reqwest::Error>,
    ) -> Result<Value> {
        let response = response.map_err(|e| {
            if e.is_timeout() {
                SdkError::timeout(format!("cloud request timed out: {}", e))
            } else {
                SdkError::network(format!("cloud request failed: {}", e))
            }
        })?;

        match response.status().as_u16() {
            401 => {
                return Err(SdkError::new(ErrorCode::ServerUnauthorized, "unauthorized"));
            }
            403 => {
                return Err(SdkError::new(ErrorCode::ServerForbidden, "forbidden"));
            }
            429 => {
                return Err(SdkError::new(
                    ErrorCode::ServerTooManyRequests,
                    "too many requests",
                ));
            }
            status if !(200..300).contains(&status) => {
                let body = response.text().await.unwrap_or_default();
                return Err(SdkError::new(
                    ErrorCode::ServerUnknownError,
                    format!("server returned status {}: {}", status, body),
                ));
            }
            _ => {}
        }

        let envelope: Value = response.json().await.map_err(|e| {
            SdkError::new(
                ErrorCode::ServerInvalidResponse,
                format!("malformed server response: {}", e),
            )
        })?;

        let code = envelope.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            let message = envelope
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("server error");
            return Err(SdkError::new(
                ErrorCode::ServerUnknownError,
                format!("server error {}: {}", code, message),
            ));
        }
        Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
    }
}

/// The cloud is HTTPS-only; plain HTTP inputs are rewritten with a warning.
/// Loopback endpoints are exempt so local development gateways keep
/// working.
fn enforce_https(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("http://") {
        // Split the authority off first; a bracketed IPv6 host carries
        // colons, so the port is only stripped outside the brackets.
        let authority = rest.split('/').next().unwrap_or("");
        let host = if let Some(bracketed_end) = authority.find(']') {
            &authority[..=bracketed_end]
        } else {
            authority.split(':').next().unwrap_or("")
        };
        if host == "localhost" || host == "127.0.0.1" || host == "[::1]" {
            return url.to_string();
        }
        warn!("rewriting insecure cloud URL to https: {}", url);
        return format!("https://{}", rest);
    }
    url.to_string()
}
