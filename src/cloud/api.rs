use super::credentials::{AgoraCredential, HttpCredential, MqttCredential};
use super::http::CloudHttpClient;
use crate::errors::{ErrorCode, Result, SdkError};
use crate::types::{AuthMode, PrinterInfo, PrinterType};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Typed REST endpoints of the vendor cloud. Thin wrappers over the HTTP
/// client; every call returns the envelope's `data` mapped into its typed
/// shape.
pub struct CloudApi {
    http: Arc<CloudHttpClient>,
}

impl CloudApi {
    pub fn new(http: Arc<CloudHttpClient>) -> Self {
        Self { http }
    }

    pub async fn refresh_credential(&self, refresh_token: &str) -> Result<HttpCredential> {
        let data = self
            .http
            .post("/api/v1/user/refresh", &json!({ "refreshToken": refresh_token }))
            .await?;
        serde_json::from_value(data).map_err(|e| {
            SdkError::new(ErrorCode::ServerInvalidResponse, format!("bad credential payload: {}", e))
        })
    }

    pub async fn get_user_info(&self) -> Result<Value> {
        self.http.get("/api/v1/user/info").await
    }

    pub async fn logout(&self) -> Result<()> {
        self.http.post("/api/v1/user/logout", &json!({})).await.map(|_| ())
    }

    /// Remote printers bound to this account, already shaped as
    /// `cloud_`-prefixed `PrinterInfo`.
    pub async fn get_printers(&self) -> Result<Vec<PrinterInfo>> {
        let data = self.http.get("/api/v1/printer/list").await?;
        let rows = data
            .get("printers")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut printers = Vec::with_capacity(rows.len());
        for row in rows {
            let serial = row
                .get("serialNumber")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if serial.is_empty() {
                debug!("skipping printer row without serial number");
                continue;
            }
            let printer_type = row
                .get("printerType")
                .cloned()
                .and_then(|v| serde_json::from_value::<PrinterType>(v).ok())
                .unwrap_or(PrinterType::ElegooFdmCc2);
            printers.push(PrinterInfo {
                printer_id: PrinterInfo::cloud_id(&serial),
                serial_number: serial,
                printer_type,
                brand: row
                    .get("brand")
                    .and_then(Value::as_str)
                    .unwrap_or("Elegoo")
                    .to_string(),
                name: row
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                model: row
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                host: String::new(),
                web_url: None,
                auth_mode: AuthMode::Token,
                mainboard_id: row
                    .get("mainboardId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
        Ok(printers)
    }

    pub async fn get_rtc_token(&self, serial_number: &str) -> Result<Value> {
        self.http
            .post("/api/v1/rtc/token", &json!({ "serialNumber": serial_number }))
            .await
    }

    pub async fn get_mqtt_credential(&self) -> Result<MqttCredential> {
        let data = self.http.get("/api/v1/mqtt/credential").await?;
        serde_json::from_value(data).map_err(|e| {
            SdkError::new(ErrorCode::ServerInvalidResponse, format!("bad mqtt credential: {}", e))
        })
    }

    pub async fn get_agora_credential(&self) -> Result<AgoraCredential> {
        let data = self.http.get("/api/v1/rtm/credential").await?;
        serde_json::from_value(data).map_err(|e| {
            SdkError::new(ErrorCode::ServerInvalidResponse, format!("bad rtm credential: {}", e))
        })
    }

    pub async fn bind_printer(&self, serial_number: &str, name: &str) -> Result<()> {
        self.http
            .post(
                "/api/v1/printer/bind",
                &json!({ "serialNumber": serial_number, "name": name }),
            )
            .await
            .map(|_| ())
    }

    pub async fn unbind_printer(&self, serial_number: &str) -> Result<()> {
        self.http
            .post("/api/v1/printer/unbind", &json!({ "serialNumber": serial_number }))
            .await
            .map(|_| ())
    }

    pub async fn update_printer_name(&self, serial_number: &str, name: &str) -> Result<()> {
        self.http
            .post(
                "/api/v1/printer/updateName",
                &json!({ "serialNumber": serial_number, "name": name }),
            )
            .await
            .map(|_| ())
    }

    pub async fn get_license_expired_devices(&self) -> Result<Value> {
        self.http.get("/api/v1/license/expired").await
    }

    pub async fn renew_license(&self, serial_number: &str) -> Result<Value> {
        self.http
            .post("/api/v1/license/renew", &json!({ "serialNumber": serial_number }))
            .await
    }

    /// Pre-signed storage target for a cloud file upload: (PUT url, final
    /// file url handed to the printer).
    pub async fn get_upload_url(&self, file_name: &str) -> Result<(String, String)> {
        let data = self
            .http
            .post("/api/v1/storage/upload-url", &json!({ "fileName": file_name }))
            .await?;
        let upload_url = data
            .get("uploadUrl")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let file_url = data
            .get("fileUrl")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if upload_url.is_empty() || file_url.is_empty() {
            return Err(SdkError::new(
                ErrorCode::ServerInvalidResponse,
                "upload-url response missing urls",
            ));
        }
        Ok((upload_url, file_url))
    }
}
