use super::{
    generate_message_id, generate_request_id, timestamp_ms, Adapter, MessageKind, PendingTracker,
    PrinterEvent, PrinterRequest, PrinterResponse, SendCallback, StatusCache,
};
use crate::discovery::DiscoveryStrategy;
use crate::errors::{ErrorCode, Result, SdkError};
use crate::transport::mqtt::MqttHooks;
use crate::transport::HeartbeatConfig;
use crate::types::{mask, AuthMode, ConnectParams, Method, PrinterInfo, PrinterType};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Unsolicited report method codes pushed by the printer.
const REPORT_STATUS: u64 = 6000;
const REPORT_ATTRIBUTES: u64 = 6001;

static COMMAND_CODES: Lazy<Vec<(Method, u64)>> = Lazy::new(|| {
    vec![
        (Method::GetPrinterAttributes, 1000),
        (Method::GetPrinterStatus, 1001),
        (Method::UpdatePrinterName, 1002),
        (Method::StartPrint, 1100),
        (Method::PausePrint, 1101),
        (Method::ResumePrint, 1102),
        (Method::StopPrint, 1103),
        (Method::HomeAxes, 1200),
        (Method::MoveAxes, 1201),
        (Method::SetTemperature, 1202),
        (Method::SetPrintSpeed, 1203),
        (Method::SetFanSpeed, 1204),
        (Method::SetPrinterDownloadFile, 1300),
        (Method::CancelPrinterDownloadFile, 1301),
        (Method::GetPrintTaskList, 1400),
        (Method::DeletePrintTasks, 1401),
        (Method::GetFileList, 1402),
        (Method::GetFileDetail, 1403),
        (Method::GetCanvasStatus, 1500),
        (Method::SetAutoRefill, 1501),
    ]
});

fn command_code(method: Method) -> Option<u64> {
    COMMAND_CODES.iter().find(|(m, _)| *m == method).map(|(_, c)| *c)
}

/// Message adapter for the Elegoo CC2 family. The wire dialect is a JSON
/// envelope with numeric method codes; status arrives as full snapshots or
/// deltas that merge into the cached view.
pub struct Cc2Adapter {
    info: Mutex<PrinterInfo>,
    tracker: PendingTracker,
    cache: StatusCache,
    send_callback: Mutex<Option<SendCallback>>,
}

impl Cc2Adapter {
    pub fn new(info: PrinterInfo) -> Self {
        Self {
            info: Mutex::new(info),
            tracker: PendingTracker::new(),
            cache: StatusCache::new(),
            send_callback: Mutex::new(None),
        }
    }

    fn printer_id(&self) -> String {
        self.info.lock().unwrap().printer_id.clone()
    }

    /// Merge a status report into the cache and build the event payload.
    /// Reports flagged `"full": true` (and the first report seen) replace
    /// the cache; everything else merges as a delta.
    fn absorb_status_report(&self, result: &Value) -> Value {
        let is_full = result
            .get("full")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let merged = if is_full || !self.cache.has_full() {
            self.cache.apply_full(result)
        } else {
            self.cache.apply_delta(result)
        };

        if let Some(seq) = result.get("seq").and_then(Value::as_i64) {
            if self.cache.track_sequence(seq) {
                warn!(
                    "status sequence gaps for printer {}, requesting full refresh",
                    mask(&self.printer_id())
                );
                self.send_to_printer(Method::GetPrinterStatus, json!({}));
            }
        }
        merged
    }
}

impl Adapter for Cc2Adapter {
    fn convert_request(&self, method: Method, params: &Value, timeout: Duration) -> PrinterRequest {
        let Some(code) = command_code(method) else {
            return PrinterRequest::error(
                method,
                ErrorCode::OperationNotImplemented,
                format!("method {:?} is not supported by this printer", method),
            );
        };

        let request_id = generate_request_id();
        let payload = json!({
            "id": request_id,
            "method": code,
            "params": params,
            "timestamp": timestamp_ms(),
        });

        self.tracker
            .record(generate_message_id(), request_id.clone(), method, timeout);
        PrinterRequest::ok(request_id, method, payload.to_string())
    }

    fn convert_to_response(&self, wire: &str) -> PrinterResponse {
        let Ok(parsed) = serde_json::from_str::<Value>(wire) else {
            return PrinterResponse::invalid("not a JSON payload");
        };
        let request_id = match parsed.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return PrinterResponse::invalid("missing response id"),
        };
        let Some(record) = self.tracker.remove(&request_id) else {
            return PrinterResponse::invalid("No request mapping found");
        };

        let error_code = parsed
            .get("error_code")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if error_code != 0 {
            return PrinterResponse {
                request_id,
                method: record.method,
                code: ErrorCode::PrinterCommandFailed,
                message: format!("printer reported error {}", error_code),
                data: None,
            };
        }

        let mut data = parsed.get("result").cloned().unwrap_or(json!({}));
        if record.method == Method::GetPrinterStatus {
            // A direct status query returns a full document; keep the cache
            // in sync and hand back the merged view.
            data = self.cache.apply_full(&data);
        }

        PrinterResponse {
            request_id,
            method: record.method,
            code: ErrorCode::Success,
            message: "ok".to_string(),
            data: Some(data),
        }
    }

    fn convert_to_event(&self, wire: &str) -> PrinterEvent {
        let Ok(parsed) = serde_json::from_str::<Value>(wire) else {
            return PrinterEvent::none();
        };
        let Some(result) = parsed.get("result") else {
            return PrinterEvent::none();
        };
        match parsed.get("method").and_then(Value::as_u64) {
            Some(REPORT_STATUS) => {
                let merged = self.absorb_status_report(result);
                PrinterEvent::new(
                    Method::OnPrinterStatus,
                    json!({ "printerId": self.printer_id(), "printerStatus": merged }),
                )
            }
            Some(REPORT_ATTRIBUTES) => PrinterEvent::new(
                Method::OnPrinterAttributes,
                json!({ "printerId": self.printer_id(), "printerAttributes": result }),
            ),
            _ => PrinterEvent::none(),
        }
    }

    fn parse_message_kinds(&self, wire: &str) -> Vec<MessageKind> {
        let Ok(parsed) = serde_json::from_str::<Value>(wire) else {
            return Vec::new();
        };
        let mut kinds = Vec::new();

        let has_pending_id = match parsed.get("id") {
            Some(Value::String(id)) => self.tracker.find(id).is_some(),
            Some(Value::Number(id)) => self.tracker.find(&id.to_string()).is_some(),
            _ => false,
        };
        if has_pending_id {
            kinds.push(MessageKind::Response);
        }
        if matches!(
            parsed.get("method").and_then(Value::as_u64),
            Some(REPORT_STATUS) | Some(REPORT_ATTRIBUTES)
        ) {
            kinds.push(MessageKind::Event);
        }
        kinds
    }

    fn supported_printer_types(&self) -> Vec<PrinterType> {
        vec![PrinterType::ElegooFdmCc2]
    }

    fn adapter_info(&self) -> &'static str {
        "ELEGOO_FDM_CC2_ADAPTER"
    }

    fn printer_info(&self) -> PrinterInfo {
        self.info.lock().unwrap().clone()
    }

    fn cached_full_status(&self) -> Value {
        self.cache.snapshot()
    }

    fn clear_status_cache(&self) {
        self.cache.clear();
    }

    fn set_send_callback(&self, callback: SendCallback) {
        *self.send_callback.lock().unwrap() = Some(callback);
    }

    fn send_to_printer(&self, method: Method, params: Value) {
        let callback = self.send_callback.lock().unwrap().clone();
        let Some(callback) = callback else {
            warn!(
                "message send callback not set, cannot reach printer {}",
                mask(&self.printer_id())
            );
            return;
        };
        let request = self.convert_request(method, &params, Duration::from_millis(1000));
        if request.is_valid() {
            callback(request);
        } else {
            error!("failed to convert unsolicited {:?} request: {}", method, request.message);
        }
    }

    fn expire_stale_requests(&self) {
        self.tracker.expire_stale();
    }
}

// ---------------------------------------------------------------------------
// MQTT hooks
// ---------------------------------------------------------------------------

const CC2_DEFAULT_CODE: &str = "123456";

/// Transport customization for CC2 printers: broker on port 1883, `elegoo`
/// username, a registration handshake and a JSON PING/PONG heartbeat.
pub struct Cc2MqttHooks {
    client_id: String,
    request_id: String,
    serial: Mutex<String>,
    probe: reqwest::Client,
}

impl Cc2MqttHooks {
    pub fn new() -> Self {
        let client_id = format!("1_PC_{}", rand::thread_rng().gen_range(1000..=9999));
        let request_id = format!("{}_req", client_id);
        Self {
            client_id,
            request_id,
            serial: Mutex::new(String::new()),
            probe: reqwest::Client::new(),
        }
    }

    fn serial_number(&self, params: &ConnectParams) -> String {
        let cached = self.serial.lock().unwrap().clone();
        if !cached.is_empty() {
            return cached;
        }
        params.serial_number.clone().unwrap_or_default()
    }

    fn access_code(params: &ConnectParams) -> String {
        let supplied = match params.auth_mode {
            AuthMode::Basic => params.password.clone(),
            AuthMode::Token => params.token.clone(),
            AuthMode::AccessCode => params.access_code.clone(),
            AuthMode::PinCode => params.pin_code.clone(),
            AuthMode::None => None,
        };
        supplied
            .filter(|code| !code.is_empty())
            .unwrap_or_else(|| CC2_DEFAULT_CODE.to_string())
    }

    /// Discover the serial number through the printer's info endpoint when
    /// the caller did not supply one.
    async fn fetch_serial_number(&self, params: &ConnectParams) -> Result<String> {
        let timeout = if params.connection_timeout >= 1000 {
            Duration::from_millis(params.connection_timeout)
        } else {
            Duration::from_secs(5)
        };
        let code = Self::access_code(params);
        let url = format!("{}/system/info?X-Token={}", http_endpoint(&params.host), code);

        let response = self
            .probe
            .get(&url)
            .header("X-Token", &code)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                SdkError::network(format!("failed to query printer info endpoint: {}", e))
            })?;

        match response.status().as_u16() {
            200 => {}
            401 => {
                return Err(SdkError::new(
                    ErrorCode::InvalidAccessCode,
                    "Unauthorized access when retrieving printer info",
                ))
            }
            status => {
                return Err(SdkError::network(format!(
                    "printer info endpoint returned status {}",
                    status
                )))
            }
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SdkError::new(ErrorCode::PrinterInvalidResponse, e.to_string()))?;
        if let Some(error_code) = body.get("error_code").and_then(Value::as_u64) {
            if error_code != 0 {
                return Err(SdkError::new(
                    ErrorCode::PrinterUnknownError,
                    format!("printer info endpoint reported error {}", error_code),
                ));
            }
        }
        let serial = body
            .get("system_info")
            .and_then(|info| info.get("sn"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if serial.is_empty() {
            return Err(SdkError::new(
                ErrorCode::PrinterUnknownError,
                "serial number missing from printer info response",
            ));
        }
        info!("retrieved printer serial number {}", mask(&serial));
        Ok(serial)
    }
}

impl Default for Cc2MqttHooks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MqttHooks for Cc2MqttHooks {
    fn broker_address(&self, params: &ConnectParams) -> Option<(String, u16)> {
        host_of(&params.host).map(|host| (host, 1883))
    }

    fn client_id(&self, _params: &ConnectParams) -> String {
        self.client_id.clone()
    }

    async fn validate_connection_params(&self, params: &ConnectParams) -> Result<()> {
        if params.host.is_empty() {
            return Err(SdkError::invalid_parameter("Host is required"));
        }
        if params.printer_type.is_some() && params.printer_type != Some(PrinterType::ElegooFdmCc2) {
            return Err(SdkError::invalid_parameter("Unsupported printer type"));
        }

        let supplied = params.serial_number.clone().unwrap_or_default();
        if supplied.is_empty() {
            warn!("serial number missing, fetching it from the printer");
            let serial = self.fetch_serial_number(params).await?;
            *self.serial.lock().unwrap() = serial;
        } else {
            *self.serial.lock().unwrap() = supplied;
        }
        Ok(())
    }

    fn credentials(&self, params: &ConnectParams) -> Option<(String, String)> {
        let username = match params.auth_mode {
            AuthMode::Basic => params
                .username
                .clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "elegoo".to_string()),
            _ => "elegoo".to_string(),
        };
        Some((username, Self::access_code(params)))
    }

    fn subscription_topics(&self, params: &ConnectParams) -> Vec<String> {
        let sn = self.serial_number(params);
        vec![
            format!("elegoo/{}/{}/api_response", sn, self.client_id),
            format!("elegoo/{}/api_status", sn),
            format!("elegoo/{}/{}/register_response", sn, self.request_id),
        ]
    }

    fn command_topic(&self, params: &ConnectParams) -> String {
        let sn = self.serial_number(params);
        format!("elegoo/{}/{}/api_request", sn, self.client_id)
    }

    fn requires_registration(&self) -> bool {
        true
    }

    fn registration_request(
        &self,
        params: &ConnectParams,
        client_id: &str,
    ) -> Option<(String, String)> {
        let sn = self.serial_number(params);
        let topic = format!("elegoo/{}/api_register", sn);
        let payload = json!({
            "client_id": client_id,
            "request_id": self.request_id,
        });
        Some((topic, payload.to_string()))
    }

    fn is_registration_message(&self, topic: &str, _payload: &str) -> bool {
        topic.ends_with(&format!("/{}/register_response", self.request_id))
    }

    fn validate_registration_response(
        &self,
        _topic: &str,
        payload: &str,
        client_id: &str,
    ) -> Result<()> {
        let parsed: Value = serde_json::from_str(payload)
            .map_err(|e| SdkError::new(ErrorCode::PrinterConnectionError, e.to_string()))?;
        let response_client = parsed.get("client_id").and_then(Value::as_str).unwrap_or("");
        if response_client != client_id {
            return Err(SdkError::new(
                ErrorCode::PrinterConnectionError,
                "Client ID mismatch",
            ));
        }
        let error = parsed.get("error").and_then(Value::as_str).unwrap_or("fail");
        if error == "ok" {
            debug!("printer registration accepted for {}", client_id);
            return Ok(());
        }
        if error.contains("too many clients") {
            return Err(SdkError::new(
                ErrorCode::PrinterConnectionLimitExceeded,
                "Connection limit exceeded",
            ));
        }
        Err(SdkError::new(ErrorCode::PrinterConnectionError, error.to_string()))
    }

    fn registration_timeout(&self) -> Duration {
        Duration::from_millis(3000)
    }

    fn heartbeat(&self) -> Option<HeartbeatConfig> {
        Some(HeartbeatConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(65),
        })
    }

    fn heartbeat_message(&self) -> String {
        json!({"type": "PING"}).to_string()
    }

    fn is_heartbeat_response(&self, payload: &str) -> bool {
        serde_json::from_str::<Value>(payload)
            .map(|v| v.get("type").and_then(Value::as_str) == Some("PONG"))
            .unwrap_or(false)
    }
}

/// Bare host portion of a user-supplied host or URI.
pub(crate) fn host_of(host: &str) -> Option<String> {
    if host.is_empty() {
        return None;
    }
    if host.contains("://") {
        return url::Url::parse(host)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
    }
    host.split(':').next().map(str::to_string)
}

/// Base URL of the printer's embedded HTTP server.
pub(crate) fn http_endpoint(host: &str) -> String {
    if host.contains("://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", host)
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

pub struct Cc2DiscoveryStrategy;

impl DiscoveryStrategy for Cc2DiscoveryStrategy {
    fn probe(&self) -> String {
        "M66666".to_string()
    }

    fn default_port(&self) -> u16 {
        52700
    }

    fn brand(&self) -> &'static str {
        "Elegoo"
    }

    fn supported_auth_mode(&self) -> AuthMode {
        AuthMode::AccessCode
    }

    fn parse_response(
        &self,
        payload: &str,
        sender_ip: &str,
        _sender_port: u16,
    ) -> Option<PrinterInfo> {
        let parsed: Value = serde_json::from_str(payload).ok()?;
        if parsed.get("service").and_then(Value::as_str) != Some("elegoo_cc2") {
            return None;
        }
        let serial = parsed.get("sn").and_then(Value::as_str)?.to_string();
        if serial.is_empty() {
            return None;
        }
        let name = parsed
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("Elegoo Printer")
            .to_string();
        let model = parsed
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let web_port = parsed.get("web_port").and_then(Value::as_u64).unwrap_or(80);

        Some(PrinterInfo {
            printer_id: PrinterInfo::lan_id(&serial),
            serial_number: serial,
            printer_type: PrinterType::ElegooFdmCc2,
            brand: self.brand().to_string(),
            name,
            model,
            host: sender_ip.to_string(),
            web_url: Some(format!("http://{}:{}", sender_ip, web_port)),
            auth_mode: self.supported_auth_mode(),
            mainboard_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_info() -> PrinterInfo {
        PrinterInfo {
            printer_id: "lan_F01NZQQZJS2ASC8".to_string(),
            serial_number: "F01NZQQZJS2ASC8".to_string(),
            printer_type: PrinterType::ElegooFdmCc2,
            brand: "Elegoo".to_string(),
            name: "Centauri Carbon 2".to_string(),
            model: "CC2".to_string(),
            host: "192.168.1.50".to_string(),
            web_url: None,
            auth_mode: AuthMode::AccessCode,
            mainboard_id: None,
        }
    }

    #[test]
    fn request_response_round_trip_correlates_by_id() {
        let adapter = Cc2Adapter::new(test_info());
        let request = adapter.convert_request(
            Method::StartPrint,
            &json!({"fileName": "benchy.gcode"}),
            Duration::from_secs(10),
        );
        assert!(request.is_valid());

        let reply = json!({
            "id": request.request_id,
            "method": 1100,
            "result": {"ack": 0},
            "error_code": 0,
        })
        .to_string();
        assert_eq!(adapter.parse_message_kinds(&reply), vec![MessageKind::Response]);

        let response = adapter.convert_to_response(&reply);
        assert!(response.is_valid());
        assert_eq!(response.request_id, request.request_id);
        assert_eq!(response.method, Method::StartPrint);
        assert_eq!(response.code, ErrorCode::Success);
    }

    #[test]
    fn unmatched_response_is_noise() {
        let adapter = Cc2Adapter::new(test_info());
        let response = adapter.convert_to_response(
            &json!({"id": "54321", "method": 1100, "error_code": 0}).to_string(),
        );
        assert!(!response.is_valid());
        assert!(response.message.contains("No request mapping found"));
    }

    #[test]
    fn printer_error_code_maps_to_command_failed() {
        let adapter = Cc2Adapter::new(test_info());
        let request =
            adapter.convert_request(Method::PausePrint, &json!({}), Duration::from_secs(5));
        let response = adapter.convert_to_response(
            &json!({"id": request.request_id, "method": 1101, "error_code": 7}).to_string(),
        );
        assert!(response.is_valid());
        assert_eq!(response.code, ErrorCode::PrinterCommandFailed);
    }

    #[test]
    fn status_report_merges_into_cache() {
        let adapter = Cc2Adapter::new(test_info());
        let full = json!({
            "id": 0, "method": 6000,
            "result": {"full": true, "machine_status": {"status": 1}, "temps": {"nozzle": 210}},
        });
        let event = adapter.convert_to_event(&full.to_string());
        assert!(event.is_valid());
        assert_eq!(event.method, Method::OnPrinterStatus);

        let delta = json!({"id": 0, "method": 6000, "result": {"temps": {"nozzle": 225}}});
        let event = adapter.convert_to_event(&delta.to_string());
        let data = event.data.unwrap();
        assert_eq!(data["printerStatus"]["temps"]["nozzle"], 225);
        assert_eq!(data["printerStatus"]["machine_status"]["status"], 1);

        adapter.clear_status_cache();
        assert_eq!(adapter.cached_full_status(), json!({}));
    }

    #[test]
    fn status_response_is_also_an_event_when_it_carries_a_report() {
        let adapter = Cc2Adapter::new(test_info());
        let request =
            adapter.convert_request(Method::GetPrinterStatus, &json!({}), Duration::from_secs(3));
        let reply = json!({
            "id": request.request_id,
            "method": 6000,
            "result": {"full": true, "machine_status": {"status": 0}},
            "error_code": 0,
        })
        .to_string();
        assert_eq!(
            adapter.parse_message_kinds(&reply),
            vec![MessageKind::Response, MessageKind::Event]
        );
    }

    #[test]
    fn registration_response_validation() {
        let hooks = Cc2MqttHooks::new();
        let client_id = hooks.client_id.clone();

        let ok = json!({"client_id": client_id, "error": "ok"}).to_string();
        assert!(hooks
            .validate_registration_response("topic", &ok, &client_id)
            .is_ok());

        let full = json!({"client_id": client_id, "error": "too many clients"}).to_string();
        let err = hooks
            .validate_registration_response("topic", &full, &client_id)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PrinterConnectionLimitExceeded);

        let mismatch = json!({"client_id": "someone_else", "error": "ok"}).to_string();
        assert!(hooks
            .validate_registration_response("topic", &mismatch, &client_id)
            .is_err());
    }

    #[test]
    fn discovery_parses_cc2_announcement() {
        let strategy = Cc2DiscoveryStrategy;
        let payload = json!({
            "service": "elegoo_cc2",
            "sn": "F01NZQQZJS2ASC8",
            "name": "Centauri Carbon 2",
            "model": "CC2",
            "web_port": 80,
        })
        .to_string();

        let info = strategy.parse_response(&payload, "192.168.1.50", 52700).unwrap();
        assert_eq!(info.printer_id, "lan_F01NZQQZJS2ASC8");
        assert_eq!(info.printer_type, PrinterType::ElegooFdmCc2);
        assert_eq!(info.host, "192.168.1.50");

        assert!(strategy.parse_response("not json", "192.168.1.50", 52700).is_none());
        assert!(strategy
            .parse_response(&json!({"service": "other"}).to_string(), "192.168.1.50", 52700)
            .is_none());
    }

    #[test]
    fn heartbeat_dialect_is_json_ping_pong() {
        let hooks = Cc2MqttHooks::new();
        assert!(hooks.is_heartbeat_response(&json!({"type": "PONG"}).to_string()));
        assert!(!hooks.is_heartbeat_response(&json!({"type": "PING"}).to_string()));
        assert!(!hooks.is_heartbeat_response("pong"));
    }

    #[test]
    fn host_helpers_normalize() {
        assert_eq!(host_of("192.168.1.50"), Some("192.168.1.50".to_string()));
        assert_eq!(host_of("192.168.1.50:8883"), Some("192.168.1.50".to_string()));
        assert_eq!(
            host_of("http://192.168.1.50:80"),
            Some("192.168.1.50".to_string())
        );
        assert_eq!(host_of(""), None);
        assert_eq!(http_endpoint("192.168.1.50"), "http://192.168.1.50");
        assert_eq!(http_endpoint("http://192.168.1.50/"), "http://192.168.1.50");
    }
}
