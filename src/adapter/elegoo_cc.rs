use super::{
    generate_message_id, generate_request_id, timestamp_ms, Adapter, MessageKind, PendingTracker,
    PrinterEvent, PrinterRequest, PrinterResponse, SendCallback,
};
use crate::discovery::DiscoveryStrategy;
use crate::transport::ws::WsHooks;
use crate::transport::HeartbeatConfig;
use crate::errors::ErrorCode;
use crate::types::{mask, AuthMode, ConnectParams, Method, PrinterInfo, PrinterType};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, warn};

static COMMAND_CODES: Lazy<Vec<(Method, u64)>> = Lazy::new(|| {
    vec![
        (Method::GetPrinterAttributes, 0),
        (Method::GetPrinterStatus, 1),
        (Method::UpdatePrinterName, 64),
        (Method::StartPrint, 128),
        (Method::PausePrint, 129),
        (Method::ResumePrint, 130),
        (Method::StopPrint, 131),
        (Method::HomeAxes, 192),
        (Method::MoveAxes, 193),
        (Method::SetTemperature, 194),
        (Method::SetPrintSpeed, 195),
        (Method::SetFanSpeed, 196),
        (Method::SetPrinterDownloadFile, 384),
        (Method::CancelPrinterDownloadFile, 385),
        (Method::GetFileList, 258),
        (Method::GetFileDetail, 259),
        (Method::GetPrintTaskList, 320),
        (Method::DeletePrintTasks, 321),
    ]
});

fn command_code(method: Method) -> Option<u64> {
    COMMAND_CODES.iter().find(|(m, _)| *m == method).map(|(_, c)| *c)
}

/// Message adapter for the first-generation Elegoo CC family. The dialect
/// is topic-routed: requests publish under `sdcp/request/{mainboard}`,
/// responses and pushes come back under matching reply topics. CC printers
/// always report full status documents, so there is no delta cache.
pub struct CcAdapter {
    info: Mutex<PrinterInfo>,
    session_id: String,
    tracker: PendingTracker,
    send_callback: Mutex<Option<SendCallback>>,
}

impl CcAdapter {
    pub fn new(info: PrinterInfo) -> Self {
        Self {
            info: Mutex::new(info),
            session_id: uuid::Uuid::new_v4().to_string(),
            tracker: PendingTracker::new(),
            send_callback: Mutex::new(None),
        }
    }

    fn printer_id(&self) -> String {
        self.info.lock().unwrap().printer_id.clone()
    }

    fn mainboard_id(&self) -> String {
        let info = self.info.lock().unwrap();
        info.mainboard_id
            .clone()
            .unwrap_or_else(|| info.serial_number.clone())
    }

    fn topic(payload: &Value) -> Option<&str> {
        payload.get("Topic").and_then(Value::as_str)
    }
}

impl Adapter for CcAdapter {
    fn convert_request(&self, method: Method, params: &Value, timeout: Duration) -> PrinterRequest {
        let Some(code) = command_code(method) else {
            return PrinterRequest::error(
                method,
                ErrorCode::OperationNotImplemented,
                format!("method {:?} is not supported by this printer", method),
            );
        };

        let request_id = generate_request_id();
        let mainboard = self.mainboard_id();
        let payload = json!({
            "Id": self.session_id,
            "Data": {
                "Cmd": code,
                "Data": params,
                "RequestID": request_id,
                "MainboardID": mainboard,
                "TimeStamp": timestamp_ms(),
            },
            "Topic": format!("sdcp/request/{}", mainboard),
        });

        self.tracker
            .record(generate_message_id(), request_id.clone(), method, timeout);
        PrinterRequest::ok(request_id, method, payload.to_string())
    }

    fn convert_to_response(&self, wire: &str) -> PrinterResponse {
        let Ok(parsed) = serde_json::from_str::<Value>(wire) else {
            return PrinterResponse::invalid("not a JSON payload");
        };
        if !Self::topic(&parsed).is_some_and(|t| t.starts_with("sdcp/response/")) {
            return PrinterResponse::invalid("not a response topic");
        }
        let Some(request_id) = parsed
            .pointer("/Data/RequestID")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return PrinterResponse::invalid("missing RequestID");
        };
        let Some(record) = self.tracker.remove(&request_id) else {
            return PrinterResponse::invalid("No request mapping found");
        };

        let data = parsed.pointer("/Data/Data").cloned().unwrap_or(json!({}));
        let ack = data.get("Ack").and_then(Value::as_u64).unwrap_or(0);
        if ack != 0 {
            return PrinterResponse {
                request_id,
                method: record.method,
                code: ErrorCode::PrinterCommandFailed,
                message: format!("printer acknowledged with error {}", ack),
                data: Some(data),
            };
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
        let Some(topic) = Self::topic(&parsed) else {
            return PrinterEvent::none();
        };
        if topic.starts_with("sdcp/status/") {
            let Some(status) = parsed.get("Status") else {
                return PrinterEvent::none();
            };
            return PrinterEvent::new(
                Method::OnPrinterStatus,
                json!({ "printerId": self.printer_id(), "printerStatus": status }),
            );
        }
        if topic.starts_with("sdcp/attributes/") {
            let Some(attributes) = parsed.get("Attributes") else {
                return PrinterEvent::none();
            };
            return PrinterEvent::new(
                Method::OnPrinterAttributes,
                json!({ "printerId": self.printer_id(), "printerAttributes": attributes }),
            );
        }
        PrinterEvent::none()
    }

    fn parse_message_kinds(&self, wire: &str) -> Vec<MessageKind> {
        let Ok(parsed) = serde_json::from_str::<Value>(wire) else {
            return Vec::new();
        };
        let Some(topic) = Self::topic(&parsed) else {
            return Vec::new();
        };
        if topic.starts_with("sdcp/response/") {
            let known = parsed
                .pointer("/Data/RequestID")
                .and_then(Value::as_str)
                .is_some_and(|id| self.tracker.find(id).is_some());
            if known {
                return vec![MessageKind::Response];
            }
            return Vec::new();
        }
        if topic.starts_with("sdcp/status/") || topic.starts_with("sdcp/attributes/") {
            return vec![MessageKind::Event];
        }
        Vec::new()
    }

    fn supported_printer_types(&self) -> Vec<PrinterType> {
        vec![PrinterType::ElegooFdmCc]
    }

    fn adapter_info(&self) -> &'static str {
        "ELEGOO_FDM_CC_ADAPTER"
    }

    fn printer_info(&self) -> PrinterInfo {
        self.info.lock().unwrap().clone()
    }

    fn cached_full_status(&self) -> Value {
        // CC printers report full documents only; nothing is cached.
        Value::Object(Default::default())
    }

    fn clear_status_cache(&self) {}

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
// WebSocket hooks
// ---------------------------------------------------------------------------

/// CC printers speak WebSocket on port 3030 with a plain text ping/pong
/// heartbeat.
pub struct CcWsHooks;

impl WsHooks for CcWsHooks {
    fn connection_url(&self, params: &ConnectParams) -> Option<String> {
        let host = super::elegoo_cc2::host_of(&params.host)?;
        Some(format!("ws://{}:3030/websocket", host))
    }

    fn heartbeat(&self) -> Option<HeartbeatConfig> {
        Some(HeartbeatConfig {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(60),
        })
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

pub struct CcDiscoveryStrategy;

impl DiscoveryStrategy for CcDiscoveryStrategy {
    fn probe(&self) -> String {
        "M99999".to_string()
    }

    fn default_port(&self) -> u16 {
        3000
    }

    fn brand(&self) -> &'static str {
        "Elegoo"
    }

    fn supported_auth_mode(&self) -> AuthMode {
        AuthMode::None
    }

    fn parse_response(
        &self,
        payload: &str,
        sender_ip: &str,
        _sender_port: u16,
    ) -> Option<PrinterInfo> {
        let parsed: Value = serde_json::from_str(payload).ok()?;
        let data = parsed.get("Data")?;
        let mainboard = data.get("MainboardID").and_then(Value::as_str)?.to_string();
        if mainboard.is_empty() {
            return None;
        }
        let name = data
            .get("Name")
            .and_then(Value::as_str)
            .unwrap_or("Elegoo Printer")
            .to_string();
        let model = data
            .get("MachineName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let brand = data
            .get("BrandName")
            .and_then(Value::as_str)
            .unwrap_or(self.brand())
            .to_string();
        let host = data
            .get("MainboardIP")
            .and_then(Value::as_str)
            .filter(|ip| !ip.is_empty())
            .unwrap_or(sender_ip)
            .to_string();

        Some(PrinterInfo {
            printer_id: PrinterInfo::lan_id(&mainboard),
            serial_number: mainboard.clone(),
            printer_type: PrinterType::ElegooFdmCc,
            brand,
            name,
            model,
            web_url: Some(format!("http://{}", host)),
            host,
            auth_mode: self.supported_auth_mode(),
            mainboard_id: Some(mainboard),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_info() -> PrinterInfo {
        PrinterInfo {
            printer_id: "lan_MB000123".to_string(),
            serial_number: "MB000123".to_string(),
            printer_type: PrinterType::ElegooFdmCc,
            brand: "Elegoo".to_string(),
            name: "Centauri Carbon".to_string(),
            model: "CC".to_string(),
            host: "192.168.1.77".to_string(),
            web_url: None,
            auth_mode: AuthMode::None,
            mainboard_id: Some("MB000123".to_string()),
        }
    }

    #[test]
    fn request_uses_sdcp_envelope_and_correlates_response() {
        let adapter = CcAdapter::new(test_info());
        let request =
            adapter.convert_request(Method::GetPrinterStatus, &json!({}), Duration::from_secs(3));
        assert!(request.is_valid());

        let envelope: Value = serde_json::from_str(&request.payload).unwrap();
        assert_eq!(envelope["Topic"], "sdcp/request/MB000123");
        assert_eq!(envelope["Data"]["Cmd"], 1);

        let reply = json!({
            "Id": "printer-session",
            "Topic": "sdcp/response/MB000123",
            "Data": {
                "RequestID": request.request_id,
                "MainboardID": "MB000123",
                "Data": {"Ack": 0, "CurrentStatus": [0]},
            },
        })
        .to_string();
        assert_eq!(adapter.parse_message_kinds(&reply), vec![MessageKind::Response]);

        let response = adapter.convert_to_response(&reply);
        assert!(response.is_valid());
        assert_eq!(response.code, ErrorCode::Success);
    }

    #[test]
    fn nonzero_ack_is_command_failure() {
        let adapter = CcAdapter::new(test_info());
        let request = adapter.convert_request(Method::StopPrint, &json!({}), Duration::from_secs(3));
        let reply = json!({
            "Topic": "sdcp/response/MB000123",
            "Data": {"RequestID": request.request_id, "Data": {"Ack": 2}},
        })
        .to_string();
        let response = adapter.convert_to_response(&reply);
        assert_eq!(response.code, ErrorCode::PrinterCommandFailed);
    }

    #[test]
    fn status_push_becomes_event() {
        let adapter = CcAdapter::new(test_info());
        let push = json!({
            "Topic": "sdcp/status/MB000123",
            "Status": {"CurrentStatus": [1], "PrintInfo": {"Progress": 42}},
        })
        .to_string();
        assert_eq!(adapter.parse_message_kinds(&push), vec![MessageKind::Event]);

        let event = adapter.convert_to_event(&push);
        assert_eq!(event.method, Method::OnPrinterStatus);
        let data = event.data.unwrap();
        assert_eq!(data["printerStatus"]["PrintInfo"]["Progress"], 42);
    }

    #[test]
    fn canvas_status_is_not_supported_on_cc() {
        let adapter = CcAdapter::new(test_info());
        let request =
            adapter.convert_request(Method::GetCanvasStatus, &json!({}), Duration::from_secs(3));
        assert!(!request.is_valid());
        assert_eq!(request.code, ErrorCode::OperationNotImplemented);
    }

    #[test]
    fn discovery_parses_sdcp_announcement() {
        let strategy = CcDiscoveryStrategy;
        let payload = json!({
            "Id": "machine-uuid",
            "Data": {
                "Name": "Centauri Carbon",
                "MachineName": "Centauri Carbon",
                "BrandName": "Elegoo",
                "MainboardIP": "192.168.1.77",
                "MainboardID": "MB000123",
                "ProtocolVersion": "V3.0.0",
            },
        })
        .to_string();

        let info = strategy.parse_response(&payload, "192.168.1.77", 3000).unwrap();
        assert_eq!(info.printer_id, "lan_MB000123");
        assert_eq!(info.mainboard_id.as_deref(), Some("MB000123"));
        assert_eq!(info.printer_type, PrinterType::ElegooFdmCc);
    }
}
