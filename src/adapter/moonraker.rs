use super::{
    generate_message_id, generate_request_id, Adapter, MessageKind, PendingTracker, PrinterEvent,
    PrinterRequest, PrinterResponse, SendCallback, StatusCache,
};
use crate::discovery::DiscoveryStrategy;
use crate::errors::ErrorCode;
use crate::transport::ws::WsHooks;
use crate::types::{mask, AuthMode, ConnectParams, Method, PrinterInfo, PrinterType};
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, warn};

const DEFAULT_MOONRAKER_PORT: u16 = 7125;

/// Printer objects queried when the caller asks for status without naming
/// any.
fn default_status_query() -> Value {
    json!({
        "objects": {
            "print_stats": null,
            "toolhead": null,
            "extruder": null,
            "heater_bed": null,
            "display_status": null,
            "fan": null,
        }
    })
}

/// Message adapter for Moonraker (Klipper) printers: JSON-RPC 2.0 with
/// numeric request ids. Control methods without a native RPC are expressed
/// as G-code scripts, the way every Moonraker front end does it.
pub struct MoonrakerAdapter {
    info: Mutex<PrinterInfo>,
    tracker: PendingTracker,
    cache: StatusCache,
    send_callback: Mutex<Option<SendCallback>>,
}

impl MoonrakerAdapter {
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

    /// Map a canonical method to (rpc_method, rpc_params); `None` when the
    /// family has no counterpart.
    fn map_request(method: Method, params: &Value) -> Option<(String, Value)> {
        let str_param = |key: &str| params.get(key).and_then(Value::as_str).unwrap_or_default();
        let num_param = |key: &str| params.get(key).and_then(Value::as_f64);

        match method {
            Method::GetPrinterAttributes => Some(("printer.info".into(), json!({}))),
            Method::GetPrinterStatus => {
                let query = if params.get("objects").is_some() {
                    params.clone()
                } else {
                    default_status_query()
                };
                Some(("printer.objects.query".into(), query))
            }
            Method::StartPrint => {
                let filename = if !str_param("fileName").is_empty() {
                    str_param("fileName").to_string()
                } else {
                    str_param("filename").to_string()
                };
                Some(("printer.print.start".into(), json!({ "filename": filename })))
            }
            Method::PausePrint => Some(("printer.print.pause".into(), json!({}))),
            Method::ResumePrint => Some(("printer.print.resume".into(), json!({}))),
            Method::StopPrint => Some(("printer.print.cancel".into(), json!({}))),
            Method::HomeAxes => {
                let axes = params
                    .get("axes")
                    .and_then(Value::as_array)
                    .map(|list| {
                        list.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_uppercase)
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .unwrap_or_default();
                let script = if axes.is_empty() {
                    "G28".to_string()
                } else {
                    format!("G28 {}", axes)
                };
                Some(("printer.gcode.script".into(), json!({ "script": script })))
            }
            Method::MoveAxes => {
                let mut script = String::from("G91\nG1");
                for (key, word) in [("x", " X"), ("y", " Y"), ("z", " Z")] {
                    if let Some(value) = num_param(key) {
                        script.push_str(&format!("{}{}", word, value));
                    }
                }
                if let Some(feedrate) = num_param("feedrate") {
                    script.push_str(&format!(" F{}", feedrate));
                }
                script.push_str("\nG90");
                Some(("printer.gcode.script".into(), json!({ "script": script })))
            }
            Method::SetTemperature => {
                let mut lines = Vec::new();
                if let Some(nozzle) = num_param("nozzle") {
                    lines.push(format!("M104 S{}", nozzle));
                }
                if let Some(bed) = num_param("bed") {
                    lines.push(format!("M140 S{}", bed));
                }
                if lines.is_empty() {
                    return None;
                }
                Some(("printer.gcode.script".into(), json!({ "script": lines.join("\n") })))
            }
            Method::SetPrintSpeed => {
                let level = params.get("speedLevel").and_then(Value::as_u64).unwrap_or(100);
                Some((
                    "printer.gcode.script".into(),
                    json!({ "script": format!("M220 S{}", level) }),
                ))
            }
            Method::SetFanSpeed => {
                let speed = params.get("speed").and_then(Value::as_u64).unwrap_or(0).min(100);
                let scaled = speed * 255 / 100;
                Some((
                    "printer.gcode.script".into(),
                    json!({ "script": format!("M106 S{}", scaled) }),
                ))
            }
            Method::GetFileList => {
                let root = params.get("path").and_then(Value::as_str).unwrap_or("gcodes");
                Some(("server.files.list".into(), json!({ "root": root })))
            }
            Method::GetFileDetail => Some((
                "server.files.metadata".into(),
                json!({ "filename": str_param("fileName") }),
            )),
            Method::GetPrintTaskList => Some(("server.history.list".into(), json!({}))),
            Method::DeletePrintTasks => {
                let uid = params
                    .get("taskIds")
                    .and_then(Value::as_array)
                    .and_then(|list| list.first())
                    .and_then(Value::as_str)
                    .unwrap_or("all");
                Some(("server.history.delete_job".into(), json!({ "uid": uid })))
            }
            _ => None,
        }
    }
}

impl Adapter for MoonrakerAdapter {
    fn convert_request(&self, method: Method, params: &Value, timeout: Duration) -> PrinterRequest {
        let Some((rpc_method, rpc_params)) = Self::map_request(method, params) else {
            return PrinterRequest::error(
                method,
                ErrorCode::OperationNotImplemented,
                format!("method {:?} is not supported by this printer", method),
            );
        };

        let request_id = generate_request_id();
        let payload = json!({
            "jsonrpc": "2.0",
            "method": rpc_method,
            "params": rpc_params,
            "id": request_id.parse::<u64>().unwrap_or(0),
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
            Some(Value::Number(id)) => id.to_string(),
            Some(Value::String(id)) => id.clone(),
            _ => return PrinterResponse::invalid("missing response id"),
        };
        let Some(record) = self.tracker.remove(&request_id) else {
            return PrinterResponse::invalid("No request mapping found");
        };

        if let Some(rpc_error) = parsed.get("error") {
            let message = rpc_error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("printer rejected the request");
            return PrinterResponse {
                request_id,
                method: record.method,
                code: ErrorCode::PrinterCommandFailed,
                message: message.to_string(),
                data: None,
            };
        }

        let mut data = parsed.get("result").cloned().unwrap_or(json!({}));
        if record.method == Method::GetPrinterStatus {
            if let Some(status) = data.get("status") {
                data = self.cache.apply_full(status);
            }
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
        match parsed.get("method").and_then(Value::as_str) {
            Some("notify_status_update") => {
                let Some(delta) = parsed
                    .get("params")
                    .and_then(Value::as_array)
                    .and_then(|p| p.first())
                else {
                    return PrinterEvent::none();
                };
                let merged = self.cache.apply_delta(delta);
                PrinterEvent::new(
                    Method::OnPrinterStatus,
                    json!({ "printerId": self.printer_id(), "printerStatus": merged }),
                )
            }
            Some("notify_klippy_ready") | Some("notify_klippy_shutdown") => {
                PrinterEvent::new(
                    Method::OnPrinterStatus,
                    json!({
                        "printerId": self.printer_id(),
                        "printerStatus": self.cache.snapshot(),
                    }),
                )
            }
            _ => PrinterEvent::none(),
        }
    }

    fn parse_message_kinds(&self, wire: &str) -> Vec<MessageKind> {
        let Ok(parsed) = serde_json::from_str::<Value>(wire) else {
            return Vec::new();
        };
        let mut kinds = Vec::new();
        let has_pending_id = match parsed.get("id") {
            Some(Value::Number(id)) => self.tracker.find(&id.to_string()).is_some(),
            Some(Value::String(id)) => self.tracker.find(id).is_some(),
            _ => false,
        };
        if has_pending_id {
            kinds.push(MessageKind::Response);
        }
        if matches!(
            parsed.get("method").and_then(Value::as_str),
            Some("notify_status_update") | Some("notify_klippy_ready") | Some("notify_klippy_shutdown")
        ) {
            kinds.push(MessageKind::Event);
        }
        kinds
    }

    fn supported_printer_types(&self) -> Vec<PrinterType> {
        vec![PrinterType::GenericFdmKlipper, PrinterType::ElegooFdmKlipper]
    }

    fn adapter_info(&self) -> &'static str {
        "GENERIC_MOONRAKER_ADAPTER"
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
// WebSocket hooks
// ---------------------------------------------------------------------------

/// Moonraker listens on port 7125; a oneshot token rides the query string
/// when the caller supplied one. Moonraker keeps its own connection alive,
/// so no application heartbeat.
pub struct MoonrakerWsHooks;

impl WsHooks for MoonrakerWsHooks {
    fn connection_url(&self, params: &ConnectParams) -> Option<String> {
        let host = super::elegoo_cc2::host_of(&params.host)?;
        let port = params
            .host
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(DEFAULT_MOONRAKER_PORT);
        let mut url = format!("ws://{}:{}/websocket", host, port);
        if let Some(token) = params.token.as_deref().filter(|t| !t.is_empty()) {
            url.push_str(&format!("?token={}", token));
        }
        Some(url)
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

pub struct MoonrakerDiscoveryStrategy;

impl DiscoveryStrategy for MoonrakerDiscoveryStrategy {
    fn probe(&self) -> String {
        json!({"method": "server.discover"}).to_string()
    }

    fn default_port(&self) -> u16 {
        3000
    }

    fn brand(&self) -> &'static str {
        "Generic"
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
        let announce = parsed.get("moonraker")?;
        let hostname = announce
            .get("hostname")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let serial = announce
            .get("serial")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| hostname.clone());
        if serial.is_empty() {
            return None;
        }
        let port = announce
            .get("port")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MOONRAKER_PORT as u64);
        let machine = announce
            .get("machine")
            .and_then(Value::as_str)
            .unwrap_or("Klipper")
            .to_string();

        Some(PrinterInfo {
            printer_id: PrinterInfo::lan_id(&serial),
            serial_number: serial,
            printer_type: PrinterType::GenericFdmKlipper,
            brand: self.brand().to_string(),
            name: if hostname.is_empty() { machine.clone() } else { hostname },
            model: machine,
            host: format!("{}:{}", sender_ip, port),
            web_url: Some(format!("http://{}", sender_ip)),
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
            printer_id: "lan_voron-01".to_string(),
            serial_number: "voron-01".to_string(),
            printer_type: PrinterType::GenericFdmKlipper,
            brand: "Generic".to_string(),
            name: "voron-01".to_string(),
            model: "Klipper".to_string(),
            host: "192.168.1.60:7125".to_string(),
            web_url: None,
            auth_mode: AuthMode::None,
            mainboard_id: None,
        }
    }

    #[test]
    fn status_request_uses_jsonrpc_with_numeric_id() {
        let adapter = MoonrakerAdapter::new(test_info());
        let request =
            adapter.convert_request(Method::GetPrinterStatus, &json!({}), Duration::from_secs(3));
        assert!(request.is_valid());

        let envelope: Value = serde_json::from_str(&request.payload).unwrap();
        assert_eq!(envelope["jsonrpc"], "2.0");
        assert_eq!(envelope["method"], "printer.objects.query");
        assert!(envelope["id"].is_number());
        assert!(envelope["params"]["objects"]["print_stats"].is_null());
    }

    #[test]
    fn response_with_numeric_id_resolves_and_caches_status() {
        let adapter = MoonrakerAdapter::new(test_info());
        let request =
            adapter.convert_request(Method::GetPrinterStatus, &json!({}), Duration::from_secs(3));
        let reply = json!({
            "jsonrpc": "2.0",
            "result": {"status": {"print_stats": {"state": "printing"}}, "eventtime": 12.5},
            "id": request.request_id.parse::<u64>().unwrap(),
        })
        .to_string();

        let response = adapter.convert_to_response(&reply);
        assert!(response.is_valid());
        assert_eq!(
            adapter.cached_full_status()["print_stats"]["state"],
            "printing"
        );
    }

    #[test]
    fn rpc_error_maps_to_command_failed() {
        let adapter = MoonrakerAdapter::new(test_info());
        let request = adapter.convert_request(
            Method::StartPrint,
            &json!({"fileName": "missing.gcode"}),
            Duration::from_secs(3),
        );
        let reply = json!({
            "jsonrpc": "2.0",
            "error": {"code": 400, "message": "File not found"},
            "id": request.request_id.parse::<u64>().unwrap(),
        })
        .to_string();

        let response = adapter.convert_to_response(&reply);
        assert_eq!(response.code, ErrorCode::PrinterCommandFailed);
        assert_eq!(response.message, "File not found");
    }

    #[test]
    fn notify_status_update_merges_delta() {
        let adapter = MoonrakerAdapter::new(test_info());
        adapter.cache.apply_full(&json!({"print_stats": {"state": "printing"}, "extruder": {"temperature": 200.0}}));

        let push = json!({
            "jsonrpc": "2.0",
            "method": "notify_status_update",
            "params": [{"extruder": {"temperature": 215.0}}, 99.1],
        })
        .to_string();
        assert_eq!(adapter.parse_message_kinds(&push), vec![MessageKind::Event]);

        let event = adapter.convert_to_event(&push);
        let data = event.data.unwrap();
        assert_eq!(data["printerStatus"]["extruder"]["temperature"], 215.0);
        assert_eq!(data["printerStatus"]["print_stats"]["state"], "printing");
    }

    #[test]
    fn control_methods_become_gcode_scripts() {
        let adapter = MoonrakerAdapter::new(test_info());
        let request = adapter.convert_request(
            Method::SetTemperature,
            &json!({"nozzle": 210.0, "bed": 60.0}),
            Duration::from_secs(3),
        );
        let envelope: Value = serde_json::from_str(&request.payload).unwrap();
        assert_eq!(envelope["method"], "printer.gcode.script");
        assert_eq!(envelope["params"]["script"], "M104 S210\nM140 S60");

        let request =
            adapter.convert_request(Method::SetFanSpeed, &json!({"speed": 50}), Duration::from_secs(3));
        let envelope: Value = serde_json::from_str(&request.payload).unwrap();
        assert_eq!(envelope["params"]["script"], "M106 S127");
    }

    #[test]
    fn canvas_is_not_supported() {
        let adapter = MoonrakerAdapter::new(test_info());
        let request =
            adapter.convert_request(Method::GetCanvasStatus, &json!({}), Duration::from_secs(3));
        assert_eq!(request.code, ErrorCode::OperationNotImplemented);
    }

    #[test]
    fn discovery_parses_moonraker_announcement() {
        let strategy = MoonrakerDiscoveryStrategy;
        let payload = json!({
            "moonraker": {"hostname": "voron-01", "port": 7125, "machine": "Voron 2.4"},
        })
        .to_string();

        let info = strategy.parse_response(&payload, "192.168.1.60", 3000).unwrap();
        assert_eq!(info.printer_id, "lan_voron-01");
        assert_eq!(info.host, "192.168.1.60:7125");
        assert_eq!(info.printer_type, PrinterType::GenericFdmKlipper);
    }

    #[test]
    fn ws_url_appends_oneshot_token() {
        let hooks = MoonrakerWsHooks;
        let params = ConnectParams {
            host: "192.168.1.60".to_string(),
            token: Some("abc123".to_string()),
            ..Default::default()
        };
        assert_eq!(
            hooks.connection_url(&params).unwrap(),
            "ws://192.168.1.60:7125/websocket?token=abc123"
        );

        let params = ConnectParams {
            host: "192.168.1.60:7126".to_string(),
            ..Default::default()
        };
        assert_eq!(
            hooks.connection_url(&params).unwrap(),
            "ws://192.168.1.60:7126/websocket"
        );
    }
}
