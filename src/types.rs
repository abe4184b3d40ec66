use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Printer families the SDK knows how to talk to. The family selects the
/// transport, adapter and file-transfer strategy for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrinterType {
    #[serde(rename = "ELEGOO_FDM_CC")]
    ElegooFdmCc,
    #[serde(rename = "ELEGOO_FDM_CC2")]
    ElegooFdmCc2,
    #[serde(rename = "ELEGOO_FDM_KLIPPER")]
    ElegooFdmKlipper,
    #[serde(rename = "GENERIC_FDM_KLIPPER")]
    GenericFdmKlipper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthMode {
    #[default]
    #[serde(rename = "none")]
    None,
    Basic,
    Token,
    AccessCode,
    PinCode,
}

/// Descriptor for a known printer. `printer_id` is unique across the active
/// registry; the `lan_` / `cloud_` prefix encodes where it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterInfo {
    pub printer_id: String,
    pub serial_number: String,
    pub printer_type: PrinterType,
    pub brand: String,
    pub name: String,
    pub model: String,
    /// Host or URI, e.g. `192.168.1.50` or `http://192.168.1.50:7125`
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    pub auth_mode: AuthMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mainboard_id: Option<String>,
}

impl PrinterInfo {
    pub fn lan_id(serial: &str) -> String {
        format!("lan_{}", serial)
    }

    pub fn cloud_id(serial: &str) -> String {
        format!("cloud_{}", serial)
    }
}

/// Connection input for one printer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectParams {
    pub host: String,
    pub printer_type: Option<PrinterType>,
    pub auth_mode: AuthMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub access_code: Option<String>,
    pub pin_code: Option<String>,
    pub serial_number: Option<String>,
    /// Milliseconds; 0 means the protocol default.
    pub connection_timeout: u64,
    pub auto_reconnect: bool,
    /// When true, run a single attempt and do not retain the session.
    pub check_connection: bool,
}

/// Declared connection state of one printer session. The manager's value is
/// authoritative; the transport's own link state only corroborates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registering,
    Connected,
    ConnectionLost,
    Reconnecting,
}

/// Canonical method/event vocabulary. Requests go down through the adapter;
/// the `On*` members come back up as events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    Unknown,

    GetPrinterAttributes,
    GetPrinterStatus,
    UpdatePrinterName,

    StartPrint,
    PausePrint,
    ResumePrint,
    StopPrint,

    HomeAxes,
    MoveAxes,
    SetTemperature,
    SetPrintSpeed,
    SetFanSpeed,

    SetPrinterDownloadFile,
    CancelPrinterDownloadFile,

    GetPrintTaskList,
    DeletePrintTasks,
    GetFileList,
    GetFileDetail,

    GetCanvasStatus,
    SetAutoRefill,

    OnPrinterStatus,
    OnPrinterAttributes,
    OnConnectionStatus,
    OnFileTransferProgress,
    OnPrinterDiscovery,
    OnRtmMessage,
    OnRtcTokenChanged,
    OnPrinterEventRaw,
    OnLoggedInElsewhere,
    OnPrinterListChanged,
    OnOnlineStatusChanged,
}

impl Method {
    pub fn is_event(self) -> bool {
        self.event_name().is_some()
    }

    /// Dot-notation event name used on the serialized event surface.
    pub fn event_name(self) -> Option<&'static str> {
        match self {
            Method::OnPrinterStatus => Some("event.printer.status"),
            Method::OnPrinterAttributes => Some("event.printer.attributes"),
            Method::OnConnectionStatus => Some("event.printer.connection"),
            Method::OnFileTransferProgress => Some("event.file.upload.progress"),
            Method::OnPrinterDiscovery => Some("event.printer.list.changed"),
            Method::OnRtmMessage => Some("event.rtm.message"),
            Method::OnRtcTokenChanged => Some("event.rtc.token.changed"),
            Method::OnPrinterEventRaw => Some("event.printer.raw"),
            Method::OnLoggedInElsewhere => Some("event.user.logged.elsewhere"),
            Method::OnPrinterListChanged => Some("event.printer.list.changed"),
            Method::OnOnlineStatusChanged => Some("event.user.online.status"),
            _ => None,
        }
    }
}

/// Event delivered through the service event callback.
#[derive(Debug, Clone, Serialize)]
pub struct BizEvent {
    pub method: Method,
    pub data: Value,
}

impl BizEvent {
    pub fn new(method: Method, data: Value) -> Self {
        Self { method, data }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusData {
    pub printer_id: String,
    pub status: ConnectionState,
}

// ---------------------------------------------------------------------------
// Typed operation parameters / results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrinterBaseParams {
    pub printer_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartPrintParams {
    pub printer_id: String,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_calibration: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdatePrinterNameParams {
    pub printer_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetAutoRefillParams {
    pub printer_id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HomeAxesParams {
    pub printer_id: String,
    pub axes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MoveAxesParams {
    pub printer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedrate: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetTemperatureParams {
    pub printer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nozzle: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bed: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetPrintSpeedParams {
    pub printer_id: String,
    pub speed_level: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetFanSpeedParams {
    pub printer_id: String,
    pub fan_index: u32,
    /// 0-100
    pub speed: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetFileListParams {
    pub printer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetFileDetailParams {
    pub printer_id: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeletePrintTasksParams {
    pub printer_id: String,
    pub task_ids: Vec<String>,
}

/// Generic JSON payload results; the wire shapes differ per family, so the
/// SDK hands the adapter-normalized object through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterStatusData {
    #[serde(rename = "printerId")]
    pub printer_id: String,
    #[serde(rename = "printerStatus")]
    pub printer_status: Value,
}

impl PrinterStatusData {
    /// Synthetic OFFLINE status published when a session disconnects.
    pub fn offline(printer_id: &str) -> Self {
        Self {
            printer_id: printer_id.to_string(),
            printer_status: serde_json::json!({ "state": "OFFLINE" }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterAttributesData {
    #[serde(rename = "printerId")]
    pub printer_id: String,
    #[serde(rename = "printerAttributes")]
    pub printer_attributes: Value,
}

// ---------------------------------------------------------------------------
// File transfer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileUploadParams {
    pub printer_id: String,
    pub local_file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CancelFileUploadParams {
    pub printer_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadProgressData {
    pub printer_id: String,
    pub file_name: String,
    /// 0-100
    pub progress: u8,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadData {
    pub printer_id: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileDownloadParams {
    pub printer_id: String,
    pub remote_file_path: String,
    pub local_file_path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDownloadData {
    pub printer_id: String,
    pub local_file_path: String,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetDownloadUrlParams {
    pub printer_id: String,
    pub remote_file_path: String,
}

// ---------------------------------------------------------------------------
// Cloud-only operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendRtmMessageParams {
    pub printer_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BindPrinterParams {
    pub serial_number: String,
    pub name: String,
    /// Milliseconds to wait for the printer-side bind confirmation; 0 uses
    /// the default.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CancelBindPrinterParams {
    pub serial_number: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenewLicenseParams {
    pub serial_number: String,
}

/// Mask an identifier for logging; serial numbers and tokens are never
/// logged whole.
pub(crate) fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 6 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{}***{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_serializes_screaming_snake() {
        let json = serde_json::to_string(&Method::GetPrinterStatus).unwrap();
        assert_eq!(json, "\"GET_PRINTER_STATUS\"");
        let back: Method = serde_json::from_str("\"ON_PRINTER_STATUS\"").unwrap();
        assert_eq!(back, Method::OnPrinterStatus);
    }

    #[test]
    fn event_name_mapping_is_bidirectionally_closed() {
        assert_eq!(
            Method::OnLoggedInElsewhere.event_name(),
            Some("event.user.logged.elsewhere")
        );
        assert!(Method::StartPrint.event_name().is_none());
        assert!(Method::OnConnectionStatus.is_event());
    }

    #[test]
    fn printer_type_uses_wire_names() {
        let json = serde_json::to_string(&PrinterType::ElegooFdmCc2).unwrap();
        assert_eq!(json, "\"ELEGOO_FDM_CC2\"");
    }

    #[test]
    fn mask_hides_the_middle() {
        assert_eq!(mask("F01NZQQZJS2ASC8"), "F01***SC8");
        assert_eq!(mask("abc"), "***");
    }
}
