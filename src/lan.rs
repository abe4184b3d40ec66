use crate::adapter::elegoo_cc::{CcAdapter, CcDiscoveryStrategy, CcWsHooks};
use crate::adapter::elegoo_cc2::{Cc2Adapter, Cc2DiscoveryStrategy, Cc2MqttHooks};
use crate::adapter::moonraker::{MoonrakerAdapter, MoonrakerDiscoveryStrategy, MoonrakerWsHooks};
use crate::adapter::Adapter;
use crate::config::{DiscoveryParams, LanConfig};
use crate::discovery::PrinterDiscovery;
use crate::errors::{ErrorCode, Result, SdkError};
use crate::events::{EventCallback, EventDispatcher};
use crate::session::PrinterSession;
use crate::transfer::elegoo_ccs::CcsHttpTransfer;
use crate::transfer::moonraker::MoonrakerHttpTransfer;
use crate::transfer::{CancelToken, FileTransfer, UploadProgressCallback};
use crate::transport::mqtt::MqttTransport;
use crate::transport::ws::WsTransport;
use crate::transport::Transport;
use crate::types::{
    mask, BizEvent, CancelFileUploadParams, ConnectParams, DeletePrintTasksParams,
    FileDownloadData, FileDownloadParams, FileUploadData, FileUploadParams, GetDownloadUrlParams,
    GetFileDetailParams, GetFileListParams, HomeAxesParams, Method, MoveAxesParams,
    PrinterAttributesData, PrinterInfo, PrinterStatusData, PrinterType, SetAutoRefillParams,
    SetFanSpeedParams, SetPrintSpeedParams, SetTemperatureParams, StartPrintParams,
    UpdatePrinterNameParams,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

struct SessionEntry {
    session: Arc<PrinterSession>,
    transfer: Arc<dyn FileTransfer>,
}

/// Registry of active LAN printer sessions plus discovery orchestration and
/// file-transfer dispatch.
///
/// Lock inventory: `sessions` (registry), `uploads` (in-flight upload
/// tokens). Callbacks are always invoked with no lock held.
pub struct LanService {
    config: Mutex<LanConfig>,
    initialized: AtomicBool,
    discovery: PrinterDiscovery,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    uploads: Mutex<HashMap<String, CancelToken>>,
    dispatcher: Arc<EventDispatcher>,
}

impl LanService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(LanConfig::default()),
            initialized: AtomicBool::new(false),
            discovery: PrinterDiscovery::new(vec![
                Arc::new(CcDiscoveryStrategy),
                Arc::new(Cc2DiscoveryStrategy),
                Arc::new(MoonrakerDiscoveryStrategy),
            ]),
            sessions: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            dispatcher: Arc::new(EventDispatcher::new()),
        })
    }

    pub fn initialize(&self, config: LanConfig) -> Result<()> {
        *self.config.lock().unwrap() = config;
        self.initialized.store(true, Ordering::SeqCst);
        info!("LAN service initialized");
        Ok(())
    }

    pub async fn cleanup(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.discovery.stop().await;

        let entries: Vec<SessionEntry> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.session.shutdown().await;
        }
        self.uploads.lock().unwrap().clear();
        info!("LAN service cleaned up");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn set_event_callback(&self, callback: EventCallback) {
        self.dispatcher.set_callback(Some(callback));
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(SdkError::not_initialized("LanService"));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Run one discovery pass and return the accumulated printers. Each new
    /// printer also fires an ON_PRINTER_DISCOVERY event as it is found.
    pub async fn start_printer_discovery(&self, params: DiscoveryParams) -> Result<Vec<PrinterInfo>> {
        self.ensure_initialized()?;

        let dispatcher = self.dispatcher.clone();
        let (done_tx, done_rx) = oneshot::channel();

        self.discovery.start(
            params,
            Arc::new(move |printer| {
                dispatcher.emit(BizEvent::new(
                    Method::OnPrinterDiscovery,
                    serde_json::to_value(&printer).unwrap_or_default(),
                ));
            }),
            Box::new(move |printers| {
                let _ = done_tx.send(printers);
            }),
        )?;

        done_rx.await.map_err(|_| {
            SdkError::new(ErrorCode::UnknownError, "discovery worker dropped its result")
        })
    }

    pub async fn stop_printer_discovery(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.discovery.stop().await;
        Ok(())
    }

    pub fn get_discovered_printers(&self) -> Vec<PrinterInfo> {
        self.discovery.discovered_printers()
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Connect to a printer. With `check_connection` set, the session is
    /// torn down immediately after the attempt and nothing is retained.
    pub async fn connect_printer(&self, params: ConnectParams) -> Result<(PrinterInfo, bool)> {
        self.ensure_initialized()?;
        if params.host.is_empty() {
            return Err(SdkError::invalid_parameter("host is required"));
        }
        let printer_type = params
            .printer_type
            .ok_or_else(|| SdkError::invalid_parameter("printerType is required"))?;

        let info = self.resolve_printer_info(&params, printer_type);

        // An already-connected session is reported as such rather than
        // duplicated.
        if let Some(entry) = self.entry(&info.printer_id) {
            if entry.session.is_connected() {
                return Ok((entry.session.printer_info(), true));
            }
            // A stale registry entry is replaced by the fresh attempt.
            self.remove_entry(&info.printer_id);
        }

        let max_connections = self.config.lock().unwrap().max_connections;
        if max_connections > 0 && self.sessions.lock().unwrap().len() >= max_connections {
            return Err(SdkError::new(
                ErrorCode::PrinterConnectionLimitExceeded,
                format!("connection limit of {} reached", max_connections),
            ));
        }

        let (session, transfer) = build_session(info.clone());
        if !params.check_connection {
            let dispatcher = self.dispatcher.clone();
            session.set_event_callback(Arc::new(move |event| dispatcher.emit(event)));
        }

        if let Err(err) = session.connect(&params).await {
            // Only successful sessions enter the registry; a failed attempt
            // must not leave a reconnect worker running unowned.
            session.shutdown().await;
            return Err(err);
        }

        transfer.set_auth_credentials(auth_credential_map(&params));

        if params.check_connection {
            session.shutdown().await;
            return Ok((info, true));
        }

        let connected = session.is_connected();
        self.sessions.lock().unwrap().insert(
            info.printer_id.clone(),
            SessionEntry {
                session,
                transfer,
            },
        );
        self.dispatcher
            .emit(BizEvent::new(Method::OnPrinterListChanged, json!({})));
        info!("printer {} connected", mask(&info.printer_id));
        Ok((info, connected))
    }

    pub async fn disconnect_printer(&self, printer_id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let entry = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.remove(printer_id)
        };
        let Some(entry) = entry else {
            return Err(SdkError::printer_not_found(printer_id));
        };
        entry.session.shutdown().await;
        self.uploads.lock().unwrap().remove(printer_id);
        self.dispatcher
            .emit(BizEvent::new(Method::OnPrinterListChanged, json!({})));
        info!("printer {} disconnected", mask(printer_id));
        Ok(())
    }

    pub fn get_printers(&self) -> Vec<PrinterInfo> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.session.printer_info())
            .collect()
    }

    pub fn is_printer_connected(&self, printer_id: &str) -> bool {
        self.entry(printer_id)
            .map(|entry| entry.session.is_connected())
            .unwrap_or(false)
    }

    fn entry(&self, printer_id: &str) -> Option<SessionEntry> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(printer_id).map(|entry| SessionEntry {
            session: entry.session.clone(),
            transfer: entry.transfer.clone(),
        })
    }

    fn remove_entry(&self, printer_id: &str) {
        self.sessions.lock().unwrap().remove(printer_id);
    }

    fn session(&self, printer_id: &str) -> Result<Arc<PrinterSession>> {
        self.ensure_initialized()?;
        self.entry(printer_id)
            .map(|entry| entry.session)
            .ok_or_else(|| SdkError::printer_not_found(printer_id))
    }

    /// Printer identity for a connect request: prefer what discovery
    /// already knows about the host, then the caller's serial number, then
    /// a host-derived identity for direct connects.
    fn resolve_printer_info(&self, params: &ConnectParams, printer_type: PrinterType) -> PrinterInfo {
        if let Some(found) = self
            .discovery
            .discovered_printers()
            .into_iter()
            .find(|p| p.host == params.host || params.host.starts_with(&p.host))
        {
            return found;
        }

        let serial = params
            .serial_number
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| params.host.replace([':', '.', '/'], "-"));
        PrinterInfo {
            printer_id: PrinterInfo::lan_id(&serial),
            serial_number: serial,
            printer_type,
            brand: match printer_type {
                PrinterType::ElegooFdmCc | PrinterType::ElegooFdmCc2 | PrinterType::ElegooFdmKlipper => {
                    "Elegoo".to_string()
                }
                PrinterType::GenericFdmKlipper => "Generic".to_string(),
            },
            name: params.host.clone(),
            model: String::new(),
            host: params.host.clone(),
            web_url: None,
            auth_mode: params.auth_mode,
            mainboard_id: None,
        }
    }

    // -----------------------------------------------------------------------
    // Control operations
    // -----------------------------------------------------------------------

    pub async fn start_print(&self, params: &StartPrintParams) -> Result<()> {
        self.session(&params.printer_id)?.start_print(params).await
    }

    pub async fn pause_print(&self, printer_id: &str) -> Result<()> {
        self.session(printer_id)?.pause_print().await
    }

    pub async fn resume_print(&self, printer_id: &str) -> Result<()> {
        self.session(printer_id)?.resume_print().await
    }

    pub async fn stop_print(&self, printer_id: &str) -> Result<()> {
        self.session(printer_id)?.stop_print().await
    }

    pub async fn set_auto_refill(&self, params: &SetAutoRefillParams) -> Result<()> {
        self.session(&params.printer_id)?.set_auto_refill(params).await
    }

    pub async fn update_printer_name(&self, params: &UpdatePrinterNameParams) -> Result<()> {
        let session = self.session(&params.printer_id)?;
        session.update_printer_name(params).await?;
        let mut info = session.printer_info();
        info.name = params.name.clone();
        session.update_printer_info(info);
        Ok(())
    }

    pub async fn home_axes(&self, params: &HomeAxesParams) -> Result<()> {
        self.session(&params.printer_id)?.home_axes(params).await
    }

    pub async fn move_axes(&self, params: &MoveAxesParams) -> Result<()> {
        self.session(&params.printer_id)?.move_axes(params).await
    }

    pub async fn set_temperature(&self, params: &SetTemperatureParams) -> Result<()> {
        self.session(&params.printer_id)?.set_temperature(params).await
    }

    pub async fn set_print_speed(&self, params: &SetPrintSpeedParams) -> Result<()> {
        self.session(&params.printer_id)?.set_print_speed(params).await
    }

    pub async fn set_fan_speed(&self, params: &SetFanSpeedParams) -> Result<()> {
        self.session(&params.printer_id)?.set_fan_speed(params).await
    }

    pub async fn get_printer_status(
        &self,
        printer_id: &str,
        timeout: Duration,
    ) -> Result<PrinterStatusData> {
        self.session(printer_id)?.get_printer_status(timeout).await
    }

    pub async fn get_printer_attributes(
        &self,
        printer_id: &str,
        timeout: Duration,
    ) -> Result<PrinterAttributesData> {
        self.session(printer_id)?.get_printer_attributes(timeout).await
    }

    pub async fn get_canvas_status(&self, printer_id: &str) -> Result<serde_json::Value> {
        self.session(printer_id)?.get_canvas_status().await
    }

    pub async fn get_file_list(&self, params: &GetFileListParams) -> Result<serde_json::Value> {
        self.session(&params.printer_id)?.get_file_list(params).await
    }

    pub async fn get_file_detail(&self, params: &GetFileDetailParams) -> Result<serde_json::Value> {
        self.session(&params.printer_id)?.get_file_detail(params).await
    }

    pub async fn get_print_task_list(&self, printer_id: &str) -> Result<serde_json::Value> {
        self.session(printer_id)?.get_print_task_list().await
    }

    pub async fn delete_print_tasks(&self, params: &DeletePrintTasksParams) -> Result<serde_json::Value> {
        self.session(&params.printer_id)?.delete_print_tasks(params).await
    }

    pub fn refresh_printer_status(&self, printer_id: &str) -> Result<()> {
        self.session(printer_id)?.refresh_printer_status();
        Ok(())
    }

    pub fn refresh_printer_attributes(&self, printer_id: &str) -> Result<()> {
        self.session(printer_id)?.refresh_printer_attributes();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // File transfer
    // -----------------------------------------------------------------------

    /// Upload a file to a printer. At most one upload is in flight per
    /// printer id; progress surfaces both through the optional callback and
    /// as ON_FILE_TRANSFER_PROGRESS events.
    pub async fn upload_file(
        &self,
        params: &FileUploadParams,
        on_progress: Option<UploadProgressCallback>,
    ) -> Result<FileUploadData> {
        let entry = {
            self.ensure_initialized()?;
            self.entry(&params.printer_id)
                .ok_or_else(|| SdkError::printer_not_found(&params.printer_id))?
        };

        let cancel = CancelToken::new();
        {
            let mut uploads = self.uploads.lock().unwrap();
            if uploads.contains_key(&params.printer_id) {
                return Err(SdkError::new(
                    ErrorCode::OperationInProgress,
                    format!("an upload is already in progress for {}", params.printer_id),
                ));
            }
            uploads.insert(params.printer_id.clone(), cancel.clone());
        }

        let dispatcher = self.dispatcher.clone();
        let user_callback = on_progress.clone();
        let progress: UploadProgressCallback = Arc::new(move |update| {
            dispatcher.emit(BizEvent::new(
                Method::OnFileTransferProgress,
                serde_json::to_value(update).unwrap_or_default(),
            ));
            user_callback.as_ref().map(|cb| cb(update)).unwrap_or(true)
        });

        let result = entry
            .transfer
            .upload_file(&entry.session.printer_info(), params, progress, cancel)
            .await;

        self.uploads.lock().unwrap().remove(&params.printer_id);
        if let Err(err) = &result {
            warn!(
                "upload to {} failed: {}",
                mask(&params.printer_id),
                err.message
            );
        }
        result
    }

    /// Latch cancellation for the in-flight upload, if any.
    pub fn cancel_file_upload(&self, params: &CancelFileUploadParams) -> Result<()> {
        self.ensure_initialized()?;
        if self.entry(&params.printer_id).is_none() {
            return Err(SdkError::printer_not_found(&params.printer_id));
        }
        if let Some(token) = self.uploads.lock().unwrap().get(&params.printer_id) {
            token.cancel();
            info!("upload cancellation requested for {}", mask(&params.printer_id));
        }
        Ok(())
    }

    pub async fn download_file(
        &self,
        params: &FileDownloadParams,
        on_progress: Option<crate::transfer::DownloadProgressCallback>,
    ) -> Result<FileDownloadData> {
        self.ensure_initialized()?;
        let entry = self
            .entry(&params.printer_id)
            .ok_or_else(|| SdkError::printer_not_found(&params.printer_id))?;

        let progress = on_progress.unwrap_or_else(|| Arc::new(|_, _| true));
        entry
            .transfer
            .download_file(&entry.session.printer_info(), params, progress, CancelToken::new())
            .await
    }

    pub fn get_download_url(&self, params: &GetDownloadUrlParams) -> Result<String> {
        self.ensure_initialized()?;
        let entry = self
            .entry(&params.printer_id)
            .ok_or_else(|| SdkError::printer_not_found(&params.printer_id))?;
        Ok(entry.transfer.download_url(&entry.session.printer_info(), params))
    }
}

/// Per-family wiring: which adapter, transport and transfer strategy a
/// printer type gets.
fn build_session(info: PrinterInfo) -> (Arc<PrinterSession>, Arc<dyn FileTransfer>) {
    match info.printer_type {
        PrinterType::ElegooFdmCc2 => {
            let adapter: Arc<dyn Adapter> = Arc::new(Cc2Adapter::new(info.clone()));
            let transport: Arc<dyn Transport> = Arc::new(MqttTransport::new(Arc::new(Cc2MqttHooks::new())));
            let transfer: Arc<dyn FileTransfer> = Arc::new(CcsHttpTransfer::new());
            (PrinterSession::new(info, adapter, transport), transfer)
        }
        PrinterType::ElegooFdmCc => {
            let adapter: Arc<dyn Adapter> = Arc::new(CcAdapter::new(info.clone()));
            let transport: Arc<dyn Transport> = Arc::new(WsTransport::new(Arc::new(CcWsHooks)));
            let transfer: Arc<dyn FileTransfer> = Arc::new(CcsHttpTransfer::new());
            (PrinterSession::new(info, adapter, transport), transfer)
        }
        PrinterType::ElegooFdmKlipper | PrinterType::GenericFdmKlipper => {
            let adapter: Arc<dyn Adapter> = Arc::new(MoonrakerAdapter::new(info.clone()));
            let transport: Arc<dyn Transport> = Arc::new(WsTransport::new(Arc::new(MoonrakerWsHooks)));
            let transfer: Arc<dyn FileTransfer> = Arc::new(MoonrakerHttpTransfer::new());
            (PrinterSession::new(info, adapter, transport), transfer)
        }
    }
}

/// Opaque auth material handed to the transfer strategy after connect.
fn auth_credential_map(params: &ConnectParams) -> HashMap<String, String> {
    let mut credentials = HashMap::new();
    credentials.insert(
        "authMode".to_string(),
        serde_json::to_value(params.auth_mode)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "none".to_string()),
    );
    if let Some(username) = params.username.as_deref().filter(|v| !v.is_empty()) {
        credentials.insert("username".to_string(), username.to_string());
    }
    if let Some(password) = params.password.as_deref().filter(|v| !v.is_empty()) {
        credentials.insert("password".to_string(), password.to_string());
    }
    if let Some(token) = params.token.as_deref().filter(|v| !v.is_empty()) {
        credentials.insert("token".to_string(), token.to_string());
    }
    if let Some(code) = params.access_code.as_deref().filter(|v| !v.is_empty()) {
        credentials.insert("accessCode".to_string(), code.to_string());
    }
    if let Some(pin) = params.pin_code.as_deref().filter(|v| !v.is_empty()) {
        credentials.insert("pinCode".to_string(), pin.to_string());
    }
    credentials
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuthMode;

    #[tokio::test]
    async fn operations_require_initialization() {
        let service = LanService::new();
        let err = service
            .connect_printer(ConnectParams {
                host: "192.168.1.50".to_string(),
                printer_type: Some(PrinterType::ElegooFdmCc2),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotInitialized);

        let err = service
            .start_printer_discovery(DiscoveryParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotInitialized);
    }

    #[test]
    fn auth_credentials_skip_empty_values() {
        let params = ConnectParams {
            auth_mode: AuthMode::AccessCode,
            access_code: Some("123456".to_string()),
            password: Some(String::new()),
            ..Default::default()
        };
        let map = auth_credential_map(&params);
        assert_eq!(map.get("accessCode").map(String::as_str), Some("123456"));
        assert_eq!(map.get("authMode").map(String::as_str), Some("accessCode"));
        assert!(!map.contains_key("password"));
    }

    #[test]
    fn resolve_printer_info_prefers_serial_number() {
        let service = LanService::new();
        let params = ConnectParams {
            host: "192.168.1.50".to_string(),
            serial_number: Some("F01NZQQZJS2ASC8".to_string()),
            ..Default::default()
        };
        let info = service.resolve_printer_info(&params, PrinterType::ElegooFdmCc2);
        assert_eq!(info.printer_id, "lan_F01NZQQZJS2ASC8");
        assert_eq!(info.brand, "Elegoo");

        let params = ConnectParams {
            host: "192.168.1.60".to_string(),
            ..Default::default()
        };
        let info = service.resolve_printer_info(&params, PrinterType::GenericFdmKlipper);
        assert_eq!(info.printer_id, "lan_192-168-1-60");
        assert_eq!(info.brand, "Generic");
    }
}
