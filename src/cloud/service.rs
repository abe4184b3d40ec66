use super::api::CloudApi;
use super::credentials::{CredentialStore, HttpCredential};
use super::http::CloudHttpClient;
use super::mqtt::CloudMqttService;
use super::rtm::RtmService;
use super::{CloudRegistry, UploadState};
use crate::adapter::elegoo_cc2::Cc2Adapter;
use crate::adapter::Adapter;
use crate::config::CloudConfig;
use crate::errors::{ErrorCode, Result, SdkError};
use crate::events::{EventCallback, EventDispatcher};
use crate::transfer::{CancelToken, UploadProgressCallback};
use crate::types::{
    mask, BindPrinterParams, BizEvent, CancelBindPrinterParams, CancelFileUploadParams,
    DeletePrintTasksParams, FileUploadData, FileUploadParams, FileUploadProgressData,
    GetFileDetailParams, GetFileListParams, HomeAxesParams, Method, MoveAxesParams,
    PrinterAttributesData, PrinterInfo, PrinterStatusData, RenewLicenseParams, SendRtmMessageParams,
    SetAutoRefillParams, SetFanSpeedParams, SetPrintSpeedParams, SetTemperatureParams,
    StartPrintParams, UpdatePrinterNameParams,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TOKEN_REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(300);
const TOKEN_REFRESH_WINDOW: Duration = Duration::from_secs(600);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_BIND_TIMEOUT: Duration = Duration::from_secs(30);
const BIND_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Cloud facade: credential lifecycle, REST API, telemetry fan-out and the
/// RTM request/response channel for remote printers.
///
/// Lock order (never reversed): services -> printers/registry ->
/// credentials -> callback. Callbacks always run with no lock held.
pub struct CloudService {
    config: Mutex<CloudConfig>,
    initialized: AtomicBool,
    http: Mutex<Option<Arc<CloudHttpClient>>>,
    api: Mutex<Option<Arc<CloudApi>>>,
    credentials: CredentialStore,
    registry: Arc<CloudRegistry>,
    mqtt: Arc<CloudMqttService>,
    rtm: Arc<RtmService>,
    dispatcher: Arc<EventDispatcher>,
    uploads: Mutex<HashMap<String, CancelToken>>,
    bind_cancelled: Mutex<HashSet<String>>,
    online: AtomicBool,
    monitor_stop: Arc<Notify>,
    monitor_wake: Arc<Notify>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl CloudService {
    pub fn new() -> Arc<Self> {
        let dispatcher = Arc::new(EventDispatcher::new());
        let registry = CloudRegistry::new();
        Arc::new(Self {
            config: Mutex::new(CloudConfig::default()),
            initialized: AtomicBool::new(false),
            http: Mutex::new(None),
            api: Mutex::new(None),
            credentials: CredentialStore::new(),
            registry: registry.clone(),
            mqtt: Arc::new(CloudMqttService::new(registry.clone(), dispatcher.clone())),
            rtm: Arc::new(RtmService::new(registry, dispatcher.clone())),
            dispatcher,
            uploads: Mutex::new(HashMap::new()),
            bind_cancelled: Mutex::new(HashSet::new()),
            online: AtomicBool::new(false),
            monitor_stop: Arc::new(Notify::new()),
            monitor_wake: Arc::new(Notify::new()),
            monitor_task: Mutex::new(None),
        })
    }

    pub fn initialize(self: &Arc<Self>, config: CloudConfig) -> Result<()> {
        let http = Arc::new(CloudHttpClient::new(&config)?);
        let api = Arc::new(CloudApi::new(http.clone()));
        *self.http.lock().unwrap() = Some(http);
        *self.api.lock().unwrap() = Some(api);
        *self.config.lock().unwrap() = config;
        self.initialized.store(true, Ordering::SeqCst);
        self.start_monitor();
        info!("cloud service initialized");
        Ok(())
    }

    pub async fn cleanup(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.monitor_stop.notify_waiters();
        if let Some(task) = self.monitor_task.lock().unwrap().take() {
            task.abort();
        }
        self.rtm.shutdown().await;
        self.mqtt.shutdown().await;
        self.credentials.clear_all();
        if let Some(http) = self.http.lock().unwrap().clone() {
            http.set_bearer_token(None);
        }
        self.uploads.lock().unwrap().clear();
        self.online.store(false, Ordering::SeqCst);
        info!("cloud service cleaned up");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn set_event_callback(&self, callback: EventCallback) {
        self.dispatcher.set_callback(Some(callback));
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(SdkError::not_initialized("CloudService"));
        }
        Ok(())
    }

    fn api(&self) -> Result<Arc<CloudApi>> {
        self.ensure_initialized()?;
        self.api
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SdkError::not_initialized("CloudService"))
    }

    fn http_client(&self) -> Result<Arc<CloudHttpClient>> {
        self.ensure_initialized()?;
        self.http
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SdkError::not_initialized("CloudService"))
    }

    // -----------------------------------------------------------------------
    // Credential lifecycle
    // -----------------------------------------------------------------------

    /// Install a user credential. This clears the logged-in-elsewhere latch
    /// and wakes the monitor so the sub-services connect promptly.
    pub fn set_http_credential(&self, credential: HttpCredential) -> Result<()> {
        self.ensure_initialized()?;
        self.apply_http_credential(credential)?;
        info!("HTTP credential installed");
        Ok(())
    }

    fn apply_http_credential(&self, credential: HttpCredential) -> Result<()> {
        let http = self.http_client()?;
        http.set_bearer_token(Some(credential.access_token.clone()));
        self.credentials.set_http(credential);
        self.rtm.clear_logged_in_elsewhere();
        self.monitor_wake.notify_waiters();
        Ok(())
    }

    pub fn get_http_credential(&self) -> Result<HttpCredential> {
        self.ensure_initialized()?;
        self.credentials
            .http()
            .map(|c| (*c).clone())
            .ok_or_else(|| SdkError::new(ErrorCode::ServerUnauthorized, "no HTTP credential set"))
    }

    /// Explicit refresh through the cloud endpoint; single-flight with the
    /// background monitor.
    pub async fn refresh_http_credential(&self) -> Result<HttpCredential> {
        let api = self.api()?;
        let current = self.get_http_credential()?;
        let Some(_guard) = self.credentials.try_begin_refresh() else {
            return Err(SdkError::new(
                ErrorCode::OperationInProgress,
                "credential refresh already in progress",
            ));
        };
        let refreshed = api.refresh_credential(&current.refresh_token).await?;
        self.apply_http_credential(refreshed.clone())?;
        Ok(refreshed)
    }

    pub async fn clear_http_credential(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.credentials.clear_all();
        if let Some(http) = self.http.lock().unwrap().clone() {
            http.set_bearer_token(None);
        }
        self.rtm.shutdown().await;
        self.mqtt.shutdown().await;
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        let api = self.api()?;
        if let Err(err) = api.logout().await {
            warn!("logout endpoint failed: {}", err.message);
        }
        self.clear_http_credential().await
    }

    pub fn set_region(&self, region: &str) -> Result<()> {
        let http = self.http_client()?;
        let base = {
            let mut config = self.config.lock().unwrap();
            config.region = region.to_string();
            config.api_base_url()
        };
        http.set_base_url(&base);
        info!("cloud region set to {}", region);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // REST operations
    // -----------------------------------------------------------------------

    pub async fn get_user_info(&self) -> Result<Value> {
        self.api()?.get_user_info().await
    }

    pub async fn get_rtc_token(&self, serial_number: &str) -> Result<Value> {
        self.api()?.get_rtc_token(serial_number).await
    }

    pub async fn get_license_expired_devices(&self) -> Result<Value> {
        self.api()?.get_license_expired_devices().await
    }

    pub async fn renew_license(&self, params: &RenewLicenseParams) -> Result<Value> {
        if params.serial_number.is_empty() {
            return Err(SdkError::invalid_parameter("serialNumber is required"));
        }
        let result = self.api()?.renew_license(&params.serial_number).await?;
        self.dispatcher.emit(BizEvent::new(
            Method::OnRtcTokenChanged,
            json!({ "serialNumber": params.serial_number }),
        ));
        Ok(result)
    }

    /// Fetch the bound printer list and refresh the shared registry. Each
    /// printer keeps its adapter across refreshes so the status cache
    /// survives.
    pub async fn get_printers(&self) -> Result<Vec<PrinterInfo>> {
        let printers = self.api()?.get_printers().await?;

        let mut adapters: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
        for printer in &printers {
            let adapter = self
                .registry
                .adapter(&printer.printer_id)
                .unwrap_or_else(|| {
                    let adapter: Arc<dyn Adapter> = Arc::new(Cc2Adapter::new(printer.clone()));
                    let rtm = self.rtm.clone();
                    let serial = printer.serial_number.clone();
                    adapter.set_send_callback(Arc::new(move |request| {
                        let rtm = rtm.clone();
                        let serial = serial.clone();
                        tokio::spawn(async move {
                            if let Err(err) = rtm.send_message(&serial, &request.payload).await {
                                debug!("unsolicited RTM send failed: {}", err.message);
                            }
                        });
                    }));
                    adapter
                });
            adapters.insert(printer.printer_id.clone(), adapter);
        }
        self.registry.set_printers(printers.clone(), adapters);
        Ok(printers)
    }

    // -----------------------------------------------------------------------
    // Printer access
    // -----------------------------------------------------------------------

    /// "Connecting" a cloud printer validates it against the account's
    /// printer list and reports channel reachability; there is no
    /// per-printer link to build.
    pub async fn connect_printer(&self, printer_id: &str) -> Result<(PrinterInfo, bool)> {
        self.ensure_initialized()?;
        let printer = match self.registry.printer_by_id(printer_id) {
            Some(printer) => printer,
            None => {
                self.get_printers().await?;
                self.registry
                    .printer_by_id(printer_id)
                    .ok_or_else(|| SdkError::printer_not_found(printer_id))?
            }
        };
        Ok((printer, self.rtm.is_connected()))
    }

    pub fn disconnect_printer(&self, _printer_id: &str) -> Result<()> {
        self.ensure_initialized()
    }

    pub fn is_printer_connected(&self, printer_id: &str) -> bool {
        self.registry.printer_by_id(printer_id).is_some() && self.rtm.is_connected()
    }

    fn printer(&self, printer_id: &str) -> Result<PrinterInfo> {
        self.ensure_initialized()?;
        self.registry
            .printer_by_id(printer_id)
            .ok_or_else(|| SdkError::printer_not_found(printer_id))
    }

    /// Generic request path to a remote printer over RTM.
    async fn printer_request(
        &self,
        printer_id: &str,
        method: Method,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let printer = self.printer(printer_id)?;
        self.rtm.send_request(&printer, method, params, timeout).await
    }

    pub async fn start_print(&self, params: &StartPrintParams) -> Result<()> {
        self.printer_request(
            &params.printer_id,
            Method::StartPrint,
            serde_json::to_value(params)?,
            Duration::from_secs(10),
        )
        .await
        .map(|_| ())
    }

    pub async fn pause_print(&self, printer_id: &str) -> Result<()> {
        self.printer_request(printer_id, Method::PausePrint, json!({}), DEFAULT_REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn resume_print(&self, printer_id: &str) -> Result<()> {
        self.printer_request(printer_id, Method::ResumePrint, json!({}), DEFAULT_REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn stop_print(&self, printer_id: &str) -> Result<()> {
        self.printer_request(printer_id, Method::StopPrint, json!({}), DEFAULT_REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn home_axes(&self, params: &HomeAxesParams) -> Result<()> {
        self.printer_request(
            &params.printer_id,
            Method::HomeAxes,
            serde_json::to_value(params)?,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    pub async fn move_axes(&self, params: &MoveAxesParams) -> Result<()> {
        self.printer_request(
            &params.printer_id,
            Method::MoveAxes,
            serde_json::to_value(params)?,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    pub async fn set_temperature(&self, params: &SetTemperatureParams) -> Result<()> {
        self.printer_request(
            &params.printer_id,
            Method::SetTemperature,
            serde_json::to_value(params)?,
            Duration::from_secs(3),
        )
        .await
        .map(|_| ())
    }

    pub async fn set_print_speed(&self, params: &SetPrintSpeedParams) -> Result<()> {
        self.printer_request(
            &params.printer_id,
            Method::SetPrintSpeed,
            serde_json::to_value(params)?,
            Duration::from_secs(3),
        )
        .await
        .map(|_| ())
    }

    pub async fn set_fan_speed(&self, params: &SetFanSpeedParams) -> Result<()> {
        self.printer_request(
            &params.printer_id,
            Method::SetFanSpeed,
            serde_json::to_value(params)?,
            Duration::from_secs(3),
        )
        .await
        .map(|_| ())
    }

    pub async fn set_auto_refill(&self, params: &SetAutoRefillParams) -> Result<()> {
        self.printer_request(
            &params.printer_id,
            Method::SetAutoRefill,
            serde_json::to_value(params)?,
            Duration::from_secs(3),
        )
        .await
        .map(|_| ())
    }

    pub async fn get_canvas_status(&self, printer_id: &str) -> Result<Value> {
        self.printer_request(printer_id, Method::GetCanvasStatus, json!({}), Duration::from_secs(3))
            .await
    }

    pub async fn get_printer_status(&self, printer_id: &str) -> Result<PrinterStatusData> {
        let data = self
            .printer_request(
                printer_id,
                Method::GetPrinterStatus,
                json!({ "printerId": printer_id }),
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        Ok(PrinterStatusData {
            printer_id: printer_id.to_string(),
            printer_status: data,
        })
    }

    pub async fn get_printer_attributes(&self, printer_id: &str) -> Result<PrinterAttributesData> {
        let data = self
            .printer_request(
                printer_id,
                Method::GetPrinterAttributes,
                json!({ "printerId": printer_id }),
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        Ok(PrinterAttributesData {
            printer_id: printer_id.to_string(),
            printer_attributes: data,
        })
    }

    /// The merged cached status document, as last reported by telemetry.
    pub fn get_printer_status_raw(&self, printer_id: &str) -> Result<String> {
        self.printer(printer_id)?;
        let adapter = self.registry.adapter(printer_id).ok_or_else(|| {
            SdkError::new(ErrorCode::NotConnectedToSubservice, "no adapter for printer")
        })?;
        Ok(adapter.cached_full_status().to_string())
    }

    pub fn refresh_printer_status(&self, printer_id: &str) -> Result<()> {
        self.printer(printer_id)?;
        if let Some(adapter) = self.registry.adapter(printer_id) {
            adapter.send_to_printer(Method::GetPrinterStatus, json!({}));
        }
        Ok(())
    }

    pub fn refresh_printer_attributes(&self, printer_id: &str) -> Result<()> {
        self.printer(printer_id)?;
        if let Some(adapter) = self.registry.adapter(printer_id) {
            adapter.send_to_printer(Method::GetPrinterAttributes, json!({}));
        }
        Ok(())
    }

    pub async fn get_file_list(&self, params: &GetFileListParams) -> Result<Value> {
        self.printer_request(
            &params.printer_id,
            Method::GetFileList,
            serde_json::to_value(params)?,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    }

    pub async fn get_file_detail(&self, params: &GetFileDetailParams) -> Result<Value> {
        self.printer_request(
            &params.printer_id,
            Method::GetFileDetail,
            serde_json::to_value(params)?,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    }

    pub async fn get_print_task_list(&self, printer_id: &str) -> Result<Value> {
        self.printer_request(printer_id, Method::GetPrintTaskList, json!({}), DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    pub async fn delete_print_tasks(&self, params: &DeletePrintTasksParams) -> Result<Value> {
        self.printer_request(
            &params.printer_id,
            Method::DeletePrintTasks,
            serde_json::to_value(params)?,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    }

    pub async fn update_printer_name(&self, params: &UpdatePrinterNameParams) -> Result<()> {
        let printer = self.printer(&params.printer_id)?;
        self.api()?
            .update_printer_name(&printer.serial_number, &params.name)
            .await?;
        let _ = self.get_printers().await;
        Ok(())
    }

    pub async fn send_rtm_message(&self, params: &SendRtmMessageParams) -> Result<()> {
        let printer = self.printer(&params.printer_id)?;
        self.rtm.send_message(&printer.serial_number, &params.message).await
    }

    // -----------------------------------------------------------------------
    // Binding
    // -----------------------------------------------------------------------

    /// Bind a printer to this account: issue the REST bind, then wait for
    /// the printer-side confirmation event that telemetry latches.
    pub async fn bind_printer(&self, params: &BindPrinterParams) -> Result<PrinterInfo> {
        if params.serial_number.is_empty() {
            return Err(SdkError::invalid_parameter("serialNumber is required"));
        }
        let api = self.api()?;
        self.bind_cancelled.lock().unwrap().remove(&params.serial_number);

        api.bind_printer(&params.serial_number, &params.name).await?;

        let timeout = if params.timeout_ms > 0 {
            Duration::from_millis(params.timeout_ms)
        } else {
            DEFAULT_BIND_TIMEOUT
        };
        let deadline = Instant::now() + timeout;

        loop {
            if self
                .bind_cancelled
                .lock()
                .unwrap()
                .remove(&params.serial_number)
            {
                return Err(SdkError::cancelled("bind cancelled"));
            }
            if self.mqtt.take_bind_result(&params.serial_number) {
                info!("printer {} bound", mask(&params.serial_number));
                let printers = self.get_printers().await?;
                return printers
                    .into_iter()
                    .find(|p| p.serial_number == params.serial_number)
                    .ok_or_else(|| {
                        SdkError::new(
                            ErrorCode::ServerInvalidResponse,
                            "bound printer missing from printer list",
                        )
                    });
            }
            if Instant::now() >= deadline {
                return Err(SdkError::timeout("printer bind confirmation timed out"));
            }
            tokio::time::sleep(BIND_POLL_INTERVAL).await;
        }
    }

    pub fn cancel_bind_printer(&self, params: &CancelBindPrinterParams) -> Result<()> {
        self.ensure_initialized()?;
        self.bind_cancelled
            .lock()
            .unwrap()
            .insert(params.serial_number.clone());
        Ok(())
    }

    pub async fn unbind_printer(&self, serial_number: &str) -> Result<()> {
        self.api()?.unbind_printer(serial_number).await?;
        let _ = self.get_printers().await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // File upload
    // -----------------------------------------------------------------------

    /// Cloud upload: push the file to storage with progress, then hand the
    /// resulting URL to the printer. Telemetry shows the synthetic
    /// uploading status for the duration.
    pub async fn upload_file(
        &self,
        params: &FileUploadParams,
        on_progress: Option<UploadProgressCallback>,
    ) -> Result<FileUploadData> {
        let printer = self.printer(&params.printer_id)?;
        let api = self.api()?;
        let http = self.http_client()?;

        let file_name = crate::transfer::resolve_file_name(params)?;

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
        self.registry.set_upload_state(
            &params.printer_id,
            UploadState {
                uploading: true,
                progress: 0,
            },
        );

        let result = self
            .run_upload(&printer, params, &file_name, api, http, on_progress, cancel)
            .await;

        self.uploads.lock().unwrap().remove(&params.printer_id);
        self.registry.clear_upload_state(&params.printer_id);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_upload(
        &self,
        printer: &PrinterInfo,
        params: &FileUploadParams,
        file_name: &str,
        api: Arc<CloudApi>,
        http: Arc<CloudHttpClient>,
        on_progress: Option<UploadProgressCallback>,
        cancel: CancelToken,
    ) -> Result<FileUploadData> {
        let (upload_url, file_url) = api.get_upload_url(file_name).await?;

        let registry = self.registry.clone();
        let dispatcher = self.dispatcher.clone();
        let printer_id = printer.printer_id.clone();
        let name_for_progress = file_name.to_string();
        let user_callback = on_progress.clone();

        let progress = Arc::new(move |sent: u64, total: u64| -> bool {
            let percent = ((sent * 100 / total.max(1)) as u8).min(99);
            registry.set_upload_state(
                &printer_id,
                UploadState {
                    uploading: true,
                    progress: percent,
                },
            );
            let update = FileUploadProgressData {
                printer_id: printer_id.clone(),
                file_name: name_for_progress.clone(),
                progress: percent,
            };
            dispatcher.emit(BizEvent::new(
                Method::OnFileTransferProgress,
                serde_json::to_value(&update).unwrap_or_default(),
            ));
            user_callback.as_ref().map(|cb| cb(&update)).unwrap_or(true)
        });

        http.put_binary(&upload_url, &params.local_file_path, progress, cancel)
            .await?;

        // The printer pulls the file from storage.
        self.rtm
            .send_request(
                printer,
                Method::SetPrinterDownloadFile,
                json!({ "fileUrl": file_url, "fileName": file_name }),
                Duration::from_secs(30),
            )
            .await?;

        let done = FileUploadProgressData {
            printer_id: printer.printer_id.clone(),
            file_name: file_name.to_string(),
            progress: 100,
        };
        self.dispatcher.emit(BizEvent::new(
            Method::OnFileTransferProgress,
            serde_json::to_value(&done).unwrap_or_default(),
        ));
        if let Some(callback) = on_progress {
            callback(&done);
        }

        Ok(FileUploadData {
            printer_id: printer.printer_id.clone(),
            file_name: file_name.to_string(),
        })
    }

    pub fn cancel_file_upload(&self, params: &CancelFileUploadParams) -> Result<()> {
        self.ensure_initialized()?;
        if let Some(token) = self.uploads.lock().unwrap().get(&params.printer_id) {
            token.cancel();
            info!("cloud upload cancellation requested for {}", mask(&params.printer_id));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Background monitor
    // -----------------------------------------------------------------------

    fn start_monitor(self: &Arc<Self>) {
        let service = self.clone();
        let task = tokio::spawn(async move {
            let mut last_refresh_check = Instant::now();
            loop {
                let interval = {
                    let config = service.config.lock().unwrap();
                    Duration::from_secs(config.connection_monitor_interval_secs.max(1))
                };
                tokio::select! {
                    _ = service.monitor_stop.notified() => break,
                    _ = service.monitor_wake.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
                if !service.is_initialized() {
                    break;
                }

                service.ensure_services_connected().await;
                service.update_online_status();

                if last_refresh_check.elapsed() >= TOKEN_REFRESH_CHECK_INTERVAL {
                    last_refresh_check = Instant::now();
                    service.check_credential_refresh().await;
                }
            }
            debug!("cloud connection monitor exited");
        });
        *self.monitor_task.lock().unwrap() = Some(task);
    }

    /// Bring the telemetry and RTM channels up whenever a credential is
    /// present and the account is not latched out.
    async fn ensure_services_connected(&self) {
        if self.credentials.http().is_none() || self.rtm.is_logged_in_elsewhere() {
            return;
        }
        let Ok(api) = self.api() else { return };

        if !self.mqtt.is_connected() {
            let credential = match self.credentials.mqtt() {
                Some(credential) => Some((*credential).clone()),
                None => match api.get_mqtt_credential().await {
                    Ok(credential) => {
                        self.credentials.set_mqtt(credential.clone());
                        Some(credential)
                    }
                    Err(err) => {
                        debug!("mqtt credential fetch failed: {}", err.message);
                        None
                    }
                },
            };
            if let Some(credential) = credential {
                self.mqtt.configure(credential).await;
            }
        }

        if !self.rtm.is_connected() {
            let credential = match self.credentials.agora() {
                Some(credential) => Some((*credential).clone()),
                None => match api.get_agora_credential().await {
                    Ok(credential) => {
                        self.credentials.set_agora(credential.clone());
                        Some(credential)
                    }
                    Err(err) => {
                        debug!("rtm credential fetch failed: {}", err.message);
                        None
                    }
                },
            };
            if let Some(credential) = credential {
                let gateway = self.config.lock().unwrap().rtm_gateway_url();
                self.rtm.connect(gateway, credential).await;
            }
        }

        // Keep the printer registry warm once a channel is available.
        if self.registry.printers().is_empty() && self.mqtt.is_connected() {
            let _ = self.get_printers().await;
        }
    }

    /// Refresh the HTTP credential shortly before expiry and push renewed
    /// sub-service credentials. Reconnect only when the identity changed;
    /// otherwise the new tokens take effect on the next reconnect.
    async fn check_credential_refresh(&self) {
        let Some(current) = self.credentials.http() else { return };
        if !current.expires_within(TOKEN_REFRESH_WINDOW) {
            return;
        }
        let Some(_guard) = self.credentials.try_begin_refresh() else { return };
        let Ok(api) = self.api() else { return };

        info!("HTTP credential close to expiry, refreshing");
        let refreshed = match api.refresh_credential(&current.refresh_token).await {
            Ok(refreshed) => refreshed,
            Err(err) => {
                warn!("credential refresh failed: {}", err.message);
                return;
            }
        };
        if let Ok(http) = self.http_client() {
            http.set_bearer_token(Some(refreshed.access_token.clone()));
        }
        self.credentials.set_http(refreshed);

        if let Ok(mqtt_credential) = api.get_mqtt_credential().await {
            self.credentials.set_mqtt(mqtt_credential.clone());
            self.mqtt.configure(mqtt_credential).await;
        }
        if let Ok(agora_credential) = api.get_agora_credential().await {
            let user_changed = {
                let previous = self.credentials.agora();
                previous
                    .map(|p| {
                        p.rtm_user_id != agora_credential.rtm_user_id
                            || p.app_user_id != agora_credential.app_user_id
                    })
                    .unwrap_or(true)
            };
            self.credentials.set_agora(agora_credential.clone());
            if user_changed {
                let gateway = self.config.lock().unwrap().rtm_gateway_url();
                self.rtm.connect(gateway, agora_credential).await;
            }
            self.dispatcher
                .emit(BizEvent::new(Method::OnRtcTokenChanged, json!({})));
        }
    }

    fn update_online_status(&self) {
        let online = self.mqtt.is_connected() || self.rtm.is_connected();
        if self.online.swap(online, Ordering::SeqCst) != online {
            self.dispatcher.emit(BizEvent::new(
                Method::OnOnlineStatusChanged,
                json!({ "online": online }),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_require_initialization() {
        let service = CloudService::new();
        assert!(!service.is_initialized());

        let err = service.get_http_credential().unwrap_err();
        assert_eq!(err.code, ErrorCode::NotInitialized);

        let err = service.get_user_info().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotInitialized);
    }

    #[tokio::test]
    async fn missing_credential_is_unauthorized() {
        let service = CloudService::new();
        service.initialize(CloudConfig::default()).unwrap();

        let err = service.get_http_credential().unwrap_err();
        assert_eq!(err.code, ErrorCode::ServerUnauthorized);

        service.cleanup().await;
    }
}
