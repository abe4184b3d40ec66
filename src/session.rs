use crate::adapter::{Adapter, MessageKind, PrinterRequest, PENDING_SWEEP_INTERVAL};
use crate::connection::ConnectionManager;
use crate::errors::{ErrorCode, Result, SdkError};
use crate::transport::Transport;
use crate::types::{
    mask, BizEvent, ConnectParams, ConnectionState, ConnectionStatusData, DeletePrintTasksParams,
    GetFileDetailParams, GetFileListParams, HomeAxesParams, Method, MoveAxesParams, PrinterAttributesData,
    PrinterInfo, PrinterStatusData, SetAutoRefillParams, SetFanSpeedParams, SetPrintSpeedParams,
    SetTemperatureParams, StartPrintParams, UpdatePrinterNameParams,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);
const STATUS_POLL_TIMEOUT: Duration = Duration::from_secs(3);

type Reply = Result<Value>;

pub type SessionEventCallback = Arc<dyn Fn(BizEvent) + Send + Sync>;

/// The per-printer object owned by the LAN service: one connection manager
/// plus one adapter, and the pending-request map that correlates responses
/// to waiting callers.
///
/// Every caller observes exactly one outcome per request: the matching
/// response, OperationTimeout, or OperationCancelled on teardown.
pub struct PrinterSession {
    info: Mutex<PrinterInfo>,
    manager: Arc<ConnectionManager>,
    adapter: Arc<dyn Adapter>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    event_callback: Mutex<Option<SessionEventCallback>>,
    polling_running: AtomicBool,
    polling_stop: Notify,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PrinterSession {
    pub fn new(
        info: PrinterInfo,
        adapter: Arc<dyn Adapter>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let manager = ConnectionManager::new(transport.clone());
        let session = Arc::new(Self {
            info: Mutex::new(info),
            manager,
            adapter,
            pending: Mutex::new(HashMap::new()),
            event_callback: Mutex::new(None),
            polling_running: AtomicBool::new(false),
            polling_stop: Notify::new(),
            sweeper: Mutex::new(None),
        });

        // All back-references are weak; the service registry is the only
        // owner of the session.
        let weak = Arc::downgrade(&session);
        session.manager.set_status_callback(Arc::new(move |connected| {
            if let Some(session) = weak.upgrade() {
                session.on_status_changed(connected);
            }
        }));

        let weak = Arc::downgrade(&session);
        transport.set_message_handler(Arc::new(move |payload| {
            if let Some(session) = weak.upgrade() {
                session.on_message(&payload);
            }
        }));

        let weak = Arc::downgrade(&session);
        session.adapter.set_send_callback(Arc::new(move |request| {
            if let Some(session) = weak.upgrade() {
                session.send_unsolicited(request);
            }
        }));

        let weak: Weak<PrinterSession> = Arc::downgrade(&session);
        let sweeper = tokio::spawn(async move {
            loop {
                tokio::time::sleep(PENDING_SWEEP_INTERVAL).await;
                let Some(session) = weak.upgrade() else { break };
                session.adapter.expire_stale_requests();
            }
        });
        *session.sweeper.lock().unwrap() = Some(sweeper);

        session
    }

    pub fn printer_info(&self) -> PrinterInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn update_printer_info(&self, info: PrinterInfo) {
        *self.info.lock().unwrap() = info;
    }

    pub fn adapter(&self) -> Arc<dyn Adapter> {
        self.adapter.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn set_event_callback(&self, callback: SessionEventCallback) {
        *self.event_callback.lock().unwrap() = Some(callback);
    }

    pub async fn connect(self: &Arc<Self>, params: &ConnectParams) -> Result<()> {
        self.manager.connect(params.clone(), params.auto_reconnect).await
    }

    /// Disconnect and release workers. Pending callers observe
    /// OperationCancelled through the status transition.
    pub async fn shutdown(&self) {
        self.manager.disconnect().await;
        self.polling_stop.notify_waiters();
        if let Some(sweeper) = self.sweeper.lock().unwrap().take() {
            sweeper.abort();
        }
        // Teardown with no prior status transition still settles callers.
        self.cancel_pending("Session torn down");
    }

    // -----------------------------------------------------------------------
    // Request execution
    // -----------------------------------------------------------------------

    /// The generic request path every typed operation delegates to:
    /// convert, record the pending entry, send, then wait for the inbound
    /// pump (or the timeout) to settle the reply.
    pub async fn execute(
        self: &Arc<Self>,
        method: Method,
        params: Value,
        label: &str,
        timeout: Duration,
    ) -> Result<Value> {
        if !self.manager.is_connected() {
            return Err(SdkError::new(
                ErrorCode::PrinterConnectionError,
                "Printer not connected",
            ));
        }

        let timeout = if timeout.is_zero() { DEFAULT_REQUEST_TIMEOUT } else { timeout };
        let request = self.adapter.convert_request(method, &params, timeout);
        if !request.is_valid() {
            return Err(SdkError::new(request.code, request.message));
        }
        let request_id = request.request_id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id.clone(), tx);

        debug!(
            "{}: sending request {} to printer {}",
            label,
            request_id,
            mask(&self.printer_info().printer_id)
        );

        if let Err(err) = self.manager.send(&request.payload).await {
            self.pending.lock().unwrap().remove(&request_id);
            return Err(SdkError::new(
                ErrorCode::PrinterCommandFailed,
                format!("Failed to send command: {}", err.message),
            ));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(SdkError::cancelled("Session torn down")),
            Err(_) => {
                // Whoever removes the entry owns the resolution; if the
                // pump got there first the response already won.
                self.pending.lock().unwrap().remove(&request_id);
                warn!(
                    "{}: request {} timed out after {}ms",
                    label,
                    request_id,
                    timeout.as_millis()
                );
                Err(SdkError::timeout(format!(
                    "Request timed out after {} milliseconds",
                    timeout.as_millis()
                )))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound pump
    // -----------------------------------------------------------------------

    fn on_message(&self, payload: &str) {
        let kinds = self.adapter.parse_message_kinds(payload);
        if kinds.is_empty() {
            debug!(
                "unclassified message from printer {}",
                mask(&self.printer_info().printer_id)
            );
            return;
        }

        for kind in kinds {
            match kind {
                MessageKind::Response => {
                    let response = self.adapter.convert_to_response(payload);
                    if !response.is_valid() {
                        if response.message.contains("No request mapping found") {
                            debug!("response with no request mapping, dropped as noise");
                        } else {
                            warn!("invalid response message: {}", response.message);
                        }
                        continue;
                    }
                    let waiter = self.pending.lock().unwrap().remove(&response.request_id);
                    match waiter {
                        Some(tx) => {
                            let reply = if response.code == ErrorCode::Success {
                                Ok(response.data.unwrap_or_else(|| json!({})))
                            } else {
                                Err(SdkError::new(response.code, response.message))
                            };
                            let _ = tx.send(reply);
                        }
                        None => {
                            warn!("received response for unknown request id {}", response.request_id);
                        }
                    }
                }
                MessageKind::Event => {
                    let event = self.adapter.convert_to_event(payload);
                    if event.is_valid() {
                        self.emit(BizEvent::new(event.method, event.data.unwrap()));
                    }
                }
            }
        }
    }

    fn emit(&self, event: BizEvent) {
        let callback = self.event_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn cancel_pending(&self, reason: &str) {
        let waiters: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        if waiters.is_empty() {
            return;
        }
        info!(
            "cancelling {} pending requests for printer {}: {}",
            waiters.len(),
            mask(&self.printer_info().printer_id),
            reason
        );
        for (_, tx) in waiters {
            let _ = tx.send(Err(SdkError::cancelled(reason)));
        }
    }

    // -----------------------------------------------------------------------
    // Status transitions
    // -----------------------------------------------------------------------

    fn on_status_changed(self: Arc<Self>, connected: bool) {
        let printer_id = self.printer_info().printer_id;
        info!(
            "printer {} connection status changed: {}",
            mask(&printer_id),
            if connected { "connected" } else { "disconnected" }
        );

        let status = ConnectionStatusData {
            printer_id: printer_id.clone(),
            status: if connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            },
        };
        self.emit(BizEvent::new(
            Method::OnConnectionStatus,
            serde_json::to_value(status).unwrap_or_default(),
        ));

        if connected {
            self.start_status_polling();
        } else {
            self.cancel_pending("Connection lost");
            self.polling_stop.notify_waiters();
            // Stale readings must not survive into the next connect.
            self.adapter.clear_status_cache();
            self.emit(BizEvent::new(
                Method::OnPrinterStatus,
                serde_json::to_value(PrinterStatusData::offline(&printer_id)).unwrap_or_default(),
            ));
        }
    }

    /// Bounded post-connect polling: ask for status every 2 s (3 s timeout
    /// per try) until the first success, a disconnect, or teardown.
    fn start_status_polling(self: &Arc<Self>) {
        if self.polling_running.swap(true, Ordering::SeqCst) {
            debug!("status polling already running");
            return;
        }

        let session = self.clone();
        tokio::spawn(async move {
            let printer_id = session.printer_info().printer_id;
            debug!("status polling started for printer {}", mask(&printer_id));
            loop {
                if !session.is_connected() {
                    break;
                }
                let result = session
                    .execute(
                        Method::GetPrinterStatus,
                        json!({ "printerId": printer_id }),
                        "status poll",
                        STATUS_POLL_TIMEOUT,
                    )
                    .await;
                match result {
                    Ok(_) => {
                        info!("obtained initial status for printer {}", mask(&printer_id));
                        break;
                    }
                    Err(err) => {
                        debug!("status poll failed: {}", err.message);
                    }
                }
                tokio::select! {
                    _ = session.polling_stop.notified() => break,
                    _ = tokio::time::sleep(STATUS_POLL_INTERVAL) => {}
                }
            }
            session.polling_running.store(false, Ordering::SeqCst);
            debug!("status polling exited for printer {}", mask(&printer_id));
        });
    }

    /// Fire-and-forget sends initiated by the adapter itself (status
    /// refreshes, resync requests).
    fn send_unsolicited(self: Arc<Self>, request: PrinterRequest) {
        tokio::spawn(async move {
            if let Err(err) = self.manager.send(&request.payload).await {
                error!(
                    "failed to send unsolicited {:?} request: {}",
                    request.method, err.message
                );
            }
        });
    }

    // -----------------------------------------------------------------------
    // Typed operations
    // -----------------------------------------------------------------------

    pub async fn start_print(self: &Arc<Self>, params: &StartPrintParams) -> Result<()> {
        self.execute(
            Method::StartPrint,
            serde_json::to_value(params)?,
            "Starting print",
            Duration::from_secs(10),
        )
        .await
        .map(|_| ())
    }

    pub async fn pause_print(self: &Arc<Self>) -> Result<()> {
        self.execute(Method::PausePrint, json!({}), "Pausing print", DEFAULT_REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn resume_print(self: &Arc<Self>) -> Result<()> {
        self.execute(Method::ResumePrint, json!({}), "Resuming print", DEFAULT_REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn stop_print(self: &Arc<Self>) -> Result<()> {
        self.execute(Method::StopPrint, json!({}), "Stopping print", DEFAULT_REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn set_auto_refill(self: &Arc<Self>, params: &SetAutoRefillParams) -> Result<()> {
        self.execute(
            Method::SetAutoRefill,
            serde_json::to_value(params)?,
            "Setting auto refill",
            Duration::from_secs(3),
        )
        .await
        .map(|_| ())
    }

    pub async fn update_printer_name(self: &Arc<Self>, params: &UpdatePrinterNameParams) -> Result<()> {
        self.execute(
            Method::UpdatePrinterName,
            serde_json::to_value(params)?,
            "Updating printer name",
            Duration::from_secs(3),
        )
        .await
        .map(|_| ())
    }

    pub async fn home_axes(self: &Arc<Self>, params: &HomeAxesParams) -> Result<()> {
        self.execute(
            Method::HomeAxes,
            serde_json::to_value(params)?,
            "Homing axes",
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    pub async fn move_axes(self: &Arc<Self>, params: &MoveAxesParams) -> Result<()> {
        self.execute(
            Method::MoveAxes,
            serde_json::to_value(params)?,
            "Moving axes",
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    pub async fn set_temperature(self: &Arc<Self>, params: &SetTemperatureParams) -> Result<()> {
        self.execute(
            Method::SetTemperature,
            serde_json::to_value(params)?,
            "Setting temperature",
            Duration::from_secs(3),
        )
        .await
        .map(|_| ())
    }

    pub async fn set_print_speed(self: &Arc<Self>, params: &SetPrintSpeedParams) -> Result<()> {
        self.execute(
            Method::SetPrintSpeed,
            serde_json::to_value(params)?,
            "Setting print speed",
            Duration::from_secs(3),
        )
        .await
        .map(|_| ())
    }

    pub async fn set_fan_speed(self: &Arc<Self>, params: &SetFanSpeedParams) -> Result<()> {
        self.execute(
            Method::SetFanSpeed,
            serde_json::to_value(params)?,
            "Setting fan speed",
            Duration::from_secs(3),
        )
        .await
        .map(|_| ())
    }

    pub async fn get_printer_status(self: &Arc<Self>, timeout: Duration) -> Result<PrinterStatusData> {
        let printer_id = self.printer_info().printer_id;
        let data = self
            .execute(
                Method::GetPrinterStatus,
                json!({ "printerId": printer_id }),
                "Getting printer status",
                timeout,
            )
            .await?;
        Ok(PrinterStatusData {
            printer_id,
            printer_status: data,
        })
    }

    pub async fn get_printer_attributes(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<PrinterAttributesData> {
        let printer_id = self.printer_info().printer_id;
        let data = self
            .execute(
                Method::GetPrinterAttributes,
                json!({ "printerId": printer_id }),
                "Getting printer attributes",
                timeout,
            )
            .await?;
        Ok(PrinterAttributesData {
            printer_id,
            printer_attributes: data,
        })
    }

    pub async fn get_canvas_status(self: &Arc<Self>) -> Result<Value> {
        self.execute(
            Method::GetCanvasStatus,
            json!({}),
            "Getting canvas status",
            Duration::from_secs(3),
        )
        .await
    }

    pub async fn get_file_list(self: &Arc<Self>, params: &GetFileListParams) -> Result<Value> {
        self.execute(
            Method::GetFileList,
            serde_json::to_value(params)?,
            "Getting file list",
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    }

    pub async fn get_file_detail(self: &Arc<Self>, params: &GetFileDetailParams) -> Result<Value> {
        self.execute(
            Method::GetFileDetail,
            serde_json::to_value(params)?,
            "Getting file detail",
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    }

    pub async fn get_print_task_list(self: &Arc<Self>) -> Result<Value> {
        self.execute(
            Method::GetPrintTaskList,
            json!({}),
            "Getting print task list",
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    }

    pub async fn delete_print_tasks(self: &Arc<Self>, params: &DeletePrintTasksParams) -> Result<Value> {
        self.execute(
            Method::DeletePrintTasks,
            serde_json::to_value(params)?,
            "Deleting print tasks",
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    }

    /// Fire-and-forget refresh; the result arrives as an event.
    pub fn refresh_printer_status(&self) {
        self.adapter.send_to_printer(Method::GetPrinterStatus, json!({}));
    }

    /// Fire-and-forget refresh; the result arrives as an event.
    pub fn refresh_printer_attributes(&self) {
        self.adapter.send_to_printer(Method::GetPrinterAttributes, json!({}));
    }
}
