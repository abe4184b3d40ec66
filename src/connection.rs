use crate::errors::{ErrorCode, Result, SdkError};
use crate::transport::{LinkEvent, Transport};
use crate::types::{ConnectParams, ConnectionState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Cadence of the auto-reconnect worker.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
/// Debounce window before a link interruption becomes observable.
const DELAYED_RECONNECT_MS: u64 = 500;

pub type StatusCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Owns one transport and its connection lifecycle independent of protocol
/// specifics: fail-fast connect, the explicit registration phase, the
/// auto-reconnect worker, the delayed-reconnect debounce and the heartbeat
/// worker.
///
/// The declared state here is authoritative; the transport's own link state
/// is only consulted to corroborate. The status callback fires on declared
/// transitions only, outside any internal lock, exactly once per transition.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
    last_params: Mutex<Option<ConnectParams>>,

    auto_reconnect_enabled: AtomicBool,
    should_reconnect: AtomicBool,
    reconnecting: AtomicBool,
    connecting: AtomicBool,
    delayed_pending: AtomicBool,

    reconnect_cancel: Notify,
    delayed_cancel: Notify,
    heartbeat_cancel: Notify,

    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    delayed_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,

    status_callback: Mutex<Option<StatusCallback>>,
    last_notified: Mutex<Option<bool>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let manager = Arc::new(Self {
            transport,
            state: Mutex::new(ConnectionState::Disconnected),
            last_params: Mutex::new(None),
            auto_reconnect_enabled: AtomicBool::new(true),
            should_reconnect: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            delayed_pending: AtomicBool::new(false),
            reconnect_cancel: Notify::new(),
            delayed_cancel: Notify::new(),
            heartbeat_cancel: Notify::new(),
            reconnect_task: Mutex::new(None),
            delayed_task: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
            status_callback: Mutex::new(None),
            last_notified: Mutex::new(None),
        });

        let weak = Arc::downgrade(&manager);
        manager
            .transport
            .set_link_event_handler(Arc::new(move |event| {
                if let Some(manager) = weak.upgrade() {
                    match event {
                        LinkEvent::Interrupted => manager.on_link_interrupted(),
                        LinkEvent::Recovered => manager.notify_connection_recovered(),
                    }
                }
            }));

        manager
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.status_callback.lock().unwrap() = Some(callback);
    }

    /// True iff the declared state is Connected and the transport reports
    /// its underlying link open.
    pub fn is_connected(&self) -> bool {
        *self.state.lock().unwrap() == ConnectionState::Connected && self.transport.is_open()
    }

    pub async fn connect(self: &Arc<Self>, params: ConnectParams, auto_reconnect: bool) -> Result<()> {
        self.auto_reconnect_enabled.store(auto_reconnect, Ordering::SeqCst);

        if self.is_connected() {
            return Err(SdkError::new(
                ErrorCode::PrinterAlreadyConnected,
                format!(
                    "Printer already connected via {}. Use disconnect() first if you want to reconnect.",
                    self.transport.protocol_name()
                ),
            ));
        }
        if self.connecting.load(Ordering::SeqCst) {
            return Err(SdkError::new(
                ErrorCode::OperationInProgress,
                "Another connection attempt is already in progress",
            ));
        }

        *self.last_params.lock().unwrap() = Some(params.clone());

        let result = self.connect_cycle(&params).await;

        if let Err(err) = &result {
            debug!(
                "{} connect failed: {}",
                self.transport.protocol_name(),
                err.message
            );
            if auto_reconnect && !params.check_connection {
                self.start_reconnect_if_needed();
            }
        }
        result
    }

    /// One full connect attempt: open the link, run the registration phase
    /// when the protocol requires it, then declare Connected and start the
    /// heartbeat worker. Shared by `connect` and the reconnect worker.
    async fn connect_cycle(self: &Arc<Self>, params: &ConnectParams) -> Result<()> {
        if self
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SdkError::new(
                ErrorCode::OperationInProgress,
                "Another connection attempt is already in progress",
            ));
        }

        self.set_state(ConnectionState::Connecting);

        let result = async {
            self.transport.open(params).await?;
            if self.transport.requires_registration() {
                info!("printer requires registration, starting handshake");
                self.set_state(ConnectionState::Registering);
                if let Err(err) = self.transport.register(params).await {
                    self.transport.close().await;
                    return Err(err);
                }
                info!("printer registration completed");
            }
            Ok(())
        }
        .await;

        self.connecting.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!("{} connected successfully", self.transport.protocol_name());
                self.notify_status(true);
                self.start_heartbeat();
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Disable reconnection, tear down the link and the workers, and emit
    /// status=false if this session was connected. Idempotent.
    pub async fn disconnect(&self) {
        self.auto_reconnect_enabled.store(false, Ordering::SeqCst);
        self.should_reconnect.store(false, Ordering::SeqCst);
        self.delayed_pending.store(false, Ordering::SeqCst);
        self.delayed_cancel.notify_waiters();
        self.reconnect_cancel.notify_waiters();
        self.heartbeat_cancel.notify_waiters();

        for slot in [&self.reconnect_task, &self.delayed_task, &self.heartbeat_task] {
            if let Some(task) = slot.lock().unwrap().take() {
                task.abort();
            }
        }

        let was_connected = {
            let mut state = self.state.lock().unwrap();
            let was = *state == ConnectionState::Connected;
            *state = ConnectionState::Disconnected;
            was
        };

        self.transport.close().await;
        if was_connected {
            info!("{} disconnected", self.transport.protocol_name());
            self.notify_status(false);
        }
    }

    /// Cancel a pending delayed reconnect and re-assert Connected; used when
    /// the link recovers inside the debounce window.
    pub fn notify_connection_recovered(&self) {
        self.delayed_pending.store(false, Ordering::SeqCst);
        self.delayed_cancel.notify_waiters();
        self.set_state(ConnectionState::Connected);
        info!(
            "{} connection recovered - reconnection cancelled",
            self.transport.protocol_name()
        );
        self.notify_status(true);
    }

    pub async fn send(&self, payload: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(SdkError::new(
                ErrorCode::PrinterConnectionError,
                "Printer not connected",
            ));
        }
        self.transport.send(payload).await
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Fire the status callback only when the notified value changes, with
    /// no internal lock held during the call.
    fn notify_status(&self, connected: bool) {
        {
            let mut last = self.last_notified.lock().unwrap();
            if *last == Some(connected) {
                return;
            }
            *last = Some(connected);
        }
        let callback = self.status_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(connected);
        }
    }

    /// Debounced reaction to a transport-reported link interruption: wait
    /// the delay window, and only if the link did not recover declare the
    /// connection lost and start reconnecting.
    fn on_link_interrupted(self: Arc<Self>) {
        // A deliberate disconnect also tears the link down; that is not an
        // interruption.
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        warn!("{} link interrupted", self.transport.protocol_name());
        self.delayed_cancel.notify_waiters();
        self.delayed_pending.store(true, Ordering::SeqCst);

        let manager = self.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = manager.delayed_cancel.notified() => {
                    debug!("delayed reconnect cancelled - connection recovered");
                    return;
                }
                _ = tokio::time::sleep(Duration::from_millis(DELAYED_RECONNECT_MS)) => {}
            }
            if !manager.delayed_pending.swap(false, Ordering::SeqCst) {
                return;
            }
            if manager.transport.is_open() || manager.state() == ConnectionState::Disconnected {
                return;
            }
            manager.set_state(ConnectionState::ConnectionLost);
            manager.notify_status(false);
            manager.start_reconnect_if_needed();
        });
        *self.delayed_task.lock().unwrap() = Some(task);
    }

    fn start_reconnect_if_needed(self: &Arc<Self>) {
        if !self.auto_reconnect_enabled.load(Ordering::SeqCst) {
            return;
        }
        if self.last_params.lock().unwrap().is_none() {
            return;
        }
        if self.reconnecting.load(Ordering::SeqCst)
            || self.connecting.load(Ordering::SeqCst)
            || self.is_connected()
        {
            return;
        }

        self.should_reconnect.store(true, Ordering::SeqCst);
        self.reconnecting.store(true, Ordering::SeqCst);

        let manager = self.clone();
        let task = tokio::spawn(async move {
            loop {
                if !manager.should_reconnect.load(Ordering::SeqCst) || manager.is_connected() {
                    break;
                }

                tokio::select! {
                    _ = manager.reconnect_cancel.notified() => break,
                    _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
                }
                if !manager.should_reconnect.load(Ordering::SeqCst) || manager.is_connected() {
                    break;
                }

                let params = manager.last_params.lock().unwrap().clone();
                let Some(params) = params else { break };

                manager.set_state(ConnectionState::Reconnecting);
                info!(
                    "{} attempting automatic reconnection...",
                    manager.transport.protocol_name()
                );
                match manager.connect_cycle(&params).await {
                    Ok(()) => {
                        info!(
                            "{} automatic reconnection successful",
                            manager.transport.protocol_name()
                        );
                        break;
                    }
                    Err(err) => {
                        warn!(
                            "{} automatic reconnection failed: {}",
                            manager.transport.protocol_name(),
                            err.message
                        );
                    }
                }
            }
            manager.reconnecting.store(false, Ordering::SeqCst);
        });
        *self.reconnect_task.lock().unwrap() = Some(task);
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let Some(config) = self.transport.heartbeat() else {
            return;
        };
        if let Some(task) = self.heartbeat_task.lock().unwrap().take() {
            task.abort();
        }

        let manager = self.clone();
        let task = tokio::spawn(async move {
            debug!("{} heartbeat started", manager.transport.protocol_name());
            loop {
                tokio::select! {
                    _ = manager.heartbeat_cancel.notified() => break,
                    _ = tokio::time::sleep(config.interval) => {}
                }
                if !manager.is_connected() {
                    debug!("heartbeat: connection not open, stopping");
                    break;
                }
                if let Err(err) = manager.transport.send_heartbeat().await {
                    error!("heartbeat send failed: {}", err.message);
                    continue;
                }
                let silent_for = manager.transport.last_pong().elapsed();
                if silent_for > config.timeout {
                    error!(
                        "heartbeat response timeout, last response {:.0}s ago",
                        silent_for.as_secs_f64()
                    );
                    manager.set_state(ConnectionState::ConnectionLost);
                    manager.notify_status(false);
                    manager.start_reconnect_if_needed();
                    break;
                }
            }
            debug!("{} heartbeat stopped", manager.transport.protocol_name());
        });
        *self.heartbeat_task.lock().unwrap() = Some(task);
    }
}
