// Common test fixtures: a scriptable transport and event collection.

use async_trait::async_trait;
use std::sync::Once;
use elink::errors::{ErrorCode, Result, SdkError};
use elink::transport::{LinkEvent, LinkEventHandler, MessageHandler, Transport};
use elink::types::{AuthMode, BizEvent, ConnectParams, PrinterInfo, PrinterType};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Install a fmt subscriber once so `RUST_LOG=elink=debug cargo test`
/// shows what the workers are doing.
#[allow(dead_code)]
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// In-memory transport: opens succeed after a configurable number of
/// failures, sends are recorded, and tests inject inbound payloads or link
/// drops directly.
pub struct FakeTransport {
    open: AtomicBool,
    opens: AtomicUsize,
    fail_first_opens: usize,
    sent: Mutex<Vec<String>>,
    message_handler: Mutex<Option<MessageHandler>>,
    link_handler: Mutex<Option<LinkEventHandler>>,
}

#[allow(dead_code)]
impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Self::failing_first(0)
    }

    pub fn failing_first(fail_first_opens: usize) -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            fail_first_opens,
            sent: Mutex::new(Vec::new()),
            message_handler: Mutex::new(None),
            link_handler: Mutex::new(None),
        })
    }

    pub fn open_attempts(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn sent_payloads(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn drain_sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().drain(..).collect()
    }

    /// Deliver an inbound wire message to the session.
    pub fn inject(&self, payload: &str) {
        let handler = self.message_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(payload.to_string());
        }
    }

    /// Simulate the underlying link dropping out from under the manager.
    pub fn drop_link(&self) {
        self.open.store(false, Ordering::SeqCst);
        let handler = self.link_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(LinkEvent::Interrupted);
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn protocol_name(&self) -> &'static str {
        "fake"
    }

    async fn open(&self, _params: &ConnectParams) -> Result<()> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first_opens {
            return Err(SdkError::new(
                ErrorCode::PrinterConnectionError,
                format!("scripted failure on attempt {}", attempt),
            ));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    async fn send(&self, payload: &str) -> Result<()> {
        if !self.is_open() {
            return Err(SdkError::new(
                ErrorCode::PrinterConnectionError,
                "fake transport not open",
            ));
        }
        self.sent.lock().unwrap().push(payload.to_string());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn last_pong(&self) -> Instant {
        Instant::now()
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.message_handler.lock().unwrap() = Some(handler);
    }

    fn set_link_event_handler(&self, handler: LinkEventHandler) {
        *self.link_handler.lock().unwrap() = Some(handler);
    }
}

/// Thread-safe event recorder for asserting on the event stream.
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct EventLog {
    events: Arc<Mutex<Vec<BizEvent>>>,
}

#[allow(dead_code)]
impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorder(&self) -> Arc<dyn Fn(BizEvent) + Send + Sync> {
        let events = self.events.clone();
        Arc::new(move |event| {
            events.lock().unwrap().push(event);
        })
    }

    pub fn events(&self) -> Vec<BizEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_of(&self, method: elink::Method) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.method == method)
            .count()
    }
}

#[allow(dead_code)]
pub fn cc2_printer_info() -> PrinterInfo {
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

#[allow(dead_code)]
pub fn connect_params() -> ConnectParams {
    ConnectParams {
        host: "192.168.1.50".to_string(),
        printer_type: Some(PrinterType::ElegooFdmCc2),
        auth_mode: AuthMode::AccessCode,
        access_code: Some("123456".to_string()),
        serial_number: Some("F01NZQQZJS2ASC8".to_string()),
        auto_reconnect: false,
        ..Default::default()
    }
}
