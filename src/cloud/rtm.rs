use super::credentials::AgoraCredential;
use super::CloudRegistry;
use crate::adapter::MessageKind;
use crate::errors::{ErrorCode, Result, SdkError};
use crate::events::EventDispatcher;
use crate::types::{mask, BizEvent, Method, PrinterInfo};
use backon::{ExponentialBuilder, Retryable};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

struct RtmShared {
    connected: AtomicBool,
    logged_elsewhere: AtomicBool,
    stopped: AtomicBool,
    user_id: Mutex<String>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>,
    stop: Notify,
}

/// Realtime request/response channel to remote printers. Each printer's
/// channel is `userId + serialNumber`; outbound requests go through the
/// printer's adapter exactly like the LAN path, and inbound frames resolve
/// the pending map or fan out as events.
pub struct RtmService {
    registry: Arc<CloudRegistry>,
    dispatcher: Arc<EventDispatcher>,
    shared: Arc<RtmShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RtmService {
    pub fn new(registry: Arc<CloudRegistry>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
            shared: Arc::new(RtmShared {
                connected: AtomicBool::new(false),
                logged_elsewhere: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                user_id: Mutex::new(String::new()),
                sink: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                stop: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_logged_in_elsewhere(&self) -> bool {
        self.shared.logged_elsewhere.load(Ordering::SeqCst)
    }

    /// New credentials clear the logged-elsewhere latch and allow the
    /// channel to come back.
    pub fn clear_logged_in_elsewhere(&self) {
        self.shared.logged_elsewhere.store(false, Ordering::SeqCst);
    }

    pub fn user_id(&self) -> String {
        self.shared.user_id.lock().unwrap().clone()
    }

    /// Start (or restart) the channel worker with a fresh credential.
    pub async fn connect(&self, gateway_url: String, credential: AgoraCredential) {
        self.shutdown().await;
        self.shared.stopped.store(false, Ordering::SeqCst);
        *self.shared.user_id.lock().unwrap() = credential.rtm_user_id.clone();

        let shared = self.shared.clone();
        let registry = self.registry.clone();
        let dispatcher = self.dispatcher.clone();

        let task = tokio::spawn(async move {
            run_channel(gateway_url, credential, shared, registry, dispatcher).await;
        });
        *self.task.lock().unwrap() = Some(task);
    }

    pub async fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.stop.notify_waiters();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
        }
        {
            let mut sink = self.shared.sink.lock().await;
            if let Some(mut sink) = sink.take() {
                let _ = sink.close().await;
            }
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        cancel_pending(&self.shared, "RTM channel shut down");
    }

    /// Request/response to a remote printer over the RTM channel, with the
    /// same exactly-once completion semantics as a LAN session.
    pub async fn send_request(
        &self,
        printer: &PrinterInfo,
        method: Method,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        if !self.is_connected() {
            return Err(SdkError::new(
                ErrorCode::ServerRtmNotConnected,
                "RTM channel not connected",
            ));
        }
        let adapter = self.registry.adapter(&printer.printer_id).ok_or_else(|| {
            SdkError::new(
                ErrorCode::NotConnectedToSubservice,
                "no adapter registered for printer",
            )
        })?;

        let request = adapter.convert_request(method, &params, timeout);
        if !request.is_valid() {
            return Err(SdkError::new(request.code, request.message));
        }
        let request_id = request.request_id.clone();

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), tx);

        let channel = format!("{}{}", self.user_id(), printer.serial_number);
        if let Err(err) = self.publish(&channel, &request.payload).await {
            self.shared.pending.lock().unwrap().remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(SdkError::cancelled("RTM channel torn down")),
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&request_id);
                Err(SdkError::timeout(format!(
                    "RTM request timed out after {} milliseconds",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Raw message publish to a printer's channel.
    pub async fn send_message(&self, serial_number: &str, message: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(SdkError::new(
                ErrorCode::ServerRtmNotConnected,
                "RTM channel not connected",
            ));
        }
        let channel = format!("{}{}", self.user_id(), serial_number);
        self.publish(&channel, message).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let frame = json!({
            "type": "publish",
            "channel": channel,
            "message": message,
        });
        let mut guard = self.shared.sink.lock().await;
        let sink = guard.as_mut().ok_or_else(|| {
            SdkError::new(ErrorCode::ServerRtmNotConnected, "RTM channel not connected")
        })?;
        sink.send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| SdkError::network(format!("RTM publish failed: {}", e)))
    }
}

fn cancel_pending(shared: &Arc<RtmShared>, reason: &str) {
    let waiters: Vec<_> = {
        let mut pending = shared.pending.lock().unwrap();
        pending.drain().collect()
    };
    for (_, tx) in waiters {
        let _ = tx.send(Err(SdkError::cancelled(reason)));
    }
}

/// The channel worker: establish with exponential backoff, then pump frames
/// until the link drops; repeat unless stopped or latched out.
async fn run_channel(
    gateway_url: String,
    credential: AgoraCredential,
    shared: Arc<RtmShared>,
    registry: Arc<CloudRegistry>,
    dispatcher: Arc<EventDispatcher>,
) {
    // 1s -> 2s -> 4s ... capped at 60s, retried until stopped.
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(60))
        .with_max_times(usize::MAX);

    loop {
        if shared.stopped.load(Ordering::SeqCst) || shared.logged_elsewhere.load(Ordering::SeqCst) {
            break;
        }

        let attempt = || async { establish(&gateway_url, &credential, &shared).await };
        let reader = match attempt.retry(&backoff).await {
            Ok(reader) => reader,
            Err(err) => {
                error!("RTM connection retry exhausted: {}", err.message);
                break;
            }
        };

        shared.connected.store(true, Ordering::SeqCst);
        info!("RTM channel connected as {}", mask(&credential.rtm_user_id));

        read_until_closed(reader, &shared, &registry, &dispatcher).await;

        shared.connected.store(false, Ordering::SeqCst);
        {
            let mut sink = shared.sink.lock().await;
            sink.take();
        }

        if shared.logged_elsewhere.load(Ordering::SeqCst) {
            info!("RTM reconnection suppressed until new credentials arrive");
            break;
        }
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        warn!("RTM link lost, re-establishing");
    }
}

/// Connect, log in, subscribe the user channel and start the heartbeat.
async fn establish(
    gateway_url: &str,
    credential: &AgoraCredential,
    shared: &Arc<RtmShared>,
) -> Result<WsReader> {
    debug!("RTM connecting to {}", gateway_url);
    let (stream, _) = connect_async(gateway_url)
        .await
        .map_err(|e| SdkError::network(format!("RTM connection failed: {}", e)))?;
    let (mut sink, mut reader) = stream.split();

    let login = json!({
        "type": "login",
        "userId": credential.rtm_user_id,
        "token": credential.rtm_token,
    });
    sink.send(Message::Text(login.to_string()))
        .await
        .map_err(|e| SdkError::network(format!("RTM login send failed: {}", e)))?;

    // Wait for the login acknowledgement before anything else.
    let ack = tokio::time::timeout(LOGIN_TIMEOUT, async {
        while let Some(frame) = reader.next().await {
            if let Ok(Message::Text(text)) = frame {
                if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
                    if parsed.get("type").and_then(Value::as_str) == Some("login_result") {
                        return Some(parsed);
                    }
                }
            }
        }
        None
    })
    .await
    .map_err(|_| SdkError::timeout("RTM login timed out"))?
    .ok_or_else(|| SdkError::network("RTM connection closed during login"))?;

    let status = ack.get("status").and_then(Value::as_str).unwrap_or("error");
    if status != "ok" {
        return Err(SdkError::new(
            ErrorCode::ServerUnauthorized,
            format!("RTM login rejected: {}", status),
        ));
    }

    let subscribe = json!({ "type": "subscribe", "channel": credential.rtm_user_id });
    sink.send(Message::Text(subscribe.to_string()))
        .await
        .map_err(|e| SdkError::network(format!("RTM subscribe failed: {}", e)))?;

    {
        let mut guard = shared.sink.lock().await;
        *guard = Some(sink);
    }

    // Heartbeat keeps the gateway from reaping idle channels.
    let heartbeat_shared = shared.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            if !heartbeat_shared.connected.load(Ordering::SeqCst) {
                break;
            }
            let frame = json!({ "type": "heartbeat" }).to_string();
            let mut guard = heartbeat_shared.sink.lock().await;
            let Some(sink) = guard.as_mut() else { break };
            if sink.send(Message::Text(frame)).await.is_err() {
                debug!("RTM heartbeat failed, stopping");
                break;
            }
        }
    });

    Ok(reader)
}

async fn read_until_closed(
    mut reader: WsReader,
    shared: &Arc<RtmShared>,
    registry: &Arc<CloudRegistry>,
    dispatcher: &Arc<EventDispatcher>,
) {
    loop {
        tokio::select! {
            _ = shared.stop.notified() => break,
            frame = reader.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_frame(&text, shared, registry, dispatcher) {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("RTM channel closed by gateway");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("RTM read error: {}", err);
                        break;
                    }
                }
            }
        }
    }
}

/// Returns false when the read loop should stop.
fn handle_frame(
    text: &str,
    shared: &Arc<RtmShared>,
    registry: &Arc<CloudRegistry>,
    dispatcher: &Arc<EventDispatcher>,
) -> bool {
    let Ok(parsed) = serde_json::from_str::<Value>(text) else {
        debug!("unparseable RTM frame");
        return true;
    };

    match parsed.get("type").and_then(Value::as_str) {
        Some("message") => {
            let publisher = parsed.get("publisher").and_then(Value::as_str).unwrap_or("");
            let content = parsed.get("content").and_then(Value::as_str).unwrap_or("");
            let user_id = shared.user_id.lock().unwrap().clone();

            let printer = registry.printers().into_iter().find(|p| {
                !p.serial_number.is_empty()
                    && publisher == format!("{}{}", user_id, p.serial_number)
            });

            match printer {
                Some(printer) => {
                    route_printer_message(&printer, content, shared, registry, dispatcher);
                }
                None => {
                    dispatcher.emit(BizEvent::new(
                        Method::OnRtmMessage,
                        json!({ "publisher": publisher, "content": content }),
                    ));
                }
            }
            true
        }
        Some("disconnected") => {
            let reason = parsed.get("reason").and_then(Value::as_str).unwrap_or("");
            if reason == "SAME_UID_LOGIN" {
                warn!("RTM session displaced by a login elsewhere");
                shared.logged_elsewhere.store(true, Ordering::SeqCst);
                dispatcher.emit(BizEvent::new(Method::OnLoggedInElsewhere, json!({})));
            }
            cancel_pending(shared, "RTM channel disconnected");
            false
        }
        Some("heartbeat_ack") => true,
        other => {
            debug!("unhandled RTM frame type: {:?}", other);
            true
        }
    }
}

/// Run a printer-originated RTM payload through that printer's adapter:
/// responses settle the pending map, events fan out.
fn route_printer_message(
    printer: &PrinterInfo,
    content: &str,
    shared: &Arc<RtmShared>,
    registry: &Arc<CloudRegistry>,
    dispatcher: &Arc<EventDispatcher>,
) {
    let Some(adapter) = registry.adapter(&printer.printer_id) else {
        debug!("RTM message for printer without adapter {}", mask(&printer.printer_id));
        return;
    };

    for kind in adapter.parse_message_kinds(content) {
        match kind {
            MessageKind::Response => {
                let response = adapter.convert_to_response(content);
                if !response.is_valid() {
                    debug!("RTM response with no request mapping, dropped");
                    continue;
                }
                let waiter = shared.pending.lock().unwrap().remove(&response.request_id);
                if let Some(tx) = waiter {
                    let reply = if response.code == ErrorCode::Success {
                        Ok(response.data.unwrap_or_else(|| json!({})))
                    } else {
                        Err(SdkError::new(response.code, response.message))
                    };
                    let _ = tx.send(reply);
                }
            }
            MessageKind::Event => {
                let event = adapter.convert_to_event(content);
                if event.is_valid() {
                    dispatcher.emit(BizEvent::new(event.method, event.data.unwrap_or_default()));
                }
            }
        }
    }
}
