use super::{
    HeartbeatConfig, LinkEvent, LinkEventHandler, MessageHandler, Transport, TransportHandlers,
};
use crate::errors::{ErrorCode, Result, SdkError};
use crate::types::ConnectParams;
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-family customization points for WebSocket printers. Simpler than the
/// MQTT set: no registration handshake by default.
pub trait WsHooks: Send + Sync {
    /// Build the connection URL; `None` aborts with InvalidParameter.
    fn connection_url(&self, params: &ConnectParams) -> Option<String>;

    fn connection_timeout(&self) -> Duration {
        DEFAULT_CONNECT_TIMEOUT
    }

    fn heartbeat(&self) -> Option<HeartbeatConfig> {
        None
    }

    fn heartbeat_message(&self) -> String {
        "ping".to_string()
    }

    fn is_heartbeat_response(&self, payload: &str) -> bool {
        payload == "pong"
    }

    /// Return false to suppress forwarding a text frame to the session.
    fn on_text_message(&self, _payload: &str) -> bool {
        true
    }
}

struct WsShared {
    open: AtomicBool,
    last_pong: Mutex<Instant>,
}

/// WebSocket transport for LAN printers.
pub struct WsTransport {
    hooks: Arc<dyn WsHooks>,
    handlers: Arc<TransportHandlers>,
    shared: Arc<WsShared>,
    sink: Arc<tokio::sync::Mutex<Option<WsSink>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(hooks: Arc<dyn WsHooks>) -> Self {
        Self {
            hooks,
            handlers: Arc::new(TransportHandlers::new()),
            shared: Arc::new(WsShared {
                open: AtomicBool::new(false),
                last_pong: Mutex::new(Instant::now()),
            }),
            sink: Arc::new(tokio::sync::Mutex::new(None)),
            read_task: Mutex::new(None),
        }
    }

    async fn send_frame(&self, message: Message) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or_else(|| {
            SdkError::new(ErrorCode::PrinterConnectionError, "WebSocket not connected")
        })?;
        sink.send(message)
            .await
            .map_err(|e| SdkError::new(ErrorCode::PrinterCommandFailed, format!("WebSocket send failed: {}", e)))
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn protocol_name(&self) -> &'static str {
        "websocket"
    }

    async fn open(&self, params: &ConnectParams) -> Result<()> {
        let url = self
            .hooks
            .connection_url(params)
            .ok_or_else(|| SdkError::invalid_parameter("failed to build WebSocket URL from host"))?;

        let connect_timeout = if params.connection_timeout > 0 {
            Duration::from_millis(params.connection_timeout)
        } else {
            self.hooks.connection_timeout()
        };

        debug!("websocket connecting to {}", url);
        let connected = tokio::time::timeout(connect_timeout, connect_async(&url)).await;
        let (stream, _) = match connected {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => return Err(map_ws_error(&err.to_string())),
            Err(_) => {
                return Err(SdkError::new(
                    ErrorCode::PrinterConnectionError,
                    "WebSocket connection timeout",
                ))
            }
        };

        let (sink, mut reader) = stream.split();
        {
            let mut guard = self.sink.lock().await;
            *guard = Some(sink);
        }

        self.shared.open.store(true, Ordering::SeqCst);
        *self.shared.last_pong.lock().unwrap() = Instant::now();

        let shared = self.shared.clone();
        let handlers = self.handlers.clone();
        let hooks = self.hooks.clone();
        let sink_for_pong = self.sink.clone();

        let read_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(payload)) => {
                        if hooks.heartbeat().is_some() && hooks.is_heartbeat_response(&payload) {
                            *shared.last_pong.lock().unwrap() = Instant::now();
                            debug!("websocket heartbeat response received");
                            continue;
                        }
                        if !hooks.on_text_message(&payload) {
                            continue;
                        }
                        handlers.emit_message(payload);
                    }
                    Ok(Message::Ping(data)) => {
                        let mut guard = sink_for_pong.lock().await;
                        if let Some(sink) = guard.as_mut() {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        warn!("websocket closed by printer");
                        shared.open.store(false, Ordering::SeqCst);
                        handlers.emit_link_event(LinkEvent::Interrupted);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("websocket read error: {}", err);
                        shared.open.store(false, Ordering::SeqCst);
                        handlers.emit_link_event(LinkEvent::Interrupted);
                        break;
                    }
                }
            }
        });
        *self.read_task.lock().unwrap() = Some(read_task);

        info!("websocket connected");
        Ok(())
    }

    async fn close(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        {
            let mut guard = self.sink.lock().await;
            if let Some(mut sink) = guard.take() {
                let _ = sink.send(Message::Close(None)).await;
                info!("websocket disconnected");
            }
        }
        let task = self.read_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
        }
    }

    async fn send(&self, payload: &str) -> Result<()> {
        if !self.is_open() {
            return Err(SdkError::new(
                ErrorCode::PrinterConnectionError,
                "WebSocket not connected",
            ));
        }
        self.send_frame(Message::Text(payload.to_string())).await
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn heartbeat(&self) -> Option<HeartbeatConfig> {
        self.hooks.heartbeat()
    }

    async fn send_heartbeat(&self) -> Result<()> {
        self.send_frame(Message::Text(self.hooks.heartbeat_message()))
            .await
    }

    fn last_pong(&self) -> Instant {
        *self.shared.last_pong.lock().unwrap()
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        self.handlers.set_message(handler);
    }

    fn set_link_event_handler(&self, handler: LinkEventHandler) {
        self.handlers.set_link(handler);
    }
}

/// Handshake failures arrive as strings; classify by substring the way the
/// HTTP status appears in the error text.
fn map_ws_error(message: &str) -> SdkError {
    if message.contains("401") || message.contains("403") {
        SdkError::new(
            ErrorCode::PrinterConnectionError,
            format!("WebSocket handshake rejected: {}", message),
        )
    } else if message.contains("404") {
        SdkError::new(
            ErrorCode::PrinterNotFound,
            format!("WebSocket endpoint not found: {}", message),
        )
    } else if message.contains("timeout") || message.contains("timed out") {
        SdkError::timeout(format!("WebSocket connection timeout: {}", message))
    } else if message.contains("resolve") || message.contains("network") {
        SdkError::network(format!("WebSocket network error: {}", message))
    } else {
        SdkError::new(
            ErrorCode::PrinterConnectionError,
            format!("WebSocket connection failed: {}", message),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_errors_map_by_substring() {
        assert_eq!(
            map_ws_error("HTTP error: 401 Unauthorized").code,
            ErrorCode::PrinterConnectionError
        );
        assert_eq!(map_ws_error("HTTP error: 404 Not Found").code, ErrorCode::PrinterNotFound);
        assert_eq!(map_ws_error("connection timed out").code, ErrorCode::OperationTimeout);
        assert_eq!(
            map_ws_error("failed to resolve host").code,
            ErrorCode::NetworkError
        );
        assert_eq!(
            map_ws_error("connection reset by peer").code,
            ErrorCode::PrinterConnectionError
        );
    }
}
