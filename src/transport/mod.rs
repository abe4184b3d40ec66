pub mod mqtt;
pub mod ws;

use crate::errors::Result;
use crate::types::ConnectParams;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Application-level heartbeat settings (not the protocol keepalive).
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Link-layer notification from a transport to its connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Interrupted,
    Recovered,
}

pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;
pub type LinkEventHandler = Arc<dyn Fn(LinkEvent) + Send + Sync>;

/// One printer-facing wire connection (MQTT or WebSocket).
///
/// A transport only manages the raw link; lifecycle policy (reconnect,
/// heartbeat cadence, state bookkeeping) lives in the connection manager.
/// Registration-handshake and heartbeat-response messages are consumed
/// inside the transport and never reach the message handler.
#[async_trait]
pub trait Transport: Send + Sync {
    fn protocol_name(&self) -> &'static str;

    /// Establish the link and subscribe to inbound traffic.
    async fn open(&self, params: &ConnectParams) -> Result<()>;

    /// Whether a post-connect handshake must complete before the session
    /// counts as open.
    fn requires_registration(&self) -> bool {
        false
    }

    /// Run the post-connect handshake. Only called when
    /// `requires_registration` is true; the caller closes the link on error.
    async fn register(&self, _params: &ConnectParams) -> Result<()> {
        Ok(())
    }

    async fn close(&self);

    async fn send(&self, payload: &str) -> Result<()>;

    /// Whether the underlying link currently reports open. Corroborates the
    /// manager's declared state; never authoritative on its own.
    fn is_open(&self) -> bool;

    fn heartbeat(&self) -> Option<HeartbeatConfig> {
        None
    }

    async fn send_heartbeat(&self) -> Result<()> {
        Ok(())
    }

    /// Instant of the most recent heartbeat response.
    fn last_pong(&self) -> Instant;

    fn set_message_handler(&self, handler: MessageHandler);
    fn set_link_event_handler(&self, handler: LinkEventHandler);
}

/// Handler storage shared by the concrete transports. Handlers are copied
/// out of the lock before invocation.
#[derive(Default)]
pub(crate) struct TransportHandlers {
    message: Mutex<Option<MessageHandler>>,
    link: Mutex<Option<LinkEventHandler>>,
}

impl TransportHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_message(&self, handler: MessageHandler) {
        *self.message.lock().unwrap() = Some(handler);
    }

    pub fn set_link(&self, handler: LinkEventHandler) {
        *self.link.lock().unwrap() = Some(handler);
    }

    pub fn emit_message(&self, payload: String) {
        let handler = self.message.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(payload);
        }
    }

    pub fn emit_link_event(&self, event: LinkEvent) {
        let handler = self.link.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}
