use super::{
    HeartbeatConfig, LinkEvent, LinkEventHandler, MessageHandler, Transport, TransportHandlers,
};
use crate::errors::{ErrorCode, Result, SdkError};
use crate::types::{AuthMode, ConnectParams};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-family customization points for MQTT printers: broker URL shape,
/// credentials per auth mode, topic layout, the optional registration
/// handshake and the heartbeat dialect.
#[async_trait]
pub trait MqttHooks: Send + Sync {
    /// Normalize the user-supplied host into broker host + port; `None`
    /// aborts the connect with InvalidParameter.
    fn broker_address(&self, params: &ConnectParams) -> Option<(String, u16)>;

    fn client_id(&self, params: &ConnectParams) -> String;

    /// Out-of-band validation before connecting; may probe the printer over
    /// HTTP to fill in a missing serial number.
    async fn validate_connection_params(&self, _params: &ConnectParams) -> Result<()> {
        Ok(())
    }

    /// Username/password for the CONNECT packet.
    fn credentials(&self, _params: &ConnectParams) -> Option<(String, String)> {
        None
    }

    fn subscription_topics(&self, params: &ConnectParams) -> Vec<String>;

    fn command_topic(&self, params: &ConnectParams) -> String;

    fn requires_registration(&self) -> bool {
        false
    }

    /// Topic + payload of the registration request.
    fn registration_request(
        &self,
        _params: &ConnectParams,
        _client_id: &str,
    ) -> Option<(String, String)> {
        None
    }

    fn is_registration_message(&self, _topic: &str, _payload: &str) -> bool {
        false
    }

    fn validate_registration_response(
        &self,
        _topic: &str,
        _payload: &str,
        _client_id: &str,
    ) -> Result<()> {
        Ok(())
    }

    fn registration_timeout(&self) -> Duration {
        Duration::from_millis(2000)
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

    fn heartbeat_topic(&self, params: &ConnectParams) -> String {
        self.command_topic(params)
    }
}

struct MqttShared {
    open: AtomicBool,
    registering: AtomicBool,
    registration_waiter: Mutex<Option<oneshot::Sender<Result<()>>>>,
    last_pong: Mutex<Instant>,
    last_params: Mutex<Option<ConnectParams>>,
}

struct MqttLink {
    client: AsyncClient,
    event_task: JoinHandle<()>,
}

/// MQTT transport for LAN printers. One rumqttc client + event-loop task
/// per open link; reconnection recreates both.
pub struct MqttTransport {
    hooks: Arc<dyn MqttHooks>,
    handlers: Arc<TransportHandlers>,
    shared: Arc<MqttShared>,
    link: tokio::sync::Mutex<Option<MqttLink>>,
}

impl MqttTransport {
    pub fn new(hooks: Arc<dyn MqttHooks>) -> Self {
        Self {
            hooks,
            handlers: Arc::new(TransportHandlers::new()),
            shared: Arc::new(MqttShared {
                open: AtomicBool::new(false),
                registering: AtomicBool::new(false),
                registration_waiter: Mutex::new(None),
                last_pong: Mutex::new(Instant::now()),
                last_params: Mutex::new(None),
            }),
            link: tokio::sync::Mutex::new(None),
        }
    }

    fn params(&self) -> Result<ConnectParams> {
        self.shared
            .last_params
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SdkError::new(ErrorCode::PrinterConnectionError, "MQTT not connected"))
    }

    async fn publish(&self, topic: String, payload: String) -> Result<()> {
        let guard = self.link.lock().await;
        let link = guard
            .as_ref()
            .ok_or_else(|| SdkError::new(ErrorCode::PrinterConnectionError, "MQTT not connected"))?;
        tokio::time::timeout(
            PUBLISH_ACK_TIMEOUT,
            link.client.publish(topic, QoS::AtLeastOnce, false, payload),
        )
        .await
        .map_err(|_| SdkError::timeout("MQTT publish timed out"))?
        .map_err(|e| {
            SdkError::new(ErrorCode::PrinterCommandFailed, format!("MQTT publish failed: {}", e))
        })
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn protocol_name(&self) -> &'static str {
        "mqtt"
    }

    async fn open(&self, params: &ConnectParams) -> Result<()> {
        self.hooks.validate_connection_params(params).await?;

        let (host, port) = self.hooks.broker_address(params).ok_or_else(|| {
            SdkError::invalid_parameter("failed to derive broker address from host")
        })?;
        let client_id = self.hooks.client_id(params);
        debug!("mqtt connecting to {}:{} as {}", host, port, client_id);

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(true);
        if let Some((username, password)) = self.hooks.credentials(params) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 16);

        let (connack_tx, connack_rx) = oneshot::channel::<Result<()>>();
        let shared = self.shared.clone();
        let handlers = self.handlers.clone();
        let hooks = self.hooks.clone();
        let auth_mode = params.auth_mode;
        let registration_client_id = self.hooks.client_id(params);

        let event_task = tokio::spawn(async move {
            let mut connack_tx = Some(connack_tx);
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        let result = map_connack_code(ack.code, auth_mode);
                        if result.is_ok() {
                            shared.open.store(true, Ordering::SeqCst);
                        }
                        if let Some(tx) = connack_tx.take() {
                            let _ = tx.send(result);
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload).to_string();
                        handle_publish(
                            &shared,
                            &handlers,
                            &hooks,
                            &registration_client_id,
                            &publish.topic,
                            payload,
                        );
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if let Some(tx) = connack_tx.take() {
                            let _ = tx.send(Err(map_connection_error(&err, auth_mode)));
                            break;
                        }
                        warn!("mqtt connection error: {}", err);
                        shared.open.store(false, Ordering::SeqCst);
                        handlers.emit_link_event(LinkEvent::Interrupted);
                        break;
                    }
                }
            }
        });

        let connect_timeout = if params.connection_timeout > 0 {
            Duration::from_millis(params.connection_timeout)
        } else {
            DEFAULT_CONNECT_TIMEOUT
        };

        let connack = tokio::time::timeout(connect_timeout, connack_rx).await;
        let connack = match connack {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SdkError::new(
                ErrorCode::PrinterConnectionError,
                "MQTT event loop exited before CONNACK",
            )),
            Err(_) => Err(SdkError::new(
                ErrorCode::PrinterConnectionError,
                "MQTT connection timeout",
            )),
        };
        if let Err(err) = connack {
            event_task.abort();
            return Err(err);
        }

        for topic in self.hooks.subscription_topics(params) {
            if let Err(err) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                // Subscription failure does not fail the connect.
                warn!("mqtt subscribe to {} failed: {}", topic, err);
            }
        }

        *self.shared.last_params.lock().unwrap() = Some(params.clone());
        *self.shared.last_pong.lock().unwrap() = Instant::now();

        let mut guard = self.link.lock().await;
        if let Some(old) = guard.take() {
            old.event_task.abort();
        }
        *guard = Some(MqttLink { client, event_task });

        info!("mqtt connected");
        Ok(())
    }

    fn requires_registration(&self) -> bool {
        self.hooks.requires_registration()
    }

    async fn register(&self, params: &ConnectParams) -> Result<()> {
        let client_id = self.hooks.client_id(params);
        let (topic, payload) = self
            .hooks
            .registration_request(params, &client_id)
            .ok_or_else(|| {
                SdkError::new(ErrorCode::PrinterConnectionError, "no registration request defined")
            })?;

        let (tx, rx) = oneshot::channel();
        *self.shared.registration_waiter.lock().unwrap() = Some(tx);
        self.shared.registering.store(true, Ordering::SeqCst);

        info!("sending printer registration request");
        if let Err(err) = self.publish(topic, payload).await {
            self.shared.registering.store(false, Ordering::SeqCst);
            self.shared.registration_waiter.lock().unwrap().take();
            return Err(err);
        }

        let timeout = if params.connection_timeout > 0 {
            Duration::from_millis(params.connection_timeout)
        } else {
            self.hooks.registration_timeout()
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SdkError::new(
                ErrorCode::PrinterConnectionError,
                "registration channel closed",
            )),
            Err(_) => {
                self.shared.registering.store(false, Ordering::SeqCst);
                self.shared.registration_waiter.lock().unwrap().take();
                Err(SdkError::timeout("printer registration timed out"))
            }
        }
    }

    async fn close(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.registering.store(false, Ordering::SeqCst);
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.take() {
            if let Err(err) = link.client.disconnect().await {
                debug!("mqtt disconnect error: {}", err);
            }
            link.event_task.abort();
            info!("mqtt disconnected");
        }
    }

    async fn send(&self, payload: &str) -> Result<()> {
        if !self.is_open() {
            return Err(SdkError::new(ErrorCode::PrinterConnectionError, "MQTT not connected"));
        }
        let params = self.params()?;
        let topic = self.hooks.command_topic(&params);
        self.publish(topic, payload.to_string()).await
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn heartbeat(&self) -> Option<HeartbeatConfig> {
        self.hooks.heartbeat()
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let params = self.params()?;
        let topic = self.hooks.heartbeat_topic(&params);
        self.publish(topic, self.hooks.heartbeat_message()).await
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

fn handle_publish(
    shared: &Arc<MqttShared>,
    handlers: &Arc<TransportHandlers>,
    hooks: &Arc<dyn MqttHooks>,
    client_id: &str,
    topic: &str,
    payload: String,
) {
    // Registration responses are consumed by the handshake state machine.
    if shared.registering.load(Ordering::SeqCst) && hooks.is_registration_message(topic, &payload) {
        let result = hooks.validate_registration_response(topic, &payload, client_id);
        shared.registering.store(false, Ordering::SeqCst);
        let waiter = shared.registration_waiter.lock().unwrap().take();
        if let Some(tx) = waiter {
            let _ = tx.send(result);
        }
        return;
    }

    // Heartbeat responses update the pong clock and are not forwarded.
    if hooks.heartbeat().is_some() && hooks.is_heartbeat_response(&payload) {
        *shared.last_pong.lock().unwrap() = Instant::now();
        debug!("mqtt heartbeat response received");
        return;
    }

    handlers.emit_message(payload);
}

/// CONNACK return codes 4 and 5 select the auth error by auth mode; 3 means
/// the broker itself is unhealthy.
fn map_connack_code(code: ConnectReturnCode, auth_mode: AuthMode) -> Result<()> {
    match code {
        ConnectReturnCode::Success => Ok(()),
        ConnectReturnCode::ServiceUnavailable => Err(SdkError::new(
            ErrorCode::PrinterUnknownError,
            "MQTT broker unavailable",
        )),
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            Err(auth_error(auth_mode))
        }
        other => Err(SdkError::new(
            ErrorCode::PrinterConnectionError,
            format!("MQTT connection refused: {:?}", other),
        )),
    }
}

fn map_connection_error(err: &ConnectionError, auth_mode: AuthMode) -> SdkError {
    match err {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::ServiceUnavailable => {
                SdkError::new(ErrorCode::PrinterUnknownError, "MQTT broker unavailable")
            }
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                auth_error(auth_mode)
            }
            other => SdkError::new(
                ErrorCode::PrinterConnectionError,
                format!("MQTT connection refused: {:?}", other),
            ),
        },
        ConnectionError::Io(io) => SdkError::network(format!("MQTT network error: {}", io)),
        other => {
            error!("mqtt connection failed: {}", other);
            SdkError::new(
                ErrorCode::PrinterConnectionError,
                format!("MQTT connection failed: {}", other),
            )
        }
    }
}

fn auth_error(auth_mode: AuthMode) -> SdkError {
    match auth_mode {
        AuthMode::Basic => SdkError::new(
            ErrorCode::InvalidUsernameOrPassword,
            "MQTT broker rejected username or password",
        ),
        AuthMode::Token => SdkError::new(ErrorCode::InvalidToken, "MQTT broker rejected token"),
        AuthMode::PinCode => {
            SdkError::new(ErrorCode::InvalidPinCode, "MQTT broker rejected PIN code")
        }
        _ => SdkError::new(ErrorCode::InvalidAccessCode, "MQTT broker rejected access code"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct TestHooks;

    #[async_trait]
    impl MqttHooks for TestHooks {
        fn broker_address(&self, _params: &ConnectParams) -> Option<(String, u16)> {
            Some(("127.0.0.1".to_string(), 1883))
        }
        fn client_id(&self, _params: &ConnectParams) -> String {
            "client-1".to_string()
        }
        fn subscription_topics(&self, _params: &ConnectParams) -> Vec<String> {
            vec![]
        }
        fn command_topic(&self, _params: &ConnectParams) -> String {
            "cmd".to_string()
        }
        fn is_registration_message(&self, topic: &str, _payload: &str) -> bool {
            topic == "register_response"
        }
        fn heartbeat(&self) -> Option<HeartbeatConfig> {
            Some(HeartbeatConfig {
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(65),
            })
        }
    }

    fn test_shared() -> Arc<MqttShared> {
        Arc::new(MqttShared {
            open: AtomicBool::new(true),
            registering: AtomicBool::new(false),
            registration_waiter: Mutex::new(None),
            last_pong: Mutex::new(Instant::now() - Duration::from_secs(100)),
            last_params: Mutex::new(None),
        })
    }

    #[test]
    fn heartbeat_responses_are_consumed_and_update_the_pong_clock() {
        let shared = test_shared();
        let handlers = Arc::new(TransportHandlers::new());
        let hooks: Arc<dyn MqttHooks> = Arc::new(TestHooks);

        let forwarded = Arc::new(AtomicUsize::new(0));
        let seen = forwarded.clone();
        handlers.set_message(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        handle_publish(&shared, &handlers, &hooks, "client-1", "any/topic", "pong".to_string());
        assert_eq!(forwarded.load(Ordering::SeqCst), 0);
        assert!(shared.last_pong.lock().unwrap().elapsed() < Duration::from_secs(1));

        handle_publish(&shared, &handlers, &hooks, "client-1", "any/topic", "data".to_string());
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registration_messages_are_consumed_while_registering() {
        let shared = test_shared();
        let handlers = Arc::new(TransportHandlers::new());
        let hooks: Arc<dyn MqttHooks> = Arc::new(TestHooks);

        let forwarded = Arc::new(AtomicUsize::new(0));
        let seen = forwarded.clone();
        handlers.set_message(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let (tx, mut rx) = oneshot::channel();
        shared.registering.store(true, Ordering::SeqCst);
        *shared.registration_waiter.lock().unwrap() = Some(tx);

        handle_publish(
            &shared,
            &handlers,
            &hooks,
            "client-1",
            "register_response",
            "{\"error\":\"ok\"}".to_string(),
        );
        assert_eq!(forwarded.load(Ordering::SeqCst), 0);
        assert!(!shared.registering.load(Ordering::SeqCst));
        assert!(rx.try_recv().unwrap().is_ok());

        // Outside the registration phase the same topic flows through.
        handle_publish(
            &shared,
            &handlers,
            &hooks,
            "client-1",
            "register_response",
            "{\"error\":\"ok\"}".to_string(),
        );
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn connack_auth_failure_maps_by_auth_mode() {
        let err = map_connack_code(ConnectReturnCode::NotAuthorized, AuthMode::Basic).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidUsernameOrPassword);
        let err = map_connack_code(ConnectReturnCode::BadUserNamePassword, AuthMode::Token)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidToken);
        let err =
            map_connack_code(ConnectReturnCode::NotAuthorized, AuthMode::AccessCode).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidAccessCode);
        let err =
            map_connack_code(ConnectReturnCode::NotAuthorized, AuthMode::PinCode).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPinCode);
    }

    #[test]
    fn connack_service_unavailable_is_printer_unknown() {
        let err =
            map_connack_code(ConnectReturnCode::ServiceUnavailable, AuthMode::None).unwrap_err();
        assert_eq!(err.code, ErrorCode::PrinterUnknownError);
    }
}
