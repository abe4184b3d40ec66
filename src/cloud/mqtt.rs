use super::credentials::MqttCredential;
use super::CloudRegistry;
use crate::events::EventDispatcher;
use crate::types::{mask, BizEvent, ConnectionState, ConnectionStatusData, Method, PrinterInfo, PrinterStatusData};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, TlsConfiguration, Transport};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DATA_SUFFIX: &str = "/device/data";
const ONOFFLINE_SUFFIX: &str = "/device/onoffline";
const EVENT_SUFFIX: &str = "/event";
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Cloud telemetry subscriber: one broker connection per user client id,
/// fanning device reports into the matching printer adapters and the event
/// surface.
pub struct CloudMqttService {
    registry: Arc<CloudRegistry>,
    dispatcher: Arc<EventDispatcher>,
    connected: Arc<AtomicBool>,
    bind_results: Arc<Mutex<HashMap<String, bool>>>,
    stop: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
    active_client_id: Mutex<String>,
}

impl CloudMqttService {
    pub fn new(registry: Arc<CloudRegistry>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
            connected: Arc::new(AtomicBool::new(false)),
            bind_results: Arc::new(Mutex::new(HashMap::new())),
            stop: Arc::new(Notify::new()),
            task: Mutex::new(None),
            active_client_id: Mutex::new(String::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// (Re)configure the broker connection. A changed client id means a new
    /// session identity, so the old connection is torn down either way and
    /// the worker restarted with the fresh credential.
    pub async fn configure(&self, credential: MqttCredential) {
        {
            let mut active = self.active_client_id.lock().unwrap();
            if *active == credential.client_id && self.is_connected() {
                debug!("mqtt credential unchanged, keeping connection");
                return;
            }
            *active = credential.client_id.clone();
        }

        self.shutdown().await;

        let registry = self.registry.clone();
        let dispatcher = self.dispatcher.clone();
        let connected = self.connected.clone();
        let bind_results = self.bind_results.clone();
        let stop = self.stop.clone();

        let task = tokio::spawn(async move {
            run_telemetry_loop(credential, registry, dispatcher, connected, bind_results, stop).await;
        });
        *self.task.lock().unwrap() = Some(task);
    }

    pub async fn shutdown(&self) {
        self.stop.notify_waiters();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// One-shot read of a bind event observed for this serial.
    pub fn take_bind_result(&self, serial_number: &str) -> bool {
        self.bind_results.lock().unwrap().remove(serial_number).unwrap_or(false)
    }
}

async fn run_telemetry_loop(
    credential: MqttCredential,
    registry: Arc<CloudRegistry>,
    dispatcher: Arc<EventDispatcher>,
    connected: Arc<AtomicBool>,
    bind_results: Arc<Mutex<HashMap<String, bool>>>,
    stop: Arc<Notify>,
) {
    let Some((host, port, tls)) = parse_broker_url(&credential.broker_url) else {
        warn!("invalid cloud broker url: {}", credential.broker_url);
        return;
    };

    let topics = [
        format!("app/v1/{}{}", credential.client_id, DATA_SUFFIX),
        format!("app/v1/{}{}", credential.client_id, ONOFFLINE_SUFFIX),
        format!("app/v1/{}{}", credential.client_id, EVENT_SUFFIX),
    ];

    loop {
        let mut options = MqttOptions::new(credential.client_id.clone(), host.clone(), port);
        options.set_credentials(credential.username.clone(), credential.password.clone());
        options.set_keep_alive(Duration::from_secs(60));
        if tls {
            options.set_transport(Transport::Tls(TlsConfiguration::default()));
        }

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        info!("cloud mqtt connecting to {}:{}", host, port);

        loop {
            tokio::select! {
                _ = stop.notified() => {
                    let _ = client.disconnect().await;
                    connected.store(false, Ordering::SeqCst);
                    info!("cloud mqtt stopped");
                    return;
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            connected.store(true, Ordering::SeqCst);
                            info!("cloud mqtt connected");
                            for topic in &topics {
                                if let Err(err) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                                    warn!("cloud mqtt subscribe failed: {}", err);
                                }
                            }
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            let payload = String::from_utf8_lossy(&publish.payload).to_string();
                            handle_telemetry(
                                &publish.topic,
                                &payload,
                                &registry,
                                &dispatcher,
                                &bind_results,
                            );
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!("cloud mqtt connection error: {}; reconnecting", err);
                            connected.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = stop.notified() => {
                connected.store(false, Ordering::SeqCst);
                return;
            }
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

fn handle_telemetry(
    topic: &str,
    payload: &str,
    registry: &Arc<CloudRegistry>,
    dispatcher: &Arc<EventDispatcher>,
    bind_results: &Arc<Mutex<HashMap<String, bool>>>,
) {
    let Ok(parsed) = serde_json::from_str::<Value>(payload) else {
        warn!("unparseable telemetry payload on {}", topic);
        return;
    };
    let serial = parsed
        .get("deviceCode")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if serial.is_empty() {
        return;
    }
    let printer_id = registry
        .printer_by_serial(&serial)
        .map(|p| p.printer_id)
        .unwrap_or_else(|| PrinterInfo::cloud_id(&serial));

    if topic.ends_with(DATA_SUFFIX) {
        let Some(report) = parsed
            .get("reportValue")
            .and_then(Value::as_str)
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        else {
            debug!("device data without reportValue from {}", mask(&serial));
            return;
        };
        let mut report = report;

        // While an upload is in flight the real machine status is replaced
        // by a synthetic uploading state, so clients see the same shape from
        // the LAN and cloud paths.
        if let Some(state) = registry.upload_state(&printer_id) {
            if state.uploading {
                report["machine_status"] = json!({
                    "status": 11,
                    "sub_status": 3000,
                    "progress": state.progress,
                });
            }
        }

        let Some(adapter) = registry.adapter(&printer_id) else {
            debug!("no adapter for printer {}", mask(&printer_id));
            return;
        };
        let status_json = json!({ "id": 0, "method": 6000, "result": report });
        let event = adapter.convert_to_event(&status_json.to_string());
        if event.is_valid() {
            dispatcher.emit(BizEvent::new(event.method, event.data.unwrap_or_default()));

            let raw = json!({ "id": 0, "method": 6000, "result": adapter.cached_full_status() });
            dispatcher.emit(BizEvent::new(
                Method::OnPrinterEventRaw,
                json!({ "printerId": printer_id, "rawData": raw.to_string() }),
            ));
        }
        return;
    }

    if topic.ends_with(ONOFFLINE_SUFFIX) {
        let Some(online) = parsed.get("onlineStatus").and_then(Value::as_i64) else {
            return;
        };
        let status = ConnectionStatusData {
            printer_id: printer_id.clone(),
            status: if online == 1 {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            },
        };
        dispatcher.emit(BizEvent::new(
            Method::OnConnectionStatus,
            serde_json::to_value(status).unwrap_or_default(),
        ));
        if online == 0 {
            dispatcher.emit(BizEvent::new(
                Method::OnPrinterStatus,
                serde_json::to_value(PrinterStatusData::offline(&printer_id)).unwrap_or_default(),
            ));
        }
        return;
    }

    if topic.ends_with(EVENT_SUFFIX) {
        let event_type = parsed
            .pointer("/data/eventType")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match event_type {
            "deviceBind" => {
                bind_results.lock().unwrap().insert(serial, true);
                dispatcher.emit(BizEvent::new(Method::OnPrinterListChanged, json!({})));
            }
            "deviceUnbind" => {
                dispatcher.emit(BizEvent::new(Method::OnPrinterListChanged, json!({})));
            }
            other => {
                debug!("unhandled device event type: {}", other);
            }
        }
    }
}

fn parse_broker_url(url: &str) -> Option<(String, u16, bool)> {
    let (scheme, rest) = url.split_once("://")?;
    let tls = matches!(scheme, "ssl" | "mqtts" | "tls");
    let (host, port) = match rest.split_once(':') {
        Some((host, port)) => (host.to_string(), port.parse::<u16>().ok()?),
        None => (rest.to_string(), if tls { 8883 } else { 1883 }),
    };
    if host.is_empty() {
        return None;
    }
    Some((host, port, tls))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_url_parsing() {
        assert_eq!(
            parse_broker_url("tcp://broker.elegoo.com:1883"),
            Some(("broker.elegoo.com".to_string(), 1883, false))
        );
        assert_eq!(
            parse_broker_url("ssl://broker.elegoo.com"),
            Some(("broker.elegoo.com".to_string(), 8883, true))
        );
        assert_eq!(parse_broker_url("broker.elegoo.com"), None);
        assert_eq!(parse_broker_url("tcp://"), None);
    }
}
