use crate::config::DiscoveryParams;
use crate::errors::{ErrorCode, Result, SdkError};
use crate::types::{mask, AuthMode, PrinterInfo};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long each receive slice waits before re-checking deadlines.
const RECV_SLICE: Duration = Duration::from_millis(500);
const MAX_TIMEOUT_MS: u64 = 300_000;

pub type PrinterDiscoveredCallback = Arc<dyn Fn(PrinterInfo) + Send + Sync>;
pub type DiscoveryCompletionCallback = Box<dyn FnOnce(Vec<PrinterInfo>) + Send>;

/// One probe/parse pair per printer family. Strategies are consulted in
/// registration order; the first one whose parser accepts a datagram claims
/// the response.
pub trait DiscoveryStrategy: Send + Sync {
    fn probe(&self) -> String;
    fn default_port(&self) -> u16;
    fn brand(&self) -> &'static str;
    fn supported_auth_mode(&self) -> AuthMode;
    fn parse_response(&self, payload: &str, sender_ip: &str, sender_port: u16)
        -> Option<PrinterInfo>;
}

struct DiscoveryShared {
    /// Ordered list + id set kept in lock-step for O(1) dedup.
    discovered: Mutex<(Vec<PrinterInfo>, HashSet<String>)>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    stop: Notify,
}

/// UDP broadcast discovery across all registered printer families.
///
/// One socket per run, broadcast enabled, preferred-port bind with an
/// ephemeral fallback. Socket-level failures end the run early; the
/// completion callback still fires with whatever was found.
pub struct PrinterDiscovery {
    strategies: Vec<Arc<dyn DiscoveryStrategy>>,
    shared: Arc<DiscoveryShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PrinterDiscovery {
    pub fn new(strategies: Vec<Arc<dyn DiscoveryStrategy>>) -> Self {
        info!("discovery initialized with {} strategies", strategies.len());
        Self {
            strategies,
            shared: Arc::new(DiscoveryShared {
                discovered: Mutex::new((Vec::new(), HashSet::new())),
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                stop: Notify::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn discovered_printers(&self) -> Vec<PrinterInfo> {
        self.shared.discovered.lock().unwrap().0.clone()
    }

    /// Start a discovery run. Fails when a run is active or the config is
    /// inconsistent; otherwise spawns the worker and returns immediately.
    pub fn start(
        &self,
        params: DiscoveryParams,
        on_printer: PrinterDiscoveredCallback,
        on_complete: DiscoveryCompletionCallback,
    ) -> Result<()> {
        if self.strategies.is_empty() {
            return Err(SdkError::invalid_parameter("no discovery strategies registered"));
        }
        if params.timeout_ms == 0 || params.timeout_ms > MAX_TIMEOUT_MS {
            return Err(SdkError::invalid_parameter(format!(
                "invalid discovery timeout: {}ms (must be 1-{})",
                params.timeout_ms, MAX_TIMEOUT_MS
            )));
        }
        if params.enable_auto_retry && params.broadcast_interval_ms >= params.timeout_ms {
            return Err(SdkError::invalid_parameter(format!(
                "broadcast interval ({}ms) must be less than timeout ({}ms)",
                params.broadcast_interval_ms, params.timeout_ms
            )));
        }
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SdkError::new(
                ErrorCode::OperationInProgress,
                "discovery already running",
            ));
        }

        {
            let mut discovered = self.shared.discovered.lock().unwrap();
            discovered.0.clear();
            discovered.1.clear();
        }
        self.shared.stop_requested.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let strategies = self.strategies.clone();
        let handle = tokio::spawn(async move {
            run_discovery(params, strategies, shared.clone(), on_printer).await;
            let found = shared.discovered.lock().unwrap().0.clone();
            shared.running.store(false, Ordering::SeqCst);
            debug!("discovery completed with {} printers", found.len());
            on_complete(found);
        });
        *self.worker.lock().unwrap() = Some(handle);

        info!("printer discovery started with {} strategies", self.strategies.len());
        Ok(())
    }

    /// Stop an active run and wait for the worker. Idempotent; stopping an
    /// idle discovery succeeds silently.
    pub async fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.stop.notify_waiters();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.running.store(false, Ordering::SeqCst);
        info!("printer discovery stopped");
    }
}

async fn run_discovery(
    params: DiscoveryParams,
    strategies: Vec<Arc<dyn DiscoveryStrategy>>,
    shared: Arc<DiscoveryShared>,
    on_printer: PrinterDiscoveredCallback,
) {
    let socket = match open_broadcast_socket(&params.preferred_listen_ports) {
        Ok(socket) => socket,
        Err(err) => {
            error!("failed to open discovery socket: {}", err);
            return;
        }
    };

    let broadcast_targets = broadcast_addresses();
    debug!("broadcasting to {} addresses", broadcast_targets.len());

    send_probes(&socket, &strategies, &broadcast_targets).await;

    let deadline = tokio::time::Instant::now() + Duration::from_millis(params.timeout_ms);
    let mut last_broadcast = tokio::time::Instant::now();
    let mut buf = [0u8; 4096];

    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline || shared.stop_requested.load(Ordering::SeqCst) {
            break;
        }

        let slice = RECV_SLICE.min(deadline - now);
        tokio::select! {
            _ = shared.stop.notified() => {
                debug!("discovery stop requested");
                break;
            }
            received = tokio::time::timeout(slice, socket.recv_from(&mut buf)) => {
                match received {
                    Ok(Ok((len, sender))) => {
                        let payload = String::from_utf8_lossy(&buf[..len]).to_string();
                        process_response(&strategies, &shared, &on_printer, &payload, sender);
                    }
                    Ok(Err(err)) => {
                        debug!("recv_from failed: {}", err);
                    }
                    Err(_) => {}
                }
            }
        }

        if params.enable_auto_retry
            && last_broadcast.elapsed() >= Duration::from_millis(params.broadcast_interval_ms)
        {
            debug!("re-sending discovery broadcast");
            send_probes(&socket, &strategies, &broadcast_targets).await;
            last_broadcast = tokio::time::Instant::now();
        }
    }
}

fn process_response(
    strategies: &[Arc<dyn DiscoveryStrategy>],
    shared: &DiscoveryShared,
    on_printer: &PrinterDiscoveredCallback,
    payload: &str,
    sender: SocketAddr,
) {
    debug!("received discovery response from {}", sender);

    for strategy in strategies {
        let Some(info) = strategy.parse_response(payload, &sender.ip().to_string(), sender.port())
        else {
            continue;
        };

        let is_new = {
            let mut discovered = shared.discovered.lock().unwrap();
            if discovered.1.insert(info.printer_id.clone()) {
                discovered.0.push(info.clone());
                true
            } else {
                false
            }
        };

        if is_new {
            info!(
                "discovered {} printer {} ({}) at {}",
                info.brand,
                info.name,
                mask(&info.printer_id),
                info.host
            );
            // Callback runs outside the discovered-set lock.
            on_printer(info);
        }
        // First matching strategy claims the datagram.
        return;
    }
}

async fn send_probes(
    socket: &UdpSocket,
    strategies: &[Arc<dyn DiscoveryStrategy>],
    targets: &[Ipv4Addr],
) {
    for strategy in strategies {
        let probe = strategy.probe();
        let port = strategy.default_port();
        for target in targets {
            let addr = SocketAddrV4::new(*target, port);
            if let Err(err) = socket.send_to(probe.as_bytes(), SocketAddr::V4(addr)).await {
                warn!("failed to send discovery probe to {}: {}", addr, err);
            }
        }
    }
}

/// Broadcast-enabled UDP socket: try each preferred port in order, then let
/// the OS assign one.
fn open_broadcast_socket(preferred_ports: &[u16]) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| SdkError::network(format!("failed to create UDP socket: {}", e)))?;
    socket
        .set_broadcast(true)
        .map_err(|e| SdkError::network(format!("failed to enable broadcast: {}", e)))?;
    if let Err(err) = socket.set_reuse_address(true) {
        warn!("failed to set SO_REUSEADDR: {}", err);
    }
    socket
        .set_nonblocking(true)
        .map_err(|e| SdkError::network(format!("failed to set nonblocking: {}", e)))?;

    let mut bound = false;
    for port in preferred_ports {
        let addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, *port).into();
        match socket.bind(&addr.into()) {
            Ok(()) => {
                info!("discovery socket bound to preferred port {}", port);
                bound = true;
                break;
            }
            Err(err) => {
                debug!("preferred port {} unavailable: {}", port, err);
            }
        }
    }
    if !bound {
        if !preferred_ports.is_empty() {
            info!("all preferred ports unavailable, falling back to ephemeral port");
        }
        let addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into();
        socket
            .bind(&addr.into())
            .map_err(|e| SdkError::network(format!("failed to bind discovery socket: {}", e)))?;
    }

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|e| SdkError::network(format!("failed to register discovery socket: {}", e)))
}

/// Per-interface directed broadcast addresses. Interface netmasks are not
/// exposed portably, so a /24 is assumed per interface (same assumption the
/// subnet scanner makes); the limited broadcast address is always included.
fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut targets = vec![Ipv4Addr::BROADCAST];
    match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => {
            for (_name, addr) in interfaces {
                if let IpAddr::V4(v4) = addr {
                    if v4.is_loopback() {
                        continue;
                    }
                    let octets = v4.octets();
                    let directed = Ipv4Addr::new(octets[0], octets[1], octets[2], 255);
                    if !targets.contains(&directed) {
                        targets.push(directed);
                    }
                }
            }
        }
        Err(err) => {
            warn!("failed to enumerate network interfaces: {}", err);
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverMatches;

    impl DiscoveryStrategy for NeverMatches {
        fn probe(&self) -> String {
            "PING".to_string()
        }
        fn default_port(&self) -> u16 {
            3000
        }
        fn brand(&self) -> &'static str {
            "Test"
        }
        fn supported_auth_mode(&self) -> AuthMode {
            AuthMode::None
        }
        fn parse_response(&self, _: &str, _: &str, _: u16) -> Option<PrinterInfo> {
            None
        }
    }

    #[tokio::test]
    async fn rejects_interval_not_less_than_timeout() {
        let discovery = PrinterDiscovery::new(vec![Arc::new(NeverMatches)]);
        let params = DiscoveryParams {
            timeout_ms: 1000,
            broadcast_interval_ms: 1000,
            enable_auto_retry: true,
            ..Default::default()
        };
        let err = discovery
            .start(params, Arc::new(|_| {}), Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
    }

    #[tokio::test]
    async fn rejects_zero_timeout() {
        let discovery = PrinterDiscovery::new(vec![Arc::new(NeverMatches)]);
        let params = DiscoveryParams {
            timeout_ms: 0,
            ..Default::default()
        };
        let err = discovery
            .start(params, Arc::new(|_| {}), Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
    }

    #[tokio::test]
    async fn stop_on_idle_discovery_is_silent() {
        let discovery = PrinterDiscovery::new(vec![Arc::new(NeverMatches)]);
        discovery.stop().await;
        discovery.stop().await;
        assert!(!discovery.is_running());
    }
}
