use serde::{Deserialize, Serialize};

/// Configuration for the LAN service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LanConfig {
    /// Upper bound on simultaneously connected printers; 0 means unlimited.
    pub max_connections: usize,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self { max_connections: 0 }
    }
}

/// One discovery run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscoveryParams {
    /// Total run length in milliseconds (1..=300_000).
    pub timeout_ms: u64,
    /// Re-broadcast cadence; must be strictly less than `timeout_ms` when
    /// `enable_auto_retry` is set.
    pub broadcast_interval_ms: u64,
    pub enable_auto_retry: bool,
    /// Local ports to try binding, in order, before falling back to an
    /// ephemeral port.
    pub preferred_listen_ports: Vec<u16>,
}

impl Default for DiscoveryParams {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            broadcast_interval_ms: 2000,
            enable_auto_retry: true,
            preferred_listen_ports: Vec::new(),
        }
    }
}

/// Configuration for the cloud service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CloudConfig {
    /// Region identifier, e.g. "us" or "cn"; selects the default API host.
    pub region: String,
    /// Overrides the region-derived API base URL when non-empty.
    pub base_api_url: String,
    /// RTM gateway URL; derived from the API host when empty.
    pub rtm_url: String,
    pub user_agent: String,
    /// CA bundle used when the platform trust store is not available.
    pub ca_cert_path: String,
    /// Seconds between service-connection checks.
    pub connection_monitor_interval_secs: u64,
}

impl CloudConfig {
    pub fn api_base_url(&self) -> String {
        if !self.base_api_url.is_empty() {
            return self.base_api_url.trim_end_matches('/').to_string();
        }
        match self.region.as_str() {
            "cn" => "https://api.elegoo.com.cn".to_string(),
            _ => "https://api.elegoo.com".to_string(),
        }
    }

    pub fn rtm_gateway_url(&self) -> String {
        if !self.rtm_url.is_empty() {
            return self.rtm_url.clone();
        }
        let base = self.api_base_url();
        let host = base
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        format!("wss://{}/rtm/v1/gateway", host)
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            region: "us".to_string(),
            base_api_url: String::new(),
            rtm_url: String::new(),
            user_agent: format!("elink/{}", env!("CARGO_PKG_VERSION")),
            ca_cert_path: String::new(),
            connection_monitor_interval_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_selects_api_host() {
        let mut config = CloudConfig::default();
        assert_eq!(config.api_base_url(), "https://api.elegoo.com");
        config.region = "cn".to_string();
        assert_eq!(config.api_base_url(), "https://api.elegoo.com.cn");
    }

    #[test]
    fn explicit_base_url_wins_and_drops_trailing_slash() {
        let config = CloudConfig {
            base_api_url: "https://staging.example.com/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.api_base_url(), "https://staging.example.com");
        assert_eq!(
            config.rtm_gateway_url(),
            "wss://staging.example.com/rtm/v1/gateway"
        );
    }
}
