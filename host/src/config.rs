//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `gateway.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - GatewayIdentity: gateway number (shown as PE_IOT_GATEWAY_<id>).
//!     - IngestConfig: UDP port, receive buffer, receive wait and backoff.
//!     - LivenessConfig: STALE timeout and sweep period.
//!     - NotifyConfig: update channel depth and per-node debounce.
//!     - ApiConfig / RelayConfig / IndicatorConfig: consumers.
//!     - LoggingConfig: tracing filter and per-packet logging.
//!
//! every section is optional; missing keys take the defaults below.
//!
//! ==============================================================================

use anyhow::Context;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub gateway: GatewayIdentity,
    pub ingest: IngestConfig,
    pub liveness: LivenessConfig,
    pub notify: NotifyConfig,
    pub api: ApiConfig,
    pub relay: RelayConfig,
    pub indicator: IndicatorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GatewayIdentity {
    pub id: u32,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    /// receive buffer size, longer datagrams are truncated
    pub max_payload: usize,
    pub recv_timeout_ms: u64,
    /// pause after the transport reports not-ready
    pub backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LivenessConfig {
    pub stale_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct NotifyConfig {
    pub capacity: usize,
    pub min_spacing_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct IndicatorConfig {
    pub enabled: bool,
    /// gpio pin per node, index 0 = node 1
    pub pins: Vec<u8>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// log every accepted reading at info
    pub show_sensor_data: bool,
}

impl Default for GatewayIdentity {
    fn default() -> Self {
        Self { id: 1 }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 50000,
            max_payload: 256,
            recv_timeout_ms: 1000,
            backoff_ms: 1000,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self { stale_timeout_ms: 5000, sweep_interval_ms: 1000 }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { capacity: 10, min_spacing_ms: 50 }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: true, bind: "0.0.0.0:3000".to_string() }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "192.168.4.2".to_string(),
            port: 8080,
            connect_timeout_ms: 3000,
        }
    }
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self { enabled: true, pins: vec![2, 21, 22, 15] }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

impl IngestConfig {
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl LivenessConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl GatewayConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: GatewayConfig = toml::from_str(content).context("Failed to parse config")?;
        anyhow::ensure!(config.ingest.max_payload >= 256, "ingest.max_payload must be at least 256");
        anyhow::ensure!(config.liveness.stale_timeout_ms > 0, "liveness.stale_timeout_ms must be non-zero");
        anyhow::ensure!(config.ingest.recv_timeout_ms > 0, "ingest.recv_timeout_ms must be non-zero");
        anyhow::ensure!(config.ingest.backoff_ms > 0, "ingest.backoff_ms must be non-zero");
        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            std::path::PathBuf::from("config").join("gateway.toml"),
            std::path::PathBuf::from("..").join("config").join("gateway.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// Gateway name as advertised by the access point
    pub fn gateway_name(&self) -> String {
        format!("PE_IOT_GATEWAY_{}", self.gateway.id)
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│          GATEWAY CONFIGURATION          │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Gateway: {}", self.gateway_name());
        println!("│ UDP Ingest: {}:{}", self.ingest.bind_ip, self.ingest.port);
        println!("│ Stale Timeout: {}ms (sweep {}ms)", self.liveness.stale_timeout_ms, self.liveness.sweep_interval_ms);
        println!("│ API: {} ({})", if self.api.enabled { "on" } else { "off" }, self.api.bind);
        println!("│ Relay: {} ({}:{})", if self.relay.enabled { "on" } else { "off" }, self.relay.host, self.relay.port);
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_gateway_constants() {
        let config = GatewayConfig::default();
        assert_eq!(config.ingest.port, 50000);
        assert_eq!(config.ingest.max_payload, 256);
        assert_eq!(config.liveness.stale_timeout_ms, 5000);
        assert_eq!(config.liveness.sweep_interval(), Duration::from_secs(1));
        assert_eq!(config.indicator.pins, vec![2, 21, 22, 15]);
        assert_eq!(config.gateway_name(), "PE_IOT_GATEWAY_1");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = GatewayConfig::parse(
            r#"
            [gateway]
            id = 7

            [liveness]
            stale_timeout_ms = 8000

            [relay]
            enabled = true
            host = "10.0.0.5"
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway_name(), "PE_IOT_GATEWAY_7");
        assert_eq!(config.liveness.stale_timeout_ms, 8000);
        assert_eq!(config.liveness.sweep_interval_ms, 1000);
        assert!(config.relay.enabled);
        assert_eq!(config.relay.host, "10.0.0.5");
        assert_eq!(config.relay.port, 8080);
        assert_eq!(config.ingest, IngestConfig::default());
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(GatewayConfig::parse("").unwrap(), GatewayConfig::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(GatewayConfig::parse("[ingest]\nmax_payload = 64").is_err());
        assert!(GatewayConfig::parse("[liveness]\nstale_timeout_ms = 0").is_err());
        assert!(GatewayConfig::parse("[ingest]\nport = \"fifty\"").is_err());

        let err = GatewayConfig::parse("[ingest]\nbackoff_ms = 0").unwrap_err();
        assert!(err.to_string().contains("backoff_ms"));
        assert!(GatewayConfig::parse("[ingest]\nrecv_timeout_ms = 0").is_err());
        assert!(GatewayConfig::parse("[ingest]\nbackoff_ms = 1").is_ok());
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let shipped = include_str!("../../config/gateway.toml");
        assert_eq!(GatewayConfig::parse(shipped).unwrap(), GatewayConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[ingest]\nport = 3000\nbind_ip = \"127.0.0.1\"").unwrap();
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.ingest.port, 3000);
        assert_eq!(config.ingest.bind_ip, IpAddr::from([127, 0, 0, 1]));
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = GatewayConfig::load("/nonexistent/gateway.toml").unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read config file"));
    }
}
