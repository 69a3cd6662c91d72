//! Unit configuration.
//!
//! One TOML file per unit. The `[unit]` section is mandatory; every
//! other section has working defaults so a minimal file is just an id
//! and the member list. [`UnitConfig::policy`] produces the cluster
//! policy handed to the state machine, [`UnitConfig::bus_config`] the
//! wiring for the JSON-lines bus.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use gridmesh_types::{Policy, UnitId};
use serde::Deserialize;
use thiserror::Error;

use crate::bus::BusConfig;
use crate::telemetry::TelemetryConfig;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Full configuration for one unit process.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitConfig {
    pub unit: UnitSection,
    pub cluster: ClusterSection,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub safety: SafetySection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitSection {
    /// This unit's cluster-wide id.
    pub unit_id: u64,
    /// Start as the coordinator. Exactly one unit per cluster.
    #[serde(default)]
    pub coordinator: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSection {
    /// Ids of every cluster member, this unit included.
    pub members: Vec<u64>,
    /// Bus addresses of the other members.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    /// Bus address of the trading layer, if one is attached.
    #[serde(default)]
    pub deal_service_addr: Option<String>,
}

/// One `[[cluster.peers]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    pub unit_id: u64,
    pub addr: String,
}

/// Protocol timings, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingSection {
    #[serde(default = "default_error_sustain_ms")]
    pub error_sustain_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_collection_interval_ms")]
    pub collection_interval_ms: u64,
    #[serde(default = "default_collection_timeout_ms")]
    pub collection_timeout_ms: u64,
    #[serde(default = "default_scram_settle_delay_ms")]
    pub scram_settle_delay_ms: u64,
    #[serde(default = "default_stop_poll_interval_ms")]
    pub stop_poll_interval_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_error_sustain_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_collection_interval_ms() -> u64 {
    5_000
}

fn default_collection_timeout_ms() -> u64 {
    2_000
}

fn default_scram_settle_delay_ms() -> u64 {
    5_000
}

fn default_stop_poll_interval_ms() -> u64 {
    1_000
}

fn default_stop_timeout_ms() -> u64 {
    60_000
}

fn default_request_timeout_ms() -> u64 {
    2_000
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            error_sustain_ms: default_error_sustain_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            collection_interval_ms: default_collection_interval_ms(),
            collection_timeout_ms: default_collection_timeout_ms(),
            scram_settle_delay_ms: default_scram_settle_delay_ms(),
            stop_poll_interval_ms: default_stop_poll_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Electrical envelope parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SafetySection {
    /// Per-unit grid current allowance, in amperes.
    #[serde(default = "default_per_unit_allowance")]
    pub per_unit_allowance: f64,
    /// Grid voltage setpoint handed to the voltage reference, in volts.
    #[serde(default = "default_grid_voltage_setpoint")]
    pub grid_voltage_setpoint: f64,
    /// Droop ratio handed to the voltage reference.
    #[serde(default = "default_droop_ratio")]
    pub droop_ratio: f64,
}

fn default_per_unit_allowance() -> f64 {
    30.0
}

fn default_grid_voltage_setpoint() -> f64 {
    380.0
}

fn default_droop_ratio() -> f64 {
    0.2
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            per_unit_allowance: default_per_unit_allowance(),
            grid_voltage_setpoint: default_grid_voltage_setpoint(),
            droop_ratio: default_droop_ratio(),
        }
    }
}

/// Bus listener and connection parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_listen_addr() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    500
}

fn default_max_line_bytes() -> usize {
    256 * 1024
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

/// Tracing and metrics exposure.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub otlp_enabled: bool,
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_service_name() -> String {
    "gridmesh-unit".to_string()
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            otlp_enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            sampling_ratio: default_sampling_ratio(),
            metrics_enabled: default_metrics_enabled(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl UnitConfig {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate config from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: UnitConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.members.is_empty() {
            return Err(ConfigError::Invalid("cluster has no members".to_string()));
        }
        if !self.cluster.members.contains(&self.unit.unit_id) {
            return Err(ConfigError::Invalid(format!(
                "unit {} is not in the cluster member list",
                self.unit.unit_id
            )));
        }

        parse_addr("bus.listen_addr", &self.bus.listen_addr)?;
        for peer in &self.cluster.peers {
            parse_addr("cluster.peers", &peer.addr)?;
        }
        if let Some(addr) = &self.cluster.deal_service_addr {
            parse_addr("cluster.deal_service_addr", addr)?;
        }

        for member in &self.cluster.members {
            if *member == self.unit.unit_id {
                continue;
            }
            if !self.cluster.peers.iter().any(|p| p.unit_id == *member) {
                return Err(ConfigError::Invalid(format!(
                    "no bus address configured for unit {member}"
                )));
            }
        }
        Ok(())
    }

    pub fn unit_id(&self) -> UnitId {
        UnitId(self.unit.unit_id)
    }

    /// The cluster policy the state machine runs under.
    pub fn policy(&self) -> Policy {
        let timing = &self.timing;
        Policy {
            members: self.cluster.members.iter().copied().map(UnitId).collect(),
            error_sustain: Duration::from_millis(timing.error_sustain_ms),
            sweep_interval: Duration::from_millis(timing.sweep_interval_ms),
            heartbeat_interval: Duration::from_millis(timing.heartbeat_interval_ms),
            collection_interval: Duration::from_millis(timing.collection_interval_ms),
            collection_timeout: Duration::from_millis(timing.collection_timeout_ms),
            scram_settle_delay: Duration::from_millis(timing.scram_settle_delay_ms),
            stop_poll_interval: Duration::from_millis(timing.stop_poll_interval_ms),
            stop_timeout: Duration::from_millis(timing.stop_timeout_ms),
            request_timeout: Duration::from_millis(timing.request_timeout_ms),
            per_unit_allowance: self.safety.per_unit_allowance,
            grid_voltage_setpoint: self.safety.grid_voltage_setpoint,
            droop_ratio: self.safety.droop_ratio,
        }
    }

    /// Bus wiring derived from the cluster and bus sections.
    pub fn bus_config(&self) -> Result<BusConfig, ConfigError> {
        let listen_addr = parse_addr("bus.listen_addr", &self.bus.listen_addr)?;
        let mut peers = HashMap::new();
        for peer in &self.cluster.peers {
            peers.insert(UnitId(peer.unit_id), parse_addr("cluster.peers", &peer.addr)?);
        }
        let deal_service = match &self.cluster.deal_service_addr {
            Some(addr) => Some(parse_addr("cluster.deal_service_addr", addr)?),
            None => None,
        };
        Ok(BusConfig {
            listen_addr,
            peers,
            deal_service,
            connect_timeout: Duration::from_millis(self.bus.connect_timeout_ms),
            max_line_bytes: self.bus.max_line_bytes,
        })
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        let section = &self.telemetry;
        TelemetryConfig {
            service_name: section.service_name.clone(),
            otlp_endpoint: section
                .otlp_enabled
                .then(|| section.otlp_endpoint.clone()),
            sampling_ratio: section.sampling_ratio,
            prometheus_enabled: section.metrics_enabled,
            prometheus_port: section.metrics_port,
            resource_attributes: vec![("unit.id".to_string(), self.unit.unit_id.to_string())],
        }
    }
}

fn parse_addr(field: &str, raw: &str) -> Result<SocketAddr, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::Invalid(format!("{field}: {raw} is not a socket address")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [unit]
        unit_id = 1

        [cluster]
        members = [1]
    "#;

    const FULL: &str = r#"
        [unit]
        unit_id = 1
        coordinator = true

        [cluster]
        members = [1, 2, 3]
        deal_service_addr = "127.0.0.1:7500"

        [[cluster.peers]]
        unit_id = 2
        addr = "127.0.0.1:7402"

        [[cluster.peers]]
        unit_id = 3
        addr = "127.0.0.1:7403"

        [timing]
        heartbeat_interval_ms = 1000
        collection_interval_ms = 2000

        [safety]
        per_unit_allowance = 45.0

        [bus]
        listen_addr = "127.0.0.1:7401"

        [telemetry]
        otlp_enabled = true
        otlp_endpoint = "http://collector:4317"
        metrics_port = 9191
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = UnitConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.unit_id(), UnitId(1));
        assert!(!config.unit.coordinator);
        assert_eq!(config.timing.heartbeat_interval_ms, 5_000);
        assert_eq!(config.timing.stop_timeout_ms, 60_000);
        assert_eq!(config.safety.grid_voltage_setpoint, 380.0);
        assert_eq!(config.bus.listen_addr, "127.0.0.1:7400");
        assert!(!config.telemetry.otlp_enabled);
        assert_eq!(config.telemetry.metrics_port, 9090);
    }

    #[test]
    fn test_full_config_parses() {
        let config = UnitConfig::from_toml_str(FULL).unwrap();
        assert!(config.unit.coordinator);
        assert_eq!(config.cluster.peers.len(), 2);
        assert_eq!(config.timing.heartbeat_interval_ms, 1_000);
        assert_eq!(config.safety.per_unit_allowance, 45.0);

        let bus = config.bus_config().unwrap();
        assert_eq!(bus.peers.len(), 2);
        assert_eq!(
            bus.peers[&UnitId(3)],
            "127.0.0.1:7403".parse::<SocketAddr>().unwrap()
        );
        assert!(bus.deal_service.is_some());

        let telemetry = config.telemetry_config();
        assert_eq!(
            telemetry.otlp_endpoint.as_deref(),
            Some("http://collector:4317")
        );
        assert_eq!(telemetry.prometheus_port, 9191);
    }

    #[test]
    fn test_policy_conversion() {
        let config = UnitConfig::from_toml_str(FULL).unwrap();
        let policy = config.policy();
        assert_eq!(policy.members.len(), 3);
        assert!(policy.members.contains(&UnitId(2)));
        assert_eq!(policy.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(policy.collection_interval, Duration::from_secs(2));
        assert_eq!(policy.error_sustain, Duration::from_secs(30));
        assert_eq!(policy.per_unit_allowance, 45.0);
    }

    #[test]
    fn test_rejects_unit_outside_member_list() {
        let raw = r#"
            [unit]
            unit_id = 9

            [cluster]
            members = [1, 2]
        "#;
        match UnitConfig::from_toml_str(raw) {
            Err(ConfigError::Invalid(message)) => {
                assert!(message.contains("not in the cluster member list"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_member_without_peer_address() {
        let raw = r#"
            [unit]
            unit_id = 1

            [cluster]
            members = [1, 2]
        "#;
        match UnitConfig::from_toml_str(raw) {
            Err(ConfigError::Invalid(message)) => {
                assert!(message.contains("no bus address configured for unit 2"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_malformed_address() {
        let raw = r#"
            [unit]
            unit_id = 1

            [cluster]
            members = [1]

            [bus]
            listen_addr = "not-an-address"
        "#;
        match UnitConfig::from_toml_str(raw) {
            Err(ConfigError::Invalid(message)) => {
                assert!(message.contains("not a socket address"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let raw = r#"
            [unit]
            unit_id = 1
            legacy_flag = true

            [cluster]
            members = [1]
        "#;
        assert!(matches!(
            UnitConfig::from_toml_str(raw),
            Err(ConfigError::Parse(_))
        ));
    }
}
