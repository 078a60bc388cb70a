//! Service configuration
//!
//! Loaded from a YAML, TOML or JSON file with `M3SRV_` environment
//! overrides (`M3SRV_SCAN__PERIOD_MS=250`).

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use m3_protocols::seqdev::{Target, DEFAULT_QUEUE_CAPACITY, DEFAULT_TIMEOUT_MS};

use crate::error::{M3SrvError, Result};
use crate::records::RecordKind;

pub const ENV_PREFIX: &str = "M3SRV_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct M3SrvConfig {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub records: Vec<RecordConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub json_logs: bool,
}

fn default_service_name() -> String {
    "m3srv".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_dir: None,
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process module image
    #[default]
    Simulated,
    /// Remote module behind a TCP gateway
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_local_slot")]
    pub local_slot: u8,
    /// Per-request deadline
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub target: Target,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5020
}

fn default_local_slot() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            host: default_host(),
            port: default_port(),
            local_slot: default_local_slot(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            target: Target::default(),
        }
    }
}

impl TransportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
}

fn default_period_ms() -> u64 {
    1000
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
        }
    }
}

impl ScanConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// When a record is processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Every scan period
    #[default]
    Periodic,
    /// When the record's interrupt source fires
    IoIntr,
    /// Only on explicit request
    Passive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    pub name: String,
    pub kind: RecordKind,
    pub address: String,
    #[serde(default)]
    pub scan: ScanMode,
    /// Setpoint for output records
    #[serde(default)]
    pub value: Option<i64>,
}

impl M3SrvConfig {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = common::load_config_from_file(path, Some(ENV_PREFIX))?;
        config.validate()?;
        debug!("{} record(s) configured", config.records.len());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let transport = &self.transport;
        if transport.timeout_ms == 0 {
            return Err(M3SrvError::config("transport.timeout_ms must be > 0"));
        }
        if transport.kind == TransportKind::Tcp && transport.connect_timeout_ms == 0 {
            return Err(M3SrvError::config(
                "transport.connect_timeout_ms must be > 0",
            ));
        }
        if transport.queue_capacity == 0 {
            return Err(M3SrvError::config("transport.queue_capacity must be > 0"));
        }
        if self.scan.period_ms == 0 {
            return Err(M3SrvError::config("scan.period_ms must be > 0"));
        }

        let mut names = HashSet::new();
        for record in &self.records {
            if record.name.trim().is_empty() {
                return Err(M3SrvError::config("record with empty name"));
            }
            if !names.insert(record.name.as_str()) {
                return Err(M3SrvError::config(format!(
                    "duplicate record name '{}'",
                    record.name
                )));
            }
            if record.address.trim().is_empty() {
                return Err(M3SrvError::config(format!(
                    "record '{}' has an empty address",
                    record.name
                )));
            }
            if record.kind.is_output()
                && record.scan != ScanMode::Passive
                && record.value.is_none()
            {
                return Err(M3SrvError::config(format!(
                    "output record '{}' needs a value unless passive",
                    record.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn record(name: &str, kind: RecordKind, address: &str) -> RecordConfig {
        RecordConfig {
            name: name.into(),
            kind,
            address: address.into(),
            scan: ScanMode::Periodic,
            value: None,
        }
    }

    #[test]
    fn test_defaults() {
        let config = M3SrvConfig::default();
        assert_eq!(config.service.name, "m3srv");
        assert_eq!(config.transport.kind, TransportKind::Simulated);
        assert_eq!(config.transport.port, 5020);
        assert_eq!(config.transport.timeout_ms, 1000);
        assert_eq!(config.transport.queue_capacity, 64);
        assert_eq!(config.transport.target, Target::F3rp71);
        assert_eq!(config.scan.period(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut config = M3SrvConfig::default();
        config.records.push(record("A", RecordKind::Longin, "R1"));
        config.records.push(record("A", RecordKind::Longin, "R2"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_empty_address_rejected() {
        let mut config = M3SrvConfig::default();
        config.records.push(record("A", RecordKind::Longin, " "));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = M3SrvConfig::default();
        config.transport.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = M3SrvConfig::default();
        config.scan.period_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_output_needs_value_unless_passive() {
        let mut config = M3SrvConfig::default();
        config.records.push(record("OUT", RecordKind::Longout, "R1"));
        assert!(config.validate().is_err());

        config.records[0].scan = ScanMode::Passive;
        assert!(config.validate().is_ok());

        config.records[0].scan = ScanMode::Periodic;
        config.records[0].value = Some(5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_sections() {
        let yaml = r#"
transport:
  kind: tcp
  port: 6000
  target: f3rp61
scan:
  period_ms: 250
records:
  - name: TEMP
    kind: longin
    address: "R10&W"
  - name: LAMP
    kind: bo
    address: "U0,S3,Y1"
    scan: passive
"#;
        let config: M3SrvConfig = figment::Figment::new()
            .merge(<figment::providers::Yaml as figment::providers::Format>::string(yaml))
            .extract()
            .unwrap();
        assert_eq!(config.transport.kind, TransportKind::Tcp);
        assert_eq!(config.transport.port, 6000);
        assert_eq!(config.transport.target, Target::F3rp61);
        assert_eq!(config.scan.period_ms, 250);
        assert_eq!(config.records[1].scan, ScanMode::Passive);
        assert_eq!(config.records[1].kind, RecordKind::Bo);
        assert!(config.validate().is_ok());
    }
}
