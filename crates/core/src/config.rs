//! Configuration: `scipass.toml` parsing and runtime settings.
//!
//! [`ScipassConfig`] holds the daemon sections and the switch topology.
//!
//! # Precedence
//! 1. CLI flags (applied by the daemon)
//! 2. Environment variables (`SCIPASS_CONTROL_STATS_INTERVAL_SECS=10`)
//! 3. Config file
//! 4. `Default` implementations
//!
//! Environment overrides only cover the scalar sections; the switch
//! topology comes from the file alone.
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), scipass_core::error::ScipassError> {
//! use scipass_core::config::ScipassConfig;
//!
//! let config = ScipassConfig::load("/etc/scipass/scipass.toml").await?;
//! let config = ScipassConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, ScipassError};
use crate::prefix::{AddressFamily, Prefix};
use crate::types::{PortId, SwitchId, TopologyMode};

/// Root of `scipass.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScipassConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub switches: Vec<SwitchConfig>,
}

impl ScipassConfig {
    /// Reads the file, applies environment overrides and validates.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ScipassError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates the file without environment overrides.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ScipassError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ScipassError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                ScipassError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(toml_str: &str) -> Result<Self, ScipassError> {
        toml::from_str(toml_str).map_err(|e| {
            ScipassError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// Applies `SCIPASS_{SECTION}_{FIELD}` environment variables.
    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.general.log_level, "SCIPASS_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "SCIPASS_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.pid_file, "SCIPASS_GENERAL_PID_FILE");

        override_u64(
            &mut self.control.stats_interval_secs,
            "SCIPASS_CONTROL_STATS_INTERVAL_SECS",
        );
        override_u64(
            &mut self.control.balance_interval_secs,
            "SCIPASS_CONTROL_BALANCE_INTERVAL_SECS",
        );
        override_usize(
            &mut self.control.command_channel_capacity,
            "SCIPASS_CONTROL_COMMAND_CHANNEL_CAPACITY",
        );
        override_usize(
            &mut self.control.event_channel_capacity,
            "SCIPASS_CONTROL_EVENT_CHANNEL_CAPACITY",
        );

        override_bool(&mut self.persistence.enabled, "SCIPASS_PERSISTENCE_ENABLED");
        override_string(&mut self.persistence.state_dir, "SCIPASS_PERSISTENCE_STATE_DIR");

        override_bool(&mut self.metrics.enabled, "SCIPASS_METRICS_ENABLED");
        override_string(&mut self.metrics.listen_addr, "SCIPASS_METRICS_LISTEN_ADDR");
        override_u16(&mut self.metrics.port, "SCIPASS_METRICS_PORT");
        override_string(&mut self.metrics.endpoint, "SCIPASS_METRICS_ENDPOINT");
    }

    pub fn validate(&self) -> Result<(), ScipassError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if self.control.stats_interval_secs == 0 {
            return Err(invalid("control.stats_interval_secs", "must be greater than 0"));
        }
        if self.control.balance_interval_secs == 0 {
            return Err(invalid(
                "control.balance_interval_secs",
                "must be greater than 0",
            ));
        }
        if self.control.command_channel_capacity == 0 {
            return Err(invalid(
                "control.command_channel_capacity",
                "must be greater than 0",
            ));
        }
        if self.control.event_channel_capacity == 0 {
            return Err(invalid(
                "control.event_channel_capacity",
                "must be greater than 0",
            ));
        }

        if self.persistence.enabled && self.persistence.state_dir.is_empty() {
            return Err(invalid(
                "persistence.state_dir",
                "must not be empty when persistence is enabled",
            ));
        }

        if self.metrics.enabled && !self.metrics.endpoint.starts_with('/') {
            return Err(invalid("metrics.endpoint", "must start with '/'"));
        }

        let mut seen = HashSet::new();
        for (i, switch) in self.switches.iter().enumerate() {
            let id = switch.switch_id()?;
            if !seen.insert(id) {
                return Err(invalid(
                    &format!("switches[{i}].dpid"),
                    format!("duplicate datapath id {id}"),
                ));
            }
            switch.validate(&format!("switches[{i}]"))?;
        }

        Ok(())
    }

    /// Configuration of one switch, if declared.
    pub fn switch(&self, id: SwitchId) -> Option<&SwitchConfig> {
        self.switches
            .iter()
            .find(|s| s.switch_id().is_ok_and(|sid| sid == id))
    }
}

/// General daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// trace, debug, info, warn, error
    pub log_level: String,
    /// json, pretty
    pub log_format: String,
    pub pid_file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            pid_file: "/var/run/scipass.pid".to_owned(),
        }
    }
}

/// Control loop timing and queue sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Flow statistics poll interval
    pub stats_interval_secs: u64,
    /// Rebalance interval
    pub balance_interval_secs: u64,
    /// Outbound switch command queue
    pub command_channel_capacity: usize,
    /// Inbound control event queue
    pub event_channel_capacity: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: 5,
            balance_interval_secs: 15,
            command_channel_capacity: 1024,
            event_channel_capacity: 1024,
        }
    }
}

/// Balancer state snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    /// Snapshot files are written as `<state_dir>/<dpid><domain>.json`
    pub state_dir: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            state_dir: "/var/run".to_owned(),
        }
    }
}

/// Prometheus exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub port: u16,
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9100,
            endpoint: "/metrics".to_owned(),
        }
    }
}

/// One switch and its policy domains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    /// Datapath id as hex
    pub dpid: String,
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
}

impl SwitchConfig {
    pub fn switch_id(&self) -> Result<SwitchId, ConfigError> {
        self.dpid.parse()
    }

    fn validate(&self, path: &str) -> Result<(), ScipassError> {
        let mut names = HashSet::new();
        for (i, domain) in self.domains.iter().enumerate() {
            let field = format!("{path}.domains[{i}]");
            if !names.insert(domain.name.as_str()) {
                return Err(invalid(
                    &format!("{field}.name"),
                    format!("duplicate domain '{}'", domain.name),
                ));
            }
            domain.validate(&field)?;
        }
        Ok(())
    }
}

/// Role of a traffic port within a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    Lan,
    Wan,
    FwLan,
    FwWan,
}

/// A traffic port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(rename = "type")]
    pub role: PortRole,
    pub of_port_id: PortId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Address ranges behind this port (LAN ports)
    #[serde(default)]
    pub prefixes: Vec<Prefix>,
}

/// An inspection sensor attached to an output port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub sensor_id: String,
    pub of_port_id: PortId,
    #[serde(default)]
    pub description: String,
}

/// A set of sensors balanced as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorGroupConfig {
    pub group_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub admin_status: bool,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

/// One policy domain on a switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    pub name: String,
    pub mode: TopologyMode,
    pub admin_status: bool,
    pub max_prefixes: usize,
    pub most_specific_len: u8,
    pub least_specific_len: u8,
    pub most_specific_len_v6: u8,
    pub least_specific_len_v6: u8,
    /// Default idle timeout for signaled flows (seconds)
    pub idle_timeout: u16,
    /// Default hard timeout for signaled flows (seconds)
    pub hard_timeout: u16,
    pub blacklist_priority: u32,
    pub whitelist_priority: u32,
    /// Rule budget for the domain
    pub max_flows: usize,
    pub sensor_load_min_threshold: f64,
    pub sensor_load_delta_threshold: f64,
    /// Sibling prefixes below this combined rate (bits/s) may merge
    pub merge_threshold_bps: f64,
    pub ignore_sensor_load: bool,
    pub ignore_prefix_bw: bool,
    pub ports: Vec<PortConfig>,
    pub sensor_groups: Vec<SensorGroupConfig>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            mode: TopologyMode::default(),
            admin_status: true,
            max_prefixes: 32,
            most_specific_len: 29,
            least_specific_len: 24,
            most_specific_len_v6: 64,
            least_specific_len_v6: 48,
            idle_timeout: 90,
            hard_timeout: 0,
            blacklist_priority: 65535,
            whitelist_priority: 65535,
            max_flows: 2000,
            sensor_load_min_threshold: 0.02,
            sensor_load_delta_threshold: 0.05,
            merge_threshold_bps: 1_000_000.0,
            ignore_sensor_load: true,
            ignore_prefix_bw: false,
            ports: Vec::new(),
            sensor_groups: Vec::new(),
        }
    }
}

impl DomainConfig {
    /// Ports with the given role, in declaration order.
    pub fn ports_with_role(&self, role: PortRole) -> impl Iterator<Item = &PortConfig> {
        self.ports.iter().filter(move |p| p.role == role)
    }

    /// All prefixes declared on LAN ports, in declaration order.
    pub fn lan_prefixes(&self) -> Vec<Prefix> {
        self.ports_with_role(PortRole::Lan)
            .flat_map(|p| p.prefixes.iter().copied())
            .collect()
    }

    /// `(most_specific, least_specific)` mask bounds for a family.
    pub fn bounds(&self, family: AddressFamily) -> (u8, u8) {
        match family {
            AddressFamily::V4 => (self.most_specific_len, self.least_specific_len),
            AddressFamily::V6 => (self.most_specific_len_v6, self.least_specific_len_v6),
        }
    }

    fn validate(&self, path: &str) -> Result<(), ScipassError> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(invalid(
                &format!("{path}.name"),
                "must be non-empty and must not contain '/'",
            ));
        }

        for (family, label) in [(AddressFamily::V4, ""), (AddressFamily::V6, "_v6")] {
            let (most, least) = self.bounds(family);
            if most > family.max_len() {
                return Err(invalid(
                    &format!("{path}.most_specific_len{label}"),
                    format!("must be at most {}", family.max_len()),
                ));
            }
            if least > most {
                return Err(invalid(
                    &format!("{path}.least_specific_len{label}"),
                    format!("must not exceed most_specific_len{label} ({most})"),
                ));
            }
        }

        if self.max_prefixes == 0 {
            return Err(invalid(&format!("{path}.max_prefixes"), "must be greater than 0"));
        }
        if self.max_flows == 0 {
            return Err(invalid(&format!("{path}.max_flows"), "must be greater than 0"));
        }

        for (field, value) in [
            ("sensor_load_min_threshold", self.sensor_load_min_threshold),
            ("sensor_load_delta_threshold", self.sensor_load_delta_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(&format!("{path}.{field}"), "must be within 0.0..=1.0"));
            }
        }
        if self.merge_threshold_bps < 0.0 {
            return Err(invalid(
                &format!("{path}.merge_threshold_bps"),
                "must not be negative",
            ));
        }

        let wan_count = self.ports_with_role(PortRole::Wan).count();
        if wan_count != 1 {
            return Err(invalid(
                &format!("{path}.ports"),
                format!("exactly one wan port is required, found {wan_count}"),
            ));
        }
        if self.ports_with_role(PortRole::Lan).next().is_none() {
            return Err(invalid(&format!("{path}.ports"), "at least one lan port is required"));
        }
        if self.mode == TopologyMode::BypassFirewall {
            for role in [PortRole::FwLan, PortRole::FwWan] {
                if self.ports_with_role(role).count() != 1 {
                    return Err(invalid(
                        &format!("{path}.ports"),
                        format!("SciDMZ mode requires exactly one {role:?} port"),
                    ));
                }
            }
        }

        let prefixes = self.lan_prefixes();
        for (i, a) in prefixes.iter().enumerate() {
            for b in &prefixes[i + 1..] {
                if a.overlaps(b) {
                    return Err(invalid(
                        &format!("{path}.ports"),
                        format!("prefixes {a} and {b} overlap"),
                    ));
                }
            }
        }

        if self.sensor_groups.is_empty() {
            return Err(invalid(
                &format!("{path}.sensor_groups"),
                "at least one sensor group is required",
            ));
        }
        let traffic_ports: HashSet<PortId> = self.ports.iter().map(|p| p.of_port_id).collect();
        let mut group_ids = HashSet::new();
        for (i, group) in self.sensor_groups.iter().enumerate() {
            let field = format!("{path}.sensor_groups[{i}]");
            if !group_ids.insert(group.group_id.as_str()) {
                return Err(invalid(
                    &format!("{field}.group_id"),
                    format!("duplicate group '{}'", group.group_id),
                ));
            }
            if group.sensors.is_empty() {
                return Err(invalid(
                    &format!("{field}.sensors"),
                    "at least one sensor is required",
                ));
            }
            for sensor in &group.sensors {
                if traffic_ports.contains(&sensor.of_port_id) {
                    return Err(invalid(
                        &format!("{field}.sensors"),
                        format!(
                            "sensor '{}' uses traffic port {}",
                            sensor.sensor_id, sensor.of_port_id
                        ),
                    ));
                }
            }
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn invalid(field: &str, reason: impl Into<String>) -> ScipassError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.into(),
    }
    .into()
}

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u16(target: &mut u16, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u16>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u16 from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}
