//! Coordinator settings.
//!
//! [`CoordinatorConfig`] gathers the control, persistence and switch
//! sections of the core configuration.
//!
//! ```ignore
//! use scipass_core::config::ScipassConfig;
//! use scipass_coordinator::config::CoordinatorConfig;
//!
//! let core = ScipassConfig::default();
//! let config = CoordinatorConfig::from_core(&core);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use scipass_core::config::{ScipassConfig, SwitchConfig};
use scipass_core::types::SwitchId;

use crate::error::CoordinatorError;

const MAX_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub stats_interval_secs: u64,
    pub balance_interval_secs: u64,
    pub command_channel_capacity: usize,
    pub event_channel_capacity: usize,
    pub persistence_enabled: bool,
    pub state_dir: PathBuf,
    pub switches: Vec<SwitchConfig>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_core(&ScipassConfig::default())
    }
}

impl CoordinatorConfig {
    pub fn from_core(core: &ScipassConfig) -> Self {
        Self {
            stats_interval_secs: core.control.stats_interval_secs,
            balance_interval_secs: core.control.balance_interval_secs,
            command_channel_capacity: core.control.command_channel_capacity,
            event_channel_capacity: core.control.event_channel_capacity,
            persistence_enabled: core.persistence.enabled,
            state_dir: PathBuf::from(&core.persistence.state_dir),
            switches: core.switches.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), CoordinatorError> {
        for (field, value) in [
            ("stats_interval_secs", self.stats_interval_secs),
            ("balance_interval_secs", self.balance_interval_secs),
        ] {
            if value == 0 || value > MAX_INTERVAL_SECS {
                return Err(CoordinatorError::Config {
                    field: field.to_owned(),
                    reason: format!("must be 1-{MAX_INTERVAL_SECS}"),
                });
            }
        }
        for (field, value) in [
            ("command_channel_capacity", self.command_channel_capacity),
            ("event_channel_capacity", self.event_channel_capacity),
        ] {
            if value == 0 {
                return Err(CoordinatorError::Config {
                    field: field.to_owned(),
                    reason: "must be greater than 0".to_owned(),
                });
            }
        }
        if self.persistence_enabled && self.state_dir.as_os_str().is_empty() {
            return Err(CoordinatorError::Config {
                field: "state_dir".to_owned(),
                reason: "must not be empty when persistence is enabled".to_owned(),
            });
        }
        Ok(())
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn balance_interval(&self) -> Duration {
        Duration::from_secs(self.balance_interval_secs)
    }

    /// Configuration of a switch, if declared.
    pub fn switch(&self, id: SwitchId) -> Option<&SwitchConfig> {
        self.switches
            .iter()
            .find(|s| s.switch_id().is_ok_and(|sid| sid == id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_core_copies_sections() {
        let mut core = ScipassConfig::default();
        core.control.stats_interval_secs = 7;
        core.persistence.state_dir = "/tmp/scipass".to_owned();
        core.switches.push(SwitchConfig {
            dpid: "00000000000000ab".to_owned(),
            domains: Vec::new(),
        });

        let config = CoordinatorConfig::from_core(&core);
        assert_eq!(config.stats_interval(), Duration::from_secs(7));
        assert_eq!(config.balance_interval(), Duration::from_secs(15));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/scipass"));
        assert!(config.switch(SwitchId(0xab)).is_some());
        assert!(config.switch(SwitchId(1)).is_none());
    }

    #[test]
    fn default_is_valid() {
        CoordinatorConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_interval_rejected() {
        let config = CoordinatorConfig {
            balance_interval_secs: 0,
            ..CoordinatorConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, CoordinatorError::Config { field, .. } if field == "balance_interval_secs"));
    }

    #[test]
    fn zero_capacity_rejected() {
        let config = CoordinatorConfig {
            command_channel_capacity: 0,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_state_dir_rejected_only_when_enabled() {
        let mut config = CoordinatorConfig {
            state_dir: PathBuf::new(),
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
        config.persistence_enabled = false;
        assert!(config.validate().is_ok());
    }
}
