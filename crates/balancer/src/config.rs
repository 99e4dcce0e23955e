//! Balancer settings.
//!
//! [`BalancerConfig`] is derived from a domain section of the core
//! configuration.
//!
//! ```ignore
//! use scipass_core::config::DomainConfig;
//! use scipass_balancer::config::BalancerConfig;
//!
//! let config = BalancerConfig::from_domain(&DomainConfig::default());
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use scipass_core::config::DomainConfig;
use scipass_core::prefix::AddressFamily;

/// Rebalancing strategy, chosen from the two `ignore_*` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceMode {
    /// Address space only.
    IpSpace,
    /// Measured prefix bandwidth.
    NetBytes,
    /// Reported sensor load combined with bandwidth.
    LoadAndBandwidth,
}

impl BalanceMode {
    /// Metric label.
    pub fn label(self) -> &'static str {
        match self {
            Self::IpSpace => "ip_space",
            Self::NetBytes => "net_bytes",
            Self::LoadAndBandwidth => "load_and_bandwidth",
        }
    }
}

impl fmt::Display for BalanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IpSpace => write!(f, "IP Space"),
            Self::NetBytes => write!(f, "Prefix Bandwidth"),
            Self::LoadAndBandwidth => write!(f, "Sensor Load and Prefix Bandwidth"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Ceiling on prefixes held across all groups
    pub max_prefixes: usize,
    pub most_specific_len: u8,
    pub least_specific_len: u8,
    pub most_specific_len_v6: u8,
    pub least_specific_len_v6: u8,
    /// Below this max group load nothing is rebalanced
    pub min_load_threshold: f64,
    /// Rebalance only when max - min load reaches this
    pub delta_threshold: f64,
    /// Siblings whose combined rate is below this (bits/s) may merge
    pub merge_threshold_bps: f64,
    pub ignore_sensor_load: bool,
    pub ignore_prefix_bw: bool,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self::from_domain(&DomainConfig::default())
    }
}

impl BalancerConfig {
    pub fn from_domain(domain: &DomainConfig) -> Self {
        Self {
            max_prefixes: domain.max_prefixes,
            most_specific_len: domain.most_specific_len,
            least_specific_len: domain.least_specific_len,
            most_specific_len_v6: domain.most_specific_len_v6,
            least_specific_len_v6: domain.least_specific_len_v6,
            min_load_threshold: domain.sensor_load_min_threshold,
            delta_threshold: domain.sensor_load_delta_threshold,
            merge_threshold_bps: domain.merge_threshold_bps,
            ignore_sensor_load: domain.ignore_sensor_load,
            ignore_prefix_bw: domain.ignore_prefix_bw,
        }
    }

    /// `(most_specific, least_specific)` for a family.
    pub fn bounds(&self, family: AddressFamily) -> (u8, u8) {
        match family {
            AddressFamily::V4 => (self.most_specific_len, self.least_specific_len),
            AddressFamily::V6 => (self.most_specific_len_v6, self.least_specific_len_v6),
        }
    }

    pub fn mode(&self) -> BalanceMode {
        match (self.ignore_sensor_load, self.ignore_prefix_bw) {
            (true, true) => BalanceMode::IpSpace,
            (true, false) => BalanceMode::NetBytes,
            (false, _) => BalanceMode::LoadAndBandwidth,
        }
    }
}
