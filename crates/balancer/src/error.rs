//! Balancer errors.
//!
//! Every variant is a recoverable refusal: the balancer state is left as it
//! was before the failed call.

use scipass_core::error::ScipassError;
use scipass_core::prefix::Prefix;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BalancerError {
    /// Split refused: the prefix is already at the most-specific bound.
    #[error("prefix {prefix} cannot be split past /{bound}")]
    MaxPrefixLength { prefix: Prefix, bound: u8 },

    /// The balancer already holds the maximum number of prefixes.
    #[error("prefix limit of {max} reached")]
    MaxPrefixCount { max: usize },

    /// Exact duplicate or overlap with a prefix already held.
    #[error("prefix {prefix} conflicts with {existing}")]
    DuplicatePrefix { prefix: Prefix, existing: Prefix },

    /// The domain's rule budget is exhausted.
    #[error("flow limit of {max} reached")]
    MaxFlowCount { max: usize },

    #[error("unknown sensor group: {0}")]
    UnknownGroup(String),

    #[error("sensor group already exists: {0}")]
    DuplicateGroup(String),

    #[error("unknown prefix: {0}")]
    UnknownPrefix(Prefix),

    #[error("unknown sensor: {0}")]
    UnknownSensor(String),

    #[error("sensor already exists: {0}")]
    DuplicateSensor(String),

    /// Sensor load outside 0.0..=1.0.
    #[error("invalid sensor load {0}, expected 0.0..=1.0")]
    InvalidLoad(f64),

    /// The event handler failed for a reason other than the flow budget.
    #[error("prefix event handler failed: {0}")]
    Handler(String),
}

impl BalancerError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MaxPrefixLength { .. } => "max_prefix_length",
            Self::MaxPrefixCount { .. } => "max_prefix_count",
            Self::DuplicatePrefix { .. } => "duplicate_prefix",
            Self::MaxFlowCount { .. } => "max_flow_count",
            Self::UnknownGroup(_) => "unknown_group",
            Self::DuplicateGroup(_) => "duplicate_group",
            Self::UnknownPrefix(_) => "unknown_prefix",
            Self::UnknownSensor(_) => "unknown_sensor",
            Self::DuplicateSensor(_) => "duplicate_sensor",
            Self::InvalidLoad(_) => "invalid_load",
            Self::Handler(_) => "handler",
        }
    }
}

impl From<BalancerError> for ScipassError {
    fn from(err: BalancerError) -> Self {
        ScipassError::Balance(err.to_string())
    }
}
