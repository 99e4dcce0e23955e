//! Coordinator errors.
//!
//! [`CoordinatorError`] covers everything the forwarding-state side can
//! refuse. `From<CoordinatorError> for ScipassError` lets the daemon
//! propagate it with `?`.

use scipass_balancer::BalancerError;
use scipass_core::error::{ConfigError, ScipassError};
use scipass_core::types::SwitchId;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Switch not declared in the configuration or not connected
    #[error("unknown switch: {0}")]
    UnknownSwitch(SwitchId),

    #[error("unknown domain '{domain}' on switch {switch}")]
    UnknownDomain { switch: SwitchId, domain: String },

    /// No domain's LAN prefixes contain either end of a signaled flow
    #[error("no domain owns flow {0}")]
    NoOwningDomain(String),

    /// Malformed good/bad-flow descriptor
    #[error("invalid flow signal: {0}")]
    InvalidSignal(String),

    /// The domain's rule budget is exhausted
    #[error("flow limit of {max} reached")]
    MaxFlowCount { max: usize },

    #[error("port layout error: {0}")]
    Layout(String),

    #[error(transparent)]
    Balancer(#[from] BalancerError),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("config error: {field}: {reason}")]
    Config { field: String, reason: String },
}

impl From<CoordinatorError> for BalancerError {
    /// Handler failures reach the balancer as its own error kinds.
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::MaxFlowCount { max } => BalancerError::MaxFlowCount { max },
            CoordinatorError::Balancer(inner) => inner,
            other => BalancerError::Handler(other.to_string()),
        }
    }
}

impl From<CoordinatorError> for ScipassError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Persistence(msg) => ScipassError::Persistence(msg),
            CoordinatorError::Config { field, reason } => {
                ScipassError::Config(ConfigError::InvalidValue { field, reason })
            }
            CoordinatorError::Balancer(inner) => inner.into(),
            other => ScipassError::Forwarding(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_limit_maps_to_balancer_flow_limit() {
        let err: BalancerError = CoordinatorError::MaxFlowCount { max: 10 }.into();
        assert_eq!(err, BalancerError::MaxFlowCount { max: 10 });
    }

    #[test]
    fn other_errors_map_to_handler_failure() {
        let err: BalancerError = CoordinatorError::Layout("no lan port".to_owned()).into();
        assert!(matches!(err, BalancerError::Handler(msg) if msg.contains("no lan port")));
    }

    #[test]
    fn converts_to_scipass_error() {
        let err: ScipassError = CoordinatorError::Persistence("disk full".to_owned()).into();
        assert!(matches!(err, ScipassError::Persistence(_)));

        let err: ScipassError = CoordinatorError::UnknownSwitch(SwitchId(7)).into();
        assert!(err.to_string().contains("0000000000000007"));

        let err: ScipassError = CoordinatorError::Config {
            field: "control.stats_interval_secs".to_owned(),
            reason: "must be > 0".to_owned(),
        }
        .into();
        assert!(matches!(err, ScipassError::Config(_)));
    }

    #[test]
    fn unknown_domain_display() {
        let err = CoordinatorError::UnknownDomain {
            switch: SwitchId(1),
            domain: "R&E".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "unknown domain 'R&E' on switch 0000000000000001"
        );
    }
}
