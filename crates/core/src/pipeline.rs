//! Lifecycle trait for long-running components.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::ScipassError;

/// Component health as reported to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    /// Running with reduced function
    Degraded(String),
    /// Not doing its job
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

/// A component the daemon starts, stops and probes.
///
/// `start` spawns the component's background tasks and returns; `stop`
/// signals them and waits for them to finish.
pub trait Pipeline: Send + Sync {
    fn start(&mut self) -> impl Future<Output = Result<(), ScipassError>> + Send;

    fn stop(&mut self) -> impl Future<Output = Result<(), ScipassError>> + Send;

    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "healthy");
        assert_eq!(
            HealthStatus::Degraded("queue full".to_owned()).to_string(),
            "degraded: queue full"
        );
        assert!(HealthStatus::Unhealthy("x".to_owned()).is_unhealthy());
        assert!(!HealthStatus::Degraded("x".to_owned()).is_healthy());
    }
}
