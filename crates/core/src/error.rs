//! Error types shared across the workspace.
//!
//! Each component crate defines its own error enum and converts it into
//! [`ScipassError`] at the crate boundary.

/// Top-level SciPass error.
#[derive(Debug, thiserror::Error)]
pub enum ScipassError {
    /// Configuration problem
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Component lifecycle or channel problem
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Malformed address prefix
    #[error("prefix error: {0}")]
    Prefix(#[from] PrefixError),

    /// Prefix balancer refused a mutation
    #[error("balancer error: {0}")]
    Balance(String),

    /// Forwarding-state coordinator failure
    #[error("forwarding error: {0}")]
    Forwarding(String),

    /// Snapshot read/write failure
    #[error("persistence error: {0}")]
    Persistence(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file does not exist
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// TOML could not be parsed
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// A value is out of range or inconsistent
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Component lifecycle and channel errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Channel send failed
    #[error("channel send failed: {0}")]
    ChannelSend(String),

    /// Channel receive failed
    #[error("channel receive failed: {0}")]
    ChannelRecv(String),

    /// Component could not be initialized
    #[error("pipeline init failed: {0}")]
    InitFailed(String),

    /// `start` called twice
    #[error("pipeline is already running")]
    AlreadyRunning,

    /// `stop` called on a component that never started
    #[error("pipeline is not running")]
    NotRunning,
}

/// Address prefix parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrefixError {
    /// Empty input
    #[error("empty prefix")]
    Empty,

    /// Address part is not an IPv4 or IPv6 address
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Mask length is not a number or is too long for the family
    #[error("invalid prefix length {len} (max {max})")]
    InvalidLength { len: String, max: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_into_top_level() {
        let err: ScipassError = ConfigError::FileNotFound {
            path: "/etc/scipass/scipass.toml".to_owned(),
        }
        .into();
        assert!(matches!(err, ScipassError::Config(_)));
        assert!(err.to_string().contains("/etc/scipass/scipass.toml"));
    }

    #[test]
    fn prefix_error_display() {
        let err = PrefixError::InvalidLength {
            len: "33".to_owned(),
            max: 32,
        };
        assert_eq!(err.to_string(), "invalid prefix length 33 (max 32)");
        let top: ScipassError = err.into();
        assert!(top.to_string().starts_with("prefix error"));
    }

    #[test]
    fn pipeline_already_running_display() {
        let err: ScipassError = PipelineError::AlreadyRunning.into();
        assert_eq!(err.to_string(), "pipeline error: pipeline is already running");
    }
}
