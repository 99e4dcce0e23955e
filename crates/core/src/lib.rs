#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pipeline;
pub mod prefix;
pub mod types;

// --- re-exports ---

pub use error::{ConfigError, PipelineError, PrefixError, ScipassError};

pub use config::{DomainConfig, PortRole, ScipassConfig};

pub use event::{CommandEvent, ControlEvent, ControlEventKind, Event, EventMetadata};

pub use pipeline::{HealthStatus, Pipeline};

pub use prefix::{AddressFamily, Prefix};

pub use types::{
    Action, FlowMatch, FlowStatEntry, ForwardingRule, PortId, RuleCommand, SwitchCommand,
    SwitchId, TopologyMode,
};
