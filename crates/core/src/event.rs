//! Events crossing the boundary between the control core and the transport.
//!
//! [`ControlEvent`] flows in (switch lifecycle, counters, removals) and
//! [`CommandEvent`] flows out (rule installs and deletes). Both carry an
//! [`EventMetadata`] so a rule command can be traced back to the event
//! that caused it.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::prefix::Prefix;
use crate::types::{FlowMatch, FlowStatEntry, PortId, SwitchCommand, SwitchId};

// --- module names ---

/// Prefix balancer
pub const MODULE_BALANCER: &str = "balancer";
/// Forwarding-state coordinator
pub const MODULE_COORDINATOR: &str = "coordinator";
/// Flow-timeout engine
pub const MODULE_TIMEOUT: &str = "timeout";
/// Switch transport adapter
pub const MODULE_TRANSPORT: &str = "transport";

// --- event types ---

pub const EVENT_TYPE_CONTROL: &str = "control";
pub const EVENT_TYPE_COMMAND: &str = "command";

/// Tracing information common to every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub timestamp: SystemTime,
    /// Module that produced the event
    pub source_module: String,
    /// Links events of the same causal chain
    pub trace_id: String,
}

impl EventMetadata {
    /// Metadata continuing an existing trace.
    pub fn new(source_module: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source_module: source_module.into(),
            trace_id: trace_id.into(),
        }
    }

    /// Metadata starting a new trace with a UUID v4 id.
    pub fn with_new_trace(source_module: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source_module: source_module.into(),
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Display for EventMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] source={} trace={}",
            unix_timestamp_str(self.timestamp),
            self.source_module,
            self.trace_id,
        )
    }
}

/// Common interface of all events.
///
/// `Send + Sync + 'static` so events can travel over `tokio::mpsc`.
pub trait Event: Send + Sync + 'static {
    fn event_id(&self) -> &str;

    fn metadata(&self) -> &EventMetadata;

    fn event_type(&self) -> &str;
}

/// What happened on the switch side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlEventKind {
    /// The switch connected; (re)run domain initialization.
    Joined,
    /// The switch disconnected; its domains are discarded.
    Left,
    /// Link state of a port changed.
    PortStatus { port: PortId, up: bool },
    /// Decoded flow-table counters.
    FlowStats { entries: Vec<FlowStatEntry> },
    /// The switch removed a rule on its own (timeout or eviction).
    FlowRemoved { flow_match: FlowMatch, priority: u32 },
    /// Externally measured bandwidth of a prefix, bits per second.
    BandwidthSample {
        prefix: Prefix,
        tx_bps: f64,
        rx_bps: f64,
    },
}

impl fmt::Display for ControlEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joined => write!(f, "joined"),
            Self::Left => write!(f, "left"),
            Self::PortStatus { port, up } => {
                write!(f, "port {port} {}", if *up { "up" } else { "down" })
            }
            Self::FlowStats { entries } => write!(f, "flow stats ({} entries)", entries.len()),
            Self::FlowRemoved {
                flow_match,
                priority,
            } => write!(f, "flow removed [{flow_match}] prio={priority}"),
            Self::BandwidthSample {
                prefix,
                tx_bps,
                rx_bps,
            } => write!(f, "bandwidth {prefix} tx={tx_bps} rx={rx_bps}"),
        }
    }
}

/// Inbound event from the transport.
#[derive(Debug, Clone)]
pub struct ControlEvent {
    pub id: String,
    pub metadata: EventMetadata,
    pub switch: SwitchId,
    pub kind: ControlEventKind,
}

impl ControlEvent {
    pub fn new(switch: SwitchId, kind: ControlEventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metadata: EventMetadata::with_new_trace(MODULE_TRANSPORT),
            switch,
            kind,
        }
    }
}

impl Event for ControlEvent {
    fn event_id(&self) -> &str {
        &self.id
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    fn event_type(&self) -> &str {
        EVENT_TYPE_CONTROL
    }
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "switch {}: {}", self.switch, self.kind)
    }
}

/// Outbound command for the transport.
#[derive(Debug, Clone)]
pub struct CommandEvent {
    pub id: String,
    pub metadata: EventMetadata,
    pub switch: SwitchId,
    /// Domain that issued the command, if any
    pub domain: Option<String>,
    pub command: SwitchCommand,
}

impl CommandEvent {
    /// Command starting a new trace.
    pub fn new(
        source_module: &str,
        switch: SwitchId,
        domain: Option<String>,
        command: SwitchCommand,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metadata: EventMetadata::with_new_trace(source_module),
            switch,
            domain,
            command,
        }
    }

    /// Command continuing the trace of the event that caused it.
    pub fn with_trace(
        source_module: &str,
        switch: SwitchId,
        domain: Option<String>,
        command: SwitchCommand,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metadata: EventMetadata::new(source_module, trace_id),
            switch,
            domain,
            command,
        }
    }
}

impl Event for CommandEvent {
    fn event_id(&self) -> &str {
        &self.id
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    fn event_type(&self) -> &str {
        EVENT_TYPE_COMMAND
    }
}

impl fmt::Display for CommandEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.domain {
            Some(domain) => write!(f, "switch {} domain {}: {}", self.switch, domain, self.command),
            None => write!(f, "switch {}: {}", self.switch, self.command),
        }
    }
}

fn unix_timestamp_str(time: SystemTime) -> String {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => format!("{}", duration.as_secs()),
        Err(_) => "unknown".to_owned(),
    }
}
