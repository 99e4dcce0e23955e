//! Protocol-neutral forwarding types.
//!
//! These are the values exchanged between the control core and the
//! transport that speaks to the switch: switch identifiers, flow matches,
//! forwarding rule descriptors and the commands wrapping them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;
use crate::prefix::Prefix;

/// Ethertype for IPv4.
pub const ETH_TYPE_IPV4: u16 = 0x0800;
/// Ethertype for IPv6.
pub const ETH_TYPE_IPV6: u16 = 0x86dd;

/// Switch port number.
pub type PortId = u32;

/// Datapath id of a switch, displayed as 16 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwitchId(pub u64);

impl fmt::Display for SwitchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for SwitchId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches("0x");
        u64::from_str_radix(digits, 16)
            .map(SwitchId)
            .map_err(|e| ConfigError::InvalidValue {
                field: "dpid".to_owned(),
                reason: format!("'{s}' is not a hex datapath id: {e}"),
            })
    }
}

impl Serialize for SwitchId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SwitchId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Topology policy of a domain.
///
/// Serialized with the names used in deployed configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopologyMode {
    /// Traffic goes LAN -> firewall -> WAN, mirrored to sensors.
    #[serde(rename = "SciDMZ", alias = "bypass_firewall")]
    BypassFirewall,
    /// LAN <-> WAN forwarding with sensor outputs layered on top.
    #[default]
    #[serde(rename = "InlineIDS", alias = "inline_sensor")]
    InlineSensor,
    /// Only sensor-output rules, no forwarding path.
    #[serde(rename = "Balancer", alias = "pure_balance", alias = "SimpleBalancer")]
    PureBalance,
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BypassFirewall => write!(f, "SciDMZ"),
            Self::InlineSensor => write!(f, "InlineIDS"),
            Self::PureBalance => write!(f, "Balancer"),
        }
    }
}

/// Match part of a forwarding rule. `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowMatch {
    pub in_port: Option<PortId>,
    pub l3_type: Option<u16>,
    pub src: Option<Prefix>,
    pub dst: Option<Prefix>,
    pub tp_src: Option<u16>,
    pub tp_dst: Option<u16>,
}

impl FlowMatch {
    /// Everything arriving on `port`.
    pub fn on_port(port: PortId) -> Self {
        Self {
            in_port: Some(port),
            ..Self::default()
        }
    }

    pub fn with_src(mut self, prefix: Prefix) -> Self {
        self.l3_type = Some(prefix.family().ether_type());
        self.src = Some(prefix);
        self
    }

    pub fn with_dst(mut self, prefix: Prefix) -> Self {
        self.l3_type = Some(prefix.family().ether_type());
        self.dst = Some(prefix);
        self
    }

    pub fn with_transport(mut self, tp_src: Option<u16>, tp_dst: Option<u16>) -> Self {
        self.tp_src = tp_src;
        self.tp_dst = tp_dst;
        self
    }

    /// The return direction of this match, arriving on `in_port`.
    pub fn reversed(&self, in_port: PortId) -> Self {
        Self {
            in_port: Some(in_port),
            l3_type: self.l3_type,
            src: self.dst,
            dst: self.src,
            tp_src: self.tp_dst,
            tp_dst: self.tp_src,
        }
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(port) = self.in_port {
            parts.push(format!("in_port={port}"));
        }
        if let Some(t) = self.l3_type {
            parts.push(format!("dl_type=0x{t:04x}"));
        }
        if let Some(src) = &self.src {
            parts.push(format!("src={src}"));
        }
        if let Some(dst) = &self.dst {
            parts.push(format!("dst={dst}"));
        }
        if let Some(tp) = self.tp_src {
            parts.push(format!("tp_src={tp}"));
        }
        if let Some(tp) = self.tp_dst {
            parts.push(format!("tp_dst={tp}"));
        }
        if parts.is_empty() {
            write!(f, "*")
        } else {
            write!(f, "{}", parts.join(","))
        }
    }
}

/// Rule action. An empty action list drops the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Output(PortId),
}

/// Flow-table operation carried by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleCommand {
    /// Install or overwrite the entry with this match and priority.
    Add,
    /// Remove only the entry with exactly this match and priority.
    DeleteStrict,
}

impl fmt::Display for RuleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "ADD"),
            Self::DeleteStrict => write!(f, "DELETE_STRICT"),
        }
    }
}

/// Protocol-neutral forwarding rule descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub flow_match: FlowMatch,
    pub actions: Vec<Action>,
    pub priority: u32,
    /// Seconds of inactivity before expiry, 0 = never.
    pub idle_timeout: u16,
    /// Seconds after install before expiry, 0 = never.
    pub hard_timeout: u16,
    pub command: RuleCommand,
}

impl ForwardingRule {
    /// An install rule with no timeouts.
    pub fn install(flow_match: FlowMatch, actions: Vec<Action>, priority: u32) -> Self {
        Self {
            flow_match,
            actions,
            priority,
            idle_timeout: 0,
            hard_timeout: 0,
            command: RuleCommand::Add,
        }
    }

    pub fn with_timeouts(mut self, idle_timeout: u16, hard_timeout: u16) -> Self {
        self.idle_timeout = idle_timeout;
        self.hard_timeout = hard_timeout;
        self
    }

    /// Exact-match delete for this rule: same match and priority, no actions.
    pub fn to_delete(&self) -> Self {
        Self {
            flow_match: self.flow_match.clone(),
            actions: Vec::new(),
            priority: self.priority,
            idle_timeout: self.idle_timeout,
            hard_timeout: self.hard_timeout,
            command: RuleCommand::DeleteStrict,
        }
    }

    /// `true` if both rules address the same flow-table entry.
    pub fn same_entry(&self, flow_match: &FlowMatch, priority: u32) -> bool {
        self.priority == priority && self.flow_match == *flow_match
    }

    /// Output ports in action order.
    pub fn output_ports(&self) -> Vec<PortId> {
        self.actions
            .iter()
            .map(|Action::Output(port)| *port)
            .collect()
    }
}

impl fmt::Display for ForwardingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] prio={} -> {:?} idle={} hard={}",
            self.command,
            self.flow_match,
            self.priority,
            self.output_ports(),
            self.idle_timeout,
            self.hard_timeout,
        )
    }
}

/// Command sent to the switch transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchCommand {
    /// Install or exact-delete one rule, per `rule.command`.
    Apply(ForwardingRule),
    /// Non-strict delete with an empty match: clears the flow table.
    FlushAll,
    /// Ask the switch for flow counters.
    RequestFlowStats,
}

impl fmt::Display for SwitchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply(rule) => write!(f, "{rule}"),
            Self::FlushAll => write!(f, "FLUSH_ALL"),
            Self::RequestFlowStats => write!(f, "REQUEST_FLOW_STATS"),
        }
    }
}

/// One decoded flow-table statistics entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStatEntry {
    pub flow_match: FlowMatch,
    pub priority: u32,
    pub packet_count: u64,
    pub byte_count: u64,
}
