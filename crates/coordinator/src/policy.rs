//! Per-mode forwarding policy.
//!
//! [`TopologyPolicy`] turns a domain's port layout into the baseline rules
//! installed on join and into the rule pair carrying one balanced prefix
//! through its sensor group.
//!
//! | mode | baseline | prefix rule outputs |
//! |------|----------|---------------------|
//! | SciDMZ | LAN↔fw-LAN, fw-WAN↔WAN | sensors, then the firewall port |
//! | InlineIDS | LAN↔WAN | sensors, then the opposite traffic port |
//! | Balancer | none | sensors only |

use scipass_core::prefix::Prefix;
use scipass_core::types::{Action, FlowMatch, ForwardingRule, PortId, TopologyMode};

use crate::error::CoordinatorError;
use crate::ports::PortLayout;

/// LAN default path towards the firewall.
const LAN_DEFAULT_PRIORITY: u32 = 5;
/// Per-prefix LAN/firewall steering and the firewall WAN path.
const STEERING_PRIORITY: u32 = 10;
/// Firewall LAN side flooding back to every LAN port.
const RETURN_PRIORITY: u32 = 3;
/// Inline LAN↔WAN default forwarding.
const INLINE_DEFAULT_PRIORITY: u32 = 3;

#[derive(Debug, Clone)]
pub struct TopologyPolicy {
    mode: TopologyMode,
    layout: PortLayout,
}

impl TopologyPolicy {
    pub fn new(mode: TopologyMode, layout: PortLayout) -> Result<Self, CoordinatorError> {
        if mode == TopologyMode::BypassFirewall
            && (layout.fw_lan().is_none() || layout.fw_wan().is_none())
        {
            return Err(CoordinatorError::Layout(
                "SciDMZ mode needs both firewall ports".to_owned(),
            ));
        }
        Ok(Self { mode, layout })
    }

    pub fn mode(&self) -> TopologyMode {
        self.mode
    }

    pub fn layout(&self) -> &PortLayout {
        &self.layout
    }

    /// Rules installed when the switch joins, before any prefix rule.
    pub fn baseline_rules(&self) -> Vec<ForwardingRule> {
        match self.mode {
            TopologyMode::BypassFirewall => self.firewall_baseline(),
            TopologyMode::InlineSensor => self.inline_baseline(),
            TopologyMode::PureBalance => Vec::new(),
        }
    }

    fn firewall_baseline(&self) -> Vec<ForwardingRule> {
        let (Some(fw_lan), Some(fw_wan)) = (self.layout.fw_lan(), self.layout.fw_wan()) else {
            return Vec::new();
        };
        let mut rules = Vec::new();
        for lan in self.layout.lans() {
            rules.push(ForwardingRule::install(
                FlowMatch::on_port(lan.port),
                outputs(&[fw_lan]),
                LAN_DEFAULT_PRIORITY,
            ));
            for prefix in &lan.prefixes {
                rules.push(ForwardingRule::install(
                    FlowMatch::on_port(fw_lan).with_dst(*prefix),
                    outputs(&[lan.port]),
                    STEERING_PRIORITY,
                ));
                rules.push(ForwardingRule::install(
                    FlowMatch::on_port(lan.port).with_src(*prefix),
                    outputs(&[fw_lan]),
                    STEERING_PRIORITY,
                ));
            }
        }
        rules.push(ForwardingRule::install(
            FlowMatch::on_port(fw_lan),
            outputs(&self.layout.lan_ports()),
            RETURN_PRIORITY,
        ));
        rules.push(ForwardingRule::install(
            FlowMatch::on_port(fw_wan),
            outputs(&[self.layout.wan()]),
            STEERING_PRIORITY,
        ));
        rules.push(ForwardingRule::install(
            FlowMatch::on_port(self.layout.wan()),
            outputs(&[fw_wan]),
            STEERING_PRIORITY,
        ));
        rules
    }

    fn inline_baseline(&self) -> Vec<ForwardingRule> {
        let wan = self.layout.wan();
        let mut rules = Vec::new();
        for lan in self.layout.lans() {
            rules.push(ForwardingRule::install(
                FlowMatch::on_port(lan.port),
                outputs(&[wan]),
                INLINE_DEFAULT_PRIORITY,
            ));
            for prefix in &lan.prefixes {
                rules.push(ForwardingRule::install(
                    FlowMatch::on_port(wan).with_dst(*prefix),
                    outputs(&[lan.port]),
                    INLINE_DEFAULT_PRIORITY,
                ));
            }
        }
        rules
    }

    /// Rules steering `prefix` through `sensor_outputs` at `priority`.
    ///
    /// The LAN-side source-match rule comes first, the WAN-side
    /// destination-match rule second. Pure balancing also matches the
    /// reverse direction on each port.
    pub fn wrap_prefix_rule(
        &self,
        prefix: &Prefix,
        sensor_outputs: &[PortId],
        priority: u32,
    ) -> Result<Vec<ForwardingRule>, CoordinatorError> {
        let lan = self
            .layout
            .lan_for(prefix)
            .ok_or_else(|| CoordinatorError::Layout(format!("no lan port covers {prefix}")))?;
        let wan = self.layout.wan();
        let via = |hop: Option<PortId>| {
            let mut ports = sensor_outputs.to_vec();
            ports.extend(hop);
            outputs(&ports)
        };

        let rules = match self.mode {
            TopologyMode::BypassFirewall => vec![
                ForwardingRule::install(
                    FlowMatch::on_port(lan).with_src(*prefix),
                    via(self.layout.fw_lan()),
                    priority,
                ),
                ForwardingRule::install(
                    FlowMatch::on_port(wan).with_dst(*prefix),
                    via(self.layout.fw_wan()),
                    priority,
                ),
            ],
            TopologyMode::InlineSensor => vec![
                ForwardingRule::install(
                    FlowMatch::on_port(lan).with_src(*prefix),
                    via(Some(wan)),
                    priority,
                ),
                ForwardingRule::install(
                    FlowMatch::on_port(wan).with_dst(*prefix),
                    via(Some(lan)),
                    priority,
                ),
            ],
            TopologyMode::PureBalance => [lan, wan]
                .into_iter()
                .flat_map(|port| {
                    [
                        FlowMatch::on_port(port).with_src(*prefix),
                        FlowMatch::on_port(port).with_dst(*prefix),
                    ]
                })
                .map(|m| ForwardingRule::install(m, via(None), priority))
                .collect(),
        };
        Ok(rules)
    }

    /// LAN-side and WAN-side rules for one signaled flow.
    ///
    /// `outbound` is the header as seen leaving the LAN. Good flows bypass
    /// to the opposite port; bad flows get no actions and are dropped.
    pub fn signal_rules(&self, lan: PortId, outbound: &FlowMatch, bypass: bool, priority: u32) -> Vec<ForwardingRule> {
        let wan = self.layout.wan();
        let mut forward = outbound.clone();
        forward.in_port = Some(lan);
        let reverse = outbound.reversed(wan);
        let (to_wan, to_lan) = if bypass {
            (outputs(&[wan]), outputs(&[lan]))
        } else {
            (Vec::new(), Vec::new())
        };
        vec![
            ForwardingRule::install(forward, to_wan, priority),
            ForwardingRule::install(reverse, to_lan, priority),
        ]
    }
}

fn outputs(ports: &[PortId]) -> Vec<Action> {
    ports.iter().copied().map(Action::Output).collect()
}
