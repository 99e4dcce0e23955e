//! Installed-rule bookkeeping and rule emission.
//!
//! [`FlowRegistry`] mirrors what a domain believes is in the switch's flow
//! table and enforces the domain's rule budget. [`RuleEmitter`] hands
//! commands to the transport without waiting: a full or closed channel
//! drops the command with a warning.

use metrics::counter;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use scipass_core::event::{CommandEvent, MODULE_COORDINATOR};
use scipass_core::metrics as m;
use scipass_core::types::{FlowMatch, ForwardingRule, SwitchCommand, SwitchId};

#[derive(Debug, Clone)]
pub struct FlowRegistry {
    rules: Vec<ForwardingRule>,
    max_flows: usize,
}

impl FlowRegistry {
    pub fn new(max_flows: usize) -> Self {
        Self {
            rules: Vec::new(),
            max_flows,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn max_flows(&self) -> usize {
        self.max_flows
    }

    /// Installed rules in install order.
    pub fn rules(&self) -> &[ForwardingRule] {
        &self.rules
    }

    pub fn contains(&self, flow_match: &FlowMatch, priority: u32) -> bool {
        self.rules.iter().any(|r| r.same_entry(flow_match, priority))
    }

    /// `true` if `rule` fits the budget. Replacing an existing entry always
    /// fits.
    pub fn admits(&self, rule: &ForwardingRule) -> bool {
        self.contains(&rule.flow_match, rule.priority) || self.rules.len() < self.max_flows
    }

    /// Records an installed rule. Returns the entry it replaced, if any.
    pub fn record(&mut self, rule: ForwardingRule) -> Option<ForwardingRule> {
        match self
            .rules
            .iter_mut()
            .find(|r| r.same_entry(&rule.flow_match, rule.priority))
        {
            Some(existing) => Some(std::mem::replace(existing, rule)),
            None => {
                self.rules.push(rule);
                None
            }
        }
    }

    pub fn remove(&mut self, flow_match: &FlowMatch, priority: u32) -> Option<ForwardingRule> {
        let pos = self
            .rules
            .iter()
            .position(|r| r.same_entry(flow_match, priority))?;
        Some(self.rules.remove(pos))
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }
}

/// Sends switch commands for one switch.
#[derive(Debug, Clone)]
pub struct RuleEmitter {
    switch: SwitchId,
    tx: mpsc::Sender<CommandEvent>,
}

impl RuleEmitter {
    pub fn new(switch: SwitchId, tx: mpsc::Sender<CommandEvent>) -> Self {
        Self { switch, tx }
    }

    pub fn switch(&self) -> SwitchId {
        self.switch
    }

    /// Queues a command; returns `false` if it was dropped.
    pub fn emit(&self, domain: Option<&str>, command: SwitchCommand) -> bool {
        let event = CommandEvent::new(
            MODULE_COORDINATOR,
            self.switch,
            domain.map(str::to_owned),
            command,
        );
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                counter!(m::RULE_COMMANDS_DROPPED_TOTAL).increment(1);
                warn!(switch = %self.switch, command = %event.command, "command channel full, command dropped");
                false
            }
            Err(TrySendError::Closed(event)) => {
                counter!(m::RULE_COMMANDS_DROPPED_TOTAL).increment(1);
                debug!(switch = %self.switch, command = %event.command, "command channel closed, command dropped");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
