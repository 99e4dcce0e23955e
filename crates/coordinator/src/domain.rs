//! Domain aggregate: one balancer plus the forwarding state it drives.
//!
//! [`DomainRules`] is the balancer's event handler. It turns prefix
//! assignments into switch rules through the domain's [`TopologyPolicy`],
//! keeps the flow registry and timeout table in step with what was emitted,
//! and persists each committed snapshot.
//!
//! [`Domain`] owns a `Balancer<DomainRules>` and exposes everything the
//! controller does to one domain: join-time initialization, signals, stats,
//! removals, sensor port status and rebalancing.

use metrics::counter;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use scipass_balancer::{
    BalanceOutcome, Balancer, BalancerError, BalancerSnapshot, PrefixEventHandler, SensorGroup,
};
use scipass_core::config::DomainConfig;
use scipass_core::metrics as m;
use scipass_core::prefix::Prefix;
use scipass_core::types::{
    FlowMatch, FlowStatEntry, ForwardingRule, PortId, SwitchCommand, SwitchId, TopologyMode,
};

use crate::error::CoordinatorError;
use crate::flows::{FlowRegistry, RuleEmitter};
use crate::persistence::StateStore;
use crate::policy::TopologyPolicy;
use crate::ports::PortLayout;
use crate::signal::{FlowSignal, SignalRegistry, SignaledFlow, Verdict};
use crate::timeout::TimeoutTable;

/// Forwarding state of one domain; the balancer's event handler.
#[derive(Debug)]
pub struct DomainRules {
    switch: SwitchId,
    name: String,
    policy: TopologyPolicy,
    flows: FlowRegistry,
    timeouts: TimeoutTable,
    signals: SignalRegistry,
    emitter: RuleEmitter,
    store: Option<StateStore>,
}

impl DomainRules {
    pub fn new(
        switch: SwitchId,
        name: impl Into<String>,
        policy: TopologyPolicy,
        max_flows: usize,
        emitter: RuleEmitter,
        store: Option<StateStore>,
    ) -> Self {
        Self {
            switch,
            name: name.into(),
            policy,
            flows: FlowRegistry::new(max_flows),
            timeouts: TimeoutTable::new(),
            signals: SignalRegistry::default(),
            emitter,
            store,
        }
    }

    pub fn policy(&self) -> &TopologyPolicy {
        &self.policy
    }

    pub fn flows(&self) -> &FlowRegistry {
        &self.flows
    }

    pub fn timeouts(&self) -> &TimeoutTable {
        &self.timeouts
    }

    pub fn signals(&self) -> &SignalRegistry {
        &self.signals
    }

    /// Installs `rules` in order, all or nothing.
    ///
    /// A rule past the flow budget undoes the ones already installed by
    /// this call and fails with `MaxFlowCount`.
    pub fn install_all(&mut self, rules: Vec<ForwardingRule>, now: Instant) -> Result<(), CoordinatorError> {
        let mut done: Vec<(ForwardingRule, Option<ForwardingRule>)> = Vec::with_capacity(rules.len());
        for rule in rules {
            if !self.flows.admits(&rule) {
                let max = self.flows.max_flows();
                warn!(
                    switch = %self.switch,
                    domain = %self.name,
                    rule = %rule,
                    max,
                    "flow limit reached, undoing partial install"
                );
                self.undo(done, now);
                return Err(CoordinatorError::MaxFlowCount { max });
            }
            let replaced = self.flows.record(rule.clone());
            self.timeouts.track(&rule, now);
            self.send(rule.clone());
            counter!(m::RULES_INSTALLED_TOTAL).increment(1);
            done.push((rule, replaced));
        }
        Ok(())
    }

    /// Reverts `done` newest first. A replaced entry gets its previous
    /// rule back, timeouts included; a fresh one is deleted.
    fn undo(&mut self, done: Vec<(ForwardingRule, Option<ForwardingRule>)>, now: Instant) {
        for (rule, replaced) in done.into_iter().rev() {
            match replaced {
                Some(previous) => {
                    self.flows.record(previous.clone());
                    self.timeouts.track(&previous, now);
                    self.send(previous);
                }
                None => self.remove_all(std::slice::from_ref(&rule)),
            }
        }
    }

    /// Exact-deletes `rules` and forgets everything tracked for them.
    pub fn remove_all(&mut self, rules: &[ForwardingRule]) {
        for rule in rules {
            self.flows.remove(&rule.flow_match, rule.priority);
            self.timeouts.forget(&rule.flow_match, rule.priority);
            self.signals.remove(&rule.flow_match, rule.priority);
            self.send(rule.to_delete());
            counter!(m::RULES_REMOVED_TOTAL).increment(1);
        }
    }

    /// Forgets a rule the switch already removed. No command is sent.
    pub fn forget(&mut self, flow_match: &FlowMatch, priority: u32) -> bool {
        let known = self.flows.remove(flow_match, priority).is_some();
        self.timeouts.forget(flow_match, priority);
        self.signals.remove(flow_match, priority);
        known
    }

    fn send(&self, rule: ForwardingRule) {
        debug!(switch = %self.switch, domain = %self.name, %rule, "emit rule");
        self.emitter
            .emit(Some(&self.name), SwitchCommand::Apply(rule));
    }

    fn clear(&mut self) {
        self.flows.clear();
        self.timeouts.clear();
        self.signals.clear();
    }

    fn prefix_rules(&self, group: &SensorGroup, prefix: &Prefix, priority: u32) -> Result<Vec<ForwardingRule>, CoordinatorError> {
        self.policy
            .wrap_prefix_rule(prefix, &group.output_ports(), priority)
    }
}

impl PrefixEventHandler for DomainRules {
    fn on_prefix_added(&mut self, group: &SensorGroup, prefix: &Prefix, priority: u32) -> Result<(), BalancerError> {
        let rules = self.prefix_rules(group, prefix, priority)?;
        self.install_all(rules, Instant::now())?;
        debug!(domain = %self.name, group = group.id(), %prefix, priority, "prefix rules installed");
        Ok(())
    }

    fn on_prefix_deleted(&mut self, group: &SensorGroup, prefix: &Prefix, priority: u32) -> Result<(), BalancerError> {
        let rules = self.prefix_rules(group, prefix, priority)?;
        self.remove_all(&rules);
        debug!(domain = %self.name, group = group.id(), %prefix, priority, "prefix rules removed");
        Ok(())
    }

    fn on_prefix_moved(
        &mut self,
        old: &SensorGroup,
        new: &SensorGroup,
        prefix: &Prefix,
        priority: u32,
    ) -> Result<(), BalancerError> {
        let old_rules = self.prefix_rules(old, prefix, priority)?;
        let new_rules = self.prefix_rules(new, prefix, priority)?;
        self.remove_all(&old_rules);
        if let Err(e) = self.install_all(new_rules, Instant::now()) {
            if let Err(restore) = self.install_all(old_rules, Instant::now()) {
                warn!(domain = %self.name, %prefix, error = %restore, "could not restore rules after failed move");
            }
            return Err(e.into());
        }
        debug!(domain = %self.name, from = old.id(), to = new.id(), %prefix, "prefix rules moved");
        Ok(())
    }

    fn on_committed(&mut self, snapshot: &BalancerSnapshot) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(self.switch, &self.name, self.policy.mode(), snapshot) {
            warn!(switch = %self.switch, domain = %self.name, error = %e, "failed to persist balancer state");
        }
    }
}

/// Where a prefix currently sits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrefixInfo {
    pub prefix: Prefix,
    pub group: String,
    pub bandwidth_bps: f64,
    pub priority: Option<u32>,
}

/// A configured domain of a connected switch.
pub struct Domain {
    config: DomainConfig,
    balancer: Balancer<DomainRules>,
}

impl Domain {
    pub fn new(
        switch: SwitchId,
        config: &DomainConfig,
        emitter: RuleEmitter,
        store: Option<StateStore>,
    ) -> Result<Self, CoordinatorError> {
        let layout = PortLayout::from_domain(config)?;
        let policy = TopologyPolicy::new(config.mode, layout)?;
        let rules = DomainRules::new(switch, &config.name, policy, config.max_flows, emitter, store);
        let balancer = Balancer::from_domain(config, rules)?;
        Ok(Self {
            config: config.clone(),
            balancer,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn mode(&self) -> TopologyMode {
        self.config.mode
    }

    pub fn switch(&self) -> SwitchId {
        self.rules().switch
    }

    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    pub fn balancer(&self) -> &Balancer<DomainRules> {
        &self.balancer
    }

    pub fn balancer_mut(&mut self) -> &mut Balancer<DomainRules> {
        &mut self.balancer
    }

    fn rules(&self) -> &DomainRules {
        self.balancer.handler()
    }

    fn rules_mut(&mut self) -> &mut DomainRules {
        self.balancer.handler_mut()
    }

    /// Installs the baseline rules, then places the configured prefixes:
    /// from the saved snapshot when one exists, fresh otherwise.
    pub fn initialize(&mut self, now: Instant) -> Result<(), CoordinatorError> {
        let baseline = self.rules().policy.baseline_rules();
        let baseline_len = baseline.len();
        self.rules_mut().install_all(baseline, now)?;

        let configured = self.config.lan_prefixes();
        match self.saved_snapshot() {
            Some(snapshot) => {
                let summary = self.balancer.restore(&snapshot, &configured)?;
                for prefix in &summary.dropped {
                    info!(domain = %self.name(), %prefix, "saved prefix no longer configured, dropped");
                }
            }
            None => {
                self.balancer.distribute(&configured)?;
            }
        }
        self.balancer.mark_initialized();
        let snapshot = self.balancer.snapshot();
        self.rules_mut().on_committed(&snapshot);

        info!(
            switch = %self.switch(),
            domain = %self.name(),
            mode = %self.mode(),
            baseline = baseline_len,
            prefixes = self.balancer.prefix_count(),
            rules = self.rules().flows.len(),
            "domain initialized"
        );
        Ok(())
    }

    fn saved_snapshot(&self) -> Option<BalancerSnapshot> {
        let store = self.rules().store.as_ref()?;
        match store.load(self.switch(), self.name(), self.mode()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(domain = %self.name(), error = %e, "saved state unreadable, distributing fresh");
                None
            }
        }
    }

    /// `true` if the address falls in this domain's LAN space.
    pub fn owns(&self, prefix: &Prefix) -> bool {
        self.rules().policy.layout().lan_for(prefix).is_some()
    }

    /// Rules a signal maps to in this domain.
    fn signal_rules(&self, signal: &FlowSignal, verdict: Verdict) -> Result<Vec<ForwardingRule>, CoordinatorError> {
        let header = signal.header()?;
        let layout = self.rules().policy.layout();
        let (lan, outbound) = match (header.src.as_ref(), header.dst.as_ref()) {
            (Some(src), _) if layout.lan_for(src).is_some() => {
                (layout.lan_for(src), header.clone())
            }
            (_, Some(dst)) if layout.lan_for(dst).is_some() => {
                (layout.lan_for(dst), header.reversed(0))
            }
            _ => (None, header.clone()),
        };
        let lan: PortId = lan.ok_or_else(|| CoordinatorError::NoOwningDomain(signal.to_string()))?;

        let default_priority = match verdict {
            Verdict::Good => self.config.whitelist_priority,
            Verdict::Bad => self.config.blacklist_priority,
        };
        let priority = signal.priority.unwrap_or(default_priority);
        let idle = signal.idle_timeout.unwrap_or(self.config.idle_timeout);
        let hard = signal.hard_timeout.unwrap_or(self.config.hard_timeout);
        Ok(self
            .rules()
            .policy
            .signal_rules(lan, &outbound, verdict == Verdict::Good, priority)
            .into_iter()
            .map(|r| r.with_timeouts(idle, hard))
            .collect())
    }

    /// Installs the bypass or drop pair for a signaled flow.
    pub fn apply_signal(&mut self, signal: &FlowSignal, verdict: Verdict, now: Instant) -> Result<(), CoordinatorError> {
        let rules = self.signal_rules(signal, verdict)?;
        self.rules_mut().install_all(rules.clone(), now)?;
        let name = self.name().to_owned();
        for rule in rules {
            self.rules_mut().signals.record(verdict, SignaledFlow {
                domain: name.clone(),
                rule,
            });
        }
        info!(domain = %name, %signal, %verdict, "flow signal applied");
        Ok(())
    }

    /// Removes a previously signaled pair. Returns `false` if none was
    /// installed.
    pub fn remove_signal(&mut self, signal: &FlowSignal, verdict: Verdict) -> Result<bool, CoordinatorError> {
        let installed: Vec<ForwardingRule> = self
            .signal_rules(signal, verdict)?
            .into_iter()
            .filter(|r| {
                self.rules()
                    .signals
                    .list(verdict)
                    .iter()
                    .any(|f| f.rule.same_entry(&r.flow_match, r.priority))
            })
            .collect();
        if installed.is_empty() {
            return Ok(false);
        }
        self.rules_mut().remove_all(&installed);
        info!(domain = %self.name(), %signal, %verdict, "flow signal removed");
        Ok(true)
    }

    /// Refreshes idle deadlines from a stats batch and deletes expired
    /// rules. Returns how many rules expired.
    pub fn flow_stats(&mut self, entries: &[FlowStatEntry], now: Instant) -> usize {
        let rules = self.rules_mut();
        rules.timeouts.refresh(entries, now);
        let expired = rules.timeouts.take_expired(now);
        for (rule, kind) in &expired {
            debug!(domain = %rules.name, %rule, kind = kind.label(), "rule expired");
            counter!(m::FLOW_TIMEOUTS_TOTAL, m::LABEL_KIND => kind.label()).increment(1);
            rules.remove_all(std::slice::from_ref(rule));
        }
        expired.len()
    }

    /// The switch removed a rule on its own.
    pub fn flow_removed(&mut self, flow_match: &FlowMatch, priority: u32) -> bool {
        self.rules_mut().forget(flow_match, priority)
    }

    /// Link change on a port. Only sensor ports matter; returns `true` if
    /// a sensor group changed status.
    pub fn port_status(&mut self, port: PortId, up: bool) -> Result<bool, CoordinatorError> {
        let Some(sensor) = self.balancer.sensor_by_port(port).map(|s| s.id.clone()) else {
            return Ok(false);
        };
        Ok(self.balancer.set_sensor_status(&sensor, up)?)
    }

    pub fn set_bandwidth(&mut self, prefix: &Prefix, tx_bps: f64, rx_bps: f64) -> Result<(), CoordinatorError> {
        Ok(self.balancer.set_prefix_bw(prefix, tx_bps, rx_bps)?)
    }

    pub fn rebalance(&mut self) -> Result<BalanceOutcome, CoordinatorError> {
        Ok(self.balancer.balance()?)
    }

    /// Drops all forwarding bookkeeping. The switch is gone, so nothing is
    /// sent.
    pub fn teardown(&mut self) {
        self.rules_mut().clear();
    }

    // ─── queries ────────────────────────────────────────────────────

    pub fn flows(&self) -> &[ForwardingRule] {
        self.rules().flows.rules()
    }

    pub fn groups(&self) -> &[SensorGroup] {
        self.balancer.groups()
    }

    pub fn prefixes(&self) -> Vec<Prefix> {
        self.balancer.prefixes()
    }

    pub fn prefix_info(&self, prefix: &Prefix) -> Option<PrefixInfo> {
        let group = self.balancer.prefix_group(prefix)?;
        Some(PrefixInfo {
            prefix: *prefix,
            group: group.id().to_owned(),
            bandwidth_bps: self.balancer.prefix_bw(prefix).unwrap_or(0.0),
            priority: self.balancer.priority_of(prefix).map(|a| a.priority),
        })
    }

    pub fn signaled(&self, verdict: Verdict) -> &[SignaledFlow] {
        self.rules().signals.list(verdict)
    }

    pub fn status_report(&self) -> String {
        self.balancer.status_report()
    }
}
