//! Switch registry and the control-plane operations.
//!
//! [`Controller`] maps each connected switch to its domains. Every domain
//! sits behind its own mutex so mutations of one domain are serialized
//! while other domains proceed. The registry lock is only held long enough
//! to clone the domain handles; no lock is held across a channel send that
//! could wait, since rule emission never waits.
//!
//! # Event flow
//! ```text
//! ControlEvent ──> Controller::handle_event
//!                      |
//!                  Domain (balancer + DomainRules)
//!                      |
//!                  CommandEvent ──mpsc──> transport
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use scipass_balancer::{BalanceOutcome, BalancerError};
use scipass_core::event::{CommandEvent, ControlEvent, ControlEventKind};
use scipass_core::metrics as m;
use scipass_core::prefix::Prefix;
use scipass_core::types::{FlowMatch, FlowStatEntry, ForwardingRule, PortId, SwitchCommand, SwitchId};

use crate::config::CoordinatorConfig;
use crate::domain::{Domain, PrefixInfo};
use crate::error::CoordinatorError;
use crate::flows::RuleEmitter;
use crate::persistence::StateStore;
use crate::signal::{FlowSignal, SignalOutcome, SignaledFlow, Verdict};
use crate::stats::BandwidthEstimator;

type DomainHandle = Arc<Mutex<Domain>>;

/// Composition and load of one sensor group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatus {
    pub id: String,
    pub description: String,
    pub up: bool,
    pub load: f64,
    pub bandwidth_bps: f64,
    pub prefixes: Vec<Prefix>,
}

pub struct Controller {
    config: CoordinatorConfig,
    switches: RwLock<HashMap<SwitchId, Vec<DomainHandle>>>,
    commands: mpsc::Sender<CommandEvent>,
    store: Option<StateStore>,
    bandwidth: Mutex<BandwidthEstimator>,
}

impl Controller {
    pub fn new(config: CoordinatorConfig, commands: mpsc::Sender<CommandEvent>) -> Self {
        let store = config
            .persistence_enabled
            .then(|| StateStore::new(config.state_dir.clone()));
        Self {
            config,
            switches: RwLock::new(HashMap::new()),
            commands,
            store,
            bandwidth: Mutex::new(BandwidthEstimator::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// `true` once the transport dropped the command receiver.
    pub fn commands_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn domains_of(&self, switch: SwitchId) -> Result<Vec<DomainHandle>, CoordinatorError> {
        self.switches
            .read()
            .await
            .get(&switch)
            .cloned()
            .ok_or(CoordinatorError::UnknownSwitch(switch))
    }

    async fn all_domains(&self) -> Vec<DomainHandle> {
        self.switches
            .read()
            .await
            .values()
            .flat_map(|d| d.iter().cloned())
            .collect()
    }

    async fn domain(&self, switch: SwitchId, name: &str) -> Result<DomainHandle, CoordinatorError> {
        for handle in self.domains_of(switch).await? {
            if handle.lock().await.name() == name {
                return Ok(handle);
            }
        }
        Err(CoordinatorError::UnknownDomain {
            switch,
            domain: name.to_owned(),
        })
    }

    // ─── switch lifecycle ───────────────────────────────────────────

    /// Builds and initializes the switch's domains. Returns how many are
    /// active.
    ///
    /// The flow table is flushed first. A domain that fails to build is
    /// skipped; one that fails part way through initialization is kept
    /// with what it managed to install.
    pub async fn switch_joined(&self, switch: SwitchId) -> Result<usize, CoordinatorError> {
        let Some(switch_config) = self.config.switch(switch).cloned() else {
            warn!(%switch, "switch joined but is not configured");
            return Err(CoordinatorError::UnknownSwitch(switch));
        };
        if self.switches.read().await.contains_key(&switch) {
            info!(%switch, "switch rejoined, rebuilding its domains");
            self.switch_left(switch).await;
        }

        let emitter = RuleEmitter::new(switch, self.commands.clone());
        emitter.emit(None, SwitchCommand::FlushAll);

        let now = Instant::now();
        let mut domains = Vec::new();
        for domain_config in &switch_config.domains {
            if !domain_config.admin_status {
                info!(%switch, domain = %domain_config.name, "domain administratively disabled, skipped");
                continue;
            }
            let mut domain = match Domain::new(switch, domain_config, emitter.clone(), self.store.clone()) {
                Ok(domain) => domain,
                Err(e) => {
                    warn!(%switch, domain = %domain_config.name, error = %e, "domain not built");
                    continue;
                }
            };
            if let Err(e) = domain.initialize(now) {
                warn!(%switch, domain = %domain_config.name, error = %e, "domain initialization incomplete");
            }
            domains.push(Arc::new(Mutex::new(domain)));
        }

        let active = domains.len();
        let connected = {
            let mut switches = self.switches.write().await;
            switches.insert(switch, domains);
            switches.len()
        };
        gauge!(m::CONNECTED_SWITCHES).set(connected as f64);
        info!(%switch, domains = active, "switch joined");
        Ok(active)
    }

    /// Drops the switch's domains. Returns `false` if it was not connected.
    pub async fn switch_left(&self, switch: SwitchId) -> bool {
        let (removed, connected) = {
            let mut switches = self.switches.write().await;
            let removed = switches.remove(&switch);
            (removed, switches.len())
        };
        let Some(domains) = removed else {
            return false;
        };
        for handle in domains {
            handle.lock().await.teardown();
        }
        self.bandwidth.lock().await.forget(switch);
        gauge!(m::CONNECTED_SWITCHES).set(connected as f64);
        info!(%switch, "switch left");
        true
    }

    // ─── inbound events ─────────────────────────────────────────────

    /// Returns `true` if any sensor group changed status.
    pub async fn port_status(&self, switch: SwitchId, port: PortId, up: bool) -> Result<bool, CoordinatorError> {
        let mut changed = false;
        for handle in self.domains_of(switch).await? {
            changed |= handle.lock().await.port_status(port, up)?;
        }
        Ok(changed)
    }

    pub async fn bandwidth_sample(
        &self,
        switch: SwitchId,
        prefix: &Prefix,
        tx_bps: f64,
        rx_bps: f64,
    ) -> Result<(), CoordinatorError> {
        for handle in self.domains_of(switch).await? {
            let mut domain = handle.lock().await;
            if domain.prefix_info(prefix).is_some() {
                return domain.set_bandwidth(prefix, tx_bps, rx_bps);
            }
        }
        Err(BalancerError::UnknownPrefix(*prefix).into())
    }

    /// Runs timeout reconciliation and bandwidth estimation over a stats
    /// batch. Returns how many rules expired.
    pub async fn flow_stats(
        &self,
        switch: SwitchId,
        entries: &[FlowStatEntry],
        now: Instant,
    ) -> Result<usize, CoordinatorError> {
        let domains = self.domains_of(switch).await?;

        let mut expired = 0;
        let mut prefixes = Vec::new();
        for handle in &domains {
            let mut domain = handle.lock().await;
            expired += domain.flow_stats(entries, now);
            prefixes.extend(domain.prefixes());
        }

        let samples = self
            .bandwidth
            .lock()
            .await
            .sample(switch, &prefixes, entries, now);
        for sample in samples {
            for handle in &domains {
                let mut domain = handle.lock().await;
                if domain.prefix_info(&sample.prefix).is_some() {
                    if let Err(e) = domain.set_bandwidth(&sample.prefix, sample.tx_bps, sample.rx_bps) {
                        debug!(%switch, prefix = %sample.prefix, error = %e, "bandwidth not recorded");
                    }
                    break;
                }
            }
        }
        Ok(expired)
    }

    /// Returns `true` if a domain knew the rule.
    pub async fn flow_removed(
        &self,
        switch: SwitchId,
        flow_match: &FlowMatch,
        priority: u32,
    ) -> Result<bool, CoordinatorError> {
        let mut known = false;
        for handle in self.domains_of(switch).await? {
            known |= handle.lock().await.flow_removed(flow_match, priority);
        }
        Ok(known)
    }

    // ─── signals ────────────────────────────────────────────────────

    pub async fn good_flow(&self, signal: &FlowSignal) -> SignalOutcome {
        self.signal(signal, Verdict::Good).await
    }

    pub async fn bad_flow(&self, signal: &FlowSignal) -> SignalOutcome {
        self.signal(signal, Verdict::Bad).await
    }

    async fn signal(&self, signal: &FlowSignal, verdict: Verdict) -> SignalOutcome {
        counter!(m::SIGNALS_TOTAL, m::LABEL_VERDICT => verdict.label()).increment(1);
        let result = self.apply_signal(signal, verdict).await;
        if let Err(e) = &result {
            warn!(%signal, %verdict, error = %e, "flow signal refused");
        }
        result.into()
    }

    async fn apply_signal(&self, signal: &FlowSignal, verdict: Verdict) -> Result<(), CoordinatorError> {
        let handle = self.owner_of(signal).await?;
        let mut domain = handle.lock().await;
        domain.apply_signal(signal, verdict, Instant::now())
    }

    /// Removes a signaled pair. Returns `false` if it was not installed.
    pub async fn remove_signal(&self, signal: &FlowSignal, verdict: Verdict) -> Result<bool, CoordinatorError> {
        let handle = self.owner_of(signal).await?;
        let mut domain = handle.lock().await;
        domain.remove_signal(signal, verdict)
    }

    /// First domain whose LAN space holds either end of the flow.
    async fn owner_of(&self, signal: &FlowSignal) -> Result<DomainHandle, CoordinatorError> {
        let (src, dst) = (signal.src()?, signal.dst()?);
        for handle in self.all_domains().await {
            let domain = handle.lock().await;
            if domain.owns(&src) || domain.owns(&dst) {
                drop(domain);
                return Ok(handle);
            }
        }
        Err(CoordinatorError::NoOwningDomain(signal.to_string()))
    }

    // ─── periodic work ──────────────────────────────────────────────

    /// One balancing pass over every domain. Errors are logged and the
    /// domain's tick abandoned.
    pub async fn rebalance_all(&self) -> Vec<(SwitchId, String, BalanceOutcome)> {
        let mut outcomes = Vec::new();
        for handle in self.all_domains().await {
            let mut domain = handle.lock().await;
            match domain.rebalance() {
                Ok(outcome) => {
                    if outcome.changed() {
                        info!(switch = %domain.switch(), domain = %domain.name(), %outcome, "rebalanced");
                    } else {
                        debug!(switch = %domain.switch(), domain = %domain.name(), %outcome, "balanced");
                    }
                    outcomes.push((domain.switch(), domain.name().to_owned(), outcome));
                }
                Err(e) => {
                    warn!(switch = %domain.switch(), domain = %domain.name(), error = %e, "rebalance tick abandoned");
                }
            }
        }
        outcomes
    }

    /// Asks every connected switch for flow counters. Returns how many
    /// requests were queued.
    pub async fn request_stats(&self) -> usize {
        let switches = self.switches().await;
        switches
            .into_iter()
            .filter(|&switch| {
                RuleEmitter::new(switch, self.commands.clone()).emit(None, SwitchCommand::RequestFlowStats)
            })
            .count()
    }

    /// Dispatches one transport event. Failures are logged, never returned.
    pub async fn handle_event(&self, event: ControlEvent) {
        let switch = event.switch;
        debug!(%event, trace_id = %event.metadata.trace_id, "control event");
        let result = match event.kind {
            ControlEventKind::Joined => self.switch_joined(switch).await.map(|_| ()),
            ControlEventKind::Left => {
                self.switch_left(switch).await;
                Ok(())
            }
            ControlEventKind::PortStatus { port, up } => {
                self.port_status(switch, port, up).await.map(|_| ())
            }
            ControlEventKind::FlowStats { entries } => self
                .flow_stats(switch, &entries, Instant::now())
                .await
                .map(|_| ()),
            ControlEventKind::FlowRemoved {
                flow_match,
                priority,
            } => self
                .flow_removed(switch, &flow_match, priority)
                .await
                .map(|_| ()),
            ControlEventKind::BandwidthSample {
                prefix,
                tx_bps,
                rx_bps,
            } => self.bandwidth_sample(switch, &prefix, tx_bps, rx_bps).await,
        };
        if let Err(e) = result {
            warn!(%switch, error = %e, "control event not applied");
        }
    }

    // ─── queries ────────────────────────────────────────────────────

    pub async fn switches(&self) -> Vec<SwitchId> {
        let mut ids: Vec<SwitchId> = self.switches.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn domains(&self, switch: SwitchId) -> Result<Vec<String>, CoordinatorError> {
        let mut names = Vec::new();
        for handle in self.domains_of(switch).await? {
            names.push(handle.lock().await.name().to_owned());
        }
        Ok(names)
    }

    pub async fn flows(&self, switch: SwitchId, domain: &str) -> Result<Vec<ForwardingRule>, CoordinatorError> {
        let handle = self.domain(switch, domain).await?;
        let domain = handle.lock().await;
        Ok(domain.flows().to_vec())
    }

    pub async fn groups(&self, switch: SwitchId, domain: &str) -> Result<Vec<GroupStatus>, CoordinatorError> {
        let handle = self.domain(switch, domain).await?;
        let domain = handle.lock().await;
        let balancer = domain.balancer();
        Ok(domain
            .groups()
            .iter()
            .map(|g| GroupStatus {
                id: g.id().to_owned(),
                description: g.description().to_owned(),
                up: g.is_up(),
                load: g.load(),
                bandwidth_bps: balancer.group_bandwidth(g.id()).unwrap_or(0.0),
                prefixes: g.prefixes().to_vec(),
            })
            .collect())
    }

    pub async fn prefix_info(&self, switch: SwitchId, prefix: &Prefix) -> Result<Option<PrefixInfo>, CoordinatorError> {
        for handle in self.domains_of(switch).await? {
            if let Some(info) = handle.lock().await.prefix_info(prefix) {
                return Ok(Some(info));
            }
        }
        Ok(None)
    }

    /// Whitelisted flows across all domains.
    pub async fn good_flows(&self) -> Vec<SignaledFlow> {
        self.signaled(Verdict::Good).await
    }

    /// Blacklisted flows across all domains.
    pub async fn bad_flows(&self) -> Vec<SignaledFlow> {
        self.signaled(Verdict::Bad).await
    }

    async fn signaled(&self, verdict: Verdict) -> Vec<SignaledFlow> {
        let mut out = Vec::new();
        for handle in self.all_domains().await {
            out.extend(handle.lock().await.signaled(verdict).iter().cloned());
        }
        out
    }

    pub async fn status_report(&self, switch: SwitchId, domain: &str) -> Result<String, CoordinatorError> {
        let handle = self.domain(switch, domain).await?;
        let domain = handle.lock().await;
        Ok(domain.status_report())
    }
}
