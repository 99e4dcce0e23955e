//! The prefix balancer.
//!
//! [`Balancer`] owns the prefix → sensor group assignment of one domain.
//! Every public mutation either fully succeeds (structure, priority bands and
//! handler side effects) or leaves the balancer unchanged.

use std::collections::HashMap;
use std::fmt::Write as _;

use metrics::counter;
use tracing::{debug, info, warn};

use scipass_core::config::DomainConfig;
use scipass_core::metrics as m;
use scipass_core::prefix::Prefix;
use scipass_core::types::PortId;

use crate::config::{BalanceMode, BalancerConfig};
use crate::error::BalancerError;
use crate::group::{Sensor, SensorGroup};
use crate::handler::PrefixEventHandler;
use crate::priority::{PriorityAllocation, PriorityTable};
use crate::snapshot::{BalancerSnapshot, GroupSnapshot, uncovered};

/// What a snapshot restore did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreSummary {
    /// Prefixes put back into their saved group
    pub kept: Vec<Prefix>,
    /// Saved prefixes no longer configured
    pub dropped: Vec<Prefix>,
    /// Configured space that had no saved assignment
    pub distributed: Vec<Prefix>,
}

pub struct Balancer<H: PrefixEventHandler> {
    config: BalancerConfig,
    pub(crate) groups: Vec<SensorGroup>,
    pub(crate) prefix_bw: HashMap<Prefix, f64>,
    pub(crate) priorities: PriorityTable,
    pub(crate) handler: H,
    initialized: bool,
}

impl<H: PrefixEventHandler> Balancer<H> {
    pub fn new(config: BalancerConfig, handler: H) -> Self {
        Self {
            config,
            groups: Vec::new(),
            prefix_bw: HashMap::new(),
            priorities: PriorityTable::default(),
            handler,
            initialized: false,
        }
    }

    /// Builds a balancer with the sensor groups declared in a domain.
    ///
    /// Groups with `admin_status = false` start with all sensors disabled.
    pub fn from_domain(domain: &DomainConfig, handler: H) -> Result<Self, BalancerError> {
        let mut balancer = Self::new(BalancerConfig::from_domain(domain), handler);
        for group in &domain.sensor_groups {
            balancer.add_sensor_group(&group.group_id, &group.description)?;
            for sensor in &group.sensors {
                balancer.add_sensor(&group.group_id, &sensor.sensor_id, sensor.of_port_id)?;
                if !group.admin_status {
                    balancer.set_sensor_status(&sensor.sensor_id, false)?;
                }
            }
        }
        Ok(balancer)
    }

    // ─── setup ──────────────────────────────────────────────────────

    pub fn add_sensor_group(&mut self, id: &str, description: &str) -> Result<(), BalancerError> {
        if self.groups.iter().any(|g| g.id() == id) {
            return Err(BalancerError::DuplicateGroup(id.to_owned()));
        }
        self.groups.push(SensorGroup::new(id, description));
        Ok(())
    }

    pub fn add_sensor(
        &mut self,
        group_id: &str,
        sensor_id: &str,
        port: PortId,
    ) -> Result<(), BalancerError> {
        if self.find_sensor(sensor_id).is_some() {
            return Err(BalancerError::DuplicateSensor(sensor_id.to_owned()));
        }
        let idx = self.group_index(group_id)?;
        self.groups[idx].push_sensor(Sensor {
            id: sensor_id.to_owned(),
            port,
            enabled: true,
            load: 0.0,
        });
        Ok(())
    }

    /// Ends initialization: from now on every committed mutation is
    /// reported through [`PrefixEventHandler::on_committed`].
    pub fn mark_initialized(&mut self) {
        self.initialized = true;
        self.commit();
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    // ─── queries ────────────────────────────────────────────────────

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn mode(&self) -> BalanceMode {
        self.config.mode()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn groups(&self) -> &[SensorGroup] {
        &self.groups
    }

    pub fn group(&self, id: &str) -> Option<&SensorGroup> {
        self.groups.iter().find(|g| g.id() == id)
    }

    pub fn prefix_count(&self) -> usize {
        self.groups.iter().map(|g| g.prefixes().len()).sum()
    }

    /// All held prefixes, group by group.
    pub fn prefixes(&self) -> Vec<Prefix> {
        self.groups
            .iter()
            .flat_map(|g| g.prefixes().iter().copied())
            .collect()
    }

    /// Group currently holding `prefix`.
    pub fn prefix_group(&self, prefix: &Prefix) -> Option<&SensorGroup> {
        self.groups.iter().find(|g| g.holds(prefix))
    }

    /// Held prefix containing `addr`-level prefix `inner`, if any.
    pub fn covering_prefix(&self, inner: &Prefix) -> Option<Prefix> {
        self.groups
            .iter()
            .flat_map(|g| g.prefixes().iter())
            .find(|p| p.contains(inner))
            .copied()
    }

    pub fn prefix_bw(&self, prefix: &Prefix) -> Option<f64> {
        self.prefix_bw.get(prefix).copied()
    }

    pub fn priority_of(&self, prefix: &Prefix) -> Option<PriorityAllocation> {
        self.priorities.get(prefix)
    }

    pub fn group_load(&self, id: &str) -> Result<f64, BalancerError> {
        Ok(self.groups[self.group_index(id)?].load())
    }

    pub fn group_status(&self, id: &str) -> Result<bool, BalancerError> {
        Ok(self.groups[self.group_index(id)?].is_up())
    }

    /// Sum of the measured rates of the group's prefixes.
    pub fn group_bandwidth(&self, id: &str) -> Result<f64, BalancerError> {
        let idx = self.group_index(id)?;
        Ok(self.bandwidth_of(idx))
    }

    /// Sensor attached to `port`.
    pub fn sensor_by_port(&self, port: PortId) -> Option<&Sensor> {
        self.groups
            .iter()
            .flat_map(|g| g.sensors().iter())
            .find(|s| s.port == port)
    }

    /// Least-specific prefix of a group; the first one wins ties.
    pub fn largest_prefix(&self, id: &str) -> Result<Option<Prefix>, BalancerError> {
        let idx = self.group_index(id)?;
        Ok(largest_in(&self.groups[idx]))
    }

    /// Expected load `prefix` would put on group `id`.
    ///
    /// The prefix's share of the group, by bandwidth or by address space
    /// when bandwidth is ignored, scaled by the group's sensor load unless
    /// sensor load is ignored. The prefix need not belong to the group, so
    /// the result can exceed 1.
    pub fn estimated_load(&self, id: &str, prefix: &Prefix) -> Result<f64, BalancerError> {
        let idx = self.group_index(id)?;
        Ok(self.estimated_load_at(idx, prefix))
    }

    pub(crate) fn estimated_load_at(&self, idx: usize, prefix: &Prefix) -> f64 {
        let group = &self.groups[idx];
        let share = if self.config.ignore_prefix_bw {
            ratio(prefix.host_units(), group.host_units())
        } else {
            ratio(
                self.prefix_bw(prefix).unwrap_or(0.0),
                self.bandwidth_of(idx),
            )
        };
        if self.config.ignore_sensor_load {
            share
        } else {
            share * group.load()
        }
    }

    // ─── sensor state ───────────────────────────────────────────────

    pub fn set_sensor_load(&mut self, sensor_id: &str, load: f64) -> Result<(), BalancerError> {
        if !(0.0..=1.0).contains(&load) {
            return Err(BalancerError::InvalidLoad(load));
        }
        let (gidx, _) = self
            .find_sensor(sensor_id)
            .ok_or_else(|| BalancerError::UnknownSensor(sensor_id.to_owned()))?;
        if let Some(sensor) = self.groups[gidx].sensor_mut(sensor_id) {
            sensor.load = load;
        }
        Ok(())
    }

    /// Enables or disables a sensor. Returns `true` if its group's up/down
    /// status changed.
    ///
    /// When the group goes down its prefixes are moved to the least-loaded
    /// active group.
    pub fn set_sensor_status(&mut self, sensor_id: &str, up: bool) -> Result<bool, BalancerError> {
        let (gidx, _) = self
            .find_sensor(sensor_id)
            .ok_or_else(|| BalancerError::UnknownSensor(sensor_id.to_owned()))?;
        let was_up = self.groups[gidx].is_up();
        if let Some(sensor) = self.groups[gidx].sensor_mut(sensor_id) {
            sensor.enabled = up;
        }
        let now_up = self.groups[gidx].is_up();
        if was_up == now_up {
            return Ok(false);
        }
        info!(
            group = self.groups[gidx].id(),
            sensor = sensor_id,
            up = now_up,
            "sensor group status changed"
        );
        if !now_up {
            self.unload_group(gidx);
            self.commit();
        }
        Ok(true)
    }

    fn unload_group(&mut self, gidx: usize) {
        let targets: Vec<usize> = self.active_groups().into_iter().filter(|&i| i != gidx).collect();
        let loads = self.loads_for(self.mode(), &targets);
        let Some((target, _)) = loads
            .iter()
            .copied()
            .min_by(|a, b| a.1.total_cmp(&b.1))
        else {
            warn!(
                group = self.groups[gidx].id(),
                "no active sensor group left, prefixes stay on disabled group"
            );
            return;
        };
        let prefixes: Vec<Prefix> = self.groups[gidx].prefixes().to_vec();
        for prefix in prefixes {
            match self.move_inner(gidx, target, prefix) {
                Ok(()) => {}
                Err(e @ BalancerError::MaxFlowCount { .. }) => {
                    warn!(%prefix, error = %e, "unload stopped");
                    return;
                }
                Err(e) => warn!(%prefix, error = %e, "failed to unload prefix"),
            }
        }
    }

    // ─── bandwidth ──────────────────────────────────────────────────

    /// Records the measured rate of a held prefix as `tx + rx`.
    pub fn set_prefix_bw(&mut self, prefix: &Prefix, tx_bps: f64, rx_bps: f64) -> Result<(), BalancerError> {
        match self.prefix_bw.get_mut(prefix) {
            Some(bw) => {
                *bw = (tx_bps + rx_bps).max(0.0);
                Ok(())
            }
            None => Err(BalancerError::UnknownPrefix(*prefix)),
        }
    }

    // ─── structural operations ──────────────────────────────────────

    pub fn add_group_prefix(&mut self, group_id: &str, prefix: Prefix) -> Result<(), BalancerError> {
        let gidx = self.group_index(group_id)?;
        let result = self.add_inner(gidx, prefix, None, 0.0, &[]);
        self.finish(result)
    }

    pub fn del_group_prefix(&mut self, group_id: &str, prefix: &Prefix) -> Result<(), BalancerError> {
        let gidx = self.group_index(group_id)?;
        let result = self.del_inner(gidx, *prefix).map(|_| ());
        self.finish(result)
    }

    pub fn move_group_prefix(
        &mut self,
        from: &str,
        to: &str,
        prefix: &Prefix,
    ) -> Result<(), BalancerError> {
        let from = self.group_index(from)?;
        let to = self.group_index(to)?;
        let result = self.move_inner(from, to, *prefix);
        self.finish(result)
    }

    /// Checks that `prefix` may be split and returns its halves.
    pub fn split_prefix(&self, prefix: &Prefix) -> Result<(Prefix, Prefix), BalancerError> {
        let (most, _) = self.config.bounds(prefix.family());
        if prefix.prefix_len() >= most {
            return Err(BalancerError::MaxPrefixLength {
                prefix: *prefix,
                bound: most,
            });
        }
        prefix.split().ok_or(BalancerError::MaxPrefixLength {
            prefix: *prefix,
            bound: most,
        })
    }

    /// Replaces a held prefix by its two halves in the same group.
    pub fn split_group_prefix(&mut self, prefix: &Prefix) -> Result<(Prefix, Prefix), BalancerError> {
        let gidx = self.holder_of(prefix)?;
        let result = self.split_inner(gidx, *prefix);
        self.finish(result)
    }

    /// Replaces two sibling prefixes of one group by their parent.
    pub fn merge_group_prefixes(&mut self, left: &Prefix, right: &Prefix) -> Result<Prefix, BalancerError> {
        let gidx = self.holder_of(left)?;
        let result = self.merge_inner(gidx, *left, *right);
        self.finish(result)
    }

    /// Merges the cheapest eligible sibling pair, if any.
    pub fn merge(&mut self) -> Result<Option<Prefix>, BalancerError> {
        let result = self.merge_best(None);
        self.finish(result)
    }

    /// Subnets of `prefix` for `sensors` sensors: the fewest extra bits
    /// giving at least that many pieces.
    pub fn split_prefix_for_sensors(
        &self,
        prefix: &Prefix,
        sensors: usize,
    ) -> Result<Vec<Prefix>, BalancerError> {
        let mut bits = 0u8;
        while (1usize << bits) < sensors.max(1) {
            bits += 1;
        }
        let (most, _) = self.config.bounds(prefix.family());
        let new_len = prefix.prefix_len().saturating_add(bits);
        if new_len > most {
            return Err(BalancerError::MaxPrefixLength {
                prefix: *prefix,
                bound: most,
            });
        }
        prefix
            .subnets(new_len)
            .map_err(|_| BalancerError::MaxPrefixLength {
                prefix: *prefix,
                bound: most,
            })
    }

    /// Places prefixes on the groups.
    ///
    /// Prefixes wider than the least-specific bound are split until they
    /// fit. Each piece goes to the active group holding the least address
    /// space, first group on ties. Nothing is placed if the pieces would
    /// pass the prefix ceiling. Returns the number placed.
    pub fn distribute(&mut self, prefixes: &[Prefix]) -> Result<usize, BalancerError> {
        let mut pieces = Vec::new();
        for prefix in prefixes {
            let (most, least) = self.config.bounds(prefix.family());
            if least > most {
                warn!(%prefix, least, most, "least-specific bound past most-specific bound, not distributing");
                return Err(BalancerError::MaxPrefixLength {
                    prefix: *prefix,
                    bound: most,
                });
            }
            fit_to_bound(*prefix, least, &mut pieces);
        }
        if self.prefix_count() + pieces.len() > self.config.max_prefixes {
            warn!(
                pieces = pieces.len(),
                held = self.prefix_count(),
                max = self.config.max_prefixes,
                "distribution would pass the prefix ceiling, nothing placed"
            );
            return Err(BalancerError::MaxPrefixCount {
                max: self.config.max_prefixes,
            });
        }

        // No space rebalance between pieces: least-space placement already
        // evens out address space, and `balance` handles anything left over.
        let mut placed = 0;
        for piece in pieces {
            let Some(target) = self.placement_target() else {
                warn!(prefix = %piece, "no sensor group to place prefix on");
                break;
            };
            match self.add_inner(target, piece, None, 0.0, &[]) {
                Ok(()) => placed += 1,
                Err(e @ BalancerError::MaxFlowCount { .. }) => {
                    warn!(prefix = %piece, error = %e, "distribution stopped");
                    self.commit();
                    return Err(e);
                }
                Err(e) => warn!(prefix = %piece, error = %e, "prefix not placed"),
            }
        }
        self.commit();
        Ok(placed)
    }

    fn placement_target(&self) -> Option<usize> {
        let active = self.active_groups();
        let candidates = if active.is_empty() {
            (0..self.groups.len()).collect()
        } else {
            active
        };
        candidates
            .into_iter()
            .map(|i| (i, self.groups[i].host_units()))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }

    // ─── persistence ────────────────────────────────────────────────

    pub fn snapshot(&self) -> BalancerSnapshot {
        BalancerSnapshot {
            groups: self
                .groups
                .iter()
                .map(|g| {
                    (
                        g.id().to_owned(),
                        GroupSnapshot {
                            prefixes: g.prefixes().to_vec(),
                        },
                    )
                })
                .collect(),
            prefixes: self.prefixes(),
            priorities: self.priorities.to_map(),
        }
    }

    /// Rebuilds the assignment from a snapshot, reconciled against the
    /// configured prefixes.
    ///
    /// Saved prefixes still inside the configured space go back to their
    /// saved group with their saved priority band. Saved prefixes outside it
    /// are dropped. Configured space without a saved assignment is
    /// distributed fresh.
    pub fn restore(
        &mut self,
        snapshot: &BalancerSnapshot,
        configured: &[Prefix],
    ) -> Result<RestoreSummary, BalancerError> {
        let mut summary = RestoreSummary::default();

        for (group_id, group) in &snapshot.groups {
            let gidx = match self.group_index(group_id) {
                Ok(i) => i,
                Err(_) => {
                    warn!(group = group_id.as_str(), "saved group no longer configured");
                    summary.dropped.extend(group.prefixes.iter().copied());
                    continue;
                }
            };
            for prefix in &group.prefixes {
                if !configured.iter().any(|c| c.contains(prefix)) {
                    summary.dropped.push(*prefix);
                    continue;
                }
                let alloc = snapshot.priorities.get(prefix).copied();
                match self.add_inner(gidx, *prefix, alloc, 0.0, &[]) {
                    Ok(()) => summary.kept.push(*prefix),
                    Err(e) => {
                        warn!(%prefix, error = %e, "saved prefix not restored");
                        summary.dropped.push(*prefix);
                    }
                }
            }
        }

        let kept = summary.kept.clone();
        let fresh: Vec<Prefix> = configured
            .iter()
            .flat_map(|c| uncovered(*c, &kept))
            .collect();
        if !fresh.is_empty() {
            self.distribute(&fresh)?;
        }
        summary.distributed = fresh;
        info!(
            kept = summary.kept.len(),
            dropped = summary.dropped.len(),
            distributed = summary.distributed.len(),
            "balancer state restored"
        );
        self.commit();
        Ok(summary)
    }

    // ─── reporting ──────────────────────────────────────────────────

    /// Human-readable state of every group.
    pub fn status_report(&self) -> String {
        let mut out = String::new();
        let total_bw: f64 = (0..self.groups.len()).map(|i| self.bandwidth_of(i)).sum();
        let total_hosts: f64 = self.groups.iter().map(SensorGroup::host_units).sum();
        let _ = writeln!(out, "Balance Method: {}:", self.mode());
        for (i, group) in self.groups.iter().enumerate() {
            let _ = writeln!(
                out,
                "Group: {} ({}) status: {}  bw: {:.2}%  load: {:.3}  hosts: {:.2}%",
                group.id(),
                group.description(),
                if group.is_up() { "up" } else { "down" },
                100.0 * ratio(self.bandwidth_of(i), total_bw),
                group.load(),
                100.0 * ratio(group.host_units(), total_hosts),
            );
            for prefix in group.prefixes() {
                let bw = self.prefix_bw(prefix).unwrap_or(0.0);
                let _ = writeln!(out, "   {prefix}: {:.3} Mbps", bw / 1_000_000.0);
            }
        }
        out
    }

    // ─── internals ──────────────────────────────────────────────────

    pub(crate) fn group_index(&self, id: &str) -> Result<usize, BalancerError> {
        self.groups
            .iter()
            .position(|g| g.id() == id)
            .ok_or_else(|| BalancerError::UnknownGroup(id.to_owned()))
    }

    fn holder_of(&self, prefix: &Prefix) -> Result<usize, BalancerError> {
        self.groups
            .iter()
            .position(|g| g.holds(prefix))
            .ok_or(BalancerError::UnknownPrefix(*prefix))
    }

    fn find_sensor(&self, sensor_id: &str) -> Option<(usize, usize)> {
        self.groups.iter().enumerate().find_map(|(gi, g)| {
            g.sensors()
                .iter()
                .position(|s| s.id == sensor_id)
                .map(|si| (gi, si))
        })
    }

    pub(crate) fn active_groups(&self) -> Vec<usize> {
        (0..self.groups.len())
            .filter(|&i| self.groups[i].is_up())
            .collect()
    }

    pub(crate) fn bandwidth_of(&self, idx: usize) -> f64 {
        self.groups[idx]
            .prefixes()
            .iter()
            .map(|p| self.prefix_bw.get(p).copied().unwrap_or(0.0))
            .sum()
    }

    /// Adds `prefix` to group `gidx`.
    ///
    /// `replacing` lists prefixes about to be removed by the caller: they
    /// neither count toward the ceiling nor conflict with `prefix`.
    pub(crate) fn add_inner(
        &mut self,
        gidx: usize,
        prefix: Prefix,
        alloc: Option<PriorityAllocation>,
        bw: f64,
        replacing: &[Prefix],
    ) -> Result<(), BalancerError> {
        let held = self.prefix_count();
        let replaced = replacing
            .iter()
            .filter(|r| self.prefix_bw.contains_key(*r))
            .count();
        if held - replaced >= self.config.max_prefixes {
            return Err(BalancerError::MaxPrefixCount {
                max: self.config.max_prefixes,
            });
        }
        if let Some(existing) = self
            .groups
            .iter()
            .flat_map(|g| g.prefixes().iter())
            .find(|p| !replacing.contains(*p) && p.overlaps(&prefix))
        {
            return Err(BalancerError::DuplicatePrefix {
                prefix,
                existing: *existing,
            });
        }

        let (alloc, fresh_root) = match alloc.or_else(|| self.priorities.get(&prefix)) {
            Some(a) => (a, false),
            None => (self.priorities.allocate_root(), true),
        };

        if let Err(e) = self
            .handler
            .on_prefix_added(&self.groups[gidx], &prefix, alloc.priority)
        {
            if fresh_root {
                self.priorities.return_root(alloc);
            }
            return Err(e);
        }

        self.priorities.assign(prefix, alloc);
        self.groups[gidx].push_prefix(prefix);
        self.prefix_bw.insert(prefix, bw);
        debug!(group = self.groups[gidx].id(), %prefix, priority = alloc.priority, "prefix added");
        Ok(())
    }

    /// Removes `prefix` from group `gidx`, returning its rate and band.
    pub(crate) fn del_inner(
        &mut self,
        gidx: usize,
        prefix: Prefix,
    ) -> Result<(f64, PriorityAllocation), BalancerError> {
        let pos = self.groups[gidx]
            .position(&prefix)
            .ok_or(BalancerError::UnknownPrefix(prefix))?;
        let alloc = self
            .priorities
            .get(&prefix)
            .ok_or(BalancerError::UnknownPrefix(prefix))?;

        self.groups[gidx].remove_prefix_at(pos);
        let bw = self.prefix_bw.remove(&prefix).unwrap_or(0.0);
        self.priorities.release(&prefix);

        if let Err(e) = self
            .handler
            .on_prefix_deleted(&self.groups[gidx], &prefix, alloc.priority)
        {
            self.groups[gidx].insert_prefix(pos, prefix);
            self.prefix_bw.insert(prefix, bw);
            self.priorities.assign(prefix, alloc);
            return Err(e);
        }
        debug!(group = self.groups[gidx].id(), %prefix, "prefix deleted");
        Ok((bw, alloc))
    }

    pub(crate) fn move_inner(&mut self, from: usize, to: usize, prefix: Prefix) -> Result<(), BalancerError> {
        if from == to {
            return Ok(());
        }
        let pos = self.groups[from]
            .position(&prefix)
            .ok_or(BalancerError::UnknownPrefix(prefix))?;
        let alloc = self
            .priorities
            .get(&prefix)
            .ok_or(BalancerError::UnknownPrefix(prefix))?;

        self.groups[from].remove_prefix_at(pos);
        self.groups[to].push_prefix(prefix);

        if let Err(e) = self.handler.on_prefix_moved(
            &self.groups[from],
            &self.groups[to],
            &prefix,
            alloc.priority,
        ) {
            if let Some(back) = self.groups[to].position(&prefix) {
                self.groups[to].remove_prefix_at(back);
            }
            self.groups[from].insert_prefix(pos, prefix);
            return Err(e);
        }
        counter!(m::BALANCER_MOVES_TOTAL).increment(1);
        info!(
            %prefix,
            from = self.groups[from].id(),
            to = self.groups[to].id(),
            "prefix moved"
        );
        Ok(())
    }

    /// Children are installed before the parent is removed so traffic is
    /// never left without a rule.
    pub(crate) fn split_inner(&mut self, gidx: usize, prefix: Prefix) -> Result<(Prefix, Prefix), BalancerError> {
        let (left, right) = self.split_prefix(&prefix)?;
        if !self.groups[gidx].holds(&prefix) {
            return Err(BalancerError::UnknownPrefix(prefix));
        }
        if self.prefix_count() + 1 > self.config.max_prefixes {
            return Err(BalancerError::MaxPrefixCount {
                max: self.config.max_prefixes,
            });
        }
        let parent_alloc = self
            .priorities
            .get(&prefix)
            .ok_or(BalancerError::UnknownPrefix(prefix))?;
        let (left_alloc, right_alloc) = parent_alloc.split();
        let half_bw = self.prefix_bw(&prefix).unwrap_or(0.0) / 2.0;

        self.add_inner(gidx, left, Some(left_alloc), half_bw, &[prefix])?;
        if let Err(e) = self.add_inner(gidx, right, Some(right_alloc), half_bw, &[prefix]) {
            self.undo_add(gidx, left);
            return Err(e);
        }
        if let Err(e) = self.del_inner(gidx, prefix) {
            self.undo_add(gidx, right);
            self.undo_add(gidx, left);
            return Err(e);
        }
        counter!(m::BALANCER_SPLITS_TOTAL).increment(1);
        info!(%prefix, %left, %right, group = self.groups[gidx].id(), "prefix split");
        Ok((left, right))
    }

    /// Children are removed before the parent is installed; if the parent
    /// cannot be installed the children are put back.
    pub(crate) fn merge_inner(&mut self, gidx: usize, left: Prefix, right: Prefix) -> Result<Prefix, BalancerError> {
        if left.sibling() != Some(right) {
            return Err(BalancerError::UnknownPrefix(right));
        }
        let group = &self.groups[gidx];
        if !group.holds(&left) {
            return Err(BalancerError::UnknownPrefix(left));
        }
        if !group.holds(&right) {
            return Err(BalancerError::UnknownPrefix(right));
        }
        let parent = left.supernet().ok_or(BalancerError::UnknownPrefix(left))?;
        let (_, least) = self.config.bounds(parent.family());
        if parent.prefix_len() < least {
            return Err(BalancerError::MaxPrefixLength {
                prefix: parent,
                bound: least,
            });
        }

        let (left_bw, left_alloc) = self.del_inner(gidx, left)?;
        let (right_bw, right_alloc) = match self.del_inner(gidx, right) {
            Ok(v) => v,
            Err(e) => {
                self.redo_add(gidx, left, left_alloc, left_bw);
                return Err(e);
            }
        };
        let parent_alloc = left_alloc.merge(right_alloc);
        if let Err(e) = self.add_inner(gidx, parent, Some(parent_alloc), left_bw + right_bw, &[]) {
            self.redo_add(gidx, left, left_alloc, left_bw);
            self.redo_add(gidx, right, right_alloc, right_bw);
            return Err(e);
        }
        counter!(m::BALANCER_MERGES_TOTAL).increment(1);
        info!(%parent, %left, %right, group = self.groups[gidx].id(), "prefixes merged");
        Ok(parent)
    }

    /// Cheapest sibling pair under the merge threshold, optionally limited
    /// to a set of groups.
    pub(crate) fn merge_best(&mut self, within: Option<&[usize]>) -> Result<Option<Prefix>, BalancerError> {
        let mut best: Option<(usize, Prefix, Prefix, f64)> = None;
        for (gidx, group) in self.groups.iter().enumerate() {
            if within.is_some_and(|w| !w.contains(&gidx)) {
                continue;
            }
            for prefix in group.prefixes() {
                let Some(sibling) = prefix.sibling() else {
                    continue;
                };
                if sibling <= *prefix || !group.holds(&sibling) {
                    continue;
                }
                let Some(parent) = prefix.supernet() else {
                    continue;
                };
                let (_, least) = self.config.bounds(parent.family());
                if parent.prefix_len() < least {
                    continue;
                }
                let combined = self.prefix_bw(prefix).unwrap_or(0.0)
                    + self.prefix_bw(&sibling).unwrap_or(0.0);
                if combined >= self.config.merge_threshold_bps {
                    continue;
                }
                if best.is_none_or(|(_, _, _, bw)| combined < bw) {
                    best = Some((gidx, *prefix, sibling, combined));
                }
            }
        }
        match best {
            Some((gidx, left, right, _)) => self.merge_inner(gidx, left, right).map(Some),
            None => Ok(None),
        }
    }

    /// Rollback helper: remove a just-added prefix, logging if even that fails.
    fn undo_add(&mut self, gidx: usize, prefix: Prefix) {
        if let Err(e) = self.del_inner(gidx, prefix) {
            warn!(%prefix, error = %e, "rollback of added prefix failed");
        }
    }

    /// Rollback helper: put back a just-removed prefix.
    fn redo_add(&mut self, gidx: usize, prefix: Prefix, alloc: PriorityAllocation, bw: f64) {
        if let Err(e) = self.add_inner(gidx, prefix, Some(alloc), bw, &[]) {
            warn!(%prefix, error = %e, "rollback of removed prefix failed");
        }
    }

    /// Commits on success, counts the error otherwise.
    pub(crate) fn finish<T>(&mut self, result: Result<T, BalancerError>) -> Result<T, BalancerError> {
        match &result {
            Ok(_) => self.commit(),
            Err(e) => {
                counter!(m::BALANCER_ERRORS_TOTAL, m::LABEL_KIND => e.kind()).increment(1);
            }
        }
        result
    }

    pub(crate) fn commit(&mut self) {
        if self.initialized {
            let snapshot = self.snapshot();
            self.handler.on_committed(&snapshot);
        }
    }
}

fn largest_in(group: &SensorGroup) -> Option<Prefix> {
    let mut best: Option<Prefix> = None;
    for prefix in group.prefixes() {
        if best.is_none_or(|b| prefix.host_units() > b.host_units()) {
            best = Some(*prefix);
        }
    }
    best
}

pub(crate) fn largest_prefix_of(group: &SensorGroup) -> Option<Prefix> {
    largest_in(group)
}

/// Splits `prefix` until it is no wider than `least`.
fn fit_to_bound(prefix: Prefix, least: u8, out: &mut Vec<Prefix>) {
    if prefix.prefix_len() >= least {
        out.push(prefix);
        return;
    }
    match prefix.split() {
        Some((left, right)) => {
            fit_to_bound(left, least, out);
            fit_to_bound(right, least, out);
        }
        None => out.push(prefix),
    }
}

pub(crate) fn ratio(part: f64, total: f64) -> f64 {
    if total > 0.0 { part / total } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every event. `refuse_adds_after` refuses one add once that
    /// many have been recorded.
    #[derive(Default)]
    struct MockHandler {
        added: Vec<(String, Prefix, u32)>,
        deleted: Vec<(String, Prefix, u32)>,
        moved: Vec<(String, String, Prefix)>,
        commits: usize,
        refuse_adds_after: Option<usize>,
    }

    impl PrefixEventHandler for MockHandler {
        fn on_prefix_added(&mut self, group: &SensorGroup, prefix: &Prefix, priority: u32) -> Result<(), BalancerError> {
            if self.refuse_adds_after.is_some_and(|n| self.added.len() >= n) {
                self.refuse_adds_after = None;
                return Err(BalancerError::MaxFlowCount { max: 0 });
            }
            self.added.push((group.id().to_owned(), *prefix, priority));
            Ok(())
        }

        fn on_prefix_deleted(&mut self, group: &SensorGroup, prefix: &Prefix, priority: u32) -> Result<(), BalancerError> {
            self.deleted.push((group.id().to_owned(), *prefix, priority));
            Ok(())
        }

        fn on_prefix_moved(&mut self, old: &SensorGroup, new: &SensorGroup, prefix: &Prefix, _: u32) -> Result<(), BalancerError> {
            self.moved.push((old.id().to_owned(), new.id().to_owned(), *prefix));
            Ok(())
        }

        fn on_committed(&mut self, _snapshot: &BalancerSnapshot) {
            self.commits += 1;
        }
    }

    fn p(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    fn balancer() -> Balancer<MockHandler> {
        let mut b = Balancer::new(BalancerConfig::default(), MockHandler::default());
        for (g, ports) in [("group1", [27, 26]), ("group2", [21, 20])] {
            b.add_sensor_group(g, "").unwrap();
            for port in ports {
                b.add_sensor(g, &format!("{g}-{port}"), port).unwrap();
            }
        }
        b
    }

    #[test]
    fn duplicate_group_and_sensor_are_refused() {
        let mut b = balancer();
        assert_eq!(
            b.add_sensor_group("group1", ""),
            Err(BalancerError::DuplicateGroup("group1".to_owned()))
        );
        assert!(matches!(
            b.add_sensor("group2", "group1-27", 99),
            Err(BalancerError::DuplicateSensor(_))
        ));
        assert!(matches!(
            b.add_sensor("nope", "x", 99),
            Err(BalancerError::UnknownGroup(_))
        ));
    }

    #[test]
    fn add_assigns_root_bands_in_order() {
        let mut b = balancer();
        b.add_group_prefix("group1", p("10.0.17.0/24")).unwrap();
        b.add_group_prefix("group2", p("10.0.18.0/24")).unwrap();
        assert_eq!(b.priority_of(&p("10.0.17.0/24")).unwrap().priority, 500);
        assert_eq!(b.priority_of(&p("10.0.18.0/24")).unwrap().priority, 600);
        assert_eq!(b.handler().added.len(), 2);
        assert_eq!(b.prefix_group(&p("10.0.18.0/24")).unwrap().id(), "group2");
    }

    #[test]
    fn add_rejects_overlap_and_duplicate() {
        let mut b = balancer();
        b.add_group_prefix("group1", p("10.0.0.0/16")).unwrap();
        assert!(matches!(
            b.add_group_prefix("group2", p("10.0.1.0/24")),
            Err(BalancerError::DuplicatePrefix { .. })
        ));
        assert!(matches!(
            b.add_group_prefix("group1", p("10.0.0.0/16")),
            Err(BalancerError::DuplicatePrefix { .. })
        ));
        assert_eq!(b.prefix_count(), 1);
    }

    #[test]
    fn add_past_ceiling_fails_and_leaves_state() {
        let mut config = BalancerConfig::default();
        config.max_prefixes = 1;
        let mut b = Balancer::new(config, MockHandler::default());
        b.add_sensor_group("group1", "").unwrap();
        b.add_group_prefix("group1", p("10.0.0.0/24")).unwrap();
        let before = b.snapshot();
        assert_eq!(
            b.add_group_prefix("group1", p("10.0.1.0/24")),
            Err(BalancerError::MaxPrefixCount { max: 1 })
        );
        assert_eq!(b.snapshot(), before);
    }

    #[test]
    fn handler_refusal_rolls_back_add() {
        let mut b = balancer();
        b.handler_mut().refuse_adds_after = Some(0);
        assert!(matches!(
            b.add_group_prefix("group1", p("10.0.0.0/24")),
            Err(BalancerError::MaxFlowCount { .. })
        ));
        assert_eq!(b.prefix_count(), 0);
        b.handler_mut().refuse_adds_after = None;
        b.add_group_prefix("group1", p("10.0.0.0/24")).unwrap();
        // the refused add did not burn a band
        assert_eq!(b.priority_of(&p("10.0.0.0/24")).unwrap().priority, 500);
    }

    #[test]
    fn delete_frees_band_and_reports() {
        let mut b = balancer();
        b.add_group_prefix("group1", p("10.0.0.0/24")).unwrap();
        b.del_group_prefix("group1", &p("10.0.0.0/24")).unwrap();
        assert_eq!(b.prefix_count(), 0);
        assert!(b.priority_of(&p("10.0.0.0/24")).is_none());
        assert_eq!(b.handler().deleted[0].2, 500);
        assert!(matches!(
            b.del_group_prefix("group1", &p("10.0.0.0/24")),
            Err(BalancerError::UnknownPrefix(_))
        ));
    }

    #[test]
    fn move_and_move_back_restores_membership() {
        let mut b = balancer();
        let prefix = p("10.0.0.0/24");
        b.add_group_prefix("group1", prefix).unwrap();
        b.move_group_prefix("group1", "group2", &prefix).unwrap();
        assert_eq!(b.prefix_group(&prefix).unwrap().id(), "group2");
        b.move_group_prefix("group2", "group1", &prefix).unwrap();
        assert_eq!(b.prefix_group(&prefix).unwrap().id(), "group1");
        assert_eq!(b.handler().moved.len(), 2);
        assert_eq!(b.priority_of(&prefix).unwrap().priority, 500);
    }

    #[test]
    fn split_refused_at_most_specific_bound() {
        let b = balancer();
        assert_eq!(
            b.split_prefix(&p("10.0.0.0/29")),
            Err(BalancerError::MaxPrefixLength {
                prefix: p("10.0.0.0/29"),
                bound: 29
            })
        );
        assert_eq!(
            b.split_prefix(&p("10.0.0.0/11")).unwrap(),
            (p("10.0.0.0/12"), p("10.16.0.0/12"))
        );
    }

    #[test]
    fn split_then_merge_round_trips() {
        let mut b = balancer();
        let parent = p("10.0.18.0/24");
        b.add_group_prefix("group1", parent).unwrap();
        b.set_prefix_bw(&parent, 300.0, 100.0).unwrap();

        let (left, right) = b.split_group_prefix(&parent).unwrap();
        assert_eq!(left, p("10.0.18.0/25"));
        assert_eq!(right, p("10.0.18.128/25"));
        assert_eq!(b.prefix_bw(&left), Some(200.0));
        assert_eq!(b.priority_of(&right).unwrap().priority, 550);
        assert!(b.prefix_group(&parent).is_none());

        let merged = b.merge_group_prefixes(&left, &right).unwrap();
        assert_eq!(merged, parent);
        assert_eq!(b.prefix_bw(&parent), Some(400.0));
        assert_eq!(merged.host_count(), 256);
        assert_eq!(
            b.priority_of(&parent).unwrap(),
            PriorityAllocation {
                priority: 500,
                budget: 100
            }
        );
        assert_eq!(b.prefix_count(), 1);
    }

    #[test]
    fn split_respects_ceiling() {
        let mut config = BalancerConfig::default();
        config.max_prefixes = 1;
        let mut b = Balancer::new(config, MockHandler::default());
        b.add_sensor_group("group1", "").unwrap();
        b.add_group_prefix("group1", p("10.0.0.0/24")).unwrap();
        assert_eq!(
            b.split_group_prefix(&p("10.0.0.0/24")),
            Err(BalancerError::MaxPrefixCount { max: 1 })
        );
        assert_eq!(b.prefixes(), vec![p("10.0.0.0/24")]);
    }

    #[test]
    fn split_rolls_back_when_second_child_refused() {
        let mut b = balancer();
        b.add_group_prefix("group1", p("10.0.0.0/24")).unwrap();
        b.handler_mut().refuse_adds_after = Some(2);
        assert!(b.split_group_prefix(&p("10.0.0.0/24")).is_err());
        assert_eq!(b.prefixes(), vec![p("10.0.0.0/24")]);
        assert_eq!(b.priority_of(&p("10.0.0.0/24")).unwrap().priority, 500);
    }

    #[test]
    fn merge_refused_past_least_specific_bound() {
        let mut b = balancer();
        b.add_group_prefix("group1", p("10.0.0.0/24")).unwrap();
        b.add_group_prefix("group1", p("10.0.1.0/24")).unwrap();
        assert!(matches!(
            b.merge_group_prefixes(&p("10.0.0.0/24"), &p("10.0.1.0/24")),
            Err(BalancerError::MaxPrefixLength { .. })
        ));
        assert_eq!(b.merge().unwrap(), None);
    }

    #[test]
    fn merge_restores_children_when_parent_refused() {
        let mut b = balancer();
        b.add_group_prefix("group1", p("10.0.0.0/25")).unwrap();
        b.add_group_prefix("group1", p("10.0.0.128/25")).unwrap();
        b.handler_mut().refuse_adds_after = Some(2);
        assert!(b.merge().is_err());
        b.handler_mut().refuse_adds_after = None;
        let mut held = b.prefixes();
        held.sort();
        assert_eq!(held, vec![p("10.0.0.0/25"), p("10.0.0.128/25")]);
    }

    #[test]
    fn split_prefix_for_sensors_uses_fewest_bits() {
        let mut config = BalancerConfig::default();
        config.most_specific_len = 32;
        let b = Balancer::new(config, ());
        let four = b.split_prefix_for_sensors(&p("10.0.0.0/8"), 4).unwrap();
        assert_eq!(four.len(), 4);
        assert_eq!(four[1], p("10.64.0.0/10"));
        assert_eq!(b.split_prefix_for_sensors(&p("10.0.0.0/8"), 100).unwrap().len(), 128);
        assert_eq!(b.split_prefix_for_sensors(&p("10.0.0.0/8"), 1).unwrap(), vec![p("10.0.0.0/8")]);
    }

    #[test]
    fn largest_prefix_prefers_widest() {
        let mut b = balancer();
        assert_eq!(b.largest_prefix("group1").unwrap(), None);
        b.add_group_prefix("group1", p("10.0.0.0/26")).unwrap();
        b.add_group_prefix("group1", p("10.1.0.0/24")).unwrap();
        b.add_group_prefix("group1", p("10.2.0.0/25")).unwrap();
        assert_eq!(b.largest_prefix("group1").unwrap(), Some(p("10.1.0.0/24")));
        assert!(b.largest_prefix("nope").is_err());
    }

    #[test]
    fn estimated_load_by_address_space() {
        let mut config = BalancerConfig::default();
        config.ignore_prefix_bw = true;
        config.least_specific_len = 8;
        let mut b = Balancer::new(config, ());
        b.add_sensor_group("group1", "").unwrap();
        b.add_group_prefix("group1", p("10.0.0.0/12")).unwrap();
        b.add_group_prefix("group1", p("11.0.0.0/10")).unwrap();
        let est = b.estimated_load("group1", &p("12.0.0.0/8")).unwrap();
        assert!((est - 3.2).abs() < 1e-9);
    }

    #[test]
    fn estimated_load_by_bandwidth_and_sensor_load() {
        let mut config = BalancerConfig::default();
        config.ignore_sensor_load = false;
        let mut b = Balancer::new(config, ());
        b.add_sensor_group("group1", "").unwrap();
        b.add_sensor("group1", "s1", 27).unwrap();
        b.add_group_prefix("group1", p("10.0.0.0/24")).unwrap();
        b.add_group_prefix("group1", p("10.0.1.0/24")).unwrap();
        b.set_prefix_bw(&p("10.0.0.0/24"), 300.0, 0.0).unwrap();
        b.set_prefix_bw(&p("10.0.1.0/24"), 100.0, 0.0).unwrap();
        b.set_sensor_load("s1", 0.5).unwrap();
        let est = b.estimated_load("group1", &p("10.0.0.0/24")).unwrap();
        assert!((est - 0.375).abs() < 1e-9);
    }

    #[test]
    fn sensor_load_bounds() {
        let mut b = balancer();
        assert_eq!(b.set_sensor_load("group1-27", 1.5), Err(BalancerError::InvalidLoad(1.5)));
        assert!(matches!(b.set_sensor_load("ghost", 0.1), Err(BalancerError::UnknownSensor(_))));
        b.set_sensor_load("group1-27", 0.4).unwrap();
        assert_eq!(b.group_load("group1").unwrap(), 0.4);
    }

    #[test]
    fn disabling_a_sensor_unloads_its_group() {
        let mut b = balancer();
        b.add_group_prefix("group1", p("10.0.0.0/24")).unwrap();
        b.add_group_prefix("group1", p("10.0.1.0/24")).unwrap();
        assert!(b.set_sensor_status("group1-26", false).unwrap());
        assert!(!b.group_status("group1").unwrap());
        assert!(b.group("group1").unwrap().prefixes().is_empty());
        assert_eq!(b.group("group2").unwrap().prefixes().len(), 2);

        // second sensor of an already-down group changes nothing
        assert!(!b.set_sensor_status("group1-27", false).unwrap());
        assert!(matches!(b.set_sensor_status("ghost", false), Err(BalancerError::UnknownSensor(_))));
    }

    #[test]
    fn set_prefix_bw_requires_known_prefix() {
        let mut b = balancer();
        assert!(matches!(
            b.set_prefix_bw(&p("10.0.0.0/24"), 1.0, 1.0),
            Err(BalancerError::UnknownPrefix(_))
        ));
        b.add_group_prefix("group1", p("10.0.0.0/24")).unwrap();
        b.set_prefix_bw(&p("10.0.0.0/24"), 500.0, 500.0).unwrap();
        assert_eq!(b.prefix_bw(&p("10.0.0.0/24")), Some(1000.0));
        assert_eq!(b.group_bandwidth("group1").unwrap(), 1000.0);
    }

    #[test]
    fn commits_only_after_initialization() {
        let mut b = balancer();
        b.add_group_prefix("group1", p("10.0.0.0/24")).unwrap();
        assert_eq!(b.handler().commits, 0);
        b.mark_initialized();
        assert_eq!(b.handler().commits, 1);
        b.move_group_prefix("group1", "group2", &p("10.0.0.0/24")).unwrap();
        assert_eq!(b.handler().commits, 2);
        let _ = b.del_group_prefix("group1", &p("10.9.0.0/24"));
        assert_eq!(b.handler().commits, 2);
    }

    #[test]
    fn distribute_splits_wide_prefixes_and_spreads_them() {
        let mut b = balancer();
        let placed = b.distribute(&[p("10.0.0.0/23"), p("10.1.0.0/24")]).unwrap();
        assert_eq!(placed, 3);
        let g1 = b.group("group1").unwrap().prefixes().to_vec();
        let g2 = b.group("group2").unwrap().prefixes().to_vec();
        assert_eq!(g1, vec![p("10.0.0.0/24"), p("10.1.0.0/24")]);
        assert_eq!(g2, vec![p("10.0.1.0/24")]);
    }

    #[test]
    fn distribute_places_without_moving_held_prefixes() {
        // Given: group1 already holds a /24
        let mut b = balancer();
        b.add_group_prefix("group1", p("10.9.0.0/24")).unwrap();

        // When: a /23 is distributed
        let placed = b.distribute(&[p("10.0.0.0/23")]).unwrap();

        // Then: each piece goes to the emptier group and nothing moves
        assert_eq!(placed, 2);
        assert_eq!(b.prefix_group(&p("10.0.0.0/24")).unwrap().id(), "group2");
        assert_eq!(b.prefix_group(&p("10.0.1.0/24")).unwrap().id(), "group1");
        assert_eq!(b.prefix_group(&p("10.9.0.0/24")).unwrap().id(), "group1");
        assert!(b.handler().moved.is_empty());
    }

    #[test]
    fn distribute_is_a_no_op_past_the_ceiling() {
        let mut config = BalancerConfig::default();
        config.max_prefixes = 2;
        let mut b = Balancer::new(config, ());
        b.add_sensor_group("group1", "").unwrap();
        assert!(matches!(
            b.distribute(&[p("10.0.0.0/22")]),
            Err(BalancerError::MaxPrefixCount { max: 2 })
        ));
        assert_eq!(b.prefix_count(), 0);
    }

    #[test]
    fn restore_keeps_saved_assignment_and_reconciles() {
        let mut first = balancer();
        first.add_group_prefix("group2", p("10.0.18.0/25")).unwrap();
        first.add_group_prefix("group2", p("10.0.18.128/25")).unwrap();
        first.add_group_prefix("group1", p("10.0.99.0/24")).unwrap();
        let saved = first.snapshot();

        let mut second = balancer();
        let summary = second
            .restore(&saved, &[p("10.0.18.0/24"), p("10.0.17.0/24")])
            .unwrap();
        assert_eq!(summary.kept.len(), 2);
        assert_eq!(summary.dropped, vec![p("10.0.99.0/24")]);
        assert_eq!(summary.distributed, vec![p("10.0.17.0/24")]);
        assert_eq!(second.prefix_group(&p("10.0.18.0/25")).unwrap().id(), "group2");
        assert_eq!(
            second.priority_of(&p("10.0.18.128/25")),
            saved.priorities.get(&p("10.0.18.128/25")).copied()
        );
        assert!(second.prefix_group(&p("10.0.17.0/24")).is_some());
    }

    #[test]
    fn status_report_lists_groups_and_prefixes() {
        let mut b = balancer();
        b.add_group_prefix("group1", p("10.0.0.0/24")).unwrap();
        b.set_prefix_bw(&p("10.0.0.0/24"), 2_000_000.0, 0.0).unwrap();
        let report = b.status_report();
        assert!(report.starts_with("Balance Method: Prefix Bandwidth:"));
        assert!(report.contains("Group: group1"));
        assert!(report.contains("10.0.0.0/24: 2.000 Mbps"));
        assert!(report.contains("bw: 100.00%"));
    }
}
