//! Rebalancing strategies.
//!
//! One call to [`Balancer::balance`] performs at most one corrective action:
//! a move, a split or a merge.

use std::fmt;
use std::time::Instant;

use metrics::histogram;
use tracing::{debug, info};

use scipass_core::metrics as m;
use scipass_core::prefix::Prefix;

use crate::balancer::{Balancer, largest_prefix_of, ratio};
use crate::config::BalanceMode;
use crate::error::BalancerError;
use crate::handler::PrefixEventHandler;

/// Result of one balancing pass.
#[derive(Debug, Clone, PartialEq)]
pub enum BalanceOutcome {
    /// Nothing needed or nothing possible.
    Idle { reason: String },
    Moved {
        prefix: Prefix,
        from: String,
        to: String,
    },
    Split {
        prefix: Prefix,
        into: (Prefix, Prefix),
    },
    Merged { into: Prefix },
}

impl BalanceOutcome {
    fn idle(reason: impl Into<String>) -> Self {
        Self::Idle {
            reason: reason.into(),
        }
    }

    pub fn changed(&self) -> bool {
        !matches!(self, Self::Idle { .. })
    }
}

impl fmt::Display for BalanceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle { reason } => write!(f, "idle: {reason}"),
            Self::Moved { prefix, from, to } => write!(f, "moved {prefix} from {from} to {to}"),
            Self::Split { prefix, into } => write!(f, "split {prefix} into {} and {}", into.0, into.1),
            Self::Merged { into } => write!(f, "merged into {into}"),
        }
    }
}

impl<H: PrefixEventHandler> Balancer<H> {
    /// Runs the strategy selected by the configured mode.
    pub fn balance(&mut self) -> Result<BalanceOutcome, BalancerError> {
        self.run_strategy(self.mode())
    }

    /// Address-space pass regardless of the configured mode.
    pub fn balance_by_ip(&mut self) -> Result<BalanceOutcome, BalancerError> {
        self.run_strategy(BalanceMode::IpSpace)
    }

    /// Bandwidth pass regardless of the configured mode.
    pub fn balance_by_net_bytes(&mut self) -> Result<BalanceOutcome, BalancerError> {
        self.run_strategy(BalanceMode::NetBytes)
    }

    /// Sensor-load pass regardless of the configured mode.
    pub fn balance_by_load(&mut self) -> Result<BalanceOutcome, BalancerError> {
        self.run_strategy(BalanceMode::LoadAndBandwidth)
    }

    fn run_strategy(&mut self, mode: BalanceMode) -> Result<BalanceOutcome, BalancerError> {
        let started = Instant::now();
        let result = match mode {
            BalanceMode::IpSpace => self.relieve_by_space(),
            BalanceMode::NetBytes | BalanceMode::LoadAndBandwidth => self.relieve_by_load(mode),
        };
        histogram!(m::REBALANCE_DURATION_SECONDS, m::LABEL_STRATEGY => mode.label())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(outcome) if !outcome.changed() => {
                debug!(strategy = mode.label(), %outcome, "balance pass");
                Ok(outcome)
            }
            other => {
                let other = self.finish(other);
                if let Ok(outcome) = &other {
                    info!(strategy = mode.label(), %outcome, "balance pass");
                }
                other
            }
        }
    }

    /// Loads of the given groups under `mode`, relative to those groups
    /// only.
    ///
    /// - address space: share of the groups' total host units
    /// - bandwidth: share of the groups' total rate
    /// - sensor load: the reported load, averaged with the bandwidth share
    ///   unless bandwidth is ignored
    pub(crate) fn loads_for(&self, mode: BalanceMode, groups: &[usize]) -> Vec<(usize, f64)> {
        let total_hosts: f64 = groups.iter().map(|&i| self.groups[i].host_units()).sum();
        let total_bw: f64 = groups.iter().map(|&i| self.bandwidth_of(i)).sum();
        groups
            .iter()
            .map(|&i| {
                let host_share = ratio(self.groups[i].host_units(), total_hosts);
                let bw_share = ratio(self.bandwidth_of(i), total_bw);
                let load = match mode {
                    BalanceMode::IpSpace => host_share,
                    BalanceMode::NetBytes => bw_share,
                    BalanceMode::LoadAndBandwidth if self.config().ignore_prefix_bw => {
                        self.groups[i].load()
                    }
                    BalanceMode::LoadAndBandwidth => (bw_share + self.groups[i].load()) / 2.0,
                };
                (i, load)
            })
            .collect()
    }

    /// Moves the widest prefix of the fullest group to the emptiest one
    /// when their address-space shares differ by the delta threshold.
    fn relieve_by_space(&mut self) -> Result<BalanceOutcome, BalancerError> {
        let active = self.active_groups();
        if active.len() < 2 {
            return Ok(BalanceOutcome::idle("fewer than two active sensor groups"));
        }
        let loads = self.loads_for(BalanceMode::IpSpace, &active);
        let ((max_i, max_load), (min_i, min_load)) = extremes(&loads);
        if max_load - min_load < self.config().delta_threshold {
            return Ok(BalanceOutcome::idle("loads within delta threshold"));
        }
        let Some(prefix) = largest_prefix_of(&self.groups[max_i]) else {
            return Ok(BalanceOutcome::idle("fullest group holds no prefix"));
        };
        self.move_inner(max_i, min_i, prefix)?;
        Ok(self.moved(prefix, max_i, min_i))
    }

    /// Bandwidth or sensor-load driven pass.
    ///
    /// A fullest group holding one prefix already at the most-specific
    /// bound cannot be helped, so it is left out and the pass retried on
    /// the remaining groups. Otherwise the first prefix (by rate, highest
    /// first) that carries load and whose move would not overshoot is
    /// moved. Failing that the busiest splittable prefix is split, and
    /// failing that a cold sibling pair is merged.
    fn relieve_by_load(&mut self, mode: BalanceMode) -> Result<BalanceOutcome, BalancerError> {
        let mut candidates = self.active_groups();
        loop {
            if candidates.len() < 2 {
                return Ok(BalanceOutcome::idle("fewer than two active sensor groups"));
            }
            let loads = self.loads_for(mode, &candidates);
            let ((max_i, max_load), (min_i, min_load)) = extremes(&loads);
            if max_load < self.config().min_load_threshold {
                return Ok(BalanceOutcome::idle("load below minimum threshold"));
            }
            if max_load - min_load < self.config().delta_threshold {
                return Ok(BalanceOutcome::idle("loads within delta threshold"));
            }

            let held = self.groups[max_i].prefixes();
            if let [only] = held {
                let (most, _) = self.config().bounds(only.family());
                if only.prefix_len() >= most {
                    debug!(group = self.groups[max_i].id(), prefix = %only, "group cannot be relieved, excluded");
                    candidates.retain(|&i| i != max_i);
                    continue;
                }
            }

            let mut by_rate: Vec<(Prefix, f64)> = held
                .iter()
                .map(|p| (*p, self.prefix_bw(p).unwrap_or(0.0)))
                .collect();
            by_rate.sort_by(|a, b| b.1.total_cmp(&a.1));

            let total_bw: f64 = candidates.iter().map(|&i| self.bandwidth_of(i)).sum();
            for (prefix, _) in &by_rate {
                let estimate = self.move_estimate(mode, max_i, prefix, total_bw);
                let new_min = min_load + estimate;
                if estimate > 0.0 && new_min <= 1.0 && new_min < max_load - estimate {
                    self.move_inner(max_i, min_i, *prefix)?;
                    return Ok(self.moved(*prefix, max_i, min_i));
                }
            }

            for (prefix, _) in &by_rate {
                match self.split_inner(max_i, *prefix) {
                    Ok(into) => {
                        return Ok(BalanceOutcome::Split {
                            prefix: *prefix,
                            into,
                        });
                    }
                    Err(BalancerError::MaxPrefixLength { .. } | BalancerError::MaxPrefixCount { .. }) => {}
                    Err(e) => return Err(e),
                }
            }

            return match self.merge_best(None)? {
                Some(into) => Ok(BalanceOutcome::Merged { into }),
                None => Ok(BalanceOutcome::idle("nothing to move, split or merge")),
            };
        }
    }

    /// Load `prefix` would carry to a new group, in the units of
    /// [`Self::loads_for`] over groups whose rates sum to `total_bw`.
    fn move_estimate(&self, mode: BalanceMode, from: usize, prefix: &Prefix, total_bw: f64) -> f64 {
        let bw_share = ratio(self.prefix_bw(prefix).unwrap_or(0.0), total_bw);
        match mode {
            BalanceMode::IpSpace | BalanceMode::NetBytes => bw_share,
            BalanceMode::LoadAndBandwidth if self.config().ignore_prefix_bw => {
                self.estimated_load_at(from, prefix)
            }
            BalanceMode::LoadAndBandwidth => {
                let group = &self.groups[from];
                let of_group = ratio(self.prefix_bw(prefix).unwrap_or(0.0), self.bandwidth_of(from));
                (bw_share + of_group * group.load()) / 2.0
            }
        }
    }

    fn moved(&self, prefix: Prefix, from: usize, to: usize) -> BalanceOutcome {
        BalanceOutcome::Moved {
            prefix,
            from: self.groups[from].id().to_owned(),
            to: self.groups[to].id().to_owned(),
        }
    }
}

/// `(max, min)` entries; ties resolve to the earliest group.
fn extremes(loads: &[(usize, f64)]) -> ((usize, f64), (usize, f64)) {
    let mut max = loads[0];
    let mut min = loads[0];
    for &(i, load) in &loads[1..] {
        if load > max.1 {
            max = (i, load);
        }
        if load < min.1 {
            min = (i, load);
        }
    }
    (max, min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalancerConfig;

    fn p(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    fn balancer(config: BalancerConfig, groups: &[&str]) -> Balancer<()> {
        let mut b = Balancer::new(config, ());
        for (n, g) in groups.iter().enumerate() {
            b.add_sensor_group(g, "").unwrap();
            b.add_sensor(g, &format!("{g}-s"), 20 + n as u32).unwrap();
        }
        b
    }

    fn ip_config() -> BalancerConfig {
        BalancerConfig {
            ignore_prefix_bw: true,
            ..BalancerConfig::default()
        }
    }

    #[test]
    fn extremes_prefer_first_on_ties() {
        let loads = [(0, 0.5), (1, 0.5), (2, 0.5)];
        assert_eq!(extremes(&loads), ((0, 0.5), (0, 0.5)));
    }

    #[test]
    fn ip_space_moves_widest_prefix_to_emptiest_group() {
        let mut b = balancer(ip_config(), &["A", "B"]);
        b.add_group_prefix("A", p("10.0.0.0/28")).unwrap();
        b.add_group_prefix("B", p("10.1.0.0/25")).unwrap();
        b.add_group_prefix("B", p("10.2.0.0/28")).unwrap();

        let outcome = b.balance().unwrap();
        assert_eq!(outcome, BalanceOutcome::Moved {
            prefix: p("10.1.0.0/25"),
            from: "B".to_owned(),
            to: "A".to_owned(),
        });
        assert_eq!(b.group("A").unwrap().prefixes().len(), 2);
    }

    #[test]
    fn ip_space_idle_when_balanced() {
        let mut b = balancer(ip_config(), &["A", "B"]);
        b.add_group_prefix("A", p("10.0.0.0/24")).unwrap();
        b.add_group_prefix("B", p("10.1.0.0/24")).unwrap();
        assert!(!b.balance().unwrap().changed());
    }

    #[test]
    fn single_active_group_is_idle() {
        let mut b = balancer(BalancerConfig::default(), &["A", "B"]);
        b.add_group_prefix("A", p("10.0.0.0/24")).unwrap();
        b.set_sensor_status("B-s", false).unwrap();
        assert!(matches!(b.balance().unwrap(), BalanceOutcome::Idle { .. }));
    }

    #[test]
    fn net_bytes_moves_prefix_that_does_not_overshoot() {
        let mut b = balancer(BalancerConfig::default(), &["g1", "g2"]);
        b.add_group_prefix("g1", p("10.0.0.0/24")).unwrap();
        b.add_group_prefix("g1", p("10.0.1.0/24")).unwrap();
        b.add_group_prefix("g2", p("10.0.2.0/24")).unwrap();
        b.set_prefix_bw(&p("10.0.0.0/24"), 800.0, 0.0).unwrap();
        b.set_prefix_bw(&p("10.0.1.0/24"), 100.0, 0.0).unwrap();
        b.set_prefix_bw(&p("10.0.2.0/24"), 100.0, 0.0).unwrap();

        let outcome = b.balance().unwrap();
        assert_eq!(outcome, BalanceOutcome::Moved {
            prefix: p("10.0.1.0/24"),
            from: "g1".to_owned(),
            to: "g2".to_owned(),
        });
    }

    #[test]
    fn net_bytes_estimates_against_total_rate() {
        // Given: g1 carries 800 of 1000 bps, g2 carries 200
        let mut b = balancer(BalancerConfig::default(), &["g1", "g2"]);
        b.add_group_prefix("g1", p("10.0.0.0/24")).unwrap();
        b.add_group_prefix("g1", p("10.0.1.0/24")).unwrap();
        b.add_group_prefix("g2", p("10.0.2.0/24")).unwrap();
        b.set_prefix_bw(&p("10.0.0.0/24"), 250.0, 0.0).unwrap();
        b.set_prefix_bw(&p("10.0.1.0/24"), 550.0, 0.0).unwrap();
        b.set_prefix_bw(&p("10.0.2.0/24"), 200.0, 0.0).unwrap();

        // When
        let outcome = b.balance().unwrap();

        // Then: moving the 250 bps prefix leaves 0.45 against 0.55, no split
        assert_eq!(outcome, BalanceOutcome::Moved {
            prefix: p("10.0.0.0/24"),
            from: "g1".to_owned(),
            to: "g2".to_owned(),
        });
        assert_eq!(b.prefix_count(), 3);
    }

    #[test]
    fn load_and_bandwidth_estimates_against_total_rate() {
        // Given: reported loads 0.8 / 0.2 and rates 800 / 200 bps
        let config = BalancerConfig {
            ignore_sensor_load: false,
            ..BalancerConfig::default()
        };
        let mut b = balancer(config, &["g1", "g2"]);
        b.add_group_prefix("g1", p("10.0.0.0/24")).unwrap();
        b.add_group_prefix("g1", p("10.0.1.0/24")).unwrap();
        b.add_group_prefix("g2", p("10.0.2.0/24")).unwrap();
        b.set_prefix_bw(&p("10.0.0.0/24"), 250.0, 0.0).unwrap();
        b.set_prefix_bw(&p("10.0.1.0/24"), 550.0, 0.0).unwrap();
        b.set_prefix_bw(&p("10.0.2.0/24"), 200.0, 0.0).unwrap();
        b.set_sensor_load("g1-s", 0.8).unwrap();
        b.set_sensor_load("g2-s", 0.2).unwrap();

        // When: loads 0.8 / 0.2, the 250 bps prefix is worth (0.25 + 0.25) / 2
        let outcome = b.balance().unwrap();

        // Then
        assert_eq!(outcome, BalanceOutcome::Moved {
            prefix: p("10.0.0.0/24"),
            from: "g1".to_owned(),
            to: "g2".to_owned(),
        });
    }

    #[test]
    fn net_bytes_splits_when_no_move_fits() {
        let mut b = balancer(BalancerConfig::default(), &["g1", "g2"]);
        b.add_group_prefix("g1", p("10.0.0.0/24")).unwrap();
        b.add_group_prefix("g2", p("10.0.1.0/24")).unwrap();
        b.set_prefix_bw(&p("10.0.0.0/24"), 900.0, 0.0).unwrap();
        b.set_prefix_bw(&p("10.0.1.0/24"), 100.0, 0.0).unwrap();

        let outcome = b.balance().unwrap();
        assert_eq!(outcome, BalanceOutcome::Split {
            prefix: p("10.0.0.0/24"),
            into: (p("10.0.0.0/25"), p("10.0.0.128/25")),
        });
        assert_eq!(b.prefix_bw(&p("10.0.0.128/25")), Some(450.0));
    }

    #[test]
    fn net_bytes_excludes_group_that_cannot_be_relieved() {
        let mut b = balancer(BalancerConfig::default(), &["g1", "g2", "g3"]);
        b.add_group_prefix("g1", p("10.9.0.0/29")).unwrap();
        b.add_group_prefix("g2", p("10.0.0.0/24")).unwrap();
        b.add_group_prefix("g2", p("10.0.1.0/24")).unwrap();
        b.add_group_prefix("g3", p("10.0.2.0/24")).unwrap();
        b.set_prefix_bw(&p("10.9.0.0/29"), 700.0, 0.0).unwrap();
        b.set_prefix_bw(&p("10.0.0.0/24"), 150.0, 0.0).unwrap();
        b.set_prefix_bw(&p("10.0.1.0/24"), 50.0, 0.0).unwrap();
        b.set_prefix_bw(&p("10.0.2.0/24"), 100.0, 0.0).unwrap();

        let outcome = b.balance().unwrap();
        assert_eq!(outcome, BalanceOutcome::Split {
            prefix: p("10.0.0.0/24"),
            into: (p("10.0.0.0/25"), p("10.0.0.128/25")),
        });
        assert_eq!(b.group("g1").unwrap().prefixes(), &[p("10.9.0.0/29")]);
    }

    #[test]
    fn net_bytes_idle_below_minimum() {
        let mut b = balancer(BalancerConfig::default(), &["g1", "g2"]);
        b.add_group_prefix("g1", p("10.0.0.0/24")).unwrap();
        b.add_group_prefix("g2", p("10.0.1.0/24")).unwrap();
        assert_eq!(
            b.balance().unwrap(),
            BalanceOutcome::Idle {
                reason: "load below minimum threshold".to_owned()
            }
        );
    }

    #[test]
    fn sensor_load_mode_uses_reported_load() {
        let config = BalancerConfig {
            ignore_sensor_load: false,
            ignore_prefix_bw: true,
            ..BalancerConfig::default()
        };
        let mut b = balancer(config, &["g1", "g2"]);
        b.add_group_prefix("g1", p("10.0.0.0/25")).unwrap();
        b.add_group_prefix("g1", p("10.0.1.0/24")).unwrap();
        b.add_group_prefix("g2", p("10.0.2.0/24")).unwrap();
        b.set_sensor_load("g1-s", 0.9).unwrap();
        b.set_sensor_load("g2-s", 0.1).unwrap();

        // estimates: /24 = 256/384 * 0.9 = 0.6, /25 = 0.3
        let outcome = b.balance().unwrap();
        assert_eq!(outcome, BalanceOutcome::Moved {
            prefix: p("10.0.0.0/25"),
            from: "g1".to_owned(),
            to: "g2".to_owned(),
        });
    }
}
