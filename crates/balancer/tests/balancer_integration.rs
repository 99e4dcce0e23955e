//! Balancer integration tests
//!
//! Drives a balancer built from the shipped example configuration through
//! placement, rebalancing, sensor failure and restart, checking the events
//! the handler sees along the way.

use scipass_balancer::{
    BalanceOutcome, Balancer, BalancerError, BalancerSnapshot, PrefixEventHandler, SensorGroup,
};
use scipass_core::config::{DomainConfig, ScipassConfig};
use scipass_core::prefix::Prefix;
use scipass_core::types::SwitchId;

const EXAMPLE: &str = include_str!("../../../scipass.toml.example");

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Added(String, Prefix, u32),
    Deleted(String, Prefix, u32),
    Moved(String, String, Prefix),
}

/// Records events and the last committed snapshot; can be told to run out
/// of flow budget.
#[derive(Default)]
struct RecordingHandler {
    seen: Vec<Seen>,
    last_commit: Option<BalancerSnapshot>,
    budget_exhausted: bool,
}

impl PrefixEventHandler for RecordingHandler {
    fn on_prefix_added(&mut self, group: &SensorGroup, prefix: &Prefix, priority: u32) -> Result<(), BalancerError> {
        if self.budget_exhausted {
            return Err(BalancerError::MaxFlowCount { max: 2000 });
        }
        self.seen
            .push(Seen::Added(group.id().to_owned(), *prefix, priority));
        Ok(())
    }

    fn on_prefix_deleted(&mut self, group: &SensorGroup, prefix: &Prefix, priority: u32) -> Result<(), BalancerError> {
        self.seen
            .push(Seen::Deleted(group.id().to_owned(), *prefix, priority));
        Ok(())
    }

    fn on_prefix_moved(
        &mut self,
        old: &SensorGroup,
        new: &SensorGroup,
        prefix: &Prefix,
        _priority: u32,
    ) -> Result<(), BalancerError> {
        if self.budget_exhausted {
            return Err(BalancerError::MaxFlowCount { max: 2000 });
        }
        self.seen.push(Seen::Moved(
            old.id().to_owned(),
            new.id().to_owned(),
            *prefix,
        ));
        Ok(())
    }

    fn on_committed(&mut self, snapshot: &BalancerSnapshot) {
        self.last_commit = Some(snapshot.clone());
    }
}

fn p(s: &str) -> Prefix {
    s.parse().unwrap()
}

fn example_domain() -> DomainConfig {
    let config = ScipassConfig::parse(EXAMPLE).expect("example parses");
    config
        .switch(SwitchId(1))
        .expect("switch declared")
        .domains[0]
        .clone()
}

fn placed_balancer() -> Balancer<RecordingHandler> {
    let domain = example_domain();
    let mut balancer =
        Balancer::from_domain(&domain, RecordingHandler::default()).expect("groups build");
    let placed = balancer
        .distribute(&domain.lan_prefixes())
        .expect("example prefixes fit");
    assert_eq!(placed, 5);
    balancer.mark_initialized();
    balancer
}

#[test]
fn example_prefixes_land_one_per_group_in_order() {
    // Given: the example domain with four sensor groups
    // When: its LAN prefixes are distributed
    let balancer = placed_balancer();

    // Then: each group takes one /24 and the v6 block wraps to group1
    let expected = [
        ("10.0.17.0/24", "group1", 500),
        ("10.0.18.0/24", "group2", 600),
        ("10.0.19.0/24", "group3", 700),
        ("10.0.20.0/24", "group4", 800),
        ("2001:db8::/48", "group1", 900),
    ];
    for (prefix, group, priority) in expected {
        let prefix = p(prefix);
        assert_eq!(balancer.prefix_group(&prefix).unwrap().id(), group);
        assert_eq!(balancer.priority_of(&prefix).unwrap().priority, priority);
    }
    assert_eq!(balancer.handler().seen.len(), 5);
    assert!(balancer.handler().last_commit.is_some());
}

#[test]
fn hot_prefix_is_split_then_moved() {
    let mut balancer = placed_balancer();
    balancer
        .set_prefix_bw(&p("10.0.17.0/24"), 40_000_000.0, 0.0)
        .unwrap();
    for other in ["10.0.18.0/24", "10.0.19.0/24", "10.0.20.0/24"] {
        balancer.set_prefix_bw(&p(other), 1_000_000.0, 0.0).unwrap();
    }

    // the only hot prefix carries the whole group, so it is split first
    let first = balancer.balance().unwrap();
    assert!(matches!(first, BalanceOutcome::Split { prefix, .. } if prefix == p("10.0.17.0/24")));
    let seen = &balancer.handler().seen;
    assert!(matches!(&seen[seen.len() - 3], Seen::Added(_, prefix, 500) if *prefix == p("10.0.17.0/25")));
    assert!(matches!(&seen[seen.len() - 2], Seen::Added(_, prefix, 550) if *prefix == p("10.0.17.128/25")));
    assert!(matches!(&seen[seen.len() - 1], Seen::Deleted(_, prefix, 500) if *prefix == p("10.0.17.0/24")));

    // further passes keep splitting until a piece fits on an idle group
    let mut moved = None;
    for _ in 0..5 {
        if let BalanceOutcome::Moved { prefix, from, to } = balancer.balance().unwrap() {
            assert_eq!(from, "group1");
            assert_eq!(to, "group2");
            moved = Some(prefix);
            break;
        }
    }
    let moved = moved.expect("a piece of the hot prefix moves");
    assert!(p("10.0.17.0/24").contains(&moved));

    let committed = balancer.handler().last_commit.clone().unwrap();
    assert_eq!(committed, balancer.snapshot());
}

#[test]
fn sensor_failure_moves_prefixes_off_the_group() {
    let mut balancer = placed_balancer();
    let changed = balancer.set_sensor_status("s3", false).unwrap();
    assert!(changed);
    assert!(balancer.group("group2").unwrap().prefixes().is_empty());
    assert!(balancer
        .handler()
        .seen
        .iter()
        .any(|s| matches!(s, Seen::Moved(from, _, prefix) if from == "group2" && *prefix == p("10.0.18.0/24"))));

    // restoring the sensor brings the group back without moving anything
    let before = balancer.handler().seen.len();
    assert!(balancer.set_sensor_status("s3", true).unwrap());
    assert_eq!(balancer.handler().seen.len(), before);
}

#[test]
fn exhausted_flow_budget_leaves_assignment_intact() {
    let mut balancer = placed_balancer();
    let before = balancer.snapshot();
    balancer.handler_mut().budget_exhausted = true;

    let err = balancer
        .move_group_prefix("group1", "group2", &p("10.0.17.0/24"))
        .unwrap_err();
    assert!(matches!(err, BalancerError::MaxFlowCount { .. }));
    assert_eq!(balancer.snapshot(), before);
}

#[test]
fn restart_restores_split_state() {
    let mut first = placed_balancer();
    first.split_group_prefix(&p("10.0.18.0/24")).unwrap();
    let saved = first.handler().last_commit.clone().unwrap();
    let json = serde_json::to_string(&saved).unwrap();

    // a new process reads the state back
    let domain = example_domain();
    let restored: BalancerSnapshot = serde_json::from_str(&json).unwrap();
    let mut second = Balancer::from_domain(&domain, RecordingHandler::default()).unwrap();
    let summary = second.restore(&restored, &domain.lan_prefixes()).unwrap();

    assert!(summary.dropped.is_empty());
    assert!(summary.distributed.is_empty());
    assert_eq!(summary.kept.len(), 6);
    assert_eq!(second.snapshot(), first.snapshot());
}

#[test]
fn restart_with_shrunk_config_drops_stale_prefixes() {
    let first = placed_balancer();
    let saved = first.snapshot();

    let mut domain = example_domain();
    domain.ports[1].prefixes = vec![p("10.0.19.0/24")];
    let mut second = Balancer::from_domain(&domain, RecordingHandler::default()).unwrap();
    let summary = second.restore(&saved, &domain.lan_prefixes()).unwrap();

    let mut dropped = summary.dropped.clone();
    dropped.sort();
    assert_eq!(dropped, vec![p("10.0.20.0/24"), p("2001:db8::/48")]);
    assert_eq!(second.prefix_count(), 3);
}
