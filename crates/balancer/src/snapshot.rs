//! Serializable view of a balancer's assignment.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use scipass_core::prefix::Prefix;

use crate::priority::PriorityAllocation;

/// Prefixes assigned to one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub prefixes: Vec<Prefix>,
}

/// Group membership, flat prefix list and priority bands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalancerSnapshot {
    pub groups: BTreeMap<String, GroupSnapshot>,
    pub prefixes: Vec<Prefix>,
    pub priorities: BTreeMap<Prefix, PriorityAllocation>,
}

impl BalancerSnapshot {
    /// Group holding `prefix` in this snapshot.
    pub fn group_of(&self, prefix: &Prefix) -> Option<&str> {
        self.groups
            .iter()
            .find(|(_, g)| g.prefixes.contains(prefix))
            .map(|(id, _)| id.as_str())
    }
}

/// Parts of `prefix` not covered by any of `kept`.
///
/// `kept` is assumed non-overlapping. The result is the minimal set of
/// prefixes that, together with the kept ones inside `prefix`, tiles it.
pub fn uncovered(prefix: Prefix, kept: &[Prefix]) -> Vec<Prefix> {
    if kept.iter().any(|k| k.contains(&prefix)) {
        return Vec::new();
    }
    if !kept.iter().any(|k| prefix.contains(k)) {
        return vec![prefix];
    }
    match prefix.split() {
        Some((left, right)) => {
            let mut out = uncovered(left, kept);
            out.extend(uncovered(right, kept));
            out
        }
        None => Vec::new(),
    }
}
