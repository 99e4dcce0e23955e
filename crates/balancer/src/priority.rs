//! Rule priority bands.
//!
//! Each root prefix gets a band of [`ROOT_STEP`] priorities starting at
//! [`ROOT_BASE`]. A split hands the two halves of the parent's band to the
//! children; a merge joins them again.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use scipass_core::prefix::Prefix;

/// First root band.
pub const ROOT_BASE: u32 = 500;
/// Width of a root band.
pub const ROOT_STEP: u32 = 100;

/// Priority of one prefix and the size of the band it may subdivide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityAllocation {
    pub priority: u32,
    pub budget: u32,
}

impl PriorityAllocation {
    /// Bands for the two halves of a split.
    pub fn split(self) -> (Self, Self) {
        let half = self.budget / 2;
        (
            Self {
                priority: self.priority,
                budget: half,
            },
            Self {
                priority: self.priority + half,
                budget: self.budget - half,
            },
        )
    }

    /// Band of a merged parent.
    pub fn merge(self, other: Self) -> Self {
        Self {
            priority: self.priority.min(other.priority),
            budget: self.budget + other.budget,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PriorityTable {
    next_root: u32,
    allocations: HashMap<Prefix, PriorityAllocation>,
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self {
            next_root: ROOT_BASE,
            allocations: HashMap::new(),
        }
    }
}

impl PriorityTable {
    pub fn get(&self, prefix: &Prefix) -> Option<PriorityAllocation> {
        self.allocations.get(prefix).copied()
    }

    /// Hands out the next root band.
    pub fn allocate_root(&mut self) -> PriorityAllocation {
        let alloc = PriorityAllocation {
            priority: self.next_root,
            budget: ROOT_STEP,
        };
        self.next_root += ROOT_STEP;
        alloc
    }

    /// Returns an unused root band so the next root reuses it.
    pub fn return_root(&mut self, alloc: PriorityAllocation) {
        if alloc.budget == ROOT_STEP && alloc.priority + ROOT_STEP == self.next_root {
            self.next_root = alloc.priority;
        }
    }

    pub fn assign(&mut self, prefix: Prefix, alloc: PriorityAllocation) {
        self.allocations.insert(prefix, alloc);
        self.next_root = self.next_root.max(alloc.priority + alloc.budget);
    }

    pub fn release(&mut self, prefix: &Prefix) -> Option<PriorityAllocation> {
        self.allocations.remove(prefix)
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Ordered copy for snapshots.
    pub fn to_map(&self) -> BTreeMap<Prefix, PriorityAllocation> {
        self.allocations.iter().map(|(p, a)| (*p, *a)).collect()
    }
}
