//! Idle/hard expiry bookkeeping for installed rules.
//!
//! The switch is never trusted to expire rules on its own. Every installed
//! rule with a non-zero timeout gets a record here; flow-stats batches push
//! idle deadlines forward while the packet counter moves, and
//! [`TimeoutTable::take_expired`] hands back rules whose deadline passed so
//! the caller can issue exact deletes.
//!
//! Time is always passed in, so tests drive it with a paused tokio clock.

use std::time::Duration;

use tokio::time::Instant;

use scipass_core::types::{FlowMatch, FlowStatEntry, ForwardingRule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Refreshed whenever the rule's packet counter changes
    Idle,
    /// Fixed deadline from install
    Hard,
}

impl TimeoutKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Hard => "hard",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutRecord {
    pub rule: ForwardingRule,
    pub kind: TimeoutKind,
    pub expires_at: Instant,
    pub last_packet_count: u64,
}

impl TimeoutRecord {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Default)]
pub struct TimeoutTable {
    records: Vec<TimeoutRecord>,
}

impl TimeoutTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `rule`. A rule with both timeouts gets two records;
    /// whichever expires first removes the rule.
    pub fn track(&mut self, rule: &ForwardingRule, now: Instant) {
        self.forget(&rule.flow_match, rule.priority);
        if rule.idle_timeout > 0 {
            self.records.push(TimeoutRecord {
                rule: rule.clone(),
                kind: TimeoutKind::Idle,
                expires_at: now + Duration::from_secs(u64::from(rule.idle_timeout)),
                last_packet_count: 0,
            });
        }
        if rule.hard_timeout > 0 {
            self.records.push(TimeoutRecord {
                rule: rule.clone(),
                kind: TimeoutKind::Hard,
                expires_at: now + Duration::from_secs(u64::from(rule.hard_timeout)),
                last_packet_count: 0,
            });
        }
    }

    /// Applies a stats batch. Returns how many idle records were refreshed.
    pub fn refresh(&mut self, entries: &[FlowStatEntry], now: Instant) -> usize {
        let mut refreshed = 0;
        for entry in entries {
            for record in self.records.iter_mut().filter(|r| {
                r.kind == TimeoutKind::Idle && r.rule.same_entry(&entry.flow_match, entry.priority)
            }) {
                if entry.packet_count != record.last_packet_count {
                    record.last_packet_count = entry.packet_count;
                    record.expires_at =
                        now + Duration::from_secs(u64::from(record.rule.idle_timeout));
                    refreshed += 1;
                }
            }
        }
        refreshed
    }

    /// Removes and returns every rule past its deadline, each once.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(ForwardingRule, TimeoutKind)> {
        let mut expired: Vec<(ForwardingRule, TimeoutKind)> = Vec::new();
        for record in self.records.iter().filter(|r| r.is_expired(now)) {
            if !expired
                .iter()
                .any(|(rule, _)| rule.same_entry(&record.rule.flow_match, record.rule.priority))
            {
                expired.push((record.rule.clone(), record.kind));
            }
        }
        self.records.retain(|r| {
            !expired
                .iter()
                .any(|(rule, _)| rule.same_entry(&r.rule.flow_match, r.rule.priority))
        });
        expired
    }

    /// Drops every record for this entry. Returns `true` if any existed.
    pub fn forget(&mut self, flow_match: &FlowMatch, priority: u32) -> bool {
        let before = self.records.len();
        self.records
            .retain(|r| !r.rule.same_entry(flow_match, priority));
        self.records.len() != before
    }

    pub fn records(&self) -> &[TimeoutRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
