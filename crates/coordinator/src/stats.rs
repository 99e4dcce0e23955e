//! Bandwidth estimation from flow counters.
//!
//! Each stats batch is folded into per-prefix byte totals: entries whose
//! source is exactly the prefix count as transmit, entries whose
//! destination is the prefix count as receive. The rate is the byte delta
//! against the previous batch over the elapsed time. The first batch for a
//! switch only sets the baseline.

use std::collections::HashMap;

use tokio::time::Instant;

use scipass_core::prefix::Prefix;
use scipass_core::types::{FlowStatEntry, SwitchId};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthSample {
    pub prefix: Prefix,
    pub tx_bps: f64,
    pub rx_bps: f64,
}

#[derive(Debug, Default)]
struct SwitchCounters {
    at: Option<Instant>,
    bytes: HashMap<Prefix, (u64, u64)>,
}

#[derive(Debug, Default)]
pub struct BandwidthEstimator {
    switches: HashMap<SwitchId, SwitchCounters>,
}

impl BandwidthEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one batch in and returns rates for `prefixes`.
    pub fn sample(
        &mut self,
        switch: SwitchId,
        prefixes: &[Prefix],
        entries: &[FlowStatEntry],
        now: Instant,
    ) -> Vec<BandwidthSample> {
        let counters = self.switches.entry(switch).or_default();
        let elapsed = counters
            .at
            .map(|at| now.saturating_duration_since(at).as_secs_f64());
        counters.at = Some(now);

        let mut samples = Vec::with_capacity(prefixes.len());
        for prefix in prefixes {
            let (tx, rx) = byte_totals(prefix, entries);
            let previous = counters.bytes.insert(*prefix, (tx, rx));
            let (Some(elapsed), Some((prev_tx, prev_rx))) = (elapsed, previous) else {
                continue;
            };
            samples.push(BandwidthSample {
                prefix: *prefix,
                tx_bps: rate(prev_tx, tx, elapsed),
                rx_bps: rate(prev_rx, rx, elapsed),
            });
        }
        counters.bytes.retain(|p, _| prefixes.contains(p));
        samples
    }

    pub fn forget(&mut self, switch: SwitchId) {
        self.switches.remove(&switch);
    }
}

fn byte_totals(prefix: &Prefix, entries: &[FlowStatEntry]) -> (u64, u64) {
    entries.iter().fold((0u64, 0u64), |(tx, rx), e| {
        let tx = if e.flow_match.src.as_ref() == Some(prefix) {
            tx.saturating_add(e.byte_count)
        } else {
            tx
        };
        let rx = if e.flow_match.dst.as_ref() == Some(prefix) {
            rx.saturating_add(e.byte_count)
        } else {
            rx
        };
        (tx, rx)
    })
}

/// Bits per second; a counter that went backwards counts as no traffic.
fn rate(previous: u64, current: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    current.saturating_sub(previous) as f64 * 8.0 / elapsed_secs
}
