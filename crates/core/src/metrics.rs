//! Metric names and descriptions.
//!
//! Every Prometheus metric the workspace emits is named here so the
//! components and the daemon agree on spelling. Components call
//! `metrics::counter!()` / `gauge!()` / `histogram!()` with these constants.
//!
//! Naming: prefix `scipass_`, suffix `_total` for counters, `_seconds` for
//! durations, none for gauges.

// ─── label keys ─────────────────────────────────────────────────────

/// Balancer error kind (max_prefix_length, max_prefix_count, ...)
pub const LABEL_KIND: &str = "kind";

/// Signal verdict (good, bad)
pub const LABEL_VERDICT: &str = "verdict";

/// Rebalance strategy (ip_space, net_bytes, load_and_bandwidth)
pub const LABEL_STRATEGY: &str = "strategy";

// ─── coordinator ────────────────────────────────────────────────────

/// Install commands emitted (counter)
pub const RULES_INSTALLED_TOTAL: &str = "scipass_rules_installed_total";

/// Exact-delete commands emitted (counter)
pub const RULES_REMOVED_TOTAL: &str = "scipass_rules_removed_total";

/// Commands dropped because the transport channel was full or closed (counter)
pub const RULE_COMMANDS_DROPPED_TOTAL: &str = "scipass_rule_commands_dropped_total";

/// Good/bad flow signals applied (counter, label: verdict)
pub const SIGNALS_TOTAL: &str = "scipass_signals_total";

/// Rules expired by the timeout engine (counter)
pub const FLOW_TIMEOUTS_TOTAL: &str = "scipass_flow_timeouts_total";

/// Snapshot files written (counter)
pub const SNAPSHOT_WRITES_TOTAL: &str = "scipass_snapshot_writes_total";

/// Switches currently joined (gauge)
pub const CONNECTED_SWITCHES: &str = "scipass_connected_switches";

// ─── balancer ───────────────────────────────────────────────────────

/// Prefix moves between sensor groups (counter)
pub const BALANCER_MOVES_TOTAL: &str = "scipass_balancer_moves_total";

/// Prefix splits (counter)
pub const BALANCER_SPLITS_TOTAL: &str = "scipass_balancer_splits_total";

/// Prefix merges (counter)
pub const BALANCER_MERGES_TOTAL: &str = "scipass_balancer_merges_total";

/// Refused balancer mutations (counter, label: kind)
pub const BALANCER_ERRORS_TOTAL: &str = "scipass_balancer_errors_total";

/// Time spent in one rebalance pass over all domains (histogram)
pub const REBALANCE_DURATION_SECONDS: &str = "scipass_rebalance_duration_seconds";

// ─── daemon ─────────────────────────────────────────────────────────

/// Daemon uptime (gauge, seconds)
pub const DAEMON_UPTIME_SECONDS: &str = "scipass_daemon_uptime_seconds";

// ─── buckets ────────────────────────────────────────────────────────

/// Rebalance duration buckets, 100us to 1s.
pub const REBALANCE_DURATION_BUCKETS: [f64; 8] =
    [0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 1.0];

// ─── descriptions ───────────────────────────────────────────────────

/// Registers HELP text for every metric.
///
/// Call once, after the global recorder is installed.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_counter!(RULES_INSTALLED_TOTAL, "Forwarding rules sent for install");
    describe_counter!(
        RULES_REMOVED_TOTAL,
        "Forwarding rules sent for exact-match delete"
    );
    describe_counter!(
        RULE_COMMANDS_DROPPED_TOTAL,
        "Switch commands dropped because the transport queue was full or closed"
    );
    describe_counter!(SIGNALS_TOTAL, "Good/bad flow signals applied, by verdict");
    describe_counter!(FLOW_TIMEOUTS_TOTAL, "Rules removed by idle or hard timeout");
    describe_counter!(SNAPSHOT_WRITES_TOTAL, "Balancer state snapshots written");
    describe_gauge!(CONNECTED_SWITCHES, "Switches currently joined");

    describe_counter!(BALANCER_MOVES_TOTAL, "Prefixes moved between sensor groups");
    describe_counter!(BALANCER_SPLITS_TOTAL, "Prefixes split into two halves");
    describe_counter!(BALANCER_MERGES_TOTAL, "Sibling prefixes merged into their parent");
    describe_counter!(
        BALANCER_ERRORS_TOTAL,
        "Balancer mutations refused, by error kind"
    );
    describe_histogram!(
        REBALANCE_DURATION_SECONDS,
        "Time spent rebalancing all domains in one tick"
    );

    describe_gauge!(DAEMON_UPTIME_SECONDS, "Daemon uptime in seconds");
}
