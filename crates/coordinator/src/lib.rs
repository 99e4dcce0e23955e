#![doc = include_str!("../README.md")]
//!
//! # Module Structure
//!
//! - [`error`]: Coordinator errors (`CoordinatorError`)
//! - [`config`]: Intervals, channels and persistence (`CoordinatorConfig`)
//! - [`ports`]: Traffic port layout of a domain (`PortLayout`)
//! - [`policy`]: Baseline and per-prefix rules per mode (`TopologyPolicy`)
//! - [`flows`]: Flow registry and rule emission (`FlowRegistry`, `RuleEmitter`)
//! - [`signal`]: Good/bad-flow descriptors and registries (`FlowSignal`)
//! - [`timeout`]: Idle/hard expiry tracking (`TimeoutTable`)
//! - [`stats`]: Bandwidth from flow counters (`BandwidthEstimator`)
//! - [`persistence`]: Snapshot files (`StateStore`)
//! - [`domain`]: Balancer plus forwarding state of one domain (`Domain`)
//! - [`controller`]: Switch registry and operations (`Controller`)
//! - [`service`]: Event, stats and rebalance loops (`ControlPlane`)
//!
//! # Architecture
//!
//! ```text
//! transport ──ControlEvent──> ControlPlane ──> Controller
//!                                                  │
//!                                    Domain ── Balancer<DomainRules>
//!                                      │              │
//!                              TimeoutTable     TopologyPolicy
//!                                                     │
//! transport <──CommandEvent── RuleEmitter <── FlowRegistry
//!                                                     │
//!                                              StateStore (json)
//! ```

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod flows;
pub mod persistence;
pub mod policy;
pub mod ports;
pub mod service;
pub mod signal;
pub mod stats;
pub mod timeout;

// --- Public API Re-exports ---

pub use config::CoordinatorConfig;
pub use controller::{Controller, GroupStatus};
pub use domain::{Domain, DomainRules, PrefixInfo};
pub use error::CoordinatorError;
pub use flows::{FlowRegistry, RuleEmitter};
pub use persistence::StateStore;
pub use policy::TopologyPolicy;
pub use ports::{LanPort, PortLayout};
pub use service::{ControlPlane, ControlPlaneBuilder};
pub use signal::{FlowSignal, SignalOutcome, SignaledFlow, Verdict};
pub use stats::{BandwidthEstimator, BandwidthSample};
pub use timeout::{TimeoutKind, TimeoutTable};
