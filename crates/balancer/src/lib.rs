#![doc = include_str!("../README.md")]
//!
//! # Module Structure
//!
//! - [`error`]: Balancer refusals (`BalancerError`)
//! - [`config`]: Thresholds and bounds (`BalancerConfig`, `BalanceMode`)
//! - [`group`]: Sensors and sensor groups (`Sensor`, `SensorGroup`)
//! - [`priority`]: Rule priority bands (`PriorityTable`, `PriorityAllocation`)
//! - [`handler`]: Change notification contract (`PrefixEventHandler`)
//! - [`snapshot`]: Persistable assignment (`BalancerSnapshot`)
//! - [`balancer`]: The assignment and its mutations (`Balancer`)
//! - [`strategy`]: Rebalancing passes (`BalanceOutcome`)
//!
//! # Architecture
//!
//! ```text
//! bandwidth / sensor load ──> Balancer ──balance()──> move | split | merge
//!                                │
//!                      PrefixEventHandler (rule install/remove)
//!                                │
//!                      on_committed(snapshot) ──> persistence
//! ```

pub mod balancer;
pub mod config;
pub mod error;
pub mod group;
pub mod handler;
pub mod priority;
pub mod snapshot;
pub mod strategy;

// --- Public API Re-exports ---

pub use balancer::{Balancer, RestoreSummary};
pub use config::{BalanceMode, BalancerConfig};
pub use error::BalancerError;
pub use group::{Sensor, SensorGroup};
pub use handler::PrefixEventHandler;
pub use priority::{PriorityAllocation, PriorityTable};
pub use snapshot::{BalancerSnapshot, GroupSnapshot, uncovered};
pub use strategy::BalanceOutcome;
