//! Balancer event contract.
//!
//! The balancer reports every assignment change to a [`PrefixEventHandler`]
//! given at construction. The forwarding-state coordinator implements it to
//! turn assignments into switch rules.
//!
//! # Ordering
//! - add: the handler runs first; the prefix is inserted only if it succeeds
//! - delete: the prefix is removed first, then the handler runs; on failure
//!   the prefix is put back
//! - move: the prefix changes group, then the handler runs; on failure it
//!   moves back
//!
//! A failing handler must leave no partial rule state behind.

use crate::error::BalancerError;
use crate::group::SensorGroup;
use crate::snapshot::BalancerSnapshot;
use scipass_core::prefix::Prefix;

pub trait PrefixEventHandler: Send {
    fn on_prefix_added(
        &mut self,
        group: &SensorGroup,
        prefix: &Prefix,
        priority: u32,
    ) -> Result<(), BalancerError>;

    fn on_prefix_deleted(
        &mut self,
        group: &SensorGroup,
        prefix: &Prefix,
        priority: u32,
    ) -> Result<(), BalancerError>;

    fn on_prefix_moved(
        &mut self,
        old: &SensorGroup,
        new: &SensorGroup,
        prefix: &Prefix,
        priority: u32,
    ) -> Result<(), BalancerError>;

    /// Called after each committed mutation once initialization is done.
    fn on_committed(&mut self, _snapshot: &BalancerSnapshot) {}
}

/// Handler that accepts everything, for a balancer without a switch.
impl PrefixEventHandler for () {
    fn on_prefix_added(&mut self, _: &SensorGroup, _: &Prefix, _: u32) -> Result<(), BalancerError> {
        Ok(())
    }

    fn on_prefix_deleted(
        &mut self,
        _: &SensorGroup,
        _: &Prefix,
        _: u32,
    ) -> Result<(), BalancerError> {
        Ok(())
    }

    fn on_prefix_moved(
        &mut self,
        _: &SensorGroup,
        _: &SensorGroup,
        _: &Prefix,
        _: u32,
    ) -> Result<(), BalancerError> {
        Ok(())
    }
}
