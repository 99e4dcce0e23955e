//! Traffic port layout of a domain.

use scipass_core::config::{DomainConfig, PortRole};
use scipass_core::prefix::Prefix;
use scipass_core::types::PortId;

use crate::error::CoordinatorError;

/// A LAN port and the address space behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct LanPort {
    pub port: PortId,
    pub prefixes: Vec<Prefix>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortLayout {
    lans: Vec<LanPort>,
    wan: PortId,
    fw_lan: Option<PortId>,
    fw_wan: Option<PortId>,
}

impl PortLayout {
    pub fn new(lans: Vec<LanPort>, wan: PortId, fw_lan: Option<PortId>, fw_wan: Option<PortId>) -> Self {
        Self {
            lans,
            wan,
            fw_lan,
            fw_wan,
        }
    }

    /// Layout declared by a domain: its LAN ports in order, the WAN port and
    /// the firewall ports if any.
    pub fn from_domain(domain: &DomainConfig) -> Result<Self, CoordinatorError> {
        let wan = domain
            .ports_with_role(PortRole::Wan)
            .next()
            .map(|p| p.of_port_id)
            .ok_or_else(|| CoordinatorError::Layout(format!("domain '{}' has no wan port", domain.name)))?;
        let lans: Vec<LanPort> = domain
            .ports_with_role(PortRole::Lan)
            .map(|p| LanPort {
                port: p.of_port_id,
                prefixes: p.prefixes.clone(),
            })
            .collect();
        if lans.is_empty() {
            return Err(CoordinatorError::Layout(format!(
                "domain '{}' has no lan port",
                domain.name
            )));
        }
        Ok(Self {
            lans,
            wan,
            fw_lan: domain.ports_with_role(PortRole::FwLan).next().map(|p| p.of_port_id),
            fw_wan: domain.ports_with_role(PortRole::FwWan).next().map(|p| p.of_port_id),
        })
    }

    pub fn lans(&self) -> &[LanPort] {
        &self.lans
    }

    pub fn wan(&self) -> PortId {
        self.wan
    }

    pub fn fw_lan(&self) -> Option<PortId> {
        self.fw_lan
    }

    pub fn fw_wan(&self) -> Option<PortId> {
        self.fw_wan
    }

    pub fn lan_ports(&self) -> Vec<PortId> {
        self.lans.iter().map(|l| l.port).collect()
    }

    /// LAN port whose address space contains `prefix`.
    pub fn lan_for(&self, prefix: &Prefix) -> Option<PortId> {
        self.lans
            .iter()
            .find(|l| l.prefixes.iter().any(|p| p.contains(prefix)))
            .map(|l| l.port)
    }

    /// All address space behind the LAN ports.
    pub fn lan_prefixes(&self) -> Vec<Prefix> {
        self.lans
            .iter()
            .flat_map(|l| l.prefixes.iter().copied())
            .collect()
    }

    /// `true` for LAN, WAN and firewall ports.
    pub fn is_traffic_port(&self, port: PortId) -> bool {
        port == self.wan
            || self.fw_lan == Some(port)
            || self.fw_wan == Some(port)
            || self.lans.iter().any(|l| l.port == port)
    }
}
