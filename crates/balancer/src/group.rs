//! Sensors and sensor groups.

use serde::Serialize;

use scipass_core::prefix::Prefix;
use scipass_core::types::PortId;

/// An inspection endpoint reached through an output port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub id: String,
    pub port: PortId,
    pub enabled: bool,
    /// Externally reported load, 0.0..=1.0
    pub load: f64,
}

/// Sensors balanced as one unit, and the prefixes assigned to them.
#[derive(Debug, Clone, Serialize)]
pub struct SensorGroup {
    id: String,
    description: String,
    sensors: Vec<Sensor>,
    prefixes: Vec<Prefix>,
}

impl SensorGroup {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            sensors: Vec::new(),
            prefixes: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    /// Assigned prefixes in assignment order.
    pub fn prefixes(&self) -> &[Prefix] {
        &self.prefixes
    }

    /// Up iff every member sensor is enabled.
    pub fn is_up(&self) -> bool {
        self.sensors.iter().all(|s| s.enabled)
    }

    /// Highest load reported by any member.
    pub fn load(&self) -> f64 {
        self.sensors.iter().map(|s| s.load).fold(0.0, f64::max)
    }

    /// Output ports of the member sensors, in declaration order.
    pub fn output_ports(&self) -> Vec<PortId> {
        self.sensors.iter().map(|s| s.port).collect()
    }

    pub fn holds(&self, prefix: &Prefix) -> bool {
        self.prefixes.contains(prefix)
    }

    /// Sum of host units of the assigned prefixes.
    pub fn host_units(&self) -> f64 {
        self.prefixes.iter().map(Prefix::host_units).sum()
    }

    pub(crate) fn push_sensor(&mut self, sensor: Sensor) {
        self.sensors.push(sensor);
    }

    pub(crate) fn sensor_mut(&mut self, id: &str) -> Option<&mut Sensor> {
        self.sensors.iter_mut().find(|s| s.id == id)
    }

    pub(crate) fn position(&self, prefix: &Prefix) -> Option<usize> {
        self.prefixes.iter().position(|p| p == prefix)
    }

    pub(crate) fn insert_prefix(&mut self, index: usize, prefix: Prefix) {
        let index = index.min(self.prefixes.len());
        self.prefixes.insert(index, prefix);
    }

    pub(crate) fn push_prefix(&mut self, prefix: Prefix) {
        self.prefixes.push(prefix);
    }

    pub(crate) fn remove_prefix_at(&mut self, index: usize) -> Prefix {
        self.prefixes.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor(id: &str, port: PortId, enabled: bool, load: f64) -> Sensor {
        Sensor {
            id: id.to_owned(),
            port,
            enabled,
            load,
        }
    }

    #[test]
    fn group_is_up_only_when_all_sensors_enabled() {
        let mut group = SensorGroup::new("group1", "");
        group.push_sensor(sensor("s1", 27, true, 0.0));
        group.push_sensor(sensor("s2", 26, true, 0.0));
        assert!(group.is_up());
        group.sensor_mut("s2").unwrap().enabled = false;
        assert!(!group.is_up());
    }

    #[test]
    fn group_load_is_max_of_members() {
        let mut group = SensorGroup::new("group1", "");
        group.push_sensor(sensor("s1", 27, true, 0.25));
        group.push_sensor(sensor("s2", 26, true, 0.75));
        assert_eq!(group.load(), 0.75);
        assert_eq!(group.output_ports(), vec![27, 26]);
    }

    #[test]
    fn prefix_bookkeeping() {
        let mut group = SensorGroup::new("group1", "");
        let a: Prefix = "10.0.0.0/24".parse().unwrap();
        let b: Prefix = "10.0.1.0/25".parse().unwrap();
        group.push_prefix(a);
        group.push_prefix(b);
        assert_eq!(group.host_units(), 384.0);
        assert_eq!(group.position(&b), Some(1));
        assert_eq!(group.remove_prefix_at(0), a);
        group.insert_prefix(5, a);
        assert_eq!(group.prefixes(), &[b, a]);
    }
}
