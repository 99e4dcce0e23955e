//! Durable balancer snapshots.
//!
//! One JSON file per (switch, domain) under the state directory, rewritten
//! whole after every committed mutation:
//!
//! ```json
//! {"switch": {"0000000000000001": {"domain": {"R&E": {"mode": {"SciDMZ": { ... }}}}}}}
//! ```
//!
//! Writes go to a temporary file in the same directory which is then
//! renamed over the old one, so a crash never leaves a torn snapshot.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use metrics::counter;
use serde_json::{Value, json};
use tracing::{debug, warn};

use scipass_balancer::BalancerSnapshot;
use scipass_core::metrics as m;
use scipass_core::types::{SwitchId, TopologyMode};

use crate::error::CoordinatorError;

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<state_dir>/<dpid><domain>.json`
    pub fn path_for(&self, switch: SwitchId, domain: &str) -> PathBuf {
        self.dir.join(format!("{switch}{domain}.json"))
    }

    pub fn save(
        &self,
        switch: SwitchId,
        domain: &str,
        mode: TopologyMode,
        snapshot: &BalancerSnapshot,
    ) -> Result<(), CoordinatorError> {
        let body = serde_json::to_value(snapshot).map_err(persistence_err)?;
        let doc = json!({
            "switch": {
                switch.to_string(): {
                    "domain": {
                        domain: {
                            "mode": { mode.to_string(): body }
                        }
                    }
                }
            }
        });
        let bytes = serde_json::to_vec_pretty(&doc).map_err(persistence_err)?;

        fs::create_dir_all(&self.dir).map_err(persistence_err)?;
        let path = self.path_for(switch, domain);
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(persistence_err)?;
            file.write_all(&bytes).map_err(persistence_err)?;
            file.sync_all().map_err(persistence_err)?;
        }
        fs::rename(&tmp, &path).map_err(persistence_err)?;

        counter!(m::SNAPSHOT_WRITES_TOTAL).increment(1);
        debug!(%switch, domain, path = %path.display(), "snapshot written");
        Ok(())
    }

    /// Reads the snapshot saved for this (switch, domain, mode).
    ///
    /// `Ok(None)` when there is no file or it holds another mode's state.
    pub fn load(
        &self,
        switch: SwitchId,
        domain: &str,
        mode: TopologyMode,
    ) -> Result<Option<BalancerSnapshot>, CoordinatorError> {
        let path = self.path_for(switch, domain);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(persistence_err(e)),
        };
        let doc: Value = serde_json::from_slice(&bytes).map_err(persistence_err)?;
        let Some(body) = doc
            .get("switch")
            .and_then(|v| v.get(switch.to_string()))
            .and_then(|v| v.get("domain"))
            .and_then(|v| v.get(domain))
            .and_then(|v| v.get("mode"))
            .and_then(|v| v.get(mode.to_string()))
        else {
            warn!(%switch, domain, %mode, path = %path.display(), "saved state does not match domain, ignoring");
            return Ok(None);
        };
        let snapshot = serde_json::from_value(body.clone()).map_err(persistence_err)?;
        Ok(Some(snapshot))
    }

    pub fn remove(&self, switch: SwitchId, domain: &str) -> Result<(), CoordinatorError> {
        match fs::remove_file(self.path_for(switch, domain)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persistence_err(e)),
        }
    }
}

fn persistence_err(e: impl std::fmt::Display) -> CoordinatorError {
    CoordinatorError::Persistence(e.to_string())
}
