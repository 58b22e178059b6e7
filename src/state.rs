//! Durable state snapshot
//!
//! The snapshot is a JSON document holding the port range and the
//! configuration of every occupied port:
//!
//! ```json
//! {"port_range":[10000,10100],"state":[{"name":"alice","port":10000,...}]}
//! ```
//!
//! It is read once at startup (a missing or malformed file is fatal) and
//! rewritten after every create and delete. Writes go to a temporary file in
//! the same directory which is then renamed over the target.

use crate::error::SupervisorError;
use crate::instance::Instance;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// `[min, max)` bounds of the managed ports
    pub port_range: [u16; 2],
    /// Occupied ports only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state: Vec<Instance>,
}

impl Snapshot {
    pub fn empty(min: u16, max: u16) -> Self {
        Self {
            port_range: [min, max],
            state: Vec::new(),
        }
    }

    pub fn range_min(&self) -> u16 {
        self.port_range[0]
    }

    pub fn range_max(&self) -> u16 {
        self.port_range[1]
    }

    /// Structural checks beyond what the JSON schema enforces
    pub fn validate(&self) -> Result<(), String> {
        let (min, max) = (self.range_min(), self.range_max());
        if min >= max {
            return Err(format!("empty port range {}..{}", min, max));
        }

        let mut ports = HashSet::new();
        let mut names = HashSet::new();
        for instance in &self.state {
            if instance.name.is_empty() {
                return Err(format!("instance on port {} has no name", instance.port));
            }
            if !(min..max).contains(&instance.port) {
                return Err(format!(
                    "{}: port {} is outside range {}..{}",
                    instance.name, instance.port, min, max
                ));
            }
            if !ports.insert(instance.port) {
                return Err(format!("port {} is used more than once", instance.port));
            }
            if !names.insert(instance.name.as_str()) {
                return Err(format!("name '{}' is used more than once", instance.name));
            }
        }

        Ok(())
    }
}

/// Read and validate the snapshot at `path`
pub fn load(path: &Path) -> Result<Snapshot, SupervisorError> {
    let content = std::fs::read_to_string(path).map_err(|source| SupervisorError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let snapshot: Snapshot =
        serde_json::from_str(&content).map_err(|e| SupervisorError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    snapshot.validate().map_err(|reason| SupervisorError::Parse {
        path: path.to_path_buf(),
        reason,
    })?;

    Ok(snapshot)
}

/// Atomically replace the snapshot at `path`
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<(), SupervisorError> {
    let io_err = |source| SupervisorError::Io {
        path: path.to_path_buf(),
        source,
    };

    let content = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| io_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    // Created with mode 0600: the snapshot contains passphrases
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(&content).map_err(io_err)?;
    tmp.write_all(b"\n").map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;

    debug!(path = %path.display(), instances = snapshot.state.len(), "State saved");
    Ok(())
}
