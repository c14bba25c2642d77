//! Last-Known-Configuration snapshot store. Persists the set of known
//! controller TIDs (and, for stafd, their cached discovery log pages) to a
//! binary file under `$RUNTIME_DIRECTORY`, so a restart can reconnect
//! without waiting for a fresh discovery round.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::dlpe::Dlpe;
use crate::error::{self, LkcError};
use crate::tid::Tid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedTid {
    pub transport: String,
    pub traddr: String,
    pub trsvcid: String,
    pub subsysnqn: String,
    pub host_traddr: String,
    pub host_iface: String,
}

impl From<&Tid> for PersistedTid {
    fn from(t: &Tid) -> Self {
        Self {
            transport: t.transport.clone(),
            traddr: t.traddr.clone(),
            trsvcid: t.trsvcid.clone(),
            subsysnqn: t.subsysnqn.clone(),
            host_traddr: t.host_traddr.clone(),
            host_iface: t.host_iface.clone(),
        }
    }
}

impl From<&PersistedTid> for Tid {
    fn from(p: &PersistedTid) -> Self {
        Tid::new(
            p.transport.clone(),
            p.traddr.clone(),
            p.trsvcid.clone(),
            p.subsysnqn.clone(),
            p.host_traddr.clone(),
            p.host_iface.clone(),
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub controllers: Vec<PersistedTid>,
    /// Discovery log pages cached per Discovery Controller TID, keyed by
    /// index into `controllers`. Empty for stacd, which has no log pages
    /// of its own to persist.
    pub log_pages: Vec<(usize, Vec<Dlpe>)>,
}

pub struct LkcStore {
    path: PathBuf,
}

impl LkcStore {
    /// `runtime_directory` should be `$RUNTIME_DIRECTORY` when systemd set
    /// it, otherwise `/run/<prog_name>`.
    pub fn new(runtime_directory: impl AsRef<Path>) -> Self {
        Self {
            path: runtime_directory.as_ref().join("last-known-config.bin"),
        }
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<(), LkcError> {
        if snapshot.controllers.is_empty() {
            // Truncate rather than leave a stale snapshot around.
            return std::fs::write(&self.path, []).context(error::WriteSnafu {
                path: self.path.to_string_lossy().into_owned(),
            });
        }
        let bytes = bincode::serialize(snapshot).context(error::EncodeSnafu)?;
        std::fs::write(&self.path, bytes).context(error::WriteSnafu {
            path: self.path.to_string_lossy().into_owned(),
        })
    }

    pub fn load(&self) -> Result<Snapshot, LkcError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Snapshot::default()),
            Err(e) => {
                return Err(LkcError::Read {
                    path: self.path.to_string_lossy().into_owned(),
                    source: e,
                })
            }
        };
        if bytes.is_empty() {
            return Ok(Snapshot::default());
        }
        bincode::deserialize(&bytes).context(error::DecodeSnafu {
            path: self.path.to_string_lossy().into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let dir = std::env::temp_dir().join(format!("stas-core-lkc-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = LkcStore::new(&dir);

        let tid = Tid::new("tcp", "10.0.0.1", "8009", "nqn.test", "", "");
        let snapshot = Snapshot {
            controllers: vec![PersistedTid::from(&tid)],
            log_pages: vec![],
        };
        store.save(&snapshot).unwrap();
        let reloaded = store.load().unwrap();
        assert_eq!(reloaded, snapshot);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn empty_registry_truncates_file() {
        let dir = std::env::temp_dir().join(format!("stas-core-lkc-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = LkcStore::new(&dir);

        let tid = Tid::new("tcp", "10.0.0.1", "8009", "nqn.test", "", "");
        store
            .save(&Snapshot { controllers: vec![PersistedTid::from(&tid)], log_pages: vec![] })
            .unwrap();
        store.save(&Snapshot::default()).unwrap();
        let reloaded = store.load().unwrap();
        assert!(reloaded.controllers.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }
}
