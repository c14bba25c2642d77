//! Controller Registry: the single authoritative map from Transport ID to
//! live Controller, shared by the Reconciler (which adds/removes entries)
//! and the IPC server (which reads them for status queries).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::controller::{ControllerCommand, ControllerSnapshot};
use crate::tid::Tid;

/// A handle to a running Controller actor task: a command sender plus its
/// join handle, so the Registry can address the controller without owning
/// its state directly.
#[derive(Debug)]
pub struct ControllerHandle {
    pub tid: Tid,
    pub commands: mpsc::Sender<ControllerCommand>,
    pub task: tokio::task::JoinHandle<()>,
}

#[derive(Clone, Debug)]
pub struct Registry {
    controllers: Arc<RwLock<HashMap<Tid, Arc<ControllerHandle>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { controllers: Default::default() }
    }

    pub async fn insert(&self, handle: ControllerHandle) {
        let tid = handle.tid.clone();
        self.controllers.write().await.insert(tid, Arc::new(handle));
    }

    pub async fn remove(&self, tid: &Tid) -> Option<Arc<ControllerHandle>> {
        self.controllers.write().await.remove(tid)
    }

    pub async fn get(&self, tid: &Tid) -> Option<Arc<ControllerHandle>> {
        self.controllers.read().await.get(tid).cloned()
    }

    pub async fn contains(&self, tid: &Tid) -> bool {
        self.controllers.read().await.contains_key(tid)
    }

    pub async fn tids(&self) -> Vec<Tid> {
        self.controllers.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.controllers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all(&self) -> Vec<Arc<ControllerHandle>> {
        self.controllers.read().await.values().cloned().collect()
    }

    /// Broadcast a command to every registered controller, used for
    /// shutdown ("disconnect all") and config-reload propagation.
    pub async fn broadcast(&self, make_command: impl Fn() -> ControllerCommand) {
        for handle in self.all().await {
            let _ = handle.commands.send(make_command()).await;
        }
    }

    /// Query every controller for a status snapshot, used by `list_controllers`
    /// and `get_all_log_pages` IPC methods.
    pub async fn snapshot_all(&self) -> Vec<ControllerSnapshot> {
        let mut out = Vec::new();
        for handle in self.all().await {
            let (tx, rx) = tokio::sync::oneshot::channel();
            if handle.commands.send(ControllerCommand::Snapshot(tx)).await.is_ok() {
                if let Ok(snap) = rx.await {
                    out.push(snap);
                }
            }
        }
        out
    }

    /// Snapshot every controller together with its cached discovery log
    /// page, keyed by the snapshot's index in the returned vector. Used to
    /// build the LKC `Snapshot` on shutdown; empty for controllers that
    /// never cache a log page (IOCs).
    pub async fn snapshot_all_with_log_pages(&self) -> Vec<(ControllerSnapshot, Vec<crate::dlpe::Dlpe>)> {
        let mut out = Vec::new();
        for handle in self.all().await {
            let (tx, rx) = tokio::sync::oneshot::channel();
            if handle.commands.send(ControllerCommand::Snapshot(tx)).await.is_err() {
                continue;
            }
            let Ok(snap) = rx.await else { continue };

            let (log_tx, log_rx) = tokio::sync::oneshot::channel();
            let log_page = if handle.commands.send(ControllerCommand::GetLogPage(log_tx)).await.is_ok() {
                log_rx.await.unwrap_or_default()
            } else {
                Vec::new()
            };
            out.push((snap, log_page));
        }
        out
    }

    pub async fn trace_all(&self) {
        let tids = self.tids().await;
        debug!(count = tids.len(), "registry update");
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
