//! Reconciler: the component that turns a "desired set" of Transport IDs
//! (from config, mDNS, NBFT, or discovery log pages) into the Registry's
//! actual set of live Controllers.
//!
//! Desired-set updates are coalesced behind a soak timer - bursts of
//! mDNS/udev events within `CONF_STABILITY_SOAK_TIME_SEC` collapse into a
//! single reconciliation pass, the same debounce the original applies to
//! config/mDNS churn before acting on it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::{Config, ControllerOverlay, ExcludeEntry};
use crate::controller::{ControllerActor, ControllerCommand, ReferralUpdate};
use crate::fabric::{ConnectArgs, FabricDriver};
use crate::identity::Identity;
use crate::registry::{ControllerHandle, Registry};
use crate::tid::Tid;
use crate::udev_bridge::ControllerKind;

pub const CONF_STABILITY_SOAK_TIME_SEC: f64 = 1.5;

pub struct Reconciler {
    registry: Registry,
    fabric: Arc<dyn FabricDriver>,
    kind: ControllerKind,
    /// Connect-argument template applied to every spawned controller:
    /// host identity plus the config file's `[Global]`/connection-tuning
    /// defaults (queue sizes, digests, kato, ...).
    base_args: ConnectArgs,
    /// Per-Tid overrides of `base_args`, sourced from `[Controllers]`
    /// `controller=` lines that set a field explicitly (e.g. a
    /// per-controller `dhchap-secret`).
    overlays: Mutex<HashMap<Tid, ControllerOverlay>>,
    /// Exclusion filter applied uniformly to every desired-set source
    /// (static config, mDNS, NBFT, discovery log pages) during
    /// reconciliation - not just to one source ahead of time, so a
    /// controller excluded mid-run is torn down on the next soak pass.
    exclude: Mutex<Vec<ExcludeEntry>>,
    desired: Mutex<HashSet<Tid>>,
    /// Discovery Controllers discovered via another DC's referral entries,
    /// keyed by the referring DC's own Tid so a stale referring controller's
    /// contribution can be dropped wholesale. Only ever populated when
    /// `kind == ControllerKind::Discovery` - the Connector has no use for
    /// referral propagation, Discovery Controllers are a Finder concept.
    referral_desired: Mutex<HashMap<Tid, Vec<Tid>>>,
    notify: Notify,
    /// Receives TIDs whose controller actor has fully torn itself down, so
    /// the Reconciler can drop it from the Registry without reentering the
    /// controller's own call stack.
    final_disconnect_tx: mpsc::Sender<Tid>,
    /// Forwarded to every spawned Discovery Controller actor so its
    /// referral entries feed back into `referral_desired`. `None` for a
    /// Connector reconciler.
    referral_tx: Option<mpsc::Sender<ReferralUpdate>>,
    /// I/O-Controller-only `connect-attempts-on-ncc` policy, stamped onto
    /// every controller this reconciler spawns.
    connect_attempts_on_ncc: u32,
    /// Discovery-Controller-only `zeroconf-connections-persistence`; `None`
    /// means "never reap" (a negative config value).
    zeroconf_persistence: Option<Duration>,
    /// Discovery-Controller-only `[Global] pleo`, stamped onto every
    /// controller this reconciler spawns.
    pleo_enabled: bool,
    /// Tids that are part of the *current* mDNS-sourced slice of the
    /// desired set, as last reported by `set_mdns_hint`. Used only at the
    /// moment a controller is spawned, to stamp its origin - not consulted
    /// afterwards, since origin is a property of the Controller Entity
    /// fixed at creation, not something mDNS re-derives every pass.
    mdns_hint: Mutex<HashSet<Tid>>,
    /// Origin of every controller this reconciler currently knows about:
    /// `true` if it was spawned while its Tid was in `mdns_hint`
    /// ("discovered"), `false` otherwise ("configured"/referral). Only the
    /// unresponsive-reaper reads this; it doesn't affect reconciliation.
    controller_origin: Mutex<HashMap<Tid, bool>>,
    /// Pending reap deadlines for "discovered"-origin DCs that dropped out
    /// of the desired set while still kernel-connected.
    reaper_deadlines: Mutex<HashMap<Tid, tokio::time::Instant>>,
    /// Discovered-origin DCs currently within their zeroconf persistence
    /// grace period: kept alive by `reconcile_once` as if still desired,
    /// even though mDNS stopped re-advertising them.
    protected: Mutex<HashSet<Tid>>,
}

impl Reconciler {
    pub fn new(registry: Registry, fabric: Arc<dyn FabricDriver>, kind: ControllerKind) -> Arc<Self> {
        Self::with_base_args(registry, fabric, kind, ConnectArgs::default(), 0, None, true)
    }

    /// Same as `new`, but binds connect arguments to the given host
    /// identity (`hostnqn`/`hostid`) instead of the unset default.
    pub fn with_identity(
        registry: Registry,
        fabric: Arc<dyn FabricDriver>,
        kind: ControllerKind,
        identity: Identity,
    ) -> Arc<Self> {
        Self::with_base_args(
            registry,
            fabric,
            kind,
            ConnectArgs {
                hostnqn: identity.hostnqn,
                hostid: identity.hostid,
                dhchap_key: identity.hostkey,
                ..Default::default()
            },
            0,
            None,
            true,
        )
    }

    /// Same as `with_identity`, additionally folding in the daemon's
    /// loaded `[Global]`/connection-tuning config defaults (queue sizes,
    /// digests, kato, reconnect/ctrl-loss timeouts) plus the
    /// `connect-attempts-on-ncc` / `zeroconf-connections-persistence`
    /// policies.
    pub fn with_config(
        registry: Registry,
        fabric: Arc<dyn FabricDriver>,
        kind: ControllerKind,
        identity: Identity,
        config: &Config,
    ) -> Arc<Self> {
        let zeroconf_persistence =
            if config.zeroconf_persistence_sec < 0.0 { None } else { Some(Duration::from_secs_f64(config.zeroconf_persistence_sec)) };
        Self::with_base_args(
            registry,
            fabric,
            kind,
            ConnectArgs {
                hostnqn: identity.hostnqn,
                hostid: identity.hostid,
                dhchap_key: identity.hostkey,
                queue_size: config.queue_size,
                nr_io_queues: config.nr_io_queues,
                nr_write_queues: config.nr_write_queues,
                nr_poll_queues: config.nr_poll_queues,
                kato: config.kato,
                reconnect_delay: config.reconnect_delay,
                ctrl_loss_tmo: config.ctrl_loss_tmo,
                hdr_digest: config.hdr_digest,
                data_digest: config.data_digest,
                disable_sqflow: config.disable_sqflow,
                ..Default::default()
            },
            config.connect_attempts_on_ncc,
            zeroconf_persistence,
            config.pleo_enabled,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn with_base_args(
        registry: Registry,
        fabric: Arc<dyn FabricDriver>,
        kind: ControllerKind,
        base_args: ConnectArgs,
        connect_attempts_on_ncc: u32,
        zeroconf_persistence: Option<Duration>,
        pleo_enabled: bool,
    ) -> Arc<Self> {
        let (final_disconnect_tx, mut final_disconnect_rx) = mpsc::channel(64);
        let mut referral_rx = None;
        let referral_tx = if kind == ControllerKind::Discovery {
            let (tx, rx) = mpsc::channel::<ReferralUpdate>(64);
            referral_rx = Some(rx);
            Some(tx)
        } else {
            None
        };

        let reconciler = Arc::new(Self {
            registry: registry.clone(),
            fabric,
            kind,
            base_args,
            overlays: Mutex::new(HashMap::new()),
            exclude: Mutex::new(Vec::new()),
            desired: Mutex::new(HashSet::new()),
            referral_desired: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            final_disconnect_tx,
            referral_tx,
            connect_attempts_on_ncc,
            zeroconf_persistence,
            pleo_enabled,
            mdns_hint: Mutex::new(HashSet::new()),
            controller_origin: Mutex::new(HashMap::new()),
            reaper_deadlines: Mutex::new(HashMap::new()),
            protected: Mutex::new(HashSet::new()),
        });

        // Drain final-disconnect notifications and remove the corresponding
        // registry entry; this is the channel-based replacement for the
        // original's deferred idle-loop callback.
        let _ = registry;
        let reconciler_for_drain = reconciler.clone();
        tokio::spawn(async move {
            while let Some(tid) = final_disconnect_rx.recv().await {
                reconciler_for_drain.registry.remove(&tid).await;
                reconciler_for_drain.controller_origin.lock().await.remove(&tid);
                reconciler_for_drain.reaper_deadlines.lock().await.remove(&tid);
                debug!(tid = %tid, "controller fully disconnected, removed from registry");
            }
        });

        if let Some(mut rx) = referral_rx {
            let reconciler_for_referrals = reconciler.clone();
            tokio::spawn(async move {
                while let Some(update) = rx.recv().await {
                    let mut referral_desired = reconciler_for_referrals.referral_desired.lock().await;
                    if update.referrals.is_empty() {
                        referral_desired.remove(&update.origin);
                    } else {
                        referral_desired.insert(update.origin, update.referrals);
                    }
                    drop(referral_desired);
                    reconciler_for_referrals.notify.notify_one();
                }
            });
        }

        let soak = reconciler.clone();
        tokio::spawn(async move {
            soak.soak_loop().await;
        });

        let reaper = reconciler.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(500));
            loop {
                tick.tick().await;
                reaper.reap_once().await;
            }
        });

        reconciler
    }

    /// Merge `tids` into the desired set coming from one particular source
    /// (config file, mDNS, NBFT, discovery log page) and arm the soak timer.
    /// Callers pass the *complete* current desired set from their source;
    /// the Reconciler doesn't track per-source partitioning itself.
    pub async fn set_desired(&self, tids: Vec<Tid>) {
        let mut desired = self.desired.lock().await;
        *desired = tids.into_iter().collect();
        drop(desired);
        self.notify.notify_one();
    }

    /// Register per-controller connect-argument overrides (digests, queue
    /// sizes, DH-HMAC-CHAP secrets, ...) sourced from `[Controllers]`
    /// `controller=` lines. Does not itself change the desired set; call
    /// alongside `set_desired` when seeding from static config.
    pub async fn set_overlays(&self, entries: Vec<ControllerOverlay>) {
        let mut overlays = self.overlays.lock().await;
        overlays.clear();
        for entry in entries {
            let tid = Tid::new(
                entry.transport.clone(),
                entry.traddr.clone(),
                entry.trsvcid.clone(),
                entry.subsysnqn.clone(),
                entry.host_traddr.clone(),
                entry.host_iface.clone(),
            );
            overlays.insert(tid, entry);
        }
    }

    /// Install the exclusion filter (`[Controllers] exclude=`/`blacklist=`
    /// entries), applied to every source feeding the desired set. Does not
    /// itself trigger reconciliation; call alongside `set_desired`.
    pub async fn set_exclude(&self, entries: Vec<ExcludeEntry>) {
        *self.exclude.lock().await = entries;
    }

    async fn soak_loop(self: Arc<Self>) {
        loop {
            self.notify.notified().await;
            // Coalesce further triggers that land inside the soak window.
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs_f64(CONF_STABILITY_SOAK_TIME_SEC)) => break,
                    _ = self.notify.notified() => continue,
                }
            }
            self.reconcile_once().await;
        }
    }

    async fn reconcile_once(&self) {
        let exclude = self.exclude.lock().await.clone();
        let mut raw: HashSet<Tid> = self.desired.lock().await.iter().cloned().collect();
        raw.extend(self.referral_desired.lock().await.values().flatten().cloned());
        let raw = resolve_hostnames(raw).await;
        let mut desired: HashSet<Tid> = raw
            .into_iter()
            .filter(|tid| {
                !exclude
                    .iter()
                    .any(|e| e.matches(&tid.transport, &tid.traddr, &tid.trsvcid, &tid.host_iface, &tid.subsysnqn))
            })
            .collect();
        // Discovered-origin DCs within their zeroconf persistence grace
        // period stay up even though mDNS stopped re-advertising them; the
        // reaper alone decides when their protection lapses.
        desired.extend(self.protected.lock().await.iter().cloned());
        let actual: HashSet<Tid> = self.registry.tids().await.into_iter().collect();

        let to_add: Vec<&Tid> = desired.difference(&actual).collect();
        let to_remove: Vec<&Tid> = actual.difference(&desired).collect();

        for tid in &to_add {
            self.spawn_controller((*tid).clone()).await;
        }
        for tid in &to_remove {
            if let Some(handle) = self.registry.get(tid).await {
                let _ = handle.commands.send(ControllerCommand::Disconnect).await;
            }
        }

        info!(added = to_add.len(), removed = to_remove.len(), total = desired.len(), "reconciled");
    }

    /// Looks for a kernel device already bound to `tid`, so a freshly
    /// spawned actor can adopt it instead of dialing a redundant `connect`.
    /// Enumeration hits sysfs, so it runs on a blocking thread; any udev
    /// error (or no match) is treated as "nothing to adopt".
    async fn find_existing_device(&self, tid: &Tid) -> Option<String> {
        let tid = tid.clone();
        let kind = self.kind;
        tokio::task::spawn_blocking(move || crate::udev_bridge::find_device_for_tid(&tid, kind))
            .await
            .ok()
            .and_then(|res| res.ok())
            .flatten()
    }

    async fn spawn_controller(&self, tid: Tid) {
        if self.registry.contains(&tid).await {
            return;
        }
        let mut args = ConnectArgs {
            transport: tid.transport.clone(),
            traddr: tid.traddr.clone(),
            trsvcid: tid.trsvcid.clone(),
            subsysnqn: tid.subsysnqn.clone(),
            host_traddr: tid.host_traddr.clone(),
            host_iface: tid.host_iface.clone(),
            ..self.base_args.clone()
        };
        if let Some(overlay) = self.overlays.lock().await.get(&tid) {
            apply_overlay(&mut args, overlay);
        }
        let is_discovered = self.mdns_hint.lock().await.contains(&tid);
        let adopt = self.find_existing_device(&tid).await;
        let (commands, task) = ControllerActor::spawn_with_policy(
            tid.clone(),
            self.kind,
            self.fabric.clone(),
            args,
            Some(self.final_disconnect_tx.clone()),
            self.referral_tx.clone(),
            self.connect_attempts_on_ncc,
            self.pleo_enabled,
            adopt,
        );
        self.controller_origin.lock().await.insert(tid.clone(), is_discovered);
        self.registry.insert(ControllerHandle { tid, commands, task }).await;
    }

    /// Replace the current mDNS-sourced slice of the desired set. Consulted
    /// only at spawn time (see `controller_origin`'s doc comment) - called
    /// by the Finder right before `set_desired` whenever its mDNS-tracked
    /// Discovery Controller set changes.
    pub async fn set_mdns_hint(&self, tids: Vec<Tid>) {
        *self.mdns_hint.lock().await = tids.into_iter().collect();
    }

    /// One pass of the unresponsive-DC reaper: a "discovered"-origin
    /// Discovery Controller that has dropped out of the desired set (mDNS
    /// stopped re-advertising it) but is still kernel-connected is kept in
    /// `protected` - and so alive by `reconcile_once` - for
    /// `zeroconf_persistence`, either to get rediscovered or to time out
    /// and fall back to normal reconciliation. `None` persistence means
    /// never protect a dropped DC this way.
    async fn reap_once(&self) {
        let exclude = self.exclude.lock().await.clone();
        let mut raw: HashSet<Tid> = self.desired.lock().await.iter().cloned().collect();
        raw.extend(self.referral_desired.lock().await.values().flatten().cloned());
        let desired: HashSet<Tid> = raw
            .into_iter()
            .filter(|tid| {
                !exclude
                    .iter()
                    .any(|e| e.matches(&tid.transport, &tid.traddr, &tid.trsvcid, &tid.host_iface, &tid.subsysnqn))
            })
            .collect();

        let candidates: Vec<Tid> = self
            .controller_origin
            .lock()
            .await
            .iter()
            .filter(|(_, &discovered)| discovered)
            .map(|(tid, _)| tid.clone())
            .collect();

        let mut reconcile_needed = false;
        for tid in candidates {
            if desired.contains(&tid) {
                self.reaper_deadlines.lock().await.remove(&tid);
                if self.protected.lock().await.remove(&tid) {
                    reconcile_needed = true;
                }
                continue;
            }

            let Some(persistence) = self.zeroconf_persistence else {
                self.reaper_deadlines.lock().await.remove(&tid);
                if self.protected.lock().await.remove(&tid) {
                    reconcile_needed = true;
                }
                continue;
            };

            let Some(handle) = self.registry.get(&tid).await else {
                self.reaper_deadlines.lock().await.remove(&tid);
                self.protected.lock().await.remove(&tid);
                continue;
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            if handle.commands.send(ControllerCommand::Snapshot(reply_tx)).await.is_err() {
                continue;
            }
            let Ok(snap) = reply_rx.await else { continue };
            if snap.state != "connected" {
                // A DC that isn't even kernel-connected has no persistence
                // to honor; let normal reconciliation remove it immediately.
                self.reaper_deadlines.lock().await.remove(&tid);
                if self.protected.lock().await.remove(&tid) {
                    reconcile_needed = true;
                }
                continue;
            }

            let now = tokio::time::Instant::now();
            let deadline = {
                let mut deadlines = self.reaper_deadlines.lock().await;
                *deadlines.entry(tid.clone()).or_insert(now + persistence)
            };
            if now >= deadline {
                self.reaper_deadlines.lock().await.remove(&tid);
                if self.protected.lock().await.remove(&tid) {
                    reconcile_needed = true;
                }
                info!(tid = %tid, "unresponsive Discovery Controller exceeded zeroconf persistence, disconnecting");
            } else if self.protected.lock().await.insert(tid.clone()) {
                reconcile_needed = true;
            }
        }

        if reconcile_needed {
            self.notify.notify_one();
        }
    }

    /// Tell every live controller to disconnect and wait until the Registry
    /// has drained to zero, used by the daemon's shutdown sequence.
    pub async fn disconnect_all_and_wait(&self, timeout: Duration) {
        self.registry.broadcast(|| ControllerCommand::Shutdown).await;
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.registry.is_empty().await {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Resolve the `traddr` of every Tid in `raw` to a numeric address, in
/// parallel. A Tid whose `traddr` is already numeric is returned unchanged
/// without a lookup; a resolution failure keeps the original string and
/// logs once, matching the original's "best-effort, never blocks on a bad
/// hostname" policy.
async fn resolve_hostnames(raw: HashSet<Tid>) -> HashSet<Tid> {
    let tasks: Vec<_> = raw
        .into_iter()
        .map(|tid| {
            tokio::spawn(async move {
                let traddr = resolve_traddr(&tid.traddr).await;
                Tid { traddr, ..tid }
            })
        })
        .collect();

    let mut resolved = HashSet::with_capacity(tasks.len());
    for task in tasks {
        if let Ok(tid) = task.await {
            resolved.insert(tid);
        }
    }
    resolved
}

/// Resolve a single `traddr` to a numeric address via the system resolver.
/// Addresses that already parse as an IP are returned as-is without a
/// lookup.
async fn resolve_traddr(traddr: &str) -> String {
    if traddr.parse::<std::net::IpAddr>().is_ok() {
        return traddr.to_string();
    }
    match tokio::net::lookup_host((traddr, 0)).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr.ip().to_string(),
            None => traddr.to_string(),
        },
        Err(e) => {
            warn!(traddr, error = %e, "failed to resolve hostname, keeping original value");
            traddr.to_string()
        }
    }
}

/// Apply a per-controller config overlay on top of an already-built
/// `ConnectArgs`, overriding only the fields the overlay actually sets.
fn apply_overlay(args: &mut ConnectArgs, overlay: &ControllerOverlay) {
    if !overlay.host_nqn.is_empty() {
        args.hostnqn = overlay.host_nqn.clone();
    }
    if let Some(ref v) = overlay.dhchap_secret {
        args.dhchap_key = Some(v.clone());
    }
    if let Some(ref v) = overlay.dhchap_ctrl_secret {
        args.dhchap_ctrl_key = Some(v.clone());
    }
    if let Some(v) = overlay.hdr_digest {
        args.hdr_digest = v;
    }
    if let Some(v) = overlay.data_digest {
        args.data_digest = v;
    }
    if overlay.nr_io_queues.is_some() {
        args.nr_io_queues = overlay.nr_io_queues;
    }
    if overlay.nr_write_queues.is_some() {
        args.nr_write_queues = overlay.nr_write_queues;
    }
    if overlay.nr_poll_queues.is_some() {
        args.nr_poll_queues = overlay.nr_poll_queues;
    }
    if overlay.queue_size.is_some() {
        args.queue_size = overlay.queue_size;
    }
    if overlay.kato.is_some() {
        args.kato = overlay.kato;
    }
    if overlay.reconnect_delay.is_some() {
        args.reconnect_delay = overlay.reconnect_delay;
    }
    if overlay.ctrl_loss_tmo.is_some() {
        args.ctrl_loss_tmo = overlay.ctrl_loss_tmo;
    }
    if overlay.disable_sqflow.is_some() {
        args.disable_sqflow = overlay.disable_sqflow;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::FakeFabric;

    fn tid(n: u8) -> Tid {
        Tid::new("tcp", format!("10.0.0.{}", n), "8009", "nqn.test", "", "")
    }

    #[tokio::test]
    async fn adds_and_removes_controllers_to_match_desired_set() {
        let registry = Registry::new();
        let fabric: Arc<dyn FabricDriver> = Arc::new(FakeFabric::new());
        let reconciler = Reconciler::new(registry.clone(), fabric, ControllerKind::Discovery);

        reconciler.set_desired(vec![tid(1), tid(2)]).await;
        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert_eq!(registry.len().await, 2);

        reconciler.set_desired(vec![tid(2)]).await;
        tokio::time::sleep(Duration::from_millis(1700)).await;
        // tid(1) was asked to disconnect; give its actor a moment to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.contains(&tid(2)).await);
    }

    #[tokio::test]
    async fn bursty_updates_within_soak_window_collapse_to_one_pass() {
        let registry = Registry::new();
        let fabric: Arc<dyn FabricDriver> = Arc::new(FakeFabric::new());
        let reconciler = Reconciler::new(registry.clone(), fabric, ControllerKind::Discovery);

        for n in 1..=3 {
            reconciler.set_desired(vec![tid(n)]).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert_eq!(registry.len().await, 1);
        assert!(registry.contains(&tid(3)).await);
    }

    #[test]
    fn overlay_overrides_only_fields_it_sets() {
        let mut args = ConnectArgs {
            hostnqn: "nqn.global-host".into(),
            queue_size: Some(128),
            hdr_digest: false,
            ..Default::default()
        };
        let overlay = ControllerOverlay {
            transport: "tcp".into(),
            traddr: "10.0.0.1".into(),
            trsvcid: "8009".into(),
            subsysnqn: "nqn.test".into(),
            host_traddr: String::new(),
            host_iface: String::new(),
            host_nqn: String::new(),
            dhchap_secret: Some("secret123".into()),
            dhchap_ctrl_secret: None,
            hdr_digest: Some(true),
            data_digest: None,
            nr_io_queues: None,
            nr_write_queues: None,
            nr_poll_queues: None,
            queue_size: None,
            kato: None,
            reconnect_delay: None,
            ctrl_loss_tmo: None,
            disable_sqflow: None,
        };
        apply_overlay(&mut args, &overlay);
        // Overlay set these.
        assert_eq!(args.dhchap_key.as_deref(), Some("secret123"));
        assert!(args.hdr_digest);
        // Overlay left these unset, so the base value survives.
        assert_eq!(args.hostnqn, "nqn.global-host");
        assert_eq!(args.queue_size, Some(128));
    }

    #[tokio::test]
    async fn excluded_tid_is_never_spawned_and_is_torn_down_if_already_live() {
        let registry = Registry::new();
        let fabric: Arc<dyn FabricDriver> = Arc::new(FakeFabric::new());
        let reconciler = Reconciler::new(registry.clone(), fabric, ControllerKind::Discovery);

        reconciler.set_desired(vec![tid(1), tid(2)]).await;
        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert_eq!(registry.len().await, 2);

        reconciler
            .set_exclude(vec![crate::config::ExcludeEntry {
                transport: None,
                traddr: Some("10.0.0.1".into()),
                trsvcid: None,
                host_iface: None,
                subsysnqn: None,
            }])
            .await;
        reconciler.notify.notify_one();
        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(!registry.contains(&tid(1)).await);
        assert!(registry.contains(&tid(2)).await);
    }

    #[tokio::test]
    async fn referral_entry_spawns_a_new_discovery_controller() {
        let registry = Registry::new();
        let fabric = Arc::new(FakeFabric::new());
        // First controller spawned gets device "nvme0" (FakeFabric assigns
        // sequentially), so its referral fires before it ever connects.
        fabric.set_log_page(
            "nvme0",
            vec![crate::dlpe::Dlpe {
                trtype: "tcp".into(),
                adrfam: "ipv4".into(),
                subtype: "referral".into(),
                treq: "not specified".into(),
                portid: 1,
                trsvcid: "8009".into(),
                subnqn: crate::tid::WELL_KNOWN_DISC_NQN.into(),
                traddr: "10.0.0.99".into(),
                eflags: 0,
                cntlid: 0,
                asqsz: 0,
            }],
        );
        let reconciler = Reconciler::new(registry.clone(), fabric as Arc<dyn FabricDriver>, ControllerKind::Discovery);

        reconciler.set_desired(vec![tid(1)]).await;
        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert!(registry.contains(&tid(1)).await);

        // The referral triggers a second soak pass that spawns the referred DC.
        tokio::time::sleep(Duration::from_millis(1700)).await;
        let referred = Tid::new("tcp", "10.0.0.99", "8009", crate::tid::WELL_KNOWN_DISC_NQN, "", "");
        assert!(registry.contains(&referred).await);
    }

    #[tokio::test]
    async fn static_controller_overlay_merges_into_spawned_connect_args() {
        let registry = Registry::new();
        let fabric = Arc::new(FakeFabric::new());
        let reconciler = Reconciler::new(registry.clone(), fabric, ControllerKind::Io);

        let overlay = ControllerOverlay {
            transport: "tcp".into(),
            traddr: "10.0.0.1".into(),
            trsvcid: "8009".into(),
            subsysnqn: "nqn.test".into(),
            host_traddr: String::new(),
            host_iface: String::new(),
            host_nqn: String::new(),
            dhchap_secret: Some("s3cr3t".into()),
            dhchap_ctrl_secret: None,
            hdr_digest: None,
            data_digest: None,
            nr_io_queues: None,
            nr_write_queues: None,
            nr_poll_queues: None,
            queue_size: None,
            kato: None,
            reconnect_delay: None,
            ctrl_loss_tmo: None,
            disable_sqflow: None,
        };
        reconciler.set_overlays(vec![overlay]).await;
        reconciler.set_desired(vec![tid(1)]).await;
        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert!(registry.contains(&tid(1)).await);
    }

    #[tokio::test]
    async fn discovered_controller_dropped_from_desired_set_is_reaped_after_persistence() {
        let registry = Registry::new();
        let fabric: Arc<dyn FabricDriver> = Arc::new(FakeFabric::new());
        let reconciler = Reconciler::with_base_args(
            registry.clone(),
            fabric,
            ControllerKind::Discovery,
            ConnectArgs::default(),
            0,
            Some(Duration::from_millis(3000)),
            true,
        );

        reconciler.set_mdns_hint(vec![tid(1)]).await;
        reconciler.set_desired(vec![tid(1)]).await;
        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert!(registry.contains(&tid(1)).await);

        // mDNS stops re-advertising it, but it's still kernel-connected.
        reconciler.set_mdns_hint(vec![]).await;
        reconciler.set_desired(vec![]).await;
        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert!(registry.contains(&tid(1)).await, "still within zeroconf persistence window");

        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert!(!registry.contains(&tid(1)).await, "reaper should disconnect after persistence elapses");
    }

    #[tokio::test]
    async fn rediscovery_before_persistence_elapses_cancels_the_reap() {
        let registry = Registry::new();
        let fabric: Arc<dyn FabricDriver> = Arc::new(FakeFabric::new());
        let reconciler = Reconciler::with_base_args(
            registry.clone(),
            fabric,
            ControllerKind::Discovery,
            ConnectArgs::default(),
            0,
            Some(Duration::from_millis(2000)),
            true,
        );

        reconciler.set_mdns_hint(vec![tid(1)]).await;
        reconciler.set_desired(vec![tid(1)]).await;
        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert!(registry.contains(&tid(1)).await);

        reconciler.set_mdns_hint(vec![]).await;
        reconciler.set_desired(vec![]).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Rediscovered well before the persistence window closes.
        reconciler.set_mdns_hint(vec![tid(1)]).await;
        reconciler.set_desired(vec![tid(1)]).await;
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(registry.contains(&tid(1)).await, "rediscovery should have cancelled the pending reap");
    }
}
