//! Per-controller state machine. Each Controller is spawned as its own
//! task and owns all of its state; callers only ever reach it by sending a
//! `ControllerCommand` over its channel - this is the async-Rust expression
//! of the "single writer per resource" invariant.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::dlpe::Dlpe;
use crate::fabric::{ConnectArgs, FabricDriver, RegistrationOutcome};
use crate::tid::Tid;
use crate::udev_bridge::{ControllerKind, UdevAction, UdevEvent};

/// Initial reconnection backoff while a controller has never connected
/// successfully yet.
pub const FAST_CONNECT_RETRY_PERIOD_SEC: u64 = 3;
/// Steady-state reconnection backoff once a controller has connected at
/// least once before.
pub const CONNECT_RETRY_PERIOD_SEC: u64 = 60;
/// Retry interval for a failed discovery-log-page retrieval.
pub const GET_LOG_PAGE_RETRY_PERIOD_SEC: u64 = 20;
/// Retry interval for a failed registration (AER subscription) attempt.
pub const REGISTRATION_RETRY_PERIOD_SEC: u64 = 5;
/// Retry interval for a failed "get supported log pages" probe.
pub const GET_SUPPORTED_RETRY_PERIOD_SEC: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// What a pending retry timer will do when it fires. Each phase has its own
/// backoff, so a Discovery Controller stuck retrying registration doesn't
/// get conflated with one retrying the discovery-log-page fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingRetry {
    Connect,
    Register,
    QuerySupported,
    FetchLogPage,
}

/// Emitted by a Discovery Controller actor whenever its log page is
/// (re-)fetched, carrying the referral subset of that page - entries that
/// point at other Discovery Controllers rather than I/O Controllers. The
/// Reconciler folds these into its desired set as additional Discovery
/// Controllers to track, the Finder-side counterpart of how nvm-subtype
/// entries become the Connector's I/O Controller desired set.
#[derive(Debug, Clone)]
pub struct ReferralUpdate {
    pub origin: Tid,
    pub referrals: Vec<Tid>,
}

#[derive(Debug)]
pub enum ControllerCommand {
    Connect,
    Disconnect,
    Udev(UdevEvent),
    /// A DLP_CHANGED AEN fired for this controller; re-fetch its log page.
    LogPageChanged,
    Snapshot(oneshot::Sender<ControllerSnapshot>),
    /// Return the last discovery log page retrieved for this controller
    /// (only meaningful for Discovery Controllers).
    GetLogPage(oneshot::Sender<Vec<Dlpe>>),
    /// An I/O Controller's DLPE was refreshed elsewhere (the Finder polled a
    /// new discovery log page); carries the fresh NCC bit so this actor's
    /// reconnect policy can react to it without fetching its own log page.
    DlpeUpdate { ncc: bool },
    Shutdown,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ControllerSnapshot {
    pub transport: String,
    pub traddr: String,
    pub trsvcid: String,
    pub subsysnqn: String,
    pub host_traddr: String,
    pub host_iface: String,
    pub device: Option<String>,
    pub state: String,
    pub connect_attempts: u32,
}

impl ControllerState {
    fn as_str(self) -> &'static str {
        match self {
            ControllerState::Disconnected => "disconnected",
            ControllerState::Connecting => "connecting",
            ControllerState::Connected => "connected",
            ControllerState::Disconnecting => "disconnecting",
        }
    }
}

pub struct ControllerActor {
    tid: Tid,
    kind: ControllerKind,
    fabric: Arc<dyn FabricDriver>,
    connect_args: ConnectArgs,
    commands: mpsc::Receiver<ControllerCommand>,
    state: ControllerState,
    device: Option<String>,
    connect_attempts: u32,
    last_log_page: Vec<Dlpe>,
    /// Notified when this controller finally disconnects, so the
    /// Reconciler/Registry can remove it without the controller reaching
    /// back into their stack frame.
    on_final_disconnect: Option<mpsc::Sender<Tid>>,
    /// Only set for Discovery Controllers: forwards the referral subset of
    /// every freshly fetched log page to the Reconciler.
    referral_tx: Option<mpsc::Sender<ReferralUpdate>>,
    /// I/O-Controller-only: NCC ("Not Connected to CDC") bit of the DLPE
    /// that produced this controller, last reported via `DlpeUpdate`.
    /// Always `false` (meaning "no known reason to hold back") for DCs.
    ncc: bool,
    /// I/O-Controller-only: `connect-attempts-on-ncc` from config, with `0`
    /// meaning "always retry" and `1` silently promoted to `2`. Unused by DCs.
    connect_attempts_on_ncc: u32,
    /// Discovery-Controller-only: `[Global] pleo` from config. When enabled
    /// and the controller isn't a centralized DC, the supported-log-pages
    /// probe runs before the discovery-log-page fetch.
    pleo_enabled: bool,
    /// Whether the connected controller reported itself as a centralized DC
    /// (`dctype == "cdc"`) - skips the QueryingSupported phase entirely.
    is_cdc: bool,
    /// Derived from the supported-log-pages probe: whether the subsequent
    /// discovery request should set the Log Specific Parameter (LSP) bit to
    /// ask for the extended/persistent offset form of the log page.
    lsp: bool,
    /// A timer set by `run()` for whichever phase most recently failed (or
    /// for the next connect attempt); `None` means no retry is pending.
    pending_retry: Option<PendingRetry>,
    retry_deadline: tokio::time::Instant,
    /// Set the first time the current FetchingDLPEs run fails, so repeated
    /// failures only escalate to an error-level log once.
    fetch_failed_once: bool,
    /// Same log-once guard, for the QueryingSupported phase.
    query_supported_failed_once: bool,
    /// A kernel device already bound to this Tid, found by the Udev Bridge
    /// before this actor was spawned. `run()` adopts it via `fabric.init`
    /// instead of dialing a fresh `connect` on its first iteration; `None`
    /// for the common case of a brand new controller.
    adopt: Option<String>,
}

impl ControllerActor {
    pub fn spawn(
        tid: Tid,
        kind: ControllerKind,
        fabric: Arc<dyn FabricDriver>,
        connect_args: ConnectArgs,
        on_final_disconnect: Option<mpsc::Sender<Tid>>,
    ) -> (mpsc::Sender<ControllerCommand>, tokio::task::JoinHandle<()>) {
        Self::spawn_with_referrals(tid, kind, fabric, connect_args, on_final_disconnect, None)
    }

    pub fn spawn_with_referrals(
        tid: Tid,
        kind: ControllerKind,
        fabric: Arc<dyn FabricDriver>,
        connect_args: ConnectArgs,
        on_final_disconnect: Option<mpsc::Sender<Tid>>,
        referral_tx: Option<mpsc::Sender<ReferralUpdate>>,
    ) -> (mpsc::Sender<ControllerCommand>, tokio::task::JoinHandle<()>) {
        Self::spawn_with_policy(tid, kind, fabric, connect_args, on_final_disconnect, referral_tx, 0, true, None)
    }

    /// Full constructor: additionally takes `connect-attempts-on-ncc`
    /// (I/O-Controller-only reconnect-throttling policy), `pleo_enabled`
    /// (Discovery-Controller-only `[Global] pleo` setting), and `adopt` (a
    /// pre-existing kernel device for this Tid found by the Udev Bridge).
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_with_policy(
        tid: Tid,
        kind: ControllerKind,
        fabric: Arc<dyn FabricDriver>,
        connect_args: ConnectArgs,
        on_final_disconnect: Option<mpsc::Sender<Tid>>,
        referral_tx: Option<mpsc::Sender<ReferralUpdate>>,
        connect_attempts_on_ncc: u32,
        pleo_enabled: bool,
        adopt: Option<String>,
    ) -> (mpsc::Sender<ControllerCommand>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let actor = ControllerActor {
            tid,
            kind,
            fabric,
            connect_args,
            commands: rx,
            state: ControllerState::Disconnected,
            device: None,
            connect_attempts: 0,
            last_log_page: Vec::new(),
            on_final_disconnect,
            referral_tx,
            ncc: false,
            connect_attempts_on_ncc,
            pleo_enabled,
            is_cdc: false,
            lsp: false,
            adopt,
            pending_retry: None,
            retry_deadline: tokio::time::Instant::now(),
            fetch_failed_once: false,
            query_supported_failed_once: false,
        };
        let handle = tokio::spawn(actor.run());
        (tx, handle)
    }

    fn retry_delay(&self) -> Duration {
        let secs = if self.connect_attempts == 0 {
            FAST_CONNECT_RETRY_PERIOD_SEC
        } else {
            CONNECT_RETRY_PERIOD_SEC
        };
        Duration::from_secs(secs)
    }

    /// `_should_try_to_reconnect()`: an I/O Controller whose last known DLPE
    /// has the NCC bit set stops retrying once its attempt counter reaches
    /// the configured (floor-2, 0-means-unbounded) limit. Discovery
    /// Controllers are never throttled this way.
    fn should_try_to_reconnect(&self) -> bool {
        if self.kind != ControllerKind::Io || !self.ncc {
            return true;
        }
        let limit = match self.connect_attempts_on_ncc {
            0 => return true,
            1 => 2,
            n => n,
        };
        self.connect_attempts < limit
    }

    async fn run(mut self) {
        // Adopt a pre-existing kernel device if the Udev Bridge found one
        // for this Tid before the actor was spawned; otherwise dial fresh.
        if !self.try_adopt().await {
            self.try_connect().await;
        }

        loop {
            let sleep = match self.pending_retry {
                Some(_) => tokio::time::sleep_until(self.retry_deadline),
                None => tokio::time::sleep(Duration::from_secs(u64::MAX / 2)),
            };

            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ControllerCommand::Connect) => self.try_connect().await,
                        Some(ControllerCommand::Disconnect) => {
                            self.disconnect().await;
                            break;
                        }
                        Some(ControllerCommand::Udev(event)) => self.on_udev_event(event).await,
                        Some(ControllerCommand::LogPageChanged) => self.do_fetch_log_page().await,
                        Some(ControllerCommand::Snapshot(reply)) => {
                            let _ = reply.send(self.snapshot());
                        }
                        Some(ControllerCommand::GetLogPage(reply)) => {
                            let _ = reply.send(self.last_log_page.clone());
                        }
                        Some(ControllerCommand::DlpeUpdate { ncc }) => self.on_dlpe_update(ncc).await,
                        Some(ControllerCommand::Shutdown) | None => {
                            self.disconnect().await;
                            break;
                        }
                    }
                }
                _ = sleep, if self.pending_retry.is_some() => {
                    match self.pending_retry.take() {
                        Some(PendingRetry::Connect) => self.try_connect().await,
                        Some(PendingRetry::Register) => self.do_register().await,
                        Some(PendingRetry::QuerySupported) => self.do_query_supported().await,
                        Some(PendingRetry::FetchLogPage) => self.do_fetch_log_page().await,
                        None => {}
                    }
                }
            }
        }

        if let Some(chan) = self.on_final_disconnect.take() {
            let _ = chan.send(self.tid.clone()).await;
        }
    }

    /// Arm a retry timer for `phase`, `after` from now. Overwrites any
    /// previously pending retry - a controller only ever has one phase in
    /// flight/backing off at a time.
    fn arm_retry(&mut self, phase: PendingRetry, after: Duration) {
        self.pending_retry = Some(phase);
        self.retry_deadline = tokio::time::Instant::now() + after;
    }

    /// Try to bind to the device `adopt` named, without issuing a fresh
    /// `connect`. Returns `true` if adoption happened (successfully or not
    /// - either way the caller shouldn't also dial `connect`), `false` if
    /// there was nothing to adopt.
    async fn try_adopt(&mut self) -> bool {
        let Some(device) = self.adopt.take() else { return false };
        match self.fabric.init(&device).await {
            Ok(()) => {
                info!(tid = %self.tid, device = %device, "adopted pre-existing kernel connection");
                self.device = Some(device);
                self.state = ControllerState::Connected;
                self.connect_attempts = 0;
                if self.kind == ControllerKind::Discovery {
                    self.start_dc_resync().await;
                }
                true
            }
            Err(e) => {
                debug!(tid = %self.tid, device = %device, error = %e, "adoption failed, falling back to connect");
                false
            }
        }
    }

    async fn try_connect(&mut self) {
        if self.state == ControllerState::Connected {
            return;
        }
        self.state = ControllerState::Connecting;
        match self.fabric.connect(&self.tid, &self.connect_args).await {
            Ok(device) => {
                info!(tid = %self.tid, device = %device, "connected");
                self.device = Some(device);
                self.state = ControllerState::Connected;
                self.connect_attempts = 0;
                if self.kind == ControllerKind::Discovery {
                    self.start_dc_resync().await;
                }
            }
            Err(e) => {
                self.connect_attempts += 1;
                self.state = ControllerState::Disconnected;
                // Only escalate to an error-level log on the 2nd consecutive
                // failure, matching the original's "don't cry wolf on the
                // first blip" policy.
                if self.connect_attempts == 2 {
                    error!(tid = %self.tid, error = %e, attempts = self.connect_attempts, "repeated connect failure");
                } else {
                    debug!(tid = %self.tid, error = %e, attempts = self.connect_attempts, "connect failed");
                }
                if self.should_try_to_reconnect() {
                    self.arm_retry(PendingRetry::Connect, self.retry_delay());
                } else {
                    self.pending_retry = None;
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(device) = self.device.take() {
            self.state = ControllerState::Disconnecting;
            if let Err(e) = self.fabric.disconnect(&device).await {
                warn!(tid = %self.tid, error = %e, "disconnect failed");
            }
        }
        self.state = ControllerState::Disconnected;
        self.pending_retry = None;
    }

    /// Enter the Discovery-Controller-only Registering phase: a fresh
    /// connect (or an `nvme_event=connected|rediscover` resync) always
    /// starts here.
    async fn start_dc_resync(&mut self) {
        self.fetch_failed_once = false;
        self.query_supported_failed_once = false;
        self.do_register().await;
    }

    /// DC-only Registering phase: a DIM register command, retried every
    /// `REGISTRATION_RETRY_PERIOD_SEC` on a transport failure. A protocol
    /// response (supported-but-rejected) or "not supported" both proceed to
    /// QueryingSupported; only a transport-level error holds the phase.
    async fn do_register(&mut self) {
        let Some(device) = self.device.clone() else { return };
        match self.fabric.registration_ctlr(&device).await {
            Ok(RegistrationOutcome::Registered) | Ok(RegistrationOutcome::NotSupported) => {
                self.do_query_supported().await;
            }
            Ok(RegistrationOutcome::ProtocolError(msg)) => {
                warn!(tid = %self.tid, error = %msg, "registration rejected by controller, proceeding anyway");
                self.do_query_supported().await;
            }
            Err(e) => {
                debug!(tid = %self.tid, error = %e, "registration failed, retrying");
                self.arm_retry(PendingRetry::Register, Duration::from_secs(REGISTRATION_RETRY_PERIOD_SEC));
            }
        }
    }

    /// DC-only QueryingSupported phase: skipped entirely when PLEO is
    /// disabled in config or the connected controller is a centralized DC
    /// (CDC) rather than a direct DC (DDC) - a CDC doesn't need the
    /// extended-offset dance since it already aggregates from DDCs.
    async fn do_query_supported(&mut self) {
        let Some(device) = self.device.clone() else { return };

        if let Ok(dctype) = self.fabric.dctype(&device).await {
            self.is_cdc = dctype.eq_ignore_ascii_case("cdc");
        }
        if !self.pleo_enabled || self.is_cdc {
            self.lsp = false;
            self.do_fetch_log_page().await;
            return;
        }

        match self.fabric.get_supported_log_pages(&device).await {
            Ok(supported) => {
                self.lsp = supported;
                self.query_supported_failed_once = false;
                self.do_fetch_log_page().await;
            }
            Err(e) => {
                if !self.query_supported_failed_once {
                    self.query_supported_failed_once = true;
                    warn!(tid = %self.tid, error = %e, "failed to query supported log pages");
                } else {
                    debug!(tid = %self.tid, error = %e, "failed to query supported log pages, retrying");
                }
                self.arm_retry(PendingRetry::QuerySupported, Duration::from_secs(GET_SUPPORTED_RETRY_PERIOD_SEC));
            }
        }
    }

    /// DC-only FetchingDLPEs phase, also the sole phase re-entered directly
    /// by a Discovery Log Page Changed AEN (Steady state doesn't re-run
    /// Register/QuerySupported for that trigger).
    async fn do_fetch_log_page(&mut self) {
        let Some(device) = self.device.clone() else { return };
        match self.fabric.get_discovery_log_page(&device, self.lsp).await {
            Ok(entries) => {
                self.last_log_page = crate::dlpe::normalize_log_page(entries);
                self.fetch_failed_once = false;
                self.publish_referrals().await;
            }
            Err(e) => {
                if !self.fetch_failed_once {
                    self.fetch_failed_once = true;
                    error!(tid = %self.tid, error = %e, "failed to retrieve discovery log page");
                } else {
                    debug!(tid = %self.tid, error = %e, "failed to retrieve discovery log page, retrying");
                }
                self.arm_retry(PendingRetry::FetchLogPage, Duration::from_secs(GET_LOG_PAGE_RETRY_PERIOD_SEC));
            }
        }
    }

    /// Forward the referral subset of the last fetched log page to the
    /// Reconciler, which tracks them as additional Discovery Controllers.
    async fn publish_referrals(&self) {
        let Some(tx) = &self.referral_tx else { return };
        let referrals: Vec<Tid> = crate::dlpe::referrals(&self.last_log_page)
            .into_iter()
            .map(|e| e.to_tid(&self.tid.host_traddr, &self.tid.host_iface))
            .collect();
        let _ = tx.send(ReferralUpdate { origin: self.tid.clone(), referrals }).await;
    }

    /// On a DLPE update clearing NCC, immediately retry if we were sitting
    /// out the backoff because of it; a DLPE update that (re-)asserts NCC
    /// just updates the bit and lets the normal retry gate take over.
    async fn on_dlpe_update(&mut self, ncc: bool) {
        let was_ncc = self.ncc;
        self.ncc = ncc;
        if was_ncc && !ncc && self.state == ControllerState::Disconnected {
            self.connect_attempts = 0;
            self.try_connect().await;
        }
    }

    async fn on_udev_event(&mut self, event: UdevEvent) {
        match event.action {
            UdevAction::Remove => {
                self.device = None;
                self.state = ControllerState::Disconnected;
                self.connect_attempts = 0;
                self.arm_retry(PendingRetry::Connect, Duration::from_secs(FAST_CONNECT_RETRY_PERIOD_SEC));
            }
            UdevAction::Add => {
                self.device = Some(event.sys_name);
                self.state = ControllerState::Connected;
                self.connect_attempts = 0;
                if self.kind == ControllerKind::Discovery {
                    self.start_dc_resync().await;
                }
            }
            UdevAction::Change => {
                // A Discovery Log Page Changed AEN re-enters the
                // log-page-fetch state; any other change event is ignored.
                if self.kind == ControllerKind::Discovery && event.aen == Some(crate::dlpe::DLP_CHANGED) {
                    self.do_fetch_log_page().await;
                }
            }
        }
    }

    pub fn log_page(&self) -> &[Dlpe] {
        &self.last_log_page
    }

    fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            transport: self.tid.transport.clone(),
            traddr: self.tid.traddr.clone(),
            trsvcid: self.tid.trsvcid.clone(),
            subsysnqn: self.tid.subsysnqn.clone(),
            host_traddr: self.tid.host_traddr.clone(),
            host_iface: self.tid.host_iface.clone(),
            device: self.device.clone(),
            state: self.state.as_str().to_string(),
            connect_attempts: self.connect_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::FakeFabric;

    fn tid() -> Tid {
        Tid::new("tcp", "10.0.0.1", "8009", "nqn.test", "", "")
    }

    #[tokio::test]
    async fn connects_on_spawn_and_reports_snapshot() {
        let fabric = Arc::new(FakeFabric::new());
        let (tx, _handle) = ControllerActor::spawn(tid(), ControllerKind::Discovery, fabric, ConnectArgs::default(), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(ControllerCommand::Snapshot(reply_tx)).await.unwrap();
        let snap = reply_rx.await.unwrap();
        assert_eq!(snap.state, "connected");
        assert!(snap.device.is_some());
    }

    #[tokio::test]
    async fn disconnect_command_ends_actor_and_notifies() {
        let fabric = Arc::new(FakeFabric::new());
        let (notify_tx, mut notify_rx) = mpsc::channel(1);
        let (tx, handle) =
            ControllerActor::spawn(tid(), ControllerKind::Discovery, fabric, ConnectArgs::default(), Some(notify_tx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(ControllerCommand::Disconnect).await.unwrap();
        handle.await.unwrap();
        let notified = notify_rx.recv().await;
        assert_eq!(notified, Some(tid()));
    }

    #[tokio::test]
    async fn failed_connect_retries_eventually() {
        let fabric = Arc::new(FakeFabric::new());
        fabric.fail_connect.store(true, std::sync::atomic::Ordering::SeqCst);
        let (tx, _handle) = ControllerActor::spawn(tid(), ControllerKind::Discovery, fabric.clone(), ConnectArgs::default(), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(ControllerCommand::Snapshot(reply_tx)).await.unwrap();
        let snap = reply_rx.await.unwrap();
        assert_eq!(snap.state, "disconnected");
        assert!(snap.connect_attempts >= 1);
    }

    #[tokio::test]
    async fn dlp_changed_aen_triggers_log_page_refresh() {
        let fabric = Arc::new(FakeFabric::new());
        fabric.set_log_page("nvme0", vec![]);
        let (tx, _handle) = ControllerActor::spawn(tid(), ControllerKind::Discovery, fabric.clone(), ConnectArgs::default(), None);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let entry = crate::dlpe::Dlpe {
            trtype: "tcp".into(),
            adrfam: "ipv4".into(),
            subtype: "nvmsubsystem".into(),
            treq: "not specified".into(),
            portid: 1,
            trsvcid: "4420".into(),
            subnqn: "nqn.other".into(),
            traddr: "10.0.0.9".into(),
            eflags: 0,
            cntlid: 0,
            asqsz: 0,
        };
        fabric.set_log_page("nvme0", vec![entry]);

        tx.send(ControllerCommand::Udev(UdevEvent {
            action: UdevAction::Change,
            sys_name: "nvme0".into(),
            tid: tid(),
            kind: ControllerKind::Discovery,
            aen: Some(crate::dlpe::DLP_CHANGED),
        }))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(ControllerCommand::GetLogPage(reply_tx)).await.unwrap();
        let pages = reply_rx.await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].traddr, "10.0.0.9");
    }

    fn bare_actor(fabric: Arc<dyn FabricDriver>, ncc: bool, connect_attempts_on_ncc: u32) -> ControllerActor {
        let (_tx, rx) = mpsc::channel(1);
        ControllerActor {
            tid: tid(),
            kind: ControllerKind::Io,
            fabric,
            connect_args: ConnectArgs::default(),
            commands: rx,
            state: ControllerState::Disconnected,
            device: None,
            connect_attempts: 0,
            last_log_page: Vec::new(),
            on_final_disconnect: None,
            referral_tx: None,
            ncc,
            connect_attempts_on_ncc,
            pleo_enabled: true,
            is_cdc: false,
            lsp: false,
            adopt: None,
            pending_retry: None,
            retry_deadline: tokio::time::Instant::now(),
            fetch_failed_once: false,
            query_supported_failed_once: false,
        }
    }

    #[tokio::test]
    async fn ncc_asserted_stops_retrying_once_attempts_exhausted() {
        let fake = Arc::new(FakeFabric::new());
        fake.fail_connect.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut actor = bare_actor(fake, true, 2);

        assert!(actor.should_try_to_reconnect());
        actor.try_connect().await;
        assert_eq!(actor.connect_attempts, 1);
        assert!(actor.should_try_to_reconnect());
        actor.try_connect().await;
        assert_eq!(actor.connect_attempts, 2);
        assert!(!actor.should_try_to_reconnect(), "attempt limit reached while NCC is set");
    }

    #[tokio::test]
    async fn connect_attempts_on_ncc_of_one_is_promoted_to_two() {
        let fake = Arc::new(FakeFabric::new());
        fake.fail_connect.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut actor = bare_actor(fake, true, 1);
        actor.try_connect().await;
        assert!(actor.should_try_to_reconnect(), "1 attempt made, effective limit is 2");
        actor.try_connect().await;
        assert!(!actor.should_try_to_reconnect());
    }

    #[tokio::test]
    async fn discovery_controllers_are_never_throttled_by_ncc() {
        let fake = Arc::new(FakeFabric::new());
        fake.fail_connect.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut actor = bare_actor(fake, true, 1);
        actor.kind = ControllerKind::Discovery;
        actor.try_connect().await;
        actor.try_connect().await;
        actor.try_connect().await;
        assert!(actor.should_try_to_reconnect());
    }

    #[tokio::test]
    async fn clearing_ncc_while_disconnected_resets_attempts_and_reconnects() {
        let fake = Arc::new(FakeFabric::new());
        fake.fail_connect.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut actor = bare_actor(fake.clone(), true, 2);
        actor.try_connect().await;
        actor.try_connect().await;
        assert_eq!(actor.connect_attempts, 2);

        fake.fail_connect.store(false, std::sync::atomic::Ordering::SeqCst);
        actor.on_dlpe_update(false).await;
        assert_eq!(actor.connect_attempts, 0);
        assert_eq!(actor.state, ControllerState::Connected);
    }

    #[tokio::test]
    async fn unrelated_change_event_does_not_refresh_log_page() {
        let fabric = Arc::new(FakeFabric::new());
        let (tx, _handle) = ControllerActor::spawn(tid(), ControllerKind::Discovery, fabric.clone(), ConnectArgs::default(), None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        fabric.set_log_page("nvme0", vec![]);

        tx.send(ControllerCommand::Udev(UdevEvent {
            action: UdevAction::Change,
            sys_name: "nvme0".into(),
            tid: tid(),
            kind: ControllerKind::Discovery,
            aen: None,
        }))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(ControllerCommand::GetLogPage(reply_tx)).await.unwrap();
        let pages = reply_rx.await.unwrap();
        assert!(pages.is_empty());
    }

    #[tokio::test]
    async fn pleo_enabled_sets_lsp_from_supported_probe() {
        let fake = Arc::new(FakeFabric::new());
        let mut actor = bare_actor(fake, false, 0);
        actor.kind = ControllerKind::Discovery;
        actor.try_connect().await;
        assert!(actor.lsp, "FakeFabric::get_supported_log_pages reports true by default");
    }

    #[tokio::test]
    async fn cdc_skips_query_supported_and_leaves_lsp_clear() {
        let fake = Arc::new(FakeFabric::new());
        *fake.dctype.lock().unwrap() = "cdc".to_string();
        let mut actor = bare_actor(fake, false, 0);
        actor.kind = ControllerKind::Discovery;
        actor.try_connect().await;
        assert!(actor.is_cdc);
        assert!(!actor.lsp);
    }

    #[tokio::test]
    async fn pleo_disabled_skips_query_supported() {
        let fake = Arc::new(FakeFabric::new());
        let mut actor = bare_actor(fake, false, 0);
        actor.kind = ControllerKind::Discovery;
        actor.pleo_enabled = false;
        actor.try_connect().await;
        assert!(!actor.lsp);
    }

    #[tokio::test]
    async fn registration_failure_retries_and_eventually_proceeds() {
        let fake = Arc::new(FakeFabric::new());
        fake.fail_registration.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut actor = bare_actor(fake.clone(), false, 0);
        actor.kind = ControllerKind::Discovery;
        actor.try_connect().await;
        assert!(actor.device.is_some());
        assert_eq!(actor.pending_retry, Some(PendingRetry::Register));

        fake.fail_registration.store(false, std::sync::atomic::Ordering::SeqCst);
        actor.do_register().await;
        assert_eq!(actor.pending_retry, None);
        assert!(actor.lsp);
    }

    #[tokio::test]
    async fn get_supported_failure_retries_before_fetching_log_page() {
        let fake = Arc::new(FakeFabric::new());
        fake.fail_supported.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut actor = bare_actor(fake.clone(), false, 0);
        actor.kind = ControllerKind::Discovery;
        actor.try_connect().await;
        assert_eq!(actor.pending_retry, Some(PendingRetry::QuerySupported));

        fake.fail_supported.store(false, std::sync::atomic::Ordering::SeqCst);
        actor.do_query_supported().await;
        assert_eq!(actor.pending_retry, None);
        assert!(actor.lsp);
    }

    #[tokio::test]
    async fn dlp_changed_aen_does_not_redo_registration() {
        // A second FetchingDLPEs entry via the AEN path should not touch
        // `is_cdc`/`lsp` again - those only get (re-)derived on a fresh
        // connect or udev Add.
        let fake = Arc::new(FakeFabric::new());
        let mut actor = bare_actor(fake, false, 0);
        actor.kind = ControllerKind::Discovery;
        actor.try_connect().await;
        assert!(actor.lsp);

        actor.is_cdc = true; // simulate having learned this already
        actor.do_fetch_log_page().await;
        assert!(actor.is_cdc, "do_fetch_log_page must not reset dctype-derived state");
    }

    #[tokio::test]
    async fn successful_adoption_skips_connect_and_resyncs_discovery_controller() {
        let fake = Arc::new(FakeFabric::new());
        fake.set_log_page("nvme7", vec![]);
        let mut actor = bare_actor(fake.clone(), false, 0);
        actor.kind = ControllerKind::Discovery;
        actor.adopt = Some("nvme7".into());

        let adopted = actor.try_adopt().await;

        assert!(adopted);
        assert_eq!(actor.state, ControllerState::Connected);
        assert_eq!(actor.device.as_deref(), Some("nvme7"));
        assert_eq!(actor.connect_attempts, 0);
        assert_eq!(actor.pending_retry, None, "a successful adopt must run the resync chain to completion");
    }

    #[tokio::test]
    async fn failed_adoption_falls_back_to_a_fresh_connect() {
        let fake = Arc::new(FakeFabric::new());
        fake.fail_init.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut actor = bare_actor(fake, false, 0);
        actor.adopt = Some("nvme7".into());

        let adopted = actor.try_adopt().await;
        assert!(!adopted);
        assert_eq!(actor.adopt, None, "adopt must be consumed even on failure, so run() falls through to try_connect once");

        actor.try_connect().await;
        assert_eq!(actor.state, ControllerState::Connected);
    }
}
