//! stacd - the Connector. Consumes Discovery Log Page Entries (polled from
//! stafd over its IPC surface) plus statically configured controllers, and
//! maintains persistent I/O Controller connections to their union.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use stas_core::config::Config;
use stas_core::controller::ControllerCommand;
use stas_core::dlpe::Dlpe;
use stas_core::fabric::{FabricDriver, LinuxFabric};
use stas_core::identity::Identity;
use stas_core::ipc::{IpcServer, IpcState};
use stas_core::lkc::{LkcStore, PersistedTid, Snapshot};
use stas_core::reconciler::Reconciler;
use stas_core::registry::Registry;
use stas_core::tid::Tid;
use stas_core::udev_bridge::{ControllerKind, UdevBridge};

/// How often to poll stafd's discovery log pages for new/removed I/O
/// Controllers. stafd itself debounces log-page refresh behind AENs; this
/// period just bounds how stale stacd's view of it can get when no AEN
/// fires (e.g. stafd restarted and stacd missed the transition).
const STAFD_POLL_PERIOD: Duration = Duration::from_secs(30);
const STAFD_IPC_SOCKET: &str = "/run/stafd/stafd.sock";

#[derive(Parser, Debug)]
#[command(name = "stacd", about = "NVMe-oF I/O Controller connection daemon")]
struct Args {
    #[arg(short = 'f', long = "conf-file", default_value = stas_core::DEFAULT_STACD_CONF)]
    conf_file: String,

    #[arg(short = 's', long = "syslog")]
    syslog: bool,

    #[arg(long = "tron")]
    tron: bool,

    #[arg(long = "idl")]
    idl: bool,
}

/// Statically configured I/O Controllers, converted to TIDs. Exclusion is
/// applied uniformly for every desired-set source by the Reconciler itself,
/// not here.
fn static_io_controllers(config: &Config) -> Vec<Tid> {
    config
        .controllers
        .iter()
        .map(|c| Tid::new(c.transport.clone(), c.traddr.clone(), c.trsvcid.clone(), c.subsysnqn.clone(), c.host_traddr.clone(), c.host_iface.clone()))
        .collect()
}

/// Poll stafd's `get_all_log_pages` IPC method once, turning every
/// nvm-subtype Discovery Log Page Entry into an I/O Controller TID.
/// Referral-subtype entries are the Finder's concern (they grow its own set
/// of tracked Discovery Controllers, not the Connector's set of I/O
/// Controllers) and are skipped here.
async fn poll_stafd_io_controllers() -> Vec<Tid> {
    let response = match stas_core::ipc::query(STAFD_IPC_SOCKET, "get_all_log_pages", serde_json::Value::Null).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to poll stafd for discovery log pages");
            return Vec::new();
        }
    };
    let Some(entries) = response.as_array() else { return Vec::new() };

    let mut out = Vec::new();
    for dc in entries {
        let host_traddr = dc["tid_fields"]["host_traddr"].as_str().unwrap_or_default();
        let host_iface = dc["tid_fields"]["host_iface"].as_str().unwrap_or_default();
        let Some(log_page) = dc["log_page"].as_array() else { continue };
        for raw in log_page {
            let Ok(entry) = serde_json::from_value::<Dlpe>(raw.clone()) else { continue };
            if entry.is_referral() || !entry.has_usable_address() {
                continue;
            }
            out.push(entry.to_tid(host_traddr, host_iface));
        }
    }
    out
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(msg) = stas_core::check_if_allowed_to_continue() {
        eprintln!("stacd: {}", msg);
        std::process::exit(1);
    }

    stas_core::logging::init(args.tron);
    let _ = args.syslog;

    if args.idl {
        println!("{}", include_str!("ipc_idl.json"));
        return;
    }

    let config = match Config::load(&args.conf_file) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("stacd: {}", e);
            std::process::exit(1);
        }
    };

    info!(conf_file = %args.conf_file, "starting stacd");

    let identity = match Identity::load(stas_core::DEFAULT_ETC_NVME) {
        Ok(identity) => identity,
        Err(e) => {
            eprintln!("stacd: mandatory host identity missing: {}", e);
            std::process::exit(1);
        }
    };

    let registry = Registry::new();
    let fabric: Arc<dyn FabricDriver> = Arc::new(LinuxFabric::new());
    let reconciler = Reconciler::with_config(registry.clone(), fabric, ControllerKind::Io, identity, &config);

    let lkc = LkcStore::new(stas_core::runtime_directory("stacd"));

    // `static_desired` carries the config file's `[Controllers]` entries
    // and the LKC-reloaded snapshot; `stafd_desired` carries the live set
    // polled from stafd's discovery log pages. Both feed the same
    // reconciler desired set, which applies the exclude filter uniformly.
    let static_desired: Arc<Mutex<Vec<Tid>>> = Arc::new(Mutex::new(static_io_controllers(&config)));
    if let Ok(snapshot) = lkc.load() {
        if config.persistent_connections {
            static_desired.lock().await.extend(snapshot.controllers.iter().map(Tid::from));
        }
    }
    let stafd_desired: Arc<Mutex<Vec<Tid>>> = Arc::new(Mutex::new(poll_stafd_io_controllers().await));

    reconciler.set_overlays(config.controllers.clone()).await;
    reconciler.set_exclude(config.exclude.clone()).await;
    recompute_desired(&reconciler, &static_desired, &stafd_desired).await;

    {
        let reconciler = reconciler.clone();
        let static_desired = static_desired.clone();
        let stafd_desired = stafd_desired.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(STAFD_POLL_PERIOD).await;
                *stafd_desired.lock().await = poll_stafd_io_controllers().await;
                recompute_desired(&reconciler, &static_desired, &stafd_desired).await;
            }
        });
    }

    let mut udev_bridge = match UdevBridge::new() {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to start udev bridge");
            std::process::exit(1);
        }
    };
    let registry_for_udev = registry.clone();
    tokio::spawn(async move {
        while let Some(event) = udev_bridge.recv().await {
            if event.kind != ControllerKind::Io {
                continue;
            }
            if let Some(handle) = registry_for_udev.get(&event.tid).await {
                let _ = handle.commands.send(ControllerCommand::Udev(event)).await;
            }
        }
    });

    let ipc_state = Arc::new(IpcState {
        tron: AtomicBool::new(args.tron),
        registry: registry.clone(),
        prog_name: "stacd".to_string(),
        pid: std::process::id(),
        supports_log_pages: false,
    });
    let ipc = IpcServer::new("/run/stacd/stacd.sock");
    tokio::spawn(async move {
        if let Err(e) = ipc.serve(ipc_state).await {
            error!(error = %e, "ipc server exited");
        }
    });

    run_until_shutdown(&args.conf_file, &reconciler, &static_desired, &stafd_desired).await;
    info!("stacd shutting down");

    let snapshots = registry.snapshot_all().await;
    let _ = lkc.save(&Snapshot {
        controllers: snapshots
            .iter()
            .map(|s| PersistedTid {
                transport: s.transport.clone(),
                traddr: s.traddr.clone(),
                trsvcid: s.trsvcid.clone(),
                subsysnqn: s.subsysnqn.clone(),
                host_traddr: s.host_traddr.clone(),
                host_iface: s.host_iface.clone(),
            })
            .collect(),
        log_pages: vec![],
    });

    // Respect `disconnect-scope`: `no-disconnect` leaves every kernel
    // connection alone; `only-stas-connections` tears down only the
    // controllers this daemon itself spawned; `all-connections-matching-
    // disconnect-trtypes` additionally disconnects any other kernel I/O
    // Controller of a matching transport that this daemon never tracked
    // (e.g. connected by hand or by another tool).
    match config.disconnect_scope {
        stas_core::config::DisconnectScope::NoDisconnect => {}
        stas_core::config::DisconnectScope::OnlyStasConnections => {
            reconciler.disconnect_all_and_wait(std::time::Duration::from_secs(10)).await;
        }
        stas_core::config::DisconnectScope::AllConnectionsMatchingDisconnectTrtypes => {
            let tracked: std::collections::HashSet<Tid> = registry.tids().await.into_iter().collect();
            reconciler.disconnect_all_and_wait(std::time::Duration::from_secs(10)).await;
            disconnect_untracked_matching_trtypes(&config.disconnect_trtypes, &tracked).await;
        }
    }
}

/// Disconnect every kernel I/O Controller whose transport is in
/// `disconnect_trtypes` and that wasn't already one of `tracked` (those were
/// just handled by `disconnect_all_and_wait`).
async fn disconnect_untracked_matching_trtypes(disconnect_trtypes: &std::collections::HashSet<String>, tracked: &std::collections::HashSet<Tid>) {
    let trtypes = disconnect_trtypes.clone();
    let devices = match tokio::task::spawn_blocking(move || stas_core::udev_bridge::ioc_tids(&trtypes)).await {
        Ok(Ok(devices)) => devices,
        Ok(Err(e)) => {
            warn!(error = %e, "failed to enumerate kernel I/O Controllers for disconnect-scope");
            return;
        }
        Err(e) => {
            warn!(error = %e, "udev enumeration task panicked");
            return;
        }
    };
    let fabric = LinuxFabric::new();
    for (device, tid) in devices {
        if tracked.contains(&tid) {
            continue;
        }
        if let Err(e) = fabric.disconnect(&device).await {
            warn!(tid = %tid, device = %device, error = %e, "failed to disconnect untracked kernel connection");
        } else {
            info!(tid = %tid, device = %device, "disconnected untracked kernel connection matching disconnect-trtypes");
        }
    }
}

/// Merge the static (config + LKC) set with the live stafd-polled set and
/// push the result to the reconciler.
async fn recompute_desired(reconciler: &Arc<Reconciler>, static_desired: &Mutex<Vec<Tid>>, stafd_desired: &Mutex<Vec<Tid>>) {
    let mut desired = static_desired.lock().await.clone();
    desired.extend(stafd_desired.lock().await.iter().cloned());
    reconciler.set_desired(desired).await;
}

/// Block until SIGTERM/SIGINT, reloading configuration and re-running
/// reconciliation on each SIGHUP in the meantime.
async fn run_until_shutdown(
    conf_file: &str,
    reconciler: &Arc<Reconciler>,
    static_desired: &Mutex<Vec<Tid>>,
    stafd_desired: &Mutex<Vec<Tid>>,
) {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .expect("failed to install SIGINT handler");
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .expect("failed to install SIGHUP handler");
    loop {
        tokio::select! {
            _ = sigterm.recv() => return,
            _ = sigint.recv() => return,
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration");
                match Config::load(conf_file) {
                    Ok(config) => {
                        *static_desired.lock().await = static_io_controllers(&config);
                        reconciler.set_overlays(config.controllers.clone()).await;
                        reconciler.set_exclude(config.exclude.clone()).await;
                        recompute_desired(reconciler, static_desired, stafd_desired).await;
                    }
                    Err(e) => error!(error = %e, "failed to reload configuration"),
                }
            }
        }
    }
}
