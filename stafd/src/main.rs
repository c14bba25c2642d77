//! stafd - the Finder. Tracks Discovery Controllers (from config, mDNS,
//! and NBFT firmware tables), retrieves and caches their discovery log
//! pages, and republishes changes for stacd to consume.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use stas_core::controller::ControllerCommand;
use stas_core::discovery::{NullDiscovery, ServiceDiscovery, ServiceEvent};
use stas_core::fabric::{FabricDriver, LinuxFabric};
use stas_core::identity::Identity;
use stas_core::ipc::{IpcServer, IpcState};
use stas_core::lkc::{LkcStore, PersistedTid, Snapshot};
use stas_core::nbft;
use stas_core::reconciler::Reconciler;
use stas_core::registry::Registry;
use stas_core::tid::Tid;
use stas_core::udev_bridge::{ControllerKind, UdevBridge};

/// Statically configured Discovery Controllers, converted to TIDs.
fn static_discovery_controllers(config: &stas_core::config::Config) -> Vec<Tid> {
    config
        .controllers
        .iter()
        .map(|c| Tid::new(c.transport.clone(), c.traddr.clone(), c.trsvcid.clone(), c.subsysnqn.clone(), c.host_traddr.clone(), c.host_iface.clone()))
        .collect()
}

/// Turn an mDNS/DNS-SD announcement into a Discovery Controller TID. The
/// subsystem NQN comes from the TXT record's `nqn` key when present,
/// otherwise the kernel's well-known Discovery Controller NQN - a bare
/// `_nvme-disc._tcp` announcement with no NQN hint still resolves to the
/// standard Discovery Controller, same as the original's mdns listener.
fn tid_from_mdns(addr: std::net::SocketAddr, txt: &[(String, String)]) -> Tid {
    let nqn = txt
        .iter()
        .find(|(k, _)| k == "nqn")
        .map(|(_, v)| v.as_str())
        .unwrap_or(stas_core::tid::WELL_KNOWN_DISC_NQN);
    Tid::new("tcp", addr.ip().to_string(), addr.port().to_string(), nqn, "", "")
}

#[derive(Parser, Debug)]
#[command(name = "stafd", about = "NVMe-oF Discovery Controller tracking daemon")]
struct Args {
    /// Configuration file to use.
    #[arg(short = 'f', long = "conf-file", default_value = stas_core::DEFAULT_STAFD_CONF)]
    conf_file: String,

    /// Log to syslog instead of stderr.
    #[arg(short = 's', long = "syslog")]
    syslog: bool,

    /// Enable debug-level tracing at startup.
    #[arg(long = "tron")]
    tron: bool,

    /// Print the IPC interface description and exit.
    #[arg(long = "idl")]
    idl: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(msg) = stas_core::check_if_allowed_to_continue() {
        eprintln!("stafd: {}", msg);
        std::process::exit(1);
    }

    stas_core::logging::init(args.tron);
    let _ = args.syslog; // syslog sink selection happens in logging::init in a full build

    if args.idl {
        println!("{}", include_str!("ipc_idl.json"));
        return;
    }

    let config = match stas_core::config::Config::load(&args.conf_file) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("stafd: {}", e);
            std::process::exit(1);
        }
    };

    info!(conf_file = %args.conf_file, "starting stafd");

    let identity = match Identity::load(stas_core::DEFAULT_ETC_NVME) {
        Ok(identity) => identity,
        Err(e) => {
            eprintln!("stafd: mandatory host identity missing: {}", e);
            std::process::exit(1);
        }
    };

    let registry = Registry::new();
    let fabric: Arc<dyn FabricDriver> = Arc::new(LinuxFabric::new());
    let reconciler = Reconciler::with_config(registry.clone(), fabric, ControllerKind::Discovery, identity, &config);

    let lkc = LkcStore::new(stas_core::runtime_directory("stafd"));

    // Desired-set sources: the reloaded LKC snapshot and NBFT firmware
    // tables are one-shot at startup; `base_desired` additionally carries
    // the statically configured controllers, which are re-read on SIGHUP.
    // `mdns_desired` is updated continuously as announcements arrive/expire.
    let base_desired: Arc<Mutex<Vec<Tid>>> = Arc::new(Mutex::new(static_discovery_controllers(&config)));
    let mdns_desired: Arc<Mutex<HashMap<String, Tid>>> = Arc::new(Mutex::new(HashMap::new()));

    {
        let mut base = base_desired.lock().await;
        if let Ok(snapshot) = lkc.load() {
            base.extend(snapshot.controllers.iter().map(Tid::from));
        }
        match nbft::scan("/sys/firmware/acpi/tables") {
            Ok(tables) => {
                for table in &tables {
                    base.extend(table.discovery_tids());
                }
            }
            Err(e) => warn!(error = %e, "failed to scan NBFT firmware tables"),
        }
    }
    reconciler.set_overlays(config.controllers.clone()).await;
    reconciler.set_exclude(config.exclude.clone()).await;
    recompute_desired(&reconciler, &base_desired, &mdns_desired).await;

    let discovery: Arc<dyn ServiceDiscovery> = Arc::new(NullDiscovery);
    if config.zeroconf_enabled {
        let stypes = config.stypes();
        let mut events = discovery.browse(&stypes).await;
        let reconciler_for_mdns = reconciler.clone();
        let base_for_mdns = base_desired.clone();
        let mdns_for_mdns = mdns_desired.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ServiceEvent::Added { key, addr, txt } => {
                        let tid = tid_from_mdns(addr, &txt);
                        mdns_for_mdns.lock().await.insert(key.instance, tid);
                    }
                    ServiceEvent::Removed { key } => {
                        mdns_for_mdns.lock().await.remove(&key.instance);
                    }
                }
                let hint: Vec<Tid> = mdns_for_mdns.lock().await.values().cloned().collect();
                reconciler_for_mdns.set_mdns_hint(hint).await;
                recompute_desired(&reconciler_for_mdns, &base_for_mdns, &mdns_for_mdns).await;
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
            if event.kind != ControllerKind::Discovery {
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
        prog_name: "stafd".to_string(),
        pid: std::process::id(),
        supports_log_pages: true,
    });
    let ipc = IpcServer::new(format!("/run/stafd/{}.sock", "stafd"));
    tokio::spawn(async move {
        if let Err(e) = ipc.serve(ipc_state).await {
            error!(error = %e, "ipc server exited");
        }
    });

    run_until_shutdown(&args.conf_file, &reconciler, &base_desired, &mdns_desired).await;
    info!("stafd shutting down");

    let snapshots = registry.snapshot_all_with_log_pages().await;
    let mut log_pages = Vec::new();
    for (i, (_, log_page)) in snapshots.iter().enumerate() {
        if !log_page.is_empty() {
            log_pages.push((i, log_page.clone()));
        }
    }
    let _ = lkc.save(&Snapshot {
        controllers: snapshots
            .iter()
            .map(|(s, _)| PersistedTid {
                transport: s.transport.clone(),
                traddr: s.traddr.clone(),
                trsvcid: s.trsvcid.clone(),
                subsysnqn: s.subsysnqn.clone(),
                host_traddr: s.host_traddr.clone(),
                host_iface: s.host_iface.clone(),
            })
            .collect(),
        log_pages,
    });

    reconciler.disconnect_all_and_wait(std::time::Duration::from_secs(10)).await;
}

/// Merge the static/NBFT/LKC base set with the live mDNS set and push the
/// result to the reconciler.
async fn recompute_desired(reconciler: &Arc<Reconciler>, base: &Mutex<Vec<Tid>>, mdns: &Mutex<HashMap<String, Tid>>) {
    let mut desired = base.lock().await.clone();
    desired.extend(mdns.lock().await.values().cloned());
    reconciler.set_desired(desired).await;
}

/// Block until SIGTERM/SIGINT, reloading configuration and re-running
/// reconciliation on each SIGHUP in the meantime.
async fn run_until_shutdown(
    conf_file: &str,
    reconciler: &Arc<Reconciler>,
    base_desired: &Mutex<Vec<Tid>>,
    mdns_desired: &Mutex<HashMap<String, Tid>>,
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
                match stas_core::config::Config::load(conf_file) {
                    Ok(config) => {
                        *base_desired.lock().await = static_discovery_controllers(&config);
                        reconciler.set_overlays(config.controllers.clone()).await;
                        reconciler.set_exclude(config.exclude.clone()).await;
                        recompute_desired(reconciler, base_desired, mdns_desired).await;
                    }
                    Err(e) => error!(error = %e, "failed to reload configuration"),
                }
            }
        }
    }
}
