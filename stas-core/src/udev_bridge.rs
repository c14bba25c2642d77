//! Udev Bridge: enumerates existing nvme-subsystem devices at startup and
//! relays live add/remove/change events to interested Controllers.
//!
//! Classification of a device as Discovery vs I/O Controller follows the
//! kernel's own `cntrltype` sysfs attribute when present, and falls back to
//! heuristics (well-known discovery NQN, presence of child devices) on
//! older kernels that don't expose it yet.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::UdevError;
use crate::tid::{Tid, WELL_KNOWN_DISC_NQN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    Discovery,
    Io,
}

#[derive(Debug, Clone)]
pub struct UdevEvent {
    pub action: UdevAction,
    pub sys_name: String,
    pub tid: Tid,
    pub kind: ControllerKind,
    /// Parsed `NVME_AEN` property, when the kernel attached one to a
    /// `change` event (e.g. the Discovery Log Page Changed composite value).
    pub aen: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdevAction {
    Add,
    Remove,
    Change,
}

fn get_property(device: &udev::Device, name: &str) -> String {
    match device.property_value(name).and_then(|v| v.to_str()) {
        Some(v) if !v.eq_ignore_ascii_case("none") => v.to_string(),
        _ => String::new(),
    }
}

fn get_attribute(device: &udev::Device, name: &str) -> String {
    match device.attribute_value(name).and_then(|v| v.to_str()) {
        Some(v) => {
            let v = v.trim();
            if v.eq_ignore_ascii_case("none") || v == "(efault)" {
                String::new()
            } else {
                v.to_string()
            }
        }
        None => String::new(),
    }
}

/// Extract `key=` from a `,`-delimited attribute string such as the
/// `address` sysfs attribute
/// (`trtype=tcp,traddr=10.10.1.100,trsvcid=4420,host_traddr=10.10.1.50`).
fn extract_key(attr_str: &str, key: &str) -> String {
    if attr_str.is_empty() {
        return String::new();
    }
    let needle = if key.ends_with('=') { key.to_string() } else { format!("{}=", key) };
    match attr_str.find(&needle) {
        None => String::new(),
        Some(start) => {
            let rest = &attr_str[start + needle.len()..];
            match rest.find(',') {
                Some(end) => rest[..end].to_string(),
                None => rest.to_string(),
            }
        }
    }
}

fn get_key_from_attr(device: &udev::Device, attr: &str, key: &str) -> String {
    extract_key(&get_attribute(device, attr), key)
}

fn get_host_iface(device: &udev::Device, resolve_iface: impl Fn(&str) -> String) -> String {
    let host_iface = get_property(device, "NVME_HOST_IFACE");
    if !host_iface.is_empty() {
        return host_iface;
    }
    let src_addr = get_key_from_attr(device, "address", "src_addr=");
    if src_addr.is_empty() {
        String::new()
    } else {
        resolve_iface(&src_addr)
    }
}

pub fn tid_from_device(device: &udev::Device, resolve_iface: impl Fn(&str) -> String) -> Tid {
    Tid::new(
        get_property(device, "NVME_TRTYPE"),
        get_property(device, "NVME_TRADDR"),
        get_property(device, "NVME_TRSVCID"),
        get_attribute(device, "subsysnqn"),
        get_property(device, "NVME_HOST_TRADDR"),
        get_host_iface(device, resolve_iface),
    )
}

fn children_len(device: &udev::Device) -> usize {
    device.syspath().read_dir().map(|it| it.count()).unwrap_or(0)
}

/// Pure classification rule: does a subsysnqn/cntrltype/child-count triple
/// describe a Discovery Controller? Kept separate from `is_dc_device` so it
/// can be unit-tested without a real udev device.
fn classify_attrs(subsysnqn: &str, cntrltype: &str, children_len: usize) -> bool {
    if subsysnqn == WELL_KNOWN_DISC_NQN {
        return true;
    }
    if cntrltype == "discovery" {
        return true;
    }
    if cntrltype == "io" {
        return false;
    }
    children_len == 0
}

pub fn is_dc_device(device: &udev::Device) -> bool {
    classify_attrs(&get_attribute(device, "subsysnqn"), &get_attribute(device, "cntrltype"), children_len(device))
}

pub fn is_ioc_device(device: &udev::Device) -> bool {
    !is_dc_device(device)
}

pub fn classify(device: &udev::Device) -> ControllerKind {
    if is_dc_device(device) {
        ControllerKind::Discovery
    } else {
        ControllerKind::Io
    }
}

/// Parse the `NVME_AEN` udev property value, accepting both the kernel's
/// `"0x..."` hex form and a bare decimal string.
fn parse_aen_str(raw: &str) -> Option<u32> {
    if raw.is_empty() {
        return None;
    }
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => raw.parse::<u32>().ok().or_else(|| u32::from_str_radix(raw, 16).ok()),
    }
}

fn parse_aen(device: &udev::Device) -> Option<u32> {
    parse_aen_str(&get_property(device, "NVME_AEN"))
}

/// Runs the live udev monitor on a blocking thread and forwards classified
/// events over an unbounded channel. Event-storm logging is suppressed to
/// at most once every two seconds, matching the original's burst handling.
pub struct UdevBridge {
    events: mpsc::UnboundedReceiver<UdevEvent>,
    _task: tokio::task::JoinHandle<()>,
}

/// Coalesces debug-level logging during a burst of udev events (e.g. a
/// flaky link cycling add/remove repeatedly): logs at most once per
/// soak window, with the number suppressed since the last log line.
struct BurstSuppressor {
    soak_until: std::sync::Mutex<std::time::Instant>,
    count: std::sync::atomic::AtomicU64,
}

impl BurstSuppressor {
    fn new() -> Self {
        Self {
            soak_until: std::sync::Mutex::new(std::time::Instant::now()),
            count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Returns the number of events suppressed since the last log line if
    /// this call should actually be logged, `None` if it should stay silent.
    fn should_log(&self) -> Option<u64> {
        self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let now = std::time::Instant::now();
        let mut soak = self.soak_until.lock().unwrap();
        if now > *soak {
            let n = self.count.swap(0, std::sync::atomic::Ordering::SeqCst);
            *soak = now + std::time::Duration::from_secs(2);
            Some(n)
        } else {
            None
        }
    }
}

impl UdevBridge {
    pub fn new() -> Result<Self, UdevError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::task::spawn_blocking(move || Self::monitor_loop(tx));
        Ok(Self { events: rx, _task: task })
    }

    fn monitor_loop(tx: mpsc::UnboundedSender<UdevEvent>) {
        let socket = (|| -> std::io::Result<udev::MonitorSocket> {
            udev::MonitorBuilder::new()?.match_subsystem("nvme")?.listen()
        })();
        let socket = match socket {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to start udev monitor");
                return;
            }
        };

        let suppressor = BurstSuppressor::new();
        for event in socket.iter() {
            let action = match event.event_type() {
                udev::EventType::Add => UdevAction::Add,
                udev::EventType::Remove => UdevAction::Remove,
                udev::EventType::Change => UdevAction::Change,
                _ => continue,
            };
            let device = event.device();
            let sys_name = device.sysname().to_string_lossy().into_owned();
            let tid = tid_from_device(&device, |_| String::new());
            let kind = classify(&device);
            let aen = parse_aen(&device);
            if let Some(suppressed) = suppressor.should_log() {
                debug!(?action, sys_name = %sys_name, tid = %tid, suppressed_since_last_log = suppressed, "udev event");
            }
            if tx.send(UdevEvent { action, sys_name, tid, kind, aen }).is_err() {
                break;
            }
        }
    }

    pub async fn recv(&mut self) -> Option<UdevEvent> {
        self.events.recv().await
    }
}

/// Adoption: look for an already-connected kernel device matching `tid` and
/// `kind`, so a fresh daemon start (or a controller re-spawned after a
/// config reload) can bind to it instead of redialing `connect`.
pub fn find_device_for_tid(tid: &Tid, kind: ControllerKind) -> Result<Option<String>, UdevError> {
    let mut enumerator = udev::Enumerator::new().map_err(|e| UdevError::Enumerate { source: e })?;
    enumerator.match_subsystem("nvme").map_err(|e| UdevError::Enumerate { source: e })?;
    for device in enumerator.scan_devices().map_err(|e| UdevError::Enumerate { source: e })? {
        let matches_kind = match kind {
            ControllerKind::Discovery => is_dc_device(&device),
            ControllerKind::Io => is_ioc_device(&device),
        };
        if !matches_kind {
            continue;
        }
        if &tid_from_device(&device, |_| String::new()) == tid {
            return Ok(Some(device.sysname().to_string_lossy().into_owned()));
        }
    }
    Ok(None)
}

pub type DeviceRegistry = Arc<Mutex<HashMap<String, Tid>>>;

/// Enumerate every kernel I/O Controller device whose Tid's transport is in
/// `transports`, regardless of whether this daemon's Registry knows about
/// it. Used by the `all-connections-matching-disconnect-trtypes` shutdown
/// policy, which disconnects every matching kernel connection, not just the
/// ones this daemon itself spawned.
pub fn ioc_tids(transports: &std::collections::HashSet<String>) -> Result<Vec<(String, Tid)>, UdevError> {
    let mut enumerator = udev::Enumerator::new().map_err(|e| UdevError::Enumerate { source: e })?;
    enumerator.match_subsystem("nvme").map_err(|e| UdevError::Enumerate { source: e })?;
    let mut out = Vec::new();
    for device in enumerator.scan_devices().map_err(|e| UdevError::Enumerate { source: e })? {
        if !is_ioc_device(&device) {
            continue;
        }
        let tid = tid_from_device(&device, |_| String::new());
        if transports.contains(&tid.transport) {
            out.push((device.sysname().to_string_lossy().into_owned(), tid));
        }
    }
    Ok(out)
}
