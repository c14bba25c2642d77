//! Abstraction over the kernel NVMe-oF fabric binding: the
//! `/dev/nvme-fabrics` control file used to issue `connect`, plus the NVMe
//! admin-command ioctls used to retrieve discovery log pages and drop a
//! connection. Concrete implementation talks to the real kernel; tests use
//! an in-memory double.

use async_trait::async_trait;
use snafu::{OptionExt, ResultExt};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use crate::dlpe::{decode_log_page, normalize_log_page, Dlpe};
use crate::error::{self, FabricError};
use crate::tid::Tid;

pub const NVME_FABRICS_PATH: &str = "/dev/nvme-fabrics";

/// NVMe admin-command passthrough ioctl, the same one `nvme-cli` uses to
/// issue Get Log Page against a live controller's char device.
mod ioctl {
    use nix::ioctl_readwrite;

    #[repr(C)]
    pub struct NvmeAdminCmd {
        pub opcode: u8,
        pub flags: u8,
        pub rsvd1: u16,
        pub nsid: u32,
        pub cdw2: u32,
        pub cdw3: u32,
        pub metadata: u64,
        pub addr: u64,
        pub metadata_len: u32,
        pub data_len: u32,
        pub cdw10: u32,
        pub cdw11: u32,
        pub cdw12: u32,
        pub cdw13: u32,
        pub cdw14: u32,
        pub cdw15: u32,
        pub timeout_ms: u32,
        pub result: u32,
    }

    const NVME_ADMIN_GET_LOG_PAGE: u8 = 0x02;
    const NVME_LOG_LID_DISCOVERY: u32 = 0x70;
    const NVME_LOG_LID_SUPPORTED: u32 = 0x00;

    ioctl_readwrite!(nvme_admin_cmd, b'N', 0x41, NvmeAdminCmd);

    /// Log Specific Parameter (CDW10 bits 11:8): for the Discovery log page
    /// this asks the controller for the persistent/extended-offset form
    /// when PLEO is enabled and the supported-log-pages probe reported it.
    const LSP_PERSIST_THROUGH_POWER_LOSS: u32 = 1 << 8;

    fn build_get_log_page(lid: u32, lsp: bool, buf: &mut [u8]) -> NvmeAdminCmd {
        let numd = (buf.len() / 4).saturating_sub(1) as u32;
        let lsp_bits = if lsp { LSP_PERSIST_THROUGH_POWER_LOSS } else { 0 };
        NvmeAdminCmd {
            opcode: NVME_ADMIN_GET_LOG_PAGE,
            flags: 0,
            rsvd1: 0,
            nsid: 0xffff_ffff,
            cdw2: 0,
            cdw3: 0,
            metadata: 0,
            addr: buf.as_mut_ptr() as u64,
            metadata_len: 0,
            data_len: buf.len() as u32,
            cdw10: lid | lsp_bits | ((numd & 0xffff) << 16),
            cdw11: (numd >> 16) & 0xffff,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
            timeout_ms: 5_000,
            result: 0,
        }
    }

    /// Issue Get Log Page (Discovery) into `buf`, sized by the caller.
    pub fn get_discovery_log_page(fd: std::os::unix::io::RawFd, lsp: bool, buf: &mut [u8]) -> nix::Result<()> {
        let mut cmd = build_get_log_page(NVME_LOG_LID_DISCOVERY, lsp, buf);
        unsafe { nvme_admin_cmd(fd, &mut cmd) }.map(|_| ())
    }

    /// Get Log Page (Supported Log Pages), used to probe whether the
    /// controller implements the optional "log pages supported" feature.
    pub fn get_supported_log_pages(fd: std::os::unix::io::RawFd, buf: &mut [u8]) -> nix::Result<()> {
        let mut cmd = build_get_log_page(NVME_LOG_LID_SUPPORTED, false, buf);
        unsafe { nvme_admin_cmd(fd, &mut cmd) }.map(|_| ())
    }
}

/// Parameters used to build a fabrics `connect`/`discover` argument string,
/// mirroring the kernel's documented `key=value,...` grammar.
#[derive(Debug, Clone, Default)]
pub struct ConnectArgs {
    pub transport: String,
    pub traddr: String,
    pub trsvcid: String,
    pub subsysnqn: String,
    pub host_traddr: String,
    pub host_iface: String,
    pub hostnqn: String,
    pub hostid: String,
    pub queue_size: Option<u32>,
    pub nr_io_queues: Option<u32>,
    pub nr_write_queues: Option<u32>,
    pub nr_poll_queues: Option<u32>,
    pub kato: Option<u32>,
    pub reconnect_delay: Option<u32>,
    pub ctrl_loss_tmo: Option<u32>,
    pub hdr_digest: bool,
    pub data_digest: bool,
    pub disable_sqflow: Option<bool>,
    /// DH-HMAC-CHAP host secret (`dhchap_secret`), from the identity file's
    /// `hostkey` or a per-controller override.
    pub dhchap_key: Option<String>,
    /// DH-HMAC-CHAP controller secret (`dhchap_ctrl_secret`), used for
    /// bi-directional authentication.
    pub dhchap_ctrl_key: Option<String>,
}

impl ConnectArgs {
    pub fn to_arg_string(&self, discover_only: bool) -> String {
        let mut parts = vec![
            format!("transport={}", self.transport),
            format!("traddr={}", self.traddr),
        ];
        if !self.trsvcid.is_empty() {
            parts.push(format!("trsvcid={}", self.trsvcid));
        }
        if !discover_only {
            parts.push(format!("nqn={}", self.subsysnqn));
        } else {
            parts.push(format!("nqn={}", crate::tid::WELL_KNOWN_DISC_NQN));
        }
        if !self.host_traddr.is_empty() {
            parts.push(format!("host_traddr={}", self.host_traddr));
        }
        if !self.host_iface.is_empty() {
            parts.push(format!("host_iface={}", self.host_iface));
        }
        if !self.hostnqn.is_empty() {
            parts.push(format!("hostnqn={}", self.hostnqn));
        }
        if !self.hostid.is_empty() {
            parts.push(format!("hostid={}", self.hostid));
        }
        if let Some(v) = self.queue_size {
            parts.push(format!("queue_size={}", v));
        }
        if let Some(v) = self.nr_io_queues {
            parts.push(format!("nr_io_queues={}", v));
        }
        if let Some(v) = self.nr_write_queues {
            parts.push(format!("nr_write_queues={}", v));
        }
        if let Some(v) = self.nr_poll_queues {
            parts.push(format!("nr_poll_queues={}", v));
        }
        if let Some(v) = self.kato {
            parts.push(format!("keep_alive_tmo={}", v));
        }
        if let Some(v) = self.reconnect_delay {
            parts.push(format!("reconnect_delay={}", v));
        }
        if let Some(v) = self.ctrl_loss_tmo {
            parts.push(format!("ctrl_loss_tmo={}", v));
        }
        if self.hdr_digest {
            parts.push("hdr_digest".to_string());
        }
        if self.data_digest {
            parts.push("data_digest".to_string());
        }
        if let Some(false) = self.disable_sqflow {
            parts.push("disable_sqflow=0".to_string());
        }
        if let Some(ref v) = self.dhchap_key {
            parts.push(format!("dhchap_secret={}", v));
        }
        if let Some(ref v) = self.dhchap_ctrl_key {
            parts.push(format!("dhchap_ctrl_secret={}", v));
        }
        parts.join(",")
    }
}

/// The outcome of a successful connect: the kernel-assigned device name
/// (e.g. `"nvme3"`).
pub type DeviceName = String;

/// Result of a DIM registration attempt against a Discovery Controller. The
/// exact register payload/response shape is intentionally opaque to the
/// core (see SPEC_FULL.md Open Question (a)) - this is as much as the state
/// machine needs to decide how to proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered,
    /// The controller doesn't implement the registration command.
    NotSupported,
    /// The controller answered but rejected the request; non-fatal, the
    /// state machine logs it once and proceeds to the next phase anyway.
    ProtocolError(String),
}

#[async_trait]
pub trait FabricDriver: Send + Sync {
    async fn connect(&self, tid: &Tid, args: &ConnectArgs) -> Result<DeviceName, FabricError>;
    /// Adopt an already-connected kernel device found by the Udev Bridge,
    /// in place of issuing a fresh `connect`. An error here just means the
    /// device vanished between discovery and adoption; the caller falls
    /// back to a normal `connect`.
    async fn init(&self, device: &str) -> Result<(), FabricError>;
    async fn disconnect(&self, device: &str) -> Result<(), FabricError>;
    async fn get_discovery_log_page(&self, device: &str, lsp: bool) -> Result<Vec<Dlpe>, FabricError>;
    async fn get_supported_log_pages(&self, device: &str) -> Result<bool, FabricError>;
    /// Send a DIM register command to a Discovery Controller. A transport
    /// error is treated as transient (the caller retries); `Ok` covers both
    /// "registered" and "controller answered but said no".
    async fn registration_ctlr(&self, device: &str) -> Result<RegistrationOutcome, FabricError>;
    /// The controller's `dctype` property (`"ddc"`/`"cdc"`/empty), used to
    /// skip the supported-log-pages probe on a centralized DC.
    async fn dctype(&self, device: &str) -> Result<String, FabricError>;
}

/// Talks to the real kernel via `/dev/nvme-fabrics` and NVMe admin ioctls.
pub struct LinuxFabric;

impl LinuxFabric {
    pub fn new() -> Self {
        Self
    }

    pub fn module_loaded() -> bool {
        std::path::Path::new(NVME_FABRICS_PATH).exists()
    }
}

impl Default for LinuxFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FabricDriver for LinuxFabric {
    async fn connect(&self, _tid: &Tid, args: &ConnectArgs) -> Result<DeviceName, FabricError> {
        let arg_string = args.to_arg_string(false);
        tokio::task::spawn_blocking(move || {
            let mut file = OpenOptions::new()
                .write(true)
                .read(true)
                .custom_flags(libc::O_EXCL)
                .open(NVME_FABRICS_PATH)
                .context(error::OpenSnafu { path: NVME_FABRICS_PATH })?;
            file.write_all(arg_string.as_bytes()).context(error::ConnectSnafu)?;
            let mut response = String::new();
            file.read_to_string(&mut response).context(error::ConnectSnafu)?;
            // Kernel replies with "instance=N" on success.
            let instance = response
                .trim()
                .strip_prefix("instance=")
                .and_then(|v| v.parse::<u32>().ok())
                .context(error::MalformedLogPageSnafu { offset: 0usize })?;
            Ok(format!("nvme{}", instance))
        })
        .await
        .expect("blocking connect task panicked")
    }

    async fn init(&self, device: &str) -> Result<(), FabricError> {
        let path = format!("/sys/class/nvme-fabrics/ctl/{}", device);
        let device = device.to_string();
        tokio::task::spawn_blocking(move || {
            std::fs::metadata(&path).map(|_| ()).context(error::OpenSnafu { path })
        })
        .await
        .expect("blocking init task panicked")
    }

    async fn disconnect(&self, device: &str) -> Result<(), FabricError> {
        let path = format!("/sys/class/nvme-fabrics/ctl/{}/delete_controller", device);
        let device = device.to_string();
        tokio::task::spawn_blocking(move || {
            std::fs::write(&path, "1").context(error::DisconnectSnafu { device })
        })
        .await
        .expect("blocking disconnect task panicked")
    }

    async fn get_discovery_log_page(&self, device: &str, lsp: bool) -> Result<Vec<Dlpe>, FabricError> {
        let path = format!("/dev/{}", device);
        let device = device.to_string();
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .context(error::OpenSnafu { path: path.clone() })?;
            let fd = file.as_raw_fd();

            // First pass: header only, to learn NUMREC.
            let mut header = vec![0u8; 1024];
            ioctl::get_discovery_log_page(fd, lsp, &mut header)
                .map_err(|e| FabricError::GetLogPage { device: device.clone(), source: std::io::Error::from(e) })?;
            let numrec = u64::from_le_bytes(header[8..16].try_into().unwrap());

            // Second pass: full page sized to the record count just read.
            // The generation counter may have advanced between the two
            // admin commands; decode_log_page tolerates a short trailing
            // record rather than erroring out.
            let full_len = 1024 + (numrec as usize) * 1024;
            let mut full = vec![0u8; full_len];
            ioctl::get_discovery_log_page(fd, lsp, &mut full)
                .map_err(|e| FabricError::GetLogPage { device: device.clone(), source: std::io::Error::from(e) })?;
            Ok(normalize_log_page(decode_log_page(&full)))
        })
        .await
        .expect("blocking get_discovery_log_page task panicked")
    }

    async fn get_supported_log_pages(&self, device: &str) -> Result<bool, FabricError> {
        let path = format!("/dev/{}", device);
        let device = device.to_string();
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .context(error::OpenSnafu { path: path.clone() })?;
            let fd = file.as_raw_fd();
            let mut buf = vec![0u8; 4096];
            match ioctl::get_supported_log_pages(fd, &mut buf) {
                Ok(()) => Ok(buf.iter().any(|&b| b != 0)),
                // Optional command - a controller that doesn't implement it
                // is not an error, it just doesn't support the feature.
                Err(_) => Ok(false),
            }
        })
        .await
        .expect("blocking get_supported_log_pages task panicked")
    }

    /// The DIM register payload is opaque to the core (Open Question (a)):
    /// this always reports `NotSupported` rather than guessing at a wire
    /// format nothing in the grounding pack defines. The retry/log-once
    /// policy around this call lives entirely in the state machine, so a
    /// real implementation can be dropped in here without touching it.
    async fn registration_ctlr(&self, _device: &str) -> Result<RegistrationOutcome, FabricError> {
        Ok(RegistrationOutcome::NotSupported)
    }

    async fn dctype(&self, device: &str) -> Result<String, FabricError> {
        let path = format!("/sys/class/nvme-fabrics/ctl/{}/dctype", device);
        let device = device.to_string();
        tokio::task::spawn_blocking(move || match std::fs::read_to_string(&path) {
            Ok(s) => Ok(s.trim().to_string()),
            // Older kernels don't expose `dctype` at all; treat as unknown
            // (the caller's default is to behave like a DDC).
            Err(_) => Ok(String::new()),
        })
        .await
        .expect("blocking dctype task panicked")
    }
}

/// In-memory double used by unit/integration tests: never touches the real
/// kernel, lets a test script connect/disconnect/fail calls deterministically.
#[derive(Default)]
pub struct FakeFabric {
    pub log_pages: std::sync::Mutex<std::collections::HashMap<String, Vec<Dlpe>>>,
    pub fail_connect: std::sync::atomic::AtomicBool,
    pub connected: std::sync::Mutex<Vec<(Tid, DeviceName)>>,
    next_instance: std::sync::atomic::AtomicU32,
    pub registration: std::sync::Mutex<Option<RegistrationOutcome>>,
    pub fail_registration: std::sync::atomic::AtomicBool,
    pub dctype: std::sync::Mutex<String>,
    pub fail_supported: std::sync::atomic::AtomicBool,
    pub fail_fetch: std::sync::atomic::AtomicBool,
    pub fail_init: std::sync::atomic::AtomicBool,
}

impl FakeFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_log_page(&self, key: &str, entries: Vec<Dlpe>) {
        self.log_pages.lock().unwrap().insert(key.to_string(), entries);
    }
}

#[async_trait]
impl FabricDriver for FakeFabric {
    async fn connect(&self, tid: &Tid, _args: &ConnectArgs) -> Result<DeviceName, FabricError> {
        if self.fail_connect.load(std::sync::atomic::Ordering::SeqCst) {
            let source = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "fake connect failure");
            return Err(FabricError::Connect { source });
        }
        let n = self.next_instance.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let device = format!("nvme{}", n);
        self.connected.lock().unwrap().push((tid.clone(), device.clone()));
        Ok(device)
    }

    async fn init(&self, device: &str) -> Result<(), FabricError> {
        if self.fail_init.load(std::sync::atomic::Ordering::SeqCst) {
            let source = std::io::Error::new(std::io::ErrorKind::NotFound, "fake adoption failure");
            return Err(FabricError::Open { path: device.to_string(), source });
        }
        Ok(())
    }

    async fn disconnect(&self, device: &str) -> Result<(), FabricError> {
        self.connected.lock().unwrap().retain(|(_, d)| d != device);
        Ok(())
    }

    async fn get_discovery_log_page(&self, device: &str, _lsp: bool) -> Result<Vec<Dlpe>, FabricError> {
        if self.fail_fetch.load(std::sync::atomic::Ordering::SeqCst) {
            let source = std::io::Error::new(std::io::ErrorKind::Other, "fake discovery-log-page failure");
            return Err(FabricError::GetLogPage { device: device.to_string(), source });
        }
        Ok(self.log_pages.lock().unwrap().get(device).cloned().unwrap_or_default())
    }

    async fn get_supported_log_pages(&self, _device: &str) -> Result<bool, FabricError> {
        if self.fail_supported.load(std::sync::atomic::Ordering::SeqCst) {
            let source = std::io::Error::new(std::io::ErrorKind::Other, "fake get-supported-log-pages failure");
            return Err(FabricError::GetLogPage { device: "fake".into(), source });
        }
        Ok(true)
    }

    async fn registration_ctlr(&self, _device: &str) -> Result<RegistrationOutcome, FabricError> {
        if self.fail_registration.load(std::sync::atomic::Ordering::SeqCst) {
            let source = std::io::Error::new(std::io::ErrorKind::Other, "fake registration failure");
            return Err(FabricError::Connect { source });
        }
        Ok(self.registration.lock().unwrap().clone().unwrap_or(RegistrationOutcome::NotSupported))
    }

    async fn dctype(&self, _device: &str) -> Result<String, FabricError> {
        Ok(self.dctype.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_args_minimal() {
        let args = ConnectArgs {
            transport: "tcp".into(),
            traddr: "10.0.0.1".into(),
            trsvcid: "8009".into(),
            subsysnqn: "nqn.test".into(),
            ..Default::default()
        };
        let s = args.to_arg_string(false);
        assert!(s.contains("transport=tcp"));
        assert!(s.contains("traddr=10.0.0.1"));
        assert!(s.contains("nqn=nqn.test"));
    }

    #[test]
    fn connect_args_discover_only_uses_well_known_nqn() {
        let args = ConnectArgs {
            transport: "tcp".into(),
            traddr: "10.0.0.1".into(),
            ..Default::default()
        };
        let s = args.to_arg_string(true);
        assert!(s.contains(crate::tid::WELL_KNOWN_DISC_NQN));
    }

    #[tokio::test]
    async fn fake_fabric_connect_disconnect_roundtrip() {
        let fabric = FakeFabric::new();
        let tid = Tid::new("tcp", "10.0.0.1", "8009", "nqn.test", "", "");
        let device = fabric.connect(&tid, &ConnectArgs::default()).await.unwrap();
        assert_eq!(fabric.connected.lock().unwrap().len(), 1);
        fabric.disconnect(&device).await.unwrap();
        assert_eq!(fabric.connected.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn fake_fabric_connect_failure() {
        let fabric = FakeFabric::new();
        fabric.fail_connect.store(true, std::sync::atomic::Ordering::SeqCst);
        let tid = Tid::new("tcp", "10.0.0.1", "8009", "nqn.test", "", "");
        let err = fabric.connect(&tid, &ConnectArgs::default()).await;
        assert!(err.is_err());
    }
}
