//! Shared controller-lifecycle engine used by both host-side daemons:
//! stafd (the Finder, tracking Discovery Controllers) and stacd (the
//! Connector, maintaining I/O Controller connections).

pub mod config;
pub mod controller;
pub mod discovery;
pub mod dlpe;
pub mod error;
pub mod fabric;
pub mod identity;
pub mod ipc;
pub mod kernel_version;
pub mod lkc;
pub mod logging;
pub mod nbft;
pub mod reconciler;
pub mod registry;
pub mod tid;
pub mod timeparse;
pub mod udev_bridge;

/// Default config file path, mirroring the original's `/etc/stas/*.conf`
/// convention.
pub const DEFAULT_STAFD_CONF: &str = "/etc/stas/stafd.conf";
pub const DEFAULT_STACD_CONF: &str = "/etc/stas/stacd.conf";
pub const DEFAULT_ETC_NVME: &str = "/etc/nvme";

/// Verify the daemon is allowed to run at all: must be root, and the
/// kernel must have the `nvme-fabrics` module loaded. Returns a
/// single-line message suitable for a stderr print-and-exit, matching the
/// fatal-startup-error contract.
pub fn check_if_allowed_to_continue() -> Result<(), String> {
    if !nix::unistd::Uid::effective().is_root() {
        return Err("must be run as root".to_string());
    }
    if !fabric::LinuxFabric::module_loaded() {
        return Err("nvme-fabrics kernel module not loaded".to_string());
    }
    Ok(())
}

/// The `$RUNTIME_DIRECTORY` systemd sets for the unit, or `/run/<prog_name>`
/// when running outside systemd (or under a test harness).
pub fn runtime_directory(prog_name: &str) -> std::path::PathBuf {
    std::env::var_os("RUNTIME_DIRECTORY")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from(format!("/run/{}", prog_name)))
}
