//! INI-style configuration file loader. Mirrors the permissive
//! "validate, fall back to default and log" policy of the original: a
//! malformed option never aborts the daemon, it just keeps the default.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ini::Ini;
use snafu::ResultExt;
use tracing::warn;

use crate::error::{self, ConfigError};
use crate::timeparse::timeparse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectScope {
    OnlyStasConnections,
    AllConnectionsMatchingDisconnectTrtypes,
    NoDisconnect,
}

#[derive(Debug, Clone)]
pub struct ControllerOverlay {
    pub transport: String,
    pub traddr: String,
    pub trsvcid: String,
    pub subsysnqn: String,
    pub host_traddr: String,
    pub host_iface: String,
    pub host_nqn: String,
    pub dhchap_secret: Option<String>,
    pub dhchap_ctrl_secret: Option<String>,
    pub hdr_digest: Option<bool>,
    pub data_digest: Option<bool>,
    pub nr_io_queues: Option<u32>,
    pub nr_write_queues: Option<u32>,
    pub nr_poll_queues: Option<u32>,
    pub queue_size: Option<u32>,
    pub kato: Option<u32>,
    pub reconnect_delay: Option<u32>,
    pub ctrl_loss_tmo: Option<u32>,
    pub disable_sqflow: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ExcludeEntry {
    pub transport: Option<String>,
    pub traddr: Option<String>,
    pub trsvcid: Option<String>,
    pub host_iface: Option<String>,
    pub subsysnqn: Option<String>,
}

impl ExcludeEntry {
    /// True when every key present in this entry matches the corresponding
    /// field of `transport`/`traddr`/`trsvcid`/`host_iface`/`subsysnqn`.
    /// Keys absent from the exclude entry are wildcards.
    pub fn matches(&self, transport: &str, traddr: &str, trsvcid: &str, host_iface: &str, subsysnqn: &str) -> bool {
        self.transport.as_deref().map_or(true, |v| v == transport)
            && self.traddr.as_deref().map_or(true, |v| v == traddr)
            && self.trsvcid.as_deref().map_or(true, |v| v == trsvcid)
            && self.host_iface.as_deref().map_or(true, |v| v == host_iface)
            && self.subsysnqn.as_deref().map_or(true, |v| v == subsysnqn)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    conf_file: PathBuf,
    pub tron: bool,
    pub kato: Option<u32>,
    pub ip_family: (bool, bool),
    pub queue_size: Option<u32>,
    pub hdr_digest: bool,
    pub data_digest: bool,
    pub ignore_iface: bool,
    pub pleo_enabled: bool,
    pub nr_io_queues: Option<u32>,
    pub ctrl_loss_tmo: Option<u32>,
    pub disable_sqflow: Option<bool>,
    pub nr_poll_queues: Option<u32>,
    pub nr_write_queues: Option<u32>,
    pub reconnect_delay: Option<u32>,
    pub zeroconf_enabled: bool,
    pub zeroconf_persistence_sec: f64,
    pub persistent_connections: bool,
    pub disconnect_scope: DisconnectScope,
    pub disconnect_trtypes: HashSet<String>,
    pub connect_attempts_on_ncc: u32,
    pub controllers: Vec<ControllerOverlay>,
    pub exclude: Vec<ExcludeEntry>,
}

fn get(ini: &Ini, section: &str, option: &str) -> Option<String> {
    ini.section(Some(section)).and_then(|s| s.get(option)).map(|s| s.trim().to_string())
}

fn checked_bool(ini: &Ini, section: &str, option: &str, default: bool, conf_file: &str) -> bool {
    match get(ini, section, option) {
        None => default,
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "true" => true,
            "false" => false,
            _ => {
                warn!(file = conf_file, section, option, value = %v, "invalid value, using default");
                default
            }
        },
    }
}

fn checked_enabled(ini: &Ini, section: &str, option: &str, default: bool, conf_file: &str) -> bool {
    match get(ini, section, option) {
        None => default,
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "enabled" => true,
            "disabled" => false,
            _ => {
                warn!(file = conf_file, section, option, value = %v, "invalid value, using default");
                default
            }
        },
    }
}

fn checked_int(ini: &Ini, section: &str, option: &str, conf_file: &str) -> Option<u32> {
    get(ini, section, option).and_then(|v| match v.parse::<u32>() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(file = conf_file, section, option, value = %v, "invalid integer, ignoring");
            None
        }
    })
}

/// Like `checked_int`, but additionally rejects values outside `[min, max]`
/// - the original's `queue-size` checker warns and falls back to the
/// built-in default rather than silently clamping into range.
fn checked_int_range(ini: &Ini, section: &str, option: &str, min: u32, max: u32, conf_file: &str) -> Option<u32> {
    checked_int(ini, section, option, conf_file).and_then(|n| {
        if (min..=max).contains(&n) {
            Some(n)
        } else {
            warn!(file = conf_file, section, option, value = n, min, max, "value out of range, using default");
            None
        }
    })
}

fn parse_ip_family(ini: &Ini, conf_file: &str) -> (bool, bool) {
    match get(ini, "Global", "ip-family").as_deref() {
        None => (true, true),
        Some("ipv4") => (true, false),
        Some("ipv6") => (false, true),
        Some("ipv4+ipv6") | Some("ipv6+ipv4") => (true, true),
        Some(v) => {
            warn!(file = conf_file, value = v, "invalid ip-family, using default");
            (true, true)
        }
    }
}

fn parse_disconnect_scope(ini: &Ini, conf_file: &str) -> DisconnectScope {
    match get(ini, "I/O controller connection management", "disconnect-scope").as_deref() {
        None | Some("only-stas-connections") => DisconnectScope::OnlyStasConnections,
        Some("all-connections-matching-disconnect-trtypes") => DisconnectScope::AllConnectionsMatchingDisconnectTrtypes,
        Some("no-disconnect") => DisconnectScope::NoDisconnect,
        Some(v) => {
            warn!(file = conf_file, value = v, "invalid disconnect-scope, using default");
            DisconnectScope::OnlyStasConnections
        }
    }
}

fn parse_disconnect_trtypes(ini: &Ini, conf_file: &str) -> HashSet<String> {
    const VALID: &[&str] = &["tcp", "rdma", "fc"];
    match get(ini, "I/O controller connection management", "disconnect-trtypes") {
        None => ["tcp"].iter().map(|s| s.to_string()).collect(),
        Some(v) => {
            let mut set = HashSet::new();
            for item in v.split('+') {
                let item = item.trim();
                if VALID.contains(&item) {
                    set.insert(item.to_string());
                } else {
                    warn!(file = conf_file, item, "invalid disconnect-trtypes entry, ignoring");
                }
            }
            if set.is_empty() {
                ["tcp"].iter().map(|s| s.to_string()).collect()
            } else {
                set
            }
        }
    }
}

fn parse_connect_attempts_on_ncc(ini: &Ini, conf_file: &str) -> u32 {
    match get(ini, "I/O controller connection management", "connect-attempts-on-ncc") {
        None => 0,
        Some(v) => v.parse().unwrap_or_else(|_| {
            warn!(file = conf_file, value = %v, "invalid connect-attempts-on-ncc, using default");
            0
        }),
    }
}

fn parse_controller_entry(line: &str) -> std::collections::HashMap<String, String> {
    let mut map = std::collections::HashMap::new();
    for field in split_on_commas_outside_brackets(line) {
        if let Some((k, v)) = field.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

/// Commas inside `[...]` (IPv6 literal lists are not bracketed here, but
/// dhchap secrets can contain `=` and `,`; this keeps splitting simple and
/// matches the plain `,`-delimited `key=value` grammar used by the format).
fn split_on_commas_outside_brackets(s: &str) -> Vec<String> {
    s.split(';').next().unwrap_or(s).split(',').map(|s| s.to_string()).collect()
}

fn parse_controllers(ini: &Ini) -> Vec<ControllerOverlay> {
    let mut out = Vec::new();
    if let Some(section) = ini.section(Some("Controllers")) {
        for (key, value) in section.iter() {
            if key != "controller" {
                continue;
            }
            let fields = parse_controller_entry(value);
            let get_f = |k: &str| fields.get(k).cloned().unwrap_or_default();
            out.push(ControllerOverlay {
                transport: get_f("transport"),
                traddr: get_f("traddr"),
                trsvcid: get_f("trsvcid"),
                subsysnqn: fields.get("subsysnqn").or_else(|| fields.get("nqn")).cloned().unwrap_or_default(),
                host_traddr: get_f("host-traddr"),
                host_iface: get_f("host-iface"),
                host_nqn: get_f("host-nqn"),
                dhchap_secret: fields.get("dhchap-secret").cloned(),
                dhchap_ctrl_secret: fields.get("dhchap-ctrl-secret").cloned(),
                hdr_digest: fields.get("hdr-digest").map(|v| v.eq_ignore_ascii_case("true")),
                data_digest: fields.get("data-digest").map(|v| v.eq_ignore_ascii_case("true")),
                nr_io_queues: fields.get("nr-io-queues").and_then(|v| v.parse().ok()),
                nr_write_queues: fields.get("nr-write-queues").and_then(|v| v.parse().ok()),
                nr_poll_queues: fields.get("nr-poll-queues").and_then(|v| v.parse().ok()),
                queue_size: fields.get("queue-size").and_then(|v| v.parse().ok()),
                kato: fields.get("kato").and_then(|v| v.parse().ok()),
                reconnect_delay: fields.get("reconnect-delay").and_then(|v| v.parse().ok()),
                ctrl_loss_tmo: fields.get("ctrl-loss-tmo").and_then(|v| v.parse().ok()),
                disable_sqflow: fields.get("disable-sqflow").map(|v| v.eq_ignore_ascii_case("true")),
            });
        }
    }
    out
}

fn parse_exclude(ini: &Ini) -> Vec<ExcludeEntry> {
    let mut out = Vec::new();
    if let Some(section) = ini.section(Some("Controllers")) {
        for (key, value) in section.iter() {
            // `blacklist` is a deprecated alias for `exclude`, merged here.
            if key != "exclude" && key != "blacklist" {
                continue;
            }
            let fields = parse_controller_entry(value);
            out.push(ExcludeEntry {
                transport: fields.get("transport").cloned(),
                traddr: fields.get("traddr").cloned(),
                trsvcid: fields.get("trsvcid").cloned(),
                host_iface: fields.get("host-iface").cloned(),
                subsysnqn: fields.get("subsysnqn").or_else(|| fields.get("nqn")).cloned(),
            });
        }
    }
    out
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let conf_file = path.to_string_lossy().into_owned();

        let ini = if path.exists() {
            Ini::load_from_file(path).context(error::ParseSnafu { path: conf_file.clone() })?
        } else {
            Ini::new()
        };

        let zeroconf_enabled = checked_enabled(&ini, "Service Discovery", "zeroconf", true, &conf_file);

        Ok(Self {
            conf_file: path.to_path_buf(),
            tron: checked_bool(&ini, "Global", "tron", false, &conf_file),
            kato: checked_int(&ini, "Global", "kato", &conf_file),
            ip_family: parse_ip_family(&ini, &conf_file),
            queue_size: checked_int_range(&ini, "Global", "queue-size", 16, 1024, &conf_file),
            hdr_digest: checked_bool(&ini, "Global", "hdr-digest", false, &conf_file),
            data_digest: checked_bool(&ini, "Global", "data-digest", false, &conf_file),
            ignore_iface: checked_bool(&ini, "Global", "ignore-iface", false, &conf_file),
            pleo_enabled: checked_enabled(&ini, "Global", "pleo", true, &conf_file),
            nr_io_queues: checked_int(&ini, "Global", "nr-io-queues", &conf_file),
            ctrl_loss_tmo: checked_int(&ini, "Global", "ctrl-loss-tmo", &conf_file),
            disable_sqflow: get(&ini, "Global", "disable-sqflow").map(|v| v.eq_ignore_ascii_case("true")),
            nr_poll_queues: checked_int(&ini, "Global", "nr-poll-queues", &conf_file),
            nr_write_queues: checked_int(&ini, "Global", "nr-write-queues", &conf_file),
            reconnect_delay: checked_int(&ini, "Global", "reconnect-delay", &conf_file),
            zeroconf_enabled,
            zeroconf_persistence_sec: get(&ini, "Discovery controller connection management", "zeroconf-connections-persistence")
                .and_then(|v| timeparse(&v))
                .unwrap_or(72.0 * 3600.0),
            persistent_connections: checked_bool(&ini, "Discovery controller connection management", "persistent-connections", true, &conf_file),
            disconnect_scope: parse_disconnect_scope(&ini, &conf_file),
            disconnect_trtypes: parse_disconnect_trtypes(&ini, &conf_file),
            connect_attempts_on_ncc: parse_connect_attempts_on_ncc(&ini, &conf_file),
            controllers: parse_controllers(&ini),
            exclude: parse_exclude(&ini),
        })
    }

    pub fn conf_file(&self) -> &Path {
        &self.conf_file
    }

    /// The mDNS/DNS-SD service types to browse for, empty when zeroconf is
    /// disabled.
    pub fn stypes(&self) -> Vec<&'static str> {
        if self.zeroconf_enabled {
            vec!["_nvme-disc._tcp", "_nvme-disc._udp"]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_conf(body: &str) -> tempfile_path::TempPath {
        tempfile_path::TempPath::new(body)
    }

    mod tempfile_path {
        use std::io::Write;
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        pub struct TempPath(pub std::path::PathBuf);
        impl TempPath {
            // Tests run concurrently within one process, so the pid alone
            // isn't a unique filename - add a per-call counter too.
            pub fn new(body: &str) -> Self {
                let n = COUNTER.fetch_add(1, Ordering::SeqCst);
                let mut path = std::env::temp_dir();
                path.push(format!("stas-core-test-{}-{}.conf", std::process::id(), n));
                let mut f = std::fs::File::create(&path).unwrap();
                f.write_all(body.as_bytes()).unwrap();
                Self(path)
            }
        }
        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }
        impl std::ops::Deref for TempPath {
            type Target = std::path::Path;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    }

    #[test]
    fn defaults_when_file_absent() {
        let cfg = Config::load("/nonexistent/path/stas.conf").unwrap();
        assert!(!cfg.tron);
        assert!(cfg.pleo_enabled);
        assert!(cfg.zeroconf_enabled);
        assert_eq!(cfg.disconnect_scope, DisconnectScope::OnlyStasConnections);
        assert!(cfg.disconnect_trtypes.contains("tcp"));
    }

    #[test]
    fn queue_size_out_of_range_falls_back_to_default() {
        let path = write_conf("[Global]\nqueue-size=2\n");
        let cfg = Config::load(&*path).unwrap();
        assert_eq!(cfg.queue_size, None);

        let path = write_conf("[Global]\nqueue-size=128\n");
        let cfg = Config::load(&*path).unwrap();
        assert_eq!(cfg.queue_size, Some(128));
    }

    #[test]
    fn blacklist_merges_into_exclude() {
        let path = write_conf("[Controllers]\nblacklist=traddr=10.0.0.9\n");
        let cfg = Config::load(&*path).unwrap();
        assert_eq!(cfg.exclude.len(), 1);
        assert_eq!(cfg.exclude[0].traddr.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn exclude_filter_wildcards_absent_keys() {
        let entry = ExcludeEntry {
            transport: None,
            traddr: Some("10.0.0.9".into()),
            trsvcid: None,
            host_iface: None,
            subsysnqn: None,
        };
        assert!(entry.matches("tcp", "10.0.0.9", "8009", "eth0", "nqn.x"));
        assert!(!entry.matches("tcp", "10.0.0.8", "8009", "eth0", "nqn.x"));
    }
}
