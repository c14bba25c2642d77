//! Discovery Log Page Entry: one row of a Discovery Controller's Discovery
//! Log Page, plus the filtering/normalization rules applied to raw log
//! pages before they become part of a Controller's desired set.

use serde::{Deserialize, Serialize};

use crate::tid::Tid;

/// Bit 0 of `eflags`: "Not Connected to CDC" - set when the subsystem
/// signals that the CDC does not yet know about this host, so reconnection
/// attempts should be bounded.
pub const NVMF_DISC_EFLAGS_NCC: u16 = 0x1;

/// The discovery-log-page-changed composite AEN value:
/// `(NVME_LOG_LID_DISCOVERY << 16) | (NVME_AER_NOTICE_DISC_CHANGED << 8) | NVME_AER_NOTICE`.
pub const DLP_CHANGED: u32 = 0x70f002;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dlpe {
    pub trtype: String,
    pub adrfam: String,
    pub subtype: String,
    pub treq: String,
    pub portid: u16,
    pub trsvcid: String,
    pub subnqn: String,
    pub traddr: String,
    pub eflags: u16,
    pub cntlid: u16,
    pub asqsz: u16,
}

impl Dlpe {
    pub fn ncc(&self) -> bool {
        self.eflags & NVMF_DISC_EFLAGS_NCC != 0
    }

    /// `true` when the entry refers to a referral to another Discovery
    /// Controller rather than to an I/O Controller.
    pub fn is_referral(&self) -> bool {
        self.subtype.eq_ignore_ascii_case("referral") || self.subtype.eq_ignore_ascii_case("nvmdiscovery")
    }

    /// A DLPE with an unusable address (`0.0.0.0`, `::`, or empty) cannot
    /// be connected to and must be dropped before being added to any
    /// desired set.
    pub fn has_usable_address(&self) -> bool {
        let a = self.traddr.trim();
        !(a.is_empty() || a == "0.0.0.0" || a == "::")
    }

    /// Build the Transport ID this entry would connect through, given the
    /// host-side fields (`host_traddr`/`host_iface`) inherited from the
    /// Discovery Controller it was retrieved from.
    pub fn to_tid(&self, host_traddr: &str, host_iface: &str) -> Tid {
        Tid::new(
            self.trtype.clone(),
            self.traddr.trim().to_string(),
            self.trsvcid.trim().to_string(),
            self.subnqn.trim().to_string(),
            host_traddr.to_string(),
            host_iface.to_string(),
        )
    }
}

/// Filter and normalize a raw discovery log page: drop entries with
/// unusable addresses, and trim whitespace from string fields (the kernel
/// occasionally pads fixed-width fields).
pub fn normalize_log_page(entries: Vec<Dlpe>) -> Vec<Dlpe> {
    entries
        .into_iter()
        .map(|mut e| {
            e.traddr = e.traddr.trim().to_string();
            e.trsvcid = e.trsvcid.trim().to_string();
            e.subnqn = e.subnqn.trim().to_string();
            e.trtype = e.trtype.trim().to_string();
            e
        })
        .filter(Dlpe::has_usable_address)
        .collect()
}

/// Extract the referral subset of a log page: entries that point at other
/// Discovery Controllers rather than I/O Controllers.
pub fn referrals(entries: &[Dlpe]) -> Vec<&Dlpe> {
    entries.iter().filter(|e| e.is_referral()).collect()
}

const LOG_PAGE_HEADER_LEN: usize = 1024;
const LOG_PAGE_RECORD_LEN: usize = 1024;

fn trtype_str(v: u8) -> String {
    match v {
        1 => "rdma".to_string(),
        2 => "fc".to_string(),
        3 => "tcp".to_string(),
        254 => "loop".to_string(),
        other => other.to_string(),
    }
}

fn adrfam_str(v: u8) -> String {
    match v {
        1 => "ipv4".to_string(),
        2 => "ipv6".to_string(),
        3 => "ib".to_string(),
        4 => "fc".to_string(),
        0 => "".to_string(),
        other => other.to_string(),
    }
}

fn subtype_str(v: u8) -> String {
    match v {
        1 => "referral".to_string(),
        2 => "nvmsubsystem".to_string(),
        other => other.to_string(),
    }
}

fn treq_str(v: u8) -> String {
    match v & 0x3 {
        1 => "required".to_string(),
        2 => "not required".to_string(),
        _ => "not specified".to_string(),
    }
}

fn ascii_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

/// Decode a raw NVMe-oF Discovery Log Page (header + fixed-size records) as
/// returned by the kernel's Get Log Page admin command. Entries with a
/// record that doesn't fully fit in `raw` are silently dropped rather than
/// causing the whole page to fail to decode - a truncated trailing record
/// can happen if the generation counter advanced between the two admin
/// commands used to size and then fetch the log page.
pub fn decode_log_page(raw: &[u8]) -> Vec<Dlpe> {
    if raw.len() < LOG_PAGE_HEADER_LEN {
        return Vec::new();
    }
    let numrec = u64::from_le_bytes(raw[8..16].try_into().unwrap());
    let mut entries = Vec::with_capacity(numrec as usize);
    for i in 0..numrec {
        let start = LOG_PAGE_HEADER_LEN + (i as usize) * LOG_PAGE_RECORD_LEN;
        let end = start + LOG_PAGE_RECORD_LEN;
        if end > raw.len() {
            break;
        }
        let rec = &raw[start..end];
        entries.push(Dlpe {
            trtype: trtype_str(rec[0]),
            adrfam: adrfam_str(rec[1]),
            subtype: subtype_str(rec[2]),
            treq: treq_str(rec[3]),
            portid: u16::from_le_bytes([rec[4], rec[5]]),
            cntlid: u16::from_le_bytes([rec[6], rec[7]]),
            asqsz: u16::from_le_bytes([rec[8], rec[9]]),
            eflags: u16::from_le_bytes([rec[10], rec[11]]),
            trsvcid: ascii_field(&rec[32..64]),
            subnqn: ascii_field(&rec[256..512]),
            traddr: ascii_field(&rec[512..768]),
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(traddr: &str, subtype: &str) -> Dlpe {
        Dlpe {
            trtype: "tcp".into(),
            adrfam: "ipv4".into(),
            subtype: subtype.into(),
            treq: "not specified".into(),
            portid: 1,
            trsvcid: " 8009 ".into(),
            subnqn: " nqn.test ".into(),
            traddr: traddr.into(),
            eflags: 0,
            cntlid: 0,
            asqsz: 0,
        }
    }

    #[test]
    fn filters_unusable_addresses() {
        let raw = vec![entry("0.0.0.0", "nvmsubsystem"), entry("::", "nvmsubsystem"), entry("", "nvmsubsystem"), entry("10.0.0.5", "nvmsubsystem")];
        let out = normalize_log_page(raw);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].traddr, "10.0.0.5");
    }

    #[test]
    fn normalizes_whitespace() {
        let out = normalize_log_page(vec![entry("10.0.0.5", "nvmsubsystem")]);
        assert_eq!(out[0].trsvcid, "8009");
        assert_eq!(out[0].subnqn, "nqn.test");
    }

    #[test]
    fn referral_subset() {
        let entries = vec![entry("10.0.0.1", "referral"), entry("10.0.0.2", "nvmsubsystem")];
        let refs = referrals(&entries);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].traddr, "10.0.0.1");
    }

    #[test]
    fn ncc_bit() {
        let mut e = entry("10.0.0.1", "nvmsubsystem");
        assert!(!e.ncc());
        e.eflags = NVMF_DISC_EFLAGS_NCC;
        assert!(e.ncc());
    }

    #[test]
    fn idempotent_normalization() {
        let once = normalize_log_page(vec![entry("10.0.0.5", "nvmsubsystem")]);
        let twice = normalize_log_page(once.clone());
        assert_eq!(once, twice);
    }

    fn raw_page(records: &[(u8, &str, &str)]) -> Vec<u8> {
        let mut buf = vec![0u8; LOG_PAGE_HEADER_LEN];
        buf[8..16].copy_from_slice(&(records.len() as u64).to_le_bytes());
        for (subtype, subnqn, traddr) in records {
            let mut rec = vec![0u8; LOG_PAGE_RECORD_LEN];
            rec[0] = 3; // tcp
            rec[1] = 1; // ipv4
            rec[2] = *subtype;
            rec[3] = 0;
            rec[4..6].copy_from_slice(&4420u16.to_le_bytes());
            rec[32..32 + 4].copy_from_slice(b"8009");
            rec[256..256 + subnqn.len()].copy_from_slice(subnqn.as_bytes());
            rec[512..512 + traddr.len()].copy_from_slice(traddr.as_bytes());
            buf.extend_from_slice(&rec);
        }
        buf
    }

    #[test]
    fn decodes_header_and_records() {
        let raw = raw_page(&[(2, "nqn.test.one", "10.0.0.1"), (1, "nqn.test.two", "10.0.0.2")]);
        let entries = decode_log_page(&raw);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].trtype, "tcp");
        assert_eq!(entries[0].adrfam, "ipv4");
        assert_eq!(entries[0].subtype, "nvmsubsystem");
        assert_eq!(entries[0].subnqn, "nqn.test.one");
        assert_eq!(entries[0].traddr, "10.0.0.1");
        assert_eq!(entries[0].portid, 4420);
        assert_eq!(entries[1].subtype, "referral");
    }

    #[test]
    fn decode_empty_page_has_no_entries() {
        let raw = raw_page(&[]);
        assert!(decode_log_page(&raw).is_empty());
    }

    #[test]
    fn decode_drops_truncated_trailing_record() {
        let mut raw = raw_page(&[(1, "nqn.test.one", "10.0.0.1"), (1, "nqn.test.two", "10.0.0.2")]);
        raw.truncate(raw.len() - 10);
        let entries = decode_log_page(&raw);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn decode_too_short_for_header_is_empty() {
        assert!(decode_log_page(&[0u8; 10]).is_empty());
    }
}
