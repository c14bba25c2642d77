//! Transport Identifier: the primary key that identifies a controller
//! (Discovery or I/O) independent of which component discovered it.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Well-known NQN used to identify the kernel's generic Discovery
/// Controller subsystem.
pub const WELL_KNOWN_DISC_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

pub const RDMA_IP_PORT: &str = "4420";
pub const DISC_IP_PORT: &str = "8009";

/// Transport Identifier.
///
/// Equality and hashing intentionally differ in which fields they consider:
/// `Hash` is always computed over the short key (excluding `host_iface`), and
/// `Eq` uses the long key (short key + `host_iface`) only when *both* sides
/// carry a non-empty `host_iface` - otherwise it falls back to the short key.
/// This keeps `a == b => hash(a) == hash(b)`: any two TIDs considered equal
/// are necessarily short-key equal, hence hash equal too. Two TIDs that
/// differ only by `host_iface` end up with the same hash (allowed - hash
/// collisions are not a correctness issue) but may still compare unequal.
#[derive(Debug, Clone, Eq)]
pub struct Tid {
    pub transport: String,
    pub traddr: String,
    pub trsvcid: String,
    pub subsysnqn: String,
    pub host_traddr: String,
    pub host_iface: String,
}

impl Tid {
    pub fn new(
        transport: impl Into<String>,
        traddr: impl Into<String>,
        trsvcid: impl Into<String>,
        subsysnqn: impl Into<String>,
        host_traddr: impl Into<String>,
        host_iface: impl Into<String>,
    ) -> Self {
        let transport = transport.into();
        let trsvcid = {
            let t = trsvcid.into();
            if t.is_empty() {
                Self::default_port(&transport).to_string()
            } else {
                t
            }
        };
        Self {
            transport,
            traddr: traddr.into(),
            trsvcid,
            subsysnqn: subsysnqn.into(),
            host_traddr: host_traddr.into(),
            host_iface: host_iface.into(),
        }
    }

    /// Only `rdma` defaults to the I/O-controller port; every other
    /// transport (`tcp`, `fc`, `loop`) defaults to the discovery port -
    /// a `tcp` I/O Controller TID built without going through a DLPE or
    /// explicit `trsvcid` is the rare case, and the original makes the
    /// same unconditional choice at TID-construction time.
    fn default_port(transport: &str) -> &'static str {
        match transport {
            "rdma" => RDMA_IP_PORT,
            _ => DISC_IP_PORT,
        }
    }

    fn short_key(&self) -> (&str, &str, &str, &str, &str) {
        (
            self.transport.as_str(),
            self.traddr.as_str(),
            self.trsvcid.as_str(),
            self.subsysnqn.as_str(),
            self.host_traddr.as_str(),
        )
    }

    pub fn is_discovery(&self) -> bool {
        self.subsysnqn == WELL_KNOWN_DISC_NQN
    }

    /// A stable digest over the full key (including `host_iface`), used as
    /// an external identifier (log correlation, the LKC file) that must
    /// stay the same across process restarts - unlike `Hash`, which is only
    /// ever used within a single process's `HashMap`s.
    pub fn stable_digest(&self) -> String {
        let key = format!(
            "{}|{}|{}|{}|{}|{}",
            self.transport, self.traddr, self.trsvcid, self.subsysnqn, self.host_traddr, self.host_iface
        );
        format!("{:x}", md5::compute(key.as_bytes()))
    }
}

impl PartialEq for Tid {
    fn eq(&self, other: &Self) -> bool {
        if self.short_key() != other.short_key() {
            return false;
        }
        if !self.host_iface.is_empty() && !other.host_iface.is_empty() {
            self.host_iface == other.host_iface
        } else {
            true
        }
    }
}

impl Hash for Tid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.short_key().hash(state);
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nvme-fabrics trtype={} traddr={} trsvcid={} host_traddr={} host_iface={} subsysnqn={}",
            self.transport, self.traddr, self.trsvcid, self.host_traddr, self.host_iface, self.subsysnqn
        )
    }
}
