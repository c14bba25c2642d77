//! System identity: `hostnqn`, `hostid`, and the optional DH-HMAC-CHAP
//! `hostkey`, read from `/etc/nvme/{hostnqn,hostid,hostkey}` (or wherever
//! config points), each of which may be either an inline value or a
//! `file://<path>` indirection to read from instead.

use std::path::Path;

use snafu::ResultExt;

use crate::error::{self, ConfigError};

fn resolve(value: &str) -> Result<String, ConfigError> {
    match value.strip_prefix("file://") {
        Some(path) => {
            let contents = std::fs::read_to_string(path).context(error::ReadIdentitySnafu { path: path.to_string() })?;
            Ok(contents.split_whitespace().next().unwrap_or("").to_string())
        }
        None => Ok(value.trim().to_string()),
    }
}

pub fn read_identity_file(path: impl AsRef<Path>) -> Result<String, ConfigError> {
    let path_ref = path.as_ref();
    let raw = std::fs::read_to_string(path_ref)
        .context(error::ReadIdentitySnafu { path: path_ref.to_string_lossy().into_owned() })?;
    resolve(raw.trim())
}

#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub hostnqn: String,
    pub hostid: String,
    pub hostkey: Option<String>,
    pub hostsymname: Option<String>,
}

impl Identity {
    pub fn load(etc_nvme: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = etc_nvme.as_ref();
        let hostnqn = read_identity_file(dir.join("hostnqn"))?;
        let hostid = read_identity_file(dir.join("hostid"))?;
        let hostkey = read_identity_file(dir.join("hostkey")).ok();
        let hostsymname = read_identity_file(dir.join("hostsymname")).ok();
        Ok(Self { hostnqn, hostid, hostkey, hostsymname })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_inline_value() {
        assert_eq!(resolve("nqn.2014-08.org.nvmexpress:uuid:abc").unwrap(), "nqn.2014-08.org.nvmexpress:uuid:abc");
    }

    #[test]
    fn resolves_file_indirection() {
        let dir = std::env::temp_dir().join(format!("stas-core-identity-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let target = dir.join("real-hostnqn");
        std::fs::write(&target, "nqn.from-file\n").unwrap();
        let value = resolve(&format!("file://{}", target.to_string_lossy())).unwrap();
        assert_eq!(value, "nqn.from-file");
        std::fs::remove_dir_all(&dir).ok();
    }
}
