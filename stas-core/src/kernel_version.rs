//! Loose kernel-release-string ordering, used to gate kernel-version-gated
//! features (TP8013 discovery log page extensions, host interface binding,
//! DH-HMAC-CHAP key support) without requiring a strict semver string.

use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;

static COMPONENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+|[a-zA-Z]+)").unwrap());

#[derive(Debug, Clone, Eq, PartialEq)]
enum Component {
    Num(u64),
    Word(String),
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Component::Num(a), Component::Num(b)) => a.cmp(b),
            (Component::Word(a), Component::Word(b)) => a.cmp(b),
            // Numbers and words aren't comparable in the original either;
            // treat numbers as always-lesser so orderings stay total.
            (Component::Num(_), Component::Word(_)) => Ordering::Less,
            (Component::Word(_), Component::Num(_)) => Ordering::Greater,
        }
    }
}

/// A loosely-parsed kernel release string (e.g. `"5.8.0-63-generic"`),
/// comparable against other instances or against plain strings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KernelVersion {
    components: Vec<Component>,
}

impl KernelVersion {
    pub fn parse(s: &str) -> Self {
        let components = COMPONENT
            .find_iter(s)
            .map(|m| {
                let text = m.as_str();
                match text.parse::<u64>() {
                    Ok(n) => Component::Num(n),
                    Err(_) => Component::Word(text.to_string()),
                }
            })
            .collect();
        Self { components }
    }

    pub fn current() -> Self {
        let release = nix::sys::utsname::uname()
            .map(|u| u.release().to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::parse(&release)
    }
}

impl PartialOrd for KernelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KernelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components.cmp(&other.components)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_trailing_flavor() {
        assert_eq!(KernelVersion::parse("5.8.0-63-generic"), KernelVersion::parse("5.8.0-63"));
        assert_ne!(KernelVersion::parse("5.8.0-63-generic"), KernelVersion::parse("5.8.0"));
    }

    #[test]
    fn less_than() {
        assert!(KernelVersion::parse("5.8.0-63-generic") < KernelVersion::parse("5.9"));
        assert!(!(KernelVersion::parse("5.8.0-63-generic") < KernelVersion::parse("5.7")));
    }

    #[test]
    fn greater_equal() {
        assert!(KernelVersion::parse("5.8.0-63-generic") >= KernelVersion::parse("5.8.0-63"));
        assert!(KernelVersion::parse("5.8.0-63-generic") >= KernelVersion::parse("5.7.0"));
        assert!(!(KernelVersion::parse("5.8.0-63-generic") >= KernelVersion::parse("5.9")));
    }
}
