//! Peer allow-list for the local media server

use std::collections::HashSet;
use std::net::IpAddr;

use crate::config_store::ALLOW_LIST_DISABLED;

/// Set of permitted peer addresses; `None` permits everyone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    entries: Option<HashSet<IpAddr>>,
}

impl AllowList {
    /// Parse `(192.168.0.2)(192.168.0.3)`, `192.168.0.2, 192.168.0.3` or `DISABLE`
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case(ALLOW_LIST_DISABLED) {
            return Self::default();
        }

        let entries = raw
            .split(|c: char| c == '(' || c == ')' || c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .filter_map(|s| match s.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    tracing::warn!(entry = %s, "Ignoring invalid allow-list entry");
                    None
                }
            })
            .collect();

        Self {
            entries: Some(entries),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.entries.is_none()
    }

    pub fn permits(&self, peer: IpAddr) -> bool {
        let Some(entries) = &self.entries else {
            return true;
        };
        let peer = match peer {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(peer),
            v4 => v4,
        };
        entries.contains(&peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disable_permits_all() {
        let list = AllowList::parse("DISABLE");
        assert!(list.is_disabled());
        assert!(list.permits("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_bracketed_list() {
        let list = AllowList::parse("(192.168.0.2)(192.168.0.3)");
        assert!(list.permits("192.168.0.2".parse().unwrap()));
        assert!(list.permits("::ffff:192.168.0.3".parse().unwrap()));
        assert!(!list.permits("192.168.0.4".parse().unwrap()));
    }

    #[test]
    fn test_comma_list_skips_garbage() {
        let list = AllowList::parse("10.0.0.1, not-an-ip,10.0.0.2");
        assert!(list.permits("10.0.0.2".parse().unwrap()));
        assert!(!list.is_disabled());
    }
}
