//! CIDR allowlist check for the edge layer.

use ipnet::IpNet;
use std::net::IpAddr;

/// Optional allowlist of CIDR networks. An empty list allows everything
/// (mirrors the original's `if not allowed_hosts: return True`).
#[derive(Debug, Clone, Default)]
pub struct AccessList {
    networks: Vec<IpNet>,
}

impl AccessList {
    pub fn new(networks: Vec<IpNet>) -> Self {
        Self { networks }
    }

    pub fn parse(entries: &[String]) -> Result<Self, String> {
        let mut networks = Vec::with_capacity(entries.len());
        for entry in entries {
            let net: IpNet = entry
                .parse()
                .map_err(|e| format!("bad allowed-hosts entry '{entry}': {e}"))?;
            networks.push(net);
        }
        Ok(Self::new(networks))
    }

    pub fn allows(&self, addr: IpAddr) -> bool {
        if self.networks.is_empty() {
            return true;
        }
        self.networks.iter().any(|net| net.contains(&addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_allows_everything() {
        let acl = AccessList::default();
        assert!(acl.allows("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn denies_addresses_outside_allowlist() {
        let acl = AccessList::parse(&["192.168.0.0/24".to_string()]).unwrap();
        assert!(!acl.allows("10.0.0.5".parse().unwrap()));
        assert!(acl.allows("192.168.0.42".parse().unwrap()));
    }
}
