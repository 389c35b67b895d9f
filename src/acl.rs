use crate::config::{ListenerConfig, Subnet};
use std::net::IpAddr;

/// Allow/deny list evaluated against a connection's remote IP.
///
/// Evaluation order is fixed: `deny` first (terminal), then `allow`
/// (empty means accept-any), then reject.
#[derive(Debug, Clone)]
pub struct Acl {
    allow: Vec<Subnet>,
    deny: Vec<Subnet>,
}

impl Acl {
    pub fn new(allow: Vec<Subnet>, deny: Vec<Subnet>) -> Self {
        Self { allow, deny }
    }

    pub fn from_config(cfg: &ListenerConfig) -> Self {
        Self::new(cfg.allow.clone(), cfg.deny.clone())
    }

    /// Returns `true` if `ip` is permitted to connect.
    pub fn check(&self, ip: IpAddr) -> bool {
        if self.deny.iter().any(|s| s.contains(ip)) {
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        self.allow.iter().any(|s| s.contains(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(s: &str) -> Subnet {
        Subnet(s.parse().unwrap())
    }

    #[test]
    fn deny_is_terminal_even_if_also_allowed() {
        let acl = Acl::new(vec![subnet("10.0.0.0/8")], vec![subnet("10.1.0.0/16")]);
        assert!(!acl.check("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn empty_allow_accepts_anything_not_denied() {
        let acl = Acl::new(vec![], vec![subnet("10.1.0.0/16")]);
        assert!(acl.check("8.8.8.8".parse().unwrap()));
        assert!(!acl.check("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn nonempty_allow_rejects_unlisted() {
        let acl = Acl::new(vec![subnet("10.0.0.0/8")], vec![]);
        assert!(acl.check("10.2.3.4".parse().unwrap()));
        assert!(!acl.check("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn ipv6_subnets_work() {
        let acl = Acl::new(vec![subnet("fe80::/10")], vec![]);
        assert!(acl.check("fe80::1".parse().unwrap()));
        assert!(!acl.check("2001:db8::1".parse().unwrap()));
    }
}
