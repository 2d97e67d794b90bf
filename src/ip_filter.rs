use crate::ip_range::Cidr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Range {
    V4(u32, u32),
    V6(u128, u128),
}

impl Range {
    fn new(start: IpAddr, end: IpAddr) -> Option<Range> {
        match (start, end) {
            (IpAddr::V4(s), IpAddr::V4(e)) => {
                let (s, e) = (u32::from(s), u32::from(e));
                Some(Range::V4(s.min(e), s.max(e)))
            }
            (IpAddr::V6(s), IpAddr::V6(e)) => {
                let (s, e) = (u128::from(s), u128::from(e));
                Some(Range::V6(s.min(e), s.max(e)))
            }
            _ => None,
        }
    }

    fn contains(&self, addr: IpAddr) -> bool {
        match (self, addr) {
            (Range::V4(start, end), IpAddr::V4(ip)) => (*start..=*end).contains(&u32::from(ip)),
            (Range::V6(start, end), IpAddr::V6(ip)) => (*start..=*end).contains(&u128::from(ip)),
            _ => false,
        }
    }
}

/// Ordered allow/deny rules over inclusive address ranges. The last rule
/// covering an address decides; an address no rule covers is allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpFilter {
    rules: Vec<(Range, Access)>,
}

impl IpFilter {
    pub fn new() -> IpFilter {
        IpFilter::default()
    }

    /// mixed version ranges are ignored
    pub fn add_rule(&mut self, start: IpAddr, end: IpAddr, access: Access) {
        match Range::new(start, end) {
            Some(range) => self.rules.push((range, access)),
            None => log::warn!("ignoring mixed version filter rule {} - {}", start, end),
        }
    }

    pub fn add_network(&mut self, net: &Cidr, access: Access) {
        self.add_rule(net.first(), net.last(), access);
    }

    pub fn add_address(&mut self, addr: IpAddr, access: Access) {
        self.add_rule(addr, addr, access);
    }

    pub fn access(&self, addr: IpAddr) -> Access {
        self.rules
            .iter()
            .rev()
            .find(|(range, _)| range.contains(addr))
            .map(|(_, access)| *access)
            .unwrap_or(Access::Allow)
    }

    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        self.access(addr) == Access::Allow
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Immutable base of every filter used against one torrent.
///
/// Starts from deny-all, then allows tracker addresses so announces are never
/// blocked. Sampling adds its allowed ranges and self denials on top. Per peer
/// overrides are never stored here; see [`build_filter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRules {
    filter: IpFilter,
}

impl FilterRules {
    pub fn deny_all() -> FilterRules {
        FilterRules::allow_all().everything(Access::Deny)
    }

    /// base that lets every peer through, used when sampling is unrestricted
    pub fn allow_all() -> FilterRules {
        FilterRules {
            filter: IpFilter::new(),
        }
    }

    /// opens every address again on top of the rules so far
    pub fn allow_any(self) -> FilterRules {
        self.everything(Access::Allow)
    }

    fn everything(mut self, access: Access) -> FilterRules {
        self.filter.add_rule(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::BROADCAST),
            access,
        );
        self.filter.add_rule(
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            IpAddr::V6(Ipv6Addr::from(u128::MAX)),
            access,
        );
        self
    }

    pub fn allow_address(mut self, addr: IpAddr) -> FilterRules {
        self.filter.add_address(addr, Access::Allow);
        self
    }

    pub fn allow_network(mut self, net: &Cidr) -> FilterRules {
        self.filter.add_network(net, Access::Allow);
        self
    }

    pub fn deny_address(mut self, addr: IpAddr) -> FilterRules {
        self.filter.add_address(addr, Access::Deny);
        self
    }

    pub fn deny_network(mut self, net: &Cidr) -> FilterRules {
        self.filter.add_network(net, Access::Deny);
        self
    }

    /// rules of `self` followed by the rules of `other`, so `other` wins on overlap
    pub fn then(mut self, other: &FilterRules) -> FilterRules {
        self.filter.rules.extend(other.filter.rules.iter().copied());
        self
    }

    pub fn as_filter(&self) -> &IpFilter {
        &self.filter
    }
}

/// A fresh filter from `base`, optionally allowing exactly one more address.
/// Called per peer, so concurrent collections never share mutable state.
pub fn build_filter(base: &FilterRules, peer_override: Option<IpAddr>) -> IpFilter {
    let mut filter = base.filter.clone();
    if let Some(peer) = peer_override {
        filter.add_address(peer, Access::Allow);
    }
    filter
}
