use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;

/// A CIDR network. Parsing is permissive: host bits are masked off instead
/// of rejected, and a bare address is a single host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Cidr> {
        match addr {
            IpAddr::V4(ip) => {
                let (start, _) = cidr_v4(ip, prefix)?;
                Ok(Cidr {
                    network: IpAddr::V4(Ipv4Addr::from(start)),
                    prefix,
                })
            }
            IpAddr::V6(ip) => {
                let (start, _) = cidr_v6(ip, prefix)?;
                Ok(Cidr {
                    network: IpAddr::V6(Ipv6Addr::from(start)),
                    prefix,
                })
            }
        }
    }

    /// the /64 an IPv6 address sits in
    pub fn v6_prefix64(addr: Ipv6Addr) -> Cidr {
        let mask = !0u128 << 64;
        Cidr {
            network: IpAddr::V6(Ipv6Addr::from(u128::from(addr) & mask)),
            prefix: 64,
        }
    }

    pub fn version(&self) -> u8 {
        match self.network {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn first(&self) -> IpAddr {
        self.network
    }

    pub fn last(&self) -> IpAddr {
        match self.network {
            IpAddr::V4(ip) => {
                let (_, end) = cidr_v4(ip, self.prefix).unwrap_or((u32::from(ip), u32::from(ip)));
                IpAddr::V4(Ipv4Addr::from(end))
            }
            IpAddr::V6(ip) => {
                let (_, end) = cidr_v6(ip, self.prefix).unwrap_or((u128::from(ip), u128::from(ip)));
                IpAddr::V6(Ipv6Addr::from(end))
            }
        }
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let value = u32::from(ip);
                u32::from(net) <= value && value <= u32::from(self.last_v4())
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let value = u128::from(ip);
                u128::from(net) <= value && value <= u128::from(self.last_v6())
            }
            _ => false,
        }
    }

    fn last_v4(&self) -> Ipv4Addr {
        match self.last() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        }
    }

    fn last_v6(&self) -> Ipv6Addr {
        match self.last() {
            IpAddr::V6(ip) => ip,
            IpAddr::V4(_) => Ipv6Addr::UNSPECIFIED,
        }
    }
}

impl FromStr for Cidr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Cidr> {
        let s = s.trim();
        match s.split_once('/') {
            Some((base, prefix)) => {
                let ip = IpAddr::from_str(base.trim()).map_err(|_| anyhow!("invalid cidr ip {:?}", base))?;
                let prefix = prefix
                    .trim()
                    .parse::<u8>()
                    .map_err(|_| anyhow!("invalid cidr prefix {:?}", prefix))?;
                Cidr::new(ip, prefix)
            }
            None => {
                let ip = IpAddr::from_str(s).map_err(|_| anyhow!("invalid ip {:?}", s))?;
                let prefix = if ip.is_ipv4() { 32 } else { 128 };
                Cidr::new(ip, prefix)
            }
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

pub(crate) fn cidr_v4(ip: Ipv4Addr, prefix: u8) -> Result<(u32, u32)> {
    if prefix > 32 {
        return Err(anyhow!("cidr prefix out of range"));
    }
    let value = u32::from(ip);
    let mask = if prefix == 0 {
        0u32
    } else {
        (!0u32) << (32 - prefix)
    };
    let start = value & mask;
    let end = start | (!mask);
    Ok((start, end))
}

pub(crate) fn cidr_v6(ip: Ipv6Addr, prefix: u8) -> Result<(u128, u128)> {
    if prefix > 128 {
        return Err(anyhow!("cidr prefix out of range"));
    }
    let value = u128::from(ip);
    let mask = if prefix == 0 {
        0u128
    } else {
        (!0u128) << (128 - prefix)
    };
    let start = value & mask;
    let end = start | (!mask);
    Ok((start, end))
}

/// CIDR networks of one ip version, loaded once per sampling session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpRangeSet {
    networks: Vec<Cidr>,
}

impl IpRangeSet {
    /// Reads a newline separated CIDR list. An absent file is an empty set,
    /// lines of the other ip version and unparsable lines are skipped.
    pub fn load(path: &Path, version: u8) -> Result<IpRangeSet> {
        if !path.exists() {
            return Ok(IpRangeSet::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading ip ranges from {}", path.display()))?;
        Ok(Self::parse(&text, version))
    }

    pub fn parse(text: &str, version: u8) -> IpRangeSet {
        let mut networks = Vec::new();
        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.split_once('#').map(|(left, _)| left).unwrap_or(raw).trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<Cidr>() {
                Ok(net) if net.version() == version => networks.push(net),
                Ok(net) => log::warn!("line {}: {} is not IPv{}", line_no + 1, net, version),
                Err(err) => log::warn!("line {}: {}", line_no + 1, err),
            }
        }
        IpRangeSet { networks }
    }

    pub fn from_networks(networks: Vec<Cidr>) -> IpRangeSet {
        IpRangeSet { networks }
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cidr> {
        self.networks.iter()
    }
}
