use crate::ip_range::Cidr;
use crate::locale::{Locale, Text};
use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct IpResponse {
    ip: String,
}

/// The operator's own public addresses. Peers matching them, or sitting in
/// the same IPv6 /64, are never collected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelfAddresses {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
}

impl SelfAddresses {
    pub fn none() -> SelfAddresses {
        SelfAddresses::default()
    }

    /// the /64 around our IPv6 address, so our other devices are not mistaken for remote peers
    pub fn v6_network(&self) -> Option<Cidr> {
        self.v6.map(Cidr::v6_prefix64)
    }

    pub fn is_self(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(ip) => self.v4 == Some(ip),
            IpAddr::V6(ip) => self.v6 == Some(ip),
        }
    }

    pub fn in_self_network(&self, addr: IpAddr) -> bool {
        self.v6_network().is_some_and(|net| net.contains(addr))
    }
}

/// Asks two "what is my ip" JSON services, one reachable only over IPv4 and
/// one only over IPv6. Each side is best effort.
#[derive(Debug, Clone)]
pub struct PublicIpResolver {
    ipv4_url: String,
    ipv6_url: String,
    timeout: Duration,
    locale: Locale,
}

impl PublicIpResolver {
    pub fn new(ipv4_url: &str, ipv6_url: &str, locale: Locale) -> PublicIpResolver {
        PublicIpResolver {
            ipv4_url: ipv4_url.to_string(),
            ipv6_url: ipv6_url.to_string(),
            timeout: Duration::from_secs(10),
            locale,
        }
    }

    pub fn resolve(&self) -> SelfAddresses {
        let v4 = match fetch(&self.ipv4_url, self.timeout) {
            Ok(IpAddr::V4(ip)) => Some(ip),
            Ok(other) => {
                log::warn!("{}: unexpected address {}", self.locale.text(Text::PublicIpv4Failed), other);
                None
            }
            Err(err) => {
                log::warn!("{}: {}", self.locale.text(Text::PublicIpv4Failed), err);
                None
            }
        };
        let v6 = match fetch(&self.ipv6_url, self.timeout) {
            Ok(IpAddr::V6(ip)) => Some(ip),
            Ok(other) => {
                log::warn!("{}: unexpected address {}", self.locale.text(Text::PublicIpv6Failed), other);
                None
            }
            Err(err) => {
                log::warn!("{}: {}", self.locale.text(Text::PublicIpv6Failed), err);
                None
            }
        };
        log::info!("public addresses: v4={:?} v6={:?}", v4, v6);
        SelfAddresses { v4, v6 }
    }
}

fn fetch(url: &str, timeout: Duration) -> Result<IpAddr> {
    let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
    let response: IpResponse = client.get(url).send()?.error_for_status()?.json()?;
    parse_ip(&response.ip)
}

fn parse_ip(text: &str) -> Result<IpAddr> {
    text.trim()
        .parse()
        .map_err(|_| anyhow!("service returned {:?}, not an ip address", text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_checks() {
        let me = SelfAddresses {
            v4: Some("203.0.113.5".parse().unwrap()),
            v6: Some("2400:4051:abcd:1200::10".parse().unwrap()),
        };
        assert!(me.is_self("203.0.113.5".parse().unwrap()));
        assert!(!me.is_self("203.0.113.6".parse().unwrap()));
        assert!(me.is_self("2400:4051:abcd:1200::10".parse().unwrap()));
        assert!(me.in_self_network("2400:4051:abcd:1200:5::1".parse().unwrap()));
        assert!(!me.in_self_network("2400:4051:abcd:1201::1".parse().unwrap()));
        assert!(!me.in_self_network("203.0.113.5".parse().unwrap()));
    }

    #[test]
    fn no_v6_means_no_network() {
        assert!(SelfAddresses::none().v6_network().is_none());
        assert!(!SelfAddresses::none().in_self_network("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn parses_service_payload() {
        let body: IpResponse = serde_json::from_str(r#"{"ip":"198.51.100.7"}"#).unwrap();
        assert_eq!(parse_ip(&body.ip).unwrap(), IpAddr::from([198, 51, 100, 7]));
        assert!(parse_ip("<html>").is_err());
    }
}
