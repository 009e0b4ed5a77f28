//! CIDR network ranges for address filtering

use std::{
    fmt,
    net::IpAddr,
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum ParseError {
    #[error("expected an address and prefix length like 10.0.0.0/8")]
    MissingPrefix,

    #[error("invalid address")]
    Address(#[from] std::net::AddrParseError),

    #[error("invalid prefix length {0}")]
    PrefixLength(String),
}

/// An IPv4 or IPv6 network in CIDR notation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct IpNetwork {
    address: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    /// Networks that should never be reachable from a link preview request
    pub(crate) fn private_ranges() -> Vec<Self> {
        [
            // IPv4 "this network", loopback, RFC 1918, CGNAT, link-local
            "0.0.0.0/8",
            "10.0.0.0/8",
            "100.64.0.0/10",
            "127.0.0.0/8",
            "169.254.0.0/16",
            "172.16.0.0/12",
            "192.0.0.0/24",
            "192.0.2.0/24",
            "192.168.0.0/16",
            "198.18.0.0/15",
            "198.51.100.0/24",
            "203.0.113.0/24",
            "224.0.0.0/4",
            "240.0.0.0/4",
            // IPv6 unspecified, loopback, ULA, link-local, multicast
            "::/128",
            "::1/128",
            "fc00::/7",
            "fe80::/10",
            "ff00::/8",
        ]
        .into_iter()
        .map(|s| s.parse().expect("hardcoded network should be valid"))
        .collect()
    }

    /// Returns whether `ip` is inside this network
    ///
    /// IPv4-mapped IPv6 addresses are compared as IPv4.
    pub(crate) fn contains(&self, ip: IpAddr) -> bool {
        match (self.address, ip.to_canonical()) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                let mask = v4_mask(self.prefix_len);
                u32::from(network) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                let mask = v6_mask(self.prefix_len);
                u128::from(network) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn v4_mask(prefix_len: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0)
}

fn v6_mask(prefix_len: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0)
}

impl FromStr for IpNetwork {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix_len) =
            s.split_once('/').ok_or(ParseError::MissingPrefix)?;
        let address: IpAddr = address.parse()?;

        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = prefix_len
            .parse::<u8>()
            .ok()
            .filter(|len| *len <= max)
            .ok_or_else(|| ParseError::PrefixLength(prefix_len.to_owned()))?;

        Ok(Self {
            address,
            prefix_len,
        })
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl<'de> Deserialize<'de> for IpNetwork {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::IpNetwork;

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("test address should be valid")
    }

    fn net(s: &str) -> IpNetwork {
        s.parse().expect("test network should be valid")
    }

    #[test]
    fn v4_membership() {
        let network = net("172.16.0.0/12");
        assert!(network.contains(ip("172.16.0.1")), "start of range");
        assert!(network.contains(ip("172.31.255.255")), "end of range");
        assert!(!network.contains(ip("172.32.0.0")), "past the range");
        assert!(!network.contains(ip("8.8.8.8")), "unrelated address");
    }

    #[test]
    fn v6_membership() {
        let network = net("fc00::/7");
        assert!(network.contains(ip("fd12:3456::1")), "ULA");
        assert!(!network.contains(ip("2001:db8::1")), "documentation range");
        assert!(!network.contains(ip("10.0.0.1")), "families never mix");
    }

    #[test]
    fn mapped_addresses_are_checked_as_v4() {
        assert!(
            net("127.0.0.0/8").contains(ip("::ffff:127.0.0.1")),
            "mapped loopback should be caught"
        );
    }

    #[test]
    fn edge_prefix_lengths() {
        assert!(net("0.0.0.0/0").contains(ip("203.0.113.9")), "/0 is all");
        assert!(net("::/0").contains(ip("2001:db8::1")), "/0 is all");
        assert!(
            net("192.0.2.1/32").contains(ip("192.0.2.1")),
            "a host route contains its own address"
        );
        assert!(
            !net("192.0.2.1/32").contains(ip("192.0.2.2")),
            "a host route contains nothing else"
        );
    }

    #[test]
    fn rejects_malformed_networks() {
        for s in ["10.0.0.0", "10.0.0.0/33", "::/129", "nonsense/8", "10/8"] {
            assert!(s.parse::<IpNetwork>().is_err(), "{s:?} should be invalid");
        }
    }

    #[test]
    fn private_ranges_cover_the_usual_suspects() {
        let ranges = IpNetwork::private_ranges();
        for addr in [
            "127.0.0.1",
            "10.1.2.3",
            "192.168.1.1",
            "169.254.169.254",
            "100.100.100.100",
            "::1",
            "fe80::1",
        ] {
            assert!(
                ranges.iter().any(|n| n.contains(ip(addr))),
                "{addr} should be private"
            );
        }
        assert!(
            !ranges.iter().any(|n| n.contains(ip("93.184.216.34"))),
            "public address should not be private"
        );
    }
}
