//! IPv4/IPv6 address prefixes.
//!
//! A [`Prefix`] wraps an [`IpNet`] that always has its host bits cleared,
//! so equality, ordering and hashing only look at the network.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::PrefixError;

/// Address family of a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Number of address bits in this family.
    pub fn max_len(self) -> u8 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }

    /// Ethertype used when matching this family.
    pub fn ether_type(self) -> u16 {
        match self {
            Self::V4 => crate::types::ETH_TYPE_IPV4,
            Self::V6 => crate::types::ETH_TYPE_IPV6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "ipv4"),
            Self::V6 => write!(f, "ipv6"),
        }
    }
}

/// A network prefix such as `10.0.17.0/24` or `2001:db8::/48`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Prefix {
    net: IpNet,
}

impl Prefix {
    /// Builds a prefix, clearing any host bits in `addr`.
    pub fn new(addr: IpAddr, len: u8) -> Result<Self, PrefixError> {
        let net = IpNet::new(addr, len).map_err(|_| PrefixError::InvalidLength {
            len: len.to_string(),
            max: family_of(&addr).max_len(),
        })?;
        Ok(Self::from(net))
    }

    /// Host prefix (`/32` or `/128`) for a single address.
    pub fn host(addr: IpAddr) -> Self {
        Self {
            net: IpNet::from(addr),
        }
    }

    pub fn network(&self) -> IpAddr {
        self.net.network()
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    pub fn family(&self) -> AddressFamily {
        match self.net {
            IpNet::V4(_) => AddressFamily::V4,
            IpNet::V6(_) => AddressFamily::V6,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.family() == AddressFamily::V4
    }

    pub fn as_ipnet(&self) -> &IpNet {
        &self.net
    }

    /// Number of addresses covered, saturating at `u128::MAX` for `::/0`.
    pub fn host_count(&self) -> u128 {
        let bits = u32::from(self.net.max_prefix_len() - self.net.prefix_len());
        1u128.checked_shl(bits).unwrap_or(u128::MAX)
    }

    /// Host count as a float, used for address-space load ratios.
    pub fn host_units(&self) -> f64 {
        2f64.powi(i32::from(self.net.max_prefix_len() - self.net.prefix_len()))
    }

    /// `true` if `other` lies entirely inside `self`. Never across families.
    pub fn contains(&self, other: &Prefix) -> bool {
        self.net.contains(&other.net)
    }

    /// `true` if `addr` lies inside `self`.
    pub fn contains_addr(&self, addr: &IpAddr) -> bool {
        self.net.contains(addr)
    }

    /// `true` if the two ranges share any address.
    pub fn overlaps(&self, other: &Prefix) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// The two equal halves of this prefix, or `None` for a host prefix.
    pub fn split(&self) -> Option<(Prefix, Prefix)> {
        let mut halves = self.net.subnets(self.net.prefix_len().checked_add(1)?).ok()?;
        let left = halves.next()?;
        let right = halves.next()?;
        Some((Self::from(left), Self::from(right)))
    }

    /// The enclosing prefix one bit shorter, or `None` for `/0`.
    pub fn supernet(&self) -> Option<Prefix> {
        self.net.supernet().map(Self::from)
    }

    /// The other half of this prefix's supernet.
    pub fn sibling(&self) -> Option<Prefix> {
        let (left, right) = self.supernet()?.split()?;
        Some(if left == *self { right } else { left })
    }

    /// All subnets of length `new_len` in address order.
    ///
    /// At most 2^16 subnets are produced per call.
    pub fn subnets(&self, new_len: u8) -> Result<Vec<Prefix>, PrefixError> {
        let invalid = || PrefixError::InvalidLength {
            len: new_len.to_string(),
            max: self.net.max_prefix_len(),
        };
        if new_len < self.prefix_len() || new_len - self.prefix_len() > 16 {
            return Err(invalid());
        }
        let subnets = self.net.subnets(new_len).map_err(|_| invalid())?;
        Ok(subnets.map(Self::from).collect())
    }
}

impl From<IpNet> for Prefix {
    fn from(net: IpNet) -> Self {
        Self { net: net.trunc() }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.net, f)
    }
}

impl FromStr for Prefix {
    type Err = PrefixError;

    /// Parses `addr/len`; a bare address becomes a host prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PrefixError::Empty);
        }
        if let Ok(net) = s.parse::<IpNet>() {
            return Ok(Self::from(net));
        }
        let (addr_part, len_part) = match s.split_once('/') {
            Some((a, l)) => (a, Some(l)),
            None => (s, None),
        };
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| PrefixError::InvalidAddress(addr_part.to_owned()))?;
        match len_part {
            None => Ok(Self::host(addr)),
            Some(l) => Err(PrefixError::InvalidLength {
                len: l.to_owned(),
                max: family_of(&addr).max_len(),
            }),
        }
    }
}

impl<'de> Deserialize<'de> for Prefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn family_of(addr: &IpAddr) -> AddressFamily {
    match addr {
        IpAddr::V4(_) => AddressFamily::V4,
        IpAddr::V6(_) => AddressFamily::V6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display_v4() {
        let prefix = p("10.0.17.0/24");
        assert_eq!(prefix.to_string(), "10.0.17.0/24");
        assert_eq!(prefix.prefix_len(), 24);
        assert!(prefix.is_ipv4());
    }

    #[test]
    fn parse_masks_host_bits() {
        assert_eq!(p("10.0.20.2/24"), p("10.0.20.0/24"));
        assert_eq!(p("2001:0DB8::1/48").to_string(), "2001:db8::/48");
    }

    #[test]
    fn parse_bare_address_is_host_prefix() {
        assert_eq!(p("156.56.6.1").prefix_len(), 32);
        assert_eq!(p("2001:db8::1").prefix_len(), 128);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!("".parse::<Prefix>(), Err(PrefixError::Empty));
        assert!(matches!(
            "10.0.0/8".parse::<Prefix>(),
            Err(PrefixError::InvalidAddress(_))
        ));
        assert!(matches!(
            "10.0.0.0/33".parse::<Prefix>(),
            Err(PrefixError::InvalidLength { max: 32, .. })
        ));
        assert!(matches!(
            "10.0.0.0/x".parse::<Prefix>(),
            Err(PrefixError::InvalidLength { .. })
        ));
    }

    #[test]
    fn host_count_by_length() {
        assert_eq!(p("10.0.0.0/24").host_count(), 256);
        assert_eq!(p("10.0.0.1/32").host_count(), 1);
        assert_eq!(p("::/0").host_count(), u128::MAX);
        assert_eq!(p("0.0.0.0/0").host_count(), 1u128 << 32);
    }

    #[test]
    fn containment_is_family_aware() {
        let wide = p("10.0.0.0/8");
        assert!(wide.contains(&p("10.0.17.0/24")));
        assert!(!p("10.0.17.0/24").contains(&wide));
        assert!(wide.overlaps(&p("10.0.17.0/24")));
        assert!(!wide.overlaps(&p("11.0.0.0/8")));
        assert!(!p("::/0").contains(&wide));
        assert!(p("10.0.20.0/24").contains_addr(&"10.0.20.2".parse().unwrap()));
    }

    #[test]
    fn split_halves_prefix() {
        let (left, right) = p("10.0.0.0/11").split().unwrap();
        assert_eq!(left, p("10.0.0.0/12"));
        assert_eq!(right, p("10.16.0.0/12"));
        assert!(p("10.0.0.1/32").split().is_none());

        let (l6, r6) = p("2001:db8::/48").split().unwrap();
        assert_eq!(l6, p("2001:db8::/49"));
        assert_eq!(r6, p("2001:db8:0:8000::/49"));
    }

    #[test]
    fn supernet_and_sibling() {
        let child = p("10.0.18.128/25");
        assert_eq!(child.supernet(), Some(p("10.0.18.0/24")));
        assert_eq!(child.sibling(), Some(p("10.0.18.0/25")));
        assert_eq!(p("0.0.0.0/0").supernet(), None);
    }

    #[test]
    fn subnets_cover_parent() {
        let subs = p("10.0.0.0/8").subnets(10).unwrap();
        assert_eq!(
            subs,
            vec![
                p("10.0.0.0/10"),
                p("10.64.0.0/10"),
                p("10.128.0.0/10"),
                p("10.192.0.0/10"),
            ]
        );
        assert!(p("10.0.0.0/8").subnets(7).is_err());
        assert!(p("10.0.0.0/8").subnets(33).is_err());
    }

    #[test]
    fn from_ipnet_clears_host_bits() {
        // Given: a network with host bits set
        let net: IpNet = "10.0.20.2/24".parse().unwrap();

        // When: it is converted into a prefix
        let prefix = Prefix::from(net);

        // Then: only the network remains
        assert_eq!(prefix, p("10.0.20.0/24"));
        assert_eq!(prefix.as_ipnet().to_string(), "10.0.20.0/24");
        assert!(matches!(
            Prefix::new("10.0.0.0".parse().unwrap(), 40),
            Err(PrefixError::InvalidLength { max: 32, .. })
        ));
    }

    #[test]
    fn serde_as_string() {
        let json = serde_json::to_string(&p("10.0.17.0/24")).unwrap();
        assert_eq!(json, "\"10.0.17.0/24\"");
        let back: Prefix = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p("10.0.17.0/24"));
        assert!(serde_json::from_str::<Prefix>("\"nope\"").is_err());
    }
}
