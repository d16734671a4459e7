//! Core addressing types shared by the allocator, the node fabric and routing.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// One fixed-size subnet assigned exclusively to a single node.
///
/// The block's gateway is its network address with the host part set to 1,
/// e.g. `192.168.11.0/24` has gateway `192.168.11.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressBlock(Ipv4Net);

impl AddressBlock {
    /// Wraps a subnet, normalising it to its network address.
    #[must_use]
    pub fn new(net: Ipv4Net) -> Self {
        Self(net.trunc())
    }

    /// Returns the underlying subnet.
    #[must_use]
    pub const fn net(&self) -> Ipv4Net {
        self.0
    }

    /// Returns the network address of the block.
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        self.0.network()
    }

    /// Returns the prefix length of the block.
    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    /// Returns the netmask of the block.
    #[must_use]
    pub fn netmask(&self) -> Ipv4Addr {
        self.0.netmask()
    }

    /// Returns the gateway address: network address with host part 1.
    ///
    /// Blocks too small for that (`/32`) use their only address, so the
    /// gateway always lies inside the block.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        let first = u32::from(self.0.network()).saturating_add(1);
        Ipv4Addr::from(first.min(u32::from(self.0.broadcast())))
    }

    /// Returns the gateway in `addr/prefix` form, as assigned to an interface.
    #[must_use]
    pub fn gateway_cidr(&self) -> String {
        format!("{}/{}", self.gateway(), self.prefix_len())
    }

    /// Checks whether two blocks share any address.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.0.contains(&other.0.network()) || other.0.contains(&self.0.network())
    }

    /// Checks whether the block contains the given address.
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.0.contains(&addr)
    }
}

impl fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AddressBlock {
    type Err = ipnet::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Net>().map(Self::new)
    }
}

impl From<Ipv4Net> for AddressBlock {
    fn from(net: Ipv4Net) -> Self {
        Self::new(net)
    }
}

/// A static route installed on one node towards a peer's block.
///
/// Route entries are installed, not stored: the orchestrator builds them from
/// plain values and hands them to the installing node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteEntry {
    /// The peer block being routed to.
    pub destination: AddressBlock,
    /// Next hop: an on-link address of the peer node.
    pub via: Ipv4Addr,
    /// Egress interface on the installing node.
    pub dev: String,
}

impl RouteEntry {
    /// Creates a new route entry.
    #[must_use]
    pub fn new(destination: AddressBlock, via: Ipv4Addr, dev: impl Into<String>) -> Self {
        Self {
            destination,
            via,
            dev: dev.into(),
        }
    }

    /// Renders the entry as `ip route` arguments.
    ///
    /// `replace` is used instead of `add` so that re-installing the same
    /// route is not an error.
    #[must_use]
    pub fn to_ip_args(&self) -> Vec<String> {
        vec![
            "route".to_string(),
            "replace".to_string(),
            self.destination.to_string(),
            "via".to_string(),
            self.via.to_string(),
            "dev".to_string(),
            self.dev.clone(),
        ]
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {} dev {}", self.destination, self.via, self.dev)
    }
}

/// Enumerates every ordered pair of distinct indices in `0..count`.
///
/// Yields `count * (count - 1)` pairs and never a self-pair.
pub fn ordered_pairs(count: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..count).flat_map(move |a| (0..count).filter(move |b| *b != a).map(move |b| (a, b)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn block(s: &str) -> AddressBlock {
        s.parse().expect("valid block")
    }

    // ==================== GATEWAY TESTS ====================

    #[test_case("192.168.11.0/24", "192.168.11.1" ; "first block")]
    #[test_case("192.168.200.0/24", "192.168.200.1" ; "high block")]
    #[test_case("10.0.4.0/22", "10.0.4.1" ; "wider block")]
    fn test_gateway_is_network_plus_one(net: &str, gw: &str) {
        let expected: Ipv4Addr = gw.parse().expect("valid ip");
        assert_eq!(block(net).gateway(), expected);
    }

    #[test_case("255.255.255.255/32", "255.255.255.255" ; "top of address space")]
    #[test_case("10.0.0.7/32", "10.0.0.7" ; "single address")]
    #[test_case("10.0.0.6/31", "10.0.0.7" ; "point to point")]
    fn test_gateway_stays_inside_tiny_blocks(net: &str, gw: &str) {
        let b = block(net);
        let expected: Ipv4Addr = gw.parse().expect("valid ip");
        assert_eq!(b.gateway(), expected);
        assert!(b.contains(b.gateway()));
    }

    #[test]
    fn test_block_is_normalised_to_network_address() {
        let b = block("192.168.11.77/24");
        assert_eq!(b.network(), Ipv4Addr::new(192, 168, 11, 0));
        assert_eq!(b.to_string(), "192.168.11.0/24");
    }

    #[test]
    fn test_gateway_cidr() {
        assert_eq!(block("192.168.12.0/24").gateway_cidr(), "192.168.12.1/24");
    }

    #[test]
    fn test_overlap_detection() {
        assert!(block("192.168.0.0/16").overlaps(&block("192.168.11.0/24")));
        assert!(!block("192.168.11.0/24").overlaps(&block("192.168.12.0/24")));
    }

    #[test]
    fn test_block_serde_is_plain_cidr_string() {
        let json = serde_json::to_string(&block("192.168.13.0/24")).expect("serialize");
        assert_eq!(json, "\"192.168.13.0/24\"");
    }

    // ==================== ROUTE TESTS ====================

    #[test]
    fn test_route_ip_args() {
        let route = RouteEntry::new(block("192.168.12.0/24"), Ipv4Addr::new(10, 0, 0, 2), "fog-eth0");
        assert_eq!(
            route.to_ip_args(),
            vec!["route", "replace", "192.168.12.0/24", "via", "10.0.0.2", "dev", "fog-eth0"]
        );
        assert_eq!(route.to_string(), "192.168.12.0/24 via 10.0.0.2 dev fog-eth0");
    }

    #[test_case(0, 0 ; "empty")]
    #[test_case(1, 0 ; "single node")]
    #[test_case(3, 6 ; "three nodes")]
    #[test_case(5, 20 ; "five nodes")]
    fn test_ordered_pairs_count(k: usize, expected: usize) {
        let pairs: Vec<_> = ordered_pairs(k).collect();
        assert_eq!(pairs.len(), expected);
        assert!(pairs.iter().all(|(a, b)| a != b));
    }
}
