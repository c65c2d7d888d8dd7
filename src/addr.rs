//! RFC 6052 NAT64 address codec.
//!
//! A NAT64 prefix is a 96-bit IPv6 prefix under which every IPv4 address has
//! a synthesized IPv6 form: the IPv4 address occupies the low-order 32 bits.
//! The well-known prefix `64:ff9b::/96` is the default.
//!
//! Only /96 prefixes are supported; RFC 6052 defines other lengths (with the
//! reserved byte at bit 64) but every deployment this gateway targets uses
//! /96, so other lengths are rejected when the configuration is loaded.
//! Addresses are always compared as 128-bit values, never as strings.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::Ipv6Net;

/// A validated 96-bit NAT64 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nat64Prefix([u8; 12]);

/// The well-known NAT64 prefix as a CIDR string for display/logging purposes.
pub const WELL_KNOWN_PREFIX_CIDR: &str = "64:ff9b::/96";

impl Nat64Prefix {
    /// The well-known prefix `64:ff9b::/96` (RFC 6052 §2.1).
    pub const WELL_KNOWN: Nat64Prefix =
        Nat64Prefix([0x00, 0x64, 0xff, 0x9b, 0, 0, 0, 0, 0, 0, 0, 0]);

    /// Build a prefix from a configured network.
    ///
    /// Returns an error for any prefix length other than /96.
    pub fn from_net(net: &Ipv6Net) -> Result<Self, String> {
        if net.prefix_len() != 96 {
            return Err(format!(
                "NAT64 prefix must be /96, got {}/{}",
                net.addr(),
                net.prefix_len()
            ));
        }
        let octets = net.addr().octets();
        let mut prefix = [0u8; 12];
        prefix.copy_from_slice(&octets[..12]);
        Ok(Self(prefix))
    }

    /// Check whether an IPv6 address lies under this prefix (first 96 bits).
    #[inline]
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        addr.octets()[..12] == self.0
    }

    /// Synthesize the IPv6 form of an IPv4 address under this prefix
    /// (RFC 6052 §2.2, /96 embedding).
    #[inline]
    pub fn embed(&self, addr: Ipv4Addr) -> Ipv6Addr {
        let v4 = addr.octets();
        let mut octets = [0u8; 16];
        octets[..12].copy_from_slice(&self.0);
        octets[12..].copy_from_slice(&v4);
        Ipv6Addr::from(octets)
    }

    /// Extract the embedded IPv4 address from a synthesized IPv6 address.
    /// Returns `None` if the address is not under this prefix.
    #[inline]
    pub fn extract(&self, addr: &Ipv6Addr) -> Option<Ipv4Addr> {
        if !self.contains(addr) {
            return None;
        }
        let octets = addr.octets();
        Some(Ipv4Addr::new(
            octets[12], octets[13], octets[14], octets[15],
        ))
    }
}

impl Default for Nat64Prefix {
    fn default() -> Self {
        Self::WELL_KNOWN
    }
}

impl std::fmt::Display for Nat64Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut octets = [0u8; 16];
        octets[..12].copy_from_slice(&self.0);
        write!(f, "{}/96", Ipv6Addr::from(octets))
    }
}
