//! DNS64 synthesis helper (RFC 6147, the synthesis step only).
//!
//! Shares the RFC 6052 codec with the datapath but takes no part in it: an
//! IPv6-only client that resolves a v4-only name gets a AAAA record built
//! by prefixing the A record with the NAT64 prefix, and the resulting
//! traffic lands on this gateway.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::net::lookup_host;

use crate::addr::Nat64Prefix;

/// Synthesize the AAAA form of an A record.
pub fn synthesize(prefix: &Nat64Prefix, addr: Ipv4Addr) -> Ipv6Addr {
    prefix.embed(addr)
}

/// One resolved name: its A records and their synthesized AAAA forms.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub domain: String,
    pub v4: Vec<Ipv4Addr>,
    pub synthesized: Vec<Ipv6Addr>,
    /// Native AAAA records, reported so callers can prefer them.
    pub native_v6: Vec<Ipv6Addr>,
}

/// Resolve a domain and synthesize AAAA records for every A record found.
pub async fn resolve(domain: &str, prefix: &Nat64Prefix) -> io::Result<Resolution> {
    // lookup_host needs a port; it is discarded with the socket addresses.
    let addrs = lookup_host((domain, 0)).await?;

    let mut v4 = Vec::new();
    let mut native_v6 = Vec::new();
    for addr in addrs {
        match addr.ip() {
            IpAddr::V4(a) => v4.push(a),
            IpAddr::V6(a) => native_v6.push(a),
        }
    }

    let synthesized = v4.iter().map(|a| synthesize(prefix, *a)).collect();
    Ok(Resolution {
        domain: domain.to_string(),
        v4,
        synthesized,
        native_v6,
    })
}
