//! Datapath counters and observability snapshots.
//!
//! Atomic counters replace per-packet logging in the hot path; external
//! consumers (an HTTP status server, a CLI) read consistent point-in-time
//! snapshots instead of touching gateway internals.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::session::TableStats;

/// Performance and drop counters for the datapath.
#[derive(Debug, Default)]
pub struct GatewayStats {
    /// Packets read from the IPv6-facing tunnel.
    pub v6_packets_in: AtomicU64,
    /// Packets read from the IPv4-facing tunnel.
    pub v4_packets_in: AtomicU64,
    /// Translated packets written towards the IPv4 side.
    pub v4_packets_out: AtomicU64,
    /// Translated packets written towards the IPv6 side.
    pub v6_packets_out: AtomicU64,
    /// Bytes carried IPv6 -> IPv4.
    pub bytes_6to4: AtomicU64,
    /// Bytes carried IPv4 -> IPv6.
    pub bytes_4to6: AtomicU64,

    /// Datagrams that failed header decoding.
    pub drops_parse: AtomicU64,
    /// Transport protocols and ICMP types with no translation.
    pub drops_unsupported: AtomicU64,
    /// IPv6 destinations outside the NAT64 prefix.
    pub drops_not_nat64: AtomicU64,
    /// Session creation failed: the port range is fully allocated.
    pub drops_port_exhausted: AtomicU64,
    /// Packet channel or writer channel was full.
    pub drops_backpressure: AtomicU64,
    /// Translation failed (hop-limit expiry, malformed ICMP payloads).
    pub drops_translate: AtomicU64,
    /// Returning packets with no live session.
    pub drops_no_session: AtomicU64,
    /// Tunnel read/write failures survived so far.
    pub tunnel_io_errors: AtomicU64,
}

impl GatewayStats {
    /// Create a stats block with all counters zeroed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of every counter plus session-table aggregates.
    pub fn snapshot(&self, table: TableStats) -> StatsSnapshot {
        StatsSnapshot {
            total_sessions: table.total_sessions,
            tcp_sessions: table.tcp_sessions,
            udp_sessions: table.udp_sessions,
            icmp_sessions: table.icmp_sessions,
            allocated_ports: table.allocated_ports,
            session_bytes_out: table.bytes_out,
            session_bytes_in: table.bytes_in,
            v6_packets_in: self.v6_packets_in.load(Ordering::Relaxed),
            v4_packets_in: self.v4_packets_in.load(Ordering::Relaxed),
            v4_packets_out: self.v4_packets_out.load(Ordering::Relaxed),
            v6_packets_out: self.v6_packets_out.load(Ordering::Relaxed),
            bytes_6to4: self.bytes_6to4.load(Ordering::Relaxed),
            bytes_4to6: self.bytes_4to6.load(Ordering::Relaxed),
            drops: DropCounters {
                parse: self.drops_parse.load(Ordering::Relaxed),
                unsupported: self.drops_unsupported.load(Ordering::Relaxed),
                not_nat64: self.drops_not_nat64.load(Ordering::Relaxed),
                port_exhausted: self.drops_port_exhausted.load(Ordering::Relaxed),
                backpressure: self.drops_backpressure.load(Ordering::Relaxed),
                translate: self.drops_translate.load(Ordering::Relaxed),
                no_session: self.drops_no_session.load(Ordering::Relaxed),
            },
            tunnel_io_errors: self.tunnel_io_errors.load(Ordering::Relaxed),
        }
    }
}

/// Drop counters, grouped for serialization.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DropCounters {
    pub parse: u64,
    pub unsupported: u64,
    pub not_nat64: u64,
    pub port_exhausted: u64,
    pub backpressure: u64,
    pub translate: u64,
    pub no_session: u64,
}

/// Aggregate observability snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_sessions: usize,
    pub tcp_sessions: usize,
    pub udp_sessions: usize,
    pub icmp_sessions: usize,
    pub allocated_ports: usize,
    pub session_bytes_out: u64,
    pub session_bytes_in: u64,
    pub v6_packets_in: u64,
    pub v4_packets_in: u64,
    pub v4_packets_out: u64,
    pub v6_packets_out: u64,
    pub bytes_6to4: u64,
    pub bytes_4to6: u64,
    pub drops: DropCounters,
    pub tunnel_io_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_copies_counters() {
        let stats = GatewayStats::new();
        stats.v6_packets_in.fetch_add(7, Ordering::Relaxed);
        stats.drops_not_nat64.fetch_add(2, Ordering::Relaxed);

        let snapshot = stats.snapshot(TableStats::default());
        assert_eq!(snapshot.v6_packets_in, 7);
        assert_eq!(snapshot.drops.not_nat64, 2);
        assert_eq!(snapshot.total_sessions, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = GatewayStats::new();
        let json = serde_json::to_string(&stats.snapshot(TableStats::default())).unwrap();
        assert!(json.contains("\"not_nat64\":0"));
        assert!(json.contains("\"total_sessions\":0"));
    }
}
