//! NAT64 session table.
//!
//! One record per bidirectional flow, reachable from two indexes: forward by
//! the IPv6-side 5-tuple and reverse by the allocated IPv4 source port (or
//! ICMP query identifier). Both indexes hold `Arc`s to the same record, and
//! both are only ever updated inside the same write-lock critical section,
//! so an observer never sees one without the other.
//!
//! Lookups take the shared lock and touch only atomic telemetry; creation
//! and reaping take the exclusive lock.

mod clock;

pub use clock::Instant;
#[cfg(test)]
pub use clock::MockClock;

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::config::GatewayConfig;

/// Transport protocol of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    /// IPv4 protocol number (ICMP sessions translate to/from ICMPv6 = 58).
    pub fn number(&self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Icmp => 1,
        }
    }

    /// Classify an IPv4 protocol number.
    pub fn from_ipv4_protocol(proto: u8) -> Option<Self> {
        match proto {
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            1 => Some(Protocol::Icmp),
            _ => None,
        }
    }

    /// Classify an IPv6 transport protocol (after extension headers).
    pub fn from_ipv6_next_header(next_header: u8) -> Option<Self> {
        match next_header {
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            58 => Some(Protocol::Icmp),
            _ => None,
        }
    }

    fn index(&self) -> usize {
        match self {
            Protocol::Tcp => 0,
            Protocol::Udp => 1,
            Protocol::Icmp => 2,
        }
    }
}

/// Forward key: the IPv6-side 5-tuple of a flow. For ICMP, `src_port` is
/// the client's query identifier and `dst_port` is zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub v6_src: Ipv6Addr,
    pub src_port: u16,
    pub v6_dst: Ipv6Addr,
    pub dst_port: u16,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    New,
    Established,
    Closing,
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::New,
            1 => SessionState::Established,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Direction of a packet relative to the session's creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// IPv6 client towards IPv4 destination.
    Outbound,
    /// IPv4 destination back towards the IPv6 client.
    Inbound,
}

/// Session table errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Every port (or ICMP identifier) in the configured range is in use.
    #[error("NAT port range exhausted")]
    PortExhausted,
}

/// One bidirectional flow. Identity fields never change after creation;
/// telemetry is atomic so lookups can update it under the shared lock.
#[derive(Debug)]
pub struct Session {
    /// Forward key (IPv6 side).
    pub key: FlowKey,
    /// Gateway's external IPv4 address, used as the translated source.
    pub v4_src: Ipv4Addr,
    /// Allocated source port (or ICMP identifier), unique per protocol.
    pub v4_src_port: u16,
    /// IPv4 destination, extracted from the NAT64 destination address.
    pub v4_dst: Ipv4Addr,
    /// IPv4 destination port (the IPv6-side destination port, unchanged).
    pub v4_dst_port: u16,

    created_ms: u64,
    last_activity_ms: AtomicU64,
    state: AtomicU8,
    bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    packets_out: AtomicU64,
    packets_in: AtomicU64,
}

impl Session {
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Advance the activity timestamp. `fetch_max` keeps it monotonic even
    /// when touches race.
    fn touch(&self, now_ms: u64) {
        self.last_activity_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    fn promote_established(&self) {
        let _ = self.state.compare_exchange(
            SessionState::New as u8,
            SessionState::Established as u8,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Progress the TCP lifecycle from observed flags: FIN moves an open
    /// session to CLOSING, RST closes it outright. Closed sessions are
    /// removed on the next reap.
    pub fn observe_tcp_flags(&self, flags: u8) {
        use crate::packet::{TCP_FLAG_FIN, TCP_FLAG_RST};
        if flags & TCP_FLAG_RST != 0 {
            self.state
                .store(SessionState::Closed as u8, Ordering::Relaxed);
        } else if flags & TCP_FLAG_FIN != 0 {
            let _ = self.state.compare_exchange(
                SessionState::Established as u8,
                SessionState::Closing as u8,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
            let _ = self.state.compare_exchange(
                SessionState::New as u8,
                SessionState::Closing as u8,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }

    /// Account one packet of `bytes` in `direction`. Lock-free.
    pub fn account(&self, bytes: u64, direction: Direction) {
        match direction {
            Direction::Outbound => {
                self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
                self.packets_out.fetch_add(1, Ordering::Relaxed);
            }
            Direction::Inbound => {
                self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
                self.packets_in.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn idle(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed)))
    }

    fn snapshot(&self, now_ms: u64) -> SessionSnapshot {
        SessionSnapshot {
            protocol: self.key.protocol,
            v6_src: self.key.v6_src,
            v6_src_port: self.key.src_port,
            v6_dst: self.key.v6_dst,
            v6_dst_port: self.key.dst_port,
            v4_src: self.v4_src,
            v4_src_port: self.v4_src_port,
            v4_dst: self.v4_dst,
            v4_dst_port: self.v4_dst_port,
            state: self.state(),
            age_secs: now_ms.saturating_sub(self.created_ms) / 1000,
            idle_secs: self.idle(now_ms).as_secs(),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view of one session for the observability surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub protocol: Protocol,
    pub v6_src: Ipv6Addr,
    pub v6_src_port: u16,
    pub v6_dst: Ipv6Addr,
    pub v6_dst_port: u16,
    pub v4_src: Ipv4Addr,
    pub v4_src_port: u16,
    pub v4_dst: Ipv4Addr,
    pub v4_dst_port: u16,
    pub state: SessionState,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub packets_in: u64,
}

/// Aggregate counts over the live table.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TableStats {
    pub total_sessions: usize,
    pub tcp_sessions: usize,
    pub udp_sessions: usize,
    pub icmp_sessions: usize,
    pub allocated_ports: usize,
    pub bytes_out: u64,
    pub bytes_in: u64,
}

struct TableInner {
    forward: HashMap<FlowKey, Arc<Session>>,
    reverse: HashMap<(Protocol, u16), Arc<Session>>,
    /// Next candidate port per protocol; ports are namespaced by protocol.
    rovers: [u16; 3],
}

/// The session (BIB) table.
pub struct SessionTable {
    inner: RwLock<TableInner>,
    epoch: Instant,
    gateway_v4: Ipv4Addr,
    port_min: u16,
    port_max: u16,
    timeouts: [Duration; 3],
}

impl SessionTable {
    /// Create a table from the gateway configuration.
    pub fn new(config: &GatewayConfig) -> Self {
        let (port_min, port_max) = config.port_range;
        Self {
            inner: RwLock::new(TableInner {
                forward: HashMap::new(),
                reverse: HashMap::new(),
                rovers: [port_min; 3],
            }),
            epoch: Instant::now(),
            gateway_v4: config.gateway_v4,
            port_min,
            port_max,
            timeouts: [
                Duration::from_secs(config.tcp_timeout_secs),
                Duration::from_secs(config.udp_timeout_secs),
                Duration::from_secs(config.icmp_timeout_secs),
            ],
        }
    }

    fn now_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn timeout(&self, protocol: Protocol) -> Duration {
        self.timeouts[protocol.index()]
    }

    /// Look up the session for an outbound packet, touching its activity
    /// timestamp on a hit.
    pub fn lookup_forward(&self, key: &FlowKey) -> Option<Arc<Session>> {
        let now_ms = self.now_ms(Instant::now());
        let inner = self.inner.read().expect("session table lock poisoned");
        let session = inner.forward.get(key)?;
        session.touch(now_ms);
        Some(Arc::clone(session))
    }

    /// Look up the session for a returning IPv4 packet by its destination
    /// port (the allocated port). The first reverse hit promotes the
    /// session from NEW to ESTABLISHED.
    pub fn lookup_reverse(&self, protocol: Protocol, dst_port: u16) -> Option<Arc<Session>> {
        let now_ms = self.now_ms(Instant::now());
        let inner = self.inner.read().expect("session table lock poisoned");
        let session = inner.reverse.get(&(protocol, dst_port))?;
        session.touch(now_ms);
        session.promote_established();
        Some(Arc::clone(session))
    }

    /// Get or create the session for a new outbound flow. `v4_dst` is the
    /// address embedded in the flow's NAT64 destination.
    ///
    /// Allocates a source port from the per-protocol rover; both indexes are
    /// written in the same critical section.
    pub fn create(&self, key: FlowKey, v4_dst: Ipv4Addr) -> Result<Arc<Session>, SessionError> {
        let now_ms = self.now_ms(Instant::now());
        let mut inner = self.inner.write().expect("session table lock poisoned");

        // Another worker may have created the flow between our forward miss
        // and this write lock.
        if let Some(existing) = inner.forward.get(&key) {
            existing.touch(now_ms);
            return Ok(Arc::clone(existing));
        }

        let port = allocate_port(&mut inner, key.protocol, self.port_min, self.port_max)
            .ok_or(SessionError::PortExhausted)?;

        let session = Arc::new(Session {
            v4_src: self.gateway_v4,
            v4_src_port: port,
            v4_dst,
            v4_dst_port: key.dst_port,
            key: key.clone(),
            created_ms: now_ms,
            last_activity_ms: AtomicU64::new(now_ms),
            state: AtomicU8::new(SessionState::New as u8),
            bytes_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
            packets_in: AtomicU64::new(0),
        });

        inner
            .reverse
            .insert((key.protocol, port), Arc::clone(&session));
        inner.forward.insert(key, Arc::clone(&session));

        Ok(session)
    }

    /// Remove sessions idle past their protocol timeout, plus any already
    /// CLOSED. Freed ports become available to the rover immediately.
    /// Returns the number of sessions removed.
    pub fn reap(&self, now: Instant) -> usize {
        let now_ms = self.now_ms(now);
        let mut inner = self.inner.write().expect("session table lock poisoned");

        let expired: Vec<FlowKey> = inner
            .forward
            .iter()
            .filter(|(_, s)| {
                s.state() == SessionState::Closed || s.idle(now_ms) > self.timeout(s.key.protocol)
            })
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            if let Some(session) = inner.forward.remove(key) {
                session
                    .state
                    .store(SessionState::Closed as u8, Ordering::Relaxed);
                inner
                    .reverse
                    .remove(&(session.key.protocol, session.v4_src_port));
            }
        }

        expired.len()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("session table lock poisoned")
            .forward
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate counts for the observability surface.
    pub fn stats(&self) -> TableStats {
        let inner = self.inner.read().expect("session table lock poisoned");
        let mut stats = TableStats {
            total_sessions: inner.forward.len(),
            allocated_ports: inner.reverse.len(),
            ..TableStats::default()
        };
        for session in inner.forward.values() {
            match session.key.protocol {
                Protocol::Tcp => stats.tcp_sessions += 1,
                Protocol::Udp => stats.udp_sessions += 1,
                Protocol::Icmp => stats.icmp_sessions += 1,
            }
            stats.bytes_out += session.bytes_out.load(Ordering::Relaxed);
            stats.bytes_in += session.bytes_in.load(Ordering::Relaxed);
        }
        stats
    }

    /// Per-session snapshots for the observability surface.
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let now_ms = self.now_ms(Instant::now());
        let inner = self.inner.read().expect("session table lock poisoned");
        inner.forward.values().map(|s| s.snapshot(now_ms)).collect()
    }
}

/// Rover allocation with linear probing: starting at the protocol's cursor,
/// scan the range (with wraparound) for a port absent from the reverse
/// index. A full sweep without a free slot means exhaustion.
fn allocate_port(inner: &mut TableInner, protocol: Protocol, min: u16, max: u16) -> Option<u16> {
    if min > max {
        return None;
    }
    let span = usize::from(max - min) + 1;
    let mut candidate = inner.rovers[protocol.index()];
    if !(min..=max).contains(&candidate) {
        candidate = min;
    }
    for _ in 0..span {
        let next = if candidate >= max { min } else { candidate + 1 };
        if !inner.reverse.contains_key(&(protocol, candidate)) {
            inner.rovers[protocol.index()] = next;
            return Some(candidate);
        }
        candidate = next;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use std::collections::HashSet;

    fn test_config(port_range: (u16, u16)) -> GatewayConfig {
        GatewayConfig {
            port_range,
            tcp_timeout_secs: 300,
            udp_timeout_secs: 60,
            icmp_timeout_secs: 60,
            gateway_v4: Ipv4Addr::new(10, 64, 0, 1),
            ..GatewayConfig::default()
        }
    }

    fn flow(src_port: u16, protocol: Protocol) -> FlowKey {
        FlowKey {
            protocol,
            v6_src: "2001:db8::1".parse().unwrap(),
            src_port,
            v6_dst: "64:ff9b::c000:201".parse().unwrap(),
            dst_port: 80,
        }
    }

    const DST: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

    #[test]
    fn test_create_is_idempotent_per_flow() {
        let table = SessionTable::new(&test_config((10000, 10100)));

        let a = table.create(flow(40000, Protocol::Tcp), DST).unwrap();
        let b = table.create(flow(40000, Protocol::Tcp), DST).unwrap();
        assert_eq!(a.v4_src_port, b.v4_src_port);
        assert_eq!(table.len(), 1);

        let c = table.create(flow(40001, Protocol::Tcp), DST).unwrap();
        assert_ne!(a.v4_src_port, c.v4_src_port);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_session_bijection() {
        let table = SessionTable::new(&test_config((10000, 10100)));

        for src_port in [40000u16, 40001, 40002] {
            let created = table.create(flow(src_port, Protocol::Udp), DST).unwrap();
            let forward = table.lookup_forward(&flow(src_port, Protocol::Udp)).unwrap();
            let reverse = table
                .lookup_reverse(Protocol::Udp, created.v4_src_port)
                .unwrap();
            assert!(Arc::ptr_eq(&created, &forward));
            assert!(Arc::ptr_eq(&created, &reverse));
        }
    }

    #[test]
    fn test_ports_namespaced_by_protocol() {
        let table = SessionTable::new(&test_config((10000, 10000)));

        // A one-port range still serves one session per protocol.
        table.create(flow(1, Protocol::Tcp), DST).unwrap();
        table.create(flow(1, Protocol::Udp), DST).unwrap();
        table.create(flow(1, Protocol::Icmp), DST).unwrap();

        assert!(matches!(
            table.create(flow(2, Protocol::Tcp), DST),
            Err(SessionError::PortExhausted)
        ));
    }

    #[test]
    fn test_state_promotion_on_reverse_hit() {
        let table = SessionTable::new(&test_config((10000, 10100)));

        let session = table.create(flow(40000, Protocol::Tcp), DST).unwrap();
        assert_eq!(session.state(), SessionState::New);

        table
            .lookup_reverse(Protocol::Tcp, session.v4_src_port)
            .unwrap();
        assert_eq!(session.state(), SessionState::Established);
    }

    #[test]
    fn test_tcp_lifecycle_flags() {
        use crate::packet::{TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_RST};
        let table = SessionTable::new(&test_config((10000, 10100)));

        let session = table.create(flow(40000, Protocol::Tcp), DST).unwrap();
        table
            .lookup_reverse(Protocol::Tcp, session.v4_src_port)
            .unwrap();

        session.observe_tcp_flags(TCP_FLAG_ACK);
        assert_eq!(session.state(), SessionState::Established);

        session.observe_tcp_flags(TCP_FLAG_FIN | TCP_FLAG_ACK);
        assert_eq!(session.state(), SessionState::Closing);

        session.observe_tcp_flags(TCP_FLAG_RST);
        assert_eq!(session.state(), SessionState::Closed);

        // Closed sessions are reaped regardless of idle time.
        assert_eq!(table.reap(Instant::now()), 1);
        assert!(table.lookup_reverse(Protocol::Tcp, session.v4_src_port).is_none());
    }

    #[test]
    fn test_port_exhaustion() {
        let table = SessionTable::new(&test_config((10000, 10100)));

        for i in 0..101u16 {
            table.create(flow(1000 + i, Protocol::Tcp), DST).unwrap();
        }
        assert_eq!(table.len(), 101);

        assert!(matches!(
            table.create(flow(2000, Protocol::Tcp), DST),
            Err(SessionError::PortExhausted)
        ));
        assert_eq!(table.len(), 101);
    }

    #[test]
    fn test_empty_port_range_always_fails() {
        let table = SessionTable::new(&test_config((10, 9)));
        assert!(matches!(
            table.create(flow(1000, Protocol::Tcp), DST),
            Err(SessionError::PortExhausted)
        ));
    }

    #[test]
    fn test_port_uniqueness() {
        let table = SessionTable::new(&test_config((20000, 20099)));

        let mut seen = HashSet::new();
        for i in 0..100u16 {
            let s = table.create(flow(3000 + i, Protocol::Udp), DST).unwrap();
            assert!(
                seen.insert((s.key.protocol, s.v4_src_port)),
                "duplicate port {}",
                s.v4_src_port
            );
            assert!((20000..=20099).contains(&s.v4_src_port));
        }
    }

    #[test]
    fn test_reap_expired_and_port_reuse() {
        let _clock = crate::testutil::lock_clock();
        MockClock::set_time(Duration::ZERO);
        let table = SessionTable::new(&test_config((10000, 10100)));

        let session = table.create(flow(40000, Protocol::Udp), DST).unwrap();
        let port = session.v4_src_port;

        // Not yet expired.
        assert_eq!(table.reap(Instant::now()), 0);
        assert_eq!(table.len(), 1);

        MockClock::advance(Duration::from_secs(61));
        assert_eq!(table.reap(Instant::now()), 1);
        assert_eq!(table.len(), 0);
        assert!(table.lookup_reverse(Protocol::Udp, port).is_none());

        // The freed port is allocatable again.
        let replacement = table.create(flow(40001, Protocol::Udp), DST).unwrap();
        assert!((10000..=10100).contains(&replacement.v4_src_port));
    }

    #[test]
    fn test_reap_spares_active_sessions() {
        let _clock = crate::testutil::lock_clock();
        MockClock::set_time(Duration::ZERO);
        let table = SessionTable::new(&test_config((10000, 10100)));

        let idle = table.create(flow(40000, Protocol::Udp), DST).unwrap();
        MockClock::advance(Duration::from_secs(59));
        // A touch via lookup keeps the second session fresh.
        let busy = table.create(flow(40001, Protocol::Udp), DST).unwrap();
        table.lookup_forward(&flow(40001, Protocol::Udp)).unwrap();

        MockClock::advance(Duration::from_secs(2));
        assert_eq!(table.reap(Instant::now()), 1);

        assert!(table.lookup_reverse(Protocol::Udp, idle.v4_src_port).is_none());
        assert!(table.lookup_reverse(Protocol::Udp, busy.v4_src_port).is_some());

        // Aging monotonicity: nothing surviving is past its timeout.
        for snapshot in table.snapshots() {
            assert!(snapshot.idle_secs <= 60);
        }
    }

    #[test]
    fn test_accounting() {
        let table = SessionTable::new(&test_config((10000, 10100)));
        let session = table.create(flow(40000, Protocol::Tcp), DST).unwrap();

        session.account(100, Direction::Outbound);
        session.account(250, Direction::Outbound);
        session.account(40, Direction::Inbound);

        let snapshot = &table.snapshots()[0];
        assert_eq!(snapshot.bytes_out, 350);
        assert_eq!(snapshot.packets_out, 2);
        assert_eq!(snapshot.bytes_in, 40);
        assert_eq!(snapshot.packets_in, 1);

        let stats = table.stats();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.tcp_sessions, 1);
        assert_eq!(stats.allocated_ports, 1);
        assert_eq!(stats.bytes_out, 350);
    }

    #[test]
    fn test_concurrent_creation_unique_ports() {
        use std::thread;

        let table = Arc::new(SessionTable::new(&test_config((20000, 20999))));
        let num_threads = 8;
        let per_thread = 50;

        let handles: Vec<_> = (0..num_threads)
            .map(|thread_id| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let mut ports = Vec::new();
                    let v6_src: Ipv6Addr =
                        format!("2001:db8::{:x}", thread_id + 1).parse().unwrap();
                    for i in 0..per_thread {
                        let key = FlowKey {
                            protocol: Protocol::Tcp,
                            v6_src,
                            src_port: 3000 + i,
                            v6_dst: "64:ff9b::808:808".parse().unwrap(),
                            dst_port: 443,
                        };
                        ports.push(table.create(key, DST).unwrap().v4_src_port);
                    }
                    ports
                })
            })
            .collect();

        let mut all_ports = Vec::new();
        for handle in handles {
            all_ports.extend(handle.join().expect("thread should not panic"));
        }

        let unique: HashSet<u16> = all_ports.iter().copied().collect();
        assert_eq!(unique.len(), (num_threads * per_thread) as usize);
        assert_eq!(table.len(), (num_threads * per_thread) as usize);
    }
}
