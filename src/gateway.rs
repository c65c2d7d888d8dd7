//! The datapath: tunnel readers, a bounded packet channel, a worker pool,
//! tunnel writers, and the cleanup ticker.
//!
//! Flow: tunnel read -> parse -> address-family decision -> session
//! lookup/create -> translate -> write to the sibling tunnel. Parsing and
//! translation are pure and never suspend; the only locks taken during
//! packet processing are the session table's, and none is held across an
//! await. Backpressure anywhere is a counted datagram drop, never a stall.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::addr::Nat64Prefix;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::packet;
use crate::session::{Direction, Instant, SessionSnapshot, SessionTable};
use crate::stats::{GatewayStats, StatsSnapshot};
use crate::translator::{self, TranslateError};
use crate::tunnel::{Endpoint, TunnelReader, TunnelWriter};

/// Consecutive tunnel I/O failures tolerated before the datapath gives up.
const TUNNEL_IO_FAIL_THRESHOLD: u32 = 10;

/// Bound on the shutdown drain of workers and writers.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest layer-3 frame a tunnel read can return.
const MAX_IP_PACKET_SIZE: usize = 65536;

/// Which endpoint a frame arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    V6,
    V4,
}

/// The NAT64 gateway core.
pub struct Gateway {
    config: GatewayConfig,
    prefix: Nat64Prefix,
    table: Arc<SessionTable>,
    stats: Arc<GatewayStats>,
    shutdown: watch::Sender<bool>,
}

impl Gateway {
    /// Validate the configuration and assemble the core. Configuration
    /// errors are fatal: the gateway refuses to start.
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        config.validate().map_err(GatewayError::config)?;
        let prefix = config.prefix().map_err(GatewayError::config)?;
        let table = Arc::new(SessionTable::new(&config));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            prefix,
            table,
            stats: Arc::new(GatewayStats::new()),
            shutdown,
        })
    }

    /// Aggregate counters and session-table totals.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(self.table.stats())
    }

    /// Per-session views for the observability surface.
    pub fn session_snapshots(&self) -> Vec<SessionSnapshot> {
        self.table.snapshots()
    }

    /// Signal the datapath to stop. `run` drains and returns.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    #[cfg(test)]
    pub(crate) fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Drive the datapath until the tunnels close or [`shutdown`] is
    /// called. Consumes both endpoints.
    ///
    /// [`shutdown`]: Gateway::shutdown
    pub async fn run(&self, v6: Endpoint, v4: Endpoint) -> GatewayResult<()> {
        log::info!(
            "NAT64 gateway starting: prefix {}, external {}, {} workers",
            self.prefix,
            self.config.gateway_v4,
            self.config.effective_workers()
        );

        let capacity = self.config.channel_capacity;
        let (packet_tx, packet_rx) = mpsc::channel::<(Origin, Bytes)>(capacity);
        let (to_v4_tx, to_v4_rx) = mpsc::channel::<Bytes>(capacity);
        let (to_v6_tx, to_v6_rx) = mpsc::channel::<Bytes>(capacity);

        let mut reader6 = spawn_reader(
            v6.reader,
            v6.name.clone(),
            Origin::V6,
            packet_tx.clone(),
            Arc::clone(&self.stats),
            self.shutdown.subscribe(),
        );
        let mut reader4 = spawn_reader(
            v4.reader,
            v4.name.clone(),
            Origin::V4,
            packet_tx,
            Arc::clone(&self.stats),
            self.shutdown.subscribe(),
        );

        let ctx = Arc::new(WorkerCtx {
            table: Arc::clone(&self.table),
            stats: Arc::clone(&self.stats),
            prefix: self.prefix,
            gateway_v4: self.config.gateway_v4,
            started: std::time::Instant::now(),
            last_exhaustion_warn_ms: AtomicU64::new(0),
        });
        let shared_rx = Arc::new(Mutex::new(packet_rx));
        let mut workers: Vec<JoinHandle<()>> = (0..self.config.effective_workers())
            .map(|_| {
                tokio::spawn(worker_loop(
                    Arc::clone(&shared_rx),
                    Arc::clone(&ctx),
                    to_v4_tx.clone(),
                    to_v6_tx.clone(),
                ))
            })
            .collect();
        drop(to_v4_tx);
        drop(to_v6_tx);

        let mut writers = vec![
            spawn_writer(v4.writer, v4.name, to_v4_rx, Arc::clone(&self.stats)),
            spawn_writer(v6.writer, v6.name, to_v6_rx, Arc::clone(&self.stats)),
        ];

        let mut cleanup = tokio::spawn(cleanup_loop(
            Arc::clone(&self.table),
            Duration::from_secs(self.config.cleanup_interval_secs),
            self.shutdown.subscribe(),
        ));

        // A reader finishing means its tunnel closed, it failed fatally, or
        // shutdown was signalled; either way the datapath winds down.
        let mut fatal: Option<GatewayError> = None;
        let first_was_v6;
        let first = tokio::select! {
            r = &mut reader6 => { first_was_v6 = true; r }
            r = &mut reader4 => { first_was_v6 = false; r }
        };
        collect_task_error(first, &mut fatal);
        let _ = self.shutdown.send(true);

        let second = if first_was_v6 {
            &mut reader4
        } else {
            &mut reader6
        };
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        match tokio::time::timeout_at(deadline, &mut *second).await {
            Ok(result) => collect_task_error(result, &mut fatal),
            Err(_) => second.abort(),
        }

        // Readers are gone, so the packet channel is closed; workers drain
        // it, then the writer channels close and the writers drain too.
        for worker in &mut workers {
            if tokio::time::timeout_at(deadline, &mut *worker).await.is_err() {
                log::warn!("Worker did not drain before the shutdown deadline");
                worker.abort();
            }
        }
        for writer in &mut writers {
            match tokio::time::timeout_at(deadline, &mut *writer).await {
                Ok(result) => collect_task_error(result, &mut fatal),
                Err(_) => writer.abort(),
            }
        }
        let _ = (&mut cleanup).await;

        log::info!(
            "NAT64 gateway stopped: {} sessions live at shutdown",
            self.table.len()
        );
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn collect_task_error(
    result: Result<GatewayResult<()>, tokio::task::JoinError>,
    fatal: &mut Option<GatewayError>,
) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            log::error!("Datapath task failed: {}", err);
            if fatal.is_none() {
                *fatal = Some(err);
            }
        }
        Err(join_err) if join_err.is_cancelled() => {}
        Err(join_err) => {
            log::error!("Datapath task panicked: {}", join_err);
            if fatal.is_none() {
                *fatal = Some(GatewayError::tunnel(format!(
                    "datapath task panicked: {}",
                    join_err
                )));
            }
        }
    }
}

/// Reader task: one frame per tunnel read, copied into an owned packet and
/// enqueued. A full channel is a counted drop.
fn spawn_reader(
    mut reader: Box<dyn TunnelReader>,
    name: String,
    origin: Origin,
    packet_tx: mpsc::Sender<(Origin, Bytes)>,
    stats: Arc<GatewayStats>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<GatewayResult<()>> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_IP_PACKET_SIZE];
        let mut consecutive_failures = 0u32;
        loop {
            let n = tokio::select! {
                _ = shutdown.changed() => break,
                result = reader.read(&mut buf) => match result {
                    Ok(0) => {
                        log::info!("Tunnel {} closed", name);
                        break;
                    }
                    Ok(n) => {
                        consecutive_failures = 0;
                        n
                    }
                    Err(err) => {
                        stats.tunnel_io_errors.fetch_add(1, Ordering::Relaxed);
                        consecutive_failures += 1;
                        log::warn!("Tunnel {} read error: {}", name, err);
                        if consecutive_failures >= TUNNEL_IO_FAIL_THRESHOLD {
                            return Err(GatewayError::TunnelIo {
                                name,
                                failures: consecutive_failures,
                            });
                        }
                        continue;
                    }
                },
            };

            match origin {
                Origin::V6 => stats.v6_packets_in.fetch_add(1, Ordering::Relaxed),
                Origin::V4 => stats.v4_packets_in.fetch_add(1, Ordering::Relaxed),
            };
            if packet_tx
                .try_send((origin, Bytes::copy_from_slice(&buf[..n])))
                .is_err()
            {
                stats.drops_backpressure.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    })
}

/// Writer task: owns the write half, drains its channel until the workers
/// close it.
fn spawn_writer(
    mut writer: Box<dyn TunnelWriter>,
    name: String,
    mut rx: mpsc::Receiver<Bytes>,
    stats: Arc<GatewayStats>,
) -> JoinHandle<GatewayResult<()>> {
    tokio::spawn(async move {
        let mut consecutive_failures = 0u32;
        while let Some(frame) = rx.recv().await {
            match writer.write(&frame).await {
                Ok(_) => consecutive_failures = 0,
                Err(err) => {
                    stats.tunnel_io_errors.fetch_add(1, Ordering::Relaxed);
                    consecutive_failures += 1;
                    log::warn!("Tunnel {} write error: {}", name, err);
                    if consecutive_failures >= TUNNEL_IO_FAIL_THRESHOLD {
                        return Err(GatewayError::TunnelIo {
                            name,
                            failures: consecutive_failures,
                        });
                    }
                }
            }
        }
        Ok(())
    })
}

/// Periodic session reaping, independent of traffic.
async fn cleanup_loop(
    table: Arc<SessionTable>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> GatewayResult<()> {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let removed = table.reap(Instant::now());
                if removed > 0 {
                    log::debug!("Reaped {} idle sessions, {} live", removed, table.len());
                }
            }
        }
    }
    Ok(())
}

struct WorkerCtx {
    table: Arc<SessionTable>,
    stats: Arc<GatewayStats>,
    prefix: Nat64Prefix,
    gateway_v4: std::net::Ipv4Addr,
    started: std::time::Instant,
    last_exhaustion_warn_ms: AtomicU64,
}

impl WorkerCtx {
    /// Port exhaustion floods otherwise; one warning per second.
    fn warn_port_exhausted(&self) {
        let now_ms = self.started.elapsed().as_millis() as u64;
        let last = self.last_exhaustion_warn_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) >= 1000
            && self
                .last_exhaustion_warn_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            log::warn!("NAT port range exhausted; dropping new flows");
        }
    }
}

/// Worker task: pull one packet, run the pure parse/translate pipeline,
/// hand the result to the sibling writer. The queue mutex guards only the
/// `recv`; processing runs with no lock held.
async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<(Origin, Bytes)>>>,
    ctx: Arc<WorkerCtx>,
    to_v4: mpsc::Sender<Bytes>,
    to_v6: mpsc::Sender<Bytes>,
) {
    loop {
        let item = { rx.lock().await.recv().await };
        let Some((origin, frame)) = item else { break };
        match origin {
            Origin::V6 => handle_v6_packet(&ctx, &frame, &to_v4),
            Origin::V4 => handle_v4_packet(&ctx, &frame, &to_v6),
        }
    }
}

/// Outbound path: IPv6 client towards the IPv4 network.
fn handle_v6_packet(ctx: &WorkerCtx, frame: &[u8], to_v4: &mpsc::Sender<Bytes>) {
    let view = match packet::parse(frame) {
        Ok(view) if view.is_ipv6() => view,
        Ok(_) => {
            ctx.stats.drops_parse.fetch_add(1, Ordering::Relaxed);
            log::debug!("Non-IPv6 frame on the IPv6 tunnel");
            return;
        }
        Err(err) => {
            ctx.stats.drops_parse.fetch_add(1, Ordering::Relaxed);
            log::debug!("IPv6 parse failed: {}", err);
            return;
        }
    };

    let v6_dst = match view.dst {
        std::net::IpAddr::V6(dst) => dst,
        std::net::IpAddr::V4(_) => unreachable!("is_ipv6 checked above"),
    };
    let Some(v4_dst) = ctx.prefix.extract(&v6_dst) else {
        ctx.stats.drops_not_nat64.fetch_add(1, Ordering::Relaxed);
        log::debug!("Destination {} is outside the NAT64 prefix", v6_dst);
        return;
    };

    let Some(key) = translator::v6_flow_key(&view) else {
        ctx.stats.drops_unsupported.fetch_add(1, Ordering::Relaxed);
        log::debug!("Unsupported IPv6 transport (protocol {})", view.protocol);
        return;
    };

    // ICMP errors never open a flow; they are attributed to one.
    let initiating = matches!(
        view.transport,
        packet::Transport::Tcp { .. }
            | packet::Transport::Udp { .. }
            | packet::Transport::Icmp { icmp_type: 128, .. }
    );

    let session = match ctx.table.lookup_forward(&key) {
        Some(session) => session,
        None if initiating => match ctx.table.create(key, v4_dst) {
            Ok(session) => session,
            Err(_) => {
                ctx.stats.drops_port_exhausted.fetch_add(1, Ordering::Relaxed);
                ctx.warn_port_exhausted();
                return;
            }
        },
        None => {
            ctx.stats.drops_no_session.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    if let packet::Transport::Tcp { flags, .. } = view.transport {
        session.observe_tcp_flags(flags);
    }

    let translated = match translator::translate_v6_to_v4(&view, &session) {
        Ok(bytes) => bytes,
        Err(err) => {
            count_translate_error(&ctx.stats, &err);
            log::debug!("v6->v4 translation failed: {}", err);
            return;
        }
    };

    session.account(translated.len() as u64, Direction::Outbound);
    match to_v4.try_send(Bytes::from(translated)) {
        Ok(()) => {
            ctx.stats.v4_packets_out.fetch_add(1, Ordering::Relaxed);
            ctx.stats
                .bytes_6to4
                .fetch_add(frame.len() as u64, Ordering::Relaxed);
        }
        Err(_) => {
            ctx.stats.drops_backpressure.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Inbound path: the IPv4 network back towards the IPv6 client.
fn handle_v4_packet(ctx: &WorkerCtx, frame: &[u8], to_v6: &mpsc::Sender<Bytes>) {
    let view = match packet::parse(frame) {
        Ok(view) if !view.is_ipv6() => view,
        Ok(_) => {
            ctx.stats.drops_parse.fetch_add(1, Ordering::Relaxed);
            log::debug!("Non-IPv4 frame on the IPv4 tunnel");
            return;
        }
        Err(err) => {
            ctx.stats.drops_parse.fetch_add(1, Ordering::Relaxed);
            log::debug!("IPv4 parse failed: {}", err);
            return;
        }
    };

    // Only traffic addressed to the gateway's external address can belong
    // to a session.
    if view.dst != std::net::IpAddr::V4(ctx.gateway_v4) {
        ctx.stats.drops_no_session.fetch_add(1, Ordering::Relaxed);
        log::debug!("IPv4 packet for {} is not ours", view.dst);
        return;
    }

    let Some((protocol, port)) = translator::v4_reverse_hint(&view) else {
        ctx.stats.drops_unsupported.fetch_add(1, Ordering::Relaxed);
        log::debug!("Unsupported IPv4 transport (protocol {})", view.protocol);
        return;
    };

    let Some(session) = ctx.table.lookup_reverse(protocol, port) else {
        ctx.stats.drops_no_session.fetch_add(1, Ordering::Relaxed);
        log::debug!("No session for inbound {:?} port {}", protocol, port);
        return;
    };

    if let packet::Transport::Tcp { flags, .. } = view.transport {
        session.observe_tcp_flags(flags);
    }

    let translated = match translator::translate_v4_to_v6(&view, &session, &ctx.prefix) {
        Ok(bytes) => bytes,
        Err(err) => {
            count_translate_error(&ctx.stats, &err);
            log::debug!("v4->v6 translation failed: {}", err);
            return;
        }
    };

    session.account(translated.len() as u64, Direction::Inbound);
    match to_v6.try_send(Bytes::from(translated)) {
        Ok(()) => {
            ctx.stats.v6_packets_out.fetch_add(1, Ordering::Relaxed);
            ctx.stats
                .bytes_4to6
                .fetch_add(frame.len() as u64, Ordering::Relaxed);
        }
        Err(_) => {
            ctx.stats.drops_backpressure.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn count_translate_error(stats: &GatewayStats, err: &TranslateError) {
    match err {
        TranslateError::UnsupportedProtocol(_) | TranslateError::UnsupportedIcmp { .. } => {
            stats.drops_unsupported.fetch_add(1, Ordering::Relaxed)
        }
        _ => stats.drops_translate.fetch_add(1, Ordering::Relaxed),
    };
}
