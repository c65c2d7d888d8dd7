//! Shared packet builders for unit tests.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, MutexGuard};

use crate::checksum;

static CLOCK_LOCK: Mutex<()> = Mutex::new(());

/// Serialize tests that drive `MockClock`; the mock time is process-global.
pub fn lock_clock() -> MutexGuard<'static, ()> {
    CLOCK_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// 20-byte TCP header (data offset 5) followed by `payload`; checksum zero.
pub fn tcp_segment(src_port: u16, dst_port: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut seg = vec![0u8; 20];
    seg[0..2].copy_from_slice(&src_port.to_be_bytes());
    seg[2..4].copy_from_slice(&dst_port.to_be_bytes());
    seg[4..8].copy_from_slice(&1u32.to_be_bytes()); // seq
    seg[12] = 5 << 4; // data offset
    seg[13] = flags;
    seg[14..16].copy_from_slice(&0xffffu16.to_be_bytes()); // window
    seg.extend_from_slice(payload);
    seg
}

/// 8-byte UDP header followed by `payload`; checksum zero.
pub fn udp_segment(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut seg = vec![0u8; 8];
    seg[0..2].copy_from_slice(&src_port.to_be_bytes());
    seg[2..4].copy_from_slice(&dst_port.to_be_bytes());
    seg[4..6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    seg.extend_from_slice(payload);
    seg
}

/// ICMP echo header (type/code/checksum/ident/seq) plus `payload`; checksum zero.
pub fn icmp_echo_segment(icmp_type: u8, ident: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut seg = vec![0u8; 8];
    seg[0] = icmp_type;
    seg[4..6].copy_from_slice(&ident.to_be_bytes());
    seg[6..8].copy_from_slice(&seq.to_be_bytes());
    seg.extend_from_slice(payload);
    seg
}

/// IPv6 header + payload. The payload length field matches `payload`.
pub fn ipv6_packet(src: &str, dst: &str, next_header: u8, hop_limit: u8, payload: &[u8]) -> Vec<u8> {
    let src: Ipv6Addr = src.parse().unwrap();
    let dst: Ipv6Addr = dst.parse().unwrap();
    let mut pkt = vec![0u8; 40];
    pkt[0] = 0x60;
    pkt[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    pkt[6] = next_header;
    pkt[7] = hop_limit;
    pkt[8..24].copy_from_slice(&src.octets());
    pkt[24..40].copy_from_slice(&dst.octets());
    pkt.extend_from_slice(payload);
    pkt
}

/// IPv4 header (IHL 5, DF set, ident 0, valid header checksum) + segment.
pub fn ipv4_packet(src: &str, dst: &str, protocol: u8, ttl: u8, segment: &[u8]) -> Vec<u8> {
    let src: Ipv4Addr = src.parse().unwrap();
    let dst: Ipv4Addr = dst.parse().unwrap();
    let mut pkt = vec![0u8; 20];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&((20 + segment.len()) as u16).to_be_bytes());
    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
    pkt[8] = ttl;
    pkt[9] = protocol;
    pkt[12..16].copy_from_slice(&src.octets());
    pkt[16..20].copy_from_slice(&dst.octets());
    let csum = checksum::internet_checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&csum.to_be_bytes());
    pkt.extend_from_slice(segment);
    pkt
}

/// Fill in the transport checksum of a finished, extension-header-free
/// packet of either family.
pub fn fill_transport_checksum(pkt: &mut [u8]) {
    let v6 = pkt[0] >> 4 == 6;
    let (proto, seg_start) = if v6 {
        (pkt[6], 40)
    } else {
        (pkt[9], usize::from(pkt[0] & 0x0f) * 4)
    };
    let seg_len = pkt.len() - seg_start;
    let csum_off = seg_start
        + match proto {
            6 => 16,
            17 => 6,
            1 | 58 => 2,
            _ => return,
        };
    pkt[csum_off] = 0;
    pkt[csum_off + 1] = 0;

    let pseudo = match proto {
        // ICMPv4 has no pseudo header.
        1 => 0,
        _ if v6 => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&pkt[8..24]);
            dst.copy_from_slice(&pkt[24..40]);
            checksum::pseudo_sum_v6(
                &Ipv6Addr::from(src),
                &Ipv6Addr::from(dst),
                proto,
                seg_len as u32,
            )
        }
        _ => checksum::pseudo_sum_v4(
            Ipv4Addr::new(pkt[12], pkt[13], pkt[14], pkt[15]),
            Ipv4Addr::new(pkt[16], pkt[17], pkt[18], pkt[19]),
            proto,
            seg_len as u16,
        ),
    };
    let mut csum = checksum::transport_checksum(pseudo, &pkt[seg_start..]);
    if proto == 17 {
        csum = checksum::finalize_udp(csum);
    }
    pkt[csum_off..csum_off + 2].copy_from_slice(&csum.to_be_bytes());
}

/// ICMPv6 echo packet with a valid transport checksum.
pub fn icmpv6_echo_packet(
    src: &str,
    dst: &str,
    icmp_type: u8,
    ident: u16,
    seq: u16,
    payload: &[u8],
) -> Vec<u8> {
    let seg = icmp_echo_segment(icmp_type, ident, seq, payload);
    let mut pkt = ipv6_packet(src, dst, 58, 64, &seg);
    fill_transport_checksum(&mut pkt);
    pkt
}

/// Verify the transport checksum of an extension-header-free packet by
/// summing segment plus pseudo header; a valid checksum folds to 0xffff.
pub fn transport_checksum_is_valid(pkt: &[u8]) -> bool {
    let v6 = pkt[0] >> 4 == 6;
    let (proto, seg_start) = if v6 {
        (pkt[6], 40)
    } else {
        (pkt[9], usize::from(pkt[0] & 0x0f) * 4)
    };
    let seg = &pkt[seg_start..];
    let pseudo = match proto {
        1 => 0,
        _ if v6 => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&pkt[8..24]);
            dst.copy_from_slice(&pkt[24..40]);
            checksum::pseudo_sum_v6(
                &Ipv6Addr::from(src),
                &Ipv6Addr::from(dst),
                proto,
                seg.len() as u32,
            )
        }
        _ => checksum::pseudo_sum_v4(
            Ipv4Addr::new(pkt[12], pkt[13], pkt[14], pkt[15]),
            Ipv4Addr::new(pkt[16], pkt[17], pkt[18], pkt[19]),
            proto,
            seg.len() as u16,
        ),
    };
    checksum::fold(checksum::sum_bytes(pseudo, seg)) == 0xffff
}
