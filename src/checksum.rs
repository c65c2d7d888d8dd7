//! Internet checksum primitives.
//!
//! Everything the translator needs to keep checksums correct across an
//! address-family change: the one's-complement sum (RFC 1071), pseudo-header
//! sums for both families, and the incremental update of RFC 1624 (eqn. 3)
//! so TCP/UDP checksums can be patched without touching the payload.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Accumulate `data` into a running 32-bit one's-complement sum.
/// An odd trailing byte is padded with zero on the right.
pub fn sum_bytes(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([chunk[0], chunk[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

/// Fold a 32-bit accumulator into 16 bits (not complemented).
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// The standard Internet checksum of a byte slice (RFC 1071).
pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(sum_bytes(0, data))
}

/// Raw sum of the IPv4 TCP/UDP pseudo header: src, dst, zero/protocol,
/// transport length.
pub fn pseudo_sum_v4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: u16) -> u32 {
    let mut sum = sum_bytes(0, &src.octets());
    sum = sum_bytes(sum, &dst.octets());
    sum = sum.wrapping_add(u32::from(protocol));
    sum.wrapping_add(u32::from(len))
}

/// Raw sum of the IPv6 TCP/UDP pseudo header (RFC 8200 §8.1).
pub fn pseudo_sum_v6(src: &Ipv6Addr, dst: &Ipv6Addr, next_header: u8, len: u32) -> u32 {
    let mut sum = sum_bytes(0, &src.octets());
    sum = sum_bytes(sum, &dst.octets());
    sum = sum.wrapping_add(len >> 16);
    sum = sum.wrapping_add(len & 0xffff);
    sum.wrapping_add(u32::from(next_header))
}

/// Incremental checksum update per RFC 1624 eqn. 3:
/// `HC' = ~(~HC + ~m + m')`.
///
/// `old_sum` is the raw (unfolded, uncomplemented) sum of the bytes being
/// replaced, `new_sum` the raw sum of their replacement, typically the old
/// and new pseudo-header material plus any rewritten port.
pub fn incremental_update(old_csum: u16, old_sum: u32, new_sum: u32) -> u16 {
    let sum = u32::from(!old_csum)
        .wrapping_add(u32::from(!fold(old_sum)))
        .wrapping_add(u32::from(fold(new_sum)));
    !fold(sum)
}

/// A computed UDP-over-IPv6 checksum must never be transmitted as zero
/// (zero means "no checksum", which IPv6 forbids); fold zero to 0xFFFF.
/// The same substitution applies to UDP over IPv4 (RFC 768).
#[inline]
pub fn finalize_udp(csum: u16) -> u16 {
    if csum == 0 {
        0xffff
    } else {
        csum
    }
}

/// Compute a transport checksum from scratch: pseudo-header raw sum plus the
/// transport segment with its checksum field zeroed by the caller.
pub fn transport_checksum(pseudo_sum: u32, segment: &[u8]) -> u16 {
    !fold(sum_bytes(pseudo_sum, segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internet_checksum_rfc1071_example() {
        // Example sequence from RFC 1071 §3.
        let data = [0x00u8, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet_checksum(&data), !0xddf2);
    }

    #[test]
    fn test_internet_checksum_odd_length() {
        // Trailing byte is padded as the high-order byte of a 16-bit word.
        assert_eq!(internet_checksum(&[0xff]), !0xff00);
        assert_eq!(internet_checksum(&[0x00, 0x00, 0xab]), !0xab00);
    }

    #[test]
    fn test_checksum_of_valid_header_is_zero() {
        // An IPv4 header with its checksum filled in sums to zero.
        let mut header = [
            0x45u8, 0x00, 0x00, 0x28, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let csum = internet_checksum(&header);
        header[10..12].copy_from_slice(&csum.to_be_bytes());
        assert_eq!(fold(sum_bytes(0, &header)), 0xffff);
    }

    #[test]
    fn test_incremental_update_matches_recompute() {
        // Patch a 16-bit field and compare against a full recompute.
        let mut data = [0x12u8, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0x00, 0x00];
        let csum = internet_checksum(&data);
        data[6..8].copy_from_slice(&csum.to_be_bytes());

        let old_field = [0x56u8, 0x78];
        let new_field = [0xde, 0xad];
        let updated = incremental_update(
            u16::from_be_bytes([data[6], data[7]]),
            sum_bytes(0, &old_field),
            sum_bytes(0, &new_field),
        );

        data[2..4].copy_from_slice(&new_field);
        data[6..8].copy_from_slice(&[0, 0]);
        assert_eq!(updated, internet_checksum(&data));
    }

    #[test]
    fn test_incremental_update_family_change() {
        // Replacing IPv6 pseudo-header material with IPv4 material must give
        // the same result as recomputing over the new pseudo header.
        let v6_src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let v6_dst: Ipv6Addr = "64:ff9b::c000:201".parse().unwrap();
        let v4_src = Ipv4Addr::new(10, 64, 0, 1);
        let v4_dst = Ipv4Addr::new(192, 0, 2, 1);

        let segment = [
            0x9cu8, 0x40, 0x00, 0x50, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x50, 0x02,
            0xff, 0xff, 0x00, 0x00, 0x00, 0x00,
        ];
        let seg_len = segment.len() as u32;

        let v6_csum =
            transport_checksum(pseudo_sum_v6(&v6_src, &v6_dst, 6, seg_len), &segment);

        let patched = incremental_update(
            v6_csum,
            pseudo_sum_v6(&v6_src, &v6_dst, 6, seg_len),
            pseudo_sum_v4(v4_src, v4_dst, 6, seg_len as u16),
        );
        let recomputed =
            transport_checksum(pseudo_sum_v4(v4_src, v4_dst, 6, seg_len as u16), &segment);
        assert_eq!(patched, recomputed);
    }

    #[test]
    fn test_finalize_udp() {
        assert_eq!(finalize_udp(0), 0xffff);
        assert_eq!(finalize_udp(0x1234), 0x1234);
        assert_eq!(finalize_udp(0xffff), 0xffff);
    }
}
