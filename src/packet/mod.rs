//! Zero-allocation packet decoding.
//!
//! [`PacketView`] borrows one datagram for exactly the duration of one
//! translation: network-layer addresses, the transport tag, and the
//! transport segment as a sub-slice of the original buffer. IPv6 extension
//! headers (Hop-by-Hop, Routing, Fragment, Destination Options) are walked
//! to find the real transport header; a Fragment header's fields are
//! captured so the translator can map them onto IPv4 fragmentation fields.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// Minimum IPv6 header length.
pub const IPV6_HEADER_LEN: usize = 40;
/// Minimum IPv4 header length (IHL = 5).
pub const IPV4_MIN_HEADER_LEN: usize = 20;
/// IPv6 Fragment extension header length.
pub const IPV6_FRAGMENT_HEADER_LEN: usize = 8;

/// TCP header flag bits (byte 13 of the TCP header).
pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_ACK: u8 = 0x10;

/// Why a datagram could not be decoded. A transport the gateway does not
/// understand is not a parse failure: it decodes as [`Transport::Other`]
/// and the translator rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Buffer ends before the header or transport it announces.
    #[error("packet too short")]
    TooShort,
    /// First nibble is neither 4 nor 6, or does not match the family the
    /// endpoint carries.
    #[error("bad IP version {0}")]
    BadVersion(u8),
    /// IPv4 IHL below 5 or beyond the buffer.
    #[error("bad header length")]
    BadHeaderLength,
}

/// Fragmentation fields, uniform across both families.
///
/// `offset` is in 8-octet units as on the wire. IPv6 carries a 32-bit
/// identification; IPv4 keeps only the low 16 bits of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    pub ident: u32,
    pub offset: u16,
    pub more: bool,
}

/// Tagged view of the transport header. `Other` carries anything the
/// translator will refuse, including non-first fragments, whose transport
/// header lives in a different datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp {
        src_port: u16,
        dst_port: u16,
        flags: u8,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
        checksum: u16,
    },
    Icmp {
        icmp_type: u8,
        code: u8,
        /// Query identifier for echo messages; 0 when the message is too
        /// short to carry one.
        ident: u16,
    },
    Other {
        protocol: u8,
    },
}

/// A borrowed, read-only decoding of one datagram.
#[derive(Debug)]
pub struct PacketView<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Transport protocol as carried on the wire (6, 17, 1 or 58).
    pub protocol: u8,
    pub transport: Transport,
    /// Transport header plus payload, bounded by the IP length field.
    pub segment: &'a [u8],
    pub fragment: Option<FragmentInfo>,
    /// TOS (v4) / Traffic Class (v6).
    pub tos: u8,
    /// TTL (v4) / Hop Limit (v6).
    pub hop_limit: u8,
}

impl PacketView<'_> {
    #[inline]
    pub fn is_ipv6(&self) -> bool {
        matches!(self.src, IpAddr::V6(_))
    }

    /// True when this datagram is a fragment other than the first; its
    /// transport header is unavailable.
    #[inline]
    pub fn is_later_fragment(&self) -> bool {
        self.fragment.map(|f| f.offset != 0).unwrap_or(false)
    }
}

/// Decode a datagram, dispatching on the version nibble.
pub fn parse(data: &[u8]) -> Result<PacketView<'_>, ParseError> {
    let first = *data.first().ok_or(ParseError::TooShort)?;
    match first >> 4 {
        4 => parse_ipv4(data),
        6 => parse_ipv6(data),
        version => Err(ParseError::BadVersion(version)),
    }
}

/// Decode an IPv4 datagram.
pub fn parse_ipv4(data: &[u8]) -> Result<PacketView<'_>, ParseError> {
    if data.len() < IPV4_MIN_HEADER_LEN {
        return Err(ParseError::TooShort);
    }
    if data[0] >> 4 != 4 {
        return Err(ParseError::BadVersion(data[0] >> 4));
    }
    let header_len = usize::from(data[0] & 0x0f) * 4;
    if header_len < IPV4_MIN_HEADER_LEN || header_len > data.len() {
        return Err(ParseError::BadHeaderLength);
    }
    let total_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
    if total_len < header_len {
        return Err(ParseError::BadHeaderLength);
    }
    if total_len > data.len() {
        return Err(ParseError::TooShort);
    }

    let ident = u16::from_be_bytes([data[4], data[5]]);
    let flags_frag = u16::from_be_bytes([data[6], data[7]]);
    let more = flags_frag & 0x2000 != 0;
    let offset = flags_frag & 0x1fff;
    let fragment = (more || offset != 0).then_some(FragmentInfo {
        ident: u32::from(ident),
        offset,
        more,
    });

    let protocol = data[9];
    let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
    // Trailing link-layer padding past Total Length is not part of the
    // segment.
    let segment = &data[header_len..total_len];

    let transport = if offset != 0 {
        Transport::Other { protocol }
    } else {
        parse_transport(protocol, segment)?
    };

    Ok(PacketView {
        src: IpAddr::V4(src),
        dst: IpAddr::V4(dst),
        protocol,
        transport,
        segment,
        fragment,
        tos: data[1],
        hop_limit: data[8],
    })
}

/// Decode an IPv6 datagram, walking extension headers to the transport.
pub fn parse_ipv6(data: &[u8]) -> Result<PacketView<'_>, ParseError> {
    if data.len() < IPV6_HEADER_LEN {
        return Err(ParseError::TooShort);
    }
    if data[0] >> 4 != 6 {
        return Err(ParseError::BadVersion(data[0] >> 4));
    }
    let payload_len = usize::from(u16::from_be_bytes([data[4], data[5]]));
    if IPV6_HEADER_LEN + payload_len > data.len() {
        return Err(ParseError::TooShort);
    }

    let tos = (data[0] & 0x0f) << 4 | data[1] >> 4;
    let hop_limit = data[7];
    let src = read_ipv6_addr(&data[8..24]);
    let dst = read_ipv6_addr(&data[24..40]);

    // Walk extension headers. Anything past Payload Length is framing slack.
    let mut next_header = data[6];
    let mut offset = IPV6_HEADER_LEN;
    let end = IPV6_HEADER_LEN + payload_len;
    let mut fragment = None;
    loop {
        match next_header {
            // Hop-by-Hop, Routing, Destination Options: length-prefixed.
            0 | 43 | 60 => {
                if offset + 2 > end {
                    return Err(ParseError::TooShort);
                }
                let ext_len = 8 + usize::from(data[offset + 1]) * 8;
                if offset + ext_len > end {
                    return Err(ParseError::TooShort);
                }
                next_header = data[offset];
                offset += ext_len;
            }
            // Fragment: fixed 8 bytes.
            44 => {
                if offset + IPV6_FRAGMENT_HEADER_LEN > end {
                    return Err(ParseError::TooShort);
                }
                let frag = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
                fragment = Some(FragmentInfo {
                    ident: u32::from_be_bytes([
                        data[offset + 4],
                        data[offset + 5],
                        data[offset + 6],
                        data[offset + 7],
                    ]),
                    offset: frag >> 3,
                    more: frag & 0x1 != 0,
                });
                next_header = data[offset];
                offset += IPV6_FRAGMENT_HEADER_LEN;
            }
            _ => break,
        }
    }

    let segment = &data[offset..end];
    let later_fragment = fragment.map(|f: FragmentInfo| f.offset != 0).unwrap_or(false);
    let transport = if later_fragment {
        Transport::Other {
            protocol: next_header,
        }
    } else {
        parse_transport(next_header, segment)?
    };

    Ok(PacketView {
        src: IpAddr::V6(src),
        dst: IpAddr::V6(dst),
        protocol: next_header,
        transport,
        segment,
        fragment,
        tos,
        hop_limit,
    })
}

/// Decode the transport header at the start of `segment`.
fn parse_transport(protocol: u8, segment: &[u8]) -> Result<Transport, ParseError> {
    match protocol {
        6 => {
            if segment.len() < 20 {
                return Err(ParseError::TooShort);
            }
            Ok(Transport::Tcp {
                src_port: u16::from_be_bytes([segment[0], segment[1]]),
                dst_port: u16::from_be_bytes([segment[2], segment[3]]),
                flags: segment[13],
            })
        }
        17 => {
            if segment.len() < 8 {
                return Err(ParseError::TooShort);
            }
            Ok(Transport::Udp {
                src_port: u16::from_be_bytes([segment[0], segment[1]]),
                dst_port: u16::from_be_bytes([segment[2], segment[3]]),
                checksum: u16::from_be_bytes([segment[6], segment[7]]),
            })
        }
        1 | 58 => {
            if segment.len() < 4 {
                return Err(ParseError::TooShort);
            }
            let ident = if segment.len() >= 8 {
                u16::from_be_bytes([segment[4], segment[5]])
            } else {
                0
            };
            Ok(Transport::Icmp {
                icmp_type: segment[0],
                code: segment[1],
                ident,
            })
        }
        other => Ok(Transport::Other { protocol: other }),
    }
}

fn read_ipv6_addr(bytes: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    Ipv6Addr::from(octets)
}
