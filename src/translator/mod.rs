//! IP/ICMP header translation between address families (RFC 7915).
//!
//! Both entry points take a parsed [`PacketView`] plus the session that owns
//! the flow, and return a freshly built datagram for the sibling family.
//! TCP and UDP checksums are patched with the RFC 1624 incremental update
//! over the pseudo-header delta; ICMP checksums are recomputed from scratch
//! because ICMPv4 has no pseudo header and ICMPv6 does.
//!
//! The gateway decrements TTL/Hop Limit on the way through: it is a routing
//! hop. A packet that would reach zero is dropped (no ICMP Time Exceeded is
//! emitted).

use std::net::{IpAddr, Ipv6Addr};

use thiserror::Error;

use crate::addr::Nat64Prefix;
use crate::checksum;
use crate::packet::{
    PacketView, Transport, IPV4_MIN_HEADER_LEN, IPV6_FRAGMENT_HEADER_LEN, IPV6_HEADER_LEN,
};
use crate::session::{FlowKey, Protocol, Session};

/// Why a packet could not be translated. A destination outside the NAT64
/// prefix never reaches the translator; the datapath drops it when
/// [`Nat64Prefix::extract`] returns `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TranslateError {
    /// Transport protocol with no translation (also non-first fragments,
    /// whose transport header is elsewhere).
    #[error("unsupported transport protocol {0}")]
    UnsupportedProtocol(u8),
    /// ICMP type/code outside the translation table.
    #[error("unsupported ICMP type {icmp_type} code {code}")]
    UnsupportedIcmp { icmp_type: u8, code: u8 },
    /// TTL/Hop Limit would reach zero; the packet dies here.
    #[error("hop limit expired")]
    HopLimitExceeded,
    /// ICMP error message without a usable embedded packet.
    #[error("malformed ICMP error payload")]
    BadIcmpPayload,
    /// Zero-checksum IPv4 UDP fragment: the IPv6 checksum cannot be
    /// computed from a single fragment (RFC 7915 §4.5).
    #[error("fragmented UDP with zero checksum")]
    UdpZeroChecksumFragment,
}

/// ICMPv6 informational/error types the gateway understands.
mod icmpv6 {
    pub const DEST_UNREACHABLE: u8 = 1;
    pub const PACKET_TOO_BIG: u8 = 2;
    pub const TIME_EXCEEDED: u8 = 3;
    pub const PARAM_PROBLEM: u8 = 4;
    pub const ECHO_REQUEST: u8 = 128;
    pub const ECHO_REPLY: u8 = 129;
}

/// ICMPv4 counterparts.
mod icmpv4 {
    pub const ECHO_REPLY: u8 = 0;
    pub const DEST_UNREACHABLE: u8 = 3;
    pub const ECHO_REQUEST: u8 = 8;
    pub const TIME_EXCEEDED: u8 = 11;
    pub const CODE_FRAG_NEEDED: u8 = 4;
}

/// Map an IPv6 transport protocol number to its IPv4 counterpart.
#[inline]
fn v4_protocol(next_header: u8) -> u8 {
    if next_header == 58 {
        1
    } else {
        next_header
    }
}

/// Map an IPv4 protocol number to its IPv6 counterpart.
#[inline]
fn v6_protocol(protocol: u8) -> u8 {
    if protocol == 1 {
        58
    } else {
        protocol
    }
}

fn is_icmpv6_error(icmp_type: u8) -> bool {
    matches!(
        icmp_type,
        icmpv6::DEST_UNREACHABLE | icmpv6::PACKET_TOO_BIG | icmpv6::TIME_EXCEEDED
    )
}

fn is_icmpv4_error(icmp_type: u8) -> bool {
    matches!(
        icmp_type,
        icmpv4::DEST_UNREACHABLE | icmpv4::TIME_EXCEEDED
    )
}

/// Translate an outbound IPv6 datagram to IPv4 (RFC 7915 §5).
///
/// The session supplies the rewritten source endpoint (gateway address plus
/// allocated port) and the destination extracted from the NAT64 address.
pub fn translate_v6_to_v4(view: &PacketView, session: &Session) -> Result<Vec<u8>, TranslateError> {
    let (v6_src, v6_dst) = match (view.src, view.dst) {
        (IpAddr::V6(s), IpAddr::V6(d)) => (s, d),
        _ => return Err(TranslateError::UnsupportedProtocol(view.protocol)),
    };
    if view.hop_limit <= 1 {
        return Err(TranslateError::HopLimitExceeded);
    }

    let seg_len = view.segment.len();
    let segment: Vec<u8> = match view.transport {
        Transport::Tcp { src_port, .. } => {
            let mut seg = view.segment.to_vec();
            seg[0..2].copy_from_slice(&session.v4_src_port.to_be_bytes());
            let old_csum = u16::from_be_bytes([seg[16], seg[17]]);
            let old_sum = checksum::sum_bytes(
                checksum::pseudo_sum_v6(&v6_src, &v6_dst, 6, seg_len as u32),
                &src_port.to_be_bytes(),
            );
            let new_sum = checksum::sum_bytes(
                checksum::pseudo_sum_v4(session.v4_src, session.v4_dst, 6, seg_len as u16),
                &session.v4_src_port.to_be_bytes(),
            );
            let csum = checksum::incremental_update(old_csum, old_sum, new_sum);
            seg[16..18].copy_from_slice(&csum.to_be_bytes());
            seg
        }
        Transport::Udp {
            src_port, checksum: udp_csum, ..
        } => {
            let mut seg = view.segment.to_vec();
            seg[0..2].copy_from_slice(&session.v4_src_port.to_be_bytes());
            let csum = if udp_csum == 0 {
                // Zero checksums are illegal over IPv6; compute afresh over
                // the IPv4 pseudo header rather than propagating garbage.
                if view.fragment.is_some() {
                    return Err(TranslateError::UdpZeroChecksumFragment);
                }
                seg[6] = 0;
                seg[7] = 0;
                checksum::finalize_udp(checksum::transport_checksum(
                    checksum::pseudo_sum_v4(session.v4_src, session.v4_dst, 17, seg_len as u16),
                    &seg,
                ))
            } else {
                let old_sum = checksum::sum_bytes(
                    checksum::pseudo_sum_v6(&v6_src, &v6_dst, 17, seg_len as u32),
                    &src_port.to_be_bytes(),
                );
                let new_sum = checksum::sum_bytes(
                    checksum::pseudo_sum_v4(session.v4_src, session.v4_dst, 17, seg_len as u16),
                    &session.v4_src_port.to_be_bytes(),
                );
                checksum::finalize_udp(checksum::incremental_update(udp_csum, old_sum, new_sum))
            };
            seg[6..8].copy_from_slice(&csum.to_be_bytes());
            seg
        }
        Transport::Icmp { .. } => {
            let mut seg = translate_icmp_v6_to_v4(view.segment, session)?;
            // ICMPv4 checksum covers the message only, no pseudo header.
            seg[2] = 0;
            seg[3] = 0;
            let csum = checksum::internet_checksum(&seg);
            seg[2..4].copy_from_slice(&csum.to_be_bytes());
            seg
        }
        Transport::Other { protocol } => return Err(TranslateError::UnsupportedProtocol(protocol)),
    };

    let mut out = vec![0u8; IPV4_MIN_HEADER_LEN];
    out[0] = 0x45;
    out[1] = view.tos;
    let total_len = (IPV4_MIN_HEADER_LEN + segment.len()) as u16;
    out[2..4].copy_from_slice(&total_len.to_be_bytes());
    match view.fragment {
        Some(frag) => {
            // IPv6 carries a 32-bit identification; IPv4 keeps the low half.
            out[4..6].copy_from_slice(&(frag.ident as u16).to_be_bytes());
            let mut flags_frag = frag.offset & 0x1fff;
            if frag.more {
                flags_frag |= 0x2000;
            }
            out[6..8].copy_from_slice(&flags_frag.to_be_bytes());
        }
        None => {
            out[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
        }
    }
    out[8] = view.hop_limit - 1;
    out[9] = v4_protocol(view.protocol);
    out[12..16].copy_from_slice(&session.v4_src.octets());
    out[16..20].copy_from_slice(&session.v4_dst.octets());
    let header_csum = checksum::internet_checksum(&out[..IPV4_MIN_HEADER_LEN]);
    out[10..12].copy_from_slice(&header_csum.to_be_bytes());

    out.extend_from_slice(&segment);
    Ok(out)
}

/// Translate an inbound IPv4 datagram to IPv6 (RFC 7915 §4).
///
/// The session restores the IPv6 client endpoint; the source address is
/// synthesized under the NAT64 prefix, so even mid-path routers (senders of
/// ICMP errors) get a valid IPv6 form.
pub fn translate_v4_to_v6(
    view: &PacketView,
    session: &Session,
    prefix: &Nat64Prefix,
) -> Result<Vec<u8>, TranslateError> {
    let v4_src = match view.src {
        IpAddr::V4(s) => s,
        IpAddr::V6(_) => return Err(TranslateError::UnsupportedProtocol(view.protocol)),
    };
    if view.hop_limit <= 1 {
        return Err(TranslateError::HopLimitExceeded);
    }

    let v6_src = prefix.embed(v4_src);
    let v6_dst = session.key.v6_src;
    let v4_dst = session.v4_src; // the gateway's external address
    let seg_len = view.segment.len();

    let segment: Vec<u8> = match view.transport {
        Transport::Tcp { dst_port, .. } => {
            let mut seg = view.segment.to_vec();
            seg[2..4].copy_from_slice(&session.key.src_port.to_be_bytes());
            let old_csum = u16::from_be_bytes([seg[16], seg[17]]);
            let old_sum = checksum::sum_bytes(
                checksum::pseudo_sum_v4(v4_src, v4_dst, 6, seg_len as u16),
                &dst_port.to_be_bytes(),
            );
            let new_sum = checksum::sum_bytes(
                checksum::pseudo_sum_v6(&v6_src, &v6_dst, 6, seg_len as u32),
                &session.key.src_port.to_be_bytes(),
            );
            let csum = checksum::incremental_update(old_csum, old_sum, new_sum);
            seg[16..18].copy_from_slice(&csum.to_be_bytes());
            seg
        }
        Transport::Udp {
            dst_port, checksum: udp_csum, ..
        } => {
            let mut seg = view.segment.to_vec();
            seg[2..4].copy_from_slice(&session.key.src_port.to_be_bytes());
            let csum = if udp_csum == 0 {
                // Optional over IPv4, mandatory over IPv6: compute it.
                if view.fragment.is_some() {
                    return Err(TranslateError::UdpZeroChecksumFragment);
                }
                seg[6] = 0;
                seg[7] = 0;
                checksum::finalize_udp(checksum::transport_checksum(
                    checksum::pseudo_sum_v6(&v6_src, &v6_dst, 17, seg_len as u32),
                    &seg,
                ))
            } else {
                let old_sum = checksum::sum_bytes(
                    checksum::pseudo_sum_v4(v4_src, v4_dst, 17, seg_len as u16),
                    &dst_port.to_be_bytes(),
                );
                let new_sum = checksum::sum_bytes(
                    checksum::pseudo_sum_v6(&v6_src, &v6_dst, 17, seg_len as u32),
                    &session.key.src_port.to_be_bytes(),
                );
                checksum::finalize_udp(checksum::incremental_update(udp_csum, old_sum, new_sum))
            };
            seg[6..8].copy_from_slice(&csum.to_be_bytes());
            seg
        }
        Transport::Icmp { .. } => {
            let mut seg = translate_icmp_v4_to_v6(view.segment, session)?;
            // ICMPv6 checksum includes the IPv6 pseudo header.
            seg[2] = 0;
            seg[3] = 0;
            let csum = checksum::transport_checksum(
                checksum::pseudo_sum_v6(&v6_src, &v6_dst, 58, seg.len() as u32),
                &seg,
            );
            seg[2..4].copy_from_slice(&csum.to_be_bytes());
            seg
        }
        Transport::Other { protocol } => return Err(TranslateError::UnsupportedProtocol(protocol)),
    };

    let next_header = v6_protocol(view.protocol);
    let fragment = view.fragment;
    let ext_len = if fragment.is_some() {
        IPV6_FRAGMENT_HEADER_LEN
    } else {
        0
    };

    let mut out = vec![0u8; IPV6_HEADER_LEN + ext_len];
    out[0] = 0x60 | (view.tos >> 4);
    out[1] = view.tos << 4; // Flow Label = 0
    let payload_len = (ext_len + segment.len()) as u16;
    out[4..6].copy_from_slice(&payload_len.to_be_bytes());
    out[6] = if fragment.is_some() { 44 } else { next_header };
    out[7] = view.hop_limit - 1;
    out[8..24].copy_from_slice(&v6_src.octets());
    out[24..40].copy_from_slice(&v6_dst.octets());
    if let Some(frag) = fragment {
        out[40] = next_header;
        let mut frag_field = frag.offset << 3;
        if frag.more {
            frag_field |= 0x1;
        }
        out[42..44].copy_from_slice(&frag_field.to_be_bytes());
        out[44..48].copy_from_slice(&frag.ident.to_be_bytes());
    }

    out.extend_from_slice(&segment);
    Ok(out)
}

/// Rewrite an ICMPv6 message as ICMPv4. Checksum is left for the caller.
fn translate_icmp_v6_to_v4(segment: &[u8], session: &Session) -> Result<Vec<u8>, TranslateError> {
    let icmp_type = segment[0];
    let code = segment[1];

    match icmp_type {
        icmpv6::ECHO_REQUEST | icmpv6::ECHO_REPLY => {
            if segment.len() < 8 {
                return Err(TranslateError::BadIcmpPayload);
            }
            let mut out = segment.to_vec();
            out[0] = if icmp_type == icmpv6::ECHO_REQUEST {
                icmpv4::ECHO_REQUEST
            } else {
                icmpv4::ECHO_REPLY
            };
            // Identifier NAT, same scheme as ports.
            out[4..6].copy_from_slice(&session.v4_src_port.to_be_bytes());
            Ok(out)
        }
        icmpv6::DEST_UNREACHABLE => {
            let v4_code = match code {
                0 => 1,  // no route          -> host unreachable
                1 => 10, // admin prohibited  -> host admin prohibited
                2 => 1,  // beyond scope      -> host unreachable
                3 => 1,  // address unreach   -> host unreachable
                4 => 3,  // port unreachable  -> port unreachable
                _ => return Err(TranslateError::UnsupportedIcmp { icmp_type, code }),
            };
            build_icmpv4_error(icmpv4::DEST_UNREACHABLE, v4_code, 0, segment, session)
        }
        icmpv6::PACKET_TOO_BIG => {
            if segment.len() < 8 {
                return Err(TranslateError::BadIcmpPayload);
            }
            let mtu6 = u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]);
            // 20 fewer bytes of header on the IPv4 side.
            let mtu4 = mtu6.saturating_sub(20).min(u32::from(u16::MAX)) as u16;
            build_icmpv4_error(
                icmpv4::DEST_UNREACHABLE,
                icmpv4::CODE_FRAG_NEEDED,
                u32::from(mtu4),
                segment,
                session,
            )
        }
        icmpv6::TIME_EXCEEDED => {
            build_icmpv4_error(icmpv4::TIME_EXCEEDED, code, 0, segment, session)
        }
        _ => Err(TranslateError::UnsupportedIcmp { icmp_type, code }),
    }
}

/// Rewrite an ICMPv4 message as ICMPv6. Checksum is left for the caller.
fn translate_icmp_v4_to_v6(segment: &[u8], session: &Session) -> Result<Vec<u8>, TranslateError> {
    let icmp_type = segment[0];
    let code = segment[1];

    match icmp_type {
        icmpv4::ECHO_REQUEST | icmpv4::ECHO_REPLY => {
            if segment.len() < 8 {
                return Err(TranslateError::BadIcmpPayload);
            }
            let mut out = segment.to_vec();
            out[0] = if icmp_type == icmpv4::ECHO_REQUEST {
                icmpv6::ECHO_REQUEST
            } else {
                icmpv6::ECHO_REPLY
            };
            // Restore the client's original identifier.
            out[4..6].copy_from_slice(&session.key.src_port.to_be_bytes());
            Ok(out)
        }
        icmpv4::DEST_UNREACHABLE => match code {
            // Fragmentation needed: becomes Packet Too Big with the MTU
            // grown by the 20 extra bytes of IPv6 header.
            icmpv4::CODE_FRAG_NEEDED => {
                if segment.len() < 8 {
                    return Err(TranslateError::BadIcmpPayload);
                }
                let mtu4 = u16::from_be_bytes([segment[6], segment[7]]);
                let mtu6 = if mtu4 == 0 {
                    1280
                } else {
                    u32::from(mtu4) + 20
                };
                build_icmpv6_error(icmpv6::PACKET_TOO_BIG, 0, mtu6, segment, session)
            }
            // Protocol unreachable: Parameter Problem pointing at the Next
            // Header field (offset 6 in the IPv6 header).
            2 => build_icmpv6_error(icmpv6::PARAM_PROBLEM, 1, 6, segment, session),
            3 => build_icmpv6_error(icmpv6::DEST_UNREACHABLE, 4, 0, segment, session),
            9 | 10 | 13 => build_icmpv6_error(icmpv6::DEST_UNREACHABLE, 1, 0, segment, session),
            0 | 1 | 5 | 6 | 7 | 8 | 11 | 12 => {
                build_icmpv6_error(icmpv6::DEST_UNREACHABLE, 0, 0, segment, session)
            }
            _ => Err(TranslateError::UnsupportedIcmp { icmp_type, code }),
        },
        icmpv4::TIME_EXCEEDED => {
            build_icmpv6_error(icmpv6::TIME_EXCEEDED, code, 0, segment, session)
        }
        _ => Err(TranslateError::UnsupportedIcmp { icmp_type, code }),
    }
}

/// Assemble an ICMPv4 error: 8-byte header (`rest` carries the MTU for
/// Fragmentation Needed) followed by the translated embedded packet.
fn build_icmpv4_error(
    icmp_type: u8,
    code: u8,
    rest: u32,
    segment: &[u8],
    session: &Session,
) -> Result<Vec<u8>, TranslateError> {
    if segment.len() < 8 {
        return Err(TranslateError::BadIcmpPayload);
    }
    let embedded = translate_embedded_v6_to_v4(&segment[8..], session)?;
    let mut out = vec![0u8; 8];
    out[0] = icmp_type;
    out[1] = code;
    out[4..8].copy_from_slice(&rest.to_be_bytes());
    out.extend_from_slice(&embedded);
    Ok(out)
}

/// Assemble an ICMPv6 error: 8-byte header (`rest` carries the MTU for
/// Packet Too Big, the pointer for Parameter Problem) plus the translated
/// embedded packet.
fn build_icmpv6_error(
    icmp_type: u8,
    code: u8,
    rest: u32,
    segment: &[u8],
    session: &Session,
) -> Result<Vec<u8>, TranslateError> {
    if segment.len() < 8 {
        return Err(TranslateError::BadIcmpPayload);
    }
    let embedded = translate_embedded_v4_to_v6(&segment[8..], session)?;
    let mut out = vec![0u8; 8];
    out[0] = icmp_type;
    out[1] = code;
    out[4..8].copy_from_slice(&rest.to_be_bytes());
    out.extend_from_slice(&embedded);
    Ok(out)
}

/// Translate the packet embedded in an outbound ICMPv6 error.
///
/// The embedded datagram is one the client received, sourced from the IPv4
/// host's synthesized address and destined to the client, so its IPv4 form
/// uses the session's endpoints with the roles swapped, and the client-side
/// port (the embedded destination port) becomes the allocated port.
/// Only the IP header and the first 8 bytes beyond it are carried; an
/// embedded transport checksum cannot be fixed from 8 bytes and is left
/// untouched, as RFC 7915 permits.
fn translate_embedded_v6_to_v4(
    embedded: &[u8],
    session: &Session,
) -> Result<Vec<u8>, TranslateError> {
    if embedded.len() < IPV6_HEADER_LEN {
        return Err(TranslateError::BadIcmpPayload);
    }
    let next_header = embedded[6];
    let transport = &embedded[IPV6_HEADER_LEN..];
    let carry = transport.len().min(8);

    let mut inner = vec![0u8; IPV4_MIN_HEADER_LEN];
    inner[0] = 0x45;
    inner[1] = (embedded[0] & 0x0f) << 4 | embedded[1] >> 4;
    let total_len = (IPV4_MIN_HEADER_LEN + carry) as u16;
    inner[2..4].copy_from_slice(&total_len.to_be_bytes());
    inner[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    inner[8] = embedded[7];
    inner[9] = v4_protocol(next_header);
    // Roles are swapped relative to the outer packet.
    inner[12..16].copy_from_slice(&session.v4_dst.octets());
    inner[16..20].copy_from_slice(&session.v4_src.octets());
    let csum = checksum::internet_checksum(&inner[..IPV4_MIN_HEADER_LEN]);
    inner[10..12].copy_from_slice(&csum.to_be_bytes());

    inner.extend_from_slice(&transport[..carry]);
    rewrite_embedded_transport(
        &mut inner[IPV4_MIN_HEADER_LEN..],
        next_header,
        EmbeddedDirection::ToV4,
        session,
    );
    Ok(inner)
}

/// Translate the packet embedded in an inbound ICMPv4 error.
///
/// The embedded datagram is one the gateway sent, sourced from the gateway
/// address and allocated port, so its IPv6 form restores the client's
/// source endpoint and synthesizes the destination the client targeted.
fn translate_embedded_v4_to_v6(
    embedded: &[u8],
    session: &Session,
) -> Result<Vec<u8>, TranslateError> {
    if embedded.len() < IPV4_MIN_HEADER_LEN {
        return Err(TranslateError::BadIcmpPayload);
    }
    let header_len = usize::from(embedded[0] & 0x0f) * 4;
    if embedded[0] >> 4 != 4 || header_len < IPV4_MIN_HEADER_LEN || header_len > embedded.len() {
        return Err(TranslateError::BadIcmpPayload);
    }
    let protocol = embedded[9];
    let transport = &embedded[header_len..];
    let carry = transport.len().min(8);

    let mut inner = vec![0u8; IPV6_HEADER_LEN];
    inner[0] = 0x60 | (embedded[1] >> 4);
    inner[1] = embedded[1] << 4;
    inner[4..6].copy_from_slice(&(carry as u16).to_be_bytes());
    inner[6] = v6_protocol(protocol);
    inner[7] = embedded[8];
    inner[8..24].copy_from_slice(&session.key.v6_src.octets());
    inner[24..40].copy_from_slice(&session.key.v6_dst.octets());

    inner.extend_from_slice(&transport[..carry]);
    rewrite_embedded_transport(
        &mut inner[IPV6_HEADER_LEN..],
        protocol,
        EmbeddedDirection::ToV6,
        session,
    );
    Ok(inner)
}

enum EmbeddedDirection {
    ToV4,
    ToV6,
}

/// Patch the NAT-translated field in the first 8 transport bytes of an
/// embedded packet: the client-side port or echo identifier.
fn rewrite_embedded_transport(
    transport: &mut [u8],
    protocol: u8,
    direction: EmbeddedDirection,
    session: &Session,
) {
    match protocol {
        6 | 17 => {
            if transport.len() < 4 {
                return;
            }
            match direction {
                // Embedded dst is the client: its port becomes the
                // allocated port on the IPv4 side.
                EmbeddedDirection::ToV4 => transport[2..4]
                    .copy_from_slice(&session.v4_src_port.to_be_bytes()),
                // Embedded src was the gateway: restore the client's port.
                EmbeddedDirection::ToV6 => transport[0..2]
                    .copy_from_slice(&session.key.src_port.to_be_bytes()),
            }
        }
        1 | 58 => {
            if transport.len() < 6 {
                return;
            }
            match direction {
                EmbeddedDirection::ToV4 => {
                    transport[0] = match transport[0] {
                        x if x == icmpv6::ECHO_REQUEST => icmpv4::ECHO_REQUEST,
                        x if x == icmpv6::ECHO_REPLY => icmpv4::ECHO_REPLY,
                        other => other,
                    };
                    transport[4..6].copy_from_slice(&session.v4_src_port.to_be_bytes());
                }
                EmbeddedDirection::ToV6 => {
                    transport[0] = match transport[0] {
                        x if x == icmpv4::ECHO_REQUEST => icmpv6::ECHO_REQUEST,
                        x if x == icmpv4::ECHO_REPLY => icmpv6::ECHO_REPLY,
                        other => other,
                    };
                    transport[4..6].copy_from_slice(&session.key.src_port.to_be_bytes());
                }
            }
        }
        _ => {}
    }
}

/// Derive the forward flow key of an outbound IPv6 packet. ICMPv6 errors
/// are attributed to the flow of the packet they embed.
pub fn v6_flow_key(view: &PacketView) -> Option<FlowKey> {
    let (v6_src, v6_dst) = match (view.src, view.dst) {
        (IpAddr::V6(s), IpAddr::V6(d)) => (s, d),
        _ => return None,
    };
    match view.transport {
        Transport::Tcp {
            src_port, dst_port, ..
        } => Some(FlowKey {
            protocol: Protocol::Tcp,
            v6_src,
            src_port,
            v6_dst,
            dst_port,
        }),
        Transport::Udp {
            src_port, dst_port, ..
        } => Some(FlowKey {
            protocol: Protocol::Udp,
            v6_src,
            src_port,
            v6_dst,
            dst_port,
        }),
        Transport::Icmp {
            icmp_type, ident, ..
        } if icmp_type == icmpv6::ECHO_REQUEST || icmp_type == icmpv6::ECHO_REPLY => {
            Some(FlowKey {
                protocol: Protocol::Icmp,
                v6_src,
                src_port: ident,
                v6_dst,
                dst_port: 0,
            })
        }
        Transport::Icmp { icmp_type, .. } if is_icmpv6_error(icmp_type) => {
            // The embedded packet travelled host -> client; the flow key is
            // read with the roles swapped back.
            let embedded = view.segment.get(8..)?;
            if embedded.len() < IPV6_HEADER_LEN + 4 {
                return None;
            }
            let embedded_src = read_v6(&embedded[8..24]);
            let transport = &embedded[IPV6_HEADER_LEN..];
            match embedded[6] {
                6 | 17 => Some(FlowKey {
                    protocol: Protocol::from_ipv6_next_header(embedded[6])?,
                    v6_src,
                    src_port: u16::from_be_bytes([transport[2], transport[3]]),
                    v6_dst: embedded_src,
                    dst_port: u16::from_be_bytes([transport[0], transport[1]]),
                }),
                58 if transport.len() >= 6 => Some(FlowKey {
                    protocol: Protocol::Icmp,
                    v6_src,
                    src_port: u16::from_be_bytes([transport[4], transport[5]]),
                    v6_dst: embedded_src,
                    dst_port: 0,
                }),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Derive the (protocol, allocated port) pair that finds the session for an
/// inbound IPv4 packet. ICMPv4 errors are resolved through the source port
/// of the packet they embed; the outer addresses may belong to a mid-path
/// router, but the embedded packet is one this gateway sent.
pub fn v4_reverse_hint(view: &PacketView) -> Option<(Protocol, u16)> {
    match view.transport {
        Transport::Tcp { dst_port, .. } => Some((Protocol::Tcp, dst_port)),
        Transport::Udp { dst_port, .. } => Some((Protocol::Udp, dst_port)),
        Transport::Icmp {
            icmp_type, ident, ..
        } if icmp_type == icmpv4::ECHO_REQUEST || icmp_type == icmpv4::ECHO_REPLY => {
            Some((Protocol::Icmp, ident))
        }
        Transport::Icmp { icmp_type, .. } if is_icmpv4_error(icmp_type) => {
            let embedded = view.segment.get(8..)?;
            if embedded.len() < IPV4_MIN_HEADER_LEN {
                return None;
            }
            let header_len = usize::from(embedded[0] & 0x0f) * 4;
            if embedded.len() < header_len + 4 {
                return None;
            }
            let transport = &embedded[header_len..];
            match embedded[9] {
                6 => Some((
                    Protocol::Tcp,
                    u16::from_be_bytes([transport[0], transport[1]]),
                )),
                17 => Some((
                    Protocol::Udp,
                    u16::from_be_bytes([transport[0], transport[1]]),
                )),
                1 if transport.len() >= 6 => Some((
                    Protocol::Icmp,
                    u16::from_be_bytes([transport[4], transport[5]]),
                )),
                _ => None,
            }
        }
        _ => None,
    }
}

fn read_v6(bytes: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    Ipv6Addr::from(octets)
}
