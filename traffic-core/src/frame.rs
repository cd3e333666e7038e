//! On-wire frame construction.
//!
//! `build` deterministically encodes one Ethernet frame from a resolved
//! template, a sequence number, and an emit timestamp. Flood protocols
//! additionally draw randomized fields (TCP sequence, source port) from
//! the caller-owned PRNG, which the runner seeds at enable time so
//! identical runs produce identical frames.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rand::Rng;

use crate::error::{CoreError, Result};
use crate::port::MacAddr;
use crate::profile::Protocol;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const ETHERTYPE_MPLS: u16 = 0x8847;
pub const ETHERTYPE_QINQ: u16 = 0x88A8;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

pub const VXLAN_PORT: u16 = 4789;
pub const VXLAN_FLAGS: u8 = 0x08;

const ETH_LEN: usize = 14;
const IPV4_LEN: usize = 20;
const IPV6_LEN: usize = 40;
const UDP_LEN: usize = 8;
const TCP_LEN: usize = 20;
const MPLS_LEN: usize = 4;
const VXLAN_LEN: usize = 8;
const QINQ_TAGS_LEN: usize = 8;

/// Ethernet minimum payload rules pad short frames up to this length.
const ETH_MIN_FRAME: usize = 64;

/// 16-byte little-endian payload signature: magic, profile id (fnv-1a of
/// the name), sequence number, emit time in microseconds mod 2^32.
pub const SIGNATURE_MAGIC: u32 = 0x5645_5031; // "VEP1"
pub const SIGNATURE_LEN: usize = 16;

/// Everything the builder needs, resolved once at enable time.
#[derive(Debug, Clone)]
pub struct FrameTemplate {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_l4_port: u16,
    pub dst_l4_port: u16,
    pub dscp: u8,
    pub protocol: Protocol,
    pub profile_id: u32,
}

/// Decoded payload signature, used by the benchmark receive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub profile_id: u32,
    pub seq: u32,
    pub emit_micros: u32,
}

/// FNV-1a over the profile name; the 4-byte profile id in the signature.
pub fn fnv1a(name: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Header bytes in front of the payload for each encapsulation.
fn header_len(protocol: &Protocol) -> usize {
    match protocol {
        Protocol::Ipv4 | Protocol::UdpFlood | Protocol::DnsAmp => ETH_LEN + IPV4_LEN + UDP_LEN,
        Protocol::Ipv6 => ETH_LEN + IPV6_LEN + UDP_LEN,
        Protocol::Mpls { .. } => ETH_LEN + MPLS_LEN + IPV4_LEN + UDP_LEN,
        Protocol::Vxlan { .. } => {
            ETH_LEN + IPV4_LEN + UDP_LEN + VXLAN_LEN + ETH_LEN + IPV4_LEN + UDP_LEN
        }
        Protocol::Qinq { .. } => ETH_LEN + QINQ_TAGS_LEN + IPV4_LEN + UDP_LEN,
        Protocol::TcpSynFlood | Protocol::HttpFlood => ETH_LEN + IPV4_LEN + TCP_LEN,
    }
}

/// Smallest `frame_size` this encapsulation can realize: headers plus
/// the mandatory payload (signature, DNS skeleton, HTTP request), and
/// never below the Ethernet minimum.
pub fn min_frame_len(protocol: &Protocol) -> usize {
    let floor = match protocol {
        Protocol::Ipv4
        | Protocol::Ipv6
        | Protocol::Mpls { .. }
        | Protocol::Vxlan { .. }
        | Protocol::Qinq { .. }
        | Protocol::UdpFlood => header_len(protocol) + SIGNATURE_LEN,
        Protocol::DnsAmp => header_len(protocol) + DNS_QUERY_LEN,
        Protocol::TcpSynFlood => header_len(protocol),
        // Conservative bound covering the Host header for any address.
        Protocol::HttpFlood => 192,
    };
    floor.max(ETH_MIN_FRAME)
}

/// Byte offset below which the corruption impairment must not touch:
/// all headers plus the signature where one is present.
pub fn corruption_floor(protocol: &Protocol) -> usize {
    match protocol {
        Protocol::Ipv4
        | Protocol::Ipv6
        | Protocol::Mpls { .. }
        | Protocol::Vxlan { .. }
        | Protocol::Qinq { .. }
        | Protocol::UdpFlood => header_len(protocol) + SIGNATURE_LEN,
        _ => header_len(protocol),
    }
}

/// Internet checksum (RFC 1071) over `data`.
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// L4 checksum with the v4 or v6 pseudo-header. The checksum field in
/// `segment` must already be zero.
fn l4_checksum(src: IpAddr, dst: IpAddr, proto: u8, segment: &[u8]) -> u16 {
    let mut pseudo = Vec::with_capacity(40 + segment.len());
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            pseudo.extend_from_slice(&s.octets());
            pseudo.extend_from_slice(&d.octets());
            pseudo.push(0);
            pseudo.push(proto);
            pseudo.extend_from_slice(&(segment.len() as u16).to_be_bytes());
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            pseudo.extend_from_slice(&s.octets());
            pseudo.extend_from_slice(&d.octets());
            pseudo.extend_from_slice(&(segment.len() as u32).to_be_bytes());
            pseudo.extend_from_slice(&[0, 0, 0, proto]);
        }
        _ => return 0,
    }
    pseudo.extend_from_slice(segment);
    checksum(&pseudo)
}

fn write_eth(buf: &mut [u8], dst: MacAddr, src: MacAddr, ethertype: u16) -> usize {
    buf[0..6].copy_from_slice(&dst.octets());
    buf[6..12].copy_from_slice(&src.octets());
    buf[12..14].copy_from_slice(&ethertype.to_be_bytes());
    ETH_LEN
}

#[allow(clippy::too_many_arguments)]
fn write_ipv4(
    buf: &mut [u8],
    off: usize,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    dscp: u8,
    proto: u8,
    id: u16,
    total_len: u16,
) -> usize {
    let h = &mut buf[off..off + IPV4_LEN];
    h[0] = 0x45;
    h[1] = dscp << 2;
    h[2..4].copy_from_slice(&total_len.to_be_bytes());
    h[4..6].copy_from_slice(&id.to_be_bytes());
    h[6] = 0x40; // DF
    h[7] = 0x00;
    h[8] = 64; // TTL
    h[9] = proto;
    h[10] = 0;
    h[11] = 0;
    h[12..16].copy_from_slice(&src.octets());
    h[16..20].copy_from_slice(&dst.octets());
    let csum = checksum(h);
    buf[off + 10..off + 12].copy_from_slice(&csum.to_be_bytes());
    off + IPV4_LEN
}

fn write_ipv6(
    buf: &mut [u8],
    off: usize,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    dscp: u8,
    next: u8,
    payload_len: u16,
) -> usize {
    let tc = (dscp as u32) << 2;
    let word = (6u32 << 28) | (tc << 20);
    let h = &mut buf[off..off + IPV6_LEN];
    h[0..4].copy_from_slice(&word.to_be_bytes());
    h[4..6].copy_from_slice(&payload_len.to_be_bytes());
    h[6] = next;
    h[7] = 64; // hop limit
    h[8..24].copy_from_slice(&src.octets());
    h[24..40].copy_from_slice(&dst.octets());
    off + IPV6_LEN
}

/// UDP header plus checksum over the already-written payload that
/// follows it. `seg_len` covers header and payload.
fn write_udp(
    buf: &mut [u8],
    off: usize,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
    seg_len: u16,
) {
    buf[off..off + 2].copy_from_slice(&src_port.to_be_bytes());
    buf[off + 2..off + 4].copy_from_slice(&dst_port.to_be_bytes());
    buf[off + 4..off + 6].copy_from_slice(&seg_len.to_be_bytes());
    buf[off + 6] = 0;
    buf[off + 7] = 0;
    let mut csum = l4_checksum(src_ip, dst_ip, 17, &buf[off..off + seg_len as usize]);
    if csum == 0 {
        csum = 0xFFFF;
    }
    buf[off + 6..off + 8].copy_from_slice(&csum.to_be_bytes());
}

#[allow(clippy::too_many_arguments)]
fn write_tcp(
    buf: &mut [u8],
    off: usize,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    flags: u8,
    seg_len: u16,
) {
    let h = &mut buf[off..off + TCP_LEN];
    h[0..2].copy_from_slice(&src_port.to_be_bytes());
    h[2..4].copy_from_slice(&dst_port.to_be_bytes());
    h[4..8].copy_from_slice(&seq.to_be_bytes());
    h[8..12].copy_from_slice(&0u32.to_be_bytes()); // ack
    h[12] = 0x50; // data offset 5 words
    h[13] = flags;
    h[14..16].copy_from_slice(&65535u16.to_be_bytes());
    h[16] = 0;
    h[17] = 0;
    h[18] = 0;
    h[19] = 0;
    let csum = l4_checksum(src_ip, dst_ip, 6, &buf[off..off + seg_len as usize]);
    buf[off + 16..off + 18].copy_from_slice(&csum.to_be_bytes());
}

fn write_signature(buf: &mut [u8], off: usize, profile_id: u32, seq: u32, emit_micros: u32) {
    buf[off..off + 4].copy_from_slice(&SIGNATURE_MAGIC.to_le_bytes());
    buf[off + 4..off + 8].copy_from_slice(&profile_id.to_le_bytes());
    buf[off + 8..off + 12].copy_from_slice(&seq.to_le_bytes());
    buf[off + 12..off + 16].copy_from_slice(&emit_micros.to_le_bytes());
}

/// Parse a payload signature if the magic matches at `payload[0..16]`.
pub fn parse_signature(payload: &[u8]) -> Option<Signature> {
    if payload.len() < SIGNATURE_LEN {
        return None;
    }
    let magic = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    if magic != SIGNATURE_MAGIC {
        return None;
    }
    Some(Signature {
        profile_id: u32::from_le_bytes(payload[4..8].try_into().unwrap()),
        seq: u32::from_le_bytes(payload[8..12].try_into().unwrap()),
        emit_micros: u32::from_le_bytes(payload[12..16].try_into().unwrap()),
    })
}

const PAYLOAD_FILL: u8 = 0x58;

fn require_v4(ip: IpAddr, what: &str) -> Result<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(_) => Err(CoreError::Unencodable(format!(
            "{what} requires an IPv4 address"
        ))),
    }
}

fn require_v6(ip: IpAddr, what: &str) -> Result<Ipv6Addr> {
    match ip {
        IpAddr::V6(v6) => Ok(v6),
        IpAddr::V4(_) => Err(CoreError::Unencodable(format!(
            "{what} requires an IPv6 address"
        ))),
    }
}

/// Build one frame of exactly `frame_size` bytes (FCS excluded; the
/// kernel appends it).
///
/// Deterministic in its arguments: identical `(template, frame_size,
/// seq, emit_micros)` produce bit-identical output for non-flood tags;
/// flood tags additionally consume from `rng`.
pub fn build<R: Rng>(
    tpl: &FrameTemplate,
    frame_size: usize,
    seq: u32,
    emit_micros: u32,
    rng: &mut R,
) -> Result<Vec<u8>> {
    let min = min_frame_len(&tpl.protocol);
    if frame_size < min {
        return Err(CoreError::Unencodable(format!(
            "frame_size {frame_size} below {min} byte minimum for {}",
            tpl.protocol.tag()
        )));
    }

    let mut buf = vec![0u8; frame_size];
    match tpl.protocol {
        Protocol::Ipv4 => {
            build_ipv4_udp(tpl, &mut buf, seq, emit_micros, tpl.src_l4_port, true)?;
        }
        Protocol::UdpFlood => {
            let sport = rng.gen_range(1024..=65535);
            build_ipv4_udp(tpl, &mut buf, seq, emit_micros, sport, true)?;
        }
        Protocol::Ipv6 => build_ipv6_udp(tpl, &mut buf, seq, emit_micros)?,
        Protocol::Mpls { label } => build_mpls(tpl, &mut buf, seq, emit_micros, label)?,
        Protocol::Vxlan { vni } => build_vxlan(tpl, &mut buf, seq, emit_micros, vni)?,
        Protocol::Qinq {
            outer_vid,
            inner_vid,
        } => build_qinq(tpl, &mut buf, seq, emit_micros, outer_vid, inner_vid)?,
        Protocol::TcpSynFlood => {
            let sport = rng.gen_range(1024..=65535);
            let tcp_seq = rng.gen();
            build_tcp_segment(tpl, &mut buf, seq, sport, tcp_seq, 0x02, &[])?;
        }
        Protocol::HttpFlood => {
            let request = format!(
                "GET / HTTP/1.1\r\nHost: {}:{}\r\nUser-Agent: traffic-core\r\nConnection: keep-alive\r\n\r\n",
                tpl.dst_ip, tpl.dst_l4_port
            );
            if header_len(&tpl.protocol) + request.len() > frame_size {
                return Err(CoreError::Unencodable(format!(
                    "frame_size {frame_size} cannot hold the HTTP request"
                )));
            }
            let tcp_seq = rng.gen();
            // PSH|ACK data segment; flooding, not a conversation.
            build_tcp_segment(tpl, &mut buf, seq, tpl.src_l4_port, tcp_seq, 0x18, request.as_bytes())?;
        }
        Protocol::DnsAmp => build_dns_amp(tpl, &mut buf, seq)?,
    }
    Ok(buf)
}

fn build_ipv4_udp(
    tpl: &FrameTemplate,
    buf: &mut [u8],
    seq: u32,
    emit_micros: u32,
    src_port: u16,
    sign: bool,
) -> Result<()> {
    let src = require_v4(tpl.src_ip, "ipv4")?;
    let dst = require_v4(tpl.dst_ip, "ipv4")?;
    let ip_total = buf.len() - ETH_LEN;
    let udp_len = ip_total - IPV4_LEN;

    let off = write_eth(buf, tpl.dst_mac, tpl.src_mac, ETHERTYPE_IPV4);
    let off = write_ipv4(
        buf,
        off,
        src,
        dst,
        tpl.dscp,
        17,
        seq as u16,
        ip_total as u16,
    );
    let payload_off = off + UDP_LEN;
    fill_signed_payload(buf, payload_off, tpl.profile_id, seq, emit_micros, sign);
    write_udp(
        buf,
        off,
        tpl.src_ip,
        tpl.dst_ip,
        src_port,
        tpl.dst_l4_port,
        udp_len as u16,
    );
    Ok(())
}

fn build_ipv6_udp(tpl: &FrameTemplate, buf: &mut [u8], seq: u32, emit_micros: u32) -> Result<()> {
    let src = require_v6(tpl.src_ip, "ipv6")?;
    let dst = require_v6(tpl.dst_ip, "ipv6")?;
    let udp_len = buf.len() - ETH_LEN - IPV6_LEN;

    let off = write_eth(buf, tpl.dst_mac, tpl.src_mac, ETHERTYPE_IPV6);
    let off = write_ipv6(buf, off, src, dst, tpl.dscp, 17, udp_len as u16);
    let payload_off = off + UDP_LEN;
    fill_signed_payload(buf, payload_off, tpl.profile_id, seq, emit_micros, true);
    write_udp(
        buf,
        off,
        tpl.src_ip,
        tpl.dst_ip,
        tpl.src_l4_port,
        tpl.dst_l4_port,
        udp_len as u16,
    );
    Ok(())
}

fn build_mpls(
    tpl: &FrameTemplate,
    buf: &mut [u8],
    seq: u32,
    emit_micros: u32,
    label: u32,
) -> Result<()> {
    let src = require_v4(tpl.src_ip, "mpls inner")?;
    let dst = require_v4(tpl.dst_ip, "mpls inner")?;

    let off = write_eth(buf, tpl.dst_mac, tpl.src_mac, ETHERTYPE_MPLS);
    // label(20) | EXP(3) | S(1) | TTL(8); EXP carries the DSCP class bits
    let exp = (tpl.dscp >> 3) as u32;
    let shim = (label << 12) | (exp << 9) | (1 << 8) | 64;
    buf[off..off + 4].copy_from_slice(&shim.to_be_bytes());
    let off = off + MPLS_LEN;

    let ip_total = buf.len() - off;
    let udp_len = ip_total - IPV4_LEN;
    let off = write_ipv4(
        buf,
        off,
        src,
        dst,
        tpl.dscp,
        17,
        seq as u16,
        ip_total as u16,
    );
    let payload_off = off + UDP_LEN;
    fill_signed_payload(buf, payload_off, tpl.profile_id, seq, emit_micros, true);
    write_udp(
        buf,
        off,
        tpl.src_ip,
        tpl.dst_ip,
        tpl.src_l4_port,
        tpl.dst_l4_port,
        udp_len as u16,
    );
    Ok(())
}

fn build_vxlan(
    tpl: &FrameTemplate,
    buf: &mut [u8],
    seq: u32,
    emit_micros: u32,
    vni: u32,
) -> Result<()> {
    let src = require_v4(tpl.src_ip, "vxlan outer")?;
    let dst = require_v4(tpl.dst_ip, "vxlan outer")?;

    // Outer Ethernet + IPv4 + UDP(4789)
    let off = write_eth(buf, tpl.dst_mac, tpl.src_mac, ETHERTYPE_IPV4);
    let outer_ip_total = buf.len() - ETH_LEN;
    let outer_udp_len = outer_ip_total - IPV4_LEN;
    let off = write_ipv4(
        buf,
        off,
        src,
        dst,
        tpl.dscp,
        17,
        seq as u16,
        outer_ip_total as u16,
    );
    let outer_udp_off = off;
    let off = off + UDP_LEN;

    // VXLAN header: flags 0x08, reserved, VNI << 8
    buf[off] = VXLAN_FLAGS;
    buf[off + 4..off + 8].copy_from_slice(&(vni << 8).to_be_bytes());
    let off = off + VXLAN_LEN;

    // Inner Ethernet + IPv4 + UDP carrying the signed payload
    let inner = &mut buf[off..];
    let inner_len = inner.len();
    write_eth(inner, tpl.dst_mac, tpl.src_mac, ETHERTYPE_IPV4);
    let inner_ip_total = inner_len - ETH_LEN;
    let inner_udp_len = inner_ip_total - IPV4_LEN;
    let ioff = write_ipv4(
        inner,
        ETH_LEN,
        src,
        dst,
        tpl.dscp,
        17,
        seq as u16,
        inner_ip_total as u16,
    );
    let payload_off = ioff + UDP_LEN;
    fill_signed_payload(inner, payload_off, tpl.profile_id, seq, emit_micros, true);
    write_udp(
        inner,
        ioff,
        tpl.src_ip,
        tpl.dst_ip,
        tpl.src_l4_port,
        tpl.dst_l4_port,
        inner_udp_len as u16,
    );

    // Outer UDP checksum covers the finished inner frame.
    write_udp(
        buf,
        outer_udp_off,
        tpl.src_ip,
        tpl.dst_ip,
        tpl.src_l4_port,
        VXLAN_PORT,
        outer_udp_len as u16,
    );
    Ok(())
}

fn build_qinq(
    tpl: &FrameTemplate,
    buf: &mut [u8],
    seq: u32,
    emit_micros: u32,
    outer_vid: u16,
    inner_vid: u16,
) -> Result<()> {
    let src = require_v4(tpl.src_ip, "qinq")?;
    let dst = require_v4(tpl.dst_ip, "qinq")?;
    let pcp = (tpl.dscp >> 3) & 0x7;

    buf[0..6].copy_from_slice(&tpl.dst_mac.octets());
    buf[6..12].copy_from_slice(&tpl.src_mac.octets());
    // 802.1ad outer tag, then 802.1Q inner tag, then the real ethertype
    buf[12..14].copy_from_slice(&ETHERTYPE_QINQ.to_be_bytes());
    let outer_tci = ((pcp as u16) << 13) | outer_vid;
    buf[14..16].copy_from_slice(&outer_tci.to_be_bytes());
    buf[16..18].copy_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
    let inner_tci = ((pcp as u16) << 13) | inner_vid;
    buf[18..20].copy_from_slice(&inner_tci.to_be_bytes());
    buf[20..22].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let off = ETH_LEN + QINQ_TAGS_LEN;
    let ip_total = buf.len() - off;
    let udp_len = ip_total - IPV4_LEN;
    let off = write_ipv4(
        buf,
        off,
        src,
        dst,
        tpl.dscp,
        17,
        seq as u16,
        ip_total as u16,
    );
    let payload_off = off + UDP_LEN;
    fill_signed_payload(buf, payload_off, tpl.profile_id, seq, emit_micros, true);
    write_udp(
        buf,
        off,
        tpl.src_ip,
        tpl.dst_ip,
        tpl.src_l4_port,
        tpl.dst_l4_port,
        udp_len as u16,
    );
    Ok(())
}

fn build_tcp_segment(
    tpl: &FrameTemplate,
    buf: &mut [u8],
    seq: u32,
    src_port: u16,
    tcp_seq: u32,
    flags: u8,
    payload: &[u8],
) -> Result<()> {
    let src = require_v4(tpl.src_ip, "tcp flood")?;
    let dst = require_v4(tpl.dst_ip, "tcp flood")?;

    // IP total length covers only headers + payload; the rest of the
    // buffer is Ethernet padding.
    let seg_len = TCP_LEN + payload.len();
    let ip_total = IPV4_LEN + seg_len;

    let off = write_eth(buf, tpl.dst_mac, tpl.src_mac, ETHERTYPE_IPV4);
    let off = write_ipv4(buf, off, src, dst, tpl.dscp, 6, seq as u16, ip_total as u16);
    buf[off + TCP_LEN..off + seg_len].copy_from_slice(payload);
    write_tcp(
        buf,
        off,
        tpl.src_ip,
        tpl.dst_ip,
        src_port,
        tpl.dst_l4_port,
        tcp_seq,
        flags,
        seg_len as u16,
    );
    Ok(())
}

/// Encoded question for `example.com. IN ANY` plus the 12-byte header.
const DNS_QUERY_LEN: usize = 12 + 13 + 4;

fn build_dns_amp(tpl: &FrameTemplate, buf: &mut [u8], seq: u32) -> Result<()> {
    let src = require_v4(tpl.src_ip, "dns-amp")?;
    let dst = require_v4(tpl.dst_ip, "dns-amp")?;
    let ip_total = buf.len() - ETH_LEN;
    let udp_len = ip_total - IPV4_LEN;

    let off = write_eth(buf, tpl.dst_mac, tpl.src_mac, ETHERTYPE_IPV4);
    let off = write_ipv4(
        buf,
        off,
        src,
        dst,
        tpl.dscp,
        17,
        seq as u16,
        ip_total as u16,
    );
    let q = off + UDP_LEN;

    // DNS header: id, RD set, one question
    buf[q..q + 2].copy_from_slice(&(seq as u16).to_be_bytes());
    buf[q + 2..q + 4].copy_from_slice(&0x0100u16.to_be_bytes());
    buf[q + 4..q + 6].copy_from_slice(&1u16.to_be_bytes());
    // QNAME example.com, QTYPE ANY (the amplification query), QCLASS IN
    let name = b"\x07example\x03com\x00";
    buf[q + 12..q + 12 + name.len()].copy_from_slice(name);
    let qt = q + 12 + name.len();
    buf[qt..qt + 2].copy_from_slice(&255u16.to_be_bytes());
    buf[qt + 2..qt + 4].copy_from_slice(&1u16.to_be_bytes());

    for b in buf[qt + 4..].iter_mut() {
        *b = PAYLOAD_FILL;
    }
    write_udp(
        buf,
        off,
        tpl.src_ip,
        tpl.dst_ip,
        tpl.src_l4_port,
        tpl.dst_l4_port,
        udp_len as u16,
    );
    Ok(())
}

fn fill_signed_payload(
    buf: &mut [u8],
    payload_off: usize,
    profile_id: u32,
    seq: u32,
    emit_micros: u32,
    sign: bool,
) {
    let mut fill_from = payload_off;
    if sign {
        write_signature(buf, payload_off, profile_id, seq, emit_micros);
        fill_from += SIGNATURE_LEN;
    }
    for b in buf[fill_from..].iter_mut() {
        *b = PAYLOAD_FILL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn template(protocol: Protocol) -> FrameTemplate {
        FrameTemplate {
            src_mac: MacAddr([0x02, 0, 0, 0, 0, 0x01]),
            dst_mac: MacAddr([0x02, 0, 0, 0, 0, 0x02]),
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            src_l4_port: 40000,
            dst_l4_port: 9999,
            dscp: 0,
            protocol,
            profile_id: fnv1a("p1"),
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(1)
    }

    /// Internet checksum over a valid header, checksum included, is 0.
    fn verify_checksum(data: &[u8]) -> bool {
        checksum(data) == 0
    }

    #[test]
    fn ipv4_minimum_frame_is_valid() {
        let tpl = template(Protocol::Ipv4);
        let frame = build(&tpl, 64, 0, 0, &mut rng()).unwrap();
        assert_eq!(frame.len(), 64);
        assert_eq!(&frame[12..14], &ETHERTYPE_IPV4.to_be_bytes());
        assert!(verify_checksum(&frame[14..34]));
        // payload signature directly after UDP
        let sig = parse_signature(&frame[42..]).unwrap();
        assert_eq!(sig.seq, 0);
        assert_eq!(sig.profile_id, fnv1a("p1"));
    }

    #[test]
    fn ipv4_dscp_lands_in_tos() {
        let mut tpl = template(Protocol::Ipv4);
        tpl.dscp = 46;
        let frame = build(&tpl, 128, 0, 0, &mut rng()).unwrap();
        assert_eq!(frame[15], 46 << 2);
    }

    #[test]
    fn build_is_pure_for_deterministic_protocols() {
        let tpl = template(Protocol::Ipv4);
        let a = build(&tpl, 512, 7, 12345, &mut rng()).unwrap();
        let b = build(&tpl, 512, 7, 12345, &mut rng()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn vxlan_frame_shape() {
        let tpl = template(Protocol::Vxlan { vni: 5000 });
        let frame = build(&tpl, 1400, 0, 0, &mut rng()).unwrap();
        assert_eq!(frame.len(), 1400);
        // outer UDP destination 4789
        assert_eq!(&frame[36..38], &4789u16.to_be_bytes());
        // VXLAN flags byte and VNI 5000 = 0x001388
        assert_eq!(frame[42], 0x08);
        assert_eq!(&frame[46..49], &[0x00, 0x13, 0x88]);
        // inner Ethernet present after the VXLAN header
        let inner = &frame[50..];
        assert_eq!(&inner[12..14], &ETHERTYPE_IPV4.to_be_bytes());
        assert!(verify_checksum(&inner[14..34]));
        // inner payload carries the signature
        assert!(parse_signature(&inner[42..]).is_some());
    }

    #[test]
    fn vxlan_below_minimum_is_unencodable() {
        let tpl = template(Protocol::Vxlan { vni: 1 });
        assert!(matches!(
            build(&tpl, 100, 0, 0, &mut rng()),
            Err(CoreError::Unencodable(_))
        ));
    }

    #[test]
    fn qinq_tag_stack() {
        let tpl = template(Protocol::Qinq {
            outer_vid: 100,
            inner_vid: 200,
        });
        let frame = build(&tpl, 128, 0, 0, &mut rng()).unwrap();
        assert_eq!(&frame[12..14], &0x88A8u16.to_be_bytes());
        assert_eq!(u16::from_be_bytes([frame[14], frame[15]]) & 0x0FFF, 100);
        assert_eq!(&frame[16..18], &0x8100u16.to_be_bytes());
        assert_eq!(u16::from_be_bytes([frame[18], frame[19]]) & 0x0FFF, 200);
        assert_eq!(&frame[20..22], &ETHERTYPE_IPV4.to_be_bytes());
        assert!(verify_checksum(&frame[22..42]));
    }

    #[test]
    fn mpls_shim_fields() {
        let mut tpl = template(Protocol::Mpls { label: 100 });
        tpl.dscp = 46; // EXP = 46 >> 3 = 5
        let frame = build(&tpl, 128, 3, 0, &mut rng()).unwrap();
        assert_eq!(&frame[12..14], &0x8847u16.to_be_bytes());
        let shim = u32::from_be_bytes(frame[14..18].try_into().unwrap());
        assert_eq!(shim >> 12, 100);
        assert_eq!((shim >> 9) & 0x7, 5);
        assert_eq!((shim >> 8) & 0x1, 1); // bottom of stack
        assert_eq!(shim & 0xFF, 64); // TTL
    }

    #[test]
    fn ipv6_uses_v6_ethertype_and_traffic_class() {
        let mut tpl = template(Protocol::Ipv6);
        tpl.src_ip = "2001:db8::1".parse().unwrap();
        tpl.dst_ip = "2001:db8::2".parse().unwrap();
        tpl.dscp = 10;
        let frame = build(&tpl, 128, 0, 0, &mut rng()).unwrap();
        assert_eq!(&frame[12..14], &ETHERTYPE_IPV6.to_be_bytes());
        let word = u32::from_be_bytes(frame[14..18].try_into().unwrap());
        assert_eq!(word >> 28, 6);
        assert_eq!((word >> 20) & 0xFF, (10 << 2) as u32);
    }

    #[test]
    fn ipv6_with_v4_destination_is_unencodable() {
        let tpl = template(Protocol::Ipv6);
        assert!(matches!(
            build(&tpl, 128, 0, 0, &mut rng()),
            Err(CoreError::Unencodable(_))
        ));
    }

    #[test]
    fn syn_flood_sets_syn_and_randomizes() {
        let tpl = template(Protocol::TcpSynFlood);
        let a = build(&tpl, 64, 0, 0, &mut rng()).unwrap();
        assert_eq!(a[14 + 9], 6); // TCP
        assert_eq!(a[14 + 20 + 13], 0x02); // SYN
        // same seed, same randomized fields
        let b = build(&tpl, 64, 0, 0, &mut rng()).unwrap();
        assert_eq!(a, b);
        // different rng state, different sequence number
        let mut r = rng();
        let _ = build(&tpl, 64, 0, 0, &mut r).unwrap();
        let c = build(&tpl, 64, 0, 0, &mut r).unwrap();
        assert_ne!(a[14 + 20 + 4..14 + 20 + 8], c[14 + 20 + 4..14 + 20 + 8]);
    }

    #[test]
    fn http_flood_carries_get_request() {
        let tpl = template(Protocol::HttpFlood);
        let frame = build(&tpl, 256, 0, 0, &mut rng()).unwrap();
        let payload = &frame[14 + 20 + 20..];
        let text = String::from_utf8_lossy(payload);
        assert!(text.starts_with("GET / HTTP/1.1\r\nHost: 10.0.0.2:9999"));
        assert_eq!(frame[14 + 20 + 13], 0x18); // PSH|ACK
    }

    #[test]
    fn dns_amp_is_a_valid_query() {
        let mut tpl = template(Protocol::DnsAmp);
        tpl.dst_l4_port = 53;
        let frame = build(&tpl, 128, 9, 0, &mut rng()).unwrap();
        // UDP dst 53
        assert_eq!(&frame[36..38], &53u16.to_be_bytes());
        let dns = &frame[42..];
        assert_eq!(u16::from_be_bytes([dns[0], dns[1]]), 9); // id = seq
        assert_eq!(u16::from_be_bytes([dns[2], dns[3]]), 0x0100); // RD
        assert_eq!(u16::from_be_bytes([dns[4], dns[5]]), 1); // one question
        assert_eq!(&dns[12..25], b"\x07example\x03com\x00");
    }

    #[test]
    fn udp_checksum_validates_with_pseudo_header() {
        let tpl = template(Protocol::Ipv4);
        let frame = build(&tpl, 256, 0, 0, &mut rng()).unwrap();
        // Re-run the pseudo-header sum over the built segment; a correct
        // checksum makes the total fold to zero.
        let seg = &frame[34..];
        let sum = l4_checksum(tpl.src_ip, tpl.dst_ip, 17, seg);
        assert_eq!(sum, 0);
    }

    #[test]
    fn fnv1a_is_stable() {
        // Reference value for the canonical test vector
        assert_eq!(fnv1a(""), 0x811c9dc5);
        assert_eq!(fnv1a("a"), 0xe40c292c);
        assert_ne!(fnv1a("p1"), fnv1a("p2"));
    }

    #[test]
    fn signature_round_trip() {
        let mut buf = vec![0u8; 32];
        write_signature(&mut buf, 0, 0xdead, 42, 98765);
        let sig = parse_signature(&buf).unwrap();
        assert_eq!(sig.profile_id, 0xdead);
        assert_eq!(sig.seq, 42);
        assert_eq!(sig.emit_micros, 98765);
        assert!(parse_signature(&[0u8; 16]).is_none());
    }

    #[test]
    fn min_frame_lens_are_ordered() {
        assert_eq!(min_frame_len(&Protocol::Ipv4), 64);
        assert!(min_frame_len(&Protocol::Vxlan { vni: 1 }) > min_frame_len(&Protocol::Ipv4));
        assert!(
            min_frame_len(&Protocol::Qinq {
                outer_vid: 1,
                inner_vid: 2
            }) > 64
        );
    }
}
