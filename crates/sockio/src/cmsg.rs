//! Control-message (ancillary data) codec.
//!
//! Outgoing: a single `UDP_SEGMENT` directive carrying the uniform segment
//! size of a coalesced batch.
//!
//! Incoming: destination packet info (`IP_PKTINFO` / `IPV6_PKTINFO`), the ECN
//! bits of the traffic class, and the `UDP_GRO` segment size.
//!
//! The receive buffer is walked as a plain byte slice with an explicit cursor.
//! Each header's declared length is checked against what remains before its
//! body is sliced, so a truncated or corrupt buffer degrades to "record absent"
//! and never aborts datagram processing.
//!
//! Integer fields are laid out in the host's native byte order. The order is
//! chosen once, from the build target, as [`ByteOrder::NATIVE`].

use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::trace;

/// Byte order of the integer fields in kernel control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// x86, aarch64, riscv, little-endian mips/powerpc
    Little,
    /// s390x, big-endian powerpc64, mips and mips64
    Big,
}

impl ByteOrder {
    /// Byte order of the build target.
    pub const NATIVE: Self = if cfg!(target_endian = "big") {
        Self::Big
    } else {
        Self::Little
    };

    /// Decode a 32-bit unsigned integer.
    #[must_use]
    pub fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::Little => u32::from_le_bytes(bytes),
            Self::Big => u32::from_be_bytes(bytes),
        }
    }

    /// Encode a 32-bit unsigned integer.
    #[must_use]
    pub fn write_u32(self, value: u32) -> [u8; 4] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    /// Decode a 16-bit unsigned integer.
    #[must_use]
    pub fn read_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            Self::Little => u16::from_le_bytes(bytes),
            Self::Big => u16::from_be_bytes(bytes),
        }
    }

    /// Encode a 16-bit unsigned integer.
    #[must_use]
    pub fn write_u16(self, value: u16) -> [u8; 2] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    fn read_len(self, bytes: &[u8]) -> Option<usize> {
        match bytes.len() {
            4 => Some(self.read_u32(word(bytes, 0)) as usize),
            8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                let value = match self {
                    Self::Little => u64::from_le_bytes(raw),
                    Self::Big => u64::from_be_bytes(raw),
                };
                usize::try_from(value).ok()
            }
            _ => None,
        }
    }

    fn write_len(self, value: usize, out: &mut [u8]) {
        match out.len() {
            4 => out.copy_from_slice(&self.write_u32(value as u32)),
            8 => {
                let value = value as u64;
                let raw = match self {
                    Self::Little => value.to_le_bytes(),
                    Self::Big => value.to_be_bytes(),
                };
                out.copy_from_slice(&raw);
            }
            _ => {}
        }
    }
}

// Header layout, taken from the platform's `struct cmsghdr`.
const HDR_LEN: usize = mem::size_of::<libc::cmsghdr>();
const LEN_OFFSET: usize = mem::offset_of!(libc::cmsghdr, cmsg_len);
const LEVEL_OFFSET: usize = mem::offset_of!(libc::cmsghdr, cmsg_level);
const TYPE_OFFSET: usize = mem::offset_of!(libc::cmsghdr, cmsg_type);
// `cmsg_len` is a size_t (glibc) or a socklen_t plus padding (musl); either
// way it spans everything before `cmsg_level`.
const LEN_SIZE: usize = LEVEL_OFFSET - LEN_OFFSET;
// CMSG_ALIGN rounds to sizeof(size_t) on Linux.
const ALIGN: usize = mem::size_of::<usize>();
const BODY_OFFSET: usize = align(HDR_LEN);

const fn align(len: usize) -> usize {
    (len + ALIGN - 1) & !(ALIGN - 1)
}

/// Equivalent of `CMSG_LEN`: header plus unpadded body.
#[must_use]
pub const fn cmsg_len(body_len: usize) -> usize {
    BODY_OFFSET + body_len
}

/// Equivalent of `CMSG_SPACE`: header plus body padded to alignment.
#[must_use]
pub const fn cmsg_space(body_len: usize) -> usize {
    BODY_OFFSET + align(body_len)
}

/// Body length of `struct in_pktinfo`.
pub const IPV4_PKTINFO_LEN: usize = 12;

/// Body length of `struct in6_pktinfo`.
pub const IPV6_PKTINFO_LEN: usize = 20;

const INT_LEN: usize = mem::size_of::<libc::c_int>();

/// Ancillary space for one segmentation directive.
pub const SEGMENT_DIRECTIVE_SPACE: usize = cmsg_space(mem::size_of::<u16>());

/// Ancillary space for the largest combination a dual-stack socket can
/// receive: both packet-info flavours, both traffic-class flavours and a GRO
/// segment size.
pub const RECV_CONTROL_CAPACITY: usize = cmsg_space(IPV4_PKTINFO_LEN)
    + cmsg_space(IPV6_PKTINFO_LEN)
    + 2 * cmsg_space(INT_LEN)
    + cmsg_space(INT_LEN);

/// A buffer aligned for `struct cmsghdr`.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(8))]
pub struct Aligned<T>(pub T);

const _: () = assert!(mem::align_of::<libc::cmsghdr>() <= mem::align_of::<Aligned<[u8; 0]>>());

fn word(bytes: &[u8], at: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[at..at + 4]);
    out
}

/// Writes control messages into a caller-supplied buffer.
pub struct Encoder<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> Encoder<'a> {
    /// Start encoding at the beginning of `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    /// Append one control message.
    ///
    /// Returns `false` and writes nothing if the message does not fit.
    pub fn push(&mut self, level: libc::c_int, kind: libc::c_int, body: &[u8]) -> bool {
        let space = cmsg_space(body.len());
        let Some(slot) = self.buf.get_mut(self.len..self.len + space) else {
            return false;
        };
        slot.fill(0);
        ByteOrder::NATIVE.write_len(
            cmsg_len(body.len()),
            &mut slot[LEN_OFFSET..LEN_OFFSET + LEN_SIZE],
        );
        slot[LEVEL_OFFSET..LEVEL_OFFSET + 4].copy_from_slice(&level.to_ne_bytes());
        slot[TYPE_OFFSET..TYPE_OFFSET + 4].copy_from_slice(&kind.to_ne_bytes());
        slot[BODY_OFFSET..BODY_OFFSET + body.len()].copy_from_slice(body);
        self.len += space;
        true
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn finish(self) -> usize {
        self.len
    }
}

/// The ancillary bytes carrying a `UDP_SEGMENT` directive.
#[derive(Debug, Clone, Copy)]
pub struct SegmentationDirective {
    buf: Aligned<[u8; SEGMENT_DIRECTIVE_SPACE]>,
    len: usize,
}

impl SegmentationDirective {
    /// The control message to attach to a coalesced send.
    #[must_use]
    pub fn new(segment_size: u16) -> Self {
        let mut buf = Aligned([0u8; SEGMENT_DIRECTIVE_SPACE]);
        let mut encoder = Encoder::new(&mut buf.0);
        encoder.push(
            libc::SOL_UDP,
            libc::UDP_SEGMENT,
            &ByteOrder::NATIVE.write_u16(segment_size),
        );
        let len = encoder.finish();
        Self { buf, len }
    }

    /// Encoded control message.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf.0[..self.len]
    }
}

/// Encode the segmentation directive for a batch of `segment_size` segments.
#[must_use]
pub fn encode_segmentation_directive(segment_size: u16) -> SegmentationDirective {
    SegmentationDirective::new(segment_size)
}

/// Where an inbound packet was addressed and which interface it arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestinationInfo {
    /// Receiving interface index
    pub interface_index: u32,
    /// Destination address in the packet's IP header
    pub address: IpAddr,
}

/// ECN codepoint from the IP header's traffic class.
///
/// Not-ECT is represented as the absence of a codepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EcnCodepoint {
    /// ECN-capable transport (1)
    Ect1 = 0b01,
    /// ECN-capable transport (0)
    Ect0 = 0b10,
    /// Congestion experienced
    Ce = 0b11,
}

impl EcnCodepoint {
    /// Extract the codepoint from a TOS / traffic-class byte.
    #[must_use]
    pub fn from_bits(traffic_class: u8) -> Option<Self> {
        match traffic_class & 0b11 {
            0b01 => Some(Self::Ect1),
            0b10 => Some(Self::Ect0),
            0b11 => Some(Self::Ce),
            _ => None,
        }
    }
}

/// One decoded control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AncillaryRecord {
    /// `IP_PKTINFO` or `IPV6_PKTINFO`
    Destination(DestinationInfo),
    /// `IP_TOS`, `IP_RECVTOS` or `IPV6_TCLASS` with an ECT or CE codepoint
    Ecn(EcnCodepoint),
    /// `UDP_GRO` segment size
    SegmentSize(u16),
}

impl AncillaryRecord {
    /// Classify a raw message by `(level, type)`.
    ///
    /// Unknown messages and bodies too short for their fixed layout yield `None`.
    #[must_use]
    pub fn classify(message: &RawMessage<'_>, order: ByteOrder) -> Option<Self> {
        match (message.level, message.kind) {
            (libc::IPPROTO_IP, libc::IP_PKTINFO) => {
                parse_ipv4_pktinfo(message.body, order).map(Self::Destination)
            }
            (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO) => {
                parse_ipv6_pktinfo(message.body, order).map(Self::Destination)
            }
            (libc::IPPROTO_IP, libc::IP_TOS)
            | (libc::IPPROTO_IP, libc::IP_RECVTOS)
            | (libc::IPPROTO_IPV6, libc::IPV6_TCLASS) => {
                parse_traffic_class(message.body, order)
                    .and_then(EcnCodepoint::from_bits)
                    .map(Self::Ecn)
            }
            (libc::SOL_UDP, libc::UDP_GRO) => parse_segment_size(message.body, order).map(Self::SegmentSize),
            (level, kind) => {
                trace!(level, kind, "ignoring unrecognized control message");
                None
            }
        }
    }
}

/// Decode an `in_pktinfo` body: interface index, specified destination,
/// original destination. Reports the interface index and the original
/// destination.
///
/// Returns `None` if the body is shorter than the fixed layout.
#[must_use]
pub fn parse_ipv4_pktinfo(body: &[u8], order: ByteOrder) -> Option<DestinationInfo> {
    let body = body.get(..IPV4_PKTINFO_LEN)?;
    Some(DestinationInfo {
        interface_index: order.read_u32(word(body, 0)),
        address: IpAddr::V4(Ipv4Addr::new(body[8], body[9], body[10], body[11])),
    })
}

/// Decode an `in6_pktinfo` body: destination address, then interface index.
///
/// Returns `None` if the body is shorter than the fixed layout.
#[must_use]
pub fn parse_ipv6_pktinfo(body: &[u8], order: ByteOrder) -> Option<DestinationInfo> {
    let body = body.get(..IPV6_PKTINFO_LEN)?;
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&body[..16]);
    Some(DestinationInfo {
        interface_index: order.read_u32(word(body, 16)),
        address: IpAddr::V6(Ipv6Addr::from(octets)),
    })
}

// IP_TOS arrives as a single byte, IPV6_TCLASS as an int.
fn parse_traffic_class(body: &[u8], order: ByteOrder) -> Option<u8> {
    match body.len() {
        0 => None,
        1..=3 => Some(body[0]),
        _ => Some(order.read_u32(word(body, 0)) as u8),
    }
}

fn parse_segment_size(body: &[u8], order: ByteOrder) -> Option<u16> {
    let body = body.get(..INT_LEN)?;
    let size = order.read_u32(word(body, 0));
    match u16::try_from(size) {
        Ok(0) | Err(_) => None,
        Ok(size) => Some(size),
    }
}

/// A control message before classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMessage<'a> {
    /// `cmsg_level`
    pub level: libc::c_int,
    /// `cmsg_type`
    pub kind: libc::c_int,
    /// Body, clipped to the bytes actually present
    pub body: &'a [u8],
}

/// Bounds-checked walk over an ancillary buffer.
#[derive(Debug, Clone)]
pub struct RawMessages<'a> {
    buf: &'a [u8],
    cursor: usize,
    order: ByteOrder,
}

impl<'a> RawMessages<'a> {
    /// Walk `buf`, reading header integers in `order`.
    #[must_use]
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Self {
            buf,
            cursor: 0,
            order,
        }
    }

    fn stop(&mut self) {
        self.cursor = self.buf.len();
    }
}

impl<'a> Iterator for RawMessages<'a> {
    type Item = RawMessage<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.buf.get(self.cursor..)?;
        if rest.len() < HDR_LEN {
            return None;
        }

        let declared = match self.order.read_len(&rest[LEN_OFFSET..LEN_OFFSET + LEN_SIZE]) {
            Some(len) if len >= BODY_OFFSET => len,
            declared => {
                trace!(?declared, "control message header shorter than itself");
                self.stop();
                return None;
            }
        };
        let level = self.order.read_u32(word(rest, LEVEL_OFFSET)) as libc::c_int;
        let kind = self.order.read_u32(word(rest, TYPE_OFFSET)) as libc::c_int;

        let end = if declared > rest.len() {
            trace!(
                level,
                kind,
                declared,
                available = rest.len(),
                "control message truncated"
            );
            rest.len()
        } else {
            declared
        };
        let body = &rest[BODY_OFFSET.min(end)..end];

        match declared
            .checked_add(ALIGN - 1)
            .map(|padded| padded & !(ALIGN - 1))
            .and_then(|step| self.cursor.checked_add(step))
        {
            Some(next) => self.cursor = next,
            None => self.stop(),
        }

        Some(RawMessage { level, kind, body })
    }
}

/// Recognized records in an ancillary buffer.
#[derive(Debug, Clone)]
pub struct Records<'a> {
    messages: RawMessages<'a>,
}

impl Iterator for Records<'_> {
    type Item = AncillaryRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let order = self.messages.order;
        self.messages
            .by_ref()
            .find_map(|message| AncillaryRecord::classify(&message, order))
    }
}

/// Decode every recognized record in a kernel-filled ancillary buffer.
#[must_use]
pub fn decode(buf: &[u8]) -> Records<'_> {
    decode_with(buf, ByteOrder::NATIVE)
}

/// Decode with an explicit byte order.
#[must_use]
pub fn decode_with(buf: &[u8], order: ByteOrder) -> Records<'_> {
    Records {
        messages: RawMessages::new(buf, order),
    }
}

/// Per-datagram metadata folded from the records of one receive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlSummary {
    /// Packet destination, if `PKTINFO` was delivered
    pub destination: Option<DestinationInfo>,
    /// ECN codepoint, if the traffic class was delivered
    pub ecn: Option<EcnCodepoint>,
    /// GRO segment size, if the kernel coalesced
    pub segment_size: Option<u16>,
}

impl ControlSummary {
    /// Decode `buf` and keep the last record of each kind.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Self {
        decode(buf).collect()
    }
}

impl FromIterator<AncillaryRecord> for ControlSummary {
    fn from_iter<I: IntoIterator<Item = AncillaryRecord>>(iter: I) -> Self {
        let mut summary = Self::default();
        for record in iter {
            match record {
                AncillaryRecord::Destination(info) => summary.destination = Some(info),
                AncillaryRecord::Ecn(ecn) => summary.ecn = Some(ecn),
                AncillaryRecord::SegmentSize(size) => summary.segment_size = Some(size),
            }
        }
        summary
    }
}
