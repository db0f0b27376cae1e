//! Forward-only Ethernet/IPv4/UDP header parsing.
//!
//! Every read goes through [`PacketView::read`], which checks the byte range
//! against the end bound before touching memory. There are no loops here, so
//! the same code passes the eBPF verifier and runs over plain slices in
//! userspace.

use core::{marker::PhantomData, mem, ptr};

use crate::{Reason, StatCounter};

pub const ETH_HDR_LEN: usize = 14;
pub const IPV4_MIN_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;

pub const ETH_P_IPV4: u16 = 0x0800;
pub const IPPROTO_UDP: u8 = 17;

const IPV4_FRAG_OFFSET_MASK: u16 = 0x1fff;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ParseError {
    /// Fewer bytes left than the header being read.
    Truncated,
    /// Not an IPv4 frame. Not a fault.
    UnsupportedEtherType,
    /// IPv4 but not UDP. Not a fault.
    UnsupportedIpProtocol,
    /// Header length fields disagree with the header layout.
    MalformedLength,
    /// Non-initial IPv4 fragment; it carries no UDP header.
    Fragment,
}

impl ParseError {
    /// Counter bumped when a packet fails with this error.
    pub const fn counter(self) -> StatCounter {
        match self {
            ParseError::UnsupportedEtherType | ParseError::UnsupportedIpProtocol => {
                StatCounter::Unsupported
            }
            ParseError::Truncated | ParseError::MalformedLength | ParseError::Fragment => {
                StatCounter::ParseErrors
            }
        }
    }

    pub const fn reason(self) -> Reason {
        match self.counter() {
            StatCounter::Unsupported => Reason::Unsupported,
            _ => Reason::ParseError,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ParseError::Truncated => "truncated",
            ParseError::UnsupportedEtherType => "unsupported ether type",
            ParseError::UnsupportedIpProtocol => "unsupported ip protocol",
            ParseError::MalformedLength => "malformed length",
            ParseError::Fragment => "non-initial fragment",
        }
    }
}

impl core::fmt::Display for ParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-owning view over one packet with a cursor that only moves forward.
#[derive(Copy, Clone, Debug)]
pub struct PacketView<'a> {
    start: usize,
    cursor: usize,
    end: usize,
    _packet: PhantomData<&'a [u8]>,
}

impl<'a> PacketView<'a> {
    pub fn new(packet: &'a [u8]) -> Self {
        let start = packet.as_ptr() as usize;
        Self {
            start,
            cursor: start,
            end: start + packet.len(),
            _packet: PhantomData,
        }
    }

    /// View over `[start, end)`, as handed out by `XdpContext::data()` and
    /// `XdpContext::data_end()`.
    ///
    /// # Safety
    ///
    /// The whole range must stay readable for `'a`.
    #[inline(always)]
    pub unsafe fn from_raw(start: usize, end: usize) -> Self {
        Self {
            start,
            cursor: start,
            end,
            _packet: PhantomData,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.cursor)
    }

    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.cursor - self.start
    }

    #[inline(always)]
    pub fn read<T: Copy>(&mut self) -> Result<T, ParseError> {
        let len = mem::size_of::<T>();
        if self.cursor + len > self.end {
            return Err(ParseError::Truncated);
        }
        // SAFETY: the range [cursor, cursor + len) was checked against `end`.
        let value = unsafe { ptr::read_unaligned(self.cursor as *const T) };
        self.cursor += len;
        Ok(value)
    }

    #[inline(always)]
    pub fn skip(&mut self, len: usize) -> Result<(), ParseError> {
        if self.cursor + len > self.end {
            return Err(ParseError::Truncated);
        }
        self.cursor += len;
        Ok(())
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
struct EthHdr {
    dst: [u8; 6],
    src: [u8; 6],
    ether_type: u16,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct Ipv4Hdr {
    version_ihl: u8,
    tos: u8,
    tot_len: u16,
    id: u16,
    frag_off: u16,
    ttl: u8,
    protocol: u8,
    check: u16,
    saddr: u32,
    daddr: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct UdpHdr {
    source: u16,
    dest: u16,
    len: u16,
    check: u16,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EthernetInfo {
    pub dst_mac: [u8; 6],
    pub src_mac: [u8; 6],
    pub ether_type: u16,
}

/// IPv4 fields in host byte order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Ipv4Info {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub protocol: u8,
    pub ttl: u8,
    pub header_len: u8,
    pub total_len: u16,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UdpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub len: u16,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ParsedHeaders {
    pub eth: EthernetInfo,
    pub ip: Ipv4Info,
    pub udp: UdpInfo,
    /// Full frame length as seen by the receive path.
    pub packet_len: u32,
}

#[inline(always)]
pub fn parse_headers(view: &mut PacketView<'_>) -> Result<ParsedHeaders, ParseError> {
    let packet_len = view.len() as u32;

    let eth: EthHdr = view.read()?;
    let ether_type = u16::from_be(eth.ether_type);
    if ether_type != ETH_P_IPV4 {
        return Err(ParseError::UnsupportedEtherType);
    }

    let ip: Ipv4Hdr = view.read()?;
    if ip.version_ihl >> 4 != 4 {
        return Err(ParseError::MalformedLength);
    }
    let ihl_words = (ip.version_ihl & 0x0f) as usize;
    if ihl_words < 5 {
        return Err(ParseError::MalformedLength);
    }
    let header_len = ihl_words * 4;
    let total_len = u16::from_be(ip.tot_len);
    if (total_len as usize) < header_len {
        return Err(ParseError::MalformedLength);
    }
    view.skip(header_len - IPV4_MIN_HDR_LEN)?;

    if ip.protocol != IPPROTO_UDP {
        return Err(ParseError::UnsupportedIpProtocol);
    }
    if u16::from_be(ip.frag_off) & IPV4_FRAG_OFFSET_MASK != 0 {
        return Err(ParseError::Fragment);
    }

    let udp: UdpHdr = view.read()?;
    let udp_len = u16::from_be(udp.len);
    if (udp_len as usize) < UDP_HDR_LEN {
        return Err(ParseError::MalformedLength);
    }

    Ok(ParsedHeaders {
        eth: EthernetInfo {
            dst_mac: eth.dst,
            src_mac: eth.src,
            ether_type,
        },
        ip: Ipv4Info {
            src_addr: u32::from_be(ip.saddr),
            dst_addr: u32::from_be(ip.daddr),
            protocol: ip.protocol,
            ttl: ip.ttl,
            header_len: header_len as u8,
            total_len,
        },
        udp: UdpInfo {
            src_port: u16::from_be(udp.source),
            dst_port: u16::from_be(udp.dest),
            len: udp_len,
        },
        packet_len,
    })
}
