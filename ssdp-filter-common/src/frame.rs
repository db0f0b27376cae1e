//! Frame builders for tests.
//!
//! Produces Ethernet/IPv4/UDP byte vectors the parser can be pointed at.

use std::net::Ipv4Addr;

use crate::SSDP_PORT;
use crate::parser::{ETH_P_IPV4, IPPROTO_UDP};

#[derive(Debug, Clone)]
pub struct EthernetFrame {
    pub dst_mac: [u8; 6],
    pub src_mac: [u8; 6],
    pub ether_type: u16,
    pub payload: Vec<u8>,
}

impl Default for EthernetFrame {
    fn default() -> Self {
        Self {
            dst_mac: [0xff; 6],
            src_mac: [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
            ether_type: ETH_P_IPV4,
            payload: Vec::new(),
        }
    }
}

impl EthernetFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ether_type(mut self, ether_type: u16) -> Self {
        self.ether_type = ether_type;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(14 + self.payload.len());
        frame.extend_from_slice(&self.dst_mac);
        frame.extend_from_slice(&self.src_mac);
        frame.extend_from_slice(&self.ether_type.to_be_bytes());
        frame.extend_from_slice(&self.payload);
        frame
    }
}

#[derive(Debug, Clone)]
pub struct Ipv4Packet {
    pub ttl: u8,
    pub protocol: u8,
    pub flags: u8,
    pub fragment_offset: u16,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub options: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Default for Ipv4Packet {
    fn default() -> Self {
        Self {
            ttl: 64,
            protocol: IPPROTO_UDP,
            flags: 0,
            fragment_offset: 0,
            src_ip: Ipv4Addr::new(192, 168, 1, 100),
            dst_ip: Ipv4Addr::new(239, 255, 255, 250),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }
}

impl Ipv4Packet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_src_ip(mut self, ip: Ipv4Addr) -> Self {
        self.src_ip = ip;
        self
    }

    pub fn with_dst_ip(mut self, ip: Ipv4Addr) -> Self {
        self.dst_ip = ip;
        self
    }

    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_fragment(mut self, flags: u8, offset: u16) -> Self {
        self.flags = flags;
        self.fragment_offset = offset;
        self
    }

    /// Options are padded to a 32-bit boundary.
    pub fn with_options(mut self, options: Vec<u8>) -> Self {
        self.options = options;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let option_words = self.options.len().div_ceil(4);
        let ihl = 5 + option_words as u8;
        let header_len = ihl as usize * 4;
        let total_len = header_len + self.payload.len();

        let mut packet = Vec::with_capacity(total_len);
        packet.push((4 << 4) | ihl);
        packet.push(0);
        packet.extend_from_slice(&(total_len as u16).to_be_bytes());
        packet.extend_from_slice(&0u16.to_be_bytes());
        let frag_field = ((self.flags as u16) << 13) | (self.fragment_offset & 0x1fff);
        packet.extend_from_slice(&frag_field.to_be_bytes());
        packet.push(self.ttl);
        packet.push(self.protocol);
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(&self.src_ip.octets());
        packet.extend_from_slice(&self.dst_ip.octets());
        packet.extend_from_slice(&self.options);
        packet.resize(header_len, 0);

        let checksum = ipv4_checksum(&packet[..header_len]);
        packet[10..12].copy_from_slice(&checksum.to_be_bytes());

        packet.extend_from_slice(&self.payload);
        packet
    }
}

#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

impl Default for UdpDatagram {
    fn default() -> Self {
        Self {
            src_port: 49152,
            dst_port: SSDP_PORT,
            payload: Vec::new(),
        }
    }
}

impl UdpDatagram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_src_port(mut self, port: u16) -> Self {
        self.src_port = port;
        self
    }

    pub fn with_dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let len = 8 + self.payload.len();
        let mut datagram = Vec::with_capacity(len);
        datagram.extend_from_slice(&self.src_port.to_be_bytes());
        datagram.extend_from_slice(&self.dst_port.to_be_bytes());
        datagram.extend_from_slice(&(len as u16).to_be_bytes());
        // Zero checksum: not computed for IPv4.
        datagram.extend_from_slice(&[0, 0]);
        datagram.extend_from_slice(&self.payload);
        datagram
    }
}

/// Ethernet/IPv4/UDP frame from `src` to `dst_port`.
pub fn udp_frame(src: Ipv4Addr, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp = UdpDatagram::new()
        .with_dst_port(dst_port)
        .with_payload(payload.to_vec())
        .build();
    let ip = Ipv4Packet::new().with_src_ip(src).with_payload(udp).build();
    EthernetFrame::new().with_payload(ip).build()
}

/// SSDP datagram (UDP/1900) from `src`.
pub fn ssdp_frame(src: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    udp_frame(src, SSDP_PORT, payload)
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0)]) as u32)
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
