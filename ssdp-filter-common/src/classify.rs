use crate::parser::ParsedHeaders;

/// Lookup key for an SSDP packet. `src_addr` keys the blocklist; the rest of
/// the 5-tuple rides along for export.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlowKey {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

/// `Some` only for UDP datagrams addressed to `ssdp_port`.
#[inline(always)]
pub fn classify(headers: &ParsedHeaders, ssdp_port: u16) -> Option<FlowKey> {
    if headers.udp.dst_port != ssdp_port {
        return None;
    }
    Some(FlowKey {
        src_addr: headers.ip.src_addr,
        dst_addr: headers.ip.dst_addr,
        src_port: headers.udp.src_port,
        dst_port: headers.udp.dst_port,
        protocol: headers.ip.protocol,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SSDP_PORT;
    use crate::frame::{EthernetFrame, Ipv4Packet, UdpDatagram};
    use crate::parser::{IPPROTO_UDP, PacketView, parse_headers};
    use std::net::Ipv4Addr;

    fn headers_for(src: Ipv4Addr, src_port: u16, dst_port: u16) -> ParsedHeaders {
        let udp = UdpDatagram::new()
            .with_src_port(src_port)
            .with_dst_port(dst_port)
            .build();
        let ip = Ipv4Packet::new()
            .with_src_ip(src)
            .with_dst_ip(Ipv4Addr::new(192, 168, 1, 1))
            .with_protocol(IPPROTO_UDP)
            .with_payload(udp)
            .build();
        let bytes = EthernetFrame::new().with_payload(ip).build();
        parse_headers(&mut PacketView::new(&bytes)).expect("valid frame")
    }

    #[test]
    fn ssdp_destination_port_is_classified() {
        let headers = headers_for(Ipv4Addr::new(10, 0, 0, 5), 40000, SSDP_PORT);
        let key = classify(&headers, SSDP_PORT).expect("ssdp");
        assert_eq!(key.src_addr, u32::from(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(key.dst_addr, u32::from(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(key.src_port, 40000);
        assert_eq!(key.dst_port, SSDP_PORT);
        assert_eq!(key.protocol, IPPROTO_UDP);
    }

    #[test]
    fn ssdp_source_port_alone_is_not_classified() {
        // Responses flowing back from port 1900 are not what this filter keys on.
        let headers = headers_for(Ipv4Addr::new(10, 0, 0, 5), SSDP_PORT, 53);
        assert_eq!(classify(&headers, SSDP_PORT), None);
    }

    #[test]
    fn configured_port_overrides_default() {
        let headers = headers_for(Ipv4Addr::new(10, 0, 0, 5), 40000, 11900);
        assert_eq!(classify(&headers, SSDP_PORT), None);
        assert!(classify(&headers, 11900).is_some());
    }
}
