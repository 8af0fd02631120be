use std::net::Ipv4Addr;

use crate::{eth, ipv4, tcp, ParseError};

/// Flat view of a captured TCP-over-IPv4 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpFrame {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub ttl: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl TcpFrame {
    /// Decodes an Ethernet frame into a [`TcpFrame`]. Anything that is
    /// not a complete TCP-over-IPv4 segment is rejected.
    pub fn parse(data: &[u8]) -> Result<TcpFrame, ParseError> {
        if data.len() < eth::ETH_LEN {
            return Err(ParseError::Truncated { layer: "ethernet" });
        }
        let ether_type = eth::ether_type(data);
        if ether_type != eth::ETHERTYPE_IPV4 {
            return Err(ParseError::UnsupportedEtherType(ether_type));
        }

        let ip = &data[eth::ETH_LEN..];
        if ip.len() < ipv4::IPV4_MIN_LEN {
            return Err(ParseError::Truncated { layer: "ipv4" });
        }
        if ipv4::version(ip) != 4 {
            return Err(ParseError::UnsupportedIpVersion(ipv4::version(ip)));
        }
        let ip_hdr_len = ipv4::hdr_len(ip);
        if ip_hdr_len < ipv4::IPV4_MIN_LEN {
            return Err(ParseError::InvalidHeaderLength {
                layer: "ipv4",
                len: ip_hdr_len,
            });
        }
        if ipv4::protocol(ip) != ipv4::PROTO_TCP {
            return Err(ParseError::UnsupportedProtocol(ipv4::protocol(ip)));
        }
        if ip.len() < ip_hdr_len {
            return Err(ParseError::Truncated { layer: "ipv4" });
        }

        let seg = &ip[ip_hdr_len..];
        if seg.len() < tcp::TCP_MIN_LEN {
            return Err(ParseError::Truncated { layer: "tcp" });
        }
        let tcp_hdr_len = tcp::hdr_len(seg);
        if tcp_hdr_len < tcp::TCP_MIN_LEN {
            return Err(ParseError::InvalidHeaderLength {
                layer: "tcp",
                len: tcp_hdr_len,
            });
        }
        if seg.len() < tcp_hdr_len {
            return Err(ParseError::Truncated { layer: "tcp" });
        }

        // The IP total length bounds the payload; captures may append
        // link-layer padding past it.
        let ip_total = ipv4::total_len(ip).min(ip.len());
        let payload_end = ip_total.max(ip_hdr_len + tcp_hdr_len);
        let payload = seg[tcp_hdr_len..payload_end - ip_hdr_len].to_vec();

        Ok(TcpFrame {
            src_mac: eth::src_mac(data),
            dst_mac: eth::dst_mac(data),
            src_ip: ipv4::src_addr(ip),
            dst_ip: ipv4::dst_addr(ip),
            ttl: ipv4::ttl(ip),
            src_port: tcp::src_port(seg),
            dst_port: tcp::dst_port(seg),
            seq: tcp::seq(seg),
            ack: tcp::ack(seg),
            window: tcp::window(seg),
            flags: tcp::flags(seg),
            payload,
        })
    }
}

/// Everything needed to serialize one outgoing segment.
///
/// TTL is fixed at 64 and the EtherType at IPv4; checksums and length
/// fields are computed from the assembled buffer.
#[derive(Debug, Clone)]
pub struct SegmentSpec<'a> {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub flags: u8,
    pub payload: &'a [u8],
}

impl SegmentSpec<'_> {
    /// Assembles the Ethernet + IPv4 + TCP frame.
    pub fn build(&self) -> Vec<u8> {
        let tcp_len = tcp::TCP_MIN_LEN + self.payload.len();
        let ip_total = ipv4::IPV4_MIN_LEN + tcp_len;
        let mut buf = vec![0u8; eth::ETH_LEN + ip_total];

        eth::write(&mut buf, self.src_mac, self.dst_mac, eth::ETHERTYPE_IPV4);
        ipv4::write(
            &mut buf[eth::ETH_LEN..],
            self.src_ip,
            self.dst_ip,
            ip_total as u16,
        );
        tcp::write(
            &mut buf[eth::ETH_LEN + ipv4::IPV4_MIN_LEN..],
            self.src_ip,
            self.dst_ip,
            self.src_port,
            self.dst_port,
            self.seq,
            self.ack,
            self.flags,
            self.window,
            self.payload,
        );
        buf
    }
}
