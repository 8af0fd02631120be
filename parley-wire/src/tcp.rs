//! TCP header parsing, serialization and flag masks.
//!
//! Outgoing segments never carry options, so the header is always 20
//! bytes with data offset 5. Inbound headers may carry options; the
//! payload starts at `hdr_len`.

use std::net::Ipv4Addr;

use crate::checksum;

/// The length of the TCP header without options.
pub const TCP_MIN_LEN: usize = 20;

/// TCP flag masks
pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;

#[inline]
pub fn src_port(hdr: &[u8]) -> u16 {
    u16::from_be_bytes([hdr[0], hdr[1]])
}

#[inline]
pub fn dst_port(hdr: &[u8]) -> u16 {
    u16::from_be_bytes([hdr[2], hdr[3]])
}

#[inline]
pub fn seq(hdr: &[u8]) -> u32 {
    u32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]])
}

#[inline]
pub fn ack(hdr: &[u8]) -> u32 {
    u32::from_be_bytes([hdr[8], hdr[9], hdr[10], hdr[11]])
}

/// Header length in bytes (data offset * 4).
#[inline]
pub fn hdr_len(hdr: &[u8]) -> usize {
    ((hdr[12] >> 4) as usize) * 4
}

#[inline]
pub fn flags(hdr: &[u8]) -> u8 {
    hdr[13]
}

#[inline]
pub fn window(hdr: &[u8]) -> u16 {
    u16::from_be_bytes([hdr[14], hdr[15]])
}

/// Writes an optionless TCP header followed by `payload` into `buf` and
/// computes the pseudo-header checksum. `buf` must hold
/// `TCP_MIN_LEN + payload.len()` bytes.
#[allow(clippy::too_many_arguments)]
pub fn write(
    buf: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) {
    buf[0..2].copy_from_slice(&src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&dst_port.to_be_bytes());
    buf[4..8].copy_from_slice(&seq.to_be_bytes());
    buf[8..12].copy_from_slice(&ack.to_be_bytes());
    buf[12] = 5 << 4; // data offset 5, no options
    buf[13] = flags;
    buf[14..16].copy_from_slice(&window.to_be_bytes());
    buf[16] = 0; // checksum, filled below
    buf[17] = 0;
    buf[18] = 0; // urgent pointer
    buf[19] = 0;
    buf[TCP_MIN_LEN..TCP_MIN_LEN + payload.len()].copy_from_slice(payload);

    let check = checksum::tcp(&buf[..TCP_MIN_LEN + payload.len()], src, dst);
    buf[16..18].copy_from_slice(&check.to_be_bytes());
}
