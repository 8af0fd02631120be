//! Ethernet header constants and accessors.
//!
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                      destination address                      |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |   destination (con't)         |        source address         |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                        source (con't)                         |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |          ether type           |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

/// The length of the Ethernet header.
pub const ETH_LEN: usize = 14;

/// EtherType for IPv4, host byte order.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// Returns the ether type field in host byte order.
#[inline]
pub fn ether_type(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[12], frame[13]])
}

/// Copies the destination MAC out of the frame.
#[inline]
pub fn dst_mac(frame: &[u8]) -> [u8; 6] {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&frame[0..6]);
    mac
}

/// Copies the source MAC out of the frame.
#[inline]
pub fn src_mac(frame: &[u8]) -> [u8; 6] {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&frame[6..12]);
    mac
}

/// Writes an Ethernet header into `buf[..ETH_LEN]`.
pub fn write(buf: &mut [u8], src: [u8; 6], dst: [u8; 6], ether_type: u16) {
    buf[0..6].copy_from_slice(&dst);
    buf[6..12].copy_from_slice(&src);
    buf[12..14].copy_from_slice(&ether_type.to_be_bytes());
}
