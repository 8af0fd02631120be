//! Ethernet/IPv4/TCP codec for raw-socket scanning.
//!
//! Parses captured frames into a flat [`TcpFrame`] view and serializes
//! outgoing segments (SYN, ACK with payload, RST) from a [`SegmentSpec`].
//! Only complete TCP-over-IPv4 frames are accepted; everything else is a
//! [`ParseError`] and gets dropped by the caller.

use thiserror::Error;

pub mod checksum;
pub mod eth;
pub mod ipv4;
pub mod tcp;

mod frame;

pub use frame::{SegmentSpec, TcpFrame};

/// Reasons a captured frame cannot be decoded into a [`TcpFrame`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Frame ends before the header being decoded does.
    #[error("frame truncated at {layer}")]
    Truncated { layer: &'static str },

    /// EtherType is not IPv4.
    #[error("unsupported ethertype {0:#06x}")]
    UnsupportedEtherType(u16),

    /// IP version field is not 4.
    #[error("unsupported IP version {0}")]
    UnsupportedIpVersion(u8),

    /// IP protocol is not TCP.
    #[error("unsupported IP protocol {0}")]
    UnsupportedProtocol(u8),

    /// Header length field is smaller than the fixed header.
    #[error("invalid {layer} header length {len}")]
    InvalidHeaderLength { layer: &'static str, len: usize },
}
