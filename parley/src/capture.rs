//! The packet tap: a pcap capture handle with a BPF filter, drained by a
//! dedicated blocking thread that feeds decoded segments into the capture
//! channel. A second, unfiltered handle on the same interface backs the
//! raw-send sink.

use std::net::Ipv4Addr;
use std::sync::OnceLock;

use pnet::datalink;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_wire::TcpFrame;

use crate::packet::SegmentRecord;
use crate::sink::PcapSink;

/// Excludes segments whose TCP flag byte is pure SYN: those are the
/// upstream prober's own probes echoed back by the tap.
const TAP_FILTER: &str = "tcp[tcpflags] != tcp-syn";

/// Per-packet read size; banners past this point are out of scope.
const SNAPLEN: i32 = 1024;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("open capture on {iface}: {source}")]
    Open {
        iface: String,
        source: pcap::Error,
    },

    #[error("set filter {filter:?}: {source}")]
    Filter {
        filter: String,
        source: pcap::Error,
    },

    #[error("interface {0} not found")]
    NoSuchInterface(String),

    #[error("interface {0} has no MAC address")]
    NoMac(String),
}

/// Link-layer context shared by the capture reader and the send path.
///
/// The gateway MAC is either configured (required in Active mode) or
/// learned from the source MAC of the first captured frame.
pub struct LinkLayer {
    pub source_mac: [u8; 6],
    pub source_ip: Option<Ipv4Addr>,
    gateway_mac: OnceLock<[u8; 6]>,
}

impl LinkLayer {
    pub fn new(
        source_mac: [u8; 6],
        source_ip: Option<Ipv4Addr>,
        gateway_mac: Option<[u8; 6]>,
    ) -> LinkLayer {
        let cell = OnceLock::new();
        if let Some(mac) = gateway_mac {
            let _ = cell.set(mac);
        }
        LinkLayer {
            source_mac,
            source_ip,
            gateway_mac: cell,
        }
    }

    pub fn gateway_mac(&self) -> Option<[u8; 6]> {
        self.gateway_mac.get().copied()
    }

    /// First writer wins; later frames cannot re-learn the gateway.
    pub fn learn_gateway(&self, mac: [u8; 6]) {
        if self.gateway_mac.set(mac).is_ok() {
            info!(
                "learned gateway mac {}",
                mac.map(|b| format!("{b:02x}")).join(":")
            );
        }
    }
}

/// Looks up the interface's own MAC address.
pub fn interface_mac(name: &str) -> Result<[u8; 6], CaptureError> {
    let iface = datalink::interfaces()
        .into_iter()
        .find(|i| i.name == name)
        .ok_or_else(|| CaptureError::NoSuchInterface(name.to_string()))?;
    let mac = iface.mac.ok_or_else(|| CaptureError::NoMac(name.to_string()))?;
    Ok(mac.octets())
}

/// Opens the filtered tap handle.
pub fn open_tap(iface: &str) -> Result<pcap::Capture<pcap::Active>, CaptureError> {
    let mut tap = pcap::Capture::from_device(iface)
        .map_err(|source| CaptureError::Open {
            iface: iface.to_string(),
            source,
        })?
        .snaplen(SNAPLEN)
        .promisc(false)
        .immediate_mode(true)
        .open()
        .map_err(|source| CaptureError::Open {
            iface: iface.to_string(),
            source,
        })?;
    tap.filter(TAP_FILTER, true)
        .map_err(|source| CaptureError::Filter {
            filter: TAP_FILTER.to_string(),
            source,
        })?;
    Ok(tap)
}

/// Opens the unfiltered handle used by the raw-send sink.
pub fn open_sender(iface: &str) -> Result<PcapSink, CaptureError> {
    let handle = pcap::Capture::from_device(iface)
        .map_err(|source| CaptureError::Open {
            iface: iface.to_string(),
            source,
        })?
        .snaplen(SNAPLEN)
        .promisc(false)
        .open()
        .map_err(|source| CaptureError::Open {
            iface: iface.to_string(),
            source,
        })?;
    Ok(PcapSink::new(handle))
}

/// Drains the tap on a blocking thread. Frames that are not complete
/// TCP-over-IPv4 segments are discarded without comment; everything else
/// becomes a [`SegmentRecord`] on the capture channel. Exits when the
/// channel closes.
pub fn spawn_reader(
    mut tap: pcap::Capture<pcap::Active>,
    link: std::sync::Arc<LinkLayer>,
    capture_tx: mpsc::Sender<SegmentRecord>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("capture-reader".to_string())
        .spawn(move || loop {
            let data = match tap.next_packet() {
                Ok(packet) => packet.data.to_vec(),
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => {
                    warn!("capture read failed: {e}");
                    return;
                }
            };
            let Ok(frame) = TcpFrame::parse(&data) else {
                continue;
            };
            if link.gateway_mac().is_none() {
                link.learn_gateway(frame.src_mac);
            }
            if capture_tx
                .blocking_send(SegmentRecord::from_frame(frame))
                .is_err()
            {
                debug!("capture channel closed, reader exiting");
                return;
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_mac_is_learned_once() {
        let link = LinkLayer::new([1; 6], None, None);
        assert_eq!(link.gateway_mac(), None);

        link.learn_gateway([0xaa; 6]);
        assert_eq!(link.gateway_mac(), Some([0xaa; 6]));

        link.learn_gateway([0xbb; 6]);
        assert_eq!(link.gateway_mac(), Some([0xaa; 6]));
    }

    #[test]
    fn configured_gateway_mac_wins() {
        let link = LinkLayer::new([1; 6], None, Some([0xcc; 6]));
        link.learn_gateway([0xdd; 6]);
        assert_eq!(link.gateway_mac(), Some([0xcc; 6]));
    }
}
