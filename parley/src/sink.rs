//! The raw-send seam.
//!
//! All outgoing segments go through one [`PacketSink`] handle; writes are
//! atomic at segment granularity (the capture side is a separate handle
//! and never contends). The trait exists so the engine can be exercised
//! with [`MockSink`] and no network access.

use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("raw send failed: {0}")]
    Send(String),
}

pub trait PacketSink: Send + Sync {
    fn send(&self, frame: &[u8]) -> Result<(), SinkError>;
}

/// Injects frames through a dedicated pcap handle.
pub struct PcapSink {
    handle: Mutex<pcap::Capture<pcap::Active>>,
}

impl PcapSink {
    pub fn new(handle: pcap::Capture<pcap::Active>) -> PcapSink {
        PcapSink {
            handle: Mutex::new(handle),
        }
    }
}

impl PacketSink for PcapSink {
    fn send(&self, frame: &[u8]) -> Result<(), SinkError> {
        let mut handle = self
            .handle
            .lock()
            .map_err(|_| SinkError::Send("send handle poisoned".to_string()))?;
        handle
            .sendpacket(frame)
            .map_err(|e| SinkError::Send(e.to_string()))
    }
}

/// Records every frame instead of sending it. Tests parse the recorded
/// frames back to assert on what would have hit the wire.
#[derive(Default)]
pub struct MockSink {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl MockSink {
    pub fn new() -> MockSink {
        MockSink::default()
    }

    /// All frames sent so far, oldest first.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Drops recorded frames, returning them.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock().unwrap())
    }
}

impl PacketSink for MockSink {
    fn send(&self, frame: &[u8]) -> Result<(), SinkError> {
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}
