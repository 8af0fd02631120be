//! The flat per-segment view that flows through every channel.
//!
//! A [`SegmentRecord`] is always oriented as an *inbound* segment: `remote_*`
//! is the scanned host, `local_*` is us. Seeds fabricated from the input
//! list follow the same orientation (a "phantom" inbound SYN-ACK), so the
//! dispatcher can treat upstream-observed SYN-ACKs and self-originated
//! targets uniformly.

use std::net::Ipv4Addr;
use std::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use parley_wire::tcp::{TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN};
use parley_wire::TcpFrame;

/// A flow is keyed by the scanned host's address and port.
pub type FlowKey = (Ipv4Addr, u16);

/// The next segment kind the state machine is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExpectedNext {
    /// A SYN-ACK answering our SYN.
    #[serde(rename = "sa")]
    SynAck,
    /// An ACK covering the probe payload we sent.
    #[serde(rename = "ack")]
    Ack,
    /// A payload-bearing segment.
    #[serde(rename = "data")]
    Data,
}

/// Range used for randomized ephemeral ports (both our source ports in
/// Active mode and the high ports probed for ack-firewall detection).
const EPHEMERAL_PORT_RANGE: std::ops::Range<u16> = 32768..61000;

/// One observed (or fabricated) segment plus the per-attempt bookkeeping
/// that rides along with it. The serialized form is the output record.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentRecord {
    #[serde(rename = "saddr")]
    pub remote_ip: Ipv4Addr,
    #[serde(rename = "daddr")]
    pub local_ip: Ipv4Addr,
    #[serde(rename = "sport")]
    pub remote_port: u16,
    #[serde(rename = "dport")]
    pub local_port: u16,
    #[serde(rename = "seqnum")]
    pub seq: u32,
    #[serde(rename = "acknum")]
    pub ack: u32,
    pub window: u16,
    pub ttl: u8,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// State string at termination; the field name is the downstream
    /// toolchain's wire contract.
    #[serde(rename = "expectedRToLZR", skip_serializing_if = "Option::is_none")]
    pub expected_next: Option<ExpectedNext>,
    #[serde(
        rename = "data",
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "payload_lossy"
    )]
    pub payload: Vec<u8>,
    /// Doubles as the sibling-probe marker while the flow is live and as
    /// the ack-firewall verdict on an emitted record.
    #[serde(rename = "ackingFirewall", skip_serializing_if = "is_false")]
    pub acking_firewall: bool,

    #[serde(skip)]
    pub remote_mac: [u8; 6],
    #[serde(skip)]
    pub local_mac: [u8; 6],
    #[serde(skip)]
    pub flags: u8,
    #[serde(skip)]
    pub timestamp: Instant,
    #[serde(skip)]
    pub retries: u32,
    /// Length of the probe payload we last sent on this flow. Kept
    /// byte-accurate after every outgoing data-bearing ACK (including
    /// retransmissions) because ACK-number validation depends on it.
    #[serde(skip)]
    pub response_len: usize,
    #[serde(skip)]
    pub handshake_index: usize,
    #[serde(skip)]
    pub validation_failed: bool,
}

fn payload_lossy<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(bytes))
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// A seed line that could not be turned into a flow.
#[derive(Debug, Error)]
pub enum SeedParseError {
    #[error("expected ip:port, got {0:?}")]
    BadTarget(String),
    #[error("bad address in {0:?}")]
    BadAddr(String),
    #[error("bad port in {0:?}")]
    BadPort(String),
    #[error("bad prober line: {0}")]
    BadProberLine(#[from] serde_json::Error),
}

/// Wire shape of one upstream-prober line (Passive mode).
#[derive(Debug, Deserialize)]
struct ProberSeed {
    saddr: Ipv4Addr,
    sport: u16,
    daddr: Ipv4Addr,
    dport: u16,
    seqnum: u32,
    acknum: u32,
    window: u16,
}

impl SegmentRecord {
    /// Decodes a captured frame into a record.
    pub fn from_frame(frame: TcpFrame) -> SegmentRecord {
        SegmentRecord {
            remote_ip: frame.src_ip,
            local_ip: frame.dst_ip,
            remote_port: frame.src_port,
            local_port: frame.dst_port,
            seq: frame.seq,
            ack: frame.ack,
            window: frame.window,
            ttl: frame.ttl,
            fingerprint: None,
            expected_next: None,
            payload: frame.payload,
            acking_firewall: false,
            remote_mac: frame.src_mac,
            local_mac: frame.dst_mac,
            flags: frame.flags,
            timestamp: Instant::now(),
            retries: 0,
            response_len: 0,
            handshake_index: 0,
            validation_failed: false,
        }
    }

    /// Passive mode: one JSON object per line describing a SYN-ACK the
    /// upstream prober observed. The record is synthesized as if that
    /// SYN-ACK had arrived on our own tap.
    pub fn from_prober_line(line: &str) -> Result<SegmentRecord, SeedParseError> {
        let seed: ProberSeed = serde_json::from_str(line.trim())?;
        Ok(SegmentRecord {
            remote_ip: seed.saddr,
            local_ip: seed.daddr,
            remote_port: seed.sport,
            local_port: seed.dport,
            seq: seed.seqnum,
            ack: seed.acknum,
            window: seed.window,
            ttl: 0,
            fingerprint: None,
            expected_next: None,
            payload: Vec::new(),
            acking_firewall: false,
            remote_mac: [0; 6],
            local_mac: [0; 6],
            flags: TCP_FLAG_SYN | TCP_FLAG_ACK,
            timestamp: Instant::now(),
            retries: 0,
            response_len: 0,
            handshake_index: 0,
            validation_failed: false,
        })
    }

    /// Active mode: an `ip:port` target line becomes a phantom inbound
    /// SYN-ACK. Source/destination are reversed relative to the SYN we
    /// will send; seq, ack and window are copied verbatim onto that SYN.
    pub fn from_target_line(line: &str, local_ip: Ipv4Addr) -> Result<SegmentRecord, SeedParseError> {
        let line = line.trim();
        let (addr, port) = line
            .rsplit_once(':')
            .ok_or_else(|| SeedParseError::BadTarget(line.to_string()))?;
        let remote_ip: Ipv4Addr = addr
            .parse()
            .map_err(|_| SeedParseError::BadAddr(line.to_string()))?;
        let remote_port: u16 = port
            .parse()
            .map_err(|_| SeedParseError::BadPort(line.to_string()))?;

        let mut rng = rand::thread_rng();
        Ok(SegmentRecord {
            remote_ip,
            local_ip,
            remote_port,
            local_port: rng.gen_range(EPHEMERAL_PORT_RANGE),
            seq: rng.gen(),
            ack: 0,
            window: 65535,
            ttl: 0,
            fingerprint: None,
            expected_next: Some(ExpectedNext::SynAck),
            payload: Vec::new(),
            acking_firewall: false,
            remote_mac: [0; 6],
            local_mac: [0; 6],
            flags: TCP_FLAG_SYN,
            timestamp: Instant::now(),
            retries: 0,
            response_len: 0,
            handshake_index: 0,
            validation_failed: false,
        })
    }

    /// Fabricates a sibling probe against a random high port on the same
    /// host, used for ack-firewall detection on behalf of this flow.
    pub fn ephemeral_probe(&self) -> SegmentRecord {
        let mut rng = rand::thread_rng();
        SegmentRecord {
            remote_ip: self.remote_ip,
            local_ip: self.local_ip,
            remote_port: rng.gen_range(EPHEMERAL_PORT_RANGE),
            local_port: (self.local_port % 65535) + 1,
            seq: rng.gen(),
            ack: 0,
            window: self.window,
            ttl: 0,
            fingerprint: None,
            expected_next: Some(ExpectedNext::SynAck),
            payload: Vec::new(),
            acking_firewall: true,
            remote_mac: self.remote_mac,
            local_mac: self.local_mac,
            flags: TCP_FLAG_SYN,
            timestamp: Instant::now(),
            retries: 0,
            response_len: 0,
            handshake_index: 0,
            validation_failed: false,
        }
    }

    /// Rewrites this record for the next handshake attempt: the local port
    /// is perturbed so the prior conversation cannot interfere with
    /// validation, sequence numbers are rotated (new seq = prior ack), and
    /// all per-attempt state is cleared.
    pub fn rotate_for_escalation(&mut self) {
        self.local_port = (self.local_port % 65535) + 1;
        self.handshake_index += 1;
        self.retries = 0;
        self.expected_next = Some(ExpectedNext::SynAck);
        self.seq = self.ack;
        self.ack = 0;
        self.payload.clear();
        self.fingerprint = None;
        self.response_len = 0;
        self.flags = 0;
    }

    pub fn key(&self) -> FlowKey {
        (self.remote_ip, self.remote_port)
    }

    pub fn is_syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & TCP_FLAG_RST != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }

    pub fn is_psh(&self) -> bool {
        self.flags & TCP_FLAG_PSH != 0
    }

    /// A zero-window SYN-ACK: the host answers but refuses data.
    pub fn window_zero(&self) -> bool {
        self.window == 0 && self.is_syn() && self.is_ack()
    }

    pub fn sync_handshake(&mut self, index: usize) {
        self.handshake_index = index;
    }

    pub fn touch(&mut self) {
        self.timestamp = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prober_line_becomes_synack() {
        let line = r#"{"saddr":"10.0.0.1","sport":80,"daddr":"10.0.0.2","dport":40000,"seqnum":1000,"acknum":2000,"window":65535}"#;
        let seed = SegmentRecord::from_prober_line(line).unwrap();
        assert_eq!(seed.remote_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(seed.remote_port, 80);
        assert_eq!(seed.local_port, 40000);
        assert_eq!(seed.seq, 1000);
        assert_eq!(seed.ack, 2000);
        assert!(seed.is_syn() && seed.is_ack());
        assert_eq!(seed.key(), (Ipv4Addr::new(10, 0, 0, 1), 80));
    }

    #[test]
    fn garbage_prober_line_rejected() {
        assert!(SegmentRecord::from_prober_line("not json").is_err());
    }

    #[test]
    fn target_line_becomes_phantom_synack() {
        let seed =
            SegmentRecord::from_target_line("10.0.0.3:443\n", Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        assert_eq!(seed.remote_ip, Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(seed.remote_port, 443);
        assert_eq!(seed.local_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert!(EPHEMERAL_PORT_RANGE.contains(&seed.local_port));
        assert_eq!(seed.expected_next, Some(ExpectedNext::SynAck));
        assert_eq!(seed.window, 65535);
        assert!(seed.is_syn() && !seed.is_ack());
    }

    #[test]
    fn bad_target_lines_rejected() {
        let local = Ipv4Addr::new(10, 0, 0, 2);
        assert!(SegmentRecord::from_target_line("10.0.0.3", local).is_err());
        assert!(SegmentRecord::from_target_line("nonsense:80", local).is_err());
        assert!(SegmentRecord::from_target_line("10.0.0.3:notaport", local).is_err());
    }

    #[test]
    fn escalation_rotates_ports_and_sequence() {
        let mut rec =
            SegmentRecord::from_prober_line(
                r#"{"saddr":"10.0.0.1","sport":80,"daddr":"10.0.0.2","dport":40000,"seqnum":1000,"acknum":2000,"window":512}"#,
            )
            .unwrap();
        rec.response_len = 42;
        rec.payload = b"stale".to_vec();
        rec.retries = 3;

        rec.rotate_for_escalation();

        assert_eq!(rec.local_port, 40001);
        assert_eq!(rec.handshake_index, 1);
        assert_eq!(rec.seq, 2000);
        assert_eq!(rec.ack, 0);
        assert_eq!(rec.retries, 0);
        assert_eq!(rec.response_len, 0);
        assert!(rec.payload.is_empty());
        assert_eq!(rec.expected_next, Some(ExpectedNext::SynAck));
        assert_eq!(rec.flags, 0);
    }

    #[test]
    fn escalation_wraps_port_space() {
        let mut rec =
            SegmentRecord::from_target_line("10.0.0.3:443", Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        rec.local_port = 65535;
        rec.rotate_for_escalation();
        assert_eq!(rec.local_port, 1);
    }

    #[test]
    fn ephemeral_probe_targets_high_port() {
        let rec =
            SegmentRecord::from_target_line("10.0.0.3:443", Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        let probe = rec.ephemeral_probe();
        assert_eq!(probe.remote_ip, rec.remote_ip);
        assert!(EPHEMERAL_PORT_RANGE.contains(&probe.remote_port));
        assert_eq!(probe.local_port, (rec.local_port % 65535) + 1);
        assert!(probe.acking_firewall);
        assert_ne!(probe.key(), rec.key());
    }

    #[test]
    fn serialized_record_matches_output_contract() {
        let mut rec = SegmentRecord::from_prober_line(
            r#"{"saddr":"10.0.0.1","sport":80,"daddr":"10.0.0.2","dport":40000,"seqnum":1,"acknum":2,"window":3}"#,
        )
        .unwrap();
        rec.ttl = 57;
        rec.expected_next = Some(ExpectedNext::Data);
        rec.payload = b"HTTP/1.1 200 OK".to_vec();
        rec.fingerprint = Some("http".to_string());

        let json: serde_json::Value = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["saddr"], "10.0.0.1");
        assert_eq!(json["daddr"], "10.0.0.2");
        assert_eq!(json["sport"], 80);
        assert_eq!(json["dport"], 40000);
        assert_eq!(json["seqnum"], 1);
        assert_eq!(json["acknum"], 2);
        assert_eq!(json["window"], 3);
        assert_eq!(json["ttl"], 57);
        assert_eq!(json["expectedRToLZR"], "data");
        assert_eq!(json["data"], "HTTP/1.1 200 OK");
        assert_eq!(json["fingerprint"], "http");
        // Not positive, so the flag is omitted entirely.
        assert!(json.get("ackingFirewall").is_none());
        // Bookkeeping never leaks into the output.
        assert!(json.get("retries").is_none());
        assert!(json.get("flags").is_none());
    }

    #[test]
    fn empty_payload_and_fingerprint_omitted() {
        let rec = SegmentRecord::from_prober_line(
            r#"{"saddr":"10.0.0.1","sport":80,"daddr":"10.0.0.2","dport":40000,"seqnum":1,"acknum":2,"window":3}"#,
        )
        .unwrap();
        let json: serde_json::Value = serde_json::to_value(&rec).unwrap();
        assert!(json.get("data").is_none());
        assert!(json.get("fingerprint").is_none());
        assert!(json.get("expectedRToLZR").is_none());
    }

    #[test]
    fn zero_window_requires_synack_flags() {
        let mut rec = SegmentRecord::from_prober_line(
            r#"{"saddr":"10.0.0.1","sport":80,"daddr":"10.0.0.2","dport":40000,"seqnum":1,"acknum":2,"window":0}"#,
        )
        .unwrap();
        assert!(rec.window_zero());
        rec.flags = TCP_FLAG_ACK;
        assert!(!rec.window_zero());
    }
}
