//! Outgoing-segment actions. Each one updates the flow record, injects
//! the frame, and arms the appropriate delay queue.
//!
//! Records are inbound-oriented, so every build here reverses them:
//! source is our side, destination is the scanned host.

use parley_wire::tcp::{TCP_FLAG_ACK, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN};
use parley_wire::SegmentSpec;

use super::Engine;
use crate::packet::{ExpectedNext, SegmentRecord};
use crate::sink::SinkError;
use crate::timers::TimerQueue;

impl Engine {
    /// SYN toward the flow's target. Seq, ack and window come straight
    /// off the (phantom) inbound record. Creates the flow when this is
    /// its first action, releases the claim, and arms the connect timer.
    pub(crate) async fn send_syn(&self, packet: &mut SegmentRecord) -> Result<(), SinkError> {
        packet.expected_next = Some(ExpectedNext::SynAck);
        packet.touch();
        self.table.insert_or_update(packet.key(), packet.clone());

        let (src_mac, dst_mac) = self.link_macs();
        let syn = SegmentSpec {
            src_mac,
            dst_mac,
            src_ip: packet.local_ip,
            dst_ip: packet.remote_ip,
            src_port: packet.local_port,
            dst_port: packet.remote_port,
            seq: packet.seq,
            ack: packet.ack,
            window: packet.window,
            flags: TCP_FLAG_SYN,
            payload: &[],
        };
        self.sink.send(&syn.build())?;

        packet.touch();
        self.table.release(packet.key());
        self.arm_timer(TimerQueue::Connect, packet).await;
        Ok(())
    }

    /// ACK answering a SYN-ACK, carrying the current handshake's probe
    /// payload. With push-data-only the payload is withheld until the
    /// PSH retransmission. The caller picks the queue: first sends arm
    /// the retransmit queue, retransmissions re-arm the connect queue.
    pub(crate) async fn send_ack(
        &self,
        packet: &mut SegmentRecord,
        to_push: bool,
        expected: ExpectedNext,
        queue: TimerQueue,
    ) -> Result<(), SinkError> {
        let key = packet.key();

        // A zero-window SYN-ACK answers but refuses data; nothing more
        // can be elicited, so the flow ends here.
        if packet.window_zero() {
            let hs = self.table.handshake_index(key).unwrap_or(0);
            packet.sync_handshake(hs);
            self.table.remove(key);
            self.emit(packet.clone()).await;
            return Ok(());
        }

        let hs = self.table.handshake_index(key).unwrap_or(0);
        let name = &self.conf.handshakes[hs.min(self.conf.handshakes.len() - 1)];
        let mut payload = match self.registry.get(name) {
            Some(handshake) => handshake.probe(&packet.remote_ip.to_string()),
            None => Vec::new(),
        };
        if self.conf.push_data_only && !to_push {
            payload.clear();
        }

        packet.expected_next = Some(expected);
        packet.response_len = payload.len();
        packet.touch();
        self.table.insert_or_update(key, packet.clone());

        let mut flags = TCP_FLAG_ACK;
        if to_push {
            flags |= TCP_FLAG_PSH;
        }
        let (src_mac, dst_mac) = self.link_macs();
        let ack = SegmentSpec {
            src_mac,
            dst_mac,
            src_ip: packet.local_ip,
            dst_ip: packet.remote_ip,
            src_port: packet.local_port,
            dst_port: packet.remote_port,
            seq: packet.ack,
            ack: packet.seq.wrapping_add(1),
            window: packet.window,
            flags,
            payload: &payload,
        };
        self.sink.send(&ack.build())?;

        packet.touch();
        self.arm_timer(queue, packet).await;
        Ok(())
    }

    /// RST the peer, drop the flow, and optionally emit its record.
    pub(crate) async fn close_connection(
        &self,
        packet: &mut SegmentRecord,
        write: bool,
        acking_firewall: bool,
    ) -> Result<(), SinkError> {
        self.send_rst(packet)?;
        self.table.remove(packet.key());
        if write {
            packet.acking_firewall = acking_firewall;
            self.emit(packet.clone()).await;
        }
        Ok(())
    }

    pub(crate) fn send_rst(&self, packet: &SegmentRecord) -> Result<(), SinkError> {
        let (src_mac, dst_mac) = self.link_macs();
        let rst = SegmentSpec {
            src_mac,
            dst_mac,
            src_ip: packet.local_ip,
            dst_ip: packet.remote_ip,
            src_port: packet.local_port,
            dst_port: packet.remote_port,
            seq: packet.ack,
            ack: 0,
            window: 0,
            flags: TCP_FLAG_RST,
            payload: &[],
        };
        self.sink.send(&rst.build())
    }

    fn link_macs(&self) -> ([u8; 6], [u8; 6]) {
        (
            self.link.source_mac,
            self.link.gateway_mac().unwrap_or([0; 6]),
        )
    }
}
