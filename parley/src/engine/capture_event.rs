//! The state machine's capture edge: one observed segment, already
//! paired to a claimed flow by the worker, advances that flow.

use super::Engine;
use crate::packet::{ExpectedNext, SegmentRecord};
use crate::sink::SinkError;
use crate::timers::TimerQueue;

impl Engine {
    pub(crate) async fn on_capture(&self, mut packet: SegmentRecord) -> Result<(), SinkError> {
        let key = packet.key();

        if !self.table.verify_segment(&packet) {
            // Superficially matched the key but not the conversation.
            // Hedge it into the connect queue instead of trusting it as
            // an authoritative event.
            packet.retries += 1;
            packet.touch();
            packet.validation_failed = true;
            self.arm_timer(TimerQueue::Connect, &packet).await;
            return Ok(());
        }

        let is_sibling = self.table.is_hyperacktive(key);
        let hs = self.table.handshake_index(key).unwrap_or(0);

        if !packet.is_syn() && packet.is_ack() {
            self.table.set_ack_reached(key);
        }

        if !packet.payload.is_empty() {
            // The banner. Classify at write time; the flow is done unless
            // every handshake was asked for.
            packet.expected_next = Some(ExpectedNext::Data);
            self.table.set_data_reached(key);

            if self.conf.force_all_handshakes {
                self.on_expired(packet).await?;
            } else {
                packet.sync_handshake(hs);
                // Sibling probes only ever prove the parent's status;
                // their own records never leave the engine.
                self.close_connection(&mut packet, !is_sibling, false)
                    .await?;
            }
        } else if packet.is_rst() || packet.is_fin() {
            // Peer closed without speaking; try the next handshake if any
            // remain.
            self.on_expired(packet).await?;
        } else if self.conf.haf > 0
            && hs == 1
            && !is_sibling
            && self.table.ephemeral_resp_count(key) > self.conf.haf
        {
            // Enough random ephemeral ports answered during handshake 1:
            // everything this host says is firewall noise.
            self.close_connection(&mut packet, true, true).await?;
        } else if !packet.is_syn() && packet.is_ack() {
            // Bare ACK of our payload; now wait for data, with the PSH
            // retransmission armed.
            packet.expected_next = Some(ExpectedNext::Data);
            packet.touch();
            self.table.insert_or_update(key, packet.clone());
            self.arm_timer(TimerQueue::Connect, &packet).await;
        } else if packet.is_syn() && packet.is_ack() {
            if hs == 1 && self.conf.haf > 0 {
                if is_sibling {
                    let parent_port = self.table.parent_port(key);
                    self.table
                        .increment_ephemeral_resp((packet.remote_ip, parent_port));
                    self.close_connection(&mut packet, false, false).await?;
                    return Ok(());
                }
                // A handshake-1 SYN-ACK on the parent itself also bumps
                // the counter: the bias is toward flagging the firewall.
                self.table.increment_ephemeral_resp(key);
            }
            self.send_ack(&mut packet, false, ExpectedNext::Ack, TimerQueue::Retransmit)
                .await?;
        }
        Ok(())
    }
}
