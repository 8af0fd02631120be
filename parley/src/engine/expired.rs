//! Handshake escalation and flow termination.

use super::Engine;
use crate::packet::SegmentRecord;
use crate::sink::SinkError;

impl Engine {
    /// Called when retries are exhausted, the peer closed without
    /// speaking, or force-all routing funnels a data-bearing flow onward.
    /// Either the flow terminates (and maybe emits), or it escalates to
    /// the next handshake on a perturbed source port.
    pub(crate) async fn on_expired(&self, mut packet: SegmentRecord) -> Result<(), SinkError> {
        // Close our half, unless the peer already RST the conversation.
        if !(packet.is_rst() && !packet.is_ack()) {
            self.send_rst(&packet)?;
        }

        let key = packet.key();
        let hs = self.table.handshake_index(key).unwrap_or(0);
        let is_sibling = packet.acking_firewall || self.table.is_hyperacktive(key);

        if is_sibling || hs + 1 >= self.conf.handshakes.len() {
            packet.sync_handshake(hs);
            // Under force-all, a flow that already produced data was
            // emitted when it did; an empty terminal record would only
            // duplicate it.
            let duplicate = self.conf.force_all_handshakes
                && self.table.data_reached(key)
                && packet.payload.is_empty();
            if !is_sibling && !duplicate {
                self.emit(packet.clone()).await;
            }
            self.table.remove(key);
        } else {
            if self.conf.force_all_handshakes && !packet.payload.is_empty() {
                packet.sync_handshake(hs);
                self.emit(packet.clone()).await;
            }

            packet.rotate_for_escalation();
            self.table.increment_handshake(key);
            self.send_syn(&mut packet).await?;

            // The first escalation is when the ack-firewall probes go
            // out: random ephemeral ports on the same host, each tied
            // back to this flow.
            if hs == 0 && self.conf.haf > 0 {
                for _ in 0..self.conf.haf {
                    let mut sibling = packet.ephemeral_probe();
                    let sibling_key = sibling.key();
                    self.send_syn(&mut sibling).await?;
                    self.table.increment_handshake(sibling_key);
                    self.table.set_hyperacktive(sibling_key);
                    self.table.set_parent_port(sibling_key, packet.remote_port);
                }
            }
        }
        Ok(())
    }
}
