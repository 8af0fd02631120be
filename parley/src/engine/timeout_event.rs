//! The state machine's timer edge: a delay-queue entry fired and the
//! flow had not advanced by then.

use super::Engine;
use crate::packet::{ExpectedNext, FlowKey};
use crate::sink::SinkError;
use crate::timers::TimerQueue;

impl Engine {
    pub(crate) async fn on_timeout(&self, key: FlowKey) -> Result<(), SinkError> {
        // The flow may have terminated between the poller's check and the
        // claim.
        let Some(mut packet) = self.table.get_packet(key) else {
            return Ok(());
        };

        if packet.retries < self.conf.retransmit_count && !packet.acking_firewall {
            let retries = self.table.increment_retries(key);
            packet.retries = retries;

            match packet.expected_next {
                Some(expected @ (ExpectedNext::Ack | ExpectedNext::Data)) => {
                    // Retransmit the data-bearing ACK, PSH set from the
                    // first retry on; re-arm on the connect queue.
                    self.send_ack(&mut packet, retries >= 1, expected, TimerQueue::Connect)
                        .await?;
                }
                Some(ExpectedNext::SynAck) => {
                    self.send_syn(&mut packet).await?;
                }
                None => {}
            }
        } else {
            // Retries exhausted, or a sibling probe that never answers
            // more than once.
            self.on_expired(packet).await?;
        }
        Ok(())
    }
}
