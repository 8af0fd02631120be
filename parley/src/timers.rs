//! Delay queues and their pollers.
//!
//! Both queues (connect-timeout and data-retransmit) are strictly FIFO
//! with one uniform delay each, so a poller just sleeps until
//! `enqueued_at + delay` for the entry at the head. On wake-up the flow's
//! current expected-next marker is compared with the one captured at
//! enqueue: unchanged means the flow has not advanced and the key is
//! forwarded to the dispatcher's timeout channel; anything else means the
//! entry is stale and is dropped silently.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::packet::{ExpectedNext, FlowKey, SegmentRecord};
use crate::table::FlowTable;

/// One armed timer. The deadline is implied: `enqueued_at` plus the
/// queue's uniform delay.
#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub key: FlowKey,
    pub expected: Option<ExpectedNext>,
    pub enqueued_at: Instant,
}

impl TimerEntry {
    pub fn for_packet(packet: &SegmentRecord) -> TimerEntry {
        TimerEntry {
            key: packet.key(),
            expected: packet.expected_next,
            enqueued_at: Instant::now(),
        }
    }
}

/// Which delay queue an entry is armed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerQueue {
    Connect,
    Retransmit,
}

/// Drains one delay queue. Runs until the queue's senders are dropped.
pub fn spawn_poller(
    label: &'static str,
    delay: Duration,
    mut rx: mpsc::Receiver<TimerEntry>,
    table: FlowTable,
    timeout_tx: mpsc::Sender<FlowKey>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            tokio::time::sleep_until((entry.enqueued_at + delay).into()).await;

            match table.expected_next(entry.key) {
                // flow already terminated
                None => continue,
                Some(current) => {
                    if current != entry.expected {
                        // the event was handled while we slept
                        continue;
                    }
                }
            }
            if timeout_tx.send(entry.key).await.is_err() {
                break;
            }
        }
        debug!("{label} poller exiting");
    })
}
