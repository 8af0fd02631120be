//! The dispatcher: worker pools over the seed, capture and timeout
//! channels, all funneling through the per-flow state machine.
//!
//! ### Concurrency model
//!
//! - W seed workers and W capture workers, each pool fed by a distributor
//!   task that spreads events over per-worker channels (blocking only
//!   when every worker is full).
//! - One timeout worker, one writer (elsewhere), one capture reader
//!   thread (elsewhere).
//! - Every mutation of a flow happens between `claim` and `release` on
//!   its table entry. A capture or timeout event that finds its flow
//!   claimed is re-enqueued at the back of its source channel after a
//!   short pause, preserving pairing order without blocking the worker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capture::LinkLayer;
use crate::error::ParleyError;
use crate::handshake::HandshakeRegistry;
use crate::packet::{ExpectedNext, FlowKey, SegmentRecord};
use crate::runtime::conf::Conf;
use crate::sink::{PacketSink, SinkError};
use crate::table::FlowTable;
use crate::timers::{TimerEntry, TimerQueue};

mod actions;
mod capture_event;
mod expired;
mod timeout_event;

/// Pause before re-enqueueing an event whose flow another worker holds.
const CONTENTION_PAUSE: Duration = Duration::from_millis(2);

/// Senders the engine pushes into; the matching receivers are drained by
/// the pollers, the workers and the writer.
pub struct EngineChannels {
    pub capture_tx: mpsc::Sender<SegmentRecord>,
    pub connect_timer_tx: mpsc::Sender<TimerEntry>,
    pub retransmit_timer_tx: mpsc::Sender<TimerEntry>,
    pub timeout_tx: mpsc::Sender<FlowKey>,
    pub result_tx: mpsc::Sender<SegmentRecord>,
    pub fatal_tx: mpsc::Sender<ParleyError>,
}

pub struct Engine {
    conf: Arc<Conf>,
    registry: Arc<HandshakeRegistry>,
    sink: Arc<dyn PacketSink>,
    link: Arc<LinkLayer>,
    table: FlowTable,
    channels: EngineChannels,
}

impl Engine {
    pub fn new(
        conf: Arc<Conf>,
        registry: Arc<HandshakeRegistry>,
        sink: Arc<dyn PacketSink>,
        link: Arc<LinkLayer>,
        channels: EngineChannels,
    ) -> Arc<Engine> {
        Arc::new(Engine {
            conf,
            registry,
            sink,
            link,
            table: FlowTable::new(),
            channels,
        })
    }

    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    /// Seed workers: Passive seeds get the data-bearing ACK immediately,
    /// Active seeds get their SYN. Returns the worker handles plus the
    /// distributor's; await them all to know the input side has drained.
    pub fn spawn_seed_workers(
        self: &Arc<Self>,
        seed_rx: mpsc::Receiver<SegmentRecord>,
    ) -> Vec<JoinHandle<()>> {
        let worker_count = self.conf.workers.max(1);
        let mut worker_txs: Vec<mpsc::Sender<SegmentRecord>> = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count + 1);

        for worker in 0..worker_count {
            let (tx, mut rx) = mpsc::channel(self.worker_capacity(worker_count));
            worker_txs.push(tx);
            let engine = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                while let Some(mut seed) = rx.recv().await {
                    let key = seed.key();
                    let result = if engine.conf.send_syns {
                        engine.send_syn(&mut seed).await
                    } else {
                        engine
                            .send_ack(&mut seed, false, ExpectedNext::Ack, TimerQueue::Retransmit)
                            .await
                    };
                    engine.table.release(key);
                    if let Err(e) = result {
                        engine.fail(e);
                        return;
                    }
                }
                debug!("seed worker {worker} exiting");
            }));
        }

        handles.push(spawn_distributor("seed", seed_rx, worker_txs));
        handles
    }

    /// Capture workers: pair each observed segment with its flow and run
    /// the state machine. Claimed flows yield-and-retry via the back of
    /// the capture channel.
    pub fn spawn_capture_workers(
        self: &Arc<Self>,
        capture_rx: mpsc::Receiver<SegmentRecord>,
    ) -> Vec<JoinHandle<()>> {
        let worker_count = self.conf.workers.max(1);
        let mut worker_txs: Vec<mpsc::Sender<SegmentRecord>> = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count + 1);

        for worker in 0..worker_count {
            let (tx, mut rx) = mpsc::channel(self.worker_capacity(worker_count));
            worker_txs.push(tx);
            let engine = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                while let Some(packet) = rx.recv().await {
                    let key = packet.key();
                    let (present, acquired) = engine.table.claim(key);
                    if !present {
                        continue;
                    }
                    if !acquired {
                        tokio::time::sleep(CONTENTION_PAUSE).await;
                        if engine.channels.capture_tx.send(packet).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    let result = engine.on_capture(packet).await;
                    engine.table.release(key);
                    if let Err(e) = result {
                        engine.fail(e);
                        return;
                    }
                }
                debug!("capture worker {worker} exiting");
            }));
        }

        handles.push(spawn_distributor("capture", capture_rx, worker_txs));
        handles
    }

    /// Single worker draining the timeout channel the pollers feed.
    pub fn spawn_timeout_worker(
        self: &Arc<Self>,
        mut timeout_rx: mpsc::Receiver<FlowKey>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(key) = timeout_rx.recv().await {
                let (present, acquired) = engine.table.claim(key);
                if !present {
                    continue;
                }
                if !acquired {
                    tokio::time::sleep(CONTENTION_PAUSE).await;
                    if engine.channels.timeout_tx.send(key).await.is_err() {
                        return;
                    }
                    continue;
                }
                let result = engine.on_timeout(key).await;
                engine.table.release(key);
                if let Err(e) = result {
                    engine.fail(e);
                    return;
                }
            }
            debug!("timeout worker exiting");
        })
    }

    /// Blocks until the flow table drains, or stays the same size for the
    /// stall interval (the infinite-loop guard); remaining entries are
    /// abandoned in that case.
    pub async fn wait_for_quiescence(&self) {
        let stall = self.conf.stall_interval();
        let mut last_count = self.table.count();
        let mut last_change = Instant::now();
        loop {
            if self.table.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            let count = self.table.count();
            if count != last_count {
                last_count = count;
                last_change = Instant::now();
            } else if last_change.elapsed() >= stall {
                warn!("flow table stalled at {count} entries, abandoning them");
                return;
            }
            info!("finishing last: {count}");
        }
    }

    fn worker_capacity(&self, worker_count: usize) -> usize {
        (self.conf.channel_capacity / worker_count).max(1)
    }

    pub(crate) async fn arm_timer(&self, queue: TimerQueue, packet: &SegmentRecord) {
        let tx = match queue {
            TimerQueue::Connect => &self.channels.connect_timer_tx,
            TimerQueue::Retransmit => &self.channels.retransmit_timer_tx,
        };
        if tx.send(TimerEntry::for_packet(packet)).await.is_err() {
            debug!("timer queue closed");
        }
    }

    pub(crate) async fn emit(&self, record: SegmentRecord) {
        if self.channels.result_tx.send(record).await.is_err() {
            debug!("result channel closed");
        }
    }

    fn fail(&self, err: SinkError) {
        error!("fatal: {err}");
        let _ = self.channels.fatal_tx.try_send(ParleyError::Sink(err));
    }
}

/// Spreads events across per-worker channels: try the preferred worker,
/// then the rest, and only block (on the preferred one) when everyone is
/// full.
fn spawn_distributor<T: Send + 'static>(
    label: &'static str,
    mut rx: mpsc::Receiver<T>,
    worker_txs: Vec<mpsc::Sender<T>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let worker_count = worker_txs.len();
        let mut worker_index = 0;
        while let Some(event) = rx.recv().await {
            let mut pending = Some(event);
            for attempt in 0..worker_count {
                let Some(ev) = pending.take() else { break };
                let current = (worker_index + attempt) % worker_count;
                match worker_txs[current].try_send(ev) {
                    Ok(()) => {
                        worker_index = (current + 1) % worker_count;
                    }
                    Err(TrySendError::Full(ev)) | Err(TrySendError::Closed(ev)) => {
                        pending = Some(ev);
                    }
                }
            }
            if let Some(ev) = pending {
                if worker_txs[worker_index].send(ev).await.is_ok() {
                    worker_index = (worker_index + 1) % worker_count;
                }
            }
        }
        debug!("{label} distributor exiting");
    })
}
