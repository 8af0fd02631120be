use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use parley::capture::{self, LinkLayer};
use parley::engine::{Engine, EngineChannels};
use parley::error::Result;
use parley::input;
use parley::output::{self, ResultWriter};
use parley::runtime::context::Context;
use parley::timers;

#[tokio::main]
async fn main() -> Result<()> {
    let start = Instant::now();
    let Context {
        conf,
        registry,
        gateway_mac,
    } = Context::new()?;

    let default_level = if conf.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("writing results to {}", conf.output);
    info!("handshakes: {}", conf.handshakes.join(","));
    info!(
        "workers: {}, timeout: {:?}, retransmit: {:?} x{}",
        conf.workers, conf.timeout, conf.retransmit_interval, conf.retransmit_count
    );
    if conf.send_syns {
        info!("active mode: originating SYNs from {:?}", conf.source_ip);
    }
    if conf.haf > 0 {
        info!("ack-firewall detection with {} ephemeral probes", conf.haf);
    }

    let source_mac = capture::interface_mac(&conf.interface)?;
    let link = Arc::new(LinkLayer::new(source_mac, conf.source_ip, gateway_mac));

    // Two handles on the interface: a filtered tap for inbound segments
    // and an unfiltered one for raw sends.
    let tap = capture::open_tap(&conf.interface)?;
    let sink = Arc::new(capture::open_sender(&conf.interface)?);
    let out = output::open_output(&conf.output)?;

    let cap = conf.channel_capacity;
    let (seed_tx, seed_rx) = mpsc::channel(cap);
    let (capture_tx, capture_rx) = mpsc::channel(cap);
    let (connect_timer_tx, connect_timer_rx) = mpsc::channel(cap);
    let (retransmit_timer_tx, retransmit_timer_rx) = mpsc::channel(cap);
    let (timeout_tx, timeout_rx) = mpsc::channel(cap);
    let (result_tx, result_rx) = mpsc::channel(cap);
    let (fatal_tx, mut fatal_rx) = mpsc::channel(1);

    let engine = Engine::new(
        conf.clone(),
        registry.clone(),
        sink,
        link.clone(),
        EngineChannels {
            capture_tx: capture_tx.clone(),
            connect_timer_tx,
            retransmit_timer_tx,
            timeout_tx: timeout_tx.clone(),
            result_tx,
            fatal_tx,
        },
    );

    let reader = capture::spawn_reader(tap, link, capture_tx)?;

    let writer = ResultWriter::new(out, registry.clone(), conf.fingerprint_priority());
    let writer_task = tokio::spawn(writer.run(result_rx));

    let mut background = vec![
        timers::spawn_poller(
            "connect",
            conf.timeout,
            connect_timer_rx,
            engine.table().clone(),
            timeout_tx.clone(),
        ),
        timers::spawn_poller(
            "retransmit",
            conf.retransmit_interval,
            retransmit_timer_rx,
            engine.table().clone(),
            timeout_tx,
        ),
        engine.spawn_timeout_worker(timeout_rx),
    ];
    background.extend(engine.spawn_capture_workers(capture_rx));

    let seed_workers = engine.spawn_seed_workers(seed_rx);
    let input_task = tokio::spawn(input::run_stdin(conf.clone(), seed_tx));

    // Input EOF -> seed workers drain -> the flow table empties (or
    // stalls out). A fatal send/capture error short-circuits all of it.
    let run = async {
        let _ = input_task.await;
        for worker in seed_workers {
            let _ = worker.await;
        }
        engine.wait_for_quiescence().await;
    };
    tokio::select! {
        _ = run => {}
        Some(err) = fatal_rx.recv() => {
            error!("aborting run: {err}");
            return Err(err);
        }
    }

    // Stop the event sources so the writer's channel closes once the
    // engine's remaining references drop.
    for task in background {
        task.abort();
    }
    drop(engine);
    drop(reader);

    let written = writer_task.await.unwrap_or(0);
    output::summarize(start.elapsed(), written, &registry);
    Ok(())
}
