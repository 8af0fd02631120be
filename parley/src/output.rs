//! The result writer and the end-of-run summary.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::handshake::HandshakeRegistry;
use crate::packet::SegmentRecord;

/// `-` selects stdout, anything else is a file path.
pub fn open_output(path: &str) -> io::Result<Box<dyn Write + Send>> {
    if path == "-" {
        Ok(Box::new(BufWriter::new(io::stdout())))
    } else {
        Ok(Box::new(BufWriter::new(File::create(path)?)))
    }
}

/// Drains the result channel, one JSON object per line. Fingerprinting
/// happens here, at record time, so every emitted record carries a tag
/// (an empty banner fingerprints as `unknown`).
pub struct ResultWriter {
    out: Box<dyn Write + Send>,
    registry: Arc<HandshakeRegistry>,
    priority: Vec<String>,
}

impl ResultWriter {
    pub fn new(
        out: Box<dyn Write + Send>,
        registry: Arc<HandshakeRegistry>,
        priority: Vec<String>,
    ) -> ResultWriter {
        ResultWriter {
            out,
            registry,
            priority,
        }
    }

    /// Runs until the channel closes; returns the number of records
    /// written.
    pub async fn run(mut self, mut rx: mpsc::Receiver<SegmentRecord>) -> u64 {
        let mut written = 0u64;
        while let Some(mut record) = rx.recv().await {
            if record.fingerprint.is_none() {
                record.fingerprint =
                    Some(self.registry.fingerprint(&record.payload, &self.priority));
            }
            match serde_json::to_string(&record) {
                Ok(json) => {
                    if let Err(e) = writeln!(self.out, "{json}") {
                        error!("writing result record: {e}");
                        break;
                    }
                    written += 1;
                }
                Err(e) => error!("serializing result record: {e}"),
            }
        }
        if let Err(e) = self.out.flush() {
            error!("flushing results: {e}");
        }
        written
    }
}

/// Final stderr summary: elapsed time and the fingerprint histogram.
pub fn summarize(elapsed: Duration, written: u64, registry: &HandshakeRegistry) {
    info!("wrote {written} records in {:.2?}", elapsed);
    for (tag, count) in registry.histogram() {
        info!("fingerprint {tag}: {count}");
    }
}
