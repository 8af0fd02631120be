//! The seed source: newline-delimited targets on stdin.
//!
//! Passive mode chains off an upstream stateless prober, one JSON object
//! per observed SYN-ACK. Active mode takes bare `ip:port` targets and
//! fabricates the phantom SYN-ACK itself. Unparseable lines are logged
//! and discarded; EOF closes the seed channel, which starts the shutdown
//! sequence.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::packet::SegmentRecord;
use crate::runtime::conf::Conf;

/// Reads seeds from stdin until EOF.
pub async fn run_stdin(conf: Arc<Conf>, seed_tx: mpsc::Sender<SegmentRecord>) {
    let reader = BufReader::new(tokio::io::stdin());
    read_seeds(reader, conf, seed_tx).await;
}

pub async fn read_seeds<R>(reader: R, conf: Arc<Conf>, seed_tx: mpsc::Sender<SegmentRecord>)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("input read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let seed = if conf.send_syns {
            // validated at startup
            let Some(source_ip) = conf.source_ip else {
                warn!("dropping target {line:?}: no source IP configured");
                continue;
            };
            SegmentRecord::from_target_line(&line, source_ip)
        } else {
            SegmentRecord::from_prober_line(&line)
        };

        match seed {
            Ok(seed) => {
                if seed_tx.send(seed).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("dropping input line: {e}"),
        }
    }
    info!("finished reading input");
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::runtime::conf::Conf;

    fn conf(send_syns: bool) -> Arc<Conf> {
        let mut conf = Conf::default();
        conf.send_syns = send_syns;
        conf.source_ip = Some(Ipv4Addr::new(10, 0, 0, 2));
        Arc::new(conf)
    }

    #[tokio::test]
    async fn passive_lines_become_seeds() {
        let input = concat!(
            r#"{"saddr":"10.0.0.1","sport":80,"daddr":"10.0.0.2","dport":40000,"seqnum":1,"acknum":2,"window":512}"#,
            "\n",
            "not json at all\n",
            r#"{"saddr":"10.0.0.5","sport":443,"daddr":"10.0.0.2","dport":40001,"seqnum":3,"acknum":4,"window":512}"#,
            "\n",
        );
        let (tx, mut rx) = mpsc::channel(8);
        read_seeds(input.as_bytes(), conf(false), tx).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key(), (Ipv4Addr::new(10, 0, 0, 1), 80));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.key(), (Ipv4Addr::new(10, 0, 0, 5), 443));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn active_lines_become_phantom_seeds() {
        let input = "10.0.0.3:443\n\n192.0.2.1:22\n";
        let (tx, mut rx) = mpsc::channel(8);
        read_seeds(input.as_bytes(), conf(true), tx).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key(), (Ipv4Addr::new(10, 0, 0, 3), 443));
        assert!(first.is_syn());
        let second = rx.recv().await.unwrap();
        assert_eq!(second.key(), (Ipv4Addr::new(192, 0, 2, 1), 22));
        assert!(rx.recv().await.is_none());
    }
}
