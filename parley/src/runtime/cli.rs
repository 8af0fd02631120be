use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Default)]
#[command(name = "parley", version, about = "Completes the second handshake behind a stateless prober and fingerprints what answers", long_about = None)]
pub struct Cli {
    /// Path to the configuration file (e.g. "parley.yaml").
    #[arg(short = 'c', long, value_name = "FILE", env = "PARLEY_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Results file; use '-' for standard output.
    #[arg(short = 'f', long, value_name = "FILE", env = "PARLEY_OUTPUT")]
    pub output: Option<String>,

    /// Read ip:port targets from stdin and originate the SYNs (Active
    /// mode). Without this, stdin carries upstream-prober SYN-ACK lines.
    #[arg(long, env = "PARLEY_SEND_SYNS")]
    pub send_syns: bool,

    /// Source IP for self-originated SYNs (required with --send-syns).
    #[arg(long, value_name = "IP", env = "PARLEY_SOURCE_IP")]
    pub source_ip: Option<Ipv4Addr>,

    /// Network interface to capture and send on.
    #[arg(long, value_name = "NAME", env = "PARLEY_INTERFACE")]
    pub interface: Option<String>,

    /// Gateway MAC address (xx:xx:xx:xx:xx:xx). Learned from the first
    /// captured frame when omitted in Passive mode.
    #[arg(long, value_name = "MAC", env = "PARLEY_GATEWAY_MAC")]
    pub gateway_mac: Option<String>,

    /// Ordered application-layer handshakes to attempt.
    #[arg(long, value_name = "NAMES", value_delimiter = ',', env = "PARLEY_HANDSHAKES")]
    pub handshakes: Option<Vec<String>>,

    /// Fingerprints to prioritize when multiple classifiers match.
    #[arg(long, value_name = "NAMES", value_delimiter = ',')]
    pub priority_fingerprint: Option<Vec<String>>,

    /// Worker tasks per channel.
    #[arg(short = 'w', long, value_name = "N")]
    pub workers: Option<usize>,

    /// Seconds to wait for connection-establishment progress.
    #[arg(short = 't', long, value_name = "SEC")]
    pub timeout: Option<u64>,

    /// Seconds until an unacknowledged data segment is retransmitted.
    #[arg(long, value_name = "SEC")]
    pub retransmit_interval: Option<u64>,

    /// Number of retransmissions before giving up on an attempt.
    #[arg(long, value_name = "N")]
    pub retransmit_count: Option<u32>,

    /// Random ephemeral probes for ack-firewall detection (0 disables).
    #[arg(long, value_name = "N")]
    pub haf: Option<u32>,

    /// Attempt every configured handshake even when data is returned
    /// early. Implicitly disables --haf.
    #[arg(long)]
    pub force_all_handshakes: bool,

    /// Send the probe payload only on the PSH retransmission, not on the
    /// first ACK.
    #[arg(long)]
    pub push_data_only: bool,

    /// Debug logging.
    #[arg(short = 'd', long, env = "PARLEY_DEBUG")]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use clap::Parser as _;
    use figment::Jail;

    use super::Cli;

    #[test]
    fn parses_long_flags() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from([
                "parley",
                "-f",
                "-",
                "--send-syns",
                "--source-ip",
                "10.0.0.2",
                "--interface",
                "eth0",
                "--handshakes",
                "http,tls",
                "-w",
                "4",
                "-t",
                "3",
                "--haf",
                "5",
            ]);
            assert_eq!(cli.output.as_deref(), Some("-"));
            assert!(cli.send_syns);
            assert_eq!(cli.interface.as_deref(), Some("eth0"));
            assert_eq!(
                cli.handshakes,
                Some(vec!["http".to_string(), "tls".to_string()])
            );
            assert_eq!(cli.workers, Some(4));
            assert_eq!(cli.timeout, Some(3));
            assert_eq!(cli.haf, Some(5));
            Ok(())
        });
    }

    #[test]
    fn parses_from_env_when_no_args() {
        Jail::expect_with(|jail| {
            jail.set_env("PARLEY_INTERFACE", "ens8");
            jail.set_env("PARLEY_HANDSHAKES", "tls");
            jail.set_env("PARLEY_SEND_SYNS", "true");

            let cli = Cli::parse_from(["parley"]);
            assert_eq!(cli.interface.as_deref(), Some("ens8"));
            assert_eq!(cli.handshakes, Some(vec!["tls".to_string()]));
            assert!(cli.send_syns);
            Ok(())
        });
    }

    #[test]
    fn defaults_leave_everything_unset() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from(["parley"]);
            assert_eq!(cli.output, None);
            assert!(!cli.send_syns);
            assert!(!cli.force_all_handshakes);
            assert_eq!(cli.workers, None);
            Ok(())
        });
    }
}
