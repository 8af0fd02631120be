//! Runtime configuration: defaults, optional YAML file, `PARLEY_*`
//! environment, CLI flags on top, then validation.

use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handshake::HandshakeRegistry;
use crate::runtime::cli::Cli;

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("handshake not found: {0}")]
    UnknownHandshake(String),

    #[error("no handshakes configured")]
    NoHandshakes,

    #[error("--send-syns requires --source-ip")]
    MissingSourceIp,

    #[error("--send-syns requires --gateway-mac")]
    MissingGatewayMac,

    #[error("bad gateway MAC {0:?}, expected xx:xx:xx:xx:xx:xx")]
    BadGatewayMac(String),

    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Conf {
    /// Results destination; `-` is stdout.
    pub output: String,
    /// Active mode: originate the SYNs ourselves.
    pub send_syns: bool,
    pub source_ip: Option<Ipv4Addr>,
    pub interface: String,
    pub gateway_mac: Option<String>,
    /// Ordered L7 probes to attempt per flow.
    pub handshakes: Vec<String>,
    /// Tag priority when several classifiers match; defaults to the
    /// handshake order.
    pub priority_fingerprint: Vec<String>,
    pub workers: usize,
    /// Connect-timeout queue delay.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Data-retransmit queue delay.
    #[serde(with = "duration_secs")]
    pub retransmit_interval: Duration,
    pub retransmit_count: u32,
    /// Ephemeral probes per flow for ack-firewall detection; 0 disables.
    pub haf: u32,
    pub force_all_handshakes: bool,
    pub push_data_only: bool,
    pub channel_capacity: usize,
    pub debug: bool,
}

impl Default for Conf {
    fn default() -> Conf {
        Conf {
            output: defaults::output(),
            send_syns: false,
            source_ip: None,
            interface: defaults::interface(),
            gateway_mac: None,
            handshakes: defaults::handshakes(),
            priority_fingerprint: Vec::new(),
            workers: defaults::workers(),
            timeout: defaults::timeout(),
            retransmit_interval: defaults::retransmit_interval(),
            retransmit_count: defaults::retransmit_count(),
            haf: 0,
            force_all_handshakes: false,
            push_data_only: false,
            channel_capacity: defaults::channel_capacity(),
            debug: false,
        }
    }
}

mod defaults {
    use std::time::Duration;

    use super::{SystemTime, UNIX_EPOCH};

    pub fn output() -> String {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("parley_{stamp}.json")
    }
    pub fn interface() -> String {
        "ens8".to_string()
    }
    pub fn handshakes() -> Vec<String> {
        vec!["http".to_string()]
    }
    pub fn workers() -> usize {
        1
    }
    pub fn timeout() -> Duration {
        Duration::from_secs(5)
    }
    pub fn retransmit_interval() -> Duration {
        Duration::from_secs(1)
    }
    pub fn retransmit_count() -> u32 {
        1
    }
    pub fn channel_capacity() -> usize {
        100_000
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl Conf {
    /// Defaults, then the config file (if any), then `PARLEY_*`
    /// environment, then CLI flags.
    pub fn load(cli: &Cli) -> Result<Conf, ConfError> {
        let mut figment = Figment::from(Serialized::defaults(Conf::default()));
        if let Some(path) = &cli.config {
            figment = figment.merge(Yaml::file(path));
        }
        let mut conf: Conf = figment
            .merge(Env::prefixed("PARLEY_"))
            .extract()
            .map_err(Box::new)?;
        conf.apply_cli(cli);
        Ok(conf)
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(output) = &cli.output {
            self.output = output.clone();
        }
        if cli.send_syns {
            self.send_syns = true;
        }
        if let Some(ip) = cli.source_ip {
            self.source_ip = Some(ip);
        }
        if let Some(iface) = &cli.interface {
            self.interface = iface.clone();
        }
        if let Some(mac) = &cli.gateway_mac {
            self.gateway_mac = Some(mac.clone());
        }
        if let Some(handshakes) = &cli.handshakes {
            self.handshakes = handshakes.clone();
        }
        if let Some(priority) = &cli.priority_fingerprint {
            self.priority_fingerprint = priority.clone();
        }
        if let Some(workers) = cli.workers {
            self.workers = workers;
        }
        if let Some(secs) = cli.timeout {
            self.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = cli.retransmit_interval {
            self.retransmit_interval = Duration::from_secs(secs);
        }
        if let Some(n) = cli.retransmit_count {
            self.retransmit_count = n;
        }
        if let Some(n) = cli.haf {
            self.haf = n;
        }
        if cli.force_all_handshakes {
            self.force_all_handshakes = true;
        }
        if cli.push_data_only {
            self.push_data_only = true;
        }
        if cli.debug {
            self.debug = true;
        }
    }

    /// Fails fast on anything the run could not recover from later.
    pub fn validate(&mut self, registry: &HandshakeRegistry) -> Result<(), ConfError> {
        if self.handshakes.is_empty() {
            return Err(ConfError::NoHandshakes);
        }
        for name in &self.handshakes {
            if !registry.contains(name) {
                return Err(ConfError::UnknownHandshake(name.clone()));
            }
        }
        for name in &self.priority_fingerprint {
            if !registry.contains(name) {
                return Err(ConfError::UnknownHandshake(name.clone()));
            }
        }

        if self.send_syns {
            if self.source_ip.is_none() {
                return Err(ConfError::MissingSourceIp);
            }
            if self.gateway_mac.is_none() {
                return Err(ConfError::MissingGatewayMac);
            }
        }

        // Forcing every handshake makes the escalation-time firewall
        // probes meaningless noise.
        if self.force_all_handshakes {
            self.haf = 0;
        }

        self.workers = self.workers.max(1);
        Ok(())
    }

    /// Priority order used when several classifiers match: the explicit
    /// list when configured, the handshake order otherwise.
    pub fn fingerprint_priority(&self) -> Vec<String> {
        if self.priority_fingerprint.is_empty() {
            self.handshakes.clone()
        } else {
            self.priority_fingerprint.clone()
        }
    }

    /// Flow-table-stable interval after which the run is declared stuck.
    pub fn stall_interval(&self) -> Duration {
        self.timeout * (self.handshakes.len() as u32).max(1) * 2
    }
}

/// Parses `xx:xx:xx:xx:xx:xx`.
pub fn parse_mac(mac: &str) -> Result<[u8; 6], ConfError> {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(ConfError::BadGatewayMac(mac.to_string()));
    }
    let mut out = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        out[i] =
            u8::from_str_radix(part, 16).map_err(|_| ConfError::BadGatewayMac(mac.to_string()))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;
    use crate::runtime::cli::Cli;

    #[test]
    fn defaults_are_sane() {
        let conf = Conf::default();
        assert_eq!(conf.handshakes, vec!["http"]);
        assert_eq!(conf.workers, 1);
        assert_eq!(conf.timeout, Duration::from_secs(5));
        assert_eq!(conf.retransmit_interval, Duration::from_secs(1));
        assert_eq!(conf.retransmit_count, 1);
        assert_eq!(conf.haf, 0);
        assert!(conf.output.starts_with("parley_"));
    }

    #[test]
    fn file_env_and_cli_layer_in_order() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "parley.yaml",
                r#"
                interface: file0
                workers: 2
                timeout: 9
                "#,
            )?;
            jail.set_env("PARLEY_WORKERS", "3");

            let mut cli = Cli::default();
            cli.config = Some("parley.yaml".into());
            cli.timeout = Some(7);

            let conf = Conf::load(&cli).unwrap();
            assert_eq!(conf.interface, "file0"); // file beats default
            assert_eq!(conf.workers, 3); // env beats file
            assert_eq!(conf.timeout, Duration::from_secs(7)); // cli beats all
            Ok(())
        });
    }

    #[test]
    fn unknown_handshake_fails_validation() {
        let registry = HandshakeRegistry::builtin();
        let mut conf = Conf::default();
        conf.handshakes = vec!["http".into(), "gopher".into()];
        assert!(matches!(
            conf.validate(&registry),
            Err(ConfError::UnknownHandshake(name)) if name == "gopher"
        ));
    }

    #[test]
    fn active_mode_requires_source_and_gateway() {
        let registry = HandshakeRegistry::builtin();
        let mut conf = Conf::default();
        conf.send_syns = true;
        assert!(matches!(
            conf.validate(&registry),
            Err(ConfError::MissingSourceIp)
        ));

        conf.source_ip = Some("10.0.0.2".parse().unwrap());
        assert!(matches!(
            conf.validate(&registry),
            Err(ConfError::MissingGatewayMac)
        ));

        conf.gateway_mac = Some("aa:bb:cc:dd:ee:ff".into());
        assert!(conf.validate(&registry).is_ok());
    }

    #[test]
    fn force_all_handshakes_disables_haf() {
        let registry = HandshakeRegistry::builtin();
        let mut conf = Conf::default();
        conf.haf = 5;
        conf.force_all_handshakes = true;
        conf.validate(&registry).unwrap();
        assert_eq!(conf.haf, 0);
    }

    #[test]
    fn priority_defaults_to_handshake_order() {
        let mut conf = Conf::default();
        conf.handshakes = vec!["http".into(), "tls".into()];
        assert_eq!(conf.fingerprint_priority(), vec!["http", "tls"]);

        conf.priority_fingerprint = vec!["tls".into()];
        assert_eq!(conf.fingerprint_priority(), vec!["tls"]);
    }

    #[test]
    fn stall_interval_scales_with_handshakes() {
        let mut conf = Conf::default();
        conf.timeout = Duration::from_secs(5);
        conf.handshakes = vec!["http".into(), "tls".into()];
        assert_eq!(conf.stall_interval(), Duration::from_secs(20));
    }

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:ff").unwrap(),
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]
        );
        assert!(parse_mac("aa:bb:cc").is_err());
        assert!(parse_mac("aa:bb:cc:dd:ee:zz").is_err());
    }
}
