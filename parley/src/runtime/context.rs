use std::sync::Arc;

use clap::Parser;

use crate::handshake::HandshakeRegistry;
use crate::runtime::cli::Cli;
use crate::runtime::conf::{parse_mac, Conf, ConfError};

/// Everything startup produces before the pipeline is wired: the merged
/// and validated configuration, the probe registry, and the parsed
/// gateway MAC (if configured).
pub struct Context {
    pub conf: Arc<Conf>,
    pub registry: Arc<HandshakeRegistry>,
    pub gateway_mac: Option<[u8; 6]>,
}

impl Context {
    pub fn new() -> Result<Context, ConfError> {
        let cli = Cli::parse();
        Context::from_cli(&cli)
    }

    pub fn from_cli(cli: &Cli) -> Result<Context, ConfError> {
        let registry = HandshakeRegistry::builtin();
        let mut conf = Conf::load(cli)?;
        conf.validate(&registry)?;

        let gateway_mac = conf.gateway_mac.as_deref().map(parse_mac).transpose()?;

        Ok(Context {
            conf: Arc::new(conf),
            registry: Arc::new(registry),
            gateway_mac,
        })
    }
}
