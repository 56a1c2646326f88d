//! Configuration for registryd

use clap::{Parser, ValueEnum};
use registry_net::crypto::{SecretKey, DEFAULT_KEY};
use registry_net::{NetworkMode, NodeName, TransportConfig};
use std::net::SocketAddr;
use std::time::Duration;

/// registryd - gossip-propagated service registry
#[derive(Parser, Debug, Clone)]
#[command(name = "registryd")]
#[command(about = "Gossip-propagated, eventually consistent service registry daemon")]
pub struct Config {
    /// Gossip bind address (port 0 picks a free port)
    #[arg(short, long, env = "REGISTRY_BIND", default_value = "0.0.0.0:7946")]
    pub bind: SocketAddr,

    /// Address advertised to peers (defaults to the bound address)
    #[arg(long, env = "REGISTRY_ADVERTISE")]
    pub advertise: Option<SocketAddr>,

    /// Seed members to join (comma-separated addresses)
    #[arg(long, env = "REGISTRY_JOIN", value_delimiter = ',')]
    pub join: Vec<SocketAddr>,

    /// Network profile selecting gossip timings
    #[arg(long, value_enum, default_value = "wan")]
    pub mode: Mode,

    /// Seal gossip frames with a shared secret
    #[arg(long)]
    pub secure: bool,

    /// Shared secret (16, 24 or 32 bytes), used with --secure
    #[arg(long, env = "REGISTRY_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Expiry sweep interval in milliseconds
    #[arg(long, default_value = "1000")]
    pub expiry_tick_ms: u64,

    /// Broadcast retransmit multiplier
    #[arg(long, default_value = "3")]
    pub retransmit_mult: usize,

    /// Node name (defaults to <hostname>-<random hex>)
    #[arg(long)]
    pub name: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

/// Network profile
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Local,
    Lan,
    Wan,
}

impl From<Mode> for NetworkMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Local => NetworkMode::Local,
            Mode::Lan => NetworkMode::Lan,
            Mode::Wan => NetworkMode::Wan,
        }
    }
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(key) = &self.secret_key {
            if !self.secure {
                anyhow::bail!("--secret-key requires --secure");
            }
            if !matches!(key.len(), 16 | 24 | 32) {
                anyhow::bail!(
                    "Secret key must be 16, 24 or 32 bytes, got {}",
                    key.len()
                );
            }
        }
        if self.expiry_tick_ms == 0 {
            anyhow::bail!("Expiry tick must be positive");
        }
        if self.retransmit_mult == 0 {
            anyhow::bail!("Retransmit multiplier must be positive");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        if self.name.as_deref() == Some("") {
            anyhow::bail!("Node name cannot be empty");
        }
        Ok(())
    }

    /// Resolve into the options a [`Server`](crate::Server) is built from
    pub fn options(&self) -> anyhow::Result<RegistryOptions> {
        self.validate()?;

        let secret_key = if self.secure {
            let key = self
                .secret_key
                .as_deref()
                .map(str::as_bytes)
                .unwrap_or(DEFAULT_KEY);
            Some(SecretKey::new(key)?)
        } else {
            None
        };

        let name = match &self.name {
            Some(name) => NodeName(name.clone()),
            None => default_node_name(),
        };

        Ok(RegistryOptions {
            name,
            mode: self.mode.into(),
            bind_addr: self.bind,
            advertise_addr: self.advertise,
            seeds: self.join.clone(),
            secret_key,
            expiry_tick: Duration::from_millis(self.expiry_tick_ms),
            retransmit_mult: self.retransmit_mult,
        })
    }
}

/// Everything needed to run one registry node
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub name: NodeName,
    pub mode: NetworkMode,
    pub bind_addr: SocketAddr,
    pub advertise_addr: Option<SocketAddr>,
    /// Members contacted on startup
    pub seeds: Vec<SocketAddr>,
    pub secret_key: Option<SecretKey>,
    pub expiry_tick: Duration,
    pub retransmit_mult: usize,
}

impl RegistryOptions {
    /// Defaults for a network profile, bound to `bind_addr`
    pub fn new(mode: NetworkMode, bind_addr: SocketAddr) -> Self {
        Self {
            name: default_node_name(),
            mode,
            bind_addr,
            advertise_addr: None,
            seeds: Vec::new(),
            secret_key: None,
            expiry_tick: Duration::from_secs(1),
            retransmit_mult: 3,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        let mut config = TransportConfig::new(self.mode, self.name.clone(), self.bind_addr);
        config.advertise_addr = self.advertise_addr;
        config.secret_key = self.secret_key.clone();
        config
    }
}

/// `<hostname>-<random hex>`
fn default_node_name() -> NodeName {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "registry".to_string());
    NodeName::generate(&host)
}
