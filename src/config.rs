//! CLI configuration: every flag in spec.md's External Interfaces
//! section, parsed with `clap`'s derive API the way `wolfdisk/src/main.rs`
//! parses its own `Cli`. There is no config file layer here: the original
//! implementation is itself CLI-only.

use crate::error::{Error, Result};
use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;

const DEFAULT_CLIENT_PORT: u16 = 12000;
const DEFAULT_NODE_PORT: u16 = 12001;
const DEFAULT_CONSOLE_PORT: u16 = 12002;

#[derive(Parser, Debug, Clone)]
#[command(name = "magmad")]
#[command(author = "Wolf Software Systems Ltd")]
#[command(version = "0.1.0")]
#[command(about = "MAGMA distributed filesystem node daemon", long_about = None)]
pub struct Cli {
    /// Directory holding this node's flare contents and catalog file.
    #[arg(long)]
    pub hashpath: PathBuf,

    /// This node's identifier on the ring. Defaults to the local hostname.
    #[arg(long)]
    pub nickname: Option<String>,

    /// Shared secret compared by equality to authorize joins.
    #[arg(long)]
    pub secretkey: String,

    /// Create a new single-node ring owning the whole keyspace.
    #[arg(long, default_value_t = false)]
    pub bootstrap: bool,

    /// Join an existing ring through this node's `ip:port`.
    #[arg(long)]
    pub bootserver: Option<String>,

    /// This node's advertised IP address.
    #[arg(long, default_value = "127.0.0.1")]
    pub ip: Ipv4Addr,

    /// Client-protocol UDP port.
    #[arg(long, default_value_t = DEFAULT_CLIENT_PORT)]
    pub port: u16,

    /// Fully-qualified domain name advertised in this node's profile.
    #[arg(long)]
    pub fqdn: Option<String>,

    /// Advertised bandwidth figure (arbitrary unit, used only for the
    /// reported node profile).
    #[arg(long, default_value_t = 0)]
    pub bandwidth: u64,

    /// Advertised storage capacity in bytes.
    #[arg(long, default_value_t = 0)]
    pub storage: u64,

    /// Per-channel debug mask, e.g. `router,transport`.
    #[arg(long)]
    pub debug: Option<String>,
}

/// Resolved, validated configuration for this process.
#[derive(Debug, Clone)]
pub struct Config {
    pub hashpath: PathBuf,
    pub nickname: String,
    pub secretkey: String,
    pub join: JoinMode,
    pub ip: Ipv4Addr,
    pub client_port: u16,
    pub node_port: u16,
    pub console_port: u16,
    pub fqdn: String,
    pub bandwidth: u64,
    pub storage: u64,
    pub debug_channels: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum JoinMode {
    Bootstrap,
    Join(std::net::SocketAddrV4),
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Config> {
        let join = match (cli.bootstrap, &cli.bootserver) {
            (true, Some(_)) => {
                return Err(Error::Config("--bootstrap and --bootserver are mutually exclusive".to_string()))
            }
            (true, None) => JoinMode::Bootstrap,
            (false, Some(addr)) => {
                let socket: std::net::SocketAddrV4 = addr
                    .parse()
                    .map_err(|_| Error::Config(format!("--bootserver {addr} is not a valid host:port")))?;
                JoinMode::Join(socket)
            }
            (false, None) => {
                return Err(Error::Config("one of --bootstrap or --bootserver is required".to_string()))
            }
        };

        let nickname = cli.nickname.unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "magmad".to_string())
        });
        let fqdn = cli.fqdn.unwrap_or_else(|| nickname.clone());
        let debug_channels = cli
            .debug
            .map(|s| s.split(',').map(|c| c.trim().to_string()).filter(|c| !c.is_empty()).collect())
            .unwrap_or_default();

        Ok(Config {
            hashpath: cli.hashpath,
            nickname,
            secretkey: cli.secretkey,
            join,
            ip: cli.ip,
            client_port: cli.port,
            node_port: DEFAULT_NODE_PORT,
            console_port: DEFAULT_CONSOLE_PORT,
            fqdn,
            bandwidth: cli.bandwidth,
            storage: cli.storage,
            debug_channels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            hashpath: PathBuf::from("/tmp/magma"),
            nickname: Some("a".to_string()),
            secretkey: "s".to_string(),
            bootstrap: false,
            bootserver: None,
            ip: Ipv4Addr::LOCALHOST,
            port: DEFAULT_CLIENT_PORT,
            fqdn: None,
            bandwidth: 0,
            storage: 0,
            debug: None,
        }
    }

    #[test]
    fn bootstrap_and_bootserver_together_is_a_config_error() {
        let mut cli = base_cli();
        cli.bootstrap = true;
        cli.bootserver = Some("127.0.0.1:12001".to_string());
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn neither_bootstrap_nor_bootserver_is_a_config_error() {
        assert!(Config::from_cli(base_cli()).is_err());
    }

    #[test]
    fn fqdn_defaults_to_nickname() {
        let mut cli = base_cli();
        cli.bootstrap = true;
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.fqdn, "a");
    }

    #[test]
    fn debug_channels_split_on_comma() {
        let mut cli = base_cli();
        cli.bootstrap = true;
        cli.debug = Some("router, transport".to_string());
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.debug_channels, vec!["router", "transport"]);
    }
}
