//! Shared CLI helpers for the master and slave daemons

use clap::Parser;
use std::path::PathBuf;

/// Master daemon options
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "dftpd master - merged directory tree over many storage slaves")]
pub struct MasterOpts {
    /// Configuration file (TOML); defaults apply when absent
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Client control address (host:port), overrides the config file
    #[arg(long)]
    pub bind: Option<String>,

    /// Slave link address (host:port), overrides the config file
    #[arg(long)]
    pub slave_bind: Option<String>,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Slave daemon options
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "dftpd slave - storage backend for a dftpd master")]
pub struct SlaveOpts {
    /// Master slave-link address (host:port)
    #[arg(long, default_value = "127.0.0.1:2122")]
    pub master: String,

    /// Unique slave name
    #[arg(long)]
    pub name: String,

    /// Root directory holding this slave's files
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Address advertised to clients for passive data connections
    #[arg(long)]
    pub pasv_address: Option<String>,

    /// Certificate for encrypted data channels (self-signed if absent)
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Private key matching --tls-cert
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Initialise the `log` backend for a daemon
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_millis()
        .try_init();
}
