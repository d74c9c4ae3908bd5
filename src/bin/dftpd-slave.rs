use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use dftpd::cli::{init_logging, SlaveOpts};
use dftpd::slave::server::SlaveServer;
use dftpd::tls;

fn main() -> Result<()> {
    let opts = SlaveOpts::parse();
    init_logging(opts.verbose);

    if !opts.root.is_dir() {
        anyhow::bail!("Error: Root path is not a directory: {}", opts.root.display());
    }
    let advertise: IpAddr = match &opts.pasv_address {
        Some(a) => a
            .parse()
            .with_context(|| format!("invalid --pasv-address {}", a))?,
        None => IpAddr::from([127, 0, 0, 1]),
    };

    // certificates live per slave name so several slaves can share a host
    let dir = tls::config_dir().join(&opts.name);
    let tls_config = tls::load_or_generate_server_config(opts.tls_cert.clone(), opts.tls_key.clone(), &dir)
        .context("Failed to set up TLS configuration")?;

    let server = Arc::new(SlaveServer::new(&opts.root, advertise, Some(tls::acceptor(tls_config)))?);
    println!("Starting dftpd slave {}:", opts.name);
    println!("  Root:   {}", server.root().display());
    println!("  Master: {}", opts.master);
    println!("  Passive address: {}", advertise);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(server.run(&opts.master, &opts.name))
}
