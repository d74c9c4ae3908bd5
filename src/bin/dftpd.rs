use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;

use dftpd::cli::{init_logging, MasterOpts};
use dftpd::config::Config;
use dftpd::session::{serve_clients, Context};
use dftpd::{tls, ReconciliationDriver};

fn main() -> Result<()> {
    let opts = MasterOpts::parse();
    init_logging(opts.verbose);

    let mut config = match &opts.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(bind) = opts.bind {
        config.bind = bind;
    }
    if let Some(slave_bind) = opts.slave_bind {
        config.slave_bind = slave_bind;
    }

    println!("Starting dftpd master:");
    println!("  Clients: {}", config.bind);
    println!("  Slaves:  {}", config.slave_bind);
    if !config.sections.is_empty() {
        println!("  Sections: {}", config.sections.keys().cloned().collect::<Vec<_>>().join(", "));
    }

    let mut ctx = Context::new(config.clone());
    if config.tls_enabled || config.tls_cert.is_some() {
        let dir = tls::config_dir();
        if let Some(cert) = &config.tls_cert {
            println!("  TLS: {}", cert.display());
        } else {
            println!("  TLS: self-signed certificate in {}", dir.display());
        }
        let server_cfg =
            tls::load_or_generate_server_config(config.tls_cert.clone(), config.tls_key.clone(), &dir)
                .context("Failed to set up TLS configuration")?;
        ctx = ctx.with_tls(tls::acceptor(server_cfg));
    } else {
        println!("  TLS: disabled (AUTH TLS will be refused)");
    }
    let ctx = Arc::new(ctx);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        let clients = TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("bind {}", config.bind))?;
        let slaves = TcpListener::bind(&config.slave_bind)
            .await
            .with_context(|| format!("bind {}", config.slave_bind))?;

        let driver = Arc::new(ReconciliationDriver::new(ctx.clone()));
        let slave_task = tokio::spawn(driver.clone().serve_slaves(slaves));
        let maintenance = tokio::spawn(driver.run_maintenance());
        let client_task = tokio::spawn(serve_clients(ctx, clients));

        tokio::select! {
            r = slave_task => error!("slave listener stopped: {:?}", r),
            r = client_task => error!("client listener stopped: {:?}", r),
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
        }
        maintenance.abort();
        Ok(())
    })
}
