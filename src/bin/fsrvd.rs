use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fsrv::cli::DaemonOpts;
use fsrv::net::Server;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    let default_level = if opts.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .compact()
        .init();

    let config = opts.into_config()?;
    let logger = config.open_logger()?;
    let server = Server::bind(&config, logger)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %server.local_addr(),
        threads = config.threads,
        queue = config.queue_capacity,
        "starting fsrvd"
    );
    if config.bind.is_unspecified() {
        tracing::warn!("binding to all interfaces; the protocol has no encryption or authentication");
    }

    // Ctrl-C only flips the running flag; run() drains workers and returns
    let state = server.state();
    ctrlc::set_handler(move || {
        if state.shutdown() {
            tracing::info!("interrupt received, shutting down");
        }
    })
    .context("install Ctrl-C handler")?;

    server.run()
}
