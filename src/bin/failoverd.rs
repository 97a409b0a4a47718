use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use failover::cli::DaemonOpts;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(opts.log_level()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let config = opts.resolve_config()?;
    if config.partitions.is_empty() {
        anyhow::bail!("no partitions enabled; pass --partition or list them in the configuration");
    }
    for partition in &config.partitions {
        if !partition.is_dir() {
            warn!(partition = %partition.display(), "partition does not exist yet");
        }
    }
    info!(bind = %config.bind, partitions = ?config.partitions, journal = config.journal, "starting failoverd");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(failover::server::serve(config))
}
