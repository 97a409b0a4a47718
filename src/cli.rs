//! Command-line options for failoverd

use anyhow::Result;
use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::DaemonConfig;

/// Failover and dated-backup replication daemon
#[derive(Clone, Debug, Parser)]
#[command(name = "failoverd", version)]
pub struct DaemonOpts {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address (host:port); overrides the configuration
    #[arg(long)]
    pub bind: Option<String>,

    /// Enable a backup partition (repeatable); added to the configured ones
    #[arg(long = "partition", value_name = "DIR")]
    pub partitions: Vec<PathBuf>,

    /// Do not append pass records to the partition journal
    #[arg(long)]
    pub no_journal: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl DaemonOpts {
    /// Configuration file (or defaults) with the command-line overrides applied.
    pub fn resolve_config(&self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)?,
            None => DaemonConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        for partition in &self.partitions {
            if !config.partition_enabled(partition) {
                config.partitions.push(partition.clone());
            }
        }
        if self.no_journal {
            config.journal = false;
        }
        Ok(config)
    }

    /// Default filter directive when `RUST_LOG` is unset.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let opts = DaemonOpts::parse_from([
            "failoverd",
            "--bind",
            "127.0.0.1:9000",
            "--partition",
            "/backup/a",
            "--partition",
            "/backup/b",
            "-vv",
        ]);
        let config = opts.resolve_config().unwrap();
        assert_eq!(config.bind, "127.0.0.1:9000");
        assert_eq!(config.partitions, vec![PathBuf::from("/backup/a"), PathBuf::from("/backup/b")]);
        assert!(config.journal);
        assert_eq!(opts.log_level(), "trace");
    }

    #[test]
    fn test_defaults() {
        let opts = DaemonOpts::parse_from(["failoverd"]);
        let config = opts.resolve_config().unwrap();
        assert_eq!(config.bind, crate::config::DEFAULT_BIND);
        assert!(config.partitions.is_empty());
        assert_eq!(opts.log_level(), "info");
    }
}
