//! Daemon configuration, loaded from TOML.
//!
//! ```toml
//! bind = "0.0.0.0:4585"
//! partitions = ["/var/backup"]
//!
//! [replication]
//! retention_levels = [1, 2, 3, 4, 5, 6, 7, 14, 21, 28, 31, 61, 92]
//! log_dirs = ["/var/log", "/www/*/var/log"]
//!
//! [[replication.database_servers]]
//! name = "main"
//! version = "5.7"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_BIND: &str = "0.0.0.0:4585";

pub const DEFAULT_RETENTION_LEVELS: &[u32] = &[
    1, 2, 3, 4, 5, 6, 7, 14, 21, 28, 31, 61, 92, 183, 365, 730, 1095, 1825, 3650,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseServer {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl DatabaseServer {
    pub fn label(&self) -> String {
        if self.version.is_empty() {
            self.name.clone()
        } else {
            format!("{} ({})", self.name, self.version)
        }
    }
}

/// Settings consumed by the replication engine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Tier boundaries in days for backup rotation.
    pub retention_levels: Vec<u32>,
    /// Directories whose files are rotated logs.
    pub log_dirs: Vec<String>,
    /// Files whose mtime does not reflect content changes.
    pub encrypted_images: Vec<String>,
    /// Additional paths never deleted during directory cleanup.
    pub protected: Vec<String>,
    pub database_servers: Vec<DatabaseServer>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            retention_levels: DEFAULT_RETENTION_LEVELS.to_vec(),
            log_dirs: vec![
                "/var/log".into(),
                "/www/*/var/log".into(),
                "/wwwgroup/*/var/log".into(),
                "/opt/*/var/log".into(),
            ],
            encrypted_images: vec![
                "/ao.aes128.img".into(),
                "/ao.aes256.img".into(),
                "/ao.copy.aes128.img".into(),
                "/ao.copy.aes256.img".into(),
            ],
            protected: Vec::new(),
            database_servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub bind: String,
    /// Backup partitions sessions may target.
    pub partitions: Vec<PathBuf>,
    /// Append a pass record to `<partition>/.failover-journal.jsonl`.
    pub journal: bool,
    pub replication: ReplicationConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            partitions: Vec::new(),
            journal: true,
            replication: ReplicationConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(text)?;
        config.replication.retention_levels.sort_unstable();
        config.replication.retention_levels.dedup();
        Ok(config)
    }

    /// `partition` is one of the enabled partitions.
    pub fn partition_enabled(&self, partition: &Path) -> bool {
        self.partitions.iter().any(|p| p == partition)
    }
}
