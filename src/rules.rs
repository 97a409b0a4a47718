//! Path rules consulted during reconciliation and cleanup.
//!
//! Patterns are absolute, `/`-separated, and may use `*` wildcards inside a
//! segment (`/www/*/var/log`, `/var/lib/mysql/main/*.pid`).

use crate::config::{DatabaseServer, ReplicationConfig};

/// Directories that are mount points for pseudo filesystems on the source.
const PSEUDO_FILESYSTEMS: &[&str] = &["/proc", "/sys", "/selinux", "/dev/pts", "/dev/shm"];

/// Files a running standby database keeps in its data directory.
const DATABASE_RUNTIME_FILES: &[&str] = &[
    "*.pid",
    "*.sock",
    "*-relay-bin.*",
    "relay-log.info",
    "master.info",
];

/// Wildcard matching within one path segment (supports any number of `*`).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };
    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        return true;
    };
    for part in middle {
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// Number of leading segments of `path` matched by `pattern`, if the whole
/// pattern matches a prefix of the path.
fn matched_prefix(pattern: &str, path: &str) -> Option<usize> {
    let mut pat = pattern.split('/').filter(|s| !s.is_empty());
    let mut segs = path.split('/').filter(|s| !s.is_empty());
    let mut n = 0;
    loop {
        match (pat.next(), segs.next()) {
            (None, _) => return Some(n),
            (Some(_), None) => return None,
            (Some(p), Some(s)) => {
                if !glob_match(p, s) {
                    return None;
                }
                n += 1;
            }
        }
    }
}

/// `path` equals a path matched by `pattern`.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let depth = path.split('/').filter(|s| !s.is_empty()).count();
    matched_prefix(pattern, path) == Some(depth)
}

/// `path` is matched by `pattern` or lies below such a path.
pub fn path_within(pattern: &str, path: &str) -> bool {
    matched_prefix(pattern, path).is_some()
}

fn database_data_dir(server: &DatabaseServer) -> String {
    format!("/var/lib/mysql/{}", server.name)
}

/// Rules in effect for one session.
#[derive(Debug, Clone, Default)]
pub struct PathRules {
    protected: Vec<String>,
    log_dirs: Vec<String>,
    encrypted_images: Vec<String>,
    /// (data directory, server label) pairs watched for restarts.
    restart_watch: Vec<(String, String)>,
}

impl PathRules {
    pub fn for_session(config: &ReplicationConfig, failover: bool) -> Self {
        let mut protected: Vec<String> = PSEUDO_FILESYSTEMS.iter().map(|p| p.to_string()).collect();
        protected.extend(config.protected.iter().cloned());
        let mut restart_watch = Vec::new();
        if failover {
            for server in &config.database_servers {
                let dir = database_data_dir(server);
                for file in DATABASE_RUNTIME_FILES {
                    protected.push(format!("{}/{}", dir, file));
                }
                restart_watch.push((dir, server.label()));
            }
        }
        Self {
            protected,
            log_dirs: config.log_dirs.clone(),
            encrypted_images: config.encrypted_images.clone(),
            restart_watch,
        }
    }

    /// Never delete this path (or anything under it) during cleanup.
    pub fn is_protected(&self, path: &str) -> bool {
        self.protected.iter().any(|p| path_within(p, path))
    }

    /// Files directly or indirectly in `dir` are rotated logs.
    pub fn is_log_dir(&self, dir: &str) -> bool {
        self.log_dirs.iter().any(|p| path_within(p, dir))
    }

    /// Content changes of this file are not reflected in its mtime.
    pub fn is_encrypted_image(&self, path: &str) -> bool {
        self.encrypted_images.iter().any(|p| path_matches(p, path))
    }

    /// Server that must be restarted when `path` changes.
    pub fn restart_target(&self, path: &str) -> Option<&str> {
        self.restart_watch
            .iter()
            .find(|(dir, _)| path_within(dir, path))
            .map(|(_, label)| label.as_str())
    }
}
