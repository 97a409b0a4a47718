//! What each running session is doing right now.
//!
//! Owned by the server and shared with sessions; readers only ever get
//! copies.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub session_id: Uuid,
    pub source: String,
    pub started: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Last primitive performed, e.g. `"receive /etc/passwd"`.
    pub action: String,
}

#[derive(Debug, Clone, Default)]
pub struct ActivityRegistry {
    inner: Arc<Mutex<HashMap<i32, Activity>>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its failover id. A stale entry for the same
    /// id is replaced.
    pub fn begin(&self, failover_id: i32, source: &str) -> ActivityHandle {
        let now = Utc::now();
        let session_id = Uuid::new_v4();
        self.inner.lock().insert(
            failover_id,
            Activity {
                session_id,
                source: source.to_string(),
                started: now,
                updated: now,
                action: "starting".to_string(),
            },
        );
        ActivityHandle {
            registry: self.clone(),
            failover_id,
            session_id,
        }
    }

    pub fn get(&self, failover_id: i32) -> Option<Activity> {
        self.inner.lock().get(&failover_id).cloned()
    }

    pub fn snapshot(&self) -> HashMap<i32, Activity> {
        self.inner.lock().clone()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }
}

/// Live entry of one session; removed from the registry on drop.
#[derive(Debug)]
pub struct ActivityHandle {
    registry: ActivityRegistry,
    failover_id: i32,
    session_id: Uuid,
}

impl ActivityHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn record(&self, action: &str, path: &str) {
        let mut map = self.registry.inner.lock();
        if let Some(entry) = map.get_mut(&self.failover_id) {
            if entry.session_id == self.session_id {
                entry.action = format!("{} {}", action, path);
                entry.updated = Utc::now();
            }
        }
    }
}

impl Drop for ActivityHandle {
    fn drop(&mut self) {
        let mut map = self.registry.inner.lock();
        // A newer session for the same id keeps its entry
        if map
            .get(&self.failover_id)
            .is_some_and(|a| a.session_id == self.session_id)
        {
            map.remove(&self.failover_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_drop() {
        let registry = ActivityRegistry::new();
        let handle = registry.begin(7, "web1");
        handle.record("receive", "/etc/passwd");
        let entry = registry.get(7).unwrap();
        assert_eq!(entry.action, "receive /etc/passwd");
        assert_eq!(entry.source, "web1");
        assert_eq!(entry.session_id, handle.session_id());

        drop(handle);
        assert!(registry.get(7).is_none());
    }

    #[test]
    fn test_stale_handle_does_not_clobber_newer_session() {
        let registry = ActivityRegistry::new();
        let old = registry.begin(1, "a");
        let new = registry.begin(1, "a");
        old.record("stat", "/x");
        assert_eq!(registry.get(1).unwrap().action, "starting");
        drop(old);
        assert!(registry.get(1).is_some());
        drop(new);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_json_snapshot() {
        let registry = ActivityRegistry::new();
        let _h = registry.begin(3, "db1");
        let json = registry.to_json().unwrap();
        let parsed: HashMap<i32, Activity> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[&3].source, "db1");
    }
}
