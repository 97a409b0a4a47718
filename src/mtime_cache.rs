//! (mtime, size) index of a directory's regular files.
//!
//! Rotating logs get renamed on the source (`messages` -> `messages.1`) without
//! their content changing; looking a record's (mtime, size) up here finds the
//! already-transferred copy under its old name.

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::ffi::{OsStr, OsString};
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};

use crate::fsops;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModifyTimeAndSize {
    pub mtime_ms: i64,
    pub size: u64,
}

impl ModifyTimeAndSize {
    pub fn new(mtime_ms: i64, size: u64) -> Self {
        Self { mtime_ms, size }
    }

    pub fn of(meta: &Metadata) -> Self {
        Self {
            mtime_ms: fsops::mtime_ms(meta),
            size: meta.len(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ModifyTimeAndSizeCache {
    by_name: HashMap<OsString, ModifyTimeAndSize>,
    by_key: HashMap<ModifyTimeAndSize, BTreeSet<OsString>>,
}

impl ModifyTimeAndSizeCache {
    /// Index the regular files directly inside `dir`.
    pub fn build(dir: &Path) -> Result<Self> {
        let mut cache = Self::default();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(cache),
            Err(e) => return Err(e).with_context(|| format!("list {}", dir.display())),
        };
        for entry in entries {
            let entry = entry?;
            // DirEntry::metadata does not follow symlinks
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if meta.is_file() {
                cache.insert(entry.file_name(), ModifyTimeAndSize::of(&meta));
            }
        }
        Ok(cache)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn get(&self, name: &OsStr) -> Option<ModifyTimeAndSize> {
        self.by_name.get(name).copied()
    }

    /// All files with exactly this mtime and size, in name order.
    pub fn names(&self, key: ModifyTimeAndSize) -> impl Iterator<Item = &OsStr> {
        self.by_key
            .get(&key)
            .into_iter()
            .flat_map(|names| names.iter().map(|n| n.as_os_str()))
    }

    pub fn find(&self, key: ModifyTimeAndSize) -> Option<&OsStr> {
        self.names(key).next()
    }

    pub fn insert(&mut self, name: OsString, key: ModifyTimeAndSize) {
        self.remove(&name);
        self.by_key.entry(key).or_default().insert(name.clone());
        self.by_name.insert(name, key);
    }

    pub fn remove(&mut self, name: &OsStr) -> Option<ModifyTimeAndSize> {
        let key = self.by_name.remove(name)?;
        if let Some(names) = self.by_key.get_mut(&key) {
            names.remove(name);
            if names.is_empty() {
                self.by_key.remove(&key);
            }
        }
        Some(key)
    }

    pub fn rename(&mut self, from: &OsStr, to: OsString) {
        if let Some(key) = self.remove(from) {
            self.insert(to, key);
        } else {
            self.remove(&to);
        }
    }
}

/// Caches of the directories touched by a session, keyed by on-disk path.
#[derive(Debug, Default)]
pub struct MtimeCaches {
    caches: HashMap<PathBuf, ModifyTimeAndSizeCache>,
}

fn split(path: &Path) -> Option<(&Path, &OsStr)> {
    Some((path.parent()?, path.file_name()?))
}

impl MtimeCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache for `dir`, listing the directory on first use.
    pub fn get_or_build(&mut self, dir: &Path) -> Result<&mut ModifyTimeAndSizeCache> {
        if !self.caches.contains_key(dir) {
            let cache = ModifyTimeAndSizeCache::build(dir)?;
            self.caches.insert(dir.to_path_buf(), cache);
        }
        self.caches
            .get_mut(dir)
            .context("cache vanished right after insertion")
    }

    pub fn is_loaded(&self, dir: &Path) -> bool {
        self.caches.contains_key(dir)
    }

    pub fn evict(&mut self, dir: &Path) {
        self.caches.remove(dir);
    }

    // The note_* helpers keep already-built caches in step with changes made
    // to their directory; unbuilt caches will see the change when listed.

    pub fn note_added(&mut self, path: &Path, key: ModifyTimeAndSize) {
        if let Some((dir, name)) = split(path) {
            if let Some(cache) = self.caches.get_mut(dir) {
                cache.insert(name.to_os_string(), key);
            }
        }
    }

    pub fn note_removed(&mut self, path: &Path) {
        if let Some((dir, name)) = split(path) {
            if let Some(cache) = self.caches.get_mut(dir) {
                cache.remove(name);
            }
        }
    }

    pub fn note_renamed(&mut self, from: &Path, to: &Path) {
        match (split(from), split(to)) {
            (Some((from_dir, from_name)), Some((to_dir, to_name))) if from_dir == to_dir => {
                if let Some(cache) = self.caches.get_mut(from_dir) {
                    cache.rename(from_name, to_name.to_os_string());
                }
            }
            _ => {
                self.note_removed(from);
                self.note_removed(to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, data: &[u8], mtime_ms: i64) {
        let p = dir.join(name);
        fs::write(&p, data).unwrap();
        fsops::set_mtime(&p, mtime_ms).unwrap();
    }

    #[test]
    fn test_build_indexes_regular_files_only() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "messages.1", b"hello", 1_000);
        write(tmp.path(), "messages.2", b"world!", 2_000);
        fs::create_dir(tmp.path().join("sub")).unwrap();
        std::os::unix::fs::symlink("messages.1", tmp.path().join("link")).unwrap();

        let cache = ModifyTimeAndSizeCache::build(tmp.path()).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.find(ModifyTimeAndSize::new(1_000, 5)),
            Some(OsStr::new("messages.1"))
        );
        assert_eq!(cache.find(ModifyTimeAndSize::new(1_000, 6)), None);
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let cache = ModifyTimeAndSizeCache::build(&tmp.path().join("gone")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_bidirectional_updates() {
        let mut cache = ModifyTimeAndSizeCache::default();
        let key = ModifyTimeAndSize::new(7, 7);
        cache.insert("b".into(), key);
        cache.insert("a".into(), key);
        assert_eq!(cache.find(key), Some(OsStr::new("a")));

        cache.rename(OsStr::new("a"), "c".into());
        assert_eq!(cache.find(key), Some(OsStr::new("b")));
        assert_eq!(cache.get(OsStr::new("c")), Some(key));

        cache.remove(OsStr::new("b"));
        cache.remove(OsStr::new("c"));
        assert_eq!(cache.find(key), None);
        assert!(cache.is_empty());

        // Re-inserting a name under a new key drops the old mapping
        cache.insert("x".into(), key);
        cache.insert("x".into(), ModifyTimeAndSize::new(8, 8));
        assert_eq!(cache.find(key), None);
    }

    #[test]
    fn test_registry_tracks_only_loaded_dirs() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "old", b"abc", 5);
        let mut caches = MtimeCaches::new();
        let key = ModifyTimeAndSize::new(5, 3);

        caches.note_added(&tmp.path().join("ignored"), key);
        assert!(!caches.is_loaded(tmp.path()));

        assert!(caches.get_or_build(tmp.path()).unwrap().find(key).is_some());
        caches.note_renamed(&tmp.path().join("old"), &tmp.path().join("new"));
        assert_eq!(
            caches.get_or_build(tmp.path()).unwrap().find(key),
            Some(OsStr::new("new"))
        );
        caches.note_removed(&tmp.path().join("new"));
        assert_eq!(caches.get_or_build(tmp.path()).unwrap().find(key), None);

        caches.evict(tmp.path());
        assert!(!caches.is_loaded(tmp.path()));
    }
}
