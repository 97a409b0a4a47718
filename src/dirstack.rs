//! Directory completion stack.
//!
//! Records arrive depth-first with each directory's entries contiguous. The
//! stack holds the open ancestors of the current record; once the stream
//! leaves a directory its frame is popped and, after the batch's data phase,
//! finalized: entries the source did not mention are deleted and the
//! directory gets its recorded mtime.

use anyhow::Result;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::ProtocolError;
use crate::fsops;
use crate::mtime_cache::MtimeCaches;
use crate::record::{is_ancestor, FileKind, FileRecord};
use crate::rules::PathRules;

#[derive(Debug)]
pub struct DirectoryFrame {
    pub record_path: String,
    pub dir: PathBuf,
    pub link_to: Option<PathBuf>,
    pub mtime_ms: i64,
    pub expected: HashSet<OsString>,
}

impl DirectoryFrame {
    pub fn new(rec: &FileRecord, dir: PathBuf, link_to: Option<PathBuf>) -> Self {
        Self {
            record_path: rec.path.clone(),
            dir,
            link_to,
            mtime_ms: rec.mtime_ms.unwrap_or(0),
            expected: HashSet::new(),
        }
    }
}

fn out_of_order(rec: &FileRecord, reason: &'static str) -> anyhow::Error {
    ProtocolError::OutOfOrder {
        path: rec.path.clone(),
        reason,
    }
    .into()
}

#[derive(Debug, Default)]
pub struct DirectoryStack {
    frames: Vec<DirectoryFrame>,
    seen_root: bool,
}

impl DirectoryStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn top(&self) -> Option<&DirectoryFrame> {
        self.frames.last()
    }

    /// Admit the next record: pop every frame that is not one of its
    /// ancestors, check the ordering contract and register its name with the
    /// parent. Returns the popped frames, innermost first.
    pub fn enter(&mut self, rec: &FileRecord) -> Result<Vec<DirectoryFrame>> {
        if !self.seen_root {
            if !rec.is_root() || rec.kind != FileKind::Directory {
                return Err(out_of_order(rec, "stream must start with the root directory"));
            }
            self.seen_root = true;
            return Ok(Vec::new());
        }
        if rec.is_root() {
            return Err(out_of_order(rec, "root directory repeated"));
        }

        let mut popped = Vec::new();
        while let Some(top) = self.frames.last() {
            if is_ancestor(&top.record_path, &rec.path) {
                break;
            }
            if let Some(frame) = self.frames.pop() {
                popped.push(frame);
            }
        }

        let Some(top) = self.frames.last_mut() else {
            return Err(out_of_order(rec, "no open directory"));
        };
        if rec.parent() != Some(top.record_path.as_str()) {
            return Err(out_of_order(rec, "parent is not the open directory"));
        }
        if !top.expected.insert(OsString::from(rec.file_name())) {
            return Err(out_of_order(rec, "entry repeated in its directory"));
        }
        Ok(popped)
    }

    pub fn push(&mut self, frame: DirectoryFrame) {
        self.frames.push(frame);
    }

    /// Pop everything, innermost first.
    pub fn drain(&mut self) -> Vec<DirectoryFrame> {
        let mut frames = std::mem::take(&mut self.frames);
        frames.reverse();
        frames
    }
}

fn child_record_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

fn ignorable(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(libc::ENOTEMPTY)
}

/// Recursively delete `path` except for protected descendants.
fn remove_unprotected(path: &Path, record_path: &str, rules: &PathRules) -> Result<usize> {
    let Some(meta) = fsops::lstat(path)? else {
        return Ok(0);
    };
    if !meta.is_dir() {
        return match fs::remove_file(path) {
            Ok(()) => Ok(1),
            Err(e) if ignorable(&e) => Ok(0),
            Err(e) => Err(e.into()),
        };
    }

    let mut removed = 0;
    let walker = WalkDir::new(path).contents_first(true).into_iter().filter_entry(|entry| {
        let rel = entry.path().strip_prefix(path).unwrap_or(Path::new(""));
        let rec = if rel.as_os_str().is_empty() {
            record_path.to_string()
        } else {
            child_record_path(record_path, &rel.to_string_lossy())
        };
        !rules.is_protected(&rec)
    });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().is_some_and(|io| io.kind() == io::ErrorKind::NotFound) => continue,
            Err(e) => return Err(e.into()),
        };
        let res = if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        match res {
            Ok(()) => removed += 1,
            Err(e) if ignorable(&e) => {
                debug!(path = %entry.path().display(), error = %e, "left in place")
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

/// Delete unexpected entries of a popped directory and set its mtime.
pub fn finalize(frame: &DirectoryFrame, rules: &PathRules, caches: &mut MtimeCaches) -> Result<usize> {
    caches.evict(&frame.dir);
    if let Some(link_to) = &frame.link_to {
        caches.evict(link_to);
    }

    let entries = match fs::read_dir(&frame.dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(dir = %frame.dir.display(), "directory vanished before completion");
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if frame.expected.contains(&name) {
            continue;
        }
        let record_path = child_record_path(&frame.record_path, &name.to_string_lossy());
        if rules.is_protected(&record_path) {
            debug!(path = %record_path, "protected, not removed");
            continue;
        }
        debug!(path = %record_path, "removing entry absent from source");
        removed += remove_unprotected(&entry.path(), &record_path, rules)?;
    }

    fsops::set_mtime(&frame.dir, frame.mtime_ms)?;
    debug!(dir = %frame.record_path, removed, "directory complete");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationConfig;
    use crate::error::is_protocol_error;
    use crate::protocol::mode::*;
    use tempfile::TempDir;

    fn dir(path: &str) -> FileRecord {
        FileRecord {
            path: path.into(),
            mode: S_IFDIR | 0o755,
            kind: FileKind::Directory,
            length: 0,
            uid: 0,
            gid: 0,
            mtime_ms: Some(1_500_000_000_000),
            symlink_target: None,
            device: None,
        }
    }

    fn file(path: &str) -> FileRecord {
        FileRecord {
            mode: S_IFREG | 0o644,
            kind: FileKind::Regular,
            ..dir(path)
        }
    }

    fn feed(stack: &mut DirectoryStack, rec: &FileRecord) -> Result<Vec<DirectoryFrame>> {
        let popped = stack.enter(rec)?;
        if rec.kind == FileKind::Directory {
            stack.push(DirectoryFrame::new(rec, PathBuf::from(&rec.path), None));
        }
        Ok(popped)
    }

    #[test]
    fn test_pops_when_leaving_subtree() {
        let mut stack = DirectoryStack::new();
        feed(&mut stack, &dir("/")).unwrap();
        feed(&mut stack, &dir("/a")).unwrap();
        feed(&mut stack, &file("/a/x")).unwrap();
        feed(&mut stack, &dir("/a/b")).unwrap();
        assert_eq!(stack.depth(), 3);

        let popped = feed(&mut stack, &file("/c")).unwrap();
        let names: Vec<_> = popped.iter().map(|f| f.record_path.as_str()).collect();
        assert_eq!(names, vec!["/a/b", "/a"]);
        assert!(popped[1].expected.contains(&OsString::from("x")));
        assert!(popped[1].expected.contains(&OsString::from("b")));

        let rest: Vec<_> = stack.drain().into_iter().map(|f| f.record_path).collect();
        assert_eq!(rest, vec!["/"]);
    }

    #[test]
    fn test_must_start_with_root() {
        let mut stack = DirectoryStack::new();
        assert!(is_protocol_error(&stack.enter(&file("/a")).unwrap_err()));
        let mut stack = DirectoryStack::new();
        assert!(is_protocol_error(&stack.enter(&file("/")).unwrap_err()));
    }

    #[test]
    fn test_rejects_skipped_parent() {
        let mut stack = DirectoryStack::new();
        feed(&mut stack, &dir("/")).unwrap();
        let err = feed(&mut stack, &file("/missing/x")).unwrap_err();
        assert!(is_protocol_error(&err));
    }

    #[test]
    fn test_rejects_reopened_directory() {
        let mut stack = DirectoryStack::new();
        feed(&mut stack, &dir("/")).unwrap();
        feed(&mut stack, &dir("/a")).unwrap();
        feed(&mut stack, &file("/b")).unwrap();
        let err = feed(&mut stack, &dir("/a")).unwrap_err();
        assert!(is_protocol_error(&err));
    }

    fn frame_for(root: &Path, rec: &FileRecord) -> DirectoryFrame {
        let mut frame = DirectoryFrame::new(rec, rec.under(root), None);
        frame.expected.insert("x".into());
        frame.expected.insert("b".into());
        frame
    }

    #[test]
    fn test_finalize_removes_strays_and_sets_mtime() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        fs::create_dir_all(a.join("b")).unwrap();
        fs::write(a.join("x"), b"keep").unwrap();
        fs::write(a.join("y"), b"stray").unwrap();
        fs::create_dir_all(a.join("z/deeper")).unwrap();
        fs::write(a.join("z/deeper/f"), b"stray").unwrap();

        let rules = PathRules::for_session(&ReplicationConfig::default(), false);
        let mut caches = MtimeCaches::new();
        let frame = frame_for(tmp.path(), &dir("/a"));
        let removed = finalize(&frame, &rules, &mut caches).unwrap();

        assert_eq!(removed, 4);
        assert!(a.join("x").exists() && a.join("b").exists());
        assert!(!a.join("y").exists() && !a.join("z").exists());
        let meta = fs::metadata(&a).unwrap();
        assert_eq!(fsops::mtime_ms(&meta), 1_500_000_000_000);
    }

    #[test]
    fn test_finalize_keeps_protected() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        fs::create_dir_all(a.join("z")).unwrap();
        fs::write(a.join("y"), b"protected").unwrap();
        fs::write(a.join("z/keep"), b"protected").unwrap();
        fs::write(a.join("z/drop"), b"stray").unwrap();

        let config = ReplicationConfig {
            protected: vec!["/a/y".into(), "/a/z/keep".into()],
            ..ReplicationConfig::default()
        };
        let rules = PathRules::for_session(&config, false);
        let frame = frame_for(tmp.path(), &dir("/a"));
        finalize(&frame, &rules, &mut MtimeCaches::new()).unwrap();

        assert!(a.join("y").exists());
        assert!(a.join("z/keep").exists());
        assert!(!a.join("z/drop").exists());
    }
}
