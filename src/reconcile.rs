//! Per-record reconciliation.
//!
//! Each record is compared with what is on disk in the working directory
//! and with its counterpart in the link-to root (the previous completed
//! pass). The result is one of four outcomes reported back to the sender;
//! regular files that need bytes carry a [`PendingData`] plan for the data
//! phase.
//!
//! Regular file content is decided by an ordered strategy chain:
//! unchanged, link-to match, log match, chunked, whole.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs::{self, File, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::checksum::{chunk_digests, CandidateDigests};
use crate::dirstack::{self, DirectoryFrame};
use crate::fsops;
use crate::mtime_cache::{ModifyTimeAndSize, MtimeCaches};
use crate::naming::WorkingSet;
use crate::params::SessionParams;
use crate::protocol::{chunk_count, result, MAX_CHUNKS};
use crate::record::{FileKind, FileRecord};
use crate::rules::PathRules;
use crate::transfer::Received;

/// Result reported for one present slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NoChange,
    Modified,
    RequestData,
    RequestChunked,
}

impl Outcome {
    pub fn code(self) -> u8 {
        match self {
            Outcome::NoChange => result::NO_CHANGE,
            Outcome::Modified => result::MODIFIED,
            Outcome::RequestData => result::MODIFIED_REQUEST_DATA,
            Outcome::RequestChunked => result::MODIFIED_REQUEST_DATA_CHUNKED,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            result::NO_CHANGE => Some(Outcome::NoChange),
            result::MODIFIED => Some(Outcome::Modified),
            result::MODIFIED_REQUEST_DATA => Some(Outcome::RequestData),
            result::MODIFIED_REQUEST_DATA_CHUNKED => Some(Outcome::RequestChunked),
            _ => None,
        }
    }

    pub fn is_modified(self) -> bool {
        self != Outcome::NoChange
    }
}

/// How the bytes of a regular file will arrive.
#[derive(Debug, Clone)]
pub enum DataPlan {
    /// Whole content; `placeholder` means an empty file was created at the target.
    Whole { placeholder: bool },
    /// Chunks reused from `candidate` where the sender agrees with `digests`.
    Chunked {
        candidate: PathBuf,
        digests: CandidateDigests,
        in_place: bool,
    },
}

/// A regular file waiting for the data phase.
#[derive(Debug, Clone)]
pub struct PendingData {
    pub record: FileRecord,
    pub target: PathBuf,
    pub plan: DataPlan,
}

#[derive(Debug)]
pub struct Decision {
    pub outcome: Outcome,
    pub pending: Option<PendingData>,
}

impl Decision {
    fn settled(outcome: Outcome) -> Self {
        Self {
            outcome,
            pending: None,
        }
    }
}

/// Result of the regular-file strategy chain.
#[derive(Debug)]
enum ContentOutcome {
    Unchanged,
    Linked,
    Request(DataPlan),
}

/// State shared by every record of one session.
pub struct Reconciler {
    working: PathBuf,
    link_to: Option<PathBuf>,
    failover: bool,
    recycling: bool,
    compression: bool,
    quota_gid: Option<u32>,
    rules: PathRules,
    caches: MtimeCaches,
    restart: BTreeSet<String>,
}

impl Reconciler {
    pub fn new(working_set: &WorkingSet, params: &SessionParams, rules: PathRules) -> Self {
        Self {
            working: working_set.working.clone(),
            link_to: working_set.link_to.clone(),
            failover: params.is_failover(),
            recycling: working_set.recycling,
            compression: params.compression,
            quota_gid: params.quota_gid(),
            rules,
            caches: MtimeCaches::new(),
            restart: BTreeSet::new(),
        }
    }

    pub fn working(&self) -> &Path {
        &self.working
    }

    pub fn link_to(&self) -> Option<&Path> {
        self.link_to.as_deref()
    }

    pub fn rules(&self) -> &PathRules {
        &self.rules
    }

    pub fn caches_mut(&mut self) -> &mut MtimeCaches {
        &mut self.caches
    }

    /// Database servers whose data changed during this pass.
    pub fn restart_servers(&self) -> &BTreeSet<String> {
        &self.restart
    }

    fn effective_gid(&self, rec: &FileRecord) -> u32 {
        self.quota_gid.unwrap_or(rec.gid)
    }

    fn note_modified(&mut self, rec: &FileRecord) {
        if !self.failover {
            return;
        }
        if let Some(server) = self.rules.restart_target(&rec.path) {
            if self.restart.insert(server.to_string()) {
                debug!(path = %rec.path, server, "restart required");
            }
        }
    }

    /// Bring the on-disk object for `rec` in line with the record.
    pub fn reconcile(&mut self, rec: &FileRecord) -> Result<Decision> {
        let target = rec.under(&self.working);
        let link_path = self.link_to.as_ref().map(|root| rec.under(root));
        let link_meta = match &link_path {
            Some(p) => fsops::lstat(p)?,
            None => None,
        };

        let mut existing = fsops::lstat(&target)?;
        if let Some(meta) = &existing {
            if FileKind::of(meta) != Some(rec.kind) {
                debug!(path = %rec.path, "replacing object of the wrong type");
                fsops::remove_any(&target)?;
                self.caches.note_removed(&target);
                existing = None;
            }
        }

        let content_modified = match rec.kind {
            FileKind::Directory => self.reconcile_directory(&target, existing.as_ref(), link_meta.as_ref())?,
            FileKind::Fifo | FileKind::BlockDevice | FileKind::CharDevice => {
                self.reconcile_node(rec, &target, existing.as_ref(), link_meta.as_ref())?
            }
            FileKind::Symlink => self.reconcile_symlink(rec, &target, existing.as_ref(), link_path.as_deref())?,
            FileKind::Regular => {
                match self.reconcile_regular(rec, &target, existing, link_path, link_meta.clone())? {
                    ContentOutcome::Unchanged => false,
                    ContentOutcome::Linked => true,
                    ContentOutcome::Request(plan) => {
                        let outcome = match plan {
                            DataPlan::Whole { .. } => Outcome::RequestData,
                            DataPlan::Chunked { .. } => Outcome::RequestChunked,
                        };
                        debug!(path = %rec.path, ?outcome, "data requested");
                        self.note_modified(rec);
                        return Ok(Decision {
                            outcome,
                            pending: Some(PendingData {
                                record: rec.clone(),
                                target,
                                plan,
                            }),
                        });
                    }
                }
            }
        };

        let metadata_modified = self.reconcile_metadata(rec, &target, link_meta.as_ref())?;
        let outcome = if content_modified || metadata_modified {
            self.note_modified(rec);
            Outcome::Modified
        } else {
            Outcome::NoChange
        };
        debug!(path = %rec.path, ?outcome, content_modified, metadata_modified, "reconciled");
        Ok(Decision::settled(outcome))
    }

    fn reconcile_directory(
        &mut self,
        target: &Path,
        existing: Option<&Metadata>,
        link_meta: Option<&Metadata>,
    ) -> Result<bool> {
        if existing.is_some() {
            return Ok(false);
        }
        fs::create_dir(target).with_context(|| format!("mkdir {}", target.display()))?;
        Ok(!link_meta.is_some_and(|m| m.is_dir()))
    }

    fn reconcile_node(
        &mut self,
        rec: &FileRecord,
        target: &Path,
        existing: Option<&Metadata>,
        link_meta: Option<&Metadata>,
    ) -> Result<bool> {
        let device = rec.device.unwrap_or(0);
        let same_node = |meta: &Metadata| {
            FileKind::of(meta) == Some(rec.kind) && (!rec.kind.is_device() || meta.rdev() == device)
        };
        if let Some(meta) = existing {
            if same_node(meta) {
                return Ok(false);
            }
            fsops::remove_any(target)?;
        }
        fsops::make_node(target, rec.kind, rec.permissions(), device)?;
        Ok(!link_meta.is_some_and(same_node))
    }

    fn reconcile_symlink(
        &mut self,
        rec: &FileRecord,
        target: &Path,
        existing: Option<&Metadata>,
        link_path: Option<&Path>,
    ) -> Result<bool> {
        let wanted = Path::new(rec.symlink_target.as_deref().unwrap_or_default());
        let points_at_wanted = |p: &Path| fs::read_link(p).map(|t| t == wanted).unwrap_or(false);
        if existing.is_some() {
            if points_at_wanted(target) {
                return Ok(false);
            }
            fsops::remove_any(target)?;
        }
        std::os::unix::fs::symlink(wanted, target)
            .with_context(|| format!("symlink {} -> {}", target.display(), wanted.display()))?;
        Ok(!link_path.is_some_and(points_at_wanted))
    }

    /// Hard link `source` at `target` through a temp name so a current file
    /// is replaced by a single rename. In log directories the replaced file
    /// stays available under a temp name for later matches.
    fn link_over(
        &mut self,
        source: &Path,
        target: &Path,
        replacing: bool,
        log_dir: bool,
        key: ModifyTimeAndSize,
    ) -> Result<()> {
        let temp = fsops::temp_sibling(target);
        fsops::hard_link(source, &temp)?;
        if let Err(e) = self.swap_in(&temp, target, replacing, log_dir) {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
        self.caches.note_added(target, key);
        Ok(())
    }

    fn swap_in(&mut self, temp: &Path, target: &Path, replacing: bool, log_dir: bool) -> Result<()> {
        if replacing {
            if log_dir {
                let aside = fsops::temp_sibling(target);
                fsops::hard_link(target, &aside)?;
                self.caches.note_renamed(target, &aside);
            } else {
                self.caches.note_removed(target);
            }
        }
        fs::rename(temp, target)
            .with_context(|| format!("rename {} -> {}", temp.display(), target.display()))
    }

    /// A file in `dir` with exactly `key`, skipping `exclude` and stale entries.
    fn find_log_match(
        &mut self,
        dir: &Path,
        key: ModifyTimeAndSize,
        exclude: Option<&OsStr>,
    ) -> Result<Option<PathBuf>> {
        let names: Vec<_> = self
            .caches
            .get_or_build(dir)?
            .names(key)
            .filter(|n| Some(*n) != exclude)
            .map(|n| n.to_os_string())
            .collect();
        for name in names {
            let path = dir.join(&name);
            match fsops::lstat(&path)? {
                Some(meta) if meta.is_file() && ModifyTimeAndSize::of(&meta) == key => {
                    return Ok(Some(path))
                }
                _ => self.caches.note_removed(&path),
            }
        }
        Ok(None)
    }

    fn reconcile_regular(
        &mut self,
        rec: &FileRecord,
        target: &Path,
        existing: Option<Metadata>,
        link_path: Option<PathBuf>,
        link_meta: Option<Metadata>,
    ) -> Result<ContentOutcome> {
        let link_dir = link_path.as_deref().and_then(Path::parent).map(Path::to_path_buf);
        let link = link_path.zip(link_meta);
        let key = ModifyTimeAndSize::new(rec.mtime_ms.unwrap_or(0), rec.length);
        let log_dir = rec.parent().is_some_and(|p| self.rules.is_log_dir(p));
        // Images whose mtime and size say nothing about content never match by key
        let encrypted = self.rules.is_encrypted_image(&rec.path);

        if !encrypted {
            if let Some(outcome) = self.try_unchanged(existing.as_ref(), key) {
                return Ok(outcome);
            }
            if let Some(outcome) = self.try_link_to(target, existing.as_ref(), link.as_ref(), key, log_dir)? {
                return Ok(outcome);
            }
            if log_dir {
                if let Some(outcome) = self.try_log_match(target, existing.as_ref(), link_dir.as_deref(), key)? {
                    return Ok(outcome);
                }
            }
        }
        if let Some(plan) = self.try_chunked(rec, target, existing.as_ref(), link.as_ref())? {
            return Ok(ContentOutcome::Request(plan));
        }
        self.whole(target, existing.as_ref())
    }

    fn try_unchanged(&self, existing: Option<&Metadata>, key: ModifyTimeAndSize) -> Option<ContentOutcome> {
        let meta = existing?;
        (ModifyTimeAndSize::of(meta) == key).then_some(ContentOutcome::Unchanged)
    }

    fn try_link_to(
        &mut self,
        target: &Path,
        existing: Option<&Metadata>,
        link: Option<&(PathBuf, Metadata)>,
        key: ModifyTimeAndSize,
        log_dir: bool,
    ) -> Result<Option<ContentOutcome>> {
        let Some((link_path, link_meta)) = link else {
            return Ok(None);
        };
        if !link_meta.is_file() || ModifyTimeAndSize::of(link_meta) != key {
            return Ok(None);
        }
        if existing.is_some_and(|meta| fsops::same_inode(meta, link_meta)) {
            return Ok(Some(ContentOutcome::Unchanged));
        }
        self.link_over(link_path, target, existing.is_some(), log_dir, key)?;
        Ok(Some(ContentOutcome::Linked))
    }

    fn try_log_match(
        &mut self,
        target: &Path,
        existing: Option<&Metadata>,
        link_dir: Option<&Path>,
        key: ModifyTimeAndSize,
    ) -> Result<Option<ContentOutcome>> {
        let Some(current_dir) = target.parent() else {
            return Ok(None);
        };
        let mut found = self.find_log_match(current_dir, key, target.file_name())?;
        if found.is_none() {
            if let Some(dir) = link_dir {
                found = self.find_log_match(dir, key, None)?;
            }
        }
        let Some(source) = found else {
            return Ok(None);
        };
        debug!(target = %target.display(), source = %source.display(), "rotated log matched");
        self.link_over(&source, target, existing.is_some(), true, key)?;
        Ok(Some(ContentOutcome::Linked))
    }

    fn try_chunked(
        &mut self,
        rec: &FileRecord,
        target: &Path,
        existing: Option<&Metadata>,
        link: Option<&(PathBuf, Metadata)>,
    ) -> Result<Option<DataPlan>> {
        if !self.compression || rec.length == 0 {
            return Ok(None);
        }
        let usable = |meta: &Metadata| {
            meta.is_file() && meta.len() > 0 && chunk_count(meta.len()) <= MAX_CHUNKS
        };
        let current = existing
            .filter(|m| usable(m))
            .map(|m| (target.to_path_buf(), m.nlink()));
        let previous = link
            .filter(|(_, m)| usable(m))
            .map(|(p, m)| (p.clone(), m.nlink()));
        let preferred = if self.recycling {
            previous.or(current)
        } else {
            current.or(previous)
        };
        let Some((candidate, nlink)) = preferred else {
            return Ok(None);
        };

        let digests = chunk_digests(&candidate)?;
        if digests.size == 0 {
            return Ok(None);
        }
        let in_place = candidate == target && (self.failover || link.is_none()) && nlink == 1;
        debug!(
            candidate = %candidate.display(),
            chunks = digests.chunks.len(),
            in_place,
            "chunked transfer"
        );
        Ok(Some(DataPlan::Chunked {
            candidate,
            digests,
            in_place,
        }))
    }

    fn whole(&mut self, target: &Path, existing: Option<&Metadata>) -> Result<ContentOutcome> {
        let placeholder = existing.is_none();
        if placeholder {
            File::create(target).with_context(|| format!("create {}", target.display()))?;
        }
        Ok(ContentOutcome::Request(DataPlan::Whole { placeholder }))
    }

    /// Fix mode, owner and (for nodes) mtime. Returns true when the result
    /// differs from the link-to counterpart's metadata.
    fn reconcile_metadata(
        &mut self,
        rec: &FileRecord,
        target: &Path,
        link_meta: Option<&Metadata>,
    ) -> Result<bool> {
        let Some(meta) = fsops::lstat(target)? else {
            anyhow::bail!("{} vanished during reconciliation", target.display());
        };
        let gid = self.effective_gid(rec);
        let perm = rec.permissions();
        let node = matches!(rec.kind, FileKind::Fifo | FileKind::BlockDevice | FileKind::CharDevice);
        let wanted_mtime = if node { rec.mtime_ms } else { None };
        let symlink = rec.kind == FileKind::Symlink;

        let matches = |m: &Metadata| {
            (symlink || m.mode() & 0o7777 == perm)
                && m.uid() == rec.uid
                && m.gid() == gid
                && wanted_mtime.map_or(true, |t| fsops::mtime_ms(m) == t)
        };
        if matches(&meta) {
            return Ok(false);
        }

        if meta.nlink() > 1 && !meta.is_dir() {
            debug!(path = %rec.path, nlink = meta.nlink(), "copy-on-write before metadata change");
            fsops::break_hard_link(target, &meta)?;
        }
        if !symlink {
            fsops::set_permissions(target, perm)?;
        }
        fsops::set_owner(target, rec.uid, gid)?;
        if let Some(mtime) = wanted_mtime {
            fsops::set_mtime(target, mtime)?;
        }
        Ok(!link_meta.is_some_and(|l| FileKind::of(l) == Some(rec.kind) && matches(l)))
    }

    /// Finish a regular file after its data arrived: metadata onto the new inode.
    pub fn complete_data(&mut self, pending: &PendingData, received: Received) -> Result<()> {
        let rec = &pending.record;
        let target = &pending.target;
        let mtime = rec.mtime_ms.unwrap_or(0);
        fsops::set_permissions(target, rec.permissions())?;
        fsops::set_owner(target, rec.uid, self.effective_gid(rec))?;
        fsops::set_mtime(target, mtime)?;
        self.caches
            .note_added(target, ModifyTimeAndSize::new(mtime, received.total()));
        Ok(())
    }

    /// Complete a directory the stream has left; returns the number of entries removed.
    pub fn finish_directory(&mut self, frame: &DirectoryFrame) -> Result<usize> {
        dirstack::finalize(frame, &self.rules, &mut self.caches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationConfig;
    use crate::protocol::mode::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        working: PathBuf,
        link_to: PathBuf,
        uid: u32,
        gid: u32,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let working = tmp.path().join("today");
            let link_to = tmp.path().join("yesterday");
            fs::create_dir(&working).unwrap();
            fs::create_dir(&link_to).unwrap();
            let meta = fs::metadata(tmp.path()).unwrap();
            Self {
                working,
                link_to,
                uid: meta.uid(),
                gid: meta.gid(),
                _tmp: tmp,
            }
        }

        fn reconciler(&self, retention: i32, compression: bool, with_link: bool) -> Reconciler {
            self.reconciler_with(retention, compression, with_link, false, &ReplicationConfig::default())
        }

        fn reconciler_with(
            &self,
            retention: i32,
            compression: bool,
            with_link: bool,
            recycling: bool,
            config: &ReplicationConfig,
        ) -> Reconciler {
            let ws = WorkingSet {
                working: self.working.clone(),
                final_path: None,
                link_to: with_link.then(|| self.link_to.clone()),
                recycling,
                state: None,
            };
            let params = SessionParams {
                failover_id: 1,
                source: "host".into(),
                retention,
                partition: PathBuf::from("/backup"),
                compression,
                protocol_version: 1,
                quota_gid: -1,
                date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            };
            Reconciler::new(&ws, &params, PathRules::for_session(config, retention == 1))
        }

        fn file(&self, path: &str, len: u64, mtime: i64) -> FileRecord {
            FileRecord {
                path: path.into(),
                mode: S_IFREG | 0o644,
                kind: FileKind::Regular,
                length: len,
                uid: self.uid,
                gid: self.gid,
                mtime_ms: Some(mtime),
                symlink_target: None,
                device: None,
            }
        }

        fn write(&self, root: &Path, rel: &str, data: &[u8], mtime: i64) -> PathBuf {
            let p = root.join(rel);
            fs::write(&p, data).unwrap();
            fs::set_permissions(&p, std::os::unix::fs::PermissionsExt::from_mode(0o644)).unwrap();
            fsops::set_mtime(&p, mtime).unwrap();
            p
        }
    }

    #[test]
    fn test_outcome_codes() {
        for o in [Outcome::NoChange, Outcome::Modified, Outcome::RequestData, Outcome::RequestChunked] {
            assert_eq!(Outcome::from_code(o.code()), Some(o));
        }
        assert_eq!(Outcome::from_code(4), None);
    }

    #[test]
    fn test_unchanged_file() {
        let fx = Fixture::new();
        fx.write(&fx.working, "f", b"hello", 1_000);
        let mut r = fx.reconciler(1, false, false);
        let d = r.reconcile(&fx.file("/f", 5, 1_000)).unwrap();
        assert_eq!(d.outcome, Outcome::NoChange);
        assert!(d.pending.is_none());
    }

    #[test]
    fn test_new_file_gets_placeholder() {
        let fx = Fixture::new();
        let mut r = fx.reconciler(1, false, false);
        let d = r.reconcile(&fx.file("/new", 5, 1_000)).unwrap();
        assert_eq!(d.outcome, Outcome::RequestData);
        let pending = d.pending.unwrap();
        assert!(matches!(pending.plan, DataPlan::Whole { placeholder: true }));
        assert_eq!(fs::metadata(fx.working.join("new")).unwrap().len(), 0);
    }

    #[test]
    fn test_link_to_match_hard_links() {
        let fx = Fixture::new();
        let old = fx.write(&fx.link_to, "f", b"same", 2_000);
        let mut r = fx.reconciler(31, false, true);
        let d = r.reconcile(&fx.file("/f", 4, 2_000)).unwrap();
        assert_eq!(d.outcome, Outcome::Modified);
        let a = fs::metadata(&old).unwrap();
        let b = fs::metadata(fx.working.join("f")).unwrap();
        assert!(fsops::same_inode(&a, &b));
        assert_eq!(b.nlink(), 2);

        // Second time round the same inode is already there
        let d = r.reconcile(&fx.file("/f", 4, 2_000)).unwrap();
        assert_eq!(d.outcome, Outcome::NoChange);
    }

    #[test]
    fn test_metadata_change_breaks_hard_link() {
        let fx = Fixture::new();
        let old = fx.write(&fx.link_to, "f", b"same", 2_000);
        fs::hard_link(&old, fx.working.join("f")).unwrap();
        let mut r = fx.reconciler(31, false, true);
        let mut rec = fx.file("/f", 4, 2_000);
        rec.mode = S_IFREG | 0o600;

        let d = r.reconcile(&rec).unwrap();
        assert_eq!(d.outcome, Outcome::Modified);
        let a = fs::symlink_metadata(&old).unwrap();
        let b = fs::symlink_metadata(fx.working.join("f")).unwrap();
        assert_eq!(a.nlink(), 1);
        assert_eq!(b.nlink(), 1);
        assert_eq!(a.mode() & 0o7777, 0o644);
        assert_eq!(b.mode() & 0o7777, 0o600);
        assert_eq!(fs::read(&old).unwrap(), b"same");
        assert_eq!(fs::read(fx.working.join("f")).unwrap(), b"same");
    }

    #[test]
    fn test_log_match_finds_rotated_file() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.working.join("var/log")).unwrap();
        fx.write(&fx.working, "var/log/messages", b"rotated content", 3_000);
        let mut r = fx.reconciler(1, false, false);

        // messages was renamed to messages.1 on the source
        let d = r.reconcile(&fx.file("/var/log/messages.1", 15, 3_000)).unwrap();
        assert_eq!(d.outcome, Outcome::Modified);
        let a = fs::metadata(fx.working.join("var/log/messages")).unwrap();
        let b = fs::metadata(fx.working.join("var/log/messages.1")).unwrap();
        assert!(fsops::same_inode(&a, &b));
    }

    #[test]
    fn test_log_match_moves_existing_aside() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.working.join("var/log")).unwrap();
        fx.write(&fx.working, "var/log/messages.1", b"older rotation", 1_000);
        fx.write(&fx.working, "var/log/messages", b"newer rotation!", 2_000);
        let mut r = fx.reconciler(1, false, false);

        let d = r.reconcile(&fx.file("/var/log/messages.1", 15, 2_000)).unwrap();
        assert_eq!(d.outcome, Outcome::Modified);
        assert_eq!(fs::read(fx.working.join("var/log/messages.1")).unwrap(), b"newer rotation!");
        // The older content survives under a temp name for later matches
        let aside: Vec<_> = fs::read_dir(fx.working.join("var/log"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(fsops::TEMP_PREFIX))
            .collect();
        assert_eq!(aside.len(), 1);

        let d = r.reconcile(&fx.file("/var/log/messages.2", 14, 1_000)).unwrap();
        assert_eq!(d.outcome, Outcome::Modified);
        assert_eq!(fs::read(fx.working.join("var/log/messages.2")).unwrap(), b"older rotation");
    }

    #[test]
    fn test_chunked_prefers_current_and_in_place_in_failover() {
        let fx = Fixture::new();
        fx.write(&fx.working, "big", b"old content", 1_000);
        let mut r = fx.reconciler(1, true, false);
        let d = r.reconcile(&fx.file("/big", 20, 5_000)).unwrap();
        assert_eq!(d.outcome, Outcome::RequestChunked);
        match d.pending.unwrap().plan {
            DataPlan::Chunked { candidate, digests, in_place } => {
                assert_eq!(candidate, fx.working.join("big"));
                assert_eq!(digests.size, 11);
                assert!(in_place);
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_chunked_not_in_place_when_link_to_exists() {
        let fx = Fixture::new();
        fx.write(&fx.working, "big", b"current", 1_000);
        fx.write(&fx.link_to, "big", b"previous", 900);
        let mut r = fx.reconciler(31, true, true);
        let d = r.reconcile(&fx.file("/big", 20, 5_000)).unwrap();
        match d.pending.unwrap().plan {
            DataPlan::Chunked { candidate, in_place, .. } => {
                assert_eq!(candidate, fx.working.join("big"));
                assert!(!in_place);
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_recycling_prefers_link_to_candidate() {
        let fx = Fixture::new();
        fx.write(&fx.working, "big", b"recycled", 1_000);
        fx.write(&fx.link_to, "big", b"previous", 900);
        let mut r = fx.reconciler_with(31, true, true, true, &ReplicationConfig::default());
        let d = r.reconcile(&fx.file("/big", 20, 5_000)).unwrap();
        assert_eq!(d.outcome, Outcome::RequestChunked);
        match d.pending.unwrap().plan {
            DataPlan::Chunked { candidate, digests, in_place } => {
                assert_eq!(candidate, fx.link_to.join("big"));
                assert_eq!(digests.size, 8);
                assert!(!in_place);
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_log_match_in_link_to_dir() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.working.join("var/log")).unwrap();
        fs::create_dir_all(fx.link_to.join("var/log")).unwrap();
        let old = fx.write(&fx.link_to, "var/log/messages", b"rotated content", 3_000);
        let mut r = fx.reconciler(31, false, true);

        let d = r.reconcile(&fx.file("/var/log/messages.1", 15, 3_000)).unwrap();
        assert_eq!(d.outcome, Outcome::Modified);
        let a = fs::metadata(&old).unwrap();
        let b = fs::metadata(fx.working.join("var/log/messages.1")).unwrap();
        assert!(fsops::same_inode(&a, &b));
        assert!(!fx.working.join("var/log/messages").exists());
    }

    #[test]
    fn test_encrypted_image_skips_link_to_shortcut() {
        let fx = Fixture::new();
        let old = fx.write(&fx.link_to, "ao.aes256.img", b"ciphertext v1!", 5_000);
        let config = ReplicationConfig::default();
        assert!(config.encrypted_images.iter().any(|p| p == "/ao.aes256.img"));
        let mut r = fx.reconciler_with(31, false, true, false, &config);
        let rec = fx.file("/ao.aes256.img", 14, 5_000);

        let d = r.reconcile(&rec).unwrap();
        assert_eq!(d.outcome, Outcome::RequestData);
        assert!(matches!(d.pending.unwrap().plan, DataPlan::Whole { placeholder: true }));
        let a = fs::metadata(&old).unwrap();
        let b = fs::metadata(fx.working.join("ao.aes256.img")).unwrap();
        assert!(!fsops::same_inode(&a, &b));
        assert_eq!(a.nlink(), 1);

        // Same key on disk after the data phase still asks for data
        fx.write(&fx.working, "ao.aes256.img", b"ciphertext v2!", 5_000);
        let d = r.reconcile(&rec).unwrap();
        assert_eq!(d.outcome, Outcome::RequestData);
        assert!(matches!(d.pending.unwrap().plan, DataPlan::Whole { placeholder: false }));
    }

    #[test]
    fn test_failed_link_keeps_current_file() {
        let fx = Fixture::new();
        let current = fx.write(&fx.working, "f", b"current", 1_000);
        let mut r = fx.reconciler(31, false, true);
        let key = ModifyTimeAndSize::new(2_000, 4);

        let missing = fx.link_to.join("gone");
        assert!(r.link_over(&missing, &current, true, false, key).is_err());
        assert_eq!(fs::read(&current).unwrap(), b"current");
        let temps = fs::read_dir(&fx.working)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with(fsops::TEMP_PREFIX))
            .count();
        assert_eq!(temps, 0);

        let source = fx.write(&fx.link_to, "f", b"next", 2_000);
        r.link_over(&source, &current, true, false, key).unwrap();
        assert_eq!(fs::read(&current).unwrap(), b"next");
        assert_eq!(fs::read_dir(&fx.working).unwrap().count(), 1);
    }

    #[test]
    fn test_wrong_type_replaced() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.working.join("x/deep")).unwrap();
        let mut r = fx.reconciler(1, false, false);
        let d = r.reconcile(&fx.file("/x", 3, 1)).unwrap();
        assert_eq!(d.outcome, Outcome::RequestData);
        assert!(fs::symlink_metadata(fx.working.join("x")).unwrap().is_file());
    }

    #[test]
    fn test_symlink_and_directory_and_fifo() {
        let fx = Fixture::new();
        let mut r = fx.reconciler(1, false, false);
        let dir = FileRecord {
            path: "/d".into(),
            mode: S_IFDIR | 0o755,
            kind: FileKind::Directory,
            length: 0,
            uid: fx.uid,
            gid: fx.gid,
            mtime_ms: Some(10),
            symlink_target: None,
            device: None,
        };
        assert_eq!(r.reconcile(&dir).unwrap().outcome, Outcome::Modified);
        assert_eq!(r.reconcile(&dir).unwrap().outcome, Outcome::NoChange);

        let link = FileRecord {
            path: "/d/l".into(),
            mode: S_IFLNK | 0o777,
            kind: FileKind::Symlink,
            mtime_ms: None,
            symlink_target: Some("../elsewhere".into()),
            ..dir.clone()
        };
        assert_eq!(r.reconcile(&link).unwrap().outcome, Outcome::Modified);
        assert_eq!(fs::read_link(fx.working.join("d/l")).unwrap(), PathBuf::from("../elsewhere"));
        assert_eq!(r.reconcile(&link).unwrap().outcome, Outcome::NoChange);

        let retarget = FileRecord {
            symlink_target: Some("other".into()),
            ..link.clone()
        };
        assert_eq!(r.reconcile(&retarget).unwrap().outcome, Outcome::Modified);
        assert_eq!(fs::read_link(fx.working.join("d/l")).unwrap(), PathBuf::from("other"));

        let fifo = FileRecord {
            path: "/d/p".into(),
            mode: S_IFIFO | 0o600,
            kind: FileKind::Fifo,
            mtime_ms: Some(123_000),
            ..dir.clone()
        };
        assert_eq!(r.reconcile(&fifo).unwrap().outcome, Outcome::Modified);
        let meta = fs::symlink_metadata(fx.working.join("d/p")).unwrap();
        assert_eq!(fsops::mtime_ms(&meta), 123_000);
        assert_eq!(r.reconcile(&fifo).unwrap().outcome, Outcome::NoChange);
    }

    #[test]
    fn test_restart_noted_in_failover_only() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.working.join("var/lib/mysql/main")).unwrap();
        let mut config = ReplicationConfig::default();
        config.database_servers.push(crate::config::DatabaseServer {
            name: "main".into(),
            version: "8.0".into(),
        });
        let ws = WorkingSet {
            working: fx.working.clone(),
            final_path: None,
            link_to: None,
            recycling: false,
            state: None,
        };
        let params = SessionParams {
            failover_id: 1,
            source: "host".into(),
            retention: 1,
            partition: PathBuf::from("/backup"),
            compression: false,
            protocol_version: 1,
            quota_gid: -1,
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        };
        let mut r = Reconciler::new(&ws, &params, PathRules::for_session(&config, true));
        r.reconcile(&fx.file("/var/lib/mysql/main/ibdata1", 10, 1)).unwrap();
        assert!(r.restart_servers().contains("main (8.0)"));
    }
}
