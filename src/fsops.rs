//! POSIX primitives used by the engine.
//!
//! Thin wrappers over `std::os::unix` and `libc`; every call is assumed
//! atomic. Missing paths surface as `Ok(None)` / `Ok(false)` where the
//! caller treats a vanished entry as a benign race.

use anyhow::{Context, Result};
use filetime::FileTime;
use std::ffi::CString;
use std::fs::{self, File, Metadata, Permissions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::protocol::CHUNK_SIZE;
use crate::record::FileKind;

pub const TEMP_PREFIX: &str = ".failover.";

/// lstat; `None` when nothing exists at `path`.
pub fn lstat(path: &Path) -> Result<Option<Metadata>> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("lstat {}", path.display())),
    }
}

pub fn mtime_ms(meta: &Metadata) -> i64 {
    meta.mtime() * 1000 + meta.mtime_nsec() / 1_000_000
}

pub fn file_time(ms: i64) -> FileTime {
    FileTime::from_unix_time(ms.div_euclid(1000), (ms.rem_euclid(1000) * 1_000_000) as u32)
}

/// Set the modification time without touching atime. Follows symlinks.
pub fn set_mtime(path: &Path, ms: i64) -> Result<()> {
    filetime::set_file_mtime(path, file_time(ms))
        .with_context(|| format!("set mtime {}", path.display()))
}

pub fn set_permissions(path: &Path, perm: u32) -> Result<()> {
    fs::set_permissions(path, Permissions::from_mode(perm))
        .with_context(|| format!("chmod {:o} {}", perm, path.display()))
}

/// lchown; never follows symlinks.
pub fn set_owner(path: &Path, uid: u32, gid: u32) -> Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))
        .with_context(|| format!("chown {}:{} {}", uid, gid, path.display()))
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path contains NUL: {}", path.display()))
}

/// Create a FIFO or device node.
pub fn make_node(path: &Path, kind: FileKind, perm: u32, device: u64) -> Result<()> {
    let c = c_path(path)?;
    let rc = match kind {
        FileKind::Fifo => unsafe { libc::mkfifo(c.as_ptr(), perm as libc::mode_t) },
        FileKind::BlockDevice => unsafe {
            libc::mknod(c.as_ptr(), libc::S_IFBLK | perm as libc::mode_t, device as libc::dev_t)
        },
        FileKind::CharDevice => unsafe {
            libc::mknod(c.as_ptr(), libc::S_IFCHR | perm as libc::mode_t, device as libc::dev_t)
        },
        other => anyhow::bail!("make_node called for {:?}", other),
    };
    if rc != 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("mknod {:?} {}", kind, path.display()));
    }
    Ok(())
}

/// Remove whatever is at `path`, recursively for directories. Returns false if it was already gone.
pub fn remove_any(path: &Path) -> Result<bool> {
    let Some(meta) = lstat(path)? else {
        return Ok(false);
    };
    let res = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match res {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

/// An unused name in the same directory as `path`.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let dir = path.parent().unwrap_or(Path::new("."));
    dir.join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4().simple()))
}

pub fn hard_link(existing: &Path, link: &Path) -> Result<()> {
    fs::hard_link(existing, link)
        .with_context(|| format!("link {} -> {}", link.display(), existing.display()))
}

pub fn same_inode(a: &Metadata, b: &Metadata) -> bool {
    a.dev() == b.dev() && a.ino() == b.ino()
}

/// Temp file next to `target`, removed on drop unless persisted.
pub fn temp_file_for(target: &Path) -> Result<NamedTempFile> {
    let dir = target.parent().unwrap_or(Path::new("."));
    tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))
}

/// Atomically replace `target` with the temp file.
pub fn persist(temp: NamedTempFile, target: &Path) -> Result<File> {
    temp.persist(target)
        .map_err(|e| e.error)
        .with_context(|| format!("rename temp file over {}", target.display()))
}

fn copy_contents(src: &Path, dst: &mut File) -> Result<u64> {
    let mut reader = BufReader::with_capacity(CHUNK_SIZE, File::open(src)?);
    let mut writer = BufWriter::with_capacity(CHUNK_SIZE, dst);
    let mut buffer = vec![0u8; 256 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

/// Give `path` a private inode so metadata edits stay out of other snapshots.
///
/// The replacement carries the same content, mode, owner and mtime; the
/// other names of the old inode are left untouched.
pub fn break_hard_link(path: &Path, meta: &Metadata) -> Result<()> {
    let kind = FileKind::of(meta);
    match kind {
        Some(FileKind::Regular) => {
            let mut temp = temp_file_for(path)?;
            copy_contents(path, temp.as_file_mut())
                .with_context(|| format!("copy {} before relinking", path.display()))?;
            let temp_path = temp.path().to_path_buf();
            set_permissions(&temp_path, meta.mode() & 0o7777)?;
            set_owner(&temp_path, meta.uid(), meta.gid())?;
            set_mtime(&temp_path, mtime_ms(meta))?;
            persist(temp, path)?;
        }
        Some(FileKind::Symlink) => {
            let target = fs::read_link(path)?;
            let temp_path = temp_sibling(path);
            std::os::unix::fs::symlink(&target, &temp_path)?;
            set_owner(&temp_path, meta.uid(), meta.gid())?;
            fs::rename(&temp_path, path)?;
        }
        Some(node @ (FileKind::Fifo | FileKind::BlockDevice | FileKind::CharDevice)) => {
            let temp_path = temp_sibling(path);
            make_node(&temp_path, node, meta.mode() & 0o7777, meta.rdev())?;
            set_owner(&temp_path, meta.uid(), meta.gid())?;
            set_mtime(&temp_path, mtime_ms(meta))?;
            fs::rename(&temp_path, path)?;
        }
        Some(FileKind::Directory) | None => {}
    }
    Ok(())
}
