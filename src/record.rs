//! File descriptor records as streamed by the source.

use crate::error::ProtocolError;
use crate::protocol::mode::*;
use crate::wire::{WireReader, WireWriter};
use anyhow::Result;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
}

impl FileKind {
    pub fn from_mode(path: &str, mode: u32) -> Result<Self, ProtocolError> {
        match mode & S_IFMT {
            S_IFREG => Ok(Self::Regular),
            S_IFDIR => Ok(Self::Directory),
            S_IFLNK => Ok(Self::Symlink),
            S_IFBLK => Ok(Self::BlockDevice),
            S_IFCHR => Ok(Self::CharDevice),
            S_IFIFO => Ok(Self::Fifo),
            _ => Err(ProtocolError::UnsupportedFileType {
                path: path.to_string(),
                mode,
            }),
        }
    }

    /// Kind of an on-disk object from lstat metadata.
    pub fn of(meta: &std::fs::Metadata) -> Option<Self> {
        use std::os::unix::fs::FileTypeExt;
        let ft = meta.file_type();
        if ft.is_file() {
            Some(Self::Regular)
        } else if ft.is_dir() {
            Some(Self::Directory)
        } else if ft.is_symlink() {
            Some(Self::Symlink)
        } else if ft.is_block_device() {
            Some(Self::BlockDevice)
        } else if ft.is_char_device() {
            Some(Self::CharDevice)
        } else if ft.is_fifo() {
            Some(Self::Fifo)
        } else {
            None
        }
    }

    pub fn is_device(self) -> bool {
        matches!(self, Self::BlockDevice | Self::CharDevice)
    }
}

/// One file as described by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Absolute, validated path such as `/etc/passwd`; the root is `/`.
    pub path: String,
    pub mode: u32,
    pub kind: FileKind,
    /// Byte length; zero for everything but regular files.
    pub length: u64,
    pub uid: u32,
    pub gid: u32,
    /// Milliseconds since the epoch; `None` for symlinks.
    pub mtime_ms: Option<i64>,
    pub symlink_target: Option<String>,
    pub device: Option<u64>,
}

/// Reject anything that is not a canonical absolute path.
pub fn validate_path(path: &str) -> Result<(), ProtocolError> {
    let invalid = |reason| ProtocolError::InvalidPath {
        path: path.to_string(),
        reason,
    };
    if !path.starts_with('/') {
        return Err(invalid("not absolute"));
    }
    if path.contains('\0') {
        return Err(invalid("contains NUL"));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(invalid("trailing slash"));
    }
    if path.contains("//") {
        return Err(invalid("empty component"));
    }
    for component in path[1..].split('/') {
        if component == "." || component == ".." {
            return Err(invalid("relative component"));
        }
    }
    Ok(())
}

fn validate_symlink_target(path: &str, target: &str) -> Result<(), ProtocolError> {
    if target.is_empty() {
        return Err(ProtocolError::InvalidSymlinkTarget {
            path: path.to_string(),
            reason: "empty",
        });
    }
    if target.contains('\0') {
        return Err(ProtocolError::InvalidSymlinkTarget {
            path: path.to_string(),
            reason: "contains NUL",
        });
    }
    Ok(())
}

fn non_negative(what: &'static str, value: i64) -> Result<u64, ProtocolError> {
    if value < 0 {
        return Err(ProtocolError::InvalidValue { what, value });
    }
    Ok(value as u64)
}

impl FileRecord {
    pub fn read<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        let path = r.read_utf()?;
        validate_path(&path)?;
        let mode = r.read_long()?;
        if mode < 0 || mode > u32::MAX as i64 {
            return Err(ProtocolError::InvalidValue { what: "mode", value: mode }.into());
        }
        let mode = mode as u32;
        let kind = FileKind::from_mode(&path, mode)?;
        let length = if kind == FileKind::Regular {
            non_negative("length", r.read_long()?)?
        } else {
            0
        };
        let uid = non_negative("uid", r.read_compressed_int()? as i64)? as u32;
        let gid = non_negative("gid", r.read_compressed_int()? as i64)? as u32;
        let mtime_ms = if kind == FileKind::Symlink {
            None
        } else {
            Some(r.read_long()?)
        };
        let symlink_target = if kind == FileKind::Symlink {
            let target = r.read_utf()?;
            validate_symlink_target(&path, &target)?;
            Some(target)
        } else {
            None
        };
        let device = if kind.is_device() {
            Some(r.read_long()? as u64)
        } else {
            None
        };
        Ok(Self {
            path,
            mode,
            kind,
            length,
            uid,
            gid,
            mtime_ms,
            symlink_target,
            device,
        })
    }

    pub fn write<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_utf(&self.path)?;
        w.write_long(self.mode as i64)?;
        if self.kind == FileKind::Regular {
            w.write_long(self.length as i64)?;
        }
        w.write_compressed_int(self.uid as i32)?;
        w.write_compressed_int(self.gid as i32)?;
        if self.kind != FileKind::Symlink {
            w.write_long(self.mtime_ms.unwrap_or(0))?;
        }
        if self.kind == FileKind::Symlink {
            w.write_utf(self.symlink_target.as_deref().unwrap_or(""))?;
        }
        if self.kind.is_device() {
            w.write_long(self.device.unwrap_or(0) as i64)?;
        }
        Ok(())
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    pub fn permissions(&self) -> u32 {
        self.mode & PERMISSIONS
    }

    /// Path below the root, without the leading slash; empty for the root.
    pub fn relative(&self) -> &str {
        &self.path[1..]
    }

    /// Record path of the containing directory; `None` for the root.
    pub fn parent(&self) -> Option<&str> {
        parent_of(&self.path)
    }

    /// Final component; empty for the root.
    pub fn file_name(&self) -> &str {
        match self.path.rfind('/') {
            Some(i) => &self.path[i + 1..],
            None => &self.path,
        }
    }

    /// Location of this record under `root`.
    pub fn under(&self, root: &Path) -> PathBuf {
        if self.is_root() {
            root.to_path_buf()
        } else {
            root.join(self.relative())
        }
    }
}

pub fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// `ancestor` is a strict ancestor directory of `path`.
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    if ancestor == "/" {
        return path != "/";
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}
