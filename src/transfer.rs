//! Whole-file reception and salvage of interrupted transfers.

use anyhow::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

use crate::error::ProtocolError;
use crate::fsops;
use crate::protocol::{token, CHUNK_SIZE};
use crate::wire::WireReader;

/// Byte accounting for one received file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Bytes that crossed the wire.
    pub literal: u64,
    /// Bytes taken from a local candidate.
    pub reused: u64,
}

impl Received {
    pub fn total(&self) -> u64 {
        self.literal + self.reused
    }
}

/// Length of the data block that follows a NEXT token.
pub(crate) fn read_block_len<R: Read>(r: &mut WireReader<R>) -> Result<usize> {
    let len = r.read_compressed_int()?;
    if len < 1 {
        return Err(ProtocolError::InvalidValue {
            what: "block length",
            value: len as i64,
        }
        .into());
    }
    if len as usize > CHUNK_SIZE {
        return Err(ProtocolError::OversizedBlock {
            len: len as i64,
            max: CHUNK_SIZE,
        }
        .into());
    }
    Ok(len as usize)
}

fn copy_blocks<R: Read, W: Write>(r: &mut WireReader<R>, out: &mut W) -> Result<u64> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        match r.read_u8()? {
            token::NEXT => {
                let len = read_block_len(r)?;
                r.read_exact(&mut buffer[..len])?;
                out.write_all(&buffer[..len])?;
                total += len as u64;
                trace!(len, total, "data block");
            }
            token::DONE => break,
            other => {
                return Err(ProtocolError::UnexpectedToken {
                    found: other,
                    context: "receiving file data",
                }
                .into())
            }
        }
    }
    out.flush()?;
    Ok(total)
}

/// Receive a whole file into `target`.
///
/// A freshly created placeholder is written directly; an existing target is
/// replaced atomically from a temp file in the same directory.
pub fn receive_whole<R: Read>(
    r: &mut WireReader<R>,
    target: &Path,
    placeholder: bool,
) -> Result<Received> {
    if placeholder {
        let file = OpenOptions::new().write(true).truncate(true).open(target)?;
        let mut out = BufWriter::with_capacity(CHUNK_SIZE, file);
        let literal = copy_blocks(r, &mut out)?;
        return Ok(Received { literal, reused: 0 });
    }

    let mut temp = fsops::temp_file_for(target)?;
    let result = {
        let mut out = BufWriter::with_capacity(CHUNK_SIZE, temp.as_file_mut());
        copy_blocks(r, &mut out)
    };
    match result {
        Ok(literal) => {
            fsops::persist(temp, target)?;
            Ok(Received { literal, reused: 0 })
        }
        Err(err) => {
            salvage_partial(temp, target);
            Err(err)
        }
    }
}

/// After a failed transfer keep whichever of {temp file, existing target}
/// is longer as the target.
pub fn salvage_partial(temp: NamedTempFile, target: &Path) {
    let temp_len = temp.as_file().metadata().map(|m| m.len()).unwrap_or(0);
    let target_len = match fsops::lstat(target) {
        Ok(Some(meta)) if meta.is_file() => Some(meta.len()),
        _ => None,
    };
    let keep_temp = match target_len {
        Some(len) => temp_len > len,
        None => temp_len > 0,
    };
    if keep_temp {
        match fsops::persist(temp, target) {
            Ok(_) => warn!(
                target = %target.display(),
                kept = temp_len,
                "transfer interrupted, kept partial data"
            ),
            Err(e) => warn!(target = %target.display(), error = %e, "salvage failed"),
        }
    } else {
        debug!(target = %target.display(), discarded = temp_len, "transfer interrupted, kept existing file");
    }
}

/// Open an existing file for positioned rewriting.
pub(crate) fn open_in_place(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}
