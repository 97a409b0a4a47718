//! Chunked delta reception.
//!
//! The server has sent the digests of a candidate file. The sender answers
//! per chunk, in order, with either NEXT_CHUNK (reuse the candidate's chunk
//! at the same index) or NEXT plus a literal block, and ends with DONE. The
//! result is built in a temp file, or rewritten in place when the candidate
//! is the target itself and no other snapshot can see the inode.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::trace;

use crate::error::ProtocolError;
use crate::fsops;
use crate::protocol::{token, CHUNK_SIZE};
use crate::transfer::{open_in_place, read_block_len, salvage_partial, Received};
use crate::wire::WireReader;

/// Where reused and literal chunks are written.
enum Sink<'a> {
    /// Sequential writes into a temp file.
    Temp(BufWriter<&'a mut File>),
    /// Positioned writes into the candidate itself.
    InPlace(&'a File),
}

struct ChunkedReceiver<'a> {
    candidate: &'a File,
    candidate_size: u64,
    sink: Sink<'a>,
    /// Sequential index of the next chunk.
    chunk: u64,
    pos: u64,
    buffer: Vec<u8>,
    received: Received,
}

impl ChunkedReceiver<'_> {
    fn chunk_len(&self, index: u64) -> usize {
        let start = index * CHUNK_SIZE as u64;
        (self.candidate_size - start).min(CHUNK_SIZE as u64) as usize
    }

    fn reuse(&mut self) -> Result<()> {
        let index = self.chunk;
        let chunks = self.candidate_size.div_ceil(CHUNK_SIZE as u64);
        if index >= chunks {
            return Err(ProtocolError::InvalidValue {
                what: "chunk index",
                value: index as i64,
            }
            .into());
        }
        let offset = index * CHUNK_SIZE as u64;
        let len = self.chunk_len(index);
        match &mut self.sink {
            // Literal blocks never exceed a chunk, so offset >= pos and the
            // source range has not been overwritten yet
            Sink::InPlace(_) if offset == self.pos => {}
            Sink::InPlace(file) => {
                self.candidate.read_exact_at(&mut self.buffer[..len], offset)?;
                file.write_all_at(&self.buffer[..len], self.pos)?;
            }
            Sink::Temp(out) => {
                self.candidate.read_exact_at(&mut self.buffer[..len], offset)?;
                out.write_all(&self.buffer[..len])?;
            }
        }
        trace!(index, len, "chunk reused");
        self.chunk += 1;
        self.pos += len as u64;
        self.received.reused += len as u64;
        Ok(())
    }

    fn literal<R: Read>(&mut self, r: &mut WireReader<R>) -> Result<()> {
        let len = read_block_len(r)?;
        r.read_exact(&mut self.buffer[..len])?;
        match &mut self.sink {
            Sink::InPlace(file) => file.write_all_at(&self.buffer[..len], self.pos)?,
            Sink::Temp(out) => out.write_all(&self.buffer[..len])?,
        }
        trace!(len, pos = self.pos, "literal block");
        self.chunk += 1;
        self.pos += len as u64;
        self.received.literal += len as u64;
        Ok(())
    }

    fn run<R: Read>(&mut self, r: &mut WireReader<R>) -> Result<()> {
        loop {
            match r.read_u8()? {
                token::NEXT => self.literal(r)?,
                token::NEXT_CHUNK => self.reuse()?,
                token::DONE => break,
                other => {
                    return Err(ProtocolError::UnexpectedToken {
                        found: other,
                        context: "receiving chunked data",
                    }
                    .into())
                }
            }
        }
        match &mut self.sink {
            Sink::InPlace(file) => file.set_len(self.pos)?,
            Sink::Temp(out) => out.flush()?,
        }
        Ok(())
    }
}

/// Receive a chunked file into `target` using `candidate` for reused chunks.
///
/// `candidate_size` must be the size the digests were computed over.
pub fn receive_chunked<R: Read>(
    r: &mut WireReader<R>,
    target: &Path,
    candidate: &Path,
    candidate_size: u64,
    in_place: bool,
) -> Result<Received> {
    if in_place {
        let file = open_in_place(target)
            .with_context(|| format!("open {} for in-place update", target.display()))?;
        let mut receiver = ChunkedReceiver {
            candidate: &file,
            candidate_size,
            sink: Sink::InPlace(&file),
            chunk: 0,
            pos: 0,
            buffer: vec![0u8; CHUNK_SIZE],
            received: Received::default(),
        };
        receiver.run(r)?;
        return Ok(receiver.received);
    }

    let source = File::open(candidate)
        .with_context(|| format!("open candidate {}", candidate.display()))?;
    let mut temp = fsops::temp_file_for(target)?;
    let result = {
        let mut receiver = ChunkedReceiver {
            candidate: &source,
            candidate_size,
            sink: Sink::Temp(BufWriter::with_capacity(CHUNK_SIZE, temp.as_file_mut())),
            chunk: 0,
            pos: 0,
            buffer: vec![0u8; CHUNK_SIZE],
            received: Received::default(),
        };
        receiver.run(r).map(|()| receiver.received)
    };
    match result {
        Ok(received) => {
            fsops::persist(temp, target)?;
            Ok(received)
        }
        Err(err) => {
            salvage_partial(temp, target);
            Err(err)
        }
    }
}
