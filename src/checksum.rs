//! Per-chunk MD5 digests for the chunked delta sub-protocol

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::protocol::{chunk_count, CHUNK_SIZE, MAX_CHUNKS};
use crate::wire::{WireReader, WireWriter};

/// MD5 of one chunk, carried as two big-endian signed halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkDigest {
    pub hi: i64,
    pub lo: i64,
}

impl ChunkDigest {
    pub fn of(data: &[u8]) -> Self {
        let digest = md5::compute(data).0;
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&digest[..8]);
        lo.copy_from_slice(&digest[8..]);
        Self {
            hi: i64::from_be_bytes(hi),
            lo: i64::from_be_bytes(lo),
        }
    }

    pub fn read<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        Ok(Self {
            hi: r.read_long()?,
            lo: r.read_long()?,
        })
    }

    pub fn write<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_long(self.hi)?;
        w.write_long(self.lo)
    }
}

/// Digests of a candidate file as offered to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDigests {
    /// Bytes covered by `chunks`.
    pub size: u64,
    pub chunks: Vec<ChunkDigest>,
}

impl CandidateDigests {
    pub fn write<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_long(self.size as i64)?;
        for chunk in &self.chunks {
            chunk.write(w)?;
        }
        Ok(())
    }

    /// Counterpart of `write`; the chunk count follows from the size.
    pub fn read<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        let size = r.read_long()?;
        if size < 0 || chunk_count(size as u64) > MAX_CHUNKS {
            anyhow::bail!("invalid candidate size {}", size);
        }
        let count = chunk_count(size as u64);
        let mut chunks = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            chunks.push(ChunkDigest::read(r)?);
        }
        Ok(Self {
            size: size as u64,
            chunks,
        })
    }
}

/// Fill `buf` as far as the reader allows; short only at end of input.
pub fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Hash `path` chunk by chunk without holding more than one chunk in memory.
pub fn chunk_digests(path: &Path) -> Result<CandidateDigests> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut chunks = Vec::new();
    let mut size = 0u64;
    loop {
        let n = read_full(&mut file, &mut buffer)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        chunks.push(ChunkDigest::of(&buffer[..n]));
        size += n as u64;
        if n < CHUNK_SIZE {
            break;
        }
    }
    Ok(CandidateDigests { size, chunks })
}
