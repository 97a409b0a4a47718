//! Push client: walk a local tree and replicate it to a daemon.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File, Metadata};
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};
use walkdir::{DirEntry, WalkDir};

use crate::checksum::{read_full, CandidateDigests, ChunkDigest};
use crate::error::ProtocolError;
use crate::fsops;
use crate::params::SessionParams;
use crate::protocol::{frame, token, CHUNK_SIZE, END_OF_BATCHES, MAX_BATCH_SIZE};
use crate::protocol_core::{read_handshake_reply, write_frame};
use crate::reconcile::Outcome;
use crate::record::{FileKind, FileRecord};
use crate::server::tune_socket;
use crate::wire::{WireReader, WireWriter};

/// What the server answered, and what went over the wire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PushStats {
    pub records: u64,
    pub no_change: u64,
    pub modified: u64,
    pub whole: u64,
    pub chunked: u64,
    pub literal_bytes: u64,
    pub reused_chunks: u64,
}

/// Connect to `addr` and push `root` under `params`.
pub fn push_tcp(addr: &str, root: &Path, params: &SessionParams) -> Result<PushStats> {
    let stream = TcpStream::connect(addr).with_context(|| format!("connect {}", addr))?;
    tune_socket(&stream);
    let reader = stream.try_clone().context("clone socket")?;
    push(reader, stream, root, params, MAX_BATCH_SIZE as usize)
}

/// Push `root` over an already connected stream.
pub fn push<R: Read, W: Write>(
    reader: R,
    writer: W,
    root: &Path,
    params: &SessionParams,
    batch_size: usize,
) -> Result<PushStats> {
    if !(1..=MAX_BATCH_SIZE as usize).contains(&batch_size) {
        bail!("batch size {} out of range", batch_size);
    }
    let root_meta = fs::metadata(root).with_context(|| format!("stat {}", root.display()))?;
    if !root_meta.is_dir() {
        bail!("{} is not a directory", root.display());
    }

    let mut reader = BufReader::with_capacity(CHUNK_SIZE, reader);
    let mut writer = BufWriter::with_capacity(CHUNK_SIZE, writer);
    write_frame(&mut writer, frame::START, &params.encode()?)?;
    read_handshake_reply(&mut reader)?;
    info!(source = %params.source, root = %root.display(), "session accepted");

    let stats = if params.compression {
        let mut r = WireReader::new(GzDecoder::new(reader));
        let mut w = WireWriter::new(GzEncoder::new(writer, Compression::default()));
        Pusher::new(root, batch_size).run(&mut r, &mut w)?
    } else {
        let mut r = WireReader::new(reader);
        let mut w = WireWriter::new(writer);
        Pusher::new(root, batch_size).run(&mut r, &mut w)?
    };
    info!(
        records = stats.records,
        modified = stats.modified,
        literal = stats.literal_bytes,
        reused_chunks = stats.reused_chunks,
        "push complete"
    );
    Ok(stats)
}

/// One walked entry: its wire record and where its bytes live locally.
struct Entry {
    record: FileRecord,
    local: PathBuf,
}

fn utf8_name(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || entry.file_name().to_str().is_some() {
        return true;
    }
    warn!(path = %entry.path().display(), "skipping non UTF-8 name");
    false
}

/// Wire path of `local` below `root`.
fn record_path(root: &Path, local: &Path) -> Result<String> {
    let rel = local.strip_prefix(root)?;
    let mut path = String::new();
    for component in rel.iter() {
        path.push('/');
        path.push_str(component.to_str().context("non UTF-8 path")?);
    }
    if path.is_empty() {
        path.push('/');
    }
    Ok(path)
}

fn describe(path: String, local: &Path, meta: &Metadata) -> Result<Option<FileRecord>> {
    let Some(kind) = FileKind::of(meta) else {
        debug!(path = %path, "skipping unsupported file type");
        return Ok(None);
    };
    let symlink_target = if kind == FileKind::Symlink {
        let target = fs::read_link(local)?;
        match target.to_str() {
            Some(t) => Some(t.to_string()),
            None => {
                warn!(path = %path, "skipping symlink with non UTF-8 target");
                return Ok(None);
            }
        }
    } else {
        None
    };
    Ok(Some(FileRecord {
        path,
        mode: meta.mode(),
        kind,
        length: if kind == FileKind::Regular { meta.len() } else { 0 },
        uid: meta.uid(),
        gid: meta.gid(),
        mtime_ms: (kind != FileKind::Symlink).then(|| fsops::mtime_ms(meta)),
        symlink_target,
        device: kind.is_device().then(|| meta.rdev()),
    }))
}

struct Pusher<'a> {
    root: &'a Path,
    batch_size: usize,
    stats: PushStats,
    buffer: Vec<u8>,
}

impl<'a> Pusher<'a> {
    fn new(root: &'a Path, batch_size: usize) -> Self {
        Self {
            root,
            batch_size,
            stats: PushStats::default(),
            buffer: vec![0u8; CHUNK_SIZE],
        }
    }

    fn run<R: Read, W: Write>(mut self, r: &mut WireReader<R>, w: &mut WireWriter<W>) -> Result<PushStats> {
        let walker = WalkDir::new(self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(utf8_name);

        let mut batch = Vec::with_capacity(self.batch_size);
        for entry in walker {
            let entry = entry?;
            let meta = entry.metadata()?;
            let path = record_path(self.root, entry.path())?;
            if let Some(record) = describe(path, entry.path(), &meta)? {
                batch.push(Entry {
                    record,
                    local: entry.into_path(),
                });
            }
            if batch.len() == self.batch_size {
                self.batch(r, w, &batch)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.batch(r, w, &batch)?;
        }

        w.write_compressed_int(END_OF_BATCHES)?;
        w.flush()?;
        match r.read_u8()? {
            token::DONE => Ok(self.stats),
            other => Err(ProtocolError::UnexpectedToken {
                found: other,
                context: "waiting for end of session",
            }
            .into()),
        }
    }

    fn batch<R: Read, W: Write>(
        &mut self,
        r: &mut WireReader<R>,
        w: &mut WireWriter<W>,
        batch: &[Entry],
    ) -> Result<()> {
        w.write_compressed_int(batch.len() as i32)?;
        for entry in batch {
            w.write_bool(true)?;
            entry.record.write(w)?;
        }
        w.flush()?;
        trace!(slots = batch.len(), "sent batch");

        let found = r.read_u8()?;
        if found != token::NEXT {
            return Err(ProtocolError::UnexpectedToken {
                found,
                context: "waiting for batch results",
            }
            .into());
        }
        let mut requests: Vec<(&Entry, Option<CandidateDigests>)> = Vec::new();
        for entry in batch {
            let code = r.read_u8()?;
            let outcome = Outcome::from_code(code).ok_or(ProtocolError::InvalidValue {
                what: "result code",
                value: code as i64,
            })?;
            self.stats.records += 1;
            match outcome {
                Outcome::NoChange => self.stats.no_change += 1,
                Outcome::Modified => self.stats.modified += 1,
                Outcome::RequestData => {
                    self.stats.modified += 1;
                    requests.push((entry, None));
                }
                Outcome::RequestChunked => {
                    self.stats.modified += 1;
                    requests.push((entry, Some(CandidateDigests::read(r)?)));
                }
            }
        }

        for (entry, digests) in requests {
            let mut file =
                File::open(&entry.local).with_context(|| format!("open {}", entry.local.display()))?;
            match digests {
                None => {
                    self.send_whole(w, &mut file)?;
                    self.stats.whole += 1;
                }
                Some(digests) => {
                    self.send_chunked(w, &mut file, &digests)?;
                    self.stats.chunked += 1;
                }
            }
            debug!(path = %entry.record.path, "sent data");
        }
        w.flush()?;
        Ok(())
    }

    fn send_block<W: Write>(&mut self, w: &mut WireWriter<W>, len: usize) -> Result<()> {
        w.write_u8(token::NEXT)?;
        w.write_compressed_int(len as i32)?;
        w.write_all(&self.buffer[..len])?;
        self.stats.literal_bytes += len as u64;
        Ok(())
    }

    fn send_whole<W: Write>(&mut self, w: &mut WireWriter<W>, file: &mut File) -> Result<()> {
        loop {
            let n = read_full(file, &mut self.buffer)?;
            if n == 0 {
                break;
            }
            self.send_block(w, n)?;
        }
        w.write_u8(token::DONE)?;
        Ok(())
    }

    /// Chunk `i` of the local file is skipped when it hashes to the server's chunk `i`.
    fn send_chunked<W: Write>(
        &mut self,
        w: &mut WireWriter<W>,
        file: &mut File,
        digests: &CandidateDigests,
    ) -> Result<()> {
        let mut index = 0usize;
        loop {
            let n = read_full(file, &mut self.buffer)?;
            if n == 0 {
                break;
            }
            let reuse = digests
                .chunks
                .get(index)
                .is_some_and(|d| *d == ChunkDigest::of(&self.buffer[..n]));
            if reuse {
                w.write_u8(token::NEXT_CHUNK)?;
                self.stats.reused_chunks += 1;
            } else {
                self.send_block(w, n)?;
            }
            index += 1;
        }
        w.write_u8(token::DONE)?;
        Ok(())
    }
}
