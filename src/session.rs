//! Session driver: one connection, one source, one pass.
//!
//! START/OK handshake, then batches of records until the end marker. Each
//! batch is reconciled record by record, answered with one result per
//! present slot, followed by a data phase for the files that asked for
//! bytes. Directories left by the stream are completed after the data
//! phase of the batch that left them.

use anyhow::{Context, Result};
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeSet;
use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::thread::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::activity::{ActivityHandle, ActivityRegistry};
use crate::config::DaemonConfig;
use crate::delta::receive_chunked;
use crate::dirstack::{DirectoryFrame, DirectoryStack};
use crate::error::ProtocolError;
use crate::journal::{PassJournal, PassRecord};
use crate::naming::{prepare_backup, prepare_failover, rename_checked, SourceLayout, WorkingSet};
use crate::params::SessionParams;
use crate::protocol::{frame, token, CHUNK_SIZE, END_OF_BATCHES, MAX_BATCH_SIZE};
use crate::protocol_core::{read_frame, write_frame};
use crate::reconcile::{DataPlan, Decision, Reconciler};
use crate::record::{FileKind, FileRecord};
use crate::rotation::{rotate, RetentionPolicy, RotationReport};
use crate::rules::PathRules;
use crate::transfer::receive_whole;
use crate::wire::{WireReader, WireWriter};

/// Counters for one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub batches: u64,
    /// Present slots.
    pub scanned: u64,
    /// Slots answered with anything but no-change.
    pub updated: u64,
    /// Files whose bytes were requested.
    pub requested: u64,
    pub literal_bytes: u64,
    pub reused_bytes: u64,
    /// Entries deleted by directory completion.
    pub removed: u64,
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub params: SessionParams,
    pub stats: SessionStats,
    /// Database servers that need a restart after this failover pass.
    pub restart_servers: BTreeSet<String>,
    pub rotation: Option<RotationReport>,
    /// Background removal of `.deleted` directories, if one was started.
    pub removal: Option<JoinHandle<()>>,
}

/// Run one session over a connected stream split into its two halves.
pub fn run_session<R: Read, W: Write>(
    reader: R,
    writer: W,
    config: &DaemonConfig,
    activity: &ActivityRegistry,
) -> Result<SessionOutcome> {
    let mut reader = BufReader::with_capacity(CHUNK_SIZE, reader);
    let mut writer = BufWriter::with_capacity(CHUNK_SIZE, writer);

    let params = match accept_start(&mut reader, config) {
        Ok(params) => params,
        Err(e) => {
            refuse(&mut writer, &e);
            return Err(e);
        }
    };
    info!(
        failover_id = params.failover_id,
        source = %params.source,
        retention = params.retention,
        partition = %params.partition.display(),
        date = %params.date,
        compression = params.compression,
        "session start"
    );

    let started = Utc::now();
    let handle = activity.begin(params.failover_id, &params.source);
    let mut stats = SessionStats::default();
    let result = replicate(reader, writer, &params, config, &handle, &mut stats);
    let finished = Utc::now();

    if config.journal {
        let record = PassRecord {
            failover_id: params.failover_id,
            source: params.source.clone(),
            date: params.date,
            started,
            finished,
            scanned: stats.scanned,
            updated: stats.updated,
            bytes: stats.literal_bytes + stats.reused_bytes,
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| format!("{:#}", e)),
        };
        if let Err(e) = PassJournal::new(&params.partition).append(&record) {
            warn!(error = %e, "could not append pass journal");
        }
    }

    match result {
        Ok(finish) => {
            info!(
                source = %params.source,
                scanned = stats.scanned,
                updated = stats.updated,
                literal = stats.literal_bytes,
                reused = stats.reused_bytes,
                removed = stats.removed,
                elapsed_ms = (finished - started).num_milliseconds(),
                "session complete"
            );
            Ok(SessionOutcome {
                params,
                stats,
                restart_servers: finish.restart_servers,
                rotation: finish.rotation,
                removal: finish.removal,
            })
        }
        Err(e) => {
            error!(source = %params.source, error = %format!("{:#}", e), "session aborted");
            Err(e)
        }
    }
}

fn accept_start<R: Read>(reader: &mut R, config: &DaemonConfig) -> Result<SessionParams> {
    let (frame_type, payload) = read_frame(reader).context("read START frame")?;
    if frame_type != frame::START {
        return Err(ProtocolError::UnexpectedToken {
            found: frame_type,
            context: "expecting START frame",
        }
        .into());
    }
    let params = SessionParams::decode(&payload)?;
    if !config.partition_enabled(&params.partition) {
        return Err(ProtocolError::InvalidParameter {
            field: "partition",
            reason: format!("{} is not an enabled partition", params.partition.display()),
        }
        .into());
    }
    Ok(params)
}

fn refuse<W: Write>(writer: &mut W, err: &anyhow::Error) {
    let message = format!("{:#}", err);
    warn!(error = %message, "refusing session");
    if let Err(e) = write_frame(writer, frame::ERROR, message.as_bytes()) {
        debug!(error = %e, "could not deliver ERROR frame");
    }
}

struct Finish {
    restart_servers: BTreeSet<String>,
    rotation: Option<RotationReport>,
    removal: Option<JoinHandle<()>>,
}

fn prepare(params: &SessionParams) -> Result<(SourceLayout, WorkingSet)> {
    fs::create_dir_all(&params.partition)
        .with_context(|| format!("create partition {}", params.partition.display()))?;
    let layout = SourceLayout::new(&params.partition, &params.source);
    let working_set = if params.is_failover() {
        prepare_failover(&layout)?
    } else {
        prepare_backup(&layout, params.date)?
    };
    Ok((layout, working_set))
}

fn replicate<R: Read, W: Write>(
    reader: BufReader<R>,
    mut writer: BufWriter<W>,
    params: &SessionParams,
    config: &DaemonConfig,
    activity: &ActivityHandle,
    stats: &mut SessionStats,
) -> Result<Finish> {
    let (layout, working_set) = match prepare(params) {
        Ok(prepared) => prepared,
        Err(e) => {
            refuse(&mut writer, &e);
            return Err(e);
        }
    };
    write_frame(&mut writer, frame::OK, &[])?;

    let rules = PathRules::for_session(&config.replication, params.is_failover());
    let mut pass = Pass {
        reconciler: Reconciler::new(&working_set, params, rules),
        stack: DirectoryStack::new(),
        activity,
        stats,
    };

    if params.compression {
        let mut r = WireReader::new(GzDecoder::new(reader));
        let mut w = WireWriter::new(GzEncoder::new(writer, Compression::default()));
        pass.run(&mut r, &mut w, &working_set)?;
    } else {
        let mut r = WireReader::new(reader);
        let mut w = WireWriter::new(writer);
        pass.run(&mut r, &mut w, &working_set)?;
    }
    let restart_servers = pass.reconciler.restart_servers().clone();
    for server in &restart_servers {
        info!(server = %server, "database server must be restarted");
    }

    let mut finish = Finish {
        restart_servers,
        rotation: None,
        removal: None,
    };
    if !params.is_failover() {
        let policy = RetentionPolicy::new(params.retention as u32, &config.replication.retention_levels);
        match rotate(&layout, params.date, &policy) {
            Ok((report, removal)) => {
                info!(
                    recycled = report.recycled.len(),
                    deleted = report.deleted.len(),
                    failures = report.failures,
                    "rotation done"
                );
                finish.rotation = Some(report);
                finish.removal = removal;
            }
            Err(e) => warn!(error = %format!("{:#}", e), "rotation failed"),
        }
    }
    Ok(finish)
}

/// Mutable state of one pass over the record stream.
struct Pass<'a> {
    reconciler: Reconciler,
    stack: DirectoryStack,
    activity: &'a ActivityHandle,
    stats: &'a mut SessionStats,
}

impl Pass<'_> {
    fn run<R: Read, W: Write>(
        &mut self,
        r: &mut WireReader<R>,
        w: &mut WireWriter<W>,
        working_set: &WorkingSet,
    ) -> Result<()> {
        loop {
            let size = r.read_compressed_int()?;
            if size == END_OF_BATCHES {
                break;
            }
            if !(0..=MAX_BATCH_SIZE).contains(&size) {
                return Err(ProtocolError::InvalidValue {
                    what: "batch size",
                    value: size as i64,
                }
                .into());
            }
            self.batch(r, w, size as usize)?;
        }

        for frame in self.stack.drain() {
            self.finish_directory(&frame)?;
        }
        if let Some(final_path) = &working_set.final_path {
            rename_checked(&working_set.working, final_path)?;
            info!(path = %final_path.display(), "pass completed");
        }
        w.write_u8(token::DONE)?;
        w.flush()?;
        trace!("sent DONE");
        Ok(())
    }

    fn batch<R: Read, W: Write>(
        &mut self,
        r: &mut WireReader<R>,
        w: &mut WireWriter<W>,
        size: usize,
    ) -> Result<()> {
        self.stats.batches += 1;
        let mut decisions: Vec<Decision> = Vec::with_capacity(size);
        let mut left: Vec<DirectoryFrame> = Vec::new();

        for _ in 0..size {
            if !r.read_bool()? {
                continue;
            }
            let rec = FileRecord::read(r)?;
            self.stats.scanned += 1;
            left.extend(self.stack.enter(&rec)?);
            self.activity.record("reconcile", &rec.path);
            let decision = self.reconciler.reconcile(&rec)?;
            debug!(path = %rec.path, outcome = ?decision.outcome, "reconciled");
            if rec.kind == FileKind::Directory {
                self.open_directory(&rec);
            }
            decisions.push(decision);
        }

        w.write_u8(token::NEXT)?;
        for decision in &decisions {
            w.write_u8(decision.outcome.code())?;
            if let Some(pending) = &decision.pending {
                if let DataPlan::Chunked { digests, .. } = &pending.plan {
                    digests.write(w)?;
                }
            }
            if decision.outcome.is_modified() {
                self.stats.updated += 1;
            }
        }
        w.flush()?;
        trace!(results = decisions.len(), "sent batch results");

        for pending in decisions.iter().filter_map(|d| d.pending.as_ref()) {
            self.activity.record("receive", &pending.record.path);
            let received = match &pending.plan {
                DataPlan::Whole { placeholder } => receive_whole(r, &pending.target, *placeholder),
                DataPlan::Chunked {
                    candidate,
                    digests,
                    in_place,
                } => receive_chunked(r, &pending.target, candidate, digests.size, *in_place),
            }
            .with_context(|| format!("receive {}", pending.record.path))?;
            self.reconciler.complete_data(pending, received)?;
            self.stats.requested += 1;
            self.stats.literal_bytes += received.literal;
            self.stats.reused_bytes += received.reused;
            debug!(
                path = %pending.record.path,
                literal = received.literal,
                reused = received.reused,
                "received"
            );
        }

        for frame in left {
            self.finish_directory(&frame)?;
        }
        Ok(())
    }

    fn open_directory(&mut self, rec: &FileRecord) {
        let dir = rec.under(self.reconciler.working());
        let link_to = self.reconciler.link_to().map(|root| rec.under(root));
        self.stack.push(DirectoryFrame::new(rec, dir, link_to));
    }

    fn finish_directory(&mut self, frame: &DirectoryFrame) -> Result<()> {
        self.activity.record("complete", &frame.record_path);
        let removed = self.reconciler.finish_directory(frame)?;
        self.stats.removed += removed as u64;
        Ok(())
    }
}
