//! Dated directory names and working-directory selection.
//!
//! Backup trees live at `<partition>/<source>/YYYY-MM-DD[suffix]`. A pass
//! fills a `.partial` (or `.recycled.partial`) directory and renames it to the
//! bare date on success; rotation later demotes it to `.recycled` or
//! `.deleted`.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::ConsistencyError;
use crate::fsops;

/// Reserved name for the content-addressed chunk store under a partition.
pub const DATA_INDEX_DIR: &str = "DATA-INDEX";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Suffix {
    Complete,
    Partial,
    RecycledPartial,
    Recycled,
    Deleted,
}

impl Suffix {
    const ALL: [Suffix; 5] = [
        Suffix::Complete,
        Suffix::Partial,
        Suffix::RecycledPartial,
        Suffix::Recycled,
        Suffix::Deleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Suffix::Complete => "",
            Suffix::Partial => ".partial",
            Suffix::RecycledPartial => ".recycled.partial",
            Suffix::Recycled => ".recycled",
            Suffix::Deleted => ".deleted",
        }
    }
}

/// A parsed dated directory name such as `2024-03-01.recycled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatedName {
    pub date: NaiveDate,
    pub suffix: Suffix,
}

impl DatedName {
    pub fn new(date: NaiveDate, suffix: Suffix) -> Self {
        Self { date, suffix }
    }

    /// `None` for anything that is not exactly a date plus a known suffix.
    pub fn parse(name: &str) -> Option<Self> {
        let date_part = name.get(..10)?;
        let date = NaiveDate::parse_from_str(date_part, DATE_FORMAT).ok()?;
        let rest = &name[10..];
        let suffix = Suffix::ALL.into_iter().find(|s| s.as_str() == rest)?;
        let parsed = Self { date, suffix };
        // Reject non-canonical spellings such as unpadded months
        (parsed.file_name() == name).then_some(parsed)
    }

    pub fn file_name(&self) -> String {
        format!("{}{}", self.date.format(DATE_FORMAT), self.suffix.as_str())
    }

    pub fn with_suffix(self, suffix: Suffix) -> Self {
        Self { suffix, ..self }
    }
}

/// Rename that refuses to replace an existing target.
pub fn rename_checked(from: &Path, to: &Path) -> Result<()> {
    if fsops::lstat(to)?.is_some() {
        return Err(ConsistencyError::TargetExists {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        }
        .into());
    }
    fs::rename(from, to)
        .with_context(|| format!("rename {} -> {}", from.display(), to.display()))
}

/// The per-source directory under a partition.
#[derive(Debug, Clone)]
pub struct SourceLayout {
    root: PathBuf,
}

impl SourceLayout {
    pub fn new(partition: &Path, source: &str) -> Self {
        Self {
            root: partition.join(source),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, name: &DatedName) -> PathBuf {
        self.root.join(name.file_name())
    }

    /// Dated entries in chronological order; other names are skipped.
    pub fn list(&self) -> Result<Vec<DatedName>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e).with_context(|| format!("list {}", self.root.display())),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str().and_then(DatedName::parse) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// What was found for today's date when a backup session started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartState {
    /// A finished tree for today existed and was reopened.
    Complete,
    /// A `.recycled.partial` for today was resumed.
    RecycledPartial,
    /// A `.partial` for today was resumed.
    Partial,
    /// Nothing for today existed.
    Absent,
}

/// Directories a session writes into and reads from.
#[derive(Debug, Clone)]
pub struct WorkingSet {
    pub working: PathBuf,
    /// Bare dated path the working directory becomes on success; `None` in failover mode.
    pub final_path: Option<PathBuf>,
    pub link_to: Option<PathBuf>,
    /// The working directory started from a recycled tree.
    pub recycling: bool,
    pub state: Option<StartState>,
}

/// Failover mode mirrors straight into `<partition>/<source>`.
pub fn prepare_failover(layout: &SourceLayout) -> Result<WorkingSet> {
    fs::create_dir_all(layout.root())
        .with_context(|| format!("create {}", layout.root().display()))?;
    info!(working = %layout.root().display(), "failover mirror");
    Ok(WorkingSet {
        working: layout.root().to_path_buf(),
        final_path: None,
        link_to: None,
        recycling: false,
        state: None,
    })
}

/// Pick or create today's working directory and locate the link-to root.
pub fn prepare_backup(layout: &SourceLayout, today: NaiveDate) -> Result<WorkingSet> {
    fs::create_dir_all(layout.root())
        .with_context(|| format!("create {}", layout.root().display()))?;

    let bare = DatedName::new(today, Suffix::Complete);
    let partial = bare.with_suffix(Suffix::Partial);
    let recycled_partial = bare.with_suffix(Suffix::RecycledPartial);
    let bare_path = layout.path_of(&bare);
    let partial_path = layout.path_of(&partial);
    let recycled_partial_path = layout.path_of(&recycled_partial);

    let (state, working, recycling) = if fsops::lstat(&bare_path)?.is_some() {
        rename_checked(&bare_path, &partial_path)?;
        (StartState::Complete, partial_path.clone(), false)
    } else if fsops::lstat(&recycled_partial_path)?.is_some() {
        (StartState::RecycledPartial, recycled_partial_path.clone(), true)
    } else if fsops::lstat(&partial_path)?.is_some() {
        (StartState::Partial, partial_path.clone(), false)
    } else {
        let (working, recycling) = adopt_previous(layout, today)?;
        (StartState::Absent, working, recycling)
    };

    let link_to = layout
        .list()?
        .into_iter()
        .filter(|n| n.suffix == Suffix::Complete && n.date < today)
        .next_back()
        .map(|n| layout.path_of(&n));
    if let Some(link_to) = &link_to {
        if *link_to == bare_path || *link_to == partial_path || *link_to == recycled_partial_path {
            return Err(ConsistencyError::LinkToIsWorking(link_to.clone()).into());
        }
    }

    info!(
        working = %working.display(),
        link_to = ?link_to.as_ref().map(|p| p.display().to_string()),
        ?state,
        recycling,
        "backup working directory selected"
    );
    Ok(WorkingSet {
        working,
        final_path: Some(bare_path),
        link_to,
        recycling,
        state: Some(state),
    })
}

/// Nothing exists for today: move an unfinished or recycled tree from an
/// earlier date into today's slot, or start empty. Later-dated trees are
/// left alone.
fn adopt_previous(layout: &SourceLayout, today: NaiveDate) -> Result<(PathBuf, bool)> {
    let (names, later): (Vec<_>, Vec<_>) = layout.list()?.into_iter().partition(|n| n.date < today);
    let adoptable = |n: &&DatedName| matches!(n.suffix, Suffix::Partial | Suffix::RecycledPartial | Suffix::Recycled);
    for name in later.iter().filter(adoptable) {
        warn!(path = %layout.path_of(name).display(), %today, "ignoring tree dated after the session");
    }

    let unfinished = names
        .iter()
        .rev()
        .find(|n| matches!(n.suffix, Suffix::Partial | Suffix::RecycledPartial));
    if let Some(previous) = unfinished {
        let target = layout.path_of(&DatedName::new(today, previous.suffix));
        rename_checked(&layout.path_of(previous), &target)?;
        return Ok((target, previous.suffix == Suffix::RecycledPartial));
    }

    if let Some(recycled) = names.iter().rev().find(|n| n.suffix == Suffix::Recycled) {
        let target = layout.path_of(&DatedName::new(today, Suffix::RecycledPartial));
        rename_checked(&layout.path_of(recycled), &target)?;
        return Ok((target, true));
    }

    let target = layout.path_of(&DatedName::new(today, Suffix::Partial));
    fs::create_dir(&target).with_context(|| format!("create {}", target.display()))?;
    Ok((target, false))
}
