//! Retention rotation of dated backup directories.
//!
//! After a successful pass every dated directory of the source is bucketed by
//! age. Directories outside the keep set are demoted: finished trees become
//! `.recycled` (a few are kept as starting points for future passes), the
//! rest become `.deleted` and are removed in the background.

use anyhow::Result;
use chrono::NaiveDate;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::naming::{rename_checked, DatedName, SourceLayout, Suffix};

const DAILY_WINDOW: u32 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Days of history (the session's retention class).
    pub retention: u32,
    /// Tier boundaries in days, ascending.
    pub levels: Vec<u32>,
}

impl RetentionPolicy {
    pub fn new(retention: u32, levels: &[u32]) -> Self {
        let mut levels = levels.to_vec();
        levels.sort_unstable();
        levels.dedup();
        Self { retention, levels }
    }

    fn daily_window(&self) -> u32 {
        DAILY_WINDOW.min(self.retention)
    }

    /// Upper bounds of the tiers after the daily window, ending at the retention class.
    fn boundaries(&self) -> Vec<u32> {
        let daily = self.daily_window();
        let mut bounds: Vec<u32> = self
            .levels
            .iter()
            .copied()
            .filter(|&l| l > daily && l < self.retention)
            .collect();
        if self.retention > daily {
            bounds.push(self.retention);
        }
        bounds
    }

    /// Recycled directories kept for reuse.
    pub fn max_recycled(&self) -> usize {
        match self.retention {
            0..=7 => 1,
            8..=31 => 2,
            32..=92 => 3,
            _ => 4,
        }
    }

    /// Ages (in days) of the finished trees to keep, chosen from `ages`.
    pub fn keep(&self, ages: &BTreeSet<u32>) -> BTreeSet<u32> {
        let daily = self.daily_window();
        let mut keep: BTreeSet<u32> = ages.range(..=daily).copied().collect();

        let mut previous = daily;
        for bound in self.boundaries() {
            // Oldest entry of the tier (previous, bound]
            if let Some(&age) = ages.range(previous + 1..=bound).next_back() {
                keep.insert(age);
            }
            previous = bound;
        }

        // Youngest entry beyond the retention class
        if let Some(&age) = ages.range(self.retention.max(daily) + 1..).next() {
            keep.insert(age);
        }
        keep
    }
}

/// Renames decided by the policy, in execution order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RotationPlan {
    pub renames: Vec<(DatedName, DatedName)>,
}

/// Decide which directories to demote. Pure; touches nothing on disk.
pub fn plan_rotation(names: &[DatedName], today: NaiveDate, policy: &RetentionPolicy) -> RotationPlan {
    let age_of = |name: &DatedName| -> Option<u32> {
        let days = (today - name.date).num_days();
        (days >= 0).then_some(days as u32)
    };

    let mut plan = RotationPlan::default();
    let bare_ages: BTreeSet<u32> = names
        .iter()
        .filter(|n| n.suffix == Suffix::Complete)
        .filter_map(age_of)
        .collect();
    let keep = policy.keep(&bare_ages);

    // Every recycled tree, existing or about to be, newest first
    let mut recycle_pool: Vec<DatedName> = names
        .iter()
        .filter(|n| match n.suffix {
            Suffix::Recycled => true,
            Suffix::Complete => age_of(*n).is_some_and(|a| !keep.contains(&a)),
            _ => false,
        })
        .copied()
        .collect();
    recycle_pool.sort_by(|a, b| b.date.cmp(&a.date).then(a.suffix.cmp(&b.suffix)));

    for (i, name) in recycle_pool.iter().enumerate() {
        let keep_recycled = i < policy.max_recycled();
        match (name.suffix, keep_recycled) {
            (Suffix::Complete, true) => plan.renames.push((*name, name.with_suffix(Suffix::Recycled))),
            (_, false) => plan.renames.push((*name, name.with_suffix(Suffix::Deleted))),
            (_, true) => {}
        }
    }

    // Unfinished trees of other days are never resumed once a pass succeeded
    for name in names {
        if matches!(name.suffix, Suffix::Partial | Suffix::RecycledPartial)
            && age_of(name).is_some_and(|a| a > 0)
        {
            plan.renames.push((*name, name.with_suffix(Suffix::Deleted)));
        }
    }
    plan
}

#[derive(Debug, Default)]
pub struct RotationReport {
    pub recycled: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub failures: usize,
}

/// Apply the policy to `layout` and start removing `.deleted` directories.
///
/// Individual rename failures are logged and counted; the returned handle
/// (if any) finishes when the background removal is done.
pub fn rotate(
    layout: &SourceLayout,
    today: NaiveDate,
    policy: &RetentionPolicy,
) -> Result<(RotationReport, Option<JoinHandle<()>>)> {
    let names = layout.list()?;
    let plan = plan_rotation(&names, today, policy);
    let mut report = RotationReport::default();

    for (from, to) in &plan.renames {
        let from_path = layout.path_of(from);
        let to_path = layout.path_of(to);
        match rename_checked(&from_path, &to_path) {
            Ok(()) => {
                info!(from = %from.file_name(), to = %to.file_name(), "rotated");
                if to.suffix == Suffix::Recycled {
                    report.recycled.push(to_path);
                }
            }
            Err(e) => {
                warn!(from = %from_path.display(), error = %e, "rotation rename failed");
                report.failures += 1;
            }
        }
    }

    report.deleted = layout
        .list()?
        .into_iter()
        .filter(|n| n.suffix == Suffix::Deleted)
        .map(|n| layout.path_of(&n))
        .collect();
    let handle = spawn_removal(report.deleted.clone());
    Ok((report, handle))
}

/// Remove directories off the session's critical path.
pub fn spawn_removal(dirs: Vec<PathBuf>) -> Option<JoinHandle<()>> {
    if dirs.is_empty() {
        return None;
    }
    Some(thread::spawn(move || {
        if let [dir] = dirs.as_slice() {
            match Command::new("rm").arg("-rf").arg(dir).status() {
                Ok(status) if status.success() => debug!(dir = %dir.display(), "removed"),
                Ok(status) => warn!(dir = %dir.display(), %status, "rm -rf failed"),
                Err(e) => warn!(dir = %dir.display(), error = %e, "could not run rm"),
            }
            return;
        }

        let threads = num_cpus::get().min(dirs.len()).max(1);
        let pool = match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
            Ok(pool) => pool,
            Err(e) => {
                warn!(error = %e, "removal pool unavailable");
                return;
            }
        };
        pool.install(|| {
            dirs.par_iter().for_each(|dir| match fs::remove_dir_all(dir) {
                Ok(()) => debug!(dir = %dir.display(), "removed"),
                Err(e) => warn!(dir = %dir.display(), error = %e, "removal failed"),
            })
        });
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_RETENTION_LEVELS;
    use chrono::Duration;
    use tempfile::TempDir;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
    }

    fn bare(age: i64) -> DatedName {
        DatedName::new(today() - Duration::days(age), Suffix::Complete)
    }

    #[test]
    fn test_keep_set_for_monthly_retention() {
        let policy = RetentionPolicy::new(31, DEFAULT_RETENTION_LEVELS);
        let ages: BTreeSet<u32> = (0..40).collect();
        let keep: Vec<u32> = policy.keep(&ages).into_iter().collect();
        assert_eq!(keep, vec![0, 1, 2, 3, 4, 5, 6, 7, 14, 21, 28, 31, 32]);
    }

    #[test]
    fn test_keep_takes_oldest_of_sparse_tier() {
        let policy = RetentionPolicy::new(31, DEFAULT_RETENTION_LEVELS);
        let ages: BTreeSet<u32> = [0, 9, 12, 40, 45].into_iter().collect();
        let keep: Vec<u32> = policy.keep(&ages).into_iter().collect();
        assert_eq!(keep, vec![0, 12, 40]);
    }

    #[test]
    fn test_short_retention() {
        let policy = RetentionPolicy::new(3, DEFAULT_RETENTION_LEVELS);
        let ages: BTreeSet<u32> = (0..10).collect();
        let keep: Vec<u32> = policy.keep(&ages).into_iter().collect();
        assert_eq!(keep, vec![0, 1, 2, 3, 4]);
        assert_eq!(policy.max_recycled(), 1);
    }

    #[test]
    fn test_max_recycled_steps() {
        let levels = DEFAULT_RETENTION_LEVELS;
        assert_eq!(RetentionPolicy::new(7, levels).max_recycled(), 1);
        assert_eq!(RetentionPolicy::new(31, levels).max_recycled(), 2);
        assert_eq!(RetentionPolicy::new(92, levels).max_recycled(), 3);
        assert_eq!(RetentionPolicy::new(365, levels).max_recycled(), 4);
    }

    #[test]
    fn test_plan_recycles_newest_and_deletes_rest() {
        let policy = RetentionPolicy::new(31, DEFAULT_RETENTION_LEVELS);
        let mut names: Vec<DatedName> = (0..40).map(bare).collect();
        names.push(DatedName::new(today() - Duration::days(50), Suffix::Recycled));
        names.push(DatedName::new(today() - Duration::days(3), Suffix::Partial));
        names.push(DatedName::new(today() + Duration::days(2), Suffix::Complete));
        names.sort();

        let plan = plan_rotation(&names, today(), &policy);
        let recycled: Vec<_> = plan
            .renames
            .iter()
            .filter(|(_, to)| to.suffix == Suffix::Recycled)
            .map(|(from, _)| (today() - from.date).num_days())
            .collect();
        // Marked ages are 8..=13, 15..=20, 22..=27, 29, 30, 33..=39
        assert_eq!(recycled, vec![8, 9]);

        let deleted: BTreeSet<i64> = plan
            .renames
            .iter()
            .filter(|(_, to)| to.suffix == Suffix::Deleted)
            .map(|(from, _)| (today() - from.date).num_days())
            .collect();
        assert!(deleted.contains(&50));
        assert!(deleted.contains(&3));
        assert!(deleted.contains(&39));
        assert!(!deleted.contains(&32));
        assert!(!deleted.contains(&-2));
        assert_eq!(plan.renames.len(), 2 + 25 + 1 + 1);
    }

    #[test]
    fn test_rotate_on_disk() {
        let tmp = TempDir::new().unwrap();
        let layout = SourceLayout::new(tmp.path(), "host");
        fs::create_dir_all(layout.root()).unwrap();
        for age in 0..40 {
            let dir = layout.path_of(&bare(age));
            fs::create_dir(&dir).unwrap();
            fs::write(dir.join("data"), b"x").unwrap();
        }

        let policy = RetentionPolicy::new(31, DEFAULT_RETENTION_LEVELS);
        let (report, handle) = rotate(&layout, today(), &policy).unwrap();
        assert_eq!(report.failures, 0);
        assert_eq!(report.recycled.len(), 2);
        assert_eq!(report.deleted.len(), 25);
        handle.unwrap().join().unwrap();

        let names = layout.list().unwrap();
        let bare_older: Vec<_> = names
            .iter()
            .filter(|n| n.suffix == Suffix::Complete && (today() - n.date).num_days() > 31)
            .collect();
        assert_eq!(bare_older.len(), 1);
        assert_eq!(names.iter().filter(|n| n.suffix == Suffix::Recycled).count(), 2);
        assert_eq!(names.iter().filter(|n| n.suffix == Suffix::Deleted).count(), 0);
    }

    #[test]
    fn test_single_removal_uses_rm() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("2024-01-01.deleted");
        fs::create_dir_all(dir.join("a/b")).unwrap();
        spawn_removal(vec![dir.clone()]).unwrap().join().unwrap();
        assert!(!dir.exists());
        assert!(spawn_removal(Vec::new()).is_none());
    }
}
