use crate::config::OutputFormat;
use crate::error::{Error, Result};
use crate::history::{HistoryStore, HistoryTable, PurgeReport};
use crate::model::{RetentionPolicy, MAX_KEEP_DAYS};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use walkdir::WalkDir;

const SECS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl PruneReport {
    fn note(&mut self, modified: DateTime<Utc>) {
        self.removed += 1;
        self.oldest = Some(self.oldest.map_or(modified, |o| o.min(modified)));
        self.newest = Some(self.newest.map_or(modified, |n| n.max(modified)));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub reports: PruneReport,
    pub history: Vec<PurgeReport>,
}

impl RetentionReport {
    pub fn history_removed(&self) -> u64 {
        self.history.iter().map(|p| p.removed).sum()
    }
}

/// Deletes report artifacts and history rows past the configured age.
/// File deletion is confined to `report_root` and to files carrying a
/// generator artifact extension.
pub struct RetentionManager {
    report_root: PathBuf,
    store: HistoryStore,
    policy: RetentionPolicy,
}

impl RetentionManager {
    pub fn new(
        report_root: impl Into<PathBuf>,
        store: HistoryStore,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            report_root: report_root.into(),
            store,
            policy,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub async fn apply(&self) -> Result<RetentionReport> {
        let reports = self.prune_reports(&self.report_root, self.policy.reports_keep_days)?;
        let history = self.prune_history(self.policy.database_keep_days).await?;
        Ok(RetentionReport { reports, history })
    }

    pub fn prune_reports(&self, directory: &Path, keep_days: u32) -> Result<PruneReport> {
        check_keep_days(keep_days)?;
        if !self.report_root.exists() {
            return Ok(PruneReport::default());
        }
        let root = canonical(&self.report_root)?;
        let target = canonical(directory)?;
        if !target.starts_with(&root) {
            return Err(Error::Retention(format!(
                "{} is outside the report directory {}",
                directory.display(),
                root.display()
            )));
        }

        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(u64::from(keep_days) * SECS_PER_DAY))
            .ok_or_else(|| Error::Retention(format!("keep_days {keep_days} is out of range")))?;
        let mut report = PruneReport::default();
        let mut emptied = BTreeSet::new();
        for entry in WalkDir::new(&target).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable entry during report pruning");
                    continue;
                }
            };
            if entry.path_is_symlink() || !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !is_report_artifact(path) {
                continue;
            }
            let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
                Some(m) => m,
                None => continue,
            };
            if modified >= cutoff {
                continue;
            }
            match path.canonicalize() {
                Ok(resolved) if resolved.starts_with(&root) => {}
                _ => {
                    warn!(
                        path = %path.display(),
                        "refusing to delete file resolving outside report root"
                    );
                    continue;
                }
            }
            if let Err(err) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %err, "failed to delete expired report");
                continue;
            }
            report.note(DateTime::<Utc>::from(modified));
            if let Some(parent) = path.parent() {
                if parent != target.as_path() {
                    emptied.insert(parent.to_path_buf());
                }
            }
        }
        // Per-run directories left empty; deepest first, non-empty ones stay.
        for dir in emptied.iter().rev() {
            let _ = fs::remove_dir(dir);
        }

        if report.removed > 0 {
            info!(
                directory = %target.display(),
                count = report.removed,
                oldest = ?report.oldest,
                newest = ?report.newest,
                "pruned expired reports"
            );
        }
        Ok(report)
    }

    pub async fn prune_history(&self, keep_days: u32) -> Result<Vec<PurgeReport>> {
        check_keep_days(keep_days)?;
        let mut reports = Vec::with_capacity(HistoryTable::ALL.len());
        for table in HistoryTable::ALL {
            reports.push(self.store.purge_older_than(table, keep_days).await?);
        }
        Ok(reports)
    }
}

fn check_keep_days(keep_days: u32) -> Result<()> {
    if keep_days == 0 || keep_days > MAX_KEEP_DAYS {
        return Err(Error::Retention(format!(
            "keep_days must be between 1 and {MAX_KEEP_DAYS}, got {keep_days}"
        )));
    }
    Ok(())
}

fn is_report_artifact(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    OutputFormat::ALL
        .iter()
        .any(|f| f.extension().eq_ignore_ascii_case(ext))
}

fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize().map_err(|e| Error::io(path, e))
}
