//! Run history over SQLite via sqlx.

use crate::error::{Error, Result};
use crate::model::{HealthSample, ReportRun, ReportStats, SampleStatus, MAX_KEEP_DAYS};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// The only tables retention may ever touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryTable {
    ReportRuns,
    HealthSamples,
}

impl HistoryTable {
    pub const ALL: [HistoryTable; 2] = [HistoryTable::ReportRuns, HistoryTable::HealthSamples];

    pub fn name(&self) -> &'static str {
        match self {
            HistoryTable::ReportRuns => "report_runs",
            HistoryTable::HealthSamples => "health_samples",
        }
    }
}

impl fmt::Display for HistoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    pub table: HistoryTable,
    pub removed: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Store handle. Cheap to clone; clones share the pool and the writer lock.
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryStore").finish_non_exhaustive()
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    timestamp: String,
    duration_seconds: f64,
    success: bool,
    error_message: Option<String>,
    total_devices: i64,
    active_24h: i64,
    active_7d: i64,
    never_seen: i64,
    compliance_rate: f64,
    ip_coverage_rate: f64,
    connection_types: String,
    output_paths: String,
}

#[derive(sqlx::FromRow)]
struct SampleRow {
    run_id: Option<String>,
    timestamp: String,
    status: String,
    duration_seconds: f64,
}

impl HistoryStore {
    /// Opens (or creates) the database at `path` and applies the schema.
    /// WAL and the busy timeout are connection options, not migration steps.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;
        debug!(path = %path.display(), "history store opened");
        Self::init(pool).await
    }

    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // A single connection that never recycles; every new connection to
        // :memory: would be a fresh empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(opts)
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Store(format!("schema migration failed: {e}")))?;
        Ok(Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Stores the run and its health sample in one transaction.
    pub async fn record_run(&self, run: &ReportRun) -> Result<()> {
        let connection_types = serde_json::to_string(&run.stats.connection_types)
            .map_err(|e| Error::Store(format!("encode connection types: {e}")))?;
        let output_paths = serde_json::to_string(&run.output_paths)
            .map_err(|e| Error::Store(format!("encode output paths: {e}")))?;
        let sample = run.health_sample();

        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO report_runs (run_id, timestamp, duration_seconds, success, error_message, \
             total_devices, active_24h, active_7d, never_seen, compliance_rate, ip_coverage_rate, \
             connection_types, output_paths) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run.run_id.to_string())
        .bind(format_ts(&run.timestamp))
        .bind(run.duration_seconds)
        .bind(run.success)
        .bind(run.error_message.as_deref())
        .bind(run.stats.total_devices as i64)
        .bind(run.stats.active_24h as i64)
        .bind(run.stats.active_7d as i64)
        .bind(run.stats.never_seen as i64)
        .bind(run.stats.compliance_rate)
        .bind(run.stats.ip_coverage_rate)
        .bind(connection_types)
        .bind(output_paths)
        .execute(&mut *tx)
        .await?;
        insert_sample(&mut tx, &sample).await?;
        tx.commit().await?;
        debug!(run_id = %run.run_id, success = run.success, "run recorded");
        Ok(())
    }

    pub async fn record_health_sample(&self, sample: &HealthSample) -> Result<()> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        insert_sample(&mut tx, sample).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Deletes rows strictly older than `now - days`.
    pub async fn purge_older_than(&self, table: HistoryTable, days: u32) -> Result<PurgeReport> {
        if days == 0 || days > MAX_KEEP_DAYS {
            return Err(Error::Retention(format!(
                "keep_days must be between 1 and {MAX_KEEP_DAYS}, got {days}"
            )));
        }
        let cutoff = Utc::now()
            .checked_sub_signed(ChronoDuration::days(i64::from(days)))
            .ok_or_else(|| Error::Retention(format!("keep_days {days} is out of range")))?;
        self.purge_before(table, cutoff).await
    }

    pub async fn purge_before(
        &self,
        table: HistoryTable,
        cutoff: DateTime<Utc>,
    ) -> Result<PurgeReport> {
        let cutoff = format_ts(&cutoff);
        let name = table.name();

        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let (removed, oldest, newest): (i64, Option<String>, Option<String>) = sqlx::query_as(
            &format!(
                "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM {name} WHERE timestamp < ?"
            ),
        )
        .bind(cutoff.as_str())
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query(&format!("DELETE FROM {name} WHERE timestamp < ?"))
            .bind(cutoff.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let report = PurgeReport {
            table,
            removed: count(removed),
            oldest: oldest.as_deref().map(parse_ts).transpose()?,
            newest: newest.as_deref().map(parse_ts).transpose()?,
        };
        if report.removed > 0 {
            info!(
                table = name,
                count = report.removed,
                oldest = ?report.oldest,
                newest = ?report.newest,
                "purged history rows"
            );
        }
        Ok(report)
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<ReportRun>> {
        let rows: Vec<RunRow> = sqlx::query_as(
            "SELECT * FROM report_runs ORDER BY timestamp DESC, rowid DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ReportRun::try_from).collect()
    }

    pub async fn recent_successful_runs(&self, limit: u32) -> Result<Vec<ReportRun>> {
        let rows: Vec<RunRow> = sqlx::query_as(
            "SELECT * FROM report_runs WHERE success = 1 \
             ORDER BY timestamp DESC, rowid DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ReportRun::try_from).collect()
    }

    /// Samples at or after `since`, oldest first.
    pub async fn samples_since(&self, since: DateTime<Utc>) -> Result<Vec<HealthSample>> {
        let rows: Vec<SampleRow> = sqlx::query_as(
            "SELECT run_id, timestamp, status, duration_seconds FROM health_samples \
             WHERE timestamp >= ? ORDER BY timestamp ASC, id ASC",
        )
        .bind(format_ts(&since))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(HealthSample::try_from).collect()
    }

    pub async fn count(&self, table: HistoryTable) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table.name()))
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }
}

async fn insert_sample(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    sample: &HealthSample,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO health_samples (run_id, timestamp, status, duration_seconds) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(sample.run_id.map(|id| id.to_string()))
    .bind(format_ts(&sample.timestamp))
    .bind(sample.status.as_str())
    .bind(sample.duration_seconds)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Store(format!("bad timestamp `{raw}`: {e}")))
}

fn count(value: i64) -> u64 {
    value.max(0) as u64
}

impl TryFrom<RunRow> for ReportRun {
    type Error = Error;

    fn try_from(row: RunRow) -> Result<Self> {
        let run_id = Uuid::parse_str(&row.run_id)
            .map_err(|e| Error::Store(format!("bad run id `{}`: {e}", row.run_id)))?;
        let connection_types: BTreeMap<String, u64> =
            serde_json::from_str(&row.connection_types)
                .map_err(|e| Error::Store(format!("decode connection types: {e}")))?;
        let output_paths: Vec<PathBuf> = serde_json::from_str(&row.output_paths)
            .map_err(|e| Error::Store(format!("decode output paths: {e}")))?;
        Ok(ReportRun {
            run_id,
            timestamp: parse_ts(&row.timestamp)?,
            duration_seconds: row.duration_seconds,
            success: row.success,
            error_message: row.error_message,
            stats: ReportStats {
                total_devices: count(row.total_devices),
                active_24h: count(row.active_24h),
                active_7d: count(row.active_7d),
                never_seen: count(row.never_seen),
                compliance_rate: row.compliance_rate,
                ip_coverage_rate: row.ip_coverage_rate,
                connection_types,
            },
            output_paths,
        })
    }
}

impl TryFrom<SampleRow> for HealthSample {
    type Error = Error;

    fn try_from(row: SampleRow) -> Result<Self> {
        let run_id = row
            .run_id
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| Error::Store(format!("bad run id on sample: {e}")))?;
        let status = SampleStatus::parse(&row.status)
            .ok_or_else(|| Error::Store(format!("unknown sample status `{}`", row.status)))?;
        Ok(HealthSample {
            run_id,
            timestamp: parse_ts(&row.timestamp)?,
            status,
            duration_seconds: row.duration_seconds,
        })
    }
}
