/// history.rs — Durable per-model balance history
///
/// SCHEMA
///   balance_history(model, timestamp, total_equity, available_balance,
///                   unrealized_pnl, currency)   PRIMARY KEY (model, timestamp)
///   meta(key, value)                            'last_archive_date' → YYYY-MM-DD
///
/// Timestamps are stored as UTC text `YYYY-MM-DD HH:MM:SS.mmm`, so lexical
/// and chronological order coincide and BETWEEN is inclusive on both ends.
/// Sub-millisecond precision is dropped.
///
/// Writes are upserts: replaying the same (model, timestamp) overwrites.
/// Archival exports one calendar day (all models) to
/// `<archive_dir>/balances-YYYYMMDD.csv`; the meta marker makes it run at
/// most once per day.
///
/// All methods are blocking. Async callers clone the store (the pool is
/// shared) and go through `tokio::task::spawn_blocking`.
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use polars::prelude::*;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Result, TraderError};

/// Millisecond text; sorts the same as the instants it encodes.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const DAY_FORMAT: &str = "%Y-%m-%d";
const LAST_ARCHIVE_KEY: &str = "last_archive_date";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceSnapshot {
    pub model:          String,
    pub timestamp:      DateTime<Utc>,
    pub total_equity:   f64,
    pub available:      f64,
    pub unrealized_pnl: f64,
    pub currency:       String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompactOutcome {
    Archived { path: PathBuf, rows: usize },
    /// The marker is already at or past this day
    AlreadyArchived,
    /// Nothing recorded that day; the marker is left untouched
    NoData,
}

pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

/// Lower query bound: rounded up so no stored millisecond falls before `ts`.
fn format_lower(ts: &DateTime<Utc>) -> String {
    let sub_ms = ts.timestamp_subsec_nanos() % 1_000_000;
    if sub_ms == 0 {
        return format_ts(ts);
    }
    format_ts(&(*ts + TimeDelta::nanoseconds(i64::from(1_000_000 - sub_ms))))
}

fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").map(|t| t.and_utc())
}

fn day_bounds(day: NaiveDate) -> (String, String) {
    (format!("{} 00:00:00.000", day.format(DAY_FORMAT)), format!("{} 23:59:59.999", day.format(DAY_FORMAT)))
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<BalanceSnapshot> {
    let ts: String = row.get(1)?;
    let timestamp = parse_ts(&ts).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(BalanceSnapshot {
        model:          row.get(0)?,
        timestamp,
        total_equity:   row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
        available:      row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
        unrealized_pnl: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
        currency:       row.get::<_, Option<String>>(5)?.unwrap_or_else(|| "USDT".into()),
    })
}

const SELECT_COLUMNS: &str =
    "SELECT model, timestamp, total_equity, available_balance, unrealized_pnl, currency FROM balance_history";

#[derive(Clone)]
pub struct BalanceHistoryStore {
    pool:        Pool<SqliteConnectionManager>,
    archive_dir: PathBuf,
}

impl BalanceHistoryStore {
    pub fn open(db_path: &Path, archive_dir: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| TraderError::Storage(format!("{}: {e}", parent.display())))?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|c| c.busy_timeout(Duration::from_secs(5)));
        let pool = Pool::builder().max_size(4).build(manager)?;
        let store = Self { pool, archive_dir: archive_dir.to_path_buf() };
        store.initialize_schema()?;
        info!(path = %db_path.display(), "balance history opened");
        Ok(store)
    }

    /// Single-connection in-memory store (every sqlite `:memory:` connection
    /// is its own database).
    pub fn in_memory(archive_dir: &Path) -> Result<Self> {
        let pool = Pool::builder().max_size(1).build(SqliteConnectionManager::memory())?;
        let store = Self { pool, archive_dir: archive_dir.to_path_buf() };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS balance_history (
                model TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                total_equity REAL,
                available_balance REAL,
                unrealized_pnl REAL,
                currency TEXT,
                PRIMARY KEY (model, timestamp)
            );
            CREATE INDEX IF NOT EXISTS idx_balance_timestamp ON balance_history(timestamp);
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT
            );",
        )?;
        Ok(())
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    // ── Writes / reads ───────────────────────────────────────────────────

    pub fn append(&self, snapshot: &BalanceSnapshot) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO balance_history
                (model, timestamp, total_equity, available_balance, unrealized_pnl, currency)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                snapshot.model,
                format_ts(&snapshot.timestamp),
                snapshot.total_equity,
                snapshot.available,
                snapshot.unrealized_pnl,
                snapshot.currency,
            ],
        )?;
        debug!(model = %snapshot.model, equity = snapshot.total_equity, "balance snapshot stored");
        Ok(())
    }

    /// Inclusive on both ends, ascending by timestamp.
    pub fn range(&self, model: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<BalanceSnapshot>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE model = ?1 AND timestamp BETWEEN ?2 AND ?3 ORDER BY timestamp ASC"
        ))?;
        let rows = stmt
            .query_map(params![model, format_lower(&start), format_ts(&end)], snapshot_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most recent snapshot at or before `ts`.
    pub fn latest_before(&self, model: &str, ts: DateTime<Utc>) -> Result<Option<BalanceSnapshot>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE model = ?1 AND timestamp <= ?2 ORDER BY timestamp DESC LIMIT 1"),
                params![model, format_ts(&ts)],
                snapshot_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// The newest `limit` snapshots, returned oldest first.
    pub fn load_recent(&self, model: &str, limit: usize) -> Result<Vec<BalanceSnapshot>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE model = ?1 ORDER BY timestamp DESC LIMIT ?2"
        ))?;
        let mut rows = stmt
            .query_map(params![model, limit as i64], snapshot_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    // ── Archival ─────────────────────────────────────────────────────────

    pub fn last_archived(&self) -> Result<Option<NaiveDate>> {
        let conn = self.pool.get()?;
        let value: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![LAST_ARCHIVE_KEY], |r| r.get(0))
            .optional()?;
        match value {
            Some(v) => NaiveDate::parse_from_str(&v, DAY_FORMAT)
                .map(Some)
                .map_err(|e| TraderError::Storage(format!("bad {LAST_ARCHIVE_KEY} {v:?}: {e}"))),
            None => Ok(None),
        }
    }

    fn set_last_archived(&self, day: NaiveDate) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO meta(key, value) VALUES (?1, ?2)",
            params![LAST_ARCHIVE_KEY, day.format(DAY_FORMAT).to_string()],
        )?;
        Ok(())
    }

    fn rows_between(&self, start: &str, end: &str) -> Result<Vec<BalanceSnapshot>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE timestamp BETWEEN ?1 AND ?2 ORDER BY model, timestamp"
        ))?;
        let rows = stmt
            .query_map(params![start, end], snapshot_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Export one calendar day (all models) to CSV. Idempotent per day.
    pub fn compact(&self, day: NaiveDate) -> Result<CompactOutcome> {
        if self.last_archived()?.is_some_and(|last| last >= day) {
            return Ok(CompactOutcome::AlreadyArchived);
        }
        let (start, end) = day_bounds(day);
        let rows = self.rows_between(&start, &end)?;
        if rows.is_empty() {
            return Ok(CompactOutcome::NoData);
        }

        fs::create_dir_all(&self.archive_dir)
            .map_err(|e| TraderError::Storage(format!("{}: {e}", self.archive_dir.display())))?;
        let path = self.archive_dir.join(format!("balances-{}.csv", day.format("%Y%m%d")));
        let mut df = snapshots_frame(&rows)?;
        write_csv(&mut df, &path)?;
        self.set_last_archived(day)?;

        info!(day = %day, rows = rows.len(), path = %path.display(), "balance history archived");
        Ok(CompactOutcome::Archived { path, rows: rows.len() })
    }

    /// Archive yesterday (relative to `now`) unless already done.
    pub fn compact_if_needed(&self, now: DateTime<Utc>) -> Result<Option<CompactOutcome>> {
        let Some(yesterday) = now.date_naive().checked_sub_days(Days::new(1)) else {
            return Ok(None);
        };
        if self.last_archived()?.is_some_and(|last| last >= yesterday) {
            return Ok(None);
        }
        self.compact(yesterday).map(Some)
    }

    // ── Export ───────────────────────────────────────────────────────────

    /// Tabular export of `[start, end]`, optionally restricted to `models`.
    pub fn export_range(
        &self,
        start:  DateTime<Utc>,
        end:    DateTime<Utc>,
        models: Option<&[String]>,
    ) -> Result<DataFrame> {
        let mut rows = self.rows_between(&format_lower(&start), &format_ts(&end))?;
        if let Some(models) = models {
            rows.retain(|r| models.contains(&r.model));
        }
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.model.cmp(&b.model)));
        snapshots_frame(&rows)
    }

    pub fn write_export(&self, df: &mut DataFrame, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| TraderError::Storage(format!("{}: {e}", parent.display())))?;
        }
        write_csv(df, path)
    }
}

fn snapshots_frame(rows: &[BalanceSnapshot]) -> Result<DataFrame> {
    let df = df!(
        "model"             => rows.iter().map(|r| r.model.clone()).collect::<Vec<_>>(),
        "timestamp"         => rows.iter().map(|r| format_ts(&r.timestamp)).collect::<Vec<_>>(),
        "total_equity"      => rows.iter().map(|r| r.total_equity).collect::<Vec<_>>(),
        "available_balance" => rows.iter().map(|r| r.available).collect::<Vec<_>>(),
        "unrealized_pnl"    => rows.iter().map(|r| r.unrealized_pnl).collect::<Vec<_>>(),
        "currency"          => rows.iter().map(|r| r.currency.clone()).collect::<Vec<_>>(),
    )?;
    Ok(df)
}

fn write_csv(df: &mut DataFrame, path: &Path) -> Result<()> {
    let mut file = File::create(path).map_err(|e| TraderError::Storage(format!("{}: {e}", path.display())))?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    fn snap(model: &str, ts: DateTime<Utc>, equity: f64) -> BalanceSnapshot {
        BalanceSnapshot {
            model: model.into(),
            timestamp: ts,
            total_equity: equity,
            available: equity * 0.8,
            unrealized_pnl: 0.0,
            currency: "USDT".into(),
        }
    }

    fn store(dir: &Path) -> BalanceHistoryStore {
        BalanceHistoryStore::in_memory(dir).unwrap()
    }

    #[test]
    fn upsert_is_idempotent_and_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.append(&snap("deepseek", at(1, 10, 0), 1000.0)).unwrap();
        s.append(&snap("deepseek", at(1, 10, 0), 1010.0)).unwrap();
        let rows = s.range("deepseek", at(1, 0, 0), at(2, 0, 0)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_equity, 1010.0);
    }

    #[test]
    fn range_is_inclusive_and_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        for (h, eq) in [(12, 3.0), (9, 1.0), (10, 2.0), (13, 4.0), (8, 0.0)] {
            s.append(&snap("m", at(1, h, 0), eq)).unwrap();
        }
        s.append(&snap("other", at(1, 10, 0), 99.0)).unwrap();

        let rows = s.range("m", at(1, 9, 0), at(1, 12, 0)).unwrap();
        let equities: Vec<f64> = rows.iter().map(|r| r.total_equity).collect();
        assert_eq!(equities, vec![1.0, 2.0, 3.0]);
        assert!(rows.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(rows.iter().all(|r| r.timestamp >= at(1, 9, 0) && r.timestamp <= at(1, 12, 0)));
    }

    #[test]
    fn range_honours_subsecond_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let base = at(1, 10, 0);
        s.append(&snap("m", base, 1.0)).unwrap();
        s.append(&snap("m", base + TimeDelta::milliseconds(750), 2.0)).unwrap();

        let start = base + TimeDelta::milliseconds(500);
        let rows = s.range("m", start, at(1, 11, 0)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, base + TimeDelta::milliseconds(750));

        // a start just past a stored millisecond must exclude it
        let rows = s.range("m", base + TimeDelta::microseconds(750_400), at(1, 11, 0)).unwrap();
        assert!(rows.is_empty());
        let rows = s.range("m", base, base + TimeDelta::milliseconds(749)).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn snapshots_within_one_second_stay_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let base = at(1, 10, 0);
        s.append(&snap("m", base + TimeDelta::milliseconds(100), 1.0)).unwrap();
        s.append(&snap("m", base + TimeDelta::milliseconds(700), 2.0)).unwrap();

        let rows = s.range("m", base, base + TimeDelta::seconds(1)).unwrap();
        let equities: Vec<f64> = rows.iter().map(|r| r.total_equity).collect();
        assert_eq!(equities, vec![1.0, 2.0]);
        assert_eq!(
            s.latest_before("m", base + TimeDelta::milliseconds(400)).unwrap().unwrap().total_equity,
            1.0
        );
    }

    #[test]
    fn latest_before_and_recent() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        for h in [8, 9, 10, 11] {
            s.append(&snap("m", at(1, h, 0), h as f64)).unwrap();
        }
        assert_eq!(s.latest_before("m", at(1, 10, 30)).unwrap().unwrap().total_equity, 10.0);
        assert_eq!(s.latest_before("m", at(1, 10, 0)).unwrap().unwrap().total_equity, 10.0);
        assert!(s.latest_before("m", at(1, 7, 0)).unwrap().is_none());

        let recent: Vec<f64> = s.load_recent("m", 2).unwrap().iter().map(|r| r.total_equity).collect();
        assert_eq!(recent, vec![10.0, 11.0]);
    }

    #[test]
    fn compact_runs_once_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.append(&snap("a", at(1, 0, 0), 1.0)).unwrap();
        s.append(&snap("b", at(1, 23, 59), 2.0)).unwrap();
        s.append(&snap("a", at(2, 0, 0), 3.0)).unwrap();

        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let outcome = s.compact(day).unwrap();
        let CompactOutcome::Archived { path, rows } = outcome else {
            panic!("expected archive, got {outcome:?}");
        };
        assert_eq!(rows, 2);
        assert_eq!(path.file_name().unwrap(), "balances-20240301.csv");
        let csv = fs::read_to_string(&path).unwrap();
        assert!(csv.starts_with("model,timestamp,total_equity"));
        assert_eq!(csv.lines().count(), 3);
        assert_eq!(s.last_archived().unwrap(), Some(day));

        assert_eq!(s.compact(day).unwrap(), CompactOutcome::AlreadyArchived);
    }

    #[test]
    fn empty_day_leaves_marker_alone() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let day = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(s.compact(day).unwrap(), CompactOutcome::NoData);
        assert_eq!(s.last_archived().unwrap(), None);
    }

    #[test]
    fn compact_if_needed_targets_yesterday() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.append(&snap("a", at(1, 12, 0), 1.0)).unwrap();

        let first = s.compact_if_needed(at(2, 0, 5)).unwrap();
        assert!(matches!(first, Some(CompactOutcome::Archived { rows: 1, .. })));
        assert_eq!(s.compact_if_needed(at(2, 0, 10)).unwrap(), None);
    }

    #[test]
    fn export_filters_models() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.append(&snap("a", at(1, 10, 0), 1.0)).unwrap();
        s.append(&snap("b", at(1, 11, 0), 2.0)).unwrap();
        s.append(&snap("a", at(3, 10, 0), 3.0)).unwrap();

        let all = s.export_range(at(1, 0, 0), at(2, 0, 0), None).unwrap();
        assert_eq!(all.height(), 2);

        let only_a = vec!["a".to_string()];
        let mut df = s.export_range(at(1, 0, 0), at(4, 0, 0), Some(&only_a)).unwrap();
        assert_eq!(df.height(), 2);

        let out = dir.path().join("exports").join("a.csv");
        s.write_export(&mut df, &out).unwrap();
        assert_eq!(fs::read_to_string(out).unwrap().lines().count(), 3);
    }

    #[test]
    fn file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested").join("history.db");
        {
            let s = BalanceHistoryStore::open(&db, dir.path()).unwrap();
            s.append(&snap("m", at(1, 10, 0), 5.0)).unwrap();
        }
        let s = BalanceHistoryStore::open(&db, dir.path()).unwrap();
        assert_eq!(s.load_recent("m", 10).unwrap().len(), 1);
    }
}
