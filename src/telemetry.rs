// Run telemetry sink
//
// SQLite-backed: one row per run (project, name, notes, config), one row per
// (epoch, metric), one row per logged image path.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;

/// Metric name to value for one epoch.
pub type MetricLog = BTreeMap<String, f64>;

/// Run metadata recorded with the run row.
#[derive(Debug, Clone, Default)]
pub struct RunInfo {
    pub project: String,
    pub name: String,
    pub notes: String,
    pub config_json: String,
}

pub struct TelemetrySink {
    conn: Connection,
    run_id: i64,
}

impl TelemetrySink {
    /// Open (or create) the database and start a new run.
    /// Use ":memory:" for in-memory testing.
    pub fn open(path: &Path, info: &RunInfo) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL,
                name TEXT NOT NULL,
                notes TEXT NOT NULL,
                config TEXT NOT NULL,
                started_at TEXT NOT NULL DEFAULT (datetime('now')),
                finished_at TEXT
            );
            CREATE TABLE IF NOT EXISTS metrics (
                run_id INTEGER NOT NULL REFERENCES runs(id),
                epoch INTEGER NOT NULL,
                key TEXT NOT NULL,
                value REAL
            );
            CREATE TABLE IF NOT EXISTS images (
                run_id INTEGER NOT NULL REFERENCES runs(id),
                epoch INTEGER NOT NULL,
                key TEXT NOT NULL,
                path TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_key ON metrics(run_id, key);",
        )?;
        conn.execute(
            "INSERT INTO runs (project, name, notes, config) VALUES (?1, ?2, ?3, ?4)",
            params![info.project, info.name, info.notes, info.config_json],
        )?;
        let run_id = conn.last_insert_rowid();
        tracing::info!(run_id, project = %info.project, "telemetry run started");
        Ok(Self { conn, run_id })
    }

    /// Record every metric of one epoch. NaN is stored as NULL.
    pub fn log_metrics(&self, epoch: usize, metrics: &MetricLog) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO metrics (run_id, epoch, key, value) VALUES (?1, ?2, ?3, ?4)")?;
        for (key, value) in metrics {
            let value = if value.is_nan() { None } else { Some(*value) };
            stmt.execute(params![self.run_id, epoch as i64, key, value])?;
        }
        Ok(())
    }

    pub fn log_image(&self, epoch: usize, key: &str, path: &Path) -> Result<()> {
        self.conn.execute(
            "INSERT INTO images (run_id, epoch, key, path) VALUES (?1, ?2, ?3, ?4)",
            params![self.run_id, epoch as i64, key, path.display().to_string()],
        )?;
        Ok(())
    }

    pub fn finish(&self) -> Result<()> {
        self.conn.execute(
            "UPDATE runs SET finished_at = datetime('now') WHERE id = ?1",
            params![self.run_id],
        )?;
        Ok(())
    }
}
