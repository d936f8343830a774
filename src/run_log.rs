//! Durable run/node/output/stat records with guaranteed closure even on
//! abnormal termination (C9). Backed by SQLite via `rusqlite`, the way the
//! teacher persists `TestTarget` rows — adapted here into a proper
//! `EventHandler` that owns the connection for the life of one engine
//! invocation.
//!
//! Table names and columns follow spec.md §6 exactly, for cross-version
//! compatibility with the original's Postgres schema; `node_path` (a text
//! array there) is stored here as its `/`-joined string form, which is
//! still a faithful composite key since node ids are restricted to
//! `[a-z0-9_]+` and can't contain `/`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::dag::NodePath;
use crate::events::{Event, EventHandler, OutputFormat};

pub(crate) fn join_path(path: &NodePath) -> String {
    path.join("/")
}

fn format_format(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Standard => "standard",
        OutputFormat::Verbatim => "verbatim",
        OutputFormat::Italics => "italics",
    }
}

/// One row of `NodeRun` history, as consumed by the cost engine (C5).
#[derive(Debug, Clone)]
pub struct NodeRunHistoryEntry {
    pub node_path: NodePath,
    pub duration_seconds: f64,
    pub is_pipeline: bool,
}

struct BufferedOutput {
    timestamp: DateTime<Utc>,
    message: String,
    format: OutputFormat,
    is_error: bool,
}

/// Persists events into the run-log schema, buffering `Output` rows per
/// node path and flushing them in one multi-row insert on `NodeFinished`
/// (spec.md §4.9 — "amortises DB round-trips").
pub struct SqliteRunLog {
    conn: Connection,
    run_id: Option<i64>,
    node_run_ids: HashMap<NodePath, i64>,
    buffered_output: HashMap<NodePath, Vec<BufferedOutput>>,
    retention_days: i64,
}

impl SqliteRunLog {
    pub fn open(path: &str, retention_days: i64) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, retention_days)
    }

    pub fn open_in_memory(retention_days: i64) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, retention_days)
    }

    fn from_connection(conn: Connection, retention_days: i64) -> anyhow::Result<Self> {
        create_schema(&conn)?;
        Ok(SqliteRunLog {
            conn,
            run_id: None,
            node_run_ids: HashMap::new(),
            buffered_output: HashMap::new(),
            retention_days,
        })
    }

    pub fn run_id(&self) -> Option<i64> {
        self.run_id
    }

    /// Closes this log's own run as failed if it was left open, for the
    /// caller-side crash-safety guard (spec.md §4.6 shutdown, SPEC_FULL §C).
    /// A no-op if no run was ever started or it already finished cleanly.
    pub fn close_if_open(&self) -> anyhow::Result<()> {
        if let Some(run_id) = self.run_id {
            close_open_run_after_error(&self.conn, run_id)?;
        }
        Ok(())
    }

    /// Returns `NodeRun` history rows for the subtree rooted at `path`, for
    /// the cost engine (C5).
    pub fn node_run_history(&self, path: &[String]) -> anyhow::Result<Vec<NodeRunHistoryEntry>> {
        let prefix = join_path(&path.to_vec());
        let mut stmt = self.conn.prepare(
            "SELECT node_path, start_time, end_time, is_pipeline FROM data_integration_node_run
             WHERE end_time IS NOT NULL AND (node_path = ?1 OR node_path LIKE ?2)",
        )?;
        let like_pattern = format!("{prefix}/%");
        let rows = stmt.query_map(params![prefix, like_pattern], |row| {
            let node_path: String = row.get(0)?;
            let start_time: DateTime<Utc> = row.get(1)?;
            let end_time: DateTime<Utc> = row.get(2)?;
            let is_pipeline: bool = row.get(3)?;
            Ok((node_path, start_time, end_time, is_pipeline))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (node_path, start_time, end_time, is_pipeline) = row?;
            let path: NodePath = if node_path.is_empty() {
                Vec::new()
            } else {
                node_path.split('/').map(|s| s.to_string()).collect()
            };
            result.push(NodeRunHistoryEntry {
                node_path: path,
                duration_seconds: (end_time - start_time).num_milliseconds() as f64 / 1000.0,
                is_pipeline,
            });
        }
        Ok(result)
    }

    fn insert_run_started(
        &mut self,
        node_path: &NodePath,
        start_time: DateTime<Utc>,
        pid: u32,
    ) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO data_integration_run (node_path, pid, start_time) VALUES (?1, ?2, ?3)",
            params![join_path(node_path), pid, start_time],
        )?;
        self.run_id = Some(self.conn.last_insert_rowid());
        Ok(())
    }

    fn insert_node_started(
        &mut self,
        node_path: &NodePath,
        start_time: DateTime<Utc>,
        is_pipeline: bool,
    ) -> anyhow::Result<()> {
        let Some(run_id) = self.run_id else { return Ok(()) };
        self.conn.execute(
            "INSERT INTO data_integration_node_run (run_id, node_path, start_time, is_pipeline)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id, join_path(node_path), start_time, is_pipeline],
        )?;
        let node_run_id = self.conn.last_insert_rowid();
        self.node_run_ids.insert(node_path.clone(), node_run_id);
        Ok(())
    }

    fn buffer_output(
        &mut self,
        node_path: &NodePath,
        timestamp: DateTime<Utc>,
        message: String,
        format: OutputFormat,
        is_error: bool,
    ) {
        self.buffered_output
            .entry(node_path.clone())
            .or_default()
            .push(BufferedOutput { timestamp, message, format, is_error });
    }

    fn finish_node(
        &mut self,
        node_path: &NodePath,
        end_time: DateTime<Utc>,
        succeeded: bool,
    ) -> anyhow::Result<()> {
        let Some(&node_run_id) = self.node_run_ids.get(node_path) else { return Ok(()) };
        self.conn.execute(
            "UPDATE data_integration_node_run SET end_time = ?1, succeeded = ?2 WHERE node_run_id = ?3",
            params![end_time, succeeded, node_run_id],
        )?;

        if let Some(outputs) = self.buffered_output.remove(node_path) {
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO data_integration_node_output (node_run_id, timestamp, message, format, is_error)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for output in outputs {
                    stmt.execute(params![
                        node_run_id,
                        output.timestamp,
                        output.message,
                        format_format(output.format),
                        output.is_error
                    ])?;
                }
            }
            tx.commit()?;
        }
        Ok(())
    }

    fn finish_run(&mut self, end_time: DateTime<Utc>, succeeded: bool) -> anyhow::Result<()> {
        let Some(run_id) = self.run_id else { return Ok(()) };
        self.conn.execute(
            "UPDATE data_integration_run SET end_time = ?1, succeeded = ?2 WHERE run_id = ?3",
            params![end_time, succeeded, run_id],
        )?;
        purge_older_than(&self.conn, self.retention_days)
    }

    fn insert_system_statistics(&mut self, event: &Event) -> anyhow::Result<()> {
        let Event::SystemStatistics {
            timestamp, disc_read, disc_write, net_recv, net_sent, cpu_usage, mem_usage, swap_usage, iowait,
        } = event else { return Ok(()) };

        // On a primary-key conflict (same timestamp+run_id) the sample is
        // dropped, never fatal (spec.md §4.9).
        let result = self.conn.execute(
            "INSERT OR IGNORE INTO data_integration_system_statistics
             (timestamp, run_id, disc_read, disc_write, net_recv, net_sent, cpu_usage, mem_usage, swap_usage, iowait)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                timestamp, self.run_id, disc_read, disc_write, net_recv, net_sent, cpu_usage, mem_usage,
                swap_usage, iowait
            ],
        );
        if let Err(err) = result {
            log::warn!("failed to persist system statistics sample: {err}");
        }
        Ok(())
    }

    fn try_handle(&mut self, event: &Event) -> anyhow::Result<()> {
        match event {
            Event::RunStarted { node_path, start_time, pid, .. } => {
                self.insert_run_started(node_path, *start_time, *pid)
            }
            Event::NodeStarted { node_path, start_time, is_pipeline } => {
                self.insert_node_started(node_path, *start_time, *is_pipeline)
            }
            Event::Output { node_path, message, format, is_error, timestamp } => {
                self.buffer_output(node_path, *timestamp, message.clone(), *format, *is_error);
                Ok(())
            }
            Event::NodeFinished { node_path, end_time, succeeded, .. } => {
                self.finish_node(node_path, *end_time, *succeeded)
            }
            Event::RunFinished { end_time, succeeded, .. } => self.finish_run(*end_time, *succeeded),
            Event::SystemStatistics { .. } => self.insert_system_statistics(event),
        }
    }
}

impl EventHandler for SqliteRunLog {
    fn handle_event(&mut self, event: &Event) {
        if let Err(err) = self.try_handle(event) {
            log::error!("run log failed to persist event {event:?}: {err}");
        }
    }
}

/// When the run-log database is unreachable, the engine falls back to this
/// no-op logger: events still flow and external handlers still run, just
/// nothing is persisted (spec.md §4.9).
pub struct NullRunLog;

impl EventHandler for NullRunLog {
    fn handle_event(&mut self, _event: &Event) {}
}

fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS data_integration_run (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_path TEXT NOT NULL,
            pid INTEGER NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            succeeded INTEGER
        );
        CREATE TABLE IF NOT EXISTS data_integration_node_run (
            node_run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL REFERENCES data_integration_run(run_id),
            node_path TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            succeeded INTEGER,
            is_pipeline INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_node_run_run_id ON data_integration_node_run(run_id);
        CREATE TABLE IF NOT EXISTS data_integration_node_output (
            node_output_id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_run_id INTEGER NOT NULL REFERENCES data_integration_node_run(node_run_id),
            timestamp TEXT NOT NULL,
            message TEXT NOT NULL,
            format TEXT NOT NULL,
            is_error INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS data_integration_system_statistics (
            timestamp TEXT NOT NULL,
            run_id INTEGER,
            disc_read REAL,
            disc_write REAL,
            net_recv REAL,
            net_sent REAL,
            cpu_usage REAL,
            mem_usage REAL,
            swap_usage REAL,
            iowait REAL,
            PRIMARY KEY (timestamp, run_id)
        );
        CREATE TABLE IF NOT EXISTS data_integration_processed_file (
            node_path TEXT NOT NULL,
            file_name TEXT NOT NULL,
            last_modified_timestamp TEXT,
            PRIMARY KEY (node_path, file_name)
        );
        CREATE TABLE IF NOT EXISTS data_integration_file_dependency (
            node_path TEXT NOT NULL,
            dependency_type TEXT NOT NULL,
            hash TEXT,
            timestamp TEXT,
            PRIMARY KEY (node_path, dependency_type)
        );
        CREATE TABLE IF NOT EXISTS data_integration_incremental_copy_status (
            node_path TEXT NOT NULL,
            source_table TEXT NOT NULL,
            last_comparison_value TEXT,
            PRIMARY KEY (node_path, source_table)
        );
        ",
    )?;
    Ok(())
}

fn purge_older_than(conn: &Connection, retention_days: i64) -> anyhow::Result<()> {
    conn.execute(
        &format!(
            "DELETE FROM data_integration_node_output WHERE node_run_id IN (
                SELECT node_run_id FROM data_integration_node_run WHERE run_id IN (
                    SELECT run_id FROM data_integration_run
                    WHERE datetime(start_time, '+{retention_days} days') < datetime('now')))"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "DELETE FROM data_integration_node_run WHERE run_id IN (
                SELECT run_id FROM data_integration_run
                WHERE datetime(start_time, '+{retention_days} days') < datetime('now'))"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "DELETE FROM data_integration_run
             WHERE datetime(start_time, '+{retention_days} days') < datetime('now')"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "DELETE FROM data_integration_system_statistics
             WHERE datetime(timestamp, '+{retention_days} days') < datetime('now')"
        ),
        [],
    )?;
    Ok(())
}

/// Crash-safe closure: sets `end_time = now, succeeded = false` on the
/// `Run` row and every `NodeRun` row of that run still missing an
/// `end_time` (spec.md §4.9). Called from the caller-side at-exit /
/// generator-drop path when a run doesn't finish cleanly.
pub fn close_open_run_after_error(conn: &Connection, run_id: i64) -> anyhow::Result<()> {
    let now = Utc::now();
    conn.execute(
        "UPDATE data_integration_run SET end_time = ?1, succeeded = 0
         WHERE run_id = ?2 AND end_time IS NULL",
        params![now, run_id],
    )?;
    conn.execute(
        "UPDATE data_integration_node_run SET end_time = ?1, succeeded = 0
         WHERE run_id = ?2 AND end_time IS NULL",
        params![now, run_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::NodePath;

    fn path(parts: &[&str]) -> NodePath {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn run_lifecycle_persists_and_flushes_output() {
        let mut log = SqliteRunLog::open_in_memory(30).unwrap();
        let now = Utc::now();
        log.handle_event(&Event::RunStarted {
            node_path: vec![],
            start_time: now,
            pid: 123,
            interactively_started: false,
            node_ids: vec![],
            is_root_pipeline: true,
        });
        assert!(log.run_id().is_some());

        log.handle_event(&Event::NodeStarted {
            node_path: path(&["a"]),
            start_time: now,
            is_pipeline: false,
        });
        log.handle_event(&Event::Output {
            node_path: path(&["a"]),
            message: "hi".to_string(),
            format: OutputFormat::Standard,
            is_error: false,
            timestamp: now,
        });
        log.handle_event(&Event::NodeFinished {
            node_path: path(&["a"]),
            start_time: now,
            end_time: now + chrono::Duration::seconds(5),
            is_pipeline: false,
            succeeded: true,
        });

        let output_count: i64 = log
            .conn
            .query_row("SELECT count(*) FROM data_integration_node_output", [], |r| r.get(0))
            .unwrap();
        assert_eq!(output_count, 1);

        log.handle_event(&Event::RunFinished {
            node_path: vec![],
            end_time: now + chrono::Duration::seconds(6),
            succeeded: true,
            interactively_started: false,
        });
        let succeeded: bool = log
            .conn
            .query_row("SELECT succeeded FROM data_integration_run", [], |r| r.get(0))
            .unwrap();
        assert!(succeeded);
    }

    #[test]
    fn close_open_run_after_error_closes_dangling_rows() {
        let mut log = SqliteRunLog::open_in_memory(30).unwrap();
        let now = Utc::now();
        log.handle_event(&Event::RunStarted {
            node_path: vec![],
            start_time: now,
            pid: 1,
            interactively_started: false,
            node_ids: vec![],
            is_root_pipeline: true,
        });
        log.handle_event(&Event::NodeStarted { node_path: path(&["x"]), start_time: now, is_pipeline: false });

        let run_id = log.run_id().unwrap();
        close_open_run_after_error(&log.conn, run_id).unwrap();

        let (run_succeeded, run_end_is_null): (Option<bool>, bool) = log
            .conn
            .query_row("SELECT succeeded, end_time IS NULL FROM data_integration_run", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(run_succeeded, Some(false));
        assert!(!run_end_is_null);

        let node_succeeded: Option<bool> = log
            .conn
            .query_row("SELECT succeeded FROM data_integration_node_run", [], |r| r.get(0))
            .unwrap();
        assert_eq!(node_succeeded, Some(false));
    }

    #[test]
    fn node_run_history_filters_to_subtree() {
        let mut log = SqliteRunLog::open_in_memory(30).unwrap();
        let now = Utc::now();
        log.handle_event(&Event::RunStarted {
            node_path: vec![],
            start_time: now,
            pid: 1,
            interactively_started: false,
            node_ids: vec![],
            is_root_pipeline: true,
        });
        log.handle_event(&Event::NodeStarted { node_path: path(&["p", "a"]), start_time: now, is_pipeline: false });
        log.handle_event(&Event::NodeFinished {
            node_path: path(&["p", "a"]),
            start_time: now,
            end_time: now + chrono::Duration::seconds(10),
            is_pipeline: false,
            succeeded: true,
        });
        log.handle_event(&Event::NodeStarted { node_path: path(&["other"]), start_time: now, is_pipeline: false });
        log.handle_event(&Event::NodeFinished {
            node_path: path(&["other"]),
            start_time: now,
            end_time: now + chrono::Duration::seconds(99),
            is_pipeline: false,
            succeeded: true,
        });

        let entries = log.node_run_history(&path(&["p"])).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node_path, path(&["p", "a"]));
        assert_eq!(entries[0].duration_seconds, 10.0);
    }
}
