//! Incremental-processing bookkeeping (C10): processed files, file-content
//! dependency hashes, and incremental-copy cursors. Three independent
//! SQLite-backed stores, all keyed by node path, grounded in
//! `original_source/data_integration/incremental_processing/*.py`.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use md5::{Digest, Md5};
use regex::Regex;
use rusqlite::{params, Connection};

use crate::dag::NodePath;
use crate::run_log::join_path;

/// How a node should select among its already-`list`ed candidate files
/// (spec.md §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    All,
    OnlyLatest,
    OnlyNew,
    OnlyChanged,
    OnlyNewExceptLatest,
}

/// A file found on disk, not yet filtered against the processed-files store.
#[derive(Debug, Clone)]
pub struct CandidateFile {
    pub file_name: String,
    pub mtime: DateTime<Utc>,
}

pub fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "
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

/// Records that `file_name` has been processed by `node_path` as of `mtime`.
pub fn upsert_processed_file(
    conn: &Connection,
    node_path: &NodePath,
    file_name: &str,
    mtime: DateTime<Utc>,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO data_integration_processed_file (node_path, file_name, last_modified_timestamp)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (node_path, file_name) DO UPDATE SET last_modified_timestamp = excluded.last_modified_timestamp",
        params![join_path(node_path), file_name, mtime],
    )?;
    Ok(())
}

/// Returns every file already processed by `node_path`, with its recorded
/// modification timestamp.
pub fn list_processed_files(
    conn: &Connection,
    node_path: &NodePath,
) -> anyhow::Result<HashMap<String, DateTime<Utc>>> {
    let mut stmt = conn.prepare(
        "SELECT file_name, last_modified_timestamp FROM data_integration_processed_file WHERE node_path = ?1",
    )?;
    let rows = stmt.query_map(params![join_path(node_path)], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, DateTime<Utc>>(1)?))
    })?;
    let mut result = HashMap::new();
    for row in rows {
        let (file_name, mtime) = row?;
        result.insert(file_name, mtime);
    }
    Ok(result)
}

/// Extracts a sortable "date key" from a filename via `date_pattern`'s
/// first capture group, falling back to the filename itself when no
/// pattern is given or it doesn't match — sorting lexicographically still
/// works correctly for ISO-8601-style date/timestamp fragments.
fn date_key(file_name: &str, date_pattern: Option<&Regex>) -> String {
    if let Some(pattern) = date_pattern {
        if let Some(captures) = pattern.captures(file_name) {
            if let Some(group) = captures.get(1) {
                return group.as_str().to_string();
            }
        }
    }
    file_name.to_string()
}

/// Filters `candidates` (files found on disk) per `mode`, using `processed`
/// (the store's current recorded state for this node) to decide
/// new/changed status (spec.md §4.10).
pub fn filter_by_read_mode(
    mode: ReadMode,
    candidates: &[CandidateFile],
    processed: &HashMap<String, DateTime<Utc>>,
    date_pattern: Option<&Regex>,
) -> Vec<CandidateFile> {
    match mode {
        ReadMode::All => candidates.to_vec(),
        ReadMode::OnlyLatest => candidates
            .iter()
            .max_by_key(|c| date_key(&c.file_name, date_pattern))
            .cloned()
            .into_iter()
            .collect(),
        ReadMode::OnlyNew => candidates
            .iter()
            .filter(|c| !processed.contains_key(&c.file_name))
            .cloned()
            .collect(),
        ReadMode::OnlyChanged => candidates
            .iter()
            .filter(|c| match processed.get(&c.file_name) {
                None => true,
                Some(recorded) => c.mtime > *recorded,
            })
            .cloned()
            .collect(),
        ReadMode::OnlyNewExceptLatest => {
            let latest = candidates.iter().max_by_key(|c| date_key(&c.file_name, date_pattern));
            candidates
                .iter()
                .filter(|c| !processed.contains_key(&c.file_name))
                .filter(|c| latest.map(|l| l.file_name != c.file_name).unwrap_or(true))
                .cloned()
                .collect()
        }
    }
}

/// Computes the combined content hash of `files` (paths relative to
/// `base_path`), salted with `first_date`/`last_date` so a config date
/// window change invalidates the cache (spec.md §4.10, Open Question 1).
pub fn file_dependency_hash(
    base_path: &Path,
    files: &[String],
    first_date: NaiveDate,
    last_date: NaiveDate,
) -> anyhow::Result<String> {
    let mut hash = format!("{first_date} {last_date}");
    for file in files {
        let contents = std::fs::read(base_path.join(file))?;
        let digest = Md5::digest(&contents);
        hash.push(' ');
        hash.push_str(&format!("{digest:x}"));
    }
    Ok(hash)
}

pub fn update_file_dependency(
    conn: &Connection,
    node_path: &NodePath,
    dependency_type: &str,
    hash: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO data_integration_file_dependency (node_path, dependency_type, hash, timestamp)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (node_path, dependency_type) DO UPDATE SET hash = excluded.hash, timestamp = excluded.timestamp",
        params![join_path(node_path), dependency_type, hash, Utc::now()],
    )?;
    Ok(())
}

pub fn delete_file_dependency(
    conn: &Connection,
    node_path: &NodePath,
    dependency_type: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "DELETE FROM data_integration_file_dependency WHERE node_path = ?1 AND dependency_type = ?2",
        params![join_path(node_path), dependency_type],
    )?;
    Ok(())
}

/// Returns `true` iff the recomputed hash differs from the stored one (or
/// none is stored yet).
pub fn is_file_dependency_modified(
    conn: &Connection,
    node_path: &NodePath,
    dependency_type: &str,
    base_path: &Path,
    files: &[String],
    first_date: NaiveDate,
    last_date: NaiveDate,
) -> anyhow::Result<bool> {
    let current = file_dependency_hash(base_path, files, first_date, last_date)?;
    let stored: Option<String> = conn
        .query_row(
            "SELECT hash FROM data_integration_file_dependency WHERE node_path = ?1 AND dependency_type = ?2",
            params![join_path(node_path), dependency_type],
            |row| row.get(0),
        )
        .ok();
    Ok(stored.as_deref() != Some(current.as_str()))
}

pub fn update_incremental_copy_status(
    conn: &Connection,
    node_path: &NodePath,
    source_db_alias: &str,
    source_table: &str,
    last_comparison_value: &str,
) -> anyhow::Result<()> {
    let key = format!("{source_db_alias}.{source_table}");
    conn.execute(
        "INSERT INTO data_integration_incremental_copy_status (node_path, source_table, last_comparison_value)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (node_path, source_table) DO UPDATE SET last_comparison_value = excluded.last_comparison_value",
        params![join_path(node_path), key, last_comparison_value],
    )?;
    Ok(())
}

pub fn get_incremental_copy_status(
    conn: &Connection,
    node_path: &NodePath,
    source_db_alias: &str,
    source_table: &str,
) -> anyhow::Result<Option<String>> {
    let key = format!("{source_db_alias}.{source_table}");
    Ok(conn
        .query_row(
            "SELECT last_comparison_value FROM data_integration_incremental_copy_status
             WHERE node_path = ?1 AND source_table = ?2",
            params![join_path(node_path), key],
            |row| row.get(0),
        )
        .ok())
}

/// Deletes all incremental-processing rows beneath `node_path` (prefix
/// match), after logging a per-(path, kind) summary of what is about to be
/// removed (mirrors `reset.py`'s printed table, kept as a log line instead
/// of stdout per SPEC_FULL §B).
pub fn reset_incremental_processing(conn: &Connection, node_path: &NodePath) -> anyhow::Result<()> {
    let prefix = join_path(node_path);
    let like_pattern = format!("{prefix}/%");

    for (table, kind) in [
        ("data_integration_processed_file", "processed files"),
        ("data_integration_file_dependency", "file dependencies"),
        ("data_integration_incremental_copy_status", "incremental copy statuses"),
    ] {
        let count: i64 = conn.query_row(
            &format!(
                "SELECT count(*) FROM {table} WHERE node_path = ?1 OR node_path LIKE ?2"
            ),
            params![prefix, like_pattern],
            |row| row.get(0),
        )?;
        if count > 0 {
            log::info!("{prefix}: {count} {kind}");
        }
    }

    for table in [
        "data_integration_processed_file",
        "data_integration_file_dependency",
        "data_integration_incremental_copy_status",
    ] {
        conn.execute(
            &format!("DELETE FROM {table} WHERE node_path = ?1 OR node_path LIKE ?2"),
            params![prefix, like_pattern],
        )?;
    }
    Ok(())
}
