//! Engine configuration (§6). A plain, immutable struct passed into the
//! engine at construction rather than the original's global `config.<fn>()`
//! module functions — following `GOLDhjy-GoldBot`'s TOML-backed
//! `serde::Deserialize` config pattern (see SPEC_FULL §A.3).

use std::path::Path;

use serde::{Deserialize, Serialize};

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_db_alias() -> String {
    "dwh-etl".to_string()
}

fn default_max_parallel_tasks() -> usize {
    num_cpus()
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_bash_command_string() -> String {
    "/usr/bin/env bash -o pipefail".to_string()
}

fn default_stats_period_secs() -> u64 {
    1
}

fn default_retention_days() -> i64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "http://127.0.0.1:5000/data-integration".to_string()
}

/// One of the built-in `EventHandler` implementations `conduit` can
/// construct for a caller from config alone, per spec.md §6's
/// `event_handlers` option ("additional consumers receiving every event").
/// Real webhook delivery is out of scope (spec.md §1 Non-goals), so these
/// only cover the illustrative handlers in [`crate::notify`]; a caller
/// needing a custom sink still passes it directly to [`crate::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventHandlerKind {
    Slack,
    Teams,
}

/// Recognised configuration options and their effects (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for file commands.
    pub data_dir: String,
    /// Target database alias when a command omits its own.
    pub default_db_alias: String,
    /// Applied to a task when it has no `max_retries` of its own.
    pub default_task_max_retries: u32,
    /// Ignore data before this date; included in file-dependency hashes.
    pub first_date: chrono::NaiveDate,
    /// Ignore data after this date; included in file-dependency hashes.
    pub last_date: chrono::NaiveDate,
    /// Global task-parallelism cap.
    pub max_number_of_parallel_tasks: usize,
    /// Interpreter used for shell commands; must include a
    /// pipefail-equivalent option.
    pub bash_command_string: String,
    /// Initial system-stats sampler period, in seconds.
    pub system_statistics_collection_period: u64,
    /// Retention window for all run-log tables, in days.
    pub run_log_retention_in_days: i64,
    /// UI kill-switch for triggering runs.
    pub allow_run_from_web_ui: bool,
    /// Rendered into notification links.
    pub base_url: String,
    /// Substrings replaced with `***` in all output.
    pub password_masks: Vec<String>,
    /// Path to the SQLite run-log database. `None` runs an in-memory
    /// run log instead; either falls back to the null logger if opening
    /// it fails (spec.md §4.9).
    pub run_log_path: Option<String>,
    /// Built-in event handlers to construct and attach to every run, in
    /// addition to whatever the caller passes to [`crate::run`] directly.
    pub event_handlers: Vec<EventHandlerKind>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            default_db_alias: default_db_alias(),
            default_task_max_retries: 0,
            first_date: chrono::NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
            last_date: chrono::NaiveDate::from_ymd_opt(3000, 1, 1).unwrap(),
            max_number_of_parallel_tasks: default_max_parallel_tasks(),
            bash_command_string: default_bash_command_string(),
            system_statistics_collection_period: default_stats_period_secs(),
            run_log_retention_in_days: default_retention_days(),
            allow_run_from_web_ui: default_true(),
            base_url: default_base_url(),
            password_masks: Vec::new(),
            run_log_path: None,
            event_handlers: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Replaces every occurrence of a configured password mask with `***`.
    pub fn mask(&self, message: &str) -> String {
        let mut masked = message.to_string();
        for mask in &self.password_masks {
            if !mask.is_empty() {
                masked = masked.replace(mask.as_str(), "***");
            }
        }
        masked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.run_log_retention_in_days, 30);
        assert_eq!(config.system_statistics_collection_period, 1);
        assert!(config.allow_run_from_web_ui);
        assert!(config.bash_command_string.contains("pipefail"));
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config = Config::from_toml_str(
            r#"
            run_log_retention_in_days = 7
            password_masks = ["s3cr3t"]
            "#,
        )
        .unwrap();
        assert_eq!(config.run_log_retention_in_days, 7);
        assert_eq!(config.password_masks, vec!["s3cr3t".to_string()]);
        // untouched fields keep their defaults
        assert_eq!(config.default_db_alias, "dwh-etl");
    }

    #[test]
    fn parses_event_handlers_list() {
        let config = Config::from_toml_str(r#"event_handlers = ["slack", "teams"]"#).unwrap();
        assert_eq!(config.event_handlers, vec![EventHandlerKind::Slack, EventHandlerKind::Teams]);
    }

    #[test]
    fn mask_replaces_every_occurrence() {
        let mut config = Config::default();
        config.password_masks = vec!["hunter2".to_string()];
        let masked = config.mask("password=hunter2 again hunter2");
        assert_eq!(masked, "password=*** again ***");
    }
}
