//! A cost-aware, parallel DAG pipeline execution engine (see SPEC_FULL.md).
//!
//! The crate root wires the pieces together: a [`dag::Pipeline`] tree is
//! handed to [`run`], which seeds the cost engine from run-log history,
//! drives the scheduler's executor thread, and fans out every
//! [`events::Event`] to the run log and any caller-supplied
//! [`events::EventHandler`]s.

pub mod command;
pub mod config;
pub mod cost;
pub mod dag;
pub mod error;
pub mod events;
pub mod incremental;
pub mod notify;
pub mod output;
pub mod run_log;
pub mod scheduler;
pub mod stats;
pub mod task_runner;

use std::sync::mpsc::Receiver;

use crate::config::{Config, EventHandlerKind};
use crate::dag::Pipeline;
use crate::events::{Event, EventHandler};
use crate::run_log::{NodeRunHistoryEntry, NullRunLog, SqliteRunLog};
use crate::scheduler::RunRequest;

/// The run log backend actually in effect for one run: a real SQLite-backed
/// log, or the null fallback used when opening the database fails (spec.md
/// §7 `PersistenceFailure` — "logs to stderr and continues with a null
/// logger"; SPEC_FULL §D.9).
enum RunLogBackend {
    Sqlite(SqliteRunLog),
    Null(NullRunLog),
}

impl RunLogBackend {
    fn open(config: &Config) -> Self {
        let opened = match &config.run_log_path {
            Some(path) => SqliteRunLog::open(path, config.run_log_retention_in_days),
            None => SqliteRunLog::open_in_memory(config.run_log_retention_in_days),
        };
        match opened {
            Ok(run_log) => RunLogBackend::Sqlite(run_log),
            Err(err) => {
                log::error!("failed to open run log, continuing with a null logger: {err}");
                RunLogBackend::Null(NullRunLog)
            }
        }
    }

    fn node_run_history(&self, path: &[String]) -> anyhow::Result<Vec<NodeRunHistoryEntry>> {
        match self {
            RunLogBackend::Sqlite(run_log) => run_log.node_run_history(path),
            RunLogBackend::Null(_) => Ok(Vec::new()),
        }
    }

    fn close_if_open(&self) -> anyhow::Result<()> {
        match self {
            RunLogBackend::Sqlite(run_log) => run_log.close_if_open(),
            RunLogBackend::Null(_) => Ok(()),
        }
    }
}

impl EventHandler for RunLogBackend {
    fn handle_event(&mut self, event: &Event) {
        match self {
            RunLogBackend::Sqlite(run_log) => run_log.handle_event(event),
            RunLogBackend::Null(run_log) => run_log.handle_event(event),
        }
    }
}

/// Ensures the run-log's own open `Run` row is closed as failed if this
/// scope exits early — a panic unwinding past [`run`], or the caller's
/// process exiting without draining the event stream to `RunFinished`
/// (spec.md §4.9 crash safety, mirroring the original's `atexit` hook via
/// Rust's `Drop`).
struct RunLogGuard<'a> {
    run_log: &'a RunLogBackend,
    armed: bool,
}

impl<'a> RunLogGuard<'a> {
    fn new(run_log: &'a RunLogBackend) -> Self {
        RunLogGuard { run_log, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RunLogGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.run_log.close_if_open() {
            log::error!("failed to close dangling run after early exit: {err}");
        }
    }
}

/// Builds the handlers configured via `config.event_handlers` (spec.md §6),
/// with `extra` — whatever the caller passed to [`run`] directly — appended
/// after them.
fn configured_handlers(config: &Config, extra: Vec<Box<dyn EventHandler>>) -> Vec<Box<dyn EventHandler>> {
    let mut handlers: Vec<Box<dyn EventHandler>> = config
        .event_handlers
        .iter()
        .map(|kind| -> Box<dyn EventHandler> {
            match kind {
                EventHandlerKind::Slack => Box::new(notify::SlackNotifier::new()),
                EventHandlerKind::Teams => Box::new(notify::TeamsNotifier::new()),
            }
        })
        .collect();
    handlers.extend(extra);
    handlers
}

/// Runs `pipeline` to completion, implementing spec.md §4.6's `Run`
/// contract: seed the cost engine from history, dispatch through the
/// scheduler, persist every event, and fan out to `handlers` plus whatever
/// `config.event_handlers` names. Returns whether the run succeeded (no
/// task or pipeline failed).
pub fn run(
    pipeline: Pipeline,
    request: RunRequest,
    config: Config,
    handlers: Vec<Box<dyn EventHandler>>,
) -> anyhow::Result<bool> {
    let mut run_log = RunLogBackend::open(&config);
    let mut handlers = configured_handlers(&config, handlers);

    let history = run_log.node_run_history(&[])?;
    let durations = cost::node_durations_and_run_times(&history);

    let event_rx = scheduler::run(pipeline, request, config, durations);

    let mut guard = RunLogGuard::new(&run_log);
    let succeeded = drain_events(event_rx, &mut run_log, &mut handlers);
    guard.disarm();

    Ok(succeeded)
}

/// Drains the event bus until the channel closes (the executor thread has
/// exited), persisting every event and fanning it out, and returns the
/// outcome carried by the root pipeline's `RunFinished`.
fn drain_events(
    event_rx: Receiver<Event>,
    run_log: &mut RunLogBackend,
    handlers: &mut [Box<dyn EventHandler>],
) -> bool {
    let mut succeeded = false;
    for event in event_rx {
        run_log.handle_event(&event);
        events::notify_all(handlers, &event);
        if let Event::RunFinished { node_path, succeeded: run_succeeded, .. } = &event {
            if node_path.is_empty() {
                succeeded = *run_succeeded;
            }
        }
    }
    succeeded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_handlers_builds_from_config_and_appends_extra() {
        let config = Config { event_handlers: vec![EventHandlerKind::Slack], ..Config::default() };
        let extra: Vec<Box<dyn EventHandler>> = vec![Box::new(notify::TeamsNotifier::new())];
        let handlers = configured_handlers(&config, extra);
        assert_eq!(handlers.len(), 2);
    }

    #[test]
    fn run_log_backend_falls_back_to_null_on_unopenable_path() {
        // a directory can never be opened as a SQLite file
        let config = Config { run_log_path: Some("/".to_string()), ..Config::default() };
        let run_log = RunLogBackend::open(&config);
        assert!(matches!(run_log, RunLogBackend::Null(_)));
        assert!(run_log.node_run_history(&[]).unwrap().is_empty());
        assert!(run_log.close_if_open().is_ok());
    }
}
