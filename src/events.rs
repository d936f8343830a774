//! Typed events and the fan-out contract (C3).
//!
//! All observable progress during a run is modelled as [`Event`] values
//! carrying a `node_path`. The bus itself is just an `mpsc` channel (see
//! SPEC_FULL §C): the scheduler's executor thread and every task thread
//! hold a `Sender<Event>` clone, the caller holds the single `Receiver`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dag::NodePath;

/// How an [`Event::Output`] message should be displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Standard,
    Verbatim,
    Italics,
}

/// A structured event emitted during pipeline execution (spec.md §4.3).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    RunStarted {
        node_path: NodePath,
        start_time: DateTime<Utc>,
        pid: u32,
        interactively_started: bool,
        node_ids: Vec<String>,
        is_root_pipeline: bool,
    },
    RunFinished {
        node_path: NodePath,
        end_time: DateTime<Utc>,
        succeeded: bool,
        interactively_started: bool,
    },
    NodeStarted {
        node_path: NodePath,
        start_time: DateTime<Utc>,
        is_pipeline: bool,
    },
    NodeFinished {
        node_path: NodePath,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        is_pipeline: bool,
        succeeded: bool,
    },
    Output {
        node_path: NodePath,
        message: String,
        format: OutputFormat,
        is_error: bool,
        timestamp: DateTime<Utc>,
    },
    SystemStatistics {
        timestamp: DateTime<Utc>,
        disc_read: Option<f64>,
        disc_write: Option<f64>,
        net_recv: Option<f64>,
        net_sent: Option<f64>,
        cpu_usage: Option<f64>,
        mem_usage: Option<f64>,
        swap_usage: Option<f64>,
        iowait: Option<f64>,
    },
}

impl Event {
    pub fn node_path(&self) -> Option<&NodePath> {
        match self {
            Event::RunStarted { node_path, .. }
            | Event::RunFinished { node_path, .. }
            | Event::NodeStarted { node_path, .. }
            | Event::NodeFinished { node_path, .. }
            | Event::Output { node_path, .. } => Some(node_path),
            Event::SystemStatistics { .. } => None,
        }
    }

    /// Self-describing JSON serialisation used for SSE to a web UI
    /// (spec.md §6, "Event JSON").
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Consumers of the event stream (Slack/Teams notifiers, the built-in run
/// logger, ...). A handler raising is caught at the fan-out site, logged,
/// and suppressed — it must never stop the pipeline (spec.md §4.3, §7
/// `HandlerFailure`).
pub trait EventHandler: Send {
    fn handle_event(&mut self, event: &Event);
}

/// Calls every handler in turn, catching and logging failures so one
/// misbehaving handler can't take down the run.
pub fn notify_all(handlers: &mut [Box<dyn EventHandler>], event: &Event) {
    for handler in handlers.iter_mut() {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler.handle_event(event);
        }));
        if let Err(panic) = result {
            let message = panic_message(&panic);
            log::error!("event handler panicked while handling {event:?}: {message}");
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickingHandler;
    impl EventHandler for PanickingHandler {
        fn handle_event(&mut self, _event: &Event) {
            panic!("boom");
        }
    }

    struct CountingHandler(usize);
    impl EventHandler for CountingHandler {
        fn handle_event(&mut self, _event: &Event) {
            self.0 += 1;
        }
    }

    #[test]
    fn handler_panic_does_not_stop_fanout() {
        let event = Event::Output {
            node_path: vec![],
            message: "hi".into(),
            format: OutputFormat::Standard,
            is_error: false,
            timestamp: Utc::now(),
        };
        let mut handlers: Vec<Box<dyn EventHandler>> =
            vec![Box::new(PanickingHandler), Box::new(CountingHandler(0))];
        notify_all(&mut handlers, &event);
        // second handler still ran despite the first panicking
    }

    #[test]
    fn event_to_json_round_trips_node_path() {
        let event = Event::NodeStarted {
            node_path: vec!["a".into(), "b".into()],
            start_time: Utc::now(),
            is_pipeline: false,
        };
        let json = event.to_json().unwrap();
        assert!(json.contains("\"a\""));
        assert!(json.contains("\"b\""));
    }
}
