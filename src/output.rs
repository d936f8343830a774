//! Output capture (C4): turns child process stdout/stderr and the engine's
//! own status lines into `Output` events, with password masking applied
//! before anything leaves the producer (spec.md §4.3 "Password masking").

use std::sync::mpsc::Sender;

use chrono::Utc;

use crate::dag::NodePath;
use crate::events::{Event, OutputFormat};

/// Masks `message` against `password_masks`, and — if anything is left
/// after trimming — pushes it onto `sender` as an `Output` event bound to
/// `node_path`. Mirrors `mara_pipelines.logging.logger.log`: blank
/// messages are dropped rather than emitted as empty output lines.
pub fn log_masked(
    sender: &Sender<Event>,
    node_path: NodePath,
    message: String,
    format: OutputFormat,
    is_error: bool,
    password_masks: &[String],
) {
    let mut message = message.trim_end().to_string();
    for mask in password_masks {
        if !mask.is_empty() {
            message = message.replace(mask.as_str(), "***");
        }
    }
    if message.is_empty() {
        return;
    }
    let _ = sender.send(Event::Output {
        node_path,
        message,
        format,
        is_error,
        timestamp: Utc::now(),
    });
}

/// A small handle bundling a node path with the event sender and the
/// configured password masks, so engine-internal call sites (scheduler,
/// task runner) don't need to carry all three separately.
#[derive(Clone)]
pub struct Logger {
    pub sender: Sender<Event>,
    pub node_path: NodePath,
    pub password_masks: Vec<String>,
}

impl Logger {
    pub fn new(sender: Sender<Event>, node_path: NodePath, password_masks: Vec<String>) -> Self {
        Logger { sender, node_path, password_masks }
    }

    pub fn log(&self, message: impl Into<String>, format: OutputFormat, is_error: bool) {
        log_masked(
            &self.sender,
            self.node_path.clone(),
            message.into(),
            format,
            is_error,
            &self.password_masks,
        );
    }

    pub fn with_node_path(&self, node_path: NodePath) -> Self {
        Logger {
            sender: self.sender.clone(),
            node_path,
            password_masks: self.password_masks.clone(),
        }
    }
}

/// Formats a duration in human-readable form, matching
/// `mara_pipelines.logging.node_cost.format_duration`:
///
/// ```
/// use conduit::output::format_duration;
/// assert_eq!(format_duration(0.12), "0.1s");
/// assert_eq!(format_duration(70.2), "1:10m");
/// assert_eq!(format_duration(4000.0), "1:06h");
/// ```
pub fn format_duration(duration: f64) -> String {
    let mut remaining = duration;
    let hours = (remaining / 3600.0).floor() as i64;
    remaining -= 3600.0 * hours as f64;
    let minutes = (remaining / 60.0).floor() as i64;
    remaining -= 60.0 * minutes as f64;
    let seconds = remaining.floor() as i64;

    if hours > 0 {
        format!("{hours}:{minutes:02}h")
    } else if minutes > 0 {
        format!("{minutes}:{seconds:02}m")
    } else {
        format!("{:.1}s", (remaining * 10.0).round() / 10.0)
    }
}

/// Displays the time difference from `start` to `end` in a human-readable
/// form, e.g. `"2 minutes, 3 seconds"`. Mirrors
/// `mara_pipelines.logging.logger.format_time_difference`.
pub fn format_time_difference(start: chrono::DateTime<Utc>, end: chrono::DateTime<Utc>) -> String {
    let total_seconds = (end - start).num_seconds().max(0);
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(plural(days, "day"));
    }
    if hours > 0 {
        parts.push(plural(hours, "hour"));
    }
    if minutes > 0 {
        parts.push(plural(minutes, "minute"));
    }
    // seconds is always included, even when zero, matching the original's
    // `or attr == 'seconds'` fallback
    parts.push(plural(seconds, "second"));
    parts.join(", ")
}

fn plural(value: i64, unit: &str) -> String {
    if value == 1 {
        format!("1 {unit}")
    } else {
        format!("{value} {unit}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn format_duration_sub_minute() {
        assert_eq!(format_duration(0.12), "0.1s");
        assert_eq!(format_duration(5.6), "5.6s");
    }

    #[test]
    fn format_duration_minutes() {
        assert_eq!(format_duration(70.2), "1:10m");
    }

    #[test]
    fn format_duration_hours() {
        assert_eq!(format_duration(4000.0), "1:06h");
    }

    #[test]
    fn format_time_difference_includes_seconds_even_at_zero() {
        let start = Utc::now();
        assert_eq!(format_time_difference(start, start), "0 seconds");
    }

    #[test]
    fn format_time_difference_minutes_and_seconds() {
        let start = Utc::now();
        let end = start + Duration::seconds(125);
        assert_eq!(format_time_difference(start, end), "2 minutes, 5 seconds");
    }

    #[test]
    fn log_masked_drops_blank_messages() {
        let (tx, rx) = std::sync::mpsc::channel();
        log_masked(&tx, vec![], "   ".to_string(), OutputFormat::Standard, false, &[]);
        drop(tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn log_masked_applies_password_masks() {
        let (tx, rx) = std::sync::mpsc::channel();
        log_masked(
            &tx,
            vec![],
            "token=abc123".to_string(),
            OutputFormat::Standard,
            false,
            &["abc123".to_string()],
        );
        match rx.recv().unwrap() {
            Event::Output { message, .. } => assert_eq!(message, "token=***"),
            _ => panic!("expected Output"),
        }
    }
}
