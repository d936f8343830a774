//! Illustrative chat-notification handlers (REDESIGN FLAGS item 4): shaped
//! after Slack/Teams message payloads, and constructible from
//! `config.event_handlers` (spec.md §6, see the crate root's `run`). Actual
//! webhook delivery is out of scope (spec.md §1 Non-goals), so these only
//! ever record messages in memory.

use crate::dag::NodePath;
use crate::events::{Event, EventHandler};

/// Teams truncates message bodies; REDESIGN FLAGS bounds ours at 2000 chars
/// to match the platform limit rather than the original's unbounded string.
const TEAMS_MAX_CHARS: usize = 2000;

fn path_label(path: &NodePath) -> String {
    if path.is_empty() {
        "(root)".to_string()
    } else {
        path.join(" / ")
    }
}

/// A single Slack message payload with a text summary and attachments,
/// one per notable event. Mirrors the shape of the Slack `chat.postMessage`
/// API body.
#[derive(Debug, Clone, PartialEq)]
pub struct SlackMessage {
    pub text: String,
    pub attachments: Vec<String>,
}

pub struct SlackNotifier {
    pub messages: Vec<SlackMessage>,
}

impl SlackNotifier {
    pub fn new() -> Self {
        SlackNotifier { messages: Vec::new() }
    }
}

impl Default for SlackNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for SlackNotifier {
    fn handle_event(&mut self, event: &Event) {
        match event {
            Event::RunFinished { succeeded, .. } => {
                let status = if *succeeded { "succeeded" } else { "failed" };
                self.messages.push(SlackMessage {
                    text: format!("Run {status}"),
                    attachments: Vec::new(),
                });
            }
            Event::NodeFinished { node_path, is_pipeline: true, succeeded, .. } if !succeeded => {
                self.messages.push(SlackMessage {
                    text: format!("Pipeline failed: {}", path_label(node_path)),
                    attachments: Vec::new(),
                });
            }
            _ => {}
        }
    }
}

/// A Teams message card, its `text` truncated to the platform's character
/// limit.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamsMessage {
    pub text: String,
}

pub struct TeamsNotifier {
    pub messages: Vec<TeamsMessage>,
}

impl TeamsNotifier {
    pub fn new() -> Self {
        TeamsNotifier { messages: Vec::new() }
    }

    fn truncate(text: String) -> String {
        if text.len() <= TEAMS_MAX_CHARS {
            text
        } else {
            text.chars().take(TEAMS_MAX_CHARS).collect()
        }
    }
}

impl Default for TeamsNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for TeamsNotifier {
    fn handle_event(&mut self, event: &Event) {
        if let Event::RunFinished { succeeded, .. } = event {
            let status = if *succeeded { "succeeded" } else { "failed" };
            self.messages.push(TeamsMessage { text: Self::truncate(format!("Run {status}")) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn slack_notifier_records_run_finished() {
        let mut notifier = SlackNotifier::new();
        notifier.handle_event(&Event::RunFinished {
            node_path: vec![],
            end_time: Utc::now(),
            succeeded: true,
            interactively_started: false,
        });
        assert_eq!(notifier.messages.len(), 1);
        assert_eq!(notifier.messages[0].text, "Run succeeded");
    }

    #[test]
    fn slack_notifier_records_pipeline_failure() {
        let mut notifier = SlackNotifier::new();
        notifier.handle_event(&Event::NodeFinished {
            node_path: vec!["a".to_string()],
            start_time: Utc::now(),
            end_time: Utc::now(),
            is_pipeline: true,
            succeeded: false,
        });
        assert_eq!(notifier.messages[0].text, "Pipeline failed: a");
    }

    #[test]
    fn teams_notifier_truncates_long_text() {
        let long_text = "x".repeat(TEAMS_MAX_CHARS + 500);
        let truncated = TeamsNotifier::truncate(long_text);
        assert_eq!(truncated.len(), TEAMS_MAX_CHARS);
    }
}
