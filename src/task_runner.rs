//! Task runner (C7): runs a task's commands in order with a retry ladder.
//!
//! A task thread is spawned by the scheduler and wrapped there in
//! `catch_unwind` (SPEC_FULL §C) — that boundary *is* the `ChildCrash`
//! equivalent (spec.md §7). `run_task` itself only distinguishes "clean
//! failure" (a command returned `false`) from success; an actual Rust
//! panic during a command is left to propagate to that outer boundary
//! rather than being caught here, so the two failure kinds stay distinct
//! the way a crashed child process's nonzero exit differs from one that
//! wrote a clean `false` status before exiting.

use std::sync::mpsc::Sender;
use std::time::Duration;

use crate::command::CommandContext;
use crate::config::Config;
use crate::dag::{NodePath, Task};
use crate::events::{Event, OutputFormat};
use crate::output::format_duration;

/// `2^(attempt+2)` seconds: 8, 16, 32, 64, ... (spec.md §4.7).
pub fn retry_delay_secs(attempt: u32) -> u64 {
    2u64.pow(attempt + 2)
}

/// Runs `task`'s commands once, in order, stopping at the first failure.
fn run_once(task: &Task, ctx: &CommandContext) -> bool {
    for command in &task.commands {
        if !command.run(ctx) {
            return false;
        }
    }
    true
}

/// Runs `task` to completion, retrying per its (or the config default)
/// `max_retries`, sleeping via `sleep` between attempts. Parameterised over
/// the sleep function so tests can skip real waiting.
pub fn run_task_with_sleep(
    task: &Task,
    node_path: &NodePath,
    config: &Config,
    sender: &Sender<Event>,
    sleep: impl Fn(Duration),
) -> bool {
    let ctx = CommandContext { config, node_path: node_path.clone(), sender: sender.clone() };
    let max_retries = task.max_retries.unwrap_or(config.default_task_max_retries);

    let mut attempt = 0;
    loop {
        let ok = run_once(task, &ctx);
        if ok {
            return true;
        }
        if attempt < max_retries {
            let delay = retry_delay_secs(attempt);
            ctx.log(
                format!("retrying after {}", format_duration(delay as f64)),
                OutputFormat::Italics,
                true,
            );
            sleep(Duration::from_secs(delay));
            attempt += 1;
            continue;
        }
        return false;
    }
}

/// Runs `task` to completion using real `std::thread::sleep` between
/// retries.
pub fn run_task(task: &Task, node_path: &NodePath, config: &Config, sender: &Sender<Event>) -> bool {
    run_task_with_sleep(task, node_path, config, sender, std::thread::sleep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BashCommand, FunctionCommand};
    use std::cell::RefCell;
    use std::sync::mpsc;

    #[test]
    fn succeeds_without_retry_when_first_attempt_passes() {
        let config = Config::default();
        let mut task = Task::new("t", "").unwrap();
        task.add_command(Box::new(BashCommand::new("exit 0")));
        let (tx, _rx) = mpsc::channel();
        let sleeps = RefCell::new(Vec::new());
        let ok = run_task_with_sleep(&task, &vec!["t".to_string()], &config, &tx, |d| sleeps.borrow_mut().push(d));
        assert!(ok);
        assert!(sleeps.borrow().is_empty());
    }

    #[test]
    fn retries_up_to_max_then_fails_with_expected_delays() {
        let mut config = Config::default();
        config.default_task_max_retries = 2;
        let mut task = Task::new("t", "").unwrap();
        task.add_command(Box::new(BashCommand::new("exit 1")));
        let (tx, _rx) = mpsc::channel();
        let sleeps = RefCell::new(Vec::new());
        let ok = run_task_with_sleep(&task, &vec!["t".to_string()], &config, &tx, |d| sleeps.borrow_mut().push(d));
        assert!(!ok);
        assert_eq!(
            sleeps.borrow().clone(),
            vec![Duration::from_secs(8), Duration::from_secs(16)]
        );
    }

    #[test]
    fn succeeds_after_retrying_a_flaky_command() {
        let mut config = Config::default();
        config.default_task_max_retries = 2;
        let attempt = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let attempt_clone = attempt.clone();
        let mut task = Task::new("t", "").unwrap();
        task.add_command(Box::new(FunctionCommand::new("flaky", move || {
            attempt_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= 2
        })));
        let (tx, _rx) = mpsc::channel();
        let ok = run_task_with_sleep(&task, &vec!["t".to_string()], &config, &tx, |_| {});
        assert!(ok);
        assert_eq!(attempt.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn stops_at_first_failing_command() {
        let config = Config::default();
        let ran_second = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_second_clone = ran_second.clone();
        let mut task = Task::new("t", "").unwrap();
        task.add_command(Box::new(BashCommand::new("exit 1")));
        task.add_command(Box::new(FunctionCommand::new("second", move || {
            ran_second_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            true
        })));
        let (tx, _rx) = mpsc::channel();
        let ok = run_task_with_sleep(&task, &vec!["t".to_string()], &config, &tx, |_| {});
        assert!(!ok);
        assert!(!ran_second.load(std::sync::atomic::Ordering::SeqCst));
    }
}
