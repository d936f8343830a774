//! The command contract (C2): the uniform interface tasks use to run
//! shell snippets or in-process closures.

use std::io::{BufRead, BufReader};
use std::process::Stdio;

use crate::config::Config;
use crate::dag::NodePath;
use crate::events::{Event, OutputFormat};

/// Everything a [`Command`] needs in order to run and report back: the
/// bash invocation to use and a sender for streaming output into the event
/// stream, already bound to the owning task's path (spec.md §4.2/§4.4).
pub struct CommandContext<'a> {
    pub config: &'a Config,
    pub node_path: NodePath,
    pub sender: std::sync::mpsc::Sender<Event>,
}

impl<'a> CommandContext<'a> {
    pub fn log(&self, message: impl Into<String>, format: OutputFormat, is_error: bool) {
        crate::output::log_masked(
            &self.sender,
            self.node_path.clone(),
            message.into(),
            format,
            is_error,
            &self.config.password_masks,
        );
    }
}

/// A unit of work inside a task. Succeeds iff `run()` returns `true`.
pub trait Command: Send + Sync {
    /// Runs the command, streaming any stdout/stderr to the event stream.
    /// The default implementation shells out to [`Command::shell_command`]
    /// via the configured bash invocation with a pipefail-equivalent
    /// option, so a failure anywhere in a pipe segment surfaces.
    fn run(&self, ctx: &CommandContext) -> bool {
        let Some(shell_command) = self.shell_command() else {
            return false;
        };
        run_shell_command(&shell_command, ctx)
    }

    /// A bash snippet that runs the command. `None` for commands that
    /// override `run()` directly (e.g. in-process function commands).
    fn shell_command(&self) -> Option<String> {
        None
    }

    /// Human-readable parameters for documentation/debugging.
    fn html_doc_items(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Runs `shell_command` using the configured bash invocation, streaming
/// each output line as a `verbatim` [`Event::Output`].
pub fn run_shell_command(shell_command: &str, ctx: &CommandContext) -> bool {
    let interpreter = ctx.config.bash_command_string.clone();
    let mut parts = interpreter.split_whitespace();
    let Some(program) = parts.next() else {
        ctx.log(
            "empty bash_command_string in configuration",
            OutputFormat::Verbatim,
            true,
        );
        return false;
    };
    let args: Vec<&str> = parts.collect();

    let mut child = match std::process::Command::new(program)
        .args(&args)
        .arg("-c")
        .arg(shell_command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            ctx.log(format!("could not spawn shell: {err}"), OutputFormat::Verbatim, true);
            return false;
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    std::thread::scope(|scope| {
        if let Some(stdout) = stdout {
            let ctx = &ctx;
            scope.spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    ctx.log(line, OutputFormat::Verbatim, false);
                }
            });
        }
        if let Some(stderr) = stderr {
            let ctx = &ctx;
            scope.spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    ctx.log(line, OutputFormat::Verbatim, true);
                }
            });
        }
    });

    match child.wait() {
        Ok(status) => status.success(),
        Err(err) => {
            ctx.log(format!("could not wait on shell: {err}"), OutputFormat::Verbatim, true);
            false
        }
    }
}

/// A command that runs a fixed bash snippet.
#[derive(Clone)]
pub struct BashCommand {
    pub command: String,
}

impl BashCommand {
    pub fn new(command: impl Into<String>) -> Self {
        BashCommand { command: command.into() }
    }
}

impl Command for BashCommand {
    fn shell_command(&self) -> Option<String> {
        Some(self.command.clone())
    }

    fn html_doc_items(&self) -> Vec<(String, String)> {
        vec![("command".to_string(), self.command.clone())]
    }
}

/// A command that runs an in-process function instead of shelling out.
/// Grounded in `mara_pipelines.commands.python.RunFunction` (out of scope
/// as a concrete runner per spec.md §1, but the plumbing for in-process
/// commands is part of the C2 contract, so one concrete implementation is
/// useful for tests and for pipelines that don't need a subprocess).
pub struct FunctionCommand {
    pub name: String,
    pub function: Box<dyn Fn() -> bool + Send + Sync>,
}

impl FunctionCommand {
    pub fn new(name: impl Into<String>, function: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        FunctionCommand {
            name: name.into(),
            function: Box::new(function),
        }
    }
}

impl Command for FunctionCommand {
    fn run(&self, _ctx: &CommandContext) -> bool {
        (self.function)()
    }

    fn html_doc_items(&self) -> Vec<(String, String)> {
        vec![("function".to_string(), self.name.clone())]
    }
}
