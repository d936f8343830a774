//! CLI surface (spec.md §6). `run_interactively` is out of scope — this
//! binary covers `run` and `reset_incremental_processing`.
//!
//! There's no pipeline-definition file format here (a deployment builds its
//! own [`conduit::dag::Pipeline`] tree in Rust, the way the original wires
//! `root_pipeline` from its config module). This binary stands in for that
//! deployment-specific entry point with a small illustrative pipeline so the
//! commands below have something to act on.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use conduit::command::BashCommand;
use conduit::config::Config;
use conduit::dag::{Node, NodePath, Pipeline, Task};
use conduit::events::EventHandler;
use conduit::scheduler::RunRequest;
use rusqlite::Connection;

#[derive(Parser)]
#[command(name = "conduit", about = "Cost-aware, parallel DAG pipeline execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file; falls back to built-in defaults when omitted.
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the pipeline located by `--path`, optionally restricted to `--nodes`.
    Run {
        /// Comma-separated ids locating a (possibly nested) pipeline, relative to root.
        #[arg(long, value_delimiter = ',')]
        path: Vec<String>,
        /// Comma-separated node ids to restrict the run to.
        #[arg(long, value_delimiter = ',')]
        nodes: Option<Vec<String>>,
        /// Also run each restricted node's transitive upstreams.
        #[arg(long)]
        with_upstreams: bool,
        /// Disable ANSI colour in logged output.
        #[arg(long)]
        disable_colors: bool,
    },
    /// Deletes incremental-processing rows beneath `--path`.
    ResetIncrementalProcessing {
        #[arg(long, value_delimiter = ',')]
        path: Vec<String>,
    },
}

/// A minimal stand-in pipeline tree, until a real deployment supplies its own.
fn sample_pipeline() -> Pipeline {
    let mut root = Pipeline::new("root", "sample pipeline").expect("valid root id");
    root.add(Node::Task(Task::new("extract", "extract source data").unwrap()), &[])
        .expect("unique id");
    root.add(
        Node::Task(
            Task::new("load", "load into the warehouse")
                .unwrap()
                .with_command(Box::new(BashCommand::new("true"))),
        ),
        &["extract"],
    )
    .expect("unique id");
    root
}

/// Descends `path` from `root`, removing each named pipeline from its parent
/// as it goes, and returns the located pipeline by value. `Pipeline` holds
/// `Box<dyn Command>` trait objects and so isn't `Clone`; moving it out node
/// by node avoids needing to be.
fn locate(root: Pipeline, path: &[String]) -> anyhow::Result<Pipeline> {
    let mut current = root;
    for id in path {
        match current.remove(id)? {
            Node::Pipeline(pipeline) => current = pipeline,
            Node::Task(_) | Node::ParallelTask(_) => {
                anyhow::bail!("node \"{id}\" is not a pipeline")
            }
        }
    }
    Ok(current)
}

fn run_command(
    config: Config,
    path: Vec<String>,
    nodes: Option<Vec<String>>,
    with_upstreams: bool,
) -> anyhow::Result<ExitCode> {
    let pipeline = locate(sample_pipeline(), &path)?;

    let request = RunRequest { nodes, with_upstreams, interactively_started: false };
    let handlers: Vec<Box<dyn EventHandler>> = Vec::new();
    let succeeded = conduit::run(pipeline, request, config, handlers)?;
    Ok(if succeeded { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn reset_incremental_processing_command(config: Config, path: Vec<String>) -> anyhow::Result<ExitCode> {
    let node_path: NodePath = path;
    let db_path = config
        .run_log_path
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("run_log_path must be configured to reset incremental state"))?;
    let conn = Connection::open(db_path)?;
    conduit::incremental::create_schema(&conn)?;
    conduit::incremental::reset_incremental_processing(&conn, &node_path)?;
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("failed to read config from {path}: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    let result = match cli.command {
        Commands::Run { path, nodes, with_upstreams, disable_colors: _ } => {
            run_command(config, path, nodes, with_upstreams)
        }
        Commands::ResetIncrementalProcessing { path } => {
            reset_incremental_processing_command(config, path)
        }
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
