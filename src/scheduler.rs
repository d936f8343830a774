//! The scheduler (C6) — the heart of the engine. A ready-set dispatch loop
//! enforcing upstream readiness, per-pipeline concurrency limits, and
//! failure propagation, grounded in `original_source/data_integration/
//! logging/` run-time behaviour described in spec.md §4.6/§5.
//!
//! Runs as a dedicated "executor" thread (SPEC_FULL §C): `run` spawns it
//! and returns the `Receiver<Event>` end of the bus immediately, mirroring
//! the original's forked executor process streaming events back to its
//! caller. All mutation of the pipeline tree and scheduling state happens
//! exclusively inside that thread.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::command::CommandContext;
use crate::config::Config;
use crate::cost::{self, DurationAndRunTime};
use crate::dag::{self, Node, NodePath, Pipeline, Task};
use crate::events::{Event, OutputFormat};
use crate::output::{format_duration, format_time_difference, log_masked};
use crate::stats::StatsSampler;
use crate::task_runner;

/// Restricts a run to a node subset, optionally including their transitive
/// upstreams (spec.md §4.6 setup step 1).
pub struct RunRequest {
    pub nodes: Option<Vec<String>>,
    pub with_upstreams: bool,
    pub interactively_started: bool,
}

impl Default for RunRequest {
    fn default() -> Self {
        RunRequest { nodes: None, with_upstreams: false, interactively_started: false }
    }
}

struct RunningTask {
    handle: JoinHandle<bool>,
    start_time: DateTime<Utc>,
}

/// Grace period the executor waits for the stats sampler thread to notice
/// its stop flag before giving up and detaching it (Open Question 3).
const SAMPLER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Starts a run of `root` and returns the receiving end of its event bus.
/// The executor thread owns `root`, `config`, and all scheduling state for
/// the life of the run; nothing is shared back with the caller except
/// through the channel.
pub fn run(
    mut root: Pipeline,
    request: RunRequest,
    config: Config,
    durations: HashMap<NodePath, DurationAndRunTime>,
) -> Receiver<Event> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        if let Err(err) = apply_node_restriction(&mut root, &request) {
            log::error!("failed to apply node restriction: {err}");
        }
        // Detach root from whatever sibling edges it carried as a node
        // inside some larger, still-live tree — once passed to `run` it is
        // the run's own top-level node (path `[]`), not anyone's sibling
        // (SPEC_FULL §D.6 resolution of spec.md §4.6 steps 1/2).
        root.common.upstreams.clear();
        root.common.downstreams.clear();

        Executor::new(root, config, durations, tx, request.interactively_started).run();
    });
    rx
}

fn apply_node_restriction(root: &mut Pipeline, request: &RunRequest) -> anyhow::Result<()> {
    let Some(nodes) = &request.nodes else { return Ok(()) };

    let mut keep: HashSet<String> = nodes.iter().cloned().collect();
    if request.with_upstreams {
        let mut stack: Vec<String> = nodes.clone();
        while let Some(id) = stack.pop() {
            if let Ok(node) = root.get(&id) {
                for upstream in node.common().upstreams.clone() {
                    if keep.insert(upstream.clone()) {
                        stack.push(upstream);
                    }
                }
            }
        }
    }

    let to_remove: Vec<String> = root
        .nodes
        .keys()
        .filter(|id| !keep.contains(id.as_str()))
        .cloned()
        .collect();
    for id in to_remove {
        root.remove(&id)?;
    }
    Ok(())
}

struct Executor {
    root: Pipeline,
    config: Config,
    durations: HashMap<NodePath, DurationAndRunTime>,
    cost_cache: HashMap<NodePath, f64>,
    sender: Sender<Event>,
    interactively_started: bool,

    processed_nodes: HashSet<NodePath>,
    running_pipelines: HashMap<NodePath, (DateTime<Utc>, usize)>,
    failed_pipelines: HashSet<NodePath>,
    running_tasks: HashMap<NodePath, RunningTask>,
    node_queue: Vec<(NodePath, f64)>,
}

impl Executor {
    fn new(
        root: Pipeline,
        config: Config,
        durations: HashMap<NodePath, DurationAndRunTime>,
        sender: Sender<Event>,
        interactively_started: bool,
    ) -> Self {
        Executor {
            root,
            config,
            durations,
            cost_cache: HashMap::new(),
            sender,
            interactively_started,
            processed_nodes: HashSet::new(),
            running_pipelines: HashMap::new(),
            failed_pipelines: HashSet::new(),
            running_tasks: HashMap::new(),
            node_queue: vec![(Vec::new(), 0.0)],
        }
    }

    fn run(mut self) {
        let node_ids: Vec<String> = self.root.nodes.keys().cloned().collect();
        let _ = self.sender.send(Event::RunStarted {
            node_path: Vec::new(),
            start_time: Utc::now(),
            pid: std::process::id(),
            interactively_started: self.interactively_started,
            node_ids,
            is_root_pipeline: true,
        });

        let stats_period = self.config.system_statistics_collection_period;
        let sampler = StatsSampler::spawn(self.sender.clone(), stats_period);

        while !self.running_tasks.is_empty() || !self.node_queue.is_empty() {
            if self.running_tasks.len() < self.config.max_number_of_parallel_tasks {
                if let Some(path) = self.dequeue() {
                    self.dispatch(path);
                }
            }
            self.collect_finished_tasks();
            self.finalize_finished_pipelines();
            std::thread::sleep(Duration::from_millis(1));
        }
        // Failure propagation during the last batch of collect_finished_tasks
        // can mark the root's own completion condition true only on this
        // final pass (spec.md §4.6).
        self.finalize_finished_pipelines();

        if !sampler.join_with_timeout(SAMPLER_SHUTDOWN_GRACE) {
            log::warn!("stats sampler did not stop within the grace period; detaching it");
        }

        let _ = self.sender.send(Event::RunFinished {
            node_path: Vec::new(),
            end_time: Utc::now(),
            succeeded: self.failed_pipelines.is_empty(),
            interactively_started: self.interactively_started,
        });
    }

    fn is_ready(&self, path: &NodePath) -> bool {
        if path.is_empty() {
            return true;
        }
        let Some(parent) = dag::resolve_parent(&self.root, path) else { return false };
        let id = path.last().unwrap();
        let Ok(node) = parent.get(id) else { return false };

        let upstream_ready = node.common().upstreams.iter().all(|upstream_id| {
            let mut upstream_path = path[..path.len() - 1].to_vec();
            upstream_path.push(upstream_id.clone());
            self.processed_nodes.contains(&upstream_path)
        });
        if !upstream_ready {
            return false;
        }

        let parent_path = &path[..path.len() - 1];
        match parent.max_number_of_parallel_tasks {
            None => true,
            Some(limit) => self
                .running_pipelines
                .get(parent_path)
                .map(|(_, count)| *count < limit)
                .unwrap_or(true),
        }
    }

    /// Returns the nearest ancestor (including `path` itself's parents, but
    /// never `path`) whose `failed_pipelines` membership should block
    /// `path` from running, skipping straight past `ignore_errors`
    /// pipelines per spec.md §4.6.
    fn blocking_ancestor(&self, path: &NodePath) -> Option<NodePath> {
        for ancestor in dag::ancestor_paths(path).into_iter().rev() {
            if !self.failed_pipelines.contains(&ancestor) {
                continue;
            }
            let force_all = dag::resolve_pipeline(&self.root, &ancestor)
                .map(|p| p.force_run_all_children)
                .unwrap_or(false);
            if !force_all {
                return Some(ancestor);
            }
        }
        None
    }

    fn dequeue(&mut self) -> Option<NodePath> {
        loop {
            self.node_queue
                .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            let index = self.node_queue.iter().position(|(path, _)| self.is_ready(path))?;
            let (path, _) = self.node_queue.remove(index);

            if self.blocking_ancestor(&path).is_some() {
                self.processed_nodes.insert(path);
                continue;
            }
            return Some(path);
        }
    }

    fn dispatch(&mut self, path: NodePath) {
        if path.is_empty() {
            // the root pipeline itself; there is no `Node` wrapper to match on.
            self.dispatch_pipeline(path);
            return;
        }
        let Some(node) = dag::resolve(&self.root, &path) else { return };
        match node {
            Node::Task(_) => self.dispatch_task(path),
            Node::Pipeline(_) => self.dispatch_pipeline(path),
            Node::ParallelTask(_) => self.dispatch_parallel_task(path),
        }
    }

    fn bump_parent_running_count(&mut self, path: &NodePath, delta: i64) {
        if path.is_empty() {
            return;
        }
        let parent_path = path[..path.len() - 1].to_vec();
        let entry = self.running_pipelines.entry(parent_path).or_insert((Utc::now(), 0));
        entry.1 = (entry.1 as i64 + delta).max(0) as usize;
    }

    fn dispatch_task(&mut self, path: NodePath) {
        let Some(parent) = dag::resolve_parent_mut(&mut self.root, &path) else { return };
        let id = path.last().unwrap().clone();
        let Ok(node) = parent.get_mut(&id) else { return };
        let Node::Task(task_ref) = node else { return };

        let placeholder = Task::new(&id, "").unwrap_or_else(|_| {
            // ids are already validated when first added to the tree.
            unreachable!("node id was previously validated")
        });
        let task = std::mem::replace(task_ref, placeholder);

        let _ = self.sender.send(Event::NodeStarted {
            node_path: path.clone(),
            start_time: Utc::now(),
            is_pipeline: false,
        });

        let config = self.config.clone();
        let sender = self.sender.clone();
        let task_path = path.clone();
        let handle = std::thread::spawn(move || {
            match std::panic::catch_unwind(AssertUnwindSafe(|| {
                task_runner::run_task(&task, &task_path, &config, &sender)
            })) {
                Ok(succeeded) => succeeded,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "task thread panicked".to_string());
                    let ctx = CommandContext { config: &config, node_path: task_path, sender };
                    ctx.log(message, OutputFormat::Verbatim, true);
                    false
                }
            }
        });

        self.running_tasks.insert(path.clone(), RunningTask { handle, start_time: Utc::now() });
        self.bump_parent_running_count(&path, 1);
    }

    fn dispatch_pipeline(&mut self, path: NodePath) {
        let _ = self.sender.send(Event::NodeStarted {
            node_path: path.clone(),
            start_time: Utc::now(),
            is_pipeline: true,
        });
        self.running_pipelines.insert(path.clone(), (Utc::now(), 0));
        self.bump_parent_running_count(&path, 1);

        let estimate = self.durations.get(&path).map(|d| d.avg_run_time).unwrap_or(0.0);
        log_masked(
            &self.sender,
            path.clone(),
            format!("\u{2605} {}", format_duration(estimate)),
            OutputFormat::Italics,
            false,
            &self.config.password_masks,
        );

        let Some(pipeline) = dag::resolve_pipeline_mut(&mut self.root, &path) else { return };
        let mut node = Node::Pipeline(std::mem::replace(
            pipeline,
            Pipeline::new("placeholder", "").expect("literal id is always valid"),
        ));
        cost::assign_costs(&mut node, &self.durations, &path, &mut self.cost_cache);
        let Node::Pipeline(restored) = node else { unreachable!() };
        *dag::resolve_pipeline_mut(&mut self.root, &path).unwrap() = restored;

        let pipeline = dag::resolve_pipeline(&self.root, &path).unwrap();
        for (id, child) in &pipeline.nodes {
            let mut child_path = path.clone();
            child_path.push(id.clone());
            let child_cost = child.common().cost.unwrap_or(0.0);
            self.node_queue.push((child_path, child_cost));
        }
    }

    fn dispatch_parallel_task(&mut self, path: NodePath) {
        let Some(parent) = dag::resolve_parent_mut(&mut self.root, &path) else { return };
        let id = path.last().unwrap().clone();
        let launch_result = match parent.get_mut(&id) {
            Ok(Node::ParallelTask(parallel_task)) => parallel_task.launch(),
            _ => return,
        };

        match launch_result {
            Ok(sub_pipeline) => {
                if let Err(err) = parent.replace(&id, Node::Pipeline(sub_pipeline)) {
                    log::error!("failed to splice launched parallel task {path:?}: {err}");
                    return;
                }
                self.node_queue.push((path, 0.0));
            }
            Err(err) => {
                let _ = self.sender.send(Event::NodeStarted {
                    node_path: path.clone(),
                    start_time: Utc::now(),
                    is_pipeline: false,
                });
                log_masked(
                    &self.sender,
                    path.clone(),
                    format!("{err:?}"),
                    OutputFormat::Verbatim,
                    true,
                    &self.config.password_masks,
                );
                let _ = self.sender.send(Event::NodeFinished {
                    node_path: path.clone(),
                    start_time: Utc::now(),
                    end_time: Utc::now(),
                    is_pipeline: false,
                    succeeded: false,
                });
                if let Some(parent_path) = path.get(..path.len() - 1) {
                    self.failed_pipelines.insert(parent_path.to_vec());
                }
                self.processed_nodes.insert(path);
            }
        }
    }

    fn collect_finished_tasks(&mut self) {
        let finished: Vec<NodePath> = self
            .running_tasks
            .iter()
            .filter(|(_, task)| task.handle.is_finished())
            .map(|(path, _)| path.clone())
            .collect();

        for path in finished {
            let running = self.running_tasks.remove(&path).unwrap();
            let succeeded = running.handle.join().unwrap_or(false);
            self.bump_parent_running_count(&path, -1);

            let status = if succeeded { "succeeded" } else { "failed" };
            log_masked(
                &self.sender,
                path.clone(),
                format!("{status}, {}", format_time_difference(running.start_time, Utc::now())),
                OutputFormat::Italics,
                !succeeded,
                &self.config.password_masks,
            );
            let _ = self.sender.send(Event::NodeFinished {
                node_path: path.clone(),
                start_time: running.start_time,
                end_time: Utc::now(),
                is_pipeline: false,
                succeeded,
            });

            self.processed_nodes.insert(path.clone());

            if !succeeded {
                self.propagate_failure(&path);
            }
        }
    }

    fn propagate_failure(&mut self, path: &NodePath) {
        for ancestor in dag::ancestor_paths(path).into_iter().rev() {
            let ignore_errors =
                dag::resolve_pipeline(&self.root, &ancestor).map(|p| p.ignore_errors).unwrap_or(false);
            if ignore_errors {
                break;
            }
            self.failed_pipelines.insert(ancestor);
        }
    }

    fn finalize_finished_pipelines(&mut self) {
        loop {
            let mut candidates: Vec<NodePath> = self.running_pipelines.keys().cloned().collect();
            candidates.sort_by_key(|p| std::cmp::Reverse(p.len()));

            let mut finished_any = false;
            for path in candidates {
                let Some(pipeline) = dag::resolve_pipeline(&self.root, &path) else { continue };
                let all_processed = pipeline.nodes.keys().all(|id| {
                    let mut child_path = path.clone();
                    child_path.push(id.clone());
                    self.processed_nodes.contains(&child_path)
                });
                if !all_processed {
                    continue;
                }

                let (start_time, _) = self.running_pipelines.remove(&path).unwrap();
                let succeeded = !self.failed_pipelines.contains(&path);
                let status = if succeeded { "succeeded" } else { "failed" };
                log_masked(
                    &self.sender,
                    path.clone(),
                    format!("{status}, {}", format_time_difference(start_time, Utc::now())),
                    OutputFormat::Italics,
                    !succeeded,
                    &self.config.password_masks,
                );
                let _ = self.sender.send(Event::NodeFinished {
                    node_path: path.clone(),
                    start_time,
                    end_time: Utc::now(),
                    is_pipeline: true,
                    succeeded,
                });

                self.processed_nodes.insert(path.clone());
                self.bump_parent_running_count(&path, -1);
                finished_any = true;
            }
            if !finished_any {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BashCommand, FunctionCommand};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn drain(rx: &Receiver<Event>, timeout: Duration) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match rx.recv_timeout(timeout) {
                Ok(event) => {
                    let is_run_finished = matches!(event, Event::RunFinished { .. });
                    events.push(event);
                    if is_run_finished {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        events
    }

    fn task_with(id: &str, ok: bool) -> Node {
        Node::Task(Task::new(id, "").unwrap().with_command(Box::new(BashCommand::new(if ok {
            "exit 0"
        } else {
            "exit 1"
        }))))
    }

    #[test]
    fn linear_pipeline_all_succeed_emits_expected_sequence() {
        let mut pipeline = Pipeline::new("p", "").unwrap();
        pipeline.add(task_with("a", true), &[]).unwrap();
        pipeline.add(task_with("b", true), &["a"]).unwrap();
        pipeline.add(task_with("c", true), &["b"]).unwrap();

        let mut config = Config::default();
        config.system_statistics_collection_period = 3600;
        let rx = run(pipeline, RunRequest::default(), config, HashMap::new());
        let events = drain(&rx, Duration::from_secs(10));

        let kinds: Vec<String> = events
            .iter()
            .map(|e| match e {
                Event::RunStarted { .. } => "RunStarted".to_string(),
                Event::RunFinished { succeeded, .. } => format!("RunFinished({succeeded})"),
                Event::NodeStarted { node_path, is_pipeline, .. } => {
                    format!("NodeStarted({node_path:?},{is_pipeline})")
                }
                Event::NodeFinished { node_path, succeeded, is_pipeline, .. } => {
                    format!("NodeFinished({node_path:?},{is_pipeline},{succeeded})")
                }
                Event::Output { .. } => "Output".to_string(),
                Event::SystemStatistics { .. } => "SystemStatistics".to_string(),
            })
            .filter(|k| k != "Output" && k != "SystemStatistics")
            .collect();

        assert_eq!(
            kinds,
            vec![
                "RunStarted".to_string(),
                "NodeStarted([], true)".to_string(),
                "NodeStarted([\"a\"], false)".to_string(),
                "NodeFinished([\"a\"], false, true)".to_string(),
                "NodeStarted([\"b\"], false)".to_string(),
                "NodeFinished([\"b\"], false, true)".to_string(),
                "NodeStarted([\"c\"], false)".to_string(),
                "NodeFinished([\"c\"], false, true)".to_string(),
                "NodeFinished([], true, true)".to_string(),
                "RunFinished(true)".to_string(),
            ]
        );
    }

    #[test]
    fn sibling_failure_stops_its_siblings_not_its_aunt() {
        let mut a = Pipeline::new("a", "").unwrap();
        a.add(
            Node::Task(Task::new("x", "").unwrap().with_max_retries(0).with_command(Box::new(
                FunctionCommand::new("slow_failure", || {
                    // gives the scheduler time to dispatch the unrelated
                    // sibling "b" before x's failure is collected and
                    // propagated, so the outcome does not depend on a race.
                    std::thread::sleep(Duration::from_millis(200));
                    false
                }),
            ))),
            &[],
        )
        .unwrap();
        let y_ran = Arc::new(AtomicUsize::new(0));
        let y_ran_clone = y_ran.clone();
        a.add(
            Node::Task(Task::new("y", "").unwrap().with_command(Box::new(FunctionCommand::new(
                "y",
                move || {
                    y_ran_clone.fetch_add(1, Ordering::SeqCst);
                    true
                },
            )))),
            &["x"],
        )
        .unwrap();

        let mut p = Pipeline::new("p", "").unwrap();
        p.add(Node::Pipeline(a), &[]).unwrap();
        p.add(task_with("b", true), &[]).unwrap();

        let mut config = Config::default();
        config.system_statistics_collection_period = 3600;
        let rx = run(p, RunRequest::default(), config, HashMap::new());
        let events = drain(&rx, Duration::from_secs(10));

        assert_eq!(y_ran.load(Ordering::SeqCst), 0, "y must not run after x fails");

        let mut saw_b_finished = false;
        let mut p_succeeded = None;
        for event in &events {
            match event {
                Event::NodeFinished { node_path, succeeded, .. } if node_path == &vec!["b".to_string()] => {
                    saw_b_finished = *succeeded;
                }
                Event::NodeFinished { node_path, succeeded, is_pipeline, .. }
                    if node_path.is_empty() && *is_pipeline =>
                {
                    p_succeeded = Some(*succeeded);
                }
                _ => {}
            }
        }
        assert!(saw_b_finished, "b must still run and succeed");
        assert_eq!(p_succeeded, Some(false));
    }

    #[test]
    fn ignore_errors_absorbs_child_failure() {
        let mut a = Pipeline::new("a", "")
            .unwrap()
            .with_ignore_errors(true);
        a.add(
            Node::Task(Task::new("x", "").unwrap().with_max_retries(0).with_command(Box::new(
                BashCommand::new("exit 1"),
            ))),
            &[],
        )
        .unwrap();

        let mut p = Pipeline::new("p", "").unwrap();
        p.add(Node::Pipeline(a), &[]).unwrap();

        let mut config = Config::default();
        config.system_statistics_collection_period = 3600;
        let rx = run(p, RunRequest::default(), config, HashMap::new());
        let events = drain(&rx, Duration::from_secs(10));

        let run_finished = events
            .iter()
            .find_map(|e| match e {
                Event::RunFinished { succeeded, .. } => Some(*succeeded),
                _ => None,
            })
            .unwrap();
        assert!(run_finished, "ignore_errors must stop propagation before reaching p");
    }

    #[test]
    fn force_run_all_children_runs_siblings_after_failure() {
        let y_ran = Arc::new(AtomicUsize::new(0));
        let y_ran_clone = y_ran.clone();
        let mut p = Pipeline::new("p", "").unwrap().with_force_run_all_children(true);
        p.add(
            Node::Task(Task::new("x", "").unwrap().with_max_retries(0).with_command(Box::new(
                BashCommand::new("exit 1"),
            ))),
            &[],
        )
        .unwrap();
        p.add(
            Node::Task(Task::new("y", "").unwrap().with_command(Box::new(FunctionCommand::new(
                "y",
                move || {
                    y_ran_clone.fetch_add(1, Ordering::SeqCst);
                    true
                },
            )))),
            &[],
        )
        .unwrap();

        let mut config = Config::default();
        config.system_statistics_collection_period = 3600;
        let rx = run(p, RunRequest::default(), config, HashMap::new());
        let _ = drain(&rx, Duration::from_secs(10));
        assert_eq!(y_ran.load(Ordering::SeqCst), 1, "y must run despite x's failure");
    }

    #[test]
    fn selective_run_with_upstreams_skips_unrelated_branch() {
        let mut p = Pipeline::new("p", "").unwrap();
        p.add(task_with("a", true), &[]).unwrap();
        p.add(task_with("b", true), &["a"]).unwrap();
        p.add(task_with("c", true), &["b"]).unwrap();
        let d_ran = Arc::new(AtomicUsize::new(0));
        let d_ran_clone = d_ran.clone();
        p.add(
            Node::Task(Task::new("d", "").unwrap().with_command(Box::new(FunctionCommand::new(
                "d",
                move || {
                    d_ran_clone.fetch_add(1, Ordering::SeqCst);
                    true
                },
            )))),
            &["a"],
        )
        .unwrap();

        let mut config = Config::default();
        config.system_statistics_collection_period = 3600;
        let request = RunRequest { nodes: Some(vec!["c".to_string()]), with_upstreams: true, ..Default::default() };
        let rx = run(p, request, config, HashMap::new());
        let events = drain(&rx, Duration::from_secs(10));

        assert_eq!(d_ran.load(Ordering::SeqCst), 0, "d is not in the closure of c and must be skipped");
        let ran: HashSet<String> = events
            .iter()
            .filter_map(|e| match e {
                Event::NodeFinished { node_path, is_pipeline: false, .. } if !node_path.is_empty() => {
                    Some(node_path[0].clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(ran, HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()]));
    }
}
