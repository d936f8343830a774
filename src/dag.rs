//! The pipeline DAG model (nodes, edges, path identity).
//!
//! Nodes form a tree by ownership (a `Pipeline` owns its children, including
//! nested pipelines); "upstream"/"downstream" and "parent" relations are
//! stored as sibling ids rather than object references, following the
//! `path` + re-lookup strategy for back references described in DESIGN.md.
//! A node's identity for scheduling purposes is its [`NodePath`], not a
//! pointer, so the scheduler can use plain `HashSet<NodePath>` bookkeeping
//! instead of juggling borrows of the tree.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::command::Command;
use crate::error::{ConduitError, ConduitResult};

/// The sequence of node ids from (excluding) the root pipeline down to a
/// node. Uniquely identifies a node (invariant 4 in spec.md §3).
pub type NodePath = Vec<String>;

static ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_]+$").unwrap());

fn validate_id(id: &str) -> ConduitResult<()> {
    if ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(ConduitError::InvalidId { id: id.to_string() })
    }
}

/// Attributes shared by every node variant.
#[derive(Debug, Clone)]
pub struct NodeCommon {
    pub id: String,
    pub description: String,
    pub labels: HashMap<String, String>,
    pub upstreams: HashSet<String>,
    pub downstreams: HashSet<String>,
    pub cost: Option<f64>,
}

impl NodeCommon {
    fn new(id: String, description: String) -> Self {
        NodeCommon {
            id,
            description,
            labels: HashMap::new(),
            upstreams: HashSet::new(),
            downstreams: HashSet::new(),
            cost: None,
        }
    }
}

/// A leaf node owning an ordered sequence of commands.
pub struct Task {
    pub common: NodeCommon,
    pub commands: Vec<Box<dyn Command>>,
    pub max_retries: Option<u32>,
}

impl Task {
    pub fn new(id: &str, description: &str) -> ConduitResult<Self> {
        validate_id(id)?;
        Ok(Task {
            common: NodeCommon::new(id.to_string(), description.to_string()),
            commands: Vec::new(),
            max_retries: None,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn add_command(&mut self, command: Box<dyn Command>) {
        self.commands.push(command);
    }

    pub fn with_command(mut self, command: Box<dyn Command>) -> Self {
        self.add_command(command);
        self
    }
}

/// A node that expands into a sub-pipeline at run time.
pub struct ParallelTask {
    pub common: NodeCommon,
    pub commands_before: Vec<Box<dyn Command>>,
    pub commands_after: Vec<Box<dyn Command>>,
    pub max_number_of_parallel_tasks: Option<usize>,
    /// Produces the parallel children to splice into the sub-pipeline
    /// returned by `launch`. Mirrors `ParallelTask.add_parallel_tasks` in
    /// the original, whose default implementation is a no-op; concrete
    /// task generators (per-file, per-parameter, ...) are out of scope
    /// (spec.md §4.11).
    #[allow(clippy::type_complexity)]
    pub parallel_tasks_factory: Option<Box<dyn Fn() -> anyhow::Result<Vec<Node>> + Send + Sync>>,
}

impl ParallelTask {
    pub fn new(id: &str, description: &str) -> ConduitResult<Self> {
        validate_id(id)?;
        Ok(ParallelTask {
            common: NodeCommon::new(id.to_string(), description.to_string()),
            commands_before: Vec::new(),
            commands_after: Vec::new(),
            max_number_of_parallel_tasks: None,
            parallel_tasks_factory: None,
        })
    }

    /// Materialises a fresh sub-pipeline: an initial task running
    /// `commands_before`, a final task running `commands_after`, and
    /// whatever parallel children `parallel_tasks_factory` produces.
    ///
    /// Takes `&mut self` because the before/after commands are moved out
    /// rather than cloned: a `ParallelTask` is only ever launched once,
    /// immediately before the scheduler replaces it with the returned
    /// sub-pipeline (spec.md §4.6 dispatch rules), so there is no second
    /// reader left to need the originals.
    pub fn launch(&mut self) -> anyhow::Result<Pipeline> {
        let mut sub_pipeline = Pipeline::new(
            &self.common.id,
            &format!("Runs {} in parallel", self.common.id),
        )?;
        sub_pipeline.max_number_of_parallel_tasks = self.max_number_of_parallel_tasks;

        let mut before = Task::new("before", "Runs commands-before")?;
        before.commands = std::mem::take(&mut self.commands_before);
        let mut after = Task::new("after", "Runs commands-after")?;
        after.commands = std::mem::take(&mut self.commands_after);

        sub_pipeline.add_initial(Node::Task(before))?;
        sub_pipeline.add_final(Node::Task(after))?;

        if let Some(factory) = &self.parallel_tasks_factory {
            for node in factory()? {
                sub_pipeline.add(node, &[])?;
            }
        }

        Ok(sub_pipeline)
    }
}

/// A DAG of child nodes with explicit dependencies.
pub struct Pipeline {
    pub common: NodeCommon,
    pub nodes: IndexMap<String, Node>,
    pub initial_node: Option<String>,
    pub final_node: Option<String>,
    pub max_number_of_parallel_tasks: Option<usize>,
    pub ignore_errors: bool,
    pub force_run_all_children: bool,
    pub base_path: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(id: &str, description: &str) -> ConduitResult<Self> {
        validate_id(id)?;
        Ok(Pipeline {
            common: NodeCommon::new(id.to_string(), description.to_string()),
            nodes: IndexMap::new(),
            initial_node: None,
            final_node: None,
            max_number_of_parallel_tasks: None,
            ignore_errors: false,
            force_run_all_children: false,
            base_path: None,
        })
    }

    pub fn with_ignore_errors(mut self, ignore_errors: bool) -> Self {
        self.ignore_errors = ignore_errors;
        self
    }

    pub fn with_force_run_all_children(mut self, force_run_all_children: bool) -> Self {
        self.force_run_all_children = force_run_all_children;
        self
    }

    pub fn with_max_number_of_parallel_tasks(mut self, max: usize) -> Self {
        self.max_number_of_parallel_tasks = Some(max);
        self
    }

    pub fn with_base_path(mut self, base_path: PathBuf) -> Self {
        self.base_path = Some(base_path);
        self
    }

    pub fn base_path(&self, parent_base_path: Option<&PathBuf>) -> PathBuf {
        self.base_path
            .clone()
            .or_else(|| parent_base_path.cloned())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Adds `node` to the pipeline, wiring `upstreams` as its dependencies
    /// and auto-wiring the pipeline's initial/final sentinels (spec.md §4.1).
    pub fn add(&mut self, node: Node, upstreams: &[&str]) -> ConduitResult<()> {
        let id = node.common().id.clone();
        if self.nodes.contains_key(&id) {
            return Err(ConduitError::DuplicateId {
                pipeline_id: self.common.id.clone(),
                id,
            });
        }
        self.nodes.insert(id.clone(), node);

        for upstream in upstreams {
            self.add_dependency(upstream, &id)?;
        }

        if let Some(initial) = self.initial_node.clone() {
            let has_upstreams = !self.nodes[&id].common().upstreams.is_empty();
            if !has_upstreams && initial != id {
                self.add_dependency(&initial, &id)?;
            }
        }

        if let Some(final_id) = self.final_node.clone() {
            if final_id != id {
                self.add_dependency(&id, &final_id)?;
            }
        }

        Ok(())
    }

    /// Removes `node` from the pipeline, reconnecting its upstreams to its
    /// downstreams so the rest of the graph stays reachable.
    pub fn remove(&mut self, id: &str) -> ConduitResult<Node> {
        let (upstreams, downstreams) = {
            let node = self.get(id)?;
            (
                node.common().upstreams.clone(),
                node.common().downstreams.clone(),
            )
        };

        for upstream in &upstreams {
            for downstream in &downstreams {
                self.add_dependency(upstream, downstream)?;
            }
        }
        for upstream in &upstreams {
            self.remove_dependency(upstream, id);
        }
        for downstream in &downstreams {
            self.remove_dependency(id, downstream);
        }

        if self.initial_node.as_deref() == Some(id) {
            self.initial_node = None;
        }
        if self.final_node.as_deref() == Some(id) {
            self.final_node = None;
        }

        self.nodes
            .shift_remove(id)
            .ok_or_else(|| ConduitError::NodeNotFound {
                pipeline_id: self.common.id.clone(),
                id: id.to_string(),
            })
    }

    /// Replaces `node` with `new_node`, preserving its dependencies.
    pub fn replace(&mut self, id: &str, mut new_node: Node) -> ConduitResult<()> {
        let (upstreams, downstreams) = {
            let node = self.get(id)?;
            (
                node.common().upstreams.clone(),
                node.common().downstreams.clone(),
            )
        };
        let new_id = new_node.common().id.clone();
        new_node.common_mut().upstreams = upstreams.clone();
        new_node.common_mut().downstreams = downstreams.clone();
        self.nodes.insert(new_id.clone(), new_node);

        for upstream in &upstreams {
            if let Some(n) = self.nodes.get_mut(upstream) {
                n.common_mut().downstreams.remove(id);
                n.common_mut().downstreams.insert(new_id.clone());
            }
        }
        for downstream in &downstreams {
            if let Some(n) = self.nodes.get_mut(downstream) {
                n.common_mut().upstreams.remove(id);
                n.common_mut().upstreams.insert(new_id.clone());
            }
        }

        if self.initial_node.as_deref() == Some(id) {
            self.initial_node = Some(new_id.clone());
        }
        if self.final_node.as_deref() == Some(id) {
            self.final_node = Some(new_id.clone());
        }

        self.nodes.shift_remove(id);
        Ok(())
    }

    /// Wires `upstream -> downstream` and drops the auto-wired sentinel
    /// edges that no longer apply (spec.md §4.1).
    pub fn add_dependency(&mut self, upstream: &str, downstream: &str) -> ConduitResult<()> {
        if !self.nodes.contains_key(upstream) {
            return Err(ConduitError::NodeNotFound {
                pipeline_id: self.common.id.clone(),
                id: upstream.to_string(),
            });
        }
        if !self.nodes.contains_key(downstream) {
            return Err(ConduitError::NodeNotFound {
                pipeline_id: self.common.id.clone(),
                id: downstream.to_string(),
            });
        }

        self.nodes
            .get_mut(upstream)
            .unwrap()
            .common_mut()
            .downstreams
            .insert(downstream.to_string());
        self.nodes
            .get_mut(downstream)
            .unwrap()
            .common_mut()
            .upstreams
            .insert(upstream.to_string());

        if let Some(final_id) = self.final_node.clone() {
            if final_id != downstream {
                self.remove_dependency(upstream, &final_id);
            }
        }
        if let Some(initial_id) = self.initial_node.clone() {
            if initial_id != upstream {
                self.remove_dependency(&initial_id, downstream);
            }
        }

        Ok(())
    }

    pub fn remove_dependency(&mut self, upstream: &str, downstream: &str) {
        if let Some(n) = self.nodes.get_mut(upstream) {
            n.common_mut().downstreams.remove(downstream);
        }
        if let Some(n) = self.nodes.get_mut(downstream) {
            n.common_mut().upstreams.remove(upstream);
        }
    }

    /// Sets `node` as the initial node, wiring it upstream of every
    /// existing leaf, then adds it.
    pub fn add_initial(&mut self, node: Node) -> ConduitResult<()> {
        let id = node.common().id.clone();
        self.nodes.insert(id.clone(), node);
        self.initial_node = Some(id.clone());

        let downstream_ids: Vec<String> = self
            .nodes
            .iter()
            .filter(|(nid, n)| {
                n.common().upstreams.is_empty() && self.final_node.as_deref() != Some(nid.as_str())
            })
            .map(|(nid, _)| nid.clone())
            .collect();
        for downstream in downstream_ids {
            if downstream != id {
                self.add_dependency(&id, &downstream)?;
            }
        }
        Ok(())
    }

    /// Sets `node` as the final node, wiring it downstream of every
    /// existing leaf, then adds it.
    pub fn add_final(&mut self, node: Node) -> ConduitResult<()> {
        let id = node.common().id.clone();
        self.nodes.insert(id.clone(), node);
        self.final_node = Some(id.clone());

        let upstream_ids: Vec<String> = self
            .nodes
            .iter()
            .filter(|(nid, n)| {
                n.common().downstreams.is_empty()
                    && self.initial_node.as_deref() != Some(nid.as_str())
            })
            .map(|(nid, _)| nid.clone())
            .collect();
        for upstream in upstream_ids {
            if upstream != id {
                self.add_dependency(&upstream, &id)?;
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> ConduitResult<&Node> {
        self.nodes.get(id).ok_or_else(|| ConduitError::NodeNotFound {
            pipeline_id: self.common.id.clone(),
            id: id.to_string(),
        })
    }

    pub fn get_mut(&mut self, id: &str) -> ConduitResult<&mut Node> {
        let pipeline_id = self.common.id.clone();
        self.nodes
            .get_mut(id)
            .ok_or(ConduitError::NodeNotFound {
                pipeline_id,
                id: id.to_string(),
            })
    }

    /// Looks up a node by path from this pipeline downward. Returns
    /// `(node_path_resolved_so_far, found)`: on a partial match, the closest
    /// known ancestor pipeline's path is returned along with `false`, so UI
    /// callers can link to the nearest valid page (spec.md §4.1).
    pub fn find_node(&self, path: &[String]) -> (NodePath, bool) {
        fn walk(pipeline: &Pipeline, path: &[String], consumed: &mut NodePath) -> bool {
            if path.is_empty() {
                return true;
            }
            match pipeline.nodes.get(&path[0]) {
                Some(Node::Pipeline(child)) => {
                    consumed.push(path[0].clone());
                    walk(child, &path[1..], consumed)
                }
                Some(_) if path.len() == 1 => {
                    consumed.push(path[0].clone());
                    true
                }
                _ => false,
            }
        }
        let mut consumed = Vec::new();
        let found = walk(self, path, &mut consumed);
        (consumed, found)
    }
}

/// A DAG element: a leaf [`Task`], a [`ParallelTask`], or a nested
/// [`Pipeline`].
pub enum Node {
    Task(Task),
    ParallelTask(ParallelTask),
    Pipeline(Pipeline),
}

impl Node {
    pub fn common(&self) -> &NodeCommon {
        match self {
            Node::Task(t) => &t.common,
            Node::ParallelTask(p) => &p.common,
            Node::Pipeline(p) => &p.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut NodeCommon {
        match self {
            Node::Task(t) => &mut t.common,
            Node::ParallelTask(p) => &mut p.common,
            Node::Pipeline(p) => &mut p.common,
        }
    }

    pub fn is_pipeline(&self) -> bool {
        matches!(self, Node::Pipeline(_))
    }

    pub fn as_pipeline(&self) -> Option<&Pipeline> {
        match self {
            Node::Pipeline(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_pipeline_mut(&mut self) -> Option<&mut Pipeline> {
        match self {
            Node::Pipeline(p) => Some(p),
            _ => None,
        }
    }
}

/// Resolves a [`NodePath`] to a mutable reference into the node tree rooted
/// at `root`, or `None` at the root itself (empty path).
pub fn resolve_mut<'a>(root: &'a mut Pipeline, path: &[String]) -> Option<&'a mut Node> {
    if path.is_empty() {
        return None;
    }
    let (head, rest) = path.split_first().unwrap();
    let node = root.nodes.get_mut(head)?;
    if rest.is_empty() {
        Some(node)
    } else {
        match node {
            Node::Pipeline(p) => resolve_mut(p, rest),
            _ => None,
        }
    }
}

pub fn resolve<'a>(root: &'a Pipeline, path: &[String]) -> Option<&'a Node> {
    if path.is_empty() {
        return None;
    }
    let (head, rest) = path.split_first().unwrap();
    let node = root.nodes.get(head)?;
    if rest.is_empty() {
        Some(node)
    } else {
        match node {
            Node::Pipeline(p) => resolve(p, rest),
            _ => None,
        }
    }
}

/// Returns every ancestor pipeline path of `path`, from the root downward
/// (excluding `path` itself). Mirrors `Node.parents()` in the original,
/// expressed through path re-lookup rather than stored back references.
pub fn ancestor_paths(path: &[String]) -> Vec<NodePath> {
    (0..path.len()).map(|i| path[..i].to_vec()).collect()
}

/// Resolves `path` to the pipeline that owns it, i.e. `path`'s parent. An
/// empty `path` (the root's own path) resolves to `root` itself.
pub fn resolve_parent_mut<'a>(root: &'a mut Pipeline, path: &[String]) -> Option<&'a mut Pipeline> {
    if path.is_empty() {
        return Some(root);
    }
    resolve_pipeline_mut(root, &path[..path.len() - 1])
}

pub fn resolve_parent<'a>(root: &'a Pipeline, path: &[String]) -> Option<&'a Pipeline> {
    if path.is_empty() {
        return Some(root);
    }
    resolve_pipeline(root, &path[..path.len() - 1])
}

/// Resolves `path` to the `Pipeline` located there. An empty `path`
/// resolves to `root` itself.
pub fn resolve_pipeline_mut<'a>(root: &'a mut Pipeline, path: &[String]) -> Option<&'a mut Pipeline> {
    if path.is_empty() {
        return Some(root);
    }
    resolve_mut(root, path)?.as_pipeline_mut()
}

pub fn resolve_pipeline<'a>(root: &'a Pipeline, path: &[String]) -> Option<&'a Pipeline> {
    if path.is_empty() {
        return Some(root);
    }
    resolve(root, path)?.as_pipeline()
}
