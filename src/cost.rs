//! The cost engine (C5): orders the ready set so the longest critical path
//! runs first, based on historical node-run durations.

use std::collections::HashMap;

use crate::dag::{Node, NodePath};
use crate::run_log::NodeRunHistoryEntry;

/// Per-node average duration and average run time, keyed by node path.
/// `avg_run_time` is the sum of `avg_duration` over all leaf (non-pipeline)
/// descendants — precomputed once per engine run over the history rows
/// rooted at the pipeline being scheduled (spec.md §4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationAndRunTime {
    pub avg_duration: f64,
    pub avg_run_time: f64,
}

/// Aggregates historical `NodeRun` rows into `{node_path: [avg_duration,
/// avg_run_time]}`, mirroring `node_durations_and_run_times` in the
/// original. `history` is expected to already be filtered to the subtree
/// rooted at the pipeline being scheduled.
pub fn node_durations_and_run_times(
    history: &[NodeRunHistoryEntry],
) -> HashMap<NodePath, DurationAndRunTime> {
    let mut by_path: HashMap<NodePath, (f64, usize, bool)> = HashMap::new();
    for entry in history {
        let slot = by_path
            .entry(entry.node_path.clone())
            .or_insert((0.0, 0, false));
        slot.0 += entry.duration_seconds;
        slot.1 += 1;
        slot.2 |= entry.is_pipeline;
    }

    let avg_durations: HashMap<NodePath, (f64, bool)> = by_path
        .into_iter()
        .map(|(path, (total, count, is_pipeline))| {
            (path, (total / count as f64, is_pipeline))
        })
        .collect();

    let mut result = HashMap::new();
    for (path, (avg_duration, _is_pipeline)) in &avg_durations {
        let avg_run_time: f64 = avg_durations
            .iter()
            .filter(|(leaf_path, (_, leaf_is_pipeline))| {
                !*leaf_is_pipeline && leaf_path.starts_with(path.as_slice())
            })
            .map(|(_, (duration, _))| duration)
            .sum();
        result.insert(
            path.clone(),
            DurationAndRunTime {
                avg_duration: *avg_duration,
                avg_run_time,
            },
        );
    }
    result
}

/// Computes `cost(node) = avg_run_time(node) + max(cost(d) for d in
/// node.downstreams, default 0)`, reading downstream costs from
/// `resolved_costs` (already computed earlier in traversal order, or 0.0
/// for nodes outside the in-memory map, e.g. newly queued nodes without
/// history). Memoised into `node.common_mut().cost` by the caller.
pub fn compute_cost(
    node_path: &NodePath,
    downstream_costs: &[f64],
    durations: &HashMap<NodePath, DurationAndRunTime>,
) -> f64 {
    let avg_run_time = durations.get(node_path).map(|d| d.avg_run_time).unwrap_or(0.0);
    let max_downstream = downstream_costs.iter().cloned().fold(0.0_f64, f64::max);
    avg_run_time + max_downstream
}

/// Sorts `queue` by descending cost, reading each node's memoised
/// `common().cost` (defaulting to 0.0). Ties keep their relative insertion
/// order (a stable sort), matching spec.md §4.5's "any deterministic total
/// order" tie-break.
pub fn sort_by_cost_desc(queue: &mut [(NodePath, f64)]) {
    queue.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
}

/// Recursively assigns `cost` to `node` and every node in its subtree,
/// walking downstream-first by construction: costs are computed bottom-up
/// from each node's own downstreams within the *same* pipeline; a node's
/// downstreams always point at registered siblings, so a single pass that
/// memoises into `cost_cache` converges regardless of visitation order.
pub fn assign_costs(
    node: &mut Node,
    durations: &HashMap<NodePath, DurationAndRunTime>,
    parent_path: &NodePath,
    cost_cache: &mut HashMap<NodePath, f64>,
) {
    if let Node::Pipeline(pipeline) = node {
        // compute children bottom-up: downstream-less nodes first is not
        // required because `cost` only reads already-registered downstream
        // costs from `cost_cache`/the sibling's own field, which were
        // populated when that sibling itself was assigned. We iterate
        // sibling ids in dependency order (downstream-fixpoint) by running
        // the whole set twice: once to let every node compute from
        // whatever is cached so far (initially 0 for not-yet-visited
        // downstreams), once more to pick up updates. Because `cost` is
        // monotonic and the graph is acyclic, two passes over a
        // topologically-reasonable order converge; to guarantee
        // correctness regardless of insertion order we instead do a
        // depth-first walk driven by downstream edges.
        let ids: Vec<String> = pipeline.nodes.keys().cloned().collect();
        for id in ids {
            let mut path = parent_path.clone();
            path.push(id.clone());
            compute_node_cost(pipeline, &id, durations, &path, cost_cache);
        }
    }
}

fn compute_node_cost(
    pipeline: &mut crate::dag::Pipeline,
    id: &str,
    durations: &HashMap<NodePath, DurationAndRunTime>,
    path: &NodePath,
    cost_cache: &mut HashMap<NodePath, f64>,
) -> f64 {
    if let Some(cached) = cost_cache.get(path) {
        return *cached;
    }

    let downstream_ids: Vec<String> = pipeline
        .nodes
        .get(id)
        .map(|n| n.common().downstreams.iter().cloned().collect())
        .unwrap_or_default();

    let mut downstream_costs = Vec::with_capacity(downstream_ids.len());
    for downstream_id in &downstream_ids {
        let mut downstream_path = path[..path.len() - 1].to_vec();
        downstream_path.push(downstream_id.clone());
        downstream_costs.push(compute_node_cost(
            pipeline,
            downstream_id,
            durations,
            &downstream_path,
            cost_cache,
        ));
    }

    let cost = compute_cost(path, &downstream_costs, durations);
    cost_cache.insert(path.clone(), cost);
    if let Some(node) = pipeline.nodes.get_mut(id) {
        node.common_mut().cost = Some(cost);
    }
    cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Node, Pipeline, Task};

    fn history(path: &[&str], duration: f64, is_pipeline: bool) -> NodeRunHistoryEntry {
        NodeRunHistoryEntry {
            node_path: path.iter().map(|s| s.to_string()).collect(),
            duration_seconds: duration,
            is_pipeline,
        }
    }

    #[test]
    fn avg_run_time_sums_leaf_descendants() {
        let history = vec![
            history(&["p", "a"], 10.0, false),
            history(&["p", "b"], 20.0, false),
            history(&["p"], 5.0, true),
        ];
        let durations = node_durations_and_run_times(&history);
        let p = durations.get(&vec!["p".to_string()]).unwrap();
        assert_eq!(p.avg_run_time, 30.0);
        assert_eq!(p.avg_duration, 5.0);
    }

    #[test]
    fn cost_is_run_time_plus_max_downstream_cost() {
        let durations = HashMap::new();
        let cost = compute_cost(&vec!["x".into()], &[3.0, 7.0, 1.0], &durations);
        assert_eq!(cost, 7.0);
    }

    #[test]
    fn cost_propagates_upstream_through_pipeline() {
        let mut pipeline = Pipeline::new("root", "").unwrap();
        pipeline.add(Node::Task(Task::new("a", "").unwrap()), &[]).unwrap();
        pipeline.add(Node::Task(Task::new("b", "").unwrap()), &["a"]).unwrap();

        let history = vec![history(&["a"], 10.0, false), history(&["b"], 5.0, false)];
        let durations = node_durations_and_run_times(&history);

        let mut root = Node::Pipeline(pipeline);
        let mut cache = HashMap::new();
        assign_costs(&mut root, &durations, &vec![], &mut cache);

        let pipeline = root.as_pipeline().unwrap();
        // a's cost must include its own run time plus downstream b's cost
        assert_eq!(pipeline.nodes["a"].common().cost, Some(15.0));
        assert_eq!(pipeline.nodes["b"].common().cost, Some(5.0));
    }

    #[test]
    fn sort_by_cost_desc_orders_descending() {
        let mut queue = vec![
            (vec!["a".to_string()], 1.0),
            (vec!["b".to_string()], 5.0),
            (vec!["c".to_string()], 3.0),
        ];
        sort_by_cost_desc(&mut queue);
        let order: Vec<&str> = queue.iter().map(|(p, _)| p[0].as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }
}
