//! Pruning: rewrites the graph to elide already-satisfied work (§4.3).

use rustc_hash::FxHashMap;

use crate::graph::{Direction, Graph};
use crate::job::{EdgeStatus, Job, WaitFor};

/// Prune the graph reachable from `seeds` in place, returning the subset of
/// seeds that still need to run (`done() == false` after pruning).
///
/// `order` (from `graph.dfs(seeds, Direction::Parents)`) visits each node
/// before its parents, so a parent's `done_cache` is not yet populated when
/// the node partitioning its own parents runs. Rather than depend on a
/// traversal order that visits parents first, the partition step below
/// re-evaluates a parent's `done()` live instead of trusting the cache —
/// correct regardless of visitation order, at the cost of possibly
/// re-running a parent's postconditions a handful of times.
///
/// This rewrite is idempotent: running it again over an already-pruned graph
/// changes nothing, because every job it touches either has no parents left
/// or has already recorded its final `unsatisfied` set.
pub fn prune(
    graph: &mut Graph<EdgeStatus>,
    jobs: &mut FxHashMap<crate::graph::NodeId, Job>,
    seeds: &[crate::graph::NodeId],
) -> Vec<crate::graph::NodeId> {
    let order = graph.dfs(seeds.iter().copied(), Direction::Parents);

    for &node in &order {
        // Compute and cache `done` once; everything downstream in this pass
        // and the rest of the scheduler run reads the cached value.
        let done = jobs[&node].done();
        jobs.get_mut(&node).unwrap().done_cache = Some(done);

        if done {
            let parents: Vec<_> = graph.parents(node).map(|(p, _)| p).collect();
            for parent in parents {
                graph.rm_parent(node, parent);
            }
            continue;
        }

        jobs.get_mut(&node).unwrap().shrink_array_to_unsatisfied();

        let parents: Vec<(crate::graph::NodeId, EdgeStatus)> =
            graph.parents(node).map(|(p, s)| (p, *s)).collect();

        let mut satisfied = Vec::new();
        let mut unsatisfied = Vec::new();
        let mut pending = Vec::new();

        for (parent, status) in parents {
            let parent_done = jobs[&parent].done();
            if parent_done && matches!(status, EdgeStatus::Success | EdgeStatus::Any) {
                satisfied.push(parent);
            } else if parent_done && matches!(status, EdgeStatus::Failure) {
                unsatisfied.push(parent);
            } else {
                pending.push(parent);
            }
        }

        for parent in satisfied.iter().chain(unsatisfied.iter()) {
            graph.rm_parent(node, *parent);
        }

        if !unsatisfied.is_empty() {
            let job_name = jobs[&node].display_name();
            for parent in &unsatisfied {
                tracing::warn!(
                    job = %job_name,
                    parent = %jobs[parent].display_name(),
                    "pruning detached an unsatisfied parent"
                );
            }
        }

        let waitfor = jobs[&node].waitfor;
        if waitfor == WaitFor::Any && !satisfied.is_empty() {
            for parent in &pending {
                graph.rm_parent(node, *parent);
            }
            jobs.get_mut(&node).unwrap().unsatisfied.clear();
        } else {
            jobs.get_mut(&node).unwrap().unsatisfied = unsatisfied;
        }
    }

    seeds
        .iter()
        .copied()
        .filter(|s| !jobs[s].done_cache.unwrap_or(false))
        .collect()
}
