//! The job graph: the concrete, already-wired structure the scheduler
//! receives (§1 — the surface that builds this, decorators or otherwise, is
//! out of scope; this module is the landing point for already-constructed
//! job objects).

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{Direction, Graph, NodeId};
use crate::job::{EdgeStatus, Job, WaitFor};

/// Unique identifier for a scheduler run, used to namespace its on-disk
/// workflow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Generate a fresh run identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a workflow ID from a string (e.g. a `workflows.csv` row or a
    /// `--resume <uuid>` argument).
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A set of jobs wired together with dependency edges: the graph (C1) paired
/// with the job objects (C2) it addresses.
///
/// `JobGraph` owns both the arena and the jobs so that edge mutation
/// (`after`) and job mutation (`ensure`, `waitfor`) stay consistent —
/// everything here is mutable up until it's handed to
/// [`crate::scheduler::schedule`], which takes the graph and job map by
/// value.
#[derive(Default)]
pub struct JobGraph {
    graph: Graph<EdgeStatus>,
    jobs: FxHashMap<NodeId, Job>,
}

impl JobGraph {
    /// An empty job graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a node for a job that will be constructed immediately
    /// afterwards (job construction needs its `NodeId` up front).
    pub fn reserve_node(&mut self) -> NodeId {
        self.graph.add_node()
    }

    /// Insert an already-constructed job. `job.node` must have come from
    /// this same graph's [`JobGraph::reserve_node`].
    pub fn insert(&mut self, job: Job) -> NodeId {
        let node = job.node;
        self.jobs.insert(node, job);
        node
    }

    /// Attach `dep` as a parent of `job` with the given status. Mirrors
    /// `Job.after` from the programmatic surface (§6), but lives here
    /// because edges are graph state, not job state.
    pub fn after(&mut self, job: NodeId, dep: NodeId, status: EdgeStatus) {
        self.graph.add_parent(job, dep, status);
    }

    /// Set `job`'s wait policy.
    pub fn set_waitfor(&mut self, job: NodeId, mode: WaitFor) {
        if let Some(j) = self.jobs.get_mut(&job) {
            j.set_waitfor(mode);
        }
    }

    /// Borrow a job by node.
    pub fn job(&self, node: NodeId) -> Option<&Job> {
        self.jobs.get(&node)
    }

    /// Mutably borrow a job by node (for `ensure`, settings, etc. during
    /// assembly).
    pub fn job_mut(&mut self, node: NodeId) -> Option<&mut Job> {
        self.jobs.get_mut(&node)
    }

    /// Every node reachable from `seeds` walking parent edges (the
    /// transitive closure `schedule` operates on).
    pub fn closure(&self, seeds: &[NodeId]) -> Vec<NodeId> {
        self.graph.dfs(seeds.iter().copied(), Direction::Parents)
    }

    /// Decompose into the raw graph and job map, consumed by
    /// [`crate::scheduler::schedule`].
    pub fn into_parts(self) -> (Graph<EdgeStatus>, FxHashMap<NodeId, Job>) {
        (self.graph, self.jobs)
    }

    /// Number of jobs in the graph.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the graph holds no jobs.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Arc;

    fn scalar_job(g: &mut JobGraph, name: &str) -> NodeId {
        let node = g.reserve_node();
        g.insert(Job::scalar(node, name, Arc::new(|| Ok(Value::Null))))
    }

    #[test]
    fn insert_and_lookup_round_trips() {
        let mut g = JobGraph::new();
        let a = scalar_job(&mut g, "a");
        assert_eq!(g.job(a).unwrap().name, "a");
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn after_wires_a_dependency_edge() {
        let mut g = JobGraph::new();
        let a = scalar_job(&mut g, "a");
        let b = scalar_job(&mut g, "b");
        g.after(b, a, EdgeStatus::Success);

        let (graph, _jobs) = g.into_parts();
        assert_eq!(graph.parent_count(b), 1);
        assert_eq!(graph.child_count(a), 1);
    }

    #[test]
    fn closure_includes_transitive_dependencies() {
        let mut g = JobGraph::new();
        let a = scalar_job(&mut g, "a");
        let b = scalar_job(&mut g, "b");
        let c = scalar_job(&mut g, "c");
        g.after(b, a, EdgeStatus::Success);
        g.after(c, b, EdgeStatus::Success);

        let mut closure = g.closure(&[c]);
        closure.sort();
        let mut expected = vec![a, b, c];
        expected.sort();
        assert_eq!(closure, expected);
    }

    #[test]
    fn workflow_id_is_unique_per_instance() {
        assert_ne!(WorkflowId::new(), WorkflowId::new());
    }
}
