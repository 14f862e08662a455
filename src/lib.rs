//! dawgz: a workflow engine for directed acyclic job graphs.
//!
//! Callers build a [`workflow::JobGraph`] out of [`job::Job`]s wired together
//! with [`job::Job::after`]-style dependency edges, then hand a set of
//! target jobs to [`schedule_local`] or [`schedule_slurm`]. The engine
//! computes the transitive closure of the targets, checks it for cycles,
//! optionally [`prune`](pruning::prune)s already-satisfied work, and
//! dispatches every remaining job through the chosen backend while honoring
//! each job's dependency edges and wait policy.
//!
//! Declaring jobs (decorators, builders) and inspecting past runs from the
//! command line are both out of this crate's scope — it receives
//! already-constructed [`job::Job`] objects and leaves a
//! [`persistence::WorkflowRecord`] behind for whatever consumes it next.

pub mod config;
pub mod error;
pub mod graph;
pub mod job;
pub mod local;
pub mod persistence;
pub mod pruning;
pub mod scheduler;
pub mod slurm;
pub mod workflow;

pub use config::DawgzConfig;
pub use error::{SchedError, SchedResult};
pub use job::{EdgeStatus, Job, JobArray, WaitFor};
pub use scheduler::{JobReport, Scheduler};
pub use workflow::{JobGraph, WorkflowId};

use std::sync::Arc;

use rustc_hash::FxHashMap;

use graph::{Graph, NodeId};

/// Run `targets` (and their transitive dependencies) on the local worker
/// pool, then write a workflow record under `config.dawgz_dir`.
///
/// Mirrors the programmatic surface's `schedule(jobs, backend="local",
/// prune=..., quiet=...)`: `graph`/`jobs` are typically obtained from
/// [`workflow::JobGraph::into_parts`], `targets` the subset of nodes the
/// caller actually asked for.
pub async fn schedule_local(
    graph: Graph<EdgeStatus>,
    jobs: FxHashMap<NodeId, Job>,
    targets: &[NodeId],
    config: &DawgzConfig,
) -> SchedResult<(Arc<Scheduler<local::LocalBackend>>, WorkflowId)> {
    let record = persistence::WorkflowRecord::create(&config.dawgz_dir, WorkflowId::new()).await?;
    let backend = local::LocalBackend::new(config, record.dir.clone());
    let scheduler = scheduler::schedule(graph, jobs, targets, config, backend, record.id).await?;
    persistence::record_workflow(&record, "workflow", "local", &scheduler).await?;
    Ok((scheduler, record.id))
}

/// Run `targets` (and their transitive dependencies) by submitting each to
/// Slurm via `sbatch`, chained together with `--dependency=`, then write a
/// workflow record under `config.dawgz_dir`.
///
/// `scheduler_env` are environment prelude lines emitted at the top of
/// every generated script, before any per-job `env` lines (Design Notes §9).
pub async fn schedule_slurm(
    graph: Graph<EdgeStatus>,
    jobs: FxHashMap<NodeId, Job>,
    targets: &[NodeId],
    config: &DawgzConfig,
    scheduler_env: Vec<String>,
) -> SchedResult<(Arc<Scheduler<slurm::SlurmAdapter>>, WorkflowId)> {
    let record = persistence::WorkflowRecord::create(&config.dawgz_dir, WorkflowId::new()).await?;
    let backend = slurm::SlurmAdapter::new(config.clone(), record.dir.clone(), scheduler_env);
    let scheduler = scheduler::schedule(graph, jobs, targets, config, backend, record.id).await?;
    persistence::record_workflow(&record, "workflow", "slurm", &scheduler).await?;
    Ok((scheduler, record.id))
}
