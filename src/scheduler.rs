//! The scheduling core (§4.4): cycle check, optional pruning, and
//! at-most-once submission of every job reachable from the run's targets.
//!
//! The engine is backend-agnostic: [`Backend`] supplies `satisfy` (wait for
//! and classify a job's dependencies) and `exec` (actually run it). The
//! local backend ([`crate::local`]) and the Slurm backend
//! ([`crate::slurm`]) each implement it.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use rustc_hash::FxHashMap;
use tracing::Instrument;

use crate::config::DawgzConfig;
use crate::error::{SchedError, SchedResult};
use crate::graph::{Direction, Graph, NodeId};
use crate::job::{EdgeStatus, Job, WaitFor};
use crate::pruning;
use crate::workflow::WorkflowId;

/// A scheduler-facing dependency backend.
///
/// `satisfy` and `exec` are both given `&Scheduler<Self>` rather than owning
/// their state, so a backend can recurse into `scheduler.submit(parent)` to
/// pull in its dependencies — the same entry point `schedule` itself uses.
///
/// `'static` is required because `submit` drives each job from a detached
/// `tokio::spawn`ed task (see [`Scheduler::submit`]), which cannot borrow.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// What a successful run of a job produces: a value for the local
    /// backend, a Slurm job ID for the Slurm backend.
    type Outcome: Clone + Send + Sync + std::fmt::Debug + 'static;

    /// Resolve `node`'s dependency edges, submitting parents as needed.
    /// Returns once `node` is clear to execute, or an error classifying why
    /// it never will be.
    async fn satisfy(&self, scheduler: &Scheduler<Self>, node: NodeId) -> SchedResult<()>
    where
        Self: Sized;

    /// Run `node` itself, `satisfy` having already succeeded.
    async fn exec(&self, scheduler: &Scheduler<Self>, node: NodeId) -> SchedResult<Self::Outcome>
    where
        Self: Sized;
}

/// A node's in-flight or completed submission, shared by every caller
/// racing on the same job. Backed by a detached [`tokio::spawn`]ed task (see
/// [`Scheduler::submit`]) rather than [`tokio::sync::OnceCell`]'s
/// `get_or_init`, so no single awaiter dropping out from under it (e.g. a
/// `satisfy` early return) can orphan the job mid-execution and cause a
/// later caller to re-run its body.
type Submission<T> = Shared<BoxFuture<'static, Result<T, SchedError>>>;

struct Inner<T> {
    jobs: FxHashMap<NodeId, Job>,
    order: Vec<NodeId>,
    cells: FxHashMap<NodeId, Submission<T>>,
    traces: FxHashMap<NodeId, String>,
}

/// The running scheduler: a frozen graph and job set, a backend, and the
/// submission table that makes `submit` idempotent.
///
/// `graph` and the job set inside `inner` are not mutated once scheduling
/// starts except for two things: each job's `ordinal` (set exactly once, by
/// whichever `submit` call first observes it) and the submission table
/// itself. Both changes are made under `inner`'s lock and never held across
/// an `.await`, so the lock is never contended for long.
pub struct Scheduler<B: Backend> {
    graph: Graph<EdgeStatus>,
    backend: B,
    inner: Mutex<Inner<B::Outcome>>,
    /// Back-reference to the `Arc` this scheduler is wrapped in, so `submit`
    /// can hand a spawned task an owned, `'static` handle on `self` without
    /// changing `Backend`'s `&Scheduler<Self>` call signatures. Populated by
    /// [`schedule`] via `Arc::new_cyclic`.
    self_weak: Weak<Scheduler<B>>,
}

impl<B: Backend> Scheduler<B> {
    /// The backend this scheduler dispatches to.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The (possibly pruned) dependency graph.
    pub fn graph(&self) -> &Graph<EdgeStatus> {
        &self.graph
    }

    /// A clone of `node`'s current job record. Jobs are cheap to clone
    /// (bodies are reference-counted closures), so backends snapshot rather
    /// than hold a lock across an `.await`.
    pub fn job(&self, node: NodeId) -> Job {
        self.inner.lock().unwrap().jobs[&node].clone()
    }

    /// `node`'s parent edges and their required status, in declaration
    /// order.
    pub fn parent_edges(&self, node: NodeId) -> Vec<(NodeId, EdgeStatus)> {
        self.graph.parents(node).map(|(p, s)| (p, *s)).collect()
    }

    /// Whether `node` can still possibly run: false iff it has parents
    /// proven unsatisfiable by pruning (or would be, were pruning skipped)
    /// and either it waits on all of its parents, or it waits on any and
    /// none remain.
    pub fn satisfiable(&self, node: NodeId) -> bool {
        let inner = self.inner.lock().unwrap();
        let job = &inner.jobs[&node];
        if job.unsatisfied.is_empty() {
            return true;
        }
        match job.waitfor {
            WaitFor::All => false,
            WaitFor::Any => self.graph.parent_count(node) != 0,
        }
    }

    /// `node`'s tag (`NNNN_slug(name)`), once it has been submitted at
    /// least once. Panics if called before that — tagging happens at the
    /// start of `submit`, before any backend code runs.
    fn tag(&self, node: NodeId) -> String {
        self.inner.lock().unwrap().jobs[&node]
            .tag()
            .expect("tag() called before the job was first submitted")
    }

    /// Submit `node`, or return the cached outcome of an earlier call.
    /// Concurrent callers racing on the same node share a single execution:
    /// the first installs the submission and spawns the task that drives
    /// it; everyone else, including that first caller, just awaits a clone
    /// of the shared future. Because the task runs detached, a caller
    /// dropping its clone (e.g. `satisfy` returning early once a `waitfor`
    /// is already decided) never cancels the job underneath a sibling still
    /// awaiting it.
    pub async fn submit(&self, node: NodeId) -> Result<B::Outcome, SchedError> {
        tracing::debug!(?node, "submit: requested");

        let submission = {
            let mut inner = self.inner.lock().unwrap();
            match inner.cells.get(&node) {
                Some(submission) => submission.clone(),
                None => {
                    let ordinal = inner.order.len() as u32;
                    inner.order.push(node);
                    if let Some(job) = inner.jobs.get_mut(&node) {
                        job.ordinal = Some(ordinal);
                    }

                    let scheduler = self
                        .self_weak
                        .upgrade()
                        .expect("scheduler dropped while one of its own submissions was live");
                    let fut: BoxFuture<'static, Result<B::Outcome, SchedError>> =
                        Box::pin(async move { scheduler.run(node).await });
                    let submission = fut.shared();
                    tokio::spawn(submission.clone());

                    inner.cells.insert(node, submission.clone());
                    submission
                }
            }
        };

        let result = submission.await;

        if let Err(e) = &result {
            self.inner.lock().unwrap().traces.insert(node, e.trace());
        }

        result
    }

    async fn run(&self, node: NodeId) -> Result<B::Outcome, SchedError> {
        let tag = self.tag(node);

        if !self.satisfiable(node) {
            tracing::debug!(job = %tag, "run: dependency already proven unsatisfiable");
            return Err(SchedError::DependencyNeverSatisfied {
                job: tag,
                cause: None,
            });
        }

        tracing::debug!(job = %tag, "satisfy: start");
        if let Err(e) = self.backend.satisfy(self, node).await {
            tracing::error!(job = %tag, error = %e.trace(), "satisfy: failed");
            return Err(e);
        }
        tracing::debug!(job = %tag, "satisfy: done");

        tracing::debug!(job = %tag, "exec: start");
        let outcome = self.backend.exec(self, node).await;
        match &outcome {
            Ok(_) => tracing::debug!(job = %tag, "exec: done"),
            Err(e) => tracing::error!(job = %tag, error = %e.trace(), "exec: failed"),
        }
        outcome
    }

    /// The outcome stored for `node`, if it has been submitted and that
    /// submission has completed.
    pub fn result(&self, node: NodeId) -> Option<Result<B::Outcome, SchedError>> {
        self.inner
            .lock()
            .unwrap()
            .cells
            .get(&node)
            .and_then(|c| c.peek().cloned())
    }

    /// The recorded cause chain for `node`'s failure, if any.
    pub fn trace(&self, node: NodeId) -> Option<String> {
        self.inner.lock().unwrap().traces.get(&node).cloned()
    }

    /// Nodes in submission order (the order table, C4's insertion-order
    /// ordinal source).
    pub fn order(&self) -> Vec<NodeId> {
        self.inner.lock().unwrap().order.clone()
    }

    /// One row per submitted job, in submission order, for the workflow
    /// record writer (C7) and for `quiet`-gated trace printing.
    pub fn reports(&self) -> Vec<JobReport> {
        self.order()
            .into_iter()
            .map(|node| {
                let job = self.job(node);
                let result = self.result(node);
                let succeeded = matches!(result, Some(Ok(_)));
                let trace = match result {
                    Some(Err(e)) => Some(e.trace()),
                    _ => None,
                };
                JobReport {
                    tag: job.tag().unwrap_or_default(),
                    name: job.display_name(),
                    succeeded,
                    trace,
                }
            })
            .collect()
    }
}

/// A single job's outcome, shaped for the workflow record and console
/// reporting — backend-agnostic, unlike [`Backend::Outcome`].
#[derive(Debug, Clone)]
pub struct JobReport {
    pub tag: String,
    pub name: String,
    pub succeeded: bool,
    pub trace: Option<String>,
}

/// Run a workflow: check for cycles, optionally prune, then submit every
/// job reachable from `targets`.
///
/// `graph` and `jobs` together describe the full job set under
/// consideration (typically [`crate::workflow::JobGraph::into_parts`]);
/// `targets` are the nodes the caller actually asked for — their transitive
/// dependencies are pulled in automatically by `satisfy`. `workflow_id`
/// names the run for the duration of the `tracing::info_span!` wrapping it;
/// callers pass the same id they use to name the on-disk workflow record.
pub async fn schedule<B: Backend>(
    graph: Graph<EdgeStatus>,
    mut jobs: FxHashMap<NodeId, Job>,
    targets: &[NodeId],
    config: &DawgzConfig,
    backend: B,
    workflow_id: WorkflowId,
) -> SchedResult<Arc<Scheduler<B>>> {
    async move {
        let cycles = graph.cycles(jobs.keys().copied(), Direction::Parents);
        if let Some(cycle) = cycles.into_iter().next() {
            let path = cycle
                .iter()
                .map(|n| jobs[n].display_name())
                .collect::<Vec<_>>()
                .join(" <- ");
            return Err(SchedError::CyclicDependencyGraph(path));
        }

        let mut graph = graph;
        let seeds = if config.prune {
            pruning::prune(&mut graph, &mut jobs, targets)
        } else {
            targets.to_vec()
        };

        let reachable = graph.dfs(seeds.iter().copied(), Direction::Parents);

        let scheduler = Arc::new_cyclic(|weak| Scheduler {
            graph,
            backend,
            inner: Mutex::new(Inner {
                jobs,
                order: Vec::new(),
                cells: FxHashMap::default(),
                traces: FxHashMap::default(),
            }),
            self_weak: weak.clone(),
        });

        futures::future::join_all(reachable.iter().map(|n| scheduler.submit(*n))).await;

        if !config.quiet {
            for report in scheduler.reports() {
                if let Some(trace) = &report.trace {
                    tracing::warn!(job = %report.tag, %trace, "job failed");
                }
            }
        }

        Ok(scheduler)
    }
    .instrument(tracing::info_span!("schedule", workflow = %workflow_id))
    .await
}
