//! Local asynchronous backend (C5): runs each job body on a worker pool,
//! classifying dependency outcomes against each parent's edge status before
//! dispatch.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::process::Command;

use crate::config::{DawgzConfig, WorkerKind};
use crate::error::{SchedError, SchedResult};
use crate::graph::NodeId;
use crate::job::{EdgeStatus, Job, JobError, JobValue, WaitFor};
use crate::scheduler::{Backend, Scheduler};

/// Runs job bodies either on the tokio blocking-thread pool (sharing this
/// process) or by re-invoking the current binary per job (OS-process
/// isolation), per [`WorkerKind`].
pub struct LocalBackend {
    worker_kind: WorkerKind,
    /// Where a process-mode worker's stdout/stderr is persisted, so
    /// process-isolated jobs get the same per-job log file the Slurm
    /// backend produces. Threads-mode jobs run in-process and have no
    /// external output to capture.
    log_dir: PathBuf,
    process_timeout: Duration,
}

impl LocalBackend {
    /// Build a local backend from `config`'s worker model, writing
    /// process-mode logs under `log_dir` (typically a
    /// [`crate::persistence::WorkflowRecord`]'s directory).
    pub fn new(config: &DawgzConfig, log_dir: PathBuf) -> Self {
        Self {
            worker_kind: config.worker_kind.clone(),
            log_dir,
            process_timeout: Duration::from_secs(3600),
        }
    }

    /// Override the subprocess timeout for process-mode workers (default
    /// one hour).
    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }

    async fn run_job(&self, job: &Job, index: Option<u32>) -> Result<JobValue, JobError> {
        match self.worker_kind {
            WorkerKind::Threads => {
                let job = job.clone();
                tokio::task::spawn_blocking(move || match index {
                    Some(i) => job.run_at(i),
                    None => job.run_scalar(),
                })
                .await
                .unwrap_or_else(|e| Err(JobError::new(format!("worker thread panicked: {e}"))))
            }
            WorkerKind::Process => self.run_in_process(job, index).await,
        }
    }

    /// Re-invoke the current binary with `--dawgz-entry-point <name>`
    /// (plus `--dawgz-array-index <i>` for an array element), grounded in
    /// the teacher's `PbsAdapter::run_qsub` subprocess-invocation pattern:
    /// `Command` + `Stdio::piped()` + a wrapping timeout.
    async fn run_in_process(&self, job: &Job, index: Option<u32>) -> Result<JobValue, JobError> {
        let Some(entry_point) = &job.entry_point else {
            return Err(JobError::new(
                "process-mode execution requires a job registered via with_entry_point",
            ));
        };

        let exe = std::env::current_exe().map_err(JobError::new)?;
        let mut cmd = Command::new(exe);
        cmd.arg("--dawgz-entry-point").arg(entry_point);
        if let Some(i) = index {
            cmd.arg("--dawgz-array-index").arg(i.to_string());
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = tokio::time::timeout(self.process_timeout, cmd.output())
            .await
            .map_err(|_| JobError::new("worker process timed out"))?
            .map_err(JobError::new)?;

        let tag = job.tag().unwrap_or_else(|| job.name.clone());
        let log_path = self.log_dir.join(match index {
            Some(i) => format!("{tag}_{i}.log"),
            None => format!("{tag}.log"),
        });
        let mut log = Vec::new();
        log.extend_from_slice(&output.stdout);
        log.extend_from_slice(&output.stderr);
        let _ = tokio::fs::write(&log_path, &log).await;

        if !output.status.success() {
            return Err(JobError::new(String::from_utf8_lossy(&output.stderr).into_owned()));
        }

        if output.stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout).map_err(JobError::new)
    }
}

/// The classification [`LocalBackend::satisfy`] assigns to one parent edge.
enum DepOutcome {
    /// The edge's required status holds (or its violation is acceptable
    /// under `waitfor`); the parent no longer blocks this job.
    Satisfied,
    /// The edge's required status does not hold.
    Violated(SchedError),
}

fn classify(tag: &str, status: EdgeStatus, result: &Result<JobValue, SchedError>) -> DepOutcome {
    match (status, result) {
        (EdgeStatus::Failure, Ok(_)) => DepOutcome::Violated(SchedError::JobNotFailed { job: tag.to_string() }),
        (EdgeStatus::Success | EdgeStatus::Any, Ok(_)) => DepOutcome::Satisfied,
        (EdgeStatus::Failure | EdgeStatus::Any, Err(_)) => DepOutcome::Satisfied,
        (EdgeStatus::Success, Err(e)) => DepOutcome::Violated(e.clone()),
    }
}

#[async_trait]
impl Backend for LocalBackend {
    type Outcome = JobValue;

    async fn satisfy(&self, scheduler: &Scheduler<Self>, node: NodeId) -> SchedResult<()> {
        let edges = scheduler.parent_edges(node);
        if edges.is_empty() {
            // A job with no parents is trivially satisfied regardless of
            // waitfor (§4.5: "a job with no parents and waitfor=any is
            // treated as trivially satisfied" — the same holds for all,
            // vacuously).
            return Ok(());
        }

        let job = scheduler.job(node);
        let tag = job.tag().unwrap_or_else(|| job.name.clone());
        let waitfor = job.waitfor;
        tracing::debug!(job = %tag, parents = edges.len(), ?waitfor, "satisfy: awaiting parent edges");

        let mut subtasks: FuturesUnordered<_> = edges
            .into_iter()
            .map(|(parent, status)| async move {
                let result = scheduler.submit(parent).await;
                let parent_tag = scheduler.job(parent).tag().unwrap_or_default();
                classify(&parent_tag, status, &result)
            })
            .collect();

        let mut last_violation: Option<SchedError> = None;
        while let Some(outcome) = subtasks.next().await {
            match outcome {
                DepOutcome::Satisfied if waitfor == WaitFor::Any => {
                    tracing::debug!(job = %tag, "satisfy: waitfor=any satisfied");
                    return Ok(());
                }
                DepOutcome::Satisfied => {}
                DepOutcome::Violated(e) if waitfor == WaitFor::All => {
                    tracing::warn!(job = %tag, cause = %e.trace(), "satisfy: dependency violated under waitfor=all");
                    return Err(SchedError::DependencyNeverSatisfied {
                        job: tag,
                        cause: Some(Arc::new(e)),
                    });
                }
                DepOutcome::Violated(e) => last_violation = Some(e),
            }
        }

        match waitfor {
            WaitFor::All => Ok(()),
            WaitFor::Any => {
                tracing::warn!(job = %tag, "satisfy: waitfor=any exhausted with no satisfied parent");
                Err(SchedError::DependencyNeverSatisfied {
                    job: tag,
                    cause: last_violation.map(Arc::new),
                })
            }
        }
    }

    async fn exec(&self, scheduler: &Scheduler<Self>, node: NodeId) -> SchedResult<JobValue> {
        let job = scheduler.job(node);
        let tag = job.tag().unwrap_or_else(|| job.name.clone());
        tracing::debug!(job = %tag, array = job.array.is_some(), "exec: dispatching to worker pool");

        match &job.array {
            None => self
                .run_job(&job, None)
                .await
                .map_err(|e| SchedError::JobFailed {
                    job: tag,
                    message: e.0,
                    cause: None,
                }),
            Some(array) => {
                let indices: Vec<u32> = array.indices().collect();
                let outcomes = futures::future::join_all(indices.iter().map(|&i| self.run_job(&job, Some(i)))).await;

                let mut values = serde_json::Map::new();
                let mut first_err: Option<JobError> = None;
                for (i, outcome) in indices.into_iter().zip(outcomes) {
                    match outcome {
                        Ok(v) => {
                            values.insert(i.to_string(), v);
                        }
                        Err(e) => {
                            first_err.get_or_insert(e);
                        }
                    }
                }

                if let Some(e) = first_err {
                    return Err(SchedError::JobFailed {
                        job: tag,
                        message: e.0,
                        cause: None,
                    });
                }
                Ok(Value::Object(values))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DawgzConfig;
    use crate::graph::Graph;
    use crate::job::JobArray;
    use crate::scheduler::schedule;
    use crate::workflow::WorkflowId;
    use rustc_hash::FxHashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scalar(g: &mut Graph<EdgeStatus>, name: &str, body: impl Fn() -> Result<JobValue, JobError> + Send + Sync + 'static) -> (NodeId, Job) {
        let n = g.add_node();
        (n, Job::scalar(n, name, Arc::new(body)))
    }

    #[tokio::test]
    async fn linear_chain_runs_all_three_jobs_in_order() {
        let mut graph: Graph<EdgeStatus> = Graph::new();
        let (an, a) = scalar(&mut graph, "a", || Ok(Value::from(1)));
        let (bn, b) = scalar(&mut graph, "b", || Ok(Value::from(2)));
        let (cn, c) = scalar(&mut graph, "c", || Ok(Value::from(3)));
        graph.add_child(an, bn, EdgeStatus::Success);
        graph.add_child(bn, cn, EdgeStatus::Success);

        let mut jobs = FxHashMap::default();
        jobs.insert(an, a);
        jobs.insert(bn, b);
        jobs.insert(cn, c);

        let tmp = tempfile::tempdir().unwrap();
        let config = DawgzConfig::from_env().with_dawgz_dir(tmp.path());
        let backend = LocalBackend::new(&config, tmp.path().to_path_buf());
        let scheduler = schedule(graph, jobs, &[cn], &config, backend, WorkflowId::new()).await.unwrap();

        assert_eq!(scheduler.result(an), Some(Ok(Value::from(1))));
        assert_eq!(scheduler.result(bn), Some(Ok(Value::from(2))));
        assert_eq!(scheduler.result(cn), Some(Ok(Value::from(3))));
        assert!(scheduler.order().len() == 3);
    }

    #[tokio::test]
    async fn failure_propagates_as_dependency_never_satisfied() {
        let mut graph: Graph<EdgeStatus> = Graph::new();
        let (an, a) = scalar(&mut graph, "a", || Err(JobError::new("boom")));
        let (cn, c) = scalar(&mut graph, "c", || Ok(Value::Null));
        graph.add_child(an, cn, EdgeStatus::Success);

        let mut jobs = FxHashMap::default();
        jobs.insert(an, a);
        jobs.insert(cn, c);

        let tmp = tempfile::tempdir().unwrap();
        let config = DawgzConfig::from_env().with_dawgz_dir(tmp.path());
        let backend = LocalBackend::new(&config, tmp.path().to_path_buf());
        let scheduler = schedule(graph, jobs, &[cn], &config, backend, WorkflowId::new()).await.unwrap();

        assert!(matches!(scheduler.result(an), Some(Err(SchedError::JobFailed { .. }))));
        assert!(matches!(
            scheduler.result(cn),
            Some(Err(SchedError::DependencyNeverSatisfied { .. }))
        ));
    }

    #[tokio::test]
    async fn any_waitfor_succeeds_on_first_successful_parent() {
        let mut graph: Graph<EdgeStatus> = Graph::new();
        let (an, a) = scalar(&mut graph, "a", || Err(JobError::new("boom")));
        let (dn, d) = scalar(&mut graph, "d", || Ok(Value::from(42)));
        let en = graph.add_node();
        let mut e = Job::scalar(en, "e", Arc::new(|| Ok(Value::from("e"))));
        e.set_waitfor(WaitFor::Any);
        graph.add_child(an, en, EdgeStatus::Success);
        graph.add_child(dn, en, EdgeStatus::Success);

        let mut jobs = FxHashMap::default();
        jobs.insert(an, a);
        jobs.insert(dn, d);
        jobs.insert(en, e);

        let tmp = tempfile::tempdir().unwrap();
        let config = DawgzConfig::from_env().with_dawgz_dir(tmp.path());
        let backend = LocalBackend::new(&config, tmp.path().to_path_buf());
        let scheduler = schedule(graph, jobs, &[en], &config, backend, WorkflowId::new()).await.unwrap();

        assert_eq!(scheduler.result(en), Some(Ok(Value::from("e"))));
    }

    #[tokio::test]
    async fn any_waitfor_fails_when_every_parent_violates_its_edge() {
        let mut graph: Graph<EdgeStatus> = Graph::new();
        let (an, a) = scalar(&mut graph, "a", || Err(JobError::new("boom")));
        let en = graph.add_node();
        let mut e = Job::scalar(en, "e", Arc::new(|| Ok(Value::Null)));
        e.set_waitfor(WaitFor::Any);
        // e waits on a with status=success, but a fails: its only parent
        // violates the edge, so e is never satisfied.
        graph.add_child(an, en, EdgeStatus::Success);

        let mut jobs = FxHashMap::default();
        jobs.insert(an, a);
        jobs.insert(en, e);

        let tmp = tempfile::tempdir().unwrap();
        let config = DawgzConfig::from_env().with_dawgz_dir(tmp.path());
        let backend = LocalBackend::new(&config, tmp.path().to_path_buf());
        let scheduler = schedule(graph, jobs, &[en], &config, backend, WorkflowId::new()).await.unwrap();

        assert!(matches!(
            scheduler.result(en),
            Some(Err(SchedError::DependencyNeverSatisfied { .. }))
        ));
    }

    #[tokio::test]
    async fn array_job_runs_every_index_and_collects_results() {
        let calls = Arc::new(AtomicU32::new(0));
        let n_calls = calls.clone();

        let mut graph: Graph<EdgeStatus> = Graph::new();
        let node = graph.add_node();
        let job = Job::array(
            node,
            "gen",
            JobArray::range(4),
            Arc::new(move |i| {
                n_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::from(i * 10))
            }),
        );

        let mut jobs = FxHashMap::default();
        jobs.insert(node, job);

        let tmp = tempfile::tempdir().unwrap();
        let config = DawgzConfig::from_env().with_dawgz_dir(tmp.path());
        let backend = LocalBackend::new(&config, tmp.path().to_path_buf());
        let scheduler = schedule(graph, jobs, &[node], &config, backend, WorkflowId::new()).await.unwrap();

        let result = scheduler.result(node).unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(result["2"], Value::from(20));
    }

    #[tokio::test]
    async fn diamond_shared_dependency_runs_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let n = calls.clone();
        let mut graph: Graph<EdgeStatus> = Graph::new();
        let (an, a) = scalar(&mut graph, "a", move || {
            n.fetch_add(1, Ordering::SeqCst);
            Ok(Value::from(1))
        });
        let (bn, b) = scalar(&mut graph, "b", || Ok(Value::from(2)));
        let (cn, c) = scalar(&mut graph, "c", || Ok(Value::from(3)));
        let (dn, d) = scalar(&mut graph, "d", || Ok(Value::from(4)));
        graph.add_child(an, bn, EdgeStatus::Success);
        graph.add_child(an, cn, EdgeStatus::Success);
        graph.add_child(bn, dn, EdgeStatus::Success);
        graph.add_child(cn, dn, EdgeStatus::Success);

        let mut jobs = FxHashMap::default();
        jobs.insert(an, a);
        jobs.insert(bn, b);
        jobs.insert(cn, c);
        jobs.insert(dn, d);

        let tmp = tempfile::tempdir().unwrap();
        let config = DawgzConfig::from_env().with_dawgz_dir(tmp.path());
        let backend = LocalBackend::new(&config, tmp.path().to_path_buf());
        let scheduler = schedule(graph, jobs, &[dn], &config, backend, WorkflowId::new()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.result(dn), Some(Ok(Value::from(4))));
    }

    #[tokio::test]
    async fn slow_parent_still_runs_once_when_a_sibling_fails_fast_under_waitfor_all() {
        // `e` waits on both `fast_fail` (fails immediately) and `slow`
        // (blocks on its worker thread for a while). `satisfy`'s
        // `FuturesUnordered` will almost always see `fast_fail`'s outcome
        // first and return early, dropping its handle on `slow`'s
        // submission — that must not cancel `slow`'s execution underneath
        // the `join_all` in `schedule` that's also awaiting it.
        let calls = Arc::new(AtomicU32::new(0));
        let n = calls.clone();

        let mut graph: Graph<EdgeStatus> = Graph::new();
        let (fast_fail, ff) = scalar(&mut graph, "fast_fail", || Err(JobError::new("boom")));
        let (slow, s) = scalar(&mut graph, "slow", move || {
            std::thread::sleep(Duration::from_millis(50));
            n.fetch_add(1, Ordering::SeqCst);
            Ok(Value::from(1))
        });
        let en = graph.add_node();
        let e = Job::scalar(en, "e", Arc::new(|| Ok(Value::Null)));
        graph.add_child(fast_fail, en, EdgeStatus::Success);
        graph.add_child(slow, en, EdgeStatus::Success);

        let mut jobs = FxHashMap::default();
        jobs.insert(fast_fail, ff);
        jobs.insert(slow, s);
        jobs.insert(en, e);

        let tmp = tempfile::tempdir().unwrap();
        let config = DawgzConfig::from_env().with_dawgz_dir(tmp.path());
        let backend = LocalBackend::new(&config, tmp.path().to_path_buf());
        let scheduler = schedule(graph, jobs, &[en], &config, backend, WorkflowId::new())
            .await
            .unwrap();

        assert!(scheduler.result(en).unwrap().is_err());
        // `slow`'s submission is driven by a detached task; give it time to
        // finish even though `satisfy` stopped awaiting it early.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
