//! Slurm backend (C6): submits each job via `sbatch`, chaining dependencies
//! with `--dependency=`, and leaves execution to the external scheduler.
//!
//! Subprocess invocation is grounded in the teacher's
//! `pbs::adapter::PbsAdapter::run_qsub`/`run_qstat`: `tokio::process::Command`
//! with piped stdio, wrapped in `tokio::time::timeout`. The mock-mode /
//! `AtomicU64`-counter test harness mirrors `PbsAdapter::mock` directly.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{DawgzConfig, SlurmConfig};
use crate::error::{SchedError, SchedResult};
use crate::graph::NodeId;
use crate::job::{EdgeStatus, Job};
use crate::persistence::read_log;
use crate::scheduler::{Backend, Scheduler};
use crate::slurm::parser;
use crate::slurm::parser::SlurmState;

/// A Slurm job ID, as returned by `sbatch --parsable`. This is the Slurm
/// backend's [`Backend::Outcome`] — dependents read it to build their own
/// `--dependency=` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlurmJobId(pub String);

impl std::fmt::Display for SlurmJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Translates the job graph into `sbatch` submissions. Holds the workflow
/// record directory (where generated scripts and logs land), the
/// scheduler-level `env` prelude (§9's recorded decision: scheduler lines
/// emitted before each job's own), and Slurm's command paths.
pub struct SlurmAdapter {
    config: DawgzConfig,
    record_dir: PathBuf,
    scheduler_env: Vec<String>,
    mock_mode: bool,
    mock_counter: AtomicU64,
    mock_state: AsyncMutex<FxHashMap<String, SlurmState>>,
}

impl SlurmAdapter {
    /// Build a Slurm adapter writing scripts/logs under `record_dir`
    /// (typically a [`WorkflowRecord`]'s directory).
    pub fn new(config: DawgzConfig, record_dir: PathBuf, scheduler_env: Vec<String>) -> Self {
        Self {
            config,
            record_dir,
            scheduler_env,
            mock_mode: false,
            mock_counter: AtomicU64::new(1000),
            mock_state: AsyncMutex::new(FxHashMap::default()),
        }
    }

    /// Build a Slurm adapter that never shells out: `sbatch` calls return
    /// synthetic, monotonically increasing job IDs and `sacct`/`scancel`
    /// calls consult an in-memory state table instead of the real commands.
    /// Mirrors the teacher's `PbsAdapter::mock`.
    pub fn mock(config: DawgzConfig, record_dir: PathBuf, scheduler_env: Vec<String>) -> Self {
        Self {
            config,
            record_dir,
            scheduler_env,
            mock_mode: true,
            mock_counter: AtomicU64::new(1000),
            mock_state: AsyncMutex::new(FxHashMap::default()),
        }
    }

    fn slurm_config(&self) -> &SlurmConfig {
        &self.config.slurm
    }

    fn dawgz_binary(&self) -> SchedResult<PathBuf> {
        match &self.slurm_config().dawgz_binary {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(|e| SchedError::ConfigError(e.to_string())),
        }
    }

    /// Render and write `<tag>.sh`, returning its path.
    async fn write_script(&self, job: &Job, tag: &str, dependency: Option<&str>) -> SchedResult<PathBuf> {
        let script = super::templates::render_script(
            job,
            tag,
            &self.config.shell,
            &self.record_dir,
            &self.dawgz_binary()?,
            dependency,
            &self.scheduler_env,
        )?;
        let path = self.record_dir.join(format!("{tag}.sh"));
        fs::write(&path, script).await?;
        Ok(path)
    }

    /// Write `<tag>.pkl`: the entry point and settings snapshot a post-hoc
    /// inspector can read back without re-deriving the script.
    async fn write_pickle(&self, job: &Job, tag: &str) -> SchedResult<()> {
        let snapshot = serde_json::json!({
            "entry_point": job.entry_point,
            "settings": job.settings,
        });
        let path = self.record_dir.join(format!("{tag}.pkl"));
        fs::write(&path, serde_json::to_vec_pretty(&snapshot)?).await?;
        Ok(())
    }

    async fn run_sbatch(&self, script_path: &std::path::Path) -> SchedResult<SlurmJobId> {
        if self.mock_mode {
            let id = self.mock_counter.fetch_add(1, Ordering::SeqCst).to_string();
            self.mock_state.lock().await.insert(id.clone(), SlurmState::Completed);
            return Ok(SlurmJobId(id));
        }

        let output = tokio::time::timeout(
            Duration::from_secs(60),
            Command::new(&self.slurm_config().sbatch)
                .arg("--parsable")
                .arg(script_path)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| SchedError::BackendCommandError {
            command: "sbatch".to_string(),
            message: "timed out after 60s".to_string(),
        })?
        .map_err(|e| SchedError::BackendCommandError {
            command: "sbatch".to_string(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(SchedError::JobSubmission {
                job: script_path.display().to_string(),
                message: stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parser::parse_sbatch_output(&stdout).map(SlurmJobId)
    }

    async fn run_sacct(&self, job_id: &str) -> SchedResult<Vec<(String, SlurmState)>> {
        if self.mock_mode {
            let state = self.mock_state.lock().await;
            return Ok(state
                .iter()
                .filter(|(id, _)| id.as_str() == job_id || id.starts_with(&format!("{job_id}_")))
                .map(|(id, s)| (id.clone(), s.clone()))
                .collect());
        }

        let output = tokio::time::timeout(
            Duration::from_secs(30),
            Command::new(&self.slurm_config().sacct)
                .args(["-j", job_id, "-o", "JobID,State", "-n", "-P", "-X"])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| SchedError::BackendCommandError {
            command: "sacct".to_string(),
            message: "timed out after 30s".to_string(),
        })?
        .map_err(|e| SchedError::BackendCommandError {
            command: "sacct".to_string(),
            message: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parser::parse_sacct_output(&stdout))
    }

    /// Query `job_id`'s state (optionally for one array element), per §4.6.
    pub async fn state(&self, job_id: &str, index: Option<u32>) -> SchedResult<SlurmState> {
        let rows = self.run_sacct(job_id).await?;
        Ok(parser::resolve_state(&rows, job_id, index))
    }

    /// Cancel `job_id` via `scancel -v`.
    pub async fn cancel(&self, job_id: &str) -> SchedResult<()> {
        if self.mock_mode {
            self.mock_state.lock().await.insert(job_id.to_string(), SlurmState::Cancelled);
            return Ok(());
        }

        let output = tokio::time::timeout(
            Duration::from_secs(30),
            Command::new(&self.slurm_config().scancel)
                .args(["-v", job_id])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| SchedError::BackendCommandError {
            command: "scancel".to_string(),
            message: "timed out after 30s".to_string(),
        })?
        .map_err(|e| SchedError::BackendCommandError {
            command: "scancel".to_string(),
            message: e.to_string(),
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        parser::parse_scancel_output(&stderr)
    }

    /// Read a job's log file, collapsing `\r` runs (§6).
    pub async fn output(&self, tag: &str, index: Option<u32>) -> SchedResult<String> {
        let name = match index {
            Some(i) => format!("{tag}_{i}.log"),
            None => format!("{tag}.log"),
        };
        read_log(&self.record_dir.join(name)).await
    }
}

#[async_trait]
impl Backend for SlurmAdapter {
    type Outcome = SlurmJobId;

    /// Await submission of every parent. The backend does not distinguish
    /// `waitfor=any` at this layer — that's expressed to Slurm itself via
    /// the `--dependency` separator (§4.6).
    async fn satisfy(&self, scheduler: &Scheduler<Self>, node: NodeId) -> SchedResult<()> {
        let edges = scheduler.parent_edges(node);
        let tag = scheduler.job(node).tag().unwrap_or_default();
        tracing::debug!(job = %tag, parents = edges.len(), "satisfy: awaiting parent submissions");
        for (parent, _status) in edges {
            if let Err(e) = scheduler.submit(parent).await {
                tracing::warn!(job = %tag, cause = %e.trace(), "satisfy: a parent submission failed");
                return Err(SchedError::DependencyNeverSatisfied {
                    job: tag,
                    cause: Some(Arc::new(e)),
                });
            }
        }
        Ok(())
    }

    async fn exec(&self, scheduler: &Scheduler<Self>, node: NodeId) -> SchedResult<SlurmJobId> {
        let job = scheduler.job(node);
        let tag = job.tag().unwrap_or_else(|| job.name.clone());
        tracing::debug!(job = %tag, "exec: rendering script and submitting via sbatch");

        let edges = scheduler.parent_edges(node);
        let mut parent_ids = Vec::with_capacity(edges.len());
        for (parent, status) in edges {
            let id = scheduler.result(parent).and_then(Result::ok).ok_or_else(|| SchedError::Internal(
                format!("parent of {tag} resolved without a recorded Slurm job id"),
            ))?;
            parent_ids.push((id.0, status));
        }
        let dependency = super::templates::render_dependency(&parent_ids, job.waitfor);

        let script_path = self
            .write_script(&job, &tag, dependency.as_deref())
            .await
            .map_err(|e| SchedError::JobSubmission {
                job: tag.clone(),
                message: e.to_string(),
            })?;
        self.write_pickle(&job, &tag).await.map_err(|e| SchedError::JobSubmission {
            job: tag.clone(),
            message: e.to_string(),
        })?;

        match self.run_sbatch(&script_path).await {
            Ok(id) => {
                tracing::debug!(job = %tag, job_id = %id, "exec: sbatch accepted submission");
                Ok(id)
            }
            Err(e) => {
                tracing::error!(job = %tag, error = %e, "exec: sbatch submission failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DawgzConfig;
    use crate::graph::Graph;
    use crate::job::JobValue;
    use crate::scheduler::schedule;

    fn scalar_entry(g: &mut Graph<EdgeStatus>, name: &str) -> (NodeId, Job) {
        let n = g.add_node();
        let job =
            Job::scalar(n, name, Arc::new(|| Ok(JobValue::Null))).with_entry_point(format!("adapter_test::{name}"));
        (n, job)
    }

    #[tokio::test]
    async fn mock_submission_yields_increasing_job_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DawgzConfig::from_env().with_dawgz_dir(tmp.path());
        let adapter = SlurmAdapter::mock(config, tmp.path().to_path_buf(), Vec::new());

        let mut g: Graph<EdgeStatus> = Graph::new();
        let (an, a) = scalar_entry(&mut g, "a");
        let mut jobs = rustc_hash::FxHashMap::default();
        jobs.insert(an, a);

        let scheduler = schedule(
            g,
            jobs,
            &[an],
            &DawgzConfig::from_env().with_dawgz_dir(tmp.path()),
            adapter,
            crate::workflow::WorkflowId::new(),
        )
        .await
        .unwrap();
        let id = scheduler.result(an).unwrap().unwrap();
        assert_eq!(id.0, "1000");
    }

    #[tokio::test]
    async fn chained_jobs_produce_a_dependency_line_in_the_second_script() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DawgzConfig::from_env().with_dawgz_dir(tmp.path());
        let adapter = SlurmAdapter::mock(config.clone(), tmp.path().to_path_buf(), Vec::new());

        let mut g: Graph<EdgeStatus> = Graph::new();
        let (an, a) = scalar_entry(&mut g, "a");
        let (bn, b) = scalar_entry(&mut g, "b");
        g.add_child(an, bn, EdgeStatus::Success);
        let mut jobs = rustc_hash::FxHashMap::default();
        jobs.insert(an, a);
        jobs.insert(bn, b);

        let scheduler = schedule(g, jobs, &[bn], &config, adapter, crate::workflow::WorkflowId::new())
            .await
            .unwrap();
        assert!(scheduler.result(an).unwrap().is_ok());
        assert!(scheduler.result(bn).unwrap().is_ok());

        let tag_b = scheduler.job(bn).tag().unwrap();
        let script = tokio::fs::read_to_string(tmp.path().join(format!("{tag_b}.sh"))).await.unwrap();
        assert!(script.contains("--dependency=afterok:1000"));
    }

    #[tokio::test]
    async fn mock_cancel_and_state_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DawgzConfig::from_env().with_dawgz_dir(tmp.path());
        let adapter = SlurmAdapter::mock(config, tmp.path().to_path_buf(), Vec::new());

        let mut g: Graph<EdgeStatus> = Graph::new();
        let (an, a) = scalar_entry(&mut g, "a");
        let mut jobs = rustc_hash::FxHashMap::default();
        jobs.insert(an, a);

        let scheduler = schedule(
            g,
            jobs,
            &[an],
            &DawgzConfig::from_env().with_dawgz_dir(tmp.path()),
            adapter,
            crate::workflow::WorkflowId::new(),
        )
        .await
        .unwrap();
        let id = scheduler.result(an).unwrap().unwrap();

        let state = scheduler.backend().state(&id.0, None).await.unwrap();
        assert_eq!(state, SlurmState::Completed);

        scheduler.backend().cancel(&id.0).await.unwrap();
        let state = scheduler.backend().state(&id.0, None).await.unwrap();
        assert_eq!(state, SlurmState::Cancelled);
    }

    #[test]
    fn slurm_job_id_displays_as_its_id_string() {
        assert_eq!(SlurmJobId("1234".to_string()).to_string(), "1234");
    }
}
