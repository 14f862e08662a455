//! The workflow record (C7): on-disk layout a post-hoc inspector consumes.
//!
//! `WorkflowRecord` owns the one directory a scheduler run writes into —
//! `<DAWGZ_DIR>/<uuid>/` — and the handful of file paths beneath it the rest
//! of the crate needs: the summary dump, and (Slurm backend only) each
//! job's generated script, settings snapshot, and log file. Directory
//! creation at construction time follows the teacher's `JsonStore::new`
//! pattern (`tokio::fs::create_dir_all` before anything is written).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::error::SchedResult;
use crate::scheduler::{Backend, Scheduler};
use crate::workflow::WorkflowId;

/// The directory a single `schedule()` run writes its artifacts into.
#[derive(Debug, Clone)]
pub struct WorkflowRecord {
    /// This run's identifier, also the directory's name under `DAWGZ_DIR`.
    pub id: WorkflowId,
    /// `<DAWGZ_DIR>/<uuid>`.
    pub dir: PathBuf,
}

impl WorkflowRecord {
    /// Create the run directory under `base_dir` (typically
    /// `config.dawgz_dir`), creating `base_dir` itself if needed.
    pub async fn create(base_dir: &Path, id: WorkflowId) -> SchedResult<Self> {
        let dir = base_dir.join(id.to_string());
        fs::create_dir_all(&dir).await?;
        Ok(Self { id, dir })
    }

    /// Path of the per-job submission script (Slurm backend).
    pub fn script_path(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{tag}.sh"))
    }

    /// Path of the per-job settings/entry-point snapshot (Slurm backend).
    /// Named `.pkl` for on-disk layout fidelity with the system this
    /// engine's contract was distilled from; the content is JSON, not a
    /// Python pickle.
    pub fn pickle_path(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{tag}.pkl"))
    }

    /// Path of a job's log file: `<tag>.log` for a scalar job, or
    /// `<tag>_<index>.log` for one array element.
    pub fn log_path(&self, tag: &str, index: Option<u32>) -> PathBuf {
        match index {
            Some(i) => self.dir.join(format!("{tag}_{i}.log")),
            None => self.dir.join(format!("{tag}.log")),
        }
    }

    /// Path of the run's summary dump.
    pub fn dump_path(&self) -> PathBuf {
        self.dir.join("dump.bin")
    }
}

/// Serialized summary of a completed run: enough to re-render `report()`
/// and issue cancels without re-running anything. Not `bincode` despite the
/// `.bin` extension on disk — see [`WorkflowRecord::dump_path`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDump {
    pub workflow_id: WorkflowId,
    pub backend: String,
    pub jobs: Vec<JobDumpEntry>,
}

/// One job's row in a [`WorkflowDump`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDumpEntry {
    pub tag: String,
    pub name: String,
    pub succeeded: bool,
    pub trace: Option<String>,
}

impl WorkflowDump {
    /// Build a dump from a completed scheduler's reports.
    pub fn from_scheduler<B: Backend>(backend: &str, workflow_id: WorkflowId, scheduler: &Scheduler<B>) -> Self {
        let jobs = scheduler
            .reports()
            .into_iter()
            .map(|r| JobDumpEntry {
                tag: r.tag,
                name: r.name,
                succeeded: r.succeeded,
                trace: r.trace,
            })
            .collect();
        Self {
            workflow_id,
            backend: backend.to_string(),
            jobs,
        }
    }

    /// Number of jobs that did not succeed.
    pub fn error_count(&self) -> usize {
        self.jobs.iter().filter(|j| !j.succeeded).count()
    }
}

/// Write `dump.bin` for `scheduler` and append the run's row to
/// `<DAWGZ_DIR>/workflows.csv`.
///
/// `record` must already exist (see [`WorkflowRecord::create`]); this is
/// the final step of a `schedule_local`/`schedule_slurm` call, after every
/// submitted job has resolved to a final value or error.
pub async fn record_workflow<B: Backend>(
    record: &WorkflowRecord,
    name: &str,
    backend: &str,
    scheduler: &Scheduler<B>,
) -> SchedResult<()> {
    let dump = WorkflowDump::from_scheduler(backend, record.id, scheduler);
    let json = serde_json::to_string_pretty(&dump)?;
    fs::write(record.dump_path(), json).await?;

    let base_dir = record
        .dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| record.dir.clone());
    append_csv_row(&base_dir, name, record.id, backend, dump.jobs.len(), dump.error_count()).await
}

/// Append one `(name, uuid, date, backend, num_jobs, num_errors)` row to
/// `<base_dir>/workflows.csv`. The file is append-only and carries no
/// header (§6).
async fn append_csv_row(
    base_dir: &Path,
    name: &str,
    id: WorkflowId,
    backend: &str,
    num_jobs: usize,
    num_errors: usize,
) -> SchedResult<()> {
    fs::create_dir_all(base_dir).await?;
    let path = base_dir.join("workflows.csv");
    let date = chrono::Utc::now().to_rfc3339();
    let row = format!("{name},{id},{date},{backend},{num_jobs},{num_errors}\n");

    let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
    file.write_all(row.as_bytes()).await?;
    Ok(())
}

/// Collapse `\r`-delimited runs in a log file's content down to the final
/// segment of each run, so tqdm-style progress lines show only their last
/// value (§6, `Scheduler.output`).
pub fn collapse_carriage_returns(content: &str) -> String {
    content
        .split('\n')
        .map(|line| line.rsplit('\r').next().unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Read a job's log file verbatim except for carriage-return collapsing.
pub async fn read_log(path: &Path) -> SchedResult<String> {
    let raw = fs::read_to_string(path).await?;
    Ok(collapse_carriage_returns(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_makes_the_run_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let id = WorkflowId::new();
        let record = WorkflowRecord::create(tmp.path(), id).await.unwrap();
        assert!(record.dir.is_dir());
        assert_eq!(record.dir, tmp.path().join(id.to_string()));
    }

    #[test]
    fn script_and_log_paths_are_namespaced_by_tag() {
        let dir = PathBuf::from("/tmp/.dawgz/abc");
        let record = WorkflowRecord {
            id: WorkflowId::new(),
            dir: dir.clone(),
        };
        assert_eq!(record.script_path("0001_build"), dir.join("0001_build.sh"));
        assert_eq!(record.log_path("0001_build", None), dir.join("0001_build.log"));
        assert_eq!(record.log_path("0002_gen", Some(3)), dir.join("0002_gen_3.log"));
    }

    #[tokio::test]
    async fn append_csv_row_is_append_only_with_no_header() {
        let tmp = tempfile::tempdir().unwrap();
        let id1 = WorkflowId::new();
        let id2 = WorkflowId::new();
        append_csv_row(tmp.path(), "run-a", id1, "local", 3, 0).await.unwrap();
        append_csv_row(tmp.path(), "run-b", id2, "slurm", 5, 2).await.unwrap();

        let content = fs::read_to_string(tmp.path().join("workflows.csv")).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("run-a,"));
        assert!(lines[0].ends_with(",local,3,0"));
        assert!(lines[1].ends_with(",slurm,5,2"));
    }

    #[test]
    fn collapse_carriage_returns_keeps_only_the_final_segment() {
        let content = "progress: 1%\rprogress: 50%\rprogress: 100%\ndone\n";
        assert_eq!(collapse_carriage_returns(content), "progress: 100%\ndone\n");
    }

    #[test]
    fn collapse_carriage_returns_is_noop_without_cr() {
        let content = "line one\nline two\n";
        assert_eq!(collapse_carriage_returns(content), content);
    }
}
