//! Runtime configuration for a scheduler run.

use std::path::PathBuf;

/// Which worker model the local backend uses to execute job bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerKind {
    /// Run bodies on the tokio blocking-thread pool, sharing the process.
    Threads,
    /// Re-invoke the current binary as a subprocess per job, isolating the
    /// body in its own OS process.
    Process,
}

impl Default for WorkerKind {
    fn default() -> Self {
        WorkerKind::Threads
    }
}

/// Configuration for the Slurm backend: the external commands it shells out
/// to, all overridable so tests (and clusters with nonstandard `PATH`
/// layouts) can point elsewhere.
#[derive(Debug, Clone)]
pub struct SlurmConfig {
    /// Path or bare name of the `sbatch` binary.
    pub sbatch: PathBuf,
    /// Path or bare name of the `scancel` binary.
    pub scancel: PathBuf,
    /// Path or bare name of the `sacct` binary.
    pub sacct: PathBuf,
    /// Path to the binary re-invoked by a job's shim line to resolve its
    /// entry point. Defaults to `std::env::current_exe()` at script
    /// generation time.
    pub dawgz_binary: Option<PathBuf>,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            sbatch: PathBuf::from("sbatch"),
            scancel: PathBuf::from("scancel"),
            sacct: PathBuf::from("sacct"),
            dawgz_binary: None,
        }
    }
}

/// Top-level configuration for a `schedule()` run.
///
/// Environment defaults mirror the original `dawgz` package's conventions:
/// `DAWGZ_DIR` for the workflow record base directory, `SHELL` for the
/// Slurm script shebang.
#[derive(Debug, Clone)]
pub struct DawgzConfig {
    /// Base directory for the workflow record (`DAWGZ_DIR`, default
    /// `./.dawgz`), created on first use.
    pub dawgz_dir: PathBuf,

    /// Shell used as the shebang line in generated Slurm scripts (`SHELL`,
    /// default `/bin/sh`).
    pub shell: PathBuf,

    /// Whether to prune the graph before dispatch.
    pub prune: bool,

    /// Suppress the default trace printout on failure.
    pub quiet: bool,

    /// Worker model for the local backend.
    pub worker_kind: WorkerKind,

    /// Slurm command paths.
    pub slurm: SlurmConfig,
}

impl DawgzConfig {
    /// Build a configuration reading `DAWGZ_DIR` and `SHELL` from the
    /// environment, falling back to `./.dawgz` and `/bin/sh`.
    pub fn from_env() -> Self {
        Self {
            dawgz_dir: std::env::var_os("DAWGZ_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./.dawgz")),
            shell: std::env::var_os("SHELL")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/bin/sh")),
            prune: false,
            quiet: false,
            worker_kind: WorkerKind::default(),
            slurm: SlurmConfig::default(),
        }
    }

    /// Enable pruning.
    pub fn with_prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    /// Silence the default failure printout.
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Override the worker model.
    pub fn with_worker_kind(mut self, kind: WorkerKind) -> Self {
        self.worker_kind = kind;
        self
    }

    /// Override the workflow record base directory.
    pub fn with_dawgz_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dawgz_dir = dir.into();
        self
    }
}

impl Default for DawgzConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dawgz_dir_falls_back_when_env_unset() {
        // SAFETY: test-local env mutation, no other test in this process
        // reads DAWGZ_DIR concurrently within the same `cargo test` binary
        // partition (each test module runs its own env var only here).
        let prior = std::env::var_os("DAWGZ_DIR");
        unsafe {
            std::env::remove_var("DAWGZ_DIR");
        }
        let cfg = DawgzConfig::from_env();
        assert_eq!(cfg.dawgz_dir, PathBuf::from("./.dawgz"));
        if let Some(prior) = prior {
            unsafe {
                std::env::set_var("DAWGZ_DIR", prior);
            }
        }
    }

    #[test]
    fn builder_overrides_apply() {
        let cfg = DawgzConfig::from_env()
            .with_prune(true)
            .with_worker_kind(WorkerKind::Process);
        assert!(cfg.prune);
        assert_eq!(cfg.worker_kind, WorkerKind::Process);
    }
}
