//! Error taxonomy for the workflow scheduler.

use std::sync::Arc;

use thiserror::Error;

/// Result type for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur during a workflow run.
///
/// Every variant that targets a specific job carries its tag (or, before
/// tagging, its display name) and, where applicable, the causing error so
/// the chain survives being stored in the scheduler's shared `traces`
/// table (see §7 of the design: "causal chain is preserved").
#[derive(Error, Debug, Clone)]
pub enum SchedError {
    /// A cycle was detected among the reachable jobs before any submission
    /// began. Fatal: aborts `schedule` with zero body invocations.
    #[error("cyclic dependency graph: {0}")]
    CyclicDependencyGraph(String),

    /// A required parent failed, or was `any` but no parent succeeded, or
    /// the job was already proven unsatisfiable by pruning.
    #[error("dependency never satisfied for {job}")]
    DependencyNeverSatisfied {
        job: String,
        cause: Option<Arc<SchedError>>,
    },

    /// The user-supplied body raised (local backend) or a postcondition
    /// failed after the body returned.
    #[error("job failed: {job}: {message}")]
    JobFailed {
        job: String,
        message: String,
        cause: Option<Arc<SchedError>>,
    },

    /// A parent succeeded but the dependency edge demanded `failure`.
    #[error("job not failed: {job} succeeded but a failure was required")]
    JobNotFailed { job: String },

    /// A postcondition returned false after the body returned. Always
    /// wrapped into [`SchedError::JobFailed`] before it reaches `results`.
    #[error("postcondition not satisfied for {job}")]
    PostconditionNotSatisfied { job: String },

    /// `sbatch` (or the configured submission command) failed.
    #[error("job submission failed for {job}: {message}")]
    JobSubmission { job: String, message: String },

    /// Referenced a job the scheduler has no record of.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Referenced a workflow record the engine has no record of.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// A backend subprocess (e.g. `sacct`, `scancel`) produced output the
    /// parser could not understand.
    #[error("backend command failed: {command}: {message}")]
    BackendCommandError { command: String, message: String },

    /// IO error, most commonly from writing the workflow record.
    #[error("io error: {0}")]
    IoError(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    JsonError(String),

    /// Configuration error (e.g. an unreadable `DAWGZ_DIR`).
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Internal invariant violated; indicates an engine bug rather than a
    /// user error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for SchedError {
    fn from(e: std::io::Error) -> Self {
        SchedError::IoError(e.to_string())
    }
}

impl From<serde_json::Error> for SchedError {
    fn from(e: serde_json::Error) -> Self {
        SchedError::JsonError(e.to_string())
    }
}

impl SchedError {
    /// The tag/name of the job this error is attributed to, if any.
    pub fn job(&self) -> Option<&str> {
        match self {
            SchedError::DependencyNeverSatisfied { job, .. }
            | SchedError::JobFailed { job, .. }
            | SchedError::JobNotFailed { job }
            | SchedError::PostconditionNotSatisfied { job }
            | SchedError::JobSubmission { job, .. } => Some(job),
            _ => None,
        }
    }

    /// The error this one wraps, if any. Only the variants that can name a
    /// cause (`DependencyNeverSatisfied`, `JobFailed`) carry one.
    pub fn cause(&self) -> Option<&SchedError> {
        match self {
            SchedError::DependencyNeverSatisfied { cause, .. }
            | SchedError::JobFailed { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    /// Format this error and its full cause chain, one line per link,
    /// separated by `" <- "`, matching the presentation the workflow record
    /// and `traces` table use for reporting.
    pub fn trace(&self) -> String {
        let mut out = self.to_string();
        let mut cause = self.cause();
        while let Some(c) = cause {
            out.push_str(" <- ");
            out.push_str(&c.to_string());
            cause = c.cause();
        }
        out
    }
}
