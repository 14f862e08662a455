//! Parsers for `sbatch`/`sacct`/`scancel` output, grounded on the teacher's
//! `pbs/parser.rs` (substring-based state detection, matching unit test
//! style against literal command-output fixtures).

use crate::error::{SchedError, SchedResult};

/// A Slurm job's accounting state, as reported by `sacct`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlurmState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    /// An array job whose elements disagree and no per-element row was
    /// found to disambiguate (§4.6 `state`).
    Mixed,
    Unknown(String),
}

impl SlurmState {
    /// Whether this state represents a successful, terminal completion.
    pub fn is_success(&self) -> bool {
        matches!(self, SlurmState::Completed)
    }

    /// Whether this state is terminal (won't change on its own).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SlurmState::Completed | SlurmState::Failed | SlurmState::Cancelled | SlurmState::TimedOut
        )
    }
}

fn parse_one_state(raw: &str) -> SlurmState {
    // sacct states carry suffixes like "CANCELLED by 1001"; match on prefix.
    let base = raw.split_whitespace().next().unwrap_or(raw);
    match base {
        "PENDING" => SlurmState::Pending,
        "RUNNING" | "CONFIGURING" | "COMPLETING" => SlurmState::Running,
        "COMPLETED" => SlurmState::Completed,
        "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" => SlurmState::Failed,
        "CANCELLED" => SlurmState::Cancelled,
        "TIMEOUT" | "DEADLINE" => SlurmState::TimedOut,
        other => SlurmState::Unknown(other.to_string()),
    }
}

/// Parse `sbatch --parsable` stdout: the job ID is the token before the
/// first `;` (the cluster-name suffix Slurm appends in multi-cluster setups
/// is dropped along with everything after it).
pub fn parse_sbatch_output(stdout: &str) -> SchedResult<String> {
    let trimmed = stdout.trim();
    let id = trimmed.split(';').next().unwrap_or(trimmed).trim();
    if id.is_empty() || !id.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return Err(SchedError::BackendCommandError {
            command: "sbatch".to_string(),
            message: format!("unexpected output: {trimmed:?}"),
        });
    }
    Ok(id.to_string())
}

/// Parse `sacct -o JobID,State -n -P -X` output (pipe-separated, one row
/// per job/array-element) into `(id, state)` pairs.
pub fn parse_sacct_output(stdout: &str) -> Vec<(String, SlurmState)> {
    stdout
        .lines()
        .filter_map(|line| {
            let (id, state) = line.split_once('|')?;
            let id = id.trim();
            if id.is_empty() {
                return None;
            }
            Some((id.to_string(), parse_one_state(state.trim())))
        })
        .collect()
}

/// Resolve the state to report for `job_id` (optionally a specific array
/// `index`) out of a parsed `sacct` row set, per §4.6:
/// - scalar: look up the job ID directly.
/// - array element: look up `<id>_<index>`, falling back to the scalar ID.
/// - if multiple distinct states appear with no exact row, report `Mixed`
///   (job-level) or `Pending` (index-level, per the original's reasoning
///   that an unresolved element is still queued relative to its siblings).
pub fn resolve_state(rows: &[(String, SlurmState)], job_id: &str, index: Option<u32>) -> SlurmState {
    match index {
        Some(i) => {
            let element = format!("{job_id}_{i}");
            if let Some((_, s)) = rows.iter().find(|(id, _)| id == &element) {
                return s.clone();
            }
            if let Some((_, s)) = rows.iter().find(|(id, _)| id == job_id) {
                return s.clone();
            }
            if rows.is_empty() {
                SlurmState::Unknown("no accounting record".to_string())
            } else {
                SlurmState::Pending
            }
        }
        None => {
            if let Some((_, s)) = rows.iter().find(|(id, _)| id == job_id) {
                return s.clone();
            }
            if rows.is_empty() {
                return SlurmState::Unknown("no accounting record".to_string());
            }
            let mut distinct = rows.iter().map(|(_, s)| s);
            let first = distinct.next().unwrap();
            if distinct.all(|s| s == first) {
                first.clone()
            } else {
                SlurmState::Mixed
            }
        }
    }
}

/// Validate `scancel -v`'s stderr for a real failure vs. Slurm's normal
/// "signal N scheduled" chatter on success.
pub fn parse_scancel_output(stderr: &str) -> SchedResult<()> {
    if stderr.contains("Invalid job id specified") {
        return Err(SchedError::BackendCommandError {
            command: "scancel".to_string(),
            message: stderr.trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sbatch_output_strips_cluster_suffix() {
        assert_eq!(parse_sbatch_output("12345\n").unwrap(), "12345");
        assert_eq!(parse_sbatch_output("12345;cluster1\n").unwrap(), "12345");
    }

    #[test]
    fn parse_sbatch_output_rejects_garbage() {
        assert!(parse_sbatch_output("sbatch: error: invalid partition").is_err());
    }

    #[test]
    fn parse_sacct_output_reads_pipe_separated_rows() {
        let stdout = "12345|COMPLETED\n12346|RUNNING\n";
        let rows = parse_sacct_output(stdout);
        assert_eq!(rows, vec![
            ("12345".to_string(), SlurmState::Completed),
            ("12346".to_string(), SlurmState::Running),
        ]);
    }

    #[test]
    fn resolve_state_prefers_exact_array_element_row() {
        let rows = vec![
            ("100_0".to_string(), SlurmState::Completed),
            ("100_1".to_string(), SlurmState::Running),
        ];
        assert_eq!(resolve_state(&rows, "100", Some(0)), SlurmState::Completed);
        assert_eq!(resolve_state(&rows, "100", Some(1)), SlurmState::Running);
    }

    #[test]
    fn resolve_state_falls_back_to_scalar_id_for_an_unseen_index() {
        let rows = vec![("100".to_string(), SlurmState::Running)];
        assert_eq!(resolve_state(&rows, "100", Some(2)), SlurmState::Running);
    }

    #[test]
    fn resolve_state_reports_mixed_without_an_exact_job_level_row() {
        let rows = vec![
            ("100_0".to_string(), SlurmState::Completed),
            ("100_1".to_string(), SlurmState::Failed),
        ];
        assert_eq!(resolve_state(&rows, "100", None), SlurmState::Mixed);
    }

    #[test]
    fn resolve_state_unknown_with_no_accounting_record() {
        assert_eq!(
            resolve_state(&[], "100", None),
            SlurmState::Unknown("no accounting record".to_string())
        );
    }

    #[test]
    fn parse_scancel_output_accepts_normal_chatter() {
        assert!(parse_scancel_output("scancel: Terminating job 100\n").is_ok());
    }

    #[test]
    fn parse_scancel_output_rejects_invalid_job_id() {
        assert!(parse_scancel_output("scancel: error: Invalid job id specified").is_err());
    }
}
