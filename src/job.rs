//! Job model: the unit of work scheduled by a workflow run.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::graph::NodeId;

/// The status required of a parent job for a dependency edge to be
/// satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeStatus {
    /// The parent must complete successfully.
    Success,
    /// The parent must fail.
    Failure,
    /// The parent's outcome, whatever it is, satisfies the edge.
    Any,
}

impl EdgeStatus {
    /// Parse the status names accepted by [`Job::after`]: `success`,
    /// `failure`, `any`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(EdgeStatus::Success),
            "failure" => Some(EdgeStatus::Failure),
            "any" => Some(EdgeStatus::Any),
            _ => None,
        }
    }
}

impl fmt::Display for EdgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeStatus::Success => write!(f, "success"),
            EdgeStatus::Failure => write!(f, "failure"),
            EdgeStatus::Any => write!(f, "any"),
        }
    }
}

/// Per-job policy for combining multiple dependency edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitFor {
    /// All parent edges must be satisfied (conjunction). Default.
    All,
    /// At least one parent edge must be satisfied (disjunction).
    Any,
}

impl WaitFor {
    /// Parse the mode names accepted by [`Job::set_waitfor`]: `all`, `any`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(WaitFor::All),
            "any" => Some(WaitFor::Any),
            _ => None,
        }
    }
}

impl Default for WaitFor {
    fn default() -> Self {
        WaitFor::All
    }
}

/// A value a job body or postcondition may produce or accept. Kept
/// deliberately small: the engine only needs to move results through the
/// scheduler and onto disk, not interpret them.
pub type JobValue = Value;

/// A job's error surface, as seen from user-supplied bodies and
/// postconditions. Distinct from [`crate::error::SchedError`], which is the
/// scheduler's own error taxonomy — a `JobError` becomes a `SchedError` once
/// the scheduler classifies it.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct JobError(pub String);

impl JobError {
    /// Wrap any displayable error as a job error.
    pub fn new(e: impl fmt::Display) -> Self {
        Self(e.to_string())
    }
}

/// The callable invoked to execute a job, selected by whether the job is
/// scalar or array-expanded. Array closures must be `Send + Sync` so they
/// can be dispatched onto worker-pool threads concurrently.
///
/// Per the opaque-callable design constraint, this type is never serialized
/// directly; the Slurm backend instead resolves jobs through the
/// [`EntryPoint`] registry by name.
#[derive(Clone)]
pub enum JobBody {
    /// Invoked with no arguments.
    Scalar(Arc<dyn Fn() -> Result<JobValue, JobError> + Send + Sync>),
    /// Invoked once per array index.
    Array(Arc<dyn Fn(u32) -> Result<JobValue, JobError> + Send + Sync>),
}

impl fmt::Debug for JobBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobBody::Scalar(_) => write!(f, "JobBody::Scalar(..)"),
            JobBody::Array(_) => write!(f, "JobBody::Array(..)"),
        }
    }
}

impl JobBody {
    /// Invoke the scalar body. Panics if called on an array body.
    pub fn call_scalar(&self) -> Result<JobValue, JobError> {
        match self {
            JobBody::Scalar(f) => f(),
            JobBody::Array(_) => panic!("call_scalar on an array job body"),
        }
    }

    /// Invoke the array body at `index`. Panics if called on a scalar body.
    pub fn call_array(&self, index: u32) -> Result<JobValue, JobError> {
        match self {
            JobBody::Array(f) => f(index),
            JobBody::Scalar(_) => panic!("call_array on a scalar job body"),
        }
    }
}

/// A single postcondition: same calling convention as [`JobBody`].
#[derive(Clone)]
pub enum Postcondition {
    /// Evaluated with no arguments.
    Scalar(Arc<dyn Fn() -> bool + Send + Sync>),
    /// Evaluated once per array index.
    Array(Arc<dyn Fn(u32) -> bool + Send + Sync>),
}

impl fmt::Debug for Postcondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Postcondition(..)")
    }
}

/// Process-global registry resolving an entry-point name to the [`JobBody`]
/// it names. The Slurm backend cannot ship an in-process closure to another
/// machine; instead a caller registers a stable name before `schedule` runs,
/// and the Slurm-submitted shim looks the body up by that name when it
/// starts on the compute node.
static ENTRY_POINTS: OnceLock<std::sync::Mutex<FxHashMap<String, JobBody>>> = OnceLock::new();

fn entry_points() -> &'static std::sync::Mutex<FxHashMap<String, JobBody>> {
    ENTRY_POINTS.get_or_init(|| std::sync::Mutex::new(FxHashMap::default()))
}

/// Register `body` under `name` so the Slurm backend's shim invocation can
/// resolve it on the compute node. Registering the same name twice replaces
/// the previous body.
pub fn register_entry_point(name: impl Into<String>, body: JobBody) {
    entry_points()
        .lock()
        .expect("entry point registry poisoned")
        .insert(name.into(), body);
}

/// Look up a previously registered entry point by name.
pub fn resolve_entry_point(name: &str) -> Option<JobBody> {
    entry_points()
        .lock()
        .expect("entry point registry poisoned")
        .get(name)
        .cloned()
}

/// A job's array shape: either absent (scalar) or a finite, non-empty set of
/// integer indices, preserved in ascending order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobArray(BTreeSet<u32>);

impl JobArray {
    /// `0..n`, matching the original's "integer N is shorthand for
    /// `{0..N-1}`" rule.
    pub fn range(n: u32) -> Self {
        Self((0..n).collect())
    }

    /// An explicit set of indices. Panics if empty — array, once finite,
    /// must be non-empty per the data model invariant.
    pub fn from_indices(indices: impl IntoIterator<Item = u32>) -> Self {
        let set: BTreeSet<u32> = indices.into_iter().collect();
        assert!(!set.is_empty(), "job array must be non-empty");
        Self(set)
    }

    /// Indices in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    /// Number of indices.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty (should not occur for a live job, but
    /// pruning may shrink an array to nothing when everything is done).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn retain(&mut self, mut keep: impl FnMut(u32) -> bool) {
        self.0.retain(|i| keep(*i));
    }

    /// Render as comma-separated collapsed intervals, e.g. `{0,1,2,5,6,9}`
    /// becomes `0-2,5-6,9`.
    pub fn to_intervals(&self) -> String {
        comma_separated(self.0.iter().copied())
    }
}

/// Collapse a sorted sequence of integers into comma-separated intervals:
/// consecutive runs render as `start-end`, singletons render bare.
pub fn comma_separated(indices: impl IntoIterator<Item = u32>) -> String {
    let values: Vec<u32> = indices.into_iter().collect();
    let mut parts = Vec::new();
    let mut i = 0;
    while i < values.len() {
        let start = values[i];
        let mut end = start;
        while i + 1 < values.len() && values[i + 1] == end + 1 {
            end += 1;
            i += 1;
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
        i += 1;
    }
    parts.join(",")
}

/// Parse comma-separated intervals back into the set of indices they
/// denote. Inverse of [`comma_separated`].
pub fn parse_intervals(s: &str) -> Option<BTreeSet<u32>> {
    let mut set = BTreeSet::new();
    if s.is_empty() {
        return Some(set);
    }
    for part in s.split(',') {
        if let Some((start, end)) = part.split_once('-') {
            let start: u32 = start.parse().ok()?;
            let end: u32 = end.parse().ok()?;
            if start > end {
                return None;
            }
            set.extend(start..=end);
        } else {
            set.insert(part.parse().ok()?);
        }
    }
    Some(set)
}

/// Unique identifier for a job, stable for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named unit of work: the engine's primary input type.
///
/// Jobs are constructed and wired together by the (out-of-scope) declaration
/// layer, then handed to [`crate::scheduler::schedule`]. The `node` field
/// links the job into the workflow [`crate::graph::Graph`]; dependency
/// edges and their statuses live there, not on the `Job` itself, so a `Job`
/// can be looked up and mutated by ID without re-threading graph state
/// through every call site.
#[derive(Clone)]
pub struct Job {
    /// Graph node backing this job's dependency edges.
    pub node: NodeId,

    /// Unique job identifier.
    pub id: JobId,

    /// Human-readable name (defaults to the body's declared name at
    /// construction time in the declaration layer; the engine just stores
    /// whatever string it is handed).
    pub name: String,

    /// The callable executed for this job.
    pub body: JobBody,

    /// Entry-point name under which `body` was (or should be) registered
    /// for the Slurm backend. `None` means the job was never intended to
    /// run under Slurm.
    pub entry_point: Option<String>,

    /// Array shape, if this is an array job.
    pub array: Option<JobArray>,

    /// Maximum simultaneously running array elements (Slurm only).
    pub array_throttle: Option<u32>,

    /// Backend settings (`cpus`, `gpus`, `ram`, `time`, ...). Unknown keys
    /// are forwarded verbatim to the backend.
    pub settings: FxHashMap<String, Value>,

    /// Environment prelude lines specific to this job, emitted after the
    /// scheduler-level prelude (see Design Notes' `env` open question).
    pub env: Vec<String>,

    /// Postconditions, evaluated in order; their conjunction defines `done`.
    pub postconditions: Vec<Postcondition>,

    /// Wait policy over this job's dependency edges.
    pub waitfor: WaitFor,

    /// Parents proven unsatisfiable by a pruning pass.
    pub unsatisfied: Vec<NodeId>,

    /// Cached result of evaluating postconditions; `None` until the pruning
    /// pass computes it.
    pub done_cache: Option<bool>,

    /// Stable ordinal assigned by the scheduler on first observation;
    /// `None` before the job has been tagged.
    pub ordinal: Option<u32>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("array", &self.array)
            .field("waitfor", &self.waitfor)
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Construct a scalar job.
    pub fn scalar(
        node: NodeId,
        name: impl Into<String>,
        body: Arc<dyn Fn() -> Result<JobValue, JobError> + Send + Sync>,
    ) -> Self {
        Self::new(node, name, JobBody::Scalar(body), None)
    }

    /// Construct an array job over `array`.
    pub fn array(
        node: NodeId,
        name: impl Into<String>,
        array: JobArray,
        body: Arc<dyn Fn(u32) -> Result<JobValue, JobError> + Send + Sync>,
    ) -> Self {
        Self::new(node, name, JobBody::Array(body), Some(array))
    }

    fn new(node: NodeId, name: impl Into<String>, body: JobBody, array: Option<JobArray>) -> Self {
        Self {
            node,
            id: JobId::new(),
            name: name.into(),
            body,
            entry_point: None,
            array,
            array_throttle: None,
            settings: default_settings(),
            env: Vec::new(),
            postconditions: Vec::new(),
            waitfor: WaitFor::All,
            unsatisfied: Vec::new(),
            done_cache: None,
            ordinal: None,
        }
    }

    /// Attach an entry-point name for the Slurm backend to resolve this
    /// job's body by. Also registers `self.body` under that name.
    pub fn with_entry_point(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        register_entry_point(name.clone(), self.body.clone());
        self.entry_point = Some(name);
        self
    }

    /// Set the max simultaneously running array elements (Slurm only).
    pub fn with_array_throttle(mut self, throttle: u32) -> Self {
        self.array_throttle = Some(throttle);
        self
    }

    /// Forward a setting to the backend (`cpus`, `gpus`, `ram`, `time`, ...).
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Append a per-job environment prelude line.
    pub fn with_env(mut self, line: impl Into<String>) -> Self {
        self.env.push(line.into());
        self
    }

    /// Append a scalar postcondition. Panics if this is an array job — use
    /// [`Job::ensure_array`] instead (arity must match `array`).
    pub fn ensure(&mut self, cond: Arc<dyn Fn() -> bool + Send + Sync>) {
        assert!(
            self.array.is_none(),
            "scalar postcondition attached to an array job"
        );
        self.postconditions.push(Postcondition::Scalar(cond));
        self.done_cache = None;
    }

    /// Append an array postcondition. Panics if this is a scalar job.
    pub fn ensure_array(&mut self, cond: Arc<dyn Fn(u32) -> bool + Send + Sync>) {
        assert!(
            self.array.is_some(),
            "array postcondition attached to a scalar job"
        );
        self.postconditions.push(Postcondition::Array(cond));
        self.done_cache = None;
    }

    /// Set the wait policy. Rejects values other than `all`/`any` via
    /// [`WaitFor::parse`] at the call site (the engine itself only accepts
    /// an already-validated [`WaitFor`]).
    pub fn set_waitfor(&mut self, mode: WaitFor) {
        self.waitfor = mode;
    }

    /// Evaluate the conjunction of postconditions, without caching. Used by
    /// the pruning pass (which owns the cache) and array-shrink logic.
    fn eval_scalar(&self) -> bool {
        if self.postconditions.is_empty() {
            return false;
        }
        self.postconditions.iter().all(|p| match p {
            Postcondition::Scalar(f) => f(),
            Postcondition::Array(_) => panic!("array postcondition on a scalar job"),
        })
    }

    fn eval_at(&self, index: u32) -> bool {
        self.postconditions.iter().all(|p| match p {
            Postcondition::Array(f) => f(index),
            Postcondition::Scalar(_) => panic!("scalar postcondition on an array job"),
        })
    }

    /// Whether every postcondition currently holds: for a scalar job, the
    /// conjunction with no arguments; for an array job, the conjunction at
    /// every remaining index. A job with no postconditions is never `done`.
    pub fn done(&self) -> bool {
        if self.postconditions.is_empty() {
            return false;
        }
        match &self.array {
            None => self.eval_scalar(),
            Some(array) => array.indices().all(|i| self.eval_at(i)),
        }
    }

    /// Shrink `array` to the indices whose postcondition conjunction is
    /// currently false. No-op for scalar jobs or jobs without
    /// postconditions.
    pub fn shrink_array_to_unsatisfied(&mut self) {
        if self.postconditions.is_empty() {
            return;
        }
        if let Some(array) = &mut self.array {
            let conds = &self.postconditions;
            array.retain(|i| {
                !conds.iter().all(|p| match p {
                    Postcondition::Array(f) => f(i),
                    Postcondition::Scalar(_) => panic!("scalar postcondition on an array job"),
                })
            });
        }
    }

    /// The effective callable a backend invokes (§4.2 `run`): runs the
    /// body, then verifies the postcondition conjunction holds. A false
    /// postcondition becomes a fatal error for the job — callers wrap it
    /// into `SchedError::JobFailed` the same way a body's own error is
    /// wrapped, per §7's "always wrapped in JobFailed".
    pub fn run_scalar(&self) -> Result<JobValue, JobError> {
        let value = self.body.call_scalar()?;
        if !self.postconditions.is_empty() && !self.eval_scalar() {
            return Err(JobError::new("postcondition not satisfied"));
        }
        Ok(value)
    }

    /// `run_scalar`'s array-job counterpart: invokes the body at `index`,
    /// then checks the postcondition conjunction at that same index.
    pub fn run_at(&self, index: u32) -> Result<JobValue, JobError> {
        let value = self.body.call_array(index)?;
        if !self.postconditions.is_empty() && !self.eval_at(index) {
            return Err(JobError::new("postcondition not satisfied"));
        }
        Ok(value)
    }

    /// Render this job's string form: `name` for scalar, or
    /// `name[intervals]` for array jobs.
    pub fn display_name(&self) -> String {
        match &self.array {
            None => self.name.clone(),
            Some(array) => format!("{}[{}]", self.name, array.to_intervals()),
        }
    }

    /// This job's tag, `NNNN_slug(name)`, once tagged by the scheduler.
    pub fn tag(&self) -> Option<String> {
        self.ordinal.map(|n| format!("{:04}_{}", n, slug(&self.name)))
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

fn default_settings() -> FxHashMap<String, Value> {
    let mut s = FxHashMap::default();
    s.insert("cpus".to_string(), Value::from(1));
    s.insert("gpus".to_string(), Value::from(0));
    s.insert("ram".to_string(), Value::from("2GB"));
    s.insert("time".to_string(), Value::from("1-00:00:00"));
    s
}

/// Replace every non-alphanumeric character with `_`, matching the
/// scheduler's tagging rule (`NNNN_slug(name)`).
pub fn slug(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    fn test_graph() -> (Graph<EdgeStatus>, NodeId) {
        let mut g: Graph<EdgeStatus> = Graph::new();
        let n = g.add_node();
        (g, n)
    }

    #[test]
    fn scalar_job_has_no_array() {
        let (_g, n) = test_graph();
        let job = Job::scalar(n, "build", Arc::new(|| Ok(Value::Null)));
        assert!(job.array.is_none());
        assert_eq!(job.display_name(), "build");
    }

    #[test]
    fn array_job_display_name_collapses_intervals() {
        let (_g, n) = test_graph();
        let job = Job::array(
            n,
            "train",
            JobArray::from_indices([0, 1, 2, 5, 6, 9]),
            Arc::new(|_i| Ok(Value::Null)),
        );
        assert_eq!(job.display_name(), "train[0-2,5-6,9]");
    }

    #[test]
    fn comma_separated_round_trips() {
        let indices = [0u32, 1, 2, 5, 6, 9];
        let rendered = comma_separated(indices);
        assert_eq!(rendered, "0-2,5-6,9");
        let parsed = parse_intervals(&rendered).unwrap();
        assert_eq!(parsed, indices.into_iter().collect::<BTreeSet<_>>());
    }

    #[test]
    fn done_is_false_with_no_postconditions() {
        let (_g, n) = test_graph();
        let job = Job::scalar(n, "noop", Arc::new(|| Ok(Value::Null)));
        assert!(!job.done());
    }

    #[test]
    fn scalar_done_reflects_postcondition_conjunction() {
        let (_g, n) = test_graph();
        let mut job = Job::scalar(n, "build", Arc::new(|| Ok(Value::Null)));
        job.ensure(Arc::new(|| true));
        assert!(job.done());
        job.ensure(Arc::new(|| false));
        assert!(!job.done());
    }

    #[test]
    fn array_done_requires_every_index_satisfied() {
        let (_g, n) = test_graph();
        let mut job = Job::array(n, "gen", JobArray::range(3), Arc::new(|_i| Ok(Value::Null)));
        job.ensure_array(Arc::new(|i| i != 2));
        assert!(!job.done());
        job.shrink_array_to_unsatisfied();
        assert_eq!(job.array.as_ref().unwrap().indices().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn tag_is_none_before_scheduling() {
        let (_g, n) = test_graph();
        let job = Job::scalar(n, "a", Arc::new(|| Ok(Value::Null)));
        assert!(job.tag().is_none());
    }

    #[test]
    fn tag_format_after_ordinal_assignment() {
        let (_g, n) = test_graph();
        let mut job = Job::scalar(n, "train model!", Arc::new(|| Ok(Value::Null)));
        job.ordinal = Some(3);
        assert_eq!(job.tag().unwrap(), "0003_train_model_");
    }

    #[test]
    fn edge_status_parse_rejects_unknown() {
        assert_eq!(EdgeStatus::parse("success"), Some(EdgeStatus::Success));
        assert_eq!(EdgeStatus::parse("bogus"), None);
    }

    #[test]
    fn waitfor_parse_rejects_unknown() {
        assert_eq!(WaitFor::parse("any"), Some(WaitFor::Any));
        assert_eq!(WaitFor::parse("bogus"), None);
    }

    #[test]
    fn run_scalar_fails_when_postcondition_is_false() {
        let (_g, n) = test_graph();
        let mut job = Job::scalar(n, "build", Arc::new(|| Ok(Value::from(1))));
        job.ensure(Arc::new(|| false));
        assert!(job.run_scalar().is_err());
    }

    #[test]
    fn run_scalar_passes_through_when_no_postconditions() {
        let (_g, n) = test_graph();
        let job = Job::scalar(n, "build", Arc::new(|| Ok(Value::from(7))));
        assert_eq!(job.run_scalar().unwrap(), Value::from(7));
    }

    #[test]
    fn run_at_checks_the_postcondition_for_that_index() {
        let (_g, n) = test_graph();
        let mut job = Job::array(n, "gen", JobArray::range(3), Arc::new(|i| Ok(Value::from(i))));
        job.ensure_array(Arc::new(|i| i != 1));
        assert!(job.run_at(0).is_ok());
        assert!(job.run_at(1).is_err());
    }

    #[test]
    fn entry_point_round_trips_through_registry() {
        let (_g, n) = test_graph();
        let job =
            Job::scalar(n, "registered", Arc::new(|| Ok(Value::from(42)))).with_entry_point("job::registered");
        assert_eq!(job.entry_point.as_deref(), Some("job::registered"));
        let resolved = resolve_entry_point("job::registered").unwrap();
        assert_eq!(resolved.call_scalar().unwrap(), Value::from(42));
    }
}
