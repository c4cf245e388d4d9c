use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Lifecycle status of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue.
    Queued,
    /// A worker has been selected but execution has not begun.
    Assigned,
    /// The worker invocation is in flight.
    Running,
    /// A recoverable failure occurred; the task is heading back to the queue.
    Retrying,
    /// Terminal: every subtask succeeded.
    Succeeded,
    /// Terminal: at least one subtask succeeded and at least one failed.
    PartiallySucceeded,
    /// Terminal: no subtask succeeded.
    Failed {
        /// Failure detail for the task as a whole.
        reason: String,
    },
    /// Terminal: the task was cancelled before completing.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded
                | TaskStatus::PartiallySucceeded
                | TaskStatus::Failed { .. }
                | TaskStatus::Cancelled
        )
    }
}

/// A unit of work flowing through the orchestrator.
///
/// The scheduler never inspects `payload` beyond forwarding it to workers;
/// `category` is the only routing hint, used for decomposition-rule lookup
/// and capability matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, assigned at submission.
    pub id: Uuid,
    /// Opaque, caller-defined description of the work.
    pub payload: serde_json::Value,
    /// Optional routing category.
    pub category: Option<String>,
    /// Priority in `[1, priority_levels]`; higher is served first.
    pub priority: u8,
    /// Free-form key/value context, forwarded to workers and logs.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
    /// When execution first started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Automatic retries already attempted.
    #[serde(default)]
    pub retry_count: u32,
    /// Retry budget for this task (children of a decomposition get a reduced one).
    #[serde(default)]
    pub max_retries: u32,
    /// Parent task id when this is a subtask produced by decomposition.
    #[serde(default)]
    pub parent: Option<Uuid>,
    /// Depth in the decomposition hierarchy (0 = submitted task).
    #[serde(default)]
    pub depth: u32,
    /// Ordered child task records when decomposition occurred; empty for
    /// atomic tasks.
    #[serde(default)]
    pub subtasks: Vec<Task>,
}

impl Task {
    /// Create a fresh task from a submission spec.
    pub fn from_spec(spec: TaskSpec, default_priority: u8, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload: spec.payload,
            category: spec.category,
            priority: spec.priority.unwrap_or(default_priority),
            metadata: spec.metadata,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            parent: None,
            depth: 0,
            subtasks: Vec::new(),
        }
    }

    /// Move the record into a terminal status and stamp its completion time.
    pub fn finish(&mut self, status: TaskStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// The requestor group this task belongs to, for round-robin scheduling.
    pub fn requestor(&self) -> &str {
        self.metadata
            .get("requestor")
            .map_or("default", String::as_str)
    }
}

/// Caller-facing description of a task to submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Opaque work description.
    pub payload: serde_json::Value,
    /// Priority; defaults to the midpoint of the configured range when
    /// omitted (or inherits the parent's when produced by a decomposition
    /// rule).
    #[serde(default)]
    pub priority: Option<u8>,
    /// Optional routing category.
    #[serde(default)]
    pub category: Option<String>,
    /// Free-form context.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl TaskSpec {
    /// Create a spec with the given payload and default everything else.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            priority: None,
            category: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the routing category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Terminal status of a synthesized result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Every subtask succeeded.
    Succeeded,
    /// Some subtasks succeeded; the result is best-effort.
    PartiallySucceeded,
    /// No subtask succeeded.
    Failed,
    /// The task was cancelled.
    Cancelled,
}

/// A failed subtask, reported alongside whatever did succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskFailure {
    /// The subtask that failed.
    pub subtask_id: Uuid,
    /// Why it failed.
    pub reason: String,
}

/// The merged outcome of all subtasks belonging to one submitted task.
///
/// This is the fault-tolerance contract: when at least one subtask succeeds
/// the caller always receives something usable, never a bare error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizedResult {
    /// The submitted task this result belongs to.
    pub task_id: Uuid,
    /// Terminal status.
    pub status: ResultStatus,
    /// Merged successful outputs (shape controlled by the merge strategy).
    pub results: Vec<serde_json::Value>,
    /// Per-subtask failure detail for anything that did not succeed.
    pub failures: Vec<SubtaskFailure>,
}

/// A registered worker as seen by the resource allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Unique identifier.
    pub id: String,
    /// Relative allocation share; must be positive.
    pub weight: f64,
    /// When present, the worker only accepts tasks whose category is in the set.
    pub capabilities: Option<BTreeSet<String>>,
    /// Tasks currently assigned but not yet completed.
    pub current_load: usize,
    /// Concurrent load ceiling for this worker.
    pub max_load: usize,
}

impl Worker {
    /// Whether this worker can execute the given task.
    pub fn is_eligible(&self, task: &Task) -> bool {
        match (&self.capabilities, &task.category) {
            (None, _) => true,
            (Some(caps), Some(category)) => caps.contains(category),
            // A worker that declares capabilities only takes categorized tasks.
            (Some(_), None) => false,
        }
    }

    /// Whether this worker has room for another assignment.
    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_load
    }

    /// Load normalized by weight, the balanced-allocation ranking key.
    pub fn load_ratio(&self) -> f64 {
        self.current_load as f64 / self.weight
    }
}

/// Cumulative per-worker execution statistics, owned by the metrics collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Completed invocations that succeeded.
    pub success_count: u64,
    /// Completed invocations that failed.
    pub failure_count: u64,
    /// Total processing time across completed invocations, in milliseconds.
    pub total_processing_ms: u64,
}

impl WorkerStats {
    /// Fraction of completed invocations that succeeded, if any completed.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            None
        } else {
            Some(self.success_count as f64 / total as f64)
        }
    }
}
