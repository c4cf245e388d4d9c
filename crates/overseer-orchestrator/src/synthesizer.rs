use crate::types::{ResultStatus, SubtaskFailure, SynthesizedResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Terminal outcome of a single subtask, as fed to the synthesizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SubtaskOutcome {
    /// The subtask produced an output.
    Succeeded {
        /// The subtask.
        subtask_id: Uuid,
        /// Its opaque output.
        output: serde_json::Value,
    },
    /// The subtask failed terminally.
    Failed {
        /// The subtask.
        subtask_id: Uuid,
        /// Why it failed.
        reason: String,
    },
    /// The subtask was cancelled.
    Cancelled {
        /// The subtask.
        subtask_id: Uuid,
    },
}

/// How successful subtask outputs are combined into the parent's result.
pub trait MergeStrategy: Send + Sync {
    /// Merge the outputs, which arrive in subtask order.
    fn merge(&self, outputs: Vec<serde_json::Value>) -> Vec<serde_json::Value>;
}

/// Default merge: the ordered list of subtask outputs, untouched.
pub struct OrderedMerge;

impl MergeStrategy for OrderedMerge {
    fn merge(&self, outputs: Vec<serde_json::Value>) -> Vec<serde_json::Value> {
        outputs
    }
}

/// Merges the subset of subtask results that succeeded into a single
/// best-effort result and records which subtasks failed.
///
/// Pure with respect to orchestrator state: the only effect is the returned
/// [`SynthesizedResult`]. A caller always receives something usable when at
/// least one subtask succeeded.
pub struct Synthesizer {
    merge: Arc<dyn MergeStrategy>,
}

impl Synthesizer {
    /// Create a synthesizer with the default ordered-list merge.
    pub fn new() -> Self {
        Self {
            merge: Arc::new(OrderedMerge),
        }
    }

    /// Create a synthesizer with a custom merge strategy.
    pub fn with_merge(merge: Arc<dyn MergeStrategy>) -> Self {
        Self { merge }
    }

    /// Fold the subtask outcomes of one task into its synthesized result.
    ///
    /// - Every subtask succeeded → `Succeeded` with the merged outputs.
    /// - None succeeded, all cancelled → `Cancelled`.
    /// - None succeeded otherwise → `Failed` with every failure reason.
    /// - Mixed → `PartiallySucceeded`: merged outputs plus explicit
    ///   per-subtask failure detail, so callers can tell "complete" from
    ///   "best effort".
    pub fn synthesize(&self, task_id: Uuid, outcomes: &[SubtaskOutcome]) -> SynthesizedResult {
        let mut outputs = Vec::new();
        let mut failures = Vec::new();
        let mut cancelled = 0usize;

        for outcome in outcomes {
            match outcome {
                SubtaskOutcome::Succeeded { output, .. } => outputs.push(output.clone()),
                SubtaskOutcome::Failed { subtask_id, reason } => failures.push(SubtaskFailure {
                    subtask_id: *subtask_id,
                    reason: reason.clone(),
                }),
                SubtaskOutcome::Cancelled { subtask_id } => {
                    cancelled += 1;
                    failures.push(SubtaskFailure {
                        subtask_id: *subtask_id,
                        reason: "cancelled".to_string(),
                    });
                }
            }
        }

        let status = if failures.is_empty() {
            // A zero-subtask expansion lands here: trivially successful.
            ResultStatus::Succeeded
        } else if outputs.is_empty() {
            if cancelled == outcomes.len() {
                ResultStatus::Cancelled
            } else {
                ResultStatus::Failed
            }
        } else {
            ResultStatus::PartiallySucceeded
        };

        SynthesizedResult {
            task_id,
            status,
            results: self.merge.merge(outputs),
            failures,
        }
    }
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new()
    }
}
