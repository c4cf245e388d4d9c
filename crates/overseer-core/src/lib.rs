//! Core types and error definitions for the Overseer task orchestrator.
//!
//! This crate provides the foundational pieces shared across the Overseer
//! workspace: the unified error enum, the result alias, and the runtime
//! configuration with its validation rules.
//!
//! # Main types
//!
//! - [`OverseerError`] — Unified error enum for all Overseer subsystems.
//! - [`OverseerResult`] — Convenience alias for `Result<T, OverseerError>`.
//! - [`OrchestratorConfig`] — Runtime configuration for an orchestrator instance.
//! - [`SchedulingAlgorithm`] / [`AllocationStrategy`] — Closed strategy selectors.

/// Orchestrator runtime configuration.
pub mod config;

use uuid::Uuid;

pub use config::{AllocationStrategy, OrchestratorConfig, SchedulingAlgorithm};

// --- Error types ---

/// Top-level error type for the Overseer orchestrator.
///
/// Subtask-level failures are folded into the synthesized result delivered to
/// the caller; only submission, administration, and configuration errors
/// surface through this enum directly.
#[derive(Debug, thiserror::Error)]
pub enum OverseerError {
    /// The task queue is at its configured capacity; the submission was rejected.
    #[error("task queue full (limit {limit})")]
    QueueFull {
        /// The configured `task_queue_limit` that was hit.
        limit: usize,
    },

    /// No registered worker's capability set matches the task.
    #[error("no eligible worker for task {task_id}")]
    NoEligibleWorker {
        /// The task that could not be assigned.
        task_id: Uuid,
    },

    /// Every eligible worker is at its maximum concurrent load.
    #[error("all eligible workers are at capacity")]
    NoCapacity,

    /// A worker invocation exceeded the configured timeout.
    #[error("worker invocation timed out after {seconds}s")]
    WorkerTimeout {
        /// The timeout that elapsed, in seconds.
        seconds: u64,
    },

    /// A worker returned an execution failure.
    #[error("worker execution failed: {message}")]
    WorkerExecution {
        /// Failure detail reported by the worker.
        message: String,
        /// Whether the worker signalled the failure as transient.
        recoverable: bool,
    },

    /// The task was cancelled before reaching a natural terminal state.
    #[error("task cancelled")]
    Cancelled,

    /// An error in configuration parsing or validation.
    #[error("config error: {0}")]
    Config(String),

    /// An error from the orchestrator itself (lifecycle, bookkeeping).
    #[error("orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OverseerError {
    /// Whether this failure may succeed on a retry.
    ///
    /// Timeouts, transient worker errors, and assignment pressure
    /// (`NoCapacity`, `NoEligibleWorker`; workers can join at runtime) are
    /// recoverable; everything else is terminal.
    pub fn is_recoverable(&self) -> bool {
        match self {
            OverseerError::WorkerTimeout { .. } => true,
            OverseerError::WorkerExecution { recoverable, .. } => *recoverable,
            OverseerError::NoCapacity | OverseerError::NoEligibleWorker { .. } => true,
            _ => false,
        }
    }
}

/// A convenience `Result` alias using [`OverseerError`].
pub type OverseerResult<T> = Result<T, OverseerError>;
