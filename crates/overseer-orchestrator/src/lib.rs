//! Centralized task orchestration engine with priority scheduling, worker
//! allocation, and result synthesis.
//!
//! Implements the orchestrator-workers pattern: submitted tasks are queued by
//! priority, decomposed into subtasks by category rules, dispatched to
//! registered workers under load and capability constraints, and their
//! outcomes synthesized into a single best-effort result per task.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Facade owning the queue, workers, and dispatch loop.
//! - [`TaskQueue`] — Priority-bucketed bounded queue with pluggable ordering.
//! - [`WorkerRegistry`] — Worker records, weights, loads, and assignment strategies.
//! - [`Decomposer`] — Category-keyed rules expanding composite tasks into subtasks.
//! - [`Synthesizer`] — Folds subtask outcomes into a parent's terminal result.
//! - [`MetricsCollector`] — Task and per-worker statistics with snapshot/reset windows.

/// Worker registry and allocation strategies.
pub mod allocator;
/// Category-rule task decomposition.
pub mod decomposer;
mod dispatcher;
/// Orchestrator facade and lifecycle.
pub mod engine;
/// Task and worker statistics.
pub mod metrics;
/// Subtask outcome synthesis.
pub mod synthesizer;
/// Priority task queue.
pub mod task_queue;
/// Shared orchestration types (Task, Worker, SynthesizedResult, etc.).
pub mod types;
/// Worker backend trait.
pub mod worker;

pub use allocator::WorkerRegistry;
pub use decomposer::{Decomposer, DecompositionRule};
pub use engine::{Orchestrator, StatusReport, TaskHandle};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use synthesizer::{MergeStrategy, OrderedMerge, SubtaskOutcome, Synthesizer};
pub use task_queue::TaskQueue;
pub use types::{
    ResultStatus, SubtaskFailure, SynthesizedResult, Task, TaskSpec, TaskStatus, Worker,
    WorkerStats,
};
pub use worker::WorkerBackend;
