use crate::decomposer::DecompositionRule;
use crate::dispatcher::{run_loop, DispatchState};
use crate::metrics::MetricsSnapshot;
use crate::synthesizer::{MergeStrategy, Synthesizer};
use crate::types::{SynthesizedResult, Task, TaskSpec, Worker};
use crate::worker::WorkerBackend;
use overseer_core::{OrchestratorConfig, OverseerError, OverseerResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Awaitable receipt for a submitted task.
///
/// Dropping the handle does not cancel the task; its result is simply
/// discarded on delivery.
pub struct TaskHandle {
    id: Uuid,
    rx: tokio::sync::oneshot::Receiver<SynthesizedResult>,
}

impl TaskHandle {
    /// Id assigned to the submitted task.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the task's synthesized result.
    pub async fn wait(self) -> OverseerResult<SynthesizedResult> {
        self.rx.await.map_err(|_| {
            OverseerError::Orchestrator("orchestrator dropped before delivering result".to_string())
        })
    }
}

/// Point-in-time operational view of the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Whether the dispatch loop is running.
    pub running: bool,
    /// Total queued tasks.
    pub queue_depth: usize,
    /// Queued tasks per priority level.
    pub queue_buckets: BTreeMap<u8, usize>,
    /// Current load per worker.
    pub worker_loads: HashMap<String, usize>,
    /// Aggregate metrics for the current window.
    pub metrics: MetricsSnapshot,
}

/// The single entry point for task orchestration.
///
/// Owns the queue, the worker registry, the decomposer, the synthesizer, and
/// the metrics collector; callers interact only through this facade. All
/// methods take `&self`, so the orchestrator can sit behind an `Arc` and be
/// shared across submitters.
pub struct Orchestrator {
    state: Arc<DispatchState>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Create an orchestrator from a validated configuration.
    ///
    /// The dispatch loop is not running yet; call [`Orchestrator::start`]
    /// after registering workers and decomposition rules.
    pub fn new(config: OrchestratorConfig) -> OverseerResult<Self> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(DispatchState::new(config)),
            loop_handle: Mutex::new(None),
        })
    }

    /// Spawn the dispatch loop and start accepting submissions.
    pub async fn start(&self) -> OverseerResult<()> {
        let mut guard = self.loop_handle.lock().await;
        if guard.is_some() {
            return Err(OverseerError::Orchestrator(
                "orchestrator already running".to_string(),
            ));
        }
        let _ = self.state.shutdown.send(false);
        let _ = self.state.cancel.send(false);
        self.state.accepting.store(true, Ordering::SeqCst);
        *guard = Some(tokio::spawn(run_loop(Arc::clone(&self.state))));
        Ok(())
    }

    /// Stop the orchestrator.
    ///
    /// A graceful stop refuses new submissions, drains the queue, and waits
    /// for in-flight work. A forced stop additionally cancels in-flight
    /// invocations and settles every queued task as cancelled; each affected
    /// submitter still receives a terminal result.
    pub async fn stop(&self, force: bool) -> OverseerResult<()> {
        let handle = self.loop_handle.lock().await.take();
        let Some(handle) = handle else {
            return Err(OverseerError::Orchestrator(
                "orchestrator is not running".to_string(),
            ));
        };

        info!(force, "stopping orchestrator");
        self.state.accepting.store(false, Ordering::SeqCst);
        if force {
            let _ = self.state.cancel.send(true);
            let drained = self.state.queue.write().await.drain();
            for task in drained {
                self.state.cancel_queued(task);
            }
        }
        let _ = self.state.shutdown.send(true);
        self.state.queue_notify.notify_one();

        handle
            .await
            .map_err(|e| OverseerError::Orchestrator(format!("dispatch loop panicked: {e}")))
    }

    /// Submit a task for execution.
    ///
    /// Returns a handle immediately; the result arrives through it once every
    /// subtask has settled. Fails fast when the queue is at capacity or the
    /// orchestrator is stopping.
    pub async fn submit(&self, spec: TaskSpec) -> OverseerResult<TaskHandle> {
        if !self.state.accepting.load(Ordering::SeqCst) {
            return Err(OverseerError::Orchestrator(
                "orchestrator is not accepting tasks".to_string(),
            ));
        }

        let config = &self.state.config;
        let default_priority = config.priority_levels.div_ceil(2);
        let mut task = Task::from_spec(spec, default_priority, config.max_retries);
        task.priority = config.clamp_priority(task.priority);
        let id = task.id;

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.state.completions.lock().insert(id, tx);
        if let Err(e) = self.state.queue.write().await.enqueue(task) {
            self.state.completions.lock().remove(&id);
            return Err(e);
        }
        self.state.queue_notify.notify_one();
        debug!(task_id = %id, "task submitted");
        Ok(TaskHandle { id, rx })
    }

    /// Wait for a previously submitted task's synthesized result.
    pub async fn await_result(&self, handle: TaskHandle) -> OverseerResult<SynthesizedResult> {
        handle.wait().await
    }

    /// Submit a task and wait for its synthesized result.
    pub async fn execute(&self, spec: TaskSpec) -> OverseerResult<SynthesizedResult> {
        self.submit(spec).await?.wait().await
    }

    /// Register a worker with the given allocation weight and optional
    /// capability set. Effective for the next assignment.
    pub async fn add_worker(
        &self,
        id: impl Into<String>,
        weight: f64,
        capabilities: Option<BTreeSet<String>>,
        backend: Arc<dyn WorkerBackend>,
    ) -> OverseerResult<()> {
        self.state
            .registry
            .write()
            .await
            .add_worker(id, weight, capabilities, backend)
    }

    /// Deregister a worker. In-flight invocations on it run to completion.
    pub async fn remove_worker(&self, id: &str) -> bool {
        self.state.registry.write().await.remove_worker(id)
    }

    /// Change a worker's allocation weight.
    pub async fn adjust_weight(&self, id: &str, weight: f64) -> OverseerResult<()> {
        self.state.registry.write().await.adjust_weight(id, weight)
    }

    /// Register a decomposition rule for a task category.
    pub async fn register_rule(
        &self,
        category: impl Into<String>,
        rule: Arc<dyn DecompositionRule>,
    ) {
        self.state.decomposer.write().await.register(category, rule);
    }

    /// Replace the strategy used to merge subtask outputs.
    pub fn set_merge_strategy(&self, merge: Arc<dyn MergeStrategy>) {
        *self.state.synthesizer.write() = Synthesizer::with_merge(merge);
    }

    /// Recompute worker weights from the current metrics window.
    pub async fn optimize_resources(&self) {
        let snapshot = self.state.metrics.snapshot();
        self.state
            .registry
            .write()
            .await
            .optimize_resources(&snapshot);
    }

    /// Snapshot of the current metrics window.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.state.metrics.snapshot()
    }

    /// Zero the metrics window, returning the prior one.
    pub fn reset_metrics(&self) -> MetricsSnapshot {
        self.state.metrics.reset()
    }

    /// Registered worker records.
    pub async fn workers(&self) -> Vec<Worker> {
        self.state.registry.read().await.workers()
    }

    /// Operational status: loop state, queue depths, worker loads, metrics.
    pub async fn status(&self) -> StatusReport {
        let (queue_depth, queue_buckets) = {
            let queue = self.state.queue.read().await;
            (queue.len(), queue.peek_counts())
        };
        let worker_loads = self.state.registry.read().await.loads();
        let running = self.loop_handle.lock().await.is_some();
        StatusReport {
            running,
            queue_depth,
            queue_buckets,
            worker_loads,
            metrics: self.state.metrics.snapshot(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_submit_rejected_before_start() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default()).unwrap();
        let result = orchestrator.submit(TaskSpec::new(json!({}))).await;
        assert!(matches!(result, Err(OverseerError::Orchestrator(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = OrchestratorConfig {
            priority_levels: 0,
            ..OrchestratorConfig::default()
        };
        assert!(Orchestrator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default()).unwrap();
        orchestrator.start().await.unwrap();
        assert!(orchestrator.start().await.is_err());
        orchestrator.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_start_fails() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default()).unwrap();
        assert!(orchestrator.stop(false).await.is_err());
    }

    #[tokio::test]
    async fn test_status_reflects_lifecycle() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default()).unwrap();
        assert!(!orchestrator.status().await.running);

        orchestrator.start().await.unwrap();
        assert!(orchestrator.status().await.running);

        orchestrator.stop(false).await.unwrap();
        let status = orchestrator.status().await;
        assert!(!status.running);
        assert_eq!(status.queue_depth, 0);
    }
}
