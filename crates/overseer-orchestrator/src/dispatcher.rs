use crate::allocator::WorkerRegistry;
use crate::decomposer::Decomposer;
use crate::metrics::MetricsCollector;
use crate::synthesizer::{SubtaskOutcome, Synthesizer};
use crate::task_queue::TaskQueue;
use crate::types::{ResultStatus, SubtaskFailure, SynthesizedResult, Task, TaskStatus};
use chrono::Utc;
use overseer_core::{OrchestratorConfig, OverseerError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bookkeeping for a dispatched task awaiting its subtask outcomes.
///
/// Holds the parent's own record (with `subtasks` populated at decomposition)
/// so status and timestamps stay maintained until the terminal result has
/// been delivered, after which the record is released.
pub(crate) struct ParentState {
    total: usize,
    outcomes: Vec<SubtaskOutcome>,
    task: Task,
}

/// Shared state between the facade, the dispatch loop, and spawned subtask
/// invocations.
///
/// The queue and worker registry are the only mutable shared state; both sit
/// behind a single lock each, and the dispatch loop is the queue's only
/// consumer so ordering decisions stay linearizable.
pub(crate) struct DispatchState {
    pub(crate) config: OrchestratorConfig,
    pub(crate) queue: RwLock<TaskQueue>,
    pub(crate) registry: RwLock<WorkerRegistry>,
    pub(crate) decomposer: RwLock<Decomposer>,
    pub(crate) synthesizer: parking_lot::RwLock<Synthesizer>,
    pub(crate) metrics: MetricsCollector,
    pub(crate) parents: parking_lot::Mutex<HashMap<Uuid, ParentState>>,
    pub(crate) completions: parking_lot::Mutex<HashMap<Uuid, oneshot::Sender<SynthesizedResult>>>,
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) queue_notify: Notify,
    pub(crate) idle_notify: Notify,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) cancel: watch::Sender<bool>,
    pub(crate) accepting: AtomicBool,
    pub(crate) in_flight: AtomicUsize,
}

impl DispatchState {
    pub(crate) fn new(config: OrchestratorConfig) -> Self {
        let queue = TaskQueue::new(config.task_queue_limit);
        let registry = WorkerRegistry::new(
            config.resource_allocation,
            config.high_priority_cutoff(),
            config.max_worker_load,
            config.allocation_seed,
        );
        let decomposer = Decomposer::new(
            config.allow_nested_decomposition,
            config.max_decomposition_depth,
            config.priority_levels,
        );
        let semaphore = Arc::new(Semaphore::new(config.max_in_flight));
        Self {
            config,
            queue: RwLock::new(queue),
            registry: RwLock::new(registry),
            decomposer: RwLock::new(decomposer),
            synthesizer: parking_lot::RwLock::new(Synthesizer::new()),
            metrics: MetricsCollector::new(),
            parents: parking_lot::Mutex::new(HashMap::new()),
            completions: parking_lot::Mutex::new(HashMap::new()),
            semaphore,
            queue_notify: Notify::new(),
            idle_notify: Notify::new(),
            shutdown: watch::Sender::new(false),
            cancel: watch::Sender::new(false),
            accepting: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Record a subtask's terminal outcome; when it is the last outstanding
    /// one, synthesize and resolve the parent.
    ///
    /// The finished child record (terminal status, `completed_at` stamped by
    /// the caller) is folded back into the parent's `subtasks` so the parent
    /// record stays current until its result is delivered.
    fn finish_subtask(&self, child: Task, outcome: SubtaskOutcome) {
        let Some(parent_id) = child.parent else {
            error!(task_id = %child.id, "subtask without parent linkage dropped");
            return;
        };
        let done = {
            let mut parents = self.parents.lock();
            let Some(entry) = parents.get_mut(&parent_id) else {
                warn!(task_id = %parent_id, "outcome for unknown parent dropped");
                return;
            };
            if child.id == entry.task.id {
                // Identity expansion: the child is the parent's own record.
                let root_parent = entry.task.parent.take();
                entry.task = child;
                entry.task.parent = root_parent;
            } else if let Some(slot) = entry.task.subtasks.iter_mut().find(|s| s.id == child.id) {
                *slot = child;
            }
            entry.outcomes.push(outcome);
            if entry.outcomes.len() == entry.total {
                parents.remove(&parent_id)
            } else {
                None
            }
        };
        if let Some(entry) = done {
            self.resolve_parent(entry);
        }
    }

    fn resolve_parent(&self, mut entry: ParentState) {
        let parent_id = entry.task.id;
        let result = self.synthesizer.read().synthesize(parent_id, &entry.outcomes);
        finalize_record(&mut entry.task, &result);
        let latency = (Utc::now() - entry.task.created_at)
            .to_std()
            .unwrap_or_default();
        self.metrics.record_completion(result.status, latency);
        info!(task_id = %parent_id, status = ?result.status, latency_ms = latency.as_millis() as u64, "task complete");
        self.deliver(parent_id, result);
        // The terminal record is dropped here; task bodies are not retained
        // past delivery.
    }

    fn deliver(&self, task_id: Uuid, result: SynthesizedResult) {
        if let Some(tx) = self.completions.lock().remove(&task_id) {
            // The caller may have dropped the handle; that is their choice.
            let _ = tx.send(result);
        }
    }

    /// Resolve a never-dispatched task that was dropped from the queue on a
    /// forced stop.
    pub(crate) fn cancel_queued(&self, mut task: Task) {
        task.finish(TaskStatus::Cancelled);
        if task.parent.is_some() {
            let subtask_id = task.id;
            self.finish_subtask(task, SubtaskOutcome::Cancelled { subtask_id });
            return;
        }
        let latency = (Utc::now() - task.created_at).to_std().unwrap_or_default();
        self.metrics.record_completion(ResultStatus::Cancelled, latency);
        self.deliver(
            task.id,
            SynthesizedResult {
                task_id: task.id,
                status: ResultStatus::Cancelled,
                results: Vec::new(),
                failures: vec![SubtaskFailure {
                    subtask_id: task.id,
                    reason: "cancelled".to_string(),
                }],
            },
        );
    }
}

/// The long-lived dispatch loop: single consumer of the task queue.
///
/// Dequeues per the configured algorithm, decomposes, and fans subtasks out
/// to concurrent invocations. Exits once shutdown is signalled, the queue is
/// drained, and no invocation is in flight.
pub(crate) async fn run_loop(state: Arc<DispatchState>) {
    let mut shutdown_rx = state.shutdown.subscribe();
    info!(
        algorithm = ?state.config.scheduling_algorithm,
        allocation = ?state.config.resource_allocation,
        "dispatch loop started"
    );

    loop {
        // Dequeue only once there is execution capacity, so a high-priority
        // task submitted while the pool is saturated can still overtake
        // everything already queued.
        let Ok(permit) = Arc::clone(&state.semaphore).acquire_owned().await else {
            break;
        };
        let next = {
            let mut queue = state.queue.write().await;
            queue.dequeue_next(state.config.scheduling_algorithm)
        };

        match next {
            Some(task) if task.parent.is_some() => {
                // A retried subtask: its parent is already registered, skip
                // decomposition.
                spawn_subtask(Arc::clone(&state), task, permit);
            }
            Some(task) => dispatch_task(&state, task, permit).await,
            None => {
                drop(permit);
                if *shutdown_rx.borrow() && state.in_flight.load(Ordering::SeqCst) == 0 {
                    break;
                }
                tokio::select! {
                    _ = state.queue_notify.notified() => {}
                    _ = state.idle_notify.notified() => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }

    info!("dispatch loop exited");
}

/// Decompose a submitted task and fan its subtasks out.
///
/// The caller's capacity permit covers the first subtask; each further one
/// waits for its own, so fan-out never exceeds the in-flight bound.
async fn dispatch_task(state: &Arc<DispatchState>, task: Task, permit: OwnedSemaphorePermit) {
    let mut parent_record = task.clone();
    let parent_id = parent_record.id;

    let subtasks = state.decomposer.read().await.expand(task);
    if subtasks.is_empty() {
        // A rule may expand into zero subtasks; the task is trivially done.
        state.resolve_parent(ParentState {
            total: 0,
            outcomes: Vec::new(),
            task: parent_record,
        });
        return;
    }

    if subtasks.len() > 1 || subtasks[0].id != parent_id {
        // Decomposed: the parent record carries its ordered children.
        parent_record.subtasks = subtasks.clone();
    }
    debug!(task_id = %parent_id, subtasks = subtasks.len(), "dispatching");
    state.parents.lock().insert(
        parent_id,
        ParentState {
            total: subtasks.len(),
            outcomes: Vec::with_capacity(subtasks.len()),
            task: parent_record,
        },
    );

    let mut permit = Some(permit);
    for mut subtask in subtasks {
        if subtask.parent.is_none() {
            // Identity expansion: the task is its own single subtask.
            subtask.parent = Some(parent_id);
        }
        let subtask_permit = match permit.take() {
            Some(p) => p,
            None => match Arc::clone(&state.semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            },
        };
        spawn_subtask(Arc::clone(state), subtask, subtask_permit);
    }
}

/// Run one subtask invocation as an independent unit of execution.
fn spawn_subtask(state: Arc<DispatchState>, task: Task, permit: OwnedSemaphorePermit) {
    state.in_flight.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(async move {
        execute_subtask(&state, task, permit).await;
        state.in_flight.fetch_sub(1, Ordering::SeqCst);
        state.idle_notify.notify_one();
    });
}

async fn execute_subtask(state: &Arc<DispatchState>, mut task: Task, permit: OwnedSemaphorePermit) {
    if task.parent.is_none() {
        error!(task_id = %task.id, "subtask without parent linkage dropped");
        return;
    }
    let mut cancel_rx = state.cancel.subscribe();
    if *cancel_rx.borrow() {
        let subtask_id = task.id;
        task.finish(TaskStatus::Cancelled);
        state.finish_subtask(task, SubtaskOutcome::Cancelled { subtask_id });
        return;
    }

    task.status = TaskStatus::Assigned;
    let worker_id = match state.registry.write().await.assign(&task) {
        Ok(id) => id,
        Err(e) => {
            drop(permit);
            handle_failure(state, task, e).await;
            return;
        }
    };

    let Some(backend) = state.registry.read().await.backend(&worker_id) else {
        // Worker removed between assignment and lookup.
        state.registry.write().await.release(&worker_id);
        drop(permit);
        handle_failure(
            state,
            task,
            OverseerError::WorkerExecution {
                message: format!("worker {worker_id} removed during assignment"),
                recoverable: true,
            },
        )
        .await;
        return;
    };

    task.status = TaskStatus::Running;
    if task.started_at.is_none() {
        task.started_at = Some(Utc::now());
    }
    debug!(task_id = %task.id, worker = %worker_id, "invoking worker");

    let timeout = Duration::from_secs(state.config.timeout_seconds);
    let started = Instant::now();
    let outcome = tokio::select! {
        invoked = tokio::time::timeout(timeout, backend.invoke(&task)) => match invoked {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(OverseerError::WorkerTimeout {
                seconds: state.config.timeout_seconds,
            }),
        },
        _ = cancel_rx.changed() => Err(OverseerError::Cancelled),
    };
    let duration = started.elapsed();
    state.registry.write().await.release(&worker_id);
    drop(permit);

    match outcome {
        Ok(output) => {
            state.metrics.record_invocation(&worker_id, duration, true);
            let subtask_id = task.id;
            task.finish(TaskStatus::Succeeded);
            state.finish_subtask(task, SubtaskOutcome::Succeeded { subtask_id, output });
        }
        Err(OverseerError::Cancelled) => {
            // Cancellation is tracked apart from worker failures.
            let subtask_id = task.id;
            task.finish(TaskStatus::Cancelled);
            state.finish_subtask(task, SubtaskOutcome::Cancelled { subtask_id });
        }
        Err(e) => {
            state.metrics.record_invocation(&worker_id, duration, false);
            handle_failure(state, task, e).await;
        }
    }
}

/// Classify a failure: re-enqueue under the retry policy, or settle the
/// subtask as failed.
async fn handle_failure(state: &Arc<DispatchState>, mut task: Task, err: OverseerError) {
    let retryable = state.config.fault_tolerance
        && err.is_recoverable()
        && task.retry_count < task.max_retries;

    if !retryable {
        warn!(task_id = %task.id, error = %err, retries = task.retry_count, "subtask failed");
        let subtask_id = task.id;
        let reason = err.to_string();
        task.finish(TaskStatus::Failed {
            reason: reason.clone(),
        });
        state.finish_subtask(task, SubtaskOutcome::Failed { subtask_id, reason });
        return;
    }

    task.retry_count += 1;
    task.status = TaskStatus::Retrying;
    if state.config.simplify_on_retry {
        simplify_payload(&mut task.payload);
    }
    warn!(
        task_id = %task.id,
        retry = task.retry_count,
        max = task.max_retries,
        error = %err,
        "retrying after backoff"
    );
    tokio::time::sleep(Duration::from_millis(state.config.retry_backoff_ms)).await;

    // Priority is preserved across retries; no automatic boost.
    task.status = TaskStatus::Queued;
    let requeue = task.clone();
    match state.queue.write().await.enqueue(requeue) {
        Ok(_) => state.queue_notify.notify_one(),
        Err(e) => {
            // The queue filled up while we backed off; the retry budget
            // cannot help here.
            let subtask_id = task.id;
            let reason = e.to_string();
            task.finish(TaskStatus::Failed {
                reason: reason.clone(),
            });
            state.finish_subtask(task, SubtaskOutcome::Failed { subtask_id, reason });
        }
    }
}

/// Stamp a parent record with the terminal status matching its synthesized
/// result.
fn finalize_record(task: &mut Task, result: &SynthesizedResult) {
    let status = match result.status {
        ResultStatus::Succeeded => TaskStatus::Succeeded,
        ResultStatus::PartiallySucceeded => TaskStatus::PartiallySucceeded,
        ResultStatus::Cancelled => TaskStatus::Cancelled,
        ResultStatus::Failed => TaskStatus::Failed {
            reason: result
                .failures
                .iter()
                .map(|f| f.reason.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        },
    };
    task.finish(status);
}

/// Shrink well-known numeric size fields so a retried task asks for less.
fn simplify_payload(payload: &mut serde_json::Value) {
    if let Some(object) = payload.as_object_mut() {
        for key in ["scope", "size", "limit"] {
            if let Some(n) = object.get(key).and_then(serde_json::Value::as_u64) {
                object.insert(key.to_string(), serde_json::Value::from(n / 2));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simplify_payload_halves_known_fields() {
        let mut payload = json!({"scope": 100, "size": 7, "other": 3});
        simplify_payload(&mut payload);
        assert_eq!(payload["scope"], json!(50));
        assert_eq!(payload["size"], json!(3));
        assert_eq!(payload["other"], json!(3));
    }

    #[test]
    fn test_simplify_payload_ignores_non_objects() {
        let mut payload = json!("opaque");
        simplify_payload(&mut payload);
        assert_eq!(payload, json!("opaque"));
    }

    fn child_of(parent: &Task) -> Task {
        let mut child =
            Task::from_spec(crate::types::TaskSpec::new(json!({})), parent.priority, 1);
        child.parent = Some(parent.id);
        child.depth = parent.depth + 1;
        child
    }

    fn insert_parent(state: &DispatchState, parent: Task, total: usize) {
        state.parents.lock().insert(
            parent.id,
            ParentState {
                total,
                outcomes: Vec::new(),
                task: parent,
            },
        );
    }

    #[test]
    fn test_finish_subtask_resolves_parent_on_last_outcome() {
        let state = DispatchState::new(OrchestratorConfig::default());
        let mut parent = Task::from_spec(crate::types::TaskSpec::new(json!({})), 5, 3);
        let parent_id = parent.id;
        let (a, b) = (child_of(&parent), child_of(&parent));
        parent.subtasks = vec![a.clone(), b.clone()];
        insert_parent(&state, parent, 2);
        let (tx, mut rx) = oneshot::channel();
        state.completions.lock().insert(parent_id, tx);

        let mut done_a = a;
        let subtask_id = done_a.id;
        done_a.finish(TaskStatus::Succeeded);
        state.finish_subtask(
            done_a,
            SubtaskOutcome::Succeeded {
                subtask_id,
                output: json!("a"),
            },
        );
        assert!(rx.try_recv().is_err());

        let mut done_b = b;
        let subtask_id = done_b.id;
        done_b.finish(TaskStatus::Failed {
            reason: "timeout".into(),
        });
        state.finish_subtask(
            done_b,
            SubtaskOutcome::Failed {
                subtask_id,
                reason: "timeout".into(),
            },
        );
        let result = rx.try_recv().unwrap();
        assert_eq!(result.status, ResultStatus::PartiallySucceeded);
        assert!(state.parents.lock().is_empty());
        assert_eq!(state.metrics.snapshot().tasks_processed, 1);
    }

    #[test]
    fn test_parent_record_tracks_child_completion() {
        let state = DispatchState::new(OrchestratorConfig::default());
        let mut parent = Task::from_spec(crate::types::TaskSpec::new(json!({})), 5, 3);
        let parent_id = parent.id;
        let (a, b) = (child_of(&parent), child_of(&parent));
        parent.subtasks = vec![a.clone(), b.clone()];
        insert_parent(&state, parent, 2);

        let mut done_a = a;
        let subtask_id = done_a.id;
        done_a.finish(TaskStatus::Succeeded);
        state.finish_subtask(
            done_a,
            SubtaskOutcome::Succeeded {
                subtask_id,
                output: json!("a"),
            },
        );

        // The finished child is folded back into the still-pending parent.
        {
            let parents = state.parents.lock();
            let entry = parents.get(&parent_id).unwrap();
            assert_eq!(entry.task.subtasks[0].status, TaskStatus::Succeeded);
            assert!(entry.task.subtasks[0].completed_at.is_some());
            assert_eq!(entry.task.subtasks[1].status, TaskStatus::Queued);
            assert!(!entry.task.status.is_terminal());
        }

        let mut done_b = b;
        let subtask_id = done_b.id;
        done_b.finish(TaskStatus::Succeeded);
        state.finish_subtask(
            done_b,
            SubtaskOutcome::Succeeded {
                subtask_id,
                output: json!("b"),
            },
        );
        assert!(state.parents.lock().is_empty());
    }

    #[test]
    fn test_finalize_record_maps_result_status() {
        let mut task = Task::from_spec(crate::types::TaskSpec::new(json!({})), 5, 3);
        let result = SynthesizedResult {
            task_id: task.id,
            status: ResultStatus::Failed,
            results: Vec::new(),
            failures: vec![SubtaskFailure {
                subtask_id: task.id,
                reason: "boom".into(),
            }],
        };
        finalize_record(&mut task, &result);
        assert_eq!(task.status, TaskStatus::Failed { reason: "boom".into() });
        assert!(task.completed_at.is_some());

        let mut task = Task::from_spec(crate::types::TaskSpec::new(json!({})), 5, 3);
        let result = SynthesizedResult {
            task_id: task.id,
            status: ResultStatus::PartiallySucceeded,
            results: vec![json!("kept")],
            failures: Vec::new(),
        };
        finalize_record(&mut task, &result);
        assert_eq!(task.status, TaskStatus::PartiallySucceeded);
    }

    #[test]
    fn test_cancel_queued_root_task() {
        let state = DispatchState::new(OrchestratorConfig::default());
        let task = Task::from_spec(
            crate::types::TaskSpec::new(json!({})),
            1,
            3,
        );
        let (tx, mut rx) = oneshot::channel();
        state.completions.lock().insert(task.id, tx);

        state.cancel_queued(task);
        let result = rx.try_recv().unwrap();
        assert_eq!(result.status, ResultStatus::Cancelled);
        assert_eq!(state.metrics.snapshot().cancelled_count, 1);
    }
}
