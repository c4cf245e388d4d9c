use crate::types::Task;
use async_trait::async_trait;
use overseer_core::OverseerResult;

/// The external-collaborator boundary: something that can execute a subtask.
///
/// The orchestrator treats implementations as opaque capabilities: it never
/// inspects the payload it forwards or the value it gets back. A backend
/// signals a transient failure by returning
/// [`OverseerError::WorkerExecution`](overseer_core::OverseerError::WorkerExecution)
/// with `recoverable: true`; anything non-recoverable skips the retry policy.
///
/// Invocations race against the configured per-task timeout; a backend that
/// never returns is classified as a recoverable timeout by the dispatcher.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Execute the task and return its opaque result.
    async fn invoke(&self, task: &Task) -> OverseerResult<serde_json::Value>;
}
