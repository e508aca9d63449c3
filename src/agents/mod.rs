//! External agent capability
//!
//! The core never talks to a provider itself. Anything that can take a
//! task and produce an execution result (a local LLM wrapper, a hosted
//! API adapter, a test double) implements this trait; the parallel
//! executor applies the per-task timeout around the call.

use crate::models::{ExecutionResult, Task};
use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute one task, returning within the caller-imposed timeout or
    /// raising. Implementations must tolerate running concurrently with
    /// other executors.
    async fn execute(&self, task: Task) -> Result<ExecutionResult>;
}

#[async_trait]
impl<F, Fut> TaskExecutor for F
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<ExecutionResult>> + Send,
{
    async fn execute(&self, task: Task) -> Result<ExecutionResult> {
        self(task).await
    }
}
