//! Agent trait definitions
//!
//! The Agent trait is the seam between the orchestration layer and the
//! concrete thing doing the work.

use async_trait::async_trait;

use super::task::{Task, TaskResult};
use super::types::ResourceUsage;
use crate::bus::Message;
use crate::error::AgentError;

/// Core trait for all agent implementations
///
/// Only [`Agent::process_task`] is mandatory. Capacity, status, health and
/// the inbox are owned by the [`Worker`](super::Worker) wrapping the agent,
/// so implementations stay free of bookkeeping.
///
/// # Object Safety
///
/// This trait is object-safe, allowing `Arc<dyn Agent>`.
///
/// # Example
///
/// ```ignore
/// use maestro_core::agent::{Agent, Task, TaskResult};
///
/// struct Echo;
///
/// #[async_trait]
/// impl Agent for Echo {
///     async fn process_task(&self, task: &Task) -> Result<TaskResult, AgentError> {
///         Ok(TaskResult::success(&task.id, "echo", json!(task.description), 0))
///     }
/// }
/// ```
#[async_trait]
pub trait Agent: Send + Sync {
    /// Prepare resources before the first task
    async fn initialize(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// Run a task to completion
    ///
    /// The `agent_id` of the returned result is overwritten by the worker.
    async fn process_task(&self, task: &Task) -> Result<TaskResult, AgentError>;

    /// Release resources; called once from worker shutdown
    async fn shutdown(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// Handle one inbox message, optionally producing a reply
    async fn handle_message(&self, _message: &Message) -> Result<Option<Message>, AgentError> {
        Ok(None)
    }

    /// Current resource consumption, sampled on every health tick
    fn resource_usage(&self) -> ResourceUsage {
        ResourceUsage::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify that the Agent trait is object-safe
    fn _assert_object_safe(_: std::sync::Arc<dyn Agent>) {}
}
