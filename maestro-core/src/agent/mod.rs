//! Agent system for maestro
//!
//! This module provides the worker abstraction everything else schedules onto:
//! - Agent trait implemented by concrete agents
//! - Worker lifecycle, capacity, inbox and health
//! - Task and result types
//! - Built-in agents and the factory that builds agents by type name

pub mod builtin;
pub mod factory;
pub mod task;
pub mod traits;
pub mod types;
pub mod worker;

pub use builtin::{BuiltinAgent, BuiltinKind};
pub use factory::{AgentFactory, BuiltinAgentFactory};
pub use task::{
    OutputFormat, ResultMetadata, Task, TaskBuilder, TaskContext, TaskMetadata, TaskPriority,
    TaskRequirements, TaskResult, TaskStatus, TaskType,
};
pub use traits::Agent;
pub use types::{
    AgentCapability, AgentConfig, AgentId, AgentState, AgentStatus, CapabilityCategory,
    ResourceUsage, TaskId, duration_ms, new_id,
};
pub use worker::{
    AgentEvent, CPU_THRESHOLD_PERCENT, MEMORY_THRESHOLD_MB, Worker, compute_health_score,
};
