//! System state
//!
//! - [`StateManager`]: agents, task pool, results, message history, plans
//! - Derived per-agent and system metrics
//! - Snapshot export/restore with pluggable [`SnapshotStore`]s

mod manager;
pub mod metrics;
mod snapshot;
mod types;

pub use manager::{SHUTDOWN_BEFORE_COMPLETION, StateManager};
pub use snapshot::{JsonFileSnapshotStore, MemorySnapshotStore, SnapshotStore, spawn_autosave};
pub use types::{
    AgentMetrics, AgentRecord, CoordinationPlan, PlanId, PlanStatus, StateEvent, StateSnapshot,
    SystemMetrics, WorkflowStep,
};
