//! maestro-core: agent orchestration control plane
//!
//! This crate provides the components that coordinate a pool of agents:
//!
//! - **Workers** - [`Worker`] wraps an [`Agent`] with status, a concurrency cap, an inbox and health
//! - **Spawning** - [`AgentSpawner`] creates, destroys and restarts instances under a global cap
//! - **Messaging** - [`MessageBus`] routes, correlates and records inter-agent messages
//! - **State** - [`StateManager`] is the source of truth for agents, tasks, results and metrics
//! - **Aggregation** - [`OutputAggregator`] merges several agents' results for one task
//! - **Facade** - [`Orchestrator`] wires one of each together
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use maestro_core::{BuiltinAgentFactory, MaestroConfig, Orchestrator, Task, TaskType};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Orchestrator::new(MaestroConfig::default(), Arc::new(BuiltinAgentFactory));
//!     orchestrator.start();
//!     orchestrator.bootstrap().await;
//!
//!     let task = Task::builder(TaskType::CodeReview, "Review the parser")
//!         .user_input("let x = y.unwrap();")
//!         .build();
//!     let output = orchestrator.dispatch(task, 2).await?;
//!     println!("{}", output.final_output);
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Orchestrator                      │
//! │  ┌──────────────┐   events   ┌─────────────────────┐ │
//! │  │ AgentSpawner │──────────▶│    StateManager      │ │
//! │  │  ┌────────┐  │            └─────────────────────┘ │
//! │  │  │ Worker │◀─┼── inbox ──┐                         │
//! │  │  └────────┘  │           │ ┌─────────────────────┐ │
//! │  └──────┬───────┘           └─│     MessageBus      │ │
//! │         │ results   messages ─▶└─────────────────────┘ │
//! │         ▼                                              │
//! │  ┌──────────────────┐                                  │
//! │  │ OutputAggregator │                                  │
//! │  └──────────────────┘                                  │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod aggregator;
pub mod bus;
mod capped;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod spawner;
pub mod state;

// Re-export key types for convenience
pub use agent::{
    Agent, AgentCapability, AgentConfig, AgentEvent, AgentFactory, AgentId, AgentState,
    AgentStatus, BuiltinAgent, BuiltinAgentFactory, BuiltinKind, CapabilityCategory,
    OutputFormat, ResourceUsage, Task, TaskId, TaskPriority, TaskResult, TaskStatus, TaskType,
    Worker,
};
pub use aggregator::{
    AggregatedOutput, AggregationStrategy, OutputAggregator, QualityMetrics, StrategyInfo,
};
pub use bus::{
    BROADCAST, BusStats, HistoryFilter, Message, MessageBus, MessagePriority, MessageType, Route,
    RouteCondition, RoutePattern,
};
pub use config::{AggregatorConfig, BusConfig, FleetEntry, MaestroConfig, SpawnerConfig, StateConfig};
pub use error::{
    AgentError, AggregationError, BusError, MaestroError, MaestroResult, SpawnerError, StateError,
};
pub use orchestrator::Orchestrator;
pub use spawner::{AgentSpawner, InstanceInfo, SpawnConfig, SpawnerEvent, SpawnerStats};
pub use state::{
    CoordinationPlan, JsonFileSnapshotStore, MemorySnapshotStore, SnapshotStore, StateManager,
    StateSnapshot, SystemMetrics,
};
