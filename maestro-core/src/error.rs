//! Error types for maestro-core

use thiserror::Error;

/// Top-level error type for maestro-core
#[derive(Error, Debug)]
pub enum MaestroError {
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Spawner error: {0}")]
    Spawner(#[from] SpawnerError),

    #[error("Message bus error: {0}")]
    Bus(#[from] BusError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),
}

/// Result alias used across the crate
pub type MaestroResult<T> = Result<T, MaestroError>;

/// Errors raised by a worker or a concrete agent
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Agent {agent_id} is at capacity ({max} concurrent tasks)")]
    AtCapacity { agent_id: String, max: usize },

    #[error("Agent {agent_id} lacks required capabilities: {required:?}")]
    CapabilityMismatch {
        agent_id: String,
        required: Vec<String>,
    },

    #[error("Agent {0} is offline")]
    Offline(String),

    #[error("Task {0} is already active on this agent")]
    DuplicateTask(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Task execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Task {0} aborted by agent shutdown")]
    Aborted(String),

    #[error("Message handling failed: {0}")]
    MessageFailed(String),
}

/// Errors from the agent spawner
#[derive(Error, Debug)]
pub enum SpawnerError {
    #[error("Instance limit reached ({max} instances)")]
    CapacityReached { max: usize },

    #[error("Instance already exists: {0}")]
    DuplicateInstance(String),

    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("No eligible instance for task {0}")]
    NoEligibleInstance(String),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Errors from the message bus
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Message queue is full ({capacity} messages)")]
    QueueFull { capacity: usize },

    #[error("No response to message {message_id} within {timeout_ms}ms")]
    Timeout { message_id: String, timeout_ms: u64 },

    #[error("A request with id {0} is already awaiting a response")]
    DuplicateRequest(String),

    #[error("Response channel closed for message {0}")]
    ResponseChannelClosed(String),

    #[error("Route not found: {0}")]
    RouteNotFound(String),
}

/// Errors from the state manager and its snapshot stores
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Agent not registered: {0}")]
    AgentNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Coordination plan not found: {0}")]
    PlanNotFound(String),

    #[error("Snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the output aggregator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    #[error("No results to aggregate for task {0}")]
    NoResults(String),

    #[error("No strategy for task type: {task_type}")]
    NoStrategy { task_type: String },

    #[error("Strategy not found: {0}")]
    StrategyNotFound(String),
}
