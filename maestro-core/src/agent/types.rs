//! Agent type definitions

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an agent (and of the spawner instance wrapping it)
pub type AgentId = String;

/// Identifier of a task
pub type TaskId = String;

/// Generate a new time-ordered identifier (UUID v7)
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Broad category a capability belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityCategory {
    Analysis,
    Generation,
    Review,
    Testing,
    Documentation,
    Coordination,
    Monitoring,
}

/// A named ability an agent declares at construction time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCapability {
    pub name: String,
    pub description: String,
    pub category: CapabilityCategory,
    /// Tags the capability depends on (e.g. external tools)
    #[serde(default)]
    pub requirements: Vec<String>,
}

impl AgentCapability {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: CapabilityCategory,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category,
            requirements: Vec::new(),
        }
    }
}

/// Static configuration supplied when an agent is constructed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<AgentCapability>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Lower values are preferred when several agents qualify
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Carried for concrete agents; workers never retry a failed task
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

fn default_max_concurrent_tasks() -> usize {
    1
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

impl AgentConfig {
    /// Create a config with defaults for everything but identity
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities: Vec::new(),
            tools: Vec::new(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            priority: 0,
            timeout_ms: default_timeout_ms(),
            retry_attempts: 0,
            health_check_interval_ms: default_health_check_interval_ms(),
        }
    }

    #[must_use]
    pub fn with_capability(mut self, capability: AgentCapability) -> Self {
        self.capabilities.push(capability);
        self
    }

    #[must_use]
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_health_check_interval_ms(mut self, interval_ms: u64) -> Self {
        self.health_check_interval_ms = interval_ms;
        self
    }

    /// Names of all declared capabilities
    pub fn capability_names(&self) -> impl Iterator<Item = &str> {
        self.capabilities.iter().map(|c| c.name.as_str())
    }

    /// True when the agent may take a task requiring `required`
    ///
    /// An empty requirement list is satisfied by every agent.
    pub fn satisfies(&self, required: &[String]) -> bool {
        required.is_empty()
            || required
                .iter()
                .any(|r| self.capability_names().any(|name| name == r))
    }
}

/// Lifecycle state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Initializing,
    Idle,
    Busy,
    Error,
    /// Terminal; reached only through shutdown
    Offline,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time resource consumption reported by an agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub active_processes: u32,
}

/// Mutable status snapshot of one agent
///
/// Only the owning worker writes it; everyone else receives copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub id: AgentId,
    pub state: AgentState,
    pub current_tasks: BTreeSet<TaskId>,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub uptime_ms: u64,
    pub last_activity: DateTime<Utc>,
    pub resource_usage: ResourceUsage,
    /// 0-100
    pub health_score: f64,
}

impl AgentStatus {
    /// Fresh status for a newly constructed agent
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: AgentState::Initializing,
            current_tasks: BTreeSet::new(),
            completed_tasks: 0,
            failed_tasks: 0,
            uptime_ms: 0,
            last_activity: Utc::now(),
            resource_usage: ResourceUsage::default(),
            health_score: 100.0,
        }
    }

    /// failed / (failed + completed), zero when nothing ran yet
    pub fn failure_rate(&self) -> f64 {
        let total = self.completed_tasks + self.failed_tasks;
        if total == 0 {
            0.0
        } else {
            self.failed_tasks as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_id_is_unique() {
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_ms(Duration::from_secs(u64::MAX)), u64::MAX);
    }

    #[test]
    fn agent_state_json_format() {
        assert_eq!(serde_json::to_string(&AgentState::Busy).unwrap(), "\"busy\"");
        assert_eq!(
            serde_json::to_string(&AgentState::Offline).unwrap(),
            "\"offline\""
        );
    }

    #[test]
    fn agent_state_default_is_initializing() {
        assert_eq!(AgentState::default(), AgentState::Initializing);
    }

    #[test]
    fn satisfies_empty_requirements() {
        let config = AgentConfig::new("a1", "agent");
        assert!(config.satisfies(&[]));
    }

    #[test]
    fn satisfies_requires_intersection() {
        let config = AgentConfig::new("a1", "agent").with_capability(AgentCapability::new(
            "code_review",
            "reviews code",
            CapabilityCategory::Review,
        ));

        assert!(config.satisfies(&["code_review".to_string(), "testing".to_string()]));
        assert!(!config.satisfies(&["testing".to_string()]));
    }

    #[test]
    fn failure_rate_handles_no_history() {
        let status = AgentStatus::new("a1");
        assert_eq!(status.failure_rate(), 0.0);
    }

    #[test]
    fn failure_rate_is_ratio_of_failed() {
        let mut status = AgentStatus::new("a1");
        status.completed_tasks = 3;
        status.failed_tasks = 1;
        assert!((status.failure_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn agent_config_deserializes_with_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"id": "a1", "name": "worker"}"#).unwrap();
        assert_eq!(config.max_concurrent_tasks, 1);
        assert_eq!(config.timeout_ms, 300_000);
        assert!(config.capabilities.is_empty());
    }
}
