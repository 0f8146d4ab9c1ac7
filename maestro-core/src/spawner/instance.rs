//! Spawner-side records for running agents

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::agent::{AgentConfig, AgentEvent, AgentId, AgentState, AgentStatus, Worker};

/// Agent health below this costs 30 sweep points
pub const LOW_AGENT_HEALTH: f64 = 50.0;

/// Request to create one instance
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnConfig {
    pub agent_type: String,
    /// Generated when neither this nor `config` names one
    pub id: Option<AgentId>,
    /// Factory default for the type when absent
    pub config: Option<AgentConfig>,
    /// Advisory; recorded, never enforced
    pub dependencies: Vec<AgentId>,
    pub initialize: bool,
}

impl SpawnConfig {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            id: None,
            config: None,
            dependencies: Vec::new(),
            initialize: true,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Leave the worker in `initializing` until the caller initializes it
    #[must_use]
    pub fn without_initialize(mut self) -> Self {
        self.initialize = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub score: f64,
    pub last_check: DateTime<Utc>,
    pub issues: Vec<String>,
}

impl InstanceHealth {
    pub fn fresh() -> Self {
        Self {
            score: 100.0,
            last_check: Utc::now(),
            issues: Vec::new(),
        }
    }
}

/// Sweep score: 100 − 30·[agent health < 50] − 20·[inactive] − 40·[error]
pub fn sweep_score(status: &AgentStatus, inactive: bool) -> InstanceHealth {
    let mut score: f64 = 100.0;
    let mut issues = Vec::new();
    if status.health_score < LOW_AGENT_HEALTH {
        score -= 30.0;
        issues.push(format!("low agent health: {:.0}", status.health_score));
    }
    if inactive {
        score -= 20.0;
        issues.push("inactive".to_string());
    }
    if status.state == AgentState::Error {
        score -= 40.0;
        issues.push("agent in error state".to_string());
    }
    InstanceHealth {
        score: score.max(0.0),
        last_check: Utc::now(),
        issues,
    }
}

/// A live instance owned by the spawner
pub(crate) struct AgentInstance {
    pub id: AgentId,
    pub agent_type: String,
    pub worker: Arc<Worker>,
    pub last_status: AgentStatus,
    pub spawned_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub dependencies: Vec<AgentId>,
    pub health: InstanceHealth,
    /// Forwards worker events; aborted when the worker is replaced
    pub relay: JoinHandle<()>,
}

impl AgentInstance {
    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id.clone(),
            agent_type: self.agent_type.clone(),
            status: self.last_status.clone(),
            spawned_at: self.spawned_at,
            last_activity: self.last_activity,
            dependencies: self.dependencies.clone(),
            health: self.health.clone(),
        }
    }

    /// Refresh the cached status from the worker
    pub fn sync_status(&mut self) {
        self.last_status = self.worker.status();
        self.last_activity = self.last_activity.max(self.last_status.last_activity);
    }
}

/// Copy of an instance record handed out to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: AgentId,
    pub agent_type: String,
    pub status: AgentStatus,
    pub spawned_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub dependencies: Vec<AgentId>,
    pub health: InstanceHealth,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpawnerStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Entries waiting in the deferred spawn queue
    pub queued: usize,
}

/// Events on the spawner's surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpawnerEvent {
    Spawned {
        agent_id: AgentId,
        agent_type: String,
    },
    Destroyed {
        agent_id: AgentId,
        failed_tasks: usize,
    },
    Restarted {
        agent_id: AgentId,
    },
    /// Sweep score fell below the critical threshold
    Critical {
        agent_id: AgentId,
        score: f64,
        issues: Vec<String>,
    },
    /// Re-emitted worker event
    Agent {
        agent_id: AgentId,
        event: AgentEvent,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_idle_agent_scores_full() {
        let mut status = AgentStatus::new("a1");
        status.state = AgentState::Idle;
        let health = sweep_score(&status, false);
        assert_eq!(health.score, 100.0);
        assert!(health.issues.is_empty());
    }

    #[test]
    fn every_penalty_applies() {
        let mut status = AgentStatus::new("a1");
        status.state = AgentState::Error;
        status.health_score = 10.0;

        let health = sweep_score(&status, true);
        assert_eq!(health.score, 10.0);
        assert_eq!(health.issues.len(), 3);
    }

    #[test]
    fn error_alone_is_not_critical() {
        let mut status = AgentStatus::new("a1");
        status.state = AgentState::Error;
        assert_eq!(sweep_score(&status, false).score, 60.0);
    }

    #[test]
    fn spawn_config_builder() {
        let spawn = SpawnConfig::new("local")
            .with_id("w1")
            .depends_on("coordinator-main")
            .without_initialize();
        assert_eq!(spawn.id.as_deref(), Some("w1"));
        assert_eq!(spawn.dependencies, vec!["coordinator-main".to_string()]);
        assert!(!spawn.initialize);
    }
}
