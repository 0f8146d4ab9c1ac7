//! State model types: per-agent records, plans, metrics and snapshots

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{AgentId, AgentStatus, Task, TaskId, TaskResult, new_id};
use crate::bus::Message;

/// Identifier of a coordination plan
pub type PlanId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Pending,
    Executing,
    Completed,
    Failed,
}

/// One step of a coordination workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Agent expected to run the step; empty until assigned
    #[serde(default)]
    pub agent_id: AgentId,
    pub action: String,
    /// Indices of steps that must finish first
    #[serde(default)]
    pub depends_on: Vec<usize>,
    pub timeout_ms: u64,
}

/// How several agents cooperate on one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationPlan {
    pub id: PlanId,
    pub task_id: TaskId,
    #[serde(default)]
    pub agents: Vec<AgentId>,
    #[serde(default)]
    pub workflow: Vec<WorkflowStep>,
    #[serde(default)]
    pub status: PlanStatus,
    /// 0-100
    #[serde(default)]
    pub progress: f64,
    pub created_at: DateTime<Utc>,
}

impl CoordinationPlan {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            task_id: task_id.into(),
            agents: Vec::new(),
            workflow: Vec::new(),
            status: PlanStatus::Pending,
            progress: 0.0,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        if !step.agent_id.is_empty() && !self.agents.contains(&step.agent_id) {
            self.agents.push(step.agent_id.clone());
        }
        self.workflow.push(step);
        self
    }
}

/// Derived performance figures for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: AgentId,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// 0-1
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    /// 0-100, from the last reported resource usage
    pub resource_efficiency: f64,
    /// 0-100, from message volume in the trailing hour
    pub collaboration_score: f64,
    pub last_updated: DateTime<Utc>,
}

impl AgentMetrics {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            tasks_completed: 0,
            tasks_failed: 0,
            success_rate: 0.0,
            average_response_time_ms: 0.0,
            resource_efficiency: 100.0,
            collaboration_score: 0.0,
            last_updated: Utc::now(),
        }
    }
}

/// System-wide figures, computed on demand
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_agents: usize,
    /// Registered agents that are not offline
    pub active_agents: usize,
    pub busy_agents: usize,
    pub active_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Over results completed in the trailing hour
    pub average_response_time_ms: f64,
    pub messages_recorded: usize,
    pub uptime_ms: u64,
}

/// Everything the state manager keeps about one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_type: String,
    pub status: AgentStatus,
    /// Ids of pool tasks currently held by this agent
    pub task_ids: BTreeSet<TaskId>,
    pub results: VecDeque<TaskResult>,
    pub messages: VecDeque<Message>,
    pub metrics: AgentMetrics,
    pub registered_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(agent_type: impl Into<String>, status: AgentStatus) -> Self {
        Self {
            agent_type: agent_type.into(),
            metrics: AgentMetrics::new(status.id.clone()),
            status,
            task_ids: BTreeSet::new(),
            results: VecDeque::new(),
            messages: VecDeque::new(),
            registered_at: Utc::now(),
        }
    }
}

/// Serializable copy of the whole state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub taken_at: DateTime<Utc>,
    pub agents: BTreeMap<AgentId, AgentRecord>,
    pub tasks: BTreeMap<TaskId, Task>,
    pub message_history: Vec<Message>,
    pub result_history: Vec<TaskResult>,
    pub plans: BTreeMap<PlanId, CoordinationPlan>,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub system_metrics: SystemMetrics,
}

/// Notifications published by the state manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    AgentRegistered { agent_id: AgentId },
    AgentUnregistered { agent_id: AgentId },
    AgentStatusChanged(AgentStatus),
    TaskAdded { task_id: TaskId },
    TaskAssigned { task_id: TaskId, agent_id: AgentId },
    TaskProgress { task_id: TaskId, progress: f64 },
    TaskCompleted(TaskResult),
    PlanUpdated(CoordinationPlan),
    HistoryCleared,
}
