//! StateManager: the authoritative in-memory model of the system

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use chrono::{Duration, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::metrics::{collaboration_score, resource_efficiency, running_average};
use super::types::{
    AgentMetrics, AgentRecord, CoordinationPlan, PlanId, PlanStatus, StateEvent, StateSnapshot,
    SystemMetrics,
};
use crate::agent::{
    AgentId, AgentState, AgentStatus, Task, TaskId, TaskResult, TaskStatus, duration_ms,
};
use crate::bus::{BROADCAST, Message};
use crate::capped::push_capped;
use crate::config::StateConfig;
use crate::error::StateError;

/// Error text of results synthesized for tasks orphaned by unregistration
pub const SHUTDOWN_BEFORE_COMPLETION: &str = "agent shutdown before task completion";

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct SystemState {
    agents: HashMap<AgentId, AgentRecord>,
    tasks: HashMap<TaskId, Task>,
    messages: VecDeque<Message>,
    results: VecDeque<TaskResult>,
    plans: HashMap<PlanId, CoordinationPlan>,
    completed_tasks: u64,
    failed_tasks: u64,
}

/// Single source of truth for agents, tasks, results, messages and plans
///
/// Every operation takes the lock once, never across an `.await`, and
/// accessors hand out copies.
pub struct StateManager {
    config: StateConfig,
    inner: RwLock<SystemState>,
    events: broadcast::Sender<StateEvent>,
    started_at: Instant,
}

impl StateManager {
    pub fn new(config: StateConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            inner: RwLock::new(SystemState::default()),
            events,
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    /// Subscribe to state change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    // ==================== Agents ====================

    /// Create a fresh record for an agent, replacing any previous one
    pub fn register_agent(&self, agent_type: impl Into<String>, status: AgentStatus) {
        let agent_id = status.id.clone();
        let replaced = {
            let mut state = self.write();
            state
                .agents
                .insert(agent_id.clone(), AgentRecord::new(agent_type, status))
                .is_some()
        };
        if replaced {
            warn!(agent_id = %agent_id, "Replaced existing agent record");
        }
        debug!(agent_id = %agent_id, "Agent registered");
        self.emit(StateEvent::AgentRegistered { agent_id });
    }

    /// Store the latest status reported by an agent
    pub fn update_agent_status(&self, status: AgentStatus) -> Result<(), StateError> {
        {
            let mut state = self.write();
            let record = state
                .agents
                .get_mut(&status.id)
                .ok_or_else(|| StateError::AgentNotFound(status.id.clone()))?;
            record.status = status.clone();
        }
        self.emit(StateEvent::AgentStatusChanged(status));
        Ok(())
    }

    /// Remove an agent, failing every task it still holds
    ///
    /// Each open task gets exactly one synthesized failed result, which is
    /// returned, counted in the system totals and announced as
    /// [`StateEvent::TaskCompleted`].
    pub fn unregister_agent(&self, agent_id: &str) -> Result<Vec<TaskResult>, StateError> {
        let synthesized = {
            let mut state = self.write();
            let record = state
                .agents
                .remove(agent_id)
                .ok_or_else(|| StateError::AgentNotFound(agent_id.to_string()))?;

            let mut synthesized = Vec::with_capacity(record.task_ids.len());
            for task_id in &record.task_ids {
                let Some(task) = state.tasks.remove(task_id) else {
                    continue;
                };
                let result = TaskResult::failure(
                    task_id,
                    agent_id,
                    SHUTDOWN_BEFORE_COMPLETION,
                    task.age_ms(),
                );
                state.failed_tasks += 1;
                push_capped(
                    &mut state.results,
                    result.clone(),
                    self.config.max_result_history,
                    |r| r.metadata.completed_at,
                );
                synthesized.push(result);
            }
            synthesized
        };

        info!(
            agent_id = %agent_id,
            orphaned_tasks = synthesized.len(),
            "Agent unregistered"
        );
        for result in &synthesized {
            self.emit(StateEvent::TaskCompleted(result.clone()));
        }
        self.emit(StateEvent::AgentUnregistered {
            agent_id: agent_id.to_string(),
        });
        Ok(synthesized)
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentStatus> {
        self.read().agents.get(agent_id).map(|r| r.status.clone())
    }

    /// All registered agents, ordered by id
    pub fn agents(&self) -> Vec<AgentStatus> {
        let state = self.read();
        let mut agents: Vec<_> = state.agents.values().map(|r| r.status.clone()).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn agent_type(&self, agent_id: &str) -> Option<String> {
        self.read().agents.get(agent_id).map(|r| r.agent_type.clone())
    }

    // ==================== Tasks ====================

    /// Insert a task into the pool
    ///
    /// A task that names an agent in `metadata.assigned_to` is attached to
    /// that agent straight away.
    pub fn add_task(&self, mut task: Task) -> Result<(), StateError> {
        if task.id.trim().is_empty() {
            return Err(StateError::InvalidTask("task id is empty".to_string()));
        }

        let task_id = task.id.clone();
        let assigned_to = task.metadata.assigned_to.clone();
        {
            let mut state = self.write();
            if state.tasks.contains_key(&task_id) {
                return Err(StateError::InvalidTask(format!(
                    "task {task_id} is already in the pool"
                )));
            }
            match &assigned_to {
                Some(agent_id) => {
                    let record = state
                        .agents
                        .get_mut(agent_id)
                        .ok_or_else(|| StateError::AgentNotFound(agent_id.clone()))?;
                    record.task_ids.insert(task_id.clone());
                    task.status = Some(TaskStatus::Assigned);
                }
                None => {
                    task.status.get_or_insert(TaskStatus::Pending);
                }
            }
            state.tasks.insert(task_id.clone(), task);
        }

        self.emit(StateEvent::TaskAdded {
            task_id: task_id.clone(),
        });
        if let Some(agent_id) = assigned_to {
            self.emit(StateEvent::TaskAssigned { task_id, agent_id });
        }
        Ok(())
    }

    /// Attach a pooled task to an agent, detaching it from any previous one
    pub fn assign_task(&self, task_id: &str, agent_id: &str) -> Result<(), StateError> {
        {
            let mut state = self.write();
            if !state.agents.contains_key(agent_id) {
                return Err(StateError::AgentNotFound(agent_id.to_string()));
            }
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StateError::TaskNotFound(task_id.to_string()))?;
            let previous = task.metadata.assigned_to.replace(agent_id.to_string());
            task.status = Some(TaskStatus::Assigned);

            if let Some(previous) = previous
                && previous != agent_id
                && let Some(record) = state.agents.get_mut(&previous)
            {
                record.task_ids.remove(task_id);
            }
            if let Some(record) = state.agents.get_mut(agent_id) {
                record.task_ids.insert(task_id.to_string());
            }
        }
        self.emit(StateEvent::TaskAssigned {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    /// Set progress (clamped to 0-100) on the pooled task
    pub fn update_task_progress(&self, task_id: &str, progress: f64) -> Result<(), StateError> {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 100.0)
        };
        {
            let mut state = self.write();
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StateError::TaskNotFound(task_id.to_string()))?;
            task.metadata.progress = progress;
            task.status = Some(TaskStatus::InProgress);
        }
        self.emit(StateEvent::TaskProgress {
            task_id: task_id.to_string(),
            progress,
        });
        Ok(())
    }

    /// Record a result and retire its task from the pool
    pub fn complete_task(&self, result: TaskResult) -> Result<(), StateError> {
        {
            let mut state = self.write();
            let state = &mut *state;
            if !state.tasks.contains_key(&result.task_id) {
                return Err(StateError::TaskNotFound(result.task_id.clone()));
            }
            if !state.agents.contains_key(&result.agent_id) {
                return Err(StateError::AgentNotFound(result.agent_id.clone()));
            }

            if let Some(task) = state.tasks.remove(&result.task_id)
                && let Some(holder) = task.metadata.assigned_to
                && holder != result.agent_id
                && let Some(record) = state.agents.get_mut(&holder)
            {
                record.task_ids.remove(&result.task_id);
            }

            if result.success {
                state.completed_tasks += 1;
            } else {
                state.failed_tasks += 1;
            }
            push_capped(
                &mut state.results,
                result.clone(),
                self.config.max_result_history,
                |r| r.metadata.completed_at,
            );

            if let Some(record) = state.agents.get_mut(&result.agent_id) {
                record.task_ids.remove(&result.task_id);
                push_capped(
                    &mut record.results,
                    result.clone(),
                    self.config.max_results_per_agent,
                    |r| r.metadata.completed_at,
                );
                update_agent_metrics(record, &result);
            }
        }

        debug!(
            task_id = %result.task_id,
            agent_id = %result.agent_id,
            success = result.success,
            "Task completed"
        );
        self.emit(StateEvent::TaskCompleted(result));
        Ok(())
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.read().tasks.get(task_id).cloned()
    }

    /// Pooled tasks, oldest first
    pub fn active_tasks(&self) -> Vec<Task> {
        let state = self.read();
        let mut tasks: Vec<_> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.metadata.created_at.cmp(&b.metadata.created_at));
        tasks
    }

    /// Pooled tasks currently held by `agent_id`
    pub fn agent_tasks(&self, agent_id: &str) -> Vec<Task> {
        let state = self.read();
        state
            .agents
            .get(agent_id)
            .map(|record| {
                record
                    .task_ids
                    .iter()
                    .filter_map(|id| state.tasks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Results recorded for `agent_id`, oldest first
    pub fn task_results(&self, agent_id: &str) -> Vec<TaskResult> {
        self.read()
            .agents
            .get(agent_id)
            .map(|record| record.results.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Results across all agents, oldest first
    pub fn result_history(&self) -> Vec<TaskResult> {
        self.read().results.iter().cloned().collect()
    }

    // ==================== Messages ====================

    /// Append a message to the global history and to the records of its
    /// sender and recipient
    pub fn record_message(&self, message: Message) {
        let mut state = self.write();
        let state = &mut *state;

        let mut participants = vec![message.from_agent.as_str()];
        if message.to_agent != message.from_agent && message.to_agent != BROADCAST {
            participants.push(message.to_agent.as_str());
        }
        for agent_id in participants {
            if let Some(record) = state.agents.get_mut(agent_id) {
                push_capped(
                    &mut record.messages,
                    message.clone(),
                    self.config.max_messages_per_agent,
                    |m| m.timestamp,
                );
            }
        }

        push_capped(
            &mut state.messages,
            message,
            self.config.max_message_history,
            |m| m.timestamp,
        );
    }

    /// Global message history, oldest first; `limit` keeps the most recent
    pub fn message_history(&self, limit: Option<usize>) -> Vec<Message> {
        let state = self.read();
        let skip = limit
            .map(|limit| state.messages.len().saturating_sub(limit))
            .unwrap_or(0);
        state.messages.iter().skip(skip).cloned().collect()
    }

    /// Messages sent or received by `agent_id`, oldest first
    pub fn agent_messages(&self, agent_id: &str) -> Vec<Message> {
        self.read()
            .agents
            .get(agent_id)
            .map(|record| record.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Wipe message and result history; agents, tasks and plans stay
    pub fn clear_history(&self) {
        {
            let mut state = self.write();
            state.messages.clear();
            state.results.clear();
            for record in state.agents.values_mut() {
                record.messages.clear();
                record.results.clear();
            }
        }
        info!("State history cleared");
        self.emit(StateEvent::HistoryCleared);
    }

    // ==================== Metrics ====================

    pub fn system_metrics(&self) -> SystemMetrics {
        let state = self.read();
        self.compute_system_metrics(&state)
    }

    pub fn agent_metrics(&self, agent_id: &str) -> Option<AgentMetrics> {
        self.read().agents.get(agent_id).map(|r| r.metrics.clone())
    }

    fn compute_system_metrics(&self, state: &SystemState) -> SystemMetrics {
        let cutoff = Utc::now() - Duration::hours(1);
        let recent: Vec<u64> = state
            .results
            .iter()
            .filter(|r| r.metadata.completed_at >= cutoff)
            .map(|r| r.duration_ms)
            .collect();
        let average_response_time_ms = if recent.is_empty() {
            0.0
        } else {
            recent.iter().sum::<u64>() as f64 / recent.len() as f64
        };

        SystemMetrics {
            total_agents: state.agents.len(),
            active_agents: state
                .agents
                .values()
                .filter(|r| r.status.state != AgentState::Offline)
                .count(),
            busy_agents: state
                .agents
                .values()
                .filter(|r| r.status.state == AgentState::Busy)
                .count(),
            active_tasks: state.tasks.len(),
            completed_tasks: state.completed_tasks,
            failed_tasks: state.failed_tasks,
            average_response_time_ms,
            messages_recorded: state.messages.len(),
            uptime_ms: duration_ms(self.started_at.elapsed()),
        }
    }

    // ==================== Plans ====================

    /// Insert or replace a coordination plan
    pub fn upsert_plan(&self, plan: CoordinationPlan) {
        self.write().plans.insert(plan.id.clone(), plan.clone());
        self.emit(StateEvent::PlanUpdated(plan));
    }

    /// Update plan progress (clamped to 0-100) and optionally its status
    ///
    /// Reaching 100 without an explicit status marks the plan completed.
    pub fn update_plan_progress(
        &self,
        plan_id: &str,
        progress: f64,
        status: Option<PlanStatus>,
    ) -> Result<CoordinationPlan, StateError> {
        let plan = {
            let mut state = self.write();
            let plan = state
                .plans
                .get_mut(plan_id)
                .ok_or_else(|| StateError::PlanNotFound(plan_id.to_string()))?;
            plan.progress = if progress.is_nan() {
                plan.progress
            } else {
                progress.clamp(0.0, 100.0)
            };
            plan.status = match status {
                Some(status) => status,
                None if plan.progress >= 100.0 => PlanStatus::Completed,
                None if plan.status == PlanStatus::Pending && plan.progress > 0.0 => {
                    PlanStatus::Executing
                }
                None => plan.status,
            };
            plan.clone()
        };
        self.emit(StateEvent::PlanUpdated(plan.clone()));
        Ok(plan)
    }

    pub fn plan(&self, plan_id: &str) -> Option<CoordinationPlan> {
        self.read().plans.get(plan_id).cloned()
    }

    pub fn plans(&self) -> Vec<CoordinationPlan> {
        let state = self.read();
        let mut plans: Vec<_> = state.plans.values().cloned().collect();
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        plans
    }

    // ==================== Snapshots ====================

    pub fn export_snapshot(&self) -> StateSnapshot {
        let state = self.read();
        StateSnapshot {
            taken_at: Utc::now(),
            agents: state
                .agents
                .iter()
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect(),
            tasks: state
                .tasks
                .iter()
                .map(|(id, task)| (id.clone(), task.clone()))
                .collect(),
            message_history: state.messages.iter().cloned().collect(),
            result_history: state.results.iter().cloned().collect(),
            plans: state
                .plans
                .iter()
                .map(|(id, plan)| (id.clone(), plan.clone()))
                .collect::<BTreeMap<_, _>>(),
            completed_tasks: state.completed_tasks,
            failed_tasks: state.failed_tasks,
            system_metrics: self.compute_system_metrics(&state),
        }
    }

    pub fn export_json(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string_pretty(&self.export_snapshot())?)
    }

    /// Replace the whole state with a snapshot from a previous run
    ///
    /// No worker from that run is alive, so restored agents come back
    /// offline and holding nothing, and their pooled tasks return to
    /// pending.
    pub fn restore(&self, snapshot: StateSnapshot) {
        let mut restored = SystemState {
            completed_tasks: snapshot.completed_tasks,
            failed_tasks: snapshot.failed_tasks,
            ..Default::default()
        };

        for (id, mut record) in snapshot.agents {
            record.status.state = AgentState::Offline;
            record.status.current_tasks.clear();
            record.task_ids.clear();
            restored.agents.insert(id, record);
        }
        for (id, mut task) in snapshot.tasks {
            task.metadata.assigned_to = None;
            task.status = Some(TaskStatus::Pending);
            restored.tasks.insert(id, task);
        }
        for message in snapshot.message_history {
            push_capped(
                &mut restored.messages,
                message,
                self.config.max_message_history,
                |m| m.timestamp,
            );
        }
        for result in snapshot.result_history {
            push_capped(
                &mut restored.results,
                result,
                self.config.max_result_history,
                |r| r.metadata.completed_at,
            );
        }
        restored.plans = snapshot.plans.into_iter().collect();

        info!(
            agents = restored.agents.len(),
            tasks = restored.tasks.len(),
            "State restored from snapshot"
        );
        *self.write() = restored;
    }

    fn emit(&self, event: StateEvent) {
        let _ = self.events.send(event);
    }

    fn read(&self) -> RwLockReadGuard<'_, SystemState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SystemState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new(StateConfig::default())
    }
}

fn update_agent_metrics(record: &mut AgentRecord, result: &TaskResult) {
    let now = Utc::now();
    let cutoff = now - Duration::hours(1);
    let recent_messages = record
        .messages
        .iter()
        .filter(|m| m.timestamp >= cutoff)
        .count();
    let efficiency = resource_efficiency(&record.status.resource_usage);

    let metrics = &mut record.metrics;
    if result.success {
        metrics.tasks_completed += 1;
    } else {
        metrics.tasks_failed += 1;
    }
    let total = metrics.tasks_completed + metrics.tasks_failed;
    metrics.success_rate = metrics.tasks_completed as f64 / total as f64;
    metrics.average_response_time_ms = running_average(
        metrics.average_response_time_ms,
        total,
        result.duration_ms as f64,
    );
    metrics.resource_efficiency = efficiency;
    metrics.collaboration_score = collaboration_score(recent_messages);
    metrics.last_updated = now;
}
