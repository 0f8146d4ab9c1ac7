//! Built-in agents: local worker, coordinator and monitor
//!
//! The monitor learns about its peers from heartbeats and from the status
//! updates the spawner's health sweep sends it.
//!
//! None of these shell out to anything. They give a freshly started
//! control plane something to schedule onto, and they exercise every part
//! of the [`Agent`] contract.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tracing::debug;

use super::task::{Task, TaskResult, TaskType};
use super::traits::Agent;
use super::types::{AgentCapability, AgentConfig, AgentId, CapabilityCategory, duration_ms};
use crate::bus::{Message, MessageType};
use crate::error::AgentError;
use crate::state::{CoordinationPlan, WorkflowStep};

/// Agents that stop sending heartbeats for this long are reported stale
pub const DEFAULT_STALE_AFTER_SECS: i64 = 120;

/// Per-step timeout assigned by the coordinator
const PLAN_STEP_TIMEOUT_MS: u64 = 60_000;

/// Which built-in behavior an agent has
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinKind {
    Local,
    Coordinator,
    Monitor,
}

impl BuiltinKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Coordinator => "coordinator",
            Self::Monitor => "monitor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "coordinator" => Some(Self::Coordinator),
            "monitor" => Some(Self::Monitor),
            _ => None,
        }
    }

    pub fn all() -> [Self; 3] {
        [Self::Local, Self::Coordinator, Self::Monitor]
    }

    /// Capabilities an agent of this kind declares by default
    pub fn default_capabilities(&self) -> Vec<AgentCapability> {
        match self {
            Self::Local => vec![
                AgentCapability::new(
                    "code_generation",
                    "Produces code from a description",
                    CapabilityCategory::Generation,
                ),
                AgentCapability::new(
                    "code_review",
                    "Flags common problems in code",
                    CapabilityCategory::Review,
                ),
                AgentCapability::new(
                    "analysis",
                    "Summarizes the shape of an input",
                    CapabilityCategory::Analysis,
                ),
                AgentCapability::new(
                    "documentation",
                    "Drafts documentation sections",
                    CapabilityCategory::Documentation,
                ),
                AgentCapability::new(
                    "testing",
                    "Outlines test cases",
                    CapabilityCategory::Testing,
                ),
            ],
            Self::Coordinator => vec![AgentCapability::new(
                "coordination",
                "Breaks a task into a workflow plan",
                CapabilityCategory::Coordination,
            )],
            Self::Monitor => vec![AgentCapability::new(
                "monitoring",
                "Tracks agent heartbeats and status updates",
                CapabilityCategory::Monitoring,
            )],
        }
    }

    /// Config for an agent of this kind with its default capabilities
    pub fn default_config(&self, id: impl Into<String>) -> AgentConfig {
        let id = id.into();
        let mut config = AgentConfig::new(id.clone(), id);
        config.capabilities = self.default_capabilities();
        if *self == Self::Local {
            config.max_concurrent_tasks = 2;
        }
        config
    }
}

impl std::fmt::Display for BuiltinKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct Sighting {
    last_seen: DateTime<Utc>,
    last_status: Option<Value>,
    heartbeats: u64,
}

/// An agent whose behavior is one of the [`BuiltinKind`]s
pub struct BuiltinAgent {
    id: AgentId,
    kind: BuiltinKind,
    started_at: Instant,
    sightings: Mutex<HashMap<AgentId, Sighting>>,
    stale_after: Duration,
}

impl BuiltinAgent {
    pub fn new(id: impl Into<String>, kind: BuiltinKind) -> Self {
        Self {
            id: id.into(),
            kind,
            started_at: Instant::now(),
            sightings: Mutex::new(HashMap::new()),
            stale_after: Duration::seconds(DEFAULT_STALE_AFTER_SECS),
        }
    }

    #[must_use]
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn kind(&self) -> BuiltinKind {
        self.kind
    }

    fn local_output(&self, task: &Task) -> Value {
        let input = task.context.user_input.clone().unwrap_or_default();
        match task.task_type {
            TaskType::CodeGeneration | TaskType::Refactoring => {
                let code = if input.is_empty() {
                    format!("// {}", task.description)
                } else {
                    input
                };
                json!({
                    "code": code,
                    "language": task.context.language,
                })
            }
            TaskType::CodeReview => {
                let issues = review_issues(&input);
                let rating = 10_i64.saturating_sub(issues.len() as i64).max(1);
                json!({
                    "issues": issues,
                    "suggestions": [format!("Re-read the change against: {}", task.description)],
                    "rating": rating,
                })
            }
            TaskType::Analysis | TaskType::Debugging => {
                let lines = input.lines().count();
                let words = input.split_whitespace().count();
                json!({
                    "summary": format!("{}: {lines} lines, {words} words", task.description),
                    "findings": [
                        format!("input has {lines} lines"),
                        format!("input has {words} words"),
                    ],
                })
            }
            TaskType::Documentation => json!({
                "sections": [{
                    "title": task.description,
                    "content": input,
                }],
            }),
            TaskType::Testing => json!({
                "tests": [format!("test_{}", slug(&task.description))],
            }),
            _ => json!({
                "result": task.description,
                "input": input,
            }),
        }
    }

    fn plan_for(&self, task: &Task) -> CoordinationPlan {
        let actions: Vec<String> = task
            .description
            .split([';', '\n'])
            .flat_map(|part| part.split(" then "))
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();

        let mut plan = CoordinationPlan::new(task.id.clone());
        for (index, action) in actions.into_iter().enumerate() {
            plan = plan.with_step(WorkflowStep {
                agent_id: String::new(),
                action,
                depends_on: if index == 0 { vec![] } else { vec![index - 1] },
                timeout_ms: PLAN_STEP_TIMEOUT_MS,
            });
        }
        plan
    }

    fn monitor_report(&self) -> Value {
        let now = Utc::now();
        let sightings = self.sightings.lock().unwrap_or_else(PoisonError::into_inner);

        let mut stale: Vec<&AgentId> = sightings
            .iter()
            .filter(|(_, s)| now - s.last_seen > self.stale_after)
            .map(|(id, _)| id)
            .collect();
        stale.sort();

        let last_seen: serde_json::Map<String, Value> = sightings
            .iter()
            .map(|(id, s)| {
                (
                    id.clone(),
                    json!({
                        "last_seen": s.last_seen,
                        "heartbeats": s.heartbeats,
                        "last_status": s.last_status,
                    }),
                )
            })
            .collect();

        json!({
            "tracked_agents": sightings.len(),
            "stale_agents": stale,
            "agents": last_seen,
        })
    }

    fn record_sighting(&self, message: &Message) {
        let mut sightings = self.sightings.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = sightings
            .entry(message.from_agent.clone())
            .or_insert_with(|| Sighting {
                last_seen: message.timestamp,
                last_status: None,
                heartbeats: 0,
            });
        entry.last_seen = entry.last_seen.max(message.timestamp);
        match message.message_type {
            MessageType::Heartbeat => entry.heartbeats += 1,
            MessageType::StatusUpdate => entry.last_status = Some(message.data.clone()),
            _ => {}
        }
    }
}

#[async_trait]
impl Agent for BuiltinAgent {
    async fn process_task(&self, task: &Task) -> Result<TaskResult, AgentError> {
        let started = Instant::now();
        let (output, confidence) = match self.kind {
            BuiltinKind::Local => (self.local_output(task), 0.8),
            BuiltinKind::Coordinator => {
                let plan = self.plan_for(task);
                if plan.workflow.is_empty() {
                    return Err(AgentError::ExecutionFailed(
                        "task description has no actionable steps".to_string(),
                    ));
                }
                let plan = serde_json::to_value(&plan)
                    .map_err(|e| AgentError::ExecutionFailed(e.to_string()))?;
                (json!({ "plan": plan }), 0.9)
            }
            BuiltinKind::Monitor => (self.monitor_report(), 1.0),
        };

        Ok(TaskResult::success(
            &task.id,
            &self.id,
            output,
            duration_ms(started.elapsed()),
        )
        .with_confidence(confidence))
    }

    async fn handle_message(&self, message: &Message) -> Result<Option<Message>, AgentError> {
        match (self.kind, message.message_type) {
            (BuiltinKind::Coordinator, MessageType::Coordination) => {
                debug!(agent_id = %self.id, from = %message.from_agent, "Coordination request");
                Ok(Some(message.reply_to(
                    MessageType::Coordination,
                    self.id.clone(),
                    json!({
                        "acknowledged": true,
                        "coordinator": self.id,
                    }),
                )))
            }
            (BuiltinKind::Monitor, MessageType::Heartbeat | MessageType::StatusUpdate) => {
                self.record_sighting(message);
                Ok(None)
            }
            (_, MessageType::Heartbeat) if message.requires_response => {
                Ok(Some(message.reply_to(
                    MessageType::Heartbeat,
                    self.id.clone(),
                    json!({
                        "uptime_ms": duration_ms(self.started_at.elapsed()),
                    }),
                )))
            }
            _ => Ok(None),
        }
    }
}

/// Naive line-level review: `category: description` per finding
fn review_issues(code: &str) -> Vec<String> {
    let mut issues = Vec::new();
    for (index, line) in code.lines().enumerate() {
        let line_no = index + 1;
        if line.contains(".unwrap()") {
            issues.push(format!("reliability: unwrap on line {line_no}"));
        }
        if line.contains("TODO") || line.contains("FIXME") {
            issues.push(format!("maintenance: unfinished work on line {line_no}"));
        }
        if line.contains("unsafe") {
            issues.push(format!("security: unsafe block on line {line_no}"));
        }
        if line.chars().count() > 120 {
            issues.push(format!("style: long line {line_no}"));
        }
    }
    issues
}

fn slug(text: &str) -> String {
    let slug: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let slug = slug
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if slug.is_empty() { "task".to_string() } else { slug }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(task_type: TaskType, description: &str, input: &str) -> Task {
        Task::builder(task_type, description).user_input(input).build()
    }

    #[test]
    fn kind_parse_round_trips() {
        for kind in BuiltinKind::all() {
            assert_eq!(BuiltinKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(BuiltinKind::parse("gemini"), None);
    }

    #[test]
    fn default_config_declares_capabilities() {
        let config = BuiltinKind::Coordinator.default_config("coordinator-main");
        assert_eq!(config.id, "coordinator-main");
        assert!(config.satisfies(&["coordination".to_string()]));
        assert_eq!(BuiltinKind::Local.default_config("w").max_concurrent_tasks, 2);
    }

    #[tokio::test]
    async fn local_review_flags_issues() {
        let agent = BuiltinAgent::new("w1", BuiltinKind::Local);
        let t = task(
            TaskType::CodeReview,
            "review parser",
            "let x = y.unwrap();\n// TODO: handle errors",
        );

        let result = agent.process_task(&t).await.unwrap();
        let output = result.output.unwrap();
        let issues = output["issues"].as_array().unwrap();

        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0], "reliability: unwrap on line 1");
        assert_eq!(output["rating"], 8);
        assert_eq!(result.metadata.confidence, Some(0.8));
    }

    #[tokio::test]
    async fn local_generation_echoes_input() {
        let agent = BuiltinAgent::new("w1", BuiltinKind::Local);
        let t = task(TaskType::CodeGeneration, "add fn", "fn add() {}");
        let output = agent.process_task(&t).await.unwrap().output.unwrap();
        assert_eq!(output["code"], "fn add() {}");
    }

    #[tokio::test]
    async fn coordinator_splits_description_into_steps() {
        let agent = BuiltinAgent::new("c1", BuiltinKind::Coordinator);
        let t = task(TaskType::General, "analyze the code then write tests; document", "");

        let output = agent.process_task(&t).await.unwrap().output.unwrap();
        let plan: CoordinationPlan = serde_json::from_value(output["plan"].clone()).unwrap();

        let actions: Vec<_> = plan.workflow.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(actions, vec!["analyze the code", "write tests", "document"]);
        assert_eq!(plan.workflow[2].depends_on, vec![1]);
        assert_eq!(plan.task_id, t.id);
    }

    #[tokio::test]
    async fn coordinator_rejects_empty_description() {
        let agent = BuiltinAgent::new("c1", BuiltinKind::Coordinator);
        let t = task(TaskType::General, " ; ", "");
        assert!(matches!(
            agent.process_task(&t).await,
            Err(AgentError::ExecutionFailed(_))
        ));
    }

    #[tokio::test]
    async fn coordinator_acknowledges_coordination() {
        let agent = BuiltinAgent::new("coordinator", BuiltinKind::Coordinator);
        let msg = Message::new(MessageType::Coordination, "w1", "coordinator", json!({}));

        let reply = agent.handle_message(&msg).await.unwrap().unwrap();
        assert_eq!(reply.to_agent, "w1");
        assert_eq!(reply.data["acknowledged"], true);
    }

    #[tokio::test]
    async fn monitor_reports_stale_agents() {
        let agent = BuiltinAgent::new("monitor", BuiltinKind::Monitor)
            .with_stale_after(Duration::seconds(60));

        let old = Message::new(MessageType::Heartbeat, "w1", "monitor", json!({}))
            .with_timestamp(Utc::now() - Duration::minutes(5));
        let fresh = Message::new(
            MessageType::StatusUpdate,
            "w2",
            "monitor",
            json!({"state": "idle"}),
        );
        assert!(agent.handle_message(&old).await.unwrap().is_none());
        assert!(agent.handle_message(&fresh).await.unwrap().is_none());

        let t = task(TaskType::Custom("monitoring".to_string()), "report", "");
        let report = agent.process_task(&t).await.unwrap().output.unwrap();

        assert_eq!(report["tracked_agents"], 2);
        assert_eq!(report["stale_agents"], json!(["w1"]));
        assert_eq!(report["agents"]["w1"]["heartbeats"], 1);
        assert_eq!(report["agents"]["w2"]["last_status"]["state"], "idle");
    }

    #[tokio::test]
    async fn heartbeat_requiring_response_is_answered() {
        let agent = BuiltinAgent::new("w1", BuiltinKind::Local);
        let mut msg = Message::new(MessageType::Heartbeat, "monitor", "w1", json!({}));
        msg.requires_response = true;

        let reply = agent.handle_message(&msg).await.unwrap().unwrap();
        assert_eq!(reply.correlation_id.as_deref(), Some(msg.id.as_str()));
    }

    #[test]
    fn slug_normalizes_text() {
        assert_eq!(slug("Parse  the Config!"), "parse_the_config");
        assert_eq!(slug("???"), "task");
    }
}
