//! Task system types
//!
//! A [`Task`] is the unit of work handed to agents; a [`TaskResult`] is what
//! exactly one agent produced for it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{AgentId, TaskId, new_id};

/// Kind of work a task represents
///
/// The set is open: anything not listed is carried as [`TaskType::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    CodeGeneration,
    CodeReview,
    Refactoring,
    Analysis,
    Debugging,
    Documentation,
    Testing,
    General,
    Custom(String),
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::CodeGeneration => "code_generation",
            Self::CodeReview => "code_review",
            Self::Refactoring => "refactoring",
            Self::Analysis => "analysis",
            Self::Debugging => "debugging",
            Self::Documentation => "documentation",
            Self::Testing => "testing",
            Self::General => "general",
            Self::Custom(name) => name,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "code_generation" => Self::CodeGeneration,
            "code_review" => Self::CodeReview,
            "refactoring" => Self::Refactoring,
            "analysis" => Self::Analysis,
            "debugging" => Self::Debugging,
            "documentation" => Self::Documentation,
            "testing" => Self::Testing,
            "general" => Self::General,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<TaskType> for String {
    fn from(t: TaskType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Shape of output the caller expects back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Text,
    Json,
    Markdown,
    Code,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Markdown => "markdown",
            Self::Code => "code",
        }
    }
}

/// Inputs an agent may draw on while processing a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub working_directory: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    pub previous_output: Option<String>,
    pub user_input: Option<String>,
    pub language: Option<String>,
    pub deadline_hint: Option<DateTime<Utc>>,
}

/// What an agent must offer to be eligible for a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequirements {
    #[serde(default)]
    pub tools: Vec<String>,
    /// Any one of these capability names qualifies an agent
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub max_duration_ms: Option<u64>,
    pub output_format: Option<OutputFormat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub assigned_to: Option<AgentId>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// 0-100
    #[serde(default)]
    pub progress: f64,
}

impl Default for TaskMetadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            deadline: None,
            assigned_to: None,
            dependencies: Vec::new(),
            progress: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// A task for an agent to execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: TaskPriority,
    pub description: String,
    #[serde(default)]
    pub context: TaskContext,
    #[serde(default)]
    pub requirements: TaskRequirements,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub status: Option<TaskStatus>,
}

impl Task {
    /// Create a task with a fresh id
    pub fn new(task_type: TaskType, description: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            task_type,
            priority: TaskPriority::default(),
            description: description.into(),
            context: TaskContext::default(),
            requirements: TaskRequirements::default(),
            metadata: TaskMetadata::default(),
            status: None,
        }
    }

    pub fn builder(task_type: TaskType, description: impl Into<String>) -> TaskBuilder {
        TaskBuilder {
            task: Self::new(task_type, description),
        }
    }

    /// Milliseconds since the task was created, never negative
    pub fn age_ms(&self) -> u64 {
        (Utc::now() - self.metadata.created_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

/// Fluent construction for [`Task`]
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.task.id = id.into();
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.task.priority = priority;
        self
    }

    #[must_use]
    pub fn user_input(mut self, input: impl Into<String>) -> Self {
        self.task.context.user_input = Some(input.into());
        self
    }

    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<String>) -> Self {
        self.task.context.working_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn file(mut self, path: impl Into<String>) -> Self {
        self.task.context.files.push(path.into());
        self
    }

    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.task.context.language = Some(language.into());
        self
    }

    #[must_use]
    pub fn require_capability(mut self, capability: impl Into<String>) -> Self {
        self.task.requirements.capabilities.push(capability.into());
        self
    }

    #[must_use]
    pub fn require_tool(mut self, tool: impl Into<String>) -> Self {
        self.task.requirements.tools.push(tool.into());
        self
    }

    #[must_use]
    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.task.requirements.output_format = Some(format);
        self
    }

    #[must_use]
    pub fn max_duration_ms(mut self, ms: u64) -> Self {
        self.task.requirements.max_duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.task.metadata.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.task.metadata.dependencies.push(task_id.into());
        self
    }

    #[must_use]
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.task.metadata.created_at = at;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub resources_used: HashMap<String, f64>,
    #[serde(default)]
    pub output_size: usize,
    /// 0-1
    pub confidence: Option<f64>,
}

/// Outcome of one agent's attempt at one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: ResultMetadata,
}

impl TaskResult {
    pub fn success(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        output: serde_json::Value,
        duration_ms: u64,
    ) -> Self {
        let output_size = output.to_string().len();
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            success: true,
            output: Some(output),
            error: None,
            duration_ms,
            metadata: ResultMetadata {
                completed_at: Utc::now(),
                output_size,
                ..Default::default()
            },
        }
    }

    pub fn failure(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            success: false,
            output: None,
            error: Some(error.into()),
            duration_ms,
            metadata: ResultMetadata {
                completed_at: Utc::now(),
                ..Default::default()
            },
        }
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.metadata.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    #[must_use]
    pub fn with_resource(mut self, name: impl Into<String>, amount: f64) -> Self {
        self.metadata.resources_used.insert(name.into(), amount);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_type_known_names_round_trip() {
        assert_eq!(TaskType::parse("code_review"), TaskType::CodeReview);
        assert_eq!(TaskType::CodeReview.as_str(), "code_review");
    }

    #[test]
    fn task_type_unknown_is_custom() {
        let t = TaskType::parse("deployment");
        assert_eq!(t, TaskType::Custom("deployment".to_string()));
        assert_eq!(t.as_str(), "deployment");
    }

    #[test]
    fn task_type_serializes_as_plain_string() {
        let json = serde_json::to_string(&TaskType::Documentation).unwrap();
        assert_eq!(json, "\"documentation\"");

        let parsed: TaskType = serde_json::from_str("\"migration\"").unwrap();
        assert_eq!(parsed, TaskType::Custom("migration".to_string()));
    }

    #[test]
    fn builder_sets_fields() {
        let task = Task::builder(TaskType::Analysis, "look at this")
            .id("t1")
            .priority(TaskPriority::High)
            .user_input("fn main() {}")
            .require_capability("analysis")
            .output_format(OutputFormat::Markdown)
            .build();

        assert_eq!(task.id, "t1");
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.context.user_input.as_deref(), Some("fn main() {}"));
        assert_eq!(task.requirements.capabilities, vec!["analysis"]);
        assert_eq!(task.requirements.output_format, Some(OutputFormat::Markdown));
        assert!(task.status.is_none());
    }

    #[test]
    fn task_priority_orders_low_to_critical() {
        assert!(TaskPriority::Low < TaskPriority::Medium);
        assert!(TaskPriority::High < TaskPriority::Critical);
    }

    #[test]
    fn success_result_records_output_size() {
        let result = TaskResult::success("t1", "a1", json!({"k": "v"}), 10);
        assert!(result.success);
        assert_eq!(result.metadata.output_size, r#"{"k":"v"}"#.len());
        assert!(result.error.is_none());
    }

    #[test]
    fn failure_result_carries_error() {
        let result = TaskResult::failure("t1", "a1", "boom", 5);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert!(result.output.is_none());
    }

    #[test]
    fn confidence_is_clamped() {
        let result = TaskResult::success("t1", "a1", json!(null), 0).with_confidence(1.7);
        assert_eq!(result.metadata.confidence, Some(1.0));
    }
}
