//! Message envelope exchanged between agents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{AgentId, new_id};
use crate::error::BusError;

/// Identifier of a message
pub type MessageId = String;

/// Destination sentinel addressing every agent
pub const BROADCAST: &str = "broadcast";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssignment,
    TaskResult,
    StatusUpdate,
    Coordination,
    Error,
    Heartbeat,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskAssignment => "task_assignment",
            Self::TaskResult => "task_result",
            Self::StatusUpdate => "status_update",
            Self::Coordination => "coordination",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// An asynchronous message between agents
///
/// `id`, `message_type`, `from_agent`, `to_agent` and `timestamp` are
/// mandatory; see [`Message::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub message_type: MessageType,
    pub from_agent: AgentId,
    /// Recipient id or [`BROADCAST`]
    pub to_agent: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default)]
    pub data: serde_json::Value,
    pub correlation_id: Option<MessageId>,
    #[serde(default)]
    pub requires_response: bool,
    pub timeout_ms: Option<u64>,
}

impl Message {
    pub fn new(
        message_type: MessageType,
        from: impl Into<String>,
        to: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: new_id(),
            message_type,
            from_agent: from.into(),
            to_agent: to.into(),
            timestamp: Utc::now(),
            priority: MessagePriority::default(),
            data,
            correlation_id: None,
            requires_response: false,
            timeout_ms: None,
        }
    }

    /// Message addressed to every agent
    pub fn broadcast(
        message_type: MessageType,
        from: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self::new(message_type, from, BROADCAST, data)
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Build a reply from `from` back to the original sender
    ///
    /// The reply is correlated to this message's id.
    pub fn reply_to(
        &self,
        message_type: MessageType,
        from: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self::new(message_type, from, self.from_agent.clone(), data)
            .with_priority(self.priority)
            .with_correlation(self.id.clone())
    }

    pub fn is_broadcast(&self) -> bool {
        self.to_agent == BROADCAST
    }

    /// Check the mandatory fields
    pub fn validate(&self) -> Result<(), BusError> {
        if self.id.trim().is_empty() {
            return Err(BusError::InvalidMessage("missing id".to_string()));
        }
        if self.from_agent.trim().is_empty() {
            return Err(BusError::InvalidMessage("missing from".to_string()));
        }
        if self.to_agent.trim().is_empty() {
            return Err(BusError::InvalidMessage("missing to".to_string()));
        }
        Ok(())
    }

    /// Parse and validate a message received as JSON
    pub fn from_json(value: serde_json::Value) -> Result<Self, BusError> {
        let message: Self =
            serde_json::from_value(value).map_err(|e| BusError::InvalidMessage(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_message_has_defaults() {
        let msg = Message::new(MessageType::Heartbeat, "a1", "monitor", json!({}));
        assert!(!msg.id.is_empty());
        assert_eq!(msg.priority, MessagePriority::Medium);
        assert!(!msg.requires_response);
        assert!(msg.correlation_id.is_none());
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn broadcast_uses_sentinel() {
        let msg = Message::broadcast(MessageType::StatusUpdate, "a1", json!({}));
        assert_eq!(msg.to_agent, BROADCAST);
        assert!(msg.is_broadcast());
    }

    #[test]
    fn reply_is_correlated_to_original() {
        let original = Message::new(MessageType::Coordination, "a1", "coordinator", json!({}))
            .with_priority(MessagePriority::High);
        let reply = original.reply_to(MessageType::Coordination, "coordinator", json!({"ok": true}));

        assert_eq!(reply.to_agent, "a1");
        assert_eq!(reply.from_agent, "coordinator");
        assert_eq!(reply.correlation_id.as_deref(), Some(original.id.as_str()));
        assert_eq!(reply.priority, MessagePriority::High);
    }

    #[test]
    fn validate_rejects_empty_recipient() {
        let msg = Message::new(MessageType::Heartbeat, "a1", "", json!({}));
        let err = msg.validate().unwrap_err();
        assert!(matches!(err, BusError::InvalidMessage(_)));
        assert!(err.to_string().contains("missing to"));
    }

    #[test]
    fn from_json_rejects_missing_recipient() {
        let value = json!({
            "id": "m1",
            "message_type": "heartbeat",
            "from_agent": "a1",
            "timestamp": "2026-01-01T00:00:00Z"
        });
        assert!(matches!(
            Message::from_json(value),
            Err(BusError::InvalidMessage(_))
        ));
    }

    #[test]
    fn from_json_accepts_complete_message() {
        let value = json!({
            "id": "m1",
            "message_type": "heartbeat",
            "from_agent": "a1",
            "to_agent": "monitor",
            "timestamp": "2026-01-01T00:00:00Z"
        });
        let msg = Message::from_json(value).unwrap();
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.message_type, MessageType::Heartbeat);
        assert_eq!(msg.data, serde_json::Value::Null);
    }

    #[test]
    fn message_type_json_format() {
        assert_eq!(
            serde_json::to_string(&MessageType::TaskAssignment).unwrap(),
            "\"task_assignment\""
        );
    }
}
