//! Routing rules and handler types

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::message::{Message, MessagePriority, MessageType};

/// Error type handlers may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Async message handler registered under a name
///
/// Uses a boxed future so handlers can be stored as trait objects.
pub type MessageHandler =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Which message types a route applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "message_type")]
pub enum RoutePattern {
    Type(MessageType),
    /// Every message type
    Any,
}

impl RoutePattern {
    pub fn matches(&self, message_type: MessageType) -> bool {
        match self {
            Self::Type(t) => *t == message_type,
            Self::Any => true,
        }
    }
}

/// Structural condition a message must satisfy for a route to fire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "field", content = "value")]
pub enum RouteCondition {
    ToAgent(String),
    FromAgent(String),
    Priority(MessagePriority),
    RequiresResponse(bool),
}

impl RouteCondition {
    pub fn holds(&self, message: &Message) -> bool {
        match self {
            Self::ToAgent(id) => message.to_agent == *id,
            Self::FromAgent(id) => message.from_agent == *id,
            Self::Priority(priority) => message.priority == *priority,
            Self::RequiresResponse(required) => message.requires_response == *required,
        }
    }
}

/// A routing rule: pattern plus conditions, mapped to a named handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub pattern: RoutePattern,
    #[serde(default)]
    pub conditions: Vec<RouteCondition>,
    /// Lower runs first
    pub priority: u32,
    pub handler: String,
}

impl Route {
    pub fn new(
        id: impl Into<String>,
        pattern: RoutePattern,
        priority: u32,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            pattern,
            conditions: Vec::new(),
            priority,
            handler: handler.into(),
        }
    }

    #[must_use]
    pub fn when(mut self, condition: RouteCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.pattern.matches(message.message_type)
            && self.conditions.iter().all(|c| c.holds(message))
    }
}

/// Name of the agent coordination messages are routed to by default
pub const COORDINATOR_AGENT: &str = "coordinator-main";

/// Baseline routing table
pub fn default_routes() -> Vec<Route> {
    vec![
        Route::new(
            "urgent_error",
            RoutePattern::Type(MessageType::Error),
            0,
            "urgent_error",
        )
        .when(RouteCondition::Priority(MessagePriority::Urgent)),
        Route::new(
            "task_assignment",
            RoutePattern::Type(MessageType::TaskAssignment),
            1,
            "task_assignment",
        ),
        Route::new(
            "coordination",
            RoutePattern::Type(MessageType::Coordination),
            2,
            "coordination",
        )
        .when(RouteCondition::ToAgent(COORDINATOR_AGENT.to_string())),
        Route::new(
            "status_update",
            RoutePattern::Type(MessageType::StatusUpdate),
            3,
            "status_update",
        ),
        Route::new(
            "heartbeat",
            RoutePattern::Type(MessageType::Heartbeat),
            5,
            "heartbeat",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(message_type: MessageType, to: &str) -> Message {
        Message::new(message_type, "a1", to, json!({}))
    }

    #[test]
    fn pattern_matches_type_or_any() {
        assert!(RoutePattern::Type(MessageType::Heartbeat).matches(MessageType::Heartbeat));
        assert!(!RoutePattern::Type(MessageType::Heartbeat).matches(MessageType::Error));
        assert!(RoutePattern::Any.matches(MessageType::Error));
    }

    #[test]
    fn conditions_must_all_hold() {
        let route = Route::new("r", RoutePattern::Any, 1, "h")
            .when(RouteCondition::ToAgent("a2".to_string()))
            .when(RouteCondition::RequiresResponse(true));

        let mut m = msg(MessageType::Coordination, "a2");
        assert!(!route.matches(&m));
        m.requires_response = true;
        assert!(route.matches(&m));
        m.to_agent = "a3".to_string();
        assert!(!route.matches(&m));
    }

    #[test]
    fn default_coordination_route_targets_coordinator() {
        let routes = default_routes();
        let coordination = routes.iter().find(|r| r.id == "coordination").unwrap();

        assert!(coordination.matches(&msg(MessageType::Coordination, COORDINATOR_AGENT)));
        assert!(!coordination.matches(&msg(MessageType::Coordination, "a2")));
    }

    #[test]
    fn default_urgent_route_requires_urgent_priority() {
        let routes = default_routes();
        let urgent = routes.iter().find(|r| r.id == "urgent_error").unwrap();

        let plain = msg(MessageType::Error, "a2");
        assert!(!urgent.matches(&plain));
        assert!(urgent.matches(&plain.with_priority(MessagePriority::Urgent)));
    }

    #[test]
    fn default_routes_has_five_rules() {
        assert_eq!(default_routes().len(), 5);
    }

    #[test]
    fn route_serializes_pattern() {
        let route = Route::new("r", RoutePattern::Type(MessageType::Heartbeat), 5, "h");
        let value = serde_json::to_value(&route).unwrap();
        assert_eq!(value["pattern"]["kind"], "type");
        assert_eq!(value["pattern"]["message_type"], "heartbeat");
    }
}
