//! Inter-agent message bus
//!
//! - [`Message`] envelope and validation
//! - [`Route`]s with structural [`RouteCondition`]s, mapped to named handlers
//! - [`MessageBus`] with queueing, request/response and capped history

mod message;
mod message_bus;
mod routing;

pub use message::{BROADCAST, Message, MessageId, MessagePriority, MessageType};
pub use message_bus::{BusStats, HistoryFilter, MessageBus};
pub use routing::{
    COORDINATOR_AGENT, HandlerError, MessageHandler, Route, RouteCondition, RoutePattern,
    default_routes, handler,
};
