//! MessageBus: queueing, routing and request/response correlation

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message::{BROADCAST, Message, MessageId, MessageType};
use super::routing::{MessageHandler, Route, default_routes, handler};
use crate::capped::{evict_before, push_capped};
use crate::agent::duration_ms;
use crate::config::BusConfig;
use crate::error::BusError;
use crate::state::metrics::running_average;

/// Criteria for [`MessageBus::history`]; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryFilter {
    pub from_agent: Option<String>,
    pub to_agent: Option<String>,
    pub message_type: Option<MessageType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches
    pub limit: Option<usize>,
}

impl HistoryFilter {
    fn matches(&self, message: &Message) -> bool {
        self.from_agent
            .as_ref()
            .is_none_or(|from| message.from_agent == *from)
            && self
                .to_agent
                .as_ref()
                .is_none_or(|to| message.to_agent == *to)
            && self
                .message_type
                .is_none_or(|t| message.message_type == t)
            && self.since.is_none_or(|since| message.timestamp >= since)
            && self.until.is_none_or(|until| message.timestamp <= until)
    }
}

/// Live bus statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    pub total_messages: u64,
    pub messages_by_type: BTreeMap<String, u64>,
    /// Keyed by sender
    pub messages_by_agent: BTreeMap<String, u64>,
    /// Enqueue-to-processing latency
    pub average_latency_ms: f64,
    pub error_count: u64,
    /// Handler failures per processed message
    pub error_rate: f64,
    pub unrouted_messages: u64,
    pub response_timeouts: u64,
    /// Messages processed in the last minute
    pub throughput_per_minute: f64,
    pub queue_length: usize,
    pub pending_responses: usize,
}

#[derive(Debug, Default)]
struct StatsAccumulator {
    total: u64,
    by_type: BTreeMap<String, u64>,
    by_agent: BTreeMap<String, u64>,
    average_latency_ms: f64,
    errors: u64,
    unrouted: u64,
    timeouts: u64,
    recent: VecDeque<DateTime<Utc>>,
}

impl StatsAccumulator {
    fn record(&mut self, message: &Message, processed_at: DateTime<Utc>) {
        self.total += 1;
        *self
            .by_type
            .entry(message.message_type.as_str().to_string())
            .or_default() += 1;
        *self.by_agent.entry(message.from_agent.clone()).or_default() += 1;

        let latency = (processed_at - message.timestamp).num_milliseconds().max(0) as f64;
        self.average_latency_ms = running_average(self.average_latency_ms, self.total, latency);

        self.recent.push_back(processed_at);
        self.trim_recent(processed_at);
    }

    fn trim_recent(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::minutes(1);
        while self.recent.front().is_some_and(|t| *t < cutoff) {
            self.recent.pop_front();
        }
    }
}

/// Clears the draining flag even if processing unwinds
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Routes messages between agents
///
/// Messages are validated and queued by [`MessageBus::send_message`]; a
/// periodic drain (see [`MessageBus::start`]) appends each to the capped
/// history and runs every matching route's handler in ascending route
/// priority. A failing or panicking handler is logged and does not affect
/// the others.
pub struct MessageBus {
    config: BusConfig,
    queue: Mutex<VecDeque<Message>>,
    history: Mutex<VecDeque<Message>>,
    routes: RwLock<Vec<Route>>,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    pending: Mutex<HashMap<MessageId, oneshot::Sender<Message>>>,
    stats: Mutex<StatsAccumulator>,
    draining: AtomicBool,
    started: AtomicBool,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageBus {
    /// Create a bus with the default routing table and logging handlers
    pub fn new(config: BusConfig) -> Self {
        let routes = default_routes();
        let mut handlers: HashMap<String, MessageHandler> = HashMap::new();
        for route in &routes {
            handlers.insert(route.handler.clone(), logging_handler(route.handler.clone()));
        }

        Self {
            config,
            queue: Mutex::new(VecDeque::new()),
            history: Mutex::new(VecDeque::new()),
            routes: RwLock::new(routes),
            handlers: RwLock::new(handlers),
            pending: Mutex::new(HashMap::new()),
            stats: Mutex::new(StatsAccumulator::default()),
            draining: AtomicBool::new(false),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // ==================== Sending ====================

    /// Validate and enqueue a message
    pub fn send_message(&self, message: Message) -> Result<(), BusError> {
        message.validate()?;
        let mut queue = lock(&self.queue);
        if queue.len() >= self.config.max_queue_size {
            warn!(message_id = %message.id, "Message queue full");
            return Err(BusError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }
        debug!(
            message_id = %message.id,
            message_type = %message.message_type,
            from = %message.from_agent,
            to = %message.to_agent,
            "Message queued"
        );
        queue.push_back(message);
        Ok(())
    }

    /// Send `message` to every agent
    pub fn broadcast(&self, mut message: Message) -> Result<MessageId, BusError> {
        message.to_agent = BROADCAST.to_string();
        let id = message.id.clone();
        self.send_message(message)?;
        Ok(id)
    }

    /// Send and wait for the first message correlated to it
    ///
    /// On timeout the listener is removed, so a reply arriving later is
    /// routed like any other message and has no effect on this call.
    pub async fn send_message_with_response(
        &self,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        message.validate()?;
        let timeout_ms = duration_ms(timeout);
        message.requires_response = true;
        message.timeout_ms = Some(timeout_ms);
        let message_id = message.id.clone();

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(&message_id) {
                return Err(BusError::DuplicateRequest(message_id));
            }
            pending.insert(message_id.clone(), tx);
        }
        if let Err(e) = self.send_message(message) {
            lock(&self.pending).remove(&message_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::ResponseChannelClosed(message_id)),
            Err(_) => {
                lock(&self.pending).remove(&message_id);
                lock(&self.stats).timeouts += 1;
                warn!(message_id = %message_id, "Request timed out");
                Err(BusError::Timeout {
                    message_id,
                    timeout_ms,
                })
            }
        }
    }

    /// [`send_message_with_response`](Self::send_message_with_response)
    /// with the configured default timeout
    pub async fn request(&self, message: Message) -> Result<Message, BusError> {
        let timeout = Duration::from_millis(self.config.default_response_timeout_ms);
        self.send_message_with_response(message, timeout).await
    }

    /// Outstanding request/response listeners
    pub fn pending_responses(&self) -> usize {
        lock(&self.pending).len()
    }

    // ==================== Processing ====================

    /// Drain the queue, oldest first
    ///
    /// Returns how many messages were processed; zero if another drain is
    /// already running.
    pub async fn process_queue(&self) -> usize {
        if self.draining.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let _guard = DrainGuard(&self.draining);

        let batch: Vec<Message> = lock(&self.queue).drain(..).collect();
        let count = batch.len();
        for message in batch {
            self.process_message(message).await;
        }
        count
    }

    async fn process_message(&self, message: Message) {
        let processed_at = Utc::now();
        {
            let mut history = lock(&self.history);
            push_capped(&mut history, message.clone(), self.config.max_history, |m| {
                m.timestamp
            });
        }
        lock(&self.stats).record(&message, processed_at);

        if let Some(correlation_id) = &message.correlation_id {
            let listener = lock(&self.pending).remove(correlation_id);
            match listener {
                Some(tx) => {
                    let _ = tx.send(message.clone());
                }
                None => debug!(
                    message_id = %message.id,
                    correlation_id = %correlation_id,
                    "Unmatched response"
                ),
            }
        }

        let matched = self.matching_handlers(&message);
        if matched.is_empty() {
            lock(&self.stats).unrouted += 1;
            warn!(
                message_id = %message.id,
                message_type = %message.message_type,
                "No route for message"
            );
            return;
        }

        for (route_id, handler) in matched {
            let Some(handler) = handler else {
                warn!(route = %route_id, "Route has no registered handler");
                continue;
            };

            let invoked = std::panic::catch_unwind(AssertUnwindSafe(|| handler(message.clone())));
            let outcome = match invoked {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    lock(&self.stats).errors += 1;
                    warn!(route = %route_id, message_id = %message.id, error = %e, "Handler failed");
                }
                Err(_) => {
                    lock(&self.stats).errors += 1;
                    error!(route = %route_id, message_id = %message.id, "Handler panicked");
                }
            }
        }
    }

    /// Matching routes in ascending priority with their handlers resolved
    fn matching_handlers(&self, message: &Message) -> Vec<(String, Option<MessageHandler>)> {
        let mut routes: Vec<Route> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|route| route.matches(message))
            .cloned()
            .collect();
        routes.sort_by_key(|route| route.priority);

        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .into_iter()
            .map(|route| {
                let handler = handlers.get(&route.handler).cloned();
                (route.id, handler)
            })
            .collect()
    }

    // ==================== Routes and Handlers ====================

    /// Add a route, replacing any route with the same id
    pub fn add_route(&self, route: Route) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        routes.retain(|r| r.id != route.id);
        debug!(route = %route.id, priority = route.priority, "Route added");
        routes.push(route);
    }

    pub fn remove_route(&self, route_id: &str) -> Result<Route, BusError> {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let index = routes
            .iter()
            .position(|r| r.id == route_id)
            .ok_or_else(|| BusError::RouteNotFound(route_id.to_string()))?;
        Ok(routes.remove(index))
    }

    /// Current routes in ascending priority
    pub fn routes(&self) -> Vec<Route> {
        let mut routes = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        routes.sort_by_key(|r| r.priority);
        routes
    }

    /// Register (or replace) the handler routes refer to by `name`
    pub fn register_handler(&self, name: impl Into<String>, handler: MessageHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), handler);
    }

    pub fn unregister_handler(&self, name: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    // ==================== History and Stats ====================

    /// Messages matching `filter`, oldest first
    pub fn history(&self, filter: &HistoryFilter) -> Vec<Message> {
        let history = lock(&self.history);
        let mut matched: Vec<Message> = history
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched = matched.split_off(skip);
        }
        matched
    }

    /// Drop history entries older than the retention window
    pub fn evict_expired_history(&self) -> usize {
        let retention = chrono::Duration::milliseconds(
            i64::try_from(self.config.history_retention_ms).unwrap_or(i64::MAX),
        );
        let cutoff = Utc::now() - retention;
        let removed = {
            let mut history = lock(&self.history);
            evict_before(&mut history, cutoff, |m| m.timestamp)
        };
        if removed > 0 {
            debug!(removed, "Expired message history evicted");
        }
        removed
    }

    pub fn stats(&self) -> BusStats {
        let queue_length = lock(&self.queue).len();
        let pending_responses = self.pending_responses();
        let mut stats = lock(&self.stats);
        stats.trim_recent(Utc::now());

        BusStats {
            total_messages: stats.total,
            messages_by_type: stats.by_type.clone(),
            messages_by_agent: stats.by_agent.clone(),
            average_latency_ms: stats.average_latency_ms,
            error_count: stats.errors,
            error_rate: if stats.total == 0 {
                0.0
            } else {
                stats.errors as f64 / stats.total as f64
            },
            unrouted_messages: stats.unrouted,
            response_timeouts: stats.timeouts,
            throughput_per_minute: stats.recent.len() as f64,
            queue_length,
            pending_responses,
        }
    }

    // ==================== Lifecycle ====================

    /// Start the drain and history cleanup loops
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = lock(&self.handles);

        let bus = Arc::clone(self);
        let token = self.shutdown.clone();
        let period = Duration::from_millis(self.config.process_interval_ms.max(1));
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        bus.process_queue().await;
                    }
                }
            }
        }));

        let bus = Arc::clone(self);
        let token = self.shutdown.clone();
        let period = Duration::from_millis(self.config.cleanup_interval_ms.max(1));
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        bus.evict_expired_history();
                    }
                }
            }
        }));

        info!("Message bus started");
    }

    /// Stop the loops, flush what is queued and drop pending listeners
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Bus loop ended abnormally");
            }
        }

        let flushed = self.process_queue().await;
        let abandoned = {
            let mut pending = lock(&self.pending);
            let count = pending.len();
            pending.clear();
            count
        };
        info!(flushed, abandoned, "Message bus stopped");
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

fn logging_handler(name: String) -> MessageHandler {
    handler(move |message: Message| {
        let name = name.clone();
        async move {
            debug!(
                handler = %name,
                message_id = %message.id,
                from = %message.from_agent,
                to = %message.to_agent,
                "Routed message"
            );
            Ok(())
        }
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
