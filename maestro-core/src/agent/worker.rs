//! Worker: the bookkeeping shell around a concrete [`Agent`]
//!
//! A worker owns everything the orchestration layer relies on: the status
//! snapshot, the concurrency cap, the FIFO inbox, the periodic health tick
//! and the event channel. Concrete agents only implement
//! [`Agent::process_task`].

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::task::{Task, TaskResult};
use super::traits::Agent;
use super::types::{AgentConfig, AgentId, AgentState, AgentStatus, ResourceUsage, duration_ms};
use crate::bus::{Message, MessageType};
use crate::error::AgentError;

/// Memory usage above this costs 20 health points
pub const MEMORY_THRESHOLD_MB: f64 = 1024.0;

/// CPU usage above this costs 15 health points
pub const CPU_THRESHOLD_PERCENT: f64 = 80.0;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    StatusChanged(AgentStatus),
    /// Outgoing message produced by the agent (replies, error notices)
    Message(Message),
    TaskCompleted(TaskResult),
    Error { agent_id: AgentId, message: String },
}

/// Health score for one tick, clamped to 0-100
pub fn compute_health_score(
    usage: &ResourceUsage,
    failure_rate: f64,
    active_tasks: usize,
    max_concurrent_tasks: usize,
) -> f64 {
    let mut score = 100.0;
    if usage.memory_mb > MEMORY_THRESHOLD_MB {
        score -= 20.0;
    }
    if usage.cpu_percent > CPU_THRESHOLD_PERCENT {
        score -= 15.0;
    }
    if failure_rate.is_finite() {
        score -= failure_rate.max(0.0) * 30.0;
    }
    if active_tasks > max_concurrent_tasks {
        score -= 25.0;
    }
    f64::clamp(score, 0.0, 100.0)
}

/// A running agent with its status, inbox and health loop
pub struct Worker {
    config: AgentConfig,
    agent_type: String,
    agent: Arc<dyn Agent>,
    status: Mutex<AgentStatus>,
    started_at: Instant,
    events: broadcast::Sender<AgentEvent>,
    inbox_tx: mpsc::UnboundedSender<Message>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    initialized: AtomicBool,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(config: AgentConfig, agent_type: impl Into<String>, agent: Arc<dyn Agent>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            status: Mutex::new(AgentStatus::new(config.id.clone())),
            config,
            agent_type: agent_type.into(),
            agent,
            started_at: Instant::now(),
            events,
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            initialized: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Copy of the current status
    pub fn status(&self) -> AgentStatus {
        let mut status = self.lock_status().clone();
        status.uptime_ms = self.uptime_ms();
        status
    }

    pub fn state(&self) -> AgentState {
        self.lock_status().state
    }

    pub fn active_task_count(&self) -> usize {
        self.lock_status().current_tasks.len()
    }

    /// Slots left before the concurrency cap
    pub fn free_capacity(&self) -> usize {
        self.config
            .max_concurrent_tasks
            .saturating_sub(self.active_task_count())
    }

    /// Subscribe to this worker's events
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Initialize the agent and start the inbox and health loops
    ///
    /// Calling this again after a successful initialization is a no-op.
    #[instrument(name = "agent::initialize", skip(self), fields(agent_id = %self.config.id))]
    pub async fn initialize(self: &Arc<Self>) -> Result<(), AgentError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AgentError::Offline(self.config.id.clone()));
        }
        if self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        if let Err(e) = self.agent.initialize().await {
            self.initialized.store(false, Ordering::SeqCst);
            warn!(error = %e, "Agent initialization failed");
            self.update_status(|status| {
                if status.state != AgentState::Offline {
                    status.state = AgentState::Error;
                }
            });
            let _ = self.events.send(AgentEvent::Error {
                agent_id: self.config.id.clone(),
                message: e.to_string(),
            });
            return Err(e);
        }

        self.update_status(|status| {
            if status.state == AgentState::Initializing || status.state == AgentState::Error {
                status.state = AgentState::Idle;
            }
            status.last_activity = Utc::now();
        });
        self.start_loops();
        info!("Agent initialized");
        Ok(())
    }

    fn start_loops(self: &Arc<Self>) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);

        let receiver = self
            .inbox_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rx) = receiver {
            handles.push(tokio::spawn(run_inbox(
                Arc::downgrade(self),
                rx,
                self.shutdown.clone(),
            )));
        }

        let period = Duration::from_millis(self.config.health_check_interval_ms.max(1));
        handles.push(tokio::spawn(run_health(
            Arc::downgrade(self),
            period,
            self.shutdown.clone(),
        )));
    }

    /// Reserve a slot for `task`
    ///
    /// The capacity check and the insertion happen under one lock, so two
    /// racing callers can never both take the last slot. Rejections leave
    /// the status untouched.
    pub fn accept_task(&self, task: &Task) -> Result<(), AgentError> {
        let snapshot = {
            let mut status = self.lock_status();
            if status.state == AgentState::Offline {
                return Err(AgentError::Offline(self.config.id.clone()));
            }
            if status.current_tasks.len() >= self.config.max_concurrent_tasks {
                return Err(AgentError::AtCapacity {
                    agent_id: self.config.id.clone(),
                    max: self.config.max_concurrent_tasks,
                });
            }
            if !self.config.satisfies(&task.requirements.capabilities) {
                return Err(AgentError::CapabilityMismatch {
                    agent_id: self.config.id.clone(),
                    required: task.requirements.capabilities.clone(),
                });
            }
            if status.current_tasks.contains(&task.id) {
                return Err(AgentError::DuplicateTask(task.id.clone()));
            }

            status.current_tasks.insert(task.id.clone());
            status.state = AgentState::Busy;
            status.last_activity = Utc::now();
            status.uptime_ms = self.uptime_ms();
            status.clone()
        };
        let _ = self.events.send(AgentEvent::StatusChanged(snapshot));
        Ok(())
    }

    /// Run a task previously reserved with [`Worker::accept_task`]
    ///
    /// Never fails: an agent error, or shutdown while the task is running,
    /// becomes a failed [`TaskResult`].
    pub async fn execute(&self, task: Task) -> TaskResult {
        let started = Instant::now();
        let outcome = tokio::select! {
            result = self.agent.process_task(&task) => result,
            _ = self.shutdown.cancelled() => Err(AgentError::Aborted(task.id.clone())),
        };
        let duration_ms = duration_ms(started.elapsed());

        let (result, uncaught) = match outcome {
            Ok(mut result) => {
                result.task_id = task.id.clone();
                result.agent_id = self.config.id.clone();
                (result, false)
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Task processing failed");
                (
                    TaskResult::failure(&task.id, &self.config.id, e.to_string(), duration_ms),
                    true,
                )
            }
        };

        self.update_status(|status| {
            status.current_tasks.remove(&task.id);
            if result.success {
                status.completed_tasks += 1;
            } else {
                status.failed_tasks += 1;
            }
            if status.state != AgentState::Offline {
                status.state = if !status.current_tasks.is_empty() {
                    AgentState::Busy
                } else if uncaught {
                    AgentState::Error
                } else {
                    AgentState::Idle
                };
            }
            status.last_activity = Utc::now();
        });

        debug!(task_id = %task.id, success = result.success, duration_ms, "Task finished");
        let _ = self.events.send(AgentEvent::TaskCompleted(result.clone()));
        result
    }

    /// Accept and run a task
    #[instrument(name = "agent::assign", skip(self, task), fields(agent_id = %self.config.id, task_id = %task.id))]
    pub async fn assign_task(&self, task: Task) -> Result<TaskResult, AgentError> {
        self.accept_task(&task)?;
        Ok(self.execute(task).await)
    }

    /// Queue a message on the inbox
    pub fn deliver(&self, message: Message) -> Result<(), AgentError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AgentError::Offline(self.config.id.clone()));
        }
        self.inbox_tx
            .send(message)
            .map_err(|e| AgentError::MessageFailed(e.to_string()))
    }

    /// Sample resource usage and recompute the health score
    pub fn refresh_health(&self) -> f64 {
        let usage = self.agent.resource_usage();
        let max = self.config.max_concurrent_tasks;
        self.update_status(|status| {
            status.resource_usage = usage;
            status.health_score = compute_health_score(
                &usage,
                status.failure_rate(),
                status.current_tasks.len(),
                max,
            );
        })
        .health_score
    }

    /// Stop the loops, abandon in-flight work and go offline
    ///
    /// Idempotent. The agent's own shutdown error is returned after the
    /// worker is already offline.
    #[instrument(name = "agent::shutdown", skip(self), fields(agent_id = %self.config.id))]
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();

        let agent_result = self.agent.shutdown().await;
        if let Err(e) = &agent_result {
            warn!(error = %e, "Agent shutdown reported an error");
        }

        self.update_status(|status| {
            status.state = AgentState::Offline;
        });
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("Agent offline");
        agent_result
    }

    async fn handle_inbox_message(&self, message: Message) {
        debug!(message_id = %message.id, message_type = %message.message_type, "Inbox message");
        self.update_status(|status| status.last_activity = Utc::now());

        let outcome = AssertUnwindSafe(self.agent.handle_message(&message))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(AgentError::MessageFailed("handler panicked".to_string())));

        match outcome {
            Ok(Some(reply)) => {
                let _ = self.events.send(AgentEvent::Message(reply));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Message handling failed");
                let notice = message.reply_to(
                    MessageType::Error,
                    self.config.id.clone(),
                    json!({
                        "error": e.to_string(),
                        "original_message_id": message.id,
                    }),
                );
                let _ = self.events.send(AgentEvent::Message(notice));
            }
        }
    }

    fn update_status(&self, f: impl FnOnce(&mut AgentStatus)) -> AgentStatus {
        let snapshot = {
            let mut status = self.lock_status();
            f(&mut status);
            status.uptime_ms = self.uptime_ms();
            status.clone()
        };
        let _ = self.events.send(AgentEvent::StatusChanged(snapshot.clone()));
        snapshot
    }

    fn lock_status(&self) -> MutexGuard<'_, AgentStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn uptime_ms(&self) -> u64 {
        duration_ms(self.started_at.elapsed())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.config.id)
            .field("agent_type", &self.agent_type)
            .field("state", &self.state())
            .finish()
    }
}

async fn run_inbox(
    worker: Weak<Worker>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let Some(worker) = worker.upgrade() else {
            break;
        };
        worker.handle_inbox_message(message).await;
    }
}

async fn run_health(worker: Weak<Worker>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    // first tick fires immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(worker) = worker.upgrade() else {
                    break;
                };
                let score = worker.refresh_health();
                debug!(agent_id = %worker.id(), score, "Health tick");
            }
        }
    }
}
