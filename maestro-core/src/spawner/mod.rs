//! Agent spawner
//!
//! Creates, destroys and restarts [`Worker`]s by type under a global
//! instance cap. Each worker's events are relayed into the
//! [`StateManager`], the [`MessageBus`] and the spawner's own event
//! channel. Two background loops drain the deferred-spawn queue and sweep
//! instance health.

mod instance;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{
    AgentConfig, AgentEvent, AgentFactory, AgentId, CapabilityCategory, Task, TaskResult, Worker,
    new_id,
};
use crate::bus::{Message, MessageBus, MessageType};
use crate::config::SpawnerConfig;
use crate::error::{SpawnerError, StateError};
use crate::state::StateManager;

use instance::AgentInstance;
pub use instance::{
    InstanceHealth, InstanceInfo, LOW_AGENT_HEALTH, SpawnConfig, SpawnerEvent, SpawnerStats,
    sweep_score,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

type InstanceMap = RwLock<HashMap<AgentId, AgentInstance>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AgentSpawner {
    config: SpawnerConfig,
    factory: Arc<dyn AgentFactory>,
    state: Arc<StateManager>,
    bus: Arc<MessageBus>,
    instances: Arc<InstanceMap>,
    /// Deferred spawns, oldest first
    queue: Mutex<VecDeque<SpawnConfig>>,
    events: broadcast::Sender<SpawnerEvent>,
    started: AtomicBool,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentSpawner {
    pub fn new(
        config: SpawnerConfig,
        factory: Arc<dyn AgentFactory>,
        state: Arc<StateManager>,
        bus: Arc<MessageBus>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            factory,
            state,
            bus,
            instances: Arc::new(RwLock::new(HashMap::new())),
            queue: Mutex::new(VecDeque::new()),
            events,
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SpawnerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SpawnerEvent> {
        self.events.subscribe()
    }

    // ==================== Lifecycle ====================

    /// Create, register and (unless opted out) initialize an instance
    ///
    /// Fails without leaving a record when the cap is reached, the id is
    /// taken, the type is unknown or initialization fails.
    #[instrument(name = "spawner::spawn", skip(self, spawn), fields(agent_type = %spawn.agent_type))]
    pub async fn spawn_agent(&self, spawn: SpawnConfig) -> Result<AgentId, SpawnerError> {
        let config = self.resolve_config(&spawn);
        let agent_id = config.id.clone();

        let worker = {
            let mut instances = self.instances.write().await;
            if instances.len() >= self.config.max_instances {
                return Err(SpawnerError::CapacityReached {
                    max: self.config.max_instances,
                });
            }
            if instances.contains_key(&agent_id) {
                return Err(SpawnerError::DuplicateInstance(agent_id));
            }

            let agent = self.factory.create(&spawn.agent_type, &config)?;
            let worker = Worker::new(config, spawn.agent_type.clone(), agent);
            self.state
                .register_agent(spawn.agent_type.clone(), worker.status());

            let now = Utc::now();
            instances.insert(
                agent_id.clone(),
                AgentInstance {
                    id: agent_id.clone(),
                    agent_type: spawn.agent_type.clone(),
                    last_status: worker.status(),
                    relay: self.spawn_relay(&worker),
                    worker: Arc::clone(&worker),
                    spawned_at: now,
                    last_activity: now,
                    dependencies: spawn.dependencies.clone(),
                    health: InstanceHealth::fresh(),
                },
            );
            worker
        };

        let _ = self.events.send(SpawnerEvent::Spawned {
            agent_id: agent_id.clone(),
            agent_type: spawn.agent_type.clone(),
        });

        if spawn.initialize {
            if let Err(e) = worker.initialize().await {
                error!(agent_id = %agent_id, error = %e, "Instance failed to initialize");
                if let Err(cleanup) = self.destroy_agent(&agent_id).await {
                    warn!(agent_id = %agent_id, error = %cleanup, "Cleanup after failed spawn");
                }
                return Err(e.into());
            }
            self.sync_instance(&agent_id).await;
        }

        info!(agent_id = %agent_id, "Instance spawned");
        Ok(agent_id)
    }

    /// Shut an instance down and fail its open tasks
    ///
    /// Returns the synthesized failures, one per task the agent held.
    #[instrument(name = "spawner::destroy", skip(self))]
    pub async fn destroy_agent(&self, agent_id: &str) -> Result<Vec<TaskResult>, SpawnerError> {
        let instance = self
            .instances
            .write()
            .await
            .remove(agent_id)
            .ok_or_else(|| SpawnerError::NotFound(agent_id.to_string()))?;

        // Unregister first: aborted executions then find their task already settled
        let failed = match self.state.unregister_agent(agent_id) {
            Ok(failed) => failed,
            Err(e) => {
                warn!(error = %e, "Instance was not registered with state");
                Vec::new()
            }
        };

        if let Err(e) = instance.worker.shutdown().await {
            warn!(error = %e, "Agent shutdown failed");
        }
        instance.relay.abort();

        let _ = self.events.send(SpawnerEvent::Destroyed {
            agent_id: agent_id.to_string(),
            failed_tasks: failed.len(),
        });
        info!(failed_tasks = failed.len(), "Instance destroyed");
        Ok(failed)
    }

    /// Replace an instance's agent with a fresh one of the same type
    ///
    /// Keeps the id and either the prior or the given config; health is
    /// reset. Tasks running on the old agent finish as aborted failures.
    #[instrument(name = "spawner::restart", skip(self, config))]
    pub async fn restart_agent(
        &self,
        agent_id: &str,
        config: Option<AgentConfig>,
    ) -> Result<(), SpawnerError> {
        let (old_worker, agent_type) = {
            let instances = self.instances.read().await;
            let instance = instances
                .get(agent_id)
                .ok_or_else(|| SpawnerError::NotFound(agent_id.to_string()))?;
            (Arc::clone(&instance.worker), instance.agent_type.clone())
        };

        let mut config = config.unwrap_or_else(|| old_worker.config().clone());
        config.id = agent_id.to_string();

        if let Err(e) = old_worker.shutdown().await {
            warn!(error = %e, "Old agent shutdown failed");
        }

        let agent = self.factory.create(&agent_type, &config)?;
        let worker = Worker::new(config, agent_type, agent);
        {
            let mut instances = self.instances.write().await;
            let instance = instances
                .get_mut(agent_id)
                .ok_or_else(|| SpawnerError::NotFound(agent_id.to_string()))?;
            instance.relay.abort();
            instance.relay = self.spawn_relay(&worker);
            instance.worker = Arc::clone(&worker);
            instance.health = InstanceHealth::fresh();
            instance.sync_status();
        }
        if let Err(e) = self.state.update_agent_status(worker.status()) {
            debug!(error = %e, "Restarted instance missing from state");
        }

        worker.initialize().await?;
        self.sync_instance(agent_id).await;

        let _ = self.events.send(SpawnerEvent::Restarted {
            agent_id: agent_id.to_string(),
        });
        info!("Instance restarted");
        Ok(())
    }

    fn resolve_config(&self, spawn: &SpawnConfig) -> AgentConfig {
        let id = spawn
            .id
            .clone()
            .or_else(|| spawn.config.as_ref().map(|c| c.id.clone()))
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_id);
        let mut config = spawn
            .config
            .clone()
            .unwrap_or_else(|| self.factory.default_config(&spawn.agent_type, &id));
        config.id = id;
        config
    }

    fn spawn_relay(&self, worker: &Arc<Worker>) -> JoinHandle<()> {
        tokio::spawn(relay_events(
            worker.id().to_string(),
            worker.subscribe(),
            Arc::downgrade(&self.instances),
            Arc::clone(&self.state),
            Arc::clone(&self.bus),
            self.events.clone(),
        ))
    }

    async fn sync_instance(&self, agent_id: &str) {
        if let Some(instance) = self.instances.write().await.get_mut(agent_id) {
            instance.sync_status();
        }
    }

    // ==================== Deferred Spawning ====================

    /// Queue a spawn for the next drain tick; returns the queue length
    pub fn queue_agent_spawn(&self, spawn: SpawnConfig) -> usize {
        let mut queue = lock(&self.queue);
        queue.push_back(spawn);
        debug!(queued = queue.len(), "Deferred spawn queued");
        queue.len()
    }

    /// Spawn queued entries, oldest first, while under the cap
    ///
    /// Failed entries are logged and dropped.
    pub async fn drain_spawn_queue(&self) -> Vec<AgentId> {
        let mut spawned = Vec::new();
        while self.instance_count().await < self.config.max_instances {
            let next = lock(&self.queue).pop_front();
            let Some(spawn) = next else { break };

            let agent_type = spawn.agent_type.clone();
            match self.spawn_agent(spawn).await {
                Ok(agent_id) => spawned.push(agent_id),
                Err(e) => warn!(agent_type = %agent_type, error = %e, "Deferred spawn failed"),
            }
        }
        spawned
    }

    /// Spawn the configured fleet in order, pausing between entries
    ///
    /// Failing entries are logged and skipped.
    #[instrument(name = "spawner::bootstrap", skip(self))]
    pub async fn bootstrap_default_fleet(&self) -> Vec<AgentId> {
        let delay = Duration::from_millis(self.config.spawn_delay_ms);
        let mut spawned = Vec::new();

        for (index, entry) in self.config.default_fleet.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for dependency in &entry.depends_on {
                if !spawned.contains(dependency) {
                    warn!(agent_id = %entry.id, dependency = %dependency, "Dependency not running");
                }
            }

            let mut config = self.factory.default_config(&entry.agent_type, &entry.id);
            if let Some(max) = entry.max_concurrent_tasks {
                config.max_concurrent_tasks = max;
            }
            let mut spawn = SpawnConfig::new(entry.agent_type.clone())
                .with_id(entry.id.clone())
                .with_config(config);
            spawn.dependencies = entry.depends_on.clone();

            match self.spawn_agent(spawn).await {
                Ok(agent_id) => spawned.push(agent_id),
                Err(e) => warn!(agent_id = %entry.id, error = %e, "Skipping fleet entry"),
            }
        }

        info!(spawned = spawned.len(), "Default fleet bootstrapped");
        spawned
    }

    // ==================== Tasks ====================

    /// Run `task` on one instance, tracking it in the state manager
    ///
    /// Capacity and capability rejections leave no trace. Once accepted
    /// the task always yields a result, failed or not.
    #[instrument(name = "spawner::assign", skip(self, task), fields(agent_id = %agent_id, task_id = %task.id))]
    pub async fn assign_task(&self, agent_id: &str, task: Task) -> Result<TaskResult, SpawnerError> {
        let worker = self
            .worker(agent_id)
            .await
            .ok_or_else(|| SpawnerError::NotFound(agent_id.to_string()))?;
        if self.state.task(&task.id).is_some() {
            return Err(StateError::InvalidTask(format!("task {} is already in the pool", task.id)).into());
        }

        worker.accept_task(&task)?;
        let mut tracked = task.clone();
        tracked.metadata.assigned_to = Some(agent_id.to_string());
        if let Err(e) = self.state.add_task(tracked) {
            warn!(error = %e, "Task not tracked in state");
        }

        let result = worker.execute(task).await;
        match self.state.complete_task(result.clone()) {
            Ok(()) => {}
            Err(StateError::TaskNotFound(_) | StateError::AgentNotFound(_)) => {
                debug!("Task already settled by state");
            }
            Err(e) => warn!(error = %e, "Failed to record task result"),
        }
        self.sync_instance(agent_id).await;
        Ok(result)
    }

    // ==================== Health ====================

    /// Score every instance; returns the ids whose score is critical
    ///
    /// Scores use each worker's last reported status. Every result is also
    /// sent as a status update to the monitoring instances. Critical
    /// instances are restarted only when `auto_restart_critical` is set.
    #[instrument(name = "spawner::health_sweep", skip(self))]
    pub async fn health_sweep(&self) -> Vec<AgentId> {
        let inactivity = chrono::Duration::milliseconds(
            i64::try_from(self.config.inactivity_timeout_ms).unwrap_or(i64::MAX),
        );
        let now = Utc::now();
        let mut critical = Vec::new();
        let mut reports = Vec::new();
        let mut monitors = Vec::new();
        {
            let mut instances = self.instances.write().await;
            for instance in instances.values_mut() {
                instance.sync_status();
                let inactive = now - instance.last_activity > inactivity;
                instance.health = sweep_score(&instance.last_status, inactive);
                reports.push(status_report(instance));
                if is_monitor(&instance.worker) {
                    monitors.push(instance.id.clone());
                }

                if instance.health.score < self.config.critical_health_threshold {
                    warn!(
                        agent_id = %instance.id,
                        score = instance.health.score,
                        issues = ?instance.health.issues,
                        "Instance health critical"
                    );
                    let _ = self.events.send(SpawnerEvent::Critical {
                        agent_id: instance.id.clone(),
                        score: instance.health.score,
                        issues: instance.health.issues.clone(),
                    });
                    critical.push(instance.id.clone());
                }
            }
        }
        critical.sort();
        self.publish_status(&monitors, reports);

        if self.config.auto_restart_critical {
            for agent_id in &critical {
                if let Err(e) = self.restart_agent(agent_id, None).await {
                    error!(agent_id = %agent_id, error = %e, "Auto-restart failed");
                }
            }
        }
        critical
    }

    /// Send every instance's sweep result to each monitoring instance
    fn publish_status(&self, monitors: &[AgentId], reports: Vec<(AgentId, serde_json::Value)>) {
        for monitor in monitors {
            for (agent_id, data) in &reports {
                if agent_id == monitor {
                    continue;
                }
                let update =
                    Message::new(MessageType::StatusUpdate, agent_id, monitor, data.clone());
                if let Err(e) = self.bus.send_message(update) {
                    debug!(
                        agent_id = %agent_id,
                        monitor = %monitor,
                        error = %e,
                        "Status report dropped"
                    );
                }
            }
        }
    }

    // ==================== Queries ====================

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn instance(&self, agent_id: &str) -> Option<InstanceInfo> {
        self.instances.read().await.get(agent_id).map(AgentInstance::info)
    }

    /// All instances, sorted by id
    pub async fn instances(&self) -> Vec<InstanceInfo> {
        self.collect(|_| true).await
    }

    pub async fn instances_by_type(&self, agent_type: &str) -> Vec<InstanceInfo> {
        self.collect(|i| i.agent_type == agent_type).await
    }

    /// Instances whose last sweep scored above the healthy threshold
    pub async fn healthy_instances(&self) -> Vec<InstanceInfo> {
        let threshold = self.config.healthy_threshold;
        self.collect(|i| i.health.score > threshold).await
    }

    async fn collect(&self, keep: impl Fn(&AgentInstance) -> bool) -> Vec<InstanceInfo> {
        let mut infos: Vec<InstanceInfo> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| keep(i))
            .map(AgentInstance::info)
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Live worker handle for an instance
    pub async fn worker(&self, agent_id: &str) -> Option<Arc<Worker>> {
        self.instances
            .read()
            .await
            .get(agent_id)
            .map(|i| Arc::clone(&i.worker))
    }

    /// Every live worker, sorted by id
    pub async fn workers(&self) -> Vec<Arc<Worker>> {
        let mut workers: Vec<Arc<Worker>> = self
            .instances
            .read()
            .await
            .values()
            .map(|i| Arc::clone(&i.worker))
            .collect();
        workers.sort_by(|a, b| a.id().cmp(b.id()));
        workers
    }

    pub async fn stats(&self) -> SpawnerStats {
        let queued = lock(&self.queue).len();
        let instances = self.instances.read().await;

        let mut stats = SpawnerStats {
            total: instances.len(),
            queued,
            ..Default::default()
        };
        for instance in instances.values() {
            *stats.by_type.entry(instance.agent_type.clone()).or_default() += 1;
            if instance.health.score > self.config.healthy_threshold {
                stats.healthy += 1;
            } else {
                stats.unhealthy += 1;
            }
        }
        stats
    }

    // ==================== Background Loops ====================

    /// Start the deferred-spawn drain and health sweep loops
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = lock(&self.handles);

        let spawner = Arc::clone(self);
        let token = self.shutdown.clone();
        let period = Duration::from_millis(self.config.queue_drain_interval_ms.max(1));
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        spawner.drain_spawn_queue().await;
                    }
                }
            }
        }));

        let spawner = Arc::clone(self);
        let token = self.shutdown.clone();
        let period = Duration::from_millis(self.config.health_check_interval_ms.max(1));
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        spawner.health_sweep().await;
                    }
                }
            }
        }));

        info!("Spawner started");
    }

    /// Stop the loops, destroy every instance and drop queued spawns
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Spawner loop ended abnormally");
            }
        }

        let ids: Vec<AgentId> = self.instances.read().await.keys().cloned().collect();
        for agent_id in ids {
            if let Err(e) = self.destroy_agent(&agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "Failed to destroy instance");
            }
        }

        let dropped = {
            let mut queue = lock(&self.queue);
            let count = queue.len();
            queue.clear();
            count
        };
        info!(dropped_spawns = dropped, "Spawner stopped");
    }
}

/// Forward one worker's events until the worker goes away
fn is_monitor(worker: &Worker) -> bool {
    worker
        .config()
        .capabilities
        .iter()
        .any(|c| c.category == CapabilityCategory::Monitoring)
}

fn status_report(instance: &AgentInstance) -> (AgentId, serde_json::Value) {
    let status = &instance.last_status;
    let data = json!({
        "state": status.state,
        "health_score": status.health_score,
        "active_tasks": status.current_tasks.len(),
        "completed_tasks": status.completed_tasks,
        "failed_tasks": status.failed_tasks,
        "last_activity": instance.last_activity,
        "sweep_score": instance.health.score,
        "issues": instance.health.issues,
    });
    (instance.id.clone(), data)
}

async fn relay_events(
    agent_id: AgentId,
    mut events: broadcast::Receiver<AgentEvent>,
    instances: Weak<InstanceMap>,
    state: Arc<StateManager>,
    bus: Arc<MessageBus>,
    spawner_events: broadcast::Sender<SpawnerEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(agent_id = %agent_id, skipped, "Relay fell behind worker events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match &event {
            AgentEvent::StatusChanged(status) => {
                if let Err(e) = state.update_agent_status(status.clone()) {
                    debug!(agent_id = %agent_id, error = %e, "Status for unregistered agent");
                }
                if let Some(instances) = instances.upgrade() {
                    let mut instances = instances.write().await;
                    if let Some(instance) = instances.get_mut(&agent_id) {
                        instance.last_status = status.clone();
                        instance.last_activity = instance.last_activity.max(status.last_activity);
                    }
                }
            }
            AgentEvent::Message(message) => {
                if let Err(e) = bus.send_message(message.clone()) {
                    warn!(agent_id = %agent_id, error = %e, "Could not forward agent message");
                }
            }
            AgentEvent::TaskCompleted(result) => {
                debug!(
                    agent_id = %agent_id,
                    task_id = %result.task_id,
                    success = result.success,
                    "Task completed"
                );
            }
            AgentEvent::Error { message, .. } => {
                warn!(agent_id = %agent_id, error = %message, "Agent reported an error");
            }
        }

        let _ = spawner_events.send(SpawnerEvent::Agent {
            agent_id: agent_id.clone(),
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentState, ResourceUsage, TaskType, BuiltinAgentFactory};
    use crate::bus::{Message, MessageType};
    use crate::config::{BusConfig, FleetEntry, StateConfig};
    use crate::error::AgentError;
    use crate::state::SHUTDOWN_BEFORE_COMPLETION;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    /// Holds every task until the gate opens
    struct GatedAgent {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl Agent for GatedAgent {
        async fn process_task(&self, task: &Task) -> Result<TaskResult, AgentError> {
            self.gate.notified().await;
            Ok(TaskResult::success(&task.id, "", json!("done"), 0))
        }
    }

    struct FailingInitAgent;

    #[async_trait]
    impl Agent for FailingInitAgent {
        async fn initialize(&self) -> Result<(), AgentError> {
            Err(AgentError::InitializationFailed("no backend".to_string()))
        }

        async fn process_task(&self, _task: &Task) -> Result<TaskResult, AgentError> {
            unreachable!("never initialized")
        }
    }

    /// Fails every task while reporting heavy resource use
    struct OverloadedAgent;

    #[async_trait]
    impl Agent for OverloadedAgent {
        async fn process_task(&self, _task: &Task) -> Result<TaskResult, AgentError> {
            Err(AgentError::ExecutionFailed("overloaded".to_string()))
        }

        fn resource_usage(&self) -> ResourceUsage {
            ResourceUsage {
                cpu_percent: 95.0,
                memory_mb: 2048.0,
                active_processes: 4,
            }
        }
    }

    #[derive(Default)]
    struct TestFactory {
        gate: Arc<Notify>,
    }

    impl AgentFactory for TestFactory {
        fn create(
            &self,
            agent_type: &str,
            config: &AgentConfig,
        ) -> Result<Arc<dyn Agent>, SpawnerError> {
            match agent_type {
                "gated" => Ok(Arc::new(GatedAgent {
                    gate: Arc::clone(&self.gate),
                })),
                "failing_init" => Ok(Arc::new(FailingInitAgent)),
                "overloaded" => Ok(Arc::new(OverloadedAgent)),
                other => BuiltinAgentFactory.create(other, config),
            }
        }

        fn supported_types(&self) -> Vec<String> {
            vec!["gated".into(), "failing_init".into(), "overloaded".into()]
        }

        fn default_config(&self, agent_type: &str, id: &str) -> AgentConfig {
            BuiltinAgentFactory.default_config(agent_type, id)
        }
    }

    struct Harness {
        spawner: Arc<AgentSpawner>,
        state: Arc<StateManager>,
        bus: Arc<MessageBus>,
    }

    fn harness(config: SpawnerConfig) -> Harness {
        let state = Arc::new(StateManager::new(StateConfig::default()));
        let bus = Arc::new(MessageBus::new(BusConfig::default()));
        let spawner = Arc::new(AgentSpawner::new(
            config,
            Arc::new(TestFactory::default()),
            Arc::clone(&state),
            Arc::clone(&bus),
        ));
        Harness {
            spawner,
            state,
            bus,
        }
    }

    fn task(id: &str) -> Task {
        Task::builder(TaskType::General, "hold").id(id).build()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    // ==================== Spawn Tests ====================

    #[tokio::test]
    async fn spawn_registers_and_initializes() {
        let h = harness(SpawnerConfig::default());

        let id = h
            .spawner
            .spawn_agent(SpawnConfig::new("local").with_id("w1"))
            .await
            .unwrap();

        assert_eq!(id, "w1");
        let info = h.spawner.instance("w1").await.unwrap();
        assert_eq!(info.status.state, AgentState::Idle);
        assert_eq!(info.health.score, 100.0);
        assert_eq!(h.state.agent_type("w1").as_deref(), Some("local"));
        assert_eq!(h.spawner.stats().await.by_type["local"], 1);
    }

    #[tokio::test]
    async fn spawn_without_id_generates_one() {
        let h = harness(SpawnerConfig::default());
        let id = h.spawner.spawn_agent(SpawnConfig::new("local")).await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(h.spawner.worker(&id).await.unwrap().config().max_concurrent_tasks, 2);
    }

    #[tokio::test]
    async fn opted_out_spawn_stays_initializing() {
        let h = harness(SpawnerConfig::default());
        h.spawner
            .spawn_agent(SpawnConfig::new("local").with_id("w1").without_initialize())
            .await
            .unwrap();

        let worker = h.spawner.worker("w1").await.unwrap();
        assert_eq!(worker.state(), AgentState::Initializing);
    }

    #[tokio::test]
    async fn instance_cap_is_enforced() {
        let h = harness(SpawnerConfig {
            max_instances: 2,
            ..Default::default()
        });
        for id in ["w1", "w2"] {
            h.spawner
                .spawn_agent(SpawnConfig::new("local").with_id(id))
                .await
                .unwrap();
        }

        let err = h
            .spawner
            .spawn_agent(SpawnConfig::new("local").with_id("w3"))
            .await
            .unwrap_err();

        assert!(matches!(err, SpawnerError::CapacityReached { max: 2 }));
        assert_eq!(h.spawner.instance_count().await, 2);
        assert!(h.state.agent("w3").is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let h = harness(SpawnerConfig::default());
        h.spawner
            .spawn_agent(SpawnConfig::new("local").with_id("w1"))
            .await
            .unwrap();

        let err = h
            .spawner
            .spawn_agent(SpawnConfig::new("monitor").with_id("w1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnerError::DuplicateInstance(id) if id == "w1"));
        assert_eq!(h.state.agent_type("w1").as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn unknown_type_leaves_no_record() {
        let h = harness(SpawnerConfig::default());
        let err = h
            .spawner
            .spawn_agent(SpawnConfig::new("mystery").with_id("m1"))
            .await
            .unwrap_err();

        assert!(matches!(err, SpawnerError::UnknownAgentType(_)));
        assert_eq!(h.spawner.instance_count().await, 0);
        assert!(h.state.agent("m1").is_none());
    }

    #[tokio::test]
    async fn failed_initialization_removes_instance() {
        let h = harness(SpawnerConfig::default());
        let err = h
            .spawner
            .spawn_agent(SpawnConfig::new("failing_init").with_id("f1"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SpawnerError::Agent(AgentError::InitializationFailed(_))
        ));
        assert!(h.spawner.instance("f1").await.is_none());
        assert!(h.state.agent("f1").is_none());
    }

    #[tokio::test]
    async fn spawn_emits_event_first() {
        let h = harness(SpawnerConfig::default());
        let mut events = h.spawner.subscribe();
        h.spawner
            .spawn_agent(SpawnConfig::new("local").with_id("w1"))
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(
            first,
            SpawnerEvent::Spawned {
                agent_id: "w1".to_string(),
                agent_type: "local".to_string(),
            }
        );
    }

    // ==================== Destroy / Restart Tests ====================

    #[tokio::test]
    async fn destroy_fails_each_open_task_once() {
        let h = harness(SpawnerConfig::default());
        h.spawner
            .spawn_agent(
                SpawnConfig::new("gated")
                    .with_config(AgentConfig::new("g1", "gated").with_max_concurrent_tasks(3)),
            )
            .await
            .unwrap();

        let mut running = Vec::new();
        for id in ["t1", "t2"] {
            let spawner = Arc::clone(&h.spawner);
            running.push(tokio::spawn(async move { spawner.assign_task("g1", task(id)).await }));
        }
        let worker = h.spawner.worker("g1").await.unwrap();
        wait_for(|| worker.active_task_count() == 2).await;
        wait_for(|| h.state.agent_tasks("g1").len() == 2).await;

        let failed = h.spawner.destroy_agent("g1").await.unwrap();

        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|r| !r.success));
        assert!(failed
            .iter()
            .all(|r| r.error.as_deref() == Some(SHUTDOWN_BEFORE_COMPLETION)));
        for handle in running {
            let result = handle.await.unwrap().unwrap();
            assert!(!result.success);
        }
        assert!(h.state.active_tasks().is_empty());
        assert!(h.spawner.instance("g1").await.is_none());
        assert_eq!(worker.state(), AgentState::Offline);
    }

    #[tokio::test]
    async fn destroy_unknown_instance_fails() {
        let h = harness(SpawnerConfig::default());
        let err = h.spawner.destroy_agent("ghost").await.unwrap_err();
        assert!(matches!(err, SpawnerError::NotFound(_)));
    }

    #[tokio::test]
    async fn restart_keeps_id_and_applies_config() {
        let h = harness(SpawnerConfig::default());
        h.spawner
            .spawn_agent(SpawnConfig::new("local").with_id("w1"))
            .await
            .unwrap();
        let old = h.spawner.worker("w1").await.unwrap();

        let updated = AgentConfig::new("ignored", "worker one").with_max_concurrent_tasks(5);
        h.spawner.restart_agent("w1", Some(updated)).await.unwrap();

        let new = h.spawner.worker("w1").await.unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(old.state(), AgentState::Offline);
        assert_eq!(new.id(), "w1");
        assert_eq!(new.config().max_concurrent_tasks, 5);
        assert_eq!(new.state(), AgentState::Idle);
        assert!(h.state.agent("w1").is_some());
    }

    // ==================== Queue / Fleet Tests ====================

    #[tokio::test]
    async fn drain_stops_at_cap() {
        let h = harness(SpawnerConfig {
            max_instances: 2,
            ..Default::default()
        });
        for id in ["q1", "q2", "q3"] {
            h.spawner.queue_agent_spawn(SpawnConfig::new("local").with_id(id));
        }

        let spawned = h.spawner.drain_spawn_queue().await;

        assert_eq!(spawned, vec!["q1".to_string(), "q2".to_string()]);
        assert_eq!(h.spawner.stats().await.queued, 1);
    }

    #[tokio::test]
    async fn drain_skips_failed_entries() {
        let h = harness(SpawnerConfig::default());
        h.spawner.queue_agent_spawn(SpawnConfig::new("mystery"));
        h.spawner.queue_agent_spawn(SpawnConfig::new("local").with_id("q2"));

        assert_eq!(h.spawner.drain_spawn_queue().await, vec!["q2".to_string()]);
        assert_eq!(h.spawner.stats().await.queued, 0);
    }

    #[tokio::test]
    async fn bootstrap_spawns_fleet_in_order() {
        let h = harness(SpawnerConfig {
            spawn_delay_ms: 0,
            ..Default::default()
        });

        let spawned = h.spawner.bootstrap_default_fleet().await;

        assert_eq!(
            spawned,
            vec!["monitor-main", "coordinator-main", "local-worker-1", "local-worker-2"]
        );
        assert_eq!(h.spawner.instances_by_type("local").await.len(), 2);
        let worker = h.spawner.instance("local-worker-1").await.unwrap();
        assert_eq!(worker.dependencies, vec!["coordinator-main".to_string()]);
    }

    #[tokio::test]
    async fn bootstrap_skips_failing_entry() {
        let h = harness(SpawnerConfig {
            spawn_delay_ms: 0,
            default_fleet: vec![
                FleetEntry::new("c1", "coordinator"),
                FleetEntry::new("x1", "mystery"),
                FleetEntry {
                    max_concurrent_tasks: Some(4),
                    ..FleetEntry::new("w1", "local").depends_on("x1")
                },
            ],
            ..Default::default()
        });

        let spawned = h.spawner.bootstrap_default_fleet().await;

        assert_eq!(spawned, vec!["c1", "w1"]);
        let worker = h.spawner.worker("w1").await.unwrap();
        assert_eq!(worker.config().max_concurrent_tasks, 4);
    }

    // ==================== Task Tests ====================

    #[tokio::test]
    async fn assign_records_result_in_state() {
        let h = harness(SpawnerConfig::default());
        h.spawner
            .spawn_agent(SpawnConfig::new("local").with_id("w1"))
            .await
            .unwrap();

        let result = h.spawner.assign_task("w1", task("t1")).await.unwrap();

        assert!(result.success);
        assert_eq!(h.state.task_results("w1").len(), 1);
        assert!(h.state.active_tasks().is_empty());
        assert_eq!(h.state.agent_metrics("w1").unwrap().tasks_completed, 1);
    }

    #[tokio::test]
    async fn assign_rejects_task_already_in_pool() {
        let h = harness(SpawnerConfig::default());
        h.spawner
            .spawn_agent(SpawnConfig::new("local").with_id("w1"))
            .await
            .unwrap();
        h.state.add_task(task("t1")).unwrap();

        let err = h.spawner.assign_task("w1", task("t1")).await.unwrap_err();

        assert!(matches!(err, SpawnerError::State(StateError::InvalidTask(_))));
        assert_eq!(h.spawner.worker("w1").await.unwrap().active_task_count(), 0);
    }

    #[tokio::test]
    async fn capability_mismatch_is_rejected() {
        let h = harness(SpawnerConfig::default());
        h.spawner
            .spawn_agent(SpawnConfig::new("monitor").with_id("m1"))
            .await
            .unwrap();
        let needs_review = Task::builder(TaskType::CodeReview, "review")
            .id("t1")
            .require_capability("code_review")
            .build();

        let err = h.spawner.assign_task("m1", needs_review).await.unwrap_err();

        assert!(matches!(
            err,
            SpawnerError::Agent(AgentError::CapabilityMismatch { .. })
        ));
        assert!(h.state.task("t1").is_none());
    }

    #[tokio::test]
    async fn worker_messages_reach_the_bus() {
        let h = harness(SpawnerConfig::default());
        h.spawner
            .spawn_agent(SpawnConfig::new("coordinator").with_id("c1"))
            .await
            .unwrap();
        let worker = h.spawner.worker("c1").await.unwrap();

        worker
            .deliver(Message::new(MessageType::Coordination, "requester", "c1", json!({})))
            .unwrap();

        wait_for(|| h.bus.stats().queue_length == 1).await;
        h.bus.process_queue().await;
        let history = h.bus.history(&Default::default());
        assert_eq!(history[0].to_agent, "requester");
        assert_eq!(history[0].from_agent, "c1");
    }

    // ==================== Health Tests ====================

    fn overloaded_config(auto_restart_critical: bool) -> SpawnerConfig {
        SpawnerConfig {
            critical_health_threshold: 50.0,
            auto_restart_critical,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sweep_flags_failing_instance() {
        let h = harness(overloaded_config(false));
        h.spawner
            .spawn_agent(SpawnConfig::new("overloaded").with_id("o1"))
            .await
            .unwrap();
        h.spawner
            .spawn_agent(SpawnConfig::new("local").with_id("w1"))
            .await
            .unwrap();
        let result = h.spawner.assign_task("o1", task("t1")).await.unwrap();
        assert!(!result.success);
        h.spawner.worker("o1").await.unwrap().refresh_health();

        let critical = h.spawner.health_sweep().await;

        assert_eq!(critical, vec!["o1".to_string()]);
        let info = h.spawner.instance("o1").await.unwrap();
        // agent health 35 (<50) and error state
        assert_eq!(info.health.score, 30.0);
        assert_eq!(info.status.state, AgentState::Error);

        let healthy = h.spawner.healthy_instances().await;
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "w1");
        let stats = h.spawner.stats().await;
        assert_eq!((stats.healthy, stats.unhealthy), (1, 1));
    }

    #[tokio::test]
    async fn sweep_restarts_critical_when_enabled() {
        let h = harness(overloaded_config(true));
        h.spawner
            .spawn_agent(SpawnConfig::new("overloaded").with_id("o1"))
            .await
            .unwrap();
        h.spawner.assign_task("o1", task("t1")).await.unwrap();
        h.spawner.worker("o1").await.unwrap().refresh_health();

        h.spawner.health_sweep().await;

        let info = h.spawner.instance("o1").await.unwrap();
        assert_eq!(info.health.score, 100.0);
        assert_eq!(info.status.state, AgentState::Idle);
        assert_eq!(info.status.failed_tasks, 0);
    }

    #[tokio::test]
    async fn sweep_scores_last_reported_health() {
        let h = harness(overloaded_config(false));
        h.spawner
            .spawn_agent(SpawnConfig::new("overloaded").with_id("o1"))
            .await
            .unwrap();
        h.spawner.assign_task("o1", task("t1")).await.unwrap();

        let critical = h.spawner.health_sweep().await;

        // no health tick ran, so only the error state counts
        assert!(critical.is_empty());
        let info = h.spawner.instance("o1").await.unwrap();
        assert_eq!(info.status.health_score, 100.0);
        assert_eq!(info.health.score, 60.0);
        assert_eq!(info.status.resource_usage, ResourceUsage::default());
    }

    #[tokio::test]
    async fn sweep_reports_status_to_monitors() {
        let h = harness(SpawnerConfig::default());
        h.spawner
            .spawn_agent(SpawnConfig::new("monitor").with_id("monitor-main"))
            .await
            .unwrap();
        h.spawner
            .spawn_agent(SpawnConfig::new("local").with_id("w1"))
            .await
            .unwrap();

        h.spawner.health_sweep().await;

        assert_eq!(h.bus.process_queue().await, 1);
        let history = h.bus.history(&Default::default());
        assert_eq!(history.len(), 1);
        let update = &history[0];
        assert_eq!(update.message_type, MessageType::StatusUpdate);
        assert_eq!(update.from_agent, "w1");
        assert_eq!(update.to_agent, "monitor-main");
        assert_eq!(update.data["sweep_score"], 100.0);
        assert_eq!(update.data["state"], "idle");
    }

    #[tokio::test]
    async fn sweep_without_monitor_sends_nothing() {
        let h = harness(SpawnerConfig::default());
        h.spawner
            .spawn_agent(SpawnConfig::new("local").with_id("w1"))
            .await
            .unwrap();

        h.spawner.health_sweep().await;

        assert_eq!(h.bus.stats().queue_length, 0);
    }

    // ==================== Shutdown Tests ====================

    #[tokio::test]
    async fn shutdown_destroys_everything() {
        let h = harness(SpawnerConfig {
            spawn_delay_ms: 0,
            ..Default::default()
        });
        h.spawner.start();
        h.spawner.bootstrap_default_fleet().await;
        h.spawner.queue_agent_spawn(SpawnConfig::new("local"));

        h.spawner.shutdown().await;

        assert_eq!(h.spawner.instance_count().await, 0);
        assert!(h.state.agents().is_empty());
        assert_eq!(h.spawner.stats().await.queued, 0);
    }
}
