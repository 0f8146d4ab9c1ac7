//! Orchestrator: one of each component, wired together
//!
//! Owns the [`StateManager`], [`MessageBus`], [`AgentSpawner`] and
//! [`OutputAggregator`], routes bus traffic into worker inboxes and runs
//! the "hand a task to several instances, then aggregate" flow.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentFactory, AgentId, AgentState, Task, TaskResult, Worker};
use crate::aggregator::{AggregatedOutput, OutputAggregator};
use crate::bus::{HandlerError, Message, MessageBus, Route, RoutePattern, handler};
use crate::config::MaestroConfig;
use crate::error::{MaestroResult, SpawnerError};
use crate::spawner::AgentSpawner;
use crate::state::{CoordinationPlan, StateManager};

/// Handler and route name of the inbox delivery rule
pub const DELIVERY_ROUTE: &str = "deliver";

/// Runs after every default route
const DELIVERY_ROUTE_PRIORITY: u32 = 10;

pub struct Orchestrator {
    config: MaestroConfig,
    state: Arc<StateManager>,
    bus: Arc<MessageBus>,
    spawner: Arc<AgentSpawner>,
    aggregator: Arc<OutputAggregator>,
}

impl Orchestrator {
    pub fn new(config: MaestroConfig, factory: Arc<dyn AgentFactory>) -> Self {
        let state = Arc::new(StateManager::new(config.state.clone()));
        Self::with_state(config, factory, state)
    }

    /// Build around an existing (e.g. restored) state manager
    pub fn with_state(
        config: MaestroConfig,
        factory: Arc<dyn AgentFactory>,
        state: Arc<StateManager>,
    ) -> Self {
        let bus = Arc::new(MessageBus::new(config.bus.clone()));
        let spawner = Arc::new(AgentSpawner::new(
            config.spawner.clone(),
            factory,
            Arc::clone(&state),
            Arc::clone(&bus),
        ));
        let aggregator = Arc::new(OutputAggregator::new(config.aggregator.clone()));
        Self {
            config,
            state,
            bus,
            spawner,
            aggregator,
        }
    }

    pub fn config(&self) -> &MaestroConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn spawner(&self) -> &Arc<AgentSpawner> {
        &self.spawner
    }

    pub fn aggregator(&self) -> &Arc<OutputAggregator> {
        &self.aggregator
    }

    /// Start the background loops and install inbox delivery
    pub fn start(&self) {
        self.bus.register_handler(
            DELIVERY_ROUTE,
            delivery_handler(Arc::downgrade(&self.spawner), Arc::clone(&self.state)),
        );
        self.bus.add_route(Route::new(
            DELIVERY_ROUTE,
            RoutePattern::Any,
            DELIVERY_ROUTE_PRIORITY,
            DELIVERY_ROUTE,
        ));
        self.bus.start();
        self.spawner.start();
        info!("Orchestrator started");
    }

    /// Spawn the configured default fleet
    pub async fn bootstrap(&self) -> Vec<AgentId> {
        self.spawner.bootstrap_default_fleet().await
    }

    /// Run `task` on up to `fan_out` instances and aggregate their results
    ///
    /// Eligible instances are healthy, not offline, have a free slot and
    /// declare a required capability; more free slots win, then the lower
    /// configured priority number. With several instances each gets its own copy
    /// of the task, id suffixed with the agent id.
    #[instrument(
        name = "orchestrator::dispatch",
        skip(self, task),
        fields(task_id = %task.id, task_type = %task.task_type)
    )]
    pub async fn dispatch(&self, task: Task, fan_out: usize) -> MaestroResult<AggregatedOutput> {
        let candidates = self.candidates(&task, fan_out.max(1)).await;
        if candidates.is_empty() {
            return Err(SpawnerError::NoEligibleInstance(task.id).into());
        }
        info!(agents = ?candidates, "Dispatching task");

        let split = candidates.len() > 1;
        let runs = candidates.iter().map(|agent_id| {
            let mut copy = task.clone();
            if split {
                copy.id = format!("{}/{}", task.id, agent_id);
            }
            self.spawner.assign_task(agent_id, copy)
        });
        let outcomes = join_all(runs).await;

        let results: Vec<TaskResult> = candidates
            .iter()
            .zip(outcomes)
            .map(|(agent_id, outcome)| match outcome {
                Ok(result) => result,
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "Instance rejected task");
                    TaskResult::failure(&task.id, agent_id, e.to_string(), 0)
                }
            })
            .collect();

        let plan = self.extract_plan(&results);
        let aggregated = self
            .aggregator
            .aggregate(&task.id, results, &task, plan.as_ref())?;
        Ok(aggregated)
    }

    async fn candidates(&self, task: &Task, fan_out: usize) -> Vec<AgentId> {
        let healthy: HashSet<AgentId> = self
            .spawner
            .healthy_instances()
            .await
            .into_iter()
            .map(|i| i.id)
            .collect();

        let mut eligible: Vec<Arc<Worker>> = self
            .spawner
            .workers()
            .await
            .into_iter()
            .filter(|w| healthy.contains(w.id()))
            .filter(|w| w.state() != AgentState::Offline)
            .filter(|w| w.free_capacity() > 0)
            .filter(|w| w.config().satisfies(&task.requirements.capabilities))
            .collect();
        eligible.sort_by(|a, b| {
            b.free_capacity()
                .cmp(&a.free_capacity())
                .then(a.config().priority.cmp(&b.config().priority))
                .then_with(|| a.id().cmp(b.id()))
        });

        eligible
            .into_iter()
            .take(fan_out)
            .map(|w| w.id().to_string())
            .collect()
    }

    /// First plan a coordinator produced, recorded in the state manager
    fn extract_plan(&self, results: &[TaskResult]) -> Option<CoordinationPlan> {
        let plan = results
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.output.as_ref()?.get("plan").cloned())
            .find_map(|value| serde_json::from_value::<CoordinationPlan>(value).ok())?;
        debug!(plan_id = %plan.id, steps = plan.workflow.len(), "Recording coordination plan");
        self.state.upsert_plan(plan.clone());
        Some(plan)
    }

    /// Stop the spawner (destroying every instance), then the bus
    pub async fn shutdown(&self) {
        self.spawner.shutdown().await;
        self.bus.shutdown().await;
        self.bus.unregister_handler(DELIVERY_ROUTE);
        info!("Orchestrator stopped");
    }
}

/// Records every message and hands it to the addressed worker's inbox
///
/// Broadcasts go to every worker except the sender.
fn delivery_handler(
    spawner: Weak<AgentSpawner>,
    state: Arc<StateManager>,
) -> crate::bus::MessageHandler {
    handler(move |message: Message| {
        let spawner = spawner.clone();
        let state = Arc::clone(&state);
        async move {
            state.record_message(message.clone());
            let Some(spawner) = spawner.upgrade() else {
                return Ok(());
            };

            if message.is_broadcast() {
                for worker in spawner.workers().await {
                    if worker.id() == message.from_agent {
                        continue;
                    }
                    if let Err(e) = worker.deliver(message.clone()) {
                        debug!(agent_id = %worker.id(), error = %e, "Broadcast not delivered");
                    }
                }
            } else if let Some(worker) = spawner.worker(&message.to_agent).await {
                worker.deliver(message).map_err(HandlerError::from)?;
            } else {
                debug!(to = %message.to_agent, "No local worker for recipient");
            }
            Ok::<(), HandlerError>(())
        }
    })
}
