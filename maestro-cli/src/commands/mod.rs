pub mod config;
pub mod dispatch;
pub mod run;

use std::sync::Arc;

use maestro_core::{BuiltinAgentFactory, MaestroConfig, Orchestrator, StateManager};
use tracing::info;

/// Start an orchestrator with the builtin agent types, around `state` when given
fn start_with(config: MaestroConfig, state: Option<Arc<StateManager>>) -> Orchestrator {
    let factory = Arc::new(BuiltinAgentFactory);
    let orchestrator = match state {
        Some(state) => Orchestrator::with_state(config, factory, state),
        None => Orchestrator::new(config, factory),
    };
    orchestrator.start();
    info!("Orchestrator started");
    orchestrator
}
