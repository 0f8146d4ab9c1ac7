//! Agent construction keyed by type name

use std::sync::Arc;

use super::builtin::{BuiltinAgent, BuiltinKind};
use super::traits::Agent;
use super::types::AgentConfig;
use crate::error::SpawnerError;

/// Builds concrete agents for the spawner
///
/// The spawner never knows concrete agent types; it asks the factory for
/// one by name and treats an unknown name as a hard failure.
pub trait AgentFactory: Send + Sync {
    /// Create a new agent instance of `agent_type`
    fn create(&self, agent_type: &str, config: &AgentConfig)
    -> Result<Arc<dyn Agent>, SpawnerError>;

    /// Type names this factory can build
    fn supported_types(&self) -> Vec<String>;

    /// Config used when a spawn request carries none
    fn default_config(&self, agent_type: &str, id: &str) -> AgentConfig {
        let _ = agent_type;
        AgentConfig::new(id, id)
    }
}

/// Factory for the [`BuiltinKind`] agents
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinAgentFactory;

impl AgentFactory for BuiltinAgentFactory {
    fn create(
        &self,
        agent_type: &str,
        config: &AgentConfig,
    ) -> Result<Arc<dyn Agent>, SpawnerError> {
        let kind = BuiltinKind::parse(agent_type)
            .ok_or_else(|| SpawnerError::UnknownAgentType(agent_type.to_string()))?;
        Ok(Arc::new(BuiltinAgent::new(config.id.clone(), kind)))
    }

    fn supported_types(&self) -> Vec<String> {
        BuiltinKind::all()
            .iter()
            .map(|kind| kind.as_str().to_string())
            .collect()
    }

    fn default_config(&self, agent_type: &str, id: &str) -> AgentConfig {
        BuiltinKind::parse(agent_type)
            .map(|kind| kind.default_config(id))
            .unwrap_or_else(|| AgentConfig::new(id, id))
    }
}
