//! Configuration for the orchestration components
//!
//! Every section and field has a default, so an empty TOML document (or no
//! file at all) yields a working configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bus::COORDINATOR_AGENT;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MaestroConfig {
    #[serde(default)]
    pub spawner: SpawnerConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub aggregator: AggregatorConfig,
}

/// One entry of the default fleet spawned at bootstrap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetEntry {
    pub id: String,
    pub agent_type: String,
    /// Advisory; recorded on the instance, not enforced
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub max_concurrent_tasks: Option<usize>,
}

impl FleetEntry {
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            depends_on: Vec::new(),
            max_concurrent_tasks: None,
        }
    }

    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnerConfig {
    /// Global instance cap
    pub max_instances: usize,
    pub health_check_interval_ms: u64,
    pub queue_drain_interval_ms: u64,
    /// Instances idle longer than this lose health points
    pub inactivity_timeout_ms: u64,
    /// Sweep scores below this are critical
    pub critical_health_threshold: f64,
    /// Instances scoring above this count as healthy
    pub healthy_threshold: f64,
    /// Restart instances whose sweep score is critical
    pub auto_restart_critical: bool,
    /// Delay between consecutive bootstrap spawns
    pub spawn_delay_ms: u64,
    pub default_fleet: Vec<FleetEntry>,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            max_instances: 10,
            health_check_interval_ms: 30_000,
            queue_drain_interval_ms: 1_000,
            inactivity_timeout_ms: 600_000,
            critical_health_threshold: 30.0,
            healthy_threshold: 70.0,
            auto_restart_critical: false,
            spawn_delay_ms: 100,
            default_fleet: default_fleet(),
        }
    }
}

/// Monitor first, then a coordinator, then two local workers
pub fn default_fleet() -> Vec<FleetEntry> {
    vec![
        FleetEntry::new("monitor-main", "monitor"),
        FleetEntry::new(COORDINATOR_AGENT, "coordinator").depends_on("monitor-main"),
        FleetEntry::new("local-worker-1", "local").depends_on(COORDINATOR_AGENT),
        FleetEntry::new("local-worker-2", "local").depends_on(COORDINATOR_AGENT),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub max_queue_size: usize,
    pub max_history: usize,
    pub process_interval_ms: u64,
    /// History entries older than this are swept
    pub history_retention_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Wait used by [`MessageBus::request`](crate::bus::MessageBus::request)
    pub default_response_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            max_history: 1_000,
            process_interval_ms: 10,
            history_retention_ms: 3_600_000,
            cleanup_interval_ms: 60_000,
            default_response_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub max_message_history: usize,
    pub max_result_history: usize,
    pub max_results_per_agent: usize,
    pub max_messages_per_agent: usize,
    /// Where `maestro run` persists snapshots; unset disables persistence
    pub snapshot_path: Option<PathBuf>,
    pub autosave_interval_ms: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_message_history: 1_000,
            max_result_history: 1_000,
            max_results_per_agent: 100,
            max_messages_per_agent: 100,
            snapshot_path: None,
            autosave_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub max_history: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self { max_history: 100 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = MaestroConfig::default();
        assert_eq!(config.spawner.max_instances, 10);
        assert!(!config.spawner.auto_restart_critical);
        assert_eq!(config.bus.max_queue_size, 1_000);
        assert_eq!(config.state.max_message_history, 1_000);
        assert!(config.state.snapshot_path.is_none());
        assert_eq!(config.aggregator.max_history, 100);
    }

    #[test]
    fn test_default_fleet_order_and_dependencies() {
        let fleet = default_fleet();
        let ids: Vec<_> = fleet.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "monitor-main",
                "coordinator-main",
                "local-worker-1",
                "local-worker-2"
            ]
        );
        assert_eq!(fleet[1].depends_on, vec!["monitor-main"]);
        assert_eq!(fleet[3].depends_on, vec!["coordinator-main"]);
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config: MaestroConfig = toml::from_str("").unwrap();
        assert_eq!(config, MaestroConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: MaestroConfig = toml::from_str(
            r#"
[spawner]
max_instances = 3

[state]
snapshot_path = "/tmp/state.json"
"#,
        )
        .unwrap();

        assert_eq!(config.spawner.max_instances, 3);
        assert_eq!(config.spawner.spawn_delay_ms, 100);
        assert_eq!(config.spawner.default_fleet.len(), 4);
        assert_eq!(
            config.state.snapshot_path,
            Some(PathBuf::from("/tmp/state.json"))
        );
    }

    #[test]
    fn test_fleet_entry_from_toml() {
        let config: MaestroConfig = toml::from_str(
            r#"
[[spawner.default_fleet]]
id = "solo"
agent_type = "local"
max_concurrent_tasks = 4
"#,
        )
        .unwrap();

        assert_eq!(config.spawner.default_fleet.len(), 1);
        assert_eq!(config.spawner.default_fleet[0].max_concurrent_tasks, Some(4));
        assert!(config.spawner.default_fleet[0].depends_on.is_empty());
    }
}
