//! `maestro run`: keep the control plane up and report on exit

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use maestro_core::state::spawn_autosave;
use maestro_core::{
    InstanceInfo, JsonFileSnapshotStore, Orchestrator, SnapshotStore, StateManager, SystemMetrics,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConfigLoader;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Skip spawning the configured default fleet
    #[arg(long)]
    pub no_fleet: bool,
}

pub async fn run(args: RunArgs) -> Result<()> {
    let config = ConfigLoader::load()?;

    let store: Option<Arc<dyn SnapshotStore>> = config
        .state
        .snapshot_path
        .clone()
        .map(|path| Arc::new(JsonFileSnapshotStore::new(path)) as Arc<dyn SnapshotStore>);
    let state = match &store {
        Some(store) => StateManager::load_or_default(config.state.clone(), store.as_ref()).await,
        None => StateManager::new(config.state.clone()),
    };
    let state = Arc::new(state);
    let autosave_interval = Duration::from_millis(config.state.autosave_interval_ms);

    let orchestrator = super::start_with(config, Some(Arc::clone(&state)));
    if !args.no_fleet {
        let spawned = orchestrator.bootstrap().await;
        info!(count = spawned.len(), "Default fleet spawned");
    }

    let autosave_token = CancellationToken::new();
    let autosave = store.map(|store| {
        spawn_autosave(
            Arc::clone(&state),
            store,
            autosave_interval,
            autosave_token.clone(),
        )
    });

    println!("maestro running. Press Ctrl-C to stop.");
    wait_for_stop(args.duration_secs).await;

    print_report(&orchestrator).await;
    orchestrator.shutdown().await;

    autosave_token.cancel();
    if let Some(handle) = autosave
        && let Err(e) = handle.await
    {
        warn!(error = %e, "Autosave task ended abnormally");
    }
    Ok(())
}

async fn wait_for_stop(duration_secs: Option<u64>) {
    match duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                _ = tokio::time::sleep(Duration::from_secs(secs)) => info!(secs, "Run duration elapsed"),
            }
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Could not listen for Ctrl-C");
            }
        }
    }
}

async fn print_report(orchestrator: &Orchestrator) {
    let instances = orchestrator.spawner().instances().await;
    if instances.is_empty() {
        println!("No instances running.");
    } else {
        println!("{}", instance_table(&instances));
    }
    println!();
    print_metrics(&orchestrator.state().system_metrics());
}

fn instance_table(instances: &[InstanceInfo]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Instance").fg(Color::Cyan),
        Cell::new("Type").fg(Color::Cyan),
        Cell::new("State").fg(Color::Cyan),
        Cell::new("Tasks").fg(Color::Cyan),
        Cell::new("Done/Failed").fg(Color::Cyan),
        Cell::new("Health").fg(Color::Cyan),
    ]);

    for instance in instances {
        let health = Cell::new(format!("{:.0}", instance.health.score));
        let health = if instance.health.issues.is_empty() {
            health
        } else {
            health.fg(Color::Yellow)
        };
        table.add_row(vec![
            Cell::new(&instance.id),
            Cell::new(&instance.agent_type),
            Cell::new(instance.status.state.as_str()),
            Cell::new(instance.status.current_tasks.len()),
            Cell::new(format!(
                "{}/{}",
                instance.status.completed_tasks, instance.status.failed_tasks
            )),
            health,
        ]);
    }
    table
}

fn print_metrics(metrics: &SystemMetrics) {
    println!(
        "Agents:    {} total, {} active, {} busy",
        metrics.total_agents, metrics.active_agents, metrics.busy_agents
    );
    println!(
        "Tasks:     {} active, {} completed, {} failed",
        metrics.active_tasks, metrics.completed_tasks, metrics.failed_tasks
    );
    println!("Messages:  {}", metrics.messages_recorded);
    println!("Avg resp:  {:.1}ms", metrics.average_response_time_ms);
    println!("Uptime:    {}s", metrics.uptime_ms / 1_000);
}
