//! `maestro dispatch`: run one task through the fleet and print the result

use anyhow::Result;
use clap::Args;
use maestro_core::{Task, TaskType};
use tracing::debug;

use crate::config::ConfigLoader;

#[derive(Args, Debug)]
pub struct DispatchArgs {
    /// Task type (code_review, analysis, testing, ... or any custom name)
    #[arg(long)]
    pub task_type: String,

    /// What the task should accomplish
    #[arg(long)]
    pub description: String,

    /// Input the agents work on (source code, text, ...)
    #[arg(long)]
    pub input: Option<String>,

    /// Capability every chosen instance must declare
    #[arg(long = "require")]
    pub capabilities: Vec<String>,

    /// Number of instances to run the task on
    #[arg(long, default_value_t = 1)]
    pub fan_out: usize,
}

pub async fn run(args: DispatchArgs) -> Result<()> {
    let config = ConfigLoader::load()?;
    let orchestrator = super::start_with(config, None);
    let spawned = orchestrator.bootstrap().await;
    debug!(count = spawned.len(), "Fleet ready");

    let task = build_task(&args);
    let outcome = orchestrator.dispatch(task, args.fan_out).await;
    orchestrator.shutdown().await;

    let output = outcome?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn build_task(args: &DispatchArgs) -> Task {
    let mut builder = Task::builder(TaskType::parse(&args.task_type), args.description.clone());
    if let Some(input) = &args.input {
        builder = builder.user_input(input.clone());
    }
    for capability in &args.capabilities {
        builder = builder.require_capability(capability.clone());
    }
    builder.build()
}
