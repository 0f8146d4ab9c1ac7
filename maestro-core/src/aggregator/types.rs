//! Aggregation output types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{OutputFormat, TaskId, TaskResult};
use crate::state::PlanId;

/// Strategy name used when exactly one result is aggregated
pub const SINGLE_RESULT: &str = "single_result";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSummary {
    pub total_agents: usize,
    pub successful_results: usize,
    pub failed_results: usize,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
    /// Mean confidence of the successful results (0.5 where unreported)
    pub confidence: f64,
}

impl AggregationSummary {
    pub fn from_results(results: &[TaskResult]) -> Self {
        let successful: Vec<&TaskResult> = results.iter().filter(|r| r.success).collect();
        let total_duration_ms: u64 = results.iter().map(|r| r.duration_ms).sum();
        let confidence = if successful.is_empty() {
            0.0
        } else {
            successful
                .iter()
                .map(|r| r.metadata.confidence.unwrap_or(0.5))
                .sum::<f64>()
                / successful.len() as f64
        };

        Self {
            total_agents: results.len(),
            successful_results: successful.len(),
            failed_results: results.len() - successful.len(),
            total_duration_ms,
            average_duration_ms: if results.is_empty() {
                0.0
            } else {
                total_duration_ms as f64 / results.len() as f64
            },
            confidence,
        }
    }
}

/// Each 0-1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub consistency: f64,
    pub completeness: f64,
    pub relevance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationMetadata {
    pub timestamp: DateTime<Utc>,
    pub strategy: String,
    pub output_format: OutputFormat,
    pub quality: QualityMetrics,
}

/// Combined answer for one logical task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedOutput {
    pub id: String,
    pub task_id: TaskId,
    pub plan_id: Option<PlanId>,
    pub results: Vec<TaskResult>,
    pub summary: AggregationSummary,
    pub final_output: serde_json::Value,
    pub metadata: AggregationMetadata,
}

/// Public description of a registered strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyInfo {
    pub name: String,
    pub supports: Vec<String>,
    pub priority: u32,
}
