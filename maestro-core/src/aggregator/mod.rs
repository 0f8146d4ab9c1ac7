//! Output aggregation
//!
//! Merges the results several agents produced for one logical task.
//! Strategy selection filters by task type (or the `*` wildcard) and
//! takes the lowest priority number; a single result bypasses selection.

mod quality;
mod strategies;
mod types;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::agent::{Task, TaskResult, new_id};
use crate::config::AggregatorConfig;
use crate::error::AggregationError;
use crate::state::CoordinationPlan;

pub use quality::{
    completeness, consistency, detect_output_format, jaccard_similarity, quality_metrics, relevance,
};
pub use strategies::{
    ANY_TASK_TYPE, AggregationStrategy, BestResult, CONSENSUS_SUPPORT_THRESHOLD, CompileTests,
    Consensus, ConsolidateReviews, MergeCode, MergeDocumentation, SynthesizeAnalysis,
    WeightedAverage, all_failed, best_result_score, builtin_strategies,
};
pub use types::{
    AggregatedOutput, AggregationMetadata, AggregationSummary, QualityMetrics, SINGLE_RESULT,
    StrategyInfo,
};

/// Quality reported for a lone successful result
const SINGLE_SUCCESS_QUALITY: QualityMetrics = QualityMetrics {
    consistency: 1.0,
    completeness: 1.0,
    relevance: 0.95,
};

const SINGLE_FAILURE_QUALITY: QualityMetrics = QualityMetrics {
    consistency: 1.0,
    completeness: 0.0,
    relevance: 0.0,
};

pub struct OutputAggregator {
    config: AggregatorConfig,
    strategies: RwLock<Vec<Arc<dyn AggregationStrategy>>>,
    /// Most recent first
    history: Mutex<VecDeque<AggregatedOutput>>,
}

impl OutputAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            strategies: RwLock::new(builtin_strategies()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Merge `results` for `task` into one output and record it
    #[instrument(
        name = "aggregator::aggregate",
        skip(self, results, task, plan),
        fields(task_id = %task_id, results = results.len())
    )]
    pub fn aggregate(
        &self,
        task_id: &str,
        results: Vec<TaskResult>,
        task: &Task,
        plan: Option<&CoordinationPlan>,
    ) -> Result<AggregatedOutput, AggregationError> {
        if results.is_empty() {
            return Err(AggregationError::NoResults(task_id.to_string()));
        }

        let (strategy, final_output, quality) = if let [only] = results.as_slice() {
            let (output, quality) = match (&only.output, only.success) {
                (Some(output), true) => (output.clone(), SINGLE_SUCCESS_QUALITY),
                (None, true) => (serde_json::Value::Null, SINGLE_SUCCESS_QUALITY),
                (_, false) => (all_failed(&results), SINGLE_FAILURE_QUALITY),
            };
            (SINGLE_RESULT.to_string(), output, quality)
        } else {
            let strategy = self.select(task.task_type.as_str())?;
            let output = strategy.aggregate(&results, task);
            let quality = quality_metrics(&results, task, &output);
            (strategy.name().to_string(), output, quality)
        };

        let aggregated = AggregatedOutput {
            id: new_id(),
            task_id: task_id.to_string(),
            plan_id: plan.map(|p| p.id.clone()),
            summary: AggregationSummary::from_results(&results),
            metadata: AggregationMetadata {
                timestamp: Utc::now(),
                strategy,
                output_format: detect_output_format(task, &final_output),
                quality,
            },
            final_output,
            results,
        };

        info!(
            aggregation_id = %aggregated.id,
            strategy = %aggregated.metadata.strategy,
            successful = aggregated.summary.successful_results,
            failed = aggregated.summary.failed_results,
            "Aggregated task results"
        );

        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_front(aggregated.clone());
        history.truncate(self.config.max_history);
        Ok(aggregated)
    }

    /// Strategy that would be chosen for a multi-result aggregation
    pub fn select_strategy(&self, task_type: &str) -> Result<String, AggregationError> {
        self.select(task_type).map(|s| s.name().to_string())
    }

    fn select(&self, task_type: &str) -> Result<Arc<dyn AggregationStrategy>, AggregationError> {
        let strategies = self.strategies.read().unwrap_or_else(PoisonError::into_inner);
        // min_by_key keeps the first of equal priorities
        strategies
            .iter()
            .filter(|s| s.handles(task_type))
            .min_by_key(|s| s.priority())
            .cloned()
            .ok_or_else(|| AggregationError::NoStrategy {
                task_type: task_type.to_string(),
            })
    }

    /// Register a strategy, replacing any with the same name
    pub fn add_strategy(&self, strategy: Arc<dyn AggregationStrategy>) {
        let mut strategies = self.strategies.write().unwrap_or_else(PoisonError::into_inner);
        strategies.retain(|s| s.name() != strategy.name());
        debug!(strategy = %strategy.name(), "Registered aggregation strategy");
        strategies.push(strategy);
    }

    pub fn remove_strategy(&self, name: &str) -> Result<(), AggregationError> {
        let mut strategies = self.strategies.write().unwrap_or_else(PoisonError::into_inner);
        let before = strategies.len();
        strategies.retain(|s| s.name() != name);
        if strategies.len() == before {
            return Err(AggregationError::StrategyNotFound(name.to_string()));
        }
        Ok(())
    }

    pub fn strategies(&self) -> Vec<StrategyInfo> {
        self.strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| StrategyInfo {
                name: s.name().to_string(),
                supports: s.supports(),
                priority: s.priority(),
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<AggregatedOutput> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    /// Most recent first
    pub fn history(&self, limit: Option<usize>) -> Vec<AggregatedOutput> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for OutputAggregator {
    fn default() -> Self {
        Self::new(AggregatorConfig::default())
    }
}
