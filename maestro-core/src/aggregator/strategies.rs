//! Merge strategies
//!
//! Type-specific strategies inspect the payloads the builtin agents
//! produce (`code`, `issues`, `findings`, `sections`, `tests`); the
//! wildcard fallbacks treat outputs as opaque.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value, json};

use super::quality::{jaccard_similarity, output_text};
use crate::agent::{Task, TaskResult};

/// Wildcard entry in [`AggregationStrategy::supports`]
pub const ANY_TASK_TYPE: &str = "*";

/// Similarity at which an agent counts as supporting the consensus
pub const CONSENSUS_SUPPORT_THRESHOLD: f64 = 0.5;

const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Combines several results for one logical task
pub trait AggregationStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Task type names this strategy handles, or [`ANY_TASK_TYPE`]
    fn supports(&self) -> Vec<String>;

    /// Lower wins when several strategies apply
    fn priority(&self) -> u32;

    fn aggregate(&self, results: &[TaskResult], task: &Task) -> Value;

    fn handles(&self, task_type: &str) -> bool {
        self.supports()
            .iter()
            .any(|s| s == task_type || s == ANY_TASK_TYPE)
    }
}

/// Every builtin strategy, type-specific ones first
pub fn builtin_strategies() -> Vec<Arc<dyn AggregationStrategy>> {
    vec![
        Arc::new(MergeCode),
        Arc::new(ConsolidateReviews),
        Arc::new(SynthesizeAnalysis),
        Arc::new(MergeDocumentation),
        Arc::new(CompileTests),
        Arc::new(BestResult),
        Arc::new(WeightedAverage),
        Arc::new(Consensus),
    ]
}

/// Envelope returned when no input succeeded
pub fn all_failed(results: &[TaskResult]) -> Value {
    let errors: Vec<Value> = results
        .iter()
        .map(|r| {
            json!({
                "agent_id": r.agent_id,
                "error": r.error.clone().unwrap_or_else(|| "unknown error".to_string()),
            })
        })
        .collect();
    json!({
        "status": "all_failed",
        "errors": errors,
    })
}

fn successful(results: &[TaskResult]) -> Vec<(&TaskResult, &Value)> {
    results
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| r.output.as_ref().map(|o| (r, o)))
        .collect()
}

fn confidence(result: &TaskResult) -> f64 {
    result.metadata.confidence.unwrap_or(DEFAULT_CONFIDENCE)
}

/// String items of `output[field]`; objects contribute their `key` field
fn string_items(output: &Value, field: &str, key: &str) -> Vec<String> {
    output
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(map) => map.get(key).and_then(Value::as_str).map(str::to_string),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Case-insensitive tally preserving first-seen spelling and order
#[derive(Default)]
struct Tally {
    order: Vec<String>,
    counts: HashMap<String, (usize, Vec<String>)>,
}

impl Tally {
    fn add(&mut self, text: &str, agent_id: &str) {
        let key = text.trim().to_lowercase();
        if key.is_empty() {
            return;
        }
        let entry = self.counts.entry(key.clone()).or_insert_with(|| {
            self.order.push(text.trim().to_string());
            (0, Vec::new())
        });
        entry.0 += 1;
        if !entry.1.iter().any(|a| a == agent_id) {
            entry.1.push(agent_id.to_string());
        }
    }

    /// (text, mentions, agents), most mentioned first; ties keep first-seen order
    fn ranked(&self) -> Vec<(String, usize, Vec<String>)> {
        let mut ranked: Vec<_> = self
            .order
            .iter()
            .map(|text| {
                let (count, agents) = &self.counts[&text.to_lowercase()];
                (text.clone(), *count, agents.clone())
            })
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
    }
}

// ==================== Type-specific ====================

/// Deduplicated code blocks from code generation and refactoring
pub struct MergeCode;

impl AggregationStrategy for MergeCode {
    fn name(&self) -> &str {
        "merge_code"
    }

    fn supports(&self) -> Vec<String> {
        vec!["code_generation".to_string(), "refactoring".to_string()]
    }

    fn priority(&self) -> u32 {
        1
    }

    fn aggregate(&self, results: &[TaskResult], _task: &Task) -> Value {
        let inputs = successful(results);
        if inputs.is_empty() {
            return all_failed(results);
        }

        let mut seen = HashSet::new();
        let mut blocks = Vec::new();
        let mut sources = Vec::new();
        for (result, output) in inputs {
            let code = match output {
                Value::String(s) => Some(s.as_str()),
                other => other.get("code").and_then(Value::as_str),
            };
            let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) else {
                continue;
            };
            if seen.insert(code.to_string()) {
                blocks.push(code.to_string());
                sources.push(result.agent_id.clone());
            }
        }

        json!({
            "code": blocks.join("\n\n"),
            "blocks": blocks.len(),
            "sources": sources,
        })
    }
}

/// Review issues merged across reviewers and ranked by how many raised them
pub struct ConsolidateReviews;

impl AggregationStrategy for ConsolidateReviews {
    fn name(&self) -> &str {
        "consolidate_reviews"
    }

    fn supports(&self) -> Vec<String> {
        vec!["code_review".to_string()]
    }

    fn priority(&self) -> u32 {
        1
    }

    fn aggregate(&self, results: &[TaskResult], _task: &Task) -> Value {
        let inputs = successful(results);
        if inputs.is_empty() {
            return all_failed(results);
        }

        let mut issues = Tally::default();
        let mut suggestions = Tally::default();
        let mut ratings = Vec::new();
        for (result, output) in &inputs {
            for issue in string_items(output, "issues", "description") {
                issues.add(&issue, &result.agent_id);
            }
            for suggestion in string_items(output, "suggestions", "description") {
                suggestions.add(&suggestion, &result.agent_id);
            }
            if let Some(rating) = output.get("rating").and_then(Value::as_f64) {
                ratings.push(rating);
            }
        }

        let issues: Vec<Value> = issues
            .ranked()
            .into_iter()
            .map(|(text, mentions, agents)| {
                let (category, description) = match text.split_once(':') {
                    Some((category, rest)) if !category.trim().is_empty() => {
                        (category.trim().to_lowercase(), rest.trim().to_string())
                    }
                    _ => ("general".to_string(), text.clone()),
                };
                json!({
                    "category": category,
                    "description": description,
                    "mentions": mentions,
                    "reported_by": agents,
                })
            })
            .collect();
        let suggestions: Vec<String> = suggestions.ranked().into_iter().map(|(s, _, _)| s).collect();
        let average_rating = if ratings.is_empty() {
            Value::Null
        } else {
            json!(ratings.iter().sum::<f64>() / ratings.len() as f64)
        };

        json!({
            "issues": issues,
            "suggestions": suggestions,
            "average_rating": average_rating,
            "reviewer_count": inputs.len(),
        })
    }
}

/// Analysis findings ranked by frequency, with every summary kept
pub struct SynthesizeAnalysis;

impl AggregationStrategy for SynthesizeAnalysis {
    fn name(&self) -> &str {
        "synthesize_analysis"
    }

    fn supports(&self) -> Vec<String> {
        vec!["analysis".to_string(), "debugging".to_string()]
    }

    fn priority(&self) -> u32 {
        1
    }

    fn aggregate(&self, results: &[TaskResult], _task: &Task) -> Value {
        let inputs = successful(results);
        if inputs.is_empty() {
            return all_failed(results);
        }

        let mut findings = Tally::default();
        let mut summaries = Vec::new();
        for (result, output) in &inputs {
            for finding in string_items(output, "findings", "description") {
                findings.add(&finding, &result.agent_id);
            }
            match output.get("summary").and_then(Value::as_str) {
                Some(summary) => summaries.push(summary.to_string()),
                None if output.is_string() => summaries.push(output_text(output)),
                None => {}
            }
        }

        let findings: Vec<Value> = findings
            .ranked()
            .into_iter()
            .map(|(finding, mentions, _)| json!({ "finding": finding, "mentions": mentions }))
            .collect();

        json!({
            "findings": findings,
            "summaries": summaries,
            "sources": inputs.len(),
        })
    }
}

/// Documentation sections merged by title with a table of contents
pub struct MergeDocumentation;

impl AggregationStrategy for MergeDocumentation {
    fn name(&self) -> &str {
        "merge_documentation"
    }

    fn supports(&self) -> Vec<String> {
        vec!["documentation".to_string()]
    }

    fn priority(&self) -> u32 {
        1
    }

    fn aggregate(&self, results: &[TaskResult], task: &Task) -> Value {
        let inputs = successful(results);
        if inputs.is_empty() {
            return all_failed(results);
        }

        let mut seen = HashSet::new();
        let mut sections: Vec<(String, String)> = Vec::new();
        for (_, output) in inputs {
            let candidates: Vec<(String, String)> = match output {
                Value::String(content) => vec![(task.description.clone(), content.clone())],
                other => other
                    .get("sections")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|s| {
                                let title = s.get("title")?.as_str()?.trim().to_string();
                                let content = s
                                    .get("content")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string();
                                Some((title, content))
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            for (title, content) in candidates {
                if !title.is_empty() && seen.insert(title.to_lowercase()) {
                    sections.push((title, content));
                }
            }
        }

        let mut document = format!("# {}\n\n## Table of Contents\n\n", task.description);
        for (title, _) in &sections {
            document.push_str(&format!("- {title}\n"));
        }
        for (title, content) in &sections {
            document.push_str(&format!("\n## {title}\n\n{content}\n"));
        }

        let toc: Vec<&String> = sections.iter().map(|(t, _)| t).collect();
        let sections: Vec<Value> = sections
            .iter()
            .map(|(title, content)| json!({ "title": title, "content": content }))
            .collect();

        json!({
            "table_of_contents": toc,
            "sections": sections,
            "document": document,
        })
    }
}

/// Test cases collected from every agent without duplicates
pub struct CompileTests;

impl AggregationStrategy for CompileTests {
    fn name(&self) -> &str {
        "compile_tests"
    }

    fn supports(&self) -> Vec<String> {
        vec!["testing".to_string()]
    }

    fn priority(&self) -> u32 {
        1
    }

    fn aggregate(&self, results: &[TaskResult], _task: &Task) -> Value {
        let inputs = successful(results);
        if inputs.is_empty() {
            return all_failed(results);
        }

        let mut seen = HashSet::new();
        let mut tests = Vec::new();
        for (_, output) in inputs {
            let Some(items) = output.get("tests").and_then(Value::as_array) else {
                continue;
            };
            for test in items {
                let key = match test {
                    Value::String(s) => s.trim().to_lowercase(),
                    other => other.to_string(),
                };
                if seen.insert(key) {
                    tests.push(test.clone());
                }
            }
        }

        json!({
            "total": tests.len(),
            "tests": tests,
        })
    }
}

// ==================== Wildcard fallbacks ====================

/// `50·success + 30·confidence + max(0, 20 − seconds)`
pub fn best_result_score(result: &TaskResult) -> f64 {
    let success = if result.success { 50.0 } else { 0.0 };
    let speed = (20.0 - result.duration_ms as f64 / 1000.0).max(0.0);
    success + 30.0 * confidence(result) + speed
}

/// The single highest-scoring result
pub struct BestResult;

impl AggregationStrategy for BestResult {
    fn name(&self) -> &str {
        "best_result"
    }

    fn supports(&self) -> Vec<String> {
        vec![ANY_TASK_TYPE.to_string()]
    }

    fn priority(&self) -> u32 {
        4
    }

    fn aggregate(&self, results: &[TaskResult], _task: &Task) -> Value {
        let inputs = successful(results);
        let mut best: Option<(&TaskResult, &Value, f64)> = None;
        for (result, output) in inputs {
            let score = best_result_score(result);
            if best.is_none_or(|(_, _, top)| score > top) {
                best = Some((result, output, score));
            }
        }

        match best {
            Some((result, output, score)) => json!({
                "best": output,
                "agent_id": result.agent_id,
                "score": score,
            }),
            None => all_failed(results),
        }
    }
}

/// Confidence-weighted mean of numeric outputs
///
/// Numbers are averaged directly; objects have each numeric field averaged
/// and other fields taken from the most confident result. Anything else
/// falls back to the most confident output.
pub struct WeightedAverage;

impl AggregationStrategy for WeightedAverage {
    fn name(&self) -> &str {
        "weighted_average"
    }

    fn supports(&self) -> Vec<String> {
        vec![ANY_TASK_TYPE.to_string()]
    }

    fn priority(&self) -> u32 {
        5
    }

    fn aggregate(&self, results: &[TaskResult], _task: &Task) -> Value {
        let inputs = successful(results);
        if inputs.is_empty() {
            return all_failed(results);
        }

        let mut weights: Vec<f64> = inputs.iter().map(|(r, _)| confidence(r)).collect();
        if weights.iter().sum::<f64>() <= 0.0 {
            weights = vec![1.0; inputs.len()];
        }
        let total_weight: f64 = weights.iter().sum();

        let mut heaviest = 0;
        for (index, weight) in weights.iter().enumerate() {
            if *weight > weights[heaviest] {
                heaviest = index;
            }
        }

        let value = if inputs.iter().all(|(_, o)| o.is_number()) {
            let sum: f64 = inputs
                .iter()
                .zip(&weights)
                .filter_map(|((_, o), w)| o.as_f64().map(|n| n * w))
                .sum();
            json!(sum / total_weight)
        } else if inputs.iter().all(|(_, o)| o.is_object()) {
            let mut merged = Map::new();
            if let Some(base) = inputs[heaviest].1.as_object() {
                merged.extend(base.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            let mut numeric_fields: HashMap<&str, (f64, f64)> = HashMap::new();
            for ((_, output), weight) in inputs.iter().zip(&weights) {
                let Some(map) = output.as_object() else { continue };
                for (key, field) in map {
                    if let Some(n) = field.as_f64() {
                        let acc = numeric_fields.entry(key.as_str()).or_insert((0.0, 0.0));
                        acc.0 += n * weight;
                        acc.1 += weight;
                    }
                }
            }
            for (key, (sum, weight)) in numeric_fields {
                if weight > 0.0 {
                    merged.insert(key.to_string(), json!(sum / weight));
                }
            }
            Value::Object(merged)
        } else {
            inputs[heaviest].1.clone()
        };

        json!({
            "value": value,
            "total_weight": total_weight,
            "contributors": inputs.len(),
        })
    }
}

/// Output most similar to all others, with the agents that agree with it
pub struct Consensus;

impl AggregationStrategy for Consensus {
    fn name(&self) -> &str {
        "consensus"
    }

    fn supports(&self) -> Vec<String> {
        vec![ANY_TASK_TYPE.to_string()]
    }

    fn priority(&self) -> u32 {
        5
    }

    fn aggregate(&self, results: &[TaskResult], _task: &Task) -> Value {
        let inputs = successful(results);
        if inputs.is_empty() {
            return all_failed(results);
        }

        let texts: Vec<String> = inputs.iter().map(|(_, o)| output_text(o)).collect();
        let n = texts.len();
        let mut similarity = vec![vec![1.0; n]; n];
        for i in 0..n {
            for j in (i + 1)..n {
                let s = jaccard_similarity(&texts[i], &texts[j]);
                similarity[i][j] = s;
                similarity[j][i] = s;
            }
        }

        let agreement_of = |i: usize| -> f64 {
            if n < 2 {
                return 1.0;
            }
            (0..n).filter(|&j| j != i).map(|j| similarity[i][j]).sum::<f64>() / (n - 1) as f64
        };

        let mut chosen = 0;
        let mut agreement = agreement_of(0);
        for i in 1..n {
            let a = agreement_of(i);
            if a > agreement {
                chosen = i;
                agreement = a;
            }
        }

        let supporting: Vec<&str> = (0..n)
            .filter(|&j| similarity[chosen][j] >= CONSENSUS_SUPPORT_THRESHOLD)
            .map(|j| inputs[j].0.agent_id.as_str())
            .collect();

        json!({
            "consensus": inputs[chosen].1,
            "agreement": agreement,
            "supporting_agents": supporting,
        })
    }
}
