//! Strategy-agnostic quality measures

use std::collections::HashSet;

use serde_json::Value;

use super::types::QualityMetrics;
use crate::agent::{OutputFormat, Task, TaskResult};

/// Normalized word set: lowercase, longer than two chars, trimmed of
/// punctuation
fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Jaccard similarity of the two texts' word sets
///
/// Two empty texts are identical (1.0); one empty text shares nothing (0.0).
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let words_a = word_set(a);
    let words_b = word_set(b);

    if words_a.is_empty() && words_b.is_empty() {
        return 1.0;
    }
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }

    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    intersection as f64 / union as f64
}

/// Plain text used for similarity and relevance checks
pub fn output_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Average pairwise similarity of the successful outputs; 1.0 below two
pub fn consistency(results: &[TaskResult]) -> f64 {
    let texts: Vec<String> = results
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| r.output.as_ref().map(output_text))
        .collect();
    if texts.len() < 2 {
        return 1.0;
    }

    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..texts.len() {
        for j in (i + 1)..texts.len() {
            total += jaccard_similarity(&texts[i], &texts[j]);
            pairs += 1;
        }
    }
    total / pairs as f64
}

/// Share of results that succeeded
pub fn completeness(results: &[TaskResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().filter(|r| r.success).count() as f64 / results.len() as f64
}

/// Share of the task description's keywords (longer than three chars)
/// that appear in the merged output; 1.0 when the description has none
pub fn relevance(task: &Task, final_output: &Value) -> f64 {
    let keywords: HashSet<String> = task
        .description
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| w.chars().count() > 3)
        .collect();
    if keywords.is_empty() {
        return 1.0;
    }

    let haystack = output_text(final_output).to_lowercase();
    let found = keywords.iter().filter(|k| haystack.contains(k.as_str())).count();
    found as f64 / keywords.len() as f64
}

pub fn quality_metrics(results: &[TaskResult], task: &Task, final_output: &Value) -> QualityMetrics {
    QualityMetrics {
        consistency: consistency(results),
        completeness: completeness(results),
        relevance: relevance(task, final_output),
    }
}

/// Format requested by the task, otherwise guessed from the output
pub fn detect_output_format(task: &Task, final_output: &Value) -> OutputFormat {
    if let Some(format) = task.requirements.output_format {
        return format;
    }
    match final_output {
        Value::Object(map) if map.contains_key("code") => OutputFormat::Code,
        Value::String(s) if s.contains("```") || looks_like_code(s) => OutputFormat::Code,
        Value::String(s) if s.trim_start().starts_with('#') || s.contains("\n## ") => {
            OutputFormat::Markdown
        }
        Value::String(_) => OutputFormat::Text,
        _ => OutputFormat::Json,
    }
}

fn looks_like_code(s: &str) -> bool {
    ["fn ", "def ", "function ", "class ", "#include", "=> {"]
        .iter()
        .any(|marker| s.contains(marker))
}
