//! Metric formulas shared by the state manager

use crate::agent::ResourceUsage;

/// Memory usage that counts as fully loaded for efficiency purposes
const EFFICIENCY_MEMORY_CEILING_MB: f64 = 1024.0;

/// `((prev × (n−1)) + new) / n`
pub fn running_average(previous: f64, count: u64, new_value: f64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    let n = count as f64;
    ((previous * (n - 1.0)) + new_value) / n
}

/// 0-100; half weight CPU, half weight memory against a 1 GiB ceiling
pub fn resource_efficiency(usage: &ResourceUsage) -> f64 {
    let memory_load = (usage.memory_mb / EFFICIENCY_MEMORY_CEILING_MB * 100.0).min(100.0);
    let score = 100.0 - usage.cpu_percent * 0.5 - memory_load * 0.5;
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 100.0)
}

/// 0-100; five points per message in the trailing hour
pub fn collaboration_score(messages_last_hour: usize) -> f64 {
    (messages_last_hour as f64 * 5.0).min(100.0)
}
