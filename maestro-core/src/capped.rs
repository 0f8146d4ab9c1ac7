//! Capped, timestamp-evicted buffers for message and result history

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// Push `item` and evict oldest-by-timestamp entries until `len <= cap`
///
/// Entries usually arrive in timestamp order, but callers may record
/// back-dated items; the evicted entry is always the one with the smallest
/// timestamp (first one wins on ties), so the retained set is the `cap`
/// most recent.
pub(crate) fn push_capped<T>(
    buffer: &mut VecDeque<T>,
    item: T,
    cap: usize,
    timestamp: impl Fn(&T) -> DateTime<Utc>,
) {
    buffer.push_back(item);
    while buffer.len() > cap {
        let oldest = buffer
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| timestamp(entry))
            .map(|(index, _)| index);
        match oldest {
            Some(index) => {
                buffer.remove(index);
            }
            None => break,
        }
    }
}

/// Drop every entry older than `cutoff`, returning how many were removed
pub(crate) fn evict_before<T>(
    buffer: &mut VecDeque<T>,
    cutoff: DateTime<Utc>,
    timestamp: impl Fn(&T) -> DateTime<Utc>,
) -> usize {
    let before = buffer.len();
    buffer.retain(|entry| timestamp(entry) >= cutoff);
    before - buffer.len()
}
