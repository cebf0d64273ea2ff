//! Commit message synthesis
//!
//! Turns a flushed notification batch into a one-line human-readable
//! summary for the snapshot log.

use crate::notification::MutationNotification;
use std::collections::BTreeMap;

/// Summarize a batch of mutations.
///
/// A single notification keeps its full kind and subject; larger batches
/// collapse into per-category counts. Categories are sorted by name so the
/// same batch always yields the same message.
///
/// Callers short-circuit empty batches; this is never called with one.
pub fn synthesize(events: &[MutationNotification]) -> String {
    debug_assert!(!events.is_empty());

    if let [single] = events {
        return format!("{}: {}", single.kind, single.subject);
    }

    let mut by_category: BTreeMap<&str, usize> = BTreeMap::new();
    for event in events {
        *by_category.entry(event.kind.category.as_str()).or_insert(0) += 1;
    }

    by_category
        .iter()
        .map(|(category, count)| format!("{count} {category} changes"))
        .collect::<Vec<_>>()
        .join(", ")
}
