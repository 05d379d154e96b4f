//! Last-writer-wins deduplication by entity id.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::DateTime;

/// An entity that carries a stable id and a modification timestamp.
pub trait Versioned {
    fn id(&self) -> &str;
    fn updated_at(&self) -> &str;
}

/// Compare two `updated_at` values.
///
/// Both sides are compared as instants when they parse as RFC 3339, so
/// `+09:00` and `Z` offsets order correctly. Anything else falls back to
/// plain string ordering.
#[must_use]
pub fn compare_timestamps(a: &str, b: &str) -> Ordering {
    match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Collapse entities sharing an id, keeping the most recently updated one.
///
/// On equal timestamps the entity seen first wins. The output keeps the
/// order in which each id first appeared. Entities with an empty id cannot
/// be keyed and are dropped.
#[must_use]
pub fn dedupe_latest<T: Versioned>(items: Vec<T>) -> Vec<T> {
    let mut slots: Vec<T> = Vec::with_capacity(items.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(items.len());

    for item in items {
        if item.id().is_empty() {
            continue;
        }
        if let Some(&slot) = index.get(item.id()) {
            if compare_timestamps(item.updated_at(), slots[slot].updated_at()) == Ordering::Greater
            {
                slots[slot] = item;
            }
        } else {
            index.insert(item.id().to_string(), slots.len());
            slots.push(item);
        }
    }

    slots
}

/// Merge two collections with last-writer-wins; on ties `primary` wins.
#[must_use]
pub fn merge_latest<T: Versioned>(primary: Vec<T>, secondary: Vec<T>) -> Vec<T> {
    let mut all = primary;
    all.extend(secondary);
    dedupe_latest(all)
}
