//! Pattern text utilities: normalization, stable hashing, overlap scores

use crate::models::EntityMap;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Lowercase, drop punctuation (keeping `$` and decimal points), collapse whitespace
pub fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '$' || c == '.' || c == '\'' || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .map(|w| w.trim_matches('.'))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stable dedup key of normalized text
pub fn query_hash(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Jaccard overlap of word sets; 0 when either side is empty
pub fn word_overlap(a: &str, b: &str) -> f64 {
    let a: HashSet<&str> = a.split_whitespace().collect();
    let b: HashSet<&str> = b.split_whitespace().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(&b).count() as f64;
    let union = a.union(&b).count() as f64;
    intersection / union
}

/// Jaccard overlap of entity key sets; two empty sets agree fully
pub fn entity_key_overlap(a: &EntityMap, b: &EntityMap) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let a: HashSet<&String> = a.keys().collect();
    let b: HashSet<&String> = b.keys().collect();
    let intersection = a.intersection(&b).count() as f64;
    let union = a.union(&b).count() as f64;
    intersection / union
}

/// Append `item` unless present, keeping at most `cap` newest entries.
/// Returns whether the item was added.
pub fn push_capped(list: &mut Vec<String>, item: String, cap: usize) -> bool {
    if list.iter().any(|existing| existing == &item) {
        return false;
    }
    list.push(item);
    if list.len() > cap {
        let excess = list.len() - cap;
        list.drain(..excess);
    }
    true
}
