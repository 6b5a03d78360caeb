//! # Hierarchical Insert Planning
//!
//! Orders an unsorted batch of parent-referencing records so that every parent
//! is written before its children.
//!
//! ## Wave Algorithm
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  input: [{3,p:99}, {2,p:1}, {1,p:-}]      already stored: {}            │
//! │                                                                         │
//! │  wave 1: parent is null or placed   → {1}                               │
//! │  wave 2: parent is null or placed   → {2}                               │
//! │  wave 3: nothing ready              → stop                              │
//! │                                                                         │
//! │  leftovers: {3} parent 99 not in batch, not stored → Orphan(99)         │
//! │                                                                         │
//! │  cycles: {1,p:2},{2,p:1} never become ready → both Cycle                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Leftovers are reported and dropped; they are never inserted with a
//! dangling reference.

use std::collections::{HashMap, HashSet};

use crate::types::Record;

/// Why a record could not be placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// The parent is neither in the batch nor already stored.
    Orphan { missing_parent: String },
    /// The record is part of a parent cycle (including a self-reference).
    Cycle,
    /// The record sits below an orphan or a cycle it is not part of.
    UnresolvedAncestor { ancestor: String },
}

/// A record that was left out of the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedRecord {
    pub id: String,
    pub parent_id: String,
    pub reason: UnresolvedReason,
}

/// Insertion plan: waves to write in order, plus the records to drop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertPlan {
    pub waves: Vec<Vec<Record>>,
    pub unresolved: Vec<UnresolvedRecord>,
}

impl InsertPlan {
    /// Records in insertion order.
    pub fn ordered(&self) -> impl Iterator<Item = &Record> {
        self.waves.iter().flatten()
    }

    /// Number of records that will be written.
    pub fn insert_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    /// Consumes the plan, returning records in insertion order.
    pub fn into_ordered(self) -> Vec<Record> {
        self.waves.into_iter().flatten().collect()
    }
}

/// Parent links of rows already in the target table, `id → parent_id`.
pub type StoredParents = HashMap<String, Option<String>>;

/// Plans a wave-based insertion of `records`.
///
/// `stored` describes the rows already present in the target table; children
/// may attach to them in the first wave. A batch row replaces the stored row
/// with the same id, so a batch that re-parents stored rows into a loop is
/// reported as a cycle too. When the batch repeats an id, the last occurrence
/// wins.
pub fn plan_hierarchical_insert(records: Vec<Record>, stored: &StoredParents) -> InsertPlan {
    let mut remaining = dedupe_last_wins(records);
    let mut placed: HashSet<String> = stored.keys().cloned().collect();
    let mut waves = Vec::new();

    loop {
        let (ready, blocked): (Vec<Record>, Vec<Record>) =
            remaining.into_iter().partition(|r| match &r.parent_id {
                None => true,
                Some(parent) => parent != &r.id && placed.contains(parent),
            });
        remaining = blocked;

        if ready.is_empty() {
            break;
        }
        placed.extend(ready.iter().map(|r| r.id.clone()));
        waves.push(ready);
    }

    let mut unresolved = classify_leftovers(&remaining);
    if !stored.is_empty() {
        unresolved.extend(drop_cycles_through_stored(&mut waves, stored));
    }

    InsertPlan { waves, unresolved }
}

/// Removes placed records whose merged parent chain (batch over stored)
/// loops back to themselves, plus new batch rows that hang below them.
fn drop_cycles_through_stored(
    waves: &mut Vec<Vec<Record>>,
    stored: &StoredParents,
) -> Vec<UnresolvedRecord> {
    let mut merged: HashMap<&str, Option<&str>> = stored
        .iter()
        .map(|(id, parent)| (id.as_str(), parent.as_deref()))
        .collect();
    for record in waves.iter().flatten() {
        merged.insert(record.id.as_str(), record.parent_id.as_deref());
    }

    let limit = merged.len();
    let cyclic: HashSet<String> = waves
        .iter()
        .flatten()
        .filter(|record| {
            let mut current = record.parent_id.as_deref();
            for _ in 0..limit {
                match current {
                    Some(id) if id == record.id => return true,
                    Some(id) => current = merged.get(id).copied().flatten(),
                    None => return false,
                }
            }
            false
        })
        .map(|record| record.id.clone())
        .collect();

    if cyclic.is_empty() {
        return Vec::new();
    }

    let mut unresolved = Vec::new();
    let mut removed: HashSet<String> = HashSet::new();
    for wave in waves.iter_mut() {
        wave.retain(|record| {
            let parent = record.parent_id.as_deref().unwrap_or_default();
            let reason = if cyclic.contains(&record.id) {
                UnresolvedReason::Cycle
            } else if removed.contains(parent) && !stored.contains_key(parent) {
                UnresolvedReason::UnresolvedAncestor {
                    ancestor: parent.to_string(),
                }
            } else {
                return true;
            };
            removed.insert(record.id.clone());
            unresolved.push(UnresolvedRecord {
                id: record.id.clone(),
                parent_id: parent.to_string(),
                reason,
            });
            false
        });
    }
    waves.retain(|wave| !wave.is_empty());
    unresolved
}

fn dedupe_last_wins(records: Vec<Record>) -> Vec<Record> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Record> = Vec::with_capacity(records.len());

    for record in records {
        match index.get(&record.id) {
            Some(&pos) => out[pos] = record,
            None => {
                index.insert(record.id.clone(), out.len());
                out.push(record);
            }
        }
    }
    out
}

fn classify_leftovers(leftovers: &[Record]) -> Vec<UnresolvedRecord> {
    // Every leftover has a parent; records with none are always ready.
    let parents: HashMap<&str, &str> = leftovers
        .iter()
        .filter_map(|r| r.parent_id.as_deref().map(|p| (r.id.as_str(), p)))
        .collect();

    leftovers
        .iter()
        .filter_map(|record| {
            let parent = record.parent_id.as_deref()?;
            Some(UnresolvedRecord {
                id: record.id.clone(),
                parent_id: parent.to_string(),
                reason: reason_for(&record.id, parent, &parents),
            })
        })
        .collect()
}

fn reason_for(id: &str, parent: &str, parents: &HashMap<&str, &str>) -> UnresolvedReason {
    if !parents.contains_key(parent) && parent != id {
        return UnresolvedReason::Orphan {
            missing_parent: parent.to_string(),
        };
    }

    let mut seen: HashSet<&str> = HashSet::new();
    seen.insert(id);
    let mut current = parent;

    loop {
        if current == id {
            return UnresolvedReason::Cycle;
        }
        if !seen.insert(current) {
            // Reached a cycle that does not include `id`.
            return UnresolvedReason::UnresolvedAncestor {
                ancestor: current.to_string(),
            };
        }
        match parents.get(current) {
            Some(next) => current = next,
            None => {
                return UnresolvedReason::UnresolvedAncestor {
                    ancestor: current.to_string(),
                }
            }
        }
    }
}
