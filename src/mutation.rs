//! Translation of logical per-store mutations into one wire batch.
//!
//! All deletions in a call share one timestamp and all additions share a
//! strictly later one, so when a call deletes and re-adds the same column
//! the addition wins under last-write-wins regardless of apply order.

use crate::client::{Column, ColumnMutation, WireBatch};
use crate::types::StoreMutations;
use bytes::Bytes;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Last addition timestamp handed out by [`MutationTimestamps::now`].
static LAST_ISSUED: AtomicI64 = AtomicI64::new(0);

/// The pair of timestamps stamped onto one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationTimestamps {
    pub deletion: i64,
    pub addition: i64,
}

impl MutationTimestamps {
    /// Explicit timestamps. `addition` is raised to `deletion + 1` if needed.
    pub fn new(deletion: i64, addition: i64) -> Self {
        Self {
            deletion,
            addition: addition.max(deletion + 1),
        }
    }

    /// Microseconds since the epoch for deletions, one more for additions.
    ///
    /// Pairs are strictly increasing within the process: a call never reuses
    /// a timestamp from an earlier call, even within one microsecond.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        let mut deletion = micros;
        let _ = LAST_ISSUED.fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            deletion = micros.max(last + 1);
            Some(deletion + 1)
        });
        Self::new(deletion, deletion + 1)
    }
}

/// Output of [`translate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedBatch {
    pub batch: WireBatch,
    /// First row key seen, used to feed the hotspot tracker.
    pub representative_key: Option<Bytes>,
    /// Number of column operations in the batch.
    pub operations: usize,
}

impl TranslatedBatch {
    pub fn is_empty(&self) -> bool {
        self.operations == 0
    }
}

/// Build the wire batch for a set of per-store, per-key mutations.
///
/// Operations for one key across several stores land under that key, so the
/// remote store applies them as one per-key batch. Within a (key, store)
/// list, deletions come before additions.
pub fn translate(mutations: &StoreMutations, timestamps: MutationTimestamps) -> TranslatedBatch {
    let mut batch = WireBatch::new();
    let mut representative_key = None;
    let mut operations = 0;

    for (store, by_key) in mutations {
        for (key, mutation) in by_key {
            if representative_key.is_none() {
                representative_key = Some(key.clone());
            }

            let mut ops = Vec::with_capacity(mutation.len());
            for column in mutation.get_deletions() {
                ops.push(ColumnMutation::Delete {
                    column: column.clone(),
                    timestamp: timestamps.deletion,
                });
            }
            for entry in mutation.get_additions() {
                ops.push(ColumnMutation::Insert(Column::new(
                    entry.column.clone(),
                    entry.value.clone(),
                    timestamps.addition,
                )));
            }

            operations += ops.len();
            batch
                .entry(key.clone())
                .or_default()
                .insert(store.clone(), ops);
        }
    }

    TranslatedBatch {
        batch,
        representative_key,
        operations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Entry, KeyMutation};
    use std::collections::BTreeMap;

    fn key(k: &'static str) -> Bytes {
        Bytes::from_static(k.as_bytes())
    }

    fn single(store: &str, k: &'static str, mutation: KeyMutation) -> StoreMutations {
        let mut by_key = BTreeMap::new();
        by_key.insert(key(k), mutation);
        let mut mutations = StoreMutations::new();
        mutations.insert(store.to_string(), by_key);
        mutations
    }

    #[test]
    fn test_timestamps_ordered() {
        let ts = MutationTimestamps::now();
        assert!(ts.addition > ts.deletion);

        let ts = MutationTimestamps::new(10, 10);
        assert_eq!(ts.addition, 11);
    }

    #[test]
    fn test_now_never_repeats() {
        let mut previous = MutationTimestamps::now();
        for _ in 0..1000 {
            let next = MutationTimestamps::now();
            assert!(next.deletion > previous.addition);
            previous = next;
        }
    }

    #[test]
    fn test_deletes_precede_additions() {
        let mutation = KeyMutation::new(vec![Entry::new("c", "v")], vec![key("c"), key("d")]);
        let out = translate(&single("edgestore", "k", mutation), MutationTimestamps::new(100, 101));

        let ops = &out.batch[&key("k")]["edgestore"];
        assert_eq!(ops.len(), 3);
        assert_eq!(
            ops[0],
            ColumnMutation::Delete {
                column: key("c"),
                timestamp: 100
            }
        );
        assert!(matches!(ops[1], ColumnMutation::Delete { timestamp: 100, .. }));
        assert_eq!(ops[2], ColumnMutation::Insert(Column::new("c", "v", 101)));
        assert_eq!(out.operations, 3);
    }

    #[test]
    fn test_same_key_grouped_across_stores() {
        let mut mutations = single("edgestore", "k1", KeyMutation::additions(vec![Entry::new("a", "1")]));
        mutations
            .entry("vertexindex".to_string())
            .or_default()
            .insert(key("k1"), KeyMutation::deletions(vec![key("b")]));
        mutations
            .entry("vertexindex".to_string())
            .or_default()
            .insert(key("k2"), KeyMutation::additions(vec![Entry::new("c", "3")]));

        let out = translate(&mutations, MutationTimestamps::new(1, 2));

        assert_eq!(out.batch.len(), 2);
        let k1 = &out.batch[&key("k1")];
        assert_eq!(k1.len(), 2);
        assert!(k1.contains_key("edgestore"));
        assert!(k1.contains_key("vertexindex"));
        assert_eq!(out.batch[&key("k2")].len(), 1);
    }

    #[test]
    fn test_representative_key_is_first_seen() {
        let mut mutations = single("a_store", "zeta", KeyMutation::additions(vec![Entry::new("x", "1")]));
        mutations
            .entry("b_store".to_string())
            .or_default()
            .insert(key("alpha"), KeyMutation::additions(vec![Entry::new("y", "2")]));

        let out = translate(&mutations, MutationTimestamps::new(1, 2));
        assert_eq!(out.representative_key, Some(key("zeta")));
    }

    #[test]
    fn test_shape_independent_of_timestamps() {
        let mutation = KeyMutation::new(vec![Entry::new("c", "v")], vec![key("d")]);
        let mutations = single("edgestore", "k", mutation);

        let first = translate(&mutations, MutationTimestamps::new(10, 11));
        let second = translate(&mutations, MutationTimestamps::new(50, 51));
        assert_ne!(first.batch, second.batch);

        let strip = |b: &WireBatch| -> Vec<(Bytes, String, Bytes, bool)> {
            b.iter()
                .flat_map(|(k, cfs)| {
                    cfs.iter().flat_map(move |(cf, ops)| {
                        ops.iter().map(move |op| {
                            (
                                k.clone(),
                                cf.clone(),
                                op.column_name().clone(),
                                matches!(op, ColumnMutation::Insert(_)),
                            )
                        })
                    })
                })
                .collect()
        };
        assert_eq!(strip(&first.batch), strip(&second.batch));
    }

    #[test]
    fn test_empty_input() {
        let out = translate(&StoreMutations::new(), MutationTimestamps::new(1, 2));
        assert!(out.is_empty());
        assert!(out.representative_key.is_none());
    }
}
