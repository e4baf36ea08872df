//! Merging two divergent operation logs of the same document.
//!
//! # Algorithm
//!
//! 1. The log with more rows is the primary one, so no trailing row is lost
//! 2. Row `i` of the result is the primary row `i`, plus every operation of
//!    the secondary row `i` whose creator is not already present
//! 3. Each merged row is sorted by creator
//! 4. The digest is recomputed
//!
//! This aligns rows by index rather than by key. It is correct because row
//! `i` of every replica describes the same causal position: an actor only
//! ever appends a new row, and rows travel unchanged afterwards.

use crate::{hash::HashFunction, CrdtField, Operation, OperationRow};
use std::collections::HashSet;

/// Merge two logs into one combined, deduplicated, order-stable log.
pub fn merge_fields(hasher: &dyn HashFunction, a: &CrdtField, b: &CrdtField) -> CrdtField {
    let (primary, secondary) = if a.operations.len() < b.operations.len() {
        (b, a)
    } else {
        (a, b)
    };

    let operations: Vec<OperationRow> = primary
        .operations
        .iter()
        .enumerate()
        .map(|(index, row)| merge_row(row, secondary.operations.get(index)))
        .collect();

    let merged = CrdtField::new(hasher, operations);
    tracing::trace!(
        rows = merged.row_count(),
        primary_rows = primary.row_count(),
        secondary_rows = secondary.row_count(),
        "merged crdt fields"
    );
    merged
}

fn merge_row(primary: &[Operation], secondary: Option<&OperationRow>) -> OperationRow {
    let mut creators: HashSet<&str> = HashSet::new();
    let mut merged: OperationRow = Vec::with_capacity(primary.len());

    let candidates = primary.iter().chain(secondary.into_iter().flatten());
    for op in candidates {
        if creators.insert(op.creator.as_str()) {
            merged.push(op.clone());
        }
    }

    // stable: equal creators keep their relative order
    merged.sort_by(|x, y| x.creator.cmp(&y.creator));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hash::Blake3Hash, BodyPart};
    use serde_json::json;

    fn op(creator: &str, value: i64) -> Operation {
        Operation::new(BodyPart::set(json!({ "v": value })).into(), creator, 1.0).unwrap()
    }

    fn field(rows: Vec<Vec<Operation>>) -> CrdtField {
        CrdtField::new(&Blake3Hash, rows)
    }

    fn creators(field: &CrdtField) -> Vec<Vec<&str>> {
        field
            .operations
            .iter()
            .map(|row| row.iter().map(|op| op.creator.as_str()).collect())
            .collect()
    }

    #[test]
    fn merge_concurrent_rows() {
        let base = vec![op("x", 0)];
        let a = field(vec![base.clone(), vec![op("b", 1)]]);
        let b = field(vec![base, vec![op("a", 2)]]);

        let merged = merge_fields(&Blake3Hash, &a, &b);
        assert_eq!(creators(&merged), vec![vec!["x"], vec!["a", "b"]]);
        assert!(merged.hash_matches(&Blake3Hash));
    }

    #[test]
    fn longer_log_is_primary() {
        let a = field(vec![vec![op("x", 0)]]);
        let b = field(vec![vec![op("x", 0)], vec![op("y", 1)], vec![op("y", 2)]]);

        let merged = merge_fields(&Blake3Hash, &a, &b);
        assert_eq!(merged.row_count(), 3);
        assert_eq!(merged.operations[2], vec![op("y", 2)]);
    }

    #[test]
    fn same_creator_is_deduplicated() {
        let a = field(vec![vec![op("x", 0)]]);
        let b = field(vec![vec![op("x", 0)]]);
        let merged = merge_fields(&Blake3Hash, &a, &b);
        assert_eq!(merged.operations, vec![vec![op("x", 0)]]);
        assert_eq!(merged.hash, a.hash);
    }

    #[test]
    fn merge_with_empty_log() {
        let a = field(vec![vec![op("x", 0)]]);
        let empty = field(vec![]);
        assert_eq!(merge_fields(&Blake3Hash, &a, &empty), a);
        assert_eq!(merge_fields(&Blake3Hash, &empty, &a), a);
        assert_eq!(merge_fields(&Blake3Hash, &empty, &empty).row_count(), 0);
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        /// Two replicas sharing `shared` rows, then each writing its own rows
        /// with its own actor. Occasionally the other side also has a
        /// concurrent row from a third actor at the same position.
        fn arb_replicas() -> impl Strategy<Value = (CrdtField, CrdtField)> {
            (0usize..4, 0usize..5, 0usize..5, any::<bool>()).prop_map(
                |(shared, left, right, third)| {
                    let common: Vec<OperationRow> =
                        (0..shared).map(|i| vec![op("base", i as i64)]).collect();

                    let mut a = common.clone();
                    a.extend((0..left).map(|i| vec![op("left", i as i64)]));

                    let mut b = common;
                    b.extend((0..right).map(|i| {
                        let mut row = vec![op("right", i as i64)];
                        if third && i == 0 {
                            row.insert(0, op("third", 0));
                        }
                        row
                    }));

                    (field(a), field(b))
                },
            )
        }

        proptest! {
            #[test]
            fn prop_merge_commutative((a, b) in arb_replicas()) {
                let ab = merge_fields(&Blake3Hash, &a, &b);
                let ba = merge_fields(&Blake3Hash, &b, &a);
                prop_assert_eq!(creators(&ab), creators(&ba));
                prop_assert_eq!(&ab.hash, &ba.hash);
                prop_assert_eq!(ab, ba);
            }

            #[test]
            fn prop_merge_idempotent((a, b) in arb_replicas()) {
                let ab = merge_fields(&Blake3Hash, &a, &b);
                let again = merge_fields(&Blake3Hash, &a, &ab);
                prop_assert_eq!(&again, &ab);
                prop_assert_eq!(merge_fields(&Blake3Hash, &ab, &ab), ab);
            }

            #[test]
            fn prop_no_row_loss((a, b) in arb_replicas()) {
                let merged = merge_fields(&Blake3Hash, &a, &b);
                prop_assert!(merged.row_count() >= a.row_count().max(b.row_count()));
            }

            #[test]
            fn prop_rows_deduplicated_and_sorted((a, b) in arb_replicas()) {
                let merged = merge_fields(&Blake3Hash, &a, &b);
                for row in &merged.operations {
                    let names: Vec<&str> = row.iter().map(|op| op.creator.as_str()).collect();
                    let mut sorted = names.clone();
                    sorted.sort_unstable();
                    sorted.dedup();
                    prop_assert_eq!(names, sorted);
                }
                prop_assert!(merged.hash_matches(&Blake3Hash));
            }

            #[test]
            fn prop_three_way_convergence((a, b) in arb_replicas(), extra in 0usize..3) {
                let mut rows = a.operations.clone();
                rows.extend((0..extra).map(|i| vec![op("late", i as i64)]));
                let c = field(rows);

                let left = merge_fields(&Blake3Hash, &merge_fields(&Blake3Hash, &a, &b), &c);
                let right = merge_fields(&Blake3Hash, &a, &merge_fields(&Blake3Hash, &c, &b));
                prop_assert_eq!(creators(&left), creators(&right));
                prop_assert_eq!(left.hash, right.hash);
            }
        }
    }
}
