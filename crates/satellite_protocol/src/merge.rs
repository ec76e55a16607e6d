//! Cross-peer merge rules.
//!
//! Conflicts are resolved per column, not per row: each column keeps the
//! value with the later write timestamp, so two peers editing disjoint
//! columns of a row converge on a row carrying both edits. Operation types
//! merge add-wins: a row survives unless both sides deleted it.

use crate::oplog::{
    operations_to_table_changes, ChangesOpType, OplogColumnChanges, OplogEntry, OplogTableChanges,
};

/// Merges two column change sets, keeping the later write for every column.
///
/// A column present on one side only is taken unchanged. When both sides
/// carry the same timestamp the `second` change wins.
pub fn merge_changes_last_write_wins(
    first: &OplogColumnChanges,
    second: &OplogColumnChanges,
) -> OplogColumnChanges {
    let mut merged = first.clone();
    for (column, change) in second {
        match merged.get(column) {
            Some(existing) if existing.timestamp > change.timestamp => {}
            _ => {
                merged.insert(column.clone(), change.clone());
            }
        }
    }
    merged
}

/// Add-wins merge of two operation types: `Delete` only if both deleted.
pub fn merge_op_types_add_wins(first: ChangesOpType, second: ChangesOpType) -> ChangesOpType {
    match (first, second) {
        (ChangesOpType::Delete, ChangesOpType::Delete) => ChangesOpType::Delete,
        _ => ChangesOpType::Upsert,
    }
}

/// Merges local pending entries against incoming remote entries.
///
/// The result holds exactly the incoming rows; rows that also changed
/// locally carry the merged columns and operation type. Rows changed only
/// locally are already in the database and are left out.
pub fn merge_entries(local: &[OplogEntry], incoming: &[OplogEntry]) -> OplogTableChanges {
    let local_changes = operations_to_table_changes(local);
    let mut incoming_changes = operations_to_table_changes(incoming);

    for (table, incoming_rows) in incoming_changes.iter_mut() {
        let Some(local_rows) = local_changes.get(table) else {
            continue;
        };

        for (key, incoming_row) in incoming_rows.iter_mut() {
            let Some(local_row) = local_rows.get(key) else {
                continue;
            };

            incoming_row.changes =
                merge_changes_last_write_wins(&local_row.changes, &incoming_row.changes);
            incoming_row.optype = merge_op_types_add_wins(local_row.optype, incoming_row.optype);
        }
    }

    incoming_changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::{timestamp_from_millis, OpType, OplogColumnChange};
    use crate::types::{row, QualifiedTablename, Row, SqlValue};
    use proptest::prelude::*;

    fn changes(pairs: &[(&str, SqlValue, i64)]) -> OplogColumnChanges {
        pairs
            .iter()
            .map(|(c, v, t)| (c.to_string(), OplogColumnChange::new(v.clone(), *t)))
            .collect()
    }

    fn entry(optype: OpType, millis: i64, new_row: Option<Row>, old_row: Option<Row>) -> OplogEntry {
        OplogEntry {
            namespace: "main".into(),
            tablename: "parent".into(),
            primary_key: row([("id", SqlValue::Integer(1))]),
            rowid: 1,
            optype,
            timestamp: Some(timestamp_from_millis(millis).unwrap()),
            new_row,
            old_row,
        }
    }

    #[test]
    fn add_wins_table() {
        use ChangesOpType::*;
        assert_eq!(merge_op_types_add_wins(Delete, Delete), Delete);
        assert_eq!(merge_op_types_add_wins(Upsert, Delete), Upsert);
        assert_eq!(merge_op_types_add_wins(Delete, Upsert), Upsert);
        assert_eq!(merge_op_types_add_wins(Upsert, Upsert), Upsert);
    }

    #[test]
    fn later_timestamp_wins_per_column() {
        let local = changes(&[
            ("value", SqlValue::from("local"), 10),
            ("other", SqlValue::Integer(1), 10),
        ]);
        let incoming = changes(&[("value", SqlValue::from("incoming"), 11)]);

        let merged = merge_changes_last_write_wins(&local, &incoming);
        assert_eq!(merged["value"], OplogColumnChange::new("incoming", 11));
        assert_eq!(merged["other"], OplogColumnChange::new(1i64, 10));
    }

    #[test]
    fn tie_goes_to_second() {
        let a = changes(&[("value", SqlValue::from("a"), 5)]);
        let b = changes(&[("value", SqlValue::from("b"), 5)]);
        assert_eq!(merge_changes_last_write_wins(&a, &b)["value"].value, SqlValue::from("b"));
        assert_eq!(merge_changes_last_write_wins(&b, &a)["value"].value, SqlValue::from("a"));
    }

    #[test]
    fn cross_peer_merge() {
        let local = vec![entry(
            OpType::Insert,
            10,
            Some(row([
                ("id", SqlValue::Integer(1)),
                ("value", SqlValue::from("local")),
                ("other", SqlValue::Integer(1)),
            ])),
            None,
        )];
        let incoming = vec![entry(
            OpType::Update,
            11,
            Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("incoming"))])),
            Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("local"))])),
        )];

        let merged = merge_entries(&local, &incoming);
        let row_changes = &merged[&QualifiedTablename::new("main", "parent")]["1"];
        assert_eq!(row_changes.optype, ChangesOpType::Upsert);
        assert_eq!(row_changes.changes["value"], OplogColumnChange::new("incoming", 11));
        assert_eq!(row_changes.changes["other"], OplogColumnChange::new(1i64, 10));
    }

    #[test]
    fn insert_wins_over_delete_and_restores_values() {
        let old = row([
            ("id", SqlValue::Integer(1)),
            ("value", SqlValue::from("local")),
            ("otherValue", SqlValue::Integer(1)),
        ]);
        let local = vec![
            entry(OpType::Insert, 1, Some(old.clone()), None),
            entry(OpType::Delete, 2, None, Some(old)),
        ];
        let incoming = vec![entry(
            OpType::Insert,
            3,
            Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("incoming"))])),
            None,
        )];

        let merged = merge_entries(&local, &incoming);
        let row_changes = &merged[&QualifiedTablename::new("main", "parent")]["1"];
        assert_eq!(row_changes.optype, ChangesOpType::Upsert);
        assert_eq!(row_changes.changes["value"].value, SqlValue::from("incoming"));
        assert_eq!(row_changes.changes["otherValue"].value, SqlValue::Integer(1));
    }

    #[test]
    fn local_only_rows_are_not_in_result() {
        let local = vec![entry(
            OpType::Insert,
            1,
            Some(row([("id", SqlValue::Integer(1))])),
            None,
        )];
        let merged = merge_entries(&local, &[]);
        assert!(merged.is_empty());
    }

    fn column_changes() -> impl Strategy<Value = OplogColumnChanges> {
        prop::collection::btree_map(
            prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(String::from),
            (any::<i64>(), 0i64..1000).prop_map(|(v, t)| OplogColumnChange::new(v, t)),
            0..4,
        )
    }

    proptest! {
        #[test]
        fn merge_commutes_except_on_ties(a in column_changes(), b in column_changes()) {
            let ab = merge_changes_last_write_wins(&a, &b);
            let ba = merge_changes_last_write_wins(&b, &a);

            prop_assert_eq!(ab.len(), ba.len());
            for (column, change) in &ab {
                let tie = matches!(
                    (a.get(column), b.get(column)),
                    (Some(x), Some(y)) if x.timestamp == y.timestamp
                );
                if !tie {
                    prop_assert_eq!(Some(change), ba.get(column));
                }
            }
        }

        #[test]
        fn one_sided_columns_pass_through(a in column_changes(), b in column_changes()) {
            let merged = merge_changes_last_write_wins(&a, &b);
            for (column, change) in &a {
                if !b.contains_key(column) {
                    prop_assert_eq!(Some(change), merged.get(column));
                }
            }
            for (column, change) in &b {
                if !a.contains_key(column) {
                    prop_assert_eq!(Some(change), merged.get(column));
                }
            }
        }
    }
}
