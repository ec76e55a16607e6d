//! Conversions between wire messages and local types.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::{
    sat_relation::RelationType, sat_trans_op, SatOpBegin, SatOpCommit, SatOpDelete, SatOpInsert,
    SatOpLog, SatOpRow, SatOpUpdate, SatRelation, SatRelationColumn, SatTransOp,
};
use crate::types::{ChangeType, Relation, RelationColumn, Row, SqlValue, TableType, Transaction};

fn is_null(bitmask: &[u8], index: usize) -> bool {
    bitmask
        .get(index / 8)
        .is_some_and(|byte| byte & (0x80 >> (index % 8)) != 0)
}

/// Encodes a row in relation column order. Missing columns travel as null.
pub fn serialize_row(record: &Row, relation: &Relation) -> SatOpRow {
    let mut nulls_bitmask = vec![0u8; relation.columns.len().div_ceil(8)];
    let mut values = Vec::with_capacity(relation.columns.len());

    for (index, column) in relation.columns.iter().enumerate() {
        match record.get(&column.name).and_then(SqlValue::to_text) {
            Some(text) => values.push(text.into_bytes()),
            None => {
                nulls_bitmask[index / 8] |= 0x80 >> (index % 8);
                values.push(Vec::new());
            }
        }
    }

    SatOpRow {
        nulls_bitmask,
        values,
    }
}

/// Decodes a row using the relation's column types.
pub fn deserialize_row(row: &SatOpRow, relation: &Relation) -> ProtocolResult<Row> {
    if row.values.len() != relation.columns.len() {
        return Err(ProtocolError::invalid_row(format!(
            "{} values for {} columns of {}",
            row.values.len(),
            relation.columns.len(),
            relation.table
        )));
    }

    relation
        .columns
        .iter()
        .zip(&row.values)
        .enumerate()
        .map(|(index, (column, bytes))| {
            let value = if is_null(&row.nulls_bitmask, index) {
                SqlValue::Null
            } else {
                deserialize_column_data(bytes, &column.column_type)?
            };
            Ok((column.name.clone(), value))
        })
        .collect()
}

fn deserialize_column_data(bytes: &[u8], column_type: &str) -> ProtocolResult<SqlValue> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ProtocolError::invalid_row(format!("value is not utf-8: {e}")))?;

    let base_type = column_type
        .split('(')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_uppercase();

    match base_type.as_str() {
        "CHAR" | "TEXT" | "UUID" | "VARCHAR" => Ok(SqlValue::Text(text.to_string())),
        "INT" | "INT2" | "INT4" | "INT8" | "INTEGER" => text
            .parse()
            .map(SqlValue::Integer)
            .map_err(|e| ProtocolError::invalid_row(format!("bad integer {text:?}: {e}"))),
        "FLOAT4" | "FLOAT8" | "REAL" => text
            .parse()
            .map(SqlValue::Real)
            .map_err(|e| ProtocolError::invalid_row(format!("bad float {text:?}: {e}"))),
        _ => Err(ProtocolError::UnknownDataType(column_type.to_string())),
    }
}

/// Builds a relation from its wire announcement.
pub fn relation_from_message(message: &SatRelation) -> Relation {
    let table_type = match message.table_type() {
        RelationType::Table => TableType::Table,
        RelationType::Index => TableType::Index,
        RelationType::View => TableType::View,
        RelationType::Trigger => TableType::Trigger,
    };

    Relation {
        id: message.relation_id,
        schema: message.schema_name.clone(),
        table: message.table_name.clone(),
        table_type,
        columns: message
            .columns
            .iter()
            .map(|c| RelationColumn::new(c.name.clone(), c.r#type.clone(), c.primary_key))
            .collect(),
    }
}

/// Builds the wire announcement of a relation.
pub fn relation_to_message(relation: &Relation) -> SatRelation {
    let table_type = match relation.table_type {
        TableType::Table => RelationType::Table,
        TableType::Index => RelationType::Index,
        TableType::View => RelationType::View,
        TableType::Trigger => RelationType::Trigger,
    };

    SatRelation {
        schema_name: relation.schema.clone(),
        table_type: table_type as i32,
        table_name: relation.table.clone(),
        relation_id: relation.id,
        columns: relation
            .columns
            .iter()
            .map(|c| SatRelationColumn {
                name: c.name.clone(),
                r#type: c.column_type.clone(),
                primary_key: c.primary_key,
            })
            .collect(),
    }
}

/// Encodes an outbound transaction as a single oplog message:
/// `Begin`, one op per change, `Commit`.
pub fn transaction_to_oplog(transaction: &Transaction) -> SatOpLog {
    let mut ops = Vec::with_capacity(transaction.changes.len() + 2);

    ops.push(SatTransOp {
        op: Some(sat_trans_op::Op::Begin(SatOpBegin {
            commit_timestamp: transaction.commit_timestamp,
            trans_id: String::new(),
            lsn: transaction.lsn.clone(),
        })),
    });

    for change in &transaction.changes {
        let relation_id = change.relation.id;
        let encode = |record: &Option<Row>| {
            record
                .as_ref()
                .map(|r| serialize_row(r, &change.relation))
        };

        let op = match change.change_type {
            ChangeType::Insert => sat_trans_op::Op::Insert(SatOpInsert {
                relation_id,
                row_data: encode(&change.record),
            }),
            ChangeType::Update => sat_trans_op::Op::Update(SatOpUpdate {
                relation_id,
                row_data: encode(&change.record),
                old_row_data: encode(&change.old_record),
            }),
            ChangeType::Delete => sat_trans_op::Op::Delete(SatOpDelete {
                relation_id,
                old_row_data: encode(&change.old_record),
            }),
        };
        ops.push(SatTransOp { op: Some(op) });
    }

    ops.push(SatTransOp {
        op: Some(sat_trans_op::Op::Commit(SatOpCommit {
            commit_timestamp: transaction.commit_timestamp,
            trans_id: String::new(),
            lsn: transaction.lsn.clone(),
        })),
    });

    SatOpLog { ops }
}
