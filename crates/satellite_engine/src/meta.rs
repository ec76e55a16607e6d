//! Replication bookkeeping stored in the meta key/value table.

use crate::adapter::{Executor, Statement};
use crate::error::{SatelliteError, SatelliteResult};
use satellite_protocol::{quote_identifier, Lsn, SqlValue};
use std::fmt;

/// Keys of the meta table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKey {
    /// `1` when foreign key compensation is on.
    Compensations,
    /// Highest local rowid the server acknowledged.
    LastAckdRowId,
    /// Highest local rowid sent to the server.
    LastSentRowId,
    /// Position of the last applied inbound transaction.
    Lsn,
    /// Identity of this client.
    ClientId,
    /// Access token.
    Token,
    /// Refresh token.
    RefreshToken,
}

impl MetaKey {
    /// Key as stored in the table.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetaKey::Compensations => "compensations",
            MetaKey::LastAckdRowId => "lastAckdRowId",
            MetaKey::LastSentRowId => "lastSentRowId",
            MetaKey::Lsn => "lsn",
            MetaKey::ClientId => "clientId",
            MetaKey::Token => "token",
            MetaKey::RefreshToken => "refreshToken",
        }
    }

    /// Every key, in the order the system migration seeds them.
    pub fn all() -> [MetaKey; 7] {
        [
            MetaKey::Compensations,
            MetaKey::LastAckdRowId,
            MetaKey::LastSentRowId,
            MetaKey::Lsn,
            MetaKey::ClientId,
            MetaKey::Token,
            MetaKey::RefreshToken,
        ]
    }
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed access to the meta table.
///
/// Every method takes the executor to run on, so reads and writes join
/// whatever transaction the caller has open.
#[derive(Debug, Clone)]
pub struct MetaState {
    table: String,
}

impl MetaState {
    /// Accesses the meta table named `table`.
    pub fn new(table: &str) -> Self {
        Self {
            table: quote_identifier(table),
        }
    }

    /// Reads a raw value. Missing keys read as `None`.
    pub fn get<E: Executor + ?Sized>(
        &self,
        db: &E,
        key: MetaKey,
    ) -> SatelliteResult<Option<SqlValue>> {
        let rows = db.query(&Statement::with_args(
            format!("SELECT value FROM {} WHERE key = ?", self.table),
            vec![key.as_str().into()],
        ))?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|mut row| row.remove("value")))
    }

    /// Writes a value, inserting the key if needed.
    pub fn set<E: Executor + ?Sized>(
        &self,
        db: &E,
        key: MetaKey,
        value: SqlValue,
    ) -> SatelliteResult<()> {
        db.run(&Statement::with_args(
            format!(
                "INSERT INTO {} (key, value) VALUES (?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                self.table
            ),
            vec![key.as_str().into(), value],
        ))?;
        Ok(())
    }

    /// Reads a value as text. Empty text reads as `None`.
    pub fn get_text<E: Executor + ?Sized>(
        &self,
        db: &E,
        key: MetaKey,
    ) -> SatelliteResult<Option<String>> {
        Ok(match self.get(db, key)? {
            Some(SqlValue::Text(s)) if !s.is_empty() => Some(s),
            Some(SqlValue::Blob(b)) if !b.is_empty() => {
                Some(String::from_utf8_lossy(&b).into_owned())
            }
            Some(SqlValue::Integer(i)) => Some(i.to_string()),
            _ => None,
        })
    }

    /// Reads a row id cursor. Missing or empty values read as `0`.
    pub fn get_row_id<E: Executor + ?Sized>(&self, db: &E, key: MetaKey) -> SatelliteResult<u64> {
        match self.get_text(db, key)? {
            None => Ok(0),
            Some(text) => text.parse().map_err(|_| {
                SatelliteError::InvalidSchema(format!("meta {key} is not a row id: {text:?}"))
            }),
        }
    }

    /// Writes a row id cursor. Cursors are stored as text.
    pub fn set_row_id<E: Executor + ?Sized>(
        &self,
        db: &E,
        key: MetaKey,
        rowid: u64,
    ) -> SatelliteResult<()> {
        self.set(db, key, SqlValue::Text(rowid.to_string()))
    }

    /// Reads the last applied inbound position.
    pub fn get_lsn<E: Executor + ?Sized>(&self, db: &E) -> SatelliteResult<Option<Lsn>> {
        Ok(match self.get(db, MetaKey::Lsn)? {
            Some(SqlValue::Blob(b)) if !b.is_empty() => Some(b),
            Some(SqlValue::Text(s)) if !s.is_empty() => Some(s.into_bytes()),
            _ => None,
        })
    }

    /// Records the last applied inbound position.
    pub fn set_lsn<E: Executor + ?Sized>(&self, db: &E, lsn: &[u8]) -> SatelliteResult<()> {
        self.set(db, MetaKey::Lsn, SqlValue::Blob(lsn.to_vec()))
    }

    /// Returns true when foreign key compensation is on.
    pub fn compensations_enabled<E: Executor + ?Sized>(&self, db: &E) -> SatelliteResult<bool> {
        Ok(self.get(db, MetaKey::Compensations)?.and_then(|v| v.as_i64()) == Some(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteAdapter;

    fn setup() -> (SqliteAdapter, MetaState) {
        let db = SqliteAdapter::open_in_memory().unwrap();
        db.run(&"CREATE TABLE _electric_meta (key TEXT PRIMARY KEY, value BLOB)".into())
            .unwrap();
        (db, MetaState::new("_electric_meta"))
    }

    #[test]
    fn missing_keys() {
        let (db, meta) = setup();
        assert_eq!(meta.get(&db, MetaKey::Token).unwrap(), None);
        assert_eq!(meta.get_row_id(&db, MetaKey::LastAckdRowId).unwrap(), 0);
        assert_eq!(meta.get_lsn(&db).unwrap(), None);
        assert!(!meta.compensations_enabled(&db).unwrap());
    }

    #[test]
    fn set_overwrites() {
        let (db, meta) = setup();
        meta.set_row_id(&db, MetaKey::LastAckdRowId, 2).unwrap();
        meta.set_row_id(&db, MetaKey::LastAckdRowId, 5).unwrap();

        assert_eq!(
            meta.get(&db, MetaKey::LastAckdRowId).unwrap(),
            Some(SqlValue::from("5"))
        );
        assert_eq!(meta.get_row_id(&db, MetaKey::LastAckdRowId).unwrap(), 5);
    }

    #[test]
    fn lsn_is_stored_as_bytes() {
        let (db, meta) = setup();
        meta.set_lsn(&db, &[0, 1, 2]).unwrap();
        assert_eq!(meta.get_lsn(&db).unwrap(), Some(vec![0, 1, 2]));
    }

    #[test]
    fn compensation_flag_accepts_text_and_integer() {
        let (db, meta) = setup();
        meta.set(&db, MetaKey::Compensations, SqlValue::Integer(1)).unwrap();
        assert!(meta.compensations_enabled(&db).unwrap());

        meta.set(&db, MetaKey::Compensations, SqlValue::from("0")).unwrap();
        assert!(!meta.compensations_enabled(&db).unwrap());
    }

    #[test]
    fn garbage_cursor_is_rejected() {
        let (db, meta) = setup();
        meta.set(&db, MetaKey::LastSentRowId, SqlValue::from("abc")).unwrap();
        assert!(matches!(
            meta.get_row_id(&db, MetaKey::LastSentRowId),
            Err(SatelliteError::InvalidSchema(_))
        ));
    }
}
