//! CLI command implementations.

pub mod dump_oplog;
pub mod inspect;
pub mod migrate;

use satellite_engine::SqliteAdapter;
use std::path::Path;
use std::sync::Arc;

/// Result type of every command.
pub type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Opens a database that must already exist.
pub fn open_existing(path: &Path) -> CommandResult<Arc<SqliteAdapter>> {
    if !path.exists() {
        return Err(format!("No database found at {:?}", path).into());
    }
    Ok(Arc::new(SqliteAdapter::open(path)?))
}
