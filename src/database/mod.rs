pub mod repo;
pub mod schema;

use std::time::Duration;

use rusqlite::Connection;

use crate::database::schema::SCHEMA;

pub use repo::{
    Classification, ClassificationView, ComputationRecord, ComputationView, EventObservation,
    RecordOutcome, ResultStore, SqliteStore,
};

/// Opens (or creates) the database and makes sure every table exists.
pub fn open_connection(path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    // Workers on other threads share the file.
    conn.busy_timeout(Duration::from_secs(5))?;
    // The pragma answers with the resulting mode ("memory" for in-memory databases).
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}
