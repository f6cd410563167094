pub mod prefs;
pub mod schema;
pub mod settings;

use rusqlite::Connection;
use std::path::Path;

pub use prefs::{Preferences, Viewport};

/// File name of the preferences database inside the data directory.
pub const DB_FILE_NAME: &str = "deckterm.db";

pub fn open(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    schema::initialize(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    schema::initialize(&conn)?;
    Ok(conn)
}
