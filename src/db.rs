use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{types::Type, Connection, Result};
use tokio::sync::Mutex;

pub type DbConnection = Arc<Mutex<Connection>>;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        display_name TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS access_tokens (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        secret TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        active INTEGER NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users (id)
    );

    CREATE UNIQUE INDEX IF NOT EXISTS access_tokens_one_active
        ON access_tokens (user_id) WHERE active = 1;

    CREATE TABLE IF NOT EXISTS bundles (
        id TEXT PRIMARY KEY,
        creator_id TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY (creator_id) REFERENCES users (id)
    );

    CREATE TABLE IF NOT EXISTS media_items (
        id TEXT PRIMARY KEY,
        bundle_id TEXT,
        position INTEGER NOT NULL,
        name TEXT NOT NULL CHECK (length(name) > 0),
        kind TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        size INTEGER NOT NULL,
        transport_ref TEXT NOT NULL CHECK (length(transport_ref) > 0),
        uploader_id TEXT NOT NULL,
        caption TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY (bundle_id) REFERENCES bundles (id),
        FOREIGN KEY (uploader_id) REFERENCES users (id)
    );

    CREATE INDEX IF NOT EXISTS media_items_bundle ON media_items (bundle_id, position);

    CREATE TABLE IF NOT EXISTS access_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        media_item_id TEXT,
        action TEXT NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users (id)
    );
";

pub fn establish_connection(path: impl AsRef<Path>) -> Result<DbConnection> {
    let conn = Connection::open(path)?;
    init(conn)
}

pub fn open_in_memory() -> Result<DbConnection> {
    init(Connection::open_in_memory()?)
}

fn init(conn: Connection) -> Result<DbConnection> {
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.execute_batch(SCHEMA)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Parses an RFC 3339 column written by this crate.
pub fn parse_timestamp(idx: usize, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn parse_uuid(idx: usize, value: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
