use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{parse_timestamp, DbConnection};
use crate::error::Result;
use crate::models::User;

#[derive(Clone)]
pub struct UserStore {
    conn: DbConnection,
}

impl UserStore {
    pub fn new(conn: DbConnection) -> Self {
        Self { conn }
    }

    /// Returns the user for `external_id`, creating it on first contact.
    /// A changed display name replaces the stored one.
    pub async fn get_or_create(&self, external_id: &str, display_name: Option<&str>) -> Result<User> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (id, display_name, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET display_name = COALESCE(?2, display_name)",
            params![external_id, display_name, Utc::now().to_rfc3339()],
        )?;
        let user = find_user(&conn, external_id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        Ok(user)
    }

    pub async fn find(&self, external_id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        Ok(find_user(&conn, external_id)?)
    }
}

pub(crate) fn find_user(conn: &Connection, external_id: &str) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        "SELECT id, display_name, created_at FROM users WHERE id = ?",
        [external_id],
        |row| {
            Ok(User {
                id: row.get(0)?,
                display_name: row.get(1)?,
                created_at: parse_timestamp(2, &row.get::<_, String>(2)?)?,
            })
        },
    )
    .optional()
}
