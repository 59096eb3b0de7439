use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use crate::db::{parse_timestamp, parse_uuid, DbConnection};
use crate::error::Result;
use crate::models::AccessLogEntry;

pub const ADS_VERIFICATION: &str = "ads_verification";
pub const TOKEN_REFRESH: &str = "token_refresh";
pub const FILE_ACCESS: &str = "file_access";

/// Append-only access trail.
#[derive(Clone)]
pub struct AuditLog {
    conn: DbConnection,
}

impl AuditLog {
    pub fn new(conn: DbConnection) -> Self {
        Self { conn }
    }

    pub async fn record(&self, user_id: &str, media_item_id: Option<Uuid>, action: &str) -> Result<()> {
        self.conn.lock().await.execute(
            "INSERT INTO access_logs (user_id, media_item_id, action, created_at) VALUES (?, ?, ?, ?)",
            params![
                user_id,
                media_item_id.map(|id| id.to_string()),
                action,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Records without failing the caller; the trail is best effort.
    pub async fn record_quietly(&self, user_id: &str, media_item_id: Option<Uuid>, action: &str) {
        if let Err(e) = self.record(user_id, media_item_id, action).await {
            tracing::warn!(user_id, action, error = %e, "failed to append access log");
        }
    }

    pub async fn entries_for_user(&self, user_id: &str) -> Result<Vec<AccessLogEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, media_item_id, action, created_at FROM access_logs
             WHERE user_id = ? ORDER BY id",
        )?;
        let entries = stmt
            .query_map([user_id], |row| {
                let media_item_id: Option<String> = row.get(2)?;
                Ok(AccessLogEntry {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    media_item_id: media_item_id.map(|id| parse_uuid(2, &id)).transpose()?,
                    action: row.get(3)?,
                    created_at: parse_timestamp(4, &row.get::<_, String>(4)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::seeded_db;

    #[tokio::test]
    async fn entries_come_back_in_append_order() {
        let log = AuditLog::new(seeded_db().await);
        let item = Uuid::new_v4();
        log.record("viewer", None, ADS_VERIFICATION).await.unwrap();
        log.record("viewer", Some(item), FILE_ACCESS).await.unwrap();
        log.record("admin", None, TOKEN_REFRESH).await.unwrap();

        let entries = log.entries_for_user("viewer").await.unwrap();
        let actions: Vec<_> = entries.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, [ADS_VERIFICATION, FILE_ACCESS]);
        assert_eq!(entries[1].media_item_id, Some(item));
    }

    #[tokio::test]
    async fn quiet_recording_swallows_failures() {
        let log = AuditLog::new(seeded_db().await);
        // Unknown users violate the foreign key.
        log.record_quietly("nobody", None, FILE_ACCESS).await;
        assert!(log.entries_for_user("nobody").await.unwrap().is_empty());
    }
}
