use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{parse_timestamp, parse_uuid, DbConnection};
use crate::error::{AppError, Result};
use crate::models::AccessToken;
use crate::users::find_user;

pub const TOKEN_LIFETIME_HOURS: i64 = 24;
const SECRET_LEN: usize = 43;

const TOKEN_COLUMNS: &str = "id, user_id, secret, created_at, expires_at, active";

pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}

#[derive(Clone)]
pub struct TokenStore {
    conn: DbConnection,
}

impl TokenStore {
    pub fn new(conn: DbConnection) -> Self {
        Self { conn }
    }

    pub async fn get_valid_token(&self, user_id: &str) -> Result<Option<AccessToken>> {
        self.get_valid_token_at(user_id, Utc::now()).await
    }

    pub async fn get_valid_token_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccessToken>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOKEN_COLUMNS} FROM access_tokens WHERE user_id = ? AND active = 1"
        ))?;
        let tokens = stmt
            .query_map([user_id], token_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tokens.into_iter().find(|token| token.is_valid_at(now)))
    }

    /// Most recently issued token for the user, valid or not.
    pub async fn latest_token(&self, user_id: &str) -> Result<Option<AccessToken>> {
        let conn = self.conn.lock().await;
        let token = conn
            .query_row(
                &format!(
                    "SELECT {TOKEN_COLUMNS} FROM access_tokens WHERE user_id = ?
                     ORDER BY rowid DESC LIMIT 1"
                ),
                [user_id],
                token_from_row,
            )
            .optional()?;
        Ok(token)
    }

    pub async fn issue_token(&self, user_id: &str, secret: Option<&str>) -> Result<AccessToken> {
        self.issue_token_at(user_id, secret, Utc::now()).await
    }

    pub async fn issue_token_at(
        &self,
        user_id: &str,
        secret: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AccessToken> {
        let mut conn = self.conn.lock().await;
        let token = issue_locked(&mut conn, user_id, secret, now)?;
        tracing::info!(user_id, expires_at = %token.expires_at, "access token issued");
        Ok(token)
    }

    /// Confirms a verification round trip for `user_id`.
    pub async fn activate_from_callback(&self, user_id: &str, secret: &str) -> Result<AccessToken> {
        let mut conn = self.conn.lock().await;
        if find_user(&conn, user_id)?.is_none() {
            return Err(AppError::UserNotFound(user_id.to_string()));
        }
        let token = issue_locked(&mut conn, user_id, Some(secret), Utc::now())?;
        tracing::info!(user_id, expires_at = %token.expires_at, "access token activated from callback");
        Ok(token)
    }
}

/// Deactivates every active token of the user and inserts a fresh one, as one transaction.
fn issue_locked(
    conn: &mut Connection,
    user_id: &str,
    secret: Option<&str>,
    now: DateTime<Utc>,
) -> rusqlite::Result<AccessToken> {
    let tx = conn.transaction()?;

    let secret = match secret {
        Some(secret) if !secret_exists(&tx, secret)? => secret.to_string(),
        Some(_) => {
            // Replayed callback: the secret was already issued once.
            tracing::debug!(user_id, "secret already issued, minting a fresh one");
            generate_secret()
        }
        None => generate_secret(),
    };

    let deactivated = tx.execute(
        "UPDATE access_tokens SET active = 0 WHERE user_id = ? AND active = 1",
        [user_id],
    )?;

    let token = AccessToken {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        secret,
        created_at: now,
        expires_at: now + Duration::hours(TOKEN_LIFETIME_HOURS),
        active: true,
    };
    tx.execute(
        "INSERT INTO access_tokens (id, user_id, secret, created_at, expires_at, active)
         VALUES (?, ?, ?, ?, ?, 1)",
        params![
            token.id.to_string(),
            token.user_id,
            token.secret,
            token.created_at.to_rfc3339(),
            token.expires_at.to_rfc3339(),
        ],
    )?;
    tx.commit()?;

    tracing::debug!(user_id, deactivated, "previous tokens deactivated");
    Ok(token)
}

fn secret_exists(conn: &Connection, secret: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM access_tokens WHERE secret = ?)",
        [secret],
        |row| row.get(0),
    )
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<AccessToken> {
    Ok(AccessToken {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        user_id: row.get(1)?,
        secret: row.get(2)?,
        created_at: parse_timestamp(3, &row.get::<_, String>(3)?)?,
        expires_at: parse_timestamp(4, &row.get::<_, String>(4)?)?,
        active: row.get(5)?,
    })
}
