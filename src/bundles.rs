use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{parse_timestamp, parse_uuid, DbConnection};
use crate::error::{AppError, Result};
use crate::models::{Bundle, FileDescriptor, MediaItem};

const MAX_FILENAME_LEN: usize = 100;
const BUNDLE_SUFFIX_LEN: usize = 8;

const ITEM_COLUMNS: &str =
    "id, bundle_id, name, kind, mime_type, size, transport_ref, uploader_id, caption, created_at";

pub fn generate_bundle_id(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(BUNDLE_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("bundle_{}_{}", now.timestamp(), suffix)
}

/// Replaces path and shell metacharacters and caps the length, keeping the extension.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c => c,
        })
        .collect();
    if sanitized.chars().count() <= MAX_FILENAME_LEN {
        return sanitized;
    }
    match sanitized.rsplit_once('.') {
        Some((stem, ext)) => {
            let stem: String = stem.chars().take(95).collect();
            format!("{stem}.{ext}")
        }
        None => sanitized.chars().take(95).collect(),
    }
}

#[derive(Clone)]
pub struct BundleStore {
    conn: DbConnection,
}

impl BundleStore {
    pub fn new(conn: DbConnection) -> Self {
        Self { conn }
    }

    /// Persists a bundle and all of its items in one transaction.
    pub async fn finalize_bundle(
        &self,
        creator_id: &str,
        items: &[FileDescriptor],
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Bundle> {
        if items.is_empty() {
            return Err(AppError::EmptyCollection);
        }

        let now = Utc::now();
        let mut bundle = Bundle {
            id: generate_bundle_id(now),
            creator_id: creator_id.to_string(),
            title: title
                .map(str::to_string)
                .unwrap_or_else(|| format!("Bundle of {} files", items.len())),
            description: description.map(str::to_string),
            created_at: now,
            items: Vec::with_capacity(items.len()),
        };

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO bundles (id, creator_id, title, description, created_at) VALUES (?, ?, ?, ?, ?)",
            params![
                bundle.id,
                bundle.creator_id,
                bundle.title,
                bundle.description,
                now.to_rfc3339()
            ],
        )?;
        for (position, descriptor) in items.iter().enumerate() {
            let item = new_item(descriptor, creator_id, Some(&bundle.id), now);
            insert_item(&tx, &item, position)?;
            bundle.items.push(item);
        }
        tx.commit()?;

        tracing::info!(bundle_id = %bundle.id, items = bundle.items.len(), "bundle finalized");
        Ok(bundle)
    }

    /// Persists a standalone item, addressable through a single-media link.
    pub async fn publish_single(
        &self,
        uploader_id: &str,
        descriptor: &FileDescriptor,
    ) -> Result<MediaItem> {
        let item = new_item(descriptor, uploader_id, None, Utc::now());
        let conn = self.conn.lock().await;
        insert_item(&conn, &item, 0)?;
        tracing::info!(item_id = %item.id, "standalone media item published");
        Ok(item)
    }

    pub async fn lookup_bundle(&self, bundle_id: &str) -> Result<Option<Bundle>> {
        let bundle = self
            .conn
            .lock()
            .await
            .query_row(
                "SELECT id, creator_id, title, description, created_at FROM bundles WHERE id = ?",
                [bundle_id],
                |row| {
                    Ok(Bundle {
                        id: row.get(0)?,
                        creator_id: row.get(1)?,
                        title: row.get(2)?,
                        description: row.get(3)?,
                        created_at: parse_timestamp(4, &row.get::<_, String>(4)?)?,
                        items: Vec::new(),
                    })
                },
            )
            .optional()?;

        // Bundles are immutable once committed, so reading the items separately is safe.
        match bundle {
            Some(mut bundle) => {
                bundle.items = self.lookup_bundle_items(bundle_id).await?;
                Ok(Some(bundle))
            }
            None => Ok(None),
        }
    }

    pub async fn lookup_bundle_items(&self, bundle_id: &str) -> Result<Vec<MediaItem>> {
        let conn = self.conn.lock().await;
        Ok(bundle_items(&conn, bundle_id)?)
    }

    pub async fn lookup_media_item(&self, item_id: &str) -> Result<Option<MediaItem>> {
        let conn = self.conn.lock().await;
        let item = conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM media_items WHERE id = ?"),
                [item_id],
                item_from_row,
            )
            .optional()?;
        Ok(item)
    }
}

fn new_item(
    descriptor: &FileDescriptor,
    uploader_id: &str,
    bundle_id: Option<&str>,
    now: DateTime<Utc>,
) -> MediaItem {
    let name = sanitize_filename(&descriptor.name);
    let mime_type = mime_guess::from_path(&name)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    MediaItem {
        id: Uuid::new_v4(),
        bundle_id: bundle_id.map(str::to_string),
        name,
        kind: descriptor.kind,
        mime_type,
        size: descriptor.size,
        transport_ref: descriptor.transport_ref.clone(),
        uploader_id: uploader_id.to_string(),
        caption: descriptor.caption.clone(),
        created_at: now,
    }
}

fn insert_item(conn: &Connection, item: &MediaItem, position: usize) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO media_items (id, bundle_id, position, name, kind, mime_type, size, transport_ref, uploader_id, caption, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            item.id.to_string(),
            item.bundle_id,
            position as i64,
            item.name,
            item.kind.as_str(),
            item.mime_type,
            item.size,
            item.transport_ref,
            item.uploader_id,
            item.caption,
            item.created_at.to_rfc3339()
        ],
    )?;
    Ok(())
}

fn bundle_items(conn: &Connection, bundle_id: &str) -> rusqlite::Result<Vec<MediaItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM media_items WHERE bundle_id = ? ORDER BY position"
    ))?;
    let items = stmt.query_map([bundle_id], item_from_row)?;
    items.collect()
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<MediaItem> {
    let kind: String = row.get(3)?;
    Ok(MediaItem {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        bundle_id: row.get(1)?,
        name: row.get(2)?,
        kind: kind
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        mime_type: row.get(4)?,
        size: row.get(5)?,
        transport_ref: row.get(6)?,
        uploader_id: row.get(7)?,
        caption: row.get(8)?,
        created_at: parse_timestamp(9, &row.get::<_, String>(9)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::models::MediaKind;
    use crate::test_support::{descriptor, sample_descriptors, seeded_db};

    async fn row_count(db: &DbConnection, table: &str) -> i64 {
        db.lock()
            .await
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn finalize_writes_bundle_and_items_in_order() {
        let db = seeded_db().await;
        let store = BundleStore::new(db.clone());

        let bundle = store
            .finalize_bundle("admin", &sample_descriptors(), Some("Holiday"), None)
            .await
            .unwrap();

        assert!(bundle.id.starts_with("bundle_"));
        assert_eq!(bundle.title, "Holiday");
        let names: Vec<_> = bundle.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["a.jpg", "b.mp4", "c.pdf"]);
        assert_eq!(bundle.items[0].mime_type, "image/jpeg");
        assert_eq!(bundle.items[2].kind, MediaKind::Document);

        let loaded = store.lookup_bundle(&bundle.id).await.unwrap().unwrap();
        assert_eq!(loaded, bundle);
        assert_eq!(store.lookup_bundle_items(&bundle.id).await.unwrap(), bundle.items);

        let item = &bundle.items[1];
        let found = store.lookup_media_item(&item.id.to_string()).await.unwrap();
        assert_eq!(found.as_ref(), Some(item));
    }

    #[tokio::test]
    async fn empty_input_creates_nothing() {
        let db = seeded_db().await;
        let store = BundleStore::new(db.clone());
        let err = store.finalize_bundle("admin", &[], None, None).await.unwrap_err();
        assert!(matches!(err, AppError::EmptyCollection));
        assert_eq!(row_count(&db, "bundles").await, 0);
    }

    #[tokio::test]
    async fn failed_item_rolls_back_the_whole_bundle() {
        let db = seeded_db().await;
        let store = BundleStore::new(db.clone());
        let mut items = sample_descriptors();
        items[2].transport_ref = String::new();

        let err = store.finalize_bundle("admin", &items, None, None).await.unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)));
        assert_eq!(row_count(&db, "bundles").await, 0);
        assert_eq!(row_count(&db, "media_items").await, 0);
    }

    #[tokio::test]
    async fn lookups_of_unknown_ids_are_empty() {
        let store = BundleStore::new(open_in_memory().unwrap());
        assert!(store.lookup_bundle("bundle_0_missing").await.unwrap().is_none());
        assert!(store.lookup_bundle_items("bundle_0_missing").await.unwrap().is_empty());
        assert!(store.lookup_media_item("not-a-uuid").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn standalone_items_have_no_bundle() {
        let db = seeded_db().await;
        let store = BundleStore::new(db);
        let item = store
            .publish_single("admin", &descriptor("song.mp3", MediaKind::Audio))
            .await
            .unwrap();
        assert_eq!(item.bundle_id, None);
        assert_eq!(item.mime_type, "audio/mpeg");
        let found = store.lookup_media_item(&item.id.to_string()).await.unwrap();
        assert_eq!(found, Some(item));
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("a/b:c?.txt"), "a_b_c_.txt");
        let long = format!("{}.mkv", "x".repeat(150));
        let sanitized = sanitize_filename(&long);
        assert_eq!(sanitized.len(), 99);
        assert!(sanitized.ends_with(".mkv"));
    }

    #[test]
    fn bundle_ids_are_traceable() {
        let now = Utc::now();
        let id = generate_bundle_id(now);
        let parts: Vec<_> = id.splitn(3, '_').collect();
        assert_eq!(parts[0], "bundle");
        assert_eq!(parts[1], now.timestamp().to_string());
        assert_eq!(parts[2].len(), BUNDLE_SUFFIX_LEN);
        assert_ne!(id, generate_bundle_id(now));
    }
}
