//! Fixtures and collaborator doubles shared by the unit tests.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::db::{open_in_memory, DbConnection};
use crate::error::{AppError, Result};
use crate::models::{FileDescriptor, MediaItem, MediaKind};
use crate::shortener::AdLinkShortener;
use crate::transport::ContentTransport;
use crate::users::UserStore;

/// In-memory database with an `admin` uploader and a `viewer` end user.
pub async fn seeded_db() -> DbConnection {
    let db = open_in_memory().unwrap();
    let users = UserStore::new(db.clone());
    users.get_or_create("admin", Some("Admin")).await.unwrap();
    users.get_or_create("viewer", Some("Viewer")).await.unwrap();
    db
}

pub fn descriptor(name: &str, kind: MediaKind) -> FileDescriptor {
    FileDescriptor {
        name: name.to_string(),
        kind,
        size: 1024,
        transport_ref: format!("ref-{name}"),
        caption: None,
    }
}

pub fn sample_descriptors() -> Vec<FileDescriptor> {
    vec![
        descriptor("a.jpg", MediaKind::Photo),
        descriptor("b.mp4", MediaKind::Video),
        descriptor("c.pdf", MediaKind::Document),
    ]
}

pub fn media_item(name: &str, kind: MediaKind) -> MediaItem {
    MediaItem {
        id: Uuid::new_v4(),
        bundle_id: None,
        name: name.to_string(),
        kind,
        mime_type: "application/octet-stream".to_string(),
        size: 1024,
        transport_ref: format!("ref-{name}"),
        uploader_id: "admin".to_string(),
        caption: None,
        created_at: Utc::now(),
    }
}

pub struct StaticShortener {
    url: String,
    last_destination: Mutex<Option<String>>,
}

impl StaticShortener {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            last_destination: Mutex::new(None),
        }
    }

    pub fn last_destination(&self) -> Option<String> {
        self.last_destination.lock().unwrap().clone()
    }
}

#[async_trait]
impl AdLinkShortener for StaticShortener {
    async fn create_ads_link(&self, destination: &str) -> Result<String> {
        *self.last_destination.lock().unwrap() = Some(destination.to_string());
        Ok(self.url.clone())
    }
}

pub struct FailingShortener;

#[async_trait]
impl AdLinkShortener for FailingShortener {
    async fn create_ads_link(&self, _destination: &str) -> Result<String> {
        Err(AppError::ExternalService("shortener down".into()))
    }
}

pub struct SlowShortener(pub Duration);

#[async_trait]
impl AdLinkShortener for SlowShortener {
    async fn create_ads_link(&self, _destination: &str) -> Result<String> {
        tokio::time::sleep(self.0).await;
        Ok("https://short.example/too-late".to_string())
    }
}

/// Records delivery attempts and fails for one transport reference.
#[derive(Default)]
pub struct RecordingTransport {
    fail_ref: Option<String>,
    attempts: AtomicUsize,
}

impl RecordingTransport {
    pub fn failing_on(transport_ref: &str) -> Self {
        Self {
            fail_ref: Some(transport_ref.to_string()),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentTransport for RecordingTransport {
    async fn deliver(&self, _chat_id: &str, item: &MediaItem) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_ref.as_deref() == Some(item.transport_ref.as_str()) {
            return Err(AppError::Delivery("chat not found".into()));
        }
        Ok(())
    }
}

/// Log sink for asserting on this crate's formatted tracing output.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        let sink = self.clone();
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("bundlegate=trace"))
            .with_writer(move || sink.clone())
            .finish()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
