use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: Uuid,
    pub user_id: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

impl AccessToken {
    /// A token grants access only while it is active and strictly before its expiry.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.active && now < self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub id: String,
    pub creator_id: String,
    pub title: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub items: Vec<MediaItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: Uuid,
    pub bundle_id: Option<String>,
    pub name: String,
    pub kind: MediaKind,
    pub mime_type: String,
    pub size: i64,
    pub transport_ref: String,
    pub uploader_id: String,
    pub caption: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An uploaded file that has not been committed to a bundle yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub size: i64,
    pub transport_ref: String,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Document,
    Photo,
    Video,
    Audio,
    Voice,
    VideoNote,
    Animation,
    Sticker,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Document => "document",
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Voice => "voice",
            MediaKind::VideoNote => "video_note",
            MediaKind::Animation => "animation",
            MediaKind::Sticker => "sticker",
        }
    }

    /// Round video messages and stickers are delivered without a caption.
    pub fn supports_caption(&self) -> bool {
        !matches!(self, MediaKind::VideoNote | MediaKind::Sticker)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown media kind: {0}")]
pub struct UnknownMediaKind(pub String);

impl FromStr for MediaKind {
    type Err = UnknownMediaKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "document" => Ok(MediaKind::Document),
            "photo" => Ok(MediaKind::Photo),
            "video" => Ok(MediaKind::Video),
            "audio" => Ok(MediaKind::Audio),
            "voice" => Ok(MediaKind::Voice),
            "video_note" => Ok(MediaKind::VideoNote),
            "animation" => Ok(MediaKind::Animation),
            "sticker" => Ok(MediaKind::Sticker),
            other => Err(UnknownMediaKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub id: i64,
    pub user_id: String,
    pub media_item_id: Option<Uuid>,
    pub action: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn media_kind_parses_known_tags() {
        assert_eq!("photo".parse::<MediaKind>(), Ok(MediaKind::Photo));
        assert_eq!("VIDEO_NOTE".parse::<MediaKind>(), Ok(MediaKind::VideoNote));
        assert!("spreadsheet".parse::<MediaKind>().is_err());
        assert_eq!(MediaKind::Animation.to_string(), "animation");
    }

    #[test]
    fn token_validity_is_strict_at_expiry() {
        let now = Utc::now();
        let token = AccessToken {
            id: Uuid::new_v4(),
            user_id: "42".into(),
            secret: "s".into(),
            created_at: now - Duration::hours(24),
            expires_at: now,
            active: true,
        };
        assert!(!token.is_valid_at(now));
        assert!(token.is_valid_at(now - Duration::seconds(1)));

        let inactive = AccessToken {
            active: false,
            ..token
        };
        assert!(!inactive.is_valid_at(now - Duration::seconds(1)));
    }
}
