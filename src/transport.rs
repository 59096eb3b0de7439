use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{MediaItem, MediaKind};

/// Re-delivers stored media to a user's chat.
#[async_trait]
pub trait ContentTransport: Send + Sync {
    async fn deliver(&self, chat_id: &str, item: &MediaItem) -> Result<()>;
}

/// Sends media through the Telegram Bot API using the stored `file_id`.
pub struct TelegramTransport {
    client: Client,
    api_base: String,
    bot_token: String,
}

#[derive(Debug, Serialize)]
struct SendMediaRequest<'a> {
    chat_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
    #[serde(flatten)]
    media: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct BotApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Bot API method and payload field for each kind.
fn send_method(kind: MediaKind) -> (&'static str, &'static str) {
    match kind {
        MediaKind::Document => ("sendDocument", "document"),
        MediaKind::Photo => ("sendPhoto", "photo"),
        MediaKind::Video => ("sendVideo", "video"),
        MediaKind::Audio => ("sendAudio", "audio"),
        MediaKind::Voice => ("sendVoice", "voice"),
        MediaKind::VideoNote => ("sendVideoNote", "video_note"),
        MediaKind::Animation => ("sendAnimation", "animation"),
        MediaKind::Sticker => ("sendSticker", "sticker"),
    }
}

impl TelegramTransport {
    pub fn new(api_base: &str, bot_token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
        })
    }

    fn request_for<'a>(chat_id: &'a str, item: &'a MediaItem) -> (&'static str, SendMediaRequest<'a>) {
        let (method, field) = send_method(item.kind);
        let mut media = serde_json::Map::new();
        media.insert(field.to_string(), item.transport_ref.clone().into());
        let caption = item
            .caption
            .as_deref()
            .filter(|_| item.kind.supports_caption());
        (
            method,
            SendMediaRequest {
                chat_id,
                caption,
                media,
            },
        )
    }
}

#[async_trait]
impl ContentTransport for TelegramTransport {
    async fn deliver(&self, chat_id: &str, item: &MediaItem) -> Result<()> {
        let (method, request) = Self::request_for(chat_id, item);
        let url = format!("{}/bot{}/{method}", self.api_base, self.bot_token);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Delivery(e.without_url().to_string()))?;

        let status = response.status();
        let body: BotApiResponse = response
            .json()
            .await
            .map_err(|e| AppError::Delivery(format!("HTTP {status}: {}", e.without_url())))?;
        if !body.ok {
            return Err(AppError::Delivery(
                body.description.unwrap_or_else(|| format!("HTTP {status}")),
            ));
        }
        Ok(())
    }
}
