//! Deep-link parameter encoding.
//!
//! Identifiers travel inside `?start=` parameters as unpadded base64url. Decoding
//! accepts input with or without padding. Verification payloads pack
//! `secret:user_id:timestamp` into one parameter; payloads minted by older
//! deployments carried a JSON object instead and are still accepted.

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use chrono::Utc;
use serde::Deserialize;

use crate::error::{AppError, Result};

const LINK_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const PAYLOAD_DELIMITER: char = ':';
const TOKEN_PREFIX: &str = "token_";
const BUNDLE_PREFIX: &str = "bundle_";
pub const VERIFIED_PARAM: &str = "verified";

pub fn encode(raw: &str) -> String {
    LINK_ENGINE.encode(raw.as_bytes())
}

pub fn decode(encoded: &str) -> Result<String> {
    let bytes = LINK_ENGINE
        .decode(encoded.trim())
        .map_err(|_| AppError::InvalidEncoding)?;
    String::from_utf8(bytes).map_err(|_| AppError::InvalidEncoding)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPayload {
    pub token: String,
    pub user_id: String,
    pub timestamp: Option<i64>,
}

/// Packs a verification payload. A missing timestamp is stamped with the current time.
pub fn encode_token_payload(token: &str, user_id: &str, timestamp: Option<i64>) -> String {
    let timestamp = timestamp.unwrap_or_else(|| Utc::now().timestamp());
    encode(&format!("{token}{PAYLOAD_DELIMITER}{user_id}{PAYLOAD_DELIMITER}{timestamp}"))
}

pub fn decode_token_payload(encoded: &str) -> Result<TokenPayload> {
    let decoded = decode(encoded)?;
    let payload = match compact_payload(&decoded) {
        Some(payload) => payload,
        None => legacy_payload(&decoded)?,
    };

    if payload.token.is_empty() || payload.user_id.is_empty() {
        return Err(AppError::InvalidEncoding);
    }
    Ok(payload)
}

/// `secret:user_id:timestamp`. JSON text never takes this path, even when it
/// happens to contain exactly two delimiters.
fn compact_payload(decoded: &str) -> Option<TokenPayload> {
    if decoded.trim_start().starts_with('{') {
        return None;
    }
    let parts: Vec<&str> = decoded.split(PAYLOAD_DELIMITER).collect();
    let [token, user_id, timestamp] = parts.as_slice() else {
        return None;
    };
    Some(TokenPayload {
        token: token.to_string(),
        user_id: user_id.to_string(),
        timestamp: Some(timestamp.parse().ok()?),
    })
}

fn legacy_payload(decoded: &str) -> Result<TokenPayload> {
    let legacy: LegacyPayload =
        serde_json::from_str(decoded).map_err(|_| AppError::InvalidEncoding)?;
    Ok(TokenPayload {
        token: legacy.token,
        user_id: legacy.user_id.into_string(),
        timestamp: legacy.timestamp.and_then(|ts| ts.as_i64()),
    })
}

#[derive(Deserialize)]
struct LegacyPayload {
    token: String,
    user_id: Scalar,
    #[serde(default)]
    timestamp: Option<Scalar>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Number(i64),
    Text(String),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => s,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Number(n) => Some(*n),
            Scalar::Text(s) => s.parse().ok(),
        }
    }
}

/// A `?start=` parameter classified by prefix, with the prefix stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeepLink<'a> {
    Token(&'a str),
    Bundle(&'a str),
    Media(&'a str),
}

pub fn parse_deep_link(param: &str) -> DeepLink<'_> {
    if let Some(rest) = param.strip_prefix(TOKEN_PREFIX) {
        DeepLink::Token(rest)
    } else if let Some(rest) = param.strip_prefix(BUNDLE_PREFIX) {
        DeepLink::Bundle(rest)
    } else {
        DeepLink::Media(param)
    }
}

/// Builds the user-facing links handed out by the service.
#[derive(Debug, Clone)]
pub struct LinkBuilder {
    bot_username: String,
    public_base_url: String,
}

impl LinkBuilder {
    pub fn new(bot_username: &str, public_base_url: &str) -> Self {
        Self {
            bot_username: bot_username.trim_start_matches('@').to_string(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn start_link(&self, param: &str) -> String {
        format!("https://t.me/{}?start={}", self.bot_username, param)
    }

    pub fn media_link(&self, item_id: &str) -> String {
        self.start_link(&encode(item_id))
    }

    pub fn bundle_link(&self, bundle_id: &str) -> String {
        self.start_link(&format!("{BUNDLE_PREFIX}{}", encode(bundle_id)))
    }

    pub fn verified_link(&self) -> String {
        self.start_link(VERIFIED_PARAM)
    }

    /// Landing page on this service that completes verification for `payload`.
    pub fn landing_url(&self, payload: &str) -> String {
        format!("{}/verify-token?token={}", self.public_base_url, payload)
    }
}
