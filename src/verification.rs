//! Round trip through the ads redirect that ends in token issuance.
//!
//! Arriving at the landing page is taken as proof the ad was shown; nothing is
//! verified with the ad network. When the short link is created successfully the
//! token is issued right away, before the user has followed the redirect.

use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditLog, ADS_VERIFICATION, TOKEN_REFRESH};
use crate::codec::{decode_token_payload, encode_token_payload, LinkBuilder};
use crate::error::{AppError, Result};
use crate::models::AccessToken;
use crate::shortener::AdLinkShortener;
use crate::tokens::{generate_secret, TokenStore};

#[derive(Clone)]
pub struct VerificationController {
    tokens: TokenStore,
    shortener: Arc<dyn AdLinkShortener>,
    links: LinkBuilder,
    audit: AuditLog,
    shortener_timeout: Duration,
}

impl VerificationController {
    pub fn new(
        tokens: TokenStore,
        shortener: Arc<dyn AdLinkShortener>,
        links: LinkBuilder,
        audit: AuditLog,
        shortener_timeout: Duration,
    ) -> Self {
        Self {
            tokens,
            shortener,
            links,
            audit,
            shortener_timeout,
        }
    }

    /// Always yields a usable URL: the ads short link, or the local landing page
    /// when the shortener fails or times out.
    pub async fn build_redirect(&self, user_id: &str) -> String {
        let secret = generate_secret();
        let payload = encode_token_payload(&secret, user_id, None);
        let landing = self.links.landing_url(&payload);

        let shortened = tokio::time::timeout(
            self.shortener_timeout,
            self.shortener.create_ads_link(&landing),
        )
        .await
        .unwrap_or_else(|_| Err(AppError::ExternalService("shortener timed out".into())));

        let url = match shortened {
            Ok(short_url) => {
                if let Err(e) = self.tokens.issue_token(user_id, Some(&secret)).await {
                    // The landing page still activates a token when visited.
                    tracing::error!(user_id, error = %e, "failed to pre-issue access token");
                }
                short_url
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "ads link unavailable, using landing page");
                landing
            }
        };

        self.audit.record_quietly(user_id, None, ADS_VERIFICATION).await;
        url
    }

    /// Handles arrival at the landing page (or a `token_` deep link).
    pub async fn complete_verification(&self, encoded_payload: &str) -> Result<AccessToken> {
        let payload = decode_token_payload(encoded_payload)?;
        let token = self
            .tokens
            .activate_from_callback(&payload.user_id, &payload.token)
            .await?;
        self.audit
            .record_quietly(&payload.user_id, None, TOKEN_REFRESH)
            .await;
        Ok(token)
    }
}
