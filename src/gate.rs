use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::audit::{AuditLog, FILE_ACCESS};
use crate::bundles::BundleStore;
use crate::codec::{decode, parse_deep_link, DeepLink, VERIFIED_PARAM};
use crate::error::{AppError, Result};
use crate::models::{AccessToken, Bundle, MediaItem};
use crate::tokens::TokenStore;
use crate::transport::ContentTransport;
use crate::verification::VerificationController;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "grant", rename_all = "snake_case")]
pub enum Grant {
    Bundle(Bundle),
    Single(MediaItem),
}

impl Grant {
    pub fn items(&self) -> &[MediaItem] {
        match self {
            Grant::Bundle(bundle) => &bundle.items,
            Grant::Single(item) => std::slice::from_ref(item),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessOutcome {
    Grant(Grant),
    NeedsVerification,
    NotFound,
    /// A `token_` link activated a fresh token.
    TokenActivated(AccessToken),
    InvalidToken,
    VerifiedBanner,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub delivered: Vec<Uuid>,
    pub failed: Vec<DeliveryFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryFailure {
    pub item_id: Uuid,
    pub error: String,
}

#[derive(Clone)]
pub struct AccessGate {
    tokens: TokenStore,
    bundles: BundleStore,
    verification: VerificationController,
    audit: AuditLog,
    pacing: Duration,
    delivery_timeout: Duration,
}

impl AccessGate {
    pub fn new(
        tokens: TokenStore,
        bundles: BundleStore,
        verification: VerificationController,
        audit: AuditLog,
        pacing: Duration,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            tokens,
            bundles,
            verification,
            audit,
            pacing,
            delivery_timeout,
        }
    }

    /// Decides what a deep-link activation by `user_id` yields. Malformed or dangling
    /// references resolve to `NotFound`; only storage failures are returned as errors.
    pub async fn resolve_access(&self, user_id: &str, param: &str) -> Result<AccessOutcome> {
        if param == VERIFIED_PARAM {
            return Ok(AccessOutcome::VerifiedBanner);
        }

        let grant = match parse_deep_link(param) {
            DeepLink::Token(payload) => {
                return match self.verification.complete_verification(payload).await {
                    Ok(token) => Ok(AccessOutcome::TokenActivated(token)),
                    Err(AppError::InvalidEncoding | AppError::UserNotFound(_)) => {
                        tracing::debug!(user_id, "rejected verification link");
                        Ok(AccessOutcome::InvalidToken)
                    }
                    Err(e) => Err(e),
                };
            }
            DeepLink::Bundle(encoded) => {
                let Ok(bundle_id) = decode(encoded) else {
                    return Ok(AccessOutcome::NotFound);
                };
                match self.bundles.lookup_bundle(&bundle_id).await? {
                    Some(bundle) => Grant::Bundle(bundle),
                    None => return Ok(AccessOutcome::NotFound),
                }
            }
            DeepLink::Media(encoded) => {
                let Ok(item_id) = decode(encoded) else {
                    return Ok(AccessOutcome::NotFound);
                };
                match self.bundles.lookup_media_item(&item_id).await? {
                    Some(item) => Grant::Single(item),
                    None => return Ok(AccessOutcome::NotFound),
                }
            }
        };

        if self.tokens.get_valid_token(user_id).await?.is_some() {
            Ok(AccessOutcome::Grant(grant))
        } else {
            tracing::debug!(user_id, "no valid token, verification required");
            Ok(AccessOutcome::NeedsVerification)
        }
    }

    /// Redirect for a user whose access was denied.
    pub async fn verification_redirect(&self, user_id: &str) -> String {
        self.verification.build_redirect(user_id).await
    }

    /// Sends every item of the grant, pacing between items. A failed or timed-out
    /// item is reported and the remaining items are still sent.
    pub async fn deliver(
        &self,
        transport: &dyn ContentTransport,
        user_id: &str,
        chat_id: &str,
        grant: &Grant,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for (i, item) in grant.items().iter().enumerate() {
            if i > 0 && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
            let result = tokio::time::timeout(self.delivery_timeout, transport.deliver(chat_id, item))
                .await
                .unwrap_or_else(|_| Err(AppError::Delivery("delivery timed out".into())));
            match result {
                Ok(()) => {
                    self.audit.record_quietly(user_id, Some(item.id), FILE_ACCESS).await;
                    report.delivered.push(item.id);
                }
                Err(e) => {
                    tracing::warn!(user_id, item_id = %item.id, error = %e, "item delivery failed");
                    report.failed.push(DeliveryFailure {
                        item_id: item.id,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }
}
