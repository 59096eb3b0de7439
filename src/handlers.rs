use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditLog;
use crate::bundles::BundleStore;
use crate::codec::LinkBuilder;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::gate::{AccessGate, AccessOutcome, DeliveryReport, Grant};
use crate::models::{AccessLogEntry, Bundle, FileDescriptor, MediaItem};
use crate::pending::PendingCollections;
use crate::tokens::TokenStore;
use crate::transport::ContentTransport;
use crate::users::UserStore;
use crate::verification::VerificationController;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub users: UserStore,
    pub tokens: TokenStore,
    pub bundles: BundleStore,
    pub pending: PendingCollections,
    pub gate: AccessGate,
    pub verification: VerificationController,
    pub audit: AuditLog,
    pub links: LinkBuilder,
    pub transport: Option<Arc<dyn ContentTransport>>,
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    user_id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    param: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartResponse {
    Granted {
        grant: Grant,
        #[serde(skip_serializing_if = "Option::is_none")]
        delivery: Option<DeliveryReport>,
    },
    VerificationRequired {
        redirect_url: String,
    },
    NotFound,
    InvalidLink,
    TokenActivated {
        expires_at: DateTime<Utc>,
    },
    Verified,
    Welcome {
        token: TokenStatus,
    },
}

#[derive(Debug, Serialize)]
pub struct TokenStatus {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

/// Entry point for every deep-link activation (`/start <param>`).
pub async fn start(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>> {
    let user = state
        .users
        .get_or_create(&request.user_id, request.display_name.as_deref())
        .await?;

    let param = match request.param.as_deref().map(str::trim) {
        Some(param) if !param.is_empty() => param,
        _ => {
            let token = token_status(&state.tokens, &user.id).await?;
            return Ok(Json(StartResponse::Welcome { token }));
        }
    };

    let response = match state.gate.resolve_access(&user.id, param).await? {
        AccessOutcome::Grant(grant) => {
            let delivery = match (&state.transport, request.chat_id.as_deref()) {
                (Some(transport), Some(chat_id)) => Some(
                    state
                        .gate
                        .deliver(transport.as_ref(), &user.id, chat_id, &grant)
                        .await,
                ),
                _ => None,
            };
            StartResponse::Granted { grant, delivery }
        }
        AccessOutcome::NeedsVerification => StartResponse::VerificationRequired {
            redirect_url: state.gate.verification_redirect(&user.id).await,
        },
        AccessOutcome::NotFound => StartResponse::NotFound,
        AccessOutcome::InvalidToken => StartResponse::InvalidLink,
        AccessOutcome::TokenActivated(token) => StartResponse::TokenActivated {
            expires_at: token.expires_at,
        },
        AccessOutcome::VerifiedBanner => StartResponse::Verified,
    };
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    token: String,
}

/// Verification landing page: activates the token and bounces back to the bot.
pub async fn verify_token(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> Result<Redirect> {
    let token = state.verification.complete_verification(&query.token).await?;
    tracing::info!(user_id = %token.user_id, "verification completed");
    Ok(Redirect::to(&state.links.verified_link()))
}

pub async fn get_token_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<TokenStatus>> {
    if state.users.find(&user_id).await?.is_none() {
        return Err(AppError::UserNotFound(user_id));
    }
    Ok(Json(token_status(&state.tokens, &user_id).await?))
}

pub async fn get_access_log(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<AccessLogEntry>>> {
    Ok(Json(state.audit.entries_for_user(&user_id).await?))
}

async fn token_status(tokens: &TokenStore, user_id: &str) -> Result<TokenStatus> {
    let status = match tokens.get_valid_token(user_id).await? {
        Some(token) => TokenStatus {
            valid: true,
            expires_at: Some(token.expires_at),
        },
        None => TokenStatus {
            valid: false,
            expires_at: tokens.latest_token(user_id).await?.map(|t| t.expires_at),
        },
    };
    Ok(status)
}

#[derive(Debug, Serialize)]
pub struct PendingSummary {
    pending: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    items: Vec<FileDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_bundle: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Cleared {
    cleared: usize,
}

#[derive(Debug, Deserialize, Default)]
pub struct FinalizeRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Published {
    bundle: Bundle,
    link: String,
}

#[derive(Debug, Serialize)]
pub struct PublishedItem {
    item: MediaItem,
    link: String,
}

async fn authorize_uploader(state: &AppState, uploader: &str) -> Result<()> {
    if !state.config.may_upload(uploader) {
        return Err(AppError::Forbidden);
    }
    state.users.get_or_create(uploader, None).await?;
    Ok(())
}

fn validate_descriptor(descriptor: &FileDescriptor) -> Result<()> {
    if descriptor.name.trim().is_empty() {
        return Err(AppError::InvalidDescriptor("name is empty".into()));
    }
    if descriptor.transport_ref.trim().is_empty() {
        return Err(AppError::InvalidDescriptor("transport_ref is empty".into()));
    }
    if descriptor.size < 0 {
        return Err(AppError::InvalidDescriptor("size is negative".into()));
    }
    Ok(())
}

pub async fn add_upload(
    State(state): State<AppState>,
    Path(uploader): Path<String>,
    Json(descriptor): Json<FileDescriptor>,
) -> Result<(StatusCode, Json<PendingSummary>)> {
    authorize_uploader(&state, &uploader).await?;
    validate_descriptor(&descriptor)?;
    let pending = state.pending.add(&uploader, descriptor).await?;
    Ok((
        StatusCode::CREATED,
        Json(PendingSummary {
            pending,
            items: Vec::new(),
            last_bundle: None,
        }),
    ))
}

pub async fn list_uploads(
    State(state): State<AppState>,
    Path(uploader): Path<String>,
) -> Result<Json<PendingSummary>> {
    if !state.config.may_upload(&uploader) {
        return Err(AppError::Forbidden);
    }
    let items = state.pending.items(&uploader).await;
    Ok(Json(PendingSummary {
        pending: items.len(),
        items,
        last_bundle: state.pending.last_committed(&uploader).await,
    }))
}

pub async fn clear_uploads(
    State(state): State<AppState>,
    Path(uploader): Path<String>,
) -> Result<Json<Cleared>> {
    if !state.config.may_upload(&uploader) {
        return Err(AppError::Forbidden);
    }
    match state.pending.clear(&uploader).await {
        Some(cleared) => Ok(Json(Cleared { cleared })),
        None => Err(AppError::NotFound),
    }
}

pub async fn finalize_uploads(
    State(state): State<AppState>,
    Path(uploader): Path<String>,
    request: Option<Json<FinalizeRequest>>,
) -> Result<(StatusCode, Json<Published>)> {
    authorize_uploader(&state, &uploader).await?;
    let request = request.map(|Json(request)| request).unwrap_or_default();
    let bundle = state
        .pending
        .finalize(
            &uploader,
            request.title.as_deref(),
            request.description.as_deref(),
        )
        .await?;
    let link = state.links.bundle_link(&bundle.id);
    Ok((StatusCode::CREATED, Json(Published { bundle, link })))
}

pub async fn publish_single(
    State(state): State<AppState>,
    Path(uploader): Path<String>,
    Json(descriptor): Json<FileDescriptor>,
) -> Result<(StatusCode, Json<PublishedItem>)> {
    authorize_uploader(&state, &uploader).await?;
    validate_descriptor(&descriptor)?;
    let item = state.bundles.publish_single(&uploader, &descriptor).await?;
    let link = state.links.media_link(&item.id.to_string());
    Ok((StatusCode::CREATED, Json(PublishedItem { item, link })))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn not_found() -> Response {
    AppError::NotFound.into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use super::*;
    use crate::audit::FILE_ACCESS;
    use crate::models::MediaKind;
    use crate::test_support::{descriptor, seeded_db, FailingShortener, RecordingTransport};

    async fn state(admin: Option<&str>) -> AppState {
        let mut args = vec![
            "bundlegate",
            "--bot-username",
            "gatebot",
            "--public-base-url",
            "https://gate.example.com",
        ];
        if let Some(admin) = admin {
            args.extend(["--admin-id", admin]);
        }
        let config = Config::try_parse_from(args).unwrap();

        let db = seeded_db().await;
        let tokens = TokenStore::new(db.clone());
        let bundles = BundleStore::new(db.clone());
        let audit = AuditLog::new(db.clone());
        let links = LinkBuilder::new(&config.bot_username, &config.public_base_url);
        let verification = VerificationController::new(
            tokens.clone(),
            Arc::new(FailingShortener),
            links.clone(),
            audit.clone(),
            Duration::from_secs(1),
        );
        let gate = AccessGate::new(
            tokens.clone(),
            bundles.clone(),
            verification.clone(),
            audit.clone(),
            Duration::ZERO,
            Duration::from_secs(1),
        );
        AppState {
            config: Arc::new(config),
            users: UserStore::new(db.clone()),
            tokens,
            pending: PendingCollections::new(bundles.clone(), 10),
            bundles,
            gate,
            verification,
            audit,
            links,
            transport: Some(Arc::new(RecordingTransport::default())),
        }
    }

    fn start_request(user_id: &str, param: Option<&str>) -> Json<StartRequest> {
        Json(StartRequest {
            user_id: user_id.to_string(),
            display_name: None,
            chat_id: Some("chat".to_string()),
            param: param.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn upload_finalize_and_access_flow() {
        let state = state(Some("admin")).await;
        for name in ["a.jpg", "b.jpg"] {
            add_upload(
                State(state.clone()),
                Path("admin".to_string()),
                Json(descriptor(name, MediaKind::Photo)),
            )
            .await
            .unwrap();
        }
        let (status, Json(published)) =
            finalize_uploads(State(state.clone()), Path("admin".to_string()), None)
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        let param = published.link.split("?start=").nth(1).unwrap().to_string();

        // First visit: a brand-new user is sent through verification.
        let Json(response) = start(State(state.clone()), start_request("newcomer", Some(&param)))
            .await
            .unwrap();
        let StartResponse::VerificationRequired { redirect_url } = response else {
            panic!("expected verification, got {response:?}");
        };
        let payload = redirect_url.split("token=").nth(1).unwrap().to_string();

        // The landing page activates the token and redirects to the bot.
        let redirect = verify_token(State(state.clone()), Query(VerifyQuery { token: payload }))
            .await
            .unwrap()
            .into_response();
        assert_eq!(redirect.status(), StatusCode::SEE_OTHER);

        let Json(response) = start(State(state.clone()), start_request("newcomer", Some(&param)))
            .await
            .unwrap();
        match response {
            StartResponse::Granted {
                grant,
                delivery: Some(report),
            } => {
                assert_eq!(grant.items().len(), 2);
                assert_eq!(report.delivered.len(), 2);
            }
            other => panic!("expected grant, got {other:?}"),
        }

        let Json(entries) = get_access_log(State(state), Path("newcomer".to_string()))
            .await
            .unwrap();
        let actions: Vec<_> = entries.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(
            actions,
            ["ads_verification", "token_refresh", FILE_ACCESS, FILE_ACCESS]
        );
    }

    #[tokio::test]
    async fn uploads_are_restricted_to_the_admin() {
        let state = state(Some("admin")).await;
        let err = add_upload(
            State(state.clone()),
            Path("intruder".to_string()),
            Json(descriptor("a.jpg", MediaKind::Photo)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Forbidden));
    }

    #[tokio::test]
    async fn empty_descriptors_are_rejected() {
        let state = state(None).await;
        let mut bad = descriptor("a.jpg", MediaKind::Photo);
        bad.transport_ref = " ".into();
        let err = add_upload(State(state.clone()), Path("admin".to_string()), Json(bad))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidDescriptor(_)));
    }

    #[tokio::test]
    async fn clearing_nothing_is_not_found() {
        let state = state(None).await;
        let err = clear_uploads(State(state), Path("admin".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[tokio::test]
    async fn bare_start_reports_token_status() {
        let state = state(None).await;
        let Json(response) = start(State(state.clone()), start_request("viewer", None))
            .await
            .unwrap();
        assert!(matches!(
            response,
            StartResponse::Welcome {
                token: TokenStatus { valid: false, .. }
            }
        ));

        state.tokens.issue_token("viewer", None).await.unwrap();
        let Json(status) = get_token_status(State(state), Path("viewer".to_string()))
            .await
            .unwrap();
        assert!(status.valid);
        assert!(status.expires_at.is_some());
    }

    #[tokio::test]
    async fn token_status_of_unknown_user_is_not_found() {
        let state = state(None).await;
        let err = get_token_status(State(state), Path("ghost".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn invalid_landing_payload_is_rejected() {
        let state = state(None).await;
        let err = verify_token(
            State(state),
            Query(VerifyQuery {
                token: "not-valid-base64!!".into(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidEncoding));
    }
}
