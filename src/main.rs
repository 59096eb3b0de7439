mod audit;
mod bundles;
mod codec;
mod config;
mod db;
mod error;
mod gate;
mod handlers;
mod models;
mod pending;
mod shortener;
mod tokens;
mod transport;
mod users;
mod verification;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::audit::AuditLog;
use crate::bundles::BundleStore;
use crate::codec::LinkBuilder;
use crate::config::Config;
use crate::gate::AccessGate;
use crate::handlers::AppState;
use crate::pending::PendingCollections;
use crate::shortener::{AdLinkShortener, DisabledShortener, LinkShortifyClient};
use crate::tokens::TokenStore;
use crate::transport::{ContentTransport, TelegramTransport};
use crate::users::UserStore;
use crate::verification::VerificationController;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let log_level: tracing::Level = config.log_level.parse().unwrap_or(tracing::Level::INFO);
    let env_filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(env_filter)
        .init();

    let conn = db::establish_connection(&config.database_path)
        .with_context(|| format!("failed to open database {}", config.database_path.display()))?;

    let shortener: Arc<dyn AdLinkShortener> = match &config.linkshortify_api_key {
        Some(key) => Arc::new(LinkShortifyClient::new(
            &config.linkshortify_base_url,
            key,
            config.external_timeout(),
        )?),
        None => {
            tracing::warn!("LINKSHORTIFY_API_KEY not set, verification uses the landing page directly");
            Arc::new(DisabledShortener)
        }
    };
    let transport: Option<Arc<dyn ContentTransport>> = match &config.telegram_bot_token {
        Some(token) => Some(Arc::new(TelegramTransport::new(
            &config.telegram_api_base,
            token,
            config.external_timeout(),
        )?)),
        None => None,
    };

    let links = LinkBuilder::new(&config.bot_username, &config.public_base_url);
    let users = UserStore::new(conn.clone());
    let tokens = TokenStore::new(conn.clone());
    let bundles = BundleStore::new(conn.clone());
    let audit = AuditLog::new(conn.clone());
    let pending = PendingCollections::new(bundles.clone(), config.max_pending_items);
    let verification = VerificationController::new(
        tokens.clone(),
        shortener,
        links.clone(),
        audit.clone(),
        config.external_timeout(),
    );
    let gate = AccessGate::new(
        tokens.clone(),
        bundles.clone(),
        verification.clone(),
        audit.clone(),
        config.delivery_pacing(),
        config.external_timeout(),
    );

    let shutdown = CancellationToken::new();
    let eviction = tokio::spawn(evict_stale_collections(
        pending.clone(),
        config.pending_ttl(),
        shutdown.clone(),
    ));

    let bind_addr = config.bind_addr;
    let state = AppState {
        config: Arc::new(config),
        users,
        tokens,
        bundles,
        pending,
        gate,
        verification,
        audit,
        links,
        transport,
    };

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/start", post(handlers::start))
        .route("/verify-token", get(handlers::verify_token))
        .route("/tokens/:user_id", get(handlers::get_token_status))
        .route("/users/:user_id/access-log", get(handlers::get_access_log))
        .route(
            "/uploads/:uploader",
            get(handlers::list_uploads)
                .post(handlers::add_upload)
                .delete(handlers::clear_uploads),
        )
        .route("/uploads/:uploader/finalize", post(handlers::finalize_uploads))
        .route("/uploads/:uploader/single", post(handlers::publish_single))
        .fallback(handlers::not_found)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(%bind_addr, "server running");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("shutdown requested"),
                _ = signal.cancelled() => {}
            }
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    eviction.await?;
    Ok(())
}

async fn evict_stale_collections(
    pending: PendingCollections,
    ttl: std::time::Duration,
    shutdown: CancellationToken,
) {
    let period = (ttl / 4).max(std::time::Duration::from_secs(60));
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let evicted = pending.evict_stale(ttl);
                if evicted > 0 {
                    tracing::info!(evicted, "stale pending collections dropped");
                }
            }
        }
    }
}
