use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Token-gated media bundle gateway
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address the HTTP server listens on
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    pub bind_addr: SocketAddr,

    /// Path to the SQLite database file
    #[arg(long, env = "DATABASE_PATH", default_value = "bundlegate.db")]
    pub database_path: PathBuf,

    /// Bot username used in shareable links (a leading @ is ignored)
    #[arg(long, env = "BOT_USERNAME")]
    pub bot_username: String,

    /// Public base URL of this service, used for the verification landing page
    #[arg(long, env = "PUBLIC_BASE_URL")]
    pub public_base_url: String,

    /// LinkShortify API key; without it the landing page is used directly
    #[arg(long, env = "LINKSHORTIFY_API_KEY", hide_env_values = true)]
    pub linkshortify_api_key: Option<String>,

    #[arg(long, env = "LINKSHORTIFY_BASE_URL", default_value = "https://linkshortify.com/api")]
    pub linkshortify_base_url: String,

    /// Bot token for pushing granted media; without it grants are only reported
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    pub telegram_bot_token: Option<String>,

    #[arg(long, env = "TELEGRAM_API_BASE", default_value = "https://api.telegram.org")]
    pub telegram_api_base: String,

    /// Only this uploader may stage and publish files
    #[arg(long, env = "ADMIN_ID")]
    pub admin_id: Option<String>,

    /// Maximum number of staged files per uploader
    #[arg(long, env = "MAX_PENDING_ITEMS", default_value_t = 100)]
    pub max_pending_items: usize,

    /// Staged collections untouched for this long are dropped
    #[arg(long, env = "PENDING_TTL_SECS", default_value_t = 86_400)]
    pub pending_ttl_secs: u64,

    /// Delay between items of one delivery
    #[arg(long, env = "DELIVERY_PACING_MS", default_value_t = 500)]
    pub delivery_pacing_ms: u64,

    /// Timeout for each call to the shortener or the transport
    #[arg(long, env = "EXTERNAL_TIMEOUT_SECS", default_value_t = 10)]
    pub external_timeout_secs: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn delivery_pacing(&self) -> Duration {
        Duration::from_millis(self.delivery_pacing_ms)
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_secs)
    }

    /// Uploads are open to everyone unless an admin is configured.
    pub fn may_upload(&self, uploader: &str) -> bool {
        self.admin_id.as_deref().map_or(true, |admin| admin == uploader)
    }
}
