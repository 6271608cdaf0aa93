use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use crate::{Backend, BackoffPolicy, FixtureStore, PgStore, StoreError};

#[derive(Debug, Clone)]
pub struct BidboardConfig {
    /// Postgres backend when set, fixture files otherwise.
    pub database_url: Option<String>,
    pub fixtures_dir: PathBuf,
    pub page_size: usize,
    pub web_port: u16,
    pub user_id: Uuid,
    pub owner: String,
    pub fetch_retries: usize,
    pub fetch_retry_base_ms: u64,
    /// Upper bound on in-memory web sessions; the least recently used is evicted.
    pub max_sessions: usize,
    pub session_idle_secs: u64,
}

impl Default for BidboardConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            fixtures_dir: PathBuf::from("./fixtures"),
            page_size: 25,
            web_port: 8000,
            user_id: Uuid::nil(),
            owner: "unassigned".to_string(),
            fetch_retries: 3,
            fetch_retry_base_ms: 250,
            max_sessions: 256,
            session_idle_secs: 3600,
        }
    }
}

impl BidboardConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            fixtures_dir: lookup("BIDBOARD_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.fixtures_dir),
            page_size: parse_var(&lookup, "BIDBOARD_PAGE_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.page_size),
            web_port: parse_var(&lookup, "BIDBOARD_WEB_PORT").unwrap_or(defaults.web_port),
            user_id: parse_var(&lookup, "BIDBOARD_USER_ID").unwrap_or(defaults.user_id),
            owner: lookup("BIDBOARD_OWNER")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.owner),
            fetch_retries: parse_var(&lookup, "BIDBOARD_FETCH_RETRIES").unwrap_or(defaults.fetch_retries),
            fetch_retry_base_ms: parse_var(&lookup, "BIDBOARD_FETCH_RETRY_BASE_MS")
                .unwrap_or(defaults.fetch_retry_base_ms),
            max_sessions: parse_var(&lookup, "BIDBOARD_MAX_SESSIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_sessions),
            session_idle_secs: parse_var(&lookup, "BIDBOARD_SESSION_IDLE_SECS")
                .filter(|n: &u64| *n > 0)
                .unwrap_or(defaults.session_idle_secs),
        }
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.fetch_retries,
            base_delay: Duration::from_millis(self.fetch_retry_base_ms),
            ..BackoffPolicy::default()
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

/// Open the configured backend: Postgres when `DATABASE_URL` is set, the
/// fixture directory otherwise.
pub async fn open_backend(config: &BidboardConfig) -> Result<Arc<dyn Backend>, StoreError> {
    match &config.database_url {
        Some(url) => {
            info!("using postgres backend");
            Ok(Arc::new(PgStore::connect(url).await?))
        }
        None => {
            info!(fixtures_dir = %config.fixtures_dir.display(), "using fixture backend");
            Ok(Arc::new(FixtureStore::load(config.fixtures_dir.clone()).await?))
        }
    }
}
