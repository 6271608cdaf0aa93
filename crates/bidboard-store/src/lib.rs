//! Boundary contracts for the hosted backend plus the Postgres and
//! fixture-file implementations that feed the ranking engine.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bidboard_core::{
    DismissalSet, FeedbackMap, NoticeId, Opportunity, OpportunityFilters, ProjectSummary,
    PursuitPlan, Rating, ScoringProfile,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod fixture;
mod pg;

pub use config::{open_backend, BidboardConfig};
pub use fixture::FixtureStore;
pub use pg::{PgStore, CHANGE_CHANNEL};

pub const CRATE_NAME: &str = "bidboard-store";

pub const OPPORTUNITIES_TABLE: &str = "scanner_opportunities";
pub const FEEDBACK_TABLE: &str = "opportunity_feedback";
pub const DISMISSALS_TABLE: &str = "opportunity_dismissals";
pub const PROFILES_TABLE: &str = "scoring_profiles";
pub const PROJECTS_TABLE: &str = "projects";
pub const MILESTONES_TABLE: &str = "milestones";
pub const CHECKLIST_TABLE: &str = "checklist_items";
pub const ACTIVITY_TABLE: &str = "activity_log";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding {path}: {message}")]
    Decode { path: String, message: String },
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("opportunity {0} is already tracked")]
    AlreadyTracked(NoticeId),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Database(err) => classify_sqlx_error(err),
            StoreError::Unavailable(_) => RetryDisposition::Retryable,
            StoreError::Io { .. } | StoreError::Decode { .. } | StoreError::AlreadyTracked(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Connection loss, pool exhaustion and serialization conflicts are worth
/// another attempt; everything else is a real failure.
pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => RetryDisposition::Retryable,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(code) if code.starts_with("08") || code == "40001" || code == "40P01" => {
                RetryDisposition::Retryable
            }
            _ => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// One page of opportunities plus the count the backend reports for the
/// whole filtered set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub items: Vec<Opportunity>,
    pub total_count: usize,
}

/// A backend table that changed. Notifications carry no row payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableChange {
    Opportunities,
    Feedback,
    Dismissals,
    Profiles,
    Projects,
    Other(String),
}

impl TableChange {
    pub fn from_table_name(name: &str) -> Self {
        match name.trim() {
            OPPORTUNITIES_TABLE => TableChange::Opportunities,
            FEEDBACK_TABLE => TableChange::Feedback,
            DISMISSALS_TABLE => TableChange::Dismissals,
            PROFILES_TABLE => TableChange::Profiles,
            PROJECTS_TABLE | MILESTONES_TABLE | CHECKLIST_TABLE => TableChange::Projects,
            other => TableChange::Other(other.to_string()),
        }
    }
}

pub type ChangeStream = broadcast::Receiver<TableChange>;

#[async_trait]
pub trait OpportunitySource: Send + Sync {
    /// `page` is zero-based.
    async fn fetch_opportunities(
        &self,
        filters: &OpportunityFilters,
        page: usize,
        page_size: usize,
    ) -> Result<Page, StoreError>;
}

#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn get_feedback(&self, user_id: Uuid) -> Result<FeedbackMap, StoreError>;

    /// `None` deletes the row.
    async fn set_feedback(
        &self,
        user_id: Uuid,
        notice_id: &str,
        rating: Option<Rating>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait DismissalStore: Send + Sync {
    async fn get_dismissals(&self, user_id: Uuid) -> Result<DismissalSet, StoreError>;

    async fn set_dismissed(
        &self,
        user_id: Uuid,
        notice_id: &str,
        dismissed: bool,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_default_profile(&self, user_id: Uuid) -> Result<Option<ScoringProfile>, StoreError>;
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Notice ids already promoted to tracked projects.
    async fn tracked_notice_ids(&self) -> Result<HashSet<NoticeId>, StoreError>;

    /// Projects whose status is active or submitted, soonest deadline first.
    async fn open_projects(&self) -> Result<Vec<ProjectSummary>, StoreError>;

    /// Create the project with its milestones and checklist, log the
    /// activity and announce the change. Returns the new project id.
    async fn track(&self, plan: &PursuitPlan) -> Result<Uuid, StoreError>;
}

/// One `activity_log` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    pub project_id: Uuid,
    pub action: String,
    pub details: Option<String>,
    pub performed_by: Uuid,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self) -> Result<ChangeStream, StoreError>;
}

#[async_trait]
impl<T: OpportunitySource + ?Sized> OpportunitySource for Arc<T> {
    async fn fetch_opportunities(
        &self,
        filters: &OpportunityFilters,
        page: usize,
        page_size: usize,
    ) -> Result<Page, StoreError> {
        (**self).fetch_opportunities(filters, page, page_size).await
    }
}

/// Everything the dashboard needs from the hosted backend.
pub trait Backend:
    OpportunitySource + FeedbackStore + DismissalStore + ProfileStore + ProjectStore + ChangeFeed
{
}

impl<T> Backend for T where
    T: OpportunitySource + FeedbackStore + DismissalStore + ProfileStore + ProjectStore + ChangeFeed
{
}

/// Wraps a source with exponential backoff on retryable failures.
#[derive(Debug)]
pub struct RetryingSource<S> {
    inner: S,
    backoff: BackoffPolicy,
}

impl<S> RetryingSource<S> {
    pub fn new(inner: S, backoff: BackoffPolicy) -> Self {
        Self { inner, backoff }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: OpportunitySource> OpportunitySource for RetryingSource<S> {
    async fn fetch_opportunities(
        &self,
        filters: &OpportunityFilters,
        page: usize,
        page_size: usize,
    ) -> Result<Page, StoreError> {
        let span = info_span!("fetch_opportunities", page, page_size);
        async move {
            let mut attempt = 0;
            loop {
                match self.inner.fetch_opportunities(filters, page, page_size).await {
                    Ok(fetched) => return Ok(fetched),
                    Err(err)
                        if err.disposition() == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries =>
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(attempt, ?delay, error = %err, "opportunity fetch failed; retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakySource {
        failures_before_success: usize,
        retryable: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OpportunitySource for FlakySource {
        async fn fetch_opportunities(
            &self,
            _filters: &OpportunityFilters,
            _page: usize,
            _page_size: usize,
        ) -> Result<Page, StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err(if self.retryable {
                    StoreError::Unavailable("connection reset".into())
                } else {
                    StoreError::Decode {
                        path: "scanner_opportunities".into(),
                        message: "bad row".into(),
                    }
                });
            }
            Ok(Page {
                items: vec![Opportunity::new("ok")],
                total_count: 1,
            })
        }
    }

    fn fast_policy(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retrying_source_recovers_from_transient_failures() {
        let source = RetryingSource::new(
            FlakySource {
                failures_before_success: 2,
                retryable: true,
                calls: AtomicUsize::new(0),
            },
            fast_policy(3),
        );
        let page = source
            .fetch_opportunities(&OpportunityFilters::default(), 0, 10)
            .await
            .expect("third attempt succeeds");
        assert_eq!(page.total_count, 1);
        assert_eq!(source.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retrying_source_gives_up_after_budget() {
        let source = RetryingSource::new(
            FlakySource {
                failures_before_success: 10,
                retryable: true,
                calls: AtomicUsize::new(0),
            },
            fast_policy(2),
        );
        let err = source
            .fetch_opportunities(&OpportunityFilters::default(), 0, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(source.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let source = RetryingSource::new(
            FlakySource {
                failures_before_success: 1,
                retryable: false,
                calls: AtomicUsize::new(0),
            },
            fast_policy(3),
        );
        assert!(source
            .fetch_opportunities(&OpportunityFilters::default(), 0, 10)
            .await
            .is_err());
        assert_eq!(source.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn table_names_map_to_changes() {
        assert_eq!(
            TableChange::from_table_name("opportunity_feedback"),
            TableChange::Feedback
        );
        assert_eq!(
            TableChange::from_table_name(" scanner_opportunities "),
            TableChange::Opportunities
        );
        assert_eq!(
            TableChange::from_table_name("checklist_items"),
            TableChange::Projects
        );
        assert_eq!(
            TableChange::from_table_name("activity_log"),
            TableChange::Other("activity_log".into())
        );
    }

    #[test]
    fn pool_timeouts_are_retryable() {
        assert_eq!(
            StoreError::Database(sqlx::Error::PoolTimedOut).disposition(),
            RetryDisposition::Retryable
        );
        assert_eq!(
            StoreError::Database(sqlx::Error::RowNotFound).disposition(),
            RetryDisposition::NonRetryable
        );
    }
}
