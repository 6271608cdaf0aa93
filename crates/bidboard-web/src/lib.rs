//! Axum JSON API over the ranking engine: per-user sessions, paging,
//! feedback, dismissals and realtime refresh from the backend change feed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bidboard_core::{OpportunityFilters, PursuitPlan, Rating, UrgencyCounts};
use bidboard_rank::{RankedResultSet, RankingSession};
use bidboard_store::{
    open_backend, Backend, BidboardConfig, ChangeFeed, DismissalStore, FeedbackStore,
    OpportunitySource, ProfileStore, ProjectStore, RetryingSource, StoreError, TableChange,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidboard-web";

/// Request header naming the acting user; falls back to the configured user.
pub const USER_HEADER: &str = "x-bidboard-user";

#[derive(Debug, Default)]
struct UserSession {
    ranking: RankingSession,
    filters: OpportunityFilters,
    page_size: usize,
}

struct SessionSlot {
    session: Arc<Mutex<UserSession>>,
    last_used: Instant,
    tick: u64,
}

/// Per-user sessions, bounded by count and idle time.
#[derive(Default)]
struct SessionMap {
    slots: HashMap<Uuid, SessionSlot>,
    tick: u64,
}

impl SessionMap {
    fn checkout(
        &mut self,
        user_id: Uuid,
        now: Instant,
        idle: Duration,
        capacity: usize,
        fresh: impl FnOnce() -> UserSession,
    ) -> Arc<Mutex<UserSession>> {
        self.tick += 1;
        let tick = self.tick;

        let before = self.slots.len();
        self.slots
            .retain(|_, slot| now.saturating_duration_since(slot.last_used) < idle);
        if self.slots.len() < before {
            debug!(evicted = before - self.slots.len(), "dropped idle sessions");
        }

        if !self.slots.contains_key(&user_id) {
            while self.slots.len() >= capacity.max(1) {
                let Some(oldest) = self
                    .slots
                    .iter()
                    .min_by_key(|(_, slot)| slot.tick)
                    .map(|(id, _)| *id)
                else {
                    break;
                };
                self.slots.remove(&oldest);
                debug!(user_id = %oldest, "evicted least recently used session");
            }
        }

        let slot = self.slots.entry(user_id).or_insert_with(|| SessionSlot {
            session: Arc::new(Mutex::new(fresh())),
            last_used: now,
            tick,
        });
        slot.last_used = now;
        slot.tick = tick;
        slot.session.clone()
    }

    fn snapshot(&self) -> Vec<(Uuid, Arc<Mutex<UserSession>>)> {
        self.slots
            .iter()
            .map(|(user_id, slot)| (*user_id, slot.session.clone()))
            .collect()
    }
}

pub struct AppState {
    backend: Arc<dyn Backend>,
    source: RetryingSource<Arc<dyn Backend>>,
    config: BidboardConfig,
    sessions: Mutex<SessionMap>,
}

impl AppState {
    pub fn new(backend: Arc<dyn Backend>, config: BidboardConfig) -> Self {
        let source = RetryingSource::new(backend.clone(), config.backoff());
        Self {
            backend,
            source,
            config,
            sessions: Mutex::new(SessionMap::default()),
        }
    }

    pub fn config(&self) -> &BidboardConfig {
        &self.config
    }

    fn user_from_headers(&self, headers: &HeaderMap) -> Uuid {
        headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .unwrap_or(self.config.user_id)
    }

    async fn session(&self, user_id: Uuid) -> Arc<Mutex<UserSession>> {
        self.sessions.lock().await.checkout(
            user_id,
            Instant::now(),
            self.config.session_idle(),
            self.config.max_sessions,
            || UserSession {
                page_size: self.config.page_size,
                ..UserSession::default()
            },
        )
    }

    async fn refresh_user_state(
        &self,
        user_id: Uuid,
        session: &mut UserSession,
    ) -> Result<(), StoreError> {
        let feedback = self.backend.get_feedback(user_id).await?;
        let dismissals = self.backend.get_dismissals(user_id).await?;
        let profile = self.backend.get_default_profile(user_id).await?;
        let tracked = self.backend.tracked_notice_ids().await?;

        session.ranking.replace_feedback(feedback);
        session.ranking.replace_dismissals(dismissals);
        session.ranking.set_profile(profile);
        session.ranking.set_tracked_notice_ids(tracked);
        Ok(())
    }

    /// Fetch a page for the session's current filters. The session is only
    /// touched once the fetch has succeeded.
    async fn load_page(&self, session: &mut UserSession, first: bool) -> Result<(), StoreError> {
        let page = if first { 0 } else { session.ranking.next_page() };
        let fetched = self
            .source
            .fetch_opportunities(&session.filters, page, session.page_size)
            .await?;
        session
            .ranking
            .apply_fetched(fetched.items, fetched.total_count, first);
        Ok(())
    }

    /// Bring every open session up to date after a backend table change.
    pub async fn apply_change(&self, change: &TableChange) {
        let sessions = self.sessions.lock().await.snapshot();

        for (user_id, session) in sessions {
            let mut session = session.lock().await;
            let result = match change {
                TableChange::Opportunities => self.load_page(&mut session, true).await,
                TableChange::Feedback => self
                    .backend
                    .get_feedback(user_id)
                    .await
                    .map(|feedback| session.ranking.replace_feedback(feedback)),
                TableChange::Dismissals => self
                    .backend
                    .get_dismissals(user_id)
                    .await
                    .map(|dismissals| session.ranking.replace_dismissals(dismissals)),
                TableChange::Profiles => self
                    .backend
                    .get_default_profile(user_id)
                    .await
                    .map(|profile| session.ranking.set_profile(profile)),
                TableChange::Projects => self
                    .backend
                    .tracked_notice_ids()
                    .await
                    .map(|tracked| session.ranking.set_tracked_notice_ids(tracked)),
                TableChange::Other(table) => {
                    debug!(table = %table, "ignoring change to unrelated table");
                    Ok(())
                }
            };
            if let Err(err) = result {
                warn!(%user_id, ?change, error = %err, "failed to refresh session after change");
            }
        }
    }
}

/// Subscribe to the backend change feed and refresh sessions as changes
/// arrive. A lagged receiver triggers a full refresh.
pub async fn spawn_change_listener(state: Arc<AppState>) -> anyhow::Result<JoinHandle<()>> {
    let mut changes = state.backend.subscribe().await?;
    Ok(tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    debug!(?change, "backend table changed");
                    state.apply_change(&change).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change feed lagged; refreshing everything");
                    for change in [
                        TableChange::Feedback,
                        TableChange::Dismissals,
                        TableChange::Profiles,
                        TableChange::Projects,
                        TableChange::Opportunities,
                    ] {
                        state.apply_change(&change).await;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("change feed closed");
                    break;
                }
            }
        }
    }))
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/opportunities", get(opportunities_handler))
        .route("/opportunities/more", post(more_handler))
        .route("/opportunities/ranked", get(ranked_handler))
        .route("/opportunities/show-dismissed", post(show_dismissed_handler))
        .route(
            "/opportunities/{id}/feedback",
            post(feedback_handler).delete(clear_feedback_handler),
        )
        .route(
            "/opportunities/{id}/dismiss",
            post(dismiss_handler).delete(undismiss_handler),
        )
        .route("/opportunities/{id}/pursuit-plan", get(pursuit_plan_handler))
        .route("/opportunities/{id}/track", post(track_handler))
        .route("/projects/urgency", get(urgency_handler))
        .with_state(state)
}

pub async fn serve_from_config(config: BidboardConfig) -> anyhow::Result<()> {
    let backend = open_backend(&config).await.context("opening backend")?;
    let port = config.web_port;
    let state = Arc::new(AppState::new(backend, config));
    if let Err(err) = spawn_change_listener(state.clone()).await {
        warn!(error = %err, "realtime updates disabled");
    }
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving opportunities api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve_from_config(BidboardConfig::from_env()).await
}

#[derive(Debug, Deserialize, Default)]
struct OpportunitiesQuery {
    /// Comma-separated NAICS codes.
    naics: Option<String>,
    agency: Option<String>,
    set_aside: Option<String>,
    state: Option<String>,
    city: Option<String>,
    keyword: Option<String>,
    #[serde(default)]
    future_only: bool,
    page_size: Option<usize>,
}

impl OpportunitiesQuery {
    fn filters(&self) -> OpportunityFilters {
        OpportunityFilters {
            naics_codes: self.naics.as_ref().map(|codes| {
                codes
                    .split(',')
                    .map(str::trim)
                    .filter(|code| !code.is_empty())
                    .map(ToString::to_string)
                    .collect()
            }),
            agency: self.agency.clone(),
            set_aside: self.set_aside.clone(),
            state: self.state.clone(),
            city: self.city.clone(),
            keyword: self.keyword.clone(),
            future_deadlines_only: self.future_only,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FeedbackBody {
    rating: Rating,
}

#[derive(Debug, Deserialize)]
struct ShowDismissedBody {
    show: bool,
}

#[derive(Debug, Serialize)]
struct RankedResponse {
    #[serde(flatten)]
    result: RankedResultSet,
    has_more: bool,
    show_dismissed: bool,
}

#[derive(Debug, Serialize)]
struct TrackResponse {
    project_id: Uuid,
    #[serde(flatten)]
    view: RankedResponse,
}

#[derive(Debug, Serialize)]
struct FeedbackResponse {
    notice_id: String,
    rating: Option<Rating>,
    #[serde(flatten)]
    view: RankedResponse,
}

fn ranked_response(session: &UserSession) -> RankedResponse {
    let result = session.ranking.render();
    RankedResponse {
        has_more: result.has_more(),
        show_dismissed: session.ranking.show_dismissed(),
        result,
    }
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok", "crate": CRATE_NAME })).into_response()
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<OpportunitiesQuery>,
) -> Response {
    let user_id = state.user_from_headers(&headers);
    let session = state.session(user_id).await;
    let mut session = session.lock().await;

    let filters = query.filters();
    let page_size = query
        .page_size
        .filter(|n| *n > 0)
        .unwrap_or(state.config.page_size);

    if let Err(err) = state.refresh_user_state(user_id, &mut session).await {
        return server_error(err.into());
    }
    // A failed fetch leaves the previous filters in place for "load more".
    let fetched = match state.source.fetch_opportunities(&filters, 0, page_size).await {
        Ok(fetched) => fetched,
        Err(err) => return server_error(err.into()),
    };
    session.filters = filters;
    session.page_size = page_size;
    session
        .ranking
        .apply_fetched(fetched.items, fetched.total_count, true);
    info!(
        %user_id,
        loaded = session.ranking.accumulated().len(),
        "loaded first opportunities page"
    );
    Json(ranked_response(&session)).into_response()
}

async fn more_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user_id = state.user_from_headers(&headers);
    let session = state.session(user_id).await;
    let mut session = session.lock().await;

    if let Err(err) = state.load_page(&mut session, false).await {
        return server_error(err.into());
    }
    Json(ranked_response(&session)).into_response()
}

async fn ranked_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user_id = state.user_from_headers(&headers);
    let session = state.session(user_id).await;
    let session = session.lock().await;
    Json(ranked_response(&session)).into_response()
}

async fn show_dismissed_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ShowDismissedBody>,
) -> Response {
    let user_id = state.user_from_headers(&headers);
    let session = state.session(user_id).await;
    let mut session = session.lock().await;
    session.ranking.set_show_dismissed(body.show);
    Json(ranked_response(&session)).into_response()
}

/// Clicking the active rating clears it; any other click sets it.
async fn feedback_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<FeedbackBody>,
) -> Response {
    let user_id = state.user_from_headers(&headers);
    let session = state.session(user_id).await;
    let mut session = session.lock().await;

    let previous = session.ranking.rating(&id);
    let next = session.ranking.toggle_feedback(&id, body.rating);
    if let Err(err) = state.backend.set_feedback(user_id, &id, next).await {
        session.ranking.set_feedback(&id, previous);
        return server_error(err.into());
    }
    info!(%user_id, notice_id = %id, rating = next.map(Rating::as_str), "feedback saved");
    feedback_response(&session, id, next)
}

async fn clear_feedback_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let user_id = state.user_from_headers(&headers);
    let session = state.session(user_id).await;
    let mut session = session.lock().await;
    write_feedback(&state, user_id, &mut session, id, None).await
}

async fn write_feedback(
    state: &AppState,
    user_id: Uuid,
    session: &mut UserSession,
    notice_id: String,
    rating: Option<Rating>,
) -> Response {
    if let Err(err) = state.backend.set_feedback(user_id, &notice_id, rating).await {
        return server_error(err.into());
    }
    session.ranking.set_feedback(&notice_id, rating);
    info!(%user_id, notice_id = %notice_id, rating = rating.map(Rating::as_str), "feedback saved");
    feedback_response(session, notice_id, rating)
}

fn feedback_response(session: &UserSession, notice_id: String, rating: Option<Rating>) -> Response {
    Json(FeedbackResponse {
        notice_id,
        rating,
        view: ranked_response(session),
    })
    .into_response()
}

async fn dismiss_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Response {
    write_dismissal(&state, &headers, id, true).await
}

async fn undismiss_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Response {
    write_dismissal(&state, &headers, id, false).await
}

async fn write_dismissal(
    state: &AppState,
    headers: &HeaderMap,
    notice_id: String,
    dismissed: bool,
) -> Response {
    let user_id = state.user_from_headers(headers);
    let session = state.session(user_id).await;
    let mut session = session.lock().await;

    if let Err(err) = state.backend.set_dismissed(user_id, &notice_id, dismissed).await {
        return server_error(err.into());
    }
    session.ranking.set_dismissed(&notice_id, dismissed);
    info!(%user_id, notice_id = %notice_id, dismissed, "dismissal saved");
    Json(ranked_response(&session)).into_response()
}

async fn pursuit_plan_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let user_id = state.user_from_headers(&headers);
    let session = state.session(user_id).await;
    let session = session.lock().await;

    match session.ranking.find(&id) {
        Some(opp) => {
            Json(PursuitPlan::from_opportunity(opp, &state.config.owner, user_id)).into_response()
        }
        None => not_loaded(&id),
    }
}

/// Promote a loaded opportunity to a tracked project.
async fn track_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let user_id = state.user_from_headers(&headers);
    let session = state.session(user_id).await;
    let mut session = session.lock().await;

    let Some(plan) = session
        .ranking
        .find(&id)
        .map(|opp| PursuitPlan::from_opportunity(opp, &state.config.owner, user_id))
    else {
        return not_loaded(&id);
    };

    let project_id = match state.backend.track(&plan).await {
        Ok(project_id) => project_id,
        Err(err @ StoreError::AlreadyTracked(_)) => {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response();
        }
        Err(err) => return server_error(err.into()),
    };
    match state.backend.tracked_notice_ids().await {
        Ok(tracked) => session.ranking.set_tracked_notice_ids(tracked),
        Err(err) => return server_error(err.into()),
    }
    info!(%user_id, notice_id = %id, %project_id, "opportunity tracked");
    Json(TrackResponse {
        project_id,
        view: ranked_response(&session),
    })
    .into_response()
}

async fn urgency_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.backend.open_projects().await {
        Ok(projects) => Json(UrgencyCounts::tally(&projects, Utc::now())).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn not_loaded(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("opportunity {id} is not loaded") })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("Server error: {err}") })),
    )
        .into_response()
}
