use std::collections::HashSet;

use async_trait::async_trait;
use bidboard_core::{
    DismissalSet, FeedbackMap, NoticeId, Opportunity, OpportunityFilters, ProjectSummary,
    PursuitPlan, Rating, ScoringProfile, NEW_PROJECT_STATUS, OPEN_PROJECT_STATUSES,
    TRACKED_ACTIVITY,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    BackoffPolicy, ChangeFeed, ChangeStream, DismissalStore, FeedbackStore, OpportunitySource,
    Page, ProfileStore, ProjectStore, StoreError, TableChange, ACTIVITY_TABLE, CHECKLIST_TABLE,
    MILESTONES_TABLE, PROJECTS_TABLE,
};

/// NOTIFY channel; the payload is the name of the changed table.
pub const CHANGE_CHANNEL: &str = "table_changes";

const OPPORTUNITY_COLUMNS: &str = "notice_id, title, agency, naics_code, set_aside, \
     estimated_value, city, state, response_deadline, description_text, description, \
     ai_summary, last_score::float8 AS ai_score, ai_reasons_json, ui_link, \
     solicitation_number, pursuit_status";

/// Store backed by the hosted Postgres database.
#[derive(Debug)]
pub struct PgStore {
    pool: PgPool,
    changes: broadcast::Sender<TableChange>,
    listener: OnceCell<()>,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            pool,
            changes,
            listener: OnceCell::new(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn start_listener(&self) -> Result<(), StoreError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        info!(channel = CHANGE_CHANNEL, "listening for table changes");

        let sender = self.changes.clone();
        let backoff = BackoffPolicy::default();
        tokio::spawn(async move {
            let mut failures = 0usize;
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        failures = 0;
                        let change = TableChange::from_table_name(notification.payload());
                        debug!(?change, "table change notification");
                        // No live subscribers is not an error.
                        let _ = sender.send(change);
                    }
                    Err(err) => {
                        let delay = backoff.delay_for_attempt(failures);
                        warn!(error = %err, ?delay, "change listener error; reconnecting");
                        failures = failures.saturating_add(1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });
        Ok(())
    }
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 2);
    out.push('%');
    for c in input.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

/// `SELECT <select> FROM scanner_opportunities WHERE ...` for the given filters.
fn filtered_query(
    select: &str,
    filters: &OpportunityFilters,
    now: DateTime<Utc>,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {select} FROM {} WHERE TRUE",
        crate::OPPORTUNITIES_TABLE
    ));

    if let Some(codes) = &filters.naics_codes {
        builder.push(" AND naics_code = ANY(").push_bind(codes.clone()).push(")");
    }
    if let Some(agency) = filters.agency() {
        builder.push(" AND agency ILIKE ").push_bind(escape_like(agency));
    }
    if let Some(set_aside) = filters.set_aside() {
        builder.push(" AND set_aside ILIKE ").push_bind(escape_like(set_aside));
    }
    if let Some(state) = filters.state() {
        builder.push(" AND UPPER(state) = UPPER(").push_bind(state.to_string()).push(")");
    }
    if let Some(city) = filters.city() {
        builder.push(" AND city ILIKE ").push_bind(escape_like(city));
    }
    if let Some(keyword) = filters.keyword() {
        let pattern = escape_like(keyword);
        builder
            .push(" AND (title ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR ai_summary ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR description_text ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if filters.future_deadlines_only {
        builder.push(" AND response_deadline >= ").push_bind(now);
    }
    builder
}

fn opportunity_from_row(row: &PgRow) -> Result<Opportunity, sqlx::Error> {
    Ok(Opportunity {
        notice_id: row.try_get("notice_id")?,
        title: row.try_get("title")?,
        agency: row.try_get("agency")?,
        naics_code: row.try_get("naics_code")?,
        set_aside: row.try_get("set_aside")?,
        estimated_value: row.try_get("estimated_value")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        response_deadline: row.try_get("response_deadline")?,
        description_text: row.try_get("description_text")?,
        description: row.try_get("description")?,
        ai_summary: row.try_get("ai_summary")?,
        ai_score: row.try_get("ai_score")?,
        ai_reasons_json: row.try_get("ai_reasons_json")?,
        ui_link: row.try_get("ui_link")?,
        solicitation_number: row.try_get("solicitation_number")?,
        pursuit_status: row.try_get("pursuit_status")?,
    })
}

#[async_trait]
impl OpportunitySource for PgStore {
    async fn fetch_opportunities(
        &self,
        filters: &OpportunityFilters,
        page: usize,
        page_size: usize,
    ) -> Result<Page, StoreError> {
        let now = Utc::now();
        let page_size = page_size.max(1);

        let total: i64 = filtered_query("COUNT(*)", filters, now)
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut query = filtered_query(OPPORTUNITY_COLUMNS, filters, now);
        query
            .push(" ORDER BY response_deadline ASC NULLS LAST, notice_id ASC LIMIT ")
            .push_bind(page_size as i64)
            .push(" OFFSET ")
            .push_bind(page.saturating_mul(page_size) as i64);
        let rows = query.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(opportunity_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(page, page_size, fetched = items.len(), total, "fetched opportunity page");
        Ok(Page {
            items,
            total_count: total.max(0) as usize,
        })
    }
}

#[async_trait]
impl FeedbackStore for PgStore {
    async fn get_feedback(&self, user_id: Uuid) -> Result<FeedbackMap, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT notice_id, rating
              FROM opportunity_feedback
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = FeedbackMap::with_capacity(rows.len());
        for row in rows {
            let notice_id: String = row.try_get("notice_id")?;
            let rating: String = row.try_get("rating")?;
            match Rating::parse(&rating) {
                Some(rating) => {
                    out.insert(notice_id, rating);
                }
                None => warn!(%notice_id, %rating, "ignoring unknown feedback rating"),
            }
        }
        Ok(out)
    }

    async fn set_feedback(
        &self,
        user_id: Uuid,
        notice_id: &str,
        rating: Option<Rating>,
    ) -> Result<(), StoreError> {
        match rating {
            Some(rating) => {
                sqlx::query(
                    r#"
                    INSERT INTO opportunity_feedback (user_id, notice_id, rating)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (user_id, notice_id)
                    DO UPDATE SET rating = EXCLUDED.rating
                    "#,
                )
                .bind(user_id)
                .bind(notice_id)
                .bind(rating.as_str())
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    DELETE FROM opportunity_feedback
                     WHERE user_id = $1
                       AND notice_id = $2
                    "#,
                )
                .bind(user_id)
                .bind(notice_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DismissalStore for PgStore {
    async fn get_dismissals(&self, user_id: Uuid) -> Result<DismissalSet, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT notice_id
              FROM opportunity_dismissals
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    async fn set_dismissed(
        &self,
        user_id: Uuid,
        notice_id: &str,
        dismissed: bool,
    ) -> Result<(), StoreError> {
        let sql = if dismissed {
            r#"
            INSERT INTO opportunity_dismissals (user_id, notice_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id, notice_id) DO NOTHING
            "#
        } else {
            r#"
            DELETE FROM opportunity_dismissals
             WHERE user_id = $1
               AND notice_id = $2
            "#
        };
        sqlx::query(sql)
            .bind(user_id)
            .bind(notice_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn get_default_profile(&self, user_id: Uuid) -> Result<Option<ScoringProfile>, StoreError> {
        // Whole row as JSON so loosely typed columns decode leniently.
        let row: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT to_jsonb(p)
              FROM scoring_profiles p
             WHERE p.user_id = $1
               AND p.is_default
             LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|value| ScoringProfile::from_json(&value)))
    }
}

#[async_trait]
impl ProjectStore for PgStore {
    async fn tracked_notice_ids(&self) -> Result<HashSet<NoticeId>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT notice_id
              FROM projects
             WHERE notice_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    async fn open_projects(&self) -> Result<Vec<ProjectSummary>, StoreError> {
        let statuses = OPEN_PROJECT_STATUSES.map(String::from).to_vec();
        let rows = sqlx::query(
            r#"
            SELECT id, notice_id, title, response_deadline, status
              FROM projects
             WHERE status = ANY($1)
             ORDER BY response_deadline ASC NULLS LAST
            "#,
        )
        .bind(statuses)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let title: Option<String> = row.try_get("title")?;
            out.push(ProjectSummary {
                id: row.try_get("id")?,
                notice_id: row.try_get("notice_id")?,
                title: title.unwrap_or_default(),
                response_deadline: row.try_get("response_deadline")?,
                status: row.try_get("status")?,
            });
        }
        Ok(out)
    }

    async fn track(&self, plan: &PursuitPlan) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM projects WHERE notice_id = $1 LIMIT 1")
                .bind(&plan.notice_id)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Err(StoreError::AlreadyTracked(plan.notice_id.clone()));
        }

        let project_id: Uuid = sqlx::query_scalar(&format!(
            "INSERT INTO {PROJECTS_TABLE} (title, agency, solicitation_number, notice_id, \
             response_deadline, owner, status, priority, naics_code, set_aside, sam_link, notes, \
             created_by) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             RETURNING id"
        ))
        .bind(&plan.title)
        .bind(&plan.agency)
        .bind(&plan.solicitation_number)
        .bind(&plan.notice_id)
        .bind(plan.response_deadline)
        .bind(&plan.owner)
        .bind(NEW_PROJECT_STATUS)
        .bind(plan.priority.as_str())
        .bind(&plan.naics_code)
        .bind(&plan.set_aside)
        .bind(&plan.sam_link)
        .bind(&plan.notes)
        .bind(plan.created_by)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if unique_violation(&err) {
                StoreError::AlreadyTracked(plan.notice_id.clone())
            } else {
                StoreError::Database(err)
            }
        })?;

        if !plan.milestones.is_empty() {
            let mut milestones = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {MILESTONES_TABLE} (project_id, title, due_date, sort_order) "
            ));
            milestones.push_values(&plan.milestones, |mut row, m| {
                row.push_bind(project_id)
                    .push_bind(m.title.clone())
                    .push_bind(m.due_date)
                    .push_bind(m.sort_order as i32);
            });
            milestones.build().execute(&mut *tx).await?;
        }

        if !plan.checklist.is_empty() {
            let mut checklist = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {CHECKLIST_TABLE} (project_id, label, sort_order) "
            ));
            checklist.push_values(&plan.checklist, |mut row, item| {
                row.push_bind(project_id)
                    .push_bind(item.label.clone())
                    .push_bind(item.sort_order as i32);
            });
            checklist.build().execute(&mut *tx).await?;
        }

        sqlx::query(&format!(
            "INSERT INTO {ACTIVITY_TABLE} (project_id, action, details, performed_by) \
             VALUES ($1, $2, $3, $4)"
        ))
        .bind(project_id)
        .bind(TRACKED_ACTIVITY)
        .bind(plan.activity_details())
        .bind(plan.created_by)
        .execute(&mut *tx)
        .await?;

        // Delivered on commit; folds into the trigger's identical notification.
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANGE_CHANNEL)
            .bind(PROJECTS_TABLE)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(%project_id, notice_id = %plan.notice_id, "tracked opportunity");
        Ok(project_id)
    }
}

fn unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl ChangeFeed for PgStore {
    async fn subscribe(&self) -> Result<ChangeStream, StoreError> {
        // Subscribe before the listener can emit anything.
        let receiver = self.changes.subscribe();
        self.listener
            .get_or_try_init(|| self.start_listener())
            .await?;
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Execute;

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(escape_like("8(a)"), "%8(a)%");
        assert_eq!(escape_like("50%_off\\"), "%50\\%\\_off\\\\%");
    }

    #[test]
    fn filtered_query_only_includes_active_filters() {
        let now = Utc::now();
        let mut bare = filtered_query("COUNT(*)", &OpportunityFilters::default(), now);
        assert_eq!(
            bare.build().sql(),
            "SELECT COUNT(*) FROM scanner_opportunities WHERE TRUE"
        );

        let filters = OpportunityFilters {
            naics_codes: Some(vec!["561720".into()]),
            agency: Some("army".into()),
            keyword: Some("roof".into()),
            future_deadlines_only: true,
            ..Default::default()
        };
        let mut built = filtered_query("notice_id", &filters, now);
        let sql = built.build().sql().to_string();
        assert!(sql.contains("naics_code = ANY($1)"));
        assert!(sql.contains("agency ILIKE $2"));
        assert!(sql.contains("(title ILIKE $3 OR ai_summary ILIKE $4 OR description_text ILIKE $5)"));
        assert!(sql.contains("response_deadline >= $6"));
        assert!(!sql.contains("city"));
    }
}
