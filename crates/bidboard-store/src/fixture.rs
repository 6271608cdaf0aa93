use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bidboard_core::{
    DismissalRecord, DismissalSet, FeedbackMap, FeedbackRecord, NoticeId, Opportunity,
    OpportunityFilters, ProjectSummary, PursuitPlan, Rating, ScoringProfile, NEW_PROJECT_STATUS,
    TRACKED_ACTIVITY,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    ActivityRecord, ChangeFeed, ChangeStream, DismissalStore, FeedbackStore, OpportunitySource, Page,
    ProfileStore, ProjectStore, StoreError, TableChange,
};

/// File-backed store for local runs and tests.
///
/// Reads `opportunities.json` (required) and the optional `feedback.json`,
/// `dismissals.json`, `profiles.yaml` and `projects.json` from one directory.
/// Writes stay in memory and are announced on the change feed.
#[derive(Debug)]
pub struct FixtureStore {
    root: PathBuf,
    opportunities: Vec<Opportunity>,
    state: Mutex<FixtureState>,
    changes: broadcast::Sender<TableChange>,
}

#[derive(Debug, Default)]
struct FixtureState {
    feedback: Vec<FeedbackRecord>,
    dismissals: Vec<DismissalRecord>,
    profiles: Vec<(Uuid, ScoringProfile)>,
    projects: Vec<ProjectSummary>,
    plans: HashMap<Uuid, PursuitPlan>,
    activity: Vec<ActivityRecord>,
}

#[derive(Debug, Deserialize)]
struct ProjectFixture {
    #[serde(default)]
    id: Option<Uuid>,
    #[serde(default)]
    notice_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    response_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    status: Option<String>,
}

impl ProjectFixture {
    fn into_summary(self) -> ProjectSummary {
        ProjectSummary {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            title: self
                .title
                .or_else(|| self.notice_id.clone())
                .unwrap_or_default(),
            notice_id: self.notice_id,
            response_deadline: self.response_deadline,
            status: self
                .status
                .unwrap_or_else(|| NEW_PROJECT_STATUS.to_string()),
        }
    }
}

impl FixtureStore {
    pub async fn load(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let mut opportunities: Vec<Opportunity> =
            read_json(&root.join("opportunities.json")).await?;
        // Server order: soonest deadline first, undated last.
        opportunities.sort_by_key(|o| (o.response_deadline.is_none(), o.response_deadline));

        let feedback: Vec<FeedbackRecord> = read_optional_json(&root.join("feedback.json")).await?;
        let dismissals: Vec<DismissalRecord> =
            read_optional_json(&root.join("dismissals.json")).await?;
        let projects: Vec<ProjectFixture> = read_optional_json(&root.join("projects.json")).await?;
        let profiles = read_profiles(&root.join("profiles.yaml")).await?;

        debug!(
            root = %root.display(),
            opportunities = opportunities.len(),
            feedback = feedback.len(),
            dismissals = dismissals.len(),
            profiles = profiles.len(),
            "loaded fixture store"
        );

        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            root,
            opportunities,
            state: Mutex::new(FixtureState {
                feedback,
                dismissals,
                profiles,
                projects: projects.into_iter().map(ProjectFixture::into_summary).collect(),
                plans: HashMap::new(),
                activity: Vec::new(),
            }),
            changes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn announce(&self, change: TableChange) {
        let _ = self.changes.send(change);
    }

    /// The plan a project was tracked from, when it was created in this process.
    pub async fn tracked_plan(&self, project_id: Uuid) -> Option<PursuitPlan> {
        self.state.lock().await.plans.get(&project_id).cloned()
    }

    pub async fn activity(&self) -> Vec<ActivityRecord> {
        self.state.lock().await.activity.clone()
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let text = fs::read_to_string(path).await.map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|err| StoreError::Decode {
        path: path.display().to_string(),
        message: err.to_string(),
    })
}

async fn read_optional_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(T::default());
    }
    read_json(path).await
}

async fn read_profiles(path: &Path) -> Result<Vec<(Uuid, ScoringProfile)>, StoreError> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).await.map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let doc: JsonValue = serde_yaml::from_str(&text).map_err(|err| StoreError::Decode {
        path: path.display().to_string(),
        message: err.to_string(),
    })?;

    let entries = doc
        .get("profiles")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let user_id = entry
            .get("user_id")
            .and_then(JsonValue::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        match user_id {
            Some(user_id) => out.push((user_id, ScoringProfile::from_json(&entry))),
            None => warn!(path = %path.display(), "skipping profile without a valid user_id"),
        }
    }
    Ok(out)
}

#[async_trait]
impl OpportunitySource for FixtureStore {
    async fn fetch_opportunities(
        &self,
        filters: &OpportunityFilters,
        page: usize,
        page_size: usize,
    ) -> Result<Page, StoreError> {
        let now = Utc::now();
        let page_size = page_size.max(1);
        let filtered = self
            .opportunities
            .iter()
            .filter(|o| filters.matches(o, now))
            .collect::<Vec<_>>();
        let items = filtered
            .iter()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .map(|o| (*o).clone())
            .collect();
        Ok(Page {
            items,
            total_count: filtered.len(),
        })
    }
}

#[async_trait]
impl FeedbackStore for FixtureStore {
    async fn get_feedback(&self, user_id: Uuid) -> Result<FeedbackMap, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .feedback
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| (r.notice_id.clone(), r.rating))
            .collect())
    }

    async fn set_feedback(
        &self,
        user_id: Uuid,
        notice_id: &str,
        rating: Option<Rating>,
    ) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock().await;
            state
                .feedback
                .retain(|r| !(r.user_id == user_id && r.notice_id == notice_id));
            if let Some(rating) = rating {
                state.feedback.push(FeedbackRecord {
                    user_id,
                    notice_id: notice_id.to_string(),
                    rating,
                });
            }
        }
        self.announce(TableChange::Feedback);
        Ok(())
    }
}

#[async_trait]
impl DismissalStore for FixtureStore {
    async fn get_dismissals(&self, user_id: Uuid) -> Result<DismissalSet, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .dismissals
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.notice_id.clone())
            .collect())
    }

    async fn set_dismissed(
        &self,
        user_id: Uuid,
        notice_id: &str,
        dismissed: bool,
    ) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock().await;
            state
                .dismissals
                .retain(|r| !(r.user_id == user_id && r.notice_id == notice_id));
            if dismissed {
                state.dismissals.push(DismissalRecord {
                    user_id,
                    notice_id: notice_id.to_string(),
                });
            }
        }
        self.announce(TableChange::Dismissals);
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for FixtureStore {
    async fn get_default_profile(&self, user_id: Uuid) -> Result<Option<ScoringProfile>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .profiles
            .iter()
            .find(|(owner, profile)| *owner == user_id && profile.is_default)
            .map(|(_, profile)| profile.clone()))
    }
}

#[async_trait]
impl ProjectStore for FixtureStore {
    async fn tracked_notice_ids(&self) -> Result<HashSet<NoticeId>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .projects
            .iter()
            .filter_map(|p| p.notice_id.clone())
            .collect())
    }

    async fn open_projects(&self) -> Result<Vec<ProjectSummary>, StoreError> {
        let state = self.state.lock().await;
        let mut open = state
            .projects
            .iter()
            .filter(|p| p.is_open())
            .cloned()
            .collect::<Vec<_>>();
        open.sort_by_key(|p| (p.response_deadline.is_none(), p.response_deadline));
        Ok(open)
    }

    async fn track(&self, plan: &PursuitPlan) -> Result<Uuid, StoreError> {
        let project_id = Uuid::new_v4();
        {
            let mut state = self.state.lock().await;
            if state
                .projects
                .iter()
                .any(|p| p.notice_id.as_deref() == Some(plan.notice_id.as_str()))
            {
                return Err(StoreError::AlreadyTracked(plan.notice_id.clone()));
            }
            state.projects.push(ProjectSummary {
                id: project_id,
                notice_id: Some(plan.notice_id.clone()),
                title: plan.title.clone(),
                response_deadline: plan.response_deadline,
                status: NEW_PROJECT_STATUS.to_string(),
            });
            state.plans.insert(project_id, plan.clone());
            state.activity.push(ActivityRecord {
                project_id,
                action: TRACKED_ACTIVITY.to_string(),
                details: Some(plan.activity_details()),
                performed_by: plan.created_by,
            });
        }
        debug!(%project_id, notice_id = %plan.notice_id, "tracked opportunity");
        self.announce(TableChange::Projects);
        Ok(project_id)
    }
}

#[async_trait]
impl ChangeFeed for FixtureStore {
    async fn subscribe(&self) -> Result<ChangeStream, StoreError> {
        Ok(self.changes.subscribe())
    }
}
