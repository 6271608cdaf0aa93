//! Core domain model for Bidboard: opportunities, user feedback, scoring
//! profiles and the small display rules shared by the engine and its callers.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidboard-core";

/// Stable identity of an opportunity across reloads.
pub type NoticeId = String;

/// Explicit feedback keyed by notice id for a single user.
pub type FeedbackMap = HashMap<NoticeId, Rating>;

/// Notice ids a single user has hidden from the default view.
pub type DismissalSet = HashSet<NoticeId>;

/// A candidate solicitation surfaced by the external scanner.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Opportunity {
    pub notice_id: NoticeId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default)]
    pub naics_code: Option<String>,
    #[serde(default)]
    pub set_aside: Option<String>,
    #[serde(default)]
    pub estimated_value: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub response_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description_text: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ai_summary: Option<String>,
    #[serde(default, alias = "last_score")]
    pub ai_score: Option<f64>,
    #[serde(default)]
    pub ai_reasons_json: Option<String>,
    #[serde(default)]
    pub ui_link: Option<String>,
    #[serde(default)]
    pub solicitation_number: Option<String>,
    #[serde(default)]
    pub pursuit_status: Option<String>,
}

impl Opportunity {
    pub fn new(notice_id: impl Into<NoticeId>) -> Self {
        Self {
            notice_id: notice_id.into(),
            ..Default::default()
        }
    }

    /// Long-form description when present, otherwise the short excerpt.
    pub fn description_body(&self) -> &str {
        non_blank(self.description_text.as_deref())
            .or_else(|| non_blank(self.description.as_deref()))
            .unwrap_or_default()
    }

    pub fn ai_score_or_zero(&self) -> f64 {
        self.ai_score.filter(|s| s.is_finite()).unwrap_or(0.0)
    }
}

/// Explicit thumbs-up / thumbs-down reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Up,
    Down,
}

impl Rating {
    pub fn as_str(self) -> &'static str {
        match self {
            Rating::Up => "up",
            Rating::Down => "down",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "up" => Some(Rating::Up),
            "down" => Some(Rating::Down),
            _ => None,
        }
    }
}

/// Persisted feedback row; at most one per `(user_id, notice_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub user_id: Uuid,
    pub notice_id: NoticeId,
    pub rating: Rating,
}

/// Persisted dismissal row; presence is the whole payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DismissalRecord {
    pub user_id: Uuid,
    pub notice_id: NoticeId,
}

pub const DEFAULT_BASE_WEIGHT: f64 = 50.0;
pub const DEFAULT_POSITIVE_BONUS: f64 = 5.0;
pub const DEFAULT_NEGATIVE_PENALTY: f64 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoringWeights {
    pub base: f64,
    pub positive_bonus: f64,
    pub negative_penalty: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_WEIGHT,
            positive_bonus: DEFAULT_POSITIVE_BONUS,
            negative_penalty: DEFAULT_NEGATIVE_PENALTY,
        }
    }
}

impl ScoringWeights {
    /// Each weight falls back to its default independently when it is
    /// missing or not a finite number.
    pub fn from_json(value: Option<&JsonValue>) -> Self {
        let value = value.map(decode_embedded_json);
        let Some(JsonValue::Object(map)) = value.as_ref() else {
            return Self::default();
        };
        let defaults = Self::default();
        Self {
            base: finite_number(pick(map, &["base"])).unwrap_or(defaults.base),
            positive_bonus: finite_number(pick(map, &["positive_bonus", "positiveBonus"]))
                .unwrap_or(defaults.positive_bonus),
            negative_penalty: finite_number(pick(map, &["negative_penalty", "negativePenalty"]))
                .unwrap_or(defaults.negative_penalty),
        }
    }
}

/// How keywords are located in the search text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Case-insensitive containment anywhere, including inside other words.
    #[default]
    Substring,
    /// Keyword must start and end on a non-alphanumeric boundary.
    WordBoundary,
}

/// User-authored ranking configuration.
///
/// Built from free-form JSON/YAML; every field degrades to its default
/// instead of failing, so a partially corrupt profile still ranks.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ScoringProfile {
    pub name: Option<String>,
    pub is_default: bool,
    pub positive_keywords: Vec<String>,
    pub negative_keywords: Vec<String>,
    pub weights: ScoringWeights,
    pub match_mode: MatchMode,
}

impl ScoringProfile {
    pub fn from_json(value: &JsonValue) -> Self {
        let value = decode_embedded_json(value);
        let JsonValue::Object(map) = &value else {
            return Self::default();
        };
        Self {
            name: pick(map, &["name"])
                .and_then(JsonValue::as_str)
                .map(ToString::to_string),
            is_default: pick(map, &["is_default", "isDefault"])
                .and_then(JsonValue::as_bool)
                .unwrap_or(false),
            positive_keywords: keyword_list(pick(map, &["positive_keywords", "positiveKeywords"])),
            negative_keywords: keyword_list(pick(map, &["negative_keywords", "negativeKeywords"])),
            weights: ScoringWeights::from_json(pick(map, &["weights"])),
            match_mode: match pick(map, &["match_mode", "matchMode"]).and_then(JsonValue::as_str) {
                Some("word_boundary") | Some("wordBoundary") => MatchMode::WordBoundary,
                _ => MatchMode::Substring,
            },
        }
    }
}

impl<'de> Deserialize<'de> for ScoringProfile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        Ok(Self::from_json(&value))
    }
}

fn pick<'a>(map: &'a serde_json::Map<String, JsonValue>, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter().find_map(|k| map.get(*k)).filter(|v| !v.is_null())
}

/// Profile columns are sometimes stored as JSON text rather than JSON.
fn decode_embedded_json(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::String(text) => serde_json::from_str(text).unwrap_or(JsonValue::Null),
        other => other.clone(),
    }
}

fn finite_number(value: Option<&JsonValue>) -> Option<f64> {
    value.and_then(JsonValue::as_f64).filter(|n| n.is_finite())
}

fn keyword_list(value: Option<&JsonValue>) -> Vec<String> {
    match value.map(decode_embedded_json) {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .filter(|k| !k.trim().is_empty())
            .map(ToString::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Case-insensitive containment used by filters.
pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Criteria passed to the opportunity source. Pagination state is scoped to
/// one set of filters; any change means a fresh first page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpportunityFilters {
    /// NAICS codes resolved from a category; `Some(empty)` matches nothing.
    #[serde(default)]
    pub naics_codes: Option<Vec<String>>,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default)]
    pub set_aside: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(default)]
    pub future_deadlines_only: bool,
}

impl OpportunityFilters {
    pub fn agency(&self) -> Option<&str> {
        non_blank(self.agency.as_deref()).map(str::trim)
    }

    pub fn set_aside(&self) -> Option<&str> {
        non_blank(self.set_aside.as_deref()).map(str::trim)
    }

    pub fn state(&self) -> Option<&str> {
        non_blank(self.state.as_deref()).map(str::trim)
    }

    pub fn city(&self) -> Option<&str> {
        non_blank(self.city.as_deref()).map(str::trim)
    }

    pub fn keyword(&self) -> Option<&str> {
        non_blank(self.keyword.as_deref()).map(str::trim)
    }

    /// In-memory evaluation with the same semantics the SQL source applies.
    pub fn matches(&self, opp: &Opportunity, now: DateTime<Utc>) -> bool {
        if let Some(codes) = &self.naics_codes {
            match opp.naics_code.as_deref() {
                Some(code) if codes.iter().any(|c| c == code) => {}
                _ => return false,
            }
        }

        let substring_checks = [
            (self.agency(), opp.agency.as_deref()),
            (self.set_aside(), opp.set_aside.as_deref()),
            (self.city(), opp.city.as_deref()),
        ];
        for (needle, field) in substring_checks {
            if let Some(needle) = needle {
                if !field.is_some_and(|f| contains_ignore_case(f, needle)) {
                    return false;
                }
            }
        }

        if let Some(state) = self.state() {
            if !opp.state.as_deref().is_some_and(|s| s.eq_ignore_ascii_case(state)) {
                return false;
            }
        }

        if let Some(keyword) = self.keyword() {
            let hit = [
                opp.title.as_deref(),
                opp.ai_summary.as_deref(),
                opp.description_text.as_deref(),
            ]
            .into_iter()
            .flatten()
            .any(|text| contains_ignore_case(text, keyword));
            if !hit {
                return false;
            }
        }

        if self.future_deadlines_only && !opp.response_deadline.is_some_and(|d| d >= now) {
            return false;
        }

        true
    }
}

/// Colour band for a 0-100 score badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreTier {
    High,
    Medium,
    Low,
}

impl ScoreTier {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            ScoreTier::High
        } else if score >= 60.0 {
            ScoreTier::Medium
        } else {
            ScoreTier::Low
        }
    }
}

/// Whole days until `deadline`, rounded up. Negative once it has passed.
pub fn days_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (deadline - now).num_milliseconds();
    (millis as f64 / 86_400_000.0).ceil() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadlineUrgency {
    Overdue,
    Critical,
    Soon,
    Upcoming,
    Distant,
}

impl DeadlineUrgency {
    pub fn from_days(days_left: i64) -> Self {
        match days_left {
            d if d < 0 => DeadlineUrgency::Overdue,
            d if d <= 7 => DeadlineUrgency::Critical,
            d if d <= 14 => DeadlineUrgency::Soon,
            d if d <= 30 => DeadlineUrgency::Upcoming,
            _ => DeadlineUrgency::Distant,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineInfo {
    pub days_left: i64,
    pub urgency: DeadlineUrgency,
}

impl DeadlineInfo {
    pub fn for_deadline(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Self> {
        let days_left = days_until(deadline?, now);
        Some(Self {
            days_left,
            urgency: DeadlineUrgency::from_days(days_left),
        })
    }
}

pub const MAX_AI_REASONS: usize = 4;

/// Decode the scanner's `ai_reasons_json` column into display strings.
pub fn parse_ai_reasons(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = non_blank(raw) else {
        return Vec::new();
    };
    match serde_json::from_str::<JsonValue>(raw) {
        Ok(JsonValue::Array(items)) => items
            .into_iter()
            .take(MAX_AI_REASONS)
            .map(|item| match item {
                JsonValue::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Milestone titles and how many days before the response deadline each is due.
pub const MILESTONE_TEMPLATE: [(&str, i64); 6] = [
    ("Questions Due", 10),
    ("Team Assignments", 8),
    ("Draft Complete", 5),
    ("Internal Review", 3),
    ("Final Edits", 2),
    ("Final Submit", 0),
];

pub const DEFAULT_CHECKLIST: [&str; 6] = [
    "Capability Statement",
    "Past Performance References",
    "Technical Approach",
    "Price/Cost Proposal",
    "SAM.gov Registration Verified",
    "Subcontracting Plan (if applicable)",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneDraft {
    pub title: String,
    pub due_date: DateTime<Utc>,
    pub sort_order: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistDraft {
    pub label: String,
    pub sort_order: u32,
}

/// Project draft produced when a user starts pursuing an opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PursuitPlan {
    pub notice_id: NoticeId,
    pub title: String,
    pub agency: Option<String>,
    pub solicitation_number: Option<String>,
    pub response_deadline: Option<DateTime<Utc>>,
    pub owner: String,
    pub priority: Priority,
    pub naics_code: Option<String>,
    pub set_aside: Option<String>,
    pub sam_link: Option<String>,
    pub notes: Option<String>,
    pub ai_score: Option<f64>,
    pub created_by: Uuid,
    pub milestones: Vec<MilestoneDraft>,
    pub checklist: Vec<ChecklistDraft>,
}

impl PursuitPlan {
    pub fn from_opportunity(opp: &Opportunity, owner: &str, created_by: Uuid) -> Self {
        let priority = if opp.ai_score_or_zero() >= 80.0 {
            Priority::High
        } else {
            Priority::Normal
        };
        let milestones = opp
            .response_deadline
            .map(|deadline| {
                MILESTONE_TEMPLATE
                    .iter()
                    .enumerate()
                    .map(|(idx, (title, days_before))| MilestoneDraft {
                        title: (*title).to_string(),
                        due_date: deadline - Duration::days(*days_before),
                        sort_order: idx as u32,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let checklist = DEFAULT_CHECKLIST
            .iter()
            .enumerate()
            .map(|(idx, label)| ChecklistDraft {
                label: (*label).to_string(),
                sort_order: idx as u32,
            })
            .collect();

        Self {
            notice_id: opp.notice_id.clone(),
            title: opp.title.clone().unwrap_or_else(|| opp.notice_id.clone()),
            agency: opp.agency.clone(),
            solicitation_number: opp.solicitation_number.clone(),
            response_deadline: opp.response_deadline,
            owner: owner.to_string(),
            priority,
            naics_code: opp.naics_code.clone(),
            set_aside: opp.set_aside.clone(),
            sam_link: opp.ui_link.clone(),
            notes: opp.ai_summary.clone(),
            ai_score: opp.ai_score,
            created_by,
            milestones,
            checklist,
        }
    }

    /// Details line for the activity log entry written when the plan is tracked.
    pub fn activity_details(&self) -> String {
        match self.ai_score {
            Some(score) => format!("notice_id: {}, score: {score}", self.notice_id),
            None => format!("notice_id: {}, score: none", self.notice_id),
        }
    }
}

pub const TRACKED_ACTIVITY: &str = "Tracked from Top Opportunities";

/// Status given to a project created by tracking an opportunity.
pub const NEW_PROJECT_STATUS: &str = "active";

/// Statuses that count as in-flight work.
pub const OPEN_PROJECT_STATUSES: [&str; 2] = ["active", "submitted"];

fn default_project_status() -> String {
    NEW_PROJECT_STATUS.to_string()
}

/// The slice of a project row the dashboard counters need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub id: Uuid,
    #[serde(default)]
    pub notice_id: Option<NoticeId>,
    pub title: String,
    #[serde(default)]
    pub response_deadline: Option<DateTime<Utc>>,
    #[serde(default = "default_project_status")]
    pub status: String,
}

impl ProjectSummary {
    pub fn is_open(&self) -> bool {
        OPEN_PROJECT_STATUSES.contains(&self.status.as_str())
    }
}

/// Header counters over open projects. Undated projects only count as active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UrgencyCounts {
    pub overdue: usize,
    pub due_7: usize,
    pub due_14: usize,
    pub active: usize,
}

impl UrgencyCounts {
    pub fn tally<'a, I>(projects: I, now: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = &'a ProjectSummary>,
    {
        let mut counts = Self::default();
        for project in projects.into_iter().filter(|p| p.is_open()) {
            counts.active += 1;
            let Some(deadline) = project.response_deadline else {
                continue;
            };
            match days_until(deadline, now) {
                d if d < 0 => counts.overdue += 1,
                d if d <= 7 => counts.due_7 += 1,
                d if d <= 14 => counts.due_14 += 1,
                _ => {}
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().unwrap()
    }

    #[test]
    fn opportunity_accepts_last_score_alias_and_missing_fields() {
        let opp: Opportunity = serde_json::from_value(json!({
            "notice_id": "abc",
            "title": "Janitorial Services",
            "last_score": 72.5
        }))
        .unwrap();
        assert_eq!(opp.ai_score, Some(72.5));
        assert_eq!(opp.agency, None);
        assert_eq!(opp.description_body(), "");
    }

    #[test]
    fn description_body_prefers_long_form() {
        let mut opp = Opportunity::new("x");
        opp.description = Some("short".into());
        assert_eq!(opp.description_body(), "short");
        opp.description_text = Some("the long form".into());
        assert_eq!(opp.description_body(), "the long form");
        opp.description_text = Some("   ".into());
        assert_eq!(opp.description_body(), "short");
    }

    #[test]
    fn scoring_profile_defaults_malformed_fields_independently() {
        let profile = ScoringProfile::from_json(&json!({
            "positive_keywords": "not a list",
            "negative_keywords": ["asbestos", 42, "  ", null, "demolition"],
            "weights": { "base": "sixty", "positiveBonus": 8, "negative_penalty": null }
        }));
        assert!(profile.positive_keywords.is_empty());
        assert_eq!(profile.negative_keywords, vec!["asbestos", "demolition"]);
        assert_eq!(profile.weights.base, DEFAULT_BASE_WEIGHT);
        assert_eq!(profile.weights.positive_bonus, 8.0);
        assert_eq!(profile.weights.negative_penalty, DEFAULT_NEGATIVE_PENALTY);
        assert_eq!(profile.match_mode, MatchMode::Substring);
    }

    #[test]
    fn scoring_profile_decodes_json_text_columns() {
        let profile = ScoringProfile::from_json(&json!({
            "positive_keywords": "[\"hvac\", \"plumbing\"]",
            "weights": "{\"base\": 40}",
            "match_mode": "word_boundary",
            "is_default": true
        }));
        assert_eq!(profile.positive_keywords, vec!["hvac", "plumbing"]);
        assert_eq!(profile.weights.base, 40.0);
        assert_eq!(profile.weights.positive_bonus, DEFAULT_POSITIVE_BONUS);
        assert_eq!(profile.match_mode, MatchMode::WordBoundary);
        assert!(profile.is_default);
    }

    #[test]
    fn urgency_counts_cover_open_projects_only() {
        let now = ts(2027, 3, 1, 12);
        let project = |deadline: Option<DateTime<Utc>>, status: &str| ProjectSummary {
            id: Uuid::new_v4(),
            notice_id: None,
            title: "p".into(),
            response_deadline: deadline,
            status: status.into(),
        };
        let projects = vec![
            project(Some(ts(2027, 2, 27, 12)), "active"),
            project(Some(ts(2027, 3, 5, 12)), "submitted"),
            project(Some(ts(2027, 3, 12, 12)), "active"),
            project(Some(ts(2027, 5, 1, 12)), "active"),
            project(None, "active"),
            project(Some(ts(2027, 2, 1, 12)), "archived"),
        ];
        assert_eq!(
            UrgencyCounts::tally(&projects, now),
            UrgencyCounts {
                overdue: 1,
                due_7: 1,
                due_14: 1,
                active: 5,
            }
        );
    }

    #[test]
    fn padded_keywords_stay_literal() {
        let profile = ScoringProfile::from_json(&json!({
            "positive_keywords": [" art", "hvac ", "\t"]
        }));
        assert_eq!(profile.positive_keywords, vec![" art", "hvac "]);
    }

    #[test]
    fn scoring_profile_from_non_object_is_default() {
        assert_eq!(ScoringProfile::from_json(&json!(17)), ScoringProfile::default());
        let via_serde: ScoringProfile = serde_json::from_value(json!([1, 2])).unwrap();
        assert_eq!(via_serde.weights, ScoringWeights::default());
    }

    #[test]
    fn filters_apply_substring_equality_and_deadline_rules() {
        let now = ts(2026, 3, 1, 12);
        let mut opp = Opportunity::new("n1");
        opp.agency = Some("Department of Veterans Affairs".into());
        opp.naics_code = Some("561720".into());
        opp.state = Some("VA".into());
        opp.city = Some("Richmond".into());
        opp.title = Some("Custodial support".into());
        opp.response_deadline = Some(ts(2026, 3, 10, 0));

        let filters = OpportunityFilters {
            naics_codes: Some(vec!["561720".into(), "561210".into()]),
            agency: Some("veterans".into()),
            state: Some("va".into()),
            city: Some("rich".into()),
            keyword: Some("CUSTODIAL".into()),
            future_deadlines_only: true,
            ..Default::default()
        };
        assert!(filters.matches(&opp, now));

        let none_allowed = OpportunityFilters {
            naics_codes: Some(vec![]),
            ..Default::default()
        };
        assert!(!none_allowed.matches(&opp, now));

        let past = OpportunityFilters {
            future_deadlines_only: true,
            ..Default::default()
        };
        assert!(!past.matches(&opp, ts(2026, 4, 1, 0)));
        opp.response_deadline = None;
        assert!(!past.matches(&opp, now));
        assert!(OpportunityFilters::default().matches(&opp, now));
    }

    #[test]
    fn blank_filter_fields_are_ignored() {
        let filters = OpportunityFilters {
            agency: Some("   ".into()),
            keyword: Some(String::new()),
            ..Default::default()
        };
        assert!(filters.matches(&Opportunity::new("bare"), ts(2026, 1, 1, 0)));
    }

    #[test]
    fn score_tiers_follow_badge_thresholds() {
        assert_eq!(ScoreTier::from_score(80.0), ScoreTier::High);
        assert_eq!(ScoreTier::from_score(79.9), ScoreTier::Medium);
        assert_eq!(ScoreTier::from_score(60.0), ScoreTier::Medium);
        assert_eq!(ScoreTier::from_score(12.0), ScoreTier::Low);
    }

    #[test]
    fn days_until_rounds_up_and_buckets_urgency() {
        let now = ts(2026, 3, 1, 12);
        assert_eq!(days_until(ts(2026, 3, 2, 0), now), 1);
        assert_eq!(days_until(ts(2026, 3, 1, 12), now), 0);
        assert_eq!(days_until(ts(2026, 2, 28, 12), now), -1);

        assert_eq!(DeadlineUrgency::from_days(-1), DeadlineUrgency::Overdue);
        assert_eq!(DeadlineUrgency::from_days(0), DeadlineUrgency::Critical);
        assert_eq!(DeadlineUrgency::from_days(7), DeadlineUrgency::Critical);
        assert_eq!(DeadlineUrgency::from_days(14), DeadlineUrgency::Soon);
        assert_eq!(DeadlineUrgency::from_days(30), DeadlineUrgency::Upcoming);
        assert_eq!(DeadlineUrgency::from_days(31), DeadlineUrgency::Distant);
        assert_eq!(DeadlineInfo::for_deadline(None, now), None);
    }

    #[test]
    fn ai_reasons_are_capped_and_tolerant() {
        let raw = r#"["fits NAICS", "small business", 3, "local", "extra"]"#;
        assert_eq!(
            parse_ai_reasons(Some(raw)),
            vec!["fits NAICS", "small business", "3", "local"]
        );
        assert!(parse_ai_reasons(Some("{not json")).is_empty());
        assert!(parse_ai_reasons(Some(r#"{"a": 1}"#)).is_empty());
        assert!(parse_ai_reasons(None).is_empty());
    }

    #[test]
    fn pursuit_plan_schedules_milestones_back_from_deadline() {
        let mut opp = Opportunity::new("N-77");
        opp.title = Some("Grounds Maintenance".into());
        opp.ai_score = Some(85.0);
        opp.response_deadline = Some(ts(2026, 5, 20, 17));
        let user = Uuid::new_v4();

        let plan = PursuitPlan::from_opportunity(&opp, "Chris", user);
        assert_eq!(plan.priority, Priority::High);
        assert_eq!(plan.milestones.len(), 6);
        assert_eq!(plan.milestones[0].title, "Questions Due");
        assert_eq!(plan.milestones[0].due_date, ts(2026, 5, 10, 17));
        assert_eq!(plan.milestones[5].due_date, ts(2026, 5, 20, 17));
        assert_eq!(plan.checklist.len(), 6);
        assert_eq!(plan.created_by, user);
        assert_eq!(plan.activity_details(), "notice_id: N-77, score: 85");

        opp.response_deadline = None;
        opp.ai_score = None;
        let plan = PursuitPlan::from_opportunity(&opp, "Chris", user);
        assert!(plan.milestones.is_empty());
        assert_eq!(plan.priority, Priority::Normal);
    }

    #[test]
    fn rating_parses_case_insensitively() {
        assert_eq!(Rating::parse(" UP "), Some(Rating::Up));
        assert_eq!(Rating::parse("down"), Some(Rating::Down));
        assert_eq!(Rating::parse("meh"), None);
        assert_eq!(serde_json::to_value(Rating::Up).unwrap(), json!("up"));
    }
}
