//! Opportunity ranking engine: preference inference, keyword scoring and the
//! accumulate/filter/score/sort pipeline behind the opportunities view.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use bidboard_core::{
    parse_ai_reasons, DeadlineInfo, DismissalSet, FeedbackMap, MatchMode, NoticeId, Opportunity,
    Rating, ScoreTier, ScoringProfile,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

pub const CRATE_NAME: &str = "bidboard-rank";

/// Fewer liked opportunities than this yields no preference profile.
pub const MIN_LIKED_FOR_PREFERENCES: usize = 2;

/// A value must recur in this many liked opportunities to become a signal.
pub const MIN_SIGNAL_OCCURRENCES: usize = 2;

/// Affinities inferred from repeated thumbs-up feedback.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PreferenceProfile {
    pub agencies: BTreeSet<String>,
    pub naics_codes: BTreeSet<String>,
    pub set_asides: BTreeSet<String>,
}

impl PreferenceProfile {
    pub fn is_empty(&self) -> bool {
        self.agencies.is_empty() && self.naics_codes.is_empty() && self.set_asides.is_empty()
    }
}

/// Derive a preference profile from `up` feedback on opportunities that are
/// currently loaded. Liked notice ids outside `loaded` are inert.
pub fn build_preferences(
    feedback: &FeedbackMap,
    loaded: &[Opportunity],
) -> Option<PreferenceProfile> {
    let liked: HashSet<&str> = feedback
        .iter()
        .filter(|(_, rating)| **rating == Rating::Up)
        .map(|(id, _)| id.as_str())
        .collect();
    if liked.len() < MIN_LIKED_FOR_PREFERENCES {
        return None;
    }

    let mut agencies = BTreeMap::<&str, usize>::new();
    let mut naics = BTreeMap::<&str, usize>::new();
    let mut set_asides = BTreeMap::<&str, usize>::new();
    let mut counted = HashSet::new();

    for opp in loaded {
        if !liked.contains(opp.notice_id.as_str()) || !counted.insert(opp.notice_id.as_str()) {
            continue;
        }
        for (counts, value) in [
            (&mut agencies, opp.agency.as_deref()),
            (&mut naics, opp.naics_code.as_deref()),
            (&mut set_asides, opp.set_aside.as_deref()),
        ] {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                *counts.entry(value).or_default() += 1;
            }
        }
    }

    Some(PreferenceProfile {
        agencies: recurring(agencies),
        naics_codes: recurring(naics),
        set_asides: recurring(set_asides),
    })
}

fn recurring(counts: BTreeMap<&str, usize>) -> BTreeSet<String> {
    counts
        .into_iter()
        .filter(|(_, count)| *count >= MIN_SIGNAL_OCCURRENCES)
        .map(|(value, _)| value.to_string())
        .collect()
}

/// True when any one of agency, NAICS code or set-aside is a known signal.
pub fn matches_preferences(opp: &Opportunity, profile: Option<&PreferenceProfile>) -> bool {
    let Some(profile) = profile else {
        return false;
    };
    let hit = |value: Option<&String>, set: &BTreeSet<String>| value.is_some_and(|v| set.contains(v));
    hit(opp.agency.as_ref(), &profile.agencies)
        || hit(opp.naics_code.as_ref(), &profile.naics_codes)
        || hit(opp.set_aside.as_ref(), &profile.set_asides)
}

/// Result of applying a scoring profile to one opportunity.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct KeywordScore {
    /// `None` means no profile is configured, which is not the same as zero.
    pub score: Option<f64>,
    pub matched: Vec<String>,
    pub mismatched: Vec<String>,
}

/// Lowercased text the keyword lists are matched against.
pub fn search_text(opp: &Opportunity) -> String {
    [
        opp.title.as_deref().unwrap_or_default(),
        opp.agency.as_deref().unwrap_or_default(),
        opp.naics_code.as_deref().unwrap_or_default(),
        opp.set_aside.as_deref().unwrap_or_default(),
        opp.description_body(),
        opp.ai_summary.as_deref().unwrap_or_default(),
    ]
    .join(" ")
    .to_lowercase()
}

/// Score one opportunity in `[0, 100]`.
///
/// Substring mode matches a keyword anywhere, so "art" also hits "start".
pub fn score_opportunity(opp: &Opportunity, profile: Option<&ScoringProfile>) -> KeywordScore {
    let Some(profile) = profile else {
        return KeywordScore::default();
    };

    let text = search_text(opp);
    let weights = profile.weights;
    let mut score = weights.base;
    let mut matched = Vec::new();
    let mut mismatched = Vec::new();

    for keyword in &profile.positive_keywords {
        if keyword_hit(&text, keyword, profile.match_mode) {
            score += weights.positive_bonus;
            matched.push(keyword.clone());
        }
    }
    for keyword in &profile.negative_keywords {
        if keyword_hit(&text, keyword, profile.match_mode) {
            score -= weights.negative_penalty;
            mismatched.push(keyword.clone());
        }
    }

    KeywordScore {
        score: Some(score.clamp(0.0, 100.0)),
        matched,
        mismatched,
    }
}

fn keyword_hit(text: &str, keyword: &str, mode: MatchMode) -> bool {
    if keyword.trim().is_empty() {
        return false;
    }
    let needle = keyword.to_lowercase();
    match mode {
        MatchMode::Substring => text.contains(&needle),
        MatchMode::WordBoundary => text.match_indices(&needle).any(|(start, found)| {
            let before = text[..start].chars().next_back();
            let after = text[start + found.len()..].chars().next();
            !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
        }),
    }
}

/// One row of the ranked view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedItem {
    pub opportunity: Opportunity,
    pub user_score: Option<f64>,
    pub matched_keywords: Vec<String>,
    pub mismatched_keywords: Vec<String>,
    pub matches_preferences: bool,
    /// Only ever true while dismissed items are being revealed.
    pub dismissed: bool,
    pub tracked: bool,
    pub rating: Option<Rating>,
    pub score_tier: ScoreTier,
    pub deadline: Option<DeadlineInfo>,
    pub ai_reasons: Vec<String>,
}

impl RankedItem {
    /// The score shown on the badge: the user score when present, else the AI score.
    pub fn display_score(&self) -> f64 {
        self.user_score
            .unwrap_or_else(|| self.opportunity.ai_score_or_zero())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResultSet {
    pub items: Vec<RankedItem>,
    pub loaded_count: usize,
    pub total_count: usize,
    pub dismissed_count: usize,
    pub preferences: Option<PreferenceProfile>,
}

impl RankedResultSet {
    pub fn has_more(&self) -> bool {
        self.loaded_count < self.total_count
    }

    pub fn notice_ids(&self) -> Vec<&str> {
        self.items
            .iter()
            .map(|item| item.opportunity.notice_id.as_str())
            .collect()
    }
}

/// Scored items first (by user score, descending), then unscored items by
/// AI score, descending. Callers rely on a stable sort for ties.
fn rank_order(a: &RankedItem, b: &RankedItem) -> Ordering {
    match (a.user_score, b.user_score) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b
            .opportunity
            .ai_score_or_zero()
            .partial_cmp(&a.opportunity.ai_score_or_zero())
            .unwrap_or(Ordering::Equal),
    }
}

/// Per-user ranking state for one filter session.
///
/// Not meant for concurrent use: callers that share a session across tasks
/// must wrap it in a mutex and hold the lock across fetch and `apply_page`.
#[derive(Debug, Clone, Default)]
pub struct RankingSession {
    accumulated: Vec<Opportunity>,
    seen: HashSet<NoticeId>,
    feedback: FeedbackMap,
    dismissals: DismissalSet,
    profile: Option<ScoringProfile>,
    tracked: HashSet<NoticeId>,
    show_dismissed: bool,
    pages_loaded: usize,
    total_count: usize,
}

impl RankingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a fetched page. A first page replaces everything accumulated so
    /// far; later pages only add notice ids not yet seen.
    pub fn apply_page(&mut self, items: Vec<Opportunity>, is_first_page: bool) {
        if is_first_page {
            self.accumulated.clear();
            self.seen.clear();
            self.pages_loaded = 0;
        }

        let before = self.accumulated.len();
        let offered = items.len();
        for item in items {
            if self.seen.insert(item.notice_id.clone()) {
                self.accumulated.push(item);
            }
        }
        self.pages_loaded += 1;

        debug!(
            is_first_page,
            offered,
            added = self.accumulated.len() - before,
            loaded = self.accumulated.len(),
            "applied opportunity page"
        );
    }

    /// Apply a page together with the count the server reported for the filter.
    pub fn apply_fetched(&mut self, items: Vec<Opportunity>, total_count: usize, is_first_page: bool) {
        self.apply_page(items, is_first_page);
        self.set_total_count(total_count);
    }

    pub fn set_total_count(&mut self, total_count: usize) {
        self.total_count = total_count;
    }

    pub fn accumulated(&self) -> &[Opportunity] {
        &self.accumulated
    }

    pub fn find(&self, notice_id: &str) -> Option<&Opportunity> {
        self.accumulated.iter().find(|o| o.notice_id == notice_id)
    }

    pub fn pages_loaded(&self) -> usize {
        self.pages_loaded
    }

    /// Zero-based index of the page a "load more" should request.
    pub fn next_page(&self) -> usize {
        self.pages_loaded
    }

    pub fn feedback(&self) -> &FeedbackMap {
        &self.feedback
    }

    pub fn rating(&self, notice_id: &str) -> Option<Rating> {
        self.feedback.get(notice_id).copied()
    }

    pub fn replace_feedback(&mut self, feedback: FeedbackMap) {
        debug!(entries = feedback.len(), "replaced feedback");
        self.feedback = feedback;
    }

    pub fn set_feedback(&mut self, notice_id: &str, rating: Option<Rating>) {
        match rating {
            Some(rating) => {
                self.feedback.insert(notice_id.to_string(), rating);
            }
            None => {
                self.feedback.remove(notice_id);
            }
        }
        debug!(notice_id, rating = ?rating, "feedback updated");
    }

    /// Pressing the rating already held clears it. Returns the resulting value
    /// so the caller can persist the same change.
    pub fn toggle_feedback(&mut self, notice_id: &str, rating: Rating) -> Option<Rating> {
        let next = if self.rating(notice_id) == Some(rating) {
            None
        } else {
            Some(rating)
        };
        self.set_feedback(notice_id, next);
        next
    }

    pub fn dismissals(&self) -> &DismissalSet {
        &self.dismissals
    }

    pub fn is_dismissed(&self, notice_id: &str) -> bool {
        self.dismissals.contains(notice_id)
    }

    pub fn replace_dismissals(&mut self, dismissals: DismissalSet) {
        debug!(entries = dismissals.len(), "replaced dismissals");
        self.dismissals = dismissals;
    }

    pub fn set_dismissed(&mut self, notice_id: &str, dismissed: bool) {
        if dismissed {
            self.dismissals.insert(notice_id.to_string());
        } else {
            self.dismissals.remove(notice_id);
        }
        debug!(notice_id, dismissed, "dismissal updated");
    }

    pub fn show_dismissed(&self) -> bool {
        self.show_dismissed
    }

    pub fn set_show_dismissed(&mut self, show: bool) {
        self.show_dismissed = show;
    }

    pub fn profile(&self) -> Option<&ScoringProfile> {
        self.profile.as_ref()
    }

    pub fn set_profile(&mut self, profile: Option<ScoringProfile>) {
        debug!(has_profile = profile.is_some(), "scoring profile set");
        self.profile = profile;
    }

    pub fn set_tracked_notice_ids<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = NoticeId>,
    {
        self.tracked = ids.into_iter().collect();
    }

    pub fn preferences(&self) -> Option<PreferenceProfile> {
        build_preferences(&self.feedback, &self.accumulated)
    }

    pub fn render(&self) -> RankedResultSet {
        self.render_at(Utc::now())
    }

    /// Build the ranked view. `now` only feeds the deadline countdowns; the
    /// item order depends solely on the session state.
    pub fn render_at(&self, now: DateTime<Utc>) -> RankedResultSet {
        let preferences = self.preferences();
        let dismissed_count = self
            .accumulated
            .iter()
            .filter(|o| self.dismissals.contains(&o.notice_id))
            .count();

        let mut items = self
            .accumulated
            .iter()
            .filter(|o| self.show_dismissed || !self.dismissals.contains(&o.notice_id))
            .map(|opp| {
                let scored = score_opportunity(opp, self.profile.as_ref());
                let display = scored.score.unwrap_or_else(|| opp.ai_score_or_zero());
                RankedItem {
                    user_score: scored.score,
                    matched_keywords: scored.matched,
                    mismatched_keywords: scored.mismatched,
                    matches_preferences: matches_preferences(opp, preferences.as_ref()),
                    dismissed: self.dismissals.contains(&opp.notice_id),
                    tracked: self.tracked.contains(&opp.notice_id),
                    rating: self.rating(&opp.notice_id),
                    score_tier: ScoreTier::from_score(display),
                    deadline: DeadlineInfo::for_deadline(opp.response_deadline, now),
                    ai_reasons: parse_ai_reasons(opp.ai_reasons_json.as_deref()),
                    opportunity: opp.clone(),
                }
            })
            .collect::<Vec<_>>();
        items.sort_by(rank_order);

        debug!(
            visible = items.len(),
            loaded = self.accumulated.len(),
            total = self.total_count,
            dismissed_count,
            has_profile = self.profile.is_some(),
            has_preferences = preferences.is_some(),
            "rendered ranked opportunities"
        );

        RankedResultSet {
            items,
            loaded_count: self.accumulated.len(),
            total_count: self.total_count,
            dismissed_count,
            preferences,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidboard_core::ScoringWeights;
    use chrono::TimeZone;

    fn opp(id: &str, agency: &str, ai_score: f64) -> Opportunity {
        Opportunity {
            notice_id: id.to_string(),
            title: Some(format!("Solicitation {id}")),
            agency: Some(agency.to_string()),
            ai_score: Some(ai_score),
            ..Default::default()
        }
    }

    fn profile(positive: &[&str], negative: &[&str]) -> ScoringProfile {
        ScoringProfile {
            positive_keywords: positive.iter().map(|k| k.to_string()).collect(),
            negative_keywords: negative.iter().map(|k| k.to_string()).collect(),
            ..Default::default()
        }
    }

    fn feedback(entries: &[(&str, Rating)]) -> FeedbackMap {
        entries
            .iter()
            .map(|(id, r)| (id.to_string(), *r))
            .collect()
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn single_like_is_not_a_signal() {
        let loaded = vec![opp("1", "DoD", 10.0), opp("2", "DoD", 10.0)];
        assert_eq!(build_preferences(&feedback(&[("1", Rating::Up)]), &loaded), None);

        let prefs = build_preferences(&feedback(&[("1", Rating::Up), ("2", Rating::Up)]), &loaded)
            .expect("two likes build a profile");
        assert!(prefs.agencies.contains("DoD"));
    }

    #[test]
    fn down_votes_and_unloaded_likes_do_not_count() {
        let mut a = opp("1", "GSA", 0.0);
        a.naics_code = Some("236220".into());
        let mut b = opp("2", "GSA", 0.0);
        b.naics_code = Some("236220".into());
        let loaded = vec![a, b];

        let prefs = build_preferences(
            &feedback(&[("1", Rating::Up), ("2", Rating::Down), ("gone", Rating::Up)]),
            &loaded,
        )
        .expect("two up entries exist");
        assert!(prefs.is_empty());
    }

    #[test]
    fn duplicate_loaded_rows_count_once() {
        let loaded = vec![opp("1", "EPA", 0.0), opp("1", "EPA", 0.0), opp("2", "DOE", 0.0)];
        let prefs = build_preferences(&feedback(&[("1", Rating::Up), ("2", Rating::Up)]), &loaded)
            .unwrap();
        assert!(prefs.agencies.is_empty());
    }

    #[test]
    fn preference_match_is_an_or_across_dimensions() {
        let prefs = PreferenceProfile {
            agencies: BTreeSet::from(["DoD".to_string()]),
            ..Default::default()
        };
        let mut candidate = opp("9", "DoD", 0.0);
        candidate.naics_code = Some("999999".into());
        assert!(matches_preferences(&candidate, Some(&prefs)));

        let mut other = opp("10", "NASA", 0.0);
        other.set_aside = Some("8(a)".into());
        assert!(!matches_preferences(&other, Some(&prefs)));
        assert!(!matches_preferences(&candidate, None));
    }

    #[test]
    fn scorer_without_profile_returns_no_score() {
        let mut candidate = opp("1", "EPA", 99.0);
        candidate.description_text = Some("anything at all".into());
        assert_eq!(score_opportunity(&candidate, None), KeywordScore::default());
    }

    #[test]
    fn scorer_applies_bonus_penalty_and_records_keywords() {
        let mut candidate = opp("1", "Army Corps of Engineers", 0.0);
        candidate.title = Some("HVAC Replacement".into());
        candidate.ai_summary = Some("Includes asbestos abatement".into());
        let scored = score_opportunity(
            &candidate,
            Some(&profile(&["hvac", "Army", "roofing"], &["ASBESTOS"])),
        );
        assert_eq!(scored.score, Some(50.0 + 5.0 + 5.0 - 15.0));
        assert_eq!(scored.matched, vec!["hvac", "Army"]);
        assert_eq!(scored.mismatched, vec!["ASBESTOS"]);
    }

    #[test]
    fn scorer_clamps_to_one_hundred_and_zero() {
        let mut candidate = opp("1", "VA", 0.0);
        candidate.title = Some("alpha bravo charlie delta echo foxtrot golf hotel india juliet kilo lima mike november oscar papa quebec romeo sierra tango".into());
        let words = [
            "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
            "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo",
            "sierra", "tango",
        ];
        let scored = score_opportunity(&candidate, Some(&profile(&words, &[])));
        assert_eq!(scored.matched.len(), 20);
        assert_eq!(scored.score, Some(100.0));

        let scored = score_opportunity(&candidate, Some(&profile(&[], &["alpha", "bravo", "charlie", "delta"])));
        assert_eq!(scored.score, Some(0.0));
    }

    #[test]
    fn scorer_is_deterministic() {
        let mut candidate = opp("1", "EPA", 0.0);
        candidate.description = Some("Wetland restoration and monitoring".into());
        let p = profile(&["wetland", "monitor"], &["dredging"]);
        let first = score_opportunity(&candidate, Some(&p));
        let second = score_opportunity(&candidate, Some(&p));
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn substring_mode_matches_inside_words_but_word_boundary_does_not() {
        let mut candidate = opp("1", "NPS", 0.0);
        candidate.title = Some("Start-up of visitor center".into());
        let mut p = profile(&["art"], &[]);
        assert_eq!(score_opportunity(&candidate, Some(&p)).matched, vec!["art"]);

        p.match_mode = MatchMode::WordBoundary;
        assert!(score_opportunity(&candidate, Some(&p)).matched.is_empty());

        p.positive_keywords = vec!["visitor center".into(), "start".into()];
        assert_eq!(
            score_opportunity(&candidate, Some(&p)).matched,
            vec!["visitor center", "start"]
        );
    }

    #[test]
    fn padded_keyword_is_matched_literally() {
        let mut candidate = opp("1", "NPS", 0.0);
        candidate.title = Some("Start-up of visitor center".into());
        let p = profile(&[" art"], &[]);
        let scored = score_opportunity(&candidate, Some(&p));
        assert_eq!(scored.score, Some(50.0));
        assert!(scored.matched.is_empty());

        candidate.title = Some("Public art installation".into());
        assert_eq!(score_opportunity(&candidate, Some(&p)).matched, vec![" art"]);
    }

    #[test]
    fn blank_keywords_never_match() {
        let p = profile(&["", "  "], &[""]);
        let scored = score_opportunity(&opp("1", "EPA", 0.0), Some(&p));
        assert_eq!(scored.score, Some(50.0));
        assert!(scored.matched.is_empty() && scored.mismatched.is_empty());
    }

    #[test]
    fn custom_weights_are_used() {
        let mut p = profile(&["epa"], &[]);
        p.weights = ScoringWeights {
            base: 10.0,
            positive_bonus: 30.0,
            negative_penalty: 1.0,
        };
        assert_eq!(score_opportunity(&opp("1", "EPA", 0.0), Some(&p)).score, Some(40.0));
    }

    #[test]
    fn user_score_order_ignores_ai_score() {
        let mut session = RankingSession::new();
        let mut low_user = opp("low", "EPA", 1.0);
        low_user.title = Some("asbestos removal".into());
        session.apply_page(
            vec![opp("ai-only", "DOE", 100.0), low_user, opp("mid", "EPA", 5.0)],
            true,
        );
        let mut p = profile(&[], &["asbestos", "removal", "asbestos removal", "asb"]);
        p.weights.base = 1.0;
        session.set_profile(Some(p));

        let out = session.render_at(fixed_now());
        assert!(out.items.iter().all(|i| i.user_score.is_some()));
        assert_eq!(out.notice_ids(), vec!["ai-only", "mid", "low"]);
        assert_eq!(out.items[2].user_score, Some(0.0));
    }

    #[test]
    fn sort_without_profile_uses_ai_score_with_stable_ties() {
        let mut session = RankingSession::new();
        let mut missing = opp("missing", "X", 0.0);
        missing.ai_score = None;
        session.apply_page(
            vec![
                missing,
                opp("a", "X", 50.0),
                opp("b", "X", 70.0),
                opp("c", "X", 50.0),
                opp("zero", "X", 0.0),
            ],
            true,
        );
        let out = session.render_at(fixed_now());
        assert_eq!(out.notice_ids(), vec!["b", "a", "c", "missing", "zero"]);
        assert!(out.items.iter().all(|i| i.user_score.is_none()));
    }

    #[test]
    fn mixed_scored_and_unscored_ordering() {
        let items = vec![
            RankedItem {
                user_score: None,
                ..ranked(opp("ai", "X", 99.0))
            },
            RankedItem {
                user_score: Some(0.0),
                ..ranked(opp("user", "X", 0.0))
            },
        ];
        let mut sorted = items.clone();
        sorted.sort_by(rank_order);
        assert_eq!(sorted[0].opportunity.notice_id, "user");
        assert_eq!(sorted[1].opportunity.notice_id, "ai");
    }

    fn ranked(opportunity: Opportunity) -> RankedItem {
        RankedItem {
            opportunity,
            user_score: None,
            matched_keywords: vec![],
            mismatched_keywords: vec![],
            matches_preferences: false,
            dismissed: false,
            tracked: false,
            rating: None,
            score_tier: ScoreTier::Low,
            deadline: None,
            ai_reasons: vec![],
        }
    }

    #[test]
    fn pagination_dedupes_by_notice_id_first_occurrence_wins() {
        let mut session = RankingSession::new();
        session.apply_page(vec![opp("A", "X", 1.0), opp("B", "first", 1.0)], true);
        session.apply_page(vec![opp("B", "second", 1.0), opp("C", "X", 1.0)], false);

        let ids: Vec<_> = session.accumulated().iter().map(|o| o.notice_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert_eq!(session.find("B").unwrap().agency.as_deref(), Some("first"));
        assert_eq!(session.next_page(), 2);
    }

    #[test]
    fn first_page_replaces_accumulation() {
        let mut session = RankingSession::new();
        session.apply_fetched(vec![opp("A", "X", 1.0), opp("A", "dup", 1.0)], 40, true);
        session.apply_page(vec![opp("B", "X", 1.0)], false);
        session.apply_fetched(vec![opp("Z", "X", 1.0)], 3, true);

        let out = session.render_at(fixed_now());
        assert_eq!(out.notice_ids(), vec!["Z"]);
        assert_eq!(out.loaded_count, 1);
        assert_eq!(out.total_count, 3);
        assert!(out.has_more());
        assert_eq!(session.pages_loaded(), 1);
    }

    #[test]
    fn dismissal_round_trip_restores_position() {
        let mut session = RankingSession::new();
        session.apply_page(
            vec![opp("1", "X", 60.0), opp("2", "X", 50.0), opp("3", "X", 50.0), opp("4", "X", 10.0)],
            true,
        );
        let before = session.render_at(fixed_now());

        session.set_dismissed("3", true);
        let hidden = session.render_at(fixed_now());
        assert_eq!(hidden.notice_ids(), vec!["1", "2", "4"]);
        assert_eq!(hidden.dismissed_count, 1);
        assert_eq!(hidden.loaded_count, 4);

        session.set_dismissed("3", false);
        let after = session.render_at(fixed_now());
        assert_eq!(after.notice_ids(), before.notice_ids());
        assert_eq!(after.dismissed_count, 0);
    }

    #[test]
    fn show_dismissed_reveals_flagged_items() {
        let mut session = RankingSession::new();
        session.apply_page(vec![opp("1", "X", 10.0), opp("2", "X", 20.0)], true);
        session.replace_dismissals(DismissalSet::from(["2".to_string(), "elsewhere".to_string()]));
        session.set_show_dismissed(true);

        let out = session.render_at(fixed_now());
        assert_eq!(out.notice_ids(), vec!["2", "1"]);
        assert!(out.items[0].dismissed);
        assert!(!out.items[1].dismissed);
        assert_eq!(out.dismissed_count, 1);
    }

    #[test]
    fn toggle_feedback_clears_on_repeat() {
        let mut session = RankingSession::new();
        assert_eq!(session.toggle_feedback("1", Rating::Up), Some(Rating::Up));
        assert_eq!(session.toggle_feedback("1", Rating::Down), Some(Rating::Down));
        assert_eq!(session.toggle_feedback("1", Rating::Down), None);
        assert!(session.feedback().is_empty());
    }

    #[test]
    fn rendered_items_carry_display_metadata() {
        let mut session = RankingSession::new();
        let mut a = opp("1", "EPA", 85.0);
        a.response_deadline = Some(Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).single().unwrap());
        a.ai_reasons_json = Some(r#"["strong NAICS fit"]"#.into());
        session.apply_page(vec![a], true);
        session.set_tracked_notice_ids(vec!["1".to_string()]);
        session.set_feedback("1", Some(Rating::Down));

        let out = session.render_at(fixed_now());
        let item = &out.items[0];
        assert!(item.tracked);
        assert_eq!(item.rating, Some(Rating::Down));
        assert_eq!(item.score_tier, ScoreTier::High);
        assert_eq!(item.display_score(), 85.0);
        assert_eq!(item.deadline.map(|d| d.days_left), Some(4));
        assert_eq!(item.ai_reasons, vec!["strong NAICS fit"]);
    }

    #[test]
    fn end_to_end_preferences_and_ai_fallback_order() {
        let mut session = RankingSession::new();
        session.apply_fetched(vec![opp("1", "EPA", 40.0), opp("2", "EPA", 90.0)], 2, true);
        session.replace_feedback(feedback(&[("1", Rating::Up), ("2", Rating::Up)]));

        let out = session.render_at(fixed_now());
        let prefs = out.preferences.as_ref().expect("profile inferred");
        assert!(prefs.agencies.contains("EPA"));
        assert!(out.items.iter().all(|i| i.matches_preferences));
        assert_eq!(out.notice_ids(), vec!["2", "1"]);
    }

    #[test]
    fn render_order_is_stable_across_calls() {
        let mut session = RankingSession::new();
        session.apply_page(
            (0..20).map(|i| opp(&i.to_string(), "X", (i % 3) as f64)).collect(),
            true,
        );
        session.set_profile(Some(profile(&["solicitation 1"], &[])));
        let first = session.render_at(fixed_now());
        let second = session.render_at(fixed_now());
        assert_eq!(first, second);
    }
}
