use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::VoteSide;
use crate::error::AppError;

/// Feed view; each tab has its own candidate pools and multipliers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tab {
    ForYou,
    Following,
    Tribe,
    Battles,
}

impl Tab {
    pub const ALL: [Tab; 4] = [Tab::ForYou, Tab::Following, Tab::Tribe, Tab::Battles];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tab::ForYou => "foryou",
            Tab::Following => "following",
            Tab::Tribe => "tribe",
            Tab::Battles => "battles",
        }
    }
}

impl fmt::Display for Tab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tab {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "foryou" => Ok(Tab::ForYou),
            "following" => Ok(Tab::Following),
            "tribe" => Ok(Tab::Tribe),
            "battles" => Ok(Tab::Battles),
            other => Err(AppError::Validation(format!(
                "invalid tab '{}', expected foryou|following|tribe|battles",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Clip,
    BattleClip,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Clip => "clip",
            ItemKind::BattleClip => "battle_clip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clip" => Some(ItemKind::Clip),
            "battle_clip" => Some(ItemKind::BattleClip),
            _ => None,
        }
    }
}

/// Aggregate engagement counters; only ever changed through atomic adds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementCounters {
    pub views: i64,
    pub likes: i64,
    pub shares: i64,
    pub completions: i64,
    pub votes: i64,
    pub replays: i64,
    pub follows: i64,
    pub watch_ms: i64,
}

impl EngagementCounters {
    pub fn apply(&mut self, delta: &CounterDelta) {
        self.views = self.views.saturating_add(delta.views);
        self.likes = self.likes.saturating_add(delta.likes);
        self.shares = self.shares.saturating_add(delta.shares);
        self.completions = self.completions.saturating_add(delta.completions);
        self.votes = self.votes.saturating_add(delta.votes);
        self.replays = self.replays.saturating_add(delta.replays);
        self.follows = self.follows.saturating_add(delta.follows);
        self.watch_ms = self.watch_ms.saturating_add(delta.watch_ms);
    }

    /// (likes + shares + votes + completions) / views
    pub fn engagement_rate(&self) -> f64 {
        let engaged = (self.likes + self.shares + self.votes + self.completions) as f64;
        engaged / self.views.max(1) as f64
    }
}

/// Increment applied to an item's counters in one atomic step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub views: i64,
    pub likes: i64,
    pub shares: i64,
    pub completions: i64,
    pub votes: i64,
    pub replays: i64,
    pub follows: i64,
    pub watch_ms: i64,
}

impl CounterDelta {
    pub fn votes(n: i64) -> Self {
        Self {
            votes: n,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == CounterDelta::default()
    }
}

/// Cached per-tab scores stored on the item
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabScores {
    pub foryou: f64,
    pub following: f64,
    pub tribe: f64,
    pub battles: f64,
}

impl TabScores {
    pub fn get(&self, tab: Tab) -> f64 {
        match tab {
            Tab::ForYou => self.foryou,
            Tab::Following => self.following,
            Tab::Tribe => self.tribe,
            Tab::Battles => self.battles,
        }
    }

    pub fn set(&mut self, tab: Tab, score: f64) {
        match tab {
            Tab::ForYou => self.foryou = score,
            Tab::Following => self.following = score,
            Tab::Tribe => self.tribe = score,
            Tab::Battles => self.battles = score,
        }
    }
}

/// Battle clip or standalone clip
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub region: String,
    pub tribe: Option<String>,
    pub kind: ItemKind,
    pub battle_id: Option<Uuid>,
    pub asset_ref: String,
    pub created_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub counters: EngagementCounters,
    pub scores: TabScores,
    pub moderation_flagged: bool,
}

/// Filters for candidate pool queries
#[derive(Debug, Clone)]
pub struct ItemQuery {
    pub region: String,
    pub since: DateTime<Utc>,
    pub kind: Option<ItemKind>,
    pub tribe: Option<String>,
    pub owners: Option<Vec<Uuid>>,
    pub exclude_owners: Vec<Uuid>,
    pub order: ItemOrder,
    pub limit: usize,
}

impl ItemQuery {
    pub fn new(region: &str, since: DateTime<Utc>, order: ItemOrder, limit: usize) -> Self {
        Self {
            region: region.to_string(),
            since,
            kind: None,
            tribe: None,
            owners: None,
            exclude_owners: Vec::new(),
            order,
            limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOrder {
    /// created_at DESC
    Newest,
    /// engagement rate DESC
    Engagement,
    /// views DESC
    Popularity,
    /// views ASC
    LeastExposed,
}

/// Publish request coming from the content pipeline
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    pub owner_id: Uuid,
    pub region: String,
    pub tribe: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: ItemKind,
    pub battle_id: Option<Uuid>,
    pub asset_ref: String,
    pub duration_ms: i64,
}

fn default_kind() -> ItemKind {
    ItemKind::Clip
}

/// One (viewer, item) record; upserted on repeated views
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Impression {
    pub viewer_id: Uuid,
    pub item_id: Uuid,
    pub session_id: String,
    pub tab: Tab,
    pub position: i32,
    pub watched_ms: i64,
    pub completed: bool,
    pub replay_count: i32,
    pub liked: bool,
    pub shared: bool,
    pub voted: Option<VoteSide>,
    pub followed: bool,
    pub challenged: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Client report of a view; merged into the stored impression
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpressionEvent {
    pub session_id: String,
    pub tab: Tab,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub watched_ms: i64,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub replayed: bool,
    #[serde(default)]
    pub liked: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub voted: Option<VoteSide>,
    #[serde(default)]
    pub followed: bool,
    #[serde(default)]
    pub challenged: bool,
}

/// Upper bound for one report's watch time, in multiples of the clip duration
pub const MAX_WATCH_DURATIONS_PER_EVENT: i64 = 10;

impl ImpressionEvent {
    /// Same event with `watched_ms` clamped to `[0, 10 x duration]`
    pub fn capped(mut self, duration_ms: i64) -> Self {
        let ceiling = duration_ms
            .max(0)
            .saturating_mul(MAX_WATCH_DURATIONS_PER_EVENT);
        self.watched_ms = self.watched_ms.clamp(0, ceiling);
        self
    }
}

impl Impression {
    /// First view of an item
    pub fn first(viewer_id: Uuid, item_id: Uuid, event: &ImpressionEvent, at: DateTime<Utc>) -> Self {
        Self {
            viewer_id,
            item_id,
            session_id: event.session_id.clone(),
            tab: event.tab,
            position: event.position,
            watched_ms: event.watched_ms.max(0),
            completed: event.completed,
            replay_count: i32::from(event.replayed),
            liked: event.liked,
            shared: event.shared,
            voted: event.voted,
            followed: event.followed,
            challenged: event.challenged,
            first_seen_at: at,
            last_seen_at: at,
        }
    }

    /// Merge a repeated view; flags are sticky, watch time accumulates
    pub fn merge(&self, event: &ImpressionEvent, at: DateTime<Utc>) -> Self {
        Self {
            viewer_id: self.viewer_id,
            item_id: self.item_id,
            session_id: event.session_id.clone(),
            tab: event.tab,
            position: event.position,
            watched_ms: self.watched_ms.saturating_add(event.watched_ms.max(0)),
            completed: self.completed || event.completed,
            replay_count: self.replay_count.saturating_add(i32::from(event.replayed)),
            liked: self.liked || event.liked,
            shared: self.shared || event.shared,
            voted: self.voted.or(event.voted),
            followed: self.followed || event.followed,
            challenged: self.challenged || event.challenged,
            first_seen_at: self.first_seen_at,
            last_seen_at: at,
        }
    }

    /// Counter increments implied by moving from `previous` to `self`
    pub fn delta_from(&self, previous: Option<&Impression>) -> CounterDelta {
        match previous {
            None => CounterDelta {
                views: 1,
                likes: i64::from(self.liked),
                shares: i64::from(self.shared),
                completions: i64::from(self.completed),
                votes: 0,
                replays: i64::from(self.replay_count),
                follows: i64::from(self.followed),
                watch_ms: self.watched_ms,
            },
            Some(prev) => CounterDelta {
                views: 0,
                likes: i64::from(self.liked && !prev.liked),
                shares: i64::from(self.shared && !prev.shared),
                completions: i64::from(self.completed && !prev.completed),
                votes: 0,
                replays: (i64::from(self.replay_count) - i64::from(prev.replay_count)).max(0),
                follows: i64::from(self.followed && !prev.followed),
                watch_ms: self.watched_ms.saturating_sub(prev.watched_ms).max(0),
            },
        }
    }
}

/// Per-creator history feeding the creator quality factor
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatorStats {
    pub battles_won: i64,
    pub battles_total: i64,
    pub consistency_score: f64,
    pub total_views: i64,
}

impl CreatorStats {
    pub fn win_rate(&self) -> f64 {
        if self.battles_total > 0 {
            self.battles_won as f64 / self.battles_total as f64
        } else {
            0.0
        }
    }
}

/// Normalized factor values behind a score
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreFactors {
    pub completion_rate: f64,
    pub avg_watch_ratio: f64,
    pub replay_rate: f64,
    pub share_rate: f64,
    pub vote_rate: f64,
    pub follow_rate: f64,
    pub creator_quality: f64,
    pub freshness: f64,
}

/// Cached non-personalized score for one (item, tab)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEntry {
    pub item_id: Uuid,
    pub tab: Tab,
    pub owner_id: Uuid,
    pub tribe: Option<String>,
    pub kind: ItemKind,
    pub item_created_at: DateTime<Utc>,
    /// Weighted factor sum before multipliers and boost
    pub weighted: f64,
    /// Score with viewer-independent multipliers, clamped to [0, 1]
    pub score: f64,
    pub factors: ScoreFactors,
    pub computed_at: DateTime<Utc>,
}

/// Item placed in a ranked list for one viewer and tab
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedItem {
    pub item_id: Uuid,
    pub owner_id: Uuid,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

/// Identity and affinity of the viewer, resolved from upstream auth
#[derive(Debug, Clone)]
pub struct ViewerContext {
    pub user_id: Uuid,
    pub region: String,
    pub tribe: Option<String>,
    pub following: HashSet<Uuid>,
}

/// Feed API request
#[derive(Debug, Clone)]
pub struct FeedRequest {
    pub user_id: Uuid,
    pub tab: Tab,
    pub cursor: Option<String>,
    pub limit: usize,
    pub region: String,
    pub tribe: Option<String>,
}

/// Feed entry returned to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub kind: ItemKind,
    pub battle_id: Option<Uuid>,
    pub asset_ref: String,
    pub tribe: Option<String>,
    pub created_at: DateTime<Utc>,
    pub score: f64,
    pub counters: EngagementCounters,
}

impl FeedItem {
    pub fn from_item(item: &Item, score: f64) -> Self {
        Self {
            id: item.id,
            owner_id: item.owner_id,
            kind: item.kind,
            battle_id: item.battle_id,
            asset_ref: item.asset_ref.clone(),
            tribe: item.tribe.clone(),
            created_at: item.created_at,
            score,
            counters: item.counters,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> ImpressionEvent {
        ImpressionEvent {
            session_id: "s1".into(),
            tab: Tab::ForYou,
            position: 3,
            watched_ms: 4_000,
            completed: false,
            replayed: false,
            liked: true,
            shared: false,
            voted: None,
            followed: false,
            challenged: false,
        }
    }

    #[test]
    fn test_tab_parse_rejects_unknown() {
        assert_eq!("battles".parse::<Tab>().unwrap(), Tab::Battles);
        assert!("trending".parse::<Tab>().is_err());
    }

    #[test]
    fn test_first_impression_counts_a_view() {
        let now = Utc::now();
        let imp = Impression::first(Uuid::new_v4(), Uuid::new_v4(), &event(), now);
        let delta = imp.delta_from(None);
        assert_eq!(delta.views, 1);
        assert_eq!(delta.likes, 1);
        assert_eq!(delta.watch_ms, 4_000);
    }

    #[test]
    fn test_repeat_impression_does_not_recount_sticky_flags() {
        let now = Utc::now();
        let first = Impression::first(Uuid::new_v4(), Uuid::new_v4(), &event(), now);
        let mut second_event = event();
        second_event.completed = true;
        second_event.replayed = true;
        second_event.watched_ms = 1_000;
        let merged = first.merge(&second_event, now);

        let delta = merged.delta_from(Some(&first));
        assert_eq!(delta.views, 0);
        assert_eq!(delta.likes, 0);
        assert_eq!(delta.completions, 1);
        assert_eq!(delta.replays, 1);
        assert_eq!(delta.watch_ms, 1_000);
        assert_eq!(merged.watched_ms, 5_000);
    }

    #[test]
    fn test_watch_time_saturates_instead_of_wrapping() {
        let now = Utc::now();
        let mut huge = event();
        huge.watched_ms = i64::MAX;
        let first = Impression::first(Uuid::new_v4(), Uuid::new_v4(), &huge, now);
        let mut more = event();
        more.watched_ms = 1;
        let merged = first.merge(&more, now);
        assert_eq!(merged.watched_ms, i64::MAX);
        assert_eq!(merged.delta_from(Some(&first)).watch_ms, 0);

        let mut counters = EngagementCounters {
            watch_ms: i64::MAX - 1,
            ..Default::default()
        };
        counters.apply(&CounterDelta {
            watch_ms: 10,
            views: 1,
            ..Default::default()
        });
        assert_eq!(counters.watch_ms, i64::MAX);
        assert_eq!(counters.views, 1);
    }

    #[test]
    fn test_capped_event_clamps_watch_time() {
        let mut e = event();
        e.watched_ms = i64::MAX;
        assert_eq!(e.clone().capped(15_000).watched_ms, 150_000);
        e.watched_ms = -5;
        assert_eq!(e.capped(15_000).watched_ms, 0);
    }
}
