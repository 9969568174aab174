//! Engagement Store
//!
//! Durable records of items, impressions, battles, votes and scheduled
//! transitions. Every other component reads and writes through this trait.
//!
//! Contract shared by all implementations:
//! - counter changes are atomic adds, never read-modify-write in the caller
//! - `insert_vote` enforces the three `(battle, signal)` uniqueness
//!   constraints and bumps the tallies in the same atomic step
//! - lifecycle writes are conditional on the expected current status and
//!   return `None` when the battle was not in that status

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Battle, BattleListCursor, BattleResult, BattleSide, BattleVotes, CounterDelta, CreatorStats,
    EngagementCounters, Impression, Item, ItemQuery, TabScores, Vote, VoteAttempt,
};
use crate::services::scheduler::TransitionJob;

/// Stored impression before and after an upsert
#[derive(Debug, Clone)]
pub struct ImpressionUpsert {
    pub previous: Option<Impression>,
    pub current: Impression,
}

#[async_trait]
pub trait EngagementStore: Send + Sync {
    // ========== Items ==========

    async fn insert_item(&self, item: &Item) -> Result<()>;

    async fn get_item(&self, id: Uuid) -> Result<Option<Item>>;

    /// Items in the order of `ids`; unknown ids are skipped
    async fn get_items(&self, ids: &[Uuid]) -> Result<Vec<Item>>;

    /// Candidate query; never returns moderation-flagged items
    async fn list_items(&self, query: &ItemQuery) -> Result<Vec<Item>>;

    /// Unflagged items attached to any of the given battles
    async fn items_for_battles(&self, battle_ids: &[Uuid]) -> Result<Vec<Item>>;

    async fn increment_counters(&self, item_id: Uuid, delta: &CounterDelta)
        -> Result<EngagementCounters>;

    /// Adds `delta` to every item of the battle; returns the touched item ids
    async fn increment_battle_items(&self, battle_id: Uuid, delta: &CounterDelta)
        -> Result<Vec<Uuid>>;

    async fn update_item_scores(&self, item_id: Uuid, scores: &TabScores) -> Result<()>;

    async fn set_item_flagged(&self, item_id: Uuid, flagged: bool) -> Result<()>;

    // ========== Impressions ==========

    /// Upsert keyed by (viewer, item); `merge` builds the new row from the old one
    async fn upsert_impression(
        &self,
        viewer_id: Uuid,
        item_id: Uuid,
        merge: &(dyn for<'m> Fn(Option<&'m Impression>) -> Impression + Send + Sync),
    ) -> Result<ImpressionUpsert>;

    /// Item ids of the viewer's most recent impressions, newest first
    async fn recent_impressions(&self, viewer_id: Uuid, limit: usize) -> Result<Vec<Uuid>>;

    // ========== Creators ==========

    async fn creator_stats(&self, creator_ids: &[Uuid]) -> Result<HashMap<Uuid, CreatorStats>>;

    /// Count one finished battle toward the creator's stats
    ///
    /// Keyed by (creator, battle): a repeat returns `false` and changes nothing.
    async fn record_battle_outcome(&self, creator_id: Uuid, battle_id: Uuid, won: bool)
        -> Result<bool>;

    // ========== Battles ==========

    /// Fails with `Conflict` if the id or short code already exists
    async fn insert_battle(&self, battle: &Battle) -> Result<()>;

    async fn short_code_exists(&self, short_code: &str) -> Result<bool>;

    async fn get_battle(&self, id: Uuid) -> Result<Option<Battle>>;

    async fn get_battle_by_short_code(&self, short_code: &str) -> Result<Option<Battle>>;

    /// pending -> active while `now < ends_at`
    async fn accept_battle(
        &self,
        id: Uuid,
        defender: &BattleSide,
        now: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<Option<Battle>>;

    /// pending -> expired
    async fn expire_battle(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Battle>>;

    /// active -> completed with an immutable result
    async fn complete_battle(
        &self,
        id: Uuid,
        result: &BattleResult,
        now: DateTime<Utc>,
    ) -> Result<Option<Battle>>;

    /// Active battles ordered by (ends_at, id), strictly after `after`
    async fn list_active_battles(
        &self,
        after: Option<BattleListCursor>,
        limit: usize,
    ) -> Result<Vec<Battle>>;

    /// Active battles with the highest decayed vote velocity at `now` first
    async fn hot_battles(&self, now: DateTime<Utc>, tau_secs: f64, limit: usize)
        -> Result<Vec<Battle>>;

    /// Pending or active battles whose deadline passed
    async fn overdue_battles(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Battle>>;

    async fn flag_battle(&self, id: Uuid, reason: &str) -> Result<()>;

    // ========== Votes ==========

    /// Single point of truth for vote uniqueness; `DuplicateVote` on collision
    async fn insert_vote(&self, vote: &Vote) -> Result<BattleVotes>;

    async fn record_vote_attempt(&self, attempt: &VoteAttempt) -> Result<()>;

    async fn vote_attempts_since(
        &self,
        battle_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<VoteAttempt>>;

    /// Drop attempts older than `before`; returns how many were removed
    async fn prune_vote_attempts(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Decay-and-add on the battle's velocity; returns the new raw value
    async fn nudge_velocity(&self, battle_id: Uuid, now: DateTime<Utc>, tau_secs: f64)
        -> Result<f64>;

    // ========== Scheduled transitions ==========

    /// Upsert keyed by (battle_id, kind)
    async fn save_transition_job(&self, job: &TransitionJob) -> Result<()>;

    async fn complete_transition_job(&self, job: &TransitionJob) -> Result<()>;

    async fn pending_transition_jobs(&self) -> Result<Vec<TransitionJob>>;

    // ========== Health ==========

    async fn ping(&self) -> Result<()>;
}

/// Decayed counter update shared by the store implementations
pub(crate) fn decayed_velocity(
    previous: f64,
    updated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    tau_secs: f64,
) -> f64 {
    crate::services::ranking::velocity::nudge(previous, updated_at, now, tau_secs)
}
