//! In-memory Engagement Store
//!
//! Backs local development and the test suites. Each DashMap entry lock plays
//! the role of a row lock, so increments and conditional transitions are
//! atomic per key exactly like their SQL counterparts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::{decayed_velocity, EngagementStore, ImpressionUpsert};
use crate::error::{AppError, Result};
use crate::models::{
    Battle, BattleListCursor, BattleResult, BattleSide, BattleStatus, BattleVotes, CounterDelta,
    CreatorStats, EngagementCounters, Impression, Item, ItemOrder, ItemQuery, TabScores, Vote,
    VoteAttempt, VoteSignal,
};
use crate::services::ranking::velocity;
use crate::services::scheduler::{TransitionJob, TransitionKind};

/// Per-battle uniqueness sets; the three constraints are checked and
/// claimed under one lock
#[derive(Default)]
struct Ballot {
    users: HashSet<Uuid>,
    fingerprints: HashSet<String>,
    ip_hashes: HashSet<String>,
    votes: Vec<Vote>,
}

impl Ballot {
    fn collision(&self, vote: &Vote) -> Option<VoteSignal> {
        let signals = &vote.signals;
        if signals.user_id.map_or(false, |u| self.users.contains(&u)) {
            return Some(VoteSignal::User);
        }
        if signals
            .fingerprint
            .as_ref()
            .map_or(false, |f| self.fingerprints.contains(f))
        {
            return Some(VoteSignal::Fingerprint);
        }
        if signals
            .ip_hash
            .as_ref()
            .map_or(false, |ip| self.ip_hashes.contains(ip))
        {
            return Some(VoteSignal::IpHash);
        }
        None
    }

    fn claim(&mut self, vote: &Vote) {
        if let Some(user_id) = vote.signals.user_id {
            self.users.insert(user_id);
        }
        if let Some(fingerprint) = &vote.signals.fingerprint {
            self.fingerprints.insert(fingerprint.clone());
        }
        if let Some(ip_hash) = &vote.signals.ip_hash {
            self.ip_hashes.insert(ip_hash.clone());
        }
        self.votes.push(vote.clone());
    }
}

#[derive(Default)]
pub struct MemoryStore {
    items: DashMap<Uuid, Item>,
    /// viewer -> item -> impression
    impressions: DashMap<Uuid, HashMap<Uuid, Impression>>,
    creators: DashMap<Uuid, CreatorStats>,
    /// (creator, battle) -> won; makes outcome recording idempotent
    battle_outcomes: DashMap<(Uuid, Uuid), bool>,
    battles: DashMap<Uuid, Battle>,
    short_codes: DashMap<String, Uuid>,
    ballots: DashMap<Uuid, Ballot>,
    attempts: DashMap<Uuid, Vec<VoteAttempt>>,
    jobs: DashMap<(Uuid, TransitionKind), TransitionJob>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed creator history (tests, fixtures)
    pub fn set_creator_stats(&self, creator_id: Uuid, stats: CreatorStats) {
        self.creators.insert(creator_id, stats);
    }

    /// Number of committed votes for a battle
    pub fn vote_count(&self, battle_id: Uuid) -> usize {
        self.ballots
            .get(&battle_id)
            .map(|b| b.votes.len())
            .unwrap_or(0)
    }

    fn matches(item: &Item, query: &ItemQuery) -> bool {
        if item.moderation_flagged || item.region != query.region || item.created_at < query.since {
            return false;
        }
        if let Some(kind) = query.kind {
            if item.kind != kind {
                return false;
            }
        }
        if let Some(tribe) = &query.tribe {
            if item.tribe.as_ref() != Some(tribe) {
                return false;
            }
        }
        if let Some(owners) = &query.owners {
            if !owners.contains(&item.owner_id) {
                return false;
            }
        }
        !query.exclude_owners.contains(&item.owner_id)
    }

    fn transition(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut Battle) -> bool,
    ) -> Result<Option<Battle>> {
        match self.battles.get_mut(&id) {
            Some(mut battle) => {
                if apply(battle.value_mut()) {
                    Ok(Some(battle.clone()))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl EngagementStore for MemoryStore {
    async fn insert_item(&self, item: &Item) -> Result<()> {
        if self.items.contains_key(&item.id) {
            return Err(AppError::Conflict(format!("item {} already exists", item.id)));
        }
        self.items.insert(item.id, item.clone());
        Ok(())
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<Item>> {
        Ok(self.items.get(&id).map(|i| i.clone()))
    }

    async fn get_items(&self, ids: &[Uuid]) -> Result<Vec<Item>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.items.get(id).map(|i| i.clone()))
            .collect())
    }

    async fn list_items(&self, query: &ItemQuery) -> Result<Vec<Item>> {
        let mut items: Vec<Item> = self
            .items
            .iter()
            .filter(|entry| Self::matches(entry.value(), query))
            .map(|entry| entry.value().clone())
            .collect();

        match query.order {
            ItemOrder::Newest => items.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            ItemOrder::Engagement => items.sort_by(|a, b| {
                b.counters
                    .engagement_rate()
                    .partial_cmp(&a.counters.engagement_rate())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            }),
            ItemOrder::Popularity => items.sort_by(|a, b| {
                b.counters
                    .views
                    .cmp(&a.counters.views)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            }),
            ItemOrder::LeastExposed => items.sort_by(|a, b| {
                a.counters
                    .views
                    .cmp(&b.counters.views)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            }),
        }

        items.truncate(query.limit);
        Ok(items)
    }

    async fn items_for_battles(&self, battle_ids: &[Uuid]) -> Result<Vec<Item>> {
        Ok(self
            .items
            .iter()
            .filter(|entry| {
                let item = entry.value();
                !item.moderation_flagged
                    && item.battle_id.map_or(false, |b| battle_ids.contains(&b))
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn increment_counters(
        &self,
        item_id: Uuid,
        delta: &CounterDelta,
    ) -> Result<EngagementCounters> {
        let counters = {
            let mut item = self
                .items
                .get_mut(&item_id)
                .ok_or_else(|| AppError::NotFound(format!("item {}", item_id)))?;
            item.counters.apply(delta);
            (item.counters, item.owner_id)
        };

        if delta.views != 0 {
            self.creators.entry(counters.1).or_default().total_views += delta.views;
        }

        Ok(counters.0)
    }

    async fn increment_battle_items(
        &self,
        battle_id: Uuid,
        delta: &CounterDelta,
    ) -> Result<Vec<Uuid>> {
        let mut touched = Vec::new();
        for mut entry in self.items.iter_mut() {
            if entry.battle_id == Some(battle_id) {
                entry.counters.apply(delta);
                touched.push(entry.id);
            }
        }
        Ok(touched)
    }

    async fn update_item_scores(&self, item_id: Uuid, scores: &TabScores) -> Result<()> {
        let mut item = self
            .items
            .get_mut(&item_id)
            .ok_or_else(|| AppError::NotFound(format!("item {}", item_id)))?;
        item.scores = *scores;
        Ok(())
    }

    async fn set_item_flagged(&self, item_id: Uuid, flagged: bool) -> Result<()> {
        let mut item = self
            .items
            .get_mut(&item_id)
            .ok_or_else(|| AppError::NotFound(format!("item {}", item_id)))?;
        item.moderation_flagged = flagged;
        Ok(())
    }

    async fn upsert_impression(
        &self,
        viewer_id: Uuid,
        item_id: Uuid,
        merge: &(dyn for<'m> Fn(Option<&'m Impression>) -> Impression + Send + Sync),
    ) -> Result<ImpressionUpsert> {
        let mut viewer = self.impressions.entry(viewer_id).or_default();
        let previous = viewer.get(&item_id).cloned();
        let current = merge(previous.as_ref());
        viewer.insert(item_id, current.clone());
        Ok(ImpressionUpsert { previous, current })
    }

    async fn recent_impressions(&self, viewer_id: Uuid, limit: usize) -> Result<Vec<Uuid>> {
        let Some(viewer) = self.impressions.get(&viewer_id) else {
            return Ok(Vec::new());
        };
        let mut seen: Vec<(&Uuid, DateTime<Utc>)> =
            viewer.iter().map(|(id, imp)| (id, imp.last_seen_at)).collect();
        seen.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(seen.into_iter().take(limit).map(|(id, _)| *id).collect())
    }

    async fn creator_stats(&self, creator_ids: &[Uuid]) -> Result<HashMap<Uuid, CreatorStats>> {
        Ok(creator_ids
            .iter()
            .filter_map(|id| self.creators.get(id).map(|s| (*id, *s)))
            .collect())
    }

    async fn record_battle_outcome(
        &self,
        creator_id: Uuid,
        battle_id: Uuid,
        won: bool,
    ) -> Result<bool> {
        if self.battle_outcomes.insert((creator_id, battle_id), won).is_some() {
            return Ok(false);
        }
        let mut stats = self.creators.entry(creator_id).or_default();
        stats.battles_total += 1;
        if won {
            stats.battles_won += 1;
        }
        Ok(true)
    }

    async fn insert_battle(&self, battle: &Battle) -> Result<()> {
        match self.short_codes.entry(battle.short_code.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(AppError::Conflict(format!(
                    "short code {} already taken",
                    battle.short_code
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(battle.id);
            }
        }
        self.battles.insert(battle.id, battle.clone());
        Ok(())
    }

    async fn short_code_exists(&self, short_code: &str) -> Result<bool> {
        Ok(self.short_codes.contains_key(short_code))
    }

    async fn get_battle(&self, id: Uuid) -> Result<Option<Battle>> {
        Ok(self.battles.get(&id).map(|b| b.clone()))
    }

    async fn get_battle_by_short_code(&self, short_code: &str) -> Result<Option<Battle>> {
        let id = match self.short_codes.get(short_code) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.battles.get(&id).map(|b| b.clone()))
    }

    async fn accept_battle(
        &self,
        id: Uuid,
        defender: &BattleSide,
        now: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<Option<Battle>> {
        self.transition(id, |battle| {
            if battle.status != BattleStatus::Pending || now >= battle.timeline.ends_at {
                return false;
            }
            battle.status = BattleStatus::Active;
            battle.defender = Some(defender.clone());
            battle.timeline.accepted = Some(now);
            battle.timeline.started = Some(now);
            battle.timeline.ends_at = ends_at;
            true
        })
    }

    async fn expire_battle(&self, id: Uuid, _now: DateTime<Utc>) -> Result<Option<Battle>> {
        self.transition(id, |battle| {
            if battle.status != BattleStatus::Pending {
                return false;
            }
            battle.status = BattleStatus::Expired;
            true
        })
    }

    async fn complete_battle(
        &self,
        id: Uuid,
        result: &BattleResult,
        now: DateTime<Utc>,
    ) -> Result<Option<Battle>> {
        self.transition(id, |battle| {
            if battle.status != BattleStatus::Active {
                return false;
            }
            battle.status = BattleStatus::Completed;
            battle.result = Some(result.clone());
            battle.timeline.completed_at = Some(now);
            true
        })
    }

    async fn list_active_battles(
        &self,
        after: Option<BattleListCursor>,
        limit: usize,
    ) -> Result<Vec<Battle>> {
        let mut battles: Vec<Battle> = self
            .battles
            .iter()
            .filter(|entry| entry.status == BattleStatus::Active)
            .filter(|entry| match after {
                Some(cursor) => {
                    (entry.timeline.ends_at, entry.id) > (cursor.ends_at, cursor.id)
                }
                None => true,
            })
            .map(|entry| entry.value().clone())
            .collect();
        battles.sort_by(|a, b| (a.timeline.ends_at, a.id).cmp(&(b.timeline.ends_at, b.id)));
        battles.truncate(limit);
        Ok(battles)
    }

    async fn hot_battles(
        &self,
        now: DateTime<Utc>,
        tau_secs: f64,
        limit: usize,
    ) -> Result<Vec<Battle>> {
        let mut battles: Vec<(f64, Battle)> = self
            .battles
            .iter()
            .filter(|entry| entry.status == BattleStatus::Active)
            .map(|entry| {
                let rate = velocity::rate_per_minute(
                    entry.velocity,
                    entry.velocity_updated_at,
                    now,
                    tau_secs,
                );
                (rate, entry.value().clone())
            })
            .collect();
        battles.sort_by(|(ra, a), (rb, b)| {
            rb.partial_cmp(ra)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.timeline.ends_at.cmp(&b.timeline.ends_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(battles.into_iter().take(limit).map(|(_, b)| b).collect())
    }

    async fn overdue_battles(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Battle>> {
        let mut battles: Vec<Battle> = self
            .battles
            .iter()
            .filter(|entry| {
                matches!(entry.status, BattleStatus::Pending | BattleStatus::Active)
                    && entry.timeline.ends_at <= now
            })
            .map(|entry| entry.value().clone())
            .collect();
        battles.sort_by(|a, b| a.timeline.ends_at.cmp(&b.timeline.ends_at));
        battles.truncate(limit);
        Ok(battles)
    }

    async fn flag_battle(&self, id: Uuid, reason: &str) -> Result<()> {
        let mut battle = self
            .battles
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("battle {}", id)))?;
        battle.abuse_flag = Some(reason.to_string());
        Ok(())
    }

    async fn insert_vote(&self, vote: &Vote) -> Result<BattleVotes> {
        // Lock order: ballot, then battle.
        let mut ballot = self.ballots.entry(vote.battle_id).or_default();

        if let Some(signal) = ballot.collision(vote) {
            return Err(AppError::DuplicateVote(format!(
                "a vote with the same {} already exists for battle {}",
                signal.as_str(),
                vote.battle_id
            )));
        }

        let mut battle = self
            .battles
            .get_mut(&vote.battle_id)
            .ok_or_else(|| AppError::NotFound(format!("battle {}", vote.battle_id)))?;

        if !battle.is_votable_at(vote.created_at) {
            return Err(AppError::BattleNotVotable(format!(
                "battle {} is {}",
                vote.battle_id, battle.status
            )));
        }

        ballot.claim(vote);
        battle.votes.record(vote.side);
        Ok(battle.votes)
    }

    async fn record_vote_attempt(&self, attempt: &VoteAttempt) -> Result<()> {
        self.attempts
            .entry(attempt.battle_id)
            .or_default()
            .push(attempt.clone());
        Ok(())
    }

    async fn vote_attempts_since(
        &self,
        battle_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<VoteAttempt>> {
        Ok(self
            .attempts
            .get(&battle_id)
            .map(|list| {
                list.iter()
                    .filter(|a| a.attempted_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn prune_vote_attempts(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0u64;
        for mut list in self.attempts.iter_mut() {
            let len = list.len();
            list.retain(|a| a.attempted_at >= before);
            removed += (len - list.len()) as u64;
        }
        self.attempts.retain(|_, list| !list.is_empty());
        Ok(removed)
    }

    async fn nudge_velocity(
        &self,
        battle_id: Uuid,
        now: DateTime<Utc>,
        tau_secs: f64,
    ) -> Result<f64> {
        let mut battle = self
            .battles
            .get_mut(&battle_id)
            .ok_or_else(|| AppError::NotFound(format!("battle {}", battle_id)))?;
        battle.velocity = decayed_velocity(battle.velocity, battle.velocity_updated_at, now, tau_secs);
        battle.velocity_updated_at = Some(now);
        Ok(battle.velocity)
    }

    async fn save_transition_job(&self, job: &TransitionJob) -> Result<()> {
        self.jobs.insert((job.battle_id, job.kind), job.clone());
        Ok(())
    }

    async fn complete_transition_job(&self, job: &TransitionJob) -> Result<()> {
        self.jobs
            .remove_if(&(job.battle_id, job.kind), |_, stored| stored.fire_at == job.fire_at);
        Ok(())
    }

    async fn pending_transition_jobs(&self) -> Result<Vec<TransitionJob>> {
        let mut jobs: Vec<TransitionJob> = self.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by(|a, b| a.fire_at.cmp(&b.fire_at));
        Ok(jobs)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
