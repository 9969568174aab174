//! Ranking Engine
//!
//! 1. assemble and deduplicate candidate pools for the tab
//! 2. look up cached score entries; stale ones are served as-is and queued
//!    for background recompute, missing ones are computed inline
//! 3. apply viewer multipliers, sort by score (newer first on ties)
//!
//! The engine is the only writer of score entries. Diversity and pagination
//! happen in the feed layer on top of the ranked list.

pub mod pools;
pub mod scorer;
pub mod velocity;

use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use self::pools::CandidatePools;
use self::scorer::Scorer;
use crate::cache::ScoreCache;
use crate::clients::FollowGraph;
use crate::clock::Clock;
use crate::config::RankingConfig;
use crate::db::EngagementStore;
use crate::error::Result;
use crate::jobs::score_refresher::RecomputeQueue;
use crate::metrics;
use crate::models::{CreatorStats, Item, RankedItem, ScoreEntry, Tab, TabScores, ViewerContext};

pub struct RankingEngine {
    store: Arc<dyn EngagementStore>,
    cache: Arc<dyn ScoreCache>,
    follows: Arc<dyn FollowGraph>,
    recompute: RecomputeQueue,
    clock: Arc<dyn Clock>,
    scorer: Scorer,
    config: RankingConfig,
    velocity_tau_secs: f64,
}

impl RankingEngine {
    pub fn new(
        store: Arc<dyn EngagementStore>,
        cache: Arc<dyn ScoreCache>,
        follows: Arc<dyn FollowGraph>,
        recompute: RecomputeQueue,
        clock: Arc<dyn Clock>,
        config: RankingConfig,
        velocity_tau_secs: f64,
    ) -> Self {
        Self {
            store,
            cache,
            follows,
            recompute,
            clock,
            scorer: Scorer::new(&config),
            config,
            velocity_tau_secs,
        }
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    /// Resolve the follow graph for a viewer; an unreachable graph counts as empty
    pub async fn viewer_context(
        &self,
        user_id: Uuid,
        region: &str,
        tribe: Option<String>,
    ) -> ViewerContext {
        let following = match self.follows.following(user_id).await {
            Ok(following) => following,
            Err(e) => {
                warn!(user_id = %user_id, "Follow graph unavailable: {}", e);
                HashSet::new()
            }
        };
        ViewerContext {
            user_id,
            region: region.to_string(),
            tribe,
            following,
        }
    }

    /// Full ranked candidate list for one viewer and tab
    pub async fn rank(&self, viewer: &ViewerContext, tab: Tab) -> Result<Vec<RankedItem>> {
        let now = self.clock.now();
        let pools = CandidatePools::new(
            self.store.as_ref(),
            &self.config,
            self.velocity_tau_secs,
            now,
        );
        let candidates = pools.assemble(viewer, tab).await?;
        if candidates.items.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = candidates.items.iter().map(|i| i.id).collect();
        let mut entries = match self.cache.get_entries(tab, &ids).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(tab = %tab, "Score cache unavailable, scoring inline: {}", e);
                HashMap::new()
            }
        };

        let ttl = chrono::Duration::seconds(self.config.score_ttl_secs);
        let mut stale = Vec::new();
        for entry in entries.values() {
            if now - entry.computed_at > ttl {
                stale.push(entry.item_id);
            }
        }
        if !stale.is_empty() {
            debug!(tab = %tab, stale = stale.len(), "Serving stale scores, recompute queued");
            self.recompute.request_many(stale);
        }

        let missing: Vec<&Item> = candidates
            .items
            .iter()
            .filter(|item| !entries.contains_key(&item.id))
            .collect();
        if !missing.is_empty() {
            let stats = self.creator_stats_for(&missing).await;
            for item in missing {
                let creator = stats.get(&item.owner_id).copied().unwrap_or_default();
                let entry = self.scorer.score_entry(item, &creator, tab, now);
                if let Err(e) = self
                    .cache
                    .put_entry(&item.region, &entry, self.config.index_capacity)
                    .await
                {
                    debug!(item_id = %item.id, "Score cache write skipped: {}", e);
                }
                entries.insert(item.id, entry);
            }
        }

        let mut ranked: Vec<RankedItem> = candidates
            .items
            .iter()
            .filter_map(|item| {
                entries.get(&item.id).map(|entry| RankedItem {
                    item_id: item.id,
                    owner_id: item.owner_id,
                    score: self.scorer.personalize(entry, viewer, candidates.rate_for(item), now),
                    created_at: item.created_at,
                })
            })
            .collect();
        sort_ranked(&mut ranked);
        Ok(ranked)
    }

    /// Ranked list from the (region, tab) cache index, for when the store is unavailable
    pub async fn rank_from_index(
        &self,
        viewer: &ViewerContext,
        tab: Tab,
    ) -> Result<Vec<RankedItem>> {
        let now = self.clock.now();
        let top = self
            .cache
            .top(&viewer.region, tab, self.config.pool_size)
            .await?;
        let ids: Vec<Uuid> = top.iter().map(|(id, _)| *id).collect();
        let entries = self.cache.get_entries(tab, &ids).await?;

        let mut ranked: Vec<RankedItem> = top
            .into_iter()
            .filter_map(|(id, _)| entries.get(&id))
            .map(|entry: &ScoreEntry| RankedItem {
                item_id: entry.item_id,
                owner_id: entry.owner_id,
                score: self.scorer.personalize(entry, viewer, 0.0, now),
                created_at: entry.item_created_at,
            })
            .collect();
        sort_ranked(&mut ranked);
        Ok(ranked)
    }

    /// Recompute all four tab scores for one item and write them everywhere
    pub async fn refresh_item(&self, item_id: Uuid) -> Result<()> {
        let Some(item) = self.store.get_item(item_id).await? else {
            debug!(item_id = %item_id, "Refresh for unknown item");
            return Ok(());
        };

        if item.moderation_flagged {
            self.cache.remove_item(&item.region, item.id).await?;
            return Ok(());
        }

        let stats = self.store.creator_stats(&[item.owner_id]).await?;
        let creator: CreatorStats = stats.get(&item.owner_id).copied().unwrap_or_default();
        let now = self.clock.now();

        let entries: Vec<ScoreEntry> = Tab::ALL
            .iter()
            .map(|tab| self.scorer.score_entry(&item, &creator, *tab, now))
            .collect();
        let mut scores = TabScores::default();
        for entry in &entries {
            scores.set(entry.tab, entry.score);
        }

        try_join_all(
            entries
                .iter()
                .map(|entry| self.cache.put_entry(&item.region, entry, self.config.index_capacity)),
        )
        .await?;
        self.store.update_item_scores(item.id, &scores).await?;

        metrics::record_score_recompute("success");
        debug!(item_id = %item.id, foryou = scores.foryou, battles = scores.battles, "Item scores refreshed");
        Ok(())
    }

    async fn creator_stats_for(&self, items: &[&Item]) -> HashMap<Uuid, CreatorStats> {
        let owners: Vec<Uuid> = items
            .iter()
            .map(|i| i.owner_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        match self.store.creator_stats(&owners).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Creator stats unavailable, scoring without them: {}", e);
                HashMap::new()
            }
        }
    }
}

/// Score descending, newer content first on ties
pub fn sort_ranked(ranked: &mut [RankedItem]) {
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryScoreCache;
    use crate::clients::MockFollowGraph;
    use crate::clock::ManualClock;
    use crate::db::MemoryStore;
    use crate::error::AppError;
    use crate::models::{
        Battle, BattleSide, BattleStatus, CounterDelta, EngagementCounters, ItemKind,
    };
    use chrono::{Duration, Utc};

    struct Harness {
        store: Arc<MemoryStore>,
        cache: Arc<MemoryScoreCache>,
        clock: Arc<ManualClock>,
        engine: RankingEngine,
        rx: tokio::sync::mpsc::UnboundedReceiver<Uuid>,
    }

    fn harness(follows: MockFollowGraph) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryScoreCache::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (queue, rx) = RecomputeQueue::channel();
        let engine = RankingEngine::new(
            store.clone(),
            cache.clone(),
            Arc::new(follows),
            queue,
            clock.clone(),
            RankingConfig::default(),
            300.0,
        );
        Harness {
            store,
            cache,
            clock,
            engine,
            rx,
        }
    }

    fn no_follows() -> MockFollowGraph {
        let mut graph = MockFollowGraph::new();
        graph.expect_following().returning(|_| Ok(HashSet::new()));
        graph
    }

    fn clip(now: chrono::DateTime<Utc>, age_hours: i64, completions: i64) -> Item {
        Item {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            region: "us".into(),
            tribe: None,
            kind: ItemKind::Clip,
            battle_id: None,
            asset_ref: "clip.mp4".into(),
            created_at: now - Duration::hours(age_hours),
            duration_ms: 10_000,
            counters: EngagementCounters {
                views: 10,
                completions,
                ..Default::default()
            },
            scores: TabScores::default(),
            moderation_flagged: false,
        }
    }

    #[tokio::test]
    async fn test_rank_orders_by_score_then_recency() {
        let h = harness(no_follows());
        let now = h.clock.now();
        let strong = clip(now, 60, 10);
        let weak = clip(now, 60, 1);
        // Same whole-second age, so the twins score identically
        let mut twin_old = clip(now, 70, 0);
        twin_old.created_at = twin_old.created_at - Duration::milliseconds(500);
        let mut twin_new = clip(now, 70, 0);
        twin_new.created_at = twin_old.created_at + Duration::milliseconds(1);
        for item in [&weak, &twin_old, &strong, &twin_new] {
            h.store.insert_item(item).await.unwrap();
        }

        let viewer = h.engine.viewer_context(Uuid::new_v4(), "us", None).await;
        let ranked = h.engine.rank(&viewer, Tab::ForYou).await.unwrap();
        let ids: Vec<Uuid> = ranked.iter().map(|r| r.item_id).collect();
        assert_eq!(ids, vec![strong.id, weak.id, twin_new.id, twin_old.id]);
        assert_eq!(ranked[2].score, ranked[3].score);
        assert!(ranked.iter().all(|r| (0.0..=1.0).contains(&r.score)));
    }

    #[test]
    fn test_sort_ranked_breaks_ties_by_recency_then_id() {
        let now = Utc::now();
        let entry = |score: f64, age_secs: i64, id: u128| RankedItem {
            item_id: Uuid::from_u128(id),
            owner_id: Uuid::from_u128(id),
            score,
            created_at: now - Duration::seconds(age_secs),
        };
        let mut ranked = vec![
            entry(0.4, 10, 1),
            entry(0.4, 5, 3),
            entry(0.9, 100, 4),
            entry(0.4, 5, 2),
        ];
        sort_ranked(&mut ranked);
        let ids: Vec<u128> = ranked.iter().map(|r| r.item_id.as_u128()).collect();
        assert_eq!(ids, vec![4, 2, 3, 1]);
    }

    #[tokio::test]
    async fn test_hot_battle_clip_outranks_equal_clip_in_quiet_battle() {
        let h = harness(no_follows());
        let now = h.clock.now();
        let mut clips = Vec::new();
        for (code, velocity, age_hours) in [("HOT777", 10.0, 60), ("CALM77", 1.0, 50)] {
            let mut battle = Battle::new_pending(
                Uuid::new_v4(),
                code.into(),
                BattleSide {
                    user_id: Uuid::new_v4(),
                    tribe: None,
                    asset_ref: "a".into(),
                },
                now,
                now + Duration::hours(24),
            );
            battle.status = BattleStatus::Active;
            battle.velocity = velocity;
            battle.velocity_updated_at = Some(now);
            h.store.insert_battle(&battle).await.unwrap();

            let mut item = clip(now, age_hours, 3);
            item.kind = ItemKind::BattleClip;
            item.battle_id = Some(battle.id);
            h.store.insert_item(&item).await.unwrap();
            clips.push(item);
        }

        let viewer = h.engine.viewer_context(Uuid::new_v4(), "us", None).await;
        let ranked = h.engine.rank(&viewer, Tab::Battles).await.unwrap();
        let ids: Vec<Uuid> = ranked.iter().map(|r| r.item_id).collect();
        // The hot clip is older, so only the vote rate puts it first
        assert_eq!(ids, vec![clips[0].id, clips[1].id]);

        let foryou = h.engine.rank(&viewer, Tab::ForYou).await.unwrap();
        assert_eq!(foryou[0].item_id, clips[1].id);
    }

    #[tokio::test]
    async fn test_missing_scores_are_cached_and_stale_ones_queued() {
        let mut h = harness(no_follows());
        let now = h.clock.now();
        let item = clip(now, 1, 5);
        h.store.insert_item(&item).await.unwrap();
        let viewer = h.engine.viewer_context(Uuid::new_v4(), "us", None).await;

        h.engine.rank(&viewer, Tab::ForYou).await.unwrap();
        let cached = h.cache.get_entries(Tab::ForYou, &[item.id]).await.unwrap();
        assert!(cached.contains_key(&item.id));
        assert!(h.rx.try_recv().is_err());

        h.clock.advance(Duration::minutes(10));
        h.engine.rank(&viewer, Tab::ForYou).await.unwrap();
        assert_eq!(h.rx.try_recv().unwrap(), item.id);
    }

    #[tokio::test]
    async fn test_refresh_item_writes_every_tab() {
        let h = harness(no_follows());
        let now = h.clock.now();
        let mut item = clip(now, 1, 5);
        item.kind = ItemKind::BattleClip;
        h.store.insert_item(&item).await.unwrap();
        h.store
            .increment_counters(item.id, &CounterDelta::votes(3))
            .await
            .unwrap();

        h.engine.refresh_item(item.id).await.unwrap();
        let stored = h.store.get_item(item.id).await.unwrap().unwrap();
        assert!(stored.scores.battles > stored.scores.foryou);
        for tab in Tab::ALL {
            let top = h.cache.top("us", tab, 10).await.unwrap();
            assert_eq!(top.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_flagged_item_leaves_the_index() {
        let h = harness(no_follows());
        let now = h.clock.now();
        let item = clip(now, 1, 5);
        h.store.insert_item(&item).await.unwrap();
        h.engine.refresh_item(item.id).await.unwrap();

        h.store.set_item_flagged(item.id, true).await.unwrap();
        h.engine.refresh_item(item.id).await.unwrap();
        assert!(h.cache.top("us", Tab::ForYou, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_follow_graph_counts_as_empty() {
        let mut graph = MockFollowGraph::new();
        graph
            .expect_following()
            .returning(|_| Err(AppError::TransientDependency("graph down".into())));
        let h = harness(graph);
        let viewer = h.engine.viewer_context(Uuid::new_v4(), "us", Some("neon".into())).await;
        assert!(viewer.following.is_empty());
        assert_eq!(viewer.tribe.as_deref(), Some("neon"));
    }

    #[tokio::test]
    async fn test_rank_from_index_uses_cached_entries() {
        let h = harness(no_follows());
        let now = h.clock.now();
        let item = clip(now, 1, 5);
        h.store.insert_item(&item).await.unwrap();
        h.engine.refresh_item(item.id).await.unwrap();

        let viewer = h.engine.viewer_context(Uuid::new_v4(), "us", None).await;
        let ranked = h.engine.rank_from_index(&viewer, Tab::ForYou).await.unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].item_id, item.id);
        assert_eq!(ranked[0].owner_id, item.owner_id);
    }
}
