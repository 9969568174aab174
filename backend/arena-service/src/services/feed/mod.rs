//! Feed Facade
//!
//! Entry point for feed reads and engagement writes.
//!
//! Read path: rank (or resume a memoized ranked list when a cursor is
//! given), skip to the cursor position, run the diversity pass, hydrate the
//! kept items. When candidate assembly fails on a dependency error the
//! ranked list is rebuilt from the (region, tab) score index instead.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cursor::{decode_feed_cursor, encode_feed_cursor, FeedCursor};
use super::diversity::DiversityLayer;
use super::ranking::RankingEngine;
use crate::cache::ScoreCache;
use crate::clock::Clock;
use crate::config::FeedConfig;
use crate::db::EngagementStore;
use crate::error::{AppError, Result};
use crate::jobs::score_refresher::RecomputeQueue;
use crate::metrics;
use crate::models::{
    EngagementCounters, FeedItem, FeedPage, FeedRequest, Impression, ImpressionEvent, Item,
    ItemKind, NewItem, RankedItem, Tab, TabScores, ViewerContext,
};

pub struct FeedFacade {
    store: Arc<dyn EngagementStore>,
    cache: Arc<dyn ScoreCache>,
    ranking: Arc<RankingEngine>,
    recompute: RecomputeQueue,
    clock: Arc<dyn Clock>,
    diversity: DiversityLayer,
    config: FeedConfig,
    ranked_list_ttl_secs: u64,
}

/// Where a ranked list came from; used as a metrics label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RankSource {
    Ranked,
    Memoized,
    Fallback,
}

impl RankSource {
    fn as_str(&self) -> &'static str {
        match self {
            RankSource::Ranked => "ranked",
            RankSource::Memoized => "memoized",
            RankSource::Fallback => "fallback",
        }
    }
}

impl FeedFacade {
    pub fn new(
        store: Arc<dyn EngagementStore>,
        cache: Arc<dyn ScoreCache>,
        ranking: Arc<RankingEngine>,
        recompute: RecomputeQueue,
        clock: Arc<dyn Clock>,
        config: FeedConfig,
        ranked_list_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            cache,
            ranking,
            recompute,
            clock,
            diversity: DiversityLayer::with_creator_limit(
                config.diversity_window,
                config.max_per_creator,
            ),
            config,
            ranked_list_ttl_secs,
        }
    }

    /// Clamp a requested page size to `[1, max_limit]`
    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.config.default_limit)
            .clamp(1, self.config.max_limit)
    }

    pub async fn get_feed(&self, request: FeedRequest) -> Result<FeedPage> {
        let started = Instant::now();
        let limit = request.limit.clamp(1, self.config.max_limit);
        let cursor = request
            .cursor
            .as_deref()
            .map(decode_feed_cursor)
            .transpose()?;

        let viewer = self
            .ranking
            .viewer_context(request.user_id, &request.region, request.tribe.clone())
            .await;
        let (ranked, source) = self.ranked_list(&viewer, request.tab, cursor.is_some()).await?;

        let start = cursor.map_or(0, |c| resume_position(&ranked, &c));
        let seen = self.recently_seen(request.user_id).await;
        let page = self.diversity.select(&ranked, start, &seen, limit);

        let ids: Vec<Uuid> = page.items.iter().map(|r| r.item_id).collect();
        let items = self.store.get_items(&ids).await?;
        let feed_items: Vec<FeedItem> = page
            .items
            .iter()
            .filter_map(|ranked| {
                items
                    .iter()
                    .find(|item| item.id == ranked.item_id && !item.moderation_flagged)
                    .map(|item| FeedItem::from_item(item, ranked.score))
            })
            .collect();

        let next_cursor = match page.items.last() {
            Some(last) if page.has_more => Some(encode_feed_cursor(last.score, last.item_id)),
            _ => None,
        };

        metrics::record_feed_request(request.tab.as_str(), source.as_str(), started.elapsed());
        debug!(
            user_id = %request.user_id,
            tab = %request.tab,
            source = source.as_str(),
            ranked = ranked.len(),
            returned = feed_items.len(),
            "Feed page served"
        );

        Ok(FeedPage {
            items: feed_items,
            next_cursor,
        })
    }

    /// First pages start a new ranking pass; cursor pages resume the memoized one
    async fn ranked_list(
        &self,
        viewer: &ViewerContext,
        tab: Tab,
        resuming: bool,
    ) -> Result<(Vec<RankedItem>, RankSource)> {
        if resuming {
            match self.cache.get_ranked(viewer.user_id, tab).await {
                Ok(Some(ranked)) => {
                    debug!(user_id = %viewer.user_id, tab = %tab, "Ranked list cache hit");
                    return Ok((ranked, RankSource::Memoized));
                }
                Ok(None) => {
                    debug!(user_id = %viewer.user_id, tab = %tab, "Ranked list cache miss");
                }
                Err(e) => warn!(tab = %tab, "Ranked list cache unavailable: {}", e),
            }
        }

        let (ranked, source) = match self.ranking.rank(viewer, tab).await {
            Ok(ranked) => (ranked, RankSource::Ranked),
            Err(e) if e.is_transient() => {
                warn!(user_id = %viewer.user_id, tab = %tab, error = %e, "Ranking degraded, serving score index");
                let ranked = self.ranking.rank_from_index(viewer, tab).await?;
                (ranked, RankSource::Fallback)
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = self
            .cache
            .put_ranked(viewer.user_id, tab, &ranked, self.ranked_list_ttl_secs)
            .await
        {
            debug!(tab = %tab, "Ranked list not memoized: {}", e);
        }
        Ok((ranked, source))
    }

    async fn recently_seen(&self, viewer_id: Uuid) -> HashSet<Uuid> {
        match self
            .store
            .recent_impressions(viewer_id, self.config.recent_impressions)
            .await
        {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                warn!(user_id = %viewer_id, "Recent impressions unavailable: {}", e);
                HashSet::new()
            }
        }
    }

    /// Register a clip from the content pipeline
    pub async fn publish_item(&self, new_item: NewItem) -> Result<Item> {
        if new_item.asset_ref.trim().is_empty() {
            return Err(AppError::Validation("assetRef is required".into()));
        }
        if new_item.region.trim().is_empty() {
            return Err(AppError::Validation("region is required".into()));
        }
        if new_item.duration_ms <= 0 {
            return Err(AppError::Validation("durationMs must be positive".into()));
        }

        let kind = match (new_item.kind, new_item.battle_id) {
            (ItemKind::BattleClip, None) => {
                return Err(AppError::Validation(
                    "battle clips need a battleId".into(),
                ))
            }
            (_, Some(battle_id)) => {
                if self.store.get_battle(battle_id).await?.is_none() {
                    return Err(AppError::NotFound(format!("battle {}", battle_id)));
                }
                ItemKind::BattleClip
            }
            (kind, None) => kind,
        };

        let item = Item {
            id: Uuid::new_v4(),
            owner_id: new_item.owner_id,
            region: new_item.region,
            tribe: new_item.tribe.filter(|t| !t.trim().is_empty()),
            kind,
            battle_id: new_item.battle_id,
            asset_ref: new_item.asset_ref,
            created_at: self.clock.now(),
            duration_ms: new_item.duration_ms,
            counters: EngagementCounters::default(),
            scores: TabScores::default(),
            moderation_flagged: false,
        };
        self.store.insert_item(&item).await?;
        self.recompute.request(item.id);

        info!(item_id = %item.id, owner_id = %item.owner_id, kind = item.kind.as_str(), "Item published");
        Ok(item)
    }

    /// Upsert the viewer's impression and add what changed to the item counters
    pub async fn record_impression(
        &self,
        viewer_id: Uuid,
        item_id: Uuid,
        event: ImpressionEvent,
    ) -> Result<Impression> {
        if event.session_id.trim().is_empty() {
            return Err(AppError::Validation("sessionId is required".into()));
        }
        let item = self
            .store
            .get_item(item_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("item {}", item_id)))?;
        let event = event.capped(item.duration_ms);

        let now = self.clock.now();
        let merge = |previous: Option<&Impression>| match previous {
            Some(previous) => previous.merge(&event, now),
            None => Impression::first(viewer_id, item_id, &event, now),
        };
        let upsert = self.store.upsert_impression(viewer_id, item_id, &merge).await?;

        let delta = upsert.current.delta_from(upsert.previous.as_ref());
        if !delta.is_empty() {
            self.store.increment_counters(item_id, &delta).await?;
            self.recompute.request(item_id);
        }

        debug!(
            user_id = %viewer_id,
            item_id = %item_id,
            first_view = upsert.previous.is_none(),
            "Impression recorded"
        );
        Ok(upsert.current)
    }

    /// Moderation hook; flagged items leave every candidate pool and score index
    pub async fn set_item_flagged(&self, item_id: Uuid, flagged: bool) -> Result<()> {
        if self.store.get_item(item_id).await?.is_none() {
            return Err(AppError::NotFound(format!("item {}", item_id)));
        }
        self.store.set_item_flagged(item_id, flagged).await?;
        self.recompute.request(item_id);
        info!(item_id = %item_id, flagged, "Item moderation flag updated");
        Ok(())
    }
}

/// Index to resume scanning from after `cursor`
///
/// The cursor item itself when still present, otherwise the first item
/// scored strictly below the cursor.
pub fn resume_position(ranked: &[RankedItem], cursor: &FeedCursor) -> usize {
    if let Some(pos) = ranked.iter().position(|r| r.item_id == cursor.item_id) {
        return pos + 1;
    }
    ranked
        .iter()
        .position(|r| r.score < cursor.score)
        .unwrap_or(ranked.len())
}
