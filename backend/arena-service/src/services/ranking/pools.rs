//! Candidate pool assembly per tab
//!
//! `foryou` mixes fresh / trending / tribe / exploration pools; the other tabs
//! draw from a single source with a region-popularity fallback when the
//! viewer has no follow graph or no tribe.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

use super::velocity;
use crate::config::RankingConfig;
use crate::db::EngagementStore;
use crate::error::Result;
use crate::models::{Item, ItemKind, ItemOrder, ItemQuery, Tab, ViewerContext};

/// Deduplicated candidates plus the live vote rate of every battle they were
/// drawn from
#[derive(Debug, Default)]
pub struct Candidates {
    pub items: Vec<Item>,
    pub battle_rates: HashMap<Uuid, f64>,
}

impl Candidates {
    /// Votes per minute of the item's battle, zero for plain clips
    pub fn rate_for(&self, item: &Item) -> f64 {
        item.battle_id
            .and_then(|id| self.battle_rates.get(&id).copied())
            .unwrap_or(0.0)
    }
}

pub struct CandidatePools<'a> {
    store: &'a dyn EngagementStore,
    config: &'a RankingConfig,
    velocity_tau_secs: f64,
    now: DateTime<Utc>,
}

impl<'a> CandidatePools<'a> {
    pub fn new(
        store: &'a dyn EngagementStore,
        config: &'a RankingConfig,
        velocity_tau_secs: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            config,
            velocity_tau_secs,
            now,
        }
    }

    fn fresh_since(&self) -> DateTime<Utc> {
        self.now - Duration::hours(self.config.fresh_window_hours)
    }

    fn trending_since(&self) -> DateTime<Utc> {
        self.now - Duration::days(self.config.trending_window_days)
    }

    fn share(&self, fraction: f64) -> usize {
        (self.config.pool_size as f64 * fraction).ceil() as usize
    }

    /// Deduplicated candidates for one viewer and tab
    pub async fn assemble(&self, viewer: &ViewerContext, tab: Tab) -> Result<Candidates> {
        let mut battle_rates = HashMap::new();
        let pools = match tab {
            Tab::ForYou => self.for_you(viewer).await?,
            Tab::Following => self.following(viewer).await?,
            Tab::Tribe => self.tribe(viewer).await?,
            Tab::Battles => self.battles(viewer, &mut battle_rates).await?,
        };

        let mut seen = HashSet::new();
        let items: Vec<Item> = pools
            .into_iter()
            .flatten()
            .filter(|item| seen.insert(item.id))
            .collect();

        debug!(tab = %tab, user_id = %viewer.user_id, candidates = items.len(), "Candidate pools assembled");
        Ok(Candidates { items, battle_rates })
    }

    async fn for_you(&self, viewer: &ViewerContext) -> Result<Vec<Vec<Item>>> {
        let mix = self.config.pool_mix;
        let region = viewer.region.as_str();

        let fresh = self
            .store
            .list_items(&ItemQuery::new(
                region,
                self.fresh_since(),
                ItemOrder::Newest,
                self.share(mix.fresh),
            ))
            .await?;

        let trending = self
            .store
            .list_items(&ItemQuery::new(
                region,
                self.trending_since(),
                ItemOrder::Engagement,
                self.share(mix.trending),
            ))
            .await?;

        let tribe = match viewer.tribe.as_deref() {
            Some(tribe) => {
                let mut query = ItemQuery::new(
                    region,
                    self.trending_since(),
                    ItemOrder::Engagement,
                    self.share(mix.tribe),
                );
                query.tribe = Some(tribe.to_string());
                self.store.list_items(&query).await?
            }
            None => Vec::new(),
        };

        let exploration = self.exploration(viewer, self.share(mix.exploration)).await?;

        Ok(vec![fresh, trending, tribe, exploration])
    }

    async fn following(&self, viewer: &ViewerContext) -> Result<Vec<Vec<Item>>> {
        if viewer.following.is_empty() {
            return Ok(vec![self.popular(viewer).await?]);
        }

        let mut query = ItemQuery::new(
            &viewer.region,
            self.trending_since(),
            ItemOrder::Newest,
            self.config.pool_size,
        );
        query.owners = Some(viewer.following.iter().copied().collect());
        Ok(vec![self.store.list_items(&query).await?])
    }

    async fn tribe(&self, viewer: &ViewerContext) -> Result<Vec<Vec<Item>>> {
        let Some(tribe) = viewer.tribe.as_deref() else {
            return Ok(vec![self.popular(viewer).await?]);
        };

        let mut query = ItemQuery::new(
            &viewer.region,
            self.trending_since(),
            ItemOrder::Engagement,
            self.config.pool_size,
        );
        query.tribe = Some(tribe.to_string());
        Ok(vec![self.store.list_items(&query).await?])
    }

    /// Clips of the hottest live battles, then fresh battle clips
    async fn battles(
        &self,
        viewer: &ViewerContext,
        rates: &mut HashMap<Uuid, f64>,
    ) -> Result<Vec<Vec<Item>>> {
        let active = self
            .store
            .hot_battles(self.now, self.velocity_tau_secs, self.config.pool_size)
            .await?;
        for battle in &active {
            let rate = velocity::rate_per_minute(
                battle.velocity,
                battle.velocity_updated_at,
                self.now,
                self.velocity_tau_secs,
            );
            rates.insert(battle.id, rate);
        }
        let battle_ids: Vec<_> = active.iter().map(|b| b.id).collect();

        let mut live_clips = self.store.items_for_battles(&battle_ids).await?;
        live_clips.retain(|item| item.region == viewer.region);
        live_clips.sort_by_key(|item| {
            item.battle_id
                .and_then(|id| battle_ids.iter().position(|b| *b == id))
                .unwrap_or(usize::MAX)
        });

        let mut query = ItemQuery::new(
            &viewer.region,
            self.fresh_since(),
            ItemOrder::Newest,
            self.config.pool_size,
        );
        query.kind = Some(ItemKind::BattleClip);
        let fresh_clips = self.store.list_items(&query).await?;

        Ok(vec![live_clips, fresh_clips])
    }

    /// Region-wide popularity list
    async fn popular(&self, viewer: &ViewerContext) -> Result<Vec<Item>> {
        self.store
            .list_items(&ItemQuery::new(
                &viewer.region,
                self.trending_since(),
                ItemOrder::Popularity,
                self.config.pool_size,
            ))
            .await
    }

    /// Low-exposure creators outside the viewer's follow graph
    async fn exploration(&self, viewer: &ViewerContext, limit: usize) -> Result<Vec<Item>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut query = ItemQuery::new(
            &viewer.region,
            self.trending_since(),
            ItemOrder::LeastExposed,
            limit * 4,
        );
        query.exclude_owners = viewer
            .following
            .iter()
            .copied()
            .chain(std::iter::once(viewer.user_id))
            .collect();
        let items = self.store.list_items(&query).await?;

        let owners: Vec<_> = items
            .iter()
            .map(|i| i.owner_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let stats = self.store.creator_stats(&owners).await?;
        let ceiling = self.config.exploration_max_creator_views;

        Ok(items
            .into_iter()
            .filter(|item| {
                stats
                    .get(&item.owner_id)
                    .map_or(0, |s| s.total_views)
                    < ceiling
            })
            .take(limit)
            .collect())
    }
}
