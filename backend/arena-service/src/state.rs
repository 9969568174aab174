//! Application wiring
//!
//! `AppState` is what the HTTP handlers see. Storage and outbound
//! collaborators come in through [`Backends`] so the same wiring serves
//! Postgres/Redis/Kafka in production and the in-memory doubles locally.

use resilience::RetryConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::cache::{MemoryScoreCache, ScoreCache};
use crate::clients::{
    AssetModeration, FollowGraph, LogEventSink, MemoryAssetModeration, MemoryFollowGraph,
    NotificationSink, RewardLedger,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::{EngagementStore, MemoryStore};
use crate::error::Result;
use crate::jobs::{start_lifecycle_sweeper, start_score_refresher, RecomputeQueue};
use crate::services::{
    BattleService, FeedFacade, RankingEngine, SideEffects, TransitionHandler, TransitionScheduler,
    VoteLedger,
};

/// Storage and collaborator implementations selected at startup
pub struct Backends {
    pub store: Arc<dyn EngagementStore>,
    pub cache: Arc<dyn ScoreCache>,
    pub follows: Arc<dyn FollowGraph>,
    pub moderation: Arc<dyn AssetModeration>,
    pub notifications: Arc<dyn NotificationSink>,
    pub rewards: Arc<dyn RewardLedger>,
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    /// Everything in process; events only go to the log
    pub fn in_memory() -> Self {
        let events = Arc::new(LogEventSink::new());
        Self {
            store: Arc::new(MemoryStore::new()),
            cache: Arc::new(MemoryScoreCache::new()),
            follows: Arc::new(MemoryFollowGraph::new()),
            moderation: Arc::new(MemoryAssetModeration::new()),
            notifications: events.clone(),
            rewards: events,
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn EngagementStore>,
    pub cache: Arc<dyn ScoreCache>,
    pub clock: Arc<dyn Clock>,
    pub ranking: Arc<RankingEngine>,
    pub feed: Arc<FeedFacade>,
    pub battles: Arc<BattleService>,
    pub votes: Arc<VoteLedger>,
    pub scheduler: Arc<TransitionScheduler>,
    pub recompute: RecomputeQueue,
    /// Retry policy for handler-level writes
    pub write_retry: RetryConfig,
}

impl AppState {
    /// Wire services over the given backends. The returned receiver feeds
    /// the score refresher; hand it to [`AppState::start_workers`].
    pub fn build(config: Config, backends: Backends) -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let config = Arc::new(config);
        let Backends {
            store,
            cache,
            follows,
            moderation,
            notifications,
            rewards,
            clock,
        } = backends;

        let (recompute, recompute_rx) = RecomputeQueue::channel();
        let retry = config.scheduler.retry_config();
        let effects = SideEffects::new(retry.clone());

        let scheduler = Arc::new(TransitionScheduler::new(
            store.clone(),
            clock.clone(),
            retry,
        ));

        let ranking = Arc::new(RankingEngine::new(
            store.clone(),
            cache.clone(),
            follows,
            recompute.clone(),
            clock.clone(),
            config.ranking.clone(),
            config.votes.velocity_tau_secs,
        ));

        let feed = Arc::new(FeedFacade::new(
            store.clone(),
            cache.clone(),
            ranking.clone(),
            recompute.clone(),
            clock.clone(),
            config.feed.clone(),
            config.ranking.ranked_list_ttl_secs,
        ));

        let battles = Arc::new(BattleService::new(
            store.clone(),
            moderation,
            notifications.clone(),
            rewards,
            scheduler.clone(),
            clock.clone(),
            effects.clone(),
            config.battle.clone(),
        ));

        let votes = Arc::new(VoteLedger::new(
            store.clone(),
            notifications,
            recompute.clone(),
            clock.clone(),
            effects,
            config.votes.clone(),
        ));

        let state = Self {
            config,
            store,
            cache,
            clock,
            ranking,
            feed,
            battles,
            votes,
            scheduler,
            recompute,
            write_retry: RetryConfig::quick(),
        };
        (state, recompute_rx)
    }

    /// Start the transition dispatcher, reload persisted jobs and spawn the
    /// score refresher and lifecycle sweeper
    pub async fn start_workers(&self, recompute_rx: mpsc::UnboundedReceiver<Uuid>) -> Result<()> {
        let handler: Arc<dyn TransitionHandler> = self.battles.clone();
        self.scheduler.start(handler)?;
        let recovered = self.scheduler.recover().await?;

        tokio::spawn(start_score_refresher(recompute_rx, self.ranking.clone()));
        tokio::spawn(start_lifecycle_sweeper(
            self.store.clone(),
            self.battles.clone(),
            self.clock.clone(),
            Duration::from_secs(self.config.scheduler.sweep_interval_secs.max(1)),
            chrono::Duration::seconds(self.config.votes.abuse_window_secs.max(1)),
        ));

        info!(recovered_jobs = recovered, "Background workers started");
        Ok(())
    }
}
