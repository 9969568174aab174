//! Battle State Machine
//!
//! Owns status, timeline and result of every battle.
//!
//! ```text
//! pending --accept--> active --close--> completed
//!    |                   |
//!    +------expire-------+--> expired
//! ```
//!
//! Writes go through conditional store updates, so a racing accept and
//! expire (or two closes) resolve to exactly one winner. Scheduled
//! transitions are idempotent; rewards and notifications only run for the
//! caller that actually moved the battle, after the move committed.

pub mod outcome;
pub mod short_code;

use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cursor::{decode_battle_cursor, encode_battle_cursor};
use super::effects::SideEffects;
use super::scheduler::{
    TransitionHandler, TransitionJob, TransitionKind, TransitionOutcome, TransitionScheduler,
};
use crate::clients::{
    AssetModeration, Notification, NotificationKind, NotificationSink, RewardGrant, RewardLedger,
};
use crate::clock::Clock;
use crate::config::BattleConfig;
use crate::db::EngagementStore;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{Battle, BattlePage, BattleSide, BattleStatus};

/// Max page size for the active battle listing
pub const MAX_LIST_LIMIT: usize = 50;

pub struct BattleService {
    store: Arc<dyn EngagementStore>,
    moderation: Arc<dyn AssetModeration>,
    notifications: Arc<dyn NotificationSink>,
    rewards: Arc<dyn RewardLedger>,
    scheduler: Arc<TransitionScheduler>,
    clock: Arc<dyn Clock>,
    effects: SideEffects,
    config: BattleConfig,
}

impl BattleService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn EngagementStore>,
        moderation: Arc<dyn AssetModeration>,
        notifications: Arc<dyn NotificationSink>,
        rewards: Arc<dyn RewardLedger>,
        scheduler: Arc<TransitionScheduler>,
        clock: Arc<dyn Clock>,
        effects: SideEffects,
        config: BattleConfig,
    ) -> Self {
        Self {
            store,
            moderation,
            notifications,
            rewards,
            scheduler,
            clock,
            effects,
            config,
        }
    }

    fn phase(&self) -> Duration {
        Duration::hours(self.config.phase_hours)
    }

    async fn require_approved(&self, user_id: Uuid, asset_ref: &str) -> Result<()> {
        if asset_ref.trim().is_empty() {
            return Err(AppError::Validation("assetRef is required".into()));
        }
        if !self.moderation.is_approved(user_id, asset_ref).await? {
            return Err(AppError::Validation(format!(
                "asset {} has not been approved by moderation",
                asset_ref
            )));
        }
        Ok(())
    }

    async fn unique_short_code(&self) -> Result<String> {
        let mut candidate = short_code::random_code(self.config.short_code_length);
        for attempt in 1..=self.config.short_code_attempts {
            if !self.store.short_code_exists(&candidate).await? {
                return Ok(candidate);
            }
            warn!(attempt = attempt, short_code = %candidate, "Short code collision");
            candidate = short_code::random_code(self.config.short_code_length);
        }
        Ok(short_code::with_timestamp_suffix(&candidate, self.clock.now()))
    }

    /// Open a challenge; it expires unless accepted within one phase
    pub async fn create(
        &self,
        challenger_id: Uuid,
        tribe: Option<String>,
        asset_ref: String,
    ) -> Result<Battle> {
        self.require_approved(challenger_id, &asset_ref).await?;

        let now = self.clock.now();
        let battle = Battle::new_pending(
            Uuid::new_v4(),
            self.unique_short_code().await?,
            BattleSide {
                user_id: challenger_id,
                tribe,
                asset_ref,
            },
            now,
            now + self.phase(),
        );
        self.store.insert_battle(&battle).await?;

        info!(
            battle_id = %battle.id,
            short_code = %battle.short_code,
            user_id = %challenger_id,
            "Battle created"
        );

        if let Err(e) = self
            .scheduler
            .schedule(battle.id, TransitionKind::Expire, battle.timeline.ends_at)
            .await
        {
            // The lifecycle sweeper still expires it
            warn!(battle_id = %battle.id, "Failed to schedule expiry: {}", e);
        }

        Ok(battle)
    }

    /// Accept a pending challenge and start the voting phase
    pub async fn accept(
        &self,
        battle_id: Uuid,
        defender_id: Uuid,
        tribe: Option<String>,
        asset_ref: String,
    ) -> Result<Battle> {
        let battle = self
            .store
            .get_battle(battle_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("battle {}", battle_id)))?;

        if battle.challenger.user_id == defender_id {
            return Err(AppError::Validation(
                "cannot accept your own challenge".into(),
            ));
        }
        if battle.status != BattleStatus::Pending {
            return Err(AppError::Conflict(format!(
                "battle {} is already {}",
                battle_id, battle.status
            )));
        }
        let now = self.clock.now();
        if now >= battle.timeline.ends_at {
            return Err(AppError::Conflict(format!(
                "challenge {} is past its deadline",
                battle.short_code
            )));
        }

        self.require_approved(defender_id, &asset_ref).await?;

        let defender = BattleSide {
            user_id: defender_id,
            tribe,
            asset_ref,
        };
        let accepted = self
            .store
            .accept_battle(battle_id, &defender, now, now + self.phase())
            .await?
            .ok_or_else(|| {
                AppError::Conflict(format!("battle {} was accepted or expired concurrently", battle_id))
            })?;
        metrics::record_transition("accept", TransitionOutcome::Applied.as_str());

        info!(
            battle_id = %battle_id,
            short_code = %accepted.short_code,
            user_id = %defender_id,
            ends_at = %accepted.timeline.ends_at,
            "Battle accepted"
        );

        if let Err(e) = self
            .scheduler
            .schedule(battle_id, TransitionKind::Close, accepted.timeline.ends_at)
            .await
        {
            warn!(battle_id = %battle_id, "Failed to schedule close: {}", e);
        }

        let notification = Notification::new(
            Some(accepted.challenger.user_id),
            NotificationKind::BattleAccepted,
            accepted.id,
            &accepted.short_code,
            serde_json::json!({ "defenderId": defender_id }),
            now,
        );
        let sink = Arc::clone(&self.notifications);
        self.effects.spawn("notification", move || {
            let sink = Arc::clone(&sink);
            let notification = notification.clone();
            async move { sink.notify(&notification).await }
        });

        Ok(accepted)
    }

    /// Expire a challenge nobody accepted; no-op unless pending and overdue
    pub async fn expire(&self, battle_id: Uuid) -> Result<TransitionOutcome> {
        let Some(battle) = self.load_for_transition(battle_id, TransitionKind::Expire).await? else {
            return Ok(self.skipped(TransitionKind::Expire));
        };
        let now = self.clock.now();

        if battle.status != BattleStatus::Pending {
            self.log_inconsistent(&battle, TransitionKind::Expire);
            return Ok(self.skipped(TransitionKind::Expire));
        }
        if now < battle.timeline.ends_at {
            warn!(battle_id = %battle_id, ends_at = %battle.timeline.ends_at, "Expiry fired early");
            return Ok(self.skipped(TransitionKind::Expire));
        }

        let Some(expired) = self.store.expire_battle(battle_id, now).await? else {
            return Ok(self.skipped(TransitionKind::Expire));
        };
        metrics::record_transition("expire", TransitionOutcome::Applied.as_str());
        info!(battle_id = %battle_id, short_code = %expired.short_code, "Battle expired");

        let notification = Notification::new(
            Some(expired.challenger.user_id),
            NotificationKind::BattleExpired,
            expired.id,
            &expired.short_code,
            serde_json::json!({}),
            now,
        );
        self.notify(notification).await;

        Ok(TransitionOutcome::Applied)
    }

    /// Tally, complete and reward an active battle; no-op unless active and due
    pub async fn close(&self, battle_id: Uuid) -> Result<TransitionOutcome> {
        let Some(battle) = self.load_for_transition(battle_id, TransitionKind::Close).await? else {
            return Ok(self.skipped(TransitionKind::Close));
        };
        let now = self.clock.now();

        if battle.status != BattleStatus::Active {
            self.log_inconsistent(&battle, TransitionKind::Close);
            return Ok(self.skipped(TransitionKind::Close));
        }
        if now < battle.timeline.ends_at {
            warn!(battle_id = %battle_id, ends_at = %battle.timeline.ends_at, "Close fired early");
            return Ok(self.skipped(TransitionKind::Close));
        }

        // Votes are only accepted before ends_at, so these tallies are final
        let result = outcome::decide(&battle, &self.config);
        let Some(completed) = self.store.complete_battle(battle_id, &result, now).await? else {
            return Ok(self.skipped(TransitionKind::Close));
        };
        metrics::record_transition("close", TransitionOutcome::Applied.as_str());
        info!(
            battle_id = %battle_id,
            short_code = %completed.short_code,
            challenger_votes = completed.votes.challenger,
            defender_votes = completed.votes.defender,
            tie = result.tie,
            margin_pct = result.margin_pct,
            "Battle completed"
        );

        self.settle(&completed).await;
        Ok(TransitionOutcome::Applied)
    }

    pub async fn get_by_short_code(&self, short_code: &str) -> Result<Battle> {
        self.store
            .get_battle_by_short_code(short_code.trim())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("battle {}", short_code)))
    }

    pub async fn get(&self, battle_id: Uuid) -> Result<Battle> {
        self.store
            .get_battle(battle_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("battle {}", battle_id)))
    }

    /// Active battles ending soonest first
    pub async fn list_active(&self, cursor: Option<&str>, limit: usize) -> Result<BattlePage> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        let after = match cursor {
            Some(c) if !c.is_empty() => Some(decode_battle_cursor(c)?),
            _ => None,
        };

        let mut battles = self.store.list_active_battles(after, limit + 1).await?;
        let next_cursor = if battles.len() > limit {
            battles.truncate(limit);
            battles
                .last()
                .map(|b| encode_battle_cursor(b.timeline.ends_at, b.id))
        } else {
            None
        };

        Ok(BattlePage {
            battles,
            next_cursor,
        })
    }

    async fn load_for_transition(
        &self,
        battle_id: Uuid,
        kind: TransitionKind,
    ) -> Result<Option<Battle>> {
        let battle = self.store.get_battle(battle_id).await?;
        if battle.is_none() {
            warn!(battle_id = %battle_id, kind = %kind, "Transition for unknown battle");
        }
        Ok(battle)
    }

    fn skipped(&self, kind: TransitionKind) -> TransitionOutcome {
        metrics::record_transition(kind.as_str(), TransitionOutcome::Skipped.as_str());
        TransitionOutcome::Skipped
    }

    fn log_inconsistent(&self, battle: &Battle, kind: TransitionKind) {
        let err = AppError::InconsistentState(format!(
            "{} fired for battle {} in status {}",
            kind, battle.id, battle.status
        ));
        warn!(battle_id = %battle.id, kind = %kind, "{}", err);
    }

    async fn notify(&self, notification: Notification) {
        let sink = Arc::clone(&self.notifications);
        self.effects
            .run("notification", || {
                let sink = Arc::clone(&sink);
                let notification = notification.clone();
                async move { sink.notify(&notification).await }
            })
            .await;
    }

    /// Rewards, result notifications and creator stats for a completed battle
    async fn settle(&self, battle: &Battle) {
        let Some(result) = battle.result.as_ref() else {
            return;
        };
        let now = self.clock.now();

        let mut sides = vec![&battle.challenger];
        if let Some(defender) = battle.defender.as_ref() {
            sides.push(defender);
        }

        for side in sides {
            let won = result.winner == Some(side.user_id);
            let (points, outcome) = if result.tie {
                (result.reward.winner, "tie")
            } else if won {
                (result.reward.winner, "won")
            } else {
                (result.reward.loser, "lost")
            };

            let grant = RewardGrant {
                battle_id: battle.id,
                user_id: side.user_id,
                tribe: side.tribe.clone(),
                points,
                outcome: outcome.to_string(),
            };
            let rewards = Arc::clone(&self.rewards);
            self.effects
                .run("reward", || {
                    let rewards = Arc::clone(&rewards);
                    let grant = grant.clone();
                    async move { rewards.grant(&grant).await }
                })
                .await;

            // Keyed by battle, so a retry after a lost commit ack counts once
            let store = Arc::clone(&self.store);
            let user_id = side.user_id;
            let battle_id = battle.id;
            self.effects
                .run("creator_stats", || {
                    let store = Arc::clone(&store);
                    async move {
                        let recorded = store.record_battle_outcome(user_id, battle_id, won).await?;
                        if !recorded {
                            debug!(battle_id = %battle_id, user_id = %user_id, "Battle outcome already counted");
                        }
                        Ok::<(), AppError>(())
                    }
                })
                .await;

            self.notify(Notification::new(
                Some(side.user_id),
                NotificationKind::BattleResult,
                battle.id,
                &battle.short_code,
                serde_json::json!({
                    "outcome": outcome,
                    "points": points,
                    "marginPct": result.margin_pct,
                    "votes": battle.votes,
                }),
                now,
            ))
            .await;
        }
    }
}

#[async_trait]
impl TransitionHandler for BattleService {
    async fn handle(&self, job: &TransitionJob) -> Result<TransitionOutcome> {
        match job.kind {
            TransitionKind::Expire => self.expire(job.battle_id).await,
            TransitionKind::Close => self.close(job.battle_id).await,
        }
    }
}
