//! Vote Ledger
//!
//! At most one vote per battle for each identity signal (user id,
//! fingerprint, IP hash). The store's `insert_vote` is the single point of
//! truth: uniqueness and tally increments happen there atomically, never as
//! a read-then-write here.

pub mod abuse;

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::effects::SideEffects;
use crate::clients::{Notification, NotificationKind, NotificationSink};
use crate::clock::Clock;
use crate::config::VoteConfig;
use crate::db::EngagementStore;
use crate::error::{AppError, Result};
use crate::jobs::score_refresher::RecomputeQueue;
use crate::metrics;
use crate::models::{
    Battle, CounterDelta, Vote, VoteAttempt, VoteReceipt, VoteSide, VoterSignals,
};

pub struct VoteLedger {
    store: Arc<dyn EngagementStore>,
    notifications: Arc<dyn NotificationSink>,
    recompute: RecomputeQueue,
    clock: Arc<dyn Clock>,
    effects: SideEffects,
    config: VoteConfig,
}

impl VoteLedger {
    pub fn new(
        store: Arc<dyn EngagementStore>,
        notifications: Arc<dyn NotificationSink>,
        recompute: RecomputeQueue,
        clock: Arc<dyn Clock>,
        effects: SideEffects,
        config: VoteConfig,
    ) -> Self {
        Self {
            store,
            notifications,
            recompute,
            clock,
            effects,
            config,
        }
    }

    pub async fn cast_vote(
        &self,
        battle_id: Uuid,
        choice: VoteSide,
        signals: VoterSignals,
    ) -> Result<VoteReceipt> {
        let outcome = self.try_cast(battle_id, choice, signals).await;
        let label = match &outcome {
            Ok(_) => "accepted",
            Err(AppError::DuplicateVote(_)) => "duplicate",
            Err(AppError::BattleNotVotable(_)) => "not_votable",
            Err(AppError::Validation(_)) => "invalid",
            Err(AppError::NotFound(_)) => "not_found",
            Err(_) => "error",
        };
        metrics::record_vote(label);
        outcome
    }

    async fn try_cast(
        &self,
        battle_id: Uuid,
        choice: VoteSide,
        signals: VoterSignals,
    ) -> Result<VoteReceipt> {
        let signals = signals.normalized();
        if signals.is_empty() {
            return Err(AppError::Validation(
                "a vote needs at least one identity signal".into(),
            ));
        }

        let battle = self
            .store
            .get_battle(battle_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("battle {}", battle_id)))?;

        let now = self.clock.now();
        if !battle.is_votable_at(now) {
            return Err(AppError::BattleNotVotable(format!(
                "battle {} is {} and ends at {}",
                battle_id, battle.status, battle.timeline.ends_at
            )));
        }

        let vote = Vote {
            id: Uuid::new_v4(),
            battle_id,
            side: choice,
            signals: signals.clone(),
            created_at: now,
        };
        let inserted = self.store.insert_vote(&vote).await;

        // Abuse review sees rejected duplicates as well
        if !matches!(&inserted, Err(e) if e.is_transient()) {
            let attempt = VoteAttempt {
                battle_id,
                signals,
                accepted: inserted.is_ok(),
                attempted_at: now,
            };
            if let Err(e) = self.store.record_vote_attempt(&attempt).await {
                warn!(battle_id = %battle_id, "Failed to log vote attempt: {}", e);
            }
            self.review_abuse(&battle).await;
        }

        let votes = inserted?;
        debug!(
            battle_id = %battle_id,
            side = %choice,
            total = votes.total,
            "Vote accepted"
        );

        self.after_accept(battle_id).await;

        Ok(VoteReceipt {
            accepted: true,
            vote_id: vote.id,
            votes,
        })
    }

    /// Derived effects of a committed vote; failures never undo the vote
    async fn after_accept(&self, battle_id: Uuid) {
        let now = self.clock.now();
        if let Err(e) = self
            .store
            .nudge_velocity(battle_id, now, self.config.velocity_tau_secs)
            .await
        {
            warn!(battle_id = %battle_id, "Failed to update vote velocity: {}", e);
        }

        match self
            .store
            .increment_battle_items(battle_id, &CounterDelta::votes(1))
            .await
        {
            Ok(items) => self.recompute.request_many(items),
            Err(e) => warn!(battle_id = %battle_id, "Failed to bump battle clip votes: {}", e),
        }
    }

    async fn review_abuse(&self, battle: &Battle) {
        if battle.abuse_flag.is_some() {
            return;
        }
        let now = self.clock.now();
        let since = now - chrono::Duration::seconds(self.config.abuse_window_secs);
        let attempts = match self.store.vote_attempts_since(battle.id, since).await {
            Ok(attempts) => attempts,
            Err(e) => {
                warn!(battle_id = %battle.id, "Abuse review skipped: {}", e);
                return;
            }
        };

        let Some(reason) = abuse::evaluate(&attempts, &self.config) else {
            return;
        };

        warn!(battle_id = %battle.id, short_code = %battle.short_code, reason = %reason, "Battle flagged for vote abuse");
        if let Err(e) = self.store.flag_battle(battle.id, &reason).await {
            warn!(battle_id = %battle.id, "Failed to store abuse flag: {}", e);
            return;
        }

        let notification = Notification::new(
            None,
            NotificationKind::AbuseFlagged,
            battle.id,
            &battle.short_code,
            serde_json::json!({ "reason": reason }),
            now,
        );
        let sink = Arc::clone(&self.notifications);
        self.effects.spawn("moderation_event", move || {
            let sink = Arc::clone(&sink);
            let notification = notification.clone();
            async move { sink.notify(&notification).await }
        });
        info!(battle_id = %battle.id, "Abuse flag sent to moderation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::LogEventSink;
    use crate::clock::ManualClock;
    use crate::db::MemoryStore;
    use crate::models::{BattleSide, BattleStatus};
    use chrono::{Duration, Utc};

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        ledger: Arc<VoteLedger>,
    }

    async fn active_battle() -> (Harness, Battle) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (queue, _rx) = RecomputeQueue::channel();
        let ledger = Arc::new(VoteLedger::new(
            store.clone(),
            Arc::new(LogEventSink::new()),
            queue,
            clock.clone(),
            SideEffects::immediate(),
            VoteConfig::default(),
        ));

        let now = clock.now();
        let mut battle = Battle::new_pending(
            Uuid::new_v4(),
            "VOTE01".into(),
            BattleSide {
                user_id: Uuid::new_v4(),
                tribe: None,
                asset_ref: "a.png".into(),
            },
            now,
            now + Duration::hours(24),
        );
        battle.status = BattleStatus::Active;
        battle.defender = Some(BattleSide {
            user_id: Uuid::new_v4(),
            tribe: None,
            asset_ref: "b.png".into(),
        });
        store.insert_battle(&battle).await.unwrap();

        (Harness { store, clock, ledger }, battle)
    }

    fn anon(fingerprint: &str, ip: &str) -> VoterSignals {
        VoterSignals {
            user_id: None,
            fingerprint: Some(fingerprint.into()),
            ip_hash: Some(ip.into()),
        }
    }

    #[tokio::test]
    async fn test_vote_without_signals_is_invalid() {
        let (h, battle) = active_battle().await;
        let err = h
            .ledger
            .cast_vote(battle.id, VoteSide::Challenger, VoterSignals::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unknown_and_closed_battles() {
        let (h, battle) = active_battle().await;
        let missing = h
            .ledger
            .cast_vote(Uuid::new_v4(), VoteSide::Challenger, anon("fp", "ip"))
            .await
            .unwrap_err();
        assert!(matches!(missing, AppError::NotFound(_)));

        h.clock.advance(Duration::hours(24));
        let late = h
            .ledger
            .cast_vote(battle.id, VoteSide::Challenger, anon("fp", "ip"))
            .await
            .unwrap_err();
        assert!(matches!(late, AppError::BattleNotVotable(_)));
    }

    #[tokio::test]
    async fn test_either_anonymous_signal_collision_rejects() {
        let (h, battle) = active_battle().await;
        h.ledger
            .cast_vote(battle.id, VoteSide::Challenger, anon("fp-1", "ip-1"))
            .await
            .unwrap();

        for signals in [anon("fp-1", "ip-2"), anon("fp-2", "ip-1")] {
            let err = h
                .ledger
                .cast_vote(battle.id, VoteSide::Defender, signals)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::DuplicateVote(_)));
        }

        let receipt = h
            .ledger
            .cast_vote(battle.id, VoteSide::Defender, anon("fp-3", "ip-3"))
            .await
            .unwrap();
        assert!(receipt.accepted);
        assert_eq!(receipt.votes.total, 2);
        assert_eq!(receipt.votes.challenger, 1);
        assert_eq!(receipt.votes.defender, 1);
    }

    #[tokio::test]
    async fn test_accepted_vote_moves_velocity() {
        let (h, battle) = active_battle().await;
        h.ledger
            .cast_vote(battle.id, VoteSide::Challenger, anon("fp", "ip"))
            .await
            .unwrap();
        let stored = h.store.get_battle(battle.id).await.unwrap().unwrap();
        assert_eq!(stored.velocity, 1.0);
        assert_eq!(stored.velocity_updated_at, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn test_same_ip_three_fingerprints() {
        let (h, battle) = active_battle().await;
        let mut accepted = 0;
        let mut duplicates = 0;
        for fp in ["fp-1", "fp-2", "fp-3"] {
            h.clock.advance(Duration::seconds(15));
            match h
                .ledger
                .cast_vote(battle.id, VoteSide::Challenger, anon(fp, "shared-ip"))
                .await
            {
                Ok(_) => accepted += 1,
                Err(AppError::DuplicateVote(_)) => duplicates += 1,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!((accepted, duplicates), (1, 2));

        let stored = h.store.get_battle(battle.id).await.unwrap().unwrap();
        assert!(stored.abuse_flag.is_none());
    }

    #[tokio::test]
    async fn test_fingerprint_rotation_on_one_ip_is_flagged() {
        let (h, battle) = active_battle().await;
        for fp in ["fp-1", "fp-2", "fp-3", "fp-4"] {
            let _ = h
                .ledger
                .cast_vote(battle.id, VoteSide::Defender, anon(fp, "shared-ip"))
                .await;
        }
        let stored = h.store.get_battle(battle.id).await.unwrap().unwrap();
        let reason = stored.abuse_flag.unwrap();
        assert!(reason.contains("fingerprints"));
        // Flagging never blocks legitimate voters
        h.ledger
            .cast_vote(battle.id, VoteSide::Defender, anon("fp-9", "other-ip"))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_votes_from_one_user_commit_once() {
        let (h, battle) = active_battle().await;
        let user = Uuid::new_v4();

        let mut handles = Vec::new();
        for i in 0..32 {
            let ledger = Arc::clone(&h.ledger);
            let battle_id = battle.id;
            handles.push(tokio::spawn(async move {
                let side = if i % 2 == 0 {
                    VoteSide::Challenger
                } else {
                    VoteSide::Defender
                };
                ledger
                    .cast_vote(
                        battle_id,
                        side,
                        VoterSignals {
                            user_id: Some(user),
                            fingerprint: Some(format!("fp-{}", i)),
                            ip_hash: Some(format!("ip-{}", i)),
                        },
                    )
                    .await
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);

        let stored = h.store.get_battle(battle.id).await.unwrap().unwrap();
        assert_eq!(stored.votes.total, 1);
        assert_eq!(stored.votes.challenger + stored.votes.defender, stored.votes.total);
        assert_eq!(h.store.vote_count(battle.id), 1);
    }
}
