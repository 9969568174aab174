//! Lifecycle Sweeper Background Job
//!
//! Scheduled transitions normally move battles on time. This job covers the
//! gaps: a job that exhausted its retries, a process that died between
//! commit and schedule, or a transition that fired early and was skipped.
//! Each cycle lists pending/active battles past `ends_at` and runs the same
//! idempotent expire/close the scheduler would have run.
//!
//! The same cycle trims the vote-attempt log to the abuse review window.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::clock::Clock;
use crate::db::EngagementStore;
use crate::error::Result;
use crate::models::BattleStatus;
use crate::services::battle::BattleService;
use crate::services::scheduler::TransitionOutcome;

/// Max overdue battles handled per cycle
const SWEEP_BATCH: usize = 100;

pub async fn start_lifecycle_sweeper(
    store: Arc<dyn EngagementStore>,
    battles: Arc<BattleService>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    attempt_retention: chrono::Duration,
) {
    tracing::info!(
        interval_secs = interval.as_secs(),
        batch = SWEEP_BATCH,
        "Starting lifecycle sweeper background job"
    );

    loop {
        sleep(interval).await;

        let cycle_start = Instant::now();
        match sweep_once(store.as_ref(), &battles, clock.as_ref()).await {
            Ok(0) => {}
            Ok(applied) => {
                tracing::info!(
                    applied,
                    duration_ms = cycle_start.elapsed().as_millis(),
                    "Lifecycle sweep moved overdue battles"
                );
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    duration_ms = cycle_start.elapsed().as_millis(),
                    "Lifecycle sweep failed"
                );
            }
        }

        match prune_attempts(store.as_ref(), clock.as_ref(), attempt_retention).await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Pruned old vote attempts"),
            Err(e) => tracing::warn!(error = %e, "Vote attempt pruning failed"),
        }
    }
}

/// Delete vote attempts that fell out of the abuse review window
pub async fn prune_attempts(
    store: &dyn EngagementStore,
    clock: &dyn Clock,
    retention: chrono::Duration,
) -> Result<u64> {
    store.prune_vote_attempts(clock.now() - retention).await
}

/// One sweep; returns how many battles changed status
pub async fn sweep_once(
    store: &dyn EngagementStore,
    battles: &BattleService,
    clock: &dyn Clock,
) -> Result<usize> {
    let overdue = store.overdue_battles(clock.now(), SWEEP_BATCH).await?;
    let mut applied = 0;

    for battle in overdue {
        let outcome = match battle.status {
            BattleStatus::Pending => battles.expire(battle.id).await,
            BattleStatus::Active => battles.close(battle.id).await,
            _ => continue,
        };
        match outcome {
            Ok(TransitionOutcome::Applied) => applied += 1,
            Ok(TransitionOutcome::Skipped) => {}
            Err(e) => {
                tracing::warn!(battle_id = %battle.id, error = %e, "Overdue battle not moved");
            }
        }
    }

    Ok(applied)
}
