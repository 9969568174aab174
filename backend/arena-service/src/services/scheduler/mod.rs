//! Delayed Transition Scheduler
//!
//! Durable, at-least-once delayed execution of battle transitions:
//! - jobs are persisted per (battle, kind) before they are queued
//! - a dispatcher task sleeps until `fire_at` (immediately if already past)
//! - handler failures are retried with exponential backoff, bounded attempts
//! - re-scheduling the same key with the same `fire_at` is a no-op; a new
//!   `fire_at` supersedes the queued one
//!
//! Handlers are idempotent, so a job that runs twice after a crash is safe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use resilience::{with_retry, RetryConfig, RetryError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::EngagementStore;
use crate::error::{AppError, Result};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    /// Expire the battle if nobody accepted it in time
    Expire,
    /// Tally and complete an active battle
    Close,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Expire => "expire",
            TransitionKind::Close => "close",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "expire" => Some(TransitionKind::Expire),
            "close" => Some(TransitionKind::Close),
            _ => None,
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionJob {
    pub battle_id: Uuid,
    pub kind: TransitionKind,
    pub fire_at: DateTime<Utc>,
    /// Failed executions so far
    pub attempts: u32,
}

impl TransitionJob {
    pub fn new(battle_id: Uuid, kind: TransitionKind, fire_at: DateTime<Utc>) -> Self {
        Self {
            battle_id,
            kind,
            fire_at,
            attempts: 0,
        }
    }

    fn key(&self) -> (Uuid, TransitionKind) {
        (self.battle_id, self.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The battle moved to its next state
    Applied,
    /// The battle was not in the expected state; nothing changed
    Skipped,
}

impl TransitionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionOutcome::Applied => "applied",
            TransitionOutcome::Skipped => "skipped",
        }
    }
}

#[async_trait]
pub trait TransitionHandler: Send + Sync {
    async fn handle(&self, job: &TransitionJob) -> Result<TransitionOutcome>;
}

pub struct TransitionScheduler {
    store: Arc<dyn EngagementStore>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    /// Queued fire time per key; a job whose fire time no longer matches was superseded
    queued: Arc<DashMap<(Uuid, TransitionKind), DateTime<Utc>>>,
    tx: mpsc::UnboundedSender<TransitionJob>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<TransitionJob>>>,
}

impl TransitionScheduler {
    pub fn new(store: Arc<dyn EngagementStore>, clock: Arc<dyn Clock>, retry: RetryConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            store,
            clock,
            retry,
            queued: Arc::new(DashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Enqueue exactly one future execution of `kind` for the battle
    pub async fn schedule(
        &self,
        battle_id: Uuid,
        kind: TransitionKind,
        fire_at: DateTime<Utc>,
    ) -> Result<()> {
        let job = TransitionJob::new(battle_id, kind, fire_at);

        if self.queued.get(&job.key()).map(|at| *at) == Some(fire_at) {
            debug!(battle_id = %battle_id, kind = %kind, "Transition already scheduled");
            metrics::record_scheduler_job("deduplicated");
            return Ok(());
        }

        self.store.save_transition_job(&job).await?;
        self.enqueue(job)
    }

    /// Reload persisted jobs; overdue ones fire immediately
    pub async fn recover(&self) -> Result<usize> {
        let jobs = self.store.pending_transition_jobs().await?;
        let count = jobs.len();
        for job in jobs {
            if self.queued.get(&job.key()).map(|at| *at) == Some(job.fire_at) {
                continue;
            }
            metrics::record_scheduler_job("recovered");
            self.enqueue(job)?;
        }
        if count > 0 {
            info!(jobs = count, "Recovered scheduled transitions");
        }
        Ok(count)
    }

    /// Number of jobs waiting to fire
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    fn enqueue(&self, job: TransitionJob) -> Result<()> {
        self.queued.insert(job.key(), job.fire_at);
        debug!(
            battle_id = %job.battle_id,
            kind = %job.kind,
            fire_at = %job.fire_at,
            "Transition scheduled"
        );
        self.tx.send(job).map_err(|e| {
            self.queued.remove(&e.0.key());
            AppError::TransientDependency("transition dispatcher stopped".to_string())
        })?;
        metrics::record_scheduler_job("scheduled");
        Ok(())
    }

    /// Start the dispatcher. Jobs scheduled before this call are buffered.
    pub fn start(&self, handler: Arc<dyn TransitionHandler>) -> Result<JoinHandle<()>> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| AppError::Internal("transition dispatcher already started".into()))?;

        let dispatch = Dispatch {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            retry: self.retry.clone(),
            queued: Arc::clone(&self.queued),
            handler,
        };

        Ok(tokio::spawn(async move {
            info!("Transition dispatcher started");
            while let Some(job) = rx.recv().await {
                let dispatch = dispatch.clone();
                tokio::spawn(async move { dispatch.run(job).await });
            }
            info!("Transition dispatcher stopped");
        }))
    }
}

#[derive(Clone)]
struct Dispatch {
    store: Arc<dyn EngagementStore>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    queued: Arc<DashMap<(Uuid, TransitionKind), DateTime<Utc>>>,
    handler: Arc<dyn TransitionHandler>,
}

impl Dispatch {
    fn is_current(&self, job: &TransitionJob) -> bool {
        self.queued.get(&job.key()).map(|at| *at) == Some(job.fire_at)
    }

    async fn run(&self, mut job: TransitionJob) {
        if let Ok(delay) = (job.fire_at - self.clock.now()).to_std() {
            tokio::time::sleep(delay).await;
        }

        if !self.is_current(&job) {
            debug!(battle_id = %job.battle_id, kind = %job.kind, "Superseded transition dropped");
            return;
        }

        let failures = Arc::new(AtomicU32::new(0));
        let result = {
            let failures = Arc::clone(&failures);
            let handler = Arc::clone(&self.handler);
            let job = job.clone();
            with_retry(self.retry.clone(), move || {
                let handler = Arc::clone(&handler);
                let failures = Arc::clone(&failures);
                let job = job.clone();
                async move {
                    let outcome = handler.handle(&job).await;
                    if outcome.is_err() {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                    outcome
                }
            })
            .await
        };
        job.attempts += failures.load(Ordering::SeqCst);

        match result {
            Ok(outcome) => {
                self.queued
                    .remove_if(&job.key(), |_, at| *at == job.fire_at);
                if let Err(e) = self.store.complete_transition_job(&job).await {
                    warn!(battle_id = %job.battle_id, kind = %job.kind, "Failed to clear transition job: {}", e);
                }
                metrics::record_scheduler_job("completed");
                debug!(
                    battle_id = %job.battle_id,
                    kind = %job.kind,
                    outcome = outcome.as_str(),
                    "Transition executed"
                );
            }
            Err(err) => {
                let (attempts, last) = match err {
                    RetryError::Exhausted { attempts, last } => (attempts, last),
                    RetryError::Permanent(e) => (job.attempts, e),
                };
                error!(
                    battle_id = %job.battle_id,
                    kind = %job.kind,
                    attempt = attempts,
                    error = %last,
                    "Transition failed after retries; left for recovery"
                );
                self.queued
                    .remove_if(&job.key(), |_, at| *at == job.fire_at);
                if let Err(e) = self.store.save_transition_job(&job).await {
                    warn!(battle_id = %job.battle_id, "Failed to persist failed transition job: {}", e);
                }
                metrics::record_scheduler_job("failed");
            }
        }
    }
}
