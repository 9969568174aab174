//! Score Refresher Background Job
//!
//! Engagement writes and stale cache reads enqueue item ids here instead of
//! recomputing inline. The job coalesces whatever is queued into one batch,
//! so an item hit by a burst of votes is rescored once per cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::metrics;
use crate::services::ranking::RankingEngine;

/// Upper bound on ids drained into a single batch
const MAX_BATCH: usize = 256;

/// Handle for requesting a score recompute; cheap to clone
#[derive(Clone)]
pub struct RecomputeQueue {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl RecomputeQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn request(&self, item_id: Uuid) {
        if self.tx.send(item_id).is_err() {
            tracing::debug!(item_id = %item_id, "Score refresher stopped, recompute dropped");
        }
    }

    pub fn request_many(&self, item_ids: impl IntoIterator<Item = Uuid>) {
        for item_id in item_ids {
            self.request(item_id);
        }
    }
}

/// Start the score refresher; returns when every queue handle is dropped
pub async fn start_score_refresher(
    mut rx: mpsc::UnboundedReceiver<Uuid>,
    engine: Arc<RankingEngine>,
) {
    tracing::info!("Starting score refresher background job");

    while let Some(first) = rx.recv().await {
        let mut batch = HashSet::from([first]);
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(item_id) => {
                    batch.insert(item_id);
                }
                Err(_) => break,
            }
        }

        let cycle_start = Instant::now();
        let refreshed = refresh_batch(&engine, batch).await;
        tracing::debug!(
            refreshed,
            duration_ms = cycle_start.elapsed().as_millis(),
            "Score refresh cycle completed"
        );
    }

    tracing::info!("Score refresher stopped");
}

/// Refresh every id in the batch; failures are logged and counted, not retried
pub async fn refresh_batch(engine: &RankingEngine, batch: HashSet<Uuid>) -> usize {
    let mut refreshed = 0;
    for item_id in batch {
        match engine.refresh_item(item_id).await {
            Ok(()) => refreshed += 1,
            Err(e) => {
                metrics::record_score_recompute("error");
                tracing::warn!(item_id = %item_id, error = %e, "Score recompute failed");
            }
        }
    }
    refreshed
}
