//! Best-effort side effects
//!
//! Rewards, notifications and creator stats run after the state change they
//! belong to has committed. Failures are retried with backoff, logged and
//! counted, and never reach the caller.

use resilience::{with_retry, RetryConfig};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::Result;
use crate::metrics;

#[derive(Debug, Clone)]
pub struct SideEffects {
    retry: RetryConfig,
}

impl SideEffects {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    /// Retry policy used by tests and development wiring
    pub fn immediate() -> Self {
        Self::new(RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        })
    }

    /// Run `f` with retries; returns whether it eventually succeeded
    pub async fn run<F, Fut>(&self, effect: &'static str, f: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match with_retry(self.retry.clone(), f).await {
            Ok(()) => {
                debug!(effect = effect, "Side effect delivered");
                true
            }
            Err(e) => {
                error!(effect = effect, error = %e, "Side effect failed");
                metrics::record_side_effect_failure(effect);
                false
            }
        }
    }

    /// Fire-and-forget variant for request paths
    pub fn spawn<F, Fut>(&self, effect: &'static str, f: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            this.run(effect, f).await;
        });
    }
}
