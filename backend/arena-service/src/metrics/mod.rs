//! Arena Metrics
//!
//! Prometheus metrics for votes, lifecycle transitions, feed serving, score
//! recomputation, the transition scheduler and best-effort side effects.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};
use std::time::Duration;

static VOTES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arena_votes_total",
        "Vote submissions by outcome (accepted/duplicate/not_votable/invalid/error)",
        &["outcome"]
    )
    .expect("Failed to register arena votes metric")
});

static BATTLE_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arena_battle_transitions_total",
        "Battle lifecycle transitions by kind and outcome (applied/skipped)",
        &["kind", "outcome"]
    )
    .expect("Failed to register arena battle transitions metric")
});

static FEED_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arena_feed_requests_total",
        "Feed requests by tab and source (ranked/memoized/fallback)",
        &["tab", "source"]
    )
    .expect("Failed to register arena feed requests metric")
});

static FEED_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "arena_feed_latency_seconds",
        "Feed page assembly latency",
        &["tab"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register arena feed latency metric")
});

static SCORE_RECOMPUTES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arena_score_recomputes_total",
        "Item score recomputations (success/error)",
        &["outcome"]
    )
    .expect("Failed to register arena score recomputes metric")
});

static SCHEDULER_JOBS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arena_scheduler_jobs_total",
        "Scheduled transition jobs (scheduled/deduplicated/completed/failed/recovered)",
        &["outcome"]
    )
    .expect("Failed to register arena scheduler jobs metric")
});

static SIDE_EFFECT_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arena_side_effect_failures_total",
        "Best-effort side effects that exhausted their retries",
        &["effect"]
    )
    .expect("Failed to register arena side effect failures metric")
});

pub fn record_vote(outcome: &str) {
    VOTES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_transition(kind: &str, outcome: &str) {
    BATTLE_TRANSITIONS_TOTAL
        .with_label_values(&[kind, outcome])
        .inc();
}

pub fn record_feed_request(tab: &str, source: &str, duration: Duration) {
    FEED_REQUESTS_TOTAL.with_label_values(&[tab, source]).inc();
    FEED_LATENCY_SECONDS
        .with_label_values(&[tab])
        .observe(duration.as_secs_f64());
}

pub fn record_score_recompute(outcome: &str) {
    SCORE_RECOMPUTES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_scheduler_job(outcome: &str) {
    SCHEDULER_JOBS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_side_effect_failure(effect: &str) {
    SIDE_EFFECT_FAILURES_TOTAL.with_label_values(&[effect]).inc();
}

/// Render the default registry in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
