//! Rolling vote-rate signal for battles
//!
//! `v <- v * exp(-dt / tau) + 1` on every accepted vote; the votes-per-minute
//! estimate at time `t` is `v * exp(-dt / tau) / tau`.

use chrono::{DateTime, Utc};

fn decay(updated_at: Option<DateTime<Utc>>, now: DateTime<Utc>, tau_secs: f64) -> f64 {
    let Some(updated_at) = updated_at else {
        return 0.0;
    };
    if tau_secs <= 0.0 {
        return 0.0;
    }
    let elapsed = (now - updated_at).num_milliseconds().max(0) as f64 / 1000.0;
    (-elapsed / tau_secs).exp()
}

/// Decay the stored value up to `now` and add one vote
pub fn nudge(previous: f64, updated_at: Option<DateTime<Utc>>, now: DateTime<Utc>, tau_secs: f64) -> f64 {
    previous * decay(updated_at, now, tau_secs) + 1.0
}

/// Votes per minute as seen at `now`
pub fn rate_per_minute(
    value: f64,
    updated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    tau_secs: f64,
) -> f64 {
    if tau_secs <= 0.0 {
        return 0.0;
    }
    value * decay(updated_at, now, tau_secs) / (tau_secs / 60.0)
}
