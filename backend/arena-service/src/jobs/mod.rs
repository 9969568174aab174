//! Background jobs
//!
//! - `score_refresher`: drains recompute requests and refreshes item scores
//! - `lifecycle_sweeper`: closes or expires battles whose deadline passed
//!   without a scheduled transition firing, and prunes the vote-attempt log

pub mod lifecycle_sweeper;
pub mod score_refresher;

pub use lifecycle_sweeper::{prune_attempts, start_lifecycle_sweeper, sweep_once};
pub use score_refresher::{start_score_refresher, RecomputeQueue};
