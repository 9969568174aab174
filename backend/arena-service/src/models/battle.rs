use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BattleStatus {
    Pending,
    Active,
    Completed,
    Expired,
}

impl BattleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BattleStatus::Pending => "pending",
            BattleStatus::Active => "active",
            BattleStatus::Completed => "completed",
            BattleStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BattleStatus::Pending),
            "active" => Some(BattleStatus::Active),
            "completed" => Some(BattleStatus::Completed),
            "expired" => Some(BattleStatus::Expired),
            _ => None,
        }
    }

    /// The only edges of the lifecycle graph
    pub fn can_transition_to(&self, next: BattleStatus) -> bool {
        matches!(
            (self, next),
            (BattleStatus::Pending, BattleStatus::Active)
                | (BattleStatus::Pending, BattleStatus::Expired)
                | (BattleStatus::Active, BattleStatus::Completed)
                | (BattleStatus::Active, BattleStatus::Expired)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BattleStatus::Completed | BattleStatus::Expired)
    }
}

impl fmt::Display for BattleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One contestant: owner, tribe label, rendered asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleSide {
    pub user_id: Uuid,
    pub tribe: Option<String>,
    pub asset_ref: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleTimeline {
    pub created: DateTime<Utc>,
    pub accepted: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub ends_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Monotonic tallies; `challenger + defender == total`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleVotes {
    pub challenger: i64,
    pub defender: i64,
    pub total: i64,
}

impl BattleVotes {
    pub fn record(&mut self, side: super::VoteSide) {
        match side {
            super::VoteSide::Challenger => self.challenger = self.challenger.saturating_add(1),
            super::VoteSide::Defender => self.defender = self.defender.saturating_add(1),
        }
        self.total = self.challenger.saturating_add(self.defender);
    }
}

/// Tribe points handed out at close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSplit {
    pub winner: i64,
    pub loser: i64,
}

/// Immutable outcome of a completed battle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleResult {
    pub winner: Option<Uuid>,
    pub tie: bool,
    pub margin_pct: f64,
    pub reward: RewardSplit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Battle {
    pub id: Uuid,
    pub short_code: String,
    pub status: BattleStatus,
    pub challenger: BattleSide,
    pub defender: Option<BattleSide>,
    pub timeline: BattleTimeline,
    pub votes: BattleVotes,
    pub result: Option<BattleResult>,
    pub velocity: f64,
    pub velocity_updated_at: Option<DateTime<Utc>>,
    pub abuse_flag: Option<String>,
}

impl Battle {
    pub fn new_pending(
        id: Uuid,
        short_code: String,
        challenger: BattleSide,
        created: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            short_code,
            status: BattleStatus::Pending,
            challenger,
            defender: None,
            timeline: BattleTimeline {
                created,
                accepted: None,
                started: None,
                ends_at,
                completed_at: None,
            },
            votes: BattleVotes::default(),
            result: None,
            velocity: 0.0,
            velocity_updated_at: None,
            abuse_flag: None,
        }
    }

    pub fn is_votable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == BattleStatus::Active && now < self.timeline.ends_at
    }
}

/// Cursor position in the active-battle listing: (endsAt, id)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BattleListCursor {
    pub ends_at: DateTime<Utc>,
    pub id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattlePage {
    pub battles: Vec<Battle>,
    pub next_cursor: Option<String>,
}
