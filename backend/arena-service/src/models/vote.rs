use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteSide {
    Challenger,
    Defender,
}

impl VoteSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteSide::Challenger => "challenger",
            VoteSide::Defender => "defender",
        }
    }
}

impl fmt::Display for VoteSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteSide {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "challenger" => Ok(VoteSide::Challenger),
            "defender" => Ok(VoteSide::Defender),
            other => Err(AppError::Validation(format!(
                "invalid vote choice '{}', expected challenger|defender",
                other
            ))),
        }
    }
}

/// Up to three signals approximating a unique voter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoterSignals {
    pub user_id: Option<Uuid>,
    pub fingerprint: Option<String>,
    pub ip_hash: Option<String>,
}

impl VoterSignals {
    /// Drops blank strings so an empty header never acts as a shared identity
    pub fn normalized(self) -> Self {
        let clean = |s: Option<String>| s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            user_id: self.user_id,
            fingerprint: clean(self.fingerprint),
            ip_hash: clean(self.ip_hash),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.fingerprint.is_none() && self.ip_hash.is_none()
    }
}

/// Which uniqueness constraint a vote collided with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteSignal {
    User,
    Fingerprint,
    IpHash,
}

impl VoteSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteSignal::User => "user_id",
            VoteSignal::Fingerprint => "fingerprint",
            VoteSignal::IpHash => "ip_hash",
        }
    }
}

/// Immutable ballot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub id: Uuid,
    pub battle_id: Uuid,
    pub side: VoteSide,
    pub signals: VoterSignals,
    pub created_at: DateTime<Utc>,
}

/// Every submission, accepted or not; read by the abuse heuristic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteAttempt {
    pub battle_id: Uuid,
    pub signals: VoterSignals,
    pub accepted: bool,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteReceipt {
    pub accepted: bool,
    pub vote_id: Uuid,
    pub votes: super::BattleVotes,
}
