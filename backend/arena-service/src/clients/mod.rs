//! Outbound collaborators
//!
//! The engine consumes identity-adjacent data (follow graph, moderation
//! status) and emits fire-and-forget events (notifications, reward triggers).
//! Each seam is a trait; production wiring uses Postgres and Kafka, local
//! development uses the in-memory and log-only implementations below.

pub mod kafka;
pub mod postgres;

pub use kafka::KafkaEventPublisher;
pub use postgres::{PgAssetModeration, PgFollowGraph};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use crate::error::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FollowGraph: Send + Sync {
    /// Creators the user follows
    async fn following(&self, user_id: Uuid) -> Result<HashSet<Uuid>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetModeration: Send + Sync {
    /// Whether the rendered asset passed moderation and belongs to the user
    async fn is_approved(&self, user_id: Uuid, asset_ref: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BattleAccepted,
    BattleExpired,
    BattleResult,
    AbuseFlagged,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationKind::BattleAccepted => "battle_accepted",
            NotificationKind::BattleExpired => "battle_expired",
            NotificationKind::BattleResult => "battle_result",
            NotificationKind::AbuseFlagged => "abuse_flagged",
        };
        f.write_str(s)
    }
}

/// Delivery request for the notification sink
///
/// `user_id` is `None` for moderation-facing events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub kind: NotificationKind,
    pub battle_id: Uuid,
    pub short_code: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        user_id: Option<Uuid>,
        kind: NotificationKind,
        battle_id: Uuid,
        short_code: &str,
        data: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            battle_id,
            short_code: short_code.to_string(),
            data,
            created_at,
        }
    }
}

/// Tribe points owed to one participant of a closed battle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardGrant {
    pub battle_id: Uuid,
    pub user_id: Uuid,
    pub tribe: Option<String>,
    pub points: i64,
    pub outcome: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RewardLedger: Send + Sync {
    async fn grant(&self, grant: &RewardGrant) -> Result<()>;
}

// ============================================================================
// In-memory / log-only implementations
// ============================================================================

#[derive(Default)]
pub struct MemoryFollowGraph {
    edges: DashMap<Uuid, HashSet<Uuid>>,
}

impl MemoryFollowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn follow(&self, follower: Uuid, creator: Uuid) {
        self.edges.entry(follower).or_default().insert(creator);
    }
}

#[async_trait]
impl FollowGraph for MemoryFollowGraph {
    async fn following(&self, user_id: Uuid) -> Result<HashSet<Uuid>> {
        Ok(self
            .edges
            .get(&user_id)
            .map(|set| set.clone())
            .unwrap_or_default())
    }
}

/// Approves every asset unless it was explicitly rejected
#[derive(Default)]
pub struct MemoryAssetModeration {
    rejected: DashSet<String>,
}

impl MemoryAssetModeration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, asset_ref: &str) {
        self.rejected.insert(asset_ref.to_string());
    }
}

#[async_trait]
impl AssetModeration for MemoryAssetModeration {
    async fn is_approved(&self, _user_id: Uuid, asset_ref: &str) -> Result<bool> {
        Ok(!asset_ref.trim().is_empty() && !self.rejected.contains(asset_ref))
    }
}

/// Logs every event and keeps a copy for inspection
#[derive(Default)]
pub struct LogEventSink {
    notifications: Mutex<Vec<Notification>>,
    grants: Mutex<Vec<RewardGrant>>,
}

impl LogEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn grants(&self) -> Vec<RewardGrant> {
        self.grants.lock().clone()
    }
}

#[async_trait]
impl NotificationSink for LogEventSink {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        tracing::info!(
            battle_id = %notification.battle_id,
            kind = %notification.kind,
            user_id = ?notification.user_id,
            "Notification emitted"
        );
        self.notifications.lock().push(notification.clone());
        Ok(())
    }
}

#[async_trait]
impl RewardLedger for LogEventSink {
    async fn grant(&self, grant: &RewardGrant) -> Result<()> {
        tracing::info!(
            battle_id = %grant.battle_id,
            user_id = %grant.user_id,
            points = grant.points,
            "Reward granted"
        );
        self.grants.lock().push(grant.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_follow_graph() {
        let graph = MemoryFollowGraph::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        graph.follow(a, b);
        assert!(graph.following(a).await.unwrap().contains(&b));
        assert!(graph.following(b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_assets_are_not_approved() {
        let moderation = MemoryAssetModeration::new();
        moderation.reject("bad.png");
        let user = Uuid::new_v4();
        assert!(!moderation.is_approved(user, "bad.png").await.unwrap());
        assert!(!moderation.is_approved(user, " ").await.unwrap());
        assert!(moderation.is_approved(user, "good.png").await.unwrap());
    }
}
