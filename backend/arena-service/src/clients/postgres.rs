use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashSet;
use uuid::Uuid;

use super::{AssetModeration, FollowGraph};
use crate::error::Result;

/// Follow edges written by the social side of the platform
#[derive(Clone)]
pub struct PgFollowGraph {
    pool: PgPool,
}

impl PgFollowGraph {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FollowGraph for PgFollowGraph {
    async fn following(&self, user_id: Uuid) -> Result<HashSet<Uuid>> {
        let rows: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT following_id
            FROM follows
            WHERE follower_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }
}

/// Moderation status of rendered transformations
#[derive(Clone)]
pub struct PgAssetModeration {
    pool: PgPool,
}

impl PgAssetModeration {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssetModeration for PgAssetModeration {
    async fn is_approved(&self, user_id: Uuid, asset_ref: &str) -> Result<bool> {
        let approved: Option<bool> = sqlx::query_scalar(
            r#"
            SELECT moderation_status = 'approved'
            FROM transformations
            WHERE user_id = $1 AND asset_ref = $2
            "#,
        )
        .bind(user_id)
        .bind(asset_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(approved.unwrap_or(false))
    }
}
