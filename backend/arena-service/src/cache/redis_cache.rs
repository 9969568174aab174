//! Redis-backed Score Cache
//!
//! Keys:
//! - arena:scores:{region}:{tab} -> sorted set item_id -> score
//! - arena:score:{tab}:{item_id} -> serialized ScoreEntry
//! - arena:ranked:{viewer_id}:{tab} -> serialized ranked list (SETEX)

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{entry_key, index_key, ranked_key, ScoreCache};
use crate::error::{AppError, Result};
use crate::models::{RankedItem, ScoreEntry, Tab};

/// Score entries outlive several refresh cycles but do not pile up forever
const ENTRY_TTL_SECS: u64 = 24 * 3600;

#[derive(Clone)]
pub struct RedisScoreCache {
    conn: ConnectionManager,
}

impl RedisScoreCache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::Internal(format!("Failed to create Redis client: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ScoreCache for RedisScoreCache {
    async fn get_entries(&self, tab: Tab, item_ids: &[Uuid]) -> Result<HashMap<Uuid, ScoreEntry>> {
        if item_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let keys: Vec<String> = item_ids.iter().map(|id| entry_key(tab, *id)).collect();
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut found = HashMap::with_capacity(item_ids.len());
        for (id, value) in item_ids.iter().zip(values) {
            let Some(json) = value else { continue };
            match serde_json::from_str::<ScoreEntry>(&json) {
                Ok(entry) => {
                    found.insert(*id, entry);
                }
                Err(e) => warn!(item_id = %id, tab = %tab, "Dropping unreadable score entry: {}", e),
            }
        }

        debug!(tab = %tab, hits = found.len(), requested = item_ids.len(), "Score cache lookup");
        Ok(found)
    }

    async fn put_entry(&self, region: &str, entry: &ScoreEntry, capacity: usize) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        let index = index_key(region, entry.tab);
        let keep = capacity.max(1) as isize;
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .cmd("SETEX")
            .arg(entry_key(entry.tab, entry.item_id))
            .arg(ENTRY_TTL_SECS)
            .arg(json)
            .ignore()
            .cmd("ZADD")
            .arg(&index)
            .arg(entry.score)
            .arg(entry.item_id.to_string())
            .ignore()
            .cmd("ZREMRANGEBYRANK")
            .arg(&index)
            .arg(0)
            .arg(-(keep + 1))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn top(&self, region: &str, tab: Tab, limit: usize) -> Result<Vec<(Uuid, f64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<(String, f64)> = conn
            .zrevrange_withscores(index_key(region, tab), 0, (limit - 1) as isize)
            .await?;

        Ok(raw
            .into_iter()
            .filter_map(|(id, score)| Uuid::parse_str(&id).ok().map(|id| (id, score)))
            .collect())
    }

    async fn remove_item(&self, region: &str, item_id: Uuid) -> Result<()> {
        let mut pipe = redis::pipe();
        for tab in Tab::ALL {
            pipe.cmd("ZREM")
                .arg(index_key(region, tab))
                .arg(item_id.to_string())
                .ignore()
                .cmd("DEL")
                .arg(entry_key(tab, item_id))
                .ignore();
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn get_ranked(&self, viewer_id: Uuid, tab: Tab) -> Result<Option<Vec<RankedItem>>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(ranked_key(viewer_id, tab)).await?;
        match value {
            Some(json) => {
                debug!(viewer_id = %viewer_id, tab = %tab, "Ranked list cache hit");
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn put_ranked(
        &self,
        viewer_id: Uuid,
        tab: Tab,
        ranked: &[RankedItem],
        ttl_secs: u64,
    ) -> Result<()> {
        let json = serde_json::to_string(ranked)?;
        let mut conn = self.conn.clone();
        redis::cmd("SETEX")
            .arg(ranked_key(viewer_id, tab))
            .arg(ttl_secs.max(1))
            .arg(json)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }
}
