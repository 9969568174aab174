//! Score Cache
//!
//! Memoized ranking output, never a source of truth:
//! - `entry`: per (item, tab) score entry with the factors behind it
//! - `index`: per (region, tab) sorted item -> score set, bounded in size
//! - `ranked`: per (viewer, tab) ranked list backing cursor pagination
//!
//! Everything here can be dropped and rebuilt from the Engagement Store.

pub mod memory;
pub mod redis_cache;

pub use self::memory::MemoryScoreCache;
pub use self::redis_cache::RedisScoreCache;

use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{RankedItem, ScoreEntry, Tab};

#[async_trait]
pub trait ScoreCache: Send + Sync {
    /// Cached entries for the given items on one tab; misses are absent from the map
    async fn get_entries(&self, tab: Tab, item_ids: &[Uuid]) -> Result<HashMap<Uuid, ScoreEntry>>;

    /// Store the entry and upsert it into the (region, tab) index,
    /// evicting the lowest scores beyond `capacity`
    async fn put_entry(&self, region: &str, entry: &ScoreEntry, capacity: usize) -> Result<()>;

    /// Highest scored items of the (region, tab) index, best first
    async fn top(&self, region: &str, tab: Tab, limit: usize) -> Result<Vec<(Uuid, f64)>>;

    /// Drop an item from every tab (moderation)
    async fn remove_item(&self, region: &str, item_id: Uuid) -> Result<()>;

    async fn get_ranked(&self, viewer_id: Uuid, tab: Tab) -> Result<Option<Vec<RankedItem>>>;

    async fn put_ranked(
        &self,
        viewer_id: Uuid,
        tab: Tab,
        ranked: &[RankedItem],
        ttl_secs: u64,
    ) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

pub(crate) fn index_key(region: &str, tab: Tab) -> String {
    format!("arena:scores:{}:{}", region, tab)
}

pub(crate) fn entry_key(tab: Tab, item_id: Uuid) -> String {
    format!("arena:score:{}:{}", tab, item_id)
}

pub(crate) fn ranked_key(viewer_id: Uuid, tab: Tab) -> String {
    format!("arena:ranked:{}:{}", viewer_id, tab)
}
