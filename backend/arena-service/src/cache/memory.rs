use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::ScoreCache;
use crate::error::Result;
use crate::models::{RankedItem, ScoreEntry, Tab};

/// Process-local Score Cache for development and tests
#[derive(Default)]
pub struct MemoryScoreCache {
    entries: DashMap<(Tab, Uuid), ScoreEntry>,
    /// (region, tab) -> item -> score
    index: DashMap<(String, Tab), HashMap<Uuid, f64>>,
    ranked: DashMap<(Uuid, Tab), (Instant, Vec<RankedItem>)>,
}

impl MemoryScoreCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every memoized ranked list (tests)
    pub fn clear_ranked(&self) {
        self.ranked.clear();
    }
}

fn sorted_desc(scores: &HashMap<Uuid, f64>) -> Vec<(Uuid, f64)> {
    let mut ordered: Vec<(Uuid, f64)> = scores.iter().map(|(id, s)| (*id, *s)).collect();
    ordered.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    ordered
}

#[async_trait]
impl ScoreCache for MemoryScoreCache {
    async fn get_entries(&self, tab: Tab, item_ids: &[Uuid]) -> Result<HashMap<Uuid, ScoreEntry>> {
        Ok(item_ids
            .iter()
            .filter_map(|id| self.entries.get(&(tab, *id)).map(|e| (*id, e.clone())))
            .collect())
    }

    async fn put_entry(&self, region: &str, entry: &ScoreEntry, capacity: usize) -> Result<()> {
        self.entries.insert((entry.tab, entry.item_id), entry.clone());

        let mut index = self.index.entry((region.to_string(), entry.tab)).or_default();
        index.insert(entry.item_id, entry.score);
        if index.len() > capacity {
            let evicted: Vec<Uuid> = sorted_desc(&index)
                .into_iter()
                .skip(capacity)
                .map(|(id, _)| id)
                .collect();
            for id in evicted {
                index.remove(&id);
            }
        }
        Ok(())
    }

    async fn top(&self, region: &str, tab: Tab, limit: usize) -> Result<Vec<(Uuid, f64)>> {
        let Some(index) = self.index.get(&(region.to_string(), tab)) else {
            return Ok(Vec::new());
        };
        let mut ordered = sorted_desc(&index);
        ordered.truncate(limit);
        Ok(ordered)
    }

    async fn remove_item(&self, region: &str, item_id: Uuid) -> Result<()> {
        for tab in Tab::ALL {
            self.entries.remove(&(tab, item_id));
            if let Some(mut index) = self.index.get_mut(&(region.to_string(), tab)) {
                index.remove(&item_id);
            }
        }
        Ok(())
    }

    async fn get_ranked(&self, viewer_id: Uuid, tab: Tab) -> Result<Option<Vec<RankedItem>>> {
        let key = (viewer_id, tab);
        let expired = match self.ranked.get(&key) {
            Some(slot) if slot.0 > Instant::now() => return Ok(Some(slot.1.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.ranked.remove(&key);
        }
        Ok(None)
    }

    async fn put_ranked(
        &self,
        viewer_id: Uuid,
        tab: Tab,
        ranked: &[RankedItem],
        ttl_secs: u64,
    ) -> Result<()> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        self.ranked
            .insert((viewer_id, tab), (expires_at, ranked.to_vec()));
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
