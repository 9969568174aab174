use std::collections::HashSet;
use uuid::Uuid;

use crate::models::RankedItem;

/// Diversity Layer - greedy page fill over an already-ranked list
///
/// An item is kept only if its creator appears fewer than
/// `max_per_creator` times among the previous `window - 1` kept items, and
/// the viewer has not seen it recently. Order of the ranked list is
/// preserved; nothing is re-scored here.
pub struct DiversityLayer {
    window: usize,
    max_per_creator: usize,
}

/// Result of one page walk
#[derive(Debug, Clone, PartialEq)]
pub struct DiversePage {
    pub items: Vec<RankedItem>,
    /// True when candidates remain after the last scanned position
    pub has_more: bool,
}

impl DiversityLayer {
    pub fn new() -> Self {
        Self {
            window: 10,
            max_per_creator: 2,
        }
    }

    /// Create with custom window and per-creator cap
    pub fn with_creator_limit(window: usize, max_per_creator: usize) -> Self {
        Self {
            window: window.max(1),
            max_per_creator: max_per_creator.max(1),
        }
    }

    /// Walk `ranked[start..]` and keep up to `limit` items
    pub fn select(
        &self,
        ranked: &[RankedItem],
        start: usize,
        recently_seen: &HashSet<Uuid>,
        limit: usize,
    ) -> DiversePage {
        let mut kept: Vec<RankedItem> = Vec::with_capacity(limit);
        let mut scanned = start;

        for candidate in ranked.iter().skip(start) {
            if kept.len() >= limit {
                break;
            }
            scanned += 1;

            if recently_seen.contains(&candidate.item_id) {
                continue;
            }
            if self.violates_creator_cap(&kept, candidate) {
                continue;
            }
            kept.push(candidate.clone());
        }

        DiversePage {
            items: kept,
            has_more: scanned < ranked.len(),
        }
    }

    fn violates_creator_cap(&self, kept: &[RankedItem], candidate: &RankedItem) -> bool {
        let recent = kept
            .iter()
            .rev()
            .take(self.window - 1)
            .filter(|item| item.owner_id == candidate.owner_id)
            .count();
        recent >= self.max_per_creator
    }
}

impl Default for DiversityLayer {
    fn default() -> Self {
        Self::new()
    }
}
