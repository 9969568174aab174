use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{FactorWeights, RankingConfig};
use crate::models::{
    CreatorStats, EngagementCounters, Item, ItemKind, ScoreEntry, ScoreFactors, Tab,
    ViewerContext,
};

/// Multi-factor scorer
///
/// Produces the non-personalized entry that goes into the Score Cache and
/// applies the viewer-dependent multipliers at request time.
#[derive(Debug, Clone)]
pub struct Scorer {
    weights: FactorWeights,
    tribe_multiplier: f64,
    following_multiplier: f64,
    battle_multiplier: f64,
    velocity_boost: f64,
    velocity_saturation_per_minute: f64,
    freshness_boost: f64,
    freshness_boost_hours: f64,
    freshness_decay_hours: f64,
}

impl Scorer {
    pub fn new(config: &RankingConfig) -> Self {
        Self {
            weights: config.weights,
            tribe_multiplier: config.tribe_multiplier,
            following_multiplier: config.following_multiplier,
            battle_multiplier: config.battle_multiplier,
            velocity_boost: config.velocity_boost,
            velocity_saturation_per_minute: config.velocity_saturation_per_minute,
            freshness_boost: config.freshness_boost,
            freshness_boost_hours: config.freshness_boost_hours,
            freshness_decay_hours: config.freshness_decay_hours,
        }
    }

    /// Normalized factors for one item
    pub fn factors(&self, item: &Item, creator: &CreatorStats, now: DateTime<Utc>) -> ScoreFactors {
        let c: &EngagementCounters = &item.counters;
        let avg_watch_ratio = if c.views > 0 && item.duration_ms > 0 {
            (c.watch_ms as f64 / c.views as f64) / item.duration_ms as f64
        } else {
            0.0
        };

        ScoreFactors {
            completion_rate: rate(c.completions, c.views),
            avg_watch_ratio: clamp01(avg_watch_ratio),
            replay_rate: rate(c.replays, c.views),
            share_rate: rate(c.shares, c.views),
            vote_rate: rate(c.votes, c.views),
            follow_rate: rate(c.follows, c.views),
            creator_quality: creator_quality(creator),
            freshness: linear_decay(age_hours(item.created_at, now), self.freshness_decay_hours),
        }
    }

    pub fn weighted_sum(&self, f: &ScoreFactors) -> f64 {
        let w = &self.weights;
        f.completion_rate * w.completion_rate
            + f.avg_watch_ratio * w.avg_watch_ratio
            + f.replay_rate * w.replay_rate
            + f.share_rate * w.share_rate
            + f.vote_rate * w.vote_rate
            + f.follow_rate * w.follow_rate
            + f.creator_quality * w.creator_quality
            + f.freshness * w.freshness
    }

    /// Multiplier that depends only on the content and the tab
    pub fn content_multiplier(&self, tab: Tab, kind: ItemKind) -> f64 {
        match (tab, kind) {
            (Tab::Battles, ItemKind::BattleClip) => self.battle_multiplier,
            _ => 1.0,
        }
    }

    /// Multiplier that depends on who is looking
    pub fn viewer_multiplier(
        &self,
        tab: Tab,
        owner_id: Uuid,
        tribe: Option<&str>,
        viewer: &ViewerContext,
    ) -> f64 {
        match tab {
            Tab::Tribe => match (tribe, viewer.tribe.as_deref()) {
                (Some(item_tribe), Some(viewer_tribe)) if item_tribe == viewer_tribe => {
                    self.tribe_multiplier
                }
                _ => 1.0,
            },
            Tab::Following if viewer.following.contains(&owner_id) => self.following_multiplier,
            _ => 1.0,
        }
    }

    /// Additive boost for very new content, outside the weighted sum
    pub fn freshness_boost(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        self.freshness_boost * linear_decay(age_hours(created_at, now), self.freshness_boost_hours)
    }

    /// Cacheable score for (item, tab)
    pub fn score_entry(
        &self,
        item: &Item,
        creator: &CreatorStats,
        tab: Tab,
        now: DateTime<Utc>,
    ) -> ScoreEntry {
        let factors = self.factors(item, creator, now);
        let weighted = self.weighted_sum(&factors);
        let score = clamp01(
            weighted * self.content_multiplier(tab, item.kind)
                + self.freshness_boost(item.created_at, now),
        );

        ScoreEntry {
            item_id: item.id,
            tab,
            owner_id: item.owner_id,
            tribe: item.tribe.clone(),
            kind: item.kind,
            item_created_at: item.created_at,
            weighted,
            score,
            factors,
            computed_at: now,
        }
    }

    /// Additive boost for battle clips on the battles tab, linear in votes per
    /// minute up to the saturation rate
    pub fn velocity_boost(&self, tab: Tab, kind: ItemKind, votes_per_minute: f64) -> f64 {
        if tab != Tab::Battles || kind != ItemKind::BattleClip {
            return 0.0;
        }
        if self.velocity_saturation_per_minute <= 0.0 || !votes_per_minute.is_finite() {
            return 0.0;
        }
        self.velocity_boost * clamp01(votes_per_minute / self.velocity_saturation_per_minute)
    }

    /// Final score of a cached entry for one viewer
    ///
    /// `votes_per_minute` is the live rate of the clip's battle (zero for
    /// other items); it changes too fast to be cached with the entry.
    pub fn personalize(
        &self,
        entry: &ScoreEntry,
        viewer: &ViewerContext,
        votes_per_minute: f64,
        now: DateTime<Utc>,
    ) -> f64 {
        let multiplier = self.content_multiplier(entry.tab, entry.kind)
            * self.viewer_multiplier(entry.tab, entry.owner_id, entry.tribe.as_deref(), viewer);
        clamp01(
            entry.weighted * multiplier
                + self.freshness_boost(entry.item_created_at, now)
                + self.velocity_boost(entry.tab, entry.kind, votes_per_minute),
        )
    }
}

/// `0.4 * winRate + 0.3 * consistency + 0.3 * min(totalViews / 1000, 1)`
pub fn creator_quality(stats: &CreatorStats) -> f64 {
    let reach = (stats.total_views.max(0) as f64 / 1000.0).min(1.0);
    clamp01(0.4 * stats.win_rate() + 0.3 * clamp01(stats.consistency_score) + 0.3 * reach)
}

fn rate(count: i64, views: i64) -> f64 {
    if views <= 0 {
        return 0.0;
    }
    clamp01(count as f64 / views as f64)
}

fn age_hours(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - created_at).num_seconds().max(0) as f64 / 3600.0
}

fn linear_decay(age_hours: f64, horizon_hours: f64) -> f64 {
    if horizon_hours <= 0.0 {
        return 0.0;
    }
    (1.0 - age_hours / horizon_hours).max(0.0)
}

fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TabScores;
    use chrono::Duration;
    use std::collections::HashSet;

    fn item(counters: EngagementCounters, created_at: DateTime<Utc>) -> Item {
        Item {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            region: "us".into(),
            tribe: Some("neon".into()),
            kind: ItemKind::Clip,
            battle_id: None,
            asset_ref: "asset".into(),
            created_at,
            duration_ms: 10_000,
            counters,
            scores: TabScores::default(),
            moderation_flagged: false,
        }
    }

    fn viewer(tribe: Option<&str>, following: &[Uuid]) -> ViewerContext {
        ViewerContext {
            user_id: Uuid::new_v4(),
            region: "us".into(),
            tribe: tribe.map(String::from),
            following: following.iter().copied().collect::<HashSet<_>>(),
        }
    }

    fn scorer() -> Scorer {
        Scorer::new(&RankingConfig::default())
    }

    #[test]
    fn test_perfect_item_beats_zero_item_of_same_age() {
        let now = Utc::now();
        let created = now - Duration::hours(10);
        let perfect = item(
            EngagementCounters {
                views: 100,
                likes: 100,
                shares: 100,
                completions: 100,
                votes: 100,
                replays: 100,
                follows: 100,
                watch_ms: 100 * 10_000,
            },
            created,
        );
        let zero = item(EngagementCounters::default(), created);
        let best = CreatorStats {
            battles_won: 10,
            battles_total: 10,
            consistency_score: 1.0,
            total_views: 5_000,
        };

        let s = scorer();
        for tab in Tab::ALL {
            let high = s.score_entry(&perfect, &best, tab, now).score;
            let low = s.score_entry(&zero, &CreatorStats::default(), tab, now).score;
            assert!(high > low, "tab {}", tab);
            assert!((0.0..=1.0).contains(&high));
            assert!((0.0..=1.0).contains(&low));
        }
    }

    #[test]
    fn test_score_is_clamped_with_multiplier_and_boost() {
        let now = Utc::now();
        let mut clip = item(
            EngagementCounters {
                views: 1,
                likes: 1,
                shares: 1,
                completions: 1,
                votes: 1,
                replays: 1,
                follows: 1,
                watch_ms: 10_000,
            },
            now,
        );
        clip.kind = ItemKind::BattleClip;
        let stats = CreatorStats {
            battles_won: 1,
            battles_total: 1,
            consistency_score: 1.0,
            total_views: 1_000,
        };
        let entry = scorer().score_entry(&clip, &stats, Tab::Battles, now);
        assert!((entry.weighted - 1.0).abs() < 1e-9);
        assert_eq!(entry.score, 1.0);
    }

    #[test]
    fn test_creator_quality_formula() {
        let stats = CreatorStats {
            battles_won: 1,
            battles_total: 2,
            consistency_score: 0.5,
            total_views: 500,
        };
        let expected = 0.4 * 0.5 + 0.3 * 0.5 + 0.3 * 0.5;
        assert!((creator_quality(&stats) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_freshness_boost_vanishes_after_two_days() {
        let now = Utc::now();
        let s = scorer();
        assert!((s.freshness_boost(now, now) - 0.1).abs() < 1e-9);
        assert!((s.freshness_boost(now - Duration::hours(24), now) - 0.05).abs() < 1e-9);
        assert_eq!(s.freshness_boost(now - Duration::hours(49), now), 0.0);
    }

    #[test]
    fn test_viewer_multipliers_only_apply_on_their_tab() {
        let now = Utc::now() - Duration::days(3);
        let clip = item(
            EngagementCounters {
                views: 10,
                completions: 5,
                ..Default::default()
            },
            now,
        );
        let s = scorer();
        let stats = CreatorStats::default();
        let tribe_entry = s.score_entry(&clip, &stats, Tab::Tribe, Utc::now());
        let foryou_entry = s.score_entry(&clip, &stats, Tab::ForYou, Utc::now());
        let member = viewer(Some("neon"), &[]);
        let outsider = viewer(Some("retro"), &[]);

        let boosted = s.personalize(&tribe_entry, &member, 0.0, Utc::now());
        let plain = s.personalize(&tribe_entry, &outsider, 0.0, Utc::now());
        assert!((boosted - plain * 1.2).abs() < 1e-9);
        assert_eq!(
            s.personalize(&foryou_entry, &member, 0.0, Utc::now()),
            s.personalize(&foryou_entry, &outsider, 0.0, Utc::now())
        );

        let following_entry = s.score_entry(&clip, &stats, Tab::Following, Utc::now());
        let fan = viewer(None, &[clip.owner_id]);
        let stranger = viewer(None, &[]);
        assert!(
            s.personalize(&following_entry, &fan, 0.0, Utc::now())
                > s.personalize(&following_entry, &stranger, 0.0, Utc::now())
        );
    }

    #[test]
    fn test_velocity_boost_only_lifts_battle_clips_on_battles_tab() {
        let now = Utc::now();
        let mut clip = item(
            EngagementCounters {
                views: 10,
                votes: 2,
                ..Default::default()
            },
            now - Duration::days(3),
        );
        clip.kind = ItemKind::BattleClip;
        let s = scorer();
        let stats = CreatorStats::default();
        let entry = s.score_entry(&clip, &stats, Tab::Battles, now);
        let v = viewer(None, &[]);

        let cold = s.personalize(&entry, &v, 0.0, now);
        let warm = s.personalize(&entry, &v, 3.0, now);
        let hot = s.personalize(&entry, &v, 60.0, now);
        assert!((warm - cold - 0.075).abs() < 1e-9);
        assert!((hot - cold - 0.15).abs() < 1e-9);

        let foryou = s.score_entry(&clip, &stats, Tab::ForYou, now);
        assert_eq!(
            s.personalize(&foryou, &v, 60.0, now),
            s.personalize(&foryou, &v, 0.0, now)
        );
        assert_eq!(s.velocity_boost(Tab::Battles, ItemKind::Clip, 60.0), 0.0);
    }

    #[test]
    fn test_zero_views_yield_zero_rates() {
        let now = Utc::now();
        let f = scorer().factors(&item(EngagementCounters::default(), now), &CreatorStats::default(), now);
        assert_eq!(f.completion_rate, 0.0);
        assert_eq!(f.avg_watch_ratio, 0.0);
        assert_eq!(f.freshness, 1.0);
    }
}
