//! PostgreSQL Engagement Store
//!
//! Counters are bumped with `col = col + $n`, lifecycle changes are
//! `UPDATE ... WHERE status = <expected>`, and vote uniqueness is enforced by
//! three partial unique indexes on `battle_votes`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use super::{EngagementStore, ImpressionUpsert};
use crate::error::{unique_violation_constraint, AppError, Result};
use crate::models::{
    Battle, BattleListCursor, BattleResult, BattleSide, BattleStatus, BattleTimeline, BattleVotes,
    CounterDelta, CreatorStats, EngagementCounters, Impression, Item, ItemKind, ItemOrder,
    ItemQuery, RewardSplit, Tab, TabScores, Vote, VoteAttempt, VoteSide, VoteSignal, VoterSignals,
};
use crate::services::scheduler::{TransitionJob, TransitionKind};

const ITEM_COLUMNS: &str = "id, owner_id, region, tribe, kind, battle_id, asset_ref, created_at, \
     duration_ms, views, likes, shares, completions, votes, replays, follows, watch_ms, \
     score_foryou, score_following, score_tribe, score_battles, moderation_flagged";

const BATTLE_COLUMNS: &str = "id, short_code, status, challenger_id, challenger_tribe, \
     challenger_asset, defender_id, defender_tribe, defender_asset, created_at, accepted_at, \
     started_at, ends_at, completed_at, challenger_votes, defender_votes, total_votes, \
     winner_id, is_tie, margin_pct, winner_points, loser_points, velocity, \
     velocity_updated_at, abuse_flag";

const IMPRESSION_COLUMNS: &str = "viewer_id, item_id, session_id, tab, position, watched_ms, \
     completed, replay_count, liked, shared, voted, followed, challenged, first_seen_at, \
     last_seen_at";

#[derive(FromRow)]
struct ItemRow {
    id: Uuid,
    owner_id: Uuid,
    region: String,
    tribe: Option<String>,
    kind: String,
    battle_id: Option<Uuid>,
    asset_ref: String,
    created_at: DateTime<Utc>,
    duration_ms: i64,
    views: i64,
    likes: i64,
    shares: i64,
    completions: i64,
    votes: i64,
    replays: i64,
    follows: i64,
    watch_ms: i64,
    score_foryou: f64,
    score_following: f64,
    score_tribe: f64,
    score_battles: f64,
    moderation_flagged: bool,
}

impl ItemRow {
    fn into_item(self) -> Result<Item> {
        let kind = ItemKind::parse(&self.kind)
            .ok_or_else(|| AppError::Internal(format!("unknown item kind '{}'", self.kind)))?;
        Ok(Item {
            id: self.id,
            owner_id: self.owner_id,
            region: self.region,
            tribe: self.tribe,
            kind,
            battle_id: self.battle_id,
            asset_ref: self.asset_ref,
            created_at: self.created_at,
            duration_ms: self.duration_ms,
            counters: EngagementCounters {
                views: self.views,
                likes: self.likes,
                shares: self.shares,
                completions: self.completions,
                votes: self.votes,
                replays: self.replays,
                follows: self.follows,
                watch_ms: self.watch_ms,
            },
            scores: TabScores {
                foryou: self.score_foryou,
                following: self.score_following,
                tribe: self.score_tribe,
                battles: self.score_battles,
            },
            moderation_flagged: self.moderation_flagged,
        })
    }
}

#[derive(FromRow)]
struct BattleRow {
    id: Uuid,
    short_code: String,
    status: String,
    challenger_id: Uuid,
    challenger_tribe: Option<String>,
    challenger_asset: String,
    defender_id: Option<Uuid>,
    defender_tribe: Option<String>,
    defender_asset: Option<String>,
    created_at: DateTime<Utc>,
    accepted_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    ends_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    challenger_votes: i64,
    defender_votes: i64,
    total_votes: i64,
    winner_id: Option<Uuid>,
    is_tie: Option<bool>,
    margin_pct: Option<f64>,
    winner_points: Option<i64>,
    loser_points: Option<i64>,
    velocity: f64,
    velocity_updated_at: Option<DateTime<Utc>>,
    abuse_flag: Option<String>,
}

impl BattleRow {
    fn into_battle(self) -> Result<Battle> {
        let status = BattleStatus::parse(&self.status)
            .ok_or_else(|| AppError::Internal(format!("unknown battle status '{}'", self.status)))?;

        let defender = match (self.defender_id, self.defender_asset) {
            (Some(user_id), Some(asset_ref)) => Some(BattleSide {
                user_id,
                tribe: self.defender_tribe,
                asset_ref,
            }),
            _ => None,
        };

        let result = match (self.is_tie, self.margin_pct, self.winner_points, self.loser_points) {
            (Some(tie), Some(margin_pct), Some(winner), Some(loser)) => Some(BattleResult {
                winner: self.winner_id,
                tie,
                margin_pct,
                reward: RewardSplit { winner, loser },
            }),
            _ => None,
        };

        Ok(Battle {
            id: self.id,
            short_code: self.short_code,
            status,
            challenger: BattleSide {
                user_id: self.challenger_id,
                tribe: self.challenger_tribe,
                asset_ref: self.challenger_asset,
            },
            defender,
            timeline: BattleTimeline {
                created: self.created_at,
                accepted: self.accepted_at,
                started: self.started_at,
                ends_at: self.ends_at,
                completed_at: self.completed_at,
            },
            votes: BattleVotes {
                challenger: self.challenger_votes,
                defender: self.defender_votes,
                total: self.total_votes,
            },
            result,
            velocity: self.velocity,
            velocity_updated_at: self.velocity_updated_at,
            abuse_flag: self.abuse_flag,
        })
    }
}

#[derive(FromRow)]
struct ImpressionRow {
    viewer_id: Uuid,
    item_id: Uuid,
    session_id: String,
    tab: String,
    position: i32,
    watched_ms: i64,
    completed: bool,
    replay_count: i32,
    liked: bool,
    shared: bool,
    voted: Option<String>,
    followed: bool,
    challenged: bool,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl ImpressionRow {
    fn into_impression(self) -> Result<Impression> {
        let tab = Tab::from_str(&self.tab)
            .map_err(|_| AppError::Internal(format!("unknown tab '{}'", self.tab)))?;
        let voted = self
            .voted
            .as_deref()
            .map(VoteSide::from_str)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(Impression {
            viewer_id: self.viewer_id,
            item_id: self.item_id,
            session_id: self.session_id,
            tab,
            position: self.position,
            watched_ms: self.watched_ms,
            completed: self.completed,
            replay_count: self.replay_count,
            liked: self.liked,
            shared: self.shared,
            voted,
            followed: self.followed,
            challenged: self.challenged,
            first_seen_at: self.first_seen_at,
            last_seen_at: self.last_seen_at,
        })
    }
}

#[derive(FromRow)]
struct VoteAttemptRow {
    battle_id: Uuid,
    user_id: Option<Uuid>,
    fingerprint: Option<String>,
    ip_hash: Option<String>,
    accepted: bool,
    attempted_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct TransitionJobRow {
    battle_id: Uuid,
    kind: String,
    fire_at: DateTime<Utc>,
    attempts: i32,
}

#[derive(FromRow)]
struct CreatorStatsRow {
    creator_id: Uuid,
    battles_won: i64,
    battles_total: i64,
    consistency_score: f64,
    total_views: i64,
}

#[derive(FromRow)]
struct CountersRow {
    owner_id: Uuid,
    views: i64,
    likes: i64,
    shares: i64,
    completions: i64,
    votes: i64,
    replays: i64,
    follows: i64,
    watch_ms: i64,
}

/// Map the violated partial unique index back to the signal it guards
fn vote_signal_for_constraint(constraint: &str) -> Option<VoteSignal> {
    match constraint {
        "battle_votes_user_uniq" => Some(VoteSignal::User),
        "battle_votes_fingerprint_uniq" => Some(VoteSignal::Fingerprint),
        "battle_votes_ip_uniq" => Some(VoteSignal::IpHash),
        _ => None,
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_battle_where(&self, clause: &str, id: Uuid) -> Result<Option<Battle>> {
        let sql = format!("SELECT {} FROM battles WHERE {}", BATTLE_COLUMNS, clause);
        sqlx::query_as::<_, BattleRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(BattleRow::into_battle)
            .transpose()
    }
}

#[async_trait]
impl EngagementStore for PgStore {
    async fn insert_item(&self, item: &Item) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO items (id, owner_id, region, tribe, kind, battle_id, asset_ref,
                               created_at, duration_ms, moderation_flagged)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(item.id)
        .bind(item.owner_id)
        .bind(&item.region)
        .bind(&item.tribe)
        .bind(item.kind.as_str())
        .bind(item.battle_id)
        .bind(&item.asset_ref)
        .bind(item.created_at)
        .bind(item.duration_ms)
        .bind(item.moderation_flagged)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<Item>> {
        let sql = format!("SELECT {} FROM items WHERE id = $1", ITEM_COLUMNS);
        sqlx::query_as::<_, ItemRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ItemRow::into_item)
            .transpose()
    }

    async fn get_items(&self, ids: &[Uuid]) -> Result<Vec<Item>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT {} FROM items WHERE id = ANY($1)", ITEM_COLUMNS);
        let rows = sqlx::query_as::<_, ItemRow>(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;

        let mut by_id: HashMap<Uuid, Item> = HashMap::with_capacity(rows.len());
        for row in rows {
            let item = row.into_item()?;
            by_id.insert(item.id, item);
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn list_items(&self, query: &ItemQuery) -> Result<Vec<Item>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM items WHERE NOT moderation_flagged AND region = ",
            ITEM_COLUMNS
        ));
        qb.push_bind(&query.region);
        qb.push(" AND created_at >= ");
        qb.push_bind(query.since);

        if let Some(kind) = query.kind {
            qb.push(" AND kind = ");
            qb.push_bind(kind.as_str());
        }
        if let Some(tribe) = &query.tribe {
            qb.push(" AND tribe = ");
            qb.push_bind(tribe);
        }
        if let Some(owners) = &query.owners {
            qb.push(" AND owner_id = ANY(");
            qb.push_bind(owners);
            qb.push(")");
        }
        if !query.exclude_owners.is_empty() {
            qb.push(" AND owner_id <> ALL(");
            qb.push_bind(&query.exclude_owners);
            qb.push(")");
        }

        qb.push(match query.order {
            ItemOrder::Newest => " ORDER BY created_at DESC",
            ItemOrder::Engagement => {
                " ORDER BY (likes + shares + votes + completions)::float8 / GREATEST(views, 1) DESC, created_at DESC"
            }
            ItemOrder::Popularity => " ORDER BY views DESC, created_at DESC",
            ItemOrder::LeastExposed => " ORDER BY views ASC, created_at DESC",
        });
        qb.push(" LIMIT ");
        qb.push_bind(query.limit as i64);

        qb.build_query_as::<ItemRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ItemRow::into_item)
            .collect()
    }

    async fn items_for_battles(&self, battle_ids: &[Uuid]) -> Result<Vec<Item>> {
        if battle_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM items WHERE battle_id = ANY($1) AND NOT moderation_flagged",
            ITEM_COLUMNS
        );
        sqlx::query_as::<_, ItemRow>(&sql)
            .bind(battle_ids)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ItemRow::into_item)
            .collect()
    }

    async fn increment_counters(
        &self,
        item_id: Uuid,
        delta: &CounterDelta,
    ) -> Result<EngagementCounters> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, CountersRow>(
            r#"
            UPDATE items
            SET views = views + $2,
                likes = likes + $3,
                shares = shares + $4,
                completions = completions + $5,
                votes = votes + $6,
                replays = replays + $7,
                follows = follows + $8,
                watch_ms = watch_ms + $9
            WHERE id = $1
            RETURNING owner_id, views, likes, shares, completions, votes, replays, follows, watch_ms
            "#,
        )
        .bind(item_id)
        .bind(delta.views)
        .bind(delta.likes)
        .bind(delta.shares)
        .bind(delta.completions)
        .bind(delta.votes)
        .bind(delta.replays)
        .bind(delta.follows)
        .bind(delta.watch_ms)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("item {}", item_id)))?;

        if delta.views != 0 {
            sqlx::query(
                r#"
                INSERT INTO creator_stats (creator_id, total_views)
                VALUES ($1, $2)
                ON CONFLICT (creator_id)
                DO UPDATE SET total_views = creator_stats.total_views + EXCLUDED.total_views
                "#,
            )
            .bind(row.owner_id)
            .bind(delta.views)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(EngagementCounters {
            views: row.views,
            likes: row.likes,
            shares: row.shares,
            completions: row.completions,
            votes: row.votes,
            replays: row.replays,
            follows: row.follows,
            watch_ms: row.watch_ms,
        })
    }

    async fn increment_battle_items(
        &self,
        battle_id: Uuid,
        delta: &CounterDelta,
    ) -> Result<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE items
            SET views = views + $2,
                likes = likes + $3,
                shares = shares + $4,
                completions = completions + $5,
                votes = votes + $6,
                replays = replays + $7,
                follows = follows + $8,
                watch_ms = watch_ms + $9
            WHERE battle_id = $1
            RETURNING id
            "#,
        )
        .bind(battle_id)
        .bind(delta.views)
        .bind(delta.likes)
        .bind(delta.shares)
        .bind(delta.completions)
        .bind(delta.votes)
        .bind(delta.replays)
        .bind(delta.follows)
        .bind(delta.watch_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn update_item_scores(&self, item_id: Uuid, scores: &TabScores) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE items
            SET score_foryou = $2, score_following = $3, score_tribe = $4, score_battles = $5
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(scores.foryou)
        .bind(scores.following)
        .bind(scores.tribe)
        .bind(scores.battles)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("item {}", item_id)));
        }
        Ok(())
    }

    async fn set_item_flagged(&self, item_id: Uuid, flagged: bool) -> Result<()> {
        let result = sqlx::query("UPDATE items SET moderation_flagged = $2 WHERE id = $1")
            .bind(item_id)
            .bind(flagged)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("item {}", item_id)));
        }
        Ok(())
    }

    async fn upsert_impression(
        &self,
        viewer_id: Uuid,
        item_id: Uuid,
        merge: &(dyn for<'m> Fn(Option<&'m Impression>) -> Impression + Send + Sync),
    ) -> Result<ImpressionUpsert> {
        let mut tx = self.pool.begin().await?;

        // Claim the (viewer, item) row first so the merge below runs under its lock
        sqlx::query(
            r#"
            INSERT INTO impressions (viewer_id, item_id, session_id, tab, first_seen_at, last_seen_at)
            VALUES ($1, $2, '', 'foryou', NOW(), NOW())
            ON CONFLICT (viewer_id, item_id) DO NOTHING
            "#,
        )
        .bind(viewer_id)
        .bind(item_id)
        .execute(&mut *tx)
        .await?;

        let sql = format!(
            "SELECT {}, (session_id = '') AS placeholder FROM impressions \
             WHERE viewer_id = $1 AND item_id = $2 FOR UPDATE",
            IMPRESSION_COLUMNS
        );
        let (row, placeholder): (ImpressionRow, bool) = {
            let row = sqlx::query(&sql)
                .bind(viewer_id)
                .bind(item_id)
                .fetch_one(&mut *tx)
                .await?;
            let placeholder: bool = sqlx::Row::try_get(&row, "placeholder")?;
            (ImpressionRow::from_row(&row)?, placeholder)
        };

        let previous = if placeholder {
            None
        } else {
            Some(row.into_impression()?)
        };
        let current = merge(previous.as_ref());

        sqlx::query(
            r#"
            UPDATE impressions
            SET session_id = $3, tab = $4, position = $5, watched_ms = $6, completed = $7,
                replay_count = $8, liked = $9, shared = $10, voted = $11, followed = $12,
                challenged = $13, first_seen_at = $14, last_seen_at = $15
            WHERE viewer_id = $1 AND item_id = $2
            "#,
        )
        .bind(viewer_id)
        .bind(item_id)
        .bind(&current.session_id)
        .bind(current.tab.as_str())
        .bind(current.position)
        .bind(current.watched_ms)
        .bind(current.completed)
        .bind(current.replay_count)
        .bind(current.liked)
        .bind(current.shared)
        .bind(current.voted.map(|v| v.as_str()))
        .bind(current.followed)
        .bind(current.challenged)
        .bind(current.first_seen_at)
        .bind(current.last_seen_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ImpressionUpsert { previous, current })
    }

    async fn recent_impressions(&self, viewer_id: Uuid, limit: usize) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT item_id FROM impressions
            WHERE viewer_id = $1 AND session_id <> ''
            ORDER BY last_seen_at DESC
            LIMIT $2
            "#,
        )
        .bind(viewer_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn creator_stats(&self, creator_ids: &[Uuid]) -> Result<HashMap<Uuid, CreatorStats>> {
        if creator_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, CreatorStatsRow>(
            r#"
            SELECT creator_id, battles_won, battles_total, consistency_score, total_views
            FROM creator_stats
            WHERE creator_id = ANY($1)
            "#,
        )
        .bind(creator_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.creator_id,
                    CreatorStats {
                        battles_won: r.battles_won,
                        battles_total: r.battles_total,
                        consistency_score: r.consistency_score,
                        total_views: r.total_views,
                    },
                )
            })
            .collect())
    }

    async fn record_battle_outcome(
        &self,
        creator_id: Uuid,
        battle_id: Uuid,
        won: bool,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO creator_battle_outcomes (creator_id, battle_id, won)
            VALUES ($1, $2, $3)
            ON CONFLICT (creator_id, battle_id) DO NOTHING
            "#,
        )
        .bind(creator_id)
        .bind(battle_id)
        .bind(won)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO creator_stats (creator_id, battles_total, battles_won)
            VALUES ($1, 1, $2)
            ON CONFLICT (creator_id)
            DO UPDATE SET battles_total = creator_stats.battles_total + 1,
                          battles_won = creator_stats.battles_won + EXCLUDED.battles_won
            "#,
        )
        .bind(creator_id)
        .bind(i64::from(won))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn insert_battle(&self, battle: &Battle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO battles (id, short_code, status, challenger_id, challenger_tribe,
                                 challenger_asset, created_at, ends_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(battle.id)
        .bind(&battle.short_code)
        .bind(battle.status.as_str())
        .bind(battle.challenger.user_id)
        .bind(&battle.challenger.tribe)
        .bind(&battle.challenger.asset_ref)
        .bind(battle.timeline.created)
        .bind(battle.timeline.ends_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn short_code_exists(&self, short_code: &str) -> Result<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM battles WHERE short_code = $1)")
                .bind(short_code)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn get_battle(&self, id: Uuid) -> Result<Option<Battle>> {
        self.fetch_battle_where("id = $1", id).await
    }

    async fn get_battle_by_short_code(&self, short_code: &str) -> Result<Option<Battle>> {
        let sql = format!("SELECT {} FROM battles WHERE short_code = $1", BATTLE_COLUMNS);
        sqlx::query_as::<_, BattleRow>(&sql)
            .bind(short_code)
            .fetch_optional(&self.pool)
            .await?
            .map(BattleRow::into_battle)
            .transpose()
    }

    async fn accept_battle(
        &self,
        id: Uuid,
        defender: &BattleSide,
        now: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<Option<Battle>> {
        let sql = format!(
            r#"
            UPDATE battles
            SET status = 'active', defender_id = $2, defender_tribe = $3, defender_asset = $4,
                accepted_at = $5, started_at = $5, ends_at = $6
            WHERE id = $1 AND status = 'pending' AND ends_at > $5
            RETURNING {}
            "#,
            BATTLE_COLUMNS
        );
        sqlx::query_as::<_, BattleRow>(&sql)
            .bind(id)
            .bind(defender.user_id)
            .bind(&defender.tribe)
            .bind(&defender.asset_ref)
            .bind(now)
            .bind(ends_at)
            .fetch_optional(&self.pool)
            .await?
            .map(BattleRow::into_battle)
            .transpose()
    }

    async fn expire_battle(&self, id: Uuid, _now: DateTime<Utc>) -> Result<Option<Battle>> {
        let sql = format!(
            "UPDATE battles SET status = 'expired' WHERE id = $1 AND status = 'pending' RETURNING {}",
            BATTLE_COLUMNS
        );
        sqlx::query_as::<_, BattleRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(BattleRow::into_battle)
            .transpose()
    }

    async fn complete_battle(
        &self,
        id: Uuid,
        result: &BattleResult,
        now: DateTime<Utc>,
    ) -> Result<Option<Battle>> {
        let sql = format!(
            r#"
            UPDATE battles
            SET status = 'completed', completed_at = $2, winner_id = $3, is_tie = $4,
                margin_pct = $5, winner_points = $6, loser_points = $7
            WHERE id = $1 AND status = 'active'
            RETURNING {}
            "#,
            BATTLE_COLUMNS
        );
        sqlx::query_as::<_, BattleRow>(&sql)
            .bind(id)
            .bind(now)
            .bind(result.winner)
            .bind(result.tie)
            .bind(result.margin_pct)
            .bind(result.reward.winner)
            .bind(result.reward.loser)
            .fetch_optional(&self.pool)
            .await?
            .map(BattleRow::into_battle)
            .transpose()
    }

    async fn list_active_battles(
        &self,
        after: Option<BattleListCursor>,
        limit: usize,
    ) -> Result<Vec<Battle>> {
        let sql = format!(
            r#"
            SELECT {} FROM battles
            WHERE status = 'active'
              AND ($1::timestamptz IS NULL OR (ends_at, id) > ($1, $2))
            ORDER BY ends_at ASC, id ASC
            LIMIT $3
            "#,
            BATTLE_COLUMNS
        );
        sqlx::query_as::<_, BattleRow>(&sql)
            .bind(after.map(|c| c.ends_at))
            .bind(after.map(|c| c.id).unwrap_or_else(Uuid::nil))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(BattleRow::into_battle)
            .collect()
    }

    async fn hot_battles(
        &self,
        now: DateTime<Utc>,
        tau_secs: f64,
        limit: usize,
    ) -> Result<Vec<Battle>> {
        let sql = format!(
            r#"
            SELECT {} FROM battles
            WHERE status = 'active'
            ORDER BY CASE
                    WHEN velocity_updated_at IS NULL OR $2 <= 0 THEN 0
                    ELSE velocity * EXP(
                        -GREATEST(EXTRACT(EPOCH FROM ($1 - velocity_updated_at))::float8, 0) / $2)
                 END DESC,
                 ends_at ASC, id ASC
            LIMIT $3
            "#,
            BATTLE_COLUMNS
        );
        sqlx::query_as::<_, BattleRow>(&sql)
            .bind(now)
            .bind(tau_secs)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(BattleRow::into_battle)
            .collect()
    }

    async fn overdue_battles(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Battle>> {
        let sql = format!(
            r#"
            SELECT {} FROM battles
            WHERE status IN ('pending', 'active') AND ends_at <= $1
            ORDER BY ends_at ASC
            LIMIT $2
            "#,
            BATTLE_COLUMNS
        );
        sqlx::query_as::<_, BattleRow>(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(BattleRow::into_battle)
            .collect()
    }

    async fn flag_battle(&self, id: Uuid, reason: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE battles SET abuse_flag = COALESCE(abuse_flag, $2) WHERE id = $1")
                .bind(id)
                .bind(reason)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("battle {}", id)));
        }
        Ok(())
    }

    async fn insert_vote(&self, vote: &Vote) -> Result<BattleVotes> {
        let mut tx = self.pool.begin().await?;
        let (challenger, defender) = match vote.side {
            VoteSide::Challenger => (1_i64, 0_i64),
            VoteSide::Defender => (0, 1),
        };

        // Tally first: the row lock serializes votes on one battle and the
        // WHERE clause refuses votes outside the window
        let tallies: Option<(i64, i64, i64)> = sqlx::query_as(
            r#"
            UPDATE battles
            SET challenger_votes = challenger_votes + $2,
                defender_votes = defender_votes + $3,
                total_votes = total_votes + 1
            WHERE id = $1 AND status = 'active' AND ends_at > $4
            RETURNING challenger_votes, defender_votes, total_votes
            "#,
        )
        .bind(vote.battle_id)
        .bind(challenger)
        .bind(defender)
        .bind(vote.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((challenger, defender, total)) = tallies else {
            tx.rollback().await?;
            return match self.get_battle(vote.battle_id).await? {
                Some(battle) => Err(AppError::BattleNotVotable(format!(
                    "battle {} is {}",
                    vote.battle_id, battle.status
                ))),
                None => Err(AppError::NotFound(format!("battle {}", vote.battle_id))),
            };
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO battle_votes (id, battle_id, side, user_id, fingerprint, ip_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(vote.id)
        .bind(vote.battle_id)
        .bind(vote.side.as_str())
        .bind(vote.signals.user_id)
        .bind(&vote.signals.fingerprint)
        .bind(&vote.signals.ip_hash)
        .bind(vote.created_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if let Some(constraint) = unique_violation_constraint(&err) {
                tx.rollback().await?;
                let signal = vote_signal_for_constraint(&constraint)
                    .map_or("identity signal", |s| s.as_str());
                return Err(AppError::DuplicateVote(format!(
                    "a vote with the same {} already exists for battle {}",
                    signal, vote.battle_id
                )));
            }
            return Err(err.into());
        }

        tx.commit().await?;
        Ok(BattleVotes {
            challenger,
            defender,
            total,
        })
    }

    async fn record_vote_attempt(&self, attempt: &VoteAttempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vote_attempts (battle_id, user_id, fingerprint, ip_hash, accepted, attempted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(attempt.battle_id)
        .bind(attempt.signals.user_id)
        .bind(&attempt.signals.fingerprint)
        .bind(&attempt.signals.ip_hash)
        .bind(attempt.accepted)
        .bind(attempt.attempted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_vote_attempts(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM vote_attempts WHERE attempted_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn vote_attempts_since(
        &self,
        battle_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<VoteAttempt>> {
        let rows = sqlx::query_as::<_, VoteAttemptRow>(
            r#"
            SELECT battle_id, user_id, fingerprint, ip_hash, accepted, attempted_at
            FROM vote_attempts
            WHERE battle_id = $1 AND attempted_at >= $2
            ORDER BY attempted_at ASC
            "#,
        )
        .bind(battle_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| VoteAttempt {
                battle_id: r.battle_id,
                signals: VoterSignals {
                    user_id: r.user_id,
                    fingerprint: r.fingerprint,
                    ip_hash: r.ip_hash,
                },
                accepted: r.accepted,
                attempted_at: r.attempted_at,
            })
            .collect())
    }

    async fn nudge_velocity(
        &self,
        battle_id: Uuid,
        now: DateTime<Utc>,
        tau_secs: f64,
    ) -> Result<f64> {
        let velocity: Option<(f64,)> = sqlx::query_as(
            r#"
            UPDATE battles
            SET velocity = CASE
                    WHEN velocity_updated_at IS NULL OR $3 <= 0 THEN 0
                    ELSE velocity * EXP(
                        -GREATEST(EXTRACT(EPOCH FROM ($2 - velocity_updated_at))::float8, 0) / $3)
                END + 1,
                velocity_updated_at = $2
            WHERE id = $1
            RETURNING velocity
            "#,
        )
        .bind(battle_id)
        .bind(now)
        .bind(tau_secs)
        .fetch_optional(&self.pool)
        .await?;

        velocity
            .map(|(v,)| v)
            .ok_or_else(|| AppError::NotFound(format!("battle {}", battle_id)))
    }

    async fn save_transition_job(&self, job: &TransitionJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transition_jobs (battle_id, kind, fire_at, attempts)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (battle_id, kind)
            DO UPDATE SET fire_at = EXCLUDED.fire_at, attempts = EXCLUDED.attempts
            "#,
        )
        .bind(job.battle_id)
        .bind(job.kind.as_str())
        .bind(job.fire_at)
        .bind(job.attempts as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_transition_job(&self, job: &TransitionJob) -> Result<()> {
        sqlx::query(
            "DELETE FROM transition_jobs WHERE battle_id = $1 AND kind = $2 AND fire_at = $3",
        )
        .bind(job.battle_id)
        .bind(job.kind.as_str())
        .bind(job.fire_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_transition_jobs(&self) -> Result<Vec<TransitionJob>> {
        let rows = sqlx::query_as::<_, TransitionJobRow>(
            "SELECT battle_id, kind, fire_at, attempts FROM transition_jobs ORDER BY fire_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let kind = TransitionKind::parse(&r.kind).ok_or_else(|| {
                    AppError::Internal(format!("unknown transition kind '{}'", r.kind))
                })?;
                Ok(TransitionJob {
                    battle_id: r.battle_id,
                    kind,
                    fire_at: r.fire_at,
                    attempts: r.attempts.max(0) as u32,
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_constraints_map_to_signals() {
        assert_eq!(
            vote_signal_for_constraint("battle_votes_fingerprint_uniq"),
            Some(VoteSignal::Fingerprint)
        );
        assert_eq!(
            vote_signal_for_constraint("battle_votes_ip_uniq"),
            Some(VoteSignal::IpHash)
        );
        assert_eq!(vote_signal_for_constraint("battles_pkey"), None);
    }
}
