use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Process-wide configuration; loaded once at startup and shared behind an `Arc`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub ranking: RankingConfig,
    pub battle: BattleConfig,
    pub votes: VoteConfig,
    pub scheduler: SchedulerConfig,
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub env: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// In-memory store when unset
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// In-memory score cache when unset
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Log-only sinks when unset
    pub brokers: Option<String>,
    pub notification_topic: String,
    pub reward_topic: String,
}

/// Factor weights of the weighted sum
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FactorWeights {
    pub completion_rate: f64,
    pub avg_watch_ratio: f64,
    pub replay_rate: f64,
    pub share_rate: f64,
    pub vote_rate: f64,
    pub follow_rate: f64,
    pub creator_quality: f64,
    pub freshness: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            completion_rate: 0.30,
            avg_watch_ratio: 0.20,
            replay_rate: 0.10,
            share_rate: 0.15,
            vote_rate: 0.10,
            follow_rate: 0.05,
            creator_quality: 0.05,
            freshness: 0.05,
        }
    }
}

/// Share of the `foryou` candidate pool per source
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolMix {
    pub fresh: f64,
    pub trending: f64,
    pub tribe: f64,
    pub exploration: f64,
}

impl Default for PoolMix {
    fn default() -> Self {
        Self {
            fresh: 0.30,
            trending: 0.30,
            tribe: 0.20,
            exploration: 0.20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    pub weights: FactorWeights,
    pub tribe_multiplier: f64,
    pub following_multiplier: f64,
    pub battle_multiplier: f64,
    /// Max additive boost for battle clips on the battles tab, reached at
    /// `velocity_saturation_per_minute` votes per minute
    pub velocity_boost: f64,
    pub velocity_saturation_per_minute: f64,
    pub freshness_boost: f64,
    pub freshness_boost_hours: f64,
    pub freshness_decay_hours: f64,
    pub fresh_window_hours: i64,
    pub trending_window_days: i64,
    pub pool_size: usize,
    pub pool_mix: PoolMix,
    pub exploration_max_creator_views: i64,
    /// Cached score entries older than this are refreshed in the background
    pub score_ttl_secs: i64,
    /// Ranked lists memoized per (viewer, tab) for cursor pagination
    pub ranked_list_ttl_secs: u64,
    /// Max entries kept per (region, tab) index
    pub index_capacity: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            weights: FactorWeights::default(),
            tribe_multiplier: 1.2,
            following_multiplier: 1.1,
            battle_multiplier: 1.3,
            velocity_boost: 0.15,
            velocity_saturation_per_minute: 6.0,
            freshness_boost: 0.1,
            freshness_boost_hours: 48.0,
            freshness_decay_hours: 168.0,
            fresh_window_hours: 48,
            trending_window_days: 7,
            pool_size: 200,
            pool_mix: PoolMix::default(),
            exploration_max_creator_views: 1000,
            score_ttl_secs: 300,
            ranked_list_ttl_secs: 300,
            index_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleConfig {
    pub phase_hours: i64,
    pub winner_points: i64,
    pub loser_points: i64,
    pub tie_points: i64,
    pub short_code_length: usize,
    pub short_code_attempts: u32,
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self {
            phase_hours: 24,
            winner_points: 100,
            loser_points: 25,
            tie_points: 50,
            short_code_length: 6,
            short_code_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteConfig {
    pub abuse_window_secs: i64,
    /// Flag when one IP hash produced more than this many votes
    pub max_votes_per_ip: usize,
    /// Flag when one IP hash carried more than this many fingerprints
    pub max_fingerprints_per_ip: usize,
    /// Flag when one IP hash carried more than this many authenticated users
    pub max_users_per_ip: usize,
    pub velocity_tau_secs: f64,
    pub ip_hash_salt: String,
}

impl Default for VoteConfig {
    fn default() -> Self {
        Self {
            abuse_window_secs: 300,
            max_votes_per_ip: 5,
            max_fingerprints_per_ip: 3,
            max_users_per_ip: 2,
            velocity_tau_secs: 300.0,
            ip_hash_salt: "arena-dev-salt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            sweep_interval_secs: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn retry_config(&self) -> resilience::RetryConfig {
        resilience::RetryConfig {
            max_retries: self.max_attempts.saturating_sub(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    pub diversity_window: usize,
    pub max_per_creator: usize,
    pub recent_impressions: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_limit: 50,
            diversity_window: 10,
            max_per_creator: 2,
            recent_impressions: 50,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig {
                env: "development".to_string(),
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 10,
            },
            redis: RedisConfig { url: None },
            kafka: KafkaConfig {
                brokers: None,
                notification_topic: "arena.notifications".to_string(),
                reward_topic: "arena.rewards".to_string(),
            },
            ranking: RankingConfig::default(),
            battle: BattleConfig::default(),
            votes: VoteConfig::default(),
            scheduler: SchedulerConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();
        let ranking = &defaults.ranking;
        let weights = &ranking.weights;

        Ok(Config {
            app: AppConfig {
                env: env_string("APP_ENV", &defaults.app.env),
                host: env_string("APP_HOST", &defaults.app.host),
                port: env_parse("APP_PORT", defaults.app.port)?,
            },
            database: DatabaseConfig {
                url: env_optional("DATABASE_URL"),
                max_connections: env_parse(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
            },
            redis: RedisConfig {
                url: env_optional("REDIS_URL"),
            },
            kafka: KafkaConfig {
                brokers: env_optional("KAFKA_BROKERS"),
                notification_topic: env_string(
                    "KAFKA_NOTIFICATION_TOPIC",
                    &defaults.kafka.notification_topic,
                ),
                reward_topic: env_string("KAFKA_REWARD_TOPIC", &defaults.kafka.reward_topic),
            },
            ranking: RankingConfig {
                weights: FactorWeights {
                    completion_rate: env_parse("RANK_W_COMPLETION", weights.completion_rate)?,
                    avg_watch_ratio: env_parse("RANK_W_WATCH", weights.avg_watch_ratio)?,
                    replay_rate: env_parse("RANK_W_REPLAY", weights.replay_rate)?,
                    share_rate: env_parse("RANK_W_SHARE", weights.share_rate)?,
                    vote_rate: env_parse("RANK_W_VOTE", weights.vote_rate)?,
                    follow_rate: env_parse("RANK_W_FOLLOW", weights.follow_rate)?,
                    creator_quality: env_parse("RANK_W_CREATOR", weights.creator_quality)?,
                    freshness: env_parse("RANK_W_FRESHNESS", weights.freshness)?,
                },
                tribe_multiplier: env_parse("RANK_TRIBE_MULTIPLIER", ranking.tribe_multiplier)?,
                following_multiplier: env_parse(
                    "RANK_FOLLOWING_MULTIPLIER",
                    ranking.following_multiplier,
                )?,
                battle_multiplier: env_parse("RANK_BATTLE_MULTIPLIER", ranking.battle_multiplier)?,
                velocity_boost: env_parse("RANK_VELOCITY_BOOST", ranking.velocity_boost)?,
                velocity_saturation_per_minute: env_parse(
                    "RANK_VELOCITY_SATURATION",
                    ranking.velocity_saturation_per_minute,
                )?,
                freshness_boost: env_parse("RANK_FRESHNESS_BOOST", ranking.freshness_boost)?,
                freshness_boost_hours: ranking.freshness_boost_hours,
                freshness_decay_hours: ranking.freshness_decay_hours,
                fresh_window_hours: env_parse("RANK_FRESH_WINDOW_HOURS", ranking.fresh_window_hours)?,
                trending_window_days: env_parse(
                    "RANK_TRENDING_WINDOW_DAYS",
                    ranking.trending_window_days,
                )?,
                pool_size: env_parse("RANK_POOL_SIZE", ranking.pool_size)?,
                pool_mix: ranking.pool_mix,
                exploration_max_creator_views: env_parse(
                    "RANK_EXPLORATION_MAX_VIEWS",
                    ranking.exploration_max_creator_views,
                )?,
                score_ttl_secs: env_parse("SCORE_TTL_SECS", ranking.score_ttl_secs)?,
                ranked_list_ttl_secs: env_parse(
                    "RANKED_LIST_TTL_SECS",
                    ranking.ranked_list_ttl_secs,
                )?,
                index_capacity: env_parse("SCORE_INDEX_CAPACITY", ranking.index_capacity)?,
            },
            battle: BattleConfig {
                phase_hours: env_parse("BATTLE_PHASE_HOURS", defaults.battle.phase_hours)?,
                winner_points: env_parse("BATTLE_WINNER_POINTS", defaults.battle.winner_points)?,
                loser_points: env_parse("BATTLE_LOSER_POINTS", defaults.battle.loser_points)?,
                tie_points: env_parse("BATTLE_TIE_POINTS", defaults.battle.tie_points)?,
                short_code_length: defaults.battle.short_code_length,
                short_code_attempts: defaults.battle.short_code_attempts,
            },
            votes: VoteConfig {
                abuse_window_secs: env_parse(
                    "VOTE_ABUSE_WINDOW_SECS",
                    defaults.votes.abuse_window_secs,
                )?,
                max_votes_per_ip: env_parse("VOTE_MAX_PER_IP", defaults.votes.max_votes_per_ip)?,
                max_fingerprints_per_ip: env_parse(
                    "VOTE_MAX_FINGERPRINTS_PER_IP",
                    defaults.votes.max_fingerprints_per_ip,
                )?,
                max_users_per_ip: env_parse(
                    "VOTE_MAX_USERS_PER_IP",
                    defaults.votes.max_users_per_ip,
                )?,
                velocity_tau_secs: env_parse(
                    "VOTE_VELOCITY_TAU_SECS",
                    defaults.votes.velocity_tau_secs,
                )?,
                ip_hash_salt: env_string("VOTE_IP_HASH_SALT", &defaults.votes.ip_hash_salt),
            },
            scheduler: SchedulerConfig {
                max_attempts: env_parse(
                    "SCHEDULER_MAX_ATTEMPTS",
                    defaults.scheduler.max_attempts,
                )?,
                initial_backoff_ms: env_parse(
                    "SCHEDULER_INITIAL_BACKOFF_MS",
                    defaults.scheduler.initial_backoff_ms,
                )?,
                max_backoff_ms: env_parse(
                    "SCHEDULER_MAX_BACKOFF_MS",
                    defaults.scheduler.max_backoff_ms,
                )?,
                sweep_interval_secs: env_parse(
                    "SCHEDULER_SWEEP_INTERVAL_SECS",
                    defaults.scheduler.sweep_interval_secs,
                )?,
            },
            feed: FeedConfig {
                default_limit: env_parse("FEED_DEFAULT_LIMIT", defaults.feed.default_limit)?,
                max_limit: defaults.feed.max_limit,
                diversity_window: defaults.feed.diversity_window,
                max_per_creator: defaults.feed.max_per_creator,
                recent_impressions: env_parse(
                    "FEED_RECENT_IMPRESSIONS",
                    defaults.feed.recent_impressions,
                )?,
            },
        })
    }

    pub fn is_production(&self) -> bool {
        matches!(self.app.env.as_str(), "production" | "staging")
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
