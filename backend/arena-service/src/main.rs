use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arena_service::cache::{MemoryScoreCache, RedisScoreCache, ScoreCache};
use arena_service::clients::{
    AssetModeration, FollowGraph, KafkaEventPublisher, LogEventSink, MemoryAssetModeration,
    MemoryFollowGraph, NotificationSink, PgAssetModeration, PgFollowGraph, RewardLedger,
};
use arena_service::clock::SystemClock;
use arena_service::db::{EngagementStore, MemoryStore, PgStore};
use arena_service::{handlers, AppState, Backends, Config};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true)
                .with_target(true),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Starting arena-service v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.app.env);

    let backends = build_backends(&config).await?;
    let (state, recompute_rx) = AppState::build(config.clone(), backends);
    state
        .start_workers(recompute_rx)
        .await
        .context("Failed to start background workers")?;

    let bind_addr = format!("{}:{}", config.app.host, config.app.port);
    tracing::info!("HTTP server listening on {}", bind_addr);

    let data = web::Data::new(state);
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(middleware::Logger::default())
            .configure(handlers::configure)
    })
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {}", bind_addr))?
    .run()
    .await?;

    tracing::info!("arena-service stopped");
    Ok(())
}

async fn build_backends(config: &Config) -> anyhow::Result<Backends> {
    let (store, follows, moderation): (
        Arc<dyn EngagementStore>,
        Arc<dyn FollowGraph>,
        Arc<dyn AssetModeration>,
    ) = match config.database.url.as_deref() {
        Some(url) => {
            let store = PgStore::connect(url, config.database.max_connections)
                .await
                .context("Failed to connect to Postgres")?;
            sqlx::migrate!("./migrations")
                .run(store.pool())
                .await
                .context("Failed to run migrations")?;
            tracing::info!("Postgres engagement store ready");
            let pool = store.pool().clone();
            (
                Arc::new(store),
                Arc::new(PgFollowGraph::new(pool.clone())),
                Arc::new(PgAssetModeration::new(pool)),
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            (
                Arc::new(MemoryStore::new()),
                Arc::new(MemoryFollowGraph::new()),
                Arc::new(MemoryAssetModeration::new()),
            )
        }
    };

    let cache: Arc<dyn ScoreCache> = match config.redis.url.as_deref() {
        Some(url) => {
            let cache = RedisScoreCache::connect(url)
                .await
                .context("Failed to connect to Redis")?;
            tracing::info!("Redis score cache ready");
            Arc::new(cache)
        }
        None => {
            tracing::warn!("REDIS_URL not set, using the in-memory score cache");
            Arc::new(MemoryScoreCache::new())
        }
    };

    let (notifications, rewards): (Arc<dyn NotificationSink>, Arc<dyn RewardLedger>) =
        match config.kafka.brokers.as_deref() {
            Some(brokers) => {
                let publisher = Arc::new(
                    KafkaEventPublisher::new(
                        brokers,
                        &config.kafka.notification_topic,
                        &config.kafka.reward_topic,
                    )
                    .context("Failed to create Kafka producer")?,
                );
                (publisher.clone(), publisher)
            }
            None => {
                tracing::warn!("KAFKA_BROKERS not set, events are only logged");
                let sink = Arc::new(LogEventSink::new());
                (sink.clone(), sink)
            }
        };

    Ok(Backends {
        store,
        cache,
        follows,
        moderation,
        notifications,
        rewards,
        clock: Arc::new(SystemClock),
    })
}
