//! Shared harness: in-memory backends with a settable clock

#![allow(dead_code)]

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use arena_service::cache::MemoryScoreCache;
use arena_service::clients::{LogEventSink, MemoryAssetModeration, MemoryFollowGraph};
use arena_service::clock::ManualClock;
use arena_service::db::MemoryStore;
use arena_service::models::Battle;
use arena_service::{AppState, Backends, Config};

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub events: Arc<LogEventSink>,
    pub moderation: Arc<MemoryAssetModeration>,
    pub follows: Arc<MemoryFollowGraph>,
    /// Held so recompute requests are queued instead of dropped
    pub recompute_rx: UnboundedReceiver<Uuid>,
}

pub fn test_app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let events = Arc::new(LogEventSink::new());
    let moderation = Arc::new(MemoryAssetModeration::new());
    let follows = Arc::new(MemoryFollowGraph::new());

    let backends = Backends {
        store: store.clone(),
        cache: Arc::new(MemoryScoreCache::new()),
        follows: follows.clone(),
        moderation: moderation.clone(),
        notifications: events.clone(),
        rewards: events.clone(),
        clock: clock.clone(),
    };
    let (state, recompute_rx) = AppState::build(Config::default(), backends);

    TestApp {
        state,
        store,
        clock,
        events,
        moderation,
        follows,
        recompute_rx,
    }
}

/// Pending challenge created through the service layer
pub async fn pending_battle(app: &TestApp) -> Battle {
    app.state
        .battles
        .create(Uuid::new_v4(), Some("neon".into()), "renders/challenger.mp4".into())
        .await
        .unwrap()
}

/// Accepted battle, open for votes for one phase
pub async fn active_battle(app: &TestApp) -> Battle {
    let battle = pending_battle(app).await;
    app.state
        .battles
        .accept(battle.id, Uuid::new_v4(), Some("volt".into()), "renders/defender.mp4".into())
        .await
        .unwrap()
}

pub fn clip(owner_id: Uuid, region: &str) -> Value {
    json!({
        "ownerId": owner_id,
        "region": region,
        "assetRef": format!("renders/{}.mp4", Uuid::new_v4()),
        "durationMs": 15000,
    })
}

pub fn entry(asset_ref: &str) -> Value {
    json!({ "assetRef": asset_ref })
}

pub fn vote_request(
    battle_id: Uuid,
    user_id: Option<Uuid>,
    fingerprint: Option<&str>,
    ip: Option<&str>,
    choice: &str,
) -> actix_web::test::TestRequest {
    use arena_service::handlers::{FINGERPRINT_HEADER, USER_ID_HEADER};

    let mut req = actix_web::test::TestRequest::post()
        .uri(&format!("/api/v1/battles/{}/votes", battle_id))
        .set_json(json!({ "choice": choice }));
    if let Some(user_id) = user_id {
        req = req.insert_header((USER_ID_HEADER, user_id.to_string()));
    }
    if let Some(fingerprint) = fingerprint {
        req = req.insert_header((FINGERPRINT_HEADER, fingerprint.to_string()));
    }
    if let Some(ip) = ip {
        req = req.insert_header(("x-forwarded-for", ip.to_string()));
    }
    req
}

/// Build the actix test service over a [`TestApp`]
macro_rules! init_service {
    ($app:expr) => {
        actix_web::test::init_service(
            actix_web::App::new()
                .app_data(actix_web::web::Data::new($app.state.clone()))
                .configure(arena_service::handlers::configure),
        )
        .await
    };
}
