//! Vote endpoint: uniqueness per identity signal and status mapping

#[macro_use]
mod common;

use actix_web::http::StatusCode;
use actix_web::test;
use chrono::Duration;
use serde_json::Value;
use uuid::Uuid;

use arena_service::clock::Clock;
use arena_service::db::EngagementStore;
use arena_service::jobs::prune_attempts;
use common::{active_battle, pending_battle, test_app, vote_request};

#[actix_web::test]
async fn test_accepted_vote_returns_tally() {
    let app = test_app();
    let svc = init_service!(app);
    let battle = active_battle(&app).await;

    let req = vote_request(
        battle.id,
        Some(Uuid::new_v4()),
        Some("device-a"),
        Some("198.51.100.1"),
        "defender",
    )
    .to_request();
    let resp = test::call_service(&svc, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["accepted"], true);
    assert_eq!(body["votes"]["defender"], 1);
    assert_eq!(body["votes"]["challenger"], 0);
    assert_eq!(body["votes"]["total"], 1);
}

#[actix_web::test]
async fn test_same_user_votes_once() {
    let app = test_app();
    let svc = init_service!(app);
    let battle = active_battle(&app).await;
    let voter = Uuid::new_v4();

    let req = vote_request(battle.id, Some(voter), None, None, "challenger").to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::OK);

    let req = vote_request(battle.id, Some(voter), None, None, "defender").to_request();
    let resp = test::call_service(&svc, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "duplicate_vote");

    let stored = app.state.battles.get(battle.id).await.unwrap();
    assert_eq!(stored.votes.total, 1);
    assert_eq!(stored.votes.challenger, 1);
}

#[actix_web::test]
async fn test_one_user_rotating_fingerprints_counts_once() {
    let app = test_app();
    let svc = init_service!(app);
    let battle = active_battle(&app).await;
    let voter = Uuid::new_v4();

    let mut statuses = Vec::new();
    for fingerprint in ["fp-1", "fp-2", "fp-3"] {
        let req =
            vote_request(battle.id, Some(voter), Some(fingerprint), None, "challenger").to_request();
        statuses.push(test::call_service(&svc, req).await.status());
    }

    assert_eq!(
        statuses,
        vec![StatusCode::OK, StatusCode::CONFLICT, StatusCode::CONFLICT]
    );
    assert_eq!(app.store.vote_count(battle.id), 1);
}

#[actix_web::test]
async fn test_shared_fingerprint_or_ip_is_a_duplicate() {
    let app = test_app();
    let svc = init_service!(app);
    let battle = active_battle(&app).await;

    let req = vote_request(
        battle.id,
        Some(Uuid::new_v4()),
        Some("shared-device"),
        Some("192.0.2.10"),
        "challenger",
    )
    .to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::OK);

    // Another account on the same device
    let req = vote_request(
        battle.id,
        Some(Uuid::new_v4()),
        Some("shared-device"),
        Some("192.0.2.11"),
        "defender",
    )
    .to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::CONFLICT);

    // Anonymous voter behind the same address
    let req = vote_request(battle.id, None, Some("other-device"), Some("192.0.2.10"), "defender")
        .to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::CONFLICT);

    assert_eq!(app.store.vote_count(battle.id), 1);
}

#[actix_web::test]
async fn test_pending_and_ended_battles_are_not_votable() {
    let app = test_app();
    let svc = init_service!(app);

    let pending = pending_battle(&app).await;
    let req = vote_request(pending.id, Some(Uuid::new_v4()), None, None, "challenger").to_request();
    let resp = test::call_service(&svc, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "battle_not_votable");

    // Past ends_at but not yet closed
    let active = active_battle(&app).await;
    app.clock.advance(Duration::hours(24));
    let req = vote_request(active.id, Some(Uuid::new_v4()), None, None, "defender").to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.store.vote_count(active.id), 0);
}

#[actix_web::test]
async fn test_unknown_battle_and_bad_choice() {
    let app = test_app();
    let svc = init_service!(app);

    let req = vote_request(Uuid::new_v4(), Some(Uuid::new_v4()), None, None, "challenger")
        .to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::NOT_FOUND);

    let battle = active_battle(&app).await;
    let req = vote_request(battle.id, Some(Uuid::new_v4()), None, None, "both").to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_attempt_log_is_trimmed_to_review_window() {
    let app = test_app();
    let svc = init_service!(app);
    let battle = active_battle(&app).await;
    let voter = Uuid::new_v4();

    for choice in ["challenger", "defender"] {
        let req = vote_request(battle.id, Some(voter), None, None, choice).to_request();
        test::call_service(&svc, req).await;
    }
    let since = app.clock.now() - Duration::hours(1);
    assert_eq!(app.store.vote_attempts_since(battle.id, since).await.unwrap().len(), 2);

    app.clock.advance(Duration::minutes(10));
    let window = Duration::seconds(app.state.config.votes.abuse_window_secs);
    let removed = prune_attempts(app.store.as_ref(), app.clock.as_ref(), window)
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert!(app.store.vote_attempts_since(battle.id, since).await.unwrap().is_empty());

    // Committed votes are untouched
    assert_eq!(app.store.vote_count(battle.id), 1);
}
