//! Battle lifecycle over HTTP
//!
//! Coverage:
//! - challenge, accept, lookup by short code, active listing
//! - close through the lifecycle sweeper with rewards and result
//! - expiry of unaccepted challenges
//! - ties, rejected assets, double accepts

#[macro_use]
mod common;

use actix_web::http::StatusCode;
use actix_web::test;
use chrono::Duration;
use serde_json::Value;
use uuid::Uuid;

use arena_service::clients::NotificationKind;
use arena_service::handlers::{TRIBE_HEADER, USER_ID_HEADER};
use arena_service::jobs::sweep_once;
use arena_service::models::BattleStatus;
use common::{active_battle, entry, pending_battle, test_app, vote_request};

#[actix_web::test]
async fn test_challenge_accept_vote_and_close() {
    let app = test_app();
    let svc = init_service!(app);
    let challenger = Uuid::new_v4();
    let defender = Uuid::new_v4();

    let req = test::TestRequest::post()
        .uri("/api/v1/battles")
        .insert_header((USER_ID_HEADER, challenger.to_string()))
        .insert_header((TRIBE_HEADER, "neon"))
        .set_json(entry("renders/a.mp4"))
        .to_request();
    let resp = test::call_service(&svc, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = test::read_body_json(resp).await;
    assert_eq!(created["status"], "pending");
    assert_eq!(created["challenger"]["tribe"], "neon");
    let battle_id: Uuid = created["id"].as_str().unwrap().parse().unwrap();
    let short_code = created["shortCode"].as_str().unwrap().to_string();

    // Challenger cannot accept their own battle
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/battles/{}/accept", battle_id))
        .insert_header((USER_ID_HEADER, challenger.to_string()))
        .set_json(entry("renders/a2.mp4"))
        .to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/battles/{}/accept", battle_id))
        .insert_header((USER_ID_HEADER, defender.to_string()))
        .insert_header((TRIBE_HEADER, "volt"))
        .set_json(entry("renders/b.mp4"))
        .to_request();
    let resp = test::call_service(&svc, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let accepted: Value = test::read_body_json(resp).await;
    assert_eq!(accepted["status"], "active");
    assert_eq!(accepted["defender"]["userId"], defender.to_string());

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/battles/{}", short_code))
        .to_request();
    let fetched: Value = test::call_and_read_body_json(&svc, req).await;
    assert_eq!(fetched["id"], battle_id.to_string());

    let req = test::TestRequest::get()
        .uri("/api/v1/battles/active?limit=10")
        .to_request();
    let page: Value = test::call_and_read_body_json(&svc, req).await;
    assert_eq!(page["battles"].as_array().unwrap().len(), 1);
    assert!(page["nextCursor"].is_null());

    for (i, choice) in ["challenger", "challenger", "defender"].iter().enumerate() {
        let fingerprint = format!("device-{}", i);
        let ip = format!("203.0.113.{}", i + 1);
        let req = vote_request(
            battle_id,
            Some(Uuid::new_v4()),
            Some(&fingerprint),
            Some(&ip),
            choice,
        )
        .to_request();
        assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::OK);
    }

    // Nothing is due yet
    let applied = sweep_once(app.store.as_ref(), &app.state.battles, app.clock.as_ref())
        .await
        .unwrap();
    assert_eq!(applied, 0);

    app.clock.advance(Duration::hours(24) + Duration::seconds(1));
    let applied = sweep_once(app.store.as_ref(), &app.state.battles, app.clock.as_ref())
        .await
        .unwrap();
    assert_eq!(applied, 1);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/battles/{}", short_code))
        .to_request();
    let closed: Value = test::call_and_read_body_json(&svc, req).await;
    assert_eq!(closed["status"], "completed");
    assert_eq!(closed["votes"]["challenger"], 2);
    assert_eq!(closed["votes"]["defender"], 1);
    assert_eq!(closed["result"]["winner"], challenger.to_string());
    assert_eq!(closed["result"]["tie"], false);
    let margin = closed["result"]["marginPct"].as_f64().unwrap();
    assert!((margin - 66.7).abs() < 1e-9);

    let grants = app.events.grants();
    assert_eq!(grants.len(), 2);
    let winner = grants.iter().find(|g| g.user_id == challenger).unwrap();
    assert_eq!((winner.points, winner.outcome.as_str()), (100, "won"));
    let loser = grants.iter().find(|g| g.user_id == defender).unwrap();
    assert_eq!((loser.points, loser.outcome.as_str()), (25, "lost"));
    assert_eq!(loser.tribe.as_deref(), Some("volt"));

    let result_notifications = app
        .events
        .notifications()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::BattleResult)
        .count();
    assert_eq!(result_notifications, 2);

    // Closed battles take no votes and the next sweep has nothing to do
    let req = vote_request(battle_id, Some(Uuid::new_v4()), None, None, "defender").to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::BAD_REQUEST);
    let applied = sweep_once(app.store.as_ref(), &app.state.battles, app.clock.as_ref())
        .await
        .unwrap();
    assert_eq!(applied, 0);
    assert_eq!(app.events.grants().len(), 2);
}

#[actix_web::test]
async fn test_unaccepted_challenge_expires() {
    let app = test_app();
    let svc = init_service!(app);
    let battle = pending_battle(&app).await;

    app.clock.advance(Duration::hours(24));
    let applied = sweep_once(app.store.as_ref(), &app.state.battles, app.clock.as_ref())
        .await
        .unwrap();
    assert_eq!(applied, 1);

    let expired = app.state.battles.get(battle.id).await.unwrap();
    assert_eq!(expired.status, BattleStatus::Expired);
    assert!(expired.result.is_none());
    assert!(app
        .events
        .notifications()
        .iter()
        .any(|n| n.kind == NotificationKind::BattleExpired && n.battle_id == battle.id));

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/battles/{}/accept", battle.id))
        .insert_header((USER_ID_HEADER, Uuid::new_v4().to_string()))
        .set_json(entry("renders/late.mp4"))
        .to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::CONFLICT);

    // A transition firing again is a no-op
    let outcome = app.state.battles.expire(battle.id).await.unwrap();
    assert_eq!(outcome.as_str(), "skipped");
}

#[actix_web::test]
async fn test_battle_without_votes_is_a_tie() {
    let app = test_app();
    let battle = active_battle(&app).await;

    app.clock.advance(Duration::hours(25));
    let applied = sweep_once(app.store.as_ref(), &app.state.battles, app.clock.as_ref())
        .await
        .unwrap();
    assert_eq!(applied, 1);

    let closed = app.state.battles.get(battle.id).await.unwrap();
    let result = closed.result.unwrap();
    assert!(result.tie);
    assert_eq!(result.winner, None);
    assert_eq!(result.margin_pct, 0.0);

    let grants = app.events.grants();
    assert_eq!(grants.len(), 2);
    assert!(grants.iter().all(|g| g.points == 50 && g.outcome == "tie"));
}

#[actix_web::test]
async fn test_second_accept_conflicts() {
    let app = test_app();
    let svc = init_service!(app);
    let battle = active_battle(&app).await;

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/battles/{}/accept", battle.id))
        .insert_header((USER_ID_HEADER, Uuid::new_v4().to_string()))
        .set_json(entry("renders/c.mp4"))
        .to_request();
    let resp = test::call_service(&svc, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "conflict");
}

#[actix_web::test]
async fn test_unapproved_asset_is_rejected() {
    let app = test_app();
    let svc = init_service!(app);
    app.moderation.reject("renders/blocked.mp4");

    let req = test::TestRequest::post()
        .uri("/api/v1/battles")
        .insert_header((USER_ID_HEADER, Uuid::new_v4().to_string()))
        .set_json(entry("renders/blocked.mp4"))
        .to_request();
    let resp = test::call_service(&svc, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "validation_error");

    let req = test::TestRequest::post()
        .uri("/api/v1/battles")
        .set_json(entry("renders/ok.mp4"))
        .to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_unknown_short_code_is_not_found() {
    let app = test_app();
    let svc = init_service!(app);

    let req = test::TestRequest::get()
        .uri("/api/v1/battles/ZZZZZZ")
        .to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_battle_clip_links_to_battle() {
    let app = test_app();
    let svc = init_service!(app);
    let battle = active_battle(&app).await;
    let owner = battle.challenger.user_id;

    let mut body = common::clip(owner, "us");
    body["battleId"] = serde_json::json!(battle.id);
    let req = test::TestRequest::post()
        .uri("/api/v1/items")
        .set_json(body)
        .to_request();
    let resp = test::call_service(&svc, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let item: Value = test::read_body_json(resp).await;
    assert_eq!(item["kind"], "battle_clip");
    assert_eq!(item["battleId"], battle.id.to_string());

    let mut body = common::clip(owner, "us");
    body["battleId"] = serde_json::json!(Uuid::new_v4());
    let req = test::TestRequest::post()
        .uri("/api/v1/items")
        .set_json(body)
        .to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::NOT_FOUND);
}
