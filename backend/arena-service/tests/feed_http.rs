//! Feed reads and engagement writes over HTTP
//!
//! Coverage:
//! - cursor pagination walks the ranked list without repeats
//! - creator diversity within a page
//! - region scoping, moderation, recently seen items
//! - request validation

#[macro_use]
mod common;

use actix_web::http::StatusCode;
use actix_web::test;
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

use arena_service::db::EngagementStore;
use arena_service::handlers::{REGION_HEADER, USER_ID_HEADER};
use arena_service::jobs::score_refresher::refresh_batch;
use arena_service::models::{Item, ItemKind, NewItem};
use common::{test_app, TestApp};

async fn publish(app: &TestApp, owner_id: Uuid, region: &str) -> Item {
    app.state
        .feed
        .publish_item(NewItem {
            owner_id,
            region: region.to_string(),
            tribe: None,
            kind: ItemKind::Clip,
            battle_id: None,
            asset_ref: format!("renders/{}.mp4", Uuid::new_v4()),
            duration_ms: 15_000,
        })
        .await
        .unwrap()
}

fn feed_request(viewer: Uuid, query: &str) -> test::TestRequest {
    test::TestRequest::get()
        .uri(&format!("/api/v1/feed?{}", query))
        .insert_header((USER_ID_HEADER, viewer.to_string()))
}

fn item_ids(page: &Value) -> Vec<String> {
    page["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["id"].as_str().unwrap().to_string())
        .collect()
}

#[actix_web::test]
async fn test_cursor_pagination_has_no_repeats() {
    let app = test_app();
    let svc = init_service!(app);
    for _ in 0..12 {
        publish(&app, Uuid::new_v4(), "us").await;
    }
    let viewer = Uuid::new_v4();

    let mut seen = Vec::new();
    let mut page_sizes = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let query = match &cursor {
            Some(c) => format!("region=us&limit=5&cursor={}", c),
            None => "region=us&limit=5".to_string(),
        };
        let page: Value =
            test::call_and_read_body_json(&svc, feed_request(viewer, &query).to_request()).await;
        let ids = item_ids(&page);
        page_sizes.push(ids.len());
        seen.extend(ids);

        match page["nextCursor"].as_str() {
            Some(next) => cursor = Some(next.to_string()),
            None => break,
        }
    }

    assert_eq!(page_sizes, vec![5, 5, 2]);
    let unique: HashSet<&String> = seen.iter().collect();
    assert_eq!(unique.len(), 12);
}

#[actix_web::test]
async fn test_one_creator_cannot_flood_a_page() {
    let app = test_app();
    let svc = init_service!(app);
    let heavy = Uuid::new_v4();
    for _ in 0..6 {
        publish(&app, heavy, "us").await;
    }
    for _ in 0..10 {
        publish(&app, Uuid::new_v4(), "us").await;
    }

    let page: Value = test::call_and_read_body_json(
        &svc,
        feed_request(Uuid::new_v4(), "region=us&limit=16").to_request(),
    )
    .await;
    let owners: Vec<String> = page["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["ownerId"].as_str().unwrap().to_string())
        .collect();
    assert!(owners.len() >= 10);

    let heavy = heavy.to_string();
    for window in owners.windows(10) {
        let count = window.iter().filter(|owner| **owner == heavy).count();
        assert!(count <= 2, "creator appeared {} times in one window", count);
    }
}

#[actix_web::test]
async fn test_feed_is_region_scoped() {
    let app = test_app();
    let svc = init_service!(app);
    let local = publish(&app, Uuid::new_v4(), "us").await;
    publish(&app, Uuid::new_v4(), "eu").await;

    // Region header is used when the query omits it
    let req = feed_request(Uuid::new_v4(), "tab=foryou")
        .insert_header((REGION_HEADER, "us"))
        .to_request();
    let page: Value = test::call_and_read_body_json(&svc, req).await;
    assert_eq!(item_ids(&page), vec![local.id.to_string()]);
    assert!(page["nextCursor"].is_null());
}

#[actix_web::test]
async fn test_flagged_item_leaves_the_feed() {
    let app = test_app();
    let svc = init_service!(app);
    let keep = publish(&app, Uuid::new_v4(), "us").await;
    let flagged = publish(&app, Uuid::new_v4(), "us").await;

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/items/{}/moderation", flagged.id))
        .set_json(json!({ "flagged": true }))
        .to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::NO_CONTENT);

    let page: Value = test::call_and_read_body_json(
        &svc,
        feed_request(Uuid::new_v4(), "region=us").to_request(),
    )
    .await;
    assert_eq!(item_ids(&page), vec![keep.id.to_string()]);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/items/{}/moderation", Uuid::new_v4()))
        .set_json(json!({ "flagged": true }))
        .to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_impressions_update_counters_and_hide_seen_items() {
    let app = test_app();
    let svc = init_service!(app);
    let watched = publish(&app, Uuid::new_v4(), "us").await;
    let fresh = publish(&app, Uuid::new_v4(), "us").await;
    let viewer = Uuid::new_v4();

    let impression = json!({
        "sessionId": "session-1",
        "tab": "foryou",
        "position": 0,
        "watchedMs": 9000,
        "completed": true,
        "liked": true,
    });
    for _ in 0..2 {
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/items/{}/impressions", watched.id))
            .insert_header((USER_ID_HEADER, viewer.to_string()))
            .set_json(&impression)
            .to_request();
        let resp = test::call_service(&svc, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    // Sticky flags count once per viewer; watch time accumulates
    let item = app.state.store.get_item(watched.id).await.unwrap().unwrap();
    assert_eq!(item.counters.views, 1);
    assert_eq!(item.counters.likes, 1);
    assert_eq!(item.counters.completions, 1);
    assert_eq!(item.counters.watch_ms, 18_000);

    let page: Value =
        test::call_and_read_body_json(&svc, feed_request(viewer, "region=us").to_request()).await;
    assert_eq!(item_ids(&page), vec![fresh.id.to_string()]);

    let other: Value = test::call_and_read_body_json(
        &svc,
        feed_request(Uuid::new_v4(), "region=us").to_request(),
    )
    .await;
    assert_eq!(item_ids(&other).len(), 2);
}

#[actix_web::test]
async fn test_impression_validation() {
    let app = test_app();
    let svc = init_service!(app);
    let item = publish(&app, Uuid::new_v4(), "us").await;
    let body = json!({ "sessionId": "s", "tab": "foryou" });

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/items/{}/impressions", item.id))
        .set_json(&body)
        .to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/items/{}/impressions", Uuid::new_v4()))
        .insert_header((USER_ID_HEADER, Uuid::new_v4().to_string()))
        .set_json(&body)
        .to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/items/{}/impressions", item.id))
        .insert_header((USER_ID_HEADER, Uuid::new_v4().to_string()))
        .set_json(json!({ "sessionId": " ", "tab": "foryou" }))
        .to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_feed_request_validation() {
    let app = test_app();
    let svc = init_service!(app);
    let viewer = Uuid::new_v4();

    let cases = [
        feed_request(viewer, "tab=foryou").to_request(),
        feed_request(viewer, "region=us&tab=trending").to_request(),
        feed_request(viewer, "region=us&cursor=not-a-cursor").to_request(),
        test::TestRequest::get()
            .uri("/api/v1/feed?region=us")
            .to_request(),
    ];
    for req in cases {
        assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::BAD_REQUEST);
    }
}

#[actix_web::test]
async fn test_publish_validation() {
    let app = test_app();
    let svc = init_service!(app);

    let mut missing_asset = common::clip(Uuid::new_v4(), "us");
    missing_asset["assetRef"] = json!("");
    let mut bad_duration = common::clip(Uuid::new_v4(), "us");
    bad_duration["durationMs"] = json!(0);
    let mut clip_without_battle = common::clip(Uuid::new_v4(), "us");
    clip_without_battle["kind"] = json!("battle_clip");

    for body in [missing_asset, bad_duration, clip_without_battle] {
        let req = test::TestRequest::post()
            .uri("/api/v1/items")
            .set_json(body)
            .to_request();
        assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::BAD_REQUEST);
    }

    let req = test::TestRequest::post()
        .uri("/api/v1/items")
        .set_json(common::clip(Uuid::new_v4(), "us"))
        .to_request();
    let resp = test::call_service(&svc, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let item: Value = test::read_body_json(resp).await;
    assert_eq!(item["kind"], "clip");
    assert_eq!(item["counters"]["views"], 0);
}

#[actix_web::test]
async fn test_health_reports_dependencies() {
    let app = test_app();
    let svc = init_service!(app);

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&svc, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::get().uri("/metrics").to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::OK);
}

#[actix_web::test]
async fn test_engagement_requests_score_refresh() {
    let mut app = test_app();
    let svc = init_service!(app);
    let item = publish(&app, Uuid::new_v4(), "us").await;

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/items/{}/impressions", item.id))
        .insert_header((USER_ID_HEADER, Uuid::new_v4().to_string()))
        .set_json(json!({ "sessionId": "s", "tab": "foryou", "completed": true, "shared": true }))
        .to_request();
    assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::OK);

    // Publish and the impression both queued the item; one batch covers both
    let mut queued = HashSet::new();
    while let Ok(item_id) = app.recompute_rx.try_recv() {
        queued.insert(item_id);
    }
    assert_eq!(queued, HashSet::from([item.id]));

    let refreshed = refresh_batch(&app.state.ranking, queued).await;
    assert_eq!(refreshed, 1);

    let stored = app.state.store.get_item(item.id).await.unwrap().unwrap();
    assert!(stored.scores.foryou > 0.0);
    assert!(stored.scores.foryou <= 1.0);
}

#[actix_web::test]
async fn test_oversized_watch_time_is_clamped() {
    let app = test_app();
    let svc = init_service!(app);
    let item = publish(&app, Uuid::new_v4(), "us").await;
    let viewer = Uuid::new_v4();

    for watched in [i64::MAX, 1] {
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/items/{}/impressions", item.id))
            .insert_header((USER_ID_HEADER, viewer.to_string()))
            .set_json(json!({ "sessionId": "s", "tab": "foryou", "watchedMs": watched }))
            .to_request();
        assert_eq!(test::call_service(&svc, req).await.status(), StatusCode::OK);
    }

    // 10 x the 15s clip, plus the 1ms follow-up
    let stored = app.state.store.get_item(item.id).await.unwrap().unwrap();
    assert_eq!(stored.counters.watch_ms, 150_001);
    assert_eq!(stored.counters.views, 1);
}
