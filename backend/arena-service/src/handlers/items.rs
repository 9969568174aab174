use actix_web::{post, web, HttpRequest, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

use super::{retry_write, Identity};
use crate::error::Result;
use crate::models::{ImpressionEvent, NewItem};
use crate::state::AppState;

/// POST /api/v1/items
///
/// Publishing hook for the content pipeline.
#[post("/items")]
pub async fn publish_item(
    state: web::Data<AppState>,
    body: web::Json<NewItem>,
) -> Result<HttpResponse> {
    let new_item = body.into_inner();
    let item = retry_write(&state, || state.feed.publish_item(new_item.clone())).await?;
    Ok(HttpResponse::Created().json(item))
}

/// POST /api/v1/items/{id}/impressions
#[post("/items/{id}/impressions")]
pub async fn record_impression(
    path: web::Path<Uuid>,
    http_req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ImpressionEvent>,
) -> Result<HttpResponse> {
    let item_id = path.into_inner();
    let viewer_id = Identity::from_request(&http_req)?.require_user()?;
    let event = body.into_inner();

    let impression = retry_write(&state, || {
        state
            .feed
            .record_impression(viewer_id, item_id, event.clone())
    })
    .await?;
    Ok(HttpResponse::Ok().json(impression))
}

#[derive(Debug, Deserialize)]
pub struct ModerationPayload {
    pub flagged: bool,
}

/// POST /api/v1/items/{id}/moderation
#[post("/items/{id}/moderation")]
pub async fn set_moderation(
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
    body: web::Json<ModerationPayload>,
) -> Result<HttpResponse> {
    let item_id = path.into_inner();
    let flagged = body.flagged;
    retry_write(&state, || state.feed.set_item_flagged(item_id, flagged)).await?;
    Ok(HttpResponse::NoContent().finish())
}
