use actix_web::{get, web, HttpRequest, HttpResponse};
use serde::Deserialize;

use super::Identity;
use crate::error::{AppError, Result};
use crate::models::{FeedRequest, Tab};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct FeedQueryParams {
    pub tab: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub region: Option<String>,
}

/// GET /api/v1/feed?tab=&cursor=&limit=&region=
#[get("/feed")]
pub async fn get_feed(
    query: web::Query<FeedQueryParams>,
    http_req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let identity = Identity::from_request(&http_req)?;
    let user_id = identity.require_user()?;

    let tab = match query.tab.as_deref() {
        Some(raw) => raw.parse::<Tab>()?,
        None => Tab::ForYou,
    };
    let region = query
        .region
        .clone()
        .filter(|r| !r.trim().is_empty())
        .or(identity.region)
        .ok_or_else(|| AppError::Validation("region is required".into()))?;

    let request = FeedRequest {
        user_id,
        tab,
        cursor: query.cursor.clone().filter(|c| !c.is_empty()),
        limit: state.feed.clamp_limit(query.limit),
        region,
        tribe: identity.tribe,
    };

    let page = state.feed.get_feed(request).await?;
    Ok(HttpResponse::Ok().json(page))
}
