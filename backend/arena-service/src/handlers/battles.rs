use actix_web::{get, post, web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{client_ip_hash, retry_write, Identity};
use crate::error::Result;
use crate::models::{BattleVotes, VoteSide, VoterSignals};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleEntryPayload {
    pub asset_ref: String,
    pub tribe: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VotePayload {
    pub choice: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub accepted: bool,
    pub votes: BattleVotes,
}

#[derive(Debug, Deserialize)]
pub struct ListQueryParams {
    pub cursor: Option<String>,
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

fn default_list_limit() -> usize {
    20
}

/// POST /api/v1/battles
#[post("/battles")]
pub async fn create_battle(
    http_req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<BattleEntryPayload>,
) -> Result<HttpResponse> {
    let identity = Identity::from_request(&http_req)?;
    let challenger_id = identity.require_user()?;
    let payload = body.into_inner();
    let tribe = payload.tribe.or(identity.tribe);

    let battle = retry_write(&state, || {
        state
            .battles
            .create(challenger_id, tribe.clone(), payload.asset_ref.clone())
    })
    .await?;
    Ok(HttpResponse::Created().json(battle))
}

/// POST /api/v1/battles/{id}/accept
#[post("/battles/{id}/accept")]
pub async fn accept_battle(
    path: web::Path<Uuid>,
    http_req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<BattleEntryPayload>,
) -> Result<HttpResponse> {
    let battle_id = path.into_inner();
    let identity = Identity::from_request(&http_req)?;
    let defender_id = identity.require_user()?;
    let payload = body.into_inner();
    let tribe = payload.tribe.or(identity.tribe);

    let battle = retry_write(&state, || {
        state
            .battles
            .accept(battle_id, defender_id, tribe.clone(), payload.asset_ref.clone())
    })
    .await?;
    Ok(HttpResponse::Ok().json(battle))
}

/// GET /api/v1/battles/active?cursor=&limit=
#[get("/battles/active")]
pub async fn list_active_battles(
    query: web::Query<ListQueryParams>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let page = state
        .battles
        .list_active(query.cursor.as_deref(), query.limit)
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

/// GET /api/v1/battles/{shortCode}
#[get("/battles/{short_code}")]
pub async fn get_battle(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let battle = state.battles.get_by_short_code(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(battle))
}

/// POST /api/v1/battles/{id}/votes
///
/// 409 duplicate vote, 400 battle not votable, 404 unknown battle.
#[post("/battles/{id}/votes")]
pub async fn vote_on_battle(
    path: web::Path<Uuid>,
    http_req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<VotePayload>,
) -> Result<HttpResponse> {
    let battle_id = path.into_inner();
    let choice: VoteSide = body.choice.parse()?;
    let identity = Identity::from_request(&http_req)?;
    let signals = VoterSignals {
        user_id: identity.user_id,
        fingerprint: identity.fingerprint,
        ip_hash: client_ip_hash(&http_req, &state.config.votes.ip_hash_salt),
    };

    let receipt = retry_write(&state, || {
        state.votes.cast_vote(battle_id, choice, signals.clone())
    })
    .await?;

    Ok(HttpResponse::Ok().json(VoteResponse {
        accepted: receipt.accepted,
        votes: receipt.votes,
    }))
}
