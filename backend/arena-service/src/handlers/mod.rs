//! HTTP surface
//!
//! Identity comes from the upstream gateway as headers; nothing here
//! authenticates. Write endpoints retry transient dependency failures with
//! backoff before surfacing them.

pub mod battles;
pub mod feed;
pub mod health;
pub mod items;

use actix_web::{web, HttpRequest};
use resilience::{with_retry_if, RetryError};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::net::SocketAddr;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const TRIBE_HEADER: &str = "x-user-tribe";
pub const REGION_HEADER: &str = "x-region";
pub const FINGERPRINT_HEADER: &str = "x-device-fingerprint";

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health::health)
        .service(health::metrics_endpoint)
        .service(
            web::scope("/api/v1")
                .service(feed::get_feed)
                .service(battles::create_battle)
                .service(battles::list_active_battles)
                .service(battles::accept_battle)
                .service(battles::vote_on_battle)
                .service(battles::get_battle)
                .service(items::publish_item)
                .service(items::record_impression)
                .service(items::set_moderation),
        );
}

/// Caller identity as forwarded by the gateway
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user_id: Option<Uuid>,
    pub tribe: Option<String>,
    pub region: Option<String>,
    pub fingerprint: Option<String>,
}

impl Identity {
    pub fn from_request(req: &HttpRequest) -> Result<Self> {
        let user_id = match header(req, USER_ID_HEADER) {
            Some(raw) => Some(
                Uuid::parse_str(&raw)
                    .map_err(|_| AppError::Validation(format!("{} is not a UUID", USER_ID_HEADER)))?,
            ),
            None => None,
        };
        Ok(Self {
            user_id,
            tribe: header(req, TRIBE_HEADER),
            region: header(req, REGION_HEADER),
            fingerprint: header(req, FINGERPRINT_HEADER),
        })
    }

    pub fn require_user(&self) -> Result<Uuid> {
        self.user_id
            .ok_or_else(|| AppError::Validation(format!("{} header is required", USER_ID_HEADER)))
    }
}

fn header(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Salted SHA-256 of the client address; the raw IP never leaves the handler
pub fn client_ip_hash(req: &HttpRequest, salt: &str) -> Option<String> {
    let info = req.connection_info();
    let addr = info.realip_remote_addr()?;
    let ip = addr
        .parse::<SocketAddr>()
        .map(|s| s.ip().to_string())
        .unwrap_or_else(|_| addr.to_string());
    Some(hash_ip(&ip, salt))
}

pub fn hash_ip(ip: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(ip.as_bytes());
    hex::encode(hasher.finalize())
}

/// Retry a write while it fails with a dependency error
pub async fn retry_write<F, Fut, T>(state: &AppState, f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_if(state.write_retry.clone(), AppError::is_transient, f)
        .await
        .map_err(RetryError::into_inner)
}
