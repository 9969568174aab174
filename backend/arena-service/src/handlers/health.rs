use actix_web::{get, web, HttpResponse};
use serde_json::json;

use crate::metrics;
use crate::state::AppState;

/// GET /health
///
/// The store is required; a cache outage only degrades feed reads.
#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let store = state.store.ping().await;
    let cache = state.cache.ping().await;

    let body = json!({
        "status": if store.is_ok() { "ok" } else { "unavailable" },
        "service": "arena-service",
        "store": store.as_ref().map(|_| "ok").unwrap_or("unavailable"),
        "cache": cache.as_ref().map(|_| "ok").unwrap_or("degraded"),
        "scheduledTransitions": state.scheduler.queued_len(),
    });

    if store.is_ok() {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

/// GET /metrics
#[get("/metrics")]
pub async fn metrics_endpoint() -> HttpResponse {
    match metrics::render() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}
