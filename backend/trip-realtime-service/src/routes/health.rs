use actix_middleware::render_metrics;
use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::state::AppState;

/// GET /health
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "environment": state.config.environment.as_str(),
        "activeSessions": state.registry.total().await,
    }))
}

/// GET /health/liveness
pub async fn liveness() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "alive" }))
}

/// GET /health/readiness
///
/// Not ready while a configured Redis is unreachable.
pub async fn readiness(state: web::Data<AppState>) -> HttpResponse {
    let redis = match &state.redis {
        Some(pool) => {
            if pool.ping().await {
                "up"
            } else {
                "down"
            }
        }
        None => "disabled",
    };

    let body = json!({
        "status": if redis == "down" { "not_ready" } else { "ready" },
        "checks": { "redis": redis },
    });
    if redis == "down" {
        HttpResponse::ServiceUnavailable().json(body)
    } else {
        HttpResponse::Ok().json(body)
    }
}

/// GET /metrics
pub async fn metrics(state: web::Data<AppState>) -> HttpResponse {
    render_metrics(&[state.session_metrics.registry()])
}
