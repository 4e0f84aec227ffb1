use std::sync::Arc;

use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
    service: &'a str,
}

async fn healthz() -> impl IntoResponse {
    metrics::counter!("health_checks_total", "endpoint" => "healthz", "status" => "ok")
        .increment(1);
    (
        StatusCode::OK,
        axum::Json(HealthResponse {
            status: "ok",
            service: "artivio-chat",
        }),
    )
}

pub fn create_health_router() -> Router<Arc<AppState>> {
    Router::new().route("/healthz", get(healthz))
}
