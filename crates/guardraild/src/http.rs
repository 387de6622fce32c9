//! HTTP surface of the daemon.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness |
//! | GET | `/metrics` | Prometheus exposition |
//! | GET | `/api/v1/state` | Breakers, emergency state, recommendations |
//! | POST | `/api/v1/emergency` | Operator override of the emergency level |

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

use guardrail_core::{EmergencyLevel, EmergencyState};
use guardrail_reconcile::{Guardrail, epoch_secs};

/// Build the daemon router.
pub fn build_router(guardrail: Arc<Guardrail>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(prometheus_metrics))
        .route("/api/v1/state", get(state))
        .route("/api/v1/emergency", post(force_emergency))
        .with_state(guardrail)
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// GET /metrics
pub async fn prometheus_metrics(State(guardrail): State<Arc<Guardrail>>) -> impl IntoResponse {
    let snapshot = guardrail.snapshot().await;
    let body = guardrail_metrics::render_prometheus(&snapshot);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// GET /api/v1/state
pub async fn state(State(guardrail): State<Arc<Guardrail>>) -> impl IntoResponse {
    Json(guardrail.snapshot().await)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ForceLevelRequest {
    pub level: EmergencyLevel,
}

/// POST /api/v1/emergency
pub async fn force_emergency(
    State(guardrail): State<Arc<Guardrail>>,
    Json(req): Json<ForceLevelRequest>,
) -> impl IntoResponse {
    warn!(level = %req.level, "operator forced emergency level");
    guardrail.force_emergency(req.level, epoch_secs()).await;
    let state: EmergencyState = guardrail.snapshot().await.emergency;
    (StatusCode::OK, Json(state))
}
