// =============================================================================
// Ops REST API — health, state snapshot, signal intake, order commands
// =============================================================================
//
// The operational surface of the router:
//
//   GET  /api/v1/health                    liveness probe
//   GET  /api/v1/state                     full engine snapshot
//   POST /api/v1/signals                   raw signal intake (webhook)
//   POST /api/v1/orders/:order_id/cancel   publish a CANCEL command
//
// Signal intake writes the raw row into the durable store, which emits a
// change-stream event the ingestion tail picks up — the API never talks to
// the pipeline stages directly.
// =============================================================================

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::types::{CommandKind, Environment, OrderCommand, RawSignalRow};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(engine_state))
        .route("/api/v1/signals", post(submit_signal))
        .route("/api/v1/orders/:order_id/cancel", post(cancel_order))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "state_version": state.current_state_version(),
    }))
    .into_response()
}

async fn engine_state(State(state): State<Arc<AppState>>) -> Response {
    Json(state.build_snapshot()).into_response()
}

/// Body of `POST /api/v1/signals` — the raw webhook shape strategies emit.
#[derive(Debug, Deserialize)]
struct SubmitSignalRequest {
    strategy_name: String,
    #[serde(default, rename = "signalID")]
    signal_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default, rename = "signal_sent_EPOCH")]
    signal_sent_epoch: Option<i64>,
    #[serde(default)]
    environment: Option<Environment>,
    signal: serde_json::Value,
}

async fn submit_signal(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitSignalRequest>,
) -> Response {
    if request.strategy_name.trim().is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "strategy_name is required"})),
        )
            .into_response();
    }

    // Rows default to this process's environment unless tagged explicitly.
    let environment = request
        .environment
        .unwrap_or_else(|| state.config.read().environment);

    let row = RawSignalRow {
        row_id: Uuid::new_v4().to_string(),
        signal_id: None,
        source_signal_id: request.signal_id,
        strategy_name: request.strategy_name,
        timestamp: request.timestamp,
        received_at: Utc::now(),
        signal_sent_epoch: request.signal_sent_epoch,
        environment,
        signal: request.signal,
        signal_processed: false,
    };
    let row_id = row.row_id.clone();
    let resume_token = state.db.raw_signals.insert(row);
    state.increment_version();

    info!(row_id = %row_id, environment = %environment, "raw signal accepted");

    (
        StatusCode::ACCEPTED,
        Json(json!({"row_id": row_id, "resume_token": resume_token})),
    )
        .into_response()
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Response {
    if state.db.orders.get(&order_id).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("order '{order_id}' not found")})),
        )
            .into_response();
    }

    let command = OrderCommand {
        command: CommandKind::Cancel,
        order_id: order_id.clone(),
    };
    if let Err(e) = state.bus.order_commands.publish(command).await {
        warn!(order_id = %order_id, error = %e, "cancel command could not be published");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "execution dispatcher unavailable"})),
        )
            .into_response();
    }

    info!(order_id = %order_id, "cancel command published");
    (StatusCode::ACCEPTED, Json(json!({"order_id": order_id}))).into_response()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::config::RuntimeConfig;
    use crate::store::Database;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> (Arc<AppState>, crate::bus::BusReceivers) {
        let db = Arc::new(Database::new(16));
        let (bus, receivers) = Bus::new(16, Duration::from_millis(10));
        (
            Arc::new(AppState::new(RuntimeConfig::default(), db, bus)),
            receivers,
        )
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let (state, _receivers) = test_state();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn signal_intake_inserts_raw_row() {
        let (state, _receivers) = test_state();
        let body = serde_json::json!({
            "strategy_name": "SPY_Trend",
            "signalID": "SPY_20260301_104528_001",
            "signal": {"ticker": "SPY", "action": "BUY", "price": 450.0}
        });

        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/signals")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(state.db.raw_signals.len(), 1);
    }

    #[tokio::test]
    async fn signal_intake_requires_strategy_name() {
        let (state, _receivers) = test_state();
        let body = serde_json::json!({"strategy_name": " ", "signal": {}});

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/signals")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn cancel_unknown_order_is_404() {
        let (state, _receivers) = test_state();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/orders/ghost_ORD/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
