//! Admin HTTP surface.
//!
//! Thin axum handlers over the domain contracts: status, kill-switch and
//! dead-day toggles, refund preview/summary/process/retry, and round
//! cancel/diagnose/recover. Every action is idempotent-safe to repeat; the
//! typed domain errors map onto HTTP status codes so the dashboard can show
//! the taxonomy directly.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use crate::error::OpsError;
use crate::ops::{OperationalState, OperationalStatus, OpsStore};
use crate::refunds::{RefundLedger, RefundSummary, SettlementWorker};
use crate::rounds::{Round, RoundCoordinator, RoundStore};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub ops: OpsStore,
    pub rounds: RoundStore,
    pub ledger: RefundLedger,
    pub worker: SettlementWorker,
    pub coordinator: RoundCoordinator,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/admin/status", get(get_status))
        .route("/api/admin/kill-switch/enable", post(enable_kill_switch))
        .route("/api/admin/kill-switch/disable", post(disable_kill_switch))
        .route("/api/admin/dead-day/enable", post(enable_dead_day))
        .route("/api/admin/dead-day/disable", post(disable_dead_day))
        .route("/api/admin/events", get(get_recent_events))
        .route("/api/admin/rounds/cancel", post(cancel_active_round))
        .route(
            "/api/admin/rounds/:id/refunds/preview",
            get(get_refund_preview),
        )
        .route(
            "/api/admin/rounds/:id/refunds/summary",
            get(get_refund_summary),
        )
        .route(
            "/api/admin/rounds/:id/refunds/process",
            post(process_refunds),
        )
        .route(
            "/api/admin/rounds/:id/refunds/retry-failed",
            post(retry_failed_refunds),
        )
        .route("/api/admin/rounds/:id/diagnose", get(diagnose_round))
        .route("/api/admin/rounds/:id/recover", post(recover_round))
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let operational = state.ops.state().await.map_err(OpsError::Internal)?;
    let status = state.ops.status().await.map_err(OpsError::Internal)?;
    let active_round = state
        .rounds
        .active_round()
        .await
        .map_err(OpsError::Internal)?;

    let mut refund_summaries = BTreeMap::new();
    for round_id in state
        .ledger
        .rounds_with_refunds()
        .await
        .map_err(OpsError::Internal)?
    {
        let summary = state
            .ledger
            .refund_summary(round_id)
            .await
            .map_err(OpsError::Internal)?;
        refund_summaries.insert(round_id, summary);
    }

    Ok(Json(StatusResponse {
        status,
        state: operational,
        active_round,
        refund_summaries,
    }))
}

async fn get_recent_events(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let events = state
        .ops
        .recent_events(100)
        .await
        .map_err(OpsError::Internal)?;
    Ok(Json(json!({ "events": events })))
}

async fn enable_kill_switch(
    State(state): State<AppState>,
    Json(body): Json<ActorReasonBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .ops
        .enable_kill_switch(&body.actor, &body.reason, body.round_id)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn disable_kill_switch(
    State(state): State<AppState>,
    Json(body): Json<ActorBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.ops.disable_kill_switch(&body.actor).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn enable_dead_day(
    State(state): State<AppState>,
    Json(body): Json<DeadDayBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .ops
        .enable_dead_day(
            &body.actor,
            &body.reason,
            body.reopen_at,
            body.applies_after_round_id,
        )
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn disable_dead_day(
    State(state): State<AppState>,
    Json(body): Json<ActorBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.ops.disable_dead_day(&body.actor).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn cancel_active_round(
    State(state): State<AppState>,
    Json(body): Json<ActorReasonBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let round_id = state
        .coordinator
        .cancel_active_round(&body.actor, &body.reason)
        .await?;
    Ok(Json(json!({ "ok": true, "round_id": round_id })))
}

async fn get_refund_preview(
    State(state): State<AppState>,
    Path(round_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let preview = state.ledger.refund_preview(round_id).await?;
    Ok(Json(json!({ "round_id": round_id, "refunds": preview })))
}

async fn get_refund_summary(
    State(state): State<AppState>,
    Path(round_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = state
        .ledger
        .refund_summary(round_id)
        .await
        .map_err(OpsError::Internal)?;
    Ok(Json(json!({ "round_id": round_id, "summary": summary })))
}

async fn process_refunds(
    State(state): State<AppState>,
    Path(round_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.worker.process_refunds(round_id).await?;
    Ok(Json(json!({ "round_id": round_id, "outcome": outcome })))
}

async fn retry_failed_refunds(
    State(state): State<AppState>,
    Path(round_id): Path<i64>,
    Json(body): Json<ActorBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reset = state
        .ledger
        .retry_failed_refunds(round_id, &body.actor)
        .await?;
    Ok(Json(json!({ "round_id": round_id, "reset": reset })))
}

async fn diagnose_round(
    State(state): State<AppState>,
    Path(round_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let diagnosis = state.coordinator.diagnose_stuck_round(round_id).await?;
    Ok(Json(json!({ "round_id": round_id, "diagnosis": diagnosis })))
}

async fn recover_round(
    State(state): State<AppState>,
    Path(round_id): Path<i64>,
    Json(body): Json<ActorBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .coordinator
        .recover_stuck_round(round_id, &body.actor)
        .await?;
    Ok(Json(json!({ "ok": true, "round_id": round_id })))
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct ActorBody {
    actor: String,
}

#[derive(Deserialize)]
struct ActorReasonBody {
    actor: String,
    reason: String,
    round_id: Option<i64>,
}

#[derive(Deserialize)]
struct DeadDayBody {
    actor: String,
    reason: String,
    reopen_at: Option<i64>,
    applies_after_round_id: Option<i64>,
}

#[derive(Serialize)]
struct StatusResponse {
    status: OperationalStatus,
    state: OperationalState,
    active_round: Option<Round>,
    refund_summaries: BTreeMap<i64, RefundSummary>,
}

// ===== Error Handling =====

struct ApiError(OpsError);

impl From<OpsError> for ApiError {
    fn from(err: OpsError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, retryable) = match &self.0 {
            OpsError::Validation(_) => (StatusCode::BAD_REQUEST, false),
            OpsError::Precondition(_) => (StatusCode::CONFLICT, false),
            // Another trigger is already doing the work; the next tick can retry.
            OpsError::LockContention(_) => (StatusCode::CONFLICT, true),
            OpsError::NotFound(_) => (StatusCode::NOT_FOUND, false),
            OpsError::Resolution(_) | OpsError::Settlement { .. } => {
                (StatusCode::BAD_GATEWAY, false)
            }
            OpsError::Internal(err) => {
                tracing::error!("internal error: {err:#}");
                let body = Json(json!({ "error": "internal server error" }));
                return (StatusCode::INTERNAL_SERVER_ERROR, body).into_response();
            }
        };

        let body = Json(json!({
            "error": self.0.to_string(),
            "retryable": retryable,
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{MockPaymentChannel, MockResolver};
    use crate::db::Db;
    use crate::lock::LockStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let db = Db::open_in_memory().unwrap();
        let ops = OpsStore::new(db.clone());
        let rounds = RoundStore::new(db.clone());
        let locks = LockStore::new(db.clone());
        let ledger = RefundLedger::new(db, rounds.clone(), ops.clone());
        let channel = Arc::new(MockPaymentChannel::with_balance(u128::MAX));
        let resolver = Arc::new(MockResolver::with_fids(&[]));
        let worker = crate::refunds::SettlementWorker::new(
            ledger.clone(),
            rounds.clone(),
            ops.clone(),
            locks,
            channel.clone(),
            resolver.clone(),
            Duration::from_secs(5),
        );
        let coordinator = crate::rounds::RoundCoordinator::new(
            rounds.clone(),
            ops.clone(),
            ledger.clone(),
            channel,
            resolver,
            Duration::from_secs(5),
        );
        AppState {
            ops,
            rounds,
            ledger,
            worker,
            coordinator,
        }
    }

    #[tokio::test]
    async fn health_and_status_respond() {
        let app = create_router(test_state());

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/api/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "NORMAL");
    }

    #[tokio::test]
    async fn bad_reason_maps_to_400_with_the_error_kind() {
        let app = create_router(test_state());

        let response = app
            .oneshot(
                Request::post("/api/admin/kill-switch/enable")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"actor":"admin","reason":"short"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["error"].as_str().unwrap().starts_with("validation:"));
        assert_eq!(body["retryable"], false);
    }

    #[test]
    fn error_mapping_preserves_the_taxonomy() {
        let cases = [
            (
                OpsError::validation("reason too short"),
                StatusCode::BAD_REQUEST,
            ),
            (
                OpsError::precondition("already enabled"),
                StatusCode::CONFLICT,
            ),
            (
                OpsError::LockContention("held elsewhere".into()),
                StatusCode::CONFLICT,
            ),
            (OpsError::NotFound("round 9".into()), StatusCode::NOT_FOUND),
            (OpsError::settlement("reverted"), StatusCode::BAD_GATEWAY),
            (
                OpsError::Internal(anyhow::anyhow!("disk full")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
