// =============================================================================
// REST Endpoints — Axum 0.7
// =============================================================================
//
// Read-only snapshots under `/api/v1/` for the dashboard, plus exactly three
// mutating control endpoints: kill, pause, resume. Health is public; all
// other routes require the Bearer token.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::EngineShared;

/// Build the API router.
pub fn router(shared: Arc<EngineShared>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Read-only snapshots ─────────────────────────────────────
        .route("/api/v1/state", get(engine_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/trades", get(trades))
        .route("/api/v1/pnl", get(pnl))
        // ── Control ─────────────────────────────────────────────────
        .route("/api/v1/control/kill", post(control_kill))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .layer(cors)
        .with_state(shared)
}

// ---------------------------------------------------------------------------
// Health (public)
// ---------------------------------------------------------------------------

async fn health(State(shared): State<Arc<EngineShared>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "mode": shared.state_machine.mode().to_string(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// ---------------------------------------------------------------------------
// Snapshots (authenticated)
// ---------------------------------------------------------------------------

async fn engine_state(
    _auth: AuthBearer,
    State(shared): State<Arc<EngineShared>>,
) -> impl IntoResponse {
    Json(shared.build_snapshot())
}

async fn positions(
    _auth: AuthBearer,
    State(shared): State<Arc<EngineShared>>,
) -> impl IntoResponse {
    Json(shared.all_positions())
}

#[derive(Deserialize)]
struct TradesQuery {
    #[serde(default = "default_trades_limit")]
    limit: usize,
}

fn default_trades_limit() -> usize {
    100
}

async fn trades(
    _auth: AuthBearer,
    State(shared): State<Arc<EngineShared>>,
    Query(query): Query<TradesQuery>,
) -> impl IntoResponse {
    Json(shared.journal.recent(query.limit.min(500)))
}

async fn pnl(_auth: AuthBearer, State(shared): State<Arc<EngineShared>>) -> impl IntoResponse {
    Json(shared.pnl_snapshot())
}

// ---------------------------------------------------------------------------
// Control (authenticated)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ControlBody {
    #[serde(default)]
    reason: Option<String>,
}

/// Trip the kill switch. Loops halt at their next suspension point.
async fn control_kill(
    _auth: AuthBearer,
    State(shared): State<Arc<EngineShared>>,
    body: Option<Json<ControlBody>>,
) -> impl IntoResponse {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "api kill request".to_string());
    warn!(reason = %reason, "kill requested via API");

    shared.kill_switch.engage(&reason);
    let _ = shared.state_machine.emergency_stop(&reason);

    Json(serde_json::json!({ "ok": true, "mode": shared.state_machine.mode().to_string() }))
}

/// Pause entries: LIVE_ACTIVE drops back to managing-only via EMERGENCY-free
/// route — the engine keeps exits running because only LIVE_ACTIVE/DRY_RUN
/// allow entries.
async fn control_pause(
    _auth: AuthBearer,
    State(shared): State<Arc<EngineShared>>,
) -> impl IntoResponse {
    // Pausing is an emergency-stop without the sentinel file: loops stay
    // alive in managing-only mode when the mode leaves LIVE_ACTIVE.
    match shared.state_machine.emergency_stop("paused via API") {
        Ok(()) => {
            info!("engine paused via API");
            Json(serde_json::json!({ "ok": true, "mode": shared.state_machine.mode().to_string() }))
                .into_response()
        }
        Err(denied) => {
            (StatusCode::CONFLICT, Json(serde_json::json!({ "error": denied.to_string() })))
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct ResumeBody {
    /// The resume protocol requires an explicit fresh risk acknowledgement.
    #[serde(default)]
    risk_acknowledged: bool,
}

/// Resume protocol: EMERGENCY_STOP -> OFF -> LIVE_PENDING_CONFIRMATION.
/// The engine returns to LIVE_ACTIVE only after broker reconnection
/// confirms, which the supervisor performs when it observes the pending
/// mode.
async fn control_resume(
    _auth: AuthBearer,
    State(shared): State<Arc<EngineShared>>,
    Json(body): Json<ResumeBody>,
) -> impl IntoResponse {
    if shared.kill_switch.is_engaged() {
        shared.kill_switch.clear();
    }

    if let Err(denied) = shared.state_machine.reset("resume via API") {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": denied.to_string() })),
        )
            .into_response();
    }

    match shared
        .state_machine
        .request_live(body.risk_acknowledged, "resume via API")
    {
        Ok(()) => {
            info!("resume requested via API; awaiting confirmation");
            Json(serde_json::json!({ "ok": true, "mode": shared.state_machine.mode().to_string() }))
                .into_response()
        }
        Err(denied) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": denied.to_string() })),
        )
            .into_response(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::journal::TradeJournal;
    use crate::kill_switch::KillSwitch;
    use crate::state_machine::StateMachine;
    use std::collections::HashMap;

    fn shared(dir: &std::path::Path) -> Arc<EngineShared> {
        Arc::new(EngineShared::new(
            EngineConfig::from_vars(&HashMap::new()).unwrap(),
            Arc::new(StateMachine::load(dir).unwrap()),
            Arc::new(KillSwitch::new(dir)),
            Arc::new(TradeJournal::open(dir).unwrap()),
        ))
    }

    #[test]
    fn router_builds() {
        let dir = tempfile::tempdir().unwrap();
        let _router = router(shared(dir.path()));
    }

    #[tokio::test]
    async fn kill_endpoint_engages_switch_and_stops_engine() {
        let dir = tempfile::tempdir().unwrap();
        let shared = shared(dir.path());

        let _ = control_kill(
            AuthBearer("token".into()),
            State(shared.clone()),
            Some(Json(ControlBody {
                reason: Some("test".into()),
            })),
        )
        .await;

        assert!(shared.kill_switch.is_engaged());
        assert_eq!(
            shared.state_machine.mode(),
            crate::state_machine::EngineMode::EmergencyStop
        );
    }

    #[tokio::test]
    async fn resume_requires_risk_acknowledgement() {
        let dir = tempfile::tempdir().unwrap();
        let shared = shared(dir.path());
        shared.state_machine.emergency_stop("test").unwrap();

        // Without the acknowledgement the engine lands back at OFF.
        let _ = control_resume(
            AuthBearer("token".into()),
            State(shared.clone()),
            Json(ResumeBody {
                risk_acknowledged: false,
            }),
        )
        .await;
        assert_eq!(
            shared.state_machine.mode(),
            crate::state_machine::EngineMode::Off
        );

        // With it, the resume protocol reaches pending-confirmation.
        shared.state_machine.emergency_stop("again").unwrap();
        let _ = control_resume(
            AuthBearer("token".into()),
            State(shared.clone()),
            Json(ResumeBody {
                risk_acknowledged: true,
            }),
        )
        .await;
        assert_eq!(
            shared.state_machine.mode(),
            crate::state_machine::EngineMode::LivePendingConfirmation
        );
    }
}
