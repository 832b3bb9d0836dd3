use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::error::PresenceError;
use crate::models::{DestinationCategory, GeoPoint, Role};
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EnterRequest {
    pub role: Role,
    pub destination: DestinationCategory,
    pub latitude: f64,
    pub longitude: f64,
}

fn presence_error_status(err: &PresenceError) -> StatusCode {
    match err {
        PresenceError::Write(_) => StatusCode::BAD_GATEWAY,
        PresenceError::SessionEnded | PresenceError::ConnectivitySuspended => StatusCode::CONFLICT,
        PresenceError::NoLocationFix | PresenceError::InvalidLocation => StatusCode::BAD_REQUEST,
        PresenceError::ManagerStopped => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub async fn enter_handler(
    State(state): State<AppState>,
    Json(req): Json<EnterRequest>,
) -> impl IntoResponse {
    let session = match state.session_for_enter().await {
        Ok(s) => s,
        Err(e) => {
            warn!("📍 Could not start matching session: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let location = GeoPoint::new(req.latitude, req.longitude);
    match session.enter_at(req.role, req.destination, location).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "session_id": session.session_id(),
                "state": session.state(),
            })),
        )
            .into_response(),
        Err(e) => {
            warn!("📍 Enter failed for {}: {}", state.user_id, e);
            (
                presence_error_status(&e),
                Json(json!({ "error": e.to_string(), "state": session.state() })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct LeaveRequest {
    pub route_id: Option<String>,
}

pub async fn leave_handler(
    State(state): State<AppState>,
    Json(req): Json<LeaveRequest>,
) -> impl IntoResponse {
    let Some(session) = state.current_session().await else {
        return StatusCode::NO_CONTENT.into_response();
    };
    let route_id = req.route_id.unwrap_or_else(|| "unknown".to_string());
    session.navigate_away(&route_id);
    let state = session.settled_state().await;
    (StatusCode::ACCEPTED, Json(json!({ "state": state }))).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    AppBackground,
    AppForeground,
    ConnectivityLost,
    ConnectivityRestored,
    Terminate,
}

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub signal: Signal,
}

pub async fn signal_handler(
    State(state): State<AppState>,
    Json(req): Json<SignalRequest>,
) -> impl IntoResponse {
    let Some(session) = state.current_session().await else {
        return StatusCode::NO_CONTENT.into_response();
    };
    match req.signal {
        Signal::AppBackground => session.app_background(),
        Signal::AppForeground => session.app_foreground(),
        Signal::ConnectivityLost => session.connectivity_lost(),
        Signal::ConnectivityRestored => session.connectivity_restored(),
        Signal::Terminate => {
            session.terminate().await;
            state.clear_session().await;
        }
    }
    let state = session.settled_state().await;
    (StatusCode::ACCEPTED, Json(json!({ "state": state }))).into_response()
}

pub async fn state_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.current_session().await {
        Some(session) => Json(json!({
            "session_id": session.session_id(),
            "state": session.state(),
            "removal_reason": session.removal_reason(),
            "foreground": session.is_foreground(),
        })),
        None => Json(json!({ "session_id": null, "state": "inactive" })),
    }
}
