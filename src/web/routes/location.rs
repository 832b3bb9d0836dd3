use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use crate::models::GeoPoint;
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LocationTick {
    latitude: f64,
    longitude: f64,
}

pub async fn location_handler(
    State(state): State<AppState>,
    Json(tick): Json<LocationTick>,
) -> impl IntoResponse {
    let location = GeoPoint::new(tick.latitude, tick.longitude);
    if !location.is_valid() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "location out of range" })),
        )
            .into_response();
    }
    match state.current_session().await {
        Some(session) => {
            session.location_tick(location);
            StatusCode::ACCEPTED.into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct RadiusChange {
    km: f64,
}

pub async fn radius_handler(
    State(state): State<AppState>,
    Json(change): Json<RadiusChange>,
) -> impl IntoResponse {
    let Some(session) = state.current_session().await else {
        return StatusCode::NO_CONTENT.into_response();
    };
    match session.radius_changed(change.km) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
