pub mod routes;
pub mod state;

use axum::{
    routing::{get, post},
    Router,
};
use http::header::{HeaderValue, CACHE_CONTROL};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::web::routes::{health, location, matches, session};
use crate::web::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health_handler))
        .route("/api/session/enter", post(session::enter_handler))
        .route("/api/session/leave", post(session::leave_handler))
        .route("/api/session/signal", post(session::signal_handler))
        .route("/api/session/state", get(session::state_handler))
        .route("/api/location", post(location::location_handler))
        .route("/api/radius", post(location::radius_handler))
        .route("/api/matches", get(matches::matches_handler))
        .layer(SetResponseHeaderLayer::if_not_present(
            CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}
