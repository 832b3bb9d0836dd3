use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;

use crate::models::ClusterOrMarker;
use crate::services::marker_icon_cache::MarkerIcon;
use crate::web::state::AppState;

#[derive(Debug, Serialize)]
pub struct MatchView {
    pub item: ClusterOrMarker,
    pub icon: MarkerIcon,
}

pub async fn matches_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(session) = state.current_session().await else {
        return Json(Vec::<MatchView>::new());
    };
    let Some(partition) = session.counterpart_partition() else {
        return Json(Vec::new());
    };

    let items = session.current_matches();
    let mut icons = state.icons.lock().unwrap_or_else(|p| p.into_inner());
    let views = items
        .into_iter()
        .map(|item| {
            let icon = icons.icon_for(&item, partition.role);
            MatchView {
                item,
                icon: (*icon).clone(),
            }
        })
        .collect::<Vec<_>>();
    Json(views)
}
