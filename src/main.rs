use dotenvy::dotenv;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nearby::config::CoreConfig;
use nearby::database::{MemoryPresenceStore, PresenceStore, RestPresenceStore, SqlitePresenceStore};
use nearby::services::clock::SystemClock;
use nearby::web;
use nearby::web::state::AppState;

async fn build_store() -> Arc<dyn PresenceStore> {
    let kind = env::var("PRESENCE_STORE").unwrap_or_else(|_| "memory".to_string());
    match kind.as_str() {
        "sqlite" => {
            let db_url = env::var("DATABASE_URL").expect("DATABASE_URL is required for PRESENCE_STORE=sqlite");
            let store = SqlitePresenceStore::connect(&db_url)
                .await
                .expect("Could not open presence database");
            info!("📍 Presence store: sqlite ({})", db_url);
            Arc::new(store)
        }
        "rest" => {
            let store = RestPresenceStore::from_env()
                .expect("PRESENCE_REST_URL is required for PRESENCE_STORE=rest");
            info!("📍 Presence store: rest");
            Arc::new(store)
        }
        other => {
            if other != "memory" {
                warn!("📍 Unknown PRESENCE_STORE '{}', using memory", other);
            }
            Arc::new(MemoryPresenceStore::new())
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = CoreConfig::from_env();
    let store = build_store().await;
    let user_id = env::var("NEARBY_USER_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
    info!("📍 Serving presence bridge for user {}", user_id);

    let state = AppState::new(user_id, store, Arc::new(SystemClock), config);
    let app = web::router(state.clone());

    let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .expect("Could not parse host/port");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(
                "Could not bind {}: {}. Trying fallback {}:{}",
                addr,
                e,
                host,
                port + 1
            );
            let fallback: SocketAddr = format!("{}:{}", host, port + 1)
                .parse()
                .expect("Could not parse fallback address");
            tokio::net::TcpListener::bind(fallback)
                .await
                .expect("Could not bind fallback port")
        }
    };

    let bound_addr = listener.local_addr().expect("listener has no local address");
    info!("🚀 Presence bridge listening on http://{}", bound_addr);

    let shutdown_state = state.clone();
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        // Teardown is the last chance to remove our record.
        if let Some(session) = shutdown_state.clear_session().await {
            session.terminate().await;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("server error");
}
