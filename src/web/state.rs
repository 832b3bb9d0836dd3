use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use crate::config::CoreConfig;
use crate::database::presence_store::PresenceStore;
use crate::error::MatchError;
use crate::models::EventBus;
use crate::services::clock::Clock;
use crate::services::marker_icon_cache::MarkerIconCache;
use crate::services::matching_session::MatchingSession;

/// Shared state of the local bridge. The process serves one user and at most
/// one live session at a time.
#[derive(Clone)]
pub struct AppState {
    pub user_id: String,
    pub store: Arc<dyn PresenceStore>,
    pub clock: Arc<dyn Clock>,
    pub config: CoreConfig,
    pub events: EventBus,
    pub session: Arc<RwLock<Option<Arc<MatchingSession>>>>,
    pub icons: Arc<Mutex<MarkerIconCache>>,
}

impl AppState {
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn PresenceStore>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
    ) -> Self {
        let icons = MarkerIconCache::new(config.matching.marker_cache_capacity);
        Self {
            user_id: user_id.into(),
            store,
            clock,
            config,
            events: EventBus::default(),
            session: Arc::new(RwLock::new(None)),
            icons: Arc::new(Mutex::new(icons)),
        }
    }

    pub async fn current_session(&self) -> Option<Arc<MatchingSession>> {
        self.session.read().await.clone()
    }

    /// The live session, or a fresh one when there is none or the previous
    /// one has reached `Removed`.
    pub async fn session_for_enter(&self) -> Result<Arc<MatchingSession>, MatchError> {
        let mut slot = self.session.write().await;
        if let Some(existing) = slot.as_ref() {
            if !existing.state().is_terminal() {
                return Ok(existing.clone());
            }
        }
        let session = Arc::new(MatchingSession::start(
            self.user_id.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.config.clone(),
            self.events.clone(),
        )?);
        *slot = Some(session.clone());
        Ok(session)
    }

    pub async fn clear_session(&self) -> Option<Arc<MatchingSession>> {
        self.session.write().await.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryPresenceStore;
    use crate::models::{DestinationCategory, GeoPoint, LifecycleState, Role};
    use crate::services::clock::SystemClock;

    fn state(store: &MemoryPresenceStore) -> AppState {
        AppState::new(
            "bridge-user",
            Arc::new(store.clone()),
            Arc::new(SystemClock),
            CoreConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn live_session_is_reused() {
        let store = MemoryPresenceStore::new();
        let state = state(&store);
        let first = state.session_for_enter().await.unwrap();
        let second = state.session_for_enter().await.unwrap();
        assert_eq!(first.session_id(), second.session_id());
    }

    #[tokio::test(start_paused = true)]
    async fn removed_session_is_replaced_on_enter() {
        let store = MemoryPresenceStore::new();
        let state = state(&store);
        let first = state.session_for_enter().await.unwrap();
        first
            .enter_at(
                Role::Provider,
                DestinationCategory::Local,
                GeoPoint::new(51.5, -0.12),
            )
            .await
            .unwrap();
        first.terminate().await;
        assert_eq!(first.state(), LifecycleState::Removed);

        let second = state.session_for_enter().await.unwrap();
        assert_ne!(first.session_id(), second.session_id());
        assert_eq!(second.state(), LifecycleState::Inactive);
        assert!(store.is_empty());
    }
}
