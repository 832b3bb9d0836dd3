use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{ClusterOrMarker, GeoPoint, LifecycleState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RendererEvent {
    PresenceStateChanged(LifecycleState),
    MatchResultsUpdated(Vec<ClusterOrMarker>),
    CameraRecenter(GeoPoint),
    WriteFailed(String),
    SubscriptionStale(bool),
}

/// Fan-out to whatever UI layer is listening. Sends never fail: with no
/// receivers the event is dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RendererEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: RendererEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RendererEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
