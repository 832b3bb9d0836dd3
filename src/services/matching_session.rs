use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::database::presence_store::PresenceStore;
use crate::error::{MatchError, PresenceError};
use crate::models::{
    AppLifecycleEvent, ClusterOrMarker, ConnectivityEvent, DestinationCategory, EventBus,
    GeoPoint, LifecycleState, NavigationEvent, PartitionKey, RemovalReason, RendererInput, Role,
};
use crate::services::clock::Clock;
use crate::services::counterpart_subscription_service::CounterpartSubscription;
use crate::services::match_pipeline_service::MatchPipelineHandle;
use crate::services::presence_lifecycle_service::{
    PresenceLifecycleHandle, PresenceLifecycleManager,
};

/// Drops the counterpart feed and clears the results once the lifecycle
/// ends, whichever way it got there (grace expiry included).
async fn release_on_removal(
    mut state: watch::Receiver<LifecycleState>,
    subscription: Arc<Mutex<Option<CounterpartSubscription>>>,
    pipeline: MatchPipelineHandle,
) {
    loop {
        if state.borrow_and_update().is_terminal() {
            let released = subscription
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take();
            if let Some(released) = released {
                info!("📍 Session ended; releasing {}", released.partition());
            }
            pipeline.detach();
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// Everything one matching session needs, wired from injected parts: the
/// user's lifecycle actor, the counterpart subscription and the match
/// pipeline. Signals from the app, navigator and network are routed here.
pub struct MatchingSession {
    user_id: String,
    store: Arc<dyn PresenceStore>,
    config: CoreConfig,
    events: EventBus,
    presence: PresenceLifecycleHandle,
    pipeline: MatchPipelineHandle,
    subscription: Arc<Mutex<Option<CounterpartSubscription>>>,
    last_location: Mutex<Option<GeoPoint>>,
    foreground: AtomicBool,
}

impl MatchingSession {
    pub fn start(
        user_id: impl Into<String>,
        store: Arc<dyn PresenceStore>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
        events: EventBus,
    ) -> Result<Self, MatchError> {
        let user_id = user_id.into();
        let pipeline = MatchPipelineHandle::spawn(&config.matching, events.clone())?;
        let presence = PresenceLifecycleManager::spawn(
            user_id.clone(),
            store.clone(),
            clock,
            config.lifecycle.clone(),
            events.clone(),
        );
        let subscription = Arc::new(Mutex::new(None));
        tokio::spawn(release_on_removal(
            presence.watch_state(),
            subscription.clone(),
            pipeline.clone(),
        ));
        Ok(Self {
            user_id,
            store,
            config,
            events,
            presence,
            pipeline,
            subscription,
            last_location: Mutex::new(None),
            foreground: AtomicBool::new(true),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.presence.session_id()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> LifecycleState {
        self.presence.state()
    }

    pub async fn settled_state(&self) -> LifecycleState {
        self.presence.settled_state().await
    }

    pub fn removal_reason(&self) -> Option<RemovalReason> {
        self.presence.removal_reason()
    }

    pub fn presence(&self) -> &PresenceLifecycleHandle {
        &self.presence
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn results(&self) -> watch::Receiver<Vec<ClusterOrMarker>> {
        self.pipeline.results()
    }

    pub fn current_matches(&self) -> Vec<ClusterOrMarker> {
        self.pipeline.current()
    }

    pub fn counterpart_partition(&self) -> Option<PartitionKey> {
        self.lock_subscription().as_ref().map(|s| s.partition())
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    fn lock_subscription(&self) -> std::sync::MutexGuard<'_, Option<CounterpartSubscription>> {
        self.subscription.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn last_location(&self) -> Option<GeoPoint> {
        *self.last_location.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Publishes the user at the last known location and starts listening to
    /// the opposite role in the same destination.
    pub async fn enter(
        &self,
        role: Role,
        destination: DestinationCategory,
    ) -> Result<(), PresenceError> {
        let location = self.last_location().ok_or(PresenceError::NoLocationFix)?;
        self.presence
            .enter_matching_context(role, destination, location)
            .await?;

        let partition = PartitionKey::new(role.counterpart(), destination);
        let mut slot = self.lock_subscription();
        if slot.as_ref().map(|s| s.partition()) != Some(partition) {
            let subscription = CounterpartSubscription::spawn(
                self.store.clone(),
                partition,
                self.user_id.clone(),
                self.config.subscription.clone(),
                self.events.clone(),
            );
            if !self.is_foreground() {
                subscription.pause();
            }
            self.pipeline.attach(subscription.entities());
            // Replacing the old handle drops it, which cancels its task.
            *slot = Some(subscription);
            info!("📍 Listening to {} for {}", partition, self.user_id);
        } else if let Some(subscription) = slot.as_ref() {
            if self.is_foreground() {
                subscription.resume();
            }
        }
        Ok(())
    }

    pub async fn enter_at(
        &self,
        role: Role,
        destination: DestinationCategory,
        location: GeoPoint,
    ) -> Result<(), PresenceError> {
        if !location.is_valid() {
            return Err(PresenceError::InvalidLocation);
        }
        self.location_tick(location);
        self.enter(role, destination).await
    }

    pub fn location_tick(&self, location: GeoPoint) {
        if !location.is_valid() {
            warn!("📍 Dropping invalid location tick");
            return;
        }
        *self.last_location.lock().unwrap_or_else(|p| p.into_inner()) = Some(location);
        self.presence.location_tick(location);
        self.pipeline.viewer_moved(location);
    }

    pub fn radius_changed(&self, radius_km: f64) -> Result<(), MatchError> {
        self.pipeline.set_radius(radius_km)
    }

    pub fn renderer_input(&self, input: RendererInput) -> Result<(), MatchError> {
        match input {
            RendererInput::LocationTick(location) => {
                self.location_tick(location);
                Ok(())
            }
            RendererInput::RadiusChanged(km) => self.radius_changed(km),
        }
    }

    pub fn app_background(&self) {
        self.foreground.store(false, Ordering::SeqCst);
        self.presence.app_background();
        if let Some(subscription) = self.lock_subscription().as_ref() {
            subscription.pause();
        }
    }

    pub fn app_foreground(&self) {
        self.foreground.store(true, Ordering::SeqCst);
        self.presence.app_foreground();
        if let Some(subscription) = self.lock_subscription().as_ref() {
            subscription.resume();
        }
    }

    pub fn navigate_away(&self, current_route_id: &str) {
        self.presence.navigate_away();
        if !self.is_foreground() {
            debug!(
                "📍 Left route {} while backgrounded; session kept",
                current_route_id
            );
            return;
        }
        info!("📍 Left matching context via route {}", current_route_id);
        self.lock_subscription().take();
        self.pipeline.detach();
    }

    pub fn connectivity_lost(&self) {
        self.presence.connectivity_lost();
    }

    pub fn connectivity_restored(&self) {
        self.presence.connectivity_restored();
    }

    pub async fn terminate(&self) {
        self.lock_subscription().take();
        self.pipeline.shutdown();
        self.presence.terminate().await;
    }

    pub async fn handle_app_event(&self, event: AppLifecycleEvent) {
        match event {
            AppLifecycleEvent::Foreground => self.app_foreground(),
            AppLifecycleEvent::Background => self.app_background(),
            AppLifecycleEvent::Terminated => self.terminate().await,
        }
    }

    pub async fn handle_navigation(&self, event: NavigationEvent) {
        match event {
            NavigationEvent::EnteredMatchingContext { role, destination } => {
                if let Err(e) = self.enter(role, destination).await {
                    warn!("📍 Entering matching context failed: {}", e);
                }
            }
            NavigationEvent::LeftMatchingContext { current_route_id } => {
                self.navigate_away(&current_route_id)
            }
        }
    }

    pub fn handle_connectivity(&self, event: ConnectivityEvent) {
        match event {
            ConnectivityEvent::Lost => self.connectivity_lost(),
            ConnectivityEvent::Restored => self.connectivity_restored(),
        }
    }

    /// Consumes the three signal sources until the app terminates or every
    /// source has ended. Events from one source are applied in order.
    pub async fn drive<A, N, C>(&self, app: A, navigation: N, connectivity: C)
    where
        A: Stream<Item = AppLifecycleEvent> + Unpin,
        N: Stream<Item = NavigationEvent> + Unpin,
        C: Stream<Item = ConnectivityEvent> + Unpin,
    {
        let mut app = app.fuse();
        let mut navigation = navigation.fuse();
        let mut connectivity = connectivity.fuse();
        loop {
            tokio::select! {
                Some(event) = app.next() => {
                    let terminated = event == AppLifecycleEvent::Terminated;
                    self.handle_app_event(event).await;
                    if terminated {
                        break;
                    }
                }
                Some(event) = navigation.next() => self.handle_navigation(event).await,
                Some(event) = connectivity.next() => self.handle_connectivity(event),
                else => break,
            }
        }
    }
}
