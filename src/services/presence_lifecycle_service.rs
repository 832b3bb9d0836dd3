use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LifecycleConfig;
use crate::database::presence_store::PresenceStore;
use crate::error::{PresenceError, StoreError};
use crate::models::{
    DestinationCategory, EventBus, GeoPoint, LifecycleState, PresencePath, PresenceRecord,
    RemovalReason, RendererEvent, Role,
};
use crate::services::clock::Clock;
use crate::services::throttle_service::{Offer, ThrottleStream, UpdateThrottler};

#[derive(Debug)]
enum Command {
    Enter {
        role: Role,
        destination: DestinationCategory,
        location: GeoPoint,
        reply: oneshot::Sender<Result<(), PresenceError>>,
    },
    LocationTick(GeoPoint),
    AppBackground,
    AppForeground,
    NavigateAway,
    ConnectivityLost,
    ConnectivityRestored,
    Terminate {
        reply: oneshot::Sender<()>,
    },
    Settle {
        reply: oneshot::Sender<LifecycleState>,
    },
}

/// Cloneable front of one lifecycle actor. Every method only enqueues; the
/// actor applies events one at a time in arrival order.
#[derive(Debug, Clone)]
pub struct PresenceLifecycleHandle {
    session_id: Uuid,
    tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LifecycleState>,
    removal: watch::Receiver<Option<RemovalReason>>,
}

impl PresenceLifecycleHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.clone()
    }

    pub fn removal_reason(&self) -> Option<RemovalReason> {
        *self.removal.borrow()
    }

    fn send(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            debug!("📍 Presence manager {} already stopped", self.session_id);
        }
    }

    pub async fn enter_matching_context(
        &self,
        role: Role,
        destination: DestinationCategory,
        location: GeoPoint,
    ) -> Result<(), PresenceError> {
        if !location.is_valid() {
            return Err(PresenceError::InvalidLocation);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Enter {
                role,
                destination,
                location,
                reply,
            })
            .map_err(|_| PresenceError::ManagerStopped)?;
        rx.await.map_err(|_| PresenceError::ManagerStopped)?
    }

    pub fn location_tick(&self, location: GeoPoint) {
        self.send(Command::LocationTick(location));
    }

    pub fn app_background(&self) {
        self.send(Command::AppBackground);
    }

    pub fn app_foreground(&self) {
        self.send(Command::AppForeground);
    }

    pub fn navigate_away(&self) {
        self.send(Command::NavigateAway);
    }

    pub fn connectivity_lost(&self) {
        self.send(Command::ConnectivityLost);
    }

    pub fn connectivity_restored(&self) {
        self.send(Command::ConnectivityRestored);
    }

    /// State once every event sent before this call has been applied.
    pub async fn settled_state(&self) -> LifecycleState {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Settle { reply }).is_err() {
            return self.state();
        }
        rx.await.unwrap_or_else(|_| self.state())
    }

    /// Removes the record (single best-effort attempt) and stops the actor.
    pub async fn terminate(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Terminate { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

#[derive(Debug, Clone)]
struct Published {
    path: PresencePath,
    record: PresenceRecord,
}

#[derive(Debug)]
enum Phase {
    Inactive,
    Active(Published),
    Maintained(Published),
    Suspended {
        published: Published,
        grace_deadline: Instant,
    },
    Removed {
        pending_delete: Option<PresencePath>,
    },
}

impl Phase {
    fn state(&self) -> LifecycleState {
        match self {
            Phase::Inactive => LifecycleState::Inactive,
            Phase::Active(_) => LifecycleState::Active,
            Phase::Maintained(_) => LifecycleState::Maintained,
            Phase::Suspended { .. } => LifecycleState::Suspended,
            Phase::Removed { .. } => LifecycleState::Removed,
        }
    }

    fn published(&self) -> Option<&Published> {
        match self {
            Phase::Active(p) | Phase::Maintained(p) => Some(p),
            Phase::Suspended { published, .. } => Some(published),
            Phase::Inactive | Phase::Removed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryKind {
    Write,
    Delete,
}

#[derive(Debug, Clone, Copy)]
struct Retry {
    kind: RetryKind,
    attempt: u32,
    at: Instant,
}

pub struct PresenceLifecycleManager {
    user_id: String,
    session_id: Uuid,
    store: Arc<dyn PresenceStore>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
    events: EventBus,
    state_tx: watch::Sender<LifecycleState>,
    removal_tx: watch::Sender<Option<RemovalReason>>,
    phase: Phase,
    foreground: bool,
    last_location: Option<GeoPoint>,
    last_updated_at: u64,
    throttle: UpdateThrottler<GeoPoint>,
    origin: Instant,
    retry: Option<Retry>,
    finished: bool,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl PresenceLifecycleManager {
    /// Starts the actor for one matching session and returns its handle.
    /// Must be called inside a tokio runtime.
    pub fn spawn(
        user_id: impl Into<String>,
        store: Arc<dyn PresenceStore>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
        events: EventBus,
    ) -> PresenceLifecycleHandle {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LifecycleState::Inactive);
        let (removal_tx, removal_rx) = watch::channel(None);

        let manager = Self {
            user_id: user_id.into(),
            session_id,
            store,
            clock,
            throttle: UpdateThrottler::new()
                .with_stream(ThrottleStream::LocationPublish, config.throttle_ms),
            config,
            events,
            state_tx,
            removal_tx,
            phase: Phase::Inactive,
            foreground: true,
            last_location: None,
            last_updated_at: 0,
            origin: Instant::now(),
            retry: None,
            finished: false,
        };
        tokio::spawn(manager.run(rx));

        PresenceLifecycleHandle {
            session_id,
            tx,
            state: state_rx,
            removal: removal_rx,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!(
            "📍 Presence session {} started for user {}",
            self.session_id, self.user_id
        );
        loop {
            let grace = match &self.phase {
                Phase::Suspended { grace_deadline, .. } => Some(*grace_deadline),
                _ => None,
            };
            let flush = self
                .throttle
                .next_flush()
                .map(|(_, at_ms)| self.origin + Duration::from_millis(at_ms));
            let retry = self.retry.map(|r| r.at);

            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => {
                        // Every handle is gone; nobody can ever remove the
                        // record after this point.
                        if !self.phase.state().is_terminal() {
                            self.remove(RemovalReason::Terminated, true).await;
                        }
                        self.drain_pending_delete().await;
                        break;
                    }
                },
                _ = sleep_until_opt(grace) => self.on_grace_expired().await,
                _ = sleep_until_opt(flush) => self.on_flush_due().await,
                _ = sleep_until_opt(retry) => self.on_retry_due().await,
            }
            if self.finished {
                break;
            }
        }
        debug!("📍 Presence session {} stopped", self.session_id);
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn next_updated_at(&mut self) -> u64 {
        let now = self.clock.now_millis().max(self.last_updated_at + 1);
        self.last_updated_at = now;
        now
    }

    fn set_phase(&mut self, phase: Phase) {
        let before = self.phase.state();
        self.phase = phase;
        let after = self.phase.state();
        if before != after {
            info!(
                "📍 Presence {} {:?} -> {:?}",
                self.session_id, before, after
            );
            self.state_tx.send_replace(after);
            self.events.emit(RendererEvent::PresenceStateChanged(after));
        }
    }

    async fn store_write(&self, path: &PresencePath, record: &PresenceRecord) -> Result<(), StoreError> {
        match timeout(self.config.store_timeout(), self.store.write(path, record)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }

    async fn store_remove(&self, path: &PresencePath) -> Result<(), StoreError> {
        match timeout(self.config.store_timeout(), self.store.remove(path)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }

    fn schedule_retry(&mut self, kind: RetryKind, attempt: u32) {
        let at = Instant::now() + self.config.retry_delay(attempt);
        self.retry = Some(Retry { kind, attempt, at });
    }

    fn write_failed(&mut self, err: &StoreError) {
        warn!("📍 Presence write failed for {}: {}", self.user_id, err);
        self.events.emit(RendererEvent::WriteFailed(err.to_string()));
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Enter {
                role,
                destination,
                location,
                reply,
            } => {
                let result = self.on_enter(role, destination, location).await;
                let _ = reply.send(result);
            }
            Command::LocationTick(location) => self.on_location_tick(location).await,
            Command::AppBackground => self.on_app_background(),
            Command::AppForeground => self.on_app_foreground(),
            Command::NavigateAway => self.on_navigate_away().await,
            Command::ConnectivityLost => self.on_connectivity_lost(),
            Command::ConnectivityRestored => self.on_connectivity_restored().await,
            Command::Terminate { reply } => {
                self.on_terminate().await;
                let _ = reply.send(());
            }
            Command::Settle { reply } => {
                let _ = reply.send(self.phase.state());
            }
        }
    }

    async fn on_enter(
        &mut self,
        role: Role,
        destination: DestinationCategory,
        location: GeoPoint,
    ) -> Result<(), PresenceError> {
        match &self.phase {
            Phase::Removed { .. } => {
                warn!("📍 Enter ignored: session {} has ended", self.session_id);
                return Err(PresenceError::SessionEnded);
            }
            Phase::Suspended { .. } => return Err(PresenceError::ConnectivitySuspended),
            Phase::Inactive | Phase::Active(_) | Phase::Maintained(_) => {}
        }

        let path = PresencePath::new(role, destination, self.user_id.clone());

        // Switching partition: the old key must go first or the user would
        // be listed twice.
        if let Some(old) = self.phase.published().filter(|p| p.path != path).cloned() {
            if let Err(e) = self.store_remove(&old.path).await {
                self.write_failed(&e);
                return Err(PresenceError::Write(e));
            }
            self.set_phase(Phase::Inactive);
        }

        let record = PresenceRecord {
            user_id: self.user_id.clone(),
            role,
            destination_category: destination,
            location,
            updated_at: self.next_updated_at(),
        };

        let attempts = self.config.enter_attempts.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.store_write(&path, &record).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    warn!(
                        "📍 Enter write attempt {}/{} failed: {}",
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_err = Some(e);
                    if attempt + 1 < attempts {
                        sleep(self.config.retry_delay(attempt)).await;
                    }
                }
            }
        }
        if let Some(e) = last_err {
            self.write_failed(&e);
            return Err(PresenceError::Write(e));
        }

        self.last_location = Some(location);
        self.throttle.cancel_all();
        self.retry = None;
        // Entering never implies the app came back to the foreground.
        let published = Published { path, record };
        if self.foreground {
            self.set_phase(Phase::Active(published));
        } else {
            self.set_phase(Phase::Maintained(published));
        }
        Ok(())
    }

    async fn on_location_tick(&mut self, location: GeoPoint) {
        if !location.is_valid() {
            warn!("📍 Ignoring invalid location tick");
            return;
        }
        self.last_location = Some(location);

        match &mut self.phase {
            Phase::Active(_) | Phase::Maintained(_) => {}
            Phase::Suspended { published, .. } => {
                // Held for the write that follows reconnection.
                published.record.location = location;
                return;
            }
            Phase::Inactive | Phase::Removed { .. } => return,
        }

        let now = self.now_ms();
        match self.throttle.offer(ThrottleStream::LocationPublish, now, location) {
            Offer::Proceed(location) => self.publish(location).await,
            Offer::Deferred { flush_at_ms } => {
                debug!("📍 Location publish deferred until +{}ms", flush_at_ms)
            }
        }
    }

    async fn on_flush_due(&mut self) {
        let now = self.now_ms();
        if let Some(location) = self.throttle.take_due(ThrottleStream::LocationPublish, now) {
            self.publish(location).await;
        }
    }

    async fn publish(&mut self, location: GeoPoint) {
        let updated_at = self.next_updated_at();
        let (path, record) = match &mut self.phase {
            Phase::Active(p) | Phase::Maintained(p) => {
                p.record.location = location;
                p.record.updated_at = updated_at;
                (p.path.clone(), p.record.clone())
            }
            _ => return,
        };
        match self.store_write(&path, &record).await {
            Ok(()) => {
                if matches!(self.retry, Some(r) if r.kind == RetryKind::Write) {
                    self.retry = None;
                }
            }
            Err(e) => {
                self.write_failed(&e);
                self.schedule_retry(RetryKind::Write, 0);
            }
        }
    }

    fn on_app_background(&mut self) {
        self.foreground = false;
        if let Phase::Active(p) = &self.phase {
            let p = p.clone();
            self.set_phase(Phase::Maintained(p));
        }
    }

    fn on_app_foreground(&mut self) {
        self.foreground = true;
        if let Phase::Maintained(p) = &self.phase {
            let p = p.clone();
            self.set_phase(Phase::Active(p));
        }
    }

    async fn on_navigate_away(&mut self) {
        match self.phase.state() {
            LifecycleState::Active | LifecycleState::Maintained | LifecycleState::Suspended => {
                if !self.foreground {
                    info!(
                        "📍 Navigate-away while backgrounded; keeping presence for {}",
                        self.user_id
                    );
                    return;
                }
                self.remove(RemovalReason::NavigatedAway, true).await;
            }
            LifecycleState::Inactive => debug!("📍 Navigate-away before publishing; nothing to do"),
            LifecycleState::Removed => {
                warn!("📍 Navigate-away ignored: session {} has ended", self.session_id)
            }
        }
    }

    fn on_connectivity_lost(&mut self) {
        let published = match &self.phase {
            Phase::Active(p) | Phase::Maintained(p) => p.clone(),
            _ => {
                debug!("📍 Connectivity lost in {:?}; no change", self.phase.state());
                return;
            }
        };
        self.throttle.cancel_all();
        self.retry = None;
        let grace_deadline = Instant::now() + Duration::from_millis(self.config.grace_ms);
        self.set_phase(Phase::Suspended {
            published,
            grace_deadline,
        });
    }

    async fn on_connectivity_restored(&mut self) {
        match &self.phase {
            Phase::Suspended { published, .. } => {
                let mut published = published.clone();
                if let Some(location) = self.last_location {
                    published.record.location = location;
                }
                published.record.updated_at = self.next_updated_at();
                let path = published.path.clone();
                let record = published.record.clone();
                let resumed = if self.foreground {
                    Phase::Active(published)
                } else {
                    Phase::Maintained(published)
                };
                self.set_phase(resumed);

                // The store may have expired the record while we were away.
                if let Err(e) = self.store_write(&path, &record).await {
                    self.write_failed(&e);
                    self.schedule_retry(RetryKind::Write, 0);
                }
            }
            Phase::Removed {
                pending_delete: Some(_),
            } => self.retry_pending_delete(0, false).await,
            _ => debug!("📍 Connectivity restored in {:?}; no change", self.phase.state()),
        }
    }

    async fn on_grace_expired(&mut self) {
        if matches!(self.phase, Phase::Suspended { .. }) {
            info!(
                "📍 Grace period of {}ms elapsed for {}",
                self.config.grace_ms, self.user_id
            );
            self.remove(RemovalReason::GraceExpired, true).await;
        }
    }

    async fn on_terminate(&mut self) {
        if self.phase.state().is_terminal() {
            self.retry_pending_delete(0, false).await;
        } else {
            self.remove(RemovalReason::Terminated, false).await;
        }
        self.finished = true;
    }

    async fn on_retry_due(&mut self) {
        let Some(retry) = self.retry.take() else {
            return;
        };
        match retry.kind {
            RetryKind::Write => {
                let (path, record) = match &self.phase {
                    Phase::Active(p) | Phase::Maintained(p) => (p.path.clone(), p.record.clone()),
                    _ => return,
                };
                if let Err(e) = self.store_write(&path, &record).await {
                    warn!(
                        "📍 Presence write retry {} failed: {}",
                        retry.attempt + 1,
                        e
                    );
                    self.schedule_retry(RetryKind::Write, retry.attempt + 1);
                }
            }
            RetryKind::Delete => self.retry_pending_delete(retry.attempt + 1, true).await,
        }
    }

    async fn retry_pending_delete(&mut self, attempt: u32, reschedule: bool) {
        let Phase::Removed {
            pending_delete: Some(path),
        } = &self.phase
        else {
            return;
        };
        let path = path.clone();
        match self.store_remove(&path).await {
            Ok(()) => {
                info!("📍 Pending presence delete for {} completed", path);
                self.phase = Phase::Removed {
                    pending_delete: None,
                };
                self.retry = None;
            }
            Err(e) => {
                warn!("📍 Presence delete retry failed for {}: {}", path, e);
                if reschedule && attempt < self.config.delete_retries {
                    self.schedule_retry(RetryKind::Delete, attempt);
                }
            }
        }
    }

    /// Spends the remaining delete retries once no more events can arrive,
    /// then makes one last attempt.
    async fn drain_pending_delete(&mut self) {
        while matches!(
            self.phase,
            Phase::Removed {
                pending_delete: Some(_)
            }
        ) {
            match self.retry {
                Some(retry) if retry.kind == RetryKind::Delete => {
                    sleep_until(retry.at).await;
                    self.on_retry_due().await;
                }
                _ => {
                    self.retry_pending_delete(self.config.delete_retries, false)
                        .await;
                    break;
                }
            }
        }
        if let Phase::Removed {
            pending_delete: Some(path),
        } = &self.phase
        {
            warn!("📍 Giving up on presence delete for {}", path);
        }
    }

    /// Moves to `Removed` and deletes the record. With `retry` a failed
    /// delete is retried on a backoff schedule; either way it is retried on
    /// the next connectivity restoration.
    async fn remove(&mut self, reason: RemovalReason, retry: bool) {
        let path = self.phase.published().map(|p| p.path.clone());
        self.throttle.cancel_all();
        self.retry = None;
        self.removal_tx.send_replace(Some(reason));
        self.set_phase(Phase::Removed {
            pending_delete: path.clone(),
        });
        info!("📍 Presence removed for {} ({:?})", self.user_id, reason);

        let Some(path) = path else {
            return;
        };
        match self.store_remove(&path).await {
            Ok(()) => {
                self.phase = Phase::Removed {
                    pending_delete: None,
                };
            }
            Err(e) => {
                warn!("📍 Presence delete failed for {}: {}", path, e);
                if retry && self.config.delete_retries > 0 {
                    self.schedule_retry(RetryKind::Delete, 0);
                }
            }
        }
    }
}
