use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::MatchConfig;
use crate::error::MatchError;
use crate::models::{ClusterOrMarker, Entity, EventBus, GeoPoint, RendererEvent};
use crate::services::clustering_service::ClusteringEngine;
use crate::services::proximity_service;
use crate::services::throttle_service::{Offer, ThrottleStream, UpdateThrottler};

#[derive(Debug)]
enum Input {
    Viewer(GeoPoint),
    Radius(f64),
    Attach(watch::Receiver<Vec<Entity>>),
    Detach,
}

/// Recomputes what the viewer should see whenever the counterpart snapshot,
/// the viewer position or the radius changes, throttled so GPS jitter does
/// not thrash the clusters.
#[derive(Debug, Clone)]
pub struct MatchPipelineHandle {
    tx: mpsc::UnboundedSender<Input>,
    results: watch::Receiver<Vec<ClusterOrMarker>>,
    cancel: CancellationToken,
}

impl MatchPipelineHandle {
    pub fn spawn(config: &MatchConfig, events: EventBus) -> Result<Self, MatchError> {
        let engine = ClusteringEngine::from_config(config)?;
        if !config.radius_km.is_finite() || config.radius_km <= 0.0 {
            return Err(MatchError::InvalidArgument(format!(
                "radius_km must be > 0, got {}",
                config.radius_km
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = watch::channel(Vec::new());
        let cancel = CancellationToken::new();

        let pipeline = Pipeline {
            engine,
            events,
            radius_km: config.radius_km,
            viewer: None,
            snapshot: Vec::new(),
            source: None,
            recompute: UpdateThrottler::new()
                .with_stream(ThrottleStream::MatchRecompute, config.recompute_ms),
            recenter: UpdateThrottler::new()
                .with_stream(ThrottleStream::CameraRecenter, config.recenter_ms),
            origin: Instant::now(),
            results: results_tx,
        };
        tokio::spawn(pipeline.run(rx, cancel.clone()));

        Ok(Self {
            tx,
            results: results_rx,
            cancel,
        })
    }

    pub fn viewer_moved(&self, location: GeoPoint) {
        let _ = self.tx.send(Input::Viewer(location));
    }

    pub fn set_radius(&self, radius_km: f64) -> Result<(), MatchError> {
        if !radius_km.is_finite() || radius_km <= 0.0 {
            return Err(MatchError::InvalidArgument(format!(
                "radius_km must be > 0, got {}",
                radius_km
            )));
        }
        let _ = self.tx.send(Input::Radius(radius_km));
        Ok(())
    }

    pub fn attach(&self, entities: watch::Receiver<Vec<Entity>>) {
        let _ = self.tx.send(Input::Attach(entities));
    }

    /// Drops the counterpart source, pending throttled work and the last
    /// results.
    pub fn detach(&self) {
        let _ = self.tx.send(Input::Detach);
    }

    pub fn results(&self) -> watch::Receiver<Vec<ClusterOrMarker>> {
        self.results.clone()
    }

    pub fn current(&self) -> Vec<ClusterOrMarker> {
        self.results.borrow().clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct Pipeline {
    engine: ClusteringEngine,
    events: EventBus,
    radius_km: f64,
    viewer: Option<GeoPoint>,
    snapshot: Vec<Entity>,
    source: Option<watch::Receiver<Vec<Entity>>>,
    recompute: UpdateThrottler<()>,
    recenter: UpdateThrottler<GeoPoint>,
    origin: Instant,
    results: watch::Sender<Vec<ClusterOrMarker>>,
}

async fn source_changed(source: &mut Option<watch::Receiver<Vec<Entity>>>) -> bool {
    match source {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Pipeline {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Input>, cancel: CancellationToken) {
        loop {
            let deadline = [self.recompute.next_flush(), self.recenter.next_flush()]
                .into_iter()
                .flatten()
                .map(|(_, at)| at)
                .min()
                .map(|at| self.origin + Duration::from_millis(at));

            tokio::select! {
                _ = cancel.cancelled() => break,
                input = rx.recv() => match input {
                    Some(input) => self.apply(input),
                    None => break,
                },
                alive = source_changed(&mut self.source) => {
                    if alive {
                        self.pull_snapshot();
                        self.request_recompute();
                    } else {
                        self.source = None;
                    }
                }
                _ = sleep_until_opt(deadline) => self.flush_due(),
            }
        }
        debug!("📍 Match pipeline stopped");
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn pull_snapshot(&mut self) {
        if let Some(rx) = &mut self.source {
            self.snapshot = rx.borrow_and_update().clone();
        }
    }

    fn apply(&mut self, input: Input) {
        match input {
            Input::Viewer(location) => {
                if !location.is_valid() {
                    warn!("📍 Ignoring invalid viewer location");
                    return;
                }
                self.viewer = Some(location);
                self.request_recompute();
                let now = self.now_ms();
                if let Offer::Proceed(location) =
                    self.recenter.offer(ThrottleStream::CameraRecenter, now, location)
                {
                    self.events.emit(RendererEvent::CameraRecenter(location));
                }
            }
            Input::Radius(radius_km) => {
                self.radius_km = radius_km;
                self.request_recompute();
            }
            Input::Attach(rx) => {
                self.source = Some(rx);
                self.pull_snapshot();
                self.request_recompute();
            }
            Input::Detach => {
                self.source = None;
                self.snapshot.clear();
                self.recompute.cancel_all();
                self.recenter.cancel_all();
                self.publish(Vec::new());
            }
        }
    }

    fn request_recompute(&mut self) {
        let now = self.now_ms();
        if let Offer::Proceed(()) = self.recompute.offer(ThrottleStream::MatchRecompute, now, ()) {
            self.recompute_now();
        }
    }

    fn flush_due(&mut self) {
        let now = self.now_ms();
        if self
            .recompute
            .take_due(ThrottleStream::MatchRecompute, now)
            .is_some()
        {
            self.recompute_now();
        }
        if let Some(location) = self.recenter.take_due(ThrottleStream::CameraRecenter, now) {
            self.events.emit(RendererEvent::CameraRecenter(location));
        }
    }

    fn recompute_now(&mut self) {
        let Some(viewer) = self.viewer else {
            debug!("📍 No viewer fix yet; skipping match recompute");
            return;
        };
        let arranged = proximity_service::filter(viewer, self.radius_km, &self.snapshot)
            .and_then(|nearby| self.engine.arrange(nearby));
        match arranged {
            Ok(items) => self.publish(items),
            Err(e) => warn!("📍 Match recompute failed: {}", e),
        }
    }

    fn publish(&self, items: Vec<ClusterOrMarker>) {
        self.results.send_replace(items.clone());
        self.events.emit(RendererEvent::MatchResultsUpdated(items));
    }
}
