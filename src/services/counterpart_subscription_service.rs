use futures::StreamExt;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SubscriptionConfig;
use crate::database::presence_store::{PresenceDelta, PresenceStore, StoreEvent};
use crate::error::SubscriptionError;
use crate::models::{Entity, EventBus, PartitionKey, PresenceRecord, RendererEvent};

/// Exponential backoff with jitter in `[d/2, d]`.
pub fn backoff_delay(config: &SubscriptionConfig, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
    let ceiling = config
        .backoff_base_ms
        .saturating_mul(factor)
        .min(config.backoff_cap_ms);
    let floor = ceiling / 2;
    let ms = if ceiling > floor {
        rand::thread_rng().gen_range(floor..=ceiling)
    } else {
        ceiling
    };
    Duration::from_millis(ms)
}

/// Live view of one counterpart partition. Dropping the handle cancels the
/// background task and releases the store subscription.
#[derive(Debug)]
pub struct CounterpartSubscription {
    partition: PartitionKey,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    entities: watch::Receiver<Vec<Entity>>,
}

impl CounterpartSubscription {
    pub fn spawn(
        store: Arc<dyn PresenceStore>,
        partition: PartitionKey,
        viewer_user_id: impl Into<String>,
        config: SubscriptionConfig,
        events: EventBus,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (paused_tx, paused_rx) = watch::channel(false);
        let (entities_tx, entities_rx) = watch::channel(Vec::new());

        let worker = Worker {
            store,
            partition,
            viewer_user_id: viewer_user_id.into(),
            config,
            events,
            out: entities_tx,
            stale: false,
        };
        tokio::spawn(worker.run(cancel.clone(), paused_rx));

        Self {
            partition,
            cancel,
            paused: paused_tx,
            entities: entities_rx,
        }
    }

    pub fn partition(&self) -> PartitionKey {
        self.partition
    }

    pub fn entities(&self) -> watch::Receiver<Vec<Entity>> {
        self.entities.clone()
    }

    pub fn current(&self) -> Vec<Entity> {
        self.entities.borrow().clone()
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for CounterpartSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Outcome {
    Paused,
    Closed,
    Failed {
        error: SubscriptionError,
        had_snapshot: bool,
    },
}

struct Worker {
    store: Arc<dyn PresenceStore>,
    partition: PartitionKey,
    viewer_user_id: String,
    config: SubscriptionConfig,
    events: EventBus,
    out: watch::Sender<Vec<Entity>>,
    stale: bool,
}

impl Worker {
    async fn run(mut self, cancel: CancellationToken, mut paused: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        let mut failing_since: Option<Instant> = None;

        loop {
            while *paused.borrow_and_update() {
                debug!("📍 Subscription {} paused", self.partition);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = paused.changed() => if changed.is_err() { return },
                }
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.consume(&mut paused) => outcome,
            };

            match outcome {
                Outcome::Paused => {
                    attempt = 0;
                    failing_since = None;
                }
                Outcome::Closed => break,
                Outcome::Failed {
                    error,
                    had_snapshot,
                } => {
                    if had_snapshot {
                        attempt = 0;
                        failing_since = None;
                    }
                    let since = *failing_since.get_or_insert_with(Instant::now);
                    let delay = backoff_delay(&self.config, attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        "📍 Subscription {} dropped ({}); resubscribing in {:?}",
                        self.partition, error, delay
                    );

                    let outage = since.elapsed() + delay;
                    if !self.stale && outage >= Duration::from_millis(self.config.stale_after_ms) {
                        self.stale = true;
                        self.events.emit(RendererEvent::SubscriptionStale(true));
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
        info!("📍 Subscription {} released", self.partition);
    }

    fn accepts(&self, record: &PresenceRecord) -> bool {
        record.user_id != self.viewer_user_id
            && record.role == self.partition.role
            && record.destination_category == self.partition.destination
    }

    fn publish(&self, members: &BTreeMap<String, Entity>) {
        self.out.send_replace(members.values().cloned().collect());
    }

    /// One subscription lifetime: snapshot first, then deltas until the feed
    /// breaks or the subscription is paused.
    async fn consume(&mut self, paused: &mut watch::Receiver<bool>) -> Outcome {
        let mut stream = match self.store.subscribe(self.partition).await {
            Ok(stream) => stream,
            Err(e) => {
                return Outcome::Failed {
                    error: e.into(),
                    had_snapshot: false,
                }
            }
        };

        let mut members: BTreeMap<String, Entity> = BTreeMap::new();
        let mut had_snapshot = false;

        loop {
            tokio::select! {
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Outcome::Closed;
                    }
                    if *paused.borrow() {
                        return Outcome::Paused;
                    }
                }
                item = stream.next() => match item {
                    Some(Ok(StoreEvent::FullSnapshot(records))) => {
                        members = records
                            .iter()
                            .filter(|r| self.accepts(r))
                            .map(|r| (r.user_id.clone(), Entity::from(r)))
                            .collect();
                        had_snapshot = true;
                        self.publish(&members);
                        if self.stale {
                            self.stale = false;
                            self.events.emit(RendererEvent::SubscriptionStale(false));
                        }
                    }
                    Some(Ok(StoreEvent::Delta(delta))) => {
                        if !had_snapshot {
                            debug!("📍 Delta before snapshot on {}; ignored", self.partition);
                            continue;
                        }
                        let changed = match delta {
                            PresenceDelta::Upsert(record) if self.accepts(&record) => {
                                members.insert(record.user_id.clone(), Entity::from(&record));
                                true
                            }
                            PresenceDelta::Upsert(_) => false,
                            PresenceDelta::Removed(path) => members.remove(&path.user_id).is_some(),
                        };
                        if changed {
                            self.publish(&members);
                        }
                    }
                    Some(Err(e)) => {
                        return Outcome::Failed {
                            error: e.into(),
                            had_snapshot,
                        }
                    }
                    None => {
                        return Outcome::Failed {
                            error: SubscriptionError::FeedEnded,
                            had_snapshot,
                        }
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_jitter_band_and_cap() {
        let config = SubscriptionConfig::default();
        for attempt in 0..12 {
            let ceiling = (1_000u64 << attempt).min(30_000);
            let d = backoff_delay(&config, attempt).as_millis() as u64;
            assert!(d >= ceiling / 2 && d <= ceiling, "attempt {} gave {}", attempt, d);
        }
    }
}
