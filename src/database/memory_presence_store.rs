use async_trait::async_trait;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::database::presence_store::{PresenceDelta, PresenceStore, StoreEvent, StoreEventStream};
use crate::error::StoreError;
use crate::models::{PartitionKey, PresencePath, PresenceRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Write(PresencePath, PresenceRecord),
    Remove(PresencePath),
    Subscribe(PartitionKey),
}

#[derive(Debug, Clone)]
enum Feed {
    Delta(PartitionKey, PresenceDelta),
    Fault(StoreError),
}

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<PresencePath, PresenceRecord>,
    ops: Vec<StoreOp>,
    failure: Option<StoreError>,
    scripted_failures: Vec<StoreError>,
    latency: Option<Duration>,
}

/// In-process store. Every attempted operation is logged (including failed
/// ones) and failures can be injected either permanently (`set_failure`) or
/// for the next N operations (`fail_next`). `set_latency` makes writes and
/// removals hang before they land.
#[derive(Debug, Clone)]
pub struct MemoryPresenceStore {
    inner: Arc<Mutex<Inner>>,
    feed: broadcast::Sender<Feed>,
}

impl Default for MemoryPresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            feed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not wedge the rest of the suite.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_failure(&self, failure: Option<StoreError>) {
        self.lock().failure = failure;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn fail_next(&self, count: usize, error: StoreError) {
        let mut inner = self.lock();
        for _ in 0..count {
            inner.scripted_failures.push(error.clone());
        }
    }

    /// Breaks every open subscription stream.
    pub fn drop_subscribers(&self, error: StoreError) {
        let _ = self.feed.send(Feed::Fault(error));
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    pub fn get(&self, path: &PresencePath) -> Option<PresenceRecord> {
        self.lock().records.get(path).cloned()
    }

    pub fn records_for_user(&self, user_id: &str) -> Vec<PresenceRecord> {
        self.lock()
            .records
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(inner: &mut Inner) -> Result<(), StoreError> {
        if let Some(err) = &inner.failure {
            return Err(err.clone());
        }
        if !inner.scripted_failures.is_empty() {
            return Err(inner.scripted_failures.remove(0));
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn write(&self, path: &PresencePath, record: &PresenceRecord) -> Result<(), StoreError> {
        self.lock()
            .ops
            .push(StoreOp::Write(path.clone(), record.clone()));
        self.delay().await;
        {
            let mut inner = self.lock();
            Self::check(&mut inner)?;
            inner.records.insert(path.clone(), record.clone());
        }
        let _ = self.feed.send(Feed::Delta(
            path.partition,
            PresenceDelta::Upsert(record.clone()),
        ));
        Ok(())
    }

    async fn remove(&self, path: &PresencePath) -> Result<(), StoreError> {
        self.lock().ops.push(StoreOp::Remove(path.clone()));
        self.delay().await;
        let existed = {
            let mut inner = self.lock();
            Self::check(&mut inner)?;
            inner.records.remove(path).is_some()
        };
        if existed {
            let _ = self
                .feed
                .send(Feed::Delta(path.partition, PresenceDelta::Removed(path.clone())));
        }
        Ok(())
    }

    async fn subscribe(&self, partition: PartitionKey) -> Result<StoreEventStream, StoreError> {
        // Receiver is taken under the lock so no delta slips between the
        // snapshot and the live feed.
        let (snapshot, rx) = {
            let mut inner = self.lock();
            inner.ops.push(StoreOp::Subscribe(partition));
            Self::check(&mut inner)?;
            let snapshot = inner
                .records
                .iter()
                .filter(|(path, _)| path.partition == partition)
                .map(|(_, record)| record.clone())
                .collect::<Vec<_>>();
            (snapshot, self.feed.subscribe())
        };

        let live = BroadcastStream::new(rx).filter_map(move |item| async move {
            match item {
                Ok(Feed::Delta(key, delta)) if key == partition => Some(Ok(StoreEvent::Delta(delta))),
                Ok(Feed::Delta(..)) => None,
                Ok(Feed::Fault(err)) => Some(Err(err)),
                // Missed deltas cannot be repaired incrementally.
                Err(BroadcastStreamRecvError::Lagged(n)) => Some(Err(StoreError::Backend(format!(
                    "change feed lagged by {} events",
                    n
                )))),
            }
        });

        let first = futures::stream::once(async move { Ok(StoreEvent::FullSnapshot(snapshot)) });
        // A fault is delivered and then ends the stream.
        let stream = futures::stream::unfold(
            (first.chain(live).boxed(), false),
            |(mut inner, broken)| async move {
                if broken {
                    return None;
                }
                let item = inner.next().await?;
                let broken = item.is_err();
                Some((item, (inner, broken)))
            },
        );
        Ok(stream.boxed())
    }
}
