use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StoreError;
use crate::models::{PartitionKey, PresencePath, PresenceRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceDelta {
    Upsert(PresenceRecord),
    Removed(PresencePath),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    FullSnapshot(Vec<PresenceRecord>),
    Delta(PresenceDelta),
}

pub type StoreEventStream = BoxStream<'static, Result<StoreEvent, StoreError>>;

/// Shared, keyed, subscribable presence store. Subscriptions start with a
/// full snapshot of the partition and continue with deltas; an `Err` item or
/// the end of the stream means the feed is broken and must be re-established.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn write(&self, path: &PresencePath, record: &PresenceRecord) -> Result<(), StoreError>;

    async fn remove(&self, path: &PresencePath) -> Result<(), StoreError>;

    async fn subscribe(&self, partition: PartitionKey) -> Result<StoreEventStream, StoreError>;
}
