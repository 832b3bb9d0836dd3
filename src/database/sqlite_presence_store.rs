use async_trait::async_trait;
use futures::StreamExt;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::warn;

use crate::database::presence_store::{PresenceDelta, PresenceStore, StoreEvent, StoreEventStream};
use crate::error::StoreError;
use crate::models::{GeoPoint, PartitionKey, PresencePath, PresenceRecord};

pub const SQL_CREATE_PRESENCE_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS presence_records (
    role TEXT NOT NULL,
    destination TEXT NOT NULL,
    user_id TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (role, destination, user_id)
)
"#;

pub const SQL_UPSERT_PRESENCE: &str = r#"
INSERT INTO presence_records (role, destination, user_id, latitude, longitude, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT (role, destination, user_id) DO UPDATE SET
    latitude = excluded.latitude,
    longitude = excluded.longitude,
    updated_at = excluded.updated_at
"#;

pub const SQL_DELETE_PRESENCE: &str = r#"
DELETE FROM presence_records
WHERE role = ?1 AND destination = ?2 AND user_id = ?3
"#;

pub const SQL_LIST_PARTITION: &str = r#"
SELECT role, destination, user_id, latitude, longitude, updated_at
FROM presence_records
WHERE role = ?1 AND destination = ?2
ORDER BY user_id
"#;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PresenceRow {
    pub role: String,
    pub destination: String,
    pub user_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub updated_at: i64,
}

impl PresenceRow {
    fn into_record(self) -> Option<PresenceRecord> {
        let role = self.role.parse().ok()?;
        let destination_category = self.destination.parse().ok()?;
        Some(PresenceRecord {
            user_id: self.user_id,
            role,
            destination_category,
            location: GeoPoint::new(self.latitude, self.longitude),
            updated_at: self.updated_at.max(0) as u64,
        })
    }
}

/// Presence store on a shared SQLite file. SQLite has no change feed, so
/// subscriptions poll the partition and diff consecutive reads.
#[derive(Debug, Clone)]
pub struct SqlitePresenceStore {
    pool: SqlitePool,
    poll_interval: Duration,
}

impl SqlitePresenceStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Self::new(pool).await
    }

    pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(SQL_CREATE_PRESENCE_RECORDS).execute(&pool).await?;
        Ok(Self {
            pool,
            poll_interval: Duration::from_millis(1_000),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn list_partition(
        &self,
        partition: PartitionKey,
    ) -> Result<Vec<PresenceRecord>, StoreError> {
        list_partition(&self.pool, partition).await
    }
}

async fn list_partition(
    pool: &SqlitePool,
    partition: PartitionKey,
) -> Result<Vec<PresenceRecord>, StoreError> {
    let rows = sqlx::query_as::<_, PresenceRow>(SQL_LIST_PARTITION)
        .bind(partition.role.as_str())
        .bind(partition.destination.as_str())
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let user_id = row.user_id.clone();
            let record = row.into_record();
            if record.is_none() {
                warn!("📍 Skipping malformed presence row for user {}", user_id);
            }
            record
        })
        .collect())
}

fn diff(
    previous: &BTreeMap<String, PresenceRecord>,
    current: &BTreeMap<String, PresenceRecord>,
) -> Vec<StoreEvent> {
    let mut events = Vec::new();
    for (user_id, record) in current {
        if previous.get(user_id) != Some(record) {
            events.push(StoreEvent::Delta(PresenceDelta::Upsert(record.clone())));
        }
    }
    for (user_id, record) in previous {
        if !current.contains_key(user_id) {
            events.push(StoreEvent::Delta(PresenceDelta::Removed(record.path())));
        }
    }
    events
}

struct PollState {
    pool: SqlitePool,
    partition: PartitionKey,
    poll_interval: Duration,
    seen: Option<BTreeMap<String, PresenceRecord>>,
    queued: VecDeque<StoreEvent>,
    broken: bool,
}

#[async_trait]
impl PresenceStore for SqlitePresenceStore {
    async fn write(&self, path: &PresencePath, record: &PresenceRecord) -> Result<(), StoreError> {
        sqlx::query(SQL_UPSERT_PRESENCE)
            .bind(path.partition.role.as_str())
            .bind(path.partition.destination.as_str())
            .bind(&path.user_id)
            .bind(record.location.latitude)
            .bind(record.location.longitude)
            .bind(record.updated_at as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove(&self, path: &PresencePath) -> Result<(), StoreError> {
        sqlx::query(SQL_DELETE_PRESENCE)
            .bind(path.partition.role.as_str())
            .bind(path.partition.destination.as_str())
            .bind(&path.user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, partition: PartitionKey) -> Result<StoreEventStream, StoreError> {
        let state = PollState {
            pool: self.pool.clone(),
            partition,
            poll_interval: self.poll_interval,
            seen: None,
            queued: VecDeque::new(),
            broken: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.queued.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.broken {
                    return None;
                }
                if state.seen.is_some() {
                    tokio::time::sleep(state.poll_interval).await;
                }
                let records = match list_partition(&state.pool, state.partition).await {
                    Ok(records) => records,
                    Err(e) => {
                        state.broken = true;
                        return Some((Err(e), state));
                    }
                };
                let current = records
                    .into_iter()
                    .map(|r| (r.user_id.clone(), r))
                    .collect::<BTreeMap<_, _>>();
                match &state.seen {
                    None => state
                        .queued
                        .push_back(StoreEvent::FullSnapshot(current.values().cloned().collect())),
                    Some(previous) => state.queued.extend(diff(previous, &current)),
                }
                state.seen = Some(current);
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DestinationCategory, Role};

    async fn memory_store() -> SqlitePresenceStore {
        // One connection: every connection to :memory: is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqlitePresenceStore::new(pool)
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(10))
    }

    fn record(user: &str, lat: f64, updated_at: u64) -> PresenceRecord {
        PresenceRecord {
            user_id: user.to_string(),
            role: Role::Provider,
            destination_category: DestinationCategory::Local,
            location: GeoPoint::new(lat, 4.9),
            updated_at,
        }
    }

    #[tokio::test]
    async fn write_overwrites_same_key() {
        let store = memory_store().await;
        let first = record("p1", 52.0, 1);
        let second = record("p1", 52.1, 2);
        store.write(&first.path(), &first).await.unwrap();
        store.write(&second.path(), &second).await.unwrap();

        let rows = store.list_partition(first.path().partition).await.unwrap();
        assert_eq!(rows, vec![second.clone()]);

        store.remove(&second.path()).await.unwrap();
        assert!(store.list_partition(first.path().partition).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscription_polls_snapshot_then_deltas() {
        let store = memory_store().await;
        let a = record("a", 52.0, 1);
        store.write(&a.path(), &a).await.unwrap();

        let mut stream = store.subscribe(a.path().partition).await.unwrap();
        assert_eq!(
            stream.next().await,
            Some(Ok(StoreEvent::FullSnapshot(vec![a.clone()])))
        );

        let b = record("b", 52.2, 5);
        store.write(&b.path(), &b).await.unwrap();
        store.remove(&a.path()).await.unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            seen.push(stream.next().await.unwrap().unwrap());
        }
        assert!(seen.contains(&StoreEvent::Delta(PresenceDelta::Upsert(b))));
        assert!(seen.contains(&StoreEvent::Delta(PresenceDelta::Removed(a.path()))));
    }

    #[test]
    fn diff_reports_changes_only() {
        let a = record("a", 1.0, 1);
        let b = record("b", 2.0, 1);
        let previous = BTreeMap::from([("a".to_string(), a.clone()), ("b".to_string(), b.clone())]);
        let moved = record("a", 1.5, 2);
        let current = BTreeMap::from([("a".to_string(), moved.clone())]);
        assert_eq!(
            diff(&previous, &current),
            vec![
                StoreEvent::Delta(PresenceDelta::Upsert(moved)),
                StoreEvent::Delta(PresenceDelta::Removed(b.path())),
            ]
        );
    }
}
