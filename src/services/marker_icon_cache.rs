use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::models::{ClusterOrMarker, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CountBucket {
    Single,
    Few,
    Tens,
    Hundreds,
}

impl CountBucket {
    pub fn for_count(count: usize) -> Self {
        match count {
            0 | 1 => CountBucket::Single,
            2..=9 => CountBucket::Few,
            10..=99 => CountBucket::Tens,
            _ => CountBucket::Hundreds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkerIconKey {
    pub role: Role,
    pub bucket: CountBucket,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkerIcon {
    pub asset: String,
    pub badge: Option<String>,
}

pub fn build_icon(key: &MarkerIconKey) -> MarkerIcon {
    let badge = match key.bucket {
        CountBucket::Single => None,
        CountBucket::Few => Some("2+".to_string()),
        CountBucket::Tens => Some("10+".to_string()),
        CountBucket::Hundreds => Some("100+".to_string()),
    };
    let shape = if key.bucket == CountBucket::Single {
        "pin"
    } else {
        "cluster"
    };
    MarkerIcon {
        asset: format!("markers/{}_{}.png", key.role.as_str(), shape),
        badge,
    }
}

/// Fixed-capacity icon cache; the least recently used entry is evicted
/// when full. Purely advisory: a miss only costs a rebuild.
#[derive(Debug)]
pub struct MarkerIconCache {
    cache: LruCache<MarkerIconKey, Arc<MarkerIcon>>,
    hits: u64,
    misses: u64,
}

impl MarkerIconCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get_or_build<F>(&mut self, key: MarkerIconKey, build: F) -> Arc<MarkerIcon>
    where
        F: FnOnce(&MarkerIconKey) -> MarkerIcon,
    {
        if let Some(icon) = self.cache.get(&key) {
            self.hits += 1;
            return icon.clone();
        }
        self.misses += 1;
        let icon = Arc::new(build(&key));
        self.cache.put(key, icon.clone());
        icon
    }

    pub fn icon_for(&mut self, item: &ClusterOrMarker, role: Role) -> Arc<MarkerIcon> {
        let key = MarkerIconKey {
            role,
            bucket: CountBucket::for_count(item.weight()),
        };
        self.get_or_build(key, build_icon)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
