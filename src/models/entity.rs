use serde::Serialize;

use crate::models::{GeoPoint, PresenceRecord, Role};

// Viewer-side projection of a counterpart's record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub user_id: String,
    pub role: Role,
    pub location: GeoPoint,
}

impl From<&PresenceRecord> for Entity {
    fn from(record: &PresenceRecord) -> Self {
        Self {
            user_id: record.user_id.clone(),
            role: record.role,
            location: record.location,
        }
    }
}

/// Grid bucket identity: `(floor(lat / cell), floor(lng / cell))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CellId {
    pub row: i64,
    pub col: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ClusterOrMarker {
    Marker(Entity),
    Cluster {
        center: GeoPoint,
        count: usize,
        cell_id: CellId,
    },
}

impl ClusterOrMarker {
    /// Number of entities this item stands for.
    pub fn weight(&self) -> usize {
        match self {
            ClusterOrMarker::Marker(_) => 1,
            ClusterOrMarker::Cluster { count, .. } => *count,
        }
    }
}
