use std::collections::BTreeMap;

use crate::config::MatchConfig;
use crate::error::MatchError;
use crate::models::{CellId, ClusterOrMarker, Entity, GeoPoint};
use crate::services::geo_math::{cell_of, centroid};

#[derive(Debug, Clone)]
pub struct ClusteringEngine {
    pub threshold: usize,
    pub cell_size_degrees: f64,
}

impl ClusteringEngine {
    pub fn new(threshold: usize, cell_size_degrees: f64) -> Result<Self, MatchError> {
        validate_cell_size(cell_size_degrees)?;
        Ok(Self {
            threshold,
            cell_size_degrees,
        })
    }

    pub fn from_config(config: &MatchConfig) -> Result<Self, MatchError> {
        Self::new(config.cluster_threshold, config.cell_size_degrees)
    }

    /// Small sets pass straight through as markers; only sets above the
    /// threshold are bucketed.
    pub fn arrange(&self, entities: Vec<Entity>) -> Result<Vec<ClusterOrMarker>, MatchError> {
        if entities.len() <= self.threshold {
            return Ok(entities.into_iter().map(ClusterOrMarker::Marker).collect());
        }
        cluster(&entities, self.cell_size_degrees)
    }
}

fn validate_cell_size(cell_size_degrees: f64) -> Result<(), MatchError> {
    if !cell_size_degrees.is_finite() || cell_size_degrees <= 0.0 {
        return Err(MatchError::InvalidArgument(format!(
            "cell_size_degrees must be > 0, got {}",
            cell_size_degrees
        )));
    }
    Ok(())
}

/// Buckets entities into grid cells. Output is ordered by cell id and every
/// cell's members are sorted before averaging, so the result depends only on
/// the set of entities, never on their order.
pub fn cluster(
    entities: &[Entity],
    cell_size_degrees: f64,
) -> Result<Vec<ClusterOrMarker>, MatchError> {
    validate_cell_size(cell_size_degrees)?;

    let mut cells: BTreeMap<CellId, Vec<&Entity>> = BTreeMap::new();
    for entity in entities {
        cells
            .entry(cell_of(entity.location, cell_size_degrees))
            .or_default()
            .push(entity);
    }

    let mut out = Vec::with_capacity(cells.len());
    for (cell_id, mut members) in cells {
        if members.len() == 1 {
            out.push(ClusterOrMarker::Marker(members[0].clone()));
            continue;
        }
        members.sort_by(|a, b| {
            a.location
                .latitude
                .total_cmp(&b.location.latitude)
                .then(a.location.longitude.total_cmp(&b.location.longitude))
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        let points = members.iter().map(|e| e.location).collect::<Vec<_>>();
        let center = centroid(&points).unwrap_or(GeoPoint::new(0.0, 0.0));
        out.push(ClusterOrMarker::Cluster {
            center,
            count: members.len(),
            cell_id,
        });
    }
    Ok(out)
}
