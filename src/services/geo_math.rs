use crate::models::{CellId, GeoPoint};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres. The half-angle form stays
/// well-conditioned for tiny separations and wraps across the antimeridian
/// because only `sin(dlon / 2)^2` is used.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let to_rad = |deg: f64| deg.to_radians();
    let dlat = to_rad(b.latitude - a.latitude);
    let dlon = to_rad(b.longitude - a.longitude);
    let h = (dlat / 2.0).sin().powi(2)
        + to_rad(a.latitude).cos() * to_rad(b.latitude).cos() * (dlon / 2.0).sin().powi(2);
    // Rounding can push h a hair above 1 for antipodal points.
    let c = 2.0 * h.clamp(0.0, 1.0).sqrt().asin();
    EARTH_RADIUS_KM * c
}

pub fn cell_of(point: GeoPoint, cell_size_degrees: f64) -> CellId {
    CellId {
        row: (point.latitude / cell_size_degrees).floor() as i64,
        col: (point.longitude / cell_size_degrees).floor() as i64,
    }
}

pub fn centroid(points: &[GeoPoint]) -> Option<GeoPoint> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (lat, lng) = points
        .iter()
        .fold((0.0, 0.0), |(lat, lng), p| (lat + p.latitude, lng + p.longitude));
    Some(GeoPoint::new(lat / n, lng / n))
}
