use crate::error::MatchError;
use crate::models::{Entity, GeoPoint};
use crate::services::geo_math::haversine_km;

fn validate(viewer: GeoPoint, radius_km: f64) -> Result<(), MatchError> {
    if !radius_km.is_finite() || radius_km <= 0.0 {
        return Err(MatchError::InvalidArgument(format!(
            "radius_km must be > 0, got {}",
            radius_km
        )));
    }
    if !viewer.is_valid() {
        return Err(MatchError::InvalidArgument(format!(
            "viewer location out of range: {:.6}, {:.6}",
            viewer.latitude, viewer.longitude
        )));
    }
    Ok(())
}

/// Candidates within `radius_km` of the viewer, in input order.
pub fn filter(
    viewer: GeoPoint,
    radius_km: f64,
    candidates: &[Entity],
) -> Result<Vec<Entity>, MatchError> {
    validate(viewer, radius_km)?;
    Ok(candidates
        .iter()
        .filter(|c| haversine_km(viewer, c.location) <= radius_km)
        .cloned()
        .collect())
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedEntity {
    pub entity: Entity,
    pub distance_km: f64,
}

/// Like [`filter`], nearest first. Ties keep input order.
pub fn filter_sorted(
    viewer: GeoPoint,
    radius_km: f64,
    candidates: &[Entity],
) -> Result<Vec<RankedEntity>, MatchError> {
    validate(viewer, radius_km)?;
    let mut ranked = candidates
        .iter()
        .filter_map(|c| {
            let dist = haversine_km(viewer, c.location);
            (dist <= radius_km).then(|| RankedEntity {
                entity: c.clone(),
                distance_km: dist,
            })
        })
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| {
        a.distance_km
            .partial_cmp(&b.distance_km)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::services::geo_math::EARTH_RADIUS_KM;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn entity(id: &str, lat: f64, lng: f64) -> Entity {
        Entity {
            user_id: id.to_string(),
            role: Role::Provider,
            location: GeoPoint::new(lat, lng),
        }
    }

    // Due north along the meridian: d = R * dphi.
    fn north_of(p: GeoPoint, km: f64) -> GeoPoint {
        GeoPoint::new(p.latitude + (km / EARTH_RADIUS_KM).to_degrees(), p.longitude)
    }

    #[test]
    fn keeps_only_candidates_inside_half_km() {
        let viewer = GeoPoint::new(37.7749, -122.4194);
        let candidates = [0.1, 0.3, 0.6, 2.0]
            .iter()
            .enumerate()
            .map(|(i, km)| {
                let p = north_of(viewer, *km);
                entity(&format!("c{}", i), p.latitude, p.longitude)
            })
            .collect::<Vec<_>>();

        let hits = filter(viewer, 0.5, &candidates).unwrap();
        let ids = hits.iter().map(|e| e.user_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["c0", "c1"]);
    }

    #[test]
    fn boundary_distance_is_inclusive() {
        let viewer = GeoPoint::new(10.0, 10.0);
        let edge = entity("edge", 10.0, 10.0);
        let d = haversine_km(viewer, edge.location);
        assert_eq!(filter(viewer, d.max(1e-9), &[edge]).unwrap().len(), 1);
    }

    #[test]
    fn rejects_non_positive_radius() {
        let viewer = GeoPoint::new(0.0, 0.0);
        for radius in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                filter(viewer, radius, &[]),
                Err(MatchError::InvalidArgument(_))
            ));
        }
        assert!(filter(GeoPoint::new(95.0, 0.0), 1.0, &[]).is_err());
    }

    #[test]
    fn works_across_antimeridian() {
        let viewer = GeoPoint::new(-16.5, 179.95);
        let across = entity("fiji-east", -16.5, -179.95);
        let far = entity("far", -16.5, 170.0);
        let hits = filter(viewer, 15.0, &[across, far]).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].user_id, "fiji-east");
    }

    #[test]
    fn matches_brute_force_reference() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let viewer = GeoPoint::new(rng.gen_range(-80.0..80.0), rng.gen_range(-180.0..180.0));
            let radius = rng.gen_range(0.1..50.0);
            let candidates = (0..100)
                .map(|i| {
                    entity(
                        &i.to_string(),
                        (viewer.latitude + rng.gen_range(-0.5..0.5)).clamp(-90.0, 90.0),
                        viewer.longitude + rng.gen_range(-0.5..0.5),
                    )
                })
                .collect::<Vec<_>>();

            let expected = candidates
                .iter()
                .filter(|c| haversine_km(viewer, c.location) <= radius)
                .map(|c| c.user_id.clone())
                .collect::<Vec<_>>();
            let got = filter(viewer, radius, &candidates)
                .unwrap()
                .into_iter()
                .map(|c| c.user_id)
                .collect::<Vec<_>>();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn sorted_variant_orders_by_distance() {
        let viewer = GeoPoint::new(52.0, 5.0);
        let far = north_of(viewer, 3.0);
        let near = north_of(viewer, 1.0);
        let ranked = filter_sorted(
            viewer,
            5.0,
            &[
                entity("far", far.latitude, far.longitude),
                entity("near", near.latitude, near.longitude),
            ],
        )
        .unwrap();
        assert_eq!(ranked[0].entity.user_id, "near");
        assert!((ranked[1].distance_km - 3.0).abs() < 1e-6);
    }
}
