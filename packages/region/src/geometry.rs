//! Geometry helpers shared by the catalog, the grid index, and exact
//! polygon scoping.
//!
//! All geometry uses `x = longitude`, `y = latitude`.

use crime_stats_region_models::{BoundingBox, is_valid_coordinate};
use geo::{BoundingRect, ChamberlainDuquetteArea, Intersects, LineString, MultiPolygon, Point, Polygon};
use geojson::GeoJson;

/// Parses a `GeoJSON` geometry string into a [`MultiPolygon`].
/// Handles both `Polygon` and `MultiPolygon` geometry types.
#[must_use]
pub fn parse_geojson_to_multipolygon(geojson_str: &str) -> Option<MultiPolygon<f64>> {
    let geojson: GeoJson = geojson_str.parse().ok()?;
    let GeoJson::Geometry(geom) = geojson else {
        return None;
    };
    let geo_geom: geo::Geometry<f64> = geom.try_into().ok()?;
    match geo_geom {
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        geo::Geometry::Polygon(p) => Some(MultiPolygon(vec![p])),
        _ => None,
    }
}

/// Bounding box of a [`MultiPolygon`], or `None` if it has no points.
#[must_use]
pub fn bounding_box(mp: &MultiPolygon<f64>) -> Option<BoundingBox> {
    mp.bounding_rect()
        .map(|rect| BoundingBox::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y))
}

/// Approximate geodesic area in square meters.
#[must_use]
pub fn area_sq_m(mp: &MultiPolygon<f64>) -> f64 {
    mp.chamberlain_duquette_unsigned_area()
}

/// Point-in-polygon test. Points on the boundary count as inside.
#[must_use]
pub fn multipolygon_contains(mp: &MultiPolygon<f64>, lat: f64, lon: f64) -> bool {
    mp.intersects(&Point::new(lon, lat))
}

/// Point-in-polygon test for a single polygon. Points on the boundary count
/// as inside.
#[must_use]
pub fn polygon_contains(polygon: &Polygon<f64>, lat: f64, lon: f64) -> bool {
    polygon.intersects(&Point::new(lon, lat))
}

/// Builds a polygon from an exterior ring of `[lon, lat]` pairs.
///
/// The ring is closed automatically. Returns `None` if any vertex is
/// non-finite or out of range, or if fewer than three distinct vertices
/// remain.
#[must_use]
pub fn polygon_from_ring(ring: &[[f64; 2]]) -> Option<Polygon<f64>> {
    if ring
        .iter()
        .any(|[lon, lat]| !is_valid_coordinate(*lat, *lon))
    {
        return None;
    }

    let mut distinct: Vec<[f64; 2]> = Vec::with_capacity(ring.len());
    for vertex in ring {
        if !distinct.contains(vertex) {
            distinct.push(*vertex);
        }
    }
    if distinct.len() < 3 {
        return None;
    }

    Some(Polygon::new(
        LineString::from(ring.iter().map(|[lon, lat]| (*lon, *lat)).collect::<Vec<_>>()),
        vec![],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_polygon_and_multipolygon() {
        let polygon = r#"{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,1],[0,0]]]}"#;
        assert_eq!(parse_geojson_to_multipolygon(polygon).unwrap().0.len(), 1);

        let multi = r#"{"type":"MultiPolygon","coordinates":[
            [[[0,0],[1,0],[1,1],[0,0]]],
            [[[2,2],[3,2],[3,3],[2,2]]]
        ]}"#;
        assert_eq!(parse_geojson_to_multipolygon(multi).unwrap().0.len(), 2);

        let point = r#"{"type":"Point","coordinates":[0,0]}"#;
        assert!(parse_geojson_to_multipolygon(point).is_none());
        assert!(parse_geojson_to_multipolygon("nonsense").is_none());
    }

    #[test]
    fn contains_is_boundary_inclusive() {
        let ring = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        let polygon = polygon_from_ring(&ring).unwrap();
        assert!(polygon_contains(&polygon, 0.5, 0.5));
        assert!(polygon_contains(&polygon, 0.0, 0.5));
        assert!(!polygon_contains(&polygon, 1.5, 0.5));
    }

    #[test]
    fn ring_validation() {
        assert!(polygon_from_ring(&[[0.0, 0.0], [1.0, 0.0], [0.0, 0.0]]).is_none());
        assert!(polygon_from_ring(&[[0.0, 0.0], [1.0, f64::NAN], [1.0, 1.0]]).is_none());
        assert!(polygon_from_ring(&[[0.0, 0.0], [200.0, 0.0], [1.0, 1.0]]).is_none());
        let triangle = polygon_from_ring(&[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]).unwrap();
        // LineString::from does not close; Polygon::new does.
        assert_eq!(triangle.exterior().0.len(), 4);
    }
}
