//! Normalizes raw `GeoJSON` features into [`Region`] values.
//!
//! Uses the city's [`RegionSourceConfig`] to pick the id and name
//! properties and to decide how geometry is encoded.

use crime_stats_region_models::{GeometryFormat, RegionSourceConfig};
use serde_json::Value;

use crate::Region;
use crate::geometry::parse_geojson_to_multipolygon;

/// Normalizes a list of raw features into regions.
///
/// Skips features with a missing id or name, or unusable geometry.
#[must_use]
pub fn normalize_features(city: &str, features: &[Value], config: &RegionSourceConfig) -> Vec<Region> {
    let regions: Vec<Region> = features
        .iter()
        .filter_map(|feature| normalize_feature(city, feature, config))
        .collect();

    let skipped = features.len() - regions.len();
    if skipped > 0 {
        log::warn!("{city}: skipped {skipped} of {} region features", features.len());
    }
    regions
}

fn normalize_feature(city: &str, feature: &Value, config: &RegionSourceConfig) -> Option<Region> {
    let props = feature.get("properties")?;
    let id = property_string(props, &config.id_field)?;
    let name = property_string(props, &config.name_field).unwrap_or_else(|| id.clone());

    let geometry = feature.get("geometry").filter(|g| !g.is_null())?;
    let geometry_json = match config.geometry {
        GeometryFormat::Geojson => geometry.to_string(),
        GeometryFormat::EsriRings => esri_to_geojson(geometry)?.to_string(),
    };

    let Some(multi_polygon) = parse_geojson_to_multipolygon(&geometry_json) else {
        log::warn!("{city}: failed to parse geometry for region {id}");
        return None;
    };

    Region::new(id, name, city, multi_polygon)
}

/// Reads a property as a trimmed, non-empty string. Numeric ids are
/// accepted.
fn property_string(props: &Value, field: &str) -> Option<String> {
    match props.get(field)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Converts Esri JSON geometry (`{ "rings": [...] }`) to a `GeoJSON`
/// Polygon/`MultiPolygon`. Each ring becomes its own polygon.
fn esri_to_geojson(esri_geom: &Value) -> Option<Value> {
    let rings = esri_geom.get("rings")?.as_array()?;

    match rings.len() {
        0 => None,
        1 => Some(serde_json::json!({
            "type": "Polygon",
            "coordinates": rings,
        })),
        _ => {
            let polygons: Vec<Value> = rings.iter().map(|ring| serde_json::json!([ring])).collect();
            Some(serde_json::json!({
                "type": "MultiPolygon",
                "coordinates": polygons,
            }))
        }
    }
}
