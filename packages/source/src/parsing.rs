//! Shared parsing utilities for raw dataset records.
//!
//! Socrata returns almost every column as a string, but some feeds emit
//! numbers or nested objects, so the helpers here accept either.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use crime_stats_region_models::is_valid_coordinate;
use crime_stats_source_models::GeoPoint;
use serde_json::Value;

/// Parses a Socrata datetime string (ISO 8601 with optional fractional
/// seconds, or a bare date). Floating timestamps are interpreted as UTC.
#[must_use]
pub fn parse_socrata_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Formats an instant as a Socrata floating timestamp literal.
#[must_use]
pub fn format_socrata_date(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

/// Returns a field as a trimmed, non-empty string. Numbers are rendered
/// with their JSON representation.
#[must_use]
pub fn field_str(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Returns a field as `f64`, accepting numeric strings.
#[must_use]
pub fn field_f64(record: &Value, field: &str) -> Option<f64> {
    match record.get(field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Builds a point from latitude/longitude. Returns `None` if either is
/// missing, zero, or outside the valid WGS84 ranges.
#[must_use]
pub fn parse_lat_lng_f64(lat: Option<f64>, lng: Option<f64>) -> Option<GeoPoint> {
    let latitude = lat?;
    let longitude = lng?;
    if latitude == 0.0 || longitude == 0.0 || !is_valid_coordinate(latitude, longitude) {
        return None;
    }
    Some(GeoPoint::new(latitude, longitude))
}

/// Extracts a point from a `GeoJSON` `Point` value
/// (`{"type": "Point", "coordinates": [lng, lat]}`).
///
/// Socrata's legacy location type (`{"latitude": "..", "longitude": ".."}`)
/// is accepted too.
#[must_use]
pub fn parse_point_value(value: &Value) -> Option<GeoPoint> {
    if let Some(coords) = value.get("coordinates").and_then(Value::as_array) {
        let lng = coords.first().and_then(Value::as_f64);
        let lat = coords.get(1).and_then(Value::as_f64);
        return parse_lat_lng_f64(lat, lng);
    }
    parse_lat_lng_f64(field_f64(value, "latitude"), field_f64(value, "longitude"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_socrata_date_with_fractional() {
        let dt = parse_socrata_date("2024-01-15T14:30:00.000").unwrap();
        assert_eq!(dt.to_string(), "2024-01-15 14:30:00 UTC");
    }

    #[test]
    fn parses_socrata_date_without_fractional() {
        let dt = parse_socrata_date("2024-01-15T14:30:00").unwrap();
        assert_eq!(dt.to_string(), "2024-01-15 14:30:00 UTC");
    }

    #[test]
    fn parses_bare_date_and_offset() {
        assert_eq!(
            parse_socrata_date("2024-01-15").unwrap().to_string(),
            "2024-01-15 00:00:00 UTC"
        );
        assert_eq!(
            parse_socrata_date("2024-01-15T09:30:00-05:00")
                .unwrap()
                .to_string(),
            "2024-01-15 14:30:00 UTC"
        );
    }

    #[test]
    fn rejects_invalid_date() {
        assert!(parse_socrata_date("not-a-date").is_none());
        assert!(parse_socrata_date("").is_none());
    }

    #[test]
    fn formats_floating_timestamp() {
        let dt = parse_socrata_date("2024-01-15T14:30:00").unwrap();
        assert_eq!(format_socrata_date(&dt), "2024-01-15T14:30:00.000");
    }

    #[test]
    fn field_helpers_accept_strings_and_numbers() {
        let record = json!({"a": " x ", "b": 12, "c": "", "d": "40.5", "e": null});
        assert_eq!(field_str(&record, "a").as_deref(), Some("x"));
        assert_eq!(field_str(&record, "b").as_deref(), Some("12"));
        assert_eq!(field_str(&record, "c"), None);
        assert_eq!(field_str(&record, "e"), None);
        assert_eq!(field_str(&record, "missing"), None);
        assert_eq!(field_f64(&record, "d"), Some(40.5));
        assert_eq!(field_f64(&record, "b"), Some(12.0));
    }

    #[test]
    fn rejects_zero_and_out_of_range_lat_lng() {
        assert!(parse_lat_lng_f64(Some(0.0), Some(-87.6)).is_none());
        assert!(parse_lat_lng_f64(Some(91.0), Some(-87.6)).is_none());
        assert!(parse_lat_lng_f64(None, Some(-87.6)).is_none());
        let p = parse_lat_lng_f64(Some(41.8781), Some(-87.6298)).unwrap();
        assert!((p.lat - 41.8781).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_geojson_and_location_points() {
        let p = parse_point_value(&json!({"type": "Point", "coordinates": [-122.4, 37.77]}))
            .unwrap();
        assert!((p.lat - 37.77).abs() < f64::EPSILON);
        assert!((p.lon - -122.4).abs() < f64::EPSILON);

        let p = parse_point_value(&json!({"latitude": "40.7", "longitude": "-73.9"})).unwrap();
        assert!((p.lat - 40.7).abs() < f64::EPSILON);

        assert!(parse_point_value(&json!({"type": "Point", "coordinates": [0.0, 0.0]})).is_none());
    }
}
