//! Maps raw dataset records into [`EventRow`]s using a [`FieldMapping`].

use crime_stats_crime_models::{AgeGroup, LawClass, Race, Sex};
use crime_stats_source_models::{DemographicFields, Demographics, EventRow, FieldMapping, GeoPoint};
use serde_json::Value;

use crate::parsing::{field_f64, field_str, parse_lat_lng_f64, parse_point_value, parse_socrata_date};

/// Normalizes one raw record.
///
/// Returns `None` (with a debug log) when the record has no id or no
/// parseable timestamp. Missing categories become `"UNKNOWN"`.
#[must_use]
pub fn normalize_record(record: &Value, dataset_tag: &str, fields: &FieldMapping) -> Option<EventRow> {
    let Some(source_id) = first_present(record, &fields.source_id) else {
        log::debug!("{dataset_tag}: skipping record without id");
        return None;
    };

    let Some(occurred_at) =
        field_str(record, &fields.occurred_at).and_then(|s| parse_socrata_date(&s))
    else {
        log::debug!("{dataset_tag}: skipping record {source_id} without parseable timestamp");
        return None;
    };

    let category =
        first_present(record, &fields.category).unwrap_or_else(|| "UNKNOWN".to_string());

    Some(EventRow {
        source_id,
        occurred_at,
        category,
        law_class: optional_field(record, fields.law_class.as_deref())
            .and_then(|raw| LawClass::from_raw(&raw)),
        premise: optional_field(record, fields.premise.as_deref()),
        borough: optional_field(record, fields.borough.as_deref()),
        point: extract_point(record, fields),
        suspect: demographics(record, &fields.suspect),
        victim: demographics(record, &fields.victim),
        dataset_tag: dataset_tag.to_string(),
    })
}

fn first_present(record: &Value, candidates: &[String]) -> Option<String> {
    candidates.iter().find_map(|f| field_str(record, f))
}

fn optional_field(record: &Value, field: Option<&str>) -> Option<String> {
    field.and_then(|f| field_str(record, f))
}

fn extract_point(record: &Value, fields: &FieldMapping) -> Option<GeoPoint> {
    if let (Some(lat), Some(lon)) = (&fields.latitude, &fields.longitude)
        && let Some(point) = parse_lat_lng_f64(field_f64(record, lat), field_f64(record, lon))
    {
        return Some(point);
    }
    fields
        .point
        .as_deref()
        .and_then(|f| record.get(f))
        .and_then(parse_point_value)
}

/// A configured-but-blank field yields `Unknown`; an unconfigured one
/// yields `None`.
fn demographics(record: &Value, fields: &DemographicFields) -> Demographics {
    let raw = |field: &Option<String>| {
        field
            .as_deref()
            .map(|f| field_str(record, f).unwrap_or_default())
    };
    Demographics {
        race: raw(&fields.race).map(|v| Race::from_raw(&v)),
        sex: raw(&fields.sex).map(|v| Sex::from_raw(&v)),
        age_group: raw(&fields.age_group).map(|v| AgeGroup::from_raw(&v)),
    }
}
