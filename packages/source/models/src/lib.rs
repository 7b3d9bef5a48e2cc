#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! City and dataset definitions plus the canonical normalized event row.
//!
//! Every upstream dataset (legacy or modern schema, historical or
//! current-period feed) is mapped into [`EventRow`] at the adapter
//! boundary, so the aggregation engine never looks at dataset-specific
//! field names.

use chrono::{DateTime, Datelike as _, TimeZone as _, Utc};
use crime_stats_crime_models::{AgeGroup, LawClass, Race, Sex};
use crime_stats_region_models::RegionSourceConfig;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// A WGS84 point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lon: f64,
}

impl GeoPoint {
    /// Creates a point from latitude and longitude.
    #[must_use]
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Demographic attributes of one party (suspect or victim).
///
/// `None` means the dataset does not carry the attribute at all; an
/// explicit `Unknown` variant means the dataset carries it but the value
/// was not recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Demographics {
    /// Reported race.
    pub race: Option<Race>,
    /// Reported sex.
    pub sex: Option<Sex>,
    /// Reported age bracket.
    pub age_group: Option<AgeGroup>,
}

/// A single incident normalized to the canonical schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRow {
    /// Record identifier from the upstream dataset.
    pub source_id: String,
    /// When the incident occurred.
    pub occurred_at: DateTime<Utc>,
    /// Offense or incident type as reported upstream.
    pub category: String,
    /// Offense level, if the dataset reports one.
    pub law_class: Option<LawClass>,
    /// Premise type (e.g. "STREET", "RESIDENCE - APT. HOUSE").
    pub premise: Option<String>,
    /// Borough or district as reported upstream.
    pub borough: Option<String>,
    /// Incident location. `None` if the dataset lacks coordinates.
    pub point: Option<GeoPoint>,
    /// Suspect demographics.
    pub suspect: Demographics,
    /// Victim demographics.
    pub victim: Demographics,
    /// Identifier of the dataset that produced this row.
    pub dataset_tag: String,
}

/// A half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Creates a window. No validation is performed; see [`Self::is_empty`].
    #[must_use]
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Creates a window covering whole calendar years
    /// `[Jan 1 first_year, Jan 1 last_year + 1)`.
    #[must_use]
    pub fn years(first_year: i32, last_year: i32) -> Option<Self> {
        Some(Self::new(
            year_start(first_year)?,
            year_start(last_year.checked_add(1)?)?,
        ))
    }

    /// Whether the window contains no instants.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Whether `instant` lies within `[start, end)`.
    #[must_use]
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }

    /// Returns the overlap of two windows, or `None` if they do not overlap.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let clipped = Self::new(self.start.max(other.start), self.end.min(other.end));
        (!clipped.is_empty()).then_some(clipped)
    }

    /// Number of calendar months touched by the window (0 when empty).
    #[must_use]
    pub fn month_span(&self) -> u32 {
        if self.is_empty() {
            return 0;
        }
        let last = self.last_instant();
        let months = (last.year() - self.start.year()) * 12
            + i32::try_from(last.month()).unwrap_or(0)
            - i32::try_from(self.start.month()).unwrap_or(0)
            + 1;
        u32::try_from(months).unwrap_or(0)
    }

    /// The last instant covered by the window (one nanosecond before `end`).
    #[must_use]
    pub fn last_instant(&self) -> DateTime<Utc> {
        self.end - chrono::Duration::nanoseconds(1)
    }
}

/// Midnight UTC on January 1 of `year`.
#[must_use]
pub fn year_start(year: i32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single()
}

/// Schema generation of a dataset relative to the city's cutover year.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DatasetFormat {
    /// Format used for years up to and including the cutover year.
    Legacy,
    /// Format used for years after the cutover year.
    Modern,
}

/// How rows from a dataset are identified for deduplication.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DedupStrategy {
    /// The record id is only unique together with its rounded location.
    PointKeyed,
    /// The record id alone is globally unique.
    UniqueId,
}

/// Raw field names holding one party's demographics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemographicFields {
    /// Race field.
    pub race: Option<String>,
    /// Sex field.
    pub sex: Option<String>,
    /// Age group field.
    pub age_group: Option<String>,
}

/// Where each [`EventRow`] attribute lives in a raw dataset record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Record id fields, tried in order; the first non-empty value wins.
    pub source_id: Vec<String>,
    /// Timestamp field; also used for window filtering upstream.
    pub occurred_at: String,
    /// Category fields, tried in order.
    pub category: Vec<String>,
    /// Law class field.
    pub law_class: Option<String>,
    /// Premise field.
    pub premise: Option<String>,
    /// Borough or district field.
    pub borough: Option<String>,
    /// Latitude field.
    pub latitude: Option<String>,
    /// Longitude field.
    pub longitude: Option<String>,
    /// `GeoJSON` point field, used when latitude/longitude are absent.
    pub point: Option<String>,
    /// Suspect demographic fields.
    #[serde(default)]
    pub suspect: DemographicFields,
    /// Victim demographic fields.
    #[serde(default)]
    pub victim: DemographicFields,
}

const fn default_page_size() -> u64 {
    50_000
}

/// One upstream dataset of a city.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDefinition {
    /// Unique dataset identifier (e.g. `"nypd_complaints_historic"`).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Schema generation relative to the city's cutover year.
    pub format: DatasetFormat,
    /// Socrata resource URL.
    pub api_url: String,
    /// Row identity used for deduplication.
    pub dedup: DedupStrategy,
    /// First year covered; overrides the format default lower bound.
    #[serde(default)]
    pub first_year: Option<i32>,
    /// Last year covered; overrides the format default upper bound.
    #[serde(default)]
    pub last_year: Option<i32>,
    /// Records per page when paging through the dataset.
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    /// Raw field names.
    pub fields: FieldMapping,
}

/// A city with its cutover year, region catalog, and datasets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityConfig {
    /// Unique city identifier (e.g. `"nyc"`).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Two-letter state abbreviation.
    pub state: String,
    /// Last year served by the legacy format.
    pub cutover_year: i32,
    /// Region catalog source, if the city has region polygons.
    #[serde(default)]
    pub regions: Option<RegionSourceConfig>,
    /// Upstream datasets.
    pub datasets: Vec<DatasetDefinition>,
}

/// A dataset selected for a request, with the sub-window it must be
/// queried for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDescriptor {
    /// City the dataset belongs to.
    pub city: String,
    /// The dataset definition.
    pub dataset: DatasetDefinition,
    /// Window clipped to the dataset's valid coverage.
    pub window: TimeWindow,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn window_intersection() {
        let a = TimeWindow::new(ts(2020, 1, 1), ts(2022, 1, 1));
        let b = TimeWindow::new(ts(2021, 6, 1), ts(2023, 1, 1));
        let both = a.intersect(&b).unwrap();
        assert_eq!(both.start, ts(2021, 6, 1));
        assert_eq!(both.end, ts(2022, 1, 1));

        let c = TimeWindow::new(ts(2022, 1, 1), ts(2023, 1, 1));
        assert!(a.intersect(&c).is_none());
    }

    #[test]
    fn window_is_half_open() {
        let w = TimeWindow::new(ts(2023, 1, 1), ts(2023, 2, 1));
        assert!(w.contains(ts(2023, 1, 1)));
        assert!(!w.contains(ts(2023, 2, 1)));
        assert!(TimeWindow::new(ts(2023, 1, 1), ts(2023, 1, 1)).is_empty());
    }

    #[test]
    fn month_span_counts_touched_months() {
        assert_eq!(
            TimeWindow::new(ts(2023, 1, 1), ts(2023, 4, 1)).month_span(),
            3
        );
        assert_eq!(
            TimeWindow::new(ts(2023, 1, 15), ts(2023, 1, 16)).month_span(),
            1
        );
        assert_eq!(TimeWindow::years(2020, 2022).unwrap().month_span(), 36);
        assert_eq!(TimeWindow::new(ts(2023, 1, 1), ts(2022, 1, 1)).month_span(), 0);
    }

    #[test]
    fn dataset_format_labels() {
        assert_eq!(DatasetFormat::Legacy.to_string(), "legacy");
        assert_eq!("modern".parse::<DatasetFormat>().unwrap(), DatasetFormat::Modern);
    }
}
