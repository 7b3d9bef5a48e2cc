#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Aggregation request and result types.
//!
//! Everything here is JSON-serializable so results can be handed straight
//! to a map/chart frontend.

use std::collections::BTreeSet;

use crime_stats_crime_models::{AgeGroup, LawClass, Race, Sex};
use crime_stats_region_models::BoundingBox;
use crime_stats_source_models::TimeWindow;
use serde::{Deserialize, Serialize};

/// Geographic restriction of an aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GeoScope {
    /// Axis-aligned box; pushed down to the upstream query.
    Bbox {
        /// The box.
        bbox: BoundingBox,
    },
    /// Exact polygon; rows are re-tested against it after fetching.
    Polygon {
        /// Exterior ring as `[lon, lat]` pairs.
        exterior: Vec<[f64; 2]>,
    },
}

/// Inclusion sets for one party's demographics. `None` admits everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemographicFilter {
    /// Admitted races.
    #[serde(default)]
    pub races: Option<BTreeSet<Race>>,
    /// Admitted sexes.
    #[serde(default)]
    pub sexes: Option<BTreeSet<Sex>>,
    /// Admitted age groups.
    #[serde(default)]
    pub age_groups: Option<BTreeSet<AgeGroup>>,
}

impl DemographicFilter {
    /// Whether no inclusion set is configured.
    #[must_use]
    pub const fn is_unrestricted(&self) -> bool {
        self.races.is_none() && self.sexes.is_none() && self.age_groups.is_none()
    }

    /// Whether some inclusion set is empty and `include_unknown` cannot
    /// rescue any row.
    #[must_use]
    pub fn excludes_everything(&self, include_unknown: bool) -> bool {
        !include_unknown
            && (self.races.as_ref().is_some_and(BTreeSet::is_empty)
                || self.sexes.as_ref().is_some_and(BTreeSet::is_empty)
                || self.age_groups.as_ref().is_some_and(BTreeSet::is_empty))
    }
}

const fn default_include_unknown() -> bool {
    true
}

/// What to aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationFilter {
    /// City id.
    pub city: String,
    /// Half-open time window.
    pub window: TimeWindow,
    /// Admitted categories. `None` admits every category; an empty set
    /// admits none.
    #[serde(default)]
    pub categories: Option<BTreeSet<String>>,
    /// Admitted law classes. `None` admits every class.
    #[serde(default)]
    pub law_classes: Option<BTreeSet<LawClass>>,
    /// Whether unknown demographic values are admitted and reported.
    #[serde(default = "default_include_unknown")]
    pub include_unknown: bool,
    /// Suspect demographic inclusion sets.
    #[serde(default)]
    pub suspect: DemographicFilter,
    /// Victim demographic inclusion sets.
    #[serde(default)]
    pub victim: DemographicFilter,
    /// Geographic scope. `None` means the whole city.
    #[serde(default)]
    pub scope: Option<GeoScope>,
}

impl AggregationFilter {
    /// A filter admitting everything in `window` for `city`.
    #[must_use]
    pub fn new(city: impl Into<String>, window: TimeWindow) -> Self {
        Self {
            city: city.into(),
            window,
            categories: None,
            law_classes: None,
            include_unknown: true,
            suspect: DemographicFilter::default(),
            victim: DemographicFilter::default(),
            scope: None,
        }
    }

    /// Whether the filter can never admit a row.
    #[must_use]
    pub fn excludes_everything(&self) -> bool {
        self.categories.as_ref().is_some_and(BTreeSet::is_empty)
            || self.law_classes.as_ref().is_some_and(BTreeSet::is_empty)
            || self.suspect.excludes_everything(self.include_unknown)
            || self.victim.excludes_everything(self.include_unknown)
    }
}

/// Bucket size of a time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGranularity {
    /// Monthly counts, labelled `YYYY-MM`.
    Monthly,
    /// Yearly counts, labelled `YYYY`.
    Yearly,
}

impl std::fmt::Display for TimeGranularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => write!(f, "month"),
            Self::Yearly => write!(f, "year"),
        }
    }
}

/// A labelled count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownEntry {
    /// Category, class, premise, ... label.
    pub label: String,
    /// Number of incidents.
    pub count: u64,
}

/// Count for one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionCount {
    /// Region id.
    pub region_id: String,
    /// Region name.
    pub region_name: String,
    /// Number of incidents.
    pub count: u64,
}

/// A single data point in a time series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesPoint {
    /// Period label (`YYYY-MM` or `YYYY`).
    pub period: String,
    /// Number of incidents in the period.
    pub count: u64,
}

/// Suspect and victim breakdowns of one demographic attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyBreakdown {
    /// Suspect breakdown.
    pub suspect: Vec<BreakdownEntry>,
    /// Victim breakdown.
    pub victim: Vec<BreakdownEntry>,
}

/// Suspect × victim counts over the top labels of each margin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossTab {
    /// Suspect labels, by descending margin total.
    pub rows: Vec<String>,
    /// Victim labels, by descending margin total.
    pub columns: Vec<String>,
    /// `counts[row][column]`.
    pub counts: Vec<Vec<u64>>,
}

/// The suspect × victim matrices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Matrices {
    /// Race × race.
    pub race: CrossTab,
    /// Sex × sex.
    pub sex: CrossTab,
    /// Race and sex combined, labelled `RACE|SEX`.
    pub race_sex: CrossTab,
}

/// Outcome of one dataset fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    /// Dataset id.
    pub dataset_id: String,
    /// Sub-window the dataset was queried for.
    pub window: TimeWindow,
    /// Rows returned before deduplication and filtering.
    pub rows: u64,
    /// Failure description, if the fetch failed or timed out.
    pub error: Option<String>,
}

/// Aggregated statistics for one filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationResult {
    /// Deduplicated, filtered incident count.
    pub total: u64,
    /// Counts by offense category.
    pub by_offense: Vec<BreakdownEntry>,
    /// Counts by law class.
    pub by_law_class: Vec<BreakdownEntry>,
    /// Counts by premise type.
    pub by_premise: Vec<BreakdownEntry>,
    /// Counts by borough or district.
    pub by_borough: Vec<BreakdownEntry>,
    /// Counts by resolved region.
    pub by_region: Vec<RegionCount>,
    /// Counts by race.
    pub by_race: PartyBreakdown,
    /// Counts by sex.
    pub by_sex: PartyBreakdown,
    /// Counts by age group.
    pub by_age: PartyBreakdown,
    /// Chronological, zero-filled series.
    pub time_series: Vec<TimeSeriesPoint>,
    /// Bucket size of `time_series`.
    pub granularity: TimeGranularity,
    /// Suspect × victim matrices.
    pub matrices: Matrices,
    /// Whether at least one dataset failed or timed out.
    pub partial: bool,
    /// Per-dataset fetch outcomes.
    pub sources: Vec<SourceStatus>,
}

/// Choropleth bucket of one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionBucket {
    /// Region id.
    pub region_id: String,
    /// Incident count.
    pub count: u64,
    /// Rank position scaled to `0..=1`.
    pub percentile: f64,
    /// Decile in `0..=9`.
    pub decile: u8,
}
