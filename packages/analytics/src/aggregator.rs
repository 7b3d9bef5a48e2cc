//! Deduplicating aggregation across routed datasets.
//!
//! One call routes the filter window to datasets, fetches them
//! concurrently under a deadline, drops duplicate rows, applies the
//! filter, and folds what is left into breakdowns, a zero-filled time
//! series, and suspect × victim matrices. A failed or timed-out dataset
//! only marks the result `partial`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike as _, Utc};
use crime_stats_analytics_models::{
    AggregationFilter, AggregationResult, BreakdownEntry, CrossTab, DemographicFilter, GeoScope,
    Matrices, PartyBreakdown, RegionCount, SourceStatus, TimeGranularity, TimeSeriesPoint,
};
use crime_stats_crime_models::{AgeGroup, Race, Sex};
use crime_stats_region::geometry::{bounding_box, polygon_contains, polygon_from_ring};
use crime_stats_source::registry::CityRegistry;
use crime_stats_source::router::route;
use crime_stats_source::{EventProvider, FetchScope, SourceError};
use crime_stats_source_models::{
    CityConfig, DatasetDescriptor, DedupStrategy, Demographics, EventRow, TimeWindow,
};
use crime_stats_spatial::{CityIndex, SpatialRegionResolver};
use futures::StreamExt as _;
use futures::stream::FuturesUnordered;
use geo::{MultiPolygon, Polygon};

use crate::AnalyticsError;

/// Default number of labels kept on each cross-tab margin.
pub const DEFAULT_TOP_N: usize = 8;

/// Default longest window, in months, reported with monthly buckets.
pub const DEFAULT_MAX_MONTHLY_PERIODS: u32 = 36;

/// Identity of a row for deduplication within one aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    /// Record id plus location rounded to five decimals.
    Point {
        /// Upstream record id.
        source_id: String,
        /// Latitude × 10⁵, rounded.
        lat_e5: Option<i64>,
        /// Longitude × 10⁵, rounded.
        lon_e5: Option<i64>,
    },
    /// A record id that is unique on its own.
    Id(String),
}

impl DedupKey {
    /// Derives the key of `row` under `strategy`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn of(row: &EventRow, strategy: DedupStrategy) -> Self {
        match strategy {
            DedupStrategy::UniqueId => Self::Id(row.source_id.clone()),
            DedupStrategy::PointKeyed => {
                let round = |v: f64| (v * 100_000.0).round() as i64;
                Self::Point {
                    source_id: row.source_id.clone(),
                    lat_e5: row.point.map(|p| round(p.lat)),
                    lon_e5: row.point.map(|p| round(p.lon)),
                }
            }
        }
    }
}

/// A validated filter ready to run.
#[derive(Debug, Clone)]
pub struct PreparedFilter {
    /// The city definition.
    pub city: CityConfig,
    /// What is pushed down to providers.
    pub fetch_scope: FetchScope,
    /// Exact polygon rows are re-tested against.
    pub polygon: Option<Polygon<f64>>,
}

/// Fans out to routed datasets and folds the rows into a result.
pub struct Aggregator {
    registry: Arc<CityRegistry>,
    provider: Arc<dyn EventProvider>,
    resolver: Arc<SpatialRegionResolver>,
    top_n: usize,
    max_monthly_periods: u32,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("top_n", &self.top_n)
            .field("max_monthly_periods", &self.max_monthly_periods)
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    /// Creates an aggregator with default tuning.
    #[must_use]
    pub fn new(
        registry: Arc<CityRegistry>,
        provider: Arc<dyn EventProvider>,
        resolver: Arc<SpatialRegionResolver>,
    ) -> Self {
        Self {
            registry,
            provider,
            resolver,
            top_n: DEFAULT_TOP_N,
            max_monthly_periods: DEFAULT_MAX_MONTHLY_PERIODS,
        }
    }

    /// Overrides the cross-tab margin size.
    #[must_use]
    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n.max(1);
        self
    }

    /// Overrides the longest window still reported monthly.
    #[must_use]
    pub const fn with_max_monthly_periods(mut self, max_monthly_periods: u32) -> Self {
        self.max_monthly_periods = max_monthly_periods;
        self
    }

    /// Checks a filter without fetching anything.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::UnknownCity`] for an unregistered city and
    /// [`AnalyticsError::InvalidFilter`] for an inverted window or a
    /// malformed scope.
    pub fn prepare(&self, filter: &AggregationFilter) -> Result<PreparedFilter, AnalyticsError> {
        if filter.window.end < filter.window.start {
            return Err(AnalyticsError::invalid_filter(format!(
                "window end {} is before start {}",
                filter.window.end, filter.window.start
            )));
        }

        let city = self
            .registry
            .get(&filter.city)
            .ok_or_else(|| AnalyticsError::UnknownCity {
                city: filter.city.clone(),
            })?
            .clone();

        let (fetch_scope, polygon) = match &filter.scope {
            None => (FetchScope::default(), None),
            Some(GeoScope::Bbox { bbox }) => {
                if !bbox.is_valid() {
                    return Err(AnalyticsError::invalid_filter(format!(
                        "bounding box {bbox:?} is not a valid WGS84 box"
                    )));
                }
                (FetchScope { bbox: Some(*bbox) }, None)
            }
            Some(GeoScope::Polygon { exterior }) => {
                let polygon = polygon_from_ring(exterior).ok_or_else(|| {
                    AnalyticsError::invalid_filter(
                        "polygon needs at least three distinct, valid vertices",
                    )
                })?;
                let bbox = bounding_box(&MultiPolygon(vec![polygon.clone()]));
                (FetchScope { bbox }, Some(polygon))
            }
        };

        Ok(PreparedFilter {
            city,
            fetch_scope,
            polygon,
        })
    }

    /// Aggregates the rows matching `filter`, waiting at most `timeout` for
    /// upstream fetches.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError`] only for filter problems; upstream
    /// failures set `partial` instead.
    pub async fn aggregate(
        &self,
        filter: &AggregationFilter,
        timeout: Duration,
    ) -> Result<AggregationResult, AnalyticsError> {
        let prepared = self.prepare(filter)?;
        let window = filter.window;
        let granularity = self.granularity(&window);

        if filter.excludes_everything() || window.is_empty() {
            log::debug!(
                "aggregate: {} filter admits nothing, skipping fetch",
                filter.city
            );
            return Ok(Accumulator::new(filter, None).finish(
                granularity,
                &window,
                self.top_n,
                vec![],
            ));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let descriptors = route(&prepared.city, &window);

        let index_build = {
            let resolver = Arc::clone(&self.resolver);
            let city = prepared.city.id.clone();
            tokio::task::spawn_blocking(move || resolver.city_index(&city))
        };
        let outcomes = self
            .fetch_all(&descriptors, &prepared.fetch_scope, deadline, timeout)
            .await;

        let mut index_timed_out = false;
        let index = match tokio::time::timeout_at(deadline, index_build).await {
            Ok(Ok(Ok(index))) => Some(index),
            Ok(Ok(Err(e))) => {
                log::warn!("aggregate: no region index for {}: {e}", prepared.city.id);
                None
            }
            Ok(Err(e)) => {
                log::error!(
                    "aggregate: region index build for {} aborted: {e}",
                    prepared.city.id
                );
                None
            }
            Err(_) => {
                log::warn!(
                    "aggregate: region index for {} not ready after {timeout:?}, \
                     skipping region counts",
                    prepared.city.id
                );
                index_timed_out = true;
                None
            }
        };

        let mut accumulator = Accumulator::new(filter, index.as_deref());
        let mut sources = Vec::with_capacity(descriptors.len());
        for (descriptor, outcome) in descriptors.iter().zip(outcomes) {
            let status = match outcome {
                FetchOutcome::Rows(rows) => {
                    for row in &rows {
                        accumulator.add(row, descriptor.dataset.dedup, prepared.polygon.as_ref());
                    }
                    SourceStatus {
                        dataset_id: descriptor.dataset.id.clone(),
                        window: descriptor.window,
                        rows: u64::try_from(rows.len()).unwrap_or(u64::MAX),
                        error: None,
                    }
                }
                FetchOutcome::Failed(message) => {
                    log::warn!("aggregate: {} failed: {message}", descriptor.dataset.id);
                    SourceStatus {
                        dataset_id: descriptor.dataset.id.clone(),
                        window: descriptor.window,
                        rows: 0,
                        error: Some(message),
                    }
                }
            };
            sources.push(status);
        }

        let mut result = accumulator.finish(granularity, &window, self.top_n, sources);
        result.partial |= index_timed_out;
        log::info!(
            "aggregate: {} [{}, {}) total={} partial={}",
            filter.city,
            window.start,
            window.end,
            result.total,
            result.partial
        );
        Ok(result)
    }

    /// The result of a request that got nothing back within `timeout`:
    /// every routed dataset is reported as timed out and nothing is counted.
    #[must_use]
    pub fn timed_out(
        &self,
        filter: &AggregationFilter,
        prepared: &PreparedFilter,
        timeout: Duration,
    ) -> AggregationResult {
        let window = filter.window;
        let sources = route(&prepared.city, &window)
            .into_iter()
            .map(|descriptor| SourceStatus {
                dataset_id: descriptor.dataset.id,
                window: descriptor.window,
                rows: 0,
                error: Some(timeout_message(timeout)),
            })
            .collect();
        let granularity = self.granularity(&window);
        let mut result =
            Accumulator::new(filter, None).finish(granularity, &window, self.top_n, sources);
        result.partial = true;
        result
    }

    /// Fetches every descriptor concurrently. Outcomes are returned in
    /// descriptor order regardless of completion order; anything still
    /// running at `deadline` is reported as timed out.
    async fn fetch_all(
        &self,
        descriptors: &[DatasetDescriptor],
        scope: &FetchScope,
        deadline: tokio::time::Instant,
        timeout: Duration,
    ) -> Vec<FetchOutcome> {
        let mut pending: FuturesUnordered<_> = descriptors
            .iter()
            .enumerate()
            .map(|(position, descriptor)| {
                let provider = &self.provider;
                async move { (position, provider.fetch(descriptor, scope).await) }
            })
            .collect();

        let mut outcomes: Vec<Option<Result<Vec<EventRow>, SourceError>>> =
            descriptors.iter().map(|_| None).collect();

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((position, outcome))) => outcomes[position] = Some(outcome),
                Ok(None) => break,
                Err(_) => {
                    log::warn!(
                        "aggregate: {} of {} fetches still running after {timeout:?}",
                        pending.len(),
                        descriptors.len()
                    );
                    break;
                }
            }
        }

        outcomes
            .into_iter()
            .map(|outcome| match outcome {
                Some(Ok(rows)) => FetchOutcome::Rows(rows),
                Some(Err(e)) => FetchOutcome::Failed(e.to_string()),
                None => FetchOutcome::Failed(timeout_message(timeout)),
            })
            .collect()
    }

    fn granularity(&self, window: &TimeWindow) -> TimeGranularity {
        if window.month_span() <= self.max_monthly_periods {
            TimeGranularity::Monthly
        } else {
            TimeGranularity::Yearly
        }
    }
}

fn timeout_message(timeout: Duration) -> String {
    format!("timed out after {timeout:?}")
}

enum FetchOutcome {
    Rows(Vec<EventRow>),
    Failed(String),
}

/// Row-by-row fold state for one aggregation.
struct Accumulator<'a> {
    filter: &'a AggregationFilter,
    index: Option<&'a CityIndex>,
    seen: HashSet<DedupKey>,
    total: u64,
    by_offense: HashMap<String, u64>,
    by_law_class: HashMap<String, u64>,
    by_premise: HashMap<String, u64>,
    by_borough: HashMap<String, u64>,
    by_region: HashMap<usize, u64>,
    by_period: HashMap<String, u64>,
    race: PartyCounts,
    sex: PartyCounts,
    age: PartyCounts,
    race_matrix: HashMap<(String, String), u64>,
    sex_matrix: HashMap<(String, String), u64>,
    race_sex_matrix: HashMap<(String, String), u64>,
}

#[derive(Default)]
struct PartyCounts {
    suspect: HashMap<String, u64>,
    victim: HashMap<String, u64>,
}

impl PartyCounts {
    fn add(&mut self, suspect: Option<&str>, victim: Option<&str>) {
        if let Some(label) = suspect {
            bump(&mut self.suspect, label);
        }
        if let Some(label) = victim {
            bump(&mut self.victim, label);
        }
    }

    fn finish(self) -> PartyBreakdown {
        PartyBreakdown {
            suspect: sorted_breakdown(self.suspect),
            victim: sorted_breakdown(self.victim),
        }
    }
}

impl<'a> Accumulator<'a> {
    fn new(filter: &'a AggregationFilter, index: Option<&'a CityIndex>) -> Self {
        Self {
            filter,
            index,
            seen: HashSet::new(),
            total: 0,
            by_offense: HashMap::new(),
            by_law_class: HashMap::new(),
            by_premise: HashMap::new(),
            by_borough: HashMap::new(),
            by_region: HashMap::new(),
            by_period: HashMap::new(),
            race: PartyCounts::default(),
            sex: PartyCounts::default(),
            age: PartyCounts::default(),
            race_matrix: HashMap::new(),
            sex_matrix: HashMap::new(),
            race_sex_matrix: HashMap::new(),
        }
    }

    fn add(&mut self, row: &EventRow, strategy: DedupStrategy, polygon: Option<&Polygon<f64>>) {
        if !self.filter.window.contains(row.occurred_at) {
            return;
        }
        if !self.seen.insert(DedupKey::of(row, strategy)) {
            return;
        }
        if !self.admits(row) {
            return;
        }
        if let Some(polygon) = polygon {
            let inside = row
                .point
                .is_some_and(|p| polygon_contains(polygon, p.lat, p.lon));
            if !inside {
                return;
            }
        }

        self.total += 1;
        bump(&mut self.by_offense, &row.category);
        if let Some(law_class) = row.law_class {
            bump(&mut self.by_law_class, law_class.as_ref());
        }
        if let Some(premise) = &row.premise {
            bump(&mut self.by_premise, premise);
        }
        if let Some(borough) = &row.borough {
            bump(&mut self.by_borough, borough);
        }
        if let (Some(index), Some(point)) = (self.index, row.point)
            && let Some(position) = index.grid().lookup(point.lat, point.lon)
        {
            *self.by_region.entry(position).or_default() += 1;
        }

        *self
            .by_period
            .entry(month_label(row.occurred_at))
            .or_default() += 1;

        let include_unknown = self.filter.include_unknown;
        let suspect = Labels::of(&row.suspect, include_unknown);
        let victim = Labels::of(&row.victim, include_unknown);

        self.race
            .add(label(suspect.race.as_ref()), label(victim.race.as_ref()));
        self.sex
            .add(label(suspect.sex.as_ref()), label(victim.sex.as_ref()));
        self.age
            .add(label(suspect.age.as_ref()), label(victim.age.as_ref()));

        if let (Some(s), Some(v)) = (suspect.race, victim.race) {
            *self
                .race_matrix
                .entry((s.to_string(), v.to_string()))
                .or_default() += 1;
        }
        if let (Some(s), Some(v)) = (suspect.sex, victim.sex) {
            *self
                .sex_matrix
                .entry((s.to_string(), v.to_string()))
                .or_default() += 1;
        }
        if let (Some(s), Some(v)) = (suspect.race_sex(), victim.race_sex()) {
            *self.race_sex_matrix.entry((s, v)).or_default() += 1;
        }
    }

    fn admits(&self, row: &EventRow) -> bool {
        let filter = self.filter;
        if let Some(categories) = &filter.categories
            && !categories.contains(&row.category)
        {
            return false;
        }
        if let Some(classes) = &filter.law_classes
            && !row.law_class.is_some_and(|c| classes.contains(&c))
        {
            return false;
        }
        party_admits(&filter.suspect, &row.suspect, filter.include_unknown)
            && party_admits(&filter.victim, &row.victim, filter.include_unknown)
    }

    fn finish(
        self,
        granularity: TimeGranularity,
        window: &TimeWindow,
        top_n: usize,
        sources: Vec<SourceStatus>,
    ) -> AggregationResult {
        let by_region = self.index.map_or_else(Vec::new, |index| {
            let mut counts: Vec<RegionCount> = self
                .by_region
                .iter()
                .filter_map(|(position, count)| {
                    index
                        .catalog()
                        .region_at(*position)
                        .map(|region| RegionCount {
                            region_id: region.id.clone(),
                            region_name: region.name.clone(),
                            count: *count,
                        })
                })
                .collect();
            counts.sort_by(|a, b| {
                b.count
                    .cmp(&a.count)
                    .then_with(|| a.region_id.cmp(&b.region_id))
            });
            counts
        });

        let partial = sources.iter().any(|s| s.error.is_some());

        AggregationResult {
            total: self.total,
            by_offense: sorted_breakdown(self.by_offense),
            by_law_class: sorted_breakdown(self.by_law_class),
            by_premise: sorted_breakdown(self.by_premise),
            by_borough: sorted_breakdown(self.by_borough),
            by_region,
            by_race: self.race.finish(),
            by_sex: self.sex.finish(),
            by_age: self.age.finish(),
            time_series: zero_filled_series(&self.by_period, window, granularity),
            granularity,
            matrices: Matrices {
                race: cross_tab(&self.race_matrix, top_n),
                sex: cross_tab(&self.sex_matrix, top_n),
                race_sex: cross_tab(&self.race_sex_matrix, top_n),
            },
            partial,
            sources,
        }
    }
}

/// Reportable demographics of one party. Unknown values are `None` unless
/// `include_unknown` is set.
struct Labels {
    race: Option<Race>,
    sex: Option<Sex>,
    age: Option<AgeGroup>,
}

impl Labels {
    fn of(demographics: &Demographics, include_unknown: bool) -> Self {
        Self {
            race: demographics
                .race
                .filter(|r| include_unknown || r.is_known()),
            sex: demographics.sex.filter(|s| include_unknown || s.is_known()),
            age: demographics
                .age_group
                .filter(|a| include_unknown || a.is_known()),
        }
    }

    fn race_sex(&self) -> Option<String> {
        Some(format!("{}|{}", self.race?, self.sex?))
    }
}

fn label<T: AsRef<str>>(value: Option<&T>) -> Option<&str> {
    value.map(AsRef::as_ref)
}

/// Whether a party's demographics pass its inclusion sets. A value passes
/// when it is known and in the set, or unknown and `include_unknown` holds.
/// An attribute the dataset does not carry counts as unknown.
fn party_admits(
    filter: &DemographicFilter,
    demographics: &Demographics,
    include_unknown: bool,
) -> bool {
    fn check<T: Ord + Copy>(
        set: Option<&std::collections::BTreeSet<T>>,
        value: Option<T>,
        known: impl Fn(T) -> bool,
        include_unknown: bool,
    ) -> bool {
        let Some(set) = set else {
            return true;
        };
        match value {
            Some(v) if known(v) => set.contains(&v),
            _ => include_unknown,
        }
    }

    if filter.is_unrestricted() {
        return true;
    }
    check(
        filter.races.as_ref(),
        demographics.race,
        Race::is_known,
        include_unknown,
    ) && check(
        filter.sexes.as_ref(),
        demographics.sex,
        Sex::is_known,
        include_unknown,
    ) && check(
        filter.age_groups.as_ref(),
        demographics.age_group,
        AgeGroup::is_known,
        include_unknown,
    )
}

fn bump(map: &mut HashMap<String, u64>, label: &str) {
    if let Some(count) = map.get_mut(label) {
        *count += 1;
    } else {
        map.insert(label.to_string(), 1);
    }
}

/// Count descending, then label ascending.
fn sorted_breakdown(counts: HashMap<String, u64>) -> Vec<BreakdownEntry> {
    let mut entries: Vec<BreakdownEntry> = counts
        .into_iter()
        .map(|(label, count)| BreakdownEntry { label, count })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    entries
}

/// Rows are always bucketed by month; yearly series are rolled up from
/// these labels.
fn month_label(instant: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", instant.year(), instant.month())
}

/// Every period the window touches, in order.
fn periods(window: &TimeWindow, granularity: TimeGranularity) -> Vec<String> {
    if window.is_empty() {
        return vec![];
    }
    let last = window.last_instant();
    let (mut year, mut month) = (window.start.year(), window.start.month());
    let mut labels = Vec::new();

    match granularity {
        TimeGranularity::Yearly => {
            for y in year..=last.year() {
                labels.push(format!("{y:04}"));
            }
        }
        TimeGranularity::Monthly => {
            while (year, month) <= (last.year(), last.month()) {
                labels.push(format!("{year:04}-{month:02}"));
                if month == 12 {
                    year += 1;
                    month = 1;
                } else {
                    month += 1;
                }
            }
        }
    }
    labels
}

/// Rolls monthly counts up to the requested granularity and fills gaps
/// with zeros.
fn zero_filled_series(
    monthly: &HashMap<String, u64>,
    window: &TimeWindow,
    granularity: TimeGranularity,
) -> Vec<TimeSeriesPoint> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for (label, count) in monthly {
        let key = match granularity {
            TimeGranularity::Monthly => label.clone(),
            TimeGranularity::Yearly => label.chars().take(4).collect(),
        };
        *counts.entry(key).or_default() += count;
    }

    periods(window, granularity)
        .into_iter()
        .map(|period| {
            let count = counts.get(&period).copied().unwrap_or(0);
            TimeSeriesPoint { period, count }
        })
        .collect()
}

/// Keeps the `top_n` labels of each margin by total count (ties by label)
/// and lays the counts out as a dense matrix.
fn cross_tab(cells: &HashMap<(String, String), u64>, top_n: usize) -> CrossTab {
    let mut row_totals: HashMap<&str, u64> = HashMap::new();
    let mut column_totals: HashMap<&str, u64> = HashMap::new();
    for ((row, column), count) in cells {
        *row_totals.entry(row).or_default() += count;
        *column_totals.entry(column).or_default() += count;
    }

    let top = |totals: HashMap<&str, u64>| -> Vec<String> {
        let mut labels: Vec<(&str, u64)> = totals.into_iter().collect();
        labels.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        labels
            .into_iter()
            .take(top_n)
            .map(|(label, _)| label.to_string())
            .collect()
    };

    let rows = top(row_totals);
    let columns = top(column_totals);
    let counts = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|column| {
                    cells
                        .get(&(row.clone(), column.clone()))
                        .copied()
                        .unwrap_or(0)
                })
                .collect()
        })
        .collect();

    CrossTab {
        rows,
        columns,
        counts,
    }
}
