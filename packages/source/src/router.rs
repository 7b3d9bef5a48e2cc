//! Dataset routing across a city's cutover year.
//!
//! Pure functions only; no I/O happens here.

use chrono::{DateTime, Utc};
use crime_stats_source_models::{
    CityConfig, DatasetDefinition, DatasetDescriptor, DatasetFormat, TimeWindow, year_start,
};

/// Returns the half-open coverage `[start, end)` of a dataset, where
/// `None` means unbounded on that side.
///
/// Legacy datasets default to everything before Jan 1 of the year after the
/// cutover, modern datasets to everything from that instant on. Explicit
/// `first_year`/`last_year` on the dataset replace the matching default.
#[must_use]
pub fn coverage(
    cutover_year: i32,
    dataset: &DatasetDefinition,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let boundary = cutover_year.checked_add(1).and_then(year_start);

    let (default_start, default_end) = match dataset.format {
        DatasetFormat::Legacy => (None, boundary),
        DatasetFormat::Modern => (boundary, None),
    };

    let start = dataset.first_year.map_or(default_start, year_start);
    let end = dataset
        .last_year
        .map_or(default_end, |y| y.checked_add(1).and_then(year_start));

    (start, end)
}

/// Clips `window` to the dataset's coverage. Returns `None` when they do
/// not overlap.
#[must_use]
pub fn clip(cutover_year: i32, dataset: &DatasetDefinition, window: &TimeWindow) -> Option<TimeWindow> {
    let (start, end) = coverage(cutover_year, dataset);
    let clipped = TimeWindow::new(
        start.map_or(window.start, |s| s.max(window.start)),
        end.map_or(window.end, |e| e.min(window.end)),
    );
    (!clipped.is_empty()).then_some(clipped)
}

/// Selects the datasets of `city` that must be queried for `window`.
///
/// Each descriptor carries the window clipped to the dataset's coverage.
/// Legacy datasets come first, then modern ones, each group in registry
/// order. An empty window routes to nothing.
#[must_use]
pub fn route(city: &CityConfig, window: &TimeWindow) -> Vec<DatasetDescriptor> {
    if window.is_empty() {
        return vec![];
    }

    let mut selected: Vec<(usize, DatasetDescriptor)> = city
        .datasets
        .iter()
        .enumerate()
        .filter_map(|(position, dataset)| {
            clip(city.cutover_year, dataset, window).map(|clipped| {
                (
                    position,
                    DatasetDescriptor {
                        city: city.id.clone(),
                        dataset: dataset.clone(),
                        window: clipped,
                    },
                )
            })
        })
        .collect();

    selected.sort_by_key(|(position, d)| (d.dataset.format, *position));

    log::debug!(
        "route: city={} window=[{}, {}) -> {:?}",
        city.id,
        window.start,
        window.end,
        selected
            .iter()
            .map(|(_, d)| d.dataset.id.as_str())
            .collect::<Vec<_>>()
    );

    selected.into_iter().map(|(_, d)| d).collect()
}
