//! Runtime tuning read from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crime_stats_spatial::grid::DEFAULT_MAX_CELLS_PER_REGION;

/// Tuning knobs for the stats service.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsConfig {
    /// H3 resolution of the region grid (`CRIME_STATS_H3_RESOLUTION`).
    pub h3_resolution: u8,
    /// Lifetime of cached results (`CRIME_STATS_CACHE_TTL_SECS`).
    pub cache_ttl: Duration,
    /// Maximum cached results (`CRIME_STATS_CACHE_MAX_ENTRIES`).
    pub cache_max_entries: usize,
    /// Grid step in degrees for cache key quantization
    /// (`CRIME_STATS_CACHE_STEP_DEG`).
    pub cache_step_deg: f64,
    /// Labels kept on each cross-tab margin (`CRIME_STATS_TOP_N`).
    pub top_n: usize,
    /// Bound on one aggregation (`CRIME_STATS_TIMEOUT_SECS`).
    pub timeout: Duration,
    /// Longest window, in months, still reported monthly
    /// (`CRIME_STATS_MAX_MONTHLY_PERIODS`).
    pub max_monthly_periods: u32,
    /// Directory holding region `GeoJSON` files (`CRIME_STATS_REGIONS_DIR`).
    pub regions_dir: PathBuf,
    /// Cap on grid cells indexed per region
    /// (`CRIME_STATS_MAX_CELLS_PER_REGION`).
    pub max_cells_per_region: usize,
    /// Cap on records fetched per dataset (`CRIME_STATS_MAX_RECORDS`).
    /// Unset fetches everything.
    pub max_records: Option<u64>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            h3_resolution: 9,
            cache_ttl: Duration::from_secs(60),
            cache_max_entries: 512,
            cache_step_deg: 0.001,
            top_n: 8,
            timeout: Duration::from_secs(120),
            max_monthly_periods: 36,
            regions_dir: PathBuf::from("data/regions"),
            max_cells_per_region: DEFAULT_MAX_CELLS_PER_REGION,
            max_records: None,
        }
    }
}

impl StatsConfig {
    /// Reads overrides from the process environment. Unset or unparseable
    /// variables keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads overrides through `lookup`.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            h3_resolution: lookup("CRIME_STATS_H3_RESOLUTION")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.h3_resolution),
            cache_ttl: parse("CRIME_STATS_CACHE_TTL_SECS")
                .map_or(defaults.cache_ttl, Duration::from_secs),
            cache_max_entries: parse("CRIME_STATS_CACHE_MAX_ENTRIES")
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.cache_max_entries),
            cache_step_deg: lookup("CRIME_STATS_CACHE_STEP_DEG")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v > 0.0)
                .unwrap_or(defaults.cache_step_deg),
            top_n: parse("CRIME_STATS_TOP_N")
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.top_n),
            timeout: parse("CRIME_STATS_TIMEOUT_SECS")
                .filter(|v| *v > 0)
                .map_or(defaults.timeout, Duration::from_secs),
            max_monthly_periods: parse("CRIME_STATS_MAX_MONTHLY_PERIODS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.max_monthly_periods),
            regions_dir: lookup("CRIME_STATS_REGIONS_DIR")
                .filter(|v| !v.trim().is_empty())
                .map_or(defaults.regions_dir, PathBuf::from),
            max_cells_per_region: parse("CRIME_STATS_MAX_CELLS_PER_REGION")
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_cells_per_region),
            max_records: parse("CRIME_STATS_MAX_RECORDS")
                .filter(|v| *v > 0)
                .or(defaults.max_records),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(
            StatsConfig::from_lookup(lookup(&[])),
            StatsConfig::default()
        );
    }

    #[test]
    fn overrides_are_applied() {
        let config = StatsConfig::from_lookup(lookup(&[
            ("CRIME_STATS_H3_RESOLUTION", "8"),
            ("CRIME_STATS_CACHE_TTL_SECS", "5"),
            ("CRIME_STATS_CACHE_STEP_DEG", "0.01"),
            ("CRIME_STATS_TOP_N", " 4 "),
            ("CRIME_STATS_REGIONS_DIR", "/srv/regions"),
            ("CRIME_STATS_MAX_CELLS_PER_REGION", "1000"),
            ("CRIME_STATS_MAX_RECORDS", "20000"),
        ]));
        assert_eq!(config.h3_resolution, 8);
        assert_eq!(config.cache_ttl, Duration::from_secs(5));
        assert!((config.cache_step_deg - 0.01).abs() < f64::EPSILON);
        assert_eq!(config.top_n, 4);
        assert_eq!(config.regions_dir, PathBuf::from("/srv/regions"));
        assert_eq!(config.cache_max_entries, 512);
        assert_eq!(config.max_cells_per_region, 1000);
        assert_eq!(config.max_records, Some(20_000));
    }

    #[test]
    fn garbage_and_zero_values_are_ignored() {
        let config = StatsConfig::from_lookup(lookup(&[
            ("CRIME_STATS_CACHE_MAX_ENTRIES", "0"),
            ("CRIME_STATS_CACHE_STEP_DEG", "-1"),
            ("CRIME_STATS_TIMEOUT_SECS", "soon"),
            ("CRIME_STATS_MAX_RECORDS", "0"),
        ]));
        assert_eq!(config, StatsConfig::default());
    }
}
