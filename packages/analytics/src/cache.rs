//! Short-TTL memoization of aggregation results.
//!
//! Keys quantize the geographic scope to a fixed grid so small pans and
//! zooms land on the same entry. Entries expire purely by TTL; when the
//! map exceeds its bound the oldest insertions are evicted first.
//!
//! ## Eviction
//!
//! Uses `IndexMap` insertion order: re-inserting a key moves it to the back,
//! and overflow removes from the front.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::SecondsFormat;
use crime_stats_analytics_models::{
    AggregationFilter, AggregationResult, DemographicFilter, GeoScope,
};
use indexmap::IndexMap;

/// Builds the cache key of a filter.
///
/// Scope coordinates are rounded to multiples of `step_deg`; inclusion sets
/// are already sorted, so equal filters always produce equal keys.
#[must_use]
pub fn cache_key(filter: &AggregationFilter, step_deg: f64) -> String {
    let mut key = format!(
        "{}|{}|{}|unk={}",
        filter.city.to_ascii_lowercase(),
        filter
            .window
            .start
            .to_rfc3339_opts(SecondsFormat::Nanos, true),
        filter
            .window
            .end
            .to_rfc3339_opts(SecondsFormat::Nanos, true),
        u8::from(filter.include_unknown),
    );

    push_set(
        &mut key,
        "cat",
        filter
            .categories
            .as_ref()
            .map(|s| s.iter().map(String::as_str)),
    );
    push_set(
        &mut key,
        "law",
        filter
            .law_classes
            .as_ref()
            .map(|s| s.iter().map(AsRef::as_ref)),
    );
    push_demographics(&mut key, "s", &filter.suspect);
    push_demographics(&mut key, "v", &filter.victim);

    match &filter.scope {
        None => key.push_str("|geo=*"),
        Some(GeoScope::Bbox { bbox }) => {
            let _ = write!(
                key,
                "|bbox={},{},{},{}",
                quantize(bbox.west, step_deg),
                quantize(bbox.south, step_deg),
                quantize(bbox.east, step_deg),
                quantize(bbox.north, step_deg),
            );
        }
        Some(GeoScope::Polygon { exterior }) => {
            key.push_str("|poly=");
            for [lon, lat] in exterior {
                let _ = write!(
                    key,
                    "{},{};",
                    quantize(*lon, step_deg),
                    quantize(*lat, step_deg)
                );
            }
        }
    }

    key
}

#[allow(clippy::cast_possible_truncation)]
fn quantize(value: f64, step_deg: f64) -> i64 {
    (value / step_deg).round() as i64
}

fn push_set<'a>(key: &mut String, name: &str, values: Option<impl Iterator<Item = &'a str>>) {
    match values {
        None => {
            let _ = write!(key, "|{name}=*");
        }
        Some(values) => {
            let _ = write!(key, "|{name}=[{}]", values.collect::<Vec<_>>().join(","));
        }
    }
}

fn push_demographics(key: &mut String, party: &str, filter: &DemographicFilter) {
    push_set(
        key,
        &format!("{party}.race"),
        filter.races.as_ref().map(|s| s.iter().map(AsRef::as_ref)),
    );
    push_set(
        key,
        &format!("{party}.sex"),
        filter.sexes.as_ref().map(|s| s.iter().map(AsRef::as_ref)),
    );
    push_set(
        key,
        &format!("{party}.age"),
        filter
            .age_groups
            .as_ref()
            .map(|s| s.iter().map(AsRef::as_ref)),
    );
}

struct CacheEntry {
    value: Arc<AggregationResult>,
    expires_at: Instant,
}

/// Hit/miss counters and current size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that fell through.
    pub misses: u64,
    /// Entries currently stored, including not-yet-purged expired ones.
    pub entries: usize,
}

/// Bounded TTL cache of aggregation results.
pub struct ResultCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<IndexMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("ttl", &self.ttl)
            .field("max_entries", &self.max_entries)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ResultCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(IndexMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the live entry for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<AggregationResult>> {
        self.get_at(key, Instant::now())
    }

    /// Stores `value` under `key` for the cache's TTL.
    pub fn insert(&self, key: String, value: Arc<AggregationResult>) {
        self.insert_at(key, value, Instant::now());
    }

    /// Drops every entry. Counters are kept.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<Arc<AggregationResult>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let live = match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(Arc::clone(&entry.value)),
            Some(_) => {
                entries.shift_remove(key);
                None
            }
            None => None,
        };
        drop(entries);

        let counter = if live.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        live
    }

    fn insert_at(&self, key: String, value: Arc<AggregationResult>, now: Instant) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| entry.expires_at > now);
        entries.shift_remove(&key);
        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + self.ttl,
            },
        );
        while entries.len() > self.max_entries {
            entries.shift_remove_index(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone as _, Utc};
    use crime_stats_analytics_models::{Matrices, PartyBreakdown, TimeGranularity};
    use crime_stats_crime_models::{LawClass, Race};
    use crime_stats_region_models::BoundingBox;
    use crime_stats_source_models::TimeWindow;
    use std::collections::BTreeSet;

    fn filter(bbox: BoundingBox) -> AggregationFilter {
        let mut filter = AggregationFilter::new(
            "nyc",
            TimeWindow::new(
                Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ),
        );
        filter.scope = Some(GeoScope::Bbox { bbox });
        filter
    }

    fn result(total: u64) -> Arc<AggregationResult> {
        Arc::new(AggregationResult {
            total,
            by_offense: vec![],
            by_law_class: vec![],
            by_premise: vec![],
            by_borough: vec![],
            by_region: vec![],
            by_race: PartyBreakdown::default(),
            by_sex: PartyBreakdown::default(),
            by_age: PartyBreakdown::default(),
            time_series: vec![],
            granularity: TimeGranularity::Monthly,
            matrices: Matrices::default(),
            partial: false,
            sources: vec![],
        })
    }

    #[test]
    fn nearby_boxes_share_a_key() {
        let a = filter(BoundingBox::new(-74.0001, 40.7001, -73.9001, 40.8001));
        let b = filter(BoundingBox::new(-74.0003, 40.6998, -73.9003, 40.7998));
        assert_eq!(cache_key(&a, 0.001), cache_key(&b, 0.001));

        let far = filter(BoundingBox::new(-74.01, 40.70, -73.90, 40.80));
        assert_ne!(cache_key(&a, 0.001), cache_key(&far, 0.001));
    }

    #[test]
    fn filter_changes_change_the_key() {
        let base = filter(BoundingBox::new(-74.0, 40.7, -73.9, 40.8));
        let base_key = cache_key(&base, 0.001);

        let mut other = base.clone();
        other.include_unknown = false;
        assert_ne!(cache_key(&other, 0.001), base_key);

        let mut other = base.clone();
        other.law_classes = Some(BTreeSet::from([LawClass::Felony]));
        assert_ne!(cache_key(&other, 0.001), base_key);

        let mut other = base.clone();
        other.categories = Some(BTreeSet::new());
        assert_ne!(cache_key(&other, 0.001), base_key);

        let mut other = base.clone();
        other.victim.races = Some(BTreeSet::from([Race::Black]));
        assert_ne!(cache_key(&other, 0.001), base_key);

        let mut other = base;
        other.scope = None;
        assert_ne!(cache_key(&other, 0.001), base_key);
    }

    #[test]
    fn sub_second_window_changes_change_the_key() {
        let base = filter(BoundingBox::new(-74.0, 40.7, -73.9, 40.8));
        let base_key = cache_key(&base, 0.001);

        let mut later_start = base.clone();
        later_start.window.start += chrono::Duration::milliseconds(500);
        assert_ne!(cache_key(&later_start, 0.001), base_key);

        let mut later_end = base;
        later_end.window.end += chrono::Duration::nanoseconds(1);
        assert_ne!(cache_key(&later_end, 0.001), base_key);
    }

    #[test]
    fn category_order_does_not_matter() {
        let mut a = filter(BoundingBox::new(-74.0, 40.7, -73.9, 40.8));
        let mut b = a.clone();
        a.categories = Some(
            ["ROBBERY", "BURGLARY"]
                .into_iter()
                .map(String::from)
                .collect(),
        );
        b.categories = Some(
            ["BURGLARY", "ROBBERY"]
                .into_iter()
                .map(String::from)
                .collect(),
        );
        assert_eq!(cache_key(&a, 0.001), cache_key(&b, 0.001));
    }

    #[test]
    fn hit_then_expiry() {
        let cache = ResultCache::new(Duration::from_secs(60), 8);
        let t0 = Instant::now();
        cache.insert_at("k".to_string(), result(3), t0);

        assert_eq!(
            cache
                .get_at("k", t0 + Duration::from_secs(59))
                .unwrap()
                .total,
            3
        );
        assert!(cache.get_at("k", t0 + Duration::from_secs(60)).is_none());
        assert!(cache.get_at("missing", t0).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let cache = ResultCache::new(Duration::from_secs(60), 2);
        let t0 = Instant::now();
        cache.insert_at("a".to_string(), result(1), t0);
        cache.insert_at("b".to_string(), result(2), t0);
        cache.insert_at("a".to_string(), result(10), t0);
        cache.insert_at("c".to_string(), result(3), t0);

        assert!(cache.get_at("b", t0).is_none());
        assert_eq!(cache.get_at("a", t0).unwrap().total, 10);
        assert_eq!(cache.get_at("c", t0).unwrap().total, 3);
    }

    #[test]
    fn clear_empties() {
        let cache = ResultCache::new(Duration::from_secs(60), 2);
        cache.insert("a".to_string(), result(1));
        cache.clear();
        assert!(cache.get("a").is_none());
    }
}
