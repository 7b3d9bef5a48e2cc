//! The injectable stats service.
//!
//! Owns the resolver, the aggregator, the result cache, and the map of
//! in-flight aggregations. Concurrent identical requests share one
//! aggregation future; complete results are cached, partial ones are
//! returned but not stored.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crime_stats_analytics_models::{AggregationFilter, AggregationResult, RegionBucket};
use crime_stats_region::loader::{GeoJsonDirLoader, RegionCatalogLoader};
use crime_stats_region_models::{PointLookupResult, PointQuery, RegionMatch};
use crime_stats_source::EventProvider;
use crime_stats_source::registry::CityRegistry;
use crime_stats_source::socrata::SocrataProvider;
use crime_stats_spatial::SpatialRegionResolver;
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};

use crate::AnalyticsError;
use crate::aggregator::Aggregator;
use crate::binner;
use crate::cache::{CacheStats, ResultCache, cache_key};
use crate::config::StatsConfig;

type SharedAggregation = Shared<BoxFuture<'static, Result<Arc<AggregationResult>, AnalyticsError>>>;

struct InFlight {
    id: u64,
    future: SharedAggregation,
}

/// Region lookups, aggregation, and binning behind one handle.
pub struct CrimeStatsService {
    config: StatsConfig,
    registry: Arc<CityRegistry>,
    resolver: Arc<SpatialRegionResolver>,
    aggregator: Arc<Aggregator>,
    cache: ResultCache,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_flight: AtomicU64,
}

impl std::fmt::Debug for CrimeStatsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrimeStatsService")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl CrimeStatsService {
    /// Wires a service from its collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::Config`] if the configured H3 resolution is
    /// out of range.
    pub fn new(
        config: StatsConfig,
        registry: Arc<CityRegistry>,
        provider: Arc<dyn EventProvider>,
        loader: Arc<dyn RegionCatalogLoader>,
    ) -> Result<Self, AnalyticsError> {
        let resolution = crime_stats_spatial::resolution(config.h3_resolution).map_err(|e| {
            AnalyticsError::Config {
                message: e.to_string(),
            }
        })?;
        let resolver = Arc::new(
            SpatialRegionResolver::new(loader, resolution)
                .with_max_cells_per_region(config.max_cells_per_region),
        );
        let aggregator = Arc::new(
            Aggregator::new(Arc::clone(&registry), provider, Arc::clone(&resolver))
                .with_top_n(config.top_n)
                .with_max_monthly_periods(config.max_monthly_periods),
        );
        let cache = ResultCache::new(config.cache_ttl, config.cache_max_entries);

        Ok(Self {
            config,
            registry,
            resolver,
            aggregator,
            cache,
            in_flight: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(0),
        })
    }

    /// Builds the production service: built-in cities, the Socrata
    /// provider, and region files from the configured directory.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::Config`] if the environment configuration
    /// is unusable.
    pub fn from_env() -> Result<Self, AnalyticsError> {
        let config = StatsConfig::from_env();
        let registry = Arc::new(CityRegistry::builtin());
        let loader = GeoJsonDirLoader::new(
            config.regions_dir.clone(),
            registry
                .cities()
                .iter()
                .filter_map(|city| city.regions.clone().map(|r| (city.id.clone(), r))),
        );
        let provider = SocrataProvider::from_env().with_max_records(config.max_records);
        Self::new(config, registry, Arc::new(provider), Arc::new(loader))
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// Registered cities.
    #[must_use]
    pub fn registry(&self) -> &CityRegistry {
        &self.registry
    }

    fn city_id(&self, city: &str) -> Option<&str> {
        self.registry.get(city).map(|c| c.id.as_str())
    }

    /// Resolves a point to a region. Unknown cities, invalid coordinates,
    /// and unavailable catalogs all resolve to `None`.
    #[must_use]
    pub fn lookup_point(&self, city: &str, lat: f64, lon: f64) -> Option<RegionMatch> {
        let id = self.city_id(city)?;
        self.resolver.lookup(id, lat, lon)
    }

    /// Resolves many points, preserving input order and ids.
    #[must_use]
    pub fn batch_lookup_points(&self, city: &str, points: &[PointQuery]) -> Vec<PointLookupResult> {
        match self.city_id(city) {
            Some(id) => self.resolver.batch_lookup(id, points),
            None => points
                .iter()
                .map(|p| PointLookupResult {
                    id: p.id.clone(),
                    region: None,
                })
                .collect(),
        }
    }

    /// Aggregates with the configured timeout.
    ///
    /// # Errors
    ///
    /// See [`Self::aggregate_with_timeout`].
    pub async fn aggregate(
        &self,
        filter: &AggregationFilter,
    ) -> Result<Arc<AggregationResult>, AnalyticsError> {
        self.aggregate_with_timeout(filter, self.config.timeout)
            .await
    }

    /// Aggregates, answering from the cache or joining an identical
    /// in-flight request when possible.
    ///
    /// A caller that joins another request's aggregation still waits at most
    /// `timeout`; if the shared work is not done by then it gets a partial
    /// result with every source marked timed out.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::InvalidFilter`] or
    /// [`AnalyticsError::UnknownCity`] before anything is fetched.
    pub async fn aggregate_with_timeout(
        &self,
        filter: &AggregationFilter,
        timeout: Duration,
    ) -> Result<Arc<AggregationResult>, AnalyticsError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let prepared = self.aggregator.prepare(filter)?;
        let mut filter = filter.clone();
        filter.city.clone_from(&prepared.city.id);

        let key = cache_key(&filter, self.config.cache_step_deg);
        if let Some(hit) = self.cache.get(&key) {
            log::debug!("aggregate: cache hit {key}");
            return Ok(hit);
        }

        let (flight, joined) = self.join_or_start(&key, filter.clone(), timeout);
        let result = if joined {
            match tokio::time::timeout_at(deadline, flight.future).await {
                Ok(result) => result,
                Err(_) => {
                    log::warn!("aggregate: in-flight {key} still running after {timeout:?}");
                    return Ok(Arc::new(
                        self.aggregator.timed_out(&filter, &prepared, timeout),
                    ));
                }
            }
        } else {
            flight.future.await
        };

        {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if in_flight.get(&key).is_some_and(|f| f.id == flight.id) {
                in_flight.remove(&key);
            }
        }

        if let Ok(value) = &result
            && !value.partial
        {
            self.cache.insert(key, Arc::clone(value));
        }
        result
    }

    /// Returns the flight for `key` and whether it was already running.
    fn join_or_start(
        &self,
        key: &str,
        filter: AggregationFilter,
        timeout: Duration,
    ) -> (InFlight, bool) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(flight) = in_flight.get(key) {
            log::debug!("aggregate: joining in-flight {key}");
            return (
                InFlight {
                    id: flight.id,
                    future: flight.future.clone(),
                },
                true,
            );
        }

        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let aggregator = Arc::clone(&self.aggregator);
        let future = async move { aggregator.aggregate(&filter, timeout).await.map(Arc::new) }
            .boxed()
            .shared();

        in_flight.insert(
            key.to_string(),
            InFlight {
                id,
                future: future.clone(),
            },
        );
        drop(in_flight);
        (InFlight { id, future }, false)
    }

    /// Bins per-region counts into deciles.
    #[must_use]
    pub fn bin_regions(counts: &BTreeMap<String, u64>) -> Vec<RegionBucket> {
        binner::bin_regions(counts)
    }

    /// Bins a result's region counts, including the city's regions that
    /// had no matching rows. Without a catalog only the counted regions are
    /// binned.
    #[must_use]
    pub fn region_buckets(&self, city: &str, result: &AggregationResult) -> Vec<RegionBucket> {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        if let Some(id) = self.city_id(city) {
            match self.resolver.city_index(id) {
                Ok(index) => {
                    for region in index.catalog().regions() {
                        counts.insert(region.id.clone(), 0);
                    }
                }
                Err(e) => log::warn!("region_buckets: no catalog for {id}: {e}"),
            }
        }
        for entry in &result.by_region {
            counts.insert(entry.region_id.clone(), entry.count);
        }
        binner::bin_regions(&counts)
    }

    /// Builds a city's region index eagerly.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::UnknownCity`] for an unregistered city and
    /// [`AnalyticsError::Index`] if its catalog cannot be loaded.
    pub fn init(&self, city: &str) -> Result<(), AnalyticsError> {
        let id = self
            .city_id(city)
            .ok_or_else(|| AnalyticsError::UnknownCity {
                city: city.to_string(),
            })?;
        self.resolver.init(id).map_err(|e| AnalyticsError::Index {
            city: id.to_string(),
            message: e.to_string(),
        })
    }

    /// Whether a city's region index is built.
    #[must_use]
    pub fn is_ready(&self, city: &str) -> bool {
        self.city_id(city)
            .is_some_and(|id| self.resolver.is_ready(id))
    }

    /// Drops every region index and cached result.
    pub fn reset(&self) {
        self.resolver.reset_all();
        self.cache.clear();
    }

    /// Cache counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone as _, Utc};
    use crime_stats_analytics_models::GeoScope;
    use crime_stats_region::{Region, RegionCatalog, RegionError};
    use crime_stats_region_models::BoundingBox;
    use crime_stats_source::{FetchScope, SourceError};
    use crime_stats_source_models::{
        CityConfig, DatasetDefinition, DatasetDescriptor, DatasetFormat, DedupStrategy,
        Demographics, EventRow, FieldMapping, GeoPoint, TimeWindow,
    };
    use geo::{LineString, MultiPolygon, Polygon};
    use std::sync::atomic::AtomicUsize;

    fn registry() -> Arc<CityRegistry> {
        Arc::new(CityRegistry::new(vec![CityConfig {
            id: "test".to_string(),
            name: "Test City".to_string(),
            state: "TS".to_string(),
            cutover_year: 2022,
            regions: None,
            datasets: vec![DatasetDefinition {
                id: "modern".to_string(),
                name: "Modern".to_string(),
                format: DatasetFormat::Modern,
                api_url: "https://example.org/resource/modern.json".to_string(),
                dedup: DedupStrategy::PointKeyed,
                first_year: None,
                last_year: None,
                page_size: 1000,
                fields: FieldMapping {
                    source_id: vec!["id".to_string()],
                    occurred_at: "date".to_string(),
                    category: vec!["category".to_string()],
                    law_class: None,
                    premise: None,
                    borough: None,
                    latitude: None,
                    longitude: None,
                    point: None,
                    suspect: crime_stats_source_models::DemographicFields::default(),
                    victim: crime_stats_source_models::DemographicFields::default(),
                },
            }],
        }]))
    }

    fn square(west: f64, south: f64, size: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![Polygon::new(
            LineString::from(vec![
                (west, south),
                (west + size, south),
                (west + size, south + size),
                (west, south + size),
                (west, south),
            ]),
            vec![],
        )])
    }

    struct ThreeSquares;

    impl RegionCatalogLoader for ThreeSquares {
        fn load(&self, city: &str) -> Result<RegionCatalog, RegionError> {
            if city != "test" {
                return Err(RegionError::NotConfigured {
                    city: city.to_string(),
                });
            }
            Ok(RegionCatalog::new(
                city,
                vec![
                    Region::new("a", "A", city, square(-74.06, 40.70, 0.02)).unwrap(),
                    Region::new("b", "B", city, square(-74.04, 40.70, 0.02)).unwrap(),
                    Region::new("c", "C", city, square(-74.02, 40.70, 0.02)).unwrap(),
                ],
            ))
        }
    }

    /// Returns one row per call; optionally fails, optionally delays.
    struct CountingProvider {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl CountingProvider {
        fn new(fail: bool, delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
                delay,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventProvider for CountingProvider {
        async fn fetch(
            &self,
            _descriptor: &DatasetDescriptor,
            _scope: &FetchScope,
        ) -> Result<Vec<EventRow>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(SourceError::Upstream {
                    message: "unavailable".to_string(),
                });
            }
            Ok(vec![EventRow {
                source_id: "1".to_string(),
                occurred_at: Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap(),
                category: "ROBBERY".to_string(),
                law_class: None,
                premise: None,
                borough: None,
                point: Some(GeoPoint::new(40.71, -74.03)),
                suspect: Demographics::default(),
                victim: Demographics::default(),
                dataset_tag: "modern".to_string(),
            }])
        }
    }

    fn service(provider: &Arc<CountingProvider>) -> CrimeStatsService {
        CrimeStatsService::new(
            StatsConfig::default(),
            registry(),
            Arc::clone(provider) as Arc<dyn EventProvider>,
            Arc::new(ThreeSquares),
        )
        .unwrap()
    }

    fn filter(bbox: BoundingBox) -> AggregationFilter {
        let mut filter = AggregationFilter::new("test", TimeWindow::years(2023, 2023).unwrap());
        filter.scope = Some(GeoScope::Bbox { bbox });
        filter
    }

    #[tokio::test]
    async fn nearby_boxes_hit_the_cache() {
        let provider = Arc::new(CountingProvider::new(false, Duration::ZERO));
        let service = service(&provider);

        let first = service
            .aggregate(&filter(BoundingBox::new(
                -74.0601, 40.7001, -74.0001, 40.7201,
            )))
            .await
            .unwrap();
        let second = service
            .aggregate(&filter(BoundingBox::new(
                -74.0603, 40.6998, -74.0003, 40.7198,
            )))
            .await
            .unwrap();

        assert_eq!(provider.calls(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        let stats = service.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn city_ids_are_canonicalized_for_caching() {
        let provider = Arc::new(CountingProvider::new(false, Duration::ZERO));
        let service = service(&provider);

        let upper = AggregationFilter::new("TEST", TimeWindow::years(2023, 2023).unwrap());
        let lower = AggregationFilter::new("test", TimeWindow::years(2023, 2023).unwrap());
        service.aggregate(&upper).await.unwrap();
        service.aggregate(&lower).await.unwrap();
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn partial_results_are_not_cached() {
        let provider = Arc::new(CountingProvider::new(true, Duration::ZERO));
        let service = service(&provider);
        let f = filter(BoundingBox::new(-74.06, 40.70, -74.00, 40.72));

        assert!(service.aggregate(&f).await.unwrap().partial);
        assert!(service.aggregate(&f).await.unwrap().partial);
        assert_eq!(provider.calls(), 2);
        assert_eq!(service.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_share_one_fetch() {
        let provider = Arc::new(CountingProvider::new(false, Duration::from_millis(50)));
        let service = service(&provider);
        let f = filter(BoundingBox::new(-74.06, 40.70, -74.00, 40.72));

        let (a, b) = tokio::join!(service.aggregate(&f), service.aggregate(&f));
        assert_eq!(provider.calls(), 1);
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert!(service.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn joiners_keep_their_own_timeout() {
        let provider = Arc::new(CountingProvider::new(false, Duration::from_millis(400)));
        let service = service(&provider);
        let f = filter(BoundingBox::new(-74.06, 40.70, -74.00, 40.72));

        let joiner = async {
            tokio::task::yield_now().await;
            let started = std::time::Instant::now();
            let result = service
                .aggregate_with_timeout(&f, Duration::from_millis(20))
                .await
                .unwrap();
            (started.elapsed(), result)
        };
        let (leader, (waited, joined)) = tokio::join!(
            service.aggregate_with_timeout(&f, Duration::from_secs(10)),
            joiner
        );

        assert!(waited < Duration::from_millis(300));
        assert!(joined.partial);
        assert_eq!(joined.total, 0);
        assert!(
            joined.sources[0]
                .error
                .as_deref()
                .unwrap()
                .starts_with("timed out")
        );

        let leader = leader.unwrap();
        assert!(!leader.partial);
        assert_eq!(leader.total, 1);
        assert_eq!(provider.calls(), 1);
        assert_eq!(service.cache_stats().entries, 1);
        assert!(service.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_filters_surface_immediately() {
        let provider = Arc::new(CountingProvider::new(false, Duration::ZERO));
        let service = service(&provider);

        let unknown = AggregationFilter::new("gotham", TimeWindow::years(2023, 2023).unwrap());
        assert!(matches!(
            service.aggregate(&unknown).await,
            Err(AnalyticsError::UnknownCity { .. })
        ));
        assert_eq!(provider.calls(), 0);
        assert_eq!(service.cache_stats().misses, 0);
    }

    #[tokio::test]
    async fn region_buckets_include_empty_regions() {
        let provider = Arc::new(CountingProvider::new(false, Duration::ZERO));
        let service = service(&provider);
        let result = service
            .aggregate(&AggregationFilter::new(
                "test",
                TimeWindow::years(2023, 2023).unwrap(),
            ))
            .await
            .unwrap();

        assert_eq!(result.by_region.len(), 1);
        assert_eq!(result.by_region[0].region_id, "b");

        let buckets = service.region_buckets("test", &result);
        let ids: Vec<&str> = buckets.iter().map(|b| b.region_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert_eq!(buckets[2].decile, 9);
        assert_eq!(buckets[2].count, 1);
    }

    #[test]
    fn lookups_go_through_the_registry() {
        let provider = Arc::new(CountingProvider::new(false, Duration::ZERO));
        let service = service(&provider);

        assert!(!service.is_ready("test"));
        service.init("TEST").unwrap();
        assert!(service.is_ready("test"));

        assert_eq!(
            service
                .lookup_point("test", 40.71, -74.05)
                .map(|m| m.region_id),
            Some("a".to_string())
        );
        assert!(service.lookup_point("test", f64::NAN, -74.05).is_none());
        assert!(service.lookup_point("gotham", 40.71, -74.05).is_none());

        let results = service.batch_lookup_points(
            "test",
            &[
                PointQuery {
                    id: Some("p1".to_string()),
                    lat: 40.71,
                    lon: -74.01,
                },
                PointQuery {
                    id: None,
                    lat: 10.0,
                    lon: 10.0,
                },
            ],
        );
        assert_eq!(results[0].id.as_deref(), Some("p1"));
        assert_eq!(
            results[0].region.as_ref().map(|m| m.region_id.as_str()),
            Some("c")
        );
        assert!(results[1].region.is_none());

        service.reset();
        assert!(!service.is_ready("test"));
        assert!(matches!(
            service.init("gotham"),
            Err(AnalyticsError::UnknownCity { .. })
        ));
    }

    #[test]
    fn bad_resolution_is_a_config_error() {
        let config = StatsConfig {
            h3_resolution: 16,
            ..StatsConfig::default()
        };
        let result = CrimeStatsService::new(
            config,
            registry(),
            Arc::new(CountingProvider::new(false, Duration::ZERO)),
            Arc::new(ThreeSquares),
        );
        assert!(matches!(result, Err(AnalyticsError::Config { .. })));
    }
}
