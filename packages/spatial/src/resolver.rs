//! Per-city lazily built grid indexes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crime_stats_region::RegionCatalog;
use crime_stats_region::loader::RegionCatalogLoader;
use crime_stats_region_models::{PointLookupResult, PointQuery, RegionMatch, is_valid_coordinate};
use h3o::Resolution;

use crate::SpatialError;
use crate::grid::{DEFAULT_MAX_CELLS_PER_REGION, GridCellIndex};

/// A city's region catalog together with its grid index.
#[derive(Debug, Clone, PartialEq)]
pub struct CityIndex {
    catalog: RegionCatalog,
    grid: GridCellIndex,
}

impl CityIndex {
    /// Builds the grid for `catalog`.
    #[must_use]
    pub fn build(catalog: RegionCatalog, resolution: Resolution, max_cells_per_region: usize) -> Self {
        let grid = GridCellIndex::build(&catalog, resolution, max_cells_per_region);
        Self { catalog, grid }
    }

    /// The region catalog.
    #[must_use]
    pub const fn catalog(&self) -> &RegionCatalog {
        &self.catalog
    }

    /// The grid index.
    #[must_use]
    pub const fn grid(&self) -> &GridCellIndex {
        &self.grid
    }

    /// Resolves a point to a region.
    #[must_use]
    pub fn lookup(&self, lat: f64, lon: f64) -> Option<RegionMatch> {
        let region = self.catalog.region_at(self.grid.lookup(lat, lon)?)?;
        Some(RegionMatch {
            region_id: region.id.clone(),
            region_name: region.name.clone(),
        })
    }
}

type Slot = Arc<Mutex<Option<Arc<CityIndex>>>>;

/// Resolves points to regions, building each city's index on first use.
///
/// Concurrent first lookups for the same city are single-flight: one caller
/// loads and builds while the others wait on the city's slot. A failed load
/// is not memoized.
pub struct SpatialRegionResolver {
    loader: Arc<dyn RegionCatalogLoader>,
    resolution: Resolution,
    max_cells_per_region: usize,
    slots: RwLock<BTreeMap<String, Slot>>,
}

impl std::fmt::Debug for SpatialRegionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialRegionResolver")
            .field("resolution", &self.resolution)
            .field("max_cells_per_region", &self.max_cells_per_region)
            .finish_non_exhaustive()
    }
}

impl SpatialRegionResolver {
    /// Creates a resolver that loads catalogs through `loader`.
    #[must_use]
    pub fn new(loader: Arc<dyn RegionCatalogLoader>, resolution: Resolution) -> Self {
        Self {
            loader,
            resolution,
            max_cells_per_region: DEFAULT_MAX_CELLS_PER_REGION,
            slots: RwLock::new(BTreeMap::new()),
        }
    }

    /// Overrides the per-region cell cap.
    #[must_use]
    pub const fn with_max_cells_per_region(mut self, max_cells_per_region: usize) -> Self {
        self.max_cells_per_region = max_cells_per_region;
        self
    }

    /// Resolution indexes are built at.
    #[must_use]
    pub const fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn slot(&self, city: &str) -> Slot {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(city)
        {
            return Arc::clone(slot);
        }
        Arc::clone(
            self.slots
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(city.to_string())
                .or_default(),
        )
    }

    /// Returns the city's index, building it if needed. Blocks while a build
    /// is in progress.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError`] if the catalog cannot be loaded.
    pub fn city_index(&self, city: &str) -> Result<Arc<CityIndex>, SpatialError> {
        let slot = self.slot(city);
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = guard.as_ref() {
            return Ok(Arc::clone(index));
        }

        log::info!("Building region index for {city}");
        let catalog = self.loader.load(city)?;
        let index = Arc::new(CityIndex::build(catalog, self.resolution, self.max_cells_per_region));
        *guard = Some(Arc::clone(&index));
        drop(guard);
        Ok(index)
    }

    /// Builds the city's index eagerly.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError`] if the catalog cannot be loaded.
    pub fn init(&self, city: &str) -> Result<(), SpatialError> {
        self.city_index(city).map(|_| ())
    }

    /// Whether the city's index has been built.
    #[must_use]
    pub fn is_ready(&self, city: &str) -> bool {
        let slot = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(city)
            .cloned();
        slot.is_some_and(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).is_some())
    }

    /// Drops the city's index; the next lookup rebuilds it.
    pub fn reset(&self, city: &str) {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(city);
    }

    /// Drops every city's index.
    pub fn reset_all(&self) {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Resolves a point to a region of `city`.
    ///
    /// Returns `None` for invalid coordinates, points outside every indexed
    /// region, or when the catalog cannot be loaded.
    #[must_use]
    pub fn lookup(&self, city: &str, lat: f64, lon: f64) -> Option<RegionMatch> {
        if !is_valid_coordinate(lat, lon) {
            return None;
        }
        match self.city_index(city) {
            Ok(index) => index.lookup(lat, lon),
            Err(e) => {
                log::warn!("Region lookup for {city} unavailable: {e}");
                None
            }
        }
    }

    /// Resolves many points. Results are in input order and echo each
    /// query's id.
    #[must_use]
    pub fn batch_lookup(&self, city: &str, points: &[PointQuery]) -> Vec<PointLookupResult> {
        let index = match self.city_index(city) {
            Ok(index) => Some(index),
            Err(e) => {
                log::warn!("Batch region lookup for {city} unavailable: {e}");
                None
            }
        };

        points
            .iter()
            .map(|point| PointLookupResult {
                id: point.id.clone(),
                region: index
                    .as_ref()
                    .and_then(|index| index.lookup(point.lat, point.lon)),
            })
            .collect()
    }
}
