//! Region catalog loaders.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crime_stats_region_models::RegionSourceConfig;

use crate::normalize::normalize_features;
use crate::{RegionCatalog, RegionError};

/// Produces the region catalog of a city.
///
/// Loading is synchronous; callers that build indexes lazily block on it.
pub trait RegionCatalogLoader: Send + Sync {
    /// Loads the catalog for `city`.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError`] if the city has no catalog or it cannot be
    /// read or parsed.
    fn load(&self, city: &str) -> Result<RegionCatalog, RegionError>;
}

/// Loads `GeoJSON` `FeatureCollection` files from a directory.
#[derive(Debug, Clone)]
pub struct GeoJsonDirLoader {
    dir: PathBuf,
    sources: BTreeMap<String, RegionSourceConfig>,
}

impl GeoJsonDirLoader {
    /// Creates a loader reading `<dir>/<config.file>` for each city.
    pub fn new(
        dir: impl Into<PathBuf>,
        sources: impl IntoIterator<Item = (String, RegionSourceConfig)>,
    ) -> Self {
        Self {
            dir: dir.into(),
            sources: sources.into_iter().collect(),
        }
    }

    /// Directory the catalogs are read from.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl RegionCatalogLoader for GeoJsonDirLoader {
    fn load(&self, city: &str) -> Result<RegionCatalog, RegionError> {
        let config = self
            .sources
            .get(city)
            .ok_or_else(|| RegionError::NotConfigured {
                city: city.to_string(),
            })?;

        let path = self.dir.join(&config.file);
        log::info!("Loading region catalog for {city} from {}", path.display());

        let text = std::fs::read_to_string(&path)?;
        let collection: serde_json::Value = serde_json::from_str(&text)?;
        let features = collection
            .get("features")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| RegionError::Geometry {
                message: format!("{} is not a FeatureCollection", path.display()),
            })?;

        let catalog = RegionCatalog::new(city, normalize_features(city, features, config));
        log::info!("Loaded {} regions for {city}", catalog.len());
        Ok(catalog)
    }
}
