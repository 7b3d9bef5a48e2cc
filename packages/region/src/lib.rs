#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Per-city region catalogs.
//!
//! A [`RegionCatalog`] is the immutable list of a city's named polygons
//! (neighborhoods, tabulation areas, districts). Catalogs are produced by a
//! [`loader::RegionCatalogLoader`] and consumed by the spatial resolver and
//! the binner.

pub mod geometry;
pub mod loader;
pub mod normalize;

use crime_stats_region_models::BoundingBox;
use geo::MultiPolygon;
use thiserror::Error;

/// Errors that can occur while loading region catalogs.
#[derive(Debug, Error)]
pub enum RegionError {
    /// Reading a catalog file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Geometry could not be converted.
    #[error("Geometry error: {message}")]
    Geometry {
        /// Description of what went wrong.
        message: String,
    },

    /// The city has no region catalog configured.
    #[error("No region catalog configured for city: {city}")]
    NotConfigured {
        /// The requested city id.
        city: String,
    },
}

/// One named polygonal region of a city.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    /// Stable identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// City the region belongs to.
    pub city: String,
    /// Polygon rings in lon/lat order.
    pub geometry: MultiPolygon<f64>,
    /// Bounding box of `geometry`.
    pub bbox: BoundingBox,
    /// Geodesic area in square meters.
    pub area_sq_m: f64,
}

impl Region {
    /// Builds a region, deriving its bounding box and area from `geometry`.
    ///
    /// Returns `None` if the geometry is empty.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        city: impl Into<String>,
        geometry: MultiPolygon<f64>,
    ) -> Option<Self> {
        let bbox = geometry::bounding_box(&geometry)?;
        let area_sq_m = geometry::area_sq_m(&geometry);
        Some(Self {
            id: id.into(),
            name: name.into(),
            city: city.into(),
            geometry,
            bbox,
            area_sq_m,
        })
    }

    /// Whether the region's polygons contain the point (boundary inclusive).
    #[must_use]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.bbox.contains(lat, lon) && geometry::multipolygon_contains(&self.geometry, lat, lon)
    }
}

/// The immutable region list of one city.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionCatalog {
    city: String,
    regions: Vec<Region>,
}

impl RegionCatalog {
    /// Creates a catalog. Later regions with a duplicate id are dropped.
    #[must_use]
    pub fn new(city: impl Into<String>, regions: Vec<Region>) -> Self {
        let city = city.into();
        let mut seen = std::collections::BTreeSet::new();
        let regions = regions
            .into_iter()
            .filter(|r| {
                let fresh = seen.insert(r.id.clone());
                if !fresh {
                    log::warn!("{city}: duplicate region id {}, keeping the first", r.id);
                }
                fresh
            })
            .collect();
        Self { city, regions }
    }

    /// City id.
    #[must_use]
    pub fn city(&self) -> &str {
        &self.city
    }

    /// Regions in catalog order.
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Region at `position` in catalog order.
    #[must_use]
    pub fn region_at(&self, position: usize) -> Option<&Region> {
        self.regions.get(position)
    }

    /// Region with the given id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.id == id)
    }

    /// Number of regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the catalog has no regions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Bounding box covering every region, or `None` for an empty catalog.
    #[must_use]
    pub fn bbox(&self) -> Option<BoundingBox> {
        self.regions
            .iter()
            .map(|r| r.bbox)
            .reduce(|acc, b| acc.union(&b))
    }
}
