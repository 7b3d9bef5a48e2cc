#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Region boundary source definitions and point-lookup types.
//!
//! Defines the TOML schema describing where a city's region polygons come
//! from, the WGS84 [`BoundingBox`] shared by the catalog and the
//! aggregation scope, and the request/response shapes of point lookups.

use serde::{Deserialize, Serialize};

/// A geographic bounding box in WGS84 coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Western longitude boundary.
    pub west: f64,
    /// Southern latitude boundary.
    pub south: f64,
    /// Eastern longitude boundary.
    pub east: f64,
    /// Northern latitude boundary.
    pub north: f64,
}

impl BoundingBox {
    /// Creates a new bounding box from the given coordinates.
    #[must_use]
    pub const fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Whether all corners are finite, in range, and correctly ordered.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        [self.west, self.south, self.east, self.north]
            .iter()
            .all(|v| v.is_finite())
            && is_valid_coordinate(self.south, self.west)
            && is_valid_coordinate(self.north, self.east)
            && self.west <= self.east
            && self.south <= self.north
    }

    /// Whether the point lies inside the box (edges inclusive).
    #[must_use]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lon >= self.west && lon <= self.east && lat >= self.south && lat <= self.north
    }

    /// Returns the smallest box covering both `self` and `other`.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            west: self.west.min(other.west),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            north: self.north.max(other.north),
        }
    }
}

/// Whether `lat`/`lon` are finite and within the valid WGS84 ranges.
#[must_use]
pub fn is_valid_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
}

/// Where a city's region polygons are loaded from.
///
/// Deserialized from the `[regions]` table of a city definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSourceConfig {
    /// File name of the `GeoJSON` `FeatureCollection`, relative to the
    /// regions directory.
    pub file: String,
    /// Feature property holding the stable region identifier.
    pub id_field: String,
    /// Feature property holding the human-readable region name.
    pub name_field: String,
    /// How polygon geometry is encoded in each feature.
    #[serde(default)]
    pub geometry: GeometryFormat,
}

/// How polygon geometry is encoded in a region feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryFormat {
    /// Geometry is a standard `GeoJSON` `Polygon` or `MultiPolygon`.
    #[default]
    Geojson,
    /// Geometry uses Esri JSON format (`{ "rings": [...] }`).
    EsriRings,
}

/// The region a point resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionMatch {
    /// Stable region identifier.
    pub region_id: String,
    /// Human-readable region name.
    pub region_name: String,
}

/// One point in a batch lookup request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointQuery {
    /// Optional caller-supplied identifier echoed back in the result.
    #[serde(default)]
    pub id: Option<String>,
    /// Latitude (WGS84).
    pub lat: f64,
    /// Longitude (WGS84).
    pub lon: f64,
}

/// Result for one [`PointQuery`], in the same position as its query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointLookupResult {
    /// The caller-supplied identifier from the query, if any.
    pub id: Option<String>,
    /// The matched region, or `None` when the point is invalid or outside
    /// every indexed region.
    pub region: Option<RegionMatch>,
}
