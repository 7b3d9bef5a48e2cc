#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Point-to-region resolution backed by a precomputed H3 grid.
//!
//! Each city's region polygons are covered with H3 cells once; a lookup is
//! then a single cell computation plus a hash probe. Boundary cells belong
//! to exactly one region (the last one in catalog order that touches the
//! cell), so points within roughly one cell of a border may resolve to a
//! neighbor. That imprecision is accepted in exchange for O(1) lookups.

pub mod grid;
pub mod resolver;

pub use grid::GridCellIndex;
pub use resolver::{CityIndex, SpatialRegionResolver};

use crime_stats_region::RegionError;
use thiserror::Error;

/// Default H3 resolution (~174 m hexagon edge).
pub const DEFAULT_RESOLUTION: u8 = 9;

/// Errors that can occur while building a city index.
#[derive(Debug, Error)]
pub enum SpatialError {
    /// The region catalog could not be loaded.
    #[error("Region catalog error: {0}")]
    Region(#[from] RegionError),

    /// The configured H3 resolution is out of range.
    #[error("Invalid H3 resolution: {value}")]
    Resolution {
        /// The rejected value.
        value: u8,
    },
}

/// Converts a raw resolution level into an [`h3o::Resolution`].
///
/// # Errors
///
/// Returns [`SpatialError::Resolution`] if `value` is not in `0..=15`.
pub fn resolution(value: u8) -> Result<h3o::Resolution, SpatialError> {
    h3o::Resolution::try_from(value).map_err(|_| SpatialError::Resolution { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_bounds() {
        assert!(resolution(DEFAULT_RESOLUTION).is_ok());
        assert!(resolution(15).is_ok());
        assert!(matches!(
            resolution(16),
            Err(SpatialError::Resolution { value: 16 })
        ));
    }
}
