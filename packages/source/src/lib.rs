#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! City registry, dataset routing, and upstream event providers.
//!
//! The [`router`] decides which datasets a time window needs; an
//! [`EventProvider`] fetches and normalizes the rows for each selected
//! dataset. [`socrata::SocrataProvider`] is the provider used in
//! production; tests substitute in-memory implementations.

pub mod normalize;
pub mod parsing;
pub mod registry;
pub mod retry;
pub mod router;
pub mod socrata;

use async_trait::async_trait;
use crime_stats_region_models::BoundingBox;
use crime_stats_source_models::{DatasetDescriptor, EventRow};

/// Errors that can occur during data source operations.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The upstream answered, but not with usable data.
    #[error("Upstream error: {message}")]
    Upstream {
        /// Description of what went wrong.
        message: String,
    },

    /// No city with the given id is registered.
    #[error("Unknown city: {city}")]
    UnknownCity {
        /// The requested city id.
        city: String,
    },
}

/// Spatial restriction passed down to an upstream fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FetchScope {
    /// Only rows inside this box are requested.
    pub bbox: Option<BoundingBox>,
}

/// An upstream source of normalized event rows.
///
/// One call is one logical fetch of a dataset descriptor: pagination,
/// retries, and authentication happen inside the implementation.
#[async_trait]
pub trait EventProvider: Send + Sync {
    /// Fetches every row of `descriptor.dataset` inside
    /// `descriptor.window` and `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the dataset cannot be fetched or decoded.
    async fn fetch(
        &self,
        descriptor: &DatasetDescriptor,
        scope: &FetchScope,
    ) -> Result<Vec<EventRow>, SourceError>;
}
