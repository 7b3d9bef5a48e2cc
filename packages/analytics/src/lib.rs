#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Region-resolved incident statistics.
//!
//! [`service::CrimeStatsService`] ties the pieces together: the
//! [`aggregator::Aggregator`] fans out to the routed datasets and folds
//! deduplicated rows into an
//! [`AggregationResult`](crime_stats_analytics_models::AggregationResult),
//! the [`binner`] turns per-region counts into choropleth deciles, and the
//! [`cache::ResultCache`] memoizes complete results for a short TTL.

pub mod aggregator;
pub mod binner;
pub mod cache;
pub mod config;
pub mod service;

use thiserror::Error;

/// Errors surfaced to callers of the analytics operations.
///
/// Upstream failures never appear here; they degrade the result to
/// `partial` instead.
#[derive(Debug, Clone, Error)]
pub enum AnalyticsError {
    /// The filter is malformed.
    #[error("Invalid filter: {message}")]
    InvalidFilter {
        /// What is wrong with the filter.
        message: String,
    },

    /// No city with the given id is registered.
    #[error("Unknown city: {city}")]
    UnknownCity {
        /// The requested city id.
        city: String,
    },

    /// A city's region index could not be built.
    #[error("Region index unavailable for {city}: {message}")]
    Index {
        /// City id.
        city: String,
        /// Underlying catalog or geometry failure.
        message: String,
    },

    /// The service configuration is unusable.
    #[error("Configuration error: {message}")]
    Config {
        /// What is wrong with the configuration.
        message: String,
    },
}

impl AnalyticsError {
    pub(crate) fn invalid_filter(message: impl Into<String>) -> Self {
        Self::InvalidFilter {
            message: message.into(),
        }
    }
}
