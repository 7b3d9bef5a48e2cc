//! City registry: loads all city definitions from embedded TOML configs.
//!
//! Each `.toml` file in `packages/source/cities/` is baked into the binary
//! at compile time via [`include_str!`]. Adding a city is as simple as
//! creating a new TOML file and adding it to the list below.

use crime_stats_source_models::CityConfig;

use crate::SourceError;

/// Number of registered cities. Enforced by a test.
#[cfg(test)]
const EXPECTED_CITY_COUNT: usize = 2;

/// TOML configs embedded at compile time.
const CITY_TOMLS: &[(&str, &str)] = &[
    ("nyc", include_str!("../cities/nyc.toml")),
    ("sf", include_str!("../cities/sf.toml")),
];

/// Parses a [`CityConfig`] from a TOML string.
///
/// # Errors
///
/// Returns an error if the TOML is malformed or missing required fields.
pub fn parse_city_toml(toml_str: &str) -> Result<CityConfig, String> {
    toml::de::from_str(toml_str).map_err(|e| e.to_string())
}

/// Returns all registered cities.
///
/// # Panics
///
/// Panics if any embedded TOML file fails to parse. Since these are
/// compile-time constants, parse failures indicate a development error
/// and are caught by the tests below.
#[must_use]
pub fn all_cities() -> Vec<CityConfig> {
    CITY_TOMLS
        .iter()
        .map(|(name, toml_str)| {
            parse_city_toml(toml_str)
                .unwrap_or_else(|e| panic!("Failed to parse city definition '{name}': {e}"))
        })
        .collect()
}

/// Lookup table of city definitions.
#[derive(Debug, Clone)]
pub struct CityRegistry {
    cities: Vec<CityConfig>,
}

impl CityRegistry {
    /// Creates a registry from explicit definitions.
    #[must_use]
    pub const fn new(cities: Vec<CityConfig>) -> Self {
        Self { cities }
    }

    /// Creates a registry from the embedded city definitions.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new(all_cities())
    }

    /// Returns the city with the given id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&CityConfig> {
        self.cities.iter().find(|c| c.id.eq_ignore_ascii_case(id))
    }

    /// Returns the city with the given id, or [`SourceError::UnknownCity`].
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::UnknownCity`] if no such city is registered.
    pub fn require(&self, id: &str) -> Result<&CityConfig, SourceError> {
        self.get(id).ok_or_else(|| SourceError::UnknownCity {
            city: id.to_string(),
        })
    }

    /// Returns all cities in registration order.
    #[must_use]
    pub fn cities(&self) -> &[CityConfig] {
        &self.cities
    }
}

impl Default for CityRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
