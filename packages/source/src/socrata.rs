//! Socrata SODA API event provider.
//!
//! Pages through a dataset with `$limit`, `$offset`, `$order` and `$where`,
//! then maps each raw record through the dataset's field mapping.

use async_trait::async_trait;
use crime_stats_region_models::BoundingBox;
use crime_stats_source_models::{DatasetDescriptor, EventRow, FieldMapping, TimeWindow};

use crate::normalize::normalize_record;
use crate::parsing::format_socrata_date;
use crate::{EventProvider, FetchScope, SourceError, retry};

/// Environment variable holding an optional Socrata application token.
pub const APP_TOKEN_ENV: &str = "SOCRATA_APP_TOKEN";

/// Fetches [`EventRow`]s from Socrata datasets.
#[derive(Debug, Clone)]
pub struct SocrataProvider {
    client: reqwest::Client,
    app_token: Option<String>,
    max_records: Option<u64>,
}

impl SocrataProvider {
    /// Creates a provider with an optional application token.
    #[must_use]
    pub fn new(app_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            app_token,
            max_records: None,
        }
    }

    /// Creates a provider reading the token from [`APP_TOKEN_ENV`].
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(
            std::env::var(APP_TOKEN_ENV)
                .ok()
                .filter(|token| !token.trim().is_empty()),
        )
    }

    /// Caps the number of records fetched per dataset.
    #[must_use]
    pub const fn with_max_records(mut self, max_records: Option<u64>) -> Self {
        self.max_records = max_records;
        self
    }

    #[allow(clippy::future_not_send)]
    async fn fetch_page(
        &self,
        descriptor: &DatasetDescriptor,
        where_clause: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<serde_json::Value>, SourceError> {
        let body = retry::send_json(|| {
            let mut request = self.client.get(&descriptor.dataset.api_url).query(&[
                ("$limit", limit.to_string()),
                ("$offset", offset.to_string()),
                ("$order", ":id".to_string()),
                ("$where", where_clause.to_string()),
            ]);
            if let Some(token) = &self.app_token {
                request = request.header("X-App-Token", token);
            }
            request
        })
        .await?;

        match body {
            serde_json::Value::Array(records) => Ok(records),
            other => Err(SourceError::Upstream {
                message: format!(
                    "{}: expected a JSON array, got {}",
                    descriptor.dataset.id,
                    other.to_string().chars().take(200).collect::<String>()
                ),
            }),
        }
    }
}

impl Default for SocrataProvider {
    fn default() -> Self {
        Self::from_env()
    }
}

#[async_trait]
impl EventProvider for SocrataProvider {
    async fn fetch(
        &self,
        descriptor: &DatasetDescriptor,
        scope: &FetchScope,
    ) -> Result<Vec<EventRow>, SourceError> {
        let dataset = &descriptor.dataset;
        let where_clause = build_where(&dataset.fields, &descriptor.window, scope.bbox.as_ref());

        let mut rows = Vec::new();
        let mut offset: u64 = 0;
        let mut skipped: usize = 0;

        while let Some(page_limit) = next_page_limit(self.max_records, offset, dataset.page_size) {
            log::debug!("Fetching {}: offset={offset}, limit={page_limit}", dataset.id);
            let records = self
                .fetch_page(descriptor, &where_clause, offset, page_limit)
                .await?;

            let count = records.len() as u64;
            for record in &records {
                match normalize_record(record, &dataset.id, &dataset.fields) {
                    Some(row) => rows.push(row),
                    None => skipped += 1,
                }
            }
            offset += count;

            if count < page_limit {
                break;
            }
        }

        log::info!(
            "{}: fetched {} rows ({skipped} skipped) for [{}, {})",
            dataset.id,
            rows.len(),
            descriptor.window.start,
            descriptor.window.end
        );

        Ok(rows)
    }
}

/// Size of the page starting at `offset`, or `None` once `max_records` rows
/// have been requested.
const fn next_page_limit(max_records: Option<u64>, offset: u64, page_size: u64) -> Option<u64> {
    let remaining = match max_records {
        Some(max) => max.saturating_sub(offset),
        None => u64::MAX,
    };
    if remaining == 0 {
        None
    } else if remaining < page_size {
        Some(remaining)
    } else {
        Some(page_size)
    }
}

/// Builds the SoQL `$where` clause restricting a dataset to a window and,
/// optionally, a bounding box.
#[must_use]
pub fn build_where(fields: &FieldMapping, window: &TimeWindow, bbox: Option<&BoundingBox>) -> String {
    let column = &fields.occurred_at;
    let mut clauses = vec![
        format!("{column} >= '{}'", format_socrata_date(&window.start)),
        format!("{column} < '{}'", format_socrata_date(&window.end)),
    ];

    if let Some(bbox) = bbox {
        if let Some(point) = &fields.point {
            clauses.push(format!(
                "within_box({point}, {}, {}, {}, {})",
                bbox.north, bbox.west, bbox.south, bbox.east
            ));
        } else if let (Some(lat), Some(lon)) = (&fields.latitude, &fields.longitude) {
            clauses.push(format!(
                "{lat} >= {} AND {lat} <= {} AND {lon} >= {} AND {lon} <= {}",
                bbox.south, bbox.north, bbox.west, bbox.east
            ));
        } else {
            log::warn!("No location columns configured; bbox not pushed upstream");
        }
    }

    clauses.join(" AND ")
}
