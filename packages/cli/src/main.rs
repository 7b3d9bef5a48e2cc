#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for region lookups, source routing, and aggregation.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use crime_stats_analytics::service::CrimeStatsService;
use crime_stats_analytics_models::{AggregationFilter, GeoScope};
use crime_stats_crime_models::LawClass;
use crime_stats_region_models::{BoundingBox, PointQuery};
use crime_stats_source::registry::CityRegistry;
use crime_stats_source::router::route;
use crime_stats_source_models::TimeWindow;

#[derive(Parser)]
#[command(name = "crime_stats", about = "Region-resolved incident statistics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered cities and their datasets
    Cities,
    /// Print the datasets a time window routes to
    Route {
        /// City id (e.g., "nyc")
        #[arg(long)]
        city: String,
        /// Window start, inclusive (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        from: DateTime<Utc>,
        /// Window end, exclusive (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        to: DateTime<Utc>,
    },
    /// Resolve a point to a region
    Lookup {
        /// City id
        #[arg(long)]
        city: String,
        /// Latitude (WGS84)
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        /// Longitude (WGS84)
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
    /// Resolve a JSON array of `{id?, lat, lon}` points read from a file
    BatchLookup {
        /// City id
        #[arg(long)]
        city: String,
        /// Path to the JSON points file
        #[arg(long)]
        input: std::path::PathBuf,
    },
    /// Aggregate incidents for a window and optional scope
    Aggregate {
        /// City id
        #[arg(long)]
        city: String,
        /// Window start, inclusive (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        from: DateTime<Utc>,
        /// Window end, exclusive (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        to: DateTime<Utc>,
        /// Bounding box as `west,south,east,north`
        #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true)]
        bbox: Option<BoundingBox>,
        /// Comma-separated categories to include
        #[arg(long)]
        categories: Option<String>,
        /// Comma-separated law classes to include (felony, misdemeanor, violation)
        #[arg(long)]
        law_classes: Option<String>,
        /// Whether unknown demographic values are admitted and reported
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        include_unknown: bool,
        /// Upper bound on the whole aggregation, in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Also print decile buckets for every region of the city
        #[arg(long)]
        bin: bool,
    },
}

fn parse_date(value: &str) -> Result<DateTime<Utc>, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|e| format!("invalid date {value:?}: {e}"))?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("invalid date {value:?}"))
}

fn parse_bbox(value: &str) -> Result<BoundingBox, String> {
    let parts = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid bbox {value:?}: {e}"))?;
    let [west, south, east, north] = parts.as_slice() else {
        return Err(format!("bbox needs 4 values, got {}", parts.len()));
    };
    Ok(BoundingBox::new(*west, *south, *east, *north))
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_law_classes(value: &str) -> Result<BTreeSet<LawClass>, String> {
    split_list(value)
        .map(|raw| {
            LawClass::from_raw(raw).ok_or_else(|| {
                let known: Vec<&str> = LawClass::all().iter().map(AsRef::as_ref).collect();
                format!("unknown law class {raw:?}, expected one of {}", known.join(", "))
            })
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init_custom_env("RUST_LOG");
    let cli = Cli::parse();

    match cli.command {
        Commands::Cities => {
            let registry = CityRegistry::builtin();
            println!("{:<8} {:<24} {:<8} DATASETS", "ID", "NAME", "CUTOVER");
            println!("{}", "-".repeat(70));
            for city in registry.cities() {
                let datasets: Vec<String> = city
                    .datasets
                    .iter()
                    .map(|d| format!("{} ({})", d.id, d.format))
                    .collect();
                println!(
                    "{:<8} {:<24} {:<8} {}",
                    city.id,
                    city.name,
                    city.cutover_year,
                    datasets.join(", ")
                );
            }
        }
        Commands::Route { city, from, to } => {
            let registry = CityRegistry::builtin();
            let config = registry.require(&city)?;
            let descriptors = route(config, &TimeWindow::new(from, to));
            println!("{}", serde_json::to_string_pretty(&descriptors)?);
        }
        Commands::Lookup { city, lat, lon } => {
            let service = CrimeStatsService::from_env()?;
            let found = service.lookup_point(&city, lat, lon);
            println!("{}", serde_json::to_string_pretty(&found)?);
        }
        Commands::BatchLookup { city, input } => {
            let service = CrimeStatsService::from_env()?;
            let points: Vec<PointQuery> = serde_json::from_str(&std::fs::read_to_string(input)?)?;
            let results = service.batch_lookup_points(&city, &points);
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::Aggregate {
            city,
            from,
            to,
            bbox,
            categories,
            law_classes,
            include_unknown,
            timeout_secs,
            bin,
        } => {
            let service = CrimeStatsService::from_env()?;

            let mut filter = AggregationFilter::new(&city, TimeWindow::new(from, to));
            filter.include_unknown = include_unknown;
            filter.scope = bbox.map(|bbox| GeoScope::Bbox { bbox });
            filter.categories = categories
                .as_deref()
                .map(|v| split_list(v).map(str::to_ascii_uppercase).collect());
            filter.law_classes = law_classes.as_deref().map(parse_law_classes).transpose()?;

            let timeout = timeout_secs.map_or(service.config().timeout, Duration::from_secs);
            log::info!("Aggregating {city} [{from}, {to}) with timeout {timeout:?}");
            let result = service.aggregate_with_timeout(&filter, timeout).await?;

            if bin {
                let buckets = service.region_buckets(&city, &result);
                let output = serde_json::json!({
                    "result": result.as_ref(),
                    "buckets": buckets,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("{}", serde_json::to_string_pretty(result.as_ref())?);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn law_classes_accept_codes_and_names() {
        assert_eq!(
            parse_law_classes("F, misdemeanor,").unwrap(),
            BTreeSet::from([LawClass::Felony, LawClass::Misdemeanor])
        );
    }

    #[test]
    fn unknown_law_class_lists_the_known_ones() {
        let err = parse_law_classes("felony,infraction").unwrap_err();
        assert!(err.contains("\"infraction\""));
        assert!(err.ends_with("FELONY, MISDEMEANOR, VIOLATION"));
    }

    #[test]
    fn bbox_needs_four_values() {
        assert!(parse_bbox("-74,40.7,-73.9").is_err());
        assert_eq!(
            parse_bbox("-74, 40.7, -73.9, 40.8").unwrap(),
            BoundingBox::new(-74.0, 40.7, -73.9, 40.8)
        );
    }
}
