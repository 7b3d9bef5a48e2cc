//! Rank-based decile binning for choropleth coloring.
//!
//! Buckets come from rank, not value, so even a heavily skewed count
//! distribution spreads across all ten colors.

use std::collections::BTreeMap;

use crime_stats_analytics_models::RegionBucket;

/// Bins per-region counts into deciles.
///
/// Regions are ranked by ascending count, ties broken by ascending id. The
/// lowest `max(1, round(n / 10))` regions get decile 0, the highest as many
/// get decile 9, and the rest spread over deciles 1 to 8 by rank. A single
/// region gets decile 0. Output is in rank order.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn bin_regions(counts: &BTreeMap<String, u64>) -> Vec<RegionBucket> {
    let mut ranked: Vec<(&String, u64)> = counts.iter().map(|(id, c)| (id, *c)).collect();
    // BTreeMap iteration is already id-ascending; a stable sort keeps that
    // order within equal counts.
    ranked.sort_by_key(|(_, count)| *count);

    let n = ranked.len();
    if n == 0 {
        return vec![];
    }

    let tail = ((n as f64) * 0.1).round().max(1.0) as usize;
    let bottom = tail.min(n);
    let top = tail.min(n - bottom);
    let mid = n - bottom - top;

    ranked
        .into_iter()
        .enumerate()
        .map(|(rank, (id, count))| {
            let decile = if rank < bottom {
                0
            } else if rank >= n - top {
                9
            } else {
                let within = rank - bottom;
                (1 + (within * 8) / mid).clamp(1, 8) as u8
            };
            let percentile = if n > 1 {
                rank as f64 / (n - 1) as f64
            } else {
                0.0
            };
            RegionBucket {
                region_id: id.clone(),
                count,
                percentile,
                decile,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(values: &[u64]) -> BTreeMap<String, u64> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("r{i:03}"), *v))
            .collect()
    }

    fn deciles(buckets: &[RegionBucket]) -> Vec<u8> {
        buckets.iter().map(|b| b.decile).collect()
    }

    #[test]
    fn one_to_ten() {
        let buckets = bin_regions(&counts(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));
        assert_eq!(deciles(&buckets), vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(buckets[0].count, 1);
        assert_eq!(buckets[9].count, 10);
        assert!((buckets[0].percentile - 0.0).abs() < f64::EPSILON);
        assert!((buckets[9].percentile - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_and_single() {
        assert!(bin_regions(&BTreeMap::new()).is_empty());

        let single = bin_regions(&counts(&[42]));
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].decile, 0);
        assert!((single[0].percentile - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn two_regions_take_both_extremes() {
        assert_eq!(deciles(&bin_regions(&counts(&[5, 1]))), vec![0, 9]);
    }

    #[test]
    fn extreme_bucket_sizes_for_every_n() {
        for n in 2..=250_usize {
            let values: Vec<u64> = (0..n as u64).collect();
            let buckets = bin_regions(&counts(&values));
            #[allow(
                clippy::cast_precision_loss,
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss
            )]
            let expected = ((n as f64) * 0.1).round().max(1.0) as usize;

            assert_eq!(buckets.len(), n);
            assert_eq!(
                buckets.iter().filter(|b| b.decile == 0).count(),
                expected,
                "n={n}"
            );
            assert_eq!(
                buckets.iter().filter(|b| b.decile == 9).count(),
                expected,
                "n={n}"
            );
            assert!(buckets.iter().all(|b| b.decile <= 9));

            let mut previous = 0;
            for bucket in &buckets {
                assert!(bucket.decile >= previous, "deciles must follow rank, n={n}");
                previous = bucket.decile;
            }
        }
    }

    #[test]
    fn skewed_distribution_still_uses_middle_deciles() {
        let mut values = vec![0; 18];
        values.extend([1_000, 50_000]);
        let buckets = bin_regions(&counts(&values));
        let middle: Vec<u8> = deciles(&buckets)[2..18].to_vec();
        assert_eq!(middle.first(), Some(&1));
        assert_eq!(middle.last(), Some(&8));
    }

    #[test]
    fn ties_break_by_region_id() {
        let map: BTreeMap<String, u64> = [("b", 3), ("a", 3), ("c", 1)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let ids: Vec<String> = bin_regions(&map).into_iter().map(|b| b.region_id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
