//! Coarse H3 grid covering a region catalog.

use std::collections::{HashMap, HashSet, VecDeque};

use crime_stats_region::RegionCatalog;
use crime_stats_region_models::is_valid_coordinate;
use geo::{InteriorPoint, Intersects, LineString, Polygon};
use h3o::{CellIndex, LatLng, Resolution};

/// Upper bound on cells recorded for a single region.
pub const DEFAULT_MAX_CELLS_PER_REGION: usize = 250_000;

/// Mapping from H3 cell to region position in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridCellIndex {
    resolution: Resolution,
    cells: HashMap<CellIndex, usize>,
}

impl GridCellIndex {
    /// Covers every region of `catalog` with cells at `resolution`.
    ///
    /// A cell covers a region when its hexagon intersects any polygon of the
    /// region. Regions are processed in catalog order and later regions
    /// overwrite earlier ones on shared cells.
    #[must_use]
    pub fn build(catalog: &RegionCatalog, resolution: Resolution, max_cells_per_region: usize) -> Self {
        let mut cells = HashMap::new();

        for (position, region) in catalog.regions().iter().enumerate() {
            let mut covered: HashSet<CellIndex> = HashSet::new();
            for polygon in &region.geometry {
                if covered.len() >= max_cells_per_region {
                    break;
                }
                cover_polygon(polygon, resolution, max_cells_per_region, &mut covered);
            }

            if covered.len() >= max_cells_per_region {
                log::warn!(
                    "{}: region {} hit the {max_cells_per_region} cell cap; coverage is truncated",
                    catalog.city(),
                    region.id
                );
            }
            if covered.is_empty() {
                log::warn!("{}: region {} covers no cells", catalog.city(), region.id);
            }

            for cell in covered {
                cells.insert(cell, position);
            }
        }

        log::info!(
            "{}: indexed {} regions into {} cells at resolution {}",
            catalog.city(),
            catalog.len(),
            cells.len(),
            u8::from(resolution)
        );

        Self { resolution, cells }
    }

    /// Resolution the index was built at.
    #[must_use]
    pub const fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Number of mapped cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no cell is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Catalog position of the region owning the cell that contains the
    /// point. `None` for invalid coordinates or unmapped cells.
    #[must_use]
    pub fn lookup(&self, lat: f64, lon: f64) -> Option<usize> {
        if !is_valid_coordinate(lat, lon) {
            return None;
        }
        let cell = LatLng::new(lat, lon).ok()?.to_cell(self.resolution);
        self.cells.get(&cell).copied()
    }
}

/// Flood-fills from the cells under the polygon's vertices (and an interior
/// point), keeping every cell whose hexagon intersects the polygon.
fn cover_polygon(
    polygon: &Polygon<f64>,
    resolution: Resolution,
    max_cells: usize,
    covered: &mut HashSet<CellIndex>,
) {
    let interior = polygon.interior_point().map(|p| (p.x(), p.y()));
    let seeds = polygon
        .exterior()
        .coords()
        .map(|c| (c.x, c.y))
        .chain(interior)
        .filter_map(|(lon, lat)| LatLng::new(lat, lon).ok())
        .map(|ll| ll.to_cell(resolution));

    let mut visited: HashSet<CellIndex> = HashSet::new();
    let mut queue: VecDeque<CellIndex> = VecDeque::new();
    for seed in seeds {
        if visited.insert(seed) {
            queue.push_back(seed);
        }
    }

    while let Some(cell) = queue.pop_front() {
        if covered.len() >= max_cells {
            return;
        }
        if !cell_polygon(cell).intersects(polygon) {
            continue;
        }
        covered.insert(cell);

        let neighbors: Vec<CellIndex> = cell.grid_disk(1);
        for neighbor in neighbors {
            if visited.insert(neighbor) {
                queue.push_back(neighbor);
            }
        }
    }
}

fn cell_polygon(cell: CellIndex) -> Polygon<f64> {
    let ring: Vec<(f64, f64)> = cell
        .boundary()
        .iter()
        .map(|ll| (ll.lng(), ll.lat()))
        .collect();
    Polygon::new(LineString::from(ring), vec![])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crime_stats_region::Region;
    use geo::MultiPolygon;

    fn square(west: f64, south: f64, size: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![Polygon::new(
            LineString::from(vec![
                (west, south),
                (west + size, south),
                (west + size, south + size),
                (west, south + size),
                (west, south),
            ]),
            vec![],
        )])
    }

    fn catalog() -> RegionCatalog {
        RegionCatalog::new(
            "test",
            vec![
                Region::new("west", "West", "test", square(-74.02, 40.70, 0.02)).unwrap(),
                Region::new("east", "East", "test", square(-74.00, 40.70, 0.02)).unwrap(),
            ],
        )
    }

    fn res9() -> Resolution {
        Resolution::try_from(9u8).unwrap()
    }

    #[test]
    fn resolves_interior_points() {
        let index = GridCellIndex::build(&catalog(), res9(), DEFAULT_MAX_CELLS_PER_REGION);
        assert!(!index.is_empty());
        assert_eq!(index.lookup(40.71, -74.01), Some(0));
        assert_eq!(index.lookup(40.71, -73.99), Some(1));
        assert_eq!(index.lookup(40.80, -73.99), None);
    }

    #[test]
    fn invalid_points_resolve_to_nothing() {
        let index = GridCellIndex::build(&catalog(), res9(), DEFAULT_MAX_CELLS_PER_REGION);
        assert_eq!(index.lookup(f64::NAN, -74.01), None);
        assert_eq!(index.lookup(40.71, f64::INFINITY), None);
        assert_eq!(index.lookup(91.0, -74.01), None);
        assert_eq!(index.lookup(40.71, -181.0), None);
    }

    #[test]
    fn rebuild_is_identical() {
        let first = GridCellIndex::build(&catalog(), res9(), DEFAULT_MAX_CELLS_PER_REGION);
        let second = GridCellIndex::build(&catalog(), res9(), DEFAULT_MAX_CELLS_PER_REGION);
        assert_eq!(first, second);
    }

    #[test]
    fn shared_boundary_cells_go_to_the_later_region() {
        let index = GridCellIndex::build(&catalog(), res9(), DEFAULT_MAX_CELLS_PER_REGION);
        // A point exactly on the shared edge lies in a cell touching both
        // squares; the later region wins.
        assert_eq!(index.lookup(40.71, -74.00), Some(1));
    }

    #[test]
    fn tiny_region_still_gets_a_cell() {
        let tiny = RegionCatalog::new(
            "test",
            vec![Region::new("dot", "Dot", "test", square(-74.0, 40.7, 0.0001)).unwrap()],
        );
        let index = GridCellIndex::build(&tiny, res9(), DEFAULT_MAX_CELLS_PER_REGION);
        assert!(!index.is_empty());
        assert_eq!(index.lookup(40.70005, -73.99995), Some(0));
    }

    #[test]
    fn cell_cap_truncates_coverage() {
        let capped = GridCellIndex::build(&catalog(), res9(), 5);
        assert!(capped.len() <= 10);
    }

    #[test]
    fn every_probe_resolves_to_a_catalog_region_or_nothing() {
        let catalog = catalog();
        let index = GridCellIndex::build(&catalog, res9(), DEFAULT_MAX_CELLS_PER_REGION);
        for i in 0..50 {
            for j in 0..50 {
                let lat = 40.68 + f64::from(i) * 0.002;
                let lon = -74.04 + f64::from(j) * 0.002;
                if let Some(position) = index.lookup(lat, lon) {
                    assert!(catalog.region_at(position).is_some());
                }
            }
        }
    }
}
