use std::collections::BTreeSet;
use std::fs::read_to_string;
use std::path::Path;

use anyhow::{bail, Context, Result};
use geo::Point;
use log::{info, warn};
use rstar::primitives::GeomWithData;
use rstar::RTree;

use crate::point::SourcePoint;

/// Maps a point to a region label. A record may already carry one, which
/// a resolver is free to trust.
pub trait RegionResolver {
    fn resolve(&self, pt: Point, current: Option<&str>) -> Option<String>;
}

type Place = GeomWithData<[f64; 2], String>;

/// Nearest-place table: every point gets the label of the closest entry.
pub struct PlaceTable {
    tree: RTree<Place>,
}

impl PlaceTable {
    /// Reads a tab-separated file of `lon<TAB>lat<TAB>region` rows.
    /// Lines starting with `#` are skipped.
    pub fn read(path: &Path) -> Result<Self> {
        let contents = read_to_string(path)
            .with_context(|| format!("failed to read places file {}", path.display()))?;
        let mut places = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(3, '\t');
            let (Some(lon), Some(lat), Some(region)) = (parts.next(), parts.next(), parts.next())
            else {
                bail!("places file line {}: expected lon, lat, region", lineno + 1);
            };
            let lon: f64 = lon
                .parse()
                .with_context(|| format!("places file line {}: bad longitude", lineno + 1))?;
            let lat: f64 = lat
                .parse()
                .with_context(|| format!("places file line {}: bad latitude", lineno + 1))?;
            places.push(Place::new([lon, lat], region.to_string()));
        }
        if places.is_empty() {
            bail!("places file {} has no entries", path.display());
        }
        info!("loaded {} places for geocoding", places.len());
        Ok(PlaceTable { tree: RTree::bulk_load(places) })
    }
}

impl RegionResolver for PlaceTable {
    fn resolve(&self, pt: Point, current: Option<&str>) -> Option<String> {
        if let Some(r) = current {
            return Some(r.to_string());
        }
        self.tree
            .nearest_neighbor(&[pt.x(), pt.y()])
            .map(|p| p.data.clone())
    }
}

/// A comma-separated list of regions to keep; a leading `-` or `^`
/// inverts it into a list to drop.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionFilter {
    negate: bool,
    regions: BTreeSet<String>,
}

impl RegionFilter {
    pub fn parse(list: &str) -> Self {
        let (negate, list) = match list.strip_prefix(['-', '^']) {
            Some(rest) => (true, rest),
            None => (false, list),
        };
        RegionFilter {
            negate,
            regions: list
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn allows(&self, region: Option<&str>) -> bool {
        let listed = region.is_some_and(|r| self.regions.contains(r));
        self.negate != listed
    }
}

/// Region annotation plus filtering. Both parts are optional: without a
/// resolver records keep whatever region they came with, without a filter
/// nothing is dropped.
#[derive(Default)]
pub struct Geocoder {
    pub resolver: Option<Box<dyn RegionResolver>>,
    pub filter: Option<RegionFilter>,
}

impl Geocoder {
    /// The region for a point, and whether the filter admits it.
    pub fn locate(&self, pt: Point, current: Option<&str>) -> (Option<String>, bool) {
        let region = match &self.resolver {
            Some(resolver) => resolver.resolve(pt, current),
            None => current.map(str::to_string),
        };
        let ok = self
            .filter
            .as_ref()
            .is_none_or(|f| f.allows(region.as_deref()));
        (region, ok)
    }
}

/// Annotates every dataset record with its region and drops the ones the
/// filter rejects.
pub fn add_regions(dataset: &mut Vec<SourcePoint>, geocoder: &Geocoder) {
    if geocoder.resolver.is_none() && geocoder.filter.is_none() {
        return;
    }
    let before = dataset.len();
    dataset.retain_mut(|record| {
        let (region, ok) = geocoder.locate(record.point(), record.region.as_deref());
        record.region = region;
        ok
    });
    if dataset.len() != before {
        warn!("filtered out {} dataset points by region", before - dataset.len());
    }
}
