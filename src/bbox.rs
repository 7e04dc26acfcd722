use std::fmt;

use geo::Point;
use itertools::Itertools;
use log::debug;

/// Degrees, roughly 330 m at the equator.
pub const DEFAULT_PADDING: f64 = 0.003;
pub const DEFAULT_MAX_BOXES: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Bbox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl Bbox {
    pub fn contains(&self, p: Point) -> bool {
        p.y() >= self.min_lat && p.y() <= self.max_lat && p.x() >= self.min_lon && p.x() <= self.max_lon
    }
}

impl fmt::Display for Bbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.min_lat, self.min_lon, self.max_lat, self.max_lon)
    }
}

/// One point in an axis-sorted list: its coordinate on the sort axis, its
/// coordinate on the other axis, and the running extent of the other axis
/// over everything before/after it (used to estimate area freed by a split).
#[derive(Copy, Clone, Debug)]
struct Entry {
    coord: f64,
    alt: f64,
    fwd: f64,
    back: f64,
}

struct WorkBox {
    lats: Vec<Entry>,
    lons: Vec<Entry>,
}

#[derive(Copy, Clone, PartialEq)]
enum Axis {
    Lat,
    Lon,
}

impl WorkBox {
    fn axis(&self, axis: Axis) -> &[Entry] {
        match axis {
            Axis::Lat => &self.lats,
            Axis::Lon => &self.lons,
        }
    }

    fn axis_mut(&mut self, axis: Axis) -> &mut Vec<Entry> {
        match axis {
            Axis::Lat => &mut self.lats,
            Axis::Lon => &mut self.lons,
        }
    }

    fn extent(&self, axis: Axis) -> f64 {
        let ar = self.axis(axis);
        match (ar.first(), ar.last()) {
            (Some(a), Some(b)) => b.coord - a.coord,
            _ => 0.0,
        }
    }

    fn bbox(&self, pad: f64) -> Bbox {
        Bbox {
            min_lat: self.lats[0].coord - pad,
            min_lon: self.lons[0].coord - pad,
            max_lat: self.lats[self.lats.len() - 1].coord + pad,
            max_lon: self.lons[self.lons.len() - 1].coord + pad,
        }
    }
}

/// For each list position, the extent of the other axis over all points up
/// to (fwd) and from (back) that position.
fn update_side_dimensions(ar: &mut [Entry]) {
    let n = ar.len();
    let mut fwd_top = ar[0].alt;
    let mut fwd_bottom = ar[0].alt;
    let mut back_top = ar[n - 1].alt;
    let mut back_bottom = ar[n - 1].alt;
    for i in 0..n {
        fwd_top = fwd_top.max(ar[i].alt);
        fwd_bottom = fwd_bottom.min(ar[i].alt);
        ar[i].fwd = fwd_top - fwd_bottom;
        back_top = back_top.max(ar[n - 1 - i].alt);
        back_bottom = back_bottom.min(ar[n - 1 - i].alt);
        ar[n - 1 - i].back = back_top - back_bottom;
    }
}

/// The gap between adjacent points whose removal frees the most area:
/// the empty column itself plus both sides shrinking on the other axis.
fn find_max_gap(ar: &[Entry], h: f64) -> Option<(usize, f64)> {
    let mut best = None;
    let mut max_gap = 0.0;
    for i in 0..ar.len() - 1 {
        let extra_left = (ar[i].coord - ar[0].coord) * (h - ar[i].fwd);
        let extra_right = (ar[ar.len() - 1].coord - ar[i + 1].coord) * (h - ar[i + 1].back);
        let gap = (ar[i + 1].coord - ar[i].coord) * h + extra_left + extra_right;
        if gap > max_gap {
            best = Some(i);
            max_gap = gap;
        }
    }
    best.map(|i| (i, max_gap))
}

fn ge_pair(a: (f64, f64), b: (f64, f64)) -> bool {
    a.0 > b.0 || (a.0 == b.0 && a.1 >= b.1)
}

/// Splits `b` at the gap after `gap` on `axis`; points strictly after the
/// gap move to the returned box. The other axis is re-partitioned by
/// comparing against the first moved point.
fn split(b: &mut WorkBox, axis: Axis, gap: usize) -> WorkBox {
    let moved: Vec<Entry> = b.axis_mut(axis).split_off(gap + 1);
    let threshold = (moved[0].coord, moved[0].alt);

    let alt_axis = match axis {
        Axis::Lat => Axis::Lon,
        Axis::Lon => Axis::Lat,
    };
    let (new_alt, old_alt): (Vec<Entry>, Vec<Entry>) = b
        .axis(alt_axis)
        .iter()
        .copied()
        .partition(|p| ge_pair((p.alt, p.coord), threshold));
    *b.axis_mut(alt_axis) = old_alt;

    let mut new_box = WorkBox { lats: Vec::new(), lons: Vec::new() };
    *new_box.axis_mut(axis) = moved;
    *new_box.axis_mut(alt_axis) = new_alt;
    new_box
}

/// One padded box around everything.
pub fn bbox_of(points: &[Point], padding: f64) -> Bbox {
    let mut bbox = Bbox {
        min_lat: 90.0,
        min_lon: 180.0,
        max_lat: -90.0,
        max_lon: -180.0,
    };
    for p in points {
        bbox.min_lat = bbox.min_lat.min(p.y() - padding);
        bbox.min_lon = bbox.min_lon.min(p.x() - padding);
        bbox.max_lat = bbox.max_lat.max(p.y() + padding);
        bbox.max_lon = bbox.max_lon.max(p.x() + padding);
    }
    bbox
}

/// Covers the points with up to `max_boxes` padded boxes of small total
/// area, so a bulk query does not sweep the empty space between clusters.
/// Greedily performs the split that frees the most area, and stops when a
/// split would gain less than 1% of the starting area.
pub fn split_into_bboxes(points: &[Point], max_boxes: usize, padding: f64) -> Vec<Bbox> {
    if max_boxes <= 1 || points.len() <= 1 {
        return vec![bbox_of(points, padding)];
    }

    let lats: Vec<Entry> = points
        .iter()
        .map(|p| (p.y(), p.x()))
        .sorted_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(coord, alt)| Entry { coord, alt, fwd: 0.0, back: 0.0 })
        .collect();
    let lons: Vec<Entry> = points
        .iter()
        .map(|p| (p.x(), p.y()))
        .sorted_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(coord, alt)| Entry { coord, alt, fwd: 0.0, back: 0.0 })
        .collect();

    let mut boxes = vec![WorkBox { lats, lons }];
    let initial_area = boxes[0].extent(Axis::Lat) * boxes[0].extent(Axis::Lon);

    while boxes.len() < max_boxes && boxes.len() <= points.len() {
        let mut candidate: Option<(usize, Axis, usize)> = None;
        let mut best_area = 0.0;
        for (bi, b) in boxes.iter_mut().enumerate() {
            for axis in [Axis::Lat, Axis::Lon] {
                let h = b.extent(match axis {
                    Axis::Lat => Axis::Lon,
                    Axis::Lon => Axis::Lat,
                });
                update_side_dimensions(b.axis_mut(axis));
                if let Some((gap, area)) = find_max_gap(b.axis(axis), h) {
                    if area > best_area {
                        best_area = area;
                        candidate = Some((bi, axis, gap));
                    }
                }
            }
        }
        let Some((bi, axis, gap)) = candidate else { break };
        if best_area * 100.0 < initial_area {
            // not worth another request
            break;
        }
        debug!(
            "splitting bbox {} at {} {}..{}",
            boxes[bi].bbox(0.0),
            if axis == Axis::Lon { "lons" } else { "lats" },
            boxes[bi].axis(axis)[gap].coord,
            boxes[bi].axis(axis)[gap + 1].coord,
        );
        let new_box = split(&mut boxes[bi], axis, gap);
        boxes.push(new_box);
    }

    boxes.iter().map(|b| b.bbox(padding)).collect()
}
