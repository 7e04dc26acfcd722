use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use geo::Point;
use serde::{Deserialize, Serialize};

pub type Tags = BTreeMap<String, String>;

// equatorial radius, metres
const EARTH_RADIUS: f64 = 6_378_137.0;

/// Flat-earth distance in metres. Good enough at conflation radii, and
/// what every distance threshold in this crate is calibrated against.
pub fn flat_distance(a: Point, b: Point) -> f64 {
    let dx = (a.x() - b.x()).to_radians() * (0.5 * (a.y() + b.y()).to_radians()).cos();
    let dy = (a.y() - b.y()).to_radians();
    EARTH_RADIUS * (dx * dx + dy * dy).sqrt()
}

/// One record of the external dataset. Coordinates are WGS84 degrees,
/// tag keys are lower-cased and values trimmed on construction. An empty
/// tag value is kept: it marks the key for deletion during the merge.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourcePoint {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub dist_offset: f64,
    #[serde(default)]
    pub exclusive_group: Option<u32>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub remarks: Option<String>,
}

impl SourcePoint {
    pub fn new(id: impl Into<String>, lat: f64, lon: f64, tags: Tags) -> Self {
        let tags = tags
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v.trim().to_string()))
            .collect();
        SourcePoint {
            id: id.into(),
            lat,
            lon,
            tags,
            category: None,
            dist_offset: 0.0,
            exclusive_group: None,
            region: None,
            remarks: None,
        }
    }

    pub fn point(&self) -> Point {
        Point::new(self.lon, self.lat)
    }

    /// Distance in metres to `other`, reduced by this point's offset.
    pub fn distance(&self, other: Point) -> f64 {
        flat_distance(self.point(), other) - self.dist_offset
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OsmKind {
    Node,
    Way,
    Relation,
}

impl OsmKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Way => "way",
            Self::Relation => "relation",
        }
    }

    pub fn prefix(&self) -> char {
        match self {
            Self::Node => 'n',
            Self::Way => 'w',
            Self::Relation => 'r',
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "node" => Some(Self::Node),
            "way" => Some(Self::Way),
            "relation" => Some(Self::Relation),
            _ => None,
        }
    }
}

impl fmt::Display for OsmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Modify,
    Delete,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationMember {
    pub kind: OsmKind,
    pub r#ref: i64,
    pub role: String,
}

/// Way node refs or relation members. Nodes carry no members at all.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Members {
    Nodes(Vec<i64>),
    Relation(Vec<RelationMember>),
}

/// An existing OSM object, reduced to a point with a derived center.
/// The compound `id` ("n123"/"w45"/"r6") keys the entity set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OsmPoint {
    pub id: String,
    pub kind: OsmKind,
    pub osm_id: i64,
    pub version: u32,
    pub lat: f64,
    pub lon: f64,
    pub tags: Tags,
    pub dist_offset: f64,
    pub members: Option<Members>,
    pub action: Option<Action>,
    /// Configured query categories this object matched; `None` is the
    /// profile's default query.
    pub categories: BTreeSet<Option<String>>,
}

impl OsmPoint {
    pub fn new(kind: OsmKind, osm_id: i64, version: u32, lat: f64, lon: f64, tags: Tags) -> Self {
        // an empty value on an existing object carries no information
        let tags = tags.into_iter().filter(|(_, v)| !v.is_empty()).collect();
        OsmPoint {
            id: format!("{}{}", kind.prefix(), osm_id),
            kind,
            osm_id,
            version,
            lat,
            lon,
            tags,
            dist_offset: 0.0,
            members: None,
            action: None,
            categories: BTreeSet::new(),
        }
    }

    pub fn point(&self) -> Point {
        Point::new(self.lon, self.lat)
    }

    /// Distance in metres to `other`, reduced by this object's offset.
    /// A positive offset grows the object's effective capture radius.
    pub fn distance(&self, other: Point) -> f64 {
        flat_distance(self.point(), other) - self.dist_offset
    }

    pub fn is_area(&self) -> bool {
        self.kind != OsmKind::Node
    }

    /// Whether this object may take part in matching: a node, a closed
    /// way, or a multipolygon relation.
    pub fn is_poi(&self) -> bool {
        match (self.kind, &self.members) {
            (OsmKind::Node, _) => true,
            (OsmKind::Way, Some(Members::Nodes(nds))) => {
                nds.len() > 2 && nds.first() == nds.last()
            }
            (OsmKind::Relation, Some(Members::Relation(members))) => {
                !members.is_empty() && self.tags.get("type").is_some_and(|t| t == "multipolygon")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn way(nds: Vec<i64>) -> OsmPoint {
        let mut w = OsmPoint::new(OsmKind::Way, 1, 1, 0.0, 0.0, Tags::new());
        w.members = Some(Members::Nodes(nds));
        w
    }

    #[test]
    fn compound_id() {
        assert_eq!(OsmPoint::new(OsmKind::Node, 123, 1, 0.0, 0.0, Tags::new()).id, "n123");
        assert_eq!(OsmPoint::new(OsmKind::Relation, 7, 2, 0.0, 0.0, Tags::new()).id, "r7");
    }

    #[test]
    fn distance_roughly_one_degree() {
        // one degree of latitude is ~111 km
        let a = SourcePoint::new("a", 0.0, 0.0, Tags::new());
        let d = a.distance(Point::new(0.0, 1.0));
        assert!((d - 111_000.0).abs() < 1_000.0, "got {d}");
    }

    #[test]
    fn distance_offset_subtracted() {
        let mut p = OsmPoint::new(OsmKind::Node, 1, 1, 0.0, 0.0, Tags::new());
        let plain = p.distance(Point::new(0.001, 0.0));
        p.dist_offset = 30.0;
        assert!((p.distance(Point::new(0.001, 0.0)) - (plain - 30.0)).abs() < 1e-9);
    }

    #[test]
    fn poi_rules() {
        assert!(OsmPoint::new(OsmKind::Node, 1, 1, 0.0, 0.0, Tags::new()).is_poi());
        assert!(way(vec![1, 2, 3, 1]).is_poi());
        assert!(!way(vec![1, 2, 3]).is_poi(), "open way is not a poi");
        assert!(!way(vec![1, 1]).is_poi(), "degenerate ring");

        let mut r = OsmPoint::new(
            OsmKind::Relation,
            1,
            1,
            0.0,
            0.0,
            Tags::from([("type".to_string(), "multipolygon".to_string())]),
        );
        r.members = Some(Members::Relation(vec![RelationMember {
            kind: OsmKind::Way,
            r#ref: 2,
            role: "outer".to_string(),
        }]));
        assert!(r.is_poi());
        r.tags.insert("type".to_string(), "route".to_string());
        assert!(!r.is_poi());
    }

    #[test]
    fn empty_osm_tag_values_dropped() {
        let p = OsmPoint::new(
            OsmKind::Node,
            1,
            1,
            0.0,
            0.0,
            Tags::from([("name".to_string(), "".to_string())]),
        );
        assert!(p.tags.is_empty());
    }

    #[test]
    fn source_tags_normalized_but_empties_kept() {
        let p = SourcePoint::new(
            "1",
            0.0,
            0.0,
            Tags::from([
                ("Name".to_string(), " Cafe ".to_string()),
                ("old_key".to_string(), "".to_string()),
            ]),
        );
        assert_eq!(p.tags.get("name").map(String::as_str), Some("Cafe"));
        assert_eq!(p.tags.get("old_key").map(String::as_str), Some(""));
    }
}
