use std::collections::BTreeSet;

use serde_json::{json, Map, Value};

use crate::geocoder::Geocoder;
use crate::merge::get_osm_key;
use crate::point::{Action, OsmPoint, SourcePoint};

/// How a change shows up on a review map.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Marker {
    Create,
    Delete,
    Update,
    Retag,
    Move,
}

impl Marker {
    pub fn color(&self) -> &'static str {
        match self {
            Self::Create => "#11dd11",
            Self::Delete => "#ee2211",
            Self::Update => "#0000ee",
            Self::Retag => "#660000",
            Self::Move => "#110055",
        }
    }
}

/// Builds the GeoJSON review feature for one applied change. Returns
/// `None` when the geocoder rejects the object's region, in which case
/// the change must not be emitted at all.
pub fn format_change(
    before: Option<&OsmPoint>,
    after: &OsmPoint,
    record: Option<&SourcePoint>,
    geocoder: &Geocoder,
) -> Option<Value> {
    let action = after.action?;
    let mut props = Map::new();
    props.insert("osm_type".into(), json!(after.kind.name()));
    props.insert("osm_id".into(), json!(after.osm_id));
    props.insert("action".into(), json!(action.name()));

    let marker = match action {
        Action::Create | Action::Delete => {
            for (k, v) in &after.tags {
                props.insert(format!("tags.{k}"), json!(v));
            }
            if let Some(record) = record {
                props.insert("ref_id".into(), json!(record.id));
            }
            if action == Action::Create {
                Marker::Create
            } else {
                Marker::Delete
            }
        }
        Action::Modify => {
            let before = before?;
            let mut marker = if record.is_some() {
                Marker::Update
            } else {
                Marker::Retag
            };
            if let Some(record) = record {
                props.insert("ref_id".into(), json!(record.id));
                let distance = record.distance(before.point());
                props.insert("ref_distance".into(), json!((10.0 * distance).round() / 10.0));
                props.insert("ref_coords".into(), json!([record.lon, record.lat]));
                if before.lon != after.lon || before.lat != after.lat {
                    props.insert("were_coords".into(), json!([before.lon, before.lat]));
                    marker = Marker::Move;
                }
                // record tags that lost to existing OSM values
                for (k, v) in &record.tags {
                    let osm_key = get_osm_key(k, &after.tags);
                    if after.tags.get(&osm_key) != Some(v) {
                        props.insert(format!("ref_unused_tags.{osm_key}"), json!(v));
                    }
                }
            }
            let keys: BTreeSet<&String> = after.tags.keys().chain(before.tags.keys()).collect();
            for k in keys {
                match (before.tags.get(k), after.tags.get(k)) {
                    (Some(v0), Some(v1)) if v0 == v1 => {
                        props.insert(format!("tags.{k}"), json!(v0));
                    }
                    (None, Some(v1)) => {
                        props.insert(format!("tags_new.{k}"), json!(v1));
                    }
                    (Some(v0), None) => {
                        props.insert(format!("tags_deleted.{k}"), json!(v0));
                    }
                    (Some(v0), Some(v1)) => {
                        props.insert(format!("tags_changed.{k}"), json!(format!("{v0} -> {v1}")));
                    }
                    (None, None) => {}
                }
            }
            marker
        }
    };
    props.insert("marker-color".into(), json!(marker.color()));

    if let Some(remarks) = record.and_then(|r| r.remarks.as_ref()) {
        props.insert("remarks".into(), json!(remarks));
    }
    match record.and_then(|r| r.region.as_ref()) {
        Some(region) => {
            props.insert("region".into(), json!(region));
        }
        None => {
            let (region, ok) = geocoder.locate(after.point(), None);
            if !ok {
                return None;
            }
            if let Some(region) = region {
                props.insert("region".into(), json!(region));
            }
        }
    }

    Some(json!({
        "type": "Feature",
        "geometry": {"type": "Point", "coordinates": [after.lon, after.lat]},
        "properties": Value::Object(props),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocoder::{RegionFilter, RegionResolver};
    use crate::point::{OsmKind, Tags};
    use geo::Point;

    fn node(tags: &[(&str, &str)]) -> OsmPoint {
        OsmPoint::new(
            OsmKind::Node,
            5,
            2,
            55.75,
            37.62,
            tags.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Tags>(),
        )
    }

    #[test]
    fn create_lists_all_tags() {
        let mut after = node(&[("amenity", "cafe"), ("name", "Drip")]);
        after.action = Some(Action::Create);
        let record = SourcePoint::new("r1", 55.75, 37.62, Tags::new());
        let change = format_change(None, &after, Some(&record), &Geocoder::default()).unwrap();
        let props = &change["properties"];
        assert_eq!(props["action"], "create");
        assert_eq!(props["marker-color"], "#11dd11");
        assert_eq!(props["tags.name"], "Drip");
        assert_eq!(props["ref_id"], "r1");
    }

    #[test]
    fn update_diffs_tags() {
        let before = node(&[("name", "Old"), ("amenity", "cafe"), ("fee", "yes")]);
        let mut after = node(&[("name", "New"), ("amenity", "cafe"), ("phone", "+7")]);
        after.action = Some(Action::Modify);
        let record = SourcePoint::new(
            "r1",
            55.7501,
            37.62,
            Tags::from([("name".into(), "New".into()), ("unused".into(), "x".into())]),
        );
        let change =
            format_change(Some(&before), &after, Some(&record), &Geocoder::default()).unwrap();
        let props = &change["properties"];
        assert_eq!(props["marker-color"], "#0000ee");
        assert_eq!(props["tags.amenity"], "cafe");
        assert_eq!(props["tags_changed.name"], "Old -> New");
        assert_eq!(props["tags_new.phone"], "+7");
        assert_eq!(props["tags_deleted.fee"], "yes");
        assert_eq!(props["ref_unused_tags.unused"], "x");
        assert!(props.get("ref_unused_tags.name").is_none());
        assert!(props["ref_distance"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn move_marker_and_were_coords() {
        let before = node(&[("amenity", "cafe")]);
        let mut after = node(&[("amenity", "cafe")]);
        after.lat = 55.7510;
        after.action = Some(Action::Modify);
        let record = SourcePoint::new("r1", 55.7510, 37.62, Tags::new());
        let change =
            format_change(Some(&before), &after, Some(&record), &Geocoder::default()).unwrap();
        let props = &change["properties"];
        assert_eq!(props["marker-color"], "#110055");
        assert_eq!(props["were_coords"][1], 55.75);
        assert_eq!(change["geometry"]["coordinates"][1], 55.7510);
    }

    #[test]
    fn retag_without_record() {
        let before = node(&[("amenity", "cafe")]);
        let mut after = node(&[("amenity", "cafe"), ("fixme", "check")]);
        after.action = Some(Action::Modify);
        let change = format_change(Some(&before), &after, None, &Geocoder::default()).unwrap();
        assert_eq!(change["properties"]["marker-color"], "#660000");
    }

    #[test]
    fn geocoder_vetoes_change() {
        struct Nowhere;
        impl RegionResolver for Nowhere {
            fn resolve(&self, _pt: Point, _current: Option<&str>) -> Option<String> {
                Some("ZZ".to_string())
            }
        }
        let mut after = node(&[("amenity", "cafe")]);
        after.action = Some(Action::Delete);
        let geocoder = Geocoder {
            resolver: Some(Box::new(Nowhere)),
            filter: Some(RegionFilter::parse("RU-MOW")),
        };
        assert!(format_change(None, &after, None, &geocoder).is_none());

        // the record's own region bypasses the geocoder
        let mut record = SourcePoint::new("r1", 55.75, 37.62, Tags::new());
        record.region = Some("RU-MOW".to_string());
        after.action = Some(Action::Create);
        let change = format_change(None, &after, Some(&record), &geocoder).unwrap();
        assert_eq!(change["properties"]["region"], "RU-MOW");
    }
}
