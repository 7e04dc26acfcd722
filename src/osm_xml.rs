use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use quick_xml::events::BytesStart;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::point::{Members, OsmKind, OsmPoint, RelationMember, Tags};
use crate::profile::Profile;

#[derive(Default)]
struct RawElement {
    kind: Option<OsmKind>,
    id: i64,
    version: u32,
    lat: Option<f64>,
    lon: Option<f64>,
    center: Option<(f64, f64)>,
    tags: Tags,
    nds: Vec<i64>,
    members: Vec<RelationMember>,
}

fn attr(e: &BytesStart, name: &str) -> Result<Option<String>> {
    Ok(e.try_get_attribute(name)?
        .map(|a| a.unescape_value())
        .transpose()?
        .map(|v| v.into_owned()))
}

fn req_attr(e: &BytesStart, name: &str) -> Result<String> {
    attr(e, name)?.with_context(|| {
        format!(
            "missing attribute {name} on <{}>",
            String::from_utf8_lossy(e.name().as_ref())
        )
    })
}

fn parse_elements(xml: &str) -> Result<Vec<RawElement>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut elements = Vec::new();
    let mut current: Option<RawElement> = None;
    loop {
        let event = reader.read_event().context("malformed OSM XML")?;
        let (start, empty) = match &event {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::End(e) => {
                if matches!(e.name().as_ref(), b"node" | b"way" | b"relation") {
                    if let Some(el) = current.take() {
                        elements.push(el);
                    }
                }
                continue;
            }
            Event::Eof => break,
            _ => continue,
        };

        match start.name().as_ref() {
            name @ (b"node" | b"way" | b"relation") => {
                let kind = match name {
                    b"node" => OsmKind::Node,
                    b"way" => OsmKind::Way,
                    _ => OsmKind::Relation,
                };
                let mut el = RawElement {
                    kind: Some(kind),
                    id: req_attr(start, "id")?.parse()?,
                    version: req_attr(start, "version")?.parse()?,
                    ..Default::default()
                };
                if kind == OsmKind::Node {
                    el.lat = Some(req_attr(start, "lat")?.parse()?);
                    el.lon = Some(req_attr(start, "lon")?.parse()?);
                }
                if empty {
                    elements.push(el);
                } else {
                    current = Some(el);
                }
            }
            b"tag" => {
                if let Some(el) = current.as_mut() {
                    el.tags.insert(req_attr(start, "k")?, req_attr(start, "v")?);
                }
            }
            b"nd" => {
                if let Some(el) = current.as_mut() {
                    el.nds.push(req_attr(start, "ref")?.parse()?);
                }
            }
            b"member" => {
                if let Some(el) = current.as_mut() {
                    let kind_name = req_attr(start, "type")?;
                    let Some(kind) = OsmKind::from_name(&kind_name) else {
                        bail!("unknown member type {kind_name:?}");
                    };
                    el.members.push(RelationMember {
                        kind,
                        r#ref: req_attr(start, "ref")?.parse()?,
                        role: attr(start, "role")?.unwrap_or_default(),
                    });
                }
            }
            b"center" => {
                if let Some(el) = current.as_mut() {
                    el.center = Some((
                        req_attr(start, "lat")?.parse()?,
                        req_attr(start, "lon")?.parse()?,
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(elements)
}

fn average(coords: impl Iterator<Item = (f64, f64)>) -> Option<(f64, f64)> {
    let mut sum = (0.0, 0.0);
    let mut count = 0usize;
    for (lat, lon) in coords {
        sum.0 += lat;
        sum.1 += lon;
        count += 1;
    }
    (count > 0).then(|| (sum.0 / count as f64, sum.1 / count as f64))
}

/// Parses Overpass XML into the entity pool: every matching object is
/// reduced to a point (own coordinates, server-provided center, or the
/// average of resolvable members), filtered by the profile's queries and
/// down to nodes, closed ways and multipolygons.
pub fn parse_osm_xml(profile: &Profile, xml: &str) -> Result<BTreeMap<String, OsmPoint>> {
    let elements = parse_elements(xml)?;

    let mut nodes: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    for el in &elements {
        if el.kind == Some(OsmKind::Node) {
            if let (Some(lat), Some(lon)) = (el.lat, el.lon) {
                nodes.insert(el.id, (lat, lon));
            }
        }
    }
    let mut ways: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    for el in &elements {
        if el.kind != Some(OsmKind::Way) {
            continue;
        }
        let center = el.center.or_else(|| {
            debug!("way {} does not have a center", el.id);
            average(el.nds.iter().filter_map(|nd| nodes.get(nd).copied()))
        });
        match center {
            Some(c) => {
                ways.insert(el.id, c);
            }
            None => warn!("way {} has no resolvable nodes, skipping", el.id),
        }
    }

    let mut osmdata = BTreeMap::new();
    for el in elements {
        let Some(kind) = el.kind else { continue };
        let categories = profile.get_categories(&el.tags);
        if categories.is_empty() {
            continue;
        }
        let (coord, members) = match kind {
            OsmKind::Node => match (el.lat, el.lon) {
                (Some(lat), Some(lon)) => (Some((lat, lon)), None),
                _ => (None, None),
            },
            OsmKind::Way => (ways.get(&el.id).copied(), Some(Members::Nodes(el.nds))),
            OsmKind::Relation => {
                let coord = el.center.or_else(|| {
                    debug!("relation {} does not have a center", el.id);
                    average(el.members.iter().filter_map(|m| match m.kind {
                        OsmKind::Node => nodes.get(&m.r#ref).copied(),
                        OsmKind::Way => ways.get(&m.r#ref).copied(),
                        OsmKind::Relation => None,
                    }))
                });
                (coord, Some(Members::Relation(el.members)))
            }
        };
        let Some((lat, lon)) = coord else { continue };
        if lat == 0.0 && lon == 0.0 {
            continue;
        }
        let mut pt = OsmPoint::new(kind, el.id, el.version, lat, lon, el.tags);
        pt.members = members;
        pt.categories = categories;
        if !pt.is_poi() {
            continue;
        }
        if let Some(weight_fn) = &profile.hooks.weight {
            let weight = weight_fn(&pt);
            if weight != 0.0 {
                pt.dist_offset = if weight.abs() > 3.0 {
                    weight
                } else {
                    weight * profile.max_distance
                };
            }
        }
        osmdata.insert(pt.id.clone(), pt);
    }
    info!("parsed {} objects from OSM", osmdata.len());
    Ok(osmdata)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> Profile {
        Profile::from_json(
            r#"{"source": "s", "no_dataset_id": true,
                "query": [["amenity", "cafe"]]}"#,
        )
        .unwrap()
    }

    const XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6" generator="Overpass API">
  <node id="1" version="3" lat="55.75" lon="37.62">
    <tag k="amenity" v="cafe"/>
    <tag k="name" v="Drip"/>
  </node>
  <node id="2" version="1" lat="55.76" lon="37.63"/>
  <node id="3" version="1" lat="55.78" lon="37.65"/>
  <node id="4" version="2" lat="55.70" lon="37.60">
    <tag k="amenity" v="bench"/>
  </node>
  <way id="10" version="5">
    <nd ref="2"/>
    <nd ref="3"/>
    <nd ref="2"/>
    <nd ref="2"/>
    <tag k="amenity" v="cafe"/>
  </way>
  <way id="11" version="2">
    <center lat="55.8" lon="37.7"/>
    <nd ref="100"/>
    <nd ref="101"/>
    <nd ref="100"/>
    <nd ref="100"/>
    <tag k="amenity" v="cafe"/>
  </way>
  <relation id="20" version="1">
    <center lat="55.9" lon="37.9"/>
    <member type="way" ref="11" role="outer"/>
    <tag k="type" v="multipolygon"/>
    <tag k="amenity" v="cafe"/>
  </relation>
</osm>"#;

    #[test]
    fn parses_and_filters() {
        let osmdata = parse_osm_xml(&profile(), XML).unwrap();
        // the bench and the bare nodes do not match the query
        assert!(osmdata.contains_key("n1"));
        assert!(!osmdata.contains_key("n2"));
        assert!(!osmdata.contains_key("n4"));
        assert!(osmdata.contains_key("w10"));
        assert!(osmdata.contains_key("w11"));
        assert!(osmdata.contains_key("r20"));
        assert_eq!(osmdata["n1"].version, 3);
        assert_eq!(osmdata["n1"].tags.get("name").map(String::as_str), Some("Drip"));
    }

    #[test]
    fn way_center_averaged_from_nodes() {
        let osmdata = parse_osm_xml(&profile(), XML).unwrap();
        let w = &osmdata["w10"];
        // averages every nd ref, repeats included: (3*55.76 + 55.78) / 4
        assert!((w.lat - 55.765).abs() < 1e-6, "{}", w.lat);
        // server-side center wins when present
        assert_eq!((osmdata["w11"].lat, osmdata["w11"].lon), (55.8, 37.7));
    }

    #[test]
    fn open_way_is_not_a_poi() {
        let xml = r#"<osm>
            <node id="1" version="1" lat="1" lon="1"/>
            <node id="2" version="1" lat="2" lon="2"/>
            <way id="10" version="1">
                <nd ref="1"/><nd ref="2"/>
                <tag k="amenity" v="cafe"/>
            </way>
        </osm>"#;
        let osmdata = parse_osm_xml(&profile(), xml).unwrap();
        assert!(osmdata.is_empty());
    }

    #[test]
    fn null_island_rejected() {
        let xml = r#"<osm>
            <node id="1" version="1" lat="0" lon="0">
                <tag k="amenity" v="cafe"/>
            </node>
        </osm>"#;
        let osmdata = parse_osm_xml(&profile(), xml).unwrap();
        assert!(osmdata.is_empty());
    }

    #[test]
    fn weight_hook_sets_offset() {
        let mut p = profile();
        p.hooks.weight = Some(Box::new(|pt: &OsmPoint| {
            match pt.tags.get("name").map(String::as_str) {
                Some("Drip") => 50.0, // absolute metres
                _ => 0.5,             // fraction of max_distance
            }
        }));
        let osmdata = parse_osm_xml(&p, XML).unwrap();
        assert_eq!(osmdata["n1"].dist_offset, 50.0);
        assert_eq!(osmdata["w10"].dist_offset, 50.0); // 0.5 * 100
    }
}
