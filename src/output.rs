use std::collections::BTreeMap;

use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use serde_json::{json, Value};

use crate::conflator::MatchRow;
use crate::point::{Action, Members, OsmKind, OsmPoint};

pub const TITLE: &str = concat!("osm-conflate ", env!("CARGO_PKG_VERSION"));

fn open_element(p: &OsmPoint, id_override: Option<i64>) -> BytesStart<'static> {
    let mut el = BytesStart::new(p.kind.name());
    el.push_attribute(("id", id_override.unwrap_or(p.osm_id).to_string().as_str()));
    el.push_attribute(("version", p.version.to_string().as_str()));
    if p.kind == OsmKind::Node {
        el.push_attribute(("lat", p.lat.to_string().as_str()));
        el.push_attribute(("lon", p.lon.to_string().as_str()));
    }
    el
}

fn write_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    p: &OsmPoint,
    id_override: Option<i64>,
    action_attr: Option<Action>,
    with_center: bool,
) -> Result<()> {
    let mut el = open_element(p, id_override);
    if let Some(action) = action_attr {
        el.push_attribute(("action", action.name()));
    }
    writer.write_event(Event::Start(el))?;
    for (k, v) in &p.tags {
        let mut tag = BytesStart::new("tag");
        tag.push_attribute(("k", k.as_str()));
        tag.push_attribute(("v", v.as_str()));
        writer.write_event(Event::Empty(tag))?;
    }
    match &p.members {
        Some(Members::Nodes(nds)) => {
            for nd in nds {
                let mut el = BytesStart::new("nd");
                el.push_attribute(("ref", nd.to_string().as_str()));
                writer.write_event(Event::Empty(el))?;
            }
        }
        Some(Members::Relation(members)) => {
            for m in members {
                let mut el = BytesStart::new("member");
                el.push_attribute(("type", m.kind.name()));
                el.push_attribute(("ref", m.r#ref.to_string().as_str()));
                el.push_attribute(("role", m.role.as_str()));
                writer.write_event(Event::Empty(el))?;
            }
        }
        None => {}
    }
    if with_center && p.kind != OsmKind::Node {
        let mut center = BytesStart::new("center");
        center.push_attribute(("lat", p.lat.to_string().as_str()));
        center.push_attribute(("lon", p.lon.to_string().as_str()));
        writer.write_event(Event::Empty(center))?;
    }
    writer.write_event(Event::End(BytesEnd::new(p.kind.name())))?;
    Ok(())
}

fn finish(writer: Writer<Vec<u8>>) -> Result<String> {
    String::from_utf8(writer.into_inner()).context("produced XML is not valid utf-8")
}

fn start_document(root: &str) -> Result<Writer<Vec<u8>>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    let mut el = BytesStart::new(root.to_string());
    el.push_attribute(("version", "0.6"));
    el.push_attribute(("generator", TITLE));
    writer.write_event(Event::Start(el))?;
    Ok(writer)
}

/// The changeset to upload: either an osmChange document, or JOSM's
/// `<osm>` form with per-object action attributes and creations
/// renumbered from -1. Objects without an action are never emitted.
pub fn to_osc(matched: &[OsmPoint], source: &str, josm: bool) -> Result<String> {
    let mut writer = start_document(if josm { "osm" } else { "osmChange" })?;
    if josm {
        writer.write_event(Event::Start(BytesStart::new("changeset")))?;
        for (k, v) in [("source", source), ("created_by", TITLE), ("type", "import")] {
            let mut tag = BytesStart::new("tag");
            tag.push_attribute(("k", k));
            tag.push_attribute(("v", v));
            writer.write_event(Event::Empty(tag))?;
        }
        writer.write_event(Event::End(BytesEnd::new("changeset")))?;
    }
    let mut neg_id = -1i64;
    for p in matched {
        let Some(action) = p.action else { continue };
        if josm {
            if action == Action::Create {
                write_element(&mut writer, p, Some(neg_id), None, false)?;
                neg_id -= 1;
            } else {
                write_element(&mut writer, p, None, Some(action), false)?;
            }
        } else {
            writer.write_event(Event::Start(BytesStart::new(action.name())))?;
            write_element(&mut writer, p, None, None, false)?;
            writer.write_event(Event::End(BytesEnd::new(action.name())))?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new(if josm { "osm" } else { "osmChange" })))?;
    finish(writer)
}

/// A plain dump of the downloaded objects, so a later run can skip the
/// Overpass request. Ways and relations keep their derived center.
pub fn backup_osm(osmdata: &BTreeMap<String, OsmPoint>) -> Result<String> {
    let mut writer = start_document("osm")?;
    for p in osmdata.values() {
        write_element(&mut writer, p, None, None, true)?;
    }
    writer.write_event(Event::End(BytesEnd::new("osm")))?;
    finish(writer)
}

pub fn matches_csv(rows: &[MatchRow]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["id", "osm_type", "osm_id", "lat", "lon", "action"])?;
    for row in rows {
        writer.write_record([
            row.record.as_str(),
            row.kind.map(|k| k.name()).unwrap_or_default(),
            row.osm_id.map(|id| id.to_string()).unwrap_or_default().as_str(),
            row.lat.to_string().as_str(),
            row.lon.to_string().as_str(),
            row.action.map(|a| a.name()).unwrap_or_default(),
        ])?;
    }
    let buf = writer.into_inner().context("failed to flush the matches table")?;
    String::from_utf8(buf).context("produced CSV is not valid utf-8")
}

pub fn changes_geojson(changes: &[Value]) -> Result<String> {
    let fc = json!({"type": "FeatureCollection", "features": changes});
    Ok(serde_json::to_string_pretty(&fc)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::Tags;

    fn node(id: i64, action: Option<Action>) -> OsmPoint {
        let mut p = OsmPoint::new(
            OsmKind::Node,
            id,
            2,
            55.75,
            37.62,
            Tags::from([("amenity".to_string(), "cafe".to_string())]),
        );
        p.action = action;
        p
    }

    #[test]
    fn unmodified_objects_never_emitted() {
        let matched = vec![node(1, None), node(2, Some(Action::Modify))];
        let osc = to_osc(&matched, "Test", false).unwrap();
        assert!(!osc.contains("id=\"1\""));
        assert!(osc.contains("<modify>"));
        assert!(osc.contains("id=\"2\""));
    }

    #[test]
    fn osm_change_wraps_in_action_elements() {
        let matched = vec![
            node(-1, Some(Action::Create)),
            node(5, Some(Action::Delete)),
        ];
        let osc = to_osc(&matched, "Test", false).unwrap();
        assert!(osc.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
        assert!(osc.contains("<osmChange version=\"0.6\""));
        assert!(osc.contains("<create>"));
        assert!(osc.contains("<delete>"));
        assert!(osc.contains("<tag k=\"amenity\" v=\"cafe\"/>"));
    }

    #[test]
    fn josm_renumbers_creations_and_sets_actions() {
        let matched = vec![
            node(-5, Some(Action::Create)),
            node(-9, Some(Action::Create)),
            node(7, Some(Action::Modify)),
        ];
        let xml = to_osc(&matched, "Test", true).unwrap();
        assert!(xml.contains("<osm version=\"0.6\""));
        assert!(xml.contains("<tag k=\"created_by\""));
        assert!(xml.contains("<tag k=\"type\" v=\"import\"/>"));
        assert!(xml.contains("id=\"-1\""));
        assert!(xml.contains("id=\"-2\""));
        assert!(!xml.contains("id=\"-5\""));
        assert!(xml.contains("action=\"modify\""));
    }

    #[test]
    fn backup_adds_centers_to_areas() {
        let mut w = OsmPoint::new(OsmKind::Way, 3, 1, 10.0, 20.0, Tags::new());
        w.members = Some(Members::Nodes(vec![1, 2, 1]));
        let mut osmdata = BTreeMap::new();
        osmdata.insert(w.id.clone(), w);
        osmdata.insert("n1".to_string(), node(1, None));
        let xml = backup_osm(&osmdata).unwrap();
        assert!(xml.contains("<center lat=\"10\" lon=\"20\"/>"));
        assert!(xml.contains("<nd ref=\"1\"/>"));
        // nodes carry coordinates inline, no center
        assert!(xml.contains("lat=\"55.75\""));
    }

    #[test]
    fn matches_csv_rows() {
        let rows = vec![
            MatchRow {
                record: "a,1".to_string(),
                kind: Some(OsmKind::Node),
                osm_id: Some(15),
                lat: 55.75,
                lon: 37.62,
                action: Some(Action::Modify),
            },
            MatchRow {
                record: "b".to_string(),
                kind: None,
                osm_id: None,
                lat: 1.0,
                lon: 2.0,
                action: Some(Action::Create),
            },
        ];
        let csv = matches_csv(&rows).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("id,osm_type,osm_id,lat,lon,action"));
        assert_eq!(lines.next(), Some("\"a,1\",node,15,55.75,37.62,modify"));
        assert_eq!(lines.next(), Some("b,,,1,2,create"));
    }
}
