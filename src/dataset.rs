use std::collections::{BTreeMap, BTreeSet};
use std::fs::read_to_string;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{error, info};
use rstar::primitives::GeomWithData;
use rstar::RTree;
use serde_json::Value;
use thiserror::Error;

use crate::point::{SourcePoint, Tags};
use crate::profile::{Profile, TransformSpec};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("{0} duplicate ids in the dataset, cannot continue")]
    DuplicateIds(usize),
}

/// Reads the dataset from a file, or downloads it from the profile's
/// `download_url` when no file is given. The payload is either a flat
/// JSON array of records or a GeoJSON FeatureCollection of points.
pub fn read_dataset(profile: &Profile, path: Option<&Path>) -> Result<Vec<SourcePoint>> {
    let contents = match path {
        Some(path) => read_to_string(path)
            .with_context(|| format!("failed to read dataset {}", path.display()))?,
        None => {
            let Some(url) = &profile.download_url else {
                bail!("no download_url in the profile, please provide a dataset file");
            };
            info!("downloading the dataset from {url}");
            let body = ureq::get(url)
                .call()
                .with_context(|| format!("could not download source data from {url}"))?
                .into_string()
                .context("could not read the downloaded dataset")?;
            if body.is_empty() {
                bail!("empty response from {url}");
            }
            body
        }
    };
    let json: Value = serde_json::from_str(&contents).context("failed to parse the dataset")?;
    let dataset = if json.get("features").is_some() {
        parse_geojson(&json)?
    } else {
        parse_array(&json)?
    };
    if dataset.is_empty() {
        bail!("the dataset is empty");
    }
    info!("read {} dataset points", dataset.len());
    Ok(dataset)
}

fn id_to_string(id: &Value) -> Option<String> {
    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_tag(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_array(json: &Value) -> Result<Vec<SourcePoint>> {
    let Some(items) = json.as_array() else {
        bail!("expected a JSON array or a GeoJSON FeatureCollection");
    };
    let mut dataset = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let id = item
            .get("id")
            .and_then(id_to_string)
            .with_context(|| format!("record {i} has no usable id"))?;
        let lat = item
            .get("lat")
            .and_then(Value::as_f64)
            .with_context(|| format!("record {id} has no latitude"))?;
        let lon = item
            .get("lon")
            .and_then(Value::as_f64)
            .with_context(|| format!("record {id} has no longitude"))?;
        let tags: Tags = item
            .get("tags")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| value_to_tag(v).map(|v| (k.clone(), v)))
                    .collect()
            })
            .unwrap_or_default();
        let mut point = SourcePoint::new(id, lat, lon, tags);
        if let Some(offset) = item.get("dist_offset").and_then(Value::as_f64) {
            point.dist_offset = offset;
        }
        if let Some(group) = item.get("exclusive_group").and_then(Value::as_u64) {
            point.exclusive_group = Some(group as u32);
        }
        if let Some(region) = item.get("region").and_then(Value::as_str) {
            point.region = Some(region.to_string());
        }
        dataset.push(point);
    }
    Ok(dataset)
}

fn parse_geojson(json: &Value) -> Result<Vec<SourcePoint>> {
    let features = json
        .get("features")
        .and_then(Value::as_array)
        .context("\"features\" is not an array")?;
    let mut dataset = Vec::new();
    for feature in features {
        let geometry = feature.get("geometry").unwrap_or(&Value::Null);
        if geometry.get("type").and_then(Value::as_str) != Some("Point") {
            continue;
        }
        let Some(props) = feature.get("properties").and_then(Value::as_object) else {
            continue;
        };
        // the identifier comes from "id", "ref", or the first "ref*" key
        let id = props
            .get("id")
            .or_else(|| props.get("ref"))
            .and_then(id_to_string)
            .or_else(|| {
                props
                    .iter()
                    .find(|(k, _)| k.starts_with("ref"))
                    .and_then(|(_, v)| id_to_string(v))
            });
        let Some(id) = id else { continue };
        let coords = geometry.get("coordinates").and_then(Value::as_array);
        let (Some(lon), Some(lat)) = (
            coords.and_then(|c| c.first()).and_then(Value::as_f64),
            coords.and_then(|c| c.get(1)).and_then(Value::as_f64),
        ) else {
            continue;
        };
        let tags: Tags = props
            .iter()
            .filter(|(k, _)| k.as_str() != "id")
            .filter_map(|(k, v)| value_to_tag(v).map(|v| (k.clone(), v)))
            .collect();
        dataset.push(SourcePoint::new(id, lat, lon, tags));
    }
    Ok(dataset)
}

enum TransformOp {
    /// Re-set the key's own value, so modifiers apply to it.
    Reuse,
    Literal(String),
    /// `.key`: copy the value of another tag.
    FromTag(String),
    /// `>key`: rename onto another key.
    RenameTo(String),
    /// `<key`: rename from another key.
    TakeFrom(String),
    /// `-`: drop the tag.
    Delete,
}

struct TransformRule {
    op: TransformOp,
    lower: bool,
}

fn parse_rule(raw: &str) -> TransformRule {
    let mut parts = raw.split('|').map(str::trim);
    let first = parts.next().unwrap_or_default();
    let op = if first.is_empty() {
        TransformOp::Reuse
    } else if let Some(k) = first.strip_prefix('.') {
        TransformOp::FromTag(k.to_string())
    } else if let Some(k) = first.strip_prefix('>') {
        TransformOp::RenameTo(k.to_string())
    } else if let Some(k) = first.strip_prefix('<') {
        TransformOp::TakeFrom(k.to_string())
    } else if first == "-" {
        TransformOp::Delete
    } else {
        TransformOp::Literal(first.to_string())
    };
    TransformRule { op, lower: parts.any(|m| m == "lower") }
}

fn compile_transform(spec: &TransformSpec) -> BTreeMap<String, TransformRule> {
    let mut rules = BTreeMap::new();
    match spec {
        TransformSpec::Script(text) => {
            for line in text.lines() {
                if let Some((key, rule)) = line.split_once('=') {
                    rules.insert(key.trim().to_string(), parse_rule(rule.trim()));
                }
            }
        }
        TransformSpec::Rules(map) => {
            for (key, value) in map {
                let rule = match value {
                    Value::String(s) => parse_rule(s),
                    // a non-string value is taken literally
                    Value::Number(n) => {
                        TransformRule { op: TransformOp::Literal(n.to_string()), lower: false }
                    }
                    Value::Bool(b) => {
                        TransformRule { op: TransformOp::Literal(b.to_string()), lower: false }
                    }
                    _ => continue,
                };
                rules.insert(key.clone(), rule);
            }
        }
    }
    rules
}

/// Rewrites record tags per the profile's `transform` field: rename keys
/// (`>new` / `<old`), copy values from other tags (`.key`), delete (`-`),
/// set literals, and pipe through the `lower` modifier. A transform hook
/// replaces the declarative rules entirely.
pub fn transform_dataset(profile: &Profile, dataset: &mut [SourcePoint]) {
    if let Some(transform) = &profile.hooks.transform {
        for record in dataset.iter_mut() {
            transform(&mut record.tags);
        }
        return;
    }
    let Some(spec) = &profile.transform else { return };
    let rules = compile_transform(spec);
    for record in dataset.iter_mut() {
        for (key, rule) in &rules {
            let value = match &rule.op {
                TransformOp::Reuse => record.tags.get(key).cloned(),
                TransformOp::Literal(v) => Some(v.clone()),
                TransformOp::FromTag(alt) => record.tags.get(alt).cloned(),
                TransformOp::RenameTo(new) => {
                    if let Some(v) = record.tags.remove(key) {
                        record.tags.insert(new.clone(), v);
                    }
                    None
                }
                TransformOp::TakeFrom(old) => {
                    if let Some(v) = record.tags.remove(old) {
                        record.tags.insert(key.clone(), v);
                    }
                    None
                }
                TransformOp::Delete => {
                    record.tags.remove(key);
                    None
                }
            };
            if let Some(mut value) = value {
                if rule.lower {
                    value = value.to_lowercase();
                }
                record.tags.insert(key.clone(), value);
            }
        }
    }
}

/// Moves the `category_tag` value off each record's tags into its category
/// slot, then applies the category's fixed tags. Records with a category
/// absent from the profile fall back to the "other" category if present.
pub fn add_categories(profile: &Profile, dataset: &mut [SourcePoint]) {
    if profile.categories.is_empty() {
        return;
    }
    let other = profile.categories.get("other");
    for record in dataset.iter_mut() {
        if let Some(tag) = &profile.category_tag {
            if let Some(value) = record.tags.remove(tag) {
                record.category = Some(value);
            }
        }
        let Some(category) = &record.category else { continue };
        let cat = profile.categories.get(category).or(other);
        if let Some(tags) = cat.and_then(|c| c.tags.as_ref()) {
            for (k, v) in tags {
                record.tags.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Flags duplicate ids (fatal) and near-duplicate points. Two records
/// within `max_distance` of each other whose varying tags mostly agree go
/// into a shared exclusive group, so at most one of them is matched.
pub fn check_for_duplicates(
    profile: &Profile,
    dataset: &mut [SourcePoint],
) -> Result<(), DatasetError> {
    let mut ids = BTreeSet::new();
    let mut duplicate_ids = 0usize;
    // tags whose value varies across the dataset are the discriminators
    let mut seen_tags: BTreeMap<String, Option<String>> = BTreeMap::new();
    for d in dataset.iter() {
        if !ids.insert(d.id.clone()) {
            duplicate_ids += 1;
            error!("duplicate id {} in the dataset", d.id);
        }
        for (k, v) in &d.tags {
            match seen_tags.get(k) {
                None => {
                    seen_tags.insert(k.clone(), Some(v.clone()));
                }
                Some(Some(prev)) if prev != v => {
                    seen_tags.insert(k.clone(), None);
                }
                _ => {}
            }
        }
    }
    let diff_tags: Vec<&String> = seen_tags
        .iter()
        .filter(|(_, v)| v.is_none())
        .map(|(k, _)| k)
        .collect();

    let tree: RTree<GeomWithData<[f64; 2], usize>> = RTree::bulk_load(
        dataset
            .iter()
            .enumerate()
            .map(|(i, d)| GeomWithData::new([d.lon, d.lat], i))
            .collect(),
    );
    let mut duplicates: BTreeSet<String> = BTreeSet::new();
    let mut groups: Vec<(usize, usize, u32)> = Vec::new();
    let mut group = 0u32;
    for (i, d) in dataset.iter().enumerate() {
        if duplicates.contains(&d.id) {
            continue;
        }
        group += 1;
        // the nearest hit is the record itself
        let second = tree
            .nearest_neighbor_iter(&[d.lon, d.lat])
            .nth(1)
            .map(|n| dataset[n.data].distance(d.point()));
        if !second.is_some_and(|dist| dist <= profile.max_distance) {
            continue;
        }
        for neighbor in tree.nearest_neighbor_iter(&[d.lon, d.lat]).take(20) {
            let alt = &dataset[neighbor.data];
            let dist = alt.distance(d.point());
            if alt.id == d.id || dist > profile.max_distance {
                continue;
            }
            let mut tags_differ = 0usize;
            if dist > profile.duplicate_distance {
                tags_differ = diff_tags
                    .iter()
                    .filter(|k| alt.tags.get(**k) != d.tags.get(**k))
                    .count();
            }
            if tags_differ <= diff_tags.len() / 3 {
                duplicates.insert(alt.id.clone());
                groups.push((i, neighbor.data, group));
                if duplicates.len() <= 5 {
                    let verdict = if tags_differ <= 1 {
                        "duplicate each other"
                    } else {
                        "are too similar"
                    };
                    error!("dataset points {} and {} {}", d.id, alt.id, verdict);
                }
            }
        }
    }
    for (i, j, group) in groups {
        dataset[i].exclusive_group = Some(group);
        dataset[j].exclusive_group = Some(group);
    }
    if !duplicates.is_empty() {
        error!("found {} duplicates in the dataset", duplicates.len());
    }
    if duplicate_ids > 0 {
        return Err(DatasetError::DuplicateIds(duplicate_ids));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(contents: &str) -> Vec<SourcePoint> {
        parse_any(&serde_json::from_str(contents).unwrap())
    }

    fn parse_any(json: &Value) -> Vec<SourcePoint> {
        if json.get("features").is_some() {
            parse_geojson(json).unwrap()
        } else {
            parse_array(json).unwrap()
        }
    }

    #[test]
    fn flat_array() {
        let data = parse(
            r#"[
                {"id": 1, "lat": 55.7, "lon": 37.6, "tags": {"Name": " Cafe "}},
                {"id": "a2", "lat": 55.8, "lon": 37.7, "dist_offset": 50,
                 "exclusive_group": 3}
            ]"#,
        );
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].id, "1");
        assert_eq!(data[0].tags.get("name").map(String::as_str), Some("Cafe"));
        assert_eq!(data[1].id, "a2");
        assert_eq!(data[1].dist_offset, 50.0);
        assert_eq!(data[1].exclusive_group, Some(3));
    }

    #[test]
    fn geojson_points_only() {
        let data = parse(
            r#"{"type": "FeatureCollection", "features": [
                {"geometry": {"type": "Point", "coordinates": [37.6, 55.7]},
                 "properties": {"ref": "101", "name": "One"}},
                {"geometry": {"type": "Point", "coordinates": [37.7, 55.8]},
                 "properties": {"ref_store": 102, "name": "Two"}},
                {"geometry": {"type": "LineString", "coordinates": []},
                 "properties": {"id": "skipped"}},
                {"geometry": {"type": "Point", "coordinates": [0, 0]},
                 "properties": {"name": "no id"}}
            ]}"#,
        );
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].id, "101");
        assert_eq!(data[1].id, "102");
        // "ref" stays in the tags, "id" would not
        assert!(data[0].tags.contains_key("ref"));
    }

    #[test]
    fn transform_rules() {
        let profile = Profile::from_json(
            r#"{"source": "s", "no_dataset_id": true,
                "transform": {
                    "phone": ">contact:phone",
                    "addr:city": "<city",
                    "name": "|lower",
                    "operator": "Acme",
                    "junk": "-",
                    "brand": ".name",
                    "level": 2
                }}"#,
        )
        .unwrap();
        let mut dataset = vec![SourcePoint::new(
            "1",
            0.0,
            0.0,
            Tags::from([
                ("phone".into(), "+7 495".into()),
                ("name".into(), "Drip Cafe".into()),
                ("city".into(), "Moscow".into()),
                ("junk".into(), "x".into()),
            ]),
        )];
        transform_dataset(&profile, &mut dataset);
        let tags = &dataset[0].tags;
        assert_eq!(tags.get("contact:phone").map(String::as_str), Some("+7 495"));
        assert!(!tags.contains_key("phone"));
        assert_eq!(tags.get("addr:city").map(String::as_str), Some("Moscow"));
        assert!(!tags.contains_key("city"));
        assert_eq!(tags.get("name").map(String::as_str), Some("drip cafe"));
        assert_eq!(tags.get("operator").map(String::as_str), Some("Acme"));
        assert!(!tags.contains_key("junk"));
        // "brand" runs before "name" in key order, so it copies the
        // original spelling
        assert_eq!(tags.get("brand").map(String::as_str), Some("Drip Cafe"));
        assert_eq!(tags.get("level").map(String::as_str), Some("2"));
    }

    #[test]
    fn transform_script_form() {
        let profile = Profile::from_json(
            r#"{"source": "s", "no_dataset_id": true,
                "transform": "amenity = cafe\nname=|lower"}"#,
        )
        .unwrap();
        let mut dataset = vec![SourcePoint::new(
            "1",
            0.0,
            0.0,
            Tags::from([("name".into(), "BIG".into())]),
        )];
        transform_dataset(&profile, &mut dataset);
        assert_eq!(dataset[0].tags.get("amenity").map(String::as_str), Some("cafe"));
        assert_eq!(dataset[0].tags.get("name").map(String::as_str), Some("big"));
    }

    #[test]
    fn transform_hook_replaces_rules() {
        let mut profile = Profile::from_json(
            r#"{"source": "s", "no_dataset_id": true,
                "transform": {"name": "-"}}"#,
        )
        .unwrap();
        profile.hooks.transform = Some(Box::new(|tags: &mut Tags| {
            tags.insert("checked".into(), "yes".into());
        }));
        let mut dataset = vec![SourcePoint::new(
            "1",
            0.0,
            0.0,
            Tags::from([("name".into(), "Kept".into())]),
        )];
        transform_dataset(&profile, &mut dataset);
        assert_eq!(dataset[0].tags.get("name").map(String::as_str), Some("Kept"));
        assert_eq!(dataset[0].tags.get("checked").map(String::as_str), Some("yes"));
    }

    #[test]
    fn categories_moved_off_tags() {
        let profile = Profile::from_json(
            r#"{"source": "s", "no_dataset_id": true,
                "category_tag": "kind",
                "categories": {
                    "fuel": {"tags": {"amenity": "fuel"}},
                    "other": {"tags": {"shop": "yes"}}
                }}"#,
        )
        .unwrap();
        let mut dataset = vec![
            SourcePoint::new("1", 0.0, 0.0, Tags::from([("kind".into(), "fuel".into())])),
            SourcePoint::new("2", 0.0, 0.0, Tags::from([("kind".into(), "unknown".into())])),
            SourcePoint::new("3", 0.0, 0.0, Tags::new()),
        ];
        add_categories(&profile, &mut dataset);
        assert_eq!(dataset[0].category.as_deref(), Some("fuel"));
        assert!(!dataset[0].tags.contains_key("kind"));
        assert_eq!(dataset[0].tags.get("amenity").map(String::as_str), Some("fuel"));
        // unknown category falls back to "other"
        assert_eq!(dataset[1].tags.get("shop").map(String::as_str), Some("yes"));
        assert_eq!(dataset[2].category, None);
    }

    #[test]
    fn duplicate_ids_are_fatal() {
        let profile =
            Profile::from_json(r#"{"source": "s", "no_dataset_id": true}"#).unwrap();
        let mut dataset = vec![
            SourcePoint::new("1", 0.0, 0.0, Tags::new()),
            SourcePoint::new("1", 10.0, 10.0, Tags::new()),
        ];
        let err = check_for_duplicates(&profile, &mut dataset).unwrap_err();
        assert!(matches!(err, DatasetError::DuplicateIds(1)));
    }

    #[test]
    fn near_duplicates_share_an_exclusive_group() {
        let profile =
            Profile::from_json(r#"{"source": "s", "no_dataset_id": true}"#).unwrap();
        let mut dataset = vec![
            SourcePoint::new("1", 55.0, 37.0, Tags::new()),
            SourcePoint::new("2", 55.00001, 37.00001, Tags::new()),
            SourcePoint::new("3", 56.0, 38.0, Tags::new()),
        ];
        check_for_duplicates(&profile, &mut dataset).unwrap();
        assert!(dataset[0].exclusive_group.is_some());
        assert_eq!(dataset[0].exclusive_group, dataset[1].exclusive_group);
        assert_eq!(dataset[2].exclusive_group, None);
    }

    #[test]
    fn distant_points_with_distinct_tags_left_alone() {
        let profile =
            Profile::from_json(r#"{"source": "s", "no_dataset_id": true}"#).unwrap();
        // ~40 m apart, and their varying tags disagree
        let mut dataset = vec![
            SourcePoint::new("1", 55.0, 37.0, Tags::from([
                ("name".into(), "One".into()),
                ("addr".into(), "A".into()),
                ("phone".into(), "1".into()),
            ])),
            SourcePoint::new("2", 55.00036, 37.0, Tags::from([
                ("name".into(), "Two".into()),
                ("addr".into(), "B".into()),
                ("phone".into(), "2".into()),
            ])),
        ];
        check_for_duplicates(&profile, &mut dataset).unwrap();
        assert_eq!(dataset[0].exclusive_group, None);
        assert_eq!(dataset[1].exclusive_group, None);
    }
}
