use std::collections::BTreeSet;

use crate::audit::AuditEntry;
use crate::point::Tags;

const CONTACT_KEYS: [&str; 7] = [
    "phone", "website", "email", "fax", "facebook", "twitter", "instagram",
];
const LIFECYCLE_KEYS: [&str; 5] = ["amenity", "shop", "tourism", "craft", "office"];
const LIFECYCLE_PREFIXES: [&str; 6] = [
    "proposed", "construction", "disused", "abandoned", "was", "removed",
];

/// Resolves the key a dataset value should land on, given what the OSM
/// object already uses. Contact keys fold into the `contact:` namespace in
/// both directions; lifecycle keys fold forward only, so a defunct object
/// never gets its primary tag back.
pub fn get_osm_key(k: &str, osm_tags: &Tags) -> String {
    if CONTACT_KEYS.contains(&k) && !osm_tags.contains_key(k) {
        let contact = format!("contact:{k}");
        if osm_tags.contains_key(&contact) {
            return contact;
        }
    } else if let Some(bare) = k.strip_prefix("contact:") {
        if !osm_tags.contains_key(k) && osm_tags.contains_key(bare) {
            return bare.to_string();
        }
    }

    if LIFECYCLE_KEYS.contains(&k) && !osm_tags.contains_key(k) {
        for prefix in LIFECYCLE_PREFIXES {
            let prefixed = format!("{prefix}:{k}");
            if osm_tags.contains_key(&prefixed) {
                return prefixed;
            }
        }
    }
    k.to_string()
}

/// Merges `source` into `tags` under the layered precedence policy:
/// audit keep, audit override, then the normal rule (set when absent,
/// or when different and the key is a master key, or when retagging).
/// An empty source value deletes the key. Returns whether anything changed.
pub fn update_tags(
    tags: &mut Tags,
    source: &Tags,
    master_tags: &BTreeSet<String>,
    retagging: bool,
    audit: &AuditEntry,
) -> bool {
    let mut changed = false;
    for (k, v) in source {
        let osm_key = get_osm_key(k, tags);

        if audit.keep.contains(k) || audit.keep.contains(&osm_key) {
            continue;
        }
        if audit.override_keys.contains(k) || audit.override_keys.contains(&osm_key) {
            if v.is_empty() {
                if tags.remove(&osm_key).is_some() {
                    changed = true;
                }
            } else if tags.get(&osm_key) != Some(v) {
                tags.insert(osm_key, v.clone());
                changed = true;
            }
            continue;
        }

        let existing = tags.get(&osm_key);
        if existing.is_none() || retagging || (existing != Some(v) && master_tags.contains(k)) {
            if !v.is_empty() {
                // addr:full is redundant next to a real housenumber
                if k == "addr:full" && tags.contains_key("addr:housenumber") {
                    continue;
                }
                tags.insert(osm_key, v.clone());
                changed = true;
            } else if tags.contains_key(&osm_key) {
                tags.remove(&osm_key);
                changed = true;
            }
        }
    }
    changed
}
