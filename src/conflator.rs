use std::collections::{BTreeMap, BTreeSet};

use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use rstar::primitives::GeomWithData;
use rstar::RTree;
use serde_json::Value;

use crate::audit::{Audit, AuditEntry, MoveDirective, MoveKeyword};
use crate::changes::format_change;
use crate::geocoder::Geocoder;
use crate::merge::update_tags;
use crate::point::{flat_distance, Action, OsmKind, OsmPoint, SourcePoint, Tags};
use crate::profile::Profile;

type IndexedPoint = GeomWithData<[f64; 2], String>;

/// One row of the record-to-object correspondence table. Creations have
/// no kind or id yet.
#[derive(Clone, Debug)]
pub struct MatchRow {
    pub record: String,
    pub kind: Option<OsmKind>,
    pub osm_id: Option<i64>,
    pub lat: f64,
    pub lon: f64,
    pub action: Option<Action>,
}

/// Drives the conflation: owns both pools, consumes them pair by pair,
/// and accumulates the resulting objects, review features and match rows.
pub struct Conflator<'a> {
    profile: &'a Profile,
    pub dataset: BTreeMap<String, SourcePoint>,
    pub osmdata: BTreeMap<String, OsmPoint>,
    audit: Audit,
    pub geocoder: Geocoder,
    pub matched: Vec<OsmPoint>,
    pub changes: Vec<Value>,
    pub matches: Vec<MatchRow>,
    source: String,
    ref_tag: Option<String>,
}

impl<'a> Conflator<'a> {
    pub fn new(profile: &'a Profile, dataset: Vec<SourcePoint>, audit: Audit) -> Self {
        Conflator {
            dataset: dataset.into_iter().map(|p| (p.id.clone(), p)).collect(),
            osmdata: BTreeMap::new(),
            audit,
            geocoder: Geocoder::default(),
            matched: Vec::new(),
            changes: Vec::new(),
            matches: Vec::new(),
            source: profile.source.clone().unwrap_or_default(),
            ref_tag: profile.ref_tag(),
            profile,
        }
    }

    fn audit_entry(&self, record: Option<&SourcePoint>, object: Option<&OsmPoint>) -> AuditEntry {
        let key = record
            .map(|r| r.id.as_str())
            .or_else(|| object.map(|p| p.id.as_str()));
        key.and_then(|k| self.audit.get(k))
            .cloned()
            .unwrap_or_default()
    }

    /// Settles one record/object pair. With no object the record becomes a
    /// creation; with no record the object is deleted or retagged; with
    /// both, tags are merged and the node moved if needed. Both sides
    /// leave their pools either way.
    fn register_match(
        &mut self,
        dataset_key: Option<&str>,
        osmdata_key: Option<&str>,
        keep: bool,
        retag: Option<&Tags>,
    ) {
        let existing = osmdata_key.and_then(|k| self.osmdata.remove(k));
        let before = existing.clone();
        let sp = dataset_key.and_then(|k| self.dataset.remove(k));
        let audit = self.audit_entry(sp.as_ref(), existing.as_ref());
        if audit.skip {
            return;
        }

        let mut p = match (&sp, existing) {
            (Some(sp), None) => {
                let id = -1 - self.matched.len() as i64;
                let mut p = OsmPoint::new(OsmKind::Node, id, 1, sp.lat, sp.lon, sp.tags.clone());
                p.action = Some(Action::Create);
                p
            }
            (Some(sp), Some(mut p)) => {
                if update_tags(&mut p.tags, &sp.tags, &self.profile.master_tags, false, &audit) {
                    p.action = Some(Action::Modify);
                }
                // a node too far from its record is moved onto it
                if !p.is_area() && sp.distance(p.point()) > self.profile.max_distance {
                    p.lat = sp.lat;
                    p.lon = sp.lon;
                    p.action = Some(Action::Modify);
                }
                p
            }
            (None, Some(mut p)) => {
                if keep || p.is_area() {
                    if let Some(retag) = retag {
                        if update_tags(&mut p.tags, retag, &BTreeSet::new(), true, &audit) {
                            p.action = Some(Action::Modify);
                        }
                    }
                } else {
                    p.action = Some(Action::Delete);
                }
                p
            }
            (None, None) => return,
        };

        if let Some(sp) = &sp {
            if self.profile.add_source {
                match p.tags.get("source") {
                    Some(existing) if existing.contains(&self.source) => {}
                    Some(existing) => {
                        let joined = format!("{existing};{}", self.source);
                        p.tags.insert("source".to_string(), joined);
                    }
                    None => {
                        p.tags.insert("source".to_string(), self.source.clone());
                    }
                }
            }
            if let Some(ref_tag) = &self.ref_tag {
                p.tags.insert(ref_tag.clone(), sp.id.clone());
            }
            if let Some(fixme) = &audit.fixme {
                if p.tags.get("fixme") != Some(fixme) {
                    p.tags.insert("fixme".to_string(), fixme.clone());
                    if p.action.is_none() {
                        p.action = Some(Action::Modify);
                    }
                }
            }
            if let Some(directive) = &audit.r#move {
                if !p.is_area() {
                    match directive {
                        MoveDirective::Keyword(MoveKeyword::Osm) => {
                            if let Some(before) = &before {
                                p.lat = before.lat;
                                p.lon = before.lon;
                            }
                        }
                        MoveDirective::Keyword(MoveKeyword::Dataset) => {
                            p.lat = sp.lat;
                            p.lon = sp.lon;
                        }
                        MoveDirective::Coords([lon, lat]) => {
                            p.lat = *lat;
                            p.lon = *lon;
                        }
                    }
                    if p.action.is_none() {
                        if let Some(before) = &before {
                            if flat_distance(before.point(), p.point()) > 0.1 {
                                p.action = Some(Action::Modify);
                            }
                        }
                    }
                }
            }
            let created = p.action == Some(Action::Create);
            self.matches.push(MatchRow {
                record: sp.id.clone(),
                kind: (!created).then_some(p.kind),
                osm_id: (!created).then_some(p.osm_id),
                lat: p.lat,
                lon: p.lon,
                action: p.action,
            });
        }

        if p.action.is_some() {
            if let Some(change) = format_change(before.as_ref(), &p, sp.as_ref(), &self.geocoder) {
                self.matched.push(p);
                self.changes.push(change);
            }
        }
    }

    fn object_ref(&self, p: &OsmPoint) -> Option<String> {
        if let Some(ref_tag) = &self.ref_tag {
            if let Some(v) = p.tags.get(ref_tag) {
                return Some(v.clone());
            }
        }
        self.profile.hooks.find_ref.as_ref().and_then(|f| f(&p.tags))
    }

    /// The nearest matchable object for a record: the profile's hook and
    /// the record's category filter the k nearest, then the smallest
    /// offset-adjusted distance wins.
    fn nearest_eligible(
        &self,
        tree: &RTree<IndexedPoint>,
        record: &SourcePoint,
    ) -> Option<(String, f64)> {
        tree.nearest_neighbor_iter(&[record.lon, record.lat])
            .take(self.profile.nearest_points)
            .filter_map(|n| self.osmdata.get(&n.data))
            .filter(|p| match &self.profile.hooks.matches {
                Some(eligible) => eligible(&p.tags, &record.tags),
                None => true,
            })
            .filter(|p| p.categories.contains(&record.category))
            .map(|p| (p.id.clone(), p.distance(record.point())))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    fn remove_from_tree(&self, tree: &mut RTree<IndexedPoint>, key: &str) {
        // the object may already be gone from the pool; look it up first
        if let Some(p) = self.osmdata.get(key) {
            tree.remove(&IndexedPoint::new([p.lon, p.lat], key.to_string()));
        }
    }

    /// Greedy nearest-pair matching: always settle the shortest remaining
    /// record-object link, then re-route every link that pointed at the
    /// taken object.
    fn match_points(&mut self) {
        if self.osmdata.is_empty() {
            return;
        }
        let mut tree: RTree<IndexedPoint> = RTree::bulk_load(
            self.osmdata
                .values()
                .map(|p| IndexedPoint::new([p.lon, p.lat], p.id.clone()))
                .collect(),
        );
        let mut count_matched = 0usize;

        // manual overrides first: an explicit object id, or a name match
        // among the hundred nearest
        let overrides: Vec<(String, String)> = self
            .profile
            .overrides
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (record_id, osm_find) in overrides {
            let Some(record) = self.dataset.get(&record_id) else { continue };
            let mut found: Option<String> = None;
            let mut chars = osm_find.chars();
            if osm_find.len() > 2
                && matches!(chars.next(), Some('n' | 'w' | 'r'))
                && chars.next().is_some_and(|c| c.is_ascii_digit())
                && self.osmdata.contains_key(&osm_find)
            {
                found = Some(osm_find.clone());
            }
            for n in tree.nearest_neighbor_iter(&[record.lon, record.lat]).take(100) {
                let named = self
                    .osmdata
                    .get(&n.data)
                    .is_some_and(|p| p.tags.get("name") == Some(&osm_find));
                if named {
                    found = Some(n.data.clone());
                }
            }
            if let Some(found) = found {
                count_matched += 1;
                self.remove_from_tree(&mut tree, &found);
                self.register_match(Some(&record_id), Some(&found), false, None);
            }
        }

        // (distance, record id, object id), shortest first
        let mut dist: Vec<(f64, String, String)> = Vec::new();
        for (id, record) in &self.dataset {
            if let Some((osm_id, distance)) = self.nearest_eligible(&tree, record) {
                if distance <= self.profile.max_distance {
                    dist.push((distance, id.clone(), osm_id));
                }
            }
        }

        let bar = ProgressBar::new(dist.len() as u64).with_style(
            ProgressStyle::with_template("matching {pos}/{len} {wide_bar}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        let mut needs_sorting = true;
        while !dist.is_empty() {
            if needs_sorting {
                dist.sort_by(|a, b| a.0.total_cmp(&b.0));
                needs_sorting = false;
            }
            count_matched += 1;
            bar.inc(1);
            let (_, record_id, osm_id) = dist.remove(0);
            self.remove_from_tree(&mut tree, &osm_id);
            self.register_match(Some(&record_id), Some(&osm_id), false, None);
            for i in (0..dist.len()).rev() {
                if dist[i].2 != osm_id {
                    continue;
                }
                let next = self
                    .dataset
                    .get(&dist[i].1)
                    .and_then(|record| self.nearest_eligible(&tree, record))
                    .filter(|(_, d)| *d <= self.profile.max_distance);
                match next {
                    Some((nearest, distance)) => {
                        dist[i] = (distance, dist[i].1.clone(), nearest);
                        needs_sorting = i == 0 || distance < dist[0].0;
                    }
                    None => {
                        dist.remove(i);
                        needs_sorting = i == 0;
                    }
                }
            }
        }
        bar.finish_and_clear();
        info!("matched {count_matched} points");
    }

    /// Runs every phase: identifier links, audit-forced creations, the
    /// greedy spatial pass, duplicate pruning, creations, and the
    /// delete/retag sweep over leftover objects.
    pub fn conflate(&mut self) {
        if self.ref_tag.is_some() || self.profile.hooks.find_ref.is_some() {
            let mut count_ref = 0usize;
            let keys: Vec<String> = self.osmdata.keys().cloned().collect();
            for k in keys {
                let Some(p) = self.osmdata.get(&k) else { continue };
                if let Some(ref_id) = self.object_ref(p) {
                    if self.dataset.contains_key(&ref_id) {
                        count_ref += 1;
                        self.register_match(Some(&ref_id), Some(&k), false, None);
                    }
                }
            }
            info!(
                "updated {count_ref} OSM objects with {} tag",
                self.ref_tag.as_deref().unwrap_or("ref")
            );
        }

        let forced: Vec<String> = self
            .audit
            .iter()
            .filter(|(k, a)| a.create && self.dataset.contains_key(*k))
            .map(|(k, _)| k.clone())
            .collect();
        if !forced.is_empty() {
            info!("created {} audit-overridden dataset points", forced.len());
        }
        for k in forced {
            self.register_match(Some(&k), None, false, None);
        }

        let mut exclusive_groups: BTreeMap<u32, BTreeSet<String>> = BTreeMap::new();
        for (id, record) in &self.dataset {
            if let Some(group) = record.exclusive_group {
                exclusive_groups.entry(group).or_default().insert(id.clone());
            }
        }

        self.match_points();

        // of each exclusive group, keep the matched member, or the first
        // if none matched; the rest are dropped silently
        let mut count_duplicates = 0usize;
        for ids in exclusive_groups.values() {
            let mut found = ids.iter().any(|id| !self.dataset.contains_key(id));
            for id in ids {
                if self.dataset.contains_key(id) {
                    if found {
                        self.dataset.remove(id);
                        count_duplicates += 1;
                    } else {
                        found = true;
                    }
                }
            }
        }
        if count_duplicates > 0 {
            info!("removed {count_duplicates} unmatched duplicates");
        }

        info!("adding {} unmatched dataset points", self.dataset.len());
        let remaining: Vec<String> = self.dataset.keys().cloned().collect();
        for k in remaining {
            self.register_match(Some(&k), None, false, None);
        }

        if !self.osmdata.is_empty() {
            let mut count_deleted = 0usize;
            let mut count_retagged = 0usize;
            let retag = self.profile.tag_unmatched.clone();
            let keys: Vec<String> = self.osmdata.keys().cloned().collect();
            for k in keys {
                let Some(p) = self.osmdata.get(&k) else { continue };
                if self.object_ref(p).is_some() {
                    // it carries our id and nothing claims it: safe to drop
                    count_deleted += 1;
                    self.register_match(None, Some(&k), false, retag.as_ref());
                } else if self.profile.delete_unmatched || retag.is_some() {
                    if !self.profile.delete_unmatched || p.is_area() {
                        count_retagged += 1;
                    } else {
                        count_deleted += 1;
                    }
                    self.register_match(
                        None,
                        Some(&k),
                        !self.profile.delete_unmatched,
                        retag.as_ref(),
                    );
                }
            }
            info!("deleted {count_deleted} and retagged {count_retagged} unmatched objects");
        }
    }
}
