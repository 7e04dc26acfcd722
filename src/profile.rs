use std::collections::{BTreeMap, BTreeSet};
use std::fs::read_to_string;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::point::{OsmPoint, Tags};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("field missing in profile: {field} ({hint})")]
    MissingField {
        field: &'static str,
        hint: &'static str,
    },
    #[error("category {0:?} has neither \"tags\" nor \"query\"")]
    EmptyCategory(String),
    #[error("failed to parse profile: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read profile: {0}")]
    Io(#[from] std::io::Error),
}

/// How a single tag value is tested. The original spelling is kept in
/// `raw` so the Overpass query can be reconstructed from it.
#[derive(Clone, Debug)]
pub enum ValueMatch {
    Equals(String),
    /// `~`-prefixed: case-insensitive regular expression.
    Regex { raw: String, re: Regex },
    /// `!`-prefixed: case-insensitive substring.
    Substring(String),
}

impl ValueMatch {
    fn parse(raw: &str) -> Result<Self, regex::Error> {
        if let Some(pat) = raw.strip_prefix('~') {
            let re = RegexBuilder::new(pat).case_insensitive(true).build()?;
            Ok(Self::Regex { raw: pat.to_string(), re })
        } else if let Some(sub) = raw.strip_prefix('!') {
            Ok(Self::Substring(sub.to_lowercase()))
        } else {
            Ok(Self::Equals(raw.to_string()))
        }
    }

    /// The pattern text as it should appear in an Overpass filter.
    pub fn raw_text(&self) -> &str {
        match self {
            Self::Equals(v) => v,
            Self::Regex { raw, .. } => raw,
            Self::Substring(s) => s,
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Self::Equals(v) => v == value,
            Self::Regex { re, .. } => re.is_match(value),
            Self::Substring(sub) => value.to_lowercase().contains(sub),
        }
    }
}

/// One tag condition from a profile query: `["amenity"]` requires the key,
/// `["amenity", null]` requires its absence, and one or more values accept
/// any that matches.
#[derive(Clone, Debug)]
pub struct TagCondition {
    pub key: String,
    pub rule: CondRule,
}

#[derive(Clone, Debug)]
pub enum CondRule {
    Present,
    Absent,
    Any(Vec<ValueMatch>),
}

impl TagCondition {
    pub fn from_parts(parts: Vec<Option<String>>) -> Result<Self, String> {
        let mut it = parts.into_iter();
        let key = it
            .next()
            .flatten()
            .filter(|k| !k.is_empty())
            .ok_or("a tag condition needs a key")?;
        let values: Vec<Option<String>> = it.collect();
        let rule = if values.is_empty() {
            CondRule::Present
        } else if values.iter().all(|v| v.as_deref().is_none_or(str::is_empty)) {
            CondRule::Absent
        } else {
            let matchers = values
                .into_iter()
                .flatten()
                .map(|v| ValueMatch::parse(&v))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("bad pattern for {key:?}: {e}"))?;
            CondRule::Any(matchers)
        };
        Ok(TagCondition { key, rule })
    }

    pub fn matches(&self, tags: &Tags) -> bool {
        match &self.rule {
            CondRule::Present => tags.contains_key(&self.key),
            CondRule::Absent => !tags.contains_key(&self.key),
            CondRule::Any(matchers) => tags
                .get(&self.key)
                .is_some_and(|v| matchers.iter().any(|m| m.matches(v))),
        }
    }
}

impl<'de> Deserialize<'de> for TagCondition {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let parts: Vec<Option<String>> = Deserialize::deserialize(d)?;
        Self::from_parts(parts).map_err(D::Error::custom)
    }
}

pub fn clause_matches(conditions: &[TagCondition], tags: &Tags) -> bool {
    conditions.iter().all(|c| c.matches(tags))
}

/// The profile `query`: a raw Overpass fragment, a single AND clause, or
/// several alternative clauses.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum Query {
    Raw(String),
    Single(Vec<TagCondition>),
    Multi(Vec<QueryClause>),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum QueryClause {
    Raw(String),
    Tags(Vec<TagCondition>),
}

impl Query {
    pub fn clauses(&self) -> Vec<QueryClause> {
        match self {
            Self::Raw(s) => vec![QueryClause::Raw(s.clone())],
            Self::Single(conds) => vec![QueryClause::Tags(conds.clone())],
            Self::Multi(clauses) => clauses.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Category {
    pub query: Option<Vec<TagCondition>>,
    pub tags: Option<Tags>,
}

impl Category {
    pub fn matches(&self, tags: &Tags) -> bool {
        if let Some(q) = &self.query {
            return clause_matches(q, tags);
        }
        if let Some(required) = &self.tags {
            return required.iter().all(|(k, v)| tags.get(k) == Some(v));
        }
        false
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum BboxSetting {
    /// `true`: compute boxes from the dataset; `false`: query unbounded.
    Auto(bool),
    /// A fixed `[min_lat, min_lon, max_lat, max_lon]`.
    Fixed([f64; 4]),
}

impl Default for BboxSetting {
    fn default() -> Self {
        Self::Auto(true)
    }
}

/// Tag rewriting instructions for dataset records: a map of key to rule,
/// or the same rules as `key=rule|modifier` lines.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum TransformSpec {
    Script(String),
    Rules(BTreeMap<String, Value>),
}

/// Callback slots a deployment may fill in code. None are serialized.
#[derive(Default)]
pub struct Hooks {
    /// Per-entity weight: |w| > 3 is metres of offset, otherwise a
    /// multiplier against `max_distance`.
    pub weight: Option<Box<dyn Fn(&OsmPoint) -> f64>>,
    /// Extra match predicate: (entity tags, record tags) -> eligible.
    pub matches: Option<Box<dyn Fn(&Tags, &Tags) -> bool>>,
    /// Extract the dataset identifier from entity tags when the plain
    /// `ref:<dataset_id>` convention does not apply.
    pub find_ref: Option<Box<dyn Fn(&Tags) -> Option<String>>>,
    /// Overrides category classification entirely.
    pub qualifies: Option<Box<dyn Fn(&Tags) -> bool>>,
    /// Rewrites record tags in code; replaces the `transform` field.
    pub transform: Option<Box<dyn Fn(&mut Tags)>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("weight", &self.weight.is_some())
            .field("matches", &self.matches.is_some())
            .field("find_ref", &self.find_ref.is_some())
            .field("qualifies", &self.qualifies.is_some())
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

/// Per-deployment settings, usually loaded from a JSON file. Required
/// fields are checked up front so a bad profile fails before any fetch.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub source: Option<String>,
    pub dataset_id: Option<String>,
    pub no_dataset_id: bool,
    pub query: Option<Query>,
    pub categories: BTreeMap<String, Category>,
    pub category_tag: Option<String>,
    pub transform: Option<TransformSpec>,
    pub download_url: Option<String>,
    pub max_distance: f64,
    pub nearest_points: usize,
    pub max_request_boxes: usize,
    pub bbox_padding: f64,
    pub bbox: BboxSetting,
    pub overpass_timeout: Option<u64>,
    pub master_tags: BTreeSet<String>,
    pub delete_unmatched: bool,
    pub tag_unmatched: Option<Tags>,
    #[serde(rename = "override")]
    pub overrides: BTreeMap<String, String>,
    pub add_source: bool,
    pub bounded_update: bool,
    pub duplicate_distance: f64,
    #[serde(skip)]
    pub hooks: Hooks,
}

impl Default for Profile {
    fn default() -> Self {
        Profile {
            source: None,
            dataset_id: None,
            no_dataset_id: false,
            query: None,
            categories: BTreeMap::new(),
            category_tag: None,
            transform: None,
            download_url: None,
            max_distance: 100.0,
            nearest_points: 10,
            max_request_boxes: crate::bbox::DEFAULT_MAX_BOXES,
            bbox_padding: crate::bbox::DEFAULT_PADDING,
            bbox: BboxSetting::default(),
            overpass_timeout: Some(120),
            master_tags: BTreeSet::new(),
            delete_unmatched: false,
            tag_unmatched: None,
            overrides: BTreeMap::new(),
            add_source: false,
            bounded_update: false,
            duplicate_distance: 1.0,
            hooks: Hooks::default(),
        }
    }
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        Self::from_json(&read_to_string(path)?)
    }

    pub fn from_json(contents: &str) -> Result<Self, ProfileError> {
        let profile: Profile = serde_json::from_str(contents)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.source.is_none() {
            return Err(ProfileError::MissingField {
                field: "source",
                hint: "value of the \"source\" tag for uploaded OSM objects",
            });
        }
        if !self.no_dataset_id && self.dataset_id.is_none() {
            return Err(ProfileError::MissingField {
                field: "dataset_id",
                hint: "a fairly unique id of the dataset to query OSM",
            });
        }
        for (name, cat) in &self.categories {
            if cat.query.is_none() && cat.tags.is_none() {
                return Err(ProfileError::EmptyCategory(name.clone()));
            }
        }
        Ok(())
    }

    pub fn query(&self) -> Result<&Query, ProfileError> {
        self.query.as_ref().ok_or(ProfileError::MissingField {
            field: "query",
            hint: "a list of tag conditions, e.g. [[\"amenity\", \"cafe\"]]",
        })
    }

    /// The tag carrying the dataset identifier on OSM objects.
    pub fn ref_tag(&self) -> Option<String> {
        if self.no_dataset_id {
            return None;
        }
        self.dataset_id.as_ref().map(|id| format!("ref:{id}"))
    }

    /// Which configured categories an object's tags satisfy. `None` in the
    /// result stands for the default query. An empty result means the
    /// object does not belong in the matching pool at all.
    pub fn get_categories(&self, tags: &Tags) -> BTreeSet<Option<String>> {
        let mut result = BTreeSet::new();
        if let Some(qualifies) = &self.hooks.qualifies {
            if qualifies(tags) {
                result.insert(None);
            }
            return result;
        }

        if let Some(query) = &self.query {
            let matched = query.clauses().iter().any(|clause| match clause {
                // a raw Overpass fragment cannot be checked against tags;
                // trust the server-side filter
                QueryClause::Raw(_) => true,
                QueryClause::Tags(conds) => clause_matches(conds, tags),
            });
            if matched {
                result.insert(None);
            }
        }

        for (name, cat) in &self.categories {
            if cat.matches(tags) {
                result.insert(Some(name.clone()));
            }
        }
        result
    }
}
