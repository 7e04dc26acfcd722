use std::collections::{BTreeMap, BTreeSet};
use std::fs::read_to_string;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Reviewer directives, keyed by dataset record id or compound OSM id.
pub type Audit = BTreeMap<String, AuditEntry>;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuditEntry {
    /// Drop the object from the output entirely, whatever happened to it.
    pub skip: bool,
    /// Create the record even when a spatial candidate exists.
    pub create: bool,
    /// Keys the merge must not touch this run.
    pub keep: BTreeSet<String>,
    /// Keys where the record's value wins regardless of master status.
    #[serde(rename = "override")]
    pub override_keys: BTreeSet<String>,
    pub fixme: Option<String>,
    pub r#move: Option<MoveDirective>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged, rename_all = "lowercase")]
pub enum MoveDirective {
    Keyword(MoveKeyword),
    /// Explicit target, `[lon, lat]`.
    Coords([f64; 2]),
}

#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveKeyword {
    /// Snap back to where the object was before this run.
    Osm,
    /// Snap to the dataset record's position.
    Dataset,
}

pub fn read_audit(path: &Path) -> Result<Audit> {
    let contents = read_to_string(path)
        .with_context(|| format!("failed to read audit file {}", path.display()))?;
    Ok(serde_json::from_str(&contents)?)
}
