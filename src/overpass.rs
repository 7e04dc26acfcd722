use log::{debug, error, warn};
use regex::Regex;
use thiserror::Error;

use crate::bbox::{split_into_bboxes, Bbox};
use crate::point::SourcePoint;
use crate::profile::{BboxSetting, CondRule, Profile, ProfileError, QueryClause, ValueMatch};

pub const OVERPASS_SERVER: &str = "https://overpass-api.de/api/";
pub const ALT_OVERPASS_SERVER: &str = "https://overpass.kumi.systems/api/";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error("failed to download data from Overpass API: status {0}")]
    Status(u16),
    #[error("rate limited by the Overpass API; server status:\n{0}")]
    RateLimited(String),
    #[error("Overpass API runtime error: {0}")]
    Runtime(String),
    #[error("request failed: {0}")]
    Transport(#[from] Box<ureq::Error>),
    #[error("failed to read the response: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Overpass {
    server: String,
}

impl Default for Overpass {
    fn default() -> Self {
        Overpass { server: OVERPASS_SERVER.to_string() }
    }
}

impl Overpass {
    /// `alt` selects the well-known mirror, anything else is a base URL.
    pub fn set_server(&mut self, server: &str) {
        self.server = if server == "alt" {
            ALT_OVERPASS_SERVER.to_string()
        } else {
            server.to_string()
        };
    }

    /// Which boxes to query: the dataset split, a fixed box from the
    /// profile, or one unbounded query.
    pub fn calc_boxes(profile: &Profile, dataset: &[SourcePoint]) -> Vec<Option<Bbox>> {
        match profile.bbox {
            BboxSetting::Auto(false) => vec![None],
            BboxSetting::Fixed([min_lat, min_lon, max_lat, max_lon]) => {
                vec![Some(Bbox { min_lat, min_lon, max_lat, max_lon })]
            }
            BboxSetting::Auto(true) => {
                let points: Vec<_> = dataset.iter().map(SourcePoint::point).collect();
                split_into_bboxes(&points, profile.max_request_boxes, profile.bbox_padding)
                    .into_iter()
                    .map(Some)
                    .collect()
            }
        }
    }

    pub fn construct_query(
        profile: &Profile,
        bboxes: &[Option<Bbox>],
    ) -> Result<String, ProfileError> {
        let clauses = profile.query()?.clauses();
        let filters: Vec<String> = clauses
            .iter()
            .map(|clause| match clause {
                QueryClause::Raw(s) => s.clone(),
                QueryClause::Tags(conds) => conds.iter().map(condition_filter).collect(),
            })
            .collect();

        let timeout = match profile.overpass_timeout {
            Some(t) => format!("[timeout:{t}]"),
            None => String::new(),
        };
        let mut query = format!("[out:xml]{timeout};(");
        for bbox in bboxes {
            let bbox_str = bbox.map(|b| format!("({b})")).unwrap_or_default();
            for filter in &filters {
                query.push_str(&format!("nwr{filter}{bbox_str};"));
            }
        }
        if let Some(ref_tag) = profile.ref_tag() {
            // objects already carrying the dataset id, wherever they are,
            // unless the update is explicitly bounded
            if profile.bounded_update {
                for bbox in bboxes {
                    let bbox_str = bbox.map(|b| format!("({b})")).unwrap_or_default();
                    query.push_str(&format!("nwr[\"{ref_tag}\"]{bbox_str};"));
                }
            } else {
                query.push_str(&format!("nwr[\"{ref_tag}\"];"));
            }
        }
        query.push_str("); out meta qt center;");
        Ok(query)
    }

    /// Runs the query and returns the raw OSM XML.
    pub fn download(
        &self,
        profile: &Profile,
        bboxes: &[Option<Bbox>],
    ) -> Result<String, DownloadError> {
        let query = Self::construct_query(profile, bboxes)?;
        debug!("overpass query: {query}");
        let url = format!("{}interpreter", self.server);
        let body = match ureq::get(&url).query("data", &query).call() {
            Ok(response) => response.into_string()?,
            Err(ureq::Error::Status(code, response)) => {
                let text = response.into_string().unwrap_or_default();
                if text.contains("rate_limited") {
                    let status = ureq::get(&format!("{}status", self.server))
                        .call()
                        .ok()
                        .and_then(|r| r.into_string().ok())
                        .unwrap_or_default();
                    warn!("seems like you are rate limited");
                    return Err(DownloadError::RateLimited(status));
                }
                error!("overpass error message: {text}");
                return Err(DownloadError::Status(code));
            }
            Err(e) => return Err(DownloadError::Transport(Box::new(e))),
        };
        if body.contains("runtime error: ") {
            let detail = Regex::new("runtime error: ([^<]+)")
                .ok()
                .and_then(|re| {
                    re.captures(&body)
                        .and_then(|c| c.get(1).map(|m| m.as_str().to_string()))
                })
                .unwrap_or_else(|| "unknown".to_string());
            if detail.contains("Query timed out") {
                error!("query timed out, try increasing \"overpass_timeout\" in the profile");
            }
            return Err(DownloadError::Runtime(detail));
        }
        Ok(body)
    }
}

fn condition_filter(cond: &crate::profile::TagCondition) -> String {
    match &cond.rule {
        CondRule::Present => format!("[\"{}\"]", cond.key),
        CondRule::Absent => format!("[\"!{}\"]", cond.key),
        CondRule::Any(matchers) => match matchers.as_slice() {
            [ValueMatch::Equals(v)] => format!("[\"{}\"=\"{}\"]", cond.key, v),
            // single regex and substring go case-insensitive
            [m @ (ValueMatch::Regex { .. } | ValueMatch::Substring(_))] => {
                format!("[\"{}\"~\"{}\",i]", cond.key, m.raw_text())
            }
            many => {
                let alts: Vec<&str> = many.iter().map(ValueMatch::raw_text).collect();
                format!("[\"{}\"~\"^({})$\"]", cond.key, alts.join("|"))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(json: &str) -> Profile {
        Profile::from_json(json).unwrap()
    }

    #[test]
    fn query_filters() {
        let p = profile(
            r#"{"source": "s", "dataset_id": "ds", "overpass_timeout": 90,
                "query": [["amenity", "cafe"], ["name"], ["fee", null],
                          ["brand", "~^Shell"], ["cuisine", "pizza", "kebab"]]}"#,
        );
        let q = Overpass::construct_query(&p, &[None]).unwrap();
        assert!(q.starts_with("[out:xml][timeout:90];("));
        assert!(q.contains("nwr[\"amenity\"=\"cafe\"][\"name\"][\"!fee\"]"));
        assert!(q.contains("[\"brand\"~\"^Shell\",i]"));
        assert!(q.contains("[\"cuisine\"~\"^(pizza|kebab)$\"]"));
        assert!(q.contains("nwr[\"ref:ds\"];"));
        assert!(q.ends_with("); out meta qt center;"));
    }

    #[test]
    fn bounded_update_limits_ref_query() {
        let bbox = Bbox { min_lat: 1.0, min_lon: 2.0, max_lat: 3.0, max_lon: 4.0 };
        let p = profile(
            r#"{"source": "s", "dataset_id": "ds", "bounded_update": true,
                "query": [["shop"]]}"#,
        );
        let q = Overpass::construct_query(&p, &[Some(bbox)]).unwrap();
        assert!(q.contains("nwr[\"shop\"](1,2,3,4);"));
        assert!(q.contains("nwr[\"ref:ds\"](1,2,3,4);"));
        assert!(!q.contains("nwr[\"ref:ds\"];"));
    }

    #[test]
    fn raw_query_passes_through() {
        let p = profile(
            r#"{"source": "s", "no_dataset_id": true,
                "query": "[amenity=drinking_water]"}"#,
        );
        let q = Overpass::construct_query(&p, &[None]).unwrap();
        assert!(q.contains("nwr[amenity=drinking_water];"));
    }

    #[test]
    fn missing_query_is_reported() {
        let p = profile(r#"{"source": "s", "no_dataset_id": true}"#);
        assert!(matches!(
            Overpass::construct_query(&p, &[None]),
            Err(ProfileError::MissingField { field: "query", .. })
        ));
    }

    #[test]
    fn boxes_follow_profile_setting() {
        let dataset = vec![crate::point::SourcePoint::new("1", 1.0, 2.0, Default::default())];
        let p = profile(r#"{"source": "s", "no_dataset_id": true, "bbox": false}"#);
        assert_eq!(Overpass::calc_boxes(&p, &dataset), vec![None]);

        let p = profile(
            r#"{"source": "s", "no_dataset_id": true, "bbox": [1.0, 2.0, 3.0, 4.0]}"#,
        );
        assert_eq!(
            Overpass::calc_boxes(&p, &dataset),
            vec![Some(Bbox { min_lat: 1.0, min_lon: 2.0, max_lat: 3.0, max_lon: 4.0 })]
        );

        let p = profile(r#"{"source": "s", "no_dataset_id": true}"#);
        let boxes = Overpass::calc_boxes(&p, &dataset);
        assert_eq!(boxes.len(), 1);
        assert!(boxes[0].is_some_and(|b| b.contains(dataset[0].point())));
    }
}
