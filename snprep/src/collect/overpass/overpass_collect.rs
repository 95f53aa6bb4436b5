use anyhow::{Context, Result};
use geo::{Coord, LineString, Polygon};
use log::{debug, info};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::collect::global_variables::{OVERPASS_TIMEOUT_SECS, OVERPASS_URL};
use crate::collect::overpass::retry::RetryPolicy;
use crate::error::OverpassError;
use crate::geo_core::BoundingBox;

const USER_AGENT: &str = concat!("snprep/", env!("CARGO_PKG_VERSION"));

/// Overpass QL asking for every building way and relation in a box,
/// followed by the nodes they reference
pub fn create_query(north: f64, south: f64, east: f64, west: f64) -> String {
    format!(
        r#"
    [out:json];
    (
      way["building"]({south},{west},{north},{east});
      relation["building"]({south},{west},{north},{east});
    );
    out body;
    >;
    out skel qt;
    "#
    )
}

/// Query for a lon/lat bounding box
pub fn bbox_query(bbox: &BoundingBox) -> String {
    create_query(bbox.max_y, bbox.min_y, bbox.max_x, bbox.min_x)
}

/// Overpass JSON output (`[out:json]`)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OverpassResponse {
    #[serde(default)]
    pub elements: Vec<Element>,
    /// Set by the server when the query failed or was cut short
    #[serde(default)]
    pub remark: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Element {
    Node {
        id: i64,
        lat: f64,
        lon: f64,
    },
    Way {
        id: i64,
        #[serde(default)]
        nodes: Vec<i64>,
    },
    Relation {
        id: i64,
    },
    #[serde(other)]
    Other,
}

/// A building way resolved to a lon/lat polygon
#[derive(Debug, Clone, PartialEq)]
pub struct BuildingWay {
    pub id: i64,
    pub polygon: Polygon<f64>,
}

impl OverpassResponse {
    /// Turn every way into a closed lon/lat polygon, in response order.
    /// Ways referencing unknown nodes or with fewer than 3 distinct nodes are dropped.
    /// A way listed again (relation members come back from `out skel`) keeps its
    /// first occurrence only.
    pub fn building_ways(&self) -> Vec<BuildingWay> {
        let nodes: HashMap<i64, Coord<f64>> = self
            .elements
            .iter()
            .filter_map(|e| match e {
                Element::Node { id, lat, lon } => Some((*id, Coord { x: *lon, y: *lat })),
                _ => None,
            })
            .collect();

        let mut seen = HashSet::new();
        let mut ways = Vec::new();
        for element in &self.elements {
            match element {
                Element::Way { id, .. } if !seen.insert(*id) => {
                    debug!("Way {} already assembled", id)
                }
                Element::Way { id, nodes: refs } => match way_polygon(refs, &nodes) {
                    Some(polygon) => ways.push(BuildingWay { id: *id, polygon }),
                    None => debug!("Skipping way {}: not a valid polygon", id),
                },
                Element::Relation { id } => debug!("Relation {} kept only through its member ways", id),
                _ => {}
            }
        }
        ways
    }
}

fn way_polygon(refs: &[i64], nodes: &HashMap<i64, Coord<f64>>) -> Option<Polygon<f64>> {
    let unique: HashSet<&i64> = refs.iter().collect();
    if unique.len() < 3 {
        return None;
    }
    let coords = refs
        .iter()
        .map(|id| nodes.get(id).copied())
        .collect::<Option<Vec<Coord<f64>>>>()?;

    // Polygon::new closes the ring when the way is left open
    Some(Polygon::new(LineString::from(coords), vec![]))
}

/// One round trip to an Overpass interpreter
pub trait OverpassApi {
    fn interpret(&self, query: &str) -> Result<OverpassResponse, OverpassError>;
}

/// Blocking Overpass client
pub struct OverpassCollect {
    client: Client,
    endpoint: String,
}

impl OverpassCollect {
    pub fn new(endpoint: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(OVERPASS_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(OverpassCollect {
            client,
            endpoint: endpoint.unwrap_or_else(|| OVERPASS_URL.to_string()),
        })
    }
}

impl OverpassApi for OverpassCollect {
    fn interpret(&self, query: &str) -> Result<OverpassResponse, OverpassError> {
        debug!("Overpass query to {}: {}", self.endpoint, query.trim());

        let response = self
            .client
            .post(&self.endpoint)
            .body(query.to_string())
            .send()?;

        let status = response.status().as_u16();
        let body = response.text()?;
        classify_response(status, &body)
    }
}

/// Map an HTTP status and body to a response or an Overpass error
pub fn classify_response(status: u16, body: &str) -> Result<OverpassResponse, OverpassError> {
    match status {
        200 => {}
        400 => return Err(OverpassError::BadRequest(body.trim().to_string())),
        429 => return Err(OverpassError::TooManyRequests),
        504 => return Err(OverpassError::GatewayTimeout),
        other => {
            return Err(OverpassError::UnknownStatus {
                status: other,
                body: body.trim().to_string(),
            })
        }
    }

    let parsed: OverpassResponse = serde_json::from_str(body)?;
    if let Some(remark) = parsed.remark.as_deref() {
        if remark.trim_start().starts_with("runtime") {
            return Err(OverpassError::Runtime(remark.trim().to_string()));
        }
    }
    Ok(parsed)
}

/// Run a query, retrying transient API errors per `policy`
pub fn query_with_retry<A: OverpassApi + ?Sized>(
    api: &A,
    policy: &RetryPolicy,
    query: &str,
) -> Result<OverpassResponse, OverpassError> {
    policy.run(OverpassError::is_transient, || api.interpret(query))
}

/// Building polygons (lon/lat) inside a bounding box
pub fn fetch_buildings<A: OverpassApi + ?Sized>(
    api: &A,
    policy: &RetryPolicy,
    bbox: &BoundingBox,
) -> Result<Vec<BuildingWay>, OverpassError> {
    let response = query_with_retry(api, policy, &bbox_query(bbox))?;
    let ways = response.building_ways();
    info!(
        "Overpass returned {} elements, {} building polygons",
        response.elements.len(),
        ways.len()
    );
    Ok(ways)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    const SAMPLE: &str = r#"{
        "version": 0.6,
        "elements": [
            {"type": "way", "id": 10, "nodes": [1, 2, 3, 4, 1], "tags": {"building": "yes"}},
            {"type": "way", "id": 11, "nodes": [1, 2, 1]},
            {"type": "way", "id": 12, "nodes": [2, 3, 4]},
            {"type": "way", "id": 13, "nodes": [1, 2, 99, 1]},
            {"type": "relation", "id": 20, "members": []},
            {"type": "area", "id": 30},
            {"type": "node", "id": 1, "lat": 48.0, "lon": 2.0},
            {"type": "node", "id": 2, "lat": 48.0, "lon": 2.001},
            {"type": "node", "id": 3, "lat": 48.001, "lon": 2.001},
            {"type": "node", "id": 4, "lat": 48.001, "lon": 2.0}
        ]
    }"#;

    #[test]
    fn test_create_query() {
        let q = create_query(48.9, 48.8, 2.4, 2.3);
        assert!(q.contains("[out:json];"));
        assert!(q.contains(r#"way["building"](48.8,2.3,48.9,2.4);"#));
        assert!(q.contains(r#"relation["building"](48.8,2.3,48.9,2.4);"#));
        assert!(q.contains("out skel qt;"));
    }

    #[test]
    fn test_bbox_query_order() {
        let bbox = BoundingBox::new(2.3, 48.8, 2.4, 48.9);
        assert_eq!(bbox_query(&bbox), create_query(48.9, 48.8, 2.4, 2.3));
    }

    #[test]
    fn test_building_ways_skips_degenerate() {
        let response = classify_response(200, SAMPLE).unwrap();
        let ways = response.building_ways();
        let ids: Vec<i64> = ways.iter().map(|w| w.id).collect();
        // 11 has two distinct nodes, 13 references a missing node
        assert_eq!(ids, vec![10, 12]);
    }

    #[test]
    fn test_open_way_is_closed() {
        let response = classify_response(200, SAMPLE).unwrap();
        let ways = response.building_ways();
        let ring = &ways[1].polygon.exterior().0;
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.first(), ring.last());
        assert_eq!(ring[0], Coord { x: 2.001, y: 48.0 });
    }

    #[test]
    fn test_relation_member_way_kept_once() {
        let body = r#"{
            "elements": [
                {"type": "way", "id": 10, "nodes": [1, 2, 3, 1], "tags": {"building": "yes"}},
                {"type": "relation", "id": 20, "members": [{"type": "way", "ref": 10, "role": "outer"}]},
                {"type": "node", "id": 1, "lat": 48.0, "lon": 2.0},
                {"type": "node", "id": 2, "lat": 48.0, "lon": 2.001},
                {"type": "node", "id": 3, "lat": 48.001, "lon": 2.001},
                {"type": "way", "id": 10, "nodes": [1, 2, 3, 1]},
                {"type": "way", "id": 12, "nodes": [3, 2, 1]}
            ]
        }"#;
        let ways = classify_response(200, body).unwrap().building_ways();
        let ids: Vec<i64> = ways.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![10, 12]);
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(classify_response(429, ""), Err(OverpassError::TooManyRequests)));
        assert!(matches!(classify_response(504, ""), Err(OverpassError::GatewayTimeout)));
        assert!(matches!(
            classify_response(400, "Error: line 2: parse error"),
            Err(OverpassError::BadRequest(_))
        ));
        assert!(matches!(
            classify_response(503, "busy"),
            Err(OverpassError::UnknownStatus { status: 503, .. })
        ));
        assert!(matches!(classify_response(200, "<html>"), Err(OverpassError::Decode(_))));
    }

    #[test]
    fn test_runtime_remark() {
        let body = r#"{"elements": [], "remark": "runtime error: Query timed out in \"query\""}"#;
        assert!(matches!(classify_response(200, body), Err(OverpassError::Runtime(_))));
    }

    struct ScriptedApi {
        replies: RefCell<Vec<Result<OverpassResponse, OverpassError>>>,
        calls: RefCell<u32>,
    }

    impl OverpassApi for ScriptedApi {
        fn interpret(&self, _query: &str) -> Result<OverpassResponse, OverpassError> {
            *self.calls.borrow_mut() += 1;
            self.replies.borrow_mut().remove(0)
        }
    }

    #[test]
    fn test_fetch_buildings_retries() {
        let api = ScriptedApi {
            replies: RefCell::new(vec![
                Err(OverpassError::GatewayTimeout),
                Err(OverpassError::TooManyRequests),
                classify_response(200, SAMPLE),
            ]),
            calls: RefCell::new(0),
        };
        let policy = RetryPolicy::new(3, Duration::ZERO, 2);
        let bbox = BoundingBox::new(2.0, 48.0, 2.01, 48.01);

        let ways = fetch_buildings(&api, &policy, &bbox).unwrap();
        assert_eq!(ways.len(), 2);
        assert_eq!(*api.calls.borrow(), 3);
    }

    #[test]
    fn test_client_endpoint() {
        let client = OverpassCollect::new(None).unwrap();
        assert_eq!(client.endpoint, OVERPASS_URL);
        let client =
            OverpassCollect::new(Some("http://localhost:12345/api/interpreter".into())).unwrap();
        assert_eq!(client.endpoint, "http://localhost:12345/api/interpreter");
    }
}
