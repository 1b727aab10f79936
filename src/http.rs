//! Overpass (OpenStreetMap) client for infrastructure markers.
//!
//! Queries nodes tagged as mobile-phone masts or surveillance cameras inside a bounding box.
//! - Shared connection pool
//! - Per-request timeout
//! - Retry with exponential backoff on 429 and 504 (Overpass load shedding)
//!
//! Any other failure is returned to the caller; the viewport cache decides what happens next.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::collaborators::MarkerSource;
use crate::viewport_cache::{InfrastructureKind, InfrastructureMarker};
use crate::{CaseMapError, Coordinate, GeoBounds, Result};

pub const DEFAULT_ENDPOINT: &str = "https://overpass-api.de/api/interpreter";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const QUERY_TIMEOUT_SECS: u32 = 25;
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OverpassElement>,
}

#[derive(Debug, Deserialize)]
struct OverpassElement {
    #[serde(rename = "type")]
    element_type: String,
    id: i64,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

/// Overpass QL for masts and cameras in `bounds`.
pub fn build_query(bounds: &GeoBounds) -> String {
    let bbox = format!(
        "({},{},{},{})",
        bounds.min_lat(),
        bounds.min_lon(),
        bounds.max_lat(),
        bounds.max_lon()
    );
    format!(
        "[out:json][timeout:{timeout}];(\
         node[\"man_made\"=\"mast\"][\"tower:type\"=\"communication\"]{bbox};\
         node[\"communication:mobile_phone\"=\"yes\"]{bbox};\
         node[\"man_made\"=\"surveillance\"]{bbox};\
         );out body;",
        timeout = QUERY_TIMEOUT_SECS,
        bbox = bbox
    )
}

fn classify(tags: &BTreeMap<String, String>) -> InfrastructureKind {
    match tags.get("man_made").map(String::as_str) {
        Some("surveillance") => InfrastructureKind::Cctv,
        _ => InfrastructureKind::CellTower,
    }
}

/// Decode an Overpass JSON body into markers.
///
/// Elements without a usable position are dropped.
pub fn parse_response(body: &str) -> Result<Vec<InfrastructureMarker>> {
    let response: OverpassResponse = serde_json::from_str(body)?;

    let markers: Vec<InfrastructureMarker> = response
        .elements
        .into_iter()
        .filter_map(|element| {
            let coordinate = Coordinate::new(element.lat?, element.lon?);
            if !coordinate.is_valid() {
                return None;
            }
            let name = element
                .tags
                .get("name")
                .or_else(|| element.tags.get("operator"))
                .cloned()
                .unwrap_or_default();
            Some(InfrastructureMarker {
                id: format!("osm:{}:{}", element.element_type, element.id),
                coordinate,
                kind: classify(&element.tags),
                name,
                metadata: element.tags,
            })
        })
        .collect();

    Ok(markers)
}

/// Marker source backed by an Overpass endpoint.
pub struct OverpassMarkerSource {
    client: Client,
    endpoint: String,
    requests: AtomicU32,
}

impl OverpassMarkerSource {
    /// Create a source for the public Overpass endpoint.
    pub fn new() -> Result<Self> {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("casemap/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CaseMapError::fetch(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            requests: AtomicU32::new(0),
        })
    }

    /// Number of HTTP requests sent, retries included.
    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Fetch all markers inside `bounds`.
    pub async fn fetch_markers(&self, bounds: GeoBounds) -> Result<Vec<InfrastructureMarker>> {
        let query = build_query(&bounds);
        let start = Instant::now();
        let mut retries = 0;

        loop {
            self.requests.fetch_add(1, Ordering::Relaxed);
            let send = self
                .client
                .post(&self.endpoint)
                .form(&[("data", query.as_str())])
                .send();

            let response = match tokio::time::timeout(REQUEST_TIMEOUT, send).await {
                Ok(Ok(resp)) => resp,
                Ok(Err(e)) => {
                    return Err(CaseMapError::Fetch {
                        message: format!("Request error: {}", e),
                        status_code: e.status().map(|s| s.as_u16()),
                    })
                }
                Err(_) => return Err(CaseMapError::fetch("Request timed out")),
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::GATEWAY_TIMEOUT {
                retries += 1;
                if retries > MAX_RETRIES {
                    return Err(CaseMapError::Fetch {
                        message: "Max retries exceeded".to_string(),
                        status_code: Some(status.as_u16()),
                    });
                }
                // 1s, 2s, 4s
                let backoff = Duration::from_millis(1000 * (1 << (retries - 1)));
                warn!(
                    "[OverpassMarkerSource] HTTP {}, retry {} after {:?}",
                    status, retries, backoff
                );
                tokio::time::sleep(backoff).await;
                continue;
            }

            if !status.is_success() {
                return Err(CaseMapError::Fetch {
                    message: format!("HTTP {}", status),
                    status_code: Some(status.as_u16()),
                });
            }

            let body = response
                .text()
                .await
                .map_err(|e| CaseMapError::fetch(format!("Body error: {}", e)))?;
            debug!("[OverpassMarkerSource] Received {} bytes", body.len());

            let markers = parse_response(&body)?;
            info!(
                "[OverpassMarkerSource] {} markers in {:.2}s",
                markers.len(),
                start.elapsed().as_secs_f64()
            );
            return Ok(markers);
        }
    }
}

impl MarkerSource for OverpassMarkerSource {
    fn fetch<'a>(&'a self, bounds: GeoBounds) -> BoxFuture<'a, Result<Vec<InfrastructureMarker>>> {
        Box::pin(self.fetch_markers(bounds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_query_uses_south_west_north_east() {
        let bounds = GeoBounds::new(1.5, 2.5, 3.5, 4.5).unwrap();
        let query = build_query(&bounds);
        assert!(query.starts_with("[out:json][timeout:25];"));
        assert_eq!(query.matches("(1.5,2.5,3.5,4.5)").count(), 3);
        assert!(query.contains("\"man_made\"=\"surveillance\""));
        assert!(query.ends_with("out body;"));
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{
            "version": 0.6,
            "elements": [
                {"type": "node", "id": 1, "lat": 52.1, "lon": 13.2,
                 "tags": {"man_made": "mast", "tower:type": "communication", "operator": "Acme"}},
                {"type": "node", "id": 2, "lat": 52.2, "lon": 13.3,
                 "tags": {"man_made": "surveillance", "name": "Gate cam"}},
                {"type": "way", "id": 3}
            ]
        }"#;

        let markers = parse_response(body).unwrap();
        assert_eq!(markers.len(), 2);

        assert_eq!(markers[0].id, "osm:node:1");
        assert_eq!(markers[0].kind, InfrastructureKind::CellTower);
        assert_eq!(markers[0].name, "Acme");
        let tower_type = markers[0].metadata.get("tower:type").map(String::as_str);
        assert_eq!(tower_type, Some("communication"));

        assert_eq!(markers[1].kind, InfrastructureKind::Cctv);
        assert_eq!(markers[1].name, "Gate cam");
    }

    #[test]
    fn test_parse_response_rejects_garbage() {
        assert!(matches!(
            parse_response("<html>busy</html>"),
            Err(CaseMapError::Serialization { .. })
        ));
        assert!(parse_response("{}").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_fetch_error() {
        let source = OverpassMarkerSource::with_endpoint("http://127.0.0.1:9/interpreter").unwrap();
        let bounds = GeoBounds::new(0.0, 0.0, 1.0, 1.0).unwrap();
        let result = source.fetch(bounds).await;
        assert!(matches!(result, Err(CaseMapError::Fetch { .. })));
        assert_eq!(source.request_count(), 1);
    }
}
