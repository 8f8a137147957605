//! Core geocoding model types
//!
//! These shapes travel on the RPC surface and in persisted batch results, so
//! field names are part of the wire contract.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

/// Geocoding method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    /// Forward geocoding: fuzzy full-text match on the street address
    FwdFuzzy,
    /// Reverse geocoding: nearest indexed address within tolerance
    RevNearest,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::FwdFuzzy => "FWD_FUZZY",
            Method::RevNearest => "REV_NEAREST",
        }
    }

    /// Parse the wire name of a method.
    pub fn parse(s: &str) -> Result<Self, ServiceError> {
        match s {
            "FWD_FUZZY" => Ok(Method::FwdFuzzy),
            "REV_NEAREST" => Ok(Method::RevNearest),
            _ => Err(ServiceError::InvalidMethod),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A WGS-84 coordinate pair. Latitude is north-south, longitude is east-west,
/// always.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lat: f32,
    pub lng: f32,
}

impl Point {
    pub fn new(lat: f32, lng: f32) -> Self {
        Self { lat, lng }
    }

    /// True when both coordinates are inside their valid ranges.
    pub fn in_range(&self) -> bool {
        self.lat.abs() <= 90.0 && self.lng.abs() <= 180.0
    }
}

/// An indexed address. Immutable once written to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub id: String,
    pub location: Point,
    pub composite_street: String,
}

/// One ranked geocoding result. Confidence is normalized against the
/// top-ranked result of the same response, so the first entry always scores
/// 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredAddress {
    pub address: Address,
    pub full_street: String,
    pub normed_confidence: f32,
}

/// A single geocode request as carried on the RPC surface. Exactly one of
/// `address_query` / `point_query` is set, matching `method`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeQuery {
    pub method: Method,
    pub max_results: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_query: Option<Point>,
}

impl GeocodeQuery {
    pub fn forward(address: impl Into<String>, max_results: u32) -> Self {
        Self {
            method: Method::FwdFuzzy,
            max_results,
            address_query: Some(address.into()),
            point_query: None,
        }
    }

    pub fn reverse(point: Point, max_results: u32) -> Self {
        Self {
            method: Method::RevNearest,
            max_results,
            address_query: None,
            point_query: Some(point),
        }
    }

    /// Canonical display string of the query. Streaming responses echo this
    /// string so callers can pair responses back to their requests.
    pub fn query_string(&self) -> String {
        match self.method {
            Method::FwdFuzzy => self.address_query.clone().unwrap_or_default(),
            Method::RevNearest => {
                let pt = self.point_query.unwrap_or_default();
                format!("({:.8}, {:.8})", pt.lat, pt.lng)
            }
        }
    }
}

/// Ranked geocoding results, best match first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResponse {
    pub results: Vec<ScoredAddress>,
    pub num_results: u32,
    /// Echo of the originating query; set on streaming responses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// One slot of a resolved batch. `result` is absent when the engine had no
/// match for the query; the query itself is always preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAddress {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Address>,
}

/// Results file shape persisted as `{id}-results.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedBatch {
    pub batch: Vec<ResolvedAddress>,
}

/// Reply to a bulk address-ingest call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSummary {
    pub success: bool,
    pub total_objects_written: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_wire_names_round_trip() {
        assert_eq!(Method::FwdFuzzy.as_str(), "FWD_FUZZY");
        assert_eq!(Method::parse("REV_NEAREST").unwrap(), Method::RevNearest);
        assert!(matches!(
            Method::parse("NEAREST"),
            Err(ServiceError::InvalidMethod)
        ));

        let json = serde_json::to_string(&Method::FwdFuzzy).unwrap();
        assert_eq!(json, "\"FWD_FUZZY\"");
    }

    #[test]
    fn point_range_check() {
        assert!(Point::new(40.68102, -73.94891).in_range());
        assert!(!Point::new(90.5, 0.0).in_range());
        assert!(!Point::new(0.0, -181.0).in_range());
    }

    #[test]
    fn query_string_is_stable_per_method() {
        let fwd = GeocodeQuery::forward("451A WINTHROP ST", 5);
        assert_eq!(fwd.query_string(), "451A WINTHROP ST");

        let rev = GeocodeQuery::reverse(Point::new(40.5, -73.25), 1);
        assert_eq!(rev.query_string(), "(40.50000000, -73.25000000)");
    }

    #[test]
    fn geocode_query_omits_absent_variant_fields() {
        let fwd = GeocodeQuery::forward("main st", 5);
        let json = serde_json::to_string(&fwd).unwrap();
        assert!(json.contains("address_query"));
        assert!(!json.contains("point_query"));
    }

    #[test]
    fn resolved_address_omits_empty_result() {
        let empty = ResolvedAddress {
            query: "nowhere".into(),
            result: None,
        };
        let json = serde_json::to_string(&empty).unwrap();
        assert!(!json.contains("result"));
        assert!(json.contains("nowhere"));
    }
}
