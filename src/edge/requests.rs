//! Edge request shapes and their domain validation

use serde::Deserialize;

use crate::errors::ServiceError;
use crate::services::fingerprint;
use crate::types::{BatchSubmission, GeocodeQuery, Method, Point};

/// Body of `POST /geocode/`.
#[derive(Debug, Deserialize)]
pub struct GeocodeHttpRequest {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub max_results: u32,
    #[serde(default)]
    pub query_addr: Option<String>,
    #[serde(default)]
    pub query_lat: Option<f32>,
    #[serde(default)]
    pub query_lng: Option<f32>,
}

impl GeocodeHttpRequest {
    /// Parse and validate into the RPC query shape.
    pub fn into_query(self) -> Result<GeocodeQuery, ServiceError> {
        let method = Method::parse(&self.method)?;
        let point_query = match (self.query_lat, self.query_lng) {
            (Some(lat), Some(lng)) => Some(Point::new(lat, lng)),
            _ => None,
        };
        let query = GeocodeQuery {
            method,
            max_results: self.max_results,
            address_query: self.query_addr.filter(|s| !s.trim().is_empty()),
            point_query,
        };
        fingerprint::validate(&query)?;
        Ok(query)
    }
}

/// Body of `POST /batch/`.
#[derive(Debug, Deserialize)]
pub struct BatchHttpRequest {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub query_addr: Vec<String>,
    #[serde(default)]
    pub query_pts: Vec<Point>,
}

impl BatchHttpRequest {
    pub fn into_submission(self) -> Result<BatchSubmission, ServiceError> {
        let method = Method::parse(&self.method)?;
        let submission = BatchSubmission {
            method,
            addresses: self.query_addr,
            points: self.query_pts,
        };
        submission.validate()?;
        Ok(submission)
    }
}
