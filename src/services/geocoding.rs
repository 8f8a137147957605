//! Geocoding core
//!
//! Sits between the RPC surface and the search-engine collaborator:
//! - rejects queries the engine is known to fail on, before any engine call
//! - builds the engine query (fuzzy markers on forward, radius on reverse)
//! - parses the engine's raw reply and normalizes confidences so callers
//!   always receive a [0, 1] band with the top result at 1.0

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::error;

use crate::errors::ServiceError;
use crate::services::search::{RawSearchReply, SearchEngine};
use crate::types::{Address, GeocodeQuery, GeocodeResponse, Method, Point, ScoredAddress};

/// Whitespace tokens of length >= 3 get wrapped in `%...%`, the engine
/// dialect's Levenshtein-1 marker.
static FUZZY_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\w{3,})").expect("static pattern"));

/// Digit runs inside the engine's `"lat, lng"` location strings.
static NUMERIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-]?\d+(\.\d+)?").expect("static pattern"));

pub struct GeocodeService {
    engine: Arc<dyn SearchEngine>,
    rev_tolerance_m: u32,
}

impl GeocodeService {
    pub fn new(engine: Arc<dyn SearchEngine>, rev_tolerance_m: u32) -> Self {
        Self {
            engine,
            rev_tolerance_m,
        }
    }

    /// Resolve a single geocode query against the engine.
    pub async fn geocode(&self, query: &GeocodeQuery) -> Result<GeocodeResponse, ServiceError> {
        match query.method {
            Method::FwdFuzzy => self.forward(query).await,
            Method::RevNearest => self.reverse(query).await,
        }
    }

    async fn forward(&self, query: &GeocodeQuery) -> Result<GeocodeResponse, ServiceError> {
        let address = query.address_query.as_deref().unwrap_or_default();
        if address.trim().is_empty() {
            return Err(ServiceError::MalformedQuery);
        }

        let fuzzy = FUZZY_TOKEN_RE.replace_all(address, "%$1%");
        let reply = self
            .engine
            .search_text(&fuzzy, query.max_results)
            .await
            .map_err(|e| {
                error!("forward geocode engine call failed: {}", e);
                ServiceError::Engine(e.to_string())
            })?;

        shape_reply(reply, query.max_results)
    }

    async fn reverse(&self, query: &GeocodeQuery) -> Result<GeocodeResponse, ServiceError> {
        let point = query.point_query.unwrap_or_default();
        if !point.in_range() {
            return Err(ServiceError::MalformedQuery);
        }

        let reply = self
            .engine
            .search_radius(point, self.rev_tolerance_m, query.max_results)
            .await
            .map_err(|e| {
                error!("reverse geocode engine call failed: {}", e);
                ServiceError::Engine(e.to_string())
            })?;

        shape_reply(reply, query.max_results)
    }
}

/// Parse a raw engine reply into ranked, confidence-normalized results.
/// Assumes hits arrive best-first; the top hit's own score is the
/// normalization denominator, so the first result always lands at exactly
/// 1.0. A reply whose top score does not parse to a positive number is an
/// engine failure, whichever backend produced it.
fn shape_reply(
    reply: RawSearchReply,
    max_results: u32,
) -> Result<GeocodeResponse, ServiceError> {
    let mut hits = reply.hits;
    hits.truncate(max_results as usize);

    let Some(top) = hits.first() else {
        return Ok(GeocodeResponse::default());
    };
    let max_confidence = top
        .score
        .parse::<f32>()
        .ok()
        .filter(|s| *s > 0.0)
        .ok_or_else(|| {
            ServiceError::Engine(format!("top result has unusable score \"{}\"", top.score))
        })?;

    let results: Vec<ScoredAddress> = hits
        .into_iter()
        .map(|hit| {
            let score = hit.score.parse::<f32>().unwrap_or_default();
            ScoredAddress {
                address: Address {
                    id: hit.id,
                    location: point_from_location_string(&hit.location),
                    composite_street: hit.composite_street.clone(),
                },
                full_street: hit.composite_street,
                normed_confidence: score / max_confidence,
            }
        })
        .collect();

    Ok(GeocodeResponse {
        num_results: results.len() as u32,
        results,
        query: None,
    })
}

/// Parse the engine's single-string coordinate representation. Latitude
/// precedes longitude: the north-south coordinate always comes first.
fn point_from_location_string(s: &str) -> Point {
    let coords: Vec<f32> = NUMERIC_RE
        .find_iter(s)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    if coords.len() != 2 {
        return Point::default();
    }
    Point {
        lat: coords[0],
        lng: coords[1],
    }
}
