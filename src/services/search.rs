//! Search-engine collaborator
//!
//! The geocoder treats the full-text/geospatial engine as a black box behind
//! the `SearchEngine` trait: a text query over `composite_street_address`, a
//! radius query over `location`, and an insert-or-replace write path. Replies
//! come back in the engine's raw shape (string scores, string-encoded
//! locations); parsing and confidence normalization are the RPC layer's job.
//!
//! `MemoryEngine` is the in-process backend (and the LOCAL/test default): an
//! inverted index with document-normalized TF-IDF scoring, Levenshtein-1
//! matching for `%tok%` fuzzy markers, and great-circle distance for the
//! radius query.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

use crate::types::{Address, Point};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine query failed: {0}")]
    Query(String),

    #[error("engine write failed: {0}")]
    Index(String),
}

/// A single hit in the engine's raw reply shape.
#[derive(Debug, Clone)]
pub struct RawHit {
    pub id: String,
    /// Relevance score as the engine prints it; parsed downstream.
    pub score: String,
    /// Coordinates as a single `"lat, lng"` string.
    pub location: String,
    pub composite_street: String,
}

/// Raw engine reply: total match count plus ranked hits, best first.
#[derive(Debug, Clone, Default)]
pub struct RawSearchReply {
    pub total: usize,
    pub hits: Vec<RawHit>,
}

/// Abstraction over the full-text/geospatial engine backend.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Full-text query over the composite street address field. Tokens
    /// wrapped in `%...%` match with an edit distance of one.
    async fn search_text(&self, query: &str, limit: u32) -> Result<RawSearchReply, EngineError>;

    /// Geo radius query: indexed addresses within `tolerance_m` meters of
    /// `point`, closest first.
    async fn search_radius(
        &self,
        point: Point,
        tolerance_m: u32,
        limit: u32,
    ) -> Result<RawSearchReply, EngineError>;

    /// Insert-or-replace a batch of address documents. Returns the number of
    /// documents written.
    async fn upsert(&self, batch: &[Address]) -> Result<usize, EngineError>;

    /// Name of this engine backend.
    fn name(&self) -> &'static str;
}

/// Create the engine backend named by `ENGINE_BACKEND` (default `memory`).
/// The trait seam is where a remote engine connection would plug in.
pub fn create_engine() -> Arc<dyn SearchEngine> {
    let backend = std::env::var("ENGINE_BACKEND").unwrap_or_else(|_| "memory".to_string());

    match backend.as_str() {
        "memory" => Arc::new(MemoryEngine::new()),
        _ => {
            warn!("unknown ENGINE_BACKEND '{}', using memory", backend);
            Arc::new(MemoryEngine::new())
        }
    }
}

// ==========================================================================
// MemoryEngine Implementation
// ==========================================================================

#[derive(Debug)]
struct Doc {
    address: Address,
    /// term -> term frequency
    tokens: HashMap<String, u32>,
    token_count: u32,
}

#[derive(Default)]
struct Index {
    docs: HashMap<String, Doc>,
    /// term -> doc id -> term frequency
    postings: HashMap<String, HashMap<String, u32>>,
}

/// In-process engine backend.
pub struct MemoryEngine {
    index: RwLock<Index>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        info!("memory engine index ready");
        Self {
            index: RwLock::new(Index::default()),
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercased alphanumeric tokens of a street address.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// One parsed query token: the bare term plus whether it carries the `%...%`
/// fuzzy marker.
struct QueryToken {
    term: String,
    fuzzy: bool,
}

fn parse_query(query: &str) -> Vec<QueryToken> {
    query
        .split_whitespace()
        .filter_map(|raw| {
            let fuzzy = raw.len() > 2 && raw.starts_with('%') && raw.ends_with('%');
            let bare = if fuzzy {
                &raw[1..raw.len() - 1]
            } else {
                raw
            };
            let term = tokenize(bare).join("");
            if term.is_empty() {
                None
            } else {
                Some(QueryToken { term, fuzzy })
            }
        })
        .collect()
}

/// Edit distance <= 1 check, specialized so no DP table is needed.
fn within_edit_distance_one(a: &str, b: &str) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };

    match long.len() - short.len() {
        0 => short.iter().zip(long.iter()).filter(|(x, y)| x != y).count() <= 1,
        1 => {
            // one insertion allowed: walk both, skip the first mismatch in
            // the longer string
            let mut i = 0;
            let mut j = 0;
            let mut skipped = false;
            while i < short.len() {
                if short[i] == long[j] {
                    i += 1;
                    j += 1;
                } else if skipped {
                    return false;
                } else {
                    skipped = true;
                    j += 1;
                }
            }
            true
        }
        _ => false,
    }
}

fn format_location(point: Point) -> String {
    format!("{:.8}, {:.8}", point.lat, point.lng)
}

/// Great-circle distance in meters between two coordinate pairs.
fn haversine_meters(a: Point, b: Point) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_008.8;

    let lat_a = f64::from(a.lat).to_radians();
    let lat_b = f64::from(b.lat).to_radians();
    let d_lat = (f64::from(b.lat) - f64::from(a.lat)).to_radians();
    let d_lng = (f64::from(b.lng) - f64::from(a.lng)).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

#[async_trait]
impl SearchEngine for MemoryEngine {
    async fn search_text(&self, query: &str, limit: u32) -> Result<RawSearchReply, EngineError> {
        let query_tokens = parse_query(query);
        if query_tokens.is_empty() {
            return Err(EngineError::Query("empty text query".to_string()));
        }

        let index = self.index.read();
        let doc_count = index.docs.len() as f64;

        // accumulate tf*idf per document across all matching index terms
        let mut scores: HashMap<&str, f64> = HashMap::new();
        for token in &query_tokens {
            for (term, postings) in &index.postings {
                let matched = if token.fuzzy {
                    within_edit_distance_one(&token.term, term)
                } else {
                    token.term == *term
                };
                if !matched {
                    continue;
                }

                let idf = (1.0 + doc_count / (1.0 + postings.len() as f64)).ln();
                for (doc_id, tf) in postings {
                    *scores.entry(doc_id.as_str()).or_default() += f64::from(*tf) * idf;
                }
            }
        }

        // normalize by document length, then rank best-first; ties break on
        // id so results are stable across runs
        let mut ranked: Vec<(&str, f64)> = scores
            .into_iter()
            .map(|(doc_id, score)| {
                let len = index.docs[doc_id].token_count.max(1);
                (doc_id, score / f64::from(len))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0)));

        let total = ranked.len();
        let hits = ranked
            .into_iter()
            .take(limit as usize)
            .map(|(doc_id, score)| {
                let doc = &index.docs[doc_id];
                RawHit {
                    id: doc.address.id.clone(),
                    score: format!("{score:.6}"),
                    location: format_location(doc.address.location),
                    composite_street: doc.address.composite_street.clone(),
                }
            })
            .collect();

        Ok(RawSearchReply { total, hits })
    }

    async fn search_radius(
        &self,
        point: Point,
        tolerance_m: u32,
        limit: u32,
    ) -> Result<RawSearchReply, EngineError> {
        let index = self.index.read();

        let mut in_range: Vec<(&Doc, f64)> = index
            .docs
            .values()
            .filter_map(|doc| {
                let dist = haversine_meters(point, doc.address.location);
                (dist <= f64::from(tolerance_m)).then_some((doc, dist))
            })
            .collect();
        in_range.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.address.id.cmp(&b.0.address.id)));

        let total = in_range.len();
        let hits = in_range
            .into_iter()
            .take(limit as usize)
            .map(|(doc, dist)| RawHit {
                id: doc.address.id.clone(),
                // closest hit scores highest; parsed and normalized downstream
                score: format!("{:.6}", 1.0 / (1.0 + dist)),
                location: format_location(doc.address.location),
                composite_street: doc.address.composite_street.clone(),
            })
            .collect();

        Ok(RawSearchReply { total, hits })
    }

    async fn upsert(&self, batch: &[Address]) -> Result<usize, EngineError> {
        let mut index = self.index.write();

        for address in batch {
            // replace semantics: drop the previous document's postings first
            if let Some(old) = index.docs.remove(&address.id) {
                for term in old.tokens.keys() {
                    let emptied = match index.postings.get_mut(term) {
                        Some(postings) => {
                            postings.remove(&address.id);
                            postings.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        index.postings.remove(term);
                    }
                }
            }

            let tokens_list = tokenize(&address.composite_street);
            let token_count = tokens_list.len() as u32;
            let mut tokens: HashMap<String, u32> = HashMap::new();
            for token in tokens_list {
                *tokens.entry(token).or_default() += 1;
            }
            for (term, tf) in &tokens {
                index
                    .postings
                    .entry(term.clone())
                    .or_default()
                    .insert(address.id.clone(), *tf);
            }
            index.docs.insert(
                address.id.clone(),
                Doc {
                    address: address.clone(),
                    tokens,
                    token_count,
                },
            );
        }

        Ok(batch.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(id: &str, lat: f32, lng: f32, street: &str) -> Address {
        Address {
            id: id.to_string(),
            location: Point::new(lat, lng),
            composite_street: street.to_string(),
        }
    }

    async fn seeded_engine() -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine
            .upsert(&[
                addr("A1", 40.68102, -73.94891, "451A WINTHROP ST"),
                addr("A2", 40.68150, -73.94700, "455 WINTHROP ST"),
                addr("B1", 40.70000, -73.90000, "12 FULTON AVE"),
            ])
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn exact_tokens_match_their_document() {
        let engine = seeded_engine().await;

        let reply = engine.search_text("451a winthrop", 5).await.unwrap();
        assert!(reply.total >= 1);
        assert_eq!(reply.hits[0].id, "A1");
        assert_eq!(reply.hits[0].composite_street, "451A WINTHROP ST");
    }

    #[tokio::test]
    async fn fuzzy_markers_tolerate_one_edit() {
        let engine = seeded_engine().await;

        // dropped letter inside the marker still matches WINTHROP
        let reply = engine.search_text("%wintrop%", 5).await.unwrap();
        assert!(reply.hits.iter().any(|h| h.id == "A1"));

        // without the marker the typo finds nothing
        let strict = engine.search_text("wintrop", 5).await.unwrap();
        assert_eq!(strict.total, 0);
    }

    #[tokio::test]
    async fn empty_query_is_an_engine_error() {
        let engine = seeded_engine().await;
        assert!(engine.search_text("  ", 5).await.is_err());
    }

    #[tokio::test]
    async fn limit_truncates_but_total_counts_all() {
        let engine = seeded_engine().await;

        let reply = engine.search_text("winthrop st", 1).await.unwrap();
        assert_eq!(reply.hits.len(), 1);
        assert_eq!(reply.total, 2);
    }

    #[tokio::test]
    async fn radius_query_returns_closest_first() {
        let engine = seeded_engine().await;

        let reply = engine
            .search_radius(Point::new(40.68103, -73.94890), 1024, 5)
            .await
            .unwrap();
        assert_eq!(reply.hits.len(), 2);
        assert_eq!(reply.hits[0].id, "A1");
        assert_eq!(reply.hits[1].id, "A2");
    }

    #[tokio::test]
    async fn radius_query_excludes_points_beyond_tolerance() {
        let engine = seeded_engine().await;

        // B1 is several kilometers away from the query point
        let reply = engine
            .search_radius(Point::new(40.68103, -73.94890), 1024, 10)
            .await
            .unwrap();
        assert!(reply.hits.iter().all(|h| h.id != "B1"));
    }

    #[tokio::test]
    async fn upsert_replaces_existing_documents() {
        let engine = seeded_engine().await;

        let written = engine
            .upsert(&[addr("A1", 40.68102, -73.94891, "99 RELOCATED BLVD")])
            .await
            .unwrap();
        assert_eq!(written, 1);

        let old = engine.search_text("winthrop", 10).await.unwrap();
        assert!(old.hits.iter().all(|h| h.id != "A1"));

        let new = engine.search_text("relocated", 10).await.unwrap();
        assert_eq!(new.hits[0].id, "A1");
    }

    #[test]
    fn edit_distance_one_boundary_cases() {
        assert!(within_edit_distance_one("winthrop", "winthrop"));
        assert!(within_edit_distance_one("wintrop", "winthrop"));
        assert!(within_edit_distance_one("winthrap", "winthrop"));
        assert!(within_edit_distance_one("winthropp", "winthrop"));
        assert!(!within_edit_distance_one("wintrp", "winthrop"));
        assert!(!within_edit_distance_one("fulton", "winthrop"));
    }

    #[test]
    fn haversine_is_plausible_at_city_scale() {
        // ~111 m per 0.001 degrees of latitude
        let d = haversine_meters(Point::new(40.0, -73.0), Point::new(40.001, -73.0));
        assert!((d - 111.0).abs() < 2.0, "got {d}");
    }

    #[test]
    fn location_strings_put_latitude_first() {
        let s = format_location(Point::new(40.5, -73.25));
        assert_eq!(s, "40.50000000, -73.25000000");
    }
}
