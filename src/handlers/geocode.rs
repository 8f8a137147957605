//! Geocode RPC handlers
//!
//! Unary request/reply on `gcaas.geocode`, plus the streaming fan-out subject
//! batch workers use. Streamed responses echo the originating query so the
//! caller can reassemble order when responses interleave. Each message is
//! handed off to its own task; a slow engine call never blocks the
//! subscription loop.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::handlers::respond;
use crate::services::geocoding::GeocodeService;
use crate::types::{ErrorResponse, GeocodeQuery, GeocodeResponse, Request, SuccessResponse};

/// Handle unary geocode requests
pub async fn handle_geocode(
    client: Client,
    mut subscriber: Subscriber,
    service: Arc<GeocodeService>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let client = client.clone();
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let started = Instant::now();

            let request: Request<GeocodeQuery> = match serde_json::from_slice(&msg.payload) {
                Ok(req) => req,
                Err(e) => {
                    error!("Failed to parse geocode request: {}", e);
                    let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                    respond(&client, reply, &error).await;
                    return;
                }
            };

            let query = &request.payload;
            match service.geocode(query).await {
                Ok(response) => {
                    info!(
                        "geocode request successful (method {}, query \"{}\", {} results, {} ms)",
                        query.method,
                        query.query_string(),
                        response.num_results,
                        started.elapsed().as_millis(),
                    );
                    let success = SuccessResponse::new(request.id, response);
                    respond(&client, reply, &success).await;
                }
                Err(e) => {
                    error!(
                        "geocode request failed (method {}, query \"{}\", {} ms): {}",
                        query.method,
                        query.query_string(),
                        started.elapsed().as_millis(),
                        e,
                    );
                    let error = ErrorResponse::from_service_error(request.id, &e);
                    respond(&client, reply, &error).await;
                }
            }
        });
    }

    Ok(())
}

/// Handle streaming geocode traffic. Payloads are bare `GeocodeQuery` frames;
/// every response carries the query echo. A query that resolves to nothing -
/// or fails outright - still gets an empty response, so one bad element never
/// fails the whole stream and it stays N-in, N-out.
pub async fn handle_geocode_stream(
    client: Client,
    mut subscriber: Subscriber,
    service: Arc<GeocodeService>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let client = client.clone();
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let query: GeocodeQuery = match serde_json::from_slice(&msg.payload) {
                Ok(query) => query,
                Err(e) => {
                    error!("Failed to parse streamed geocode query: {}", e);
                    let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                    respond(&client, reply, &error).await;
                    return;
                }
            };

            let response = resolve_stream_query(&service, &query).await;
            respond(&client, reply, &response).await;
        });
    }

    Ok(())
}

/// Resolve one streamed query. Per-query failures collapse to an empty
/// response with the echo preserved; the caller records them as no-match
/// slots, never a batch-level failure.
async fn resolve_stream_query(service: &GeocodeService, query: &GeocodeQuery) -> GeocodeResponse {
    let echo = query.query_string();
    match service.geocode(query).await {
        Ok(mut response) => {
            response.query = Some(echo);
            response
        }
        Err(e) => {
            warn!("streamed geocode failed (query \"{}\"): {}", echo, e);
            GeocodeResponse {
                results: Vec::new(),
                num_results: 0,
                query: Some(echo),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::search::{MemoryEngine, SearchEngine};
    use crate::types::{Address, Point};

    async fn service() -> GeocodeService {
        let engine = MemoryEngine::new();
        engine
            .upsert(&[Address {
                id: "A1".to_string(),
                location: Point::new(40.68102, -73.94891),
                composite_street: "451 MAIN ST".to_string(),
            }])
            .await
            .unwrap();
        GeocodeService::new(Arc::new(engine), 1024)
    }

    #[tokio::test]
    async fn stream_responses_echo_their_query() {
        let service = service().await;

        let response =
            resolve_stream_query(&service, &GeocodeQuery::forward("451 MAIN ST", 1)).await;

        assert_eq!(response.query.as_deref(), Some("451 MAIN ST"));
        assert_eq!(response.num_results, 1);
        assert_eq!(response.results[0].address.id, "A1");
    }

    #[tokio::test]
    async fn malformed_stream_element_becomes_an_empty_slot() {
        let service = service().await;

        // an empty address is rejected before the engine; the stream reply is
        // still a well-formed empty response, not an error envelope
        let response = resolve_stream_query(&service, &GeocodeQuery::forward("", 1)).await;

        assert_eq!(response.num_results, 0);
        assert!(response.results.is_empty());
        assert_eq!(response.query.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn out_of_range_stream_point_becomes_an_empty_slot() {
        let service = service().await;
        let query = GeocodeQuery::reverse(Point::new(91.0, 0.0), 1);
        let echo = query.query_string();

        let response = resolve_stream_query(&service, &query).await;

        assert_eq!(response.num_results, 0);
        assert_eq!(response.query, Some(echo));
    }
}
