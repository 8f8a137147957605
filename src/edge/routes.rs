//! Edge route handlers
//!
//! `/geocode/` runs the read-through protocol: fingerprint, cache get on
//! hit-eligible requests, RPC on miss, best-effort populate. `/batch/`
//! proxies the ingress RPC surface. All RPC calls run under the edge request
//! deadline.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::handlers::{SUBJECT_BATCH_CREATE, SUBJECT_BATCH_STATUS_GET, SUBJECT_GEOCODE};
use crate::services::fingerprint;
use crate::types::{
    BatchRecord, BatchStatusQuery, ErrorResponse, GeocodeResponse, Request, SuccessResponse,
};

use super::requests::{BatchHttpRequest, GeocodeHttpRequest};
use super::EdgeState;

/// Healthcheck - that's all. The body shape is historical.
pub async fn health() -> Response {
    Json(json!({ "error": "no error - up and running - everything ok" })).into_response()
}

/// `POST /geocode/`
pub async fn geocode(State(state): State<EdgeState>, body: Bytes) -> Response {
    let request: GeocodeHttpRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return error_body(StatusCode::UNPROCESSABLE_ENTITY, "invalid request body"),
    };
    let query = match request.into_query() {
        Ok(query) => query,
        Err(e) => {
            return error_body(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("invalid request body: {e}"),
            )
        }
    };

    let key = fingerprint::fingerprint(&query, state.coord_precision);
    let cacheable = state.cache.should_cache(&query);

    if cacheable {
        if let Some(cached) = state.cache.get(&key) {
            match serde_json::from_str::<GeocodeResponse>(&cached) {
                Ok(response) => {
                    info!("cache get successful ({})", key);
                    return (StatusCode::OK, [("x-cache", "hit")], Json(response))
                        .into_response();
                }
                Err(e) => warn!("undecodable cache entry for {}: {}", key, e),
            }
        } else {
            debug!("cache miss; submitting to geocode server");
        }
    }

    let rpc = Request::new(query);
    let payload = match serde_json::to_vec(&rpc) {
        Ok(payload) => payload,
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let reply = match rpc_request(&state, SUBJECT_GEOCODE, payload).await {
        Ok(reply) => reply,
        Err(response) => return response,
    };
    let response: GeocodeResponse = match decode_envelope(&reply) {
        Ok(response) => response,
        Err(response) => return response,
    };

    // best-effort populate; a cache write must never fail the request
    if cacheable {
        if let Ok(canonical) = serde_json::to_string(&response) {
            state.cache.set(key, canonical);
        }
    }

    (StatusCode::OK, [("x-cache", "miss")], Json(response)).into_response()
}

/// `POST /batch/`
pub async fn create_batch(State(state): State<EdgeState>, body: Bytes) -> Response {
    let request: BatchHttpRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return error_body(StatusCode::UNPROCESSABLE_ENTITY, "invalid request body"),
    };
    let submission = match request.into_submission() {
        Ok(submission) => submission,
        Err(e) => {
            return error_body(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("invalid request body: {e}"),
            )
        }
    };

    let rpc = Request::new(submission);
    let payload = match serde_json::to_vec(&rpc) {
        Ok(payload) => payload,
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let reply = match rpc_request(&state, SUBJECT_BATCH_CREATE, payload).await {
        Ok(reply) => reply,
        Err(response) => return response,
    };
    let record: BatchRecord = match decode_envelope(&reply) {
        Ok(record) => record,
        Err(response) => return response,
    };

    Json(record).into_response()
}

/// `GET /batch/{id}`
pub async fn batch_status(State(state): State<EdgeState>, Path(id): Path<String>) -> Response {
    if Uuid::parse_str(&id).is_err() {
        warn!("batch uuid (`id`) not a valid uuid");
        return error_body(
            StatusCode::BAD_REQUEST,
            "invalid request url; expect GET request to `/batch/${batch-uuid}`",
        );
    }

    let rpc = Request::new(BatchStatusQuery { id });
    let payload = match serde_json::to_vec(&rpc) {
        Ok(payload) => payload,
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let reply = match rpc_request(&state, SUBJECT_BATCH_STATUS_GET, payload).await {
        Ok(reply) => reply,
        Err(response) => return response,
    };
    let record: BatchRecord = match decode_envelope(&reply) {
        Ok(record) => record,
        Err(response) => return response,
    };

    Json(record).into_response()
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn http_status_for(code: &str) -> StatusCode {
    match code {
        "INVALID_ARGUMENT" => StatusCode::UNPROCESSABLE_ENTITY,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "DEADLINE_EXCEEDED" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// NATS request/reply under the edge deadline.
async fn rpc_request(
    state: &EdgeState,
    subject: &'static str,
    payload: Vec<u8>,
) -> Result<Vec<u8>, Response> {
    match tokio::time::timeout(
        state.request_timeout,
        state.client.request(subject, payload.into()),
    )
    .await
    {
        Ok(Ok(msg)) => Ok(msg.payload.to_vec()),
        Ok(Err(e)) => {
            error!("rpc call on {} failed: {}", subject, e);
            Err(error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
        Err(_) => {
            error!("rpc call on {} hit the edge deadline", subject);
            let deadline = ServiceError::DeadlineExceeded;
            Err(error_body(
                http_status_for(deadline.code()),
                deadline.to_string(),
            ))
        }
    }
}

/// Decode a reply envelope into its success payload, or translate a service
/// error envelope into the matching HTTP response.
fn decode_envelope<T: DeserializeOwned>(payload: &[u8]) -> Result<T, Response> {
    if let Ok(success) = serde_json::from_slice::<SuccessResponse<T>>(payload) {
        return Ok(success.payload);
    }
    match serde_json::from_slice::<ErrorResponse>(payload) {
        Ok(envelope) => Err(error_body(
            http_status_for(&envelope.error.code),
            envelope.error.message,
        )),
        Err(e) => {
            error!("undecodable rpc reply: {}", e);
            Err(error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "undecodable rpc reply",
            ))
        }
    }
}
