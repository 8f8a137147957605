//! HTTP edge
//!
//! Thin public surface over the RPC core: single geocode with a read-through
//! response cache, batch submission, batch status polling and a healthcheck.
//! Every response carries a generated `x-request-id` and a JSON content
//! type.

pub mod requests;
pub mod routes;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Request as HttpRequest};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tracing::{error, info};
use uuid::Uuid;

use crate::services::response_cache::ResponseCache;

/// Shared state for all edge routes.
#[derive(Clone)]
pub struct EdgeState {
    pub client: async_nats::Client,
    pub cache: Arc<ResponseCache>,
    pub coord_precision: u32,
    pub request_timeout: Duration,
}

pub async fn serve(state: EdgeState, host: &str, port: u16) -> Result<()> {
    let app = Router::new()
        .route("/geocode/", post(routes::geocode))
        .route("/batch/", post(routes::create_batch))
        .route("/batch/{id}", get(routes::batch_status))
        .route("/health/", get(routes::health))
        .layer(middleware::from_fn(default_headers_middleware))
        .layer(middleware::from_fn(request_logging_middleware))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("edge listening on {}:{}", host, port);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Default response headers: JSON content type plus a generated request id.
async fn default_headers_middleware(request: HttpRequest<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert("x-request-id", value);
    }
    response
}

/// Request log line with duration, status and the generated request id.
async fn request_logging_middleware(request: HttpRequest<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let status = response.status();
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let duration_ms = started.elapsed().as_millis();

    if status.is_success() {
        info!(
            "request ok ({} {}, status {}, {} ms, request-id {})",
            method,
            path,
            status.as_u16(),
            duration_ms,
            request_id,
        );
    } else {
        error!(
            "request failed ({} {}, status {}, {} ms, request-id {})",
            method,
            path,
            status.as_u16(),
            duration_ms,
            request_id,
        );
    }
    response
}
