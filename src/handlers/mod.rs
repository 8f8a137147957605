//! NATS message handlers
//!
//! All service roles speak over NATS: request/reply subjects for the RPC
//! surface, pub/sub topics for the batch pipeline. Workers subscribe to the
//! job-ready topic through a queue group, so each event is delivered to at
//! most one worker and lost deliveries are an operational concern, not a
//! protocol one.

pub mod batch;
pub mod geocode;
pub mod mgmt;
pub mod worker;

use std::sync::Arc;

use anyhow::Result;
use async_nats::Client;
use serde::Serialize;
use tokio::select;
use tracing::{error, info};

use crate::config::Config;
use crate::services::geocoding::GeocodeService;
use crate::services::search::SearchEngine;
use crate::services::status_cache::StatusCache;
use crate::services::storage::BatchStorage;

// Request/reply RPC subjects
pub const SUBJECT_GEOCODE: &str = "gcaas.geocode";
pub const SUBJECT_GEOCODE_STREAM: &str = "gcaas.geocode.stream";
pub const SUBJECT_BATCH_CREATE: &str = "gcaas.batch.create";
pub const SUBJECT_BATCH_STATUS_GET: &str = "gcaas.batch.status.get";
pub const SUBJECT_MGMT_ADDRESSES: &str = "gcaas.mgmt.addresses.put";

// Batch pipeline topics
pub const TOPIC_BATCH_CREATES: &str = "gcaas.batch.creates";
pub const TOPIC_BATCH_STATUS: &str = "gcaas.batch.status";

/// Queue group shared by the worker pool on the job-ready topic.
pub const WORKER_QUEUE_GROUP: &str = "batch-workers";

/// Serialize and publish a reply envelope; reply failures are logged, never
/// propagated.
pub(crate) async fn respond<T: Serialize>(client: &Client, reply: async_nats::Subject, body: &T) {
    match serde_json::to_vec(body) {
        Ok(payload) => {
            if let Err(e) = client.publish(reply, payload.into()).await {
                error!("failed to publish reply: {}", e);
            }
        }
        Err(e) => error!("failed to encode reply: {}", e),
    }
}

/// Start all message handlers
pub async fn start_handlers(
    client: Client,
    config: Config,
    engine: Arc<dyn SearchEngine>,
    storage: Arc<dyn BatchStorage>,
    status_cache: Arc<dyn StatusCache>,
) -> Result<()> {
    info!("Starting message handlers...");

    let geocode_service = Arc::new(GeocodeService::new(
        Arc::clone(&engine),
        config.rev_tolerance_m,
    ));
    info!("Geocode service initialized against '{}' engine", engine.name());

    // Subscribe to all subjects
    let geocode_sub = client.subscribe(SUBJECT_GEOCODE).await?;
    let geocode_stream_sub = client.subscribe(SUBJECT_GEOCODE_STREAM).await?;
    let batch_create_sub = client.subscribe(SUBJECT_BATCH_CREATE).await?;
    let batch_status_sub = client.subscribe(SUBJECT_BATCH_STATUS_GET).await?;
    let mgmt_sub = client.subscribe(SUBJECT_MGMT_ADDRESSES).await?;
    let status_mirror_sub = client.subscribe(TOPIC_BATCH_STATUS).await?;
    let jobs_sub = client
        .queue_subscribe(TOPIC_BATCH_CREATES, WORKER_QUEUE_GROUP.to_string())
        .await?;
    info!("Subscribed to NATS subjects");

    let ingress = Arc::new(batch::BatchIngress::new(
        client.clone(),
        Arc::clone(&status_cache),
        Arc::clone(&storage),
        config.batch_persist_timeout,
    ));
    let worker = Arc::new(worker::BatchWorker::new(
        client.clone(),
        storage,
        config.worker_job_timeout,
    ));

    // Clone for each handler
    let client_geocode = client.clone();
    let client_stream = client.clone();
    let client_mgmt = client.clone();
    let service_unary = Arc::clone(&geocode_service);
    let ingress_create = Arc::clone(&ingress);
    let pipeline_depth = config.pipeline_depth;
    let bulk_load_timeout = config.bulk_load_timeout;

    // Spawn handlers
    let geocode_handle = tokio::spawn(async move {
        geocode::handle_geocode(client_geocode, geocode_sub, service_unary).await
    });

    let geocode_stream_handle = tokio::spawn(async move {
        geocode::handle_geocode_stream(client_stream, geocode_stream_sub, geocode_service).await
    });

    let batch_create_handle =
        tokio::spawn(async move { ingress_create.handle_create(batch_create_sub).await });

    let batch_status_handle =
        tokio::spawn(async move { ingress.handle_status_get(batch_status_sub).await });

    let mgmt_handle = tokio::spawn(async move {
        mgmt::handle_address_ingest(client_mgmt, mgmt_sub, engine, pipeline_depth, bulk_load_timeout)
            .await
    });

    let mirror_handle =
        tokio::spawn(async move { batch::run_status_listener(status_mirror_sub, status_cache).await });

    let worker_handle = tokio::spawn(async move { worker.run(jobs_sub).await });

    info!("All handlers started, waiting for messages...");

    // Wait for any handler to finish (which means an error occurred)
    select! {
        result = geocode_handle => {
            error!("Geocode handler finished: {:?}", result);
        }
        result = geocode_stream_handle => {
            error!("Geocode stream handler finished: {:?}", result);
        }
        result = batch_create_handle => {
            error!("Batch create handler finished: {:?}", result);
        }
        result = batch_status_handle => {
            error!("Batch status handler finished: {:?}", result);
        }
        result = mgmt_handle => {
            error!("Management ingest handler finished: {:?}", result);
        }
        result = mirror_handle => {
            error!("Status mirror listener finished: {:?}", result);
        }
        result = worker_handle => {
            error!("Batch worker finished: {:?}", result);
        }
    }

    Ok(())
}
