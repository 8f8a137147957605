//! Batch ingress and the status-bus mirror
//!
//! `CreateBatch` acknowledges as soon as the status cache records ACCEPTED;
//! persisting the body and emitting the job-ready event happen in a
//! deadline-bounded fire-and-forget task. ACCEPTED means "recorded in the
//! status cache", not "on disk" - subsequent polls observe either forward
//! progress or FAILED.
//!
//! A long-lived listener mirrors every status-bus delta into the status
//! cache. Poison frames are dropped and logged; they never stop the bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use chrono::Utc;
use futures::StreamExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::handlers::{respond, TOPIC_BATCH_CREATES, TOPIC_BATCH_STATUS};
use crate::services::status_cache::{now_rfc3339_nanos, StatusCache, StatusEntry};
use crate::services::storage::BatchStorage;
use crate::types::{
    BatchRecord, BatchStatus, BatchStatusQuery, BatchSubmission, ErrorResponse, Request,
    StatusDelta, SuccessResponse,
};

/// Frame a state transition onto the status bus. The mirror listener stamps
/// the update time when it writes the delta into the cache.
pub async fn publish_status_delta(
    client: &Client,
    id: &str,
    status: BatchStatus,
    download_path: &str,
) -> Result<(), ServiceError> {
    let delta = StatusDelta {
        id: id.to_string(),
        status,
        download_path: download_path.to_string(),
    };
    let frame = minicbor::to_vec(&delta).map_err(|e| ServiceError::Unknown(e.to_string()))?;
    client
        .publish(TOPIC_BATCH_STATUS, frame.into())
        .await
        .map_err(|e| ServiceError::BusPublish {
            topic: TOPIC_BATCH_STATUS.to_string(),
            reason: e.to_string(),
        })?;
    Ok(())
}

pub struct BatchIngress {
    client: Client,
    status_cache: Arc<dyn StatusCache>,
    storage: Arc<dyn BatchStorage>,
    persist_timeout: Duration,
}

impl BatchIngress {
    pub fn new(
        client: Client,
        status_cache: Arc<dyn StatusCache>,
        storage: Arc<dyn BatchStorage>,
        persist_timeout: Duration,
    ) -> Self {
        Self {
            client,
            status_cache,
            storage,
            persist_timeout,
        }
    }

    /// Handle batch creation requests
    pub async fn handle_create(self: Arc<Self>, mut subscriber: Subscriber) -> Result<()> {
        while let Some(msg) = subscriber.next().await {
            let ingress = Arc::clone(&self);
            tokio::spawn(async move { ingress.process_create(msg).await });
        }
        Ok(())
    }

    async fn process_create(self: Arc<Self>, msg: async_nats::Message) {
        let Some(reply) = msg.reply.clone() else {
            return;
        };

        let request: Request<BatchSubmission> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse create batch request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                respond(&self.client, reply, &error).await;
                return;
            }
        };
        let submission = request.payload;

        // schema failure rejects synchronously; nothing has been persisted
        if let Err(e) = submission.validate() {
            warn!("create batch request rejected: {}", e);
            let rejected = BatchRecord::new(Uuid::new_v4().to_string(), BatchStatus::Rejected);
            let error = match serde_json::to_value(&rejected) {
                Ok(details) => {
                    ErrorResponse::from_service_error(request.id, &e).with_details(details)
                }
                Err(_) => ErrorResponse::from_service_error(request.id, &e),
            };
            respond(&self.client, reply, &error).await;
            return;
        }

        let id = Uuid::new_v4().to_string();

        // first thing: mark ACCEPTED so the client can poll immediately; a
        // batch id exists iff this write succeeded
        if let Err(e) = self
            .status_cache
            .set(&id, StatusEntry::new(BatchStatus::Accepted, ""))
            .await
        {
            error!("failed to set ACCEPTED on status cache (batch {}): {}", id, e);
            let unavailable = ServiceError::CacheUnavailable(e.to_string());
            let rejected = BatchRecord::new(id, BatchStatus::Rejected);
            let error = match serde_json::to_value(&rejected) {
                Ok(details) => ErrorResponse::from_service_error(request.id, &unavailable)
                    .with_details(details),
                Err(_) => ErrorResponse::from_service_error(request.id, &unavailable),
            };
            respond(&self.client, reply, &error).await;
            return;
        }
        info!(
            "create batch request accepted ({} inputs, method {}, batch {})",
            submission.len(),
            submission.method,
            id,
        );

        let record = BatchRecord::new(id.clone(), BatchStatus::Accepted);
        let success = SuccessResponse::new(request.id, record);
        respond(&self.client, reply, &success).await;

        // persist and enqueue off the request path
        let ingress = Arc::clone(&self);
        let timeout = self.persist_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, ingress.persist_and_enqueue(&id, &submission)).await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("batch {} failed before enqueue: {}", id, e);
                    ingress.publish_failed(&id).await;
                }
                Err(_) => {
                    error!("batch {} persister hit the {}s deadline", id, timeout.as_secs());
                    ingress.publish_failed(&id).await;
                }
            }
        });
    }

    /// Write the batch body to storage, then announce it on the job-ready
    /// topic. The event is published only after the body is durable.
    async fn persist_and_enqueue(
        &self,
        id: &str,
        submission: &BatchSubmission,
    ) -> Result<(), ServiceError> {
        let body =
            serde_json::to_vec(submission).map_err(|e| ServiceError::Unknown(e.to_string()))?;
        self.storage
            .put(&format!("{id}.json"), body)
            .await
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        info!("batch {} saved to storage", id);

        self.client
            .publish(TOPIC_BATCH_CREATES, id.to_string().into())
            .await
            .map_err(|e| ServiceError::BusPublish {
                topic: TOPIC_BATCH_CREATES.to_string(),
                reason: e.to_string(),
            })?;
        self.client
            .flush()
            .await
            .map_err(|e| ServiceError::BusPublish {
                topic: TOPIC_BATCH_CREATES.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn publish_failed(&self, id: &str) {
        if let Err(e) = publish_status_delta(&self.client, id, BatchStatus::Failed, "").await {
            error!("failed to publish FAILED for batch {}: {}", id, e);
        }
    }

    /// Handle batch status lookups
    pub async fn handle_status_get(self: Arc<Self>, mut subscriber: Subscriber) -> Result<()> {
        while let Some(msg) = subscriber.next().await {
            let ingress = Arc::clone(&self);
            tokio::spawn(async move { ingress.process_status_get(msg).await });
        }
        Ok(())
    }

    async fn process_status_get(self: Arc<Self>, msg: async_nats::Message) {
        let Some(reply) = msg.reply.clone() else {
            return;
        };

        let request: Request<BatchStatusQuery> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse batch status request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                respond(&self.client, reply, &error).await;
                return;
            }
        };
        let id = request.payload.id;

        let entry = match self.status_cache.get(&id).await {
            Ok(entry) => entry,
            Err(e) => {
                error!("failed to get status from batch-cache (batch {}): {}", id, e);
                let unavailable = ServiceError::CacheUnavailable(e.to_string());
                let error = ErrorResponse::from_service_error(request.id, &unavailable);
                respond(&self.client, reply, &error).await;
                return;
            }
        };

        let Some(entry) = entry else {
            info!("get batch status request: batch {} not found", id);
            let error = self.undefined_status_error(request.id, &id);
            respond(&self.client, reply, &error).await;
            return;
        };

        match BatchStatus::parse(&entry.status) {
            Some(status) => {
                info!("get batch status request ok (batch {}, status {})", id, entry.status);
                let update_time = chrono::DateTime::parse_from_rfc3339(&entry.update_time)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                let record = BatchRecord {
                    id,
                    status,
                    download_path: entry.download_path,
                    update_time,
                };
                respond(&self.client, reply, &SuccessResponse::new(request.id, record)).await;
            }
            None => {
                // a half-written record never surfaces as a real status
                warn!("batch {} has unexpected state: {}", id, entry.status);
                let error = self.undefined_status_error(request.id, &id);
                respond(&self.client, reply, &error).await;
            }
        }
    }

    fn undefined_status_error(&self, request_id: Uuid, batch_id: &str) -> ErrorResponse {
        let record = BatchRecord::new(batch_id.to_string(), BatchStatus::Undefined);
        let error = ErrorResponse::from_service_error(request_id, &ServiceError::NotFound);
        match serde_json::to_value(&record) {
            Ok(details) => error.with_details(details),
            Err(_) => error,
        }
    }
}

/// Mirror status-bus deltas into the status cache. Runs for the life of the
/// process; an undecodable frame is dropped, never fatal.
pub async fn run_status_listener(
    mut subscriber: Subscriber,
    status_cache: Arc<dyn StatusCache>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let delta: StatusDelta = match minicbor::decode(&msg.payload) {
            Ok(delta) => delta,
            Err(e) => {
                warn!("dropping undecodable status frame: {}", e);
                continue;
            }
        };

        let entry = StatusEntry {
            status: delta.status.as_str().to_string(),
            download_path: delta.download_path.clone(),
            update_time: now_rfc3339_nanos(),
        };
        if let Err(e) = status_cache.set(&delta.id, entry).await {
            error!(
                "failed to set status on batch-cache (batch {}, status {}): {}",
                delta.id,
                delta.status.as_str(),
                e,
            );
            continue;
        }

        info!(
            "set status {} on batch {} (download path \"{}\")",
            delta.status.as_str(),
            delta.id,
            delta.download_path,
        );
    }

    Ok(())
}
