//! Address data management
//!
//! Bulk insert-or-replace of engine address documents, used to load and
//! refresh the index. Writes flow through a bounded pipeline that flushes at
//! the configured depth or end-of-stream, under the bulk-load deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use tracing::{error, info};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::handlers::respond;
use crate::services::search::{EngineError, SearchEngine};
use crate::types::{Address, ErrorResponse, IngestSummary, Request, SuccessResponse};

/// Handle bulk address ingest requests
pub async fn handle_address_ingest(
    client: Client,
    mut subscriber: Subscriber,
    engine: Arc<dyn SearchEngine>,
    pipeline_depth: usize,
    deadline: Duration,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let client = client.clone();
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            process_ingest(client, engine, pipeline_depth, deadline, msg).await;
        });
    }

    Ok(())
}

async fn process_ingest(
    client: Client,
    engine: Arc<dyn SearchEngine>,
    pipeline_depth: usize,
    deadline: Duration,
    msg: async_nats::Message,
) {
    let Some(reply) = msg.reply.clone() else {
        return;
    };
    let started = Instant::now();

    let request: Request<Vec<Address>> = match serde_json::from_slice(&msg.payload) {
        Ok(req) => req,
        Err(e) => {
            error!("Failed to parse address ingest request: {}", e);
            let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
            respond(&client, reply, &error).await;
            return;
        }
    };

    match tokio::time::timeout(
        deadline,
        pipelined_upsert(engine, &request.payload, pipeline_depth),
    )
    .await
    {
        Ok(Ok(total)) => {
            info!(
                "data ingest job successful ({} objects written, {} ms)",
                total,
                started.elapsed().as_millis(),
            );
            let summary = IngestSummary {
                success: true,
                total_objects_written: total as u32,
            };
            respond(&client, reply, &SuccessResponse::new(request.id, summary)).await;
        }
        Ok(Err(e)) => {
            error!("data ingest job failed: {}", e);
            let error = ErrorResponse::new(request.id, "INTERNAL", e.to_string());
            respond(&client, reply, &error).await;
        }
        Err(_) => {
            error!("data ingest job hit the {}s deadline", deadline.as_secs());
            let error =
                ErrorResponse::from_service_error(request.id, &ServiceError::DeadlineExceeded);
            respond(&client, reply, &error).await;
        }
    }
}

/// Feed the engine in pipeline segments: at most `depth` documents are
/// buffered before an exec.
async fn pipelined_upsert(
    engine: Arc<dyn SearchEngine>,
    addresses: &[Address],
    depth: usize,
) -> Result<usize, EngineError> {
    let mut total = 0;
    for segment in addresses.chunks(depth.max(1)) {
        total += engine.upsert(segment).await?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::search::MemoryEngine;
    use crate::types::Point;

    fn addresses(n: usize) -> Vec<Address> {
        (0..n)
            .map(|i| Address {
                id: format!("addr-{i}"),
                location: Point::new(40.0, -73.0),
                composite_street: format!("{i} MAIN ST"),
            })
            .collect()
    }

    #[tokio::test]
    async fn pipelined_upsert_writes_every_segment() {
        let engine = Arc::new(MemoryEngine::new());
        let batch = addresses(5);

        // depth 2 forces three flushes: 2 + 2 + 1
        let total = pipelined_upsert(Arc::clone(&engine) as Arc<dyn SearchEngine>, &batch, 2)
            .await
            .unwrap();
        assert_eq!(total, 5);

        let reply = engine.search_text("main st", 10).await.unwrap();
        assert_eq!(reply.total, 5);
    }

    #[tokio::test]
    async fn pipelined_upsert_handles_short_batches() {
        let engine = Arc::new(MemoryEngine::new());
        let total = pipelined_upsert(engine as Arc<dyn SearchEngine>, &addresses(1), 1024)
            .await
            .unwrap();
        assert_eq!(total, 1);
    }
}
