//! Batch worker pool
//!
//! Long-lived queue-group subscribers of the job-ready topic. Each job runs
//! the fetch -> geocode -> persist -> presign -> publish state machine in its
//! own task under the job deadline. A failed step publishes FAILED and
//! stops; per-query emptiness is recorded in the result slot and is never a
//! batch-level failure.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use tracing::{error, info, warn};

use crate::errors::ServiceError;
use crate::handlers::batch::publish_status_delta;
use crate::handlers::SUBJECT_GEOCODE_STREAM;
use crate::services::storage::BatchStorage;
use crate::types::{
    BatchStatus, BatchSubmission, GeocodeQuery, GeocodeResponse, Method, ResolvedAddress,
    ResolvedBatch,
};

pub struct BatchWorker {
    client: Client,
    storage: Arc<dyn BatchStorage>,
    job_timeout: Duration,
}

impl BatchWorker {
    pub fn new(client: Client, storage: Arc<dyn BatchStorage>, job_timeout: Duration) -> Self {
        Self {
            client,
            storage,
            job_timeout,
        }
    }

    /// Receive job-ready events and spawn one bounded task per job.
    pub async fn run(self: Arc<Self>, mut subscriber: Subscriber) -> Result<()> {
        while let Some(msg) = subscriber.next().await {
            let id = String::from_utf8_lossy(&msg.payload).to_string();
            if id.is_empty() {
                warn!("dropping empty job-ready payload");
                continue;
            }
            info!("worker picked up batch {}", id);

            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                match tokio::time::timeout(worker.job_timeout, worker.process(&id)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("batch {} failed: {}", id, e);
                        worker.publish_failed(&id).await;
                    }
                    Err(_) => {
                        error!(
                            "batch {} hit the {}s job deadline",
                            id,
                            worker.job_timeout.as_secs(),
                        );
                        worker.publish_failed(&id).await;
                    }
                }
            });
        }

        Ok(())
    }

    /// The per-job state machine. Errors bubble to `run`, which publishes
    /// the terminal FAILED.
    async fn process(&self, id: &str) -> Result<(), ServiceError> {
        // picked up; a lost transition here is log-only
        if let Err(e) = publish_status_delta(&self.client, id, BatchStatus::InQueue, "").await {
            warn!("failed to publish IN_QUEUE for batch {}: {}", id, e);
        }

        let base_key = format!("{id}.json");
        let results_key = format!("{id}-results.json");

        let body = self
            .storage
            .get(&base_key)
            .await
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let submission: BatchSubmission = serde_json::from_slice(&body)
            .map_err(|e| ServiceError::Unknown(format!("undecodable batch body: {e}")))?;

        if let Err(e) = publish_status_delta(&self.client, id, BatchStatus::InProgress, "").await {
            warn!("failed to publish IN_PROGRESS for batch {}: {}", id, e);
        }

        let resolved = self.stream_geocode(&submission).await?;

        let results =
            serde_json::to_vec(&resolved).map_err(|e| ServiceError::Unknown(e.to_string()))?;
        self.storage
            .put(&results_key, results)
            .await
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let download_path = self
            .storage
            .download_url(&results_key)
            .await
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        if let Err(e) =
            publish_status_delta(&self.client, id, BatchStatus::Success, &download_path).await
        {
            error!("failed to publish SUCCESS for batch {}: {}", id, e);
            return Ok(());
        }
        info!("batch {} complete, results at {}", id, download_path);
        Ok(())
    }

    async fn publish_failed(&self, id: &str) {
        if let Err(e) = publish_status_delta(&self.client, id, BatchStatus::Failed, "").await {
            error!("failed to publish FAILED for batch {}: {}", id, e);
        }
    }

    /// Fan the batch out over the streaming geocode subject and reassemble
    /// responses into submission order via their echoed queries.
    async fn stream_geocode(
        &self,
        submission: &BatchSubmission,
    ) -> Result<ResolvedBatch, ServiceError> {
        let queries = batch_queries(submission);
        let mut assembler = ResultAssembler::new(&queries);

        let inbox = self.client.new_inbox();
        let mut responses = self
            .client
            .subscribe(inbox.clone())
            .await
            .map_err(|e| ServiceError::Engine(e.to_string()))?;

        for query in &queries {
            let payload =
                serde_json::to_vec(query).map_err(|e| ServiceError::Unknown(e.to_string()))?;
            self.client
                .publish_with_reply(SUBJECT_GEOCODE_STREAM, inbox.clone(), payload.into())
                .await
                .map_err(|e| ServiceError::BusPublish {
                    topic: SUBJECT_GEOCODE_STREAM.to_string(),
                    reason: e.to_string(),
                })?;
        }
        self.client
            .flush()
            .await
            .map_err(|e| ServiceError::BusPublish {
                topic: SUBJECT_GEOCODE_STREAM.to_string(),
                reason: e.to_string(),
            })?;

        while !assembler.is_complete() {
            let Some(msg) = responses.next().await else {
                return Err(ServiceError::Engine("geocode stream closed early".to_string()));
            };
            let response: GeocodeResponse = serde_json::from_slice(&msg.payload)
                .map_err(|_| ServiceError::Engine("malformed stream response".to_string()))?;
            assembler.accept(response)?;
        }

        assembler.finish()
    }
}

/// One geocode query per batch input, in submission order. Workers ask for a
/// single best match per input.
fn batch_queries(submission: &BatchSubmission) -> Vec<GeocodeQuery> {
    match submission.method {
        Method::FwdFuzzy => submission
            .addresses
            .iter()
            .map(|address| GeocodeQuery::forward(address.clone(), 1))
            .collect(),
        Method::RevNearest => submission
            .points
            .iter()
            .map(|point| GeocodeQuery::reverse(*point, 1))
            .collect(),
    }
}

/// Pairs interleaved stream responses back to their request ordinals via the
/// echoed query. Duplicate queries consume their slots in send order.
struct ResultAssembler {
    slots: Vec<Option<ResolvedAddress>>,
    pending: HashMap<String, VecDeque<usize>>,
    received: usize,
}

impl ResultAssembler {
    fn new(queries: &[GeocodeQuery]) -> Self {
        let mut pending: HashMap<String, VecDeque<usize>> = HashMap::new();
        for (ordinal, query) in queries.iter().enumerate() {
            pending
                .entry(query.query_string())
                .or_default()
                .push_back(ordinal);
        }
        Self {
            slots: vec![None; queries.len()],
            pending,
            received: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    fn accept(&mut self, response: GeocodeResponse) -> Result<(), ServiceError> {
        let Some(echo) = response.query.clone() else {
            return Err(ServiceError::Engine(
                "stream response missing query echo".to_string(),
            ));
        };
        let Some(ordinal) = self.pending.get_mut(&echo).and_then(VecDeque::pop_front) else {
            warn!("dropping unmatched stream response for query \"{}\"", echo);
            return Ok(());
        };

        self.slots[ordinal] = Some(ResolvedAddress {
            query: echo,
            result: response.results.into_iter().next().map(|scored| scored.address),
        });
        self.received += 1;
        Ok(())
    }

    fn finish(self) -> Result<ResolvedBatch, ServiceError> {
        let batch = self
            .slots
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| ServiceError::Engine("incomplete result assembly".to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResolvedBatch { batch })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, Point, ScoredAddress};

    fn scored(id: &str, street: &str) -> ScoredAddress {
        ScoredAddress {
            address: Address {
                id: id.to_string(),
                location: Point::new(40.0, -73.0),
                composite_street: street.to_string(),
            },
            full_street: street.to_string(),
            normed_confidence: 1.0,
        }
    }

    fn response(query: &str, results: Vec<ScoredAddress>) -> GeocodeResponse {
        GeocodeResponse {
            num_results: results.len() as u32,
            results,
            query: Some(query.to_string()),
        }
    }

    #[test]
    fn forward_batches_expand_to_single_result_queries() {
        let submission = BatchSubmission {
            method: Method::FwdFuzzy,
            addresses: vec!["A ST".into(), "B AVE".into()],
            points: vec![],
        };
        let queries = batch_queries(&submission);

        assert_eq!(queries.len(), 2);
        assert!(queries.iter().all(|q| q.max_results == 1));
        assert_eq!(queries[0].query_string(), "A ST");
        assert_eq!(queries[1].query_string(), "B AVE");
    }

    #[test]
    fn reverse_batches_expand_in_point_order() {
        let submission = BatchSubmission {
            method: Method::RevNearest,
            addresses: vec![],
            points: vec![Point::new(40.0, -73.0), Point::new(41.0, -72.0)],
        };
        let queries = batch_queries(&submission);

        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].method, Method::RevNearest);
        assert_ne!(queries[0].query_string(), queries[1].query_string());
    }

    #[test]
    fn assembler_pairs_out_of_order_responses_to_their_slots() {
        let queries = vec![
            GeocodeQuery::forward("A ST", 1),
            GeocodeQuery::forward("B AVE", 1),
        ];
        let mut assembler = ResultAssembler::new(&queries);

        // responses interleave: B before A
        assembler
            .accept(response("B AVE", vec![scored("B1", "B AVE")]))
            .unwrap();
        assembler
            .accept(response("A ST", vec![scored("A1", "A ST")]))
            .unwrap();
        assert!(assembler.is_complete());

        let resolved = assembler.finish().unwrap();
        assert_eq!(resolved.batch[0].result.as_ref().unwrap().id, "A1");
        assert_eq!(resolved.batch[1].result.as_ref().unwrap().id, "B1");
    }

    #[test]
    fn duplicate_queries_fill_slots_in_send_order() {
        let queries = vec![
            GeocodeQuery::forward("A ST", 1),
            GeocodeQuery::forward("A ST", 1),
        ];
        let mut assembler = ResultAssembler::new(&queries);

        assembler
            .accept(response("A ST", vec![scored("A1", "A ST")]))
            .unwrap();
        assembler
            .accept(response("A ST", vec![scored("A1", "A ST")]))
            .unwrap();

        let resolved = assembler.finish().unwrap();
        assert_eq!(resolved.batch.len(), 2);
        assert!(resolved.batch.iter().all(|r| r.result.is_some()));
    }

    #[test]
    fn empty_results_keep_the_query_and_leave_the_slot_empty() {
        let queries = vec![GeocodeQuery::forward("NOWHERE LN", 1)];
        let mut assembler = ResultAssembler::new(&queries);

        assembler.accept(response("NOWHERE LN", vec![])).unwrap();

        let resolved = assembler.finish().unwrap();
        assert_eq!(resolved.batch[0].query, "NOWHERE LN");
        assert!(resolved.batch[0].result.is_none());
    }

    #[test]
    fn responses_without_an_echo_are_a_stream_error() {
        let queries = vec![GeocodeQuery::forward("A ST", 1)];
        let mut assembler = ResultAssembler::new(&queries);

        let mut bad = response("A ST", vec![]);
        bad.query = None;
        assert!(assembler.accept(bad).is_err());
    }

    #[test]
    fn unmatched_responses_are_dropped_without_filling_slots() {
        let queries = vec![GeocodeQuery::forward("A ST", 1)];
        let mut assembler = ResultAssembler::new(&queries);

        assembler.accept(response("UNSENT QUERY", vec![])).unwrap();
        assert!(!assembler.is_complete());

        let err = assembler.finish().unwrap_err();
        assert!(matches!(err, ServiceError::Engine(_)));
    }
}
