//! Compiled-in defaults for configuration knobs.

/// TTL (seconds) set on successful geocode responses in the edge cache.
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 90;

/// Responses requesting more than this many results bypass the edge cache;
/// large payloads dominate memory for little reuse.
pub const DEFAULT_CACHE_MAX_RESULTS: u32 = 10;

/// Coordinate quantization factor for request fingerprints - six decimal
/// digits, roughly 0.11 m of latitude.
pub const DEFAULT_COORD_PRECISION: u32 = 1_000_000;

/// Context deadline on all edge-originated RPC calls.
pub const DEFAULT_EDGE_REQUEST_TIMEOUT_MS: u64 = 1_000;

/// Deadline on the ingress fire-and-forget persister task.
pub const DEFAULT_BATCH_PERSIST_TIMEOUT_SECS: u64 = 30;

/// Deadline on a single worker batch job.
pub const DEFAULT_WORKER_JOB_TIMEOUT_SECS: u64 = 180;

/// Validity window for presigned result download URLs.
pub const DEFAULT_RESULTS_URL_TTL_SECS: u64 = 60 * 60 * 24;

/// Maximum error for reverse geocoding; only results within this many meters
/// of the query point are considered.
pub const DEFAULT_REV_TOLERANCE_METERS: u32 = 1024;

/// Maximum number of buffered engine writes before the ingest pipeline
/// flushes.
pub const DEFAULT_PIPELINE_DEPTH: usize = 1024;

/// Deadline on a bulk address-ingest call.
pub const DEFAULT_BULK_LOAD_TIMEOUT_SECS: u64 = 180;

/// Entry bound on the edge response cache.
pub const DEFAULT_RESPONSE_CACHE_CAPACITY: u64 = 10_000;

/// Entry bound on the batch status cache. Size for peak in-flight batches
/// times the polling window; evicted records are gone for good.
pub const DEFAULT_STATUS_CACHE_CAPACITY: u64 = 100_000;

/// Retry policy for external-connection boundaries (object storage): high
/// attempt count with aggressive backoff.
pub const RETRY_ATTEMPTS: u32 = 5;
pub const RETRY_MIN_BACKOFF_MS: u64 = 16;
pub const RETRY_MAX_BACKOFF_MS: u64 = 512;
