//! Configuration management

use std::time::Duration;

use anyhow::Result;

use crate::defaults;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,

    /// HTTP edge listen address
    pub edge_host: String,
    pub edge_port: u16,

    /// Edge response cache: TTL, entry bound, and the max-results ceiling
    /// above which responses are not cached
    pub cache_ttl: Duration,
    pub response_cache_capacity: u64,
    pub cache_max_results: u32,

    /// Coordinate quantization factor for request fingerprints
    pub coord_precision: u32,

    /// Context deadline on edge-originated RPC calls
    pub edge_request_timeout: Duration,

    /// Deadline on the ingress persister task
    pub batch_persist_timeout: Duration,

    /// Deadline on a single worker batch job
    pub worker_job_timeout: Duration,

    /// Validity window for presigned result download URLs
    pub results_url_ttl: Duration,

    /// Reverse geocoding tolerance in meters
    pub rev_tolerance_m: u32,

    /// Buffered engine writes before the ingest pipeline flushes
    pub pipeline_depth: usize,

    /// Deadline on a bulk address-ingest call
    pub bulk_load_timeout: Duration,

    /// Entry bound on the batch status cache
    pub status_cache_capacity: u64,

    /// Deployment environment; `LOCAL` swaps object storage for a directory
    pub environment: String,

    /// Directory used for batch bodies and results when running LOCAL
    pub local_storage_dir: String,

    /// S3-compatible object storage endpoint, region, bucket and key prefix
    pub storage_endpoint: String,
    pub storage_region: String,
    pub storage_bucket: String,
    pub storage_key_prefix: String,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let nats_url = std::env::var("NATS_URL")
            .unwrap_or_else(|_| "nats://localhost:4222".to_string());

        let edge_host = std::env::var("EDGE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let edge_port = env_parsed("EDGE_PORT", 2151u16);

        let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "LOCAL".to_string());

        Ok(Self {
            nats_url,
            edge_host,
            edge_port,
            cache_ttl: Duration::from_secs(env_parsed(
                "CACHE_TTL_SECONDS",
                defaults::DEFAULT_CACHE_TTL_SECONDS,
            )),
            response_cache_capacity: env_parsed(
                "RESPONSE_CACHE_CAPACITY",
                defaults::DEFAULT_RESPONSE_CACHE_CAPACITY,
            ),
            cache_max_results: env_parsed(
                "CACHE_MAX_RESULTS",
                defaults::DEFAULT_CACHE_MAX_RESULTS,
            ),
            coord_precision: env_parsed("COORD_PRECISION", defaults::DEFAULT_COORD_PRECISION),
            edge_request_timeout: Duration::from_millis(env_parsed(
                "EDGE_REQUEST_TIMEOUT_MS",
                defaults::DEFAULT_EDGE_REQUEST_TIMEOUT_MS,
            )),
            batch_persist_timeout: Duration::from_secs(env_parsed(
                "BATCH_PERSIST_TIMEOUT_SECS",
                defaults::DEFAULT_BATCH_PERSIST_TIMEOUT_SECS,
            )),
            worker_job_timeout: Duration::from_secs(env_parsed(
                "WORKER_JOB_TIMEOUT_SECS",
                defaults::DEFAULT_WORKER_JOB_TIMEOUT_SECS,
            )),
            results_url_ttl: Duration::from_secs(env_parsed(
                "RESULTS_URL_TTL_SECS",
                defaults::DEFAULT_RESULTS_URL_TTL_SECS,
            )),
            rev_tolerance_m: env_parsed(
                "REV_TOLERANCE_METERS",
                defaults::DEFAULT_REV_TOLERANCE_METERS,
            ),
            pipeline_depth: env_parsed("PIPELINE_DEPTH", defaults::DEFAULT_PIPELINE_DEPTH),
            bulk_load_timeout: Duration::from_secs(env_parsed(
                "BULK_LOAD_TIMEOUT_SECS",
                defaults::DEFAULT_BULK_LOAD_TIMEOUT_SECS,
            )),
            status_cache_capacity: env_parsed(
                "STATUS_CACHE_CAPACITY",
                defaults::DEFAULT_STATUS_CACHE_CAPACITY,
            ),
            environment,
            local_storage_dir: std::env::var("LOCAL_STORAGE_DIR")
                .unwrap_or_else(|_| "/tmp".to_string()),
            storage_endpoint: std::env::var("SPACES_ENDPOINT")
                .unwrap_or_else(|_| "https://nyc3.digitaloceanspaces.com".to_string()),
            storage_region: std::env::var("SPACES_REGION")
                .unwrap_or_else(|_| "us-east-1".to_string()),
            storage_bucket: std::env::var("SPACES_BUCKET")
                .unwrap_or_else(|_| "gcaas-data-storage".to_string()),
            storage_key_prefix: std::env::var("SPACES_KEY_PREFIX")
                .unwrap_or_else(|_| "datasets/original".to_string()),
        })
    }

    /// True when object storage should be swapped for a local directory.
    pub fn is_local(&self) -> bool {
        self.environment == "LOCAL"
    }
}
