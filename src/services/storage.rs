//! Batch object storage
//!
//! Batch bodies (`{id}.json`) and results (`{id}-results.json`) live in an
//! S3-compatible bucket under a fixed key prefix. When the environment
//! declares local execution the bucket is swapped for a directory and the
//! download path becomes a file path - a pure substitution at the storage
//! boundary.
//!
//! The remote backend signs requests with AWS SigV4 and issues presigned,
//! time-limited GET URLs for result downloads. Transient request failures are
//! retried with exponential backoff.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::defaults;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage request failed: {0}")]
    Request(String),

    #[error("storage returned status {0}")]
    Status(u16),

    #[error("storage credentials missing: {0}")]
    Credentials(String),
}

#[async_trait]
pub trait BatchStorage: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// A time-limited URL (or local path) from which the object can be read.
    async fn download_url(&self, key: &str) -> Result<String, StorageError>;

    fn name(&self) -> &'static str;
}

/// Select the storage backend: a local directory under `ENVIRONMENT=LOCAL`,
/// the Spaces bucket otherwise.
pub fn create_storage(config: &Config) -> anyhow::Result<Arc<dyn BatchStorage>> {
    if config.is_local() {
        info!("Using LocalStorage at {}", config.local_storage_dir);
        Ok(Arc::new(LocalStorage::new(&config.local_storage_dir)))
    } else {
        let storage = SpacesStorage::from_env(config)?;
        info!(
            "Using SpacesStorage bucket {} at {}",
            config.storage_bucket, config.storage_endpoint
        );
        Ok(Arc::new(storage))
    }
}

// ==========================================================================
// LocalStorage Implementation
// ==========================================================================

/// Directory-backed storage for local execution.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BatchStorage for LocalStorage {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.root.join(key), body).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        Ok(tokio::fs::read(self.root.join(key)).await?)
    }

    async fn download_url(&self, key: &str) -> Result<String, StorageError> {
        Ok(self.root.join(key).display().to_string())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

// ==========================================================================
// SpacesStorage Implementation
// ==========================================================================

/// S3-compatible object storage client with SigV4 request signing.
pub struct SpacesStorage {
    client: reqwest::Client,
    scheme: String,
    /// virtual-hosted bucket host, e.g. `bucket.nyc3.digitaloceanspaces.com`
    host: String,
    region: String,
    key_prefix: String,
    access_key: String,
    secret_key: String,
    url_ttl: Duration,
}

impl SpacesStorage {
    /// Build from configuration plus `DO_SPACES_KEY` / `DO_SPACES_SECRET`.
    pub fn from_env(config: &Config) -> Result<Self, StorageError> {
        let access_key = std::env::var("DO_SPACES_KEY")
            .map_err(|_| StorageError::Credentials("DO_SPACES_KEY not set".to_string()))?;
        let secret_key = std::env::var("DO_SPACES_SECRET")
            .map_err(|_| StorageError::Credentials("DO_SPACES_SECRET not set".to_string()))?;

        Ok(Self::with_config(
            &config.storage_endpoint,
            &config.storage_region,
            &config.storage_bucket,
            &config.storage_key_prefix,
            access_key,
            secret_key,
            config.results_url_ttl,
        ))
    }

    pub fn with_config(
        endpoint: &str,
        region: &str,
        bucket: &str,
        key_prefix: &str,
        access_key: String,
        secret_key: String,
        url_ttl: Duration,
    ) -> Self {
        let endpoint = endpoint.trim_end_matches('/');
        let (scheme, endpoint_host) = endpoint
            .split_once("://")
            .unwrap_or(("https", endpoint));

        Self {
            client: reqwest::Client::new(),
            scheme: scheme.to_string(),
            host: format!("{bucket}.{endpoint_host}"),
            region: region.to_string(),
            key_prefix: key_prefix.trim_matches('/').to_string(),
            access_key,
            secret_key,
            url_ttl,
        }
    }

    /// URI-encoded object path under the fixed key prefix.
    fn object_path(&self, key: &str) -> String {
        let mut path = String::new();
        for segment in self.key_prefix.split('/').chain(std::iter::once(key)) {
            if segment.is_empty() {
                continue;
            }
            path.push('/');
            path.push_str(&urlencoding::encode(segment));
        }
        path
    }

    /// SigV4 key derivation chain for the given calendar date.
    fn signing_key(&self, date: &str) -> Vec<u8> {
        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        hmac_sha256(&k_service, b"aws4_request")
    }

    async fn send_signed(
        &self,
        method: reqwest::Method,
        key: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, StorageError> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let path = self.object_path(key);
        let payload_hash = sha256_hex(&body);
        let scope = format!("{}/{}/s3/aws4_request", date, self.region);

        let canonical_request = format!(
            "{}\n{}\n\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\nhost;x-amz-content-sha256;x-amz-date\n{}",
            method.as_str(),
            path,
            self.host,
            payload_hash,
            amz_date,
            payload_hash,
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes()),
        );
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&date),
            string_to_sign.as_bytes(),
        ));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature={}",
            self.access_key, scope, signature,
        );

        let url = format!("{}://{}{}", self.scheme, self.host, path);
        let response = self
            .client
            .request(method, &url)
            .header("authorization", authorization)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Status(status.as_u16()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// SigV4 query-string presigned GET URL, valid for the configured TTL
    /// starting at `now`.
    fn presigned_get_url(&self, key: &str, now: DateTime<Utc>) -> String {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/s3/aws4_request", date, self.region);
        let credential = format!("{}/{}", self.access_key, scope);
        let path = self.object_path(key);

        // parameters are already in canonical (sorted) order
        let canonical_query = format!(
            "X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Credential={}&X-Amz-Date={}&X-Amz-Expires={}&X-Amz-SignedHeaders=host",
            urlencoding::encode(&credential),
            amz_date,
            self.url_ttl.as_secs(),
        );
        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            path, canonical_query, self.host,
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes()),
        );
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&date),
            string_to_sign.as_bytes(),
        ));

        format!(
            "{}://{}{}?{}&X-Amz-Signature={}",
            self.scheme, self.host, path, canonical_query, signature,
        )
    }
}

#[async_trait]
impl BatchStorage for SpacesStorage {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        with_backoff("storage put", || {
            self.send_signed(reqwest::Method::PUT, key, body.clone())
        })
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        with_backoff("storage get", || {
            self.send_signed(reqwest::Method::GET, key, Vec::new())
        })
        .await
    }

    async fn download_url(&self, key: &str) -> Result<String, StorageError> {
        Ok(self.presigned_get_url(key, Utc::now()))
    }

    fn name(&self) -> &'static str {
        "spaces"
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Retry with exponential backoff: high attempt count, aggressive backoff
/// window.
async fn with_backoff<T, F, Fut>(op: &str, mut call: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StorageError>>,
{
    let mut backoff = Duration::from_millis(defaults::RETRY_MIN_BACKOFF_MS);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= defaults::RETRY_ATTEMPTS {
                    return Err(e);
                }
                warn!("{} attempt {} failed: {}; retrying in {:?}", op, attempt, e, backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_millis(defaults::RETRY_MAX_BACKOFF_MS));
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_storage_round_trips_objects() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        storage
            .put("batch-1.json", b"{\"addresses\":[]}".to_vec())
            .await
            .unwrap();
        let body = storage.get("batch-1.json").await.unwrap();
        assert_eq!(body, b"{\"addresses\":[]}");
    }

    #[tokio::test]
    async fn local_download_url_is_the_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        let url = storage.download_url("batch-1-results.json").await.unwrap();
        assert_eq!(
            url,
            dir.path().join("batch-1-results.json").display().to_string()
        );
    }

    #[tokio::test]
    async fn local_get_of_missing_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert!(storage.get("absent.json").await.is_err());
    }

    fn spaces_fixture() -> SpacesStorage {
        SpacesStorage::with_config(
            "https://nyc3.digitaloceanspaces.com",
            "us-east-1",
            "gcaas-data-storage",
            "datasets/original",
            "AKIDEXAMPLE".to_string(),
            "secret".to_string(),
            Duration::from_secs(defaults::DEFAULT_RESULTS_URL_TTL_SECS),
        )
    }

    #[test]
    fn object_paths_are_prefixed_and_encoded() {
        let storage = spaces_fixture();
        assert_eq!(
            storage.object_path("abc-results.json"),
            "/datasets/original/abc-results.json"
        );
        assert_eq!(
            storage.object_path("with space.json"),
            "/datasets/original/with%20space.json"
        );
    }

    #[test]
    fn presigned_urls_carry_the_sigv4_query_contract() {
        let storage = spaces_fixture();
        let now = DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let url = storage.presigned_get_url("abc-results.json", now);

        assert!(url.starts_with(
            "https://gcaas-data-storage.nyc3.digitaloceanspaces.com/datasets/original/abc-results.json?"
        ));
        assert!(url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains("X-Amz-Date=20260801T120000Z"));
        assert!(url.contains("X-Amz-Expires=86400"));
        assert!(url.contains("X-Amz-SignedHeaders=host"));
        assert!(url.contains(
            "X-Amz-Credential=AKIDEXAMPLE%2F20260801%2Fus-east-1%2Fs3%2Faws4_request"
        ));

        let signature = url.split("X-Amz-Signature=").nth(1).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn presigned_urls_are_deterministic_for_a_fixed_instant() {
        let storage = spaces_fixture();
        let now = DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(
            storage.presigned_get_url("abc.json", now),
            storage.presigned_get_url("abc.json", now)
        );
    }

    #[tokio::test]
    async fn backoff_returns_the_final_error_after_exhaustion() {
        let started = std::time::Instant::now();
        let result: Result<(), StorageError> = with_backoff("test op", || async {
            Err(StorageError::Status(503))
        })
        .await;

        assert!(matches!(result, Err(StorageError::Status(503))));
        // four sleeps: 16 + 32 + 64 + 128 ms
        assert!(started.elapsed() >= Duration::from_millis(240));
    }
}
