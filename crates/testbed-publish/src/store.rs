//! Object storage for experiment results
//!
//! Summaries land under `{experiment}/summary.json` in an S3-compatible
//! bucket. Uploads are plain path-style PUTs, which every in-cluster object
//! store the platform runs (SeaweedFS, MinIO) accepts without signing.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use testbed_common::Error;

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Key of an experiment's summary document
pub fn summary_key(experiment: &str) -> String {
    format!("{}/summary.json", experiment)
}

/// Key of an experiment's raw metrics snapshot
pub fn metrics_snapshot_key(experiment: &str) -> String {
    format!("{}/metrics-snapshot.json", experiment)
}

/// Write-only view of a results bucket
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a JSON document at `key`, replacing any previous object
    async fn put_json(&self, key: &str, body: Vec<u8>) -> Result<(), Error>;

    /// URL under which everything for `experiment` is stored
    fn results_url(&self, experiment: &str) -> String;
}

/// Serialize `value` as indented JSON and store it at `key`
pub async fn put_document<T: Serialize + Sync>(
    store: &dyn ObjectStore,
    key: &str,
    value: &T,
) -> Result<(), Error> {
    let body = serde_json::to_vec_pretty(value)?;
    store.put_json(key, body).await
}

/// S3-compatible bucket reached over HTTP
#[derive(Clone)]
pub struct S3ObjectStore {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
}

impl S3ObjectStore {
    /// Create a store for `bucket` at `endpoint`.
    ///
    /// Endpoints without a scheme are assumed to be plain HTTP.
    pub fn new(endpoint: &str, bucket: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|e| Error::storage(format!("failed to build HTTP client: {}", e)))?;
        let endpoint = endpoint.trim_end_matches('/');
        let endpoint = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("http://{}", endpoint)
        };
        Ok(Self {
            http,
            endpoint,
            bucket: bucket.into(),
        })
    }

    /// Bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_json(&self, key: &str, body: Vec<u8>) -> Result<(), Error> {
        let url = format!("{}/{}/{}", self.endpoint, self.bucket, key);
        let size = body.len();
        let response = self
            .http
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::storage(format!("upload {}: {}", key, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::storage(format!(
                "upload {} returned {}: {}",
                key,
                status.as_u16(),
                text
            )));
        }
        debug!(key, size, "stored object");
        Ok(())
    }

    fn results_url(&self, experiment: &str) -> String {
        format!("s3://{}/{}/", self.bucket, experiment)
    }
}
