use crate::error::AppError;
use crate::ingest::IngestStore;
use async_trait::async_trait;
use std::sync::Arc;

/// Transport seam between the upload manager and the ingestion endpoint.
///
/// The production implementation speaks HTTP; the in-process one wires the
/// client directly to an [`IngestStore`] for single-host deployments and
/// tests.
#[async_trait]
pub trait SegmentEndpoint: Send + Sync {
    async fn upload_segment(
        &self,
        recording_id: &str,
        sequence: u32,
        bytes: Vec<u8>,
    ) -> Result<(), AppError>;

    async fn finalize(&self, recording_id: &str, expected_segments: u32)
        -> Result<(), AppError>;
}

/// HTTP transport against the axum ingestion surface.
pub struct HttpEndpoint {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEndpoint {
    pub fn new(base_url: &str, attempt_timeout: std::time::Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .timeout(attempt_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SegmentEndpoint for HttpEndpoint {
    async fn upload_segment(
        &self,
        recording_id: &str,
        sequence: u32,
        bytes: Vec<u8>,
    ) -> Result<(), AppError> {
        let url = format!(
            "{}/recordings/{}/segments/{}",
            self.base_url, recording_id, sequence
        );
        let res = self.client.put(&url).body(bytes).send().await?;

        // Oversized payloads, gateway errors, timeouts: all the same story.
        // Segmentation is the mitigation, not per-status handling.
        if !res.status().is_success() {
            return Err(AppError::Transport(format!(
                "segment upload returned {}",
                res.status()
            )));
        }
        Ok(())
    }

    async fn finalize(
        &self,
        recording_id: &str,
        expected_segments: u32,
    ) -> Result<(), AppError> {
        let url = format!("{}/recordings/{}/finalize", self.base_url, recording_id);
        let res = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "expected_segments": expected_segments }))
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(AppError::Transport(format!(
                "finalize returned {}",
                res.status()
            )));
        }
        Ok(())
    }
}

/// In-process transport: the client side talks straight to the store.
pub struct LocalEndpoint {
    store: Arc<IngestStore>,
}

impl LocalEndpoint {
    pub fn new(store: Arc<IngestStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SegmentEndpoint for LocalEndpoint {
    async fn upload_segment(
        &self,
        recording_id: &str,
        sequence: u32,
        bytes: Vec<u8>,
    ) -> Result<(), AppError> {
        self.store.put_segment(recording_id, sequence, &bytes).await
    }

    async fn finalize(
        &self,
        recording_id: &str,
        expected_segments: u32,
    ) -> Result<(), AppError> {
        self.store
            .finalize(recording_id, expected_segments)
            .await
            .map(|_| ())
    }
}
