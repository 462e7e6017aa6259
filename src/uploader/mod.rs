pub mod transport;

pub use transport::{HttpEndpoint, LocalEndpoint, SegmentEndpoint};

use crate::audio::CompletedSegment;
use crate::config::Config;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// Finalize gets a small retry budget of its own; the per-segment budget is
/// the configured one.
const FINALIZE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentUploadStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

/// Client-side bookkeeping for one segment's journey to the server.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentUpload {
    pub sequence: u32,
    pub attempts: u32,
    pub status: SegmentUploadStatus,
    /// Local temp file; kept on disk until the server acknowledges, and left
    /// behind on terminal failure so nothing captured is ever lost.
    pub path: std::path::PathBuf,
}

/// What `stop()` reports back to the capture side.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub uploaded: Vec<u32>,
    /// Segments that exhausted their retry budget. Their temp files remain on
    /// local disk. A non-empty list blocks finalization (the server would
    /// reject the gap anyway) and is surfaced distinctly from a
    /// recording-level failure.
    pub failed: Vec<u32>,
    pub finalized: bool,
}

enum UploadCommand {
    Segment(CompletedSegment),
    Stop {
        total_segments: u32,
        done: oneshot::Sender<UploadReport>,
    },
}

/// Hands finished segments to per-recording upload workers.
///
/// Capture and upload run on independent paths: enqueueing never blocks, and
/// all retry waiting happens inside the worker task. One worker per recording
/// keeps uploads strictly ordered; different recordings upload concurrently.
pub struct UploadManager {
    endpoint: Arc<dyn SegmentEndpoint>,
    config: Arc<Config>,
}

impl UploadManager {
    pub fn new(endpoint: Arc<dyn SegmentEndpoint>, config: Arc<Config>) -> Self {
        Self { endpoint, config }
    }

    /// Spawn the sequential upload worker for one recording.
    pub fn start_recording(&self, recording_id: &str) -> RecordingUploader {
        let (tx, rx) = mpsc::unbounded_channel();
        let statuses: Arc<Mutex<BTreeMap<u32, SegmentUpload>>> =
            Arc::new(Mutex::new(BTreeMap::new()));

        let worker = UploadWorker {
            recording_id: recording_id.to_string(),
            endpoint: self.endpoint.clone(),
            config: self.config.clone(),
            statuses: statuses.clone(),
        };
        let handle = tokio::spawn(worker.run(rx));

        RecordingUploader {
            recording_id: recording_id.to_string(),
            tx,
            statuses,
            handle,
        }
    }
}

/// Handle to one recording's upload worker.
pub struct RecordingUploader {
    recording_id: String,
    tx: mpsc::UnboundedSender<UploadCommand>,
    statuses: Arc<Mutex<BTreeMap<u32, SegmentUpload>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl RecordingUploader {
    /// Queue a finished segment. Never blocks the capture path.
    pub fn enqueue(&self, segment: CompletedSegment) {
        {
            let mut statuses = self.statuses.lock().unwrap();
            statuses.insert(
                segment.sequence,
                SegmentUpload {
                    sequence: segment.sequence,
                    attempts: 0,
                    status: SegmentUploadStatus::Pending,
                    path: segment.path.clone(),
                },
            );
        }
        if self.tx.send(UploadCommand::Segment(segment)).is_err() {
            log::error!(
                "Upload worker for {} is gone, segment left on disk",
                self.recording_id
            );
        }
    }

    /// Drain the queue, then finalize with the total segment count. Returns
    /// once every segment reached a terminal state.
    pub async fn stop(self, total_segments: u32) -> UploadReport {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .tx
            .send(UploadCommand::Stop {
                total_segments,
                done: done_tx,
            })
            .is_err()
        {
            log::error!("Upload worker for {} already stopped", self.recording_id);
            return UploadReport {
                uploaded: Vec::new(),
                failed: Vec::new(),
                finalized: false,
            };
        }

        let report = done_rx.await.unwrap_or(UploadReport {
            uploaded: Vec::new(),
            failed: Vec::new(),
            finalized: false,
        });
        let _ = self.handle.await;
        report
    }

    /// Current per-segment upload state, for status surfaces.
    pub fn segment_states(&self) -> Vec<SegmentUpload> {
        self.statuses.lock().unwrap().values().cloned().collect()
    }
}

struct UploadWorker {
    recording_id: String,
    endpoint: Arc<dyn SegmentEndpoint>,
    config: Arc<Config>,
    statuses: Arc<Mutex<BTreeMap<u32, SegmentUpload>>>,
}

impl UploadWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<UploadCommand>) {
        log::info!("Upload worker started for recording {}", self.recording_id);

        while let Some(command) = rx.recv().await {
            match command {
                UploadCommand::Segment(segment) => {
                    // FIFO queue + single worker = strict sequence ordering:
                    // segment N is not attempted until N-1 is terminal.
                    self.upload_with_retry(&segment).await;
                }
                UploadCommand::Stop {
                    total_segments,
                    done,
                } => {
                    let report = self.finish(total_segments).await;
                    let _ = done.send(report);
                    break;
                }
            }
        }

        log::info!("Upload worker stopped for recording {}", self.recording_id);
    }

    fn set_status(&self, sequence: u32, status: SegmentUploadStatus, attempts: u32) {
        let mut statuses = self.statuses.lock().unwrap();
        if let Some(entry) = statuses.get_mut(&sequence) {
            entry.status = status;
            entry.attempts = attempts;
        }
    }

    async fn upload_with_retry(&self, segment: &CompletedSegment) {
        let max_attempts = self.config.upload_max_attempts;
        let attempt_timeout =
            std::time::Duration::from_secs(self.config.upload_attempt_timeout_secs);

        for attempt in 0..max_attempts {
            self.set_status(segment.sequence, SegmentUploadStatus::Uploading, attempt + 1);

            let result = match tokio::fs::read(&segment.path).await {
                Ok(bytes) => {
                    tokio::time::timeout(
                        attempt_timeout,
                        self.endpoint
                            .upload_segment(&self.recording_id, segment.sequence, bytes),
                    )
                    .await
                    .unwrap_or_else(|_| {
                        Err(crate::error::AppError::Transport(format!(
                            "attempt timed out after {}s",
                            attempt_timeout.as_secs()
                        )))
                    })
                }
                Err(e) => Err(crate::error::AppError::Io(e.to_string())),
            };

            match result {
                Ok(()) => {
                    // The temp file is deleted only now, after the server
                    // acknowledged a durable write.
                    if let Err(e) = tokio::fs::remove_file(&segment.path).await {
                        log::warn!("Failed to delete temp file {:?}: {}", segment.path, e);
                    }
                    self.set_status(segment.sequence, SegmentUploadStatus::Uploaded, attempt + 1);
                    log::info!(
                        "Segment {} of {} uploaded (attempt {})",
                        segment.sequence,
                        self.recording_id,
                        attempt + 1
                    );
                    return;
                }
                Err(e) => {
                    // All failure classes are retryable here; bounded
                    // segmentation is what keeps payloads acceptable.
                    if attempt + 1 < max_attempts {
                        let delay = self.config.backoff_delay(attempt);
                        log::warn!(
                            "Segment {} of {} attempt {} failed, retrying in {}s: {}",
                            segment.sequence,
                            self.recording_id,
                            attempt + 1,
                            delay.as_secs(),
                            e
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        log::error!(
                            "Segment {} of {} failed after {} attempts, file preserved at {:?}: {}",
                            segment.sequence,
                            self.recording_id,
                            max_attempts,
                            segment.path,
                            e
                        );
                    }
                }
            }
        }

        self.set_status(segment.sequence, SegmentUploadStatus::Failed, max_attempts);
    }

    async fn finish(&self, total_segments: u32) -> UploadReport {
        let (uploaded, failed) = {
            let statuses = self.statuses.lock().unwrap();
            let uploaded = statuses
                .values()
                .filter(|s| s.status == SegmentUploadStatus::Uploaded)
                .map(|s| s.sequence)
                .collect::<Vec<_>>();
            let failed = statuses
                .values()
                .filter(|s| s.status == SegmentUploadStatus::Failed)
                .map(|s| s.sequence)
                .collect::<Vec<_>>();
            (uploaded, failed)
        };

        if !failed.is_empty() {
            // Terminal segment failures block finalization; the server would
            // reject the gap. Surfaced as per-segment state, not a
            // recording-level failure.
            log::error!(
                "Recording {} has {} terminally failed segment(s), skipping finalize",
                self.recording_id,
                failed.len()
            );
            return UploadReport {
                uploaded,
                failed,
                finalized: false,
            };
        }

        for attempt in 0..FINALIZE_ATTEMPTS {
            match self
                .endpoint
                .finalize(&self.recording_id, total_segments)
                .await
            {
                Ok(()) => {
                    log::info!("Recording {} finalized", self.recording_id);
                    return UploadReport {
                        uploaded,
                        failed,
                        finalized: true,
                    };
                }
                Err(e) if attempt + 1 < FINALIZE_ATTEMPTS => {
                    let delay = self.config.backoff_delay(attempt);
                    log::warn!(
                        "Finalize of {} failed, retrying in {}s: {}",
                        self.recording_id,
                        delay.as_secs(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    log::error!("Finalize of {} failed: {}", self.recording_id, e);
                }
            }
        }

        UploadReport {
            uploaded,
            failed,
            finalized: false,
        }
    }
}
