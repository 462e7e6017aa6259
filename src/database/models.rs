use serde::{Deserialize, Serialize};

/// Lifecycle of a recording from first capture to finished pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingState {
    Recording,
    Uploading,
    Finalized,
    Processing,
    Complete,
    Failed,
}

impl std::fmt::Display for RecordingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recording => write!(f, "RECORDING"),
            Self::Uploading => write!(f, "UPLOADING"),
            Self::Finalized => write!(f, "FINALIZED"),
            Self::Processing => write!(f, "PROCESSING"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl From<String> for RecordingState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "RECORDING" => Self::Recording,
            "UPLOADING" => Self::Uploading,
            "FINALIZED" => Self::Finalized,
            "PROCESSING" => Self::Processing,
            "COMPLETE" => Self::Complete,
            "FAILED" => Self::Failed,
            _ => Self::Uploading,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub state: RecordingState,
    pub created_at: String,
    /// Known only once the client signals stop.
    pub expected_segments: Option<u32>,
    /// Set when the finalizer has assembled the artifact.
    pub audio_path: Option<String>,
    pub duration_seconds: Option<f64>,
    pub file_size_bytes: Option<i64>,
    pub title: Option<String>,
    pub notes: Option<String>,
}

/// A segment as received by the ingestion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedSegment {
    pub recording_id: String,
    pub sequence: u32,
    pub byte_size: i64,
    pub path: String,
    pub received_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Complete,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl From<String> for RunState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "complete" => Self::Complete,
            "failed" => Self::Failed,
            _ => Self::Queued,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: i64,
    pub recording_id: String,
    pub state: RunState,
    pub current_stage: Option<String>,
    pub queued_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub error_stage: Option<String>,
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Complete,
    Skipped,
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl From<String> for StageStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "complete" => Self::Complete,
            "skipped" => Self::Skipped,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Persisted result of one stage of one run. The resume point after a crash
/// or explicit retry is the first row that is neither complete nor skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub run_id: i64,
    pub stage: String,
    pub status: StageStatus,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub output_json: Option<String>,
    pub error_detail: Option<String>,
}

/// One attributed line of the merged transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    /// Provisional diarization label, e.g. `SPEAKER_01`.
    pub speaker: String,
    pub source: String,
}

/// A user-scoped, cross-recording speaker identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSpeaker {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub created_at: String,
}

/// A voiceprint owned by a global speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerEmbedding {
    pub id: i64,
    pub global_speaker_id: i64,
    pub vector: Vec<f32>,
}

/// A speaker label local to one recording, optionally linked to a
/// GlobalSpeaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSpeaker {
    pub id: i64,
    pub recording_id: String,
    pub diarization_label: String,
    pub name: String,
    pub global_speaker_id: Option<i64>,
    pub embedding: Option<Vec<f32>>,
}
