use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// The ordered stages of one pipeline run. `Failed` is a run state, not a
/// stage; any stage error moves the run there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageKind {
    Validating,
    Vad,
    ProxyAlign,
    Transcribe,
    Diarize,
    Merge,
    SpeakerResolve,
    VoiceprintExtract,
    TitleInfer,
    NotesGenerate,
}

impl StageKind {
    /// Declared execution order. A stage never starts before its predecessor
    /// reported success (or skipped).
    pub const ORDER: [StageKind; 10] = [
        StageKind::Validating,
        StageKind::Vad,
        StageKind::ProxyAlign,
        StageKind::Transcribe,
        StageKind::Diarize,
        StageKind::Merge,
        StageKind::SpeakerResolve,
        StageKind::VoiceprintExtract,
        StageKind::TitleInfer,
        StageKind::NotesGenerate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Validating => "VALIDATING",
            Self::Vad => "VAD",
            Self::ProxyAlign => "PROXY_ALIGN",
            Self::Transcribe => "TRANSCRIBE",
            Self::Diarize => "DIARIZE",
            Self::Merge => "MERGE",
            Self::SpeakerResolve => "SPEAKER_RESOLVE",
            Self::VoiceprintExtract => "VOICEPRINT_EXTRACT",
            Self::TitleInfer => "TITLE_INFER",
            Self::NotesGenerate => "NOTES_GENERATE",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A half-open time range in seconds on the artifact timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn overlap(&self, other: &TimeRange) -> f64 {
        (self.end.min(other.end) - self.start.max(other.start)).max(0.0)
    }
}

/// One transcribed time-range, speaker unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedText {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// One diarized turn: a time range with a provisional label, no identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerTurn {
    pub start: f64,
    pub end: f64,
    pub label: String,
}

impl SpeakerTurn {
    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end,
        }
    }
}

// ── Persisted stage outputs ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateOutput {
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadOutput {
    pub speech: Vec<TimeRange>,
}

/// Speech ranges mapped onto the artifact timeline and clamped to its
/// duration. Downstream stages consume these, never the raw VAD output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyAlignOutput {
    pub speech: Vec<TimeRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeOutput {
    pub segments: Vec<TimedText>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiarizeOutput {
    pub turns: Vec<SpeakerTurn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutput {
    pub segments: Vec<crate::database::TranscriptSegment>,
}

/// Outcome of matching one diarization label against the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelResolution {
    pub label: String,
    pub linked_global_speaker: Option<i64>,
    pub best_score: Option<f32>,
    pub second_best_score: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerResolveOutput {
    pub resolutions: Vec<LabelResolution>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceprintExtractOutput {
    pub stored: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleInferOutput {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotesGenerateOutput {
    pub notes: String,
}

// ── Opaque stage function contracts ────────────────────────────────────────
//
// The inference models behind VAD, transcription, diarization, embedding and
// text generation are external collaborators. Each is a blocking call; the
// runner executes stages on the blocking pool with a per-stage timeout.

pub trait VoiceActivityDetector: Send + Sync {
    fn detect(&self, audio: &Path) -> Result<VadOutput>;
}

pub trait Transcriber: Send + Sync {
    /// `speech` narrows the work to detected speech ranges when VAD ran.
    fn transcribe(&self, audio: &Path, speech: Option<&[TimeRange]>) -> Result<TranscribeOutput>;
}

pub trait Diarizer: Send + Sync {
    fn diarize(&self, audio: &Path) -> Result<DiarizeOutput>;
}

pub trait Embedder: Send + Sync {
    /// Voiceprint for one audio window, as a fixed-dimension vector.
    fn embed(&self, audio: &Path, range: TimeRange) -> Result<Vec<f32>>;
}

pub trait LanguageModel: Send + Sync {
    fn infer_title(&self, transcript: &str) -> Result<String>;
    fn generate_notes(&self, transcript: &str) -> Result<String>;
}

/// The injected model set. An absent optional model skips its stage with an
/// explicit skipped status, exactly like the config flags.
#[derive(Clone)]
pub struct StageModels {
    pub vad: Option<Arc<dyn VoiceActivityDetector>>,
    pub transcriber: Arc<dyn Transcriber>,
    pub diarizer: Option<Arc<dyn Diarizer>>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub llm: Option<Arc<dyn LanguageModel>>,
}
