use serde::{Deserialize, Serialize};
use std::path::Path;

/// Recognized configuration surface. Every field has a default so a partial
/// (or absent) config file is always usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum duration of one capture segment before rolling to the next
    /// file, in seconds.
    pub max_segment_duration_secs: u64,

    /// Upload attempts per segment before it is marked terminally failed.
    pub upload_max_attempts: u32,

    /// Base delay for exponential upload backoff, in seconds.
    pub upload_backoff_base_secs: u64,

    /// Ceiling for the backoff delay, in seconds.
    pub upload_backoff_cap_secs: u64,

    /// Timeout for a single upload attempt (distinct from the retry budget).
    pub upload_attempt_timeout_secs: u64,

    /// Minimum cosine similarity for a speaker match to be considered at all.
    pub similarity_threshold: f32,

    /// Required gap between the best and second-best similarity scores.
    pub similarity_margin: f32,

    /// How many of the longest diarized turns feed the candidate embedding.
    pub top_k_segments: usize,

    /// Turns shorter than this produce unreliable embeddings and are skipped.
    pub min_embed_segment_secs: f64,

    /// Concurrent pipeline runs. Heavy stages are compute-bound; this bounds
    /// them to something the host can actually sustain.
    pub pipeline_workers: usize,

    /// A stage running longer than this is treated as failed (not retried).
    pub stage_timeout_secs: u64,

    /// A queued run that has not started within this window is failed.
    pub queue_timeout_secs: u64,

    /// Optional stages. Disabling one records a SKIPPED status and advances.
    pub enable_vad: bool,
    pub enable_diarization: bool,
    pub enable_title_inference: bool,
    pub enable_notes_generation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_segment_duration_secs: 5 * 60,
            upload_max_attempts: 60,
            upload_backoff_base_secs: 2,
            upload_backoff_cap_secs: 60,
            upload_attempt_timeout_secs: 120,
            similarity_threshold: 0.75,
            similarity_margin: 0.05,
            top_k_segments: 10,
            min_embed_segment_secs: 0.5,
            pipeline_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            stage_timeout_secs: 60 * 60,
            queue_timeout_secs: 20 * 60,
            enable_vad: true,
            enable_diarization: true,
            enable_title_inference: true,
            enable_notes_generation: true,
        }
    }
}

impl Config {
    /// Load from a YAML file, falling back to defaults if the file is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            log::info!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Backoff delay before retry `attempt` (zero-based), exponential with cap.
    pub fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.min(16);
        let secs = self
            .upload_backoff_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.upload_backoff_cap_secs);
        std::time::Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.max_segment_duration_secs, 300);
        assert_eq!(c.upload_max_attempts, 60);
        assert!((c.similarity_threshold - 0.75).abs() < f32::EPSILON);
        assert!((c.similarity_margin - 0.05).abs() < f32::EPSILON);
        assert_eq!(c.top_k_segments, 10);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let c = Config::default();
        assert_eq!(c.backoff_delay(0).as_secs(), 2);
        assert_eq!(c.backoff_delay(1).as_secs(), 4);
        assert_eq!(c.backoff_delay(2).as_secs(), 8);
        // Cap kicks in well before attempt 59
        assert_eq!(c.backoff_delay(10).as_secs(), 60);
        assert_eq!(c.backoff_delay(59).as_secs(), 60);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let parsed: Config = serde_yaml::from_str("upload_max_attempts: 3\n").unwrap();
        assert_eq!(parsed.upload_max_attempts, 3);
        assert_eq!(parsed.max_segment_duration_secs, 300);
    }
}
