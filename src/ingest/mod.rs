use crate::audio::concatenate_wavs;
use crate::database::{Database, Recording, RecordingState};
use crate::error::AppError;
use chrono::{Local, Timelike};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Server-side segment store and recording finalizer.
///
/// Segment writes are durable (temp file + rename, acknowledged only after
/// the rename lands) and idempotent per `(recording, sequence)`. Finalization
/// verifies contiguous coverage, concatenates sample-accurately, and is
/// exactly-once.
pub struct IngestStore {
    db: Arc<Database>,
    recordings_dir: PathBuf,
    segments_dir: PathBuf,
}

impl IngestStore {
    pub fn new(db: Arc<Database>, data_dir: &Path) -> Result<Self, AppError> {
        let recordings_dir = data_dir.join("recordings");
        let segments_dir = data_dir.join("segments");
        std::fs::create_dir_all(&recordings_dir)?;
        std::fs::create_dir_all(&segments_dir)?;
        Ok(Self {
            db,
            recordings_dir,
            segments_dir,
        })
    }

    /// Start an upload session. A missing name gets the default meeting name.
    pub fn create_recording(
        &self,
        user_id: &str,
        name: Option<&str>,
    ) -> Result<Recording, AppError> {
        let id = uuid::Uuid::new_v4().to_string();
        let name = match name {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            _ => default_meeting_name(),
        };
        self.db.create_recording(&id, user_id, &name)?;
        std::fs::create_dir_all(self.segment_dir(&id))?;
        log::info!("Created recording {} ('{}') for user {}", id, name, user_id);
        self.db
            .get_recording(&id)?
            .ok_or_else(|| AppError::NotFound(format!("recording {}", id)))
    }

    fn segment_dir(&self, recording_id: &str) -> PathBuf {
        self.segments_dir.join(recording_id)
    }

    fn segment_path(&self, recording_id: &str, sequence: u32) -> PathBuf {
        self.segment_dir(recording_id).join(format!("{}.wav", sequence))
    }

    /// Durably store one segment. Acknowledgment (the Ok return) only happens
    /// after the bytes are synced and renamed into place; a re-upload of the
    /// same sequence replaces the previous payload.
    pub async fn put_segment(
        &self,
        recording_id: &str,
        sequence: u32,
        bytes: &[u8],
    ) -> Result<(), AppError> {
        let recording = self
            .db
            .get_recording(recording_id)?
            .ok_or_else(|| AppError::NotFound(format!("recording {}", recording_id)))?;
        if recording.state != RecordingState::Uploading {
            return Err(AppError::Other(format!(
                "recording {} is not accepting segments (state {})",
                recording_id, recording.state
            )));
        }

        let dir = self.segment_dir(recording_id);
        tokio::fs::create_dir_all(&dir).await?;

        let final_path = self.segment_path(recording_id, sequence);
        let tmp_path = dir.join(format!("{}.wav.part", sequence));

        {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, &final_path).await?;

        self.db.upsert_segment(
            recording_id,
            sequence,
            bytes.len() as i64,
            &final_path.to_string_lossy(),
        )?;

        log::debug!(
            "Stored segment {} of recording {} ({} bytes)",
            sequence,
            recording_id,
            bytes.len()
        );
        Ok(())
    }

    /// Re-register segment files present on disk but missing from the
    /// database (a crash can land between rename and upsert). Filenames are
    /// `{sequence}.wav`.
    pub fn recover_segments(&self, recording_id: &str) -> Result<usize, AppError> {
        let dir = self.segment_dir(recording_id);
        if !dir.exists() {
            return Ok(0);
        }
        let known: std::collections::HashSet<u32> = self
            .db
            .get_segments(recording_id)?
            .into_iter()
            .map(|s| s.sequence)
            .collect();

        let name_re = regex::Regex::new(r"^(\d+)\.wav$").expect("static regex");
        let mut recovered = 0usize;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(caps) = name_re.captures(&file_name) else {
                continue;
            };
            let Ok(sequence) = caps[1].parse::<u32>() else {
                continue;
            };
            if known.contains(&sequence) {
                continue;
            }
            let size = entry.metadata()?.len() as i64;
            self.db.upsert_segment(
                recording_id,
                sequence,
                size,
                &entry.path().to_string_lossy(),
            )?;
            recovered += 1;
        }
        if recovered > 0 {
            log::info!(
                "Recovered {} on-disk segments for recording {}",
                recovered,
                recording_id
            );
        }
        Ok(recovered)
    }

    /// Assemble the recording from its segments and queue it for processing.
    ///
    /// - A gap anywhere in `[0, expected)` fails with a distinct
    ///   incomplete-upload error; nothing is assembled.
    /// - Re-running finalize on an already-finalized recording is a no-op,
    ///   never a re-concatenation.
    pub async fn finalize(
        &self,
        recording_id: &str,
        expected_segments: u32,
    ) -> Result<Recording, AppError> {
        let recording = self
            .db
            .get_recording(recording_id)?
            .ok_or_else(|| AppError::NotFound(format!("recording {}", recording_id)))?;

        match recording.state {
            RecordingState::Uploading => {}
            RecordingState::Recording => {
                return Err(AppError::Other(format!(
                    "recording {} is still capturing",
                    recording_id
                )))
            }
            RecordingState::Failed => {
                return Err(AppError::Other(format!(
                    "recording {} previously failed",
                    recording_id
                )))
            }
            // Exactly-once: already assembled (or further along), nothing to do.
            _ => return Ok(recording),
        }

        if expected_segments == 0 {
            return Err(AppError::IncompleteUpload {
                expected: 0,
                missing: Vec::new(),
            });
        }

        self.recover_segments(recording_id)?;

        let missing = self.db.missing_sequences(recording_id, expected_segments)?;
        if !missing.is_empty() {
            log::warn!(
                "Finalize rejected for {}: missing segments {:?}",
                recording_id,
                missing
            );
            return Err(AppError::IncompleteUpload {
                expected: expected_segments,
                missing,
            });
        }

        let segments = self.db.get_segments(recording_id)?;
        let paths: Vec<PathBuf> = segments
            .iter()
            .take(expected_segments as usize)
            .map(|s| PathBuf::from(&s.path))
            .collect();
        let artifact_path = self.recordings_dir.join(format!("{}.wav", recording_id));

        // hound is synchronous; concatenation of a long recording is real work
        let concat_paths = paths.clone();
        let concat_out = artifact_path.clone();
        let info = tokio::task::spawn_blocking(move || concatenate_wavs(&concat_paths, &concat_out))
            .await
            .map_err(|e| AppError::Other(format!("concatenation task failed: {}", e)))?
            .map_err(|e| AppError::InvalidAudio(format!("{:#}", e)))?;

        let artifact_size = std::fs::metadata(&artifact_path)?.len() as i64;

        let transitioned = self.db.mark_finalized(
            recording_id,
            expected_segments,
            &artifact_path.to_string_lossy(),
            info.duration_seconds,
            artifact_size,
        )?;
        if !transitioned {
            // Lost a finalize race; the winner already enqueued the run.
            log::info!("Recording {} finalized concurrently, no-op", recording_id);
            return self
                .db
                .get_recording(recording_id)?
                .ok_or_else(|| AppError::NotFound(format!("recording {}", recording_id)));
        }

        let run_id = self.db.enqueue_run(recording_id)?;
        log::info!(
            "Recording {} finalized ({:.1}s, {} segments) and queued as run {}",
            recording_id,
            info.duration_seconds,
            expected_segments,
            run_id
        );

        // Segment files served their purpose once the artifact exists.
        if let Err(e) = std::fs::remove_dir_all(self.segment_dir(recording_id)) {
            log::warn!("Failed to clean segment dir for {}: {}", recording_id, e);
        }

        self.db
            .get_recording(recording_id)?
            .ok_or_else(|| AppError::NotFound(format!("recording {}", recording_id)))
    }
}

/// "<Weekday> <time-of-day> Meeting", used when the client starts a session
/// without naming it.
fn default_meeting_name() -> String {
    let now = Local::now();
    let day_name = now.format("%A");
    let hour = now.hour();

    let time_of_day = match hour {
        5..=7 => "Early Morning",
        8..=9 => "Morning",
        10..=11 => "Late Morning",
        12..=13 => "Early Afternoon",
        14..=15 => "Afternoon",
        16 => "Late Afternoon",
        17 => "Early Evening",
        18..=19 => "Evening",
        20 => "Late Evening",
        21..=23 => "Night",
        _ => "Late Night",
    };

    format!("{} {} Meeting", day_name, time_of_day)
}
