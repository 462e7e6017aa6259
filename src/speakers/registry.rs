use crate::database::{Database, GlobalSpeaker, RecordingSpeaker};
use crate::error::AppError;
use crate::pipeline::merge::UNKNOWN_SPEAKER;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The shared, mutable global speaker registry.
///
/// All matching and merge operations for one user are serialized through a
/// per-user async lock: two concurrent pipeline runs for the same user must
/// never both decide "no match, create new" for the same new voice. Callers
/// that batch several decisions (the resolution stage) hold the lock for the
/// whole batch via [`SpeakerRegistry::user_lock`].
pub struct SpeakerRegistry {
    db: Arc<Database>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SpeakerRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The serialization lock for one user's registry.
    pub fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Score a candidate voiceprint against every global speaker of one
    /// user, best first. Read-only; acceptance rules live in
    /// [`crate::speakers::evaluate_match`].
    pub fn match_candidates(
        &self,
        user_id: &str,
        embedding: &[f32],
    ) -> Result<Vec<(GlobalSpeaker, f32)>, AppError> {
        let voiceprints = self.db.get_user_voiceprints(user_id)?;
        let mut scored: Vec<(GlobalSpeaker, f32)> = voiceprints
            .into_iter()
            .filter_map(|(speaker, vectors)| {
                vectors
                    .iter()
                    .map(|v| crate::speakers::cosine_similarity(embedding, v))
                    .fold(None::<f32>, |acc, s| Some(acc.map_or(s, |a| a.max(s))))
                    .map(|score| (speaker, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored)
    }

    /// A RecordingSpeaker is already represented globally if it carries an
    /// explicit link OR its display name exactly matches an existing
    /// GlobalSpeaker for the same user. Both checks always apply; this single
    /// predicate is what keeps the two code paths from diverging.
    pub fn is_represented(&self, speaker: &RecordingSpeaker, user_id: &str) -> Result<bool, AppError> {
        if speaker.global_speaker_id.is_some() {
            return Ok(true);
        }
        Ok(self
            .db
            .get_global_speaker_by_name(user_id, &speaker.name)?
            .is_some())
    }

    /// Create a GlobalSpeaker from a renamed RecordingSpeaker and link it.
    /// Guarded by [`is_represented`] so a name collision links to the
    /// existing identity instead of minting a duplicate.
    pub async fn promote_to_global(
        &self,
        user_id: &str,
        recording_speaker_id: i64,
    ) -> Result<GlobalSpeaker, AppError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let speaker = self
            .db
            .get_recording_speaker(recording_speaker_id)?
            .ok_or_else(|| AppError::NotFound(format!("recording speaker {}", recording_speaker_id)))?;

        if speaker.name == UNKNOWN_SPEAKER {
            return Err(AppError::Other(
                "cannot create a global speaker named UNKNOWN".to_string(),
            ));
        }

        if let Some(global_id) = speaker.global_speaker_id {
            let existing = self
                .db
                .get_global_speaker(global_id)?
                .ok_or_else(|| AppError::NotFound(format!("global speaker {}", global_id)))?;
            return Ok(existing);
        }

        // Name match counts as already represented: link, don't duplicate.
        if let Some(existing) = self.db.get_global_speaker_by_name(user_id, &speaker.name)? {
            self.db.link_recording_speaker(speaker.id, existing.id)?;
            log::info!(
                "Speaker '{}' already exists for user {}, linked instead of creating",
                speaker.name,
                user_id
            );
            return Ok(existing);
        }

        let global_id = self.db.create_global_speaker(user_id, &speaker.name)?;
        self.db.link_recording_speaker(speaker.id, global_id)?;
        if let Some(ref embedding) = speaker.embedding {
            self.db.add_speaker_embedding(global_id, embedding)?;
        }
        log::info!("Created global speaker '{}' ({})", speaker.name, global_id);

        self.db
            .get_global_speaker(global_id)?
            .ok_or_else(|| AppError::NotFound(format!("global speaker {}", global_id)))
    }

    /// Merge global speakers: links and voiceprints of the sources move to
    /// the target, then the sources are removed.
    pub async fn merge_global(
        &self,
        user_id: &str,
        target_id: i64,
        source_ids: &[i64],
    ) -> Result<GlobalSpeaker, AppError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let target = self
            .db
            .get_global_speaker(target_id)?
            .ok_or_else(|| AppError::NotFound(format!("global speaker {}", target_id)))?;
        for &source_id in source_ids {
            if self.db.get_global_speaker(source_id)?.is_none() {
                return Err(AppError::NotFound(format!("global speaker {}", source_id)));
            }
        }

        self.db.merge_global_speakers(target_id, source_ids)?;
        log::info!(
            "Merged global speakers {:?} into {} ('{}')",
            source_ids,
            target_id,
            target.name
        );
        Ok(target)
    }

    /// Merge recording speakers within one recording: every transcript line
    /// carrying a source label is rewritten to the target label, then the
    /// sources are removed.
    pub fn merge_recording_speakers(
        &self,
        recording_id: &str,
        target_label: &str,
        source_labels: &[String],
    ) -> Result<(), AppError> {
        let speakers = self.db.get_recording_speakers(recording_id)?;
        let by_label: HashMap<&str, &RecordingSpeaker> = speakers
            .iter()
            .map(|s| (s.diarization_label.as_str(), s))
            .collect();

        if !by_label.contains_key(target_label) {
            return Err(AppError::NotFound(format!("speaker label {}", target_label)));
        }

        for source_label in source_labels {
            if source_label == target_label {
                return Err(AppError::Other("cannot merge a speaker into itself".into()));
            }
            let source = by_label
                .get(source_label.as_str())
                .ok_or_else(|| AppError::NotFound(format!("speaker label {}", source_label)))?;

            let moved =
                self.db
                    .rewrite_transcript_speaker(recording_id, source_label, target_label)?;
            self.db.delete_recording_speaker(source.id)?;
            log::info!(
                "Merged recording speaker {} into {} ({} transcript lines moved)",
                source_label,
                target_label,
                moved
            );
        }

        Ok(())
    }

    /// Delete a recording speaker. Its transcript lines are reassigned to
    /// `reassign_to` when given, otherwise their attribution is cleared to
    /// UNKNOWN. A linked GlobalSpeaker and its other recordings' links are
    /// untouched — only the local link goes away.
    pub fn delete_recording_speaker(
        &self,
        recording_id: &str,
        label: &str,
        reassign_to: Option<&str>,
    ) -> Result<(), AppError> {
        let speakers = self.db.get_recording_speakers(recording_id)?;
        let speaker = speakers
            .iter()
            .find(|s| s.diarization_label == label)
            .ok_or_else(|| AppError::NotFound(format!("speaker label {}", label)))?;

        let new_label = reassign_to.unwrap_or(UNKNOWN_SPEAKER);
        self.db
            .rewrite_transcript_speaker(recording_id, label, new_label)?;
        self.db.delete_recording_speaker(speaker.id)?;
        Ok(())
    }

    pub fn rename_recording_speaker(
        &self,
        recording_id: &str,
        label: &str,
        name: &str,
    ) -> Result<(), AppError> {
        let speakers = self.db.get_recording_speakers(recording_id)?;
        let speaker = speakers
            .iter()
            .find(|s| s.diarization_label == label)
            .ok_or_else(|| AppError::NotFound(format!("speaker label {}", label)))?;
        self.db.rename_recording_speaker(speaker.id, name)?;
        Ok(())
    }

    /// Remove a global speaker entirely. Recording speakers that pointed at
    /// it become unlinked; nothing else is deleted.
    pub async fn delete_global(&self, user_id: &str, global_id: i64) -> Result<(), AppError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        if self.db.get_global_speaker(global_id)?.is_none() {
            return Err(AppError::NotFound(format!("global speaker {}", global_id)));
        }
        self.db.delete_global_speaker(global_id)?;
        Ok(())
    }
}
