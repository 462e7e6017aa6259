pub mod models;

#[cfg(test)]
mod tests;

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub use models::*;

/// Maximum voiceprints kept per global speaker; oldest are evicted.
const MAX_EMBEDDINGS_PER_SPEAKER: usize = 10;

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA cache_size=10000;
            PRAGMA temp_store=MEMORY;
            PRAGMA foreign_keys=ON;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS recordings (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'UPLOADING',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                expected_segments INTEGER,
                audio_path TEXT,
                duration_seconds REAL,
                file_size_bytes INTEGER,
                title TEXT,
                notes TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_recordings_user ON recordings(user_id);
            CREATE INDEX IF NOT EXISTS idx_recordings_state ON recordings(state);

            -- Segments as received by the ingestion endpoint. Re-uploads of the
            -- same (recording, sequence) replace the row.
            CREATE TABLE IF NOT EXISTS segments (
                recording_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                byte_size INTEGER NOT NULL,
                path TEXT NOT NULL,
                received_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (recording_id, sequence),
                FOREIGN KEY (recording_id) REFERENCES recordings(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS pipeline_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recording_id TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'queued',
                current_stage TEXT,
                queued_at TEXT NOT NULL DEFAULT (datetime('now')),
                started_at TEXT,
                ended_at TEXT,
                error_stage TEXT,
                error_detail TEXT,
                FOREIGN KEY (recording_id) REFERENCES recordings(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_runs_state ON pipeline_runs(state);
            CREATE INDEX IF NOT EXISTS idx_runs_recording ON pipeline_runs(recording_id);

            -- One row per stage per run; the persisted output is what makes
            -- resume-from-last-good-stage possible.
            CREATE TABLE IF NOT EXISTS pipeline_stages (
                run_id INTEGER NOT NULL,
                stage TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                started_at TEXT,
                ended_at TEXT,
                output_json TEXT,
                error_detail TEXT,
                PRIMARY KEY (run_id, stage),
                FOREIGN KEY (run_id) REFERENCES pipeline_runs(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS transcript_segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recording_id TEXT NOT NULL,
                segment_idx INTEGER NOT NULL,
                start_time REAL NOT NULL,
                end_time REAL NOT NULL,
                text TEXT NOT NULL,
                speaker TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT 'merge',
                FOREIGN KEY (recording_id) REFERENCES recordings(id) ON DELETE CASCADE,
                UNIQUE(recording_id, segment_idx)
            );

            CREATE INDEX IF NOT EXISTS idx_transcript_recording
                ON transcript_segments(recording_id);
            CREATE INDEX IF NOT EXISTS idx_transcript_speaker
                ON transcript_segments(recording_id, speaker);

            CREATE TABLE IF NOT EXISTS global_speakers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(user_id, name)
            );

            CREATE TABLE IF NOT EXISTS speaker_embeddings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                global_speaker_id INTEGER NOT NULL,
                vector TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (global_speaker_id) REFERENCES global_speakers(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_embeddings_speaker
                ON speaker_embeddings(global_speaker_id);

            CREATE TABLE IF NOT EXISTS recording_speakers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recording_id TEXT NOT NULL,
                diarization_label TEXT NOT NULL,
                name TEXT NOT NULL,
                global_speaker_id INTEGER,
                embedding TEXT,
                FOREIGN KEY (recording_id) REFERENCES recordings(id) ON DELETE CASCADE,
                FOREIGN KEY (global_speaker_id) REFERENCES global_speakers(id),
                UNIQUE(recording_id, diarization_label)
            );

            CREATE INDEX IF NOT EXISTS idx_recording_speakers_recording
                ON recording_speakers(recording_id);
            CREATE INDEX IF NOT EXISTS idx_recording_speakers_global
                ON recording_speakers(global_speaker_id);
        "#,
        )?;

        Ok(())
    }

    // =========================================================================
    // Recordings
    // =========================================================================

    pub fn create_recording(&self, id: &str, user_id: &str, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO recordings (id, user_id, name, state) VALUES (?1, ?2, ?3, 'UPLOADING')",
            params![id, user_id, name],
        )?;
        Ok(())
    }

    pub fn get_recording(&self, id: &str) -> Result<Option<Recording>> {
        let conn = self.conn.lock().unwrap();
        let rec = conn
            .query_row(
                "SELECT id, user_id, name, state, created_at, expected_segments,
                        audio_path, duration_seconds, file_size_bytes, title, notes
                 FROM recordings WHERE id = ?1",
                params![id],
                Self::row_to_recording,
            )
            .optional()?;
        Ok(rec)
    }

    fn row_to_recording(row: &rusqlite::Row<'_>) -> rusqlite::Result<Recording> {
        Ok(Recording {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            state: row.get::<_, String>(3)?.into(),
            created_at: row.get(4)?,
            expected_segments: row.get(5)?,
            audio_path: row.get(6)?,
            duration_seconds: row.get(7)?,
            file_size_bytes: row.get(8)?,
            title: row.get(9)?,
            notes: row.get(10)?,
        })
    }

    pub fn update_recording_state(&self, id: &str, state: RecordingState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE recordings SET state = ?1 WHERE id = ?2",
            params![state.to_string(), id],
        )?;
        anyhow::ensure!(changed == 1, "recording not found: {}", id);
        Ok(())
    }

    /// Transition UPLOADING → FINALIZED, recording the assembled artifact.
    /// Returns false if the recording was already past UPLOADING — that makes
    /// finalization exactly-once for callers.
    pub fn mark_finalized(
        &self,
        id: &str,
        expected_segments: u32,
        audio_path: &str,
        duration_seconds: f64,
        file_size_bytes: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE recordings
             SET state = 'FINALIZED', expected_segments = ?1, audio_path = ?2,
                 duration_seconds = ?3, file_size_bytes = ?4
             WHERE id = ?5 AND state = 'UPLOADING'",
            params![expected_segments, audio_path, duration_seconds, file_size_bytes, id],
        )?;
        Ok(changed == 1)
    }

    pub fn set_recording_title(&self, id: &str, title: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        // Trim very long titles to a DB-friendly length
        let title: String = title.chars().take(255).collect();
        conn.execute(
            "UPDATE recordings SET title = ?1 WHERE id = ?2",
            params![title, id],
        )?;
        Ok(())
    }

    pub fn set_recording_notes(&self, id: &str, notes: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE recordings SET notes = ?1 WHERE id = ?2",
            params![notes, id],
        )?;
        Ok(())
    }

    pub fn delete_recording(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM recordings WHERE id = ?1", params![id])?;
        Ok(())
    }

    // =========================================================================
    // Received segments
    // =========================================================================

    /// Idempotent: a re-upload of the same (recording, sequence) replaces the
    /// previous row rather than duplicating it.
    pub fn upsert_segment(
        &self,
        recording_id: &str,
        sequence: u32,
        byte_size: i64,
        path: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO segments (recording_id, sequence, byte_size, path)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(recording_id, sequence)
             DO UPDATE SET byte_size = ?3, path = ?4, received_at = datetime('now')",
            params![recording_id, sequence, byte_size, path],
        )?;
        Ok(())
    }

    pub fn get_segments(&self, recording_id: &str) -> Result<Vec<ReceivedSegment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT recording_id, sequence, byte_size, path, received_at
             FROM segments WHERE recording_id = ?1 ORDER BY sequence",
        )?;
        let segments = stmt
            .query_map(params![recording_id], |row| {
                Ok(ReceivedSegment {
                    recording_id: row.get(0)?,
                    sequence: row.get(1)?,
                    byte_size: row.get(2)?,
                    path: row.get(3)?,
                    received_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(segments)
    }

    /// Sequence numbers in `[0, expected)` with no received segment.
    pub fn missing_sequences(&self, recording_id: &str, expected: u32) -> Result<Vec<u32>> {
        let received: std::collections::HashSet<u32> = self
            .get_segments(recording_id)?
            .into_iter()
            .map(|s| s.sequence)
            .collect();
        Ok((0..expected).filter(|s| !received.contains(s)).collect())
    }

    /// Highest sequence N such that 0..=N are all present.
    pub fn highest_contiguous(&self, recording_id: &str) -> Result<Option<u32>> {
        let segments = self.get_segments(recording_id)?;
        let mut expected = 0u32;
        for seg in &segments {
            if seg.sequence != expected {
                break;
            }
            expected += 1;
        }
        Ok(expected.checked_sub(1))
    }

    // =========================================================================
    // Pipeline runs
    // =========================================================================

    pub fn enqueue_run(&self, recording_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pipeline_runs (recording_id, state) VALUES (?1, 'queued')",
            params![recording_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<PipelineRun>> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(
                "SELECT id, recording_id, state, current_stage, queued_at,
                        started_at, ended_at, error_stage, error_detail
                 FROM pipeline_runs WHERE id = ?1",
                params![run_id],
                Self::row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    pub fn latest_run_for_recording(&self, recording_id: &str) -> Result<Option<PipelineRun>> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(
                "SELECT id, recording_id, state, current_stage, queued_at,
                        started_at, ended_at, error_stage, error_detail
                 FROM pipeline_runs WHERE recording_id = ?1
                 ORDER BY id DESC LIMIT 1",
                params![recording_id],
                Self::row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<PipelineRun> {
        Ok(PipelineRun {
            id: row.get(0)?,
            recording_id: row.get(1)?,
            state: row.get::<_, String>(2)?.into(),
            current_stage: row.get(3)?,
            queued_at: row.get(4)?,
            started_at: row.get(5)?,
            ended_at: row.get(6)?,
            error_stage: row.get(7)?,
            error_detail: row.get(8)?,
        })
    }

    /// Atomically claim the oldest queued run, marking it running. The single
    /// connection mutex makes the read-then-update race-free.
    pub fn claim_next_queued_run(&self) -> Result<Option<PipelineRun>> {
        let conn = self.conn.lock().unwrap();
        let mut run = conn
            .query_row(
                "SELECT id, recording_id, state, current_stage, queued_at,
                        started_at, ended_at, error_stage, error_detail
                 FROM pipeline_runs WHERE state = 'queued'
                 ORDER BY id LIMIT 1",
                [],
                Self::row_to_run,
            )
            .optional()?;

        if let Some(ref mut run) = run {
            conn.execute(
                "UPDATE pipeline_runs
                 SET state = 'running', started_at = datetime('now')
                 WHERE id = ?1",
                params![run.id],
            )?;
            run.state = RunState::Running;
        }
        Ok(run)
    }

    /// Fail queued runs that never started within the timeout window.
    pub fn fail_expired_queued_runs(&self, timeout_secs: u64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE pipeline_runs
             SET state = 'failed', ended_at = datetime('now'),
                 error_detail = 'queue timeout: run never started'
             WHERE state = 'queued'
               AND queued_at <= datetime('now', '-' || ?1 || ' seconds')",
            params![timeout_secs],
        )?;
        Ok(changed)
    }

    /// Return one running run to the queue, keeping its completed stage rows.
    /// Used when cancellation lands at a stage boundary.
    pub fn requeue_run(&self, run_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pipeline_runs SET state = 'queued', started_at = NULL
             WHERE id = ?1 AND state = 'running'",
            params![run_id],
        )?;
        Ok(())
    }

    /// Re-queue runs left in `running` by a previous process. Their completed
    /// stage rows survive, so resumed runs skip straight past them.
    pub fn reset_stuck_runs(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE pipeline_runs SET state = 'queued', started_at = NULL
             WHERE state = 'running'",
            [],
        )?;
        Ok(changed)
    }

    pub fn update_run_stage(&self, run_id: i64, stage: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pipeline_runs SET current_stage = ?1 WHERE id = ?2",
            params![stage, run_id],
        )?;
        Ok(())
    }

    pub fn mark_run_complete(&self, run_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pipeline_runs
             SET state = 'complete', current_stage = NULL, ended_at = datetime('now')
             WHERE id = ?1",
            params![run_id],
        )?;
        Ok(())
    }

    pub fn mark_run_failed(&self, run_id: i64, stage: &str, detail: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pipeline_runs
             SET state = 'failed', ended_at = datetime('now'),
                 error_stage = ?1, error_detail = ?2
             WHERE id = ?3",
            params![stage, detail, run_id],
        )?;
        Ok(())
    }

    /// Requeue a failed run so it resumes from the failed stage. Clears the
    /// failed stage row; completed rows stay and are skipped on resume.
    pub fn requeue_failed_run(&self, run_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM pipeline_stages WHERE run_id = ?1 AND status = 'failed'",
            params![run_id],
        )?;
        let changed = conn.execute(
            "UPDATE pipeline_runs
             SET state = 'queued', started_at = NULL, ended_at = NULL,
                 error_stage = NULL, error_detail = NULL
             WHERE id = ?1 AND state = 'failed'",
            params![run_id],
        )?;
        anyhow::ensure!(changed == 1, "run {} is not in a failed state", run_id);
        Ok(())
    }

    // =========================================================================
    // Pipeline stages
    // =========================================================================

    pub fn stage_started(&self, run_id: i64, stage: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pipeline_stages (run_id, stage, status, started_at)
             VALUES (?1, ?2, 'running', datetime('now'))
             ON CONFLICT(run_id, stage)
             DO UPDATE SET status = 'running', started_at = datetime('now'),
                           ended_at = NULL, error_detail = NULL",
            params![run_id, stage],
        )?;
        Ok(())
    }

    pub fn stage_completed(&self, run_id: i64, stage: &str, output_json: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pipeline_stages
             SET status = 'complete', ended_at = datetime('now'), output_json = ?1
             WHERE run_id = ?2 AND stage = ?3",
            params![output_json, run_id, stage],
        )?;
        Ok(())
    }

    pub fn stage_skipped(&self, run_id: i64, stage: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pipeline_stages (run_id, stage, status, started_at, ended_at)
             VALUES (?1, ?2, 'skipped', datetime('now'), datetime('now'))
             ON CONFLICT(run_id, stage) DO UPDATE SET status = 'skipped'",
            params![run_id, stage],
        )?;
        Ok(())
    }

    pub fn stage_failed(&self, run_id: i64, stage: &str, detail: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pipeline_stages (run_id, stage, status, started_at, ended_at, error_detail)
             VALUES (?1, ?2, 'failed', datetime('now'), datetime('now'), ?3)
             ON CONFLICT(run_id, stage)
             DO UPDATE SET status = 'failed', ended_at = datetime('now'), error_detail = ?3",
            params![run_id, stage, detail],
        )?;
        Ok(())
    }

    pub fn get_stages(&self, run_id: i64) -> Result<Vec<StageRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT run_id, stage, status, started_at, ended_at, output_json, error_detail
             FROM pipeline_stages WHERE run_id = ?1 ORDER BY started_at, stage",
        )?;
        let stages = stmt
            .query_map(params![run_id], |row| {
                Ok(StageRecord {
                    run_id: row.get(0)?,
                    stage: row.get(1)?,
                    status: row.get::<_, String>(2)?.into(),
                    started_at: row.get(3)?,
                    ended_at: row.get(4)?,
                    output_json: row.get(5)?,
                    error_detail: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stages)
    }

    pub fn get_stage(&self, run_id: i64, stage: &str) -> Result<Option<StageRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT run_id, stage, status, started_at, ended_at, output_json, error_detail
                 FROM pipeline_stages WHERE run_id = ?1 AND stage = ?2",
                params![run_id, stage],
                |row| {
                    Ok(StageRecord {
                        run_id: row.get(0)?,
                        stage: row.get(1)?,
                        status: row.get::<_, String>(2)?.into(),
                        started_at: row.get(3)?,
                        ended_at: row.get(4)?,
                        output_json: row.get(5)?,
                        error_detail: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // =========================================================================
    // Transcript segments
    // =========================================================================

    pub fn replace_transcript_segments(
        &self,
        recording_id: &str,
        segments: &[TranscriptSegment],
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM transcript_segments WHERE recording_id = ?1",
            params![recording_id],
        )?;
        for (idx, seg) in segments.iter().enumerate() {
            tx.execute(
                "INSERT INTO transcript_segments
                 (recording_id, segment_idx, start_time, end_time, text, speaker, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    recording_id,
                    idx as i64,
                    seg.start,
                    seg.end,
                    seg.text,
                    seg.speaker,
                    seg.source
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_transcript_segments(&self, recording_id: &str) -> Result<Vec<TranscriptSegment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT start_time, end_time, text, speaker, source
             FROM transcript_segments WHERE recording_id = ?1 ORDER BY segment_idx",
        )?;
        let segments = stmt
            .query_map(params![recording_id], |row| {
                Ok(TranscriptSegment {
                    start: row.get(0)?,
                    end: row.get(1)?,
                    text: row.get(2)?,
                    speaker: row.get(3)?,
                    source: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(segments)
    }

    /// Rewrite every transcript line carrying one speaker label to another.
    /// Used by merge so references are reassigned, never duplicated.
    pub fn rewrite_transcript_speaker(
        &self,
        recording_id: &str,
        from_label: &str,
        to_label: &str,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE transcript_segments SET speaker = ?1
             WHERE recording_id = ?2 AND speaker = ?3",
            params![to_label, recording_id, from_label],
        )?;
        Ok(changed)
    }

    // =========================================================================
    // Global speakers & voiceprints
    // =========================================================================

    pub fn create_global_speaker(&self, user_id: &str, name: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO global_speakers (user_id, name) VALUES (?1, ?2)",
            params![user_id, name],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_global_speaker(&self, id: i64) -> Result<Option<GlobalSpeaker>> {
        let conn = self.conn.lock().unwrap();
        let speaker = conn
            .query_row(
                "SELECT id, user_id, name, created_at FROM global_speakers WHERE id = ?1",
                params![id],
                Self::row_to_global_speaker,
            )
            .optional()?;
        Ok(speaker)
    }

    /// Exact name match, scoped to one user.
    pub fn get_global_speaker_by_name(
        &self,
        user_id: &str,
        name: &str,
    ) -> Result<Option<GlobalSpeaker>> {
        let conn = self.conn.lock().unwrap();
        let speaker = conn
            .query_row(
                "SELECT id, user_id, name, created_at FROM global_speakers
                 WHERE user_id = ?1 AND name = ?2",
                params![user_id, name],
                Self::row_to_global_speaker,
            )
            .optional()?;
        Ok(speaker)
    }

    pub fn get_global_speakers(&self, user_id: &str) -> Result<Vec<GlobalSpeaker>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, created_at FROM global_speakers
             WHERE user_id = ?1 ORDER BY name",
        )?;
        let speakers = stmt
            .query_map(params![user_id], Self::row_to_global_speaker)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(speakers)
    }

    fn row_to_global_speaker(row: &rusqlite::Row<'_>) -> rusqlite::Result<GlobalSpeaker> {
        Ok(GlobalSpeaker {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    pub fn rename_global_speaker(&self, id: i64, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE global_speakers SET name = ?1 WHERE id = ?2",
            params![name, id],
        )?;
        anyhow::ensure!(changed == 1, "global speaker not found: {}", id);
        Ok(())
    }

    /// Append a voiceprint, evicting the oldest beyond the per-speaker cap.
    pub fn add_speaker_embedding(&self, global_speaker_id: i64, vector: &[f32]) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let json = serde_json::to_string(vector)?;
        conn.execute(
            "INSERT INTO speaker_embeddings (global_speaker_id, vector) VALUES (?1, ?2)",
            params![global_speaker_id, json],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "DELETE FROM speaker_embeddings WHERE global_speaker_id = ?1 AND id NOT IN (
                 SELECT id FROM speaker_embeddings WHERE global_speaker_id = ?1
                 ORDER BY id DESC LIMIT ?2
             )",
            params![global_speaker_id, MAX_EMBEDDINGS_PER_SPEAKER as i64],
        )?;
        Ok(id)
    }

    pub fn get_speaker_embeddings(&self, global_speaker_id: i64) -> Result<Vec<SpeakerEmbedding>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, global_speaker_id, vector FROM speaker_embeddings
             WHERE global_speaker_id = ?1 ORDER BY id",
        )?;
        let embeddings = stmt
            .query_map(params![global_speaker_id], |row| {
                let json: String = row.get(2)?;
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, json))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|(id, speaker_id, json)| {
                Ok(SpeakerEmbedding {
                    id,
                    global_speaker_id: speaker_id,
                    vector: serde_json::from_str(&json)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(embeddings)
    }

    /// Every voiceprint for every global speaker of one user, grouped by
    /// speaker. This is the match candidate set for resolution.
    pub fn get_user_voiceprints(&self, user_id: &str) -> Result<Vec<(GlobalSpeaker, Vec<Vec<f32>>)>> {
        let speakers = self.get_global_speakers(user_id)?;
        let mut result = Vec::with_capacity(speakers.len());
        for speaker in speakers {
            let vectors = self
                .get_speaker_embeddings(speaker.id)?
                .into_iter()
                .map(|e| e.vector)
                .collect();
            result.push((speaker, vectors));
        }
        Ok(result)
    }

    /// Merge: reassign all recording-speaker links and voiceprints from the
    /// sources to the target, then remove the sources.
    pub fn merge_global_speakers(&self, target_id: i64, source_ids: &[i64]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for &source_id in source_ids {
            anyhow::ensure!(source_id != target_id, "cannot merge a speaker into itself");
            tx.execute(
                "UPDATE recording_speakers SET global_speaker_id = ?1
                 WHERE global_speaker_id = ?2",
                params![target_id, source_id],
            )?;
            tx.execute(
                "UPDATE speaker_embeddings SET global_speaker_id = ?1
                 WHERE global_speaker_id = ?2",
                params![target_id, source_id],
            )?;
            tx.execute(
                "DELETE FROM global_speakers WHERE id = ?1",
                params![source_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete a global speaker, unlinking (never deleting) its recording
    /// speakers.
    pub fn delete_global_speaker(&self, id: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE recording_speakers SET global_speaker_id = NULL
             WHERE global_speaker_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM global_speakers WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Recording speakers
    // =========================================================================

    /// Created when diarization first reports a label; the display name
    /// defaults to the label itself.
    pub fn upsert_recording_speaker(&self, recording_id: &str, label: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO recording_speakers (recording_id, diarization_label, name)
             VALUES (?1, ?2, ?2)
             ON CONFLICT(recording_id, diarization_label) DO NOTHING",
            params![recording_id, label],
        )?;
        let id = conn.query_row(
            "SELECT id FROM recording_speakers
             WHERE recording_id = ?1 AND diarization_label = ?2",
            params![recording_id, label],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_recording_speakers(&self, recording_id: &str) -> Result<Vec<RecordingSpeaker>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, recording_id, diarization_label, name, global_speaker_id, embedding
             FROM recording_speakers WHERE recording_id = ?1 ORDER BY diarization_label",
        )?;
        let speakers = stmt
            .query_map(params![recording_id], Self::row_to_recording_speaker)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(speakers)
    }

    pub fn get_recording_speaker(&self, id: i64) -> Result<Option<RecordingSpeaker>> {
        let conn = self.conn.lock().unwrap();
        let speaker = conn
            .query_row(
                "SELECT id, recording_id, diarization_label, name, global_speaker_id, embedding
                 FROM recording_speakers WHERE id = ?1",
                params![id],
                Self::row_to_recording_speaker,
            )
            .optional()?;
        Ok(speaker)
    }

    fn row_to_recording_speaker(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordingSpeaker> {
        let embedding_json: Option<String> = row.get(5)?;
        Ok(RecordingSpeaker {
            id: row.get(0)?,
            recording_id: row.get(1)?,
            diarization_label: row.get(2)?,
            name: row.get(3)?,
            global_speaker_id: row.get(4)?,
            embedding: embedding_json.and_then(|j| serde_json::from_str(&j).ok()),
        })
    }

    pub fn rename_recording_speaker(&self, id: i64, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE recording_speakers SET name = ?1 WHERE id = ?2",
            params![name, id],
        )?;
        anyhow::ensure!(changed == 1, "recording speaker not found: {}", id);
        Ok(())
    }

    pub fn link_recording_speaker(&self, id: i64, global_speaker_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE recording_speakers SET global_speaker_id = ?1 WHERE id = ?2",
            params![global_speaker_id, id],
        )?;
        anyhow::ensure!(changed == 1, "recording speaker not found: {}", id);
        Ok(())
    }

    pub fn unlink_recording_speaker(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE recording_speakers SET global_speaker_id = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn set_recording_speaker_embedding(&self, id: i64, vector: &[f32]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let json = serde_json::to_string(vector)?;
        conn.execute(
            "UPDATE recording_speakers SET embedding = ?1 WHERE id = ?2",
            params![json, id],
        )?;
        Ok(())
    }

    /// Remove the local label only. The linked GlobalSpeaker (if any) and its
    /// links in other recordings are untouched.
    pub fn delete_recording_speaker(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM recording_speakers WHERE id = ?1", params![id])?;
        Ok(())
    }
}
