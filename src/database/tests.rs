// Edge-case tests for the persistence layer
// Run with: cargo test --lib database::tests

#[cfg(test)]
mod recording_tests {
    use crate::database::{Database, RecordingState};
    use tempfile::TempDir;

    fn setup_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path).unwrap();
        (db, temp_dir)
    }

    #[test]
    fn test_create_and_fetch_recording() {
        let (db, _temp) = setup_test_db();
        db.create_recording("rec1", "u1", "Monday standup").unwrap();

        let rec = db.get_recording("rec1").unwrap().unwrap();
        assert_eq!(rec.name, "Monday standup");
        assert_eq!(rec.state, RecordingState::Uploading);
        assert!(rec.expected_segments.is_none());
        assert!(rec.audio_path.is_none());
    }

    #[test]
    fn test_duplicate_recording_id_fails() {
        let (db, _temp) = setup_test_db();
        db.create_recording("rec1", "u1", "first").unwrap();
        assert!(db.create_recording("rec1", "u1", "second").is_err());
    }

    #[test]
    fn test_unicode_and_special_names() {
        let (db, _temp) = setup_test_db();
        let names = vec![
            "Réunion d'équipe 日本語 🎙",
            "O'Brien's sync",
            "Drop; DROP TABLE recordings;--",
        ];
        for (i, name) in names.iter().enumerate() {
            let id = format!("rec{}", i);
            db.create_recording(&id, "u1", name).unwrap();
            assert_eq!(db.get_recording(&id).unwrap().unwrap().name, *name);
        }
    }

    #[test]
    fn test_mark_finalized_is_exactly_once() {
        let (db, _temp) = setup_test_db();
        db.create_recording("rec1", "u1", "standup").unwrap();

        assert!(db.mark_finalized("rec1", 3, "/tmp/a.wav", 12.5, 100).unwrap());
        // Second transition is refused: the state already moved on
        assert!(!db.mark_finalized("rec1", 3, "/tmp/b.wav", 99.0, 200).unwrap());

        let rec = db.get_recording("rec1").unwrap().unwrap();
        assert_eq!(rec.state, RecordingState::Finalized);
        assert_eq!(rec.audio_path.as_deref(), Some("/tmp/a.wav"));
        assert_eq!(rec.expected_segments, Some(3));
    }

    #[test]
    fn test_title_is_truncated_to_db_friendly_length() {
        let (db, _temp) = setup_test_db();
        db.create_recording("rec1", "u1", "standup").unwrap();
        let long_title = "A".repeat(1000);
        db.set_recording_title("rec1", &long_title).unwrap();
        let rec = db.get_recording("rec1").unwrap().unwrap();
        assert_eq!(rec.title.unwrap().chars().count(), 255);
    }

    #[test]
    fn test_update_state_on_missing_recording_errors() {
        let (db, _temp) = setup_test_db();
        assert!(db
            .update_recording_state("nope", RecordingState::Failed)
            .is_err());
    }
}

#[cfg(test)]
mod segment_tests {
    use crate::database::Database;
    use tempfile::TempDir;

    fn setup() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
        db.create_recording("rec1", "u1", "standup").unwrap();
        (db, temp_dir)
    }

    #[test]
    fn test_upsert_segment_replaces_not_duplicates() {
        let (db, _temp) = setup();
        db.upsert_segment("rec1", 0, 100, "/tmp/0.wav").unwrap();
        db.upsert_segment("rec1", 0, 250, "/tmp/0-retry.wav").unwrap();

        let segments = db.get_segments("rec1").unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].byte_size, 250);
        assert_eq!(segments[0].path, "/tmp/0-retry.wav");
    }

    #[test]
    fn test_missing_sequences_reports_every_gap() {
        let (db, _temp) = setup();
        for seq in [0u32, 2, 5] {
            db.upsert_segment("rec1", seq, 10, "/tmp/x.wav").unwrap();
        }
        assert_eq!(db.missing_sequences("rec1", 6).unwrap(), vec![1, 3, 4]);
        assert!(db.missing_sequences("rec1", 1).unwrap().is_empty());
    }

    #[test]
    fn test_highest_contiguous_stops_at_first_gap() {
        let (db, _temp) = setup();
        assert_eq!(db.highest_contiguous("rec1").unwrap(), None);

        db.upsert_segment("rec1", 0, 10, "/tmp/0.wav").unwrap();
        db.upsert_segment("rec1", 1, 10, "/tmp/1.wav").unwrap();
        db.upsert_segment("rec1", 3, 10, "/tmp/3.wav").unwrap();
        assert_eq!(db.highest_contiguous("rec1").unwrap(), Some(1));
    }

    #[test]
    fn test_segments_ordered_by_sequence() {
        let (db, _temp) = setup();
        for seq in [3u32, 0, 2, 1] {
            db.upsert_segment("rec1", seq, 10, "/tmp/x.wav").unwrap();
        }
        let sequences: Vec<u32> = db
            .get_segments("rec1")
            .unwrap()
            .iter()
            .map(|s| s.sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
    }
}

#[cfg(test)]
mod run_tests {
    use crate::database::{Database, RunState, StageStatus};
    use tempfile::TempDir;

    fn setup() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
        db.create_recording("rec1", "u1", "standup").unwrap();
        db.create_recording("rec2", "u1", "retro").unwrap();
        (db, temp_dir)
    }

    #[test]
    fn test_claim_is_fifo_and_marks_running() {
        let (db, _temp) = setup();
        let first = db.enqueue_run("rec1").unwrap();
        let second = db.enqueue_run("rec2").unwrap();

        let claimed = db.claim_next_queued_run().unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(
            db.get_run(first).unwrap().unwrap().state,
            RunState::Running
        );

        let claimed = db.claim_next_queued_run().unwrap().unwrap();
        assert_eq!(claimed.id, second);
        assert!(db.claim_next_queued_run().unwrap().is_none());
    }

    #[test]
    fn test_reset_stuck_runs_requeues_running() {
        let (db, _temp) = setup();
        db.enqueue_run("rec1").unwrap();
        db.claim_next_queued_run().unwrap().unwrap();

        assert_eq!(db.reset_stuck_runs().unwrap(), 1);
        let run = db.latest_run_for_recording("rec1").unwrap().unwrap();
        assert_eq!(run.state, RunState::Queued);
    }

    #[test]
    fn test_requeue_failed_clears_only_failed_stage() {
        let (db, _temp) = setup();
        let run_id = db.enqueue_run("rec1").unwrap();
        db.claim_next_queued_run().unwrap();

        db.stage_started(run_id, "VALIDATING").unwrap();
        db.stage_completed(run_id, "VALIDATING", "{\"ok\":true}").unwrap();
        db.stage_failed(run_id, "TRANSCRIBE", "boom").unwrap();
        db.mark_run_failed(run_id, "TRANSCRIBE", "boom").unwrap();

        db.requeue_failed_run(run_id).unwrap();

        let run = db.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.state, RunState::Queued);
        assert!(run.error_detail.is_none());

        // Completed stage output survives; the failed row is gone
        let validating = db.get_stage(run_id, "VALIDATING").unwrap().unwrap();
        assert_eq!(validating.status, StageStatus::Complete);
        assert!(db.get_stage(run_id, "TRANSCRIBE").unwrap().is_none());
    }

    #[test]
    fn test_requeue_non_failed_run_errors() {
        let (db, _temp) = setup();
        let run_id = db.enqueue_run("rec1").unwrap();
        assert!(db.requeue_failed_run(run_id).is_err());
    }

    #[test]
    fn test_stage_started_resets_prior_error() {
        let (db, _temp) = setup();
        let run_id = db.enqueue_run("rec1").unwrap();
        db.stage_failed(run_id, "MERGE", "bad overlap").unwrap();
        db.stage_started(run_id, "MERGE").unwrap();

        let record = db.get_stage(run_id, "MERGE").unwrap().unwrap();
        assert_eq!(record.status, StageStatus::Running);
        assert!(record.error_detail.is_none());
        assert!(record.ended_at.is_none());
    }
}

#[cfg(test)]
mod speaker_tests {
    use crate::database::{Database, TranscriptSegment};
    use tempfile::TempDir;

    fn setup() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
        db.create_recording("rec1", "u1", "standup").unwrap();
        (db, temp_dir)
    }

    #[test]
    fn test_global_speaker_name_unique_per_user_only() {
        let (db, _temp) = setup();
        db.create_global_speaker("u1", "Alice").unwrap();
        // Same name for the same user is rejected
        assert!(db.create_global_speaker("u1", "Alice").is_err());
        // Same name for a different user is a different identity
        assert!(db.create_global_speaker("u2", "Alice").is_ok());
    }

    #[test]
    fn test_embedding_cap_evicts_oldest() {
        let (db, _temp) = setup();
        let id = db.create_global_speaker("u1", "Alice").unwrap();
        for i in 0..12 {
            db.add_speaker_embedding(id, &[i as f32, 0.0]).unwrap();
        }
        let embeddings = db.get_speaker_embeddings(id).unwrap();
        assert_eq!(embeddings.len(), 10);
        // The two oldest were evicted
        assert_eq!(embeddings[0].vector[0], 2.0);
        assert_eq!(embeddings[9].vector[0], 11.0);
    }

    #[test]
    fn test_upsert_recording_speaker_is_stable() {
        let (db, _temp) = setup();
        let first = db.upsert_recording_speaker("rec1", "SPEAKER_00").unwrap();
        let second = db.upsert_recording_speaker("rec1", "SPEAKER_00").unwrap();
        assert_eq!(first, second);
        assert_eq!(db.get_recording_speakers("rec1").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_global_speaker_nullifies_links() {
        let (db, _temp) = setup();
        let global = db.create_global_speaker("u1", "Alice").unwrap();
        let rs = db.upsert_recording_speaker("rec1", "SPEAKER_00").unwrap();
        db.link_recording_speaker(rs, global).unwrap();

        db.delete_global_speaker(global).unwrap();

        let speaker = db.get_recording_speaker(rs).unwrap().unwrap();
        assert!(speaker.global_speaker_id.is_none());
    }

    #[test]
    fn test_transcript_rewrite_touches_only_target_label() {
        let (db, _temp) = setup();
        let segments = vec![
            TranscriptSegment {
                start: 0.0,
                end: 1.0,
                text: "a".into(),
                speaker: "SPEAKER_00".into(),
                source: "merge".into(),
            },
            TranscriptSegment {
                start: 1.0,
                end: 2.0,
                text: "b".into(),
                speaker: "SPEAKER_01".into(),
                source: "merge".into(),
            },
        ];
        db.replace_transcript_segments("rec1", &segments).unwrap();

        let changed = db
            .rewrite_transcript_speaker("rec1", "SPEAKER_01", "SPEAKER_00")
            .unwrap();
        assert_eq!(changed, 1);

        let transcript = db.get_transcript_segments("rec1").unwrap();
        assert!(transcript.iter().all(|s| s.speaker == "SPEAKER_00"));
    }

    #[test]
    fn test_deleting_recording_cascades() {
        let (db, _temp) = setup();
        db.upsert_segment("rec1", 0, 10, "/tmp/0.wav").unwrap();
        db.upsert_recording_speaker("rec1", "SPEAKER_00").unwrap();
        let run_id = db.enqueue_run("rec1").unwrap();
        db.stage_started(run_id, "VALIDATING").unwrap();

        db.delete_recording("rec1").unwrap();

        assert!(db.get_segments("rec1").unwrap().is_empty());
        assert!(db.get_recording_speakers("rec1").unwrap().is_empty());
        assert!(db.get_run(run_id).unwrap().is_none());
        assert!(db.get_stages(run_id).unwrap().is_empty());
    }
}
