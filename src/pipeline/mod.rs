pub mod merge;
pub mod stage;

use crate::audio::validate_wav;
use crate::config::Config;
use crate::database::{Database, PipelineRun, Recording, RecordingState, StageStatus};
use crate::speakers::{self, SpeakerRegistry};
use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use stage::{
    MergeOutput, ProxyAlignOutput, SpeakerResolveOutput, StageKind, StageModels, TimeRange,
    TitleInferOutput, ValidateOutput, VoiceprintExtractOutput,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Poll interval of the scheduler loop when the queue is empty.
const IDLE_POLL_SECS: u64 = 2;

/// Runs finalized recordings through the stage sequence.
///
/// Stages within one run execute strictly sequentially; independent runs
/// execute concurrently, bounded by a worker pool sized to the host. Every
/// stage result is persisted before the machine advances, so a process
/// restart resumes from the last completed stage instead of recomputing
/// expensive work.
pub struct PipelineRunner {
    db: Arc<Database>,
    config: Arc<Config>,
    models: StageModels,
    registry: Arc<SpeakerRegistry>,
}

/// Everything one stage execution needs, owned so it can move to the
/// blocking pool.
struct StageContext {
    db: Arc<Database>,
    config: Arc<Config>,
    models: StageModels,
    recording: Recording,
    run_id: i64,
    audio_path: PathBuf,
}

impl StageContext {
    /// Deserialize the persisted output of an earlier stage of this run.
    fn output<T: DeserializeOwned>(&self, kind: StageKind) -> Result<Option<T>> {
        let record = self.db.get_stage(self.run_id, kind.name())?;
        match record.and_then(|r| r.output_json) {
            Some(json) => Ok(Some(serde_json::from_str(&json).with_context(|| {
                format!("corrupt persisted output for stage {}", kind)
            })?)),
            None => Ok(None),
        }
    }

    fn require_output<T: DeserializeOwned>(&self, kind: StageKind) -> Result<T> {
        self.output(kind)?
            .ok_or_else(|| anyhow!("stage {} has no persisted output", kind))
    }
}

impl PipelineRunner {
    pub fn new(
        db: Arc<Database>,
        config: Arc<Config>,
        models: StageModels,
        registry: Arc<SpeakerRegistry>,
    ) -> Self {
        Self {
            db,
            config,
            models,
            registry,
        }
    }

    /// Scheduler loop: claim queued runs and dispatch them to the worker
    /// pool until cancelled. In-flight runs notice cancellation at their
    /// next stage boundary.
    pub async fn run_scheduler(self: Arc<Self>, cancel: CancellationToken) {
        log::info!(
            "Pipeline scheduler started ({} workers)",
            self.config.pipeline_workers
        );

        // Runs left mid-flight by a previous process resume from their last
        // completed stage.
        match self.db.reset_stuck_runs() {
            Ok(0) => {}
            Ok(n) => log::info!("Requeued {} interrupted runs from a previous process", n),
            Err(e) => log::warn!("Failed to requeue interrupted runs: {}", e),
        }

        let semaphore = Arc::new(Semaphore::new(self.config.pipeline_workers));

        loop {
            if cancel.is_cancelled() {
                log::info!("Pipeline scheduler shutting down");
                break;
            }

            match self
                .db
                .fail_expired_queued_runs(self.config.queue_timeout_secs)
            {
                Ok(0) => {}
                Ok(n) => log::warn!("{} queued runs expired before starting", n),
                Err(e) => log::warn!("Queue timeout sweep failed: {}", e),
            }

            // Take a permit before claiming so a claimed run always has a
            // worker slot.
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            match self.db.claim_next_queued_run() {
                Ok(Some(run)) => {
                    let runner = self.clone();
                    let run_cancel = cancel.clone();
                    tokio::spawn(async move {
                        runner.process_run(run, run_cancel).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(IDLE_POLL_SECS)) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    log::error!("Failed to claim queued run: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(IDLE_POLL_SECS)).await;
                }
            }
        }

        log::info!("Pipeline scheduler stopped");
    }

    /// Execute one claimed run to completion, failure, or cancellation.
    pub async fn process_run(&self, run: PipelineRun, cancel: CancellationToken) {
        let recording = match self.db.get_recording(&run.recording_id) {
            Ok(Some(r)) => r,
            Ok(None) => {
                log::error!("Run {} references missing recording {}", run.id, run.recording_id);
                let _ = self
                    .db
                    .mark_run_failed(run.id, "VALIDATING", "recording not found");
                return;
            }
            Err(e) => {
                log::error!("Failed to load recording for run {}: {}", run.id, e);
                return;
            }
        };

        let audio_path = match recording.audio_path.as_deref() {
            Some(p) => PathBuf::from(p),
            None => {
                log::error!("Recording {} has no finalized artifact", recording.id);
                let _ = self
                    .db
                    .mark_run_failed(run.id, "VALIDATING", "no finalized audio artifact");
                let _ = self
                    .db
                    .update_recording_state(&recording.id, RecordingState::Failed);
                return;
            }
        };

        if let Err(e) = self
            .db
            .update_recording_state(&recording.id, RecordingState::Processing)
        {
            log::error!("Failed to mark recording processing: {}", e);
            return;
        }

        log::info!("Run {} started for recording {}", run.id, recording.id);

        for kind in StageKind::ORDER {
            // Cancellation takes effect here, at the stage boundary; the run
            // goes back to the queue with its completed stages intact.
            if cancel.is_cancelled() {
                log::info!("Run {} cancelled before stage {}", run.id, kind);
                let _ = self.db.requeue_run(run.id);
                return;
            }

            // Resume: stages already complete or skipped are never re-run.
            match self.db.get_stage(run.id, kind.name()) {
                Ok(Some(record))
                    if matches!(record.status, StageStatus::Complete | StageStatus::Skipped) =>
                {
                    log::debug!("Run {} stage {} already {}, skipping", run.id, kind, record.status);
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("Failed to read stage state for run {}: {}", run.id, e);
                    return;
                }
            }

            if self.should_skip(kind) {
                log::info!("Run {} stage {} disabled, recording skip", run.id, kind);
                let _ = self.db.update_run_stage(run.id, kind.name());
                if let Err(e) = self.db.stage_skipped(run.id, kind.name()) {
                    log::error!("Failed to record skipped stage: {}", e);
                    return;
                }
                continue;
            }

            let _ = self.db.update_run_stage(run.id, kind.name());
            if let Err(e) = self.db.stage_started(run.id, kind.name()) {
                log::error!("Failed to record stage start: {}", e);
                return;
            }

            let started = std::time::Instant::now();
            let result = self.execute_stage(kind, &recording, run.id, &audio_path).await;

            match result {
                Ok(output_json) => {
                    if let Err(e) = self.db.stage_completed(run.id, kind.name(), &output_json) {
                        log::error!("Failed to persist stage output: {}", e);
                        return;
                    }
                    log::info!(
                        "Run {} stage {} complete in {:.1}s",
                        run.id,
                        kind,
                        started.elapsed().as_secs_f64()
                    );
                }
                Err(e) => {
                    let detail = format!("{:#}", e);
                    log::error!("Run {} failed at stage {}: {}", run.id, kind, detail);
                    let _ = self.db.stage_failed(run.id, kind.name(), &detail);
                    let _ = self.db.mark_run_failed(run.id, kind.name(), &detail);
                    let _ = self
                        .db
                        .update_recording_state(&recording.id, RecordingState::Failed);
                    return;
                }
            }
        }

        if let Err(e) = self.db.mark_run_complete(run.id) {
            log::error!("Failed to mark run complete: {}", e);
            return;
        }
        let _ = self
            .db
            .update_recording_state(&recording.id, RecordingState::Complete);
        log::info!("Run {} complete for recording {}", run.id, recording.id);
    }

    fn should_skip(&self, kind: StageKind) -> bool {
        match kind {
            StageKind::Vad => !self.config.enable_vad || self.models.vad.is_none(),
            StageKind::Diarize => {
                !self.config.enable_diarization || self.models.diarizer.is_none()
            }
            StageKind::SpeakerResolve | StageKind::VoiceprintExtract => {
                self.models.embedder.is_none()
            }
            StageKind::TitleInfer => {
                !self.config.enable_title_inference || self.models.llm.is_none()
            }
            StageKind::NotesGenerate => {
                !self.config.enable_notes_generation || self.models.llm.is_none()
            }
            _ => false,
        }
    }

    /// Run one stage on the blocking pool under the per-stage timeout.
    /// Registry-touching stages additionally hold the per-user lock for the
    /// whole decision, so concurrent runs for one user serialize here.
    async fn execute_stage(
        &self,
        kind: StageKind,
        recording: &Recording,
        run_id: i64,
        audio_path: &std::path::Path,
    ) -> Result<String> {
        let ctx = StageContext {
            db: self.db.clone(),
            config: self.config.clone(),
            models: self.models.clone(),
            recording: recording.clone(),
            run_id,
            audio_path: audio_path.to_path_buf(),
        };

        let timeout = std::time::Duration::from_secs(self.config.stage_timeout_secs);

        let guard = match kind {
            StageKind::SpeakerResolve | StageKind::VoiceprintExtract => {
                let lock = self.registry.user_lock(&recording.user_id);
                Some(lock.lock_owned().await)
            }
            _ => None,
        };

        let handle = tokio::task::spawn_blocking(move || run_stage_blocking(kind, &ctx));
        let result = tokio::time::timeout(timeout, handle).await;
        drop(guard);

        match result {
            Ok(Ok(stage_result)) => stage_result,
            Ok(Err(join_err)) => Err(anyhow!("stage panicked: {}", join_err)),
            Err(_) => Err(anyhow!(
                "stage timed out after {}s",
                self.config.stage_timeout_secs
            )),
        }
    }
}

/// Dispatch table for the stage bodies. Built-in stages are implemented
/// here; model-backed ones call through the injected trait objects.
fn run_stage_blocking(kind: StageKind, ctx: &StageContext) -> Result<String> {
    let value = match kind {
        StageKind::Validating => serde_json::to_string(&stage_validate(ctx)?)?,
        StageKind::Vad => {
            let vad = ctx.models.vad.as_ref().expect("vad model gated by skip");
            serde_json::to_string(&vad.detect(&ctx.audio_path)?)?
        }
        StageKind::ProxyAlign => serde_json::to_string(&stage_proxy_align(ctx)?)?,
        StageKind::Transcribe => {
            let transcriber = &ctx.models.transcriber;
            let aligned: Option<ProxyAlignOutput> = ctx.output(StageKind::ProxyAlign)?;
            let speech = aligned.as_ref().map(|a| a.speech.as_slice());
            serde_json::to_string(&transcriber.transcribe(&ctx.audio_path, speech)?)?
        }
        StageKind::Diarize => {
            let diarizer = ctx
                .models
                .diarizer
                .as_ref()
                .expect("diarizer gated by skip");
            serde_json::to_string(&diarizer.diarize(&ctx.audio_path)?)?
        }
        StageKind::Merge => serde_json::to_string(&stage_merge(ctx)?)?,
        StageKind::SpeakerResolve => serde_json::to_string(&stage_speaker_resolve(ctx)?)?,
        StageKind::VoiceprintExtract => serde_json::to_string(&stage_voiceprint_extract(ctx)?)?,
        StageKind::TitleInfer => serde_json::to_string(&stage_title_infer(ctx)?)?,
        StageKind::NotesGenerate => serde_json::to_string(&stage_notes_generate(ctx)?)?,
    };
    Ok(value)
}

/// Fail fast on corrupt or empty audio so no heavy stage ever sees it.
fn stage_validate(ctx: &StageContext) -> Result<ValidateOutput> {
    let info = validate_wav(&ctx.audio_path)?;
    Ok(ValidateOutput {
        sample_rate: info.sample_rate,
        channels: info.channels,
        duration_seconds: info.duration_seconds,
    })
}

/// Map speech ranges onto the artifact timeline, clamped to its duration.
/// Without VAD the whole artifact counts as speech.
fn stage_proxy_align(ctx: &StageContext) -> Result<ProxyAlignOutput> {
    let validated: ValidateOutput = ctx.require_output(StageKind::Validating)?;
    let duration = validated.duration_seconds;

    let speech = match ctx.output::<stage::VadOutput>(StageKind::Vad)? {
        Some(vad) => vad
            .speech
            .into_iter()
            .filter_map(|r| {
                let clamped = TimeRange {
                    start: r.start.max(0.0).min(duration),
                    end: r.end.max(0.0).min(duration),
                };
                (clamped.duration() > 0.0).then_some(clamped)
            })
            .collect(),
        None => vec![TimeRange {
            start: 0.0,
            end: duration,
        }],
    };

    Ok(ProxyAlignOutput { speech })
}

/// Merge transcription against diarization and persist the attributed
/// transcript. Also registers a RecordingSpeaker for every label the
/// diarizer reported.
fn stage_merge(ctx: &StageContext) -> Result<MergeOutput> {
    let transcription: stage::TranscribeOutput = ctx.require_output(StageKind::Transcribe)?;
    let diarization: Option<stage::DiarizeOutput> = ctx.output(StageKind::Diarize)?;

    let segments = match diarization {
        Some(diarization) => merge::consolidate(merge::merge_transcript(
            &transcription.segments,
            &diarization.turns,
        )),
        None => merge::transcript_without_speakers(&transcription.segments),
    };

    ctx.db
        .replace_transcript_segments(&ctx.recording.id, &segments)?;

    let mut labels: Vec<&str> = segments
        .iter()
        .map(|s| s.speaker.as_str())
        .filter(|l| *l != merge::UNKNOWN_SPEAKER)
        .collect();
    labels.sort_unstable();
    labels.dedup();
    for label in labels {
        ctx.db.upsert_recording_speaker(&ctx.recording.id, label)?;
    }

    Ok(MergeOutput { segments })
}

/// Match each recording speaker's candidate voiceprint against the user's
/// registry. The runner holds the per-user lock for the whole stage.
fn stage_speaker_resolve(ctx: &StageContext) -> Result<SpeakerResolveOutput> {
    let embedder = ctx
        .models
        .embedder
        .as_ref()
        .expect("embedder gated by skip");

    let diarization: Option<stage::DiarizeOutput> = ctx.output(StageKind::Diarize)?;
    let turns = match diarization {
        Some(d) => d.turns,
        None => {
            return Ok(SpeakerResolveOutput {
                resolutions: Vec::new(),
            })
        }
    };

    let registry = ctx.db.get_user_voiceprints(&ctx.recording.user_id)?;
    let mut resolutions = Vec::new();

    for speaker in ctx.db.get_recording_speakers(&ctx.recording.id)? {
        let ranges = speakers::select_representative_turns(
            &turns,
            &speaker.diarization_label,
            ctx.config.top_k_segments,
            ctx.config.min_embed_segment_secs,
        );
        if ranges.is_empty() {
            log::debug!(
                "No usable turns for {} in {}, skipping resolution",
                speaker.diarization_label,
                ctx.recording.id
            );
            continue;
        }

        let mut embeddings = Vec::with_capacity(ranges.len());
        for range in &ranges {
            match embedder.embed(&ctx.audio_path, *range) {
                Ok(e) => embeddings.push(e),
                Err(e) => log::warn!(
                    "Embedding failed for {} [{:.2}s - {:.2}s]: {}",
                    speaker.diarization_label,
                    range.start,
                    range.end,
                    e
                ),
            }
        }

        let candidate = match speakers::average_embeddings(&embeddings) {
            Some(c) => c,
            None => continue,
        };
        ctx.db
            .set_recording_speaker_embedding(speaker.id, &candidate)?;

        let outcome = speakers::evaluate_match(
            &candidate,
            &registry,
            ctx.config.similarity_threshold,
            ctx.config.similarity_margin,
        );

        let linked = if outcome.accepted {
            let (global_id, score) = outcome.best.expect("accepted implies best");
            ctx.db.link_recording_speaker(speaker.id, global_id)?;
            log::info!(
                "Linked {} in {} to global speaker {} (score {:.2})",
                speaker.diarization_label,
                ctx.recording.id,
                global_id,
                score
            );
            Some(global_id)
        } else {
            // Ambiguous or weak match is a deliberate non-decision: the
            // label stays unlinked for later manual or automatic linkage.
            None
        };

        resolutions.push(stage::LabelResolution {
            label: speaker.diarization_label.clone(),
            linked_global_speaker: linked,
            best_score: outcome.best.map(|(_, s)| s),
            second_best_score: outcome.second_best_score,
        });
    }

    Ok(SpeakerResolveOutput { resolutions })
}

/// Reinforce linked global speakers with the voiceprints this recording
/// produced. Runs under the same per-user lock as resolution.
fn stage_voiceprint_extract(ctx: &StageContext) -> Result<VoiceprintExtractOutput> {
    let mut stored = 0usize;
    for speaker in ctx.db.get_recording_speakers(&ctx.recording.id)? {
        if let (Some(global_id), Some(embedding)) = (speaker.global_speaker_id, &speaker.embedding)
        {
            ctx.db.add_speaker_embedding(global_id, embedding)?;
            stored += 1;
        }
    }
    Ok(VoiceprintExtractOutput { stored })
}

fn stage_title_infer(ctx: &StageContext) -> Result<TitleInferOutput> {
    let llm = ctx.models.llm.as_ref().expect("llm gated by skip");
    let transcript = transcript_for_model(ctx)?;
    let title = llm.infer_title(&transcript)?;
    ctx.db.set_recording_title(&ctx.recording.id, &title)?;
    Ok(TitleInferOutput { title })
}

fn stage_notes_generate(ctx: &StageContext) -> Result<stage::NotesGenerateOutput> {
    let llm = ctx.models.llm.as_ref().expect("llm gated by skip");
    let transcript = transcript_for_model(ctx)?;
    let notes = llm.generate_notes(&transcript)?;
    ctx.db.set_recording_notes(&ctx.recording.id, &notes)?;
    Ok(stage::NotesGenerateOutput { notes })
}

/// Render the attributed transcript as the text block the language model
/// stages consume.
fn transcript_for_model(ctx: &StageContext) -> Result<String> {
    let segments = ctx.db.get_transcript_segments(&ctx.recording.id)?;
    let mut text = String::new();
    for seg in &segments {
        text.push_str(&format!(
            "[{:.2}s - {:.2}s] - {} - {}\n",
            seg.start, seg.end, seg.speaker, seg.text
        ));
    }
    Ok(text)
}

/// Re-trigger a failed run from its failed stage. Completed stage outputs
/// are kept; only the failed stage (and everything after it) runs again.
pub fn resume_run(db: &Database, run_id: i64) -> Result<(), crate::error::AppError> {
    db.requeue_failed_run(run_id)?;
    log::info!("Run {} requeued for resume", run_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::RunState;
    use stage::{
        DiarizeOutput, Diarizer, Embedder, LanguageModel, SpeakerTurn, TimedText, TranscribeOutput,
        Transcriber, VadOutput, VoiceActivityDetector,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingVad {
        calls: AtomicUsize,
    }

    impl VoiceActivityDetector for CountingVad {
        fn detect(&self, _audio: &std::path::Path) -> Result<VadOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(VadOutput {
                speech: vec![TimeRange {
                    start: 0.0,
                    end: 100.0, // deliberately past the artifact end; align clamps
                }],
            })
        }
    }

    struct StubTranscriber {
        calls: AtomicUsize,
        fail_next: AtomicBool,
    }

    impl StubTranscriber {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_next: AtomicBool::new(false),
            }
        }
    }

    impl Transcriber for StubTranscriber {
        fn transcribe(
            &self,
            _audio: &std::path::Path,
            _speech: Option<&[TimeRange]>,
        ) -> Result<TranscribeOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                anyhow::bail!("model ran out of memory");
            }
            Ok(TranscribeOutput {
                segments: vec![
                    TimedText {
                        start: 0.0,
                        end: 2.0,
                        text: "let's get started".into(),
                    },
                    TimedText {
                        start: 2.0,
                        end: 4.0,
                        text: "sounds good to me".into(),
                    },
                ],
                language: Some("en".into()),
            })
        }
    }

    struct StubDiarizer;

    impl Diarizer for StubDiarizer {
        fn diarize(&self, _audio: &std::path::Path) -> Result<DiarizeOutput> {
            Ok(DiarizeOutput {
                turns: vec![
                    SpeakerTurn {
                        start: 0.0,
                        end: 2.0,
                        label: "SPEAKER_00".into(),
                    },
                    SpeakerTurn {
                        start: 2.0,
                        end: 4.0,
                        label: "SPEAKER_01".into(),
                    },
                ],
            })
        }
    }

    /// First two seconds sound like [1, 0]; the rest like [0, 1].
    struct StubEmbedder;

    impl Embedder for StubEmbedder {
        fn embed(&self, _audio: &std::path::Path, range: TimeRange) -> Result<Vec<f32>> {
            if range.start < 2.0 {
                Ok(vec![1.0, 0.0])
            } else {
                Ok(vec![0.0, 1.0])
            }
        }
    }

    struct StubLlm;

    impl LanguageModel for StubLlm {
        fn infer_title(&self, _transcript: &str) -> Result<String> {
            Ok("Planning sync".into())
        }

        fn generate_notes(&self, transcript: &str) -> Result<String> {
            Ok(format!("Notes over {} chars of transcript", transcript.len()))
        }
    }

    struct Fixture {
        db: Arc<Database>,
        runner: PipelineRunner,
        transcriber: Arc<StubTranscriber>,
        vad: Arc<CountingVad>,
        _tmp: TempDir,
    }

    fn fixture_with(config: Config, with_diarizer: bool) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&tmp.path().join("test.db")).unwrap());
        let registry = Arc::new(SpeakerRegistry::new(db.clone()));
        let transcriber = Arc::new(StubTranscriber::new());
        let vad = Arc::new(CountingVad {
            calls: AtomicUsize::new(0),
        });

        let models = StageModels {
            vad: Some(vad.clone()),
            transcriber: transcriber.clone(),
            diarizer: with_diarizer.then(|| Arc::new(StubDiarizer) as Arc<dyn Diarizer>),
            embedder: Some(Arc::new(StubEmbedder)),
            llm: Some(Arc::new(StubLlm)),
        };

        let runner = PipelineRunner::new(db.clone(), Arc::new(config), models, registry);
        Fixture {
            db,
            runner,
            transcriber,
            vad,
            _tmp: tmp,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Config::default(), true)
    }

    /// A finalized recording with a real 4-second artifact, queued for
    /// processing.
    fn seed_finalized(fx: &Fixture, id: &str) -> i64 {
        let artifact = fx._tmp.path().join(format!("{}.wav", id));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&artifact, spec).unwrap();
        for i in 0..(8000 * 4) {
            writer.write_sample((i % 128) as i16).unwrap();
        }
        writer.finalize().unwrap();

        fx.db.create_recording(id, "u1", "standup").unwrap();
        fx.db
            .mark_finalized(id, 1, &artifact.to_string_lossy(), 4.0, 64000)
            .unwrap();
        fx.db.enqueue_run(id).unwrap()
    }

    async fn run_once(fx: &Fixture) -> PipelineRun {
        let run = fx.db.claim_next_queued_run().unwrap().unwrap();
        fx.runner
            .process_run(run.clone(), CancellationToken::new())
            .await;
        fx.db.get_run(run.id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_full_run_completes_and_links_speakers() {
        let fx = fixture();
        // Alice's registered voiceprint matches SPEAKER_00's stub embedding
        let alice = fx.db.create_global_speaker("u1", "Alice").unwrap();
        fx.db.add_speaker_embedding(alice, &[1.0, 0.0]).unwrap();

        seed_finalized(&fx, "rec1");
        let run = run_once(&fx).await;
        assert_eq!(run.state, RunState::Complete);

        let recording = fx.db.get_recording("rec1").unwrap().unwrap();
        assert_eq!(recording.state, RecordingState::Complete);
        assert_eq!(recording.title.as_deref(), Some("Planning sync"));
        assert!(recording.notes.is_some());

        // Transcript persisted with attributed speakers
        let transcript = fx.db.get_transcript_segments("rec1").unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].speaker, "SPEAKER_00");
        assert_eq!(transcript[1].speaker, "SPEAKER_01");

        // SPEAKER_00 resolved to Alice; SPEAKER_01 left unlinked (its only
        // candidate scores 0.0 against Alice's voiceprint)
        let speakers = fx.db.get_recording_speakers("rec1").unwrap();
        let s0 = speakers
            .iter()
            .find(|s| s.diarization_label == "SPEAKER_00")
            .unwrap();
        let s1 = speakers
            .iter()
            .find(|s| s.diarization_label == "SPEAKER_01")
            .unwrap();
        assert_eq!(s0.global_speaker_id, Some(alice));
        assert_eq!(s1.global_speaker_id, None);

        // Voiceprint reinforcement appended the new candidate
        assert_eq!(fx.db.get_speaker_embeddings(alice).unwrap().len(), 2);

        // Every stage reached a terminal recorded status
        let stages = fx.db.get_stages(run.id).unwrap();
        assert_eq!(stages.len(), StageKind::ORDER.len());
        assert!(stages
            .iter()
            .all(|s| matches!(s.status, StageStatus::Complete | StageStatus::Skipped)));
    }

    #[tokio::test]
    async fn test_failed_run_resumes_from_failed_stage() {
        let fx = fixture();
        seed_finalized(&fx, "rec1");
        fx.transcriber.fail_next.store(true, Ordering::SeqCst);

        let run = run_once(&fx).await;
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.error_stage.as_deref(), Some("TRANSCRIBE"));
        assert_eq!(
            fx.db.get_recording("rec1").unwrap().unwrap().state,
            RecordingState::Failed
        );

        // Earlier outputs are preserved and visible
        let validating = fx.db.get_stage(run.id, "VALIDATING").unwrap().unwrap();
        assert_eq!(validating.status, StageStatus::Complete);
        assert!(validating.output_json.is_some());

        // Resume re-runs only the failed stage and onward
        resume_run(&fx.db, run.id).unwrap();
        let resumed = run_once(&fx).await;
        assert_eq!(resumed.id, run.id);
        assert_eq!(resumed.state, RunState::Complete);
        assert_eq!(fx.vad.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.transcriber.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disabled_stage_records_skip_and_advances() {
        let fx = fixture_with(Config::default(), false); // no diarizer injected
        seed_finalized(&fx, "rec1");

        let run = run_once(&fx).await;
        assert_eq!(run.state, RunState::Complete);

        let diarize = fx.db.get_stage(run.id, "DIARIZE").unwrap().unwrap();
        assert_eq!(diarize.status, StageStatus::Skipped);

        // Without diarization the transcript still lands, unattributed
        let transcript = fx.db.get_transcript_segments("rec1").unwrap();
        assert!(!transcript.is_empty());
        assert!(transcript.iter().all(|s| s.speaker == merge::UNKNOWN_SPEAKER));
    }

    #[tokio::test]
    async fn test_corrupt_audio_fails_fast_before_heavy_stages() {
        let fx = fixture();
        let artifact = fx._tmp.path().join("garbage.wav");
        std::fs::write(&artifact, b"this is not audio").unwrap();
        fx.db.create_recording("rec1", "u1", "standup").unwrap();
        fx.db
            .mark_finalized("rec1", 1, &artifact.to_string_lossy(), 0.0, 17)
            .unwrap();
        fx.db.enqueue_run("rec1").unwrap();

        let run = run_once(&fx).await;
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.error_stage.as_deref(), Some("VALIDATING"));
        // No heavy stage was attempted
        assert_eq!(fx.transcriber.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.vad.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_requeues_at_stage_boundary() {
        let fx = fixture();
        seed_finalized(&fx, "rec1");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = fx.db.claim_next_queued_run().unwrap().unwrap();
        fx.runner.process_run(run.clone(), cancel).await;

        // Nothing executed, the run went back to the queue intact
        let requeued = fx.db.get_run(run.id).unwrap().unwrap();
        assert_eq!(requeued.state, RunState::Queued);
        assert_eq!(fx.transcriber.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_queue_timeout_fails_stale_runs() {
        let fx = fixture();
        seed_finalized(&fx, "rec1");
        // A zero-second timeout expires the freshly queued run immediately
        let expired = fx.db.fail_expired_queued_runs(0).unwrap();
        assert_eq!(expired, 1);
        let run = fx.db.latest_run_for_recording("rec1").unwrap().unwrap();
        assert_eq!(run.state, RunState::Failed);
    }
}
