use crate::database::{Database, RecordingState, StageStatus};
use crate::error::AppError;
use crate::pipeline::stage::StageKind;
use serde::Serialize;

/// Per-stage row of the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct StageStatusRow {
    pub stage: String,
    pub status: StageStatus,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub error_detail: Option<String>,
}

/// Snapshot of where a recording stands, for polling or push consumers.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub recording_id: String,
    pub state: RecordingState,
    pub current_stage: Option<String>,
    pub stages: Vec<StageStatusRow>,
    pub error_detail: Option<String>,
}

/// Assemble the status snapshot from the persisted run and stage rows.
/// Stages that have not been reached yet appear as pending, so the consumer
/// always sees the full declared sequence.
pub fn pipeline_status(db: &Database, recording_id: &str) -> Result<PipelineStatus, AppError> {
    let recording = db
        .get_recording(recording_id)?
        .ok_or_else(|| AppError::NotFound(format!("recording {}", recording_id)))?;

    let run = db.latest_run_for_recording(recording_id)?;

    let (current_stage, error_detail, stage_rows) = match &run {
        Some(run) => {
            let records = db.get_stages(run.id)?;
            (run.current_stage.clone(), run.error_detail.clone(), records)
        }
        None => (None, None, Vec::new()),
    };

    let stages = StageKind::ORDER
        .iter()
        .map(|kind| {
            let record = stage_rows.iter().find(|r| r.stage == kind.name());
            match record {
                Some(r) => StageStatusRow {
                    stage: r.stage.clone(),
                    status: r.status,
                    started_at: r.started_at.clone(),
                    ended_at: r.ended_at.clone(),
                    error_detail: r.error_detail.clone(),
                },
                None => StageStatusRow {
                    stage: kind.name().to_string(),
                    status: StageStatus::Pending,
                    started_at: None,
                    ended_at: None,
                    error_detail: None,
                },
            }
        })
        .collect();

    Ok(PipelineStatus {
        recording_id: recording.id,
        state: recording.state,
        current_stage,
        stages,
        error_detail,
    })
}

impl PipelineStatus {
    /// The run's failure as a typed error, if any stage failed.
    pub fn failure(&self) -> Option<AppError> {
        self.stages
            .iter()
            .find(|s| s.status == StageStatus::Failed)
            .map(|s| AppError::StageFailed {
                stage: s.stage.clone(),
                detail: s.error_detail.clone().unwrap_or_default(),
            })
    }
}
