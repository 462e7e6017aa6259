use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// A finished segment file ready for upload.
#[derive(Debug, Clone)]
pub struct CompletedSegment {
    pub recording_id: String,
    pub sequence: u32,
    pub path: PathBuf,
    pub samples: u64,
    pub duration_seconds: f64,
}

/// Slices a continuous mono capture stream into bounded-duration WAV files.
///
/// Rollover is sample-accurate: the sample that would exceed the configured
/// maximum opens the next file, so nothing is dropped or duplicated at a
/// boundary and capture never pauses. Sequence numbers are assigned at
/// creation and never reused.
pub struct SegmentWriter {
    recording_id: String,
    dir: PathBuf,
    spec: hound::WavSpec,
    max_samples_per_segment: u64,
    sequence: u32,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    samples_in_segment: u64,
    current_path: PathBuf,
}

impl SegmentWriter {
    pub fn new(
        recording_id: &str,
        dir: &Path,
        sample_rate: u32,
        max_segment_duration_secs: u64,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create segment dir {:?}", dir))?;
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        Ok(Self {
            recording_id: recording_id.to_string(),
            dir: dir.to_path_buf(),
            spec,
            max_samples_per_segment: sample_rate as u64 * max_segment_duration_secs,
            sequence: 0,
            writer: None,
            samples_in_segment: 0,
            current_path: PathBuf::new(),
        })
    }

    fn segment_path(&self, sequence: u32) -> PathBuf {
        self.dir
            .join(format!("{}_{:05}.wav", self.recording_id, sequence))
    }

    fn open_segment(&mut self) -> Result<()> {
        let path = self.segment_path(self.sequence);
        let writer = hound::WavWriter::create(&path, self.spec)
            .with_context(|| format!("failed to create segment {:?}", path))?;
        log::debug!("Opened segment {} at {:?}", self.sequence, path);
        self.writer = Some(writer);
        self.samples_in_segment = 0;
        self.current_path = path;
        Ok(())
    }

    fn roll_segment(&mut self) -> Result<CompletedSegment> {
        let writer = self.writer.take().expect("roll without open segment");
        writer.finalize()?;
        let completed = CompletedSegment {
            recording_id: self.recording_id.clone(),
            sequence: self.sequence,
            path: self.current_path.clone(),
            samples: self.samples_in_segment,
            duration_seconds: self.samples_in_segment as f64 / self.spec.sample_rate as f64,
        };
        log::info!(
            "Segment {} finished ({:.1}s, {:?})",
            completed.sequence,
            completed.duration_seconds,
            completed.path
        );
        self.sequence += 1;
        Ok(completed)
    }

    /// Append captured samples, returning any segments completed by the write.
    /// A single large buffer can complete more than one segment.
    pub fn push_samples(&mut self, samples: &[i16]) -> Result<Vec<CompletedSegment>> {
        let mut completed = Vec::new();
        let mut remaining = samples;

        while !remaining.is_empty() {
            if self.writer.is_none() {
                self.open_segment()?;
            }
            let room = (self.max_samples_per_segment - self.samples_in_segment) as usize;
            let take = remaining.len().min(room);

            let writer = self.writer.as_mut().unwrap();
            for &sample in &remaining[..take] {
                writer.write_sample(sample)?;
            }
            self.samples_in_segment += take as u64;
            remaining = &remaining[take..];

            if self.samples_in_segment >= self.max_samples_per_segment {
                completed.push(self.roll_segment()?);
            }
        }

        Ok(completed)
    }

    /// Flush the in-progress partial segment, whatever its duration, as the
    /// final sequence-numbered segment. Returns None if nothing was captured
    /// since the last rollover.
    pub fn finish(mut self) -> Result<Option<CompletedSegment>> {
        if self.writer.is_some() && self.samples_in_segment > 0 {
            return Ok(Some(self.roll_segment()?));
        }
        if let Some(writer) = self.writer.take() {
            // Opened but empty: discard rather than upload a zero-length file.
            writer.finalize()?;
            let _ = std::fs::remove_file(&self.current_path);
        }
        Ok(None)
    }

    /// Sequence number the next completed segment will carry.
    pub fn next_sequence(&self) -> u32 {
        self.sequence
    }
}
