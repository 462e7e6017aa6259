use anyhow::{anyhow, Context, Result};
use std::path::Path;

/// Summary of a WAV artifact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub total_samples: u64,
    pub duration_seconds: f64,
}

/// Open a WAV file and check it is readable and non-empty. This is the cheap
/// gate the pipeline runs before any heavy stage.
pub fn validate_wav(path: &Path) -> Result<WavInfo> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("failed to open wav {:?}", path))?;
    let spec = reader.spec();
    let total_samples = reader.duration() as u64;
    if total_samples == 0 {
        return Err(anyhow!("wav file {:?} contains no samples", path));
    }
    if spec.sample_rate == 0 {
        return Err(anyhow!("wav file {:?} has a zero sample rate", path));
    }
    Ok(WavInfo {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        bits_per_sample: spec.bits_per_sample,
        total_samples,
        duration_seconds: total_samples as f64 / spec.sample_rate as f64,
    })
}

/// Concatenate WAV segments, in the order given, into one artifact.
///
/// Raw sample append only: every input must carry the identical spec as the
/// first, and no resampling or re-encoding happens across boundaries, so the
/// output duration is exactly the sum of the inputs.
pub fn concatenate_wavs<P: AsRef<Path>>(inputs: &[P], output: &Path) -> Result<WavInfo> {
    let first = inputs
        .first()
        .ok_or_else(|| anyhow!("no segments to concatenate"))?;
    let spec = hound::WavReader::open(first.as_ref())
        .with_context(|| format!("failed to open segment {:?}", first.as_ref()))?
        .spec();

    let mut writer = hound::WavWriter::create(output, spec)
        .with_context(|| format!("failed to create artifact {:?}", output))?;
    let mut total_samples: u64 = 0;

    for input in inputs {
        let mut reader = hound::WavReader::open(input.as_ref())
            .with_context(|| format!("failed to open segment {:?}", input.as_ref()))?;
        if reader.spec() != spec {
            return Err(anyhow!(
                "segment {:?} spec {:?} does not match first segment spec {:?}",
                input.as_ref(),
                reader.spec(),
                spec
            ));
        }
        for sample in reader.samples::<i16>() {
            writer.write_sample(sample?)?;
            total_samples += 1;
        }
    }

    writer.finalize()?;

    // total_samples counts interleaved values; duration is per-channel frames
    let frames = total_samples / spec.channels as u64;
    Ok(WavInfo {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        bits_per_sample: spec.bits_per_sample,
        total_samples: frames,
        duration_seconds: frames as f64 / spec.sample_rate as f64,
    })
}
