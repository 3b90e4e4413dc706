use std::path::Path;

use anyhow::{Context, Result, bail};
use hound::{SampleFormat, WavReader};

use super::{Decoded, FrameBudget};
use super::resample::downmix_to_mono;

/// Read a WAV file into mono `f32` samples in `[-1.0, 1.0]`.
///
/// Unlike a transcription front end we accept any channel count, bit depth and sample
/// rate here; downmixing and resampling happen afterwards. A `budget` caps how many frames
/// are read.
pub(super) fn read_wav(path: &Path, budget: Option<FrameBudget>) -> Result<Decoded> {
    let mut reader = WavReader::open(path)
        .with_context(|| format!("failed to open WAV file '{}'", path.display()))?;
    let spec = reader.spec();

    if spec.channels == 0 {
        bail!("WAV header declares zero channels");
    }

    let channels = usize::from(spec.channels);
    let max_samples = budget
        .map(|b| b.frames_at(spec.sample_rate).saturating_mul(channels))
        .unwrap_or(usize::MAX);

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .take(max_samples)
            .collect::<std::result::Result<_, _>>()
            .context("failed to read float WAV samples")?,
        SampleFormat::Int => {
            if !(1..=32).contains(&spec.bits_per_sample) {
                bail!("unsupported WAV bit depth {}", spec.bits_per_sample);
            }
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .take(max_samples)
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .context("failed to read integer WAV samples")?
        }
    };

    Ok(Decoded {
        samples: downmix_to_mono(&interleaved, channels),
        sample_rate: spec.sample_rate,
    })
}
