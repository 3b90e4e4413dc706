//! Audio loading for feature extraction.
//!
//! Every corpus entry goes through the same three steps:
//! - decode the file into interleaved PCM (`hound` for WAV, `symphonia` for everything else)
//! - downmix to mono by averaging channels
//! - resample to the configured rate when the source differs
//!
//! Failures are reported as `Error::Audio`, which the worker pool treats as item-level.

mod decoder;
mod resample;
mod wav;

use std::path::Path;

use anyhow::{Result, bail};

use crate::Error;

pub use resample::{downmix_to_mono, resample_mono};

// Extra native frames kept past the clamp so the resampler's window sees real signal.
const RESAMPLE_MARGIN: usize = 256;

/// Decoded mono PCM at its native sample rate.
#[derive(Debug, Clone)]
pub(crate) struct Decoded {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// How much of a file is worth decoding when only a prefix is kept.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameBudget {
    target_samples: usize,
    target_rate: u32,
}

impl FrameBudget {
    /// Native frames needed to yield `target_samples` at `target_rate`.
    pub(crate) fn frames_at(&self, native_rate: u32) -> usize {
        let needed = (self.target_samples as u64 * u64::from(native_rate))
            .div_ceil(u64::from(self.target_rate.max(1)));
        usize::try_from(needed)
            .unwrap_or(usize::MAX)
            .saturating_add(RESAMPLE_MARGIN)
    }
}

/// Load an audio file as mono `f32` samples at `sample_rate`.
pub fn load_mono(path: &Path, sample_rate: u32) -> crate::Result<Vec<f32>> {
    load_mono_impl(path, sample_rate, None).map_err(|err| audio_error(path, err))
}

/// Like `load_mono`, but stops decoding once enough audio for `target_samples` output
/// samples is buffered. The result may still be longer than `target_samples`.
pub fn load_mono_clamped(
    path: &Path,
    sample_rate: u32,
    target_samples: usize,
) -> crate::Result<Vec<f32>> {
    let budget = FrameBudget {
        target_samples,
        target_rate: sample_rate,
    };
    load_mono_impl(path, sample_rate, Some(budget)).map_err(|err| audio_error(path, err))
}

fn audio_error(path: &Path, err: anyhow::Error) -> Error {
    Error::Audio {
        path: path.to_path_buf(),
        message: format!("{err:#}"),
    }
}

fn load_mono_impl(path: &Path, sample_rate: u32, budget: Option<FrameBudget>) -> Result<Vec<f32>> {
    let decoded = if has_wav_extension(path) {
        match wav::read_wav(path, budget) {
            Ok(decoded) => decoded,
            Err(err) => {
                // WAVE_FORMAT_EXTENSIBLE and friends: let symphonia have a go.
                tracing::debug!(path = %path.display(), error = %format!("{err:#}"), "hound rejected wav, falling back to symphonia");
                decoder::decode_file(path, budget)?
            }
        }
    } else {
        decoder::decode_file(path, budget)?
    };

    if decoded.sample_rate == 0 {
        bail!("audio reports a sample rate of 0 Hz");
    }

    resample_mono(&decoded.samples, decoded.sample_rate, sample_rate)
}

fn has_wav_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, frames: usize) -> anyhow::Result<()> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let v = (t * 440.0 * std::f32::consts::TAU).sin() * 0.5;
            for _ in 0..channels {
                writer.write_sample((v * i16::MAX as f32) as i16)?;
            }
        }
        writer.finalize()?;
        Ok(())
    }

    #[test]
    fn loads_wav_at_native_rate() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tone.wav");
        write_wav(&path, 8_000, 1, 800)?;

        let samples = load_mono(&path, 8_000)?;
        assert_eq!(samples.len(), 800);
        assert!(samples.iter().all(|s| (-1.0..=1.0).contains(s)));
        Ok(())
    }

    #[test]
    fn downmixes_stereo_wav() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 8_000, 2, 400)?;

        let samples = load_mono(&path, 8_000)?;
        assert_eq!(samples.len(), 400);
        Ok(())
    }

    #[test]
    fn resamples_to_target_rate() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("wide.wav");
        write_wav(&path, 16_000, 1, 16_000)?;

        let samples = load_mono(&path, 8_000)?;
        assert_eq!(samples.len(), 8_000);
        assert!(samples.iter().all(|s| s.is_finite()));
        Ok(())
    }

    #[test]
    fn clamped_load_stops_early_and_keeps_the_prefix() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("long.wav");
        write_wav(&path, 8_000, 1, 16_000)?;

        let full = load_mono(&path, 8_000)?;
        let clamped = load_mono_clamped(&path, 8_000, 1_000)?;

        assert!(clamped.len() >= 1_000);
        assert!(clamped.len() < full.len());
        assert_eq!(&clamped[..], &full[..clamped.len()]);
        Ok(())
    }

    #[test]
    fn budget_scales_with_the_native_rate() {
        let budget = FrameBudget {
            target_samples: 1_000,
            target_rate: 8_000,
        };
        assert_eq!(budget.frames_at(8_000), 1_000 + RESAMPLE_MARGIN);
        assert_eq!(budget.frames_at(16_000), 2_000 + RESAMPLE_MARGIN);
        assert_eq!(budget.frames_at(11_025), 1_379 + RESAMPLE_MARGIN);
    }

    #[test]
    fn clamped_symphonia_decode_matches_the_prefix() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let wav_path = dir.path().join("long.wav");
        write_wav(&wav_path, 8_000, 2, 16_000)?;
        // No .wav extension, so the symphonia path is taken.
        let path = dir.path().join("long.audio");
        std::fs::rename(&wav_path, &path)?;

        let full = load_mono(&path, 8_000)?;
        let clamped = load_mono_clamped(&path, 8_000, 1_000)?;

        assert!(clamped.len() >= 1_000 + RESAMPLE_MARGIN);
        assert!(clamped.len() < full.len());
        assert_eq!(&clamped[..], &full[..clamped.len()]);
        Ok(())
    }

    #[test]
    fn garbage_input_is_an_item_level_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.wav");
        std::fs::write(&path, b"definitely not audio")?;

        let err = load_mono(&path, 16_000).unwrap_err();
        assert!(matches!(err, Error::Audio { .. }));
        assert!(err.to_string().contains("broken.wav"));
        Ok(())
    }

    #[test]
    fn missing_file_is_an_item_level_error() {
        let err = load_mono(Path::new("/nonexistent/featstage.flac"), 16_000).unwrap_err();
        assert!(matches!(err, Error::Audio { .. }));
    }
}
