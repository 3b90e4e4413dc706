use anyhow::{Context, Result, bail};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

// Source frames fed to rubato per `process()` call.
const CHUNK_FRAMES: usize = 2048;

/// Downmix interleaved samples into mono by averaging channels.
///
/// Policy: equal-weight average across channels (simple, predictable).
pub fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample a whole mono buffer from `from_rate` to `to_rate`.
///
/// The output has exactly `round(len * to_rate / from_rate)` samples: the resampler's
/// group delay is trimmed from the front and the tail is flushed with silence.
pub fn resample_mono(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == 0 || to_rate == 0 {
        bail!("cannot resample from {from_rate} Hz to {to_rate} Hz");
    }
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let expected = (samples.len() as f64 * ratio).round() as usize;

    let mut resampler = SincFixedIn::<f32>::new(
        ratio,
        2.0,
        SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        },
        CHUNK_FRAMES,
        1,
    )
    .context("failed to init resampler")?;

    let delay = resampler.output_delay();
    let mut out = Vec::with_capacity(expected + delay);
    let mut block = Vec::with_capacity(CHUNK_FRAMES);
    let mut pos = 0usize;

    while out.len() < expected + delay {
        let need = resampler.input_frames_next();
        let end = (pos + need).min(samples.len());

        block.clear();
        block.extend_from_slice(&samples[pos.min(end)..end]);
        block.resize(need, 0.0);
        pos = end;

        let processed = resampler
            .process(std::slice::from_ref(&block), None)
            .context("resampler process failed")?;
        let Some(channel) = processed.first() else {
            bail!("expected mono output from resampler");
        };
        out.extend_from_slice(channel);
    }

    out.drain(..delay.min(out.len()));
    out.truncate(expected);
    out.resize(expected, 0.0);
    Ok(out)
}
