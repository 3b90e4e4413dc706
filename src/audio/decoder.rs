//! Whole-file decoding through Symphonia.
//!
//! Error policy while iterating packets:
//! - `DecodeError` skips the bad frame (common with some codecs)
//! - `IoError` / `ResetRequired` end the stream
//! - anything else is fatal for this file

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::{Decoded, FrameBudget};
use super::resample::downmix_to_mono;

/// Decode `path` to mono. With a `budget`, packets stop being read once enough frames are
/// buffered and the result is cut to that many frames.
pub(super) fn decode_file(path: &Path, budget: Option<FrameBudget>) -> Result<Decoded> {
    let file =
        File::open(path).with_context(|| format!("failed to open '{}'", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| anyhow!(e))
        .context("failed to probe media container")?;
    let mut format = probed.format;

    // First decodable track with a known sample rate.
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
        .cloned()
        .ok_or_else(|| anyhow!("no audio track found"))?;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("audio track has no sample rate"))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| anyhow!(e))
        .context("failed to create decoder for audio track")?;

    let limit = budget.map(|b| b.frames_at(sample_rate));
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut sample_buf_frames = 0usize;
    let mut mono = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(anyhow!(e)).context("failed reading packet"),
        };

        if packet.track_id() != track.id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(reason)) => {
                tracing::debug!(path = %path.display(), reason, "skipping undecodable frame");
                continue;
            }
            Err(SymphoniaError::IoError(_)) => break,
            Err(e) => return Err(anyhow!(e)).context("decoder failure"),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        if channels == 0 {
            bail!("decoded audio had zero channels");
        }

        // Packets can grow (e.g. variable frame sizes), so size the scratch buffer to the largest seen.
        if sample_buf.is_none() || decoded.capacity() > sample_buf_frames {
            sample_buf_frames = decoded.capacity();
            sample_buf = Some(SampleBuffer::<f32>::new(sample_buf_frames as u64, spec));
        }

        let buf = sample_buf
            .as_mut()
            .ok_or_else(|| anyhow!("sample buffer not initialized"))?;
        buf.copy_interleaved_ref(decoded);
        mono.extend(downmix_to_mono(buf.samples(), channels));

        if limit.is_some_and(|limit| mono.len() >= limit) {
            break;
        }
    }

    if let Some(limit) = limit {
        mono.truncate(limit);
    }

    Ok(Decoded {
        samples: mono,
        sample_rate,
    })
}
