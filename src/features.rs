//! Fixed-shape feature extraction.
//!
//! One waveform in, one `frames × bins` matrix per configured `FeatureKind` out:
//! 1. clamp the waveform to the target length (truncate or zero pad)
//! 2. Hann-windowed STFT with centered, reflect-padded frames
//! 3. magnitude → mel projection (Slaney scale, area normalised)
//! 4. decibels relative to the loudest value, floored at `-top_db`
//! 5. for MFCCs, DCT-II (orthonormal) keeping the first `n_coefficients`
//! 6. zero mean, unit peak normalisation, per matrix
//!
//! The log-mel spectrogram is computed once per waveform; MFCCs are derived from it.
//!
//! Clamping happens on the waveform, before the transform, so the frame count depends only
//! on configuration. The extractor is immutable after construction and shared across worker
//! threads behind an `Arc`.

use std::borrow::Cow;
use std::f64::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::config::{FeatureKind, PipelineConfig};
use crate::{Error, Result};

// Floor applied before taking logs, matching librosa's `amplitude_to_db` default.
const AMPLITUDE_FLOOR: f32 = 1e-5;

/// A dense, row-major `frames × bins` matrix of `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    frames: usize,
    bins: usize,
    data: Vec<f32>,
}

impl FeatureMatrix {
    /// Wrap row-major data. Fails if `data.len() != frames * bins`.
    pub fn from_vec(frames: usize, bins: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != frames * bins {
            return Err(Error::msg(format!(
                "feature data has {} values, expected {frames} x {bins}",
                data.len()
            )));
        }
        Ok(Self { frames, bins, data })
    }

    pub fn zeros(frames: usize, bins: usize) -> Self {
        Self {
            frames,
            bins,
            data: vec![0.0; frames * bins],
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.frames, self.bins]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// One frame's values.
    pub fn row(&self, frame: usize) -> &[f32] {
        let start = frame * self.bins;
        &self.data[start..start + self.bins]
    }

    pub fn get(&self, frame: usize, bin: usize) -> Option<f32> {
        if frame < self.frames && bin < self.bins {
            Some(self.data[frame * self.bins + bin])
        } else {
            None
        }
    }

    fn row_mut(&mut self, frame: usize) -> &mut [f32] {
        let start = frame * self.bins;
        &mut self.data[start..start + self.bins]
    }
}

/// One kind of matrix in a dataset, with the shape every item shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRegion {
    pub kind: FeatureKind,
    /// `(frames, bins)`.
    pub shape: [usize; 2],
}

/// Converts waveforms into normalised, fixed-shape feature matrices.
pub struct FeatureExtractor {
    kinds: Vec<FeatureKind>,
    sample_rate: u32,
    target_samples: usize,
    n_fft: usize,
    hop: usize,
    frames: usize,
    top_db: f32,
    window: Vec<f32>,
    // (n_mels, n_fft / 2 + 1)
    mel_filters: Vec<Vec<f32>>,
    // (n_coefficients, n_mels); empty unless MFCCs are requested.
    dct: Vec<Vec<f32>>,
    fft: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for FeatureExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureExtractor")
            .field("kinds", &self.kinds)
            .field("sample_rate", &self.sample_rate)
            .field("target_samples", &self.target_samples)
            .field("n_fft", &self.n_fft)
            .field("hop", &self.hop)
            .field("regions", &self.regions())
            .finish()
    }
}

impl FeatureExtractor {
    /// Build an extractor from a validated configuration.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;

        let n_fft = config.window_samples();
        let n_mels = config.features.n_mels;
        let mel_filters = mel_filterbank(config.audio.sample_rate, n_fft, n_mels);
        let dct = if config.features.kinds.contains(&FeatureKind::Mfcc) {
            dct_matrix(config.features.n_coefficients, n_mels)
        } else {
            Vec::new()
        };

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n_fft);

        Ok(Self {
            kinds: config.features.kinds.clone(),
            sample_rate: config.audio.sample_rate,
            target_samples: config.target_samples(),
            n_fft,
            hop: config.hop_samples(),
            frames: config.frames(),
            top_db: config.features.top_db,
            window: hann_window(n_fft),
            mel_filters,
            dct,
            fft,
        })
    }

    pub fn kinds(&self) -> &[FeatureKind] {
        &self.kinds
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn target_samples(&self) -> usize {
        self.target_samples
    }

    /// Kind and shape of each matrix `extract` returns, in order.
    pub fn regions(&self) -> Vec<FeatureRegion> {
        self.kinds
            .iter()
            .map(|&kind| {
                let bins = match kind {
                    FeatureKind::LogMel => self.mel_filters.len(),
                    FeatureKind::Mfcc => self.dct.len(),
                };
                FeatureRegion {
                    kind,
                    shape: [self.frames, bins],
                }
            })
            .collect()
    }

    /// Extract one normalised matrix per configured kind from mono samples at
    /// `sample_rate()`.
    pub fn extract(&self, samples: &[f32]) -> Vec<FeatureMatrix> {
        let clamped = fit_to_length(samples, self.target_samples);
        let log_mel = self.log_mel(&clamped);

        self.kinds
            .iter()
            .map(|kind| {
                let mut features = match kind {
                    FeatureKind::LogMel => log_mel.clone(),
                    FeatureKind::Mfcc => self.cepstrum(&log_mel),
                };
                normalize(&mut features);
                features
            })
            .collect()
    }

    fn log_mel(&self, samples: &[f32]) -> FeatureMatrix {
        let n_freq = self.n_fft / 2 + 1;
        let n_mels = self.mel_filters.len();
        let pad = self.n_fft / 2;
        let padded = reflect_pad(samples, pad);

        let mut out = FeatureMatrix::zeros(self.frames, n_mels);
        let mut buf = vec![Complex::new(0.0f32, 0.0); self.n_fft];
        let mut magnitudes = vec![0.0f32; n_freq];

        for frame in 0..self.frames {
            let start = frame * self.hop;
            for (i, slot) in buf.iter_mut().enumerate() {
                let x = padded.get(start + i).copied().unwrap_or_default();
                *slot = Complex::new(x * self.window[i], 0.0);
            }

            self.fft.process(&mut buf);

            for (mag, c) in magnitudes.iter_mut().zip(buf.iter()) {
                *mag = c.norm();
            }

            for (value, filter) in out.row_mut(frame).iter_mut().zip(self.mel_filters.iter()) {
                *value = filter
                    .iter()
                    .zip(magnitudes.iter())
                    .map(|(w, m)| w * m)
                    .sum();
            }
        }

        amplitude_to_db(&mut out, self.top_db);
        out
    }

    fn cepstrum(&self, log_mel: &FeatureMatrix) -> FeatureMatrix {
        let mut out = FeatureMatrix::zeros(log_mel.frames(), self.dct.len());
        for frame in 0..log_mel.frames() {
            let mel_row = log_mel.row(frame);
            for (coef, basis) in out.row_mut(frame).iter_mut().zip(self.dct.iter()) {
                *coef = basis.iter().zip(mel_row).map(|(b, m)| b * m).sum();
            }
        }
        out
    }
}

/// Truncate or zero pad a waveform to exactly `target` samples.
pub fn fit_to_length(samples: &[f32], target: usize) -> Cow<'_, [f32]> {
    match samples.len().cmp(&target) {
        std::cmp::Ordering::Equal => Cow::Borrowed(samples),
        std::cmp::Ordering::Greater => Cow::Borrowed(&samples[..target]),
        std::cmp::Ordering::Less => {
            let mut padded = Vec::with_capacity(target);
            padded.extend_from_slice(samples);
            padded.resize(target, 0.0);
            Cow::Owned(padded)
        }
    }
}

/// Center to zero mean, then scale to unit peak magnitude.
///
/// A matrix whose centered values are all zero (silence, constant energy) is returned
/// centered but unscaled, so no NaN or infinity ever leaves the extractor.
pub fn normalize(features: &mut FeatureMatrix) {
    if features.data.is_empty() {
        return;
    }

    let mean = features.data.iter().map(|&v| f64::from(v)).sum::<f64>()
        / features.data.len() as f64;
    let mean = mean as f32;

    let mut peak = 0.0f32;
    for v in &mut features.data {
        *v -= mean;
        peak = peak.max(v.abs());
    }

    if peak > 0.0 && peak.is_finite() {
        for v in &mut features.data {
            *v /= peak;
        }
    }
}

fn amplitude_to_db(features: &mut FeatureMatrix, top_db: f32) {
    let reference = features
        .data
        .iter()
        .copied()
        .fold(AMPLITUDE_FLOOR, f32::max);
    let ref_db = 20.0 * reference.log10();

    let mut max_db = f32::NEG_INFINITY;
    for v in &mut features.data {
        *v = 20.0 * v.max(AMPLITUDE_FLOOR).log10() - ref_db;
        max_db = max_db.max(*v);
    }

    let floor = max_db - top_db;
    for v in &mut features.data {
        *v = v.max(floor);
    }
}

// Periodic Hann window (`scipy.signal.get_window("hann", n, fftbins=True)`).
fn hann_window(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| (0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos()) as f32)
        .collect()
}

fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    if samples.is_empty() {
        return vec![0.0; pad * 2];
    }

    let len = samples.len() as isize;
    (-(pad as isize)..len + pad as isize)
        .map(|i| samples[reflect_index(i, samples.len())])
        .collect()
}

// Mirror an out-of-range index back into `0..len` without repeating the edge sample.
fn reflect_index(i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let m = i.rem_euclid(period);
    if m < len as isize {
        m as usize
    } else {
        (period - m) as usize
    }
}

fn hz_to_mel(hz: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;

    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / logstep
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;

    if mel >= min_log_mel {
        MIN_LOG_HZ * (logstep * (mel - min_log_mel)).exp()
    } else {
        F_SP * mel
    }
}

/// Slaney-style triangular mel filters over `0..sample_rate / 2`.
fn mel_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize) -> Vec<Vec<f32>> {
    let n_freq = n_fft / 2 + 1;
    let sr = f64::from(sample_rate);
    let fft_freqs: Vec<f64> = (0..n_freq).map(|k| k as f64 * sr / n_fft as f64).collect();

    let mel_min = hz_to_mel(0.0);
    let mel_max = hz_to_mel(sr / 2.0);
    let points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    (0..n_mels)
        .map(|m| {
            let (lower, center, upper) = (points[m], points[m + 1], points[m + 2]);
            let enorm = 2.0 / (upper - lower);
            fft_freqs
                .iter()
                .map(|&f| {
                    let rising = (f - lower) / (center - lower);
                    let falling = (upper - f) / (upper - center);
                    (rising.min(falling).max(0.0) * enorm) as f32
                })
                .collect()
        })
        .collect()
}

/// Orthonormal DCT-II basis, `n_out` rows of length `n_in`.
fn dct_matrix(n_out: usize, n_in: usize) -> Vec<Vec<f32>> {
    let n = n_in as f64;
    (0..n_out)
        .map(|k| {
            let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
            (0..n_in)
                .map(|i| (scale * (PI / n * (i as f64 + 0.5) * k as f64).cos()) as f32)
                .collect()
        })
        .collect()
}
