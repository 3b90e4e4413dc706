//! Pipeline configuration.
//!
//! One immutable `PipelineConfig` is built at startup (from TOML, CLI flags, or code) and
//! passed by reference into every component. Nothing reads configuration from ambient state.
//!
//! `validate()` runs before any batch work so that bad values fail fast with
//! `Error::Config` instead of surfacing halfway through a corpus.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch: BatchConfig,
    pub audio: AudioConfig,
    pub features: FeatureConfig,
    pub labels: LabelConfig,
    pub memory: MemoryConfig,
    pub output: OutputConfig,
}

/// Batching and concurrency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    /// Corpus entries per batch; the unit of staging and memory accounting.
    pub samples_per_batch: usize,

    /// Worker threads in the extraction pool. `None` means one per logical CPU.
    pub workers: Option<usize>,
}

/// Audio loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Every input is resampled to this rate (Hz) before feature extraction.
    pub sample_rate: u32,

    /// Waveforms are truncated or zero padded to this many seconds.
    pub max_audio_length: f32,
}

/// A feature matrix the extractor can emit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Log-scaled mel spectrogram, `n_mels` bins per frame.
    LogMel,

    /// Mel-frequency cepstral coefficients, `n_coefficients` per frame.
    Mfcc,
}

impl FeatureKind {
    // On-disk tag shared by staged artifacts and the dataset container.
    pub(crate) fn tag(self) -> u8 {
        match self {
            FeatureKind::LogMel => 1,
            FeatureKind::Mfcc => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FeatureKind::LogMel),
            2 => Some(FeatureKind::Mfcc),
            _ => None,
        }
    }
}

/// STFT / mel / DCT parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeatureConfig {
    /// Matrices emitted per item, one container region each, in this order.
    pub kinds: Vec<FeatureKind>,

    /// Analysis window length in seconds (also the FFT size).
    pub window_length: f32,

    /// Hop between frames in seconds.
    pub hop_length: f32,

    pub n_mels: usize,
    pub n_coefficients: usize,

    /// Dynamic range kept below the loudest mel value, in dB.
    pub top_db: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LabelConfig {
    /// Every label sequence is padded or truncated to this length.
    pub max_transcript_length: usize,

    /// Pad labels to the feature frame count instead of `max_transcript_length`.
    pub align_to_frames: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Extraction aborts once available system memory is at or below this percentage.
    pub critical_percent: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Staged artifacts are named `<staging_prefix>_Batch<N>.<staging_extension>`.
    pub staging_prefix: String,
    pub staging_extension: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            samples_per_batch: 32,
            workers: None,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            max_audio_length: 18.0,
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            kinds: vec![FeatureKind::Mfcc],
            window_length: 0.025,
            hop_length: 0.010,
            n_mels: 128,
            n_coefficients: 13,
            top_db: 80.0,
        }
    }
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            max_transcript_length: 350,
            align_to_frames: false,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            critical_percent: 10.0,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            staging_prefix: "Features".to_string(),
            staging_extension: "stage.gz".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate configuration from a TOML file.
    ///
    /// Missing fields use default values; unknown values fail validation.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the pipeline misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.batch.samples_per_batch == 0 {
            return Err(Error::config("batch.samples_per_batch must be at least 1"));
        }
        if self.batch.workers == Some(0) {
            return Err(Error::config("batch.workers must be at least 1"));
        }
        if self.audio.sample_rate == 0 {
            return Err(Error::config("audio.sample_rate must be positive"));
        }
        require_positive("audio.max_audio_length", self.audio.max_audio_length)?;
        require_positive("features.window_length", self.features.window_length)?;
        require_positive("features.hop_length", self.features.hop_length)?;
        require_positive("features.top_db", self.features.top_db)?;

        if self.target_samples() == 0 {
            return Err(Error::config(
                "audio.max_audio_length is shorter than one sample",
            ));
        }
        if self.window_samples() < 2 {
            return Err(Error::config(
                "features.window_length must cover at least two samples",
            ));
        }
        if self.hop_samples() == 0 {
            return Err(Error::config(
                "features.hop_length must cover at least one sample",
            ));
        }
        if self.hop_samples() > self.window_samples() {
            return Err(Error::config(
                "features.hop_length must not exceed features.window_length",
            ));
        }
        if self.features.n_mels == 0 {
            return Err(Error::config("features.n_mels must be at least 1"));
        }
        if self.features.kinds.is_empty() {
            return Err(Error::config("features.kinds must name at least one kind"));
        }
        for (i, kind) in self.features.kinds.iter().enumerate() {
            if self.features.kinds[..i].contains(kind) {
                return Err(Error::config(format!(
                    "features.kinds lists {kind:?} more than once"
                )));
            }
        }
        if self.features.kinds.contains(&FeatureKind::Mfcc)
            && !(1..=self.features.n_mels).contains(&self.features.n_coefficients)
        {
            return Err(Error::config(format!(
                "features.n_coefficients must be between 1 and n_mels ({})",
                self.features.n_mels
            )));
        }
        if !self.labels.align_to_frames && self.labels.max_transcript_length == 0 {
            return Err(Error::config(
                "labels.max_transcript_length must be at least 1",
            ));
        }

        let critical = self.memory.critical_percent;
        if !critical.is_finite() || !(0.0..100.0).contains(&critical) {
            return Err(Error::config(
                "memory.critical_percent must be within [0, 100)",
            ));
        }

        validate_file_component("output.staging_prefix", &self.output.staging_prefix)?;
        validate_file_component("output.staging_extension", &self.output.staging_extension)?;

        Ok(())
    }

    /// Number of worker threads the extraction pool should run.
    pub fn worker_count(&self) -> usize {
        self.batch.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Waveform length every input is clamped to, in samples.
    pub fn target_samples(&self) -> usize {
        seconds_to_samples(self.audio.max_audio_length, self.audio.sample_rate)
    }

    /// STFT window (and FFT) size in samples.
    pub fn window_samples(&self) -> usize {
        seconds_to_samples(self.features.window_length, self.audio.sample_rate)
    }

    /// STFT hop in samples.
    pub fn hop_samples(&self) -> usize {
        seconds_to_samples(self.features.hop_length, self.audio.sample_rate)
    }

    /// Frames per feature matrix (centered STFT over the clamped waveform).
    pub fn frames(&self) -> usize {
        1 + self.target_samples() / self.hop_samples().max(1)
    }

    /// Values per frame of a `kind` matrix.
    pub fn bins(&self, kind: FeatureKind) -> usize {
        match kind {
            FeatureKind::LogMel => self.features.n_mels,
            FeatureKind::Mfcc => self.features.n_coefficients,
        }
    }

    /// `(frames, bins)` of each configured kind, in `features.kinds` order.
    pub fn feature_shapes(&self) -> Vec<[usize; 2]> {
        self.features
            .kinds
            .iter()
            .map(|&kind| [self.frames(), self.bins(kind)])
            .collect()
    }

    /// Length of every label sequence.
    pub fn label_len(&self) -> usize {
        if self.labels.align_to_frames {
            self.frames()
        } else {
            self.labels.max_transcript_length
        }
    }
}

// Whole samples, rounded down. Products within 1e-3 of an integer snap to it so that
// f32 durations such as 0.01 s at 16 kHz give 160 rather than 159.
fn seconds_to_samples(seconds: f32, sample_rate: u32) -> usize {
    let exact = f64::from(seconds) * f64::from(sample_rate);
    let nearest = exact.round();
    let samples = if (exact - nearest).abs() < 1e-3 {
        nearest
    } else {
        exact.floor()
    };
    if samples.is_finite() && samples > 0.0 {
        samples as usize
    } else {
        0
    }
}

fn require_positive(key: &str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(Error::config(format!(
            "{key} must be a positive number, got {value}"
        )))
    }
}

fn validate_file_component(key: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::config(format!("{key} must not be empty")));
    }
    if value.contains(['/', '\\']) {
        return Err(Error::config(format!(
            "{key} must not contain path separators"
        )));
    }
    Ok(())
}
