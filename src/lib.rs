//! `featstage`: turns an audio corpus into a fixed-shape, model-ready dataset.
//!
//! This crate provides:
//! - Audio loading (any Symphonia-supported format, downmixed and resampled)
//! - Feature extraction (log-mel spectrograms or MFCCs, clamped to a fixed frame count)
//! - Character vocabularies and fixed-length label encoding
//! - A memory-guarded worker pool that processes the corpus batch by batch
//! - Staged per-batch artifacts folded into a single dataset container
//!
//! Most consumers should start with [`pipeline::Pipeline`].

// High-level API.
pub mod config;
pub mod pipeline;

// Corpus manifests and label encoding.
pub mod corpus;
pub mod vocab;

// Audio loading and feature extraction.
pub mod audio;
pub mod features;

// Batch execution.
pub mod memory;
pub mod pool;

// Staged artifacts and the assembled dataset.
pub mod assembler;
pub mod container;
pub mod staging;

// Logging configuration and control.
#[cfg(feature = "logging")]
pub mod logging;

mod error;

pub use config::{FeatureKind, PipelineConfig};
pub use corpus::CorpusEntry;
pub use error::{Error, Result};
pub use pipeline::{NoopObserver, Pipeline, PipelineObserver, PipelineState, PipelineSummary};
pub use vocab::Vocabulary;
