//! The pipeline driver.
//!
//! Sequences the corpus batch by batch through extraction and staging, then hands the staged
//! artifacts to the assembler:
//!
//! ```text
//! Idle → Extracting(i) → Staging(i) → (Extracting(i + 1) | Assembling) → Done
//!              ↘ Aborted(i)    ↘ Failed                      ↘ Aborted(i) | Failed
//! ```
//!
//! Only one batch is in memory at a time. The worker pool is created once per `Pipeline` and
//! reused for every batch. Nothing in here exits the process; errors are returned to the
//! caller with the state machine left in a terminal state and the staging directory emptied,
//! so the same directory can be used for a retry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::assembler;
use crate::audio;
use crate::config::PipelineConfig;
use crate::container::{DatasetInfo, DatasetMetadata};
use crate::corpus::CorpusEntry;
use crate::features::{FeatureExtractor, FeatureMatrix};
use crate::memory::{MemoryGuard, MemoryProbe, SystemMemory};
use crate::pool::WorkerPool;
use crate::staging::{BatchLayout, StagedBatch, StagingArea};
use crate::vocab::Vocabulary;
use crate::{Error, Result};

/// Where the driver is in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Extracting { batch: usize },
    Staging { batch: usize },
    Assembling,
    Done,
    /// Memory ran out while extracting or folding in `batch`.
    Aborted { batch: usize },
    /// Staging or assembly failed.
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Aborted { .. } | PipelineState::Failed
        )
    }
}

/// Progress hooks. Every method defaults to a no-op.
pub trait PipelineObserver {
    fn on_state(&mut self, _state: PipelineState) {}

    /// `done` of `total` items in `batch` have finished extraction (successfully or not).
    fn on_item_done(&mut self, _batch: usize, _done: usize, _total: usize) {}

    fn on_batch_staged(&mut self, _batch: usize, _items: usize, _artifact: &Path) {}

    fn on_batch_assembled(&mut self, _batch: usize, _items: usize) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// An ordered slice of the corpus with its 1-based index.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    pub index: usize,
    /// Corpus position of `entries[0]`.
    pub offset: usize,
    pub entries: &'a [CorpusEntry],
}

/// Split `entries` into batches of at most `size` (the last one may be shorter).
pub fn batches(entries: &[CorpusEntry], size: usize) -> impl Iterator<Item = Batch<'_>> {
    let size = size.max(1);
    entries
        .chunks(size)
        .enumerate()
        .map(move |(i, chunk)| Batch {
            index: i + 1,
            offset: i * size,
            entries: chunk,
        })
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSummary {
    pub output: PathBuf,
    pub batches: usize,
    /// Corpus entries submitted.
    pub entries: usize,
    /// Entries whose features made it into the container.
    pub items: usize,
    /// Entries skipped because of item-level failures.
    pub skipped: usize,
    pub metadata: DatasetMetadata,
}

pub struct Pipeline<'c> {
    config: &'c PipelineConfig,
    extractor: Arc<FeatureExtractor>,
    pool: WorkerPool,
    guard: MemoryGuard,
    state: PipelineState,
}

impl std::fmt::Debug for Pipeline<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("extractor", &self.extractor)
            .field("pool", &self.pool)
            .field("guard", &self.guard)
            .field("state", &self.state)
            .finish()
    }
}

impl<'c> Pipeline<'c> {
    /// Validate `config` and start the worker pool, guarding on real system memory.
    pub fn new(config: &'c PipelineConfig) -> Result<Self> {
        Self::with_memory_probe(config, Arc::new(SystemMemory::new()))
    }

    /// Same as `new`, with a caller-supplied memory probe.
    pub fn with_memory_probe(
        config: &'c PipelineConfig,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let extractor = Arc::new(FeatureExtractor::from_config(config)?);
        let pool = WorkerPool::new(config.worker_count())?;
        let guard = MemoryGuard::new(probe, config.memory.critical_percent);

        Ok(Self {
            config,
            extractor,
            pool,
            guard,
            state: PipelineState::Idle,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    /// Extract, stage, and assemble `entries` into the container at `output`.
    ///
    /// `staging_dir` must not already hold artifacts with the configured prefix; leftovers
    /// from an earlier run would otherwise be folded into this one.
    pub fn run(
        &mut self,
        entries: &[CorpusEntry],
        vocabulary: &Vocabulary,
        staging_dir: &Path,
        output: &Path,
        observer: &mut dyn PipelineObserver,
    ) -> Result<PipelineSummary> {
        self.transition(PipelineState::Idle, observer);

        if entries.is_empty() {
            return Err(Error::config("corpus is empty"));
        }

        let area = StagingArea::new(staging_dir, &self.config.output);
        if let Some((stale, path)) = area.discover()?.into_iter().next() {
            return Err(Error::Staging {
                batch: stale,
                message: format!(
                    "staging directory already holds '{}' from another run",
                    path.display()
                ),
            });
        }

        let layout = BatchLayout {
            feature_regions: self.extractor.regions(),
            label_len: self.config.label_len(),
        };

        info!(
            entries = entries.len(),
            samples_per_batch = self.config.batch.samples_per_batch,
            workers = self.pool.size(),
            feature_regions = ?layout.feature_regions,
            label_len = layout.label_len,
            vocabulary_size = vocabulary.len(),
            "starting feature pipeline"
        );

        let mut batch_count = 0usize;
        let mut items = 0usize;

        for batch in batches(entries, self.config.batch.samples_per_batch) {
            batch_count = batch.index;

            self.transition(PipelineState::Extracting { batch: batch.index }, observer);
            let extracted = match self.extract_batch(&batch, observer) {
                Ok(extracted) => extracted,
                Err(err) => {
                    let next = if err.is_resource_exhausted() {
                        PipelineState::Aborted { batch: batch.index }
                    } else {
                        PipelineState::Failed
                    };
                    // A retry re-batches the corpus, so earlier artifacts are useless.
                    discard_staged(&area, batch.index - 1);
                    return Err(self.fail(next, observer, err));
                }
            };

            self.transition(PipelineState::Staging { batch: batch.index }, observer);
            let staged = stage_batch(&batch, extracted, vocabulary, &layout);
            let staged_items = staged.len();

            match area.write(&staged) {
                Ok(path) => {
                    info!(
                        batch = batch.index,
                        items = staged_items,
                        skipped = batch.entries.len() - staged_items,
                        "staged batch"
                    );
                    observer.on_batch_staged(batch.index, staged_items, &path);
                }
                Err(err) => {
                    discard_staged(&area, batch.index);
                    return Err(self.fail(PipelineState::Failed, observer, err));
                }
            }
            items += staged_items;
        }

        self.transition(PipelineState::Assembling, observer);
        let info = DatasetInfo {
            vocabulary: vocabulary.clone(),
            sample_rate: self.config.audio.sample_rate,
            labels_aligned_to_frames: self.config.labels.align_to_frames,
        };
        let mut folded = 0usize;
        let summary = assembler::assemble(
            &area,
            output,
            &layout,
            &info,
            Some(batch_count),
            &self.guard,
            |batch, n| {
                folded = batch;
                observer.on_batch_assembled(batch, n);
            },
        );
        let summary = match summary {
            Ok(summary) => summary,
            Err(err) => {
                let next = if err.is_resource_exhausted() {
                    PipelineState::Aborted { batch: folded + 1 }
                } else {
                    PipelineState::Failed
                };
                discard_staged(&area, batch_count);
                return Err(self.fail(next, observer, err));
            }
        };

        self.transition(PipelineState::Done, observer);

        Ok(PipelineSummary {
            output: summary.output,
            batches: batch_count,
            entries: entries.len(),
            items,
            skipped: entries.len() - items,
            metadata: summary.metadata,
        })
    }

    fn extract_batch(
        &self,
        batch: &Batch<'_>,
        observer: &mut dyn PipelineObserver,
    ) -> Result<Vec<Option<Vec<FeatureMatrix>>>> {
        let extractor = Arc::clone(&self.extractor);
        let sample_rate = self.config.audio.sample_rate;
        let target_samples = self.config.target_samples();
        let work = Arc::new(move |path: PathBuf| -> Result<Vec<FeatureMatrix>> {
            let samples = audio::load_mono_clamped(&path, sample_rate, target_samples)?;
            Ok(extractor.extract(&samples))
        });

        let paths: Vec<PathBuf> = batch.entries.iter().map(|e| e.audio.clone()).collect();
        self.pool
            .run_batch(paths, work, &self.guard, |done, total| {
                observer.on_item_done(batch.index, done, total)
            })
    }

    fn transition(&mut self, next: PipelineState, observer: &mut dyn PipelineObserver) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "pipeline state");
        }
        self.state = next;
        observer.on_state(next);
    }

    fn fail(
        &mut self,
        next: PipelineState,
        observer: &mut dyn PipelineObserver,
        err: Error,
    ) -> Error {
        error!(state = ?next, error = %err, "pipeline stopped");
        self.transition(next, observer);
        err
    }
}

// Remove whatever is left of artifacts `1..=up_to`.
fn discard_staged(area: &StagingArea, up_to: usize) {
    for index in (1..=up_to).filter(|&i| area.exists(i)) {
        if let Err(err) = area.remove(index) {
            warn!(batch = index, error = %err, "failed to remove staged artifact");
        }
    }
}

// Pair successful extractions with their encoded transcripts; failed slots are dropped.
fn stage_batch(
    batch: &Batch<'_>,
    extracted: Vec<Option<Vec<FeatureMatrix>>>,
    vocabulary: &Vocabulary,
    layout: &BatchLayout,
) -> StagedBatch {
    let mut staged = StagedBatch::empty(batch.index, layout.clone());

    for (i, (slot, entry)) in extracted.into_iter().zip(batch.entries).enumerate() {
        match slot {
            Some(features) => {
                let labels = vocabulary.encode(&entry.transcript, layout.label_len);
                staged.push((batch.offset + i) as u64, features, labels);
            }
            None => warn!(
                batch = batch.index,
                position = batch.offset + i,
                audio = %entry.audio.display(),
                "item skipped"
            ),
        }
    }

    staged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureKind;
    use crate::features::FeatureRegion;

    fn entries(n: usize) -> Vec<CorpusEntry> {
        (0..n)
            .map(|i| CorpusEntry::new(format!("{i}.wav"), format!("entry {i}")))
            .collect()
    }

    #[test]
    fn batches_split_with_short_tail() {
        let corpus = entries(5);
        let split: Vec<(usize, usize, usize)> = batches(&corpus, 2)
            .map(|b| (b.index, b.offset, b.entries.len()))
            .collect();
        assert_eq!(split, vec![(1, 0, 2), (2, 2, 2), (3, 4, 1)]);
    }

    #[test]
    fn batch_larger_than_corpus_is_a_single_batch() {
        let corpus = entries(3);
        let split: Vec<usize> = batches(&corpus, 10).map(|b| b.entries.len()).collect();
        assert_eq!(split, vec![3]);
    }

    #[test]
    fn terminal_states() {
        assert!(PipelineState::Done.is_terminal());
        assert!(PipelineState::Aborted { batch: 1 }.is_terminal());
        assert!(PipelineState::Failed.is_terminal());
        assert!(!PipelineState::Staging { batch: 1 }.is_terminal());
        assert!(!PipelineState::Idle.is_terminal());
    }

    #[test]
    fn stage_batch_skips_failed_slots_and_keeps_positions() -> anyhow::Result<()> {
        let corpus = entries(4);
        let batch = batches(&corpus, 4).next().ok_or_else(|| anyhow::anyhow!("no batch"))?;
        let vocab = Vocabulary::build(corpus.iter().map(|e| e.transcript.as_str()));
        let layout = BatchLayout {
            feature_regions: vec![FeatureRegion {
                kind: FeatureKind::Mfcc,
                shape: [1, 1],
            }],
            label_len: 8,
        };

        let extracted = vec![
            Some(vec![FeatureMatrix::zeros(1, 1)]),
            None,
            Some(vec![FeatureMatrix::zeros(1, 1)]),
            None,
        ];
        let staged = stage_batch(&batch, extracted, &vocab, &layout);

        assert_eq!(staged.positions, vec![0, 2]);
        assert_eq!(staged.labels[1], vocab.encode("entry 2", 8));
        Ok(())
    }

    #[test]
    fn empty_corpus_is_a_config_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = PipelineConfig::default();
        let mut pipeline = Pipeline::new(&config)?;

        let err = pipeline
            .run(
                &[],
                &Vocabulary::build([""]),
                dir.path(),
                &dir.path().join("out.fstd"),
                &mut NoopObserver,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(pipeline.state(), PipelineState::Idle);
        Ok(())
    }
}
