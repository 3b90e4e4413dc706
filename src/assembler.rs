//! Folds staged batch artifacts into a single dataset container.
//!
//! Artifacts must be numbered contiguously from 1. Every expected index is checked before
//! anything is written, so a gap fails fast with the first missing batch. Batches are then
//! appended in ascending order; any read or shape failure drops the writer, which discards
//! the partial container.
//!
//! Available memory is sampled before each batch is loaded. Each artifact is deleted as soon
//! as its batch has been appended.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::container::{DatasetInfo, DatasetMetadata, DatasetWriter};
use crate::memory::MemoryGuard;
use crate::staging::{BatchLayout, StagingArea};
use crate::{Error, Result};

/// What `assemble` produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblySummary {
    pub output: PathBuf,
    pub batches: usize,
    pub metadata: DatasetMetadata,
}

/// Assemble artifacts `1..=N` from `area` into `output`.
///
/// `expected_batches` pins N; when `None`, N is the highest index present. `on_batch` is
/// called with `(batch, items)` after each batch is appended. A tripped `guard` stops the
/// fold with `Error::ResourceExhausted`, leaving the remaining artifacts in place.
pub fn assemble(
    area: &StagingArea,
    output: &Path,
    layout: &BatchLayout,
    info: &DatasetInfo,
    expected_batches: Option<usize>,
    guard: &MemoryGuard,
    mut on_batch: impl FnMut(usize, usize),
) -> Result<AssemblySummary> {
    let present: BTreeSet<usize> = area.discover()?.into_iter().map(|(i, _)| i).collect();
    let count = expected_batches.unwrap_or_else(|| present.last().copied().unwrap_or(0));

    if let Some(missing) = (1..=count).find(|i| !present.contains(i)) {
        return Err(Error::Assembly {
            batch: missing,
            message: format!(
                "staged artifact '{}' is missing",
                area.artifact_path(missing).display()
            ),
        });
    }
    if let Some(extra) = present.iter().find(|&&i| i == 0 || i > count) {
        warn!(batch = extra, "ignoring staged artifact outside the expected range");
    }

    let mut writer = DatasetWriter::create(output, &layout.feature_regions, layout.label_len)?;

    for index in 1..=count {
        guard.check()?;

        let batch = area
            .read(index, layout)
            .map_err(|e| assembly_error(index, e))?;
        let items = batch.len();
        let (columns, labels) = batch.into_columns();

        layout
            .kinds()
            .zip(&columns)
            .try_for_each(|(kind, column)| writer.append_features(kind, column))
            .and_then(|()| writer.append_labels(&labels))
            .map_err(|e| assembly_error(index, e))?;

        area.remove(index).map_err(|e| assembly_error(index, e))?;

        debug!(batch = index, items, "appended staged batch");
        on_batch(index, items);
    }

    let metadata = writer.commit(info)?;

    info!(
        output = %output.display(),
        batches = count,
        items = metadata.items,
        "assembled dataset"
    );

    Ok(AssemblySummary {
        output: output.to_path_buf(),
        batches: count,
        metadata,
    })
}

fn assembly_error(batch: usize, err: Error) -> Error {
    let message = match err {
        Error::Staging { message, .. } => message,
        other => other.to_string(),
    };
    Error::Assembly { batch, message }
}
