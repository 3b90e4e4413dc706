//! Per-batch staged artifacts.
//!
//! Each completed batch is persisted as `<prefix>_Batch<N>.<ext>` (N is 1-based) in the
//! staging directory, so a run never holds more than one batch of features in memory. The
//! artifact is a gzip stream with a small little-endian layout:
//!
//! ```text
//! magic  b"FSTSTG01"
//! u32    batch index
//! u32    item count
//! u32    region count, then per region: u8 kind, u32 frames, u32 bins
//! u32    label length
//! item × count:
//!   u64                 corpus position
//!   per region: f32 × frames·bins (row-major)
//!   i32 × label length  labels
//! ```
//!
//! Writes go to `<artifact>.part` and are renamed into place after an fsync, so a staged
//! artifact is either complete or absent. Reads are checked against the layout the caller
//! expects before any item is allocated.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::config::{FeatureKind, OutputConfig};
use crate::features::{FeatureMatrix, FeatureRegion};
use crate::vocab::LabelSequence;
use crate::{Error, Result};

const MAGIC: &[u8; 8] = b"FSTSTG01";

/// Shape every item of a run shares: its feature regions and label length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLayout {
    pub feature_regions: Vec<FeatureRegion>,
    pub label_len: usize,
}

impl BatchLayout {
    pub fn kinds(&self) -> impl Iterator<Item = FeatureKind> + '_ {
        self.feature_regions.iter().map(|r| r.kind)
    }
}

/// One batch's worth of successfully extracted items.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedBatch {
    /// 1-based batch number.
    pub index: usize,
    pub layout: BatchLayout,
    /// Corpus position of each item, ascending.
    pub positions: Vec<u64>,
    /// Per item, one matrix per layout region.
    pub features: Vec<Vec<FeatureMatrix>>,
    pub labels: Vec<LabelSequence>,
}

impl StagedBatch {
    pub fn empty(index: usize, layout: BatchLayout) -> Self {
        Self {
            index,
            layout,
            positions: Vec::new(),
            features: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn push(&mut self, position: u64, features: Vec<FeatureMatrix>, labels: LabelSequence) {
        self.positions.push(position);
        self.features.push(features);
        self.labels.push(labels);
    }

    /// Split into one column of matrices per region, plus the labels.
    pub fn into_columns(self) -> (Vec<Vec<FeatureMatrix>>, Vec<LabelSequence>) {
        let mut columns: Vec<Vec<FeatureMatrix>> = self
            .layout
            .feature_regions
            .iter()
            .map(|_| Vec::with_capacity(self.positions.len()))
            .collect();
        for item in self.features {
            for (column, matrix) in columns.iter_mut().zip(item) {
                column.push(matrix);
            }
        }
        (columns, self.labels)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.features.len() != self.len() || self.labels.len() != self.len() {
            return Err(format!(
                "mismatched item counts: {} positions, {} feature sets, {} label sequences",
                self.len(),
                self.features.len(),
                self.labels.len()
            ));
        }
        let regions = &self.layout.feature_regions;
        for (pos, matrices) in self.features.iter().enumerate() {
            if matrices.len() != regions.len() {
                return Err(format!(
                    "item {pos} has {} feature matrices, expected {}",
                    matrices.len(),
                    regions.len()
                ));
            }
            if let Some((m, region)) = matrices
                .iter()
                .zip(regions)
                .find(|(m, region)| m.shape() != region.shape)
            {
                return Err(format!(
                    "item {pos} has {:?} shape {:?}, expected {:?}",
                    region.kind,
                    m.shape(),
                    region.shape
                ));
            }
        }
        if let Some((pos, l)) = self
            .labels
            .iter()
            .enumerate()
            .find(|(_, l)| l.len() != self.layout.label_len)
        {
            return Err(format!(
                "item {pos} has {} labels, expected {}",
                l.len(),
                self.layout.label_len
            ));
        }
        Ok(())
    }
}

/// Directory of staged batch artifacts.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
    prefix: String,
    extension: String,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>, output: &OutputConfig) -> Self {
        Self {
            dir: dir.into(),
            prefix: output.staging_prefix.clone(),
            extension: output.staging_extension.clone(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final path of batch `index`'s artifact.
    pub fn artifact_path(&self, index: usize) -> PathBuf {
        self.dir
            .join(format!("{}_Batch{index}.{}", self.prefix, self.extension))
    }

    /// Persist a batch, replacing any artifact with the same index.
    pub fn write(&self, batch: &StagedBatch) -> Result<PathBuf> {
        let index = batch.index;
        let staging_err = |message: String| Error::Staging {
            batch: index,
            message,
        };

        batch.validate().map_err(staging_err)?;
        fs::create_dir_all(&self.dir).map_err(|e| {
            staging_err(format!(
                "failed to create staging dir '{}': {e}",
                self.dir.display()
            ))
        })?;

        let path = self.artifact_path(index);
        let tmp_path = PathBuf::from(format!("{}.part", path.display()));

        let result = (|| -> io::Result<()> {
            let file = File::create(&tmp_path)?;
            let mut gz = GzEncoder::new(BufWriter::new(file), Compression::default());
            write_batch(&mut gz, batch)?;

            let file = gz.finish()?.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            fs::rename(&tmp_path, &path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(staging_err(format!(
                "failed to write '{}': {e}",
                path.display()
            )));
        }

        tracing::debug!(batch = index, items = batch.len(), path = %path.display(), "staged batch");
        Ok(path)
    }

    /// Load batch `index`, which must have been staged with `layout`.
    ///
    /// The header is checked against `layout` before anything is allocated, and the stream
    /// must end right after the last item.
    pub fn read(&self, index: usize, layout: &BatchLayout) -> Result<StagedBatch> {
        let path = self.artifact_path(index);
        let file = File::open(&path).map_err(|e| Error::Staging {
            batch: index,
            message: format!("failed to open '{}': {e}", path.display()),
        })?;

        let mut gz = GzDecoder::new(BufReader::new(file));
        let batch = read_batch(&mut gz, layout).map_err(|e| Error::Staging {
            batch: index,
            message: format!("corrupt artifact '{}': {e}", path.display()),
        })?;

        if batch.index != index {
            return Err(Error::Staging {
                batch: index,
                message: format!(
                    "artifact '{}' claims to be batch {}",
                    path.display(),
                    batch.index
                ),
            });
        }
        Ok(batch)
    }

    pub fn exists(&self, index: usize) -> bool {
        self.artifact_path(index).is_file()
    }

    pub fn remove(&self, index: usize) -> Result<()> {
        let path = self.artifact_path(index);
        fs::remove_file(&path).map_err(|e| Error::Staging {
            batch: index,
            message: format!("failed to remove '{}': {e}", path.display()),
        })
    }

    /// Artifacts currently present, sorted by batch index.
    pub fn discover(&self) -> Result<Vec<(usize, PathBuf)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let head = format!("{}_Batch", self.prefix);
        let tail = format!(".{}", self.extension);

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let index = name
                .strip_prefix(&head)
                .and_then(|rest| rest.strip_suffix(&tail))
                .and_then(|digits| digits.parse::<usize>().ok());
            if let Some(index) = index {
                found.push((index, entry.path()));
            }
        }

        found.sort_by_key(|(index, _)| *index);
        Ok(found)
    }
}

fn write_batch<W: Write>(w: &mut W, batch: &StagedBatch) -> io::Result<()> {
    let layout = &batch.layout;

    w.write_all(MAGIC)?;
    w.write_u32::<LittleEndian>(to_u32(batch.index)?)?;
    w.write_u32::<LittleEndian>(to_u32(batch.len())?)?;
    w.write_u32::<LittleEndian>(to_u32(layout.feature_regions.len())?)?;
    for region in &layout.feature_regions {
        w.write_u8(region.kind.tag())?;
        w.write_u32::<LittleEndian>(to_u32(region.shape[0])?)?;
        w.write_u32::<LittleEndian>(to_u32(region.shape[1])?)?;
    }
    w.write_u32::<LittleEndian>(to_u32(layout.label_len)?)?;

    for ((position, matrices), labels) in batch
        .positions
        .iter()
        .zip(&batch.features)
        .zip(&batch.labels)
    {
        w.write_u64::<LittleEndian>(*position)?;
        for matrix in matrices {
            for &v in matrix.as_slice() {
                w.write_f32::<LittleEndian>(v)?;
            }
        }
        for &label in labels {
            w.write_i32::<LittleEndian>(label)?;
        }
    }
    Ok(())
}

fn read_batch<R: Read>(r: &mut R, layout: &BatchLayout) -> io::Result<StagedBatch> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(invalid_data("bad magic"));
    }

    let index = r.read_u32::<LittleEndian>()? as usize;
    let count = r.read_u32::<LittleEndian>()? as usize;

    let regions = r.read_u32::<LittleEndian>()? as usize;
    if regions != layout.feature_regions.len() {
        return Err(invalid_data(&format!(
            "artifact has {regions} feature regions, expected {}",
            layout.feature_regions.len()
        )));
    }
    for expected in &layout.feature_regions {
        let tag = r.read_u8()?;
        let frames = r.read_u32::<LittleEndian>()? as usize;
        let bins = r.read_u32::<LittleEndian>()? as usize;
        let kind = FeatureKind::from_tag(tag)
            .ok_or_else(|| invalid_data(&format!("unknown feature kind tag {tag}")))?;
        if kind != expected.kind || [frames, bins] != expected.shape {
            return Err(invalid_data(&format!(
                "artifact has {kind:?} region of shape {:?}, expected {:?} of shape {:?}",
                [frames, bins],
                expected.kind,
                expected.shape
            )));
        }
    }

    let label_len = r.read_u32::<LittleEndian>()? as usize;
    if label_len != layout.label_len {
        return Err(invalid_data(&format!(
            "artifact has label length {label_len}, expected {}",
            layout.label_len
        )));
    }

    let mut batch = StagedBatch::empty(index, layout.clone());
    for _ in 0..count {
        let position = r.read_u64::<LittleEndian>()?;

        let mut matrices = Vec::with_capacity(layout.feature_regions.len());
        for region in &layout.feature_regions {
            let [frames, bins] = region.shape;
            let mut data = vec![0.0f32; frames * bins];
            r.read_f32_into::<LittleEndian>(&mut data)?;
            matrices.push(
                FeatureMatrix::from_vec(frames, bins, data)
                    .map_err(|e| invalid_data(&e.to_string()))?,
            );
        }

        let mut labels = vec![0i32; label_len];
        r.read_i32_into::<LittleEndian>(&mut labels)?;

        batch.push(position, matrices, labels);
    }

    let mut trailing = [0u8; 1];
    if r.read(&mut trailing)? != 0 {
        return Err(invalid_data("trailing bytes after last item"));
    }
    Ok(batch)
}

fn to_u32(value: usize) -> io::Result<u32> {
    u32::try_from(value).map_err(|_| invalid_data("value does not fit in u32"))
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> BatchLayout {
        BatchLayout {
            feature_regions: vec![
                FeatureRegion {
                    kind: FeatureKind::LogMel,
                    shape: [3, 2],
                },
                FeatureRegion {
                    kind: FeatureKind::Mfcc,
                    shape: [3, 1],
                },
            ],
            label_len: 4,
        }
    }

    fn sample_batch(index: usize) -> anyhow::Result<StagedBatch> {
        let mut batch = StagedBatch::empty(index, layout());
        for pos in 0..2u64 {
            let mel: Vec<f32> = (0..6).map(|v| v as f32 + pos as f32 * 10.0).collect();
            let mfcc: Vec<f32> = (0..3).map(|v| -(v as f32) - pos as f32).collect();
            batch.push(
                pos + 10,
                vec![
                    FeatureMatrix::from_vec(3, 2, mel)?,
                    FeatureMatrix::from_vec(3, 1, mfcc)?,
                ],
                vec![1, 2, pos as i32, 0],
            );
        }
        Ok(batch)
    }

    // Gzip stream with a valid magic and index but an arbitrary header after it.
    fn write_raw_header(path: &Path, fields: &[u32]) -> anyhow::Result<()> {
        let mut gz = GzEncoder::new(File::create(path)?, Compression::default());
        gz.write_all(MAGIC)?;
        for &field in fields {
            gz.write_u32::<LittleEndian>(field)?;
        }
        gz.finish()?;
        Ok(())
    }

    #[test]
    fn artifact_names_are_one_based_and_prefixed() {
        let area = StagingArea::new("/tmp/stage", &OutputConfig::default());
        assert_eq!(
            area.artifact_path(1),
            PathBuf::from("/tmp/stage/Features_Batch1.stage.gz")
        );
    }

    #[test]
    fn write_then_read_preserves_items() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let area = StagingArea::new(dir.path(), &OutputConfig::default());
        let batch = sample_batch(2)?;

        let path = area.write(&batch)?;
        assert!(path.is_file());
        assert!(!PathBuf::from(format!("{}.part", path.display())).exists());
        assert_eq!(area.read(2, &layout())?, batch);
        Ok(())
    }

    #[test]
    fn columns_follow_region_order() -> anyhow::Result<()> {
        let (columns, labels) = sample_batch(1)?.into_columns();
        assert_eq!(columns.len(), 2);
        assert!(columns[0].iter().all(|m| m.shape() == [3, 2]));
        assert!(columns[1].iter().all(|m| m.shape() == [3, 1]));
        assert_eq!(columns[1][1].as_slice(), &[-1.0, -2.0, -3.0]);
        assert_eq!(labels.len(), 2);
        Ok(())
    }

    #[test]
    fn empty_batch_is_still_staged() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let area = StagingArea::new(dir.path(), &OutputConfig::default());

        area.write(&StagedBatch::empty(1, layout()))?;
        let read = area.read(1, &layout())?;
        assert!(read.is_empty());
        assert_eq!(read.layout, layout());
        Ok(())
    }

    #[test]
    fn mismatched_shape_is_rejected_before_touching_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let area = StagingArea::new(dir.path().join("stage"), &OutputConfig::default());

        let mut batch = StagedBatch::empty(4, layout());
        batch.push(
            0,
            vec![FeatureMatrix::zeros(2, 2), FeatureMatrix::zeros(3, 1)],
            vec![0; 4],
        );

        let err = area.write(&batch).unwrap_err();
        assert_eq!(err.batch(), Some(4));
        assert!(!area.exists(4));
        Ok(())
    }

    #[test]
    fn missing_region_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let area = StagingArea::new(dir.path(), &OutputConfig::default());

        let mut batch = StagedBatch::empty(1, layout());
        batch.push(0, vec![FeatureMatrix::zeros(3, 2)], vec![0; 4]);
        assert!(area.write(&batch).is_err());
        Ok(())
    }

    #[test]
    fn truncated_artifact_is_a_staging_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let area = StagingArea::new(dir.path(), &OutputConfig::default());
        let path = area.write(&sample_batch(1)?)?;

        let bytes = fs::read(&path)?;
        fs::write(&path, &bytes[..bytes.len() / 2])?;

        let err = area.read(1, &layout()).unwrap_err();
        assert!(matches!(err, Error::Staging { batch: 1, .. }));
        Ok(())
    }

    #[test]
    fn oversized_header_is_rejected_without_allocating() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let area = StagingArea::new(dir.path(), &OutputConfig::default());

        // index 1, one item, one region of u32::MAX x u32::MAX, label length u32::MAX
        let path = area.artifact_path(1);
        let mut gz = GzEncoder::new(File::create(&path)?, Compression::default());
        gz.write_all(MAGIC)?;
        for field in [1, 1, 1] {
            gz.write_u32::<LittleEndian>(field)?;
        }
        gz.write_u8(FeatureKind::LogMel.tag())?;
        for field in [u32::MAX, u32::MAX, u32::MAX] {
            gz.write_u32::<LittleEndian>(field)?;
        }
        gz.finish()?;

        let one_region = BatchLayout {
            feature_regions: vec![FeatureRegion {
                kind: FeatureKind::LogMel,
                shape: [3, 2],
            }],
            label_len: 4,
        };
        let err = area.read(1, &one_region).unwrap_err();
        assert!(matches!(err, Error::Staging { batch: 1, .. }));
        assert!(err.to_string().contains("shape"));
        Ok(())
    }

    #[test]
    fn wrong_region_count_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let area = StagingArea::new(dir.path(), &OutputConfig::default());
        write_raw_header(&area.artifact_path(3), &[3, u32::MAX, u32::MAX])?;

        let err = area.read(3, &layout()).unwrap_err();
        assert!(matches!(err, Error::Staging { batch: 3, .. }));
        Ok(())
    }

    #[test]
    fn different_label_length_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let area = StagingArea::new(dir.path(), &OutputConfig::default());
        area.write(&sample_batch(1)?)?;

        let longer = BatchLayout {
            label_len: 5,
            ..layout()
        };
        assert!(matches!(
            area.read(1, &longer),
            Err(Error::Staging { batch: 1, .. })
        ));
        Ok(())
    }

    #[test]
    fn artifact_with_wrong_index_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let area = StagingArea::new(dir.path(), &OutputConfig::default());
        let written = area.write(&sample_batch(1)?)?;
        fs::rename(&written, area.artifact_path(2))?;

        assert!(area.read(2, &layout()).is_err());
        Ok(())
    }

    #[test]
    fn discover_lists_only_matching_artifacts_in_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let area = StagingArea::new(dir.path(), &OutputConfig::default());
        area.write(&sample_batch(10)?)?;
        area.write(&sample_batch(2)?)?;
        fs::write(dir.path().join("notes.txt"), "x")?;
        fs::write(dir.path().join("Features_BatchX.stage.gz"), "x")?;

        let found: Vec<usize> = area.discover()?.into_iter().map(|(i, _)| i).collect();
        assert_eq!(found, vec![2, 10]);
        Ok(())
    }

    #[test]
    fn discover_on_missing_dir_is_empty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let area = StagingArea::new(dir.path().join("nope"), &OutputConfig::default());
        assert!(area.discover()?.is_empty());
        Ok(())
    }
}
