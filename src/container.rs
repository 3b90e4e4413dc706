//! The assembled dataset container.
//!
//! One file holds every item of a run. Each feature kind has its own region next to the
//! label region, and all of them grow chunk by chunk as staged batches are folded in; the
//! chunk table and scalar metadata go into a JSON footer written at commit time:
//!
//! ```text
//! magic   b"FSTDSET1"
//! chunk*  u8 region (0 = labels, 1 = log-mel, 2 = MFCC), u32 rows, u64 byte_len, payload
//! footer  JSON { metadata, chunks: [{ region, rows, offset, byte_len }] }
//! trailer u64 footer_len, b"FSTDEND1"
//! ```
//!
//! Integers and payload values are little-endian. Feature payloads are `rows × frames × bins`
//! `f32` values, label payloads are `rows × label_len` `i32` values. Row `i` of every region
//! belongs to the same item.
//!
//! `DatasetWriter` writes to `<path>.part` and renames on `commit`; dropping an uncommitted
//! writer deletes the partial file.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::config::FeatureKind;
use crate::features::{FeatureMatrix, FeatureRegion};
use crate::vocab::{LabelSequence, Vocabulary};
use crate::{Error, Result};

const MAGIC: &[u8; 8] = b"FSTDSET1";
const END_MAGIC: &[u8; 8] = b"FSTDEND1";
const CHUNK_HEADER_LEN: u64 = 1 + 4 + 8;
const TRAILER_LEN: u64 = 8 + 8;

/// Bumped whenever the on-disk layout changes.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Region {
    Features(FeatureKind),
    Labels,
}

impl Region {
    fn tag(self) -> u8 {
        match self {
            Region::Features(kind) => kind.tag(),
            Region::Labels => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct ChunkEntry {
    region: Region,
    rows: u64,
    offset: u64,
    byte_len: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Footer {
    metadata: DatasetMetadata,
    chunks: Vec<ChunkEntry>,
}

/// Scalar metadata stored alongside the dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub format_version: u32,
    /// One entry per feature region, in the order they were configured.
    pub feature_regions: Vec<FeatureRegion>,
    pub label_len: usize,
    /// Whether `label_len` is the feature frame count rather than a transcript limit.
    pub labels_aligned_to_frames: bool,
    /// Number of items (rows) in every region.
    pub items: usize,
    pub vocabulary_size: usize,
    /// `vocabulary_size + 1`, including the padding class.
    pub num_classes: usize,
    /// Vocabulary characters in index order; index `i + 1` decodes to `vocabulary[i]`.
    pub vocabulary: Vec<char>,
    pub sample_rate: u32,
}

impl DatasetMetadata {
    pub fn vocabulary(&self) -> Vocabulary {
        Vocabulary::from_characters(self.vocabulary.iter().copied())
    }

    /// Shape of the `kind` region, if the dataset has one.
    pub fn feature_shape(&self, kind: FeatureKind) -> Option<[usize; 2]> {
        self.feature_regions
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| r.shape)
    }
}

/// Run-level facts recorded in the metadata at commit time.
#[derive(Debug, Clone)]
pub struct DatasetInfo {
    pub vocabulary: Vocabulary,
    pub sample_rate: u32,
    pub labels_aligned_to_frames: bool,
}

/// Append-only writer for a dataset container.
pub struct DatasetWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    file: Option<BufWriter<File>>,
    regions: Vec<FeatureRegion>,
    label_len: usize,
    offset: u64,
    chunks: Vec<ChunkEntry>,
    // Parallel to `regions`.
    feature_rows: Vec<usize>,
    label_rows: usize,
    committed: bool,
}

impl std::fmt::Debug for DatasetWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetWriter")
            .field("path", &self.path)
            .field("regions", &self.regions)
            .field("label_len", &self.label_len)
            .field("feature_rows", &self.feature_rows)
            .field("label_rows", &self.label_rows)
            .finish()
    }
}

impl DatasetWriter {
    /// Start a new container at `path` (written to `<path>.part` until committed).
    pub fn create(path: &Path, regions: &[FeatureRegion], label_len: usize) -> Result<Self> {
        if regions.is_empty() {
            return Err(Error::container("a dataset needs at least one feature region"));
        }
        if let Some((i, region)) = regions
            .iter()
            .enumerate()
            .find(|(i, r)| regions[..*i].iter().any(|other| other.kind == r.kind))
        {
            return Err(Error::container(format!(
                "feature region {i} repeats kind {:?}",
                region.kind
            )));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = PathBuf::from(format!("{}.part", path.display()));
        let mut file = BufWriter::new(File::create(&tmp_path)?);
        file.write_all(MAGIC)?;

        Ok(Self {
            path: path.to_path_buf(),
            tmp_path,
            file: Some(file),
            regions: regions.to_vec(),
            label_len,
            offset: MAGIC.len() as u64,
            chunks: Vec::new(),
            feature_rows: vec![0; regions.len()],
            label_rows: 0,
            committed: false,
        })
    }

    /// Rows written so far to the `kind` region.
    pub fn feature_rows(&self, kind: FeatureKind) -> Option<usize> {
        let pos = self.regions.iter().position(|r| r.kind == kind)?;
        Some(self.feature_rows[pos])
    }

    pub fn label_rows(&self) -> usize {
        self.label_rows
    }

    /// Grow the `kind` feature region by `matrices.len()` rows.
    pub fn append_features(&mut self, kind: FeatureKind, matrices: &[FeatureMatrix]) -> Result<()> {
        let pos = self
            .regions
            .iter()
            .position(|r| r.kind == kind)
            .ok_or_else(|| Error::container(format!("container has no {kind:?} region")))?;
        if matrices.is_empty() {
            return Ok(());
        }

        let shape = self.regions[pos].shape;
        if let Some(m) = matrices.iter().find(|m| m.shape() != shape) {
            return Err(Error::container(format!(
                "{kind:?} matrix has shape {:?}, container expects {shape:?}",
                m.shape()
            )));
        }

        let values: usize = matrices.iter().map(|m| m.as_slice().len()).sum();
        self.write_chunk(Region::Features(kind), matrices.len(), values as u64 * 4, |w| {
            for m in matrices {
                for &v in m.as_slice() {
                    w.write_f32::<LittleEndian>(v)?;
                }
            }
            Ok(())
        })?;
        self.feature_rows[pos] += matrices.len();
        Ok(())
    }

    /// Grow the label region by `labels.len()` rows.
    pub fn append_labels(&mut self, labels: &[LabelSequence]) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        if let Some(l) = labels.iter().find(|l| l.len() != self.label_len) {
            return Err(Error::container(format!(
                "label sequence has length {}, container expects {}",
                l.len(),
                self.label_len
            )));
        }

        let values = labels.len() * self.label_len;
        self.write_chunk(Region::Labels, labels.len(), values as u64 * 4, |w| {
            for seq in labels {
                for &label in seq {
                    w.write_i32::<LittleEndian>(label)?;
                }
            }
            Ok(())
        })?;
        self.label_rows += labels.len();
        Ok(())
    }

    fn write_chunk(
        &mut self,
        region: Region,
        rows: usize,
        byte_len: u64,
        payload: impl FnOnce(&mut BufWriter<File>) -> io::Result<()>,
    ) -> Result<()> {
        let rows_u32 = u32::try_from(rows)
            .map_err(|_| Error::container(format!("chunk of {rows} rows is too large")))?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::container("writer is closed"))?;

        file.write_u8(region.tag())?;
        file.write_u32::<LittleEndian>(rows_u32)?;
        file.write_u64::<LittleEndian>(byte_len)?;
        payload(file)?;

        self.chunks.push(ChunkEntry {
            region,
            rows: rows as u64,
            offset: self.offset,
            byte_len,
        });
        self.offset += CHUNK_HEADER_LEN + byte_len;
        Ok(())
    }

    /// Write the footer, fsync, and move the container to its final path.
    pub fn commit(mut self, info: &DatasetInfo) -> Result<DatasetMetadata> {
        if let Some((region, rows)) = self
            .regions
            .iter()
            .zip(&self.feature_rows)
            .find(|(_, rows)| **rows != self.label_rows)
        {
            return Err(Error::container(format!(
                "{:?} region has {rows} rows but label region has {}",
                region.kind, self.label_rows
            )));
        }

        let metadata = DatasetMetadata {
            format_version: FORMAT_VERSION,
            feature_regions: self.regions.clone(),
            label_len: self.label_len,
            labels_aligned_to_frames: info.labels_aligned_to_frames,
            items: self.label_rows,
            vocabulary_size: info.vocabulary.len(),
            num_classes: info.vocabulary.num_classes(),
            vocabulary: info.vocabulary.characters().to_vec(),
            sample_rate: info.sample_rate,
        };
        let footer = serde_json::to_vec(&Footer {
            metadata: metadata.clone(),
            chunks: std::mem::take(&mut self.chunks),
        })?;

        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::container("writer is closed"))?;
        file.write_all(&footer)?;
        file.write_u64::<LittleEndian>(footer.len() as u64)?;
        file.write_all(END_MAGIC)?;

        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;
        self.committed = true;

        tracing::info!(path = %self.path.display(), items = metadata.items, "committed dataset");
        Ok(metadata)
    }

    /// Discard the partial container.
    pub fn abort(self) {
        tracing::debug!(path = %self.tmp_path.display(), "discarding uncommitted dataset");
    }
}

impl Drop for DatasetWriter {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Random access reader for a committed container.
#[derive(Debug)]
pub struct DatasetReader {
    file: BufReader<File>,
    metadata: DatasetMetadata,
    // (first row, chunk), ascending. `feature_chunks` is parallel to the metadata's regions.
    feature_chunks: Vec<Vec<(usize, ChunkEntry)>>,
    label_chunks: Vec<(usize, ChunkEntry)>,
}

impl DatasetReader {
    /// Open and validate a container.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut file = BufReader::new(file);

        let corrupt = |what: &str| Error::container(format!("'{}': {what}", path.display()));

        if len < MAGIC.len() as u64 + TRAILER_LEN {
            return Err(corrupt("file is too short"));
        }

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(corrupt("not a dataset container"));
        }

        file.seek(SeekFrom::Start(len - TRAILER_LEN))?;
        let footer_len = file.read_u64::<LittleEndian>()?;
        file.read_exact(&mut magic)?;
        if &magic != END_MAGIC {
            return Err(corrupt("missing trailer (was the container committed?)"));
        }

        let footer_start = (len - TRAILER_LEN)
            .checked_sub(footer_len)
            .filter(|start| *start >= MAGIC.len() as u64)
            .ok_or_else(|| corrupt("footer length out of range"))?;
        file.seek(SeekFrom::Start(footer_start))?;
        let mut footer = vec![0u8; footer_len as usize];
        file.read_exact(&mut footer)?;
        let footer: Footer = serde_json::from_slice(&footer)
            .map_err(|e| corrupt(&format!("unreadable footer: {e}")))?;

        let metadata = footer.metadata;
        if metadata.format_version != FORMAT_VERSION {
            return Err(corrupt(&format!(
                "unsupported format version {}",
                metadata.format_version
            )));
        }

        let feature_row_bytes = metadata
            .feature_regions
            .iter()
            .map(|r| row_bytes(&r.shape))
            .collect::<Option<Vec<u64>>>()
            .ok_or_else(|| corrupt("feature shape overflows"))?;
        let label_row_bytes =
            row_bytes(&[metadata.label_len]).ok_or_else(|| corrupt("label length overflows"))?;

        let mut feature_chunks = vec![Vec::new(); metadata.feature_regions.len()];
        let mut feature_rows = vec![0usize; metadata.feature_regions.len()];
        let mut label_chunks = Vec::new();
        let mut label_rows = 0usize;

        for chunk in footer.chunks {
            let end = chunk
                .offset
                .saturating_add(CHUNK_HEADER_LEN)
                .saturating_add(chunk.byte_len);
            if chunk.offset < MAGIC.len() as u64 || end > footer_start {
                return Err(corrupt("chunk extends outside the data section"));
            }

            file.seek(SeekFrom::Start(chunk.offset))?;
            let tag = file.read_u8()?;
            let rows = u64::from(file.read_u32::<LittleEndian>()?);
            let byte_len = file.read_u64::<LittleEndian>()?;
            if tag != chunk.region.tag() || rows != chunk.rows || byte_len != chunk.byte_len {
                return Err(corrupt(&format!(
                    "chunk header at offset {} disagrees with footer",
                    chunk.offset
                )));
            }

            let (row_bytes, chunks, total) = match chunk.region {
                Region::Features(kind) => {
                    let pos = metadata
                        .feature_regions
                        .iter()
                        .position(|r| r.kind == kind)
                        .ok_or_else(|| corrupt(&format!("chunk for undeclared {kind:?} region")))?;
                    (
                        feature_row_bytes[pos],
                        &mut feature_chunks[pos],
                        &mut feature_rows[pos],
                    )
                }
                Region::Labels => (label_row_bytes, &mut label_chunks, &mut label_rows),
            };
            if chunk.rows.checked_mul(row_bytes) != Some(chunk.byte_len) {
                return Err(corrupt(&format!(
                    "chunk at offset {} has {} bytes for {} rows",
                    chunk.offset, chunk.byte_len, chunk.rows
                )));
            }
            chunks.push((*total, chunk));
            *total += chunk.rows as usize;
        }

        if label_rows != metadata.items || feature_rows.iter().any(|&n| n != metadata.items) {
            return Err(corrupt(&format!(
                "metadata lists {} items but regions hold {feature_rows:?} features and {label_rows} labels",
                metadata.items
            )));
        }

        Ok(Self {
            file,
            metadata,
            feature_chunks,
            label_chunks,
        })
    }

    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.metadata.items
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.items == 0
    }

    pub fn feature_regions(&self) -> &[FeatureRegion] {
        &self.metadata.feature_regions
    }

    /// Shape of the `kind` region, if present.
    pub fn feature_shape(&self, kind: FeatureKind) -> Option<[usize; 2]> {
        self.metadata.feature_shape(kind)
    }

    pub fn label_len(&self) -> usize {
        self.metadata.label_len
    }

    /// `kind` feature matrix of item `index`.
    pub fn feature(&mut self, kind: FeatureKind, index: usize) -> Result<FeatureMatrix> {
        let pos = self
            .metadata
            .feature_regions
            .iter()
            .position(|r| r.kind == kind)
            .ok_or_else(|| Error::container(format!("dataset has no {kind:?} region")))?;
        let [frames, bins] = self.metadata.feature_regions[pos].shape;
        let offset = locate(&self.feature_chunks[pos], index, (frames * bins * 4) as u64)
            .ok_or_else(|| self.out_of_range(index))?;

        self.file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0.0f32; frames * bins];
        self.file.read_f32_into::<LittleEndian>(&mut data)?;
        FeatureMatrix::from_vec(frames, bins, data)
    }

    /// Label sequence of item `index`.
    pub fn label(&mut self, index: usize) -> Result<LabelSequence> {
        let label_len = self.metadata.label_len;
        let offset = locate(&self.label_chunks, index, (label_len * 4) as u64)
            .ok_or_else(|| self.out_of_range(index))?;

        self.file.seek(SeekFrom::Start(offset))?;
        let mut labels = vec![0i32; label_len];
        self.file.read_i32_into::<LittleEndian>(&mut labels)?;
        Ok(labels)
    }

    pub fn read_all_features(&mut self, kind: FeatureKind) -> Result<Vec<FeatureMatrix>> {
        (0..self.len()).map(|i| self.feature(kind, i)).collect()
    }

    pub fn read_all_labels(&mut self) -> Result<Vec<LabelSequence>> {
        (0..self.len()).map(|i| self.label(i)).collect()
    }

    fn out_of_range(&self, index: usize) -> Error {
        Error::container(format!(
            "item {index} out of range (container holds {})",
            self.len()
        ))
    }
}

// Bytes per row of `dims` 4-byte values, if it fits.
fn row_bytes(dims: &[usize]) -> Option<u64> {
    dims.iter()
        .try_fold(4u64, |acc, &d| acc.checked_mul(u64::try_from(d).ok()?))
}

// Byte offset of `row` within a region's chunk list.
fn locate(chunks: &[(usize, ChunkEntry)], row: usize, row_bytes: u64) -> Option<u64> {
    let pos = chunks.partition_point(|(first, _)| *first <= row);
    let (first, chunk) = chunks.get(pos.checked_sub(1)?)?;
    let local = (row - first) as u64;
    if local >= chunk.rows {
        return None;
    }
    Some(chunk.offset + CHUNK_HEADER_LEN + local * row_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEL: FeatureRegion = FeatureRegion {
        kind: FeatureKind::LogMel,
        shape: [2, 3],
    };
    const MFCC: FeatureRegion = FeatureRegion {
        kind: FeatureKind::Mfcc,
        shape: [2, 1],
    };

    fn matrix(seed: f32) -> anyhow::Result<FeatureMatrix> {
        Ok(FeatureMatrix::from_vec(
            2,
            3,
            (0..6).map(|v| seed + v as f32).collect(),
        )?)
    }

    fn column(seed: f32) -> anyhow::Result<FeatureMatrix> {
        Ok(FeatureMatrix::from_vec(2, 1, vec![seed, -seed])?)
    }

    fn info() -> DatasetInfo {
        DatasetInfo {
            vocabulary: Vocabulary::build(["abc"]),
            sample_rate: 16_000,
            labels_aligned_to_frames: false,
        }
    }

    fn write_sample(path: &Path) -> anyhow::Result<DatasetMetadata> {
        let mut writer = DatasetWriter::create(path, &[MEL, MFCC], 4)?;
        writer.append_features(FeatureKind::LogMel, &[matrix(0.0)?, matrix(10.0)?])?;
        writer.append_features(FeatureKind::Mfcc, &[column(1.0)?, column(2.0)?])?;
        writer.append_labels(&[vec![1, 2, 0, 0], vec![3, 0, 0, 0]])?;
        writer.append_features(FeatureKind::LogMel, &[matrix(20.0)?])?;
        writer.append_features(FeatureKind::Mfcc, &[column(3.0)?])?;
        writer.append_labels(&[vec![2, 2, 2, 2]])?;
        Ok(writer.commit(&info())?)
    }

    #[test]
    fn committed_container_reads_back_in_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.fstd");
        let metadata = write_sample(&path)?;

        assert_eq!(metadata.items, 3);
        assert_eq!(metadata.vocabulary_size, 3);
        assert_eq!(metadata.num_classes, 4);
        assert!(!PathBuf::from(format!("{}.part", path.display())).exists());

        let mut reader = DatasetReader::open(&path)?;
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.metadata(), &metadata);
        assert_eq!(reader.feature(FeatureKind::LogMel, 2)?, matrix(20.0)?);
        assert_eq!(reader.feature(FeatureKind::LogMel, 1)?, matrix(10.0)?);
        assert_eq!(
            reader.read_all_features(FeatureKind::Mfcc)?,
            vec![column(1.0)?, column(2.0)?, column(3.0)?]
        );
        assert_eq!(
            reader.read_all_labels()?,
            vec![vec![1, 2, 0, 0], vec![3, 0, 0, 0], vec![2, 2, 2, 2]]
        );
        assert_eq!(reader.metadata().vocabulary().decode(&reader.label(0)?)?, "ab");
        Ok(())
    }

    #[test]
    fn regions_are_listed_in_creation_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.fstd");
        write_sample(&path)?;

        let reader = DatasetReader::open(&path)?;
        assert_eq!(reader.feature_regions(), &[MEL, MFCC]);
        assert_eq!(reader.feature_shape(FeatureKind::Mfcc), Some([2, 1]));
        Ok(())
    }

    #[test]
    fn out_of_range_item_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.fstd");
        write_sample(&path)?;

        let mut reader = DatasetReader::open(&path)?;
        assert!(matches!(
            reader.feature(FeatureKind::LogMel, 3),
            Err(Error::Container(_))
        ));
        assert!(reader.label(99).is_err());
        Ok(())
    }

    #[test]
    fn missing_region_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mel.fstd");
        let mut writer = DatasetWriter::create(&path, &[MEL], 4)?;
        assert!(writer.append_features(FeatureKind::Mfcc, &[column(1.0)?]).is_err());
        writer.commit(&info())?;

        let mut reader = DatasetReader::open(&path)?;
        assert_eq!(reader.feature_shape(FeatureKind::Mfcc), None);
        assert!(reader.feature(FeatureKind::Mfcc, 0).is_err());
        Ok(())
    }

    #[test]
    fn empty_container_is_valid() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("empty.fstd");
        DatasetWriter::create(&path, &[MEL], 4)?.commit(&info())?;

        let reader = DatasetReader::open(&path)?;
        assert!(reader.is_empty());
        assert_eq!(reader.feature_shape(FeatureKind::LogMel), Some([2, 3]));
        Ok(())
    }

    #[test]
    fn dropped_writer_leaves_nothing_behind() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.fstd");

        let mut writer = DatasetWriter::create(&path, &[MEL], 4)?;
        writer.append_features(FeatureKind::LogMel, &[matrix(0.0)?])?;
        drop(writer);

        assert!(!path.exists());
        assert!(!PathBuf::from(format!("{}.part", path.display())).exists());
        Ok(())
    }

    #[test]
    fn unequal_regions_refuse_to_commit() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.fstd");

        let mut writer = DatasetWriter::create(&path, &[MEL, MFCC], 4)?;
        writer.append_features(FeatureKind::LogMel, &[matrix(0.0)?])?;
        writer.append_labels(&[vec![1, 0, 0, 0]])?;
        assert_eq!(writer.feature_rows(FeatureKind::Mfcc), Some(0));
        assert!(writer.commit(&info()).is_err());
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn repeated_region_kind_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.fstd");
        assert!(DatasetWriter::create(&path, &[MEL, MEL], 4).is_err());
        assert!(DatasetWriter::create(&path, &[], 4).is_err());
        Ok(())
    }

    #[test]
    fn wrong_shapes_are_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut writer = DatasetWriter::create(&dir.path().join("d.fstd"), &[MEL], 4)?;
        assert!(
            writer
                .append_features(FeatureKind::LogMel, &[FeatureMatrix::zeros(3, 3)])
                .is_err()
        );
        assert!(writer.append_labels(&[vec![1, 2]]).is_err());
        writer.abort();
        Ok(())
    }

    #[test]
    fn truncated_container_fails_validation() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.fstd");
        write_sample(&path)?;

        let bytes = fs::read(&path)?;
        fs::write(&path, &bytes[..bytes.len() - 4])?;
        assert!(matches!(DatasetReader::open(&path), Err(Error::Container(_))));
        Ok(())
    }

    #[test]
    fn foreign_file_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("other.bin");
        fs::write(&path, vec![7u8; 64])?;
        assert!(matches!(DatasetReader::open(&path), Err(Error::Container(_))));
        Ok(())
    }

    #[test]
    fn row_bytes_detects_overflow() {
        assert_eq!(row_bytes(&[2, 3]), Some(24));
        assert_eq!(row_bytes(&[usize::MAX, usize::MAX]), None);
    }
}
