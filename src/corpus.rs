//! Corpus manifests.
//!
//! The pipeline consumes an ordered list of `CorpusEntry` values and never mutates them.
//! This module ships a CSV loader for the common `wav_filename, wav_filesize, transcript`
//! manifest layout; anything else can build the entries directly.

use std::io::Read;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// One audio recording and its transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    pub audio: PathBuf,
    pub transcript: String,
}

impl CorpusEntry {
    pub fn new(audio: impl Into<PathBuf>, transcript: impl Into<String>) -> Self {
        Self {
            audio: audio.into(),
            transcript: transcript.into(),
        }
    }
}

/// Column names accepted for the audio path, in order of preference.
const AUDIO_COLUMNS: [&str; 2] = ["wav_filename", "filename"];
const TRANSCRIPT_COLUMN: &str = "transcript";

/// Load a CSV manifest with a header row.
///
/// Relative audio paths are resolved against the manifest's directory so a corpus can be
/// moved around as a unit.
pub fn load_csv(path: &Path) -> Result<Vec<CorpusEntry>> {
    let file = std::fs::File::open(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
    let entries = read_csv(file, base_dir)?;
    tracing::info!(manifest = %path.display(), entries = entries.len(), "loaded corpus manifest");
    Ok(entries)
}

/// Read CSV manifest rows from any reader.
pub fn read_csv<R: Read>(reader: R, base_dir: &Path) -> Result<Vec<CorpusEntry>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    let audio_col = AUDIO_COLUMNS
        .iter()
        .find_map(|name| headers.iter().position(|h| h == *name))
        .ok_or_else(|| {
            Error::config(format!(
                "corpus manifest has no audio column (expected one of {AUDIO_COLUMNS:?})"
            ))
        })?;
    let transcript_col = headers
        .iter()
        .position(|h| h == TRANSCRIPT_COLUMN)
        .ok_or_else(|| {
            Error::config(format!(
                "corpus manifest has no '{TRANSCRIPT_COLUMN}' column"
            ))
        })?;

    let mut entries = Vec::new();
    for record in reader.records() {
        let record = record?;
        let (Some(audio), Some(transcript)) = (record.get(audio_col), record.get(transcript_col))
        else {
            return Err(Error::config(format!(
                "corpus manifest row {} is missing a column",
                entries.len() + 1
            )));
        };

        let audio = Path::new(audio.trim());
        let audio = if audio.is_relative() {
            base_dir.join(audio)
        } else {
            audio.to_path_buf()
        };

        entries.push(CorpusEntry::new(audio, transcript));
    }

    Ok(entries)
}
