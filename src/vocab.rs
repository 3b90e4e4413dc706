//! Character vocabulary and fixed-length label encoding.
//!
//! Transcripts are cleaned (lowercased, keeping only alphanumerics and whitespace) before the
//! vocabulary is built and before every encode, so both sides agree on the alphabet. Index 0 is
//! reserved for padding; characters map to `1..=len()` in sorted order.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Index reserved for padding in every label sequence.
pub const PAD_INDEX: i32 = 0;

/// Display token for `PAD_INDEX`.
pub const PAD_TOKEN: &str = "<PAD>";

/// A fixed-length sequence of vocabulary indices.
pub type LabelSequence = Vec<i32>;

/// Lowercase and keep only alphanumeric characters and whitespace.
pub fn clean_transcript(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect()
}

/// Sorted character set with stable 1-based indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    characters: Vec<char>,
}

impl Vocabulary {
    /// Build a vocabulary from every character in the cleaned transcripts.
    pub fn build<'a>(transcripts: impl IntoIterator<Item = &'a str>) -> Self {
        let set: BTreeSet<char> = transcripts
            .into_iter()
            .flat_map(|t| clean_transcript(t).chars().collect::<Vec<_>>())
            .collect();

        Self {
            characters: set.into_iter().collect(),
        }
    }

    /// Build from an explicit character list; duplicates are removed and order normalised.
    pub fn from_characters(characters: impl IntoIterator<Item = char>) -> Self {
        let set: BTreeSet<char> = characters.into_iter().collect();
        Self {
            characters: set.into_iter().collect(),
        }
    }

    /// Number of distinct characters (excluding padding).
    pub fn len(&self) -> usize {
        self.characters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    /// Output classes a model needs: every character plus the padding index.
    pub fn num_classes(&self) -> usize {
        self.characters.len() + 1
    }

    pub fn characters(&self) -> &[char] {
        &self.characters
    }

    pub fn index_of(&self, c: char) -> Option<i32> {
        self.characters
            .binary_search(&c)
            .ok()
            .map(|pos| pos as i32 + 1)
    }

    pub fn char_of(&self, index: i32) -> Option<char> {
        if index < 1 {
            return None;
        }
        self.characters.get(index as usize - 1).copied()
    }

    /// Encode a transcript into exactly `length` indices.
    ///
    /// Characters outside the vocabulary are dropped. Longer transcripts are truncated;
    /// shorter ones are padded at the end with `PAD_INDEX`.
    pub fn encode(&self, transcript: &str, length: usize) -> LabelSequence {
        let mut labels = Vec::with_capacity(length);
        let mut dropped = 0usize;

        for c in clean_transcript(transcript).chars() {
            match self.index_of(c) {
                Some(index) => labels.push(index),
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            tracing::debug!(dropped, "transcript characters missing from vocabulary");
        }
        if labels.len() > length {
            tracing::debug!(
                len = labels.len(),
                max = length,
                "truncating transcript labels"
            );
        }

        labels.resize(length, PAD_INDEX);
        labels
    }

    /// Map indices back to text, skipping padding.
    pub fn decode(&self, labels: &[i32]) -> Result<String> {
        labels
            .iter()
            .filter(|&&index| index != PAD_INDEX)
            .map(|&index| self.char_of(index).ok_or(Error::Decode { index }))
            .collect()
    }

    /// Cleaned characters in `transcripts` that this vocabulary cannot encode, sorted.
    pub fn missing_characters<'a>(
        &self,
        transcripts: impl IntoIterator<Item = &'a str>,
    ) -> Vec<char> {
        let missing: BTreeSet<char> = transcripts
            .into_iter()
            .flat_map(|t| clean_transcript(t).chars().collect::<Vec<_>>())
            .filter(|&c| self.index_of(c).is_none())
            .collect();
        missing.into_iter().collect()
    }

    /// Persist as JSON so later runs (and consumers) can reuse the same indices.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let vocab: Vocabulary = serde_json::from_str(&contents)?;
        // Normalise in case the file was edited by hand.
        Ok(Self::from_characters(vocab.characters))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_transcript_drops_punctuation_and_lowercases() {
        assert_eq!(clean_transcript("Hello, World!"), "hello world");
        assert_eq!(clean_transcript("it's 4 PM."), "its 4 pm");
    }

    #[test]
    fn vocabulary_is_sorted_and_one_based() {
        let vocab = Vocabulary::build(["cab", "Bad!"]);
        assert_eq!(vocab.characters(), &['a', 'b', 'c', 'd']);
        assert_eq!(vocab.index_of('a'), Some(1));
        assert_eq!(vocab.index_of('d'), Some(4));
        assert_eq!(vocab.index_of('!'), None);
        assert_eq!(vocab.num_classes(), 5);
    }

    #[test]
    fn encode_pads_at_the_end() {
        let vocab = Vocabulary::build(["ab"]);
        assert_eq!(vocab.encode("ba", 5), vec![2, 1, 0, 0, 0]);
    }

    #[test]
    fn encode_truncates_long_transcripts() {
        let vocab = Vocabulary::build(["abc"]);
        assert_eq!(vocab.encode("abcabc", 4), vec![1, 2, 3, 1]);
    }

    #[test]
    fn encode_drops_unknown_characters() {
        let vocab = Vocabulary::build(["ab"]);
        assert_eq!(vocab.encode("axb", 3), vec![1, 2, 0]);
    }

    #[test]
    fn missing_characters_lists_what_encode_would_drop() {
        let vocab = Vocabulary::build(["abc"]);
        assert_eq!(vocab.missing_characters(["cab", "Dab, c!", "xa"]), vec![' ', 'd', 'x']);
        assert!(vocab.missing_characters(["a b", "CBA."]).contains(&' '));
        assert!(vocab.missing_characters(["cab"]).is_empty());
    }

    #[test]
    fn decode_recovers_cleaned_text() -> anyhow::Result<()> {
        let vocab = Vocabulary::build(["hello world"]);
        let labels = vocab.encode("Hello, world.", 20);
        assert_eq!(vocab.decode(&labels)?, "hello world");
        Ok(())
    }

    #[test]
    fn decode_rejects_out_of_range_indices() {
        let vocab = Vocabulary::build(["ab"]);
        let err = vocab.decode(&[1, 9]).unwrap_err();
        assert!(matches!(err, Error::Decode { index: 9 }));
    }

    #[test]
    fn vocabulary_persists_as_json() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vocab.json");

        let vocab = Vocabulary::build(["the quick brown fox"]);
        vocab.save(&path)?;
        assert_eq!(Vocabulary::load(&path)?, vocab);
        Ok(())
    }
}
