use std::path::PathBuf;

use thiserror::Error;

/// featstage's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// featstage's crate-wide error type.
///
/// The variants follow the pipeline's failure taxonomy:
/// - `Audio` is item-level: the worker pool logs it and skips the item.
/// - `ResourceExhausted` is fatal for the run and kept distinct so callers can retry with
///   a smaller batch size instead of treating it like a generic failure.
/// - `Staging` / `Assembly` are fatal and always name the offending batch.
/// - `Config` is raised before any batch work begins.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to load audio '{}': {message}", path.display())]
    Audio { path: PathBuf, message: String },

    #[error(
        "available memory is {available_percent:.1}%, at or below the critical threshold of \
         {threshold_percent:.1}%; lower samples_per_batch and retry"
    )]
    ResourceExhausted {
        available_percent: f32,
        threshold_percent: f32,
    },

    #[error("failed to stage batch {batch}: {message}")]
    Staging { batch: usize, message: String },

    #[error("failed to assemble batch {batch}: {message}")]
    Assembly { batch: usize, message: String },

    #[error("invalid dataset container: {0}")]
    Container(String),

    #[error("label index {index} is not part of the vocabulary")]
    Decode { index: i32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub(crate) fn container(message: impl Into<String>) -> Self {
        Self::Container(message.into())
    }

    /// Whether this error is the memory guard tripping.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }

    /// The batch a staging or assembly error refers to.
    pub fn batch(&self) -> Option<usize> {
        match self {
            Self::Staging { batch, .. } | Self::Assembly { batch, .. } => Some(*batch),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Message(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_exhaustion_is_distinguishable() {
        let err = Error::ResourceExhausted {
            available_percent: 9.0,
            threshold_percent: 10.0,
        };
        assert!(err.is_resource_exhausted());
        assert!(err.to_string().contains("9.0%"));
        assert!(!Error::msg("boom").is_resource_exhausted());
    }

    #[test]
    fn staging_and_assembly_errors_carry_batch_index() {
        let staging = Error::Staging {
            batch: 3,
            message: "disk full".into(),
        };
        let assembly = Error::Assembly {
            batch: 7,
            message: "missing".into(),
        };
        assert_eq!(staging.batch(), Some(3));
        assert_eq!(assembly.batch(), Some(7));
        assert_eq!(Error::config("x").batch(), None);
        assert!(assembly.to_string().contains("batch 7"));
    }

    #[test]
    fn anyhow_errors_keep_their_context_chain() {
        let err: Error = anyhow::anyhow!("inner").context("outer").into();
        assert_eq!(err.to_string(), "outer: inner");
    }
}
