//! Error types
//!
//! Every fallible operation in the crate returns [`Result`]. Errors are grouped
//! into a small taxonomy ([`ErrorKind`]) so callers can decide what to do
//! without matching on every variant:
//!
//! - **ConfigLoad**: vocabulary, merge table or hyperparameter files are missing
//!   or malformed, or the vocabulary cannot represent a merged sub-token. Fatal.
//! - **EmptyDataset**: the corpus holds no tokens at all.
//! - **ChunkTooSmall**: the requested window is too long for the corpus chunks.
//! - **UnknownToken**: a token ID has no vocabulary entry (vocabulary/model mismatch).
//! - **ScorerFailure**: the external scorer failed. See [`ScorerError`].
//! - **InvalidInput**: a caller-supplied parameter is out of range.
//! - **Cancelled**: a cancellation flag was observed between steps.
//! - **Io**: reading corpus files or writing samples failed.
//!
//! None of these are retried internally, with one exception: the decoder
//! retries once with a shorter length after [`ScorerError::ResourceExhausted`].

use crate::TokenId;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigLoad,
    EmptyDataset,
    ChunkTooSmall,
    UnknownToken,
    ScorerFailure,
    InvalidInput,
    Cancelled,
    Io,
}

/// Errors produced by the tokenizer, sampler, decoder and training driver
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration resource could not be read or parsed
    #[error("failed to load {origin}: {reason}")]
    ConfigLoad { origin: String, reason: String },

    /// BPE produced a sub-token the vocabulary does not contain
    #[error("vocabulary has no entry for sub-token {0:?}")]
    MissingSubToken(String),

    #[error("dataset is empty")]
    EmptyDataset,

    #[error(
        "dataset chunks are too small to sample {requested} tokens at a time, maximum is {maximum}"
    )]
    ChunkTooSmall { requested: usize, maximum: usize },

    #[error("token id {0} is not in the vocabulary")]
    UnknownToken(TokenId),

    #[error("scorer failed: {0}")]
    Scorer(#[from] ScorerError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The pre-tokenizer pattern hit a runtime limit (e.g. backtracking)
    #[error("pre-tokenizer failed: {0}")]
    Pretokenize(#[from] fancy_regex::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a [`Error::ConfigLoad`] from anything printable
    pub fn config_load(origin: impl Into<String>, reason: impl ToString) -> Self {
        Error::ConfigLoad {
            origin: origin.into(),
            reason: reason.to_string(),
        }
    }

    /// Which part of the taxonomy this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigLoad { .. } | Error::MissingSubToken(_) => ErrorKind::ConfigLoad,
            Error::EmptyDataset => ErrorKind::EmptyDataset,
            Error::ChunkTooSmall { .. } => ErrorKind::ChunkTooSmall,
            Error::UnknownToken(_) => ErrorKind::UnknownToken,
            Error::Scorer(_) => ErrorKind::ScorerFailure,
            Error::InvalidInput(_) | Error::Pretokenize(_) => ErrorKind::InvalidInput,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}

/// Failures reported by an external [`Scorer`](crate::decoder::Scorer)
///
/// The decoder treats the contents as opaque. It only distinguishes resource
/// exhaustion, which earns one retry with a shorter target length.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScorerError {
    /// The host ran out of memory or another bounded resource
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Any other failure
    #[error("{0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::EmptyDataset.kind(), ErrorKind::EmptyDataset);
        assert_eq!(
            Error::ChunkTooSmall {
                requested: 10,
                maximum: 3
            }
            .kind(),
            ErrorKind::ChunkTooSmall
        );
        assert_eq!(Error::UnknownToken(7).kind(), ErrorKind::UnknownToken);
        assert_eq!(
            Error::MissingSubToken("xy".into()).kind(),
            ErrorKind::ConfigLoad
        );
        assert_eq!(
            Error::from(ScorerError::Failed("boom".into())).kind(),
            ErrorKind::ScorerFailure
        );
    }

    #[test]
    fn test_display_mentions_limits() {
        let err = Error::ChunkTooSmall {
            requested: 50,
            maximum: 12,
        };
        let message = err.to_string();
        assert!(message.contains("50"));
        assert!(message.contains("12"));
    }

    #[test]
    fn test_config_load_helper() {
        let err = Error::config_load("encoder.json", "expected value at line 1");
        assert_eq!(err.kind(), ErrorKind::ConfigLoad);
        assert!(err.to_string().starts_with("failed to load encoder.json"));
    }
}
