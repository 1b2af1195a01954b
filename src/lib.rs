//! Touchstone: GPT-2 Text Pipeline
//!
//! The parts of a GPT-2 system that surround the network: byte-level BPE
//! tokenization, training window sampling, autoregressive decoding and the
//! fine-tuning loop. The network itself is plugged in through the
//! [`Scorer`] and [`Learner`] traits.
//!
//! # Modules
//!
//! - [`byte_codec`] - Reversible byte ⟷ visible symbol mapping
//! - [`vocab`] - Vocabulary and merge rank tables (`encoder.json`, `vocab.bpe`)
//! - [`tokenizer`] - Pre-tokenization and Byte Pair Encoding
//! - [`config`] - Model hyperparameters, model files and sampling settings
//! - [`dataset`] - Token chunks, corpus loading and packing
//! - [`sampler`] - Uniform training windows that never cross chunks
//! - [`sampling`] - Temperature, top-k and categorical draws
//! - [`decoder`] - The generation loop and the [`Scorer`] contract
//! - [`train`] - The fine-tuning loop around a [`Learner`]
//! - [`training_logger`] - CSV and log output for training runs
//!
//! # Example
//!
//! ```rust,no_run
//! use touchstone::{Dataset, Gpt2Tokenizer, ModelFiles, TrainingSampler};
//!
//! // Load the released tokenizer
//! let files = ModelFiles::new(".", "117M");
//! let tokenizer = Gpt2Tokenizer::from_model_files(&files)?;
//!
//! // Encode and decode
//! let ids = tokenizer.encode("Hello world!")?;
//! assert_eq!(tokenizer.decode(&ids)?, "Hello world!");
//!
//! // Draw training windows from a corpus
//! let dataset = Dataset::load(&tokenizer, "corpus", Some("txt"))?;
//! let mut sampler = TrainingSampler::seeded(dataset, 42);
//! let window = sampler.sample(1024)?;
//! # Ok::<(), touchstone::Error>(())
//! ```
//!
//! # Logging
//!
//! Progress is reported through the [`log`] facade. Install any logger
//! (`env_logger`, `simple_logger`, ...) in the host binary to see it.

pub mod byte_codec;
pub mod config;
pub mod dataset;
pub mod decoder;
pub mod error;
pub mod sampler;
pub mod sampling;
pub mod tokenizer;
pub mod train;
pub mod training_logger;
pub mod vocab;

/// Index into the vocabulary
pub type TokenId = u32;

// Re-export main types for convenience
pub use config::{DecodeParams, HParams, ModelFiles, SamplingConfig};
pub use dataset::Dataset;
pub use decoder::{DecodeState, Decoder, PastState, Phase, Scored, Scorer};
pub use error::{Error, ErrorKind, Result, ScorerError};
pub use sampler::TrainingSampler;
pub use tokenizer::{Gpt2Tokenizer, TokenizerStats, END_OF_TEXT};
pub use train::{Learner, RunningLoss, Trainer, TrainingConfig, TrainingSummary};
pub use training_logger::TrainingLogger;
pub use vocab::{MergeRanks, Vocabulary};
