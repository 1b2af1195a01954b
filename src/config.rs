//! Model hyperparameters and sampling configuration
//!
//! [`HParams`] describes the transformer a [`Scorer`](crate::decoder::Scorer)
//! implements. The pipeline itself only needs `n_vocab` and `n_ctx`, but the
//! full set is carried so cache shapes can be described and checked.
//!
//! ## Files on disk
//!
//! Released GPT-2 models live in a directory per model:
//!
//! ```text
//! models/117M/
//!   encoder.json   token → id table
//!   vocab.bpe      ranked merge rules
//!   hparams.json   {"n_vocab": 50257, "n_ctx": 1024, "n_embd": 768, "n_head": 12, "n_layer": 12}
//! ```
//!
//! [`ModelFiles`] resolves those paths.

use crate::error::{Error, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Transformer hyperparameters
///
/// Missing fields in `hparams.json` fall back to the 117M defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HParams {
    /// Vocabulary size (0 until a model says otherwise)
    pub n_vocab: usize,
    /// Context window: the longest sequence the model can attend over
    pub n_ctx: usize,
    /// Embedding width
    pub n_embd: usize,
    /// Attention heads per layer
    pub n_head: usize,
    /// Transformer blocks
    pub n_layer: usize,
}

impl Default for HParams {
    fn default() -> Self {
        Self {
            n_vocab: 0,
            n_ctx: 1024,
            n_embd: 768,
            n_head: 12,
            n_layer: 12,
        }
    }
}

impl HParams {
    /// The released 117M model with the full GPT-2 vocabulary
    pub fn gpt2_small() -> Self {
        Self {
            n_vocab: 50257,
            ..Self::default()
        }
    }

    /// The released 345M model
    pub fn gpt2_medium() -> Self {
        Self {
            n_vocab: 50257,
            n_ctx: 1024,
            n_embd: 1024,
            n_head: 16,
            n_layer: 24,
        }
    }

    /// A tiny configuration for tests and toy scorers
    pub fn tiny(n_vocab: usize) -> Self {
        Self {
            n_vocab,
            n_ctx: 64,
            n_embd: 32,
            n_head: 2,
            n_layer: 2,
        }
    }

    /// Parse `hparams.json` text
    pub fn from_json(json: &str, origin: &str) -> Result<Self> {
        let hparams: HParams =
            serde_json::from_str(json).map_err(|e| Error::config_load(origin, e))?;
        hparams.validate().map_err(|e| Error::config_load(origin, e))?;
        Ok(hparams)
    }

    /// Load and validate `hparams.json`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let json = fs::read_to_string(path).map_err(|e| Error::config_load(&origin, e))?;
        Self::from_json(&json, &origin)
    }

    /// Check the dimensions are consistent
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.n_ctx == 0 {
            return Err("n_ctx must be positive".into());
        }
        if self.n_head == 0 {
            return Err("n_head must be positive".into());
        }
        if self.n_embd % self.n_head != 0 {
            return Err(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            ));
        }
        Ok(())
    }

    /// Width of one attention head
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Shape of the cached keys/values ("past") for a batch
    ///
    /// `[batch, n_layer, 2, n_head, sequence, head_dim]`. `None` marks a
    /// dimension that is not fixed yet (dynamic batch or growing sequence).
    pub fn past_shape(&self, batch: Option<usize>, sequence: Option<usize>) -> [Option<usize>; 6] {
        [
            batch,
            Some(self.n_layer),
            Some(2),
            Some(self.n_head),
            sequence,
            Some(self.head_dim()),
        ]
    }
}

/// Location of a released model's files
#[derive(Clone, Debug)]
pub struct ModelFiles {
    dir: PathBuf,
}

impl ModelFiles {
    /// `<root>/models/<model_name>`
    pub fn new<P: AsRef<Path>>(root: P, model_name: &str) -> Self {
        Self {
            dir: root.as_ref().join("models").join(model_name),
        }
    }

    /// Use an explicit directory
    pub fn in_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn encoder_json(&self) -> PathBuf {
        self.dir.join("encoder.json")
    }

    pub fn merges(&self) -> PathBuf {
        self.dir.join("vocab.bpe")
    }

    pub fn hparams(&self) -> PathBuf {
        self.dir.join("hparams.json")
    }

    /// Load `hparams.json`
    pub fn load_hparams(&self) -> Result<HParams> {
        HParams::load(self.hparams())
    }
}

/// Parameters of a sampling session
///
/// These are what an interactive front end would collect from the user.
#[derive(Clone, Debug)]
pub struct SamplingConfig {
    /// Samples to produce per prompt
    pub sample_count: usize,
    /// Sequences decoded together; must divide `sample_count`
    pub batch_size: usize,
    /// Total sequence length including the prompt (`None` = the context window)
    pub length: Option<usize>,
    /// Logit divisor; lower is more deterministic
    pub temperature: f32,
    /// Keep only the k most likely tokens per step (0 disables)
    pub top_k: usize,
    /// Seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sample_count: 1,
            batch_size: 1,
            length: None,
            temperature: 1.0,
            top_k: 0,
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// Settings the GPT-2 authors recommend for readable text
    pub fn top_k_40() -> Self {
        Self {
            top_k: 40,
            ..Self::default()
        }
    }

    /// Check the settings against a model and pin down the total length
    pub fn resolve(&self, hparams: &HParams) -> Result<DecodeParams> {
        if self.batch_size == 0 || self.sample_count % self.batch_size != 0 {
            return Err(Error::InvalidInput(format!(
                "batch size {} must divide sample count {}",
                self.batch_size, self.sample_count
            )));
        }

        let length = self.length.unwrap_or(hparams.n_ctx);
        if length > hparams.n_ctx {
            return Err(Error::InvalidInput(format!(
                "can't get samples longer than window size: {}",
                hparams.n_ctx
            )));
        }

        let params = DecodeParams {
            length,
            temperature: self.temperature,
            top_k: self.top_k,
        };
        params.validate()?;
        Ok(params)
    }

    /// Number of decoder runs needed for `sample_count` samples
    pub fn batches(&self) -> usize {
        self.sample_count / self.batch_size.max(1)
    }

    /// Random source for a sampling session
    ///
    /// A fixed `seed` makes every draw, and so every decoded sample,
    /// reproducible. Without one the generator is seeded from the thread RNG.
    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        }
    }
}

/// Per-run decoder parameters
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecodeParams {
    /// Total output length per sequence, prompt included
    pub length: usize,
    pub temperature: f32,
    /// 0 disables top-k filtering
    pub top_k: usize,
}

impl DecodeParams {
    pub fn new(length: usize, temperature: f32, top_k: usize) -> Self {
        Self {
            length,
            temperature,
            top_k,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(Error::InvalidInput(format!(
                "temperature must be a positive number, got {}",
                self.temperature
            )));
        }
        if self.length == 0 {
            return Err(Error::InvalidInput("length must be positive".into()));
        }
        Ok(())
    }
}
