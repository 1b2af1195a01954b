//! Training Driver
//!
//! Runs the outer loop of fine-tuning a model on a [`Dataset`]. The model
//! itself (forward pass, gradients, optimizer, checkpoint format) stays
//! behind the [`Learner`] trait; this module decides *when* things happen:
//!
//! ```text
//! counter = stored counter + 1  (or 1 for a new run)
//! loop until cancelled or max_steps:
//!     counter % save_every   == 0 → checkpoint
//!     counter % sample_every == 0 → write samples
//!     batch = batch_size windows of context_length tokens
//!     loss  = learner.train_step(batch)
//!     avg   = exponentially decayed mean of loss (decay 0.99)
//!     counter += 1
//! final checkpoint
//! ```
//!
//! ## Files
//!
//! ```text
//! <checkpoint_dir>/<run>/counter          last completed step, as text
//! <checkpoint_dir>/<run>/...              whatever the learner saves
//! <sample_dir>/<run>/samples-<counter>    "======== SAMPLE n ========" blocks
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//! use touchstone::{Dataset, Gpt2Tokenizer, Learner, Trainer, TrainingConfig, TrainingSampler};
//!
//! fn fine_tune<L: Learner>(learner: &mut L) -> touchstone::Result<()> {
//!     let tokenizer = Gpt2Tokenizer::load("models/117M/encoder.json", "models/117M/vocab.bpe")?;
//!     let dataset = Dataset::load(&tokenizer, "data", Some("txt"))?;
//!     let sampler = TrainingSampler::seeded(dataset, 42);
//!
//!     let stop = Arc::new(AtomicBool::new(false));
//!     let mut trainer = Trainer::new(TrainingConfig::default(), &tokenizer, sampler)?
//!         .with_cancellation(stop.clone());
//!     let summary = trainer.train(learner)?;
//!     println!("stopped after step {}", summary.last_step);
//!     Ok(())
//! }
//! ```

use crate::config::DecodeParams;
use crate::decoder::{Decoder, Scorer};
use crate::error::{Error, ErrorKind, Result, ScorerError};
use crate::sampler::TrainingSampler;
use crate::tokenizer::Gpt2Tokenizer;
use crate::training_logger::TrainingLogger;
use crate::TokenId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A model that can be trained as well as scored
pub trait Learner: Scorer {
    /// Run one optimisation step on a batch of token windows, returning the loss
    fn train_step(&mut self, batch: &[Vec<TokenId>]) -> std::result::Result<f32, ScorerError>;

    /// Persist the parameters after `counter` completed steps into `run_dir`
    fn save_checkpoint(&mut self, run_dir: &Path, counter: u64) -> Result<()>;
}

/// Training configuration
///
/// # Common Configurations
///
/// - **Default**: the GPT-2 fine-tuning schedule (1024-token windows,
///   sample every 100 steps, checkpoint every 1000)
/// - **Tiny**: short windows and frequent saves for smoke tests
#[derive(Clone, Debug)]
pub struct TrainingConfig {
    /// Windows per training batch (also the decode batch for samples)
    pub batch_size: usize,
    /// Tokens per training window
    pub context_length: usize,
    /// Tokens generated per sample, after the start token
    pub sample_length: usize,
    /// Samples written each time sampling triggers
    pub sample_num: usize,
    pub sample_every: u64,
    pub save_every: u64,
    pub temperature: f32,
    pub top_k: usize,
    /// Stop after this many steps in this session (`None` = until cancelled)
    pub max_steps: Option<u64>,
    pub checkpoint_dir: PathBuf,
    pub sample_dir: PathBuf,
    pub run_name: String,
    /// Seed for sample generation
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            context_length: 1024,
            sample_length: 1023,
            sample_num: 1,
            sample_every: 100,
            save_every: 1000,
            temperature: 1.0,
            top_k: 40,
            max_steps: None,
            checkpoint_dir: PathBuf::from("checkpoint"),
            sample_dir: PathBuf::from("samples"),
            run_name: "run1".to_string(),
            seed: None,
        }
    }
}

impl TrainingConfig {
    /// Create a tiny configuration for quick experiments
    pub fn tiny() -> Self {
        Self {
            batch_size: 2,
            context_length: 32,
            sample_length: 16,
            sample_every: 10,
            save_every: 50,
            max_steps: Some(100),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.context_length == 0 || self.sample_length == 0 {
            return Err(Error::InvalidInput(
                "batch size, context length and sample length must be positive".into(),
            ));
        }
        if self.sample_every == 0 || self.save_every == 0 {
            return Err(Error::InvalidInput(
                "sample and save intervals must be positive".into(),
            ));
        }
        DecodeParams::new(self.sample_length + 1, self.temperature, self.top_k).validate()
    }

    /// `<checkpoint_dir>/<run_name>`
    pub fn run_checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir.join(&self.run_name)
    }

    /// `<sample_dir>/<run_name>`
    pub fn run_sample_dir(&self) -> PathBuf {
        self.sample_dir.join(&self.run_name)
    }

    pub fn counter_file(&self) -> PathBuf {
        self.run_checkpoint_dir().join("counter")
    }
}

/// Exponentially decayed mean
///
/// Both the weighted sum and the total weight decay, so early steps are not
/// biased toward zero the way a plain EMA starting at 0 would be.
#[derive(Clone, Copy, Debug)]
pub struct RunningLoss {
    decay: f64,
    sum: f64,
    weight: f64,
}

impl RunningLoss {
    pub fn new(decay: f64) -> Self {
        Self {
            decay,
            sum: 0.0,
            weight: 0.0,
        }
    }

    /// Fold in a new loss and return the updated average
    pub fn update(&mut self, loss: f32) -> f32 {
        self.sum = self.sum * self.decay + f64::from(loss);
        self.weight = self.weight * self.decay + 1.0;
        self.value().unwrap_or(loss)
    }

    pub fn value(&self) -> Option<f32> {
        (self.weight > 0.0).then(|| (self.sum / self.weight) as f32)
    }
}

impl Default for RunningLoss {
    fn default() -> Self {
        Self::new(0.99)
    }
}

/// What a training session did
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingSummary {
    /// Counter value of the first step of this session
    pub first_step: u64,
    /// Last completed step (what the counter file now holds)
    pub last_step: u64,
    pub steps_run: u64,
    pub last_loss: Option<f32>,
    pub average_loss: Option<f32>,
    /// Stopped by the cancellation flag rather than `max_steps`
    pub cancelled: bool,
}

/// Training loop driver
pub struct Trainer<'a, R = StdRng> {
    config: TrainingConfig,
    tokenizer: &'a Gpt2Tokenizer,
    sampler: TrainingSampler<R>,
    sample_rng: StdRng,
    cancel: Option<Arc<AtomicBool>>,
    logger: Option<TrainingLogger>,
}

impl<'a, R: Rng> Trainer<'a, R> {
    /// Create a trainer
    ///
    /// # Arguments
    ///
    /// * `config` - Schedule and output locations
    /// * `tokenizer` - Decodes samples; its end-of-text token starts them
    /// * `sampler` - Source of training windows
    pub fn new(
        config: TrainingConfig,
        tokenizer: &'a Gpt2Tokenizer,
        sampler: TrainingSampler<R>,
    ) -> Result<Self> {
        config.validate()?;
        let sample_rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Ok(Self {
            config,
            tokenizer,
            sampler,
            sample_rng,
            cancel: None,
            logger: None,
        })
    }

    /// Stop cleanly (with a final checkpoint) once `flag` is set
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Also record every step in a CSV file
    pub fn with_logger(mut self, logger: TrainingLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Counter to start from: one past the stored value, or 1
    pub fn starting_counter(&self) -> Result<u64> {
        let path = self.config.counter_file();
        if !path.exists() {
            return Ok(1);
        }
        let text = fs::read_to_string(&path)?;
        let origin = path.display().to_string();
        let stored: u64 = text
            .trim()
            .parse()
            .map_err(|e| Error::config_load(origin.clone(), e))?;
        stored
            .checked_add(1)
            .ok_or_else(|| Error::config_load(origin, "step counter is at its maximum"))
    }

    fn save<L: Learner>(&self, learner: &mut L, completed: u64) -> Result<()> {
        let run_dir = self.config.run_checkpoint_dir();
        fs::create_dir_all(&run_dir)?;
        log::info!("Saving {} at step {}", run_dir.display(), completed);
        learner.save_checkpoint(&run_dir, completed)?;
        fs::write(self.config.counter_file(), completed.to_string())?;
        Ok(())
    }

    /// Generate `sample_num` samples from the learner and write them to disk
    pub fn generate_samples<L: Learner>(
        &mut self,
        learner: &mut L,
        counter: u64,
    ) -> Result<PathBuf> {
        let start = self.tokenizer.end_of_text()?;
        let params = DecodeParams::new(
            self.config.sample_length + 1,
            self.config.temperature,
            self.config.top_k,
        );
        let mut decoder = Decoder::new(params)?;
        if let Some(flag) = &self.cancel {
            decoder = decoder.with_cancellation(flag.clone());
        }

        let mut blocks = Vec::with_capacity(self.config.sample_num);
        while blocks.len() < self.config.sample_num {
            let out = decoder.generate_repeated(
                learner,
                &[start],
                self.config.batch_size,
                &mut self.sample_rng,
            )?;
            for sequence in out.iter().take(self.config.sample_num - blocks.len()) {
                let text = self.tokenizer.decode(&sequence[1..])?;
                let index = blocks.len() + 1;
                if let Some(logger) = &self.logger {
                    logger.log_sample(counter, index, &text);
                }
                blocks.push(format!("======== SAMPLE {index} ========\n{text}\n"));
            }
        }

        let dir = self.config.run_sample_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("samples-{counter}"));
        fs::write(&path, blocks.join("\n") + "\n")?;
        log::info!("Wrote {} samples to {}", blocks.len(), path.display());
        Ok(path)
    }

    /// Run the training loop
    ///
    /// Returns after cancellation or `max_steps`, having written a final
    /// checkpoint. Any learner, sampler or I/O error aborts the run without
    /// the final checkpoint.
    pub fn train<L: Learner>(&mut self, learner: &mut L) -> Result<TrainingSummary> {
        let first_step = self.starting_counter()?;
        let mut counter = first_step;
        let mut running = RunningLoss::default();
        let mut last_loss = None;
        let mut cancelled = false;
        let start_time = Instant::now();

        log::info!(
            "Training run {:?} from step {} on {} tokens",
            self.config.run_name,
            first_step,
            self.sampler.token_count()
        );

        loop {
            if self.is_cancelled() {
                cancelled = true;
                break;
            }
            if self
                .config
                .max_steps
                .is_some_and(|max| counter - first_step >= max)
            {
                break;
            }

            if counter % self.config.save_every == 0 {
                self.save(learner, counter - 1)?;
            }
            if counter % self.config.sample_every == 0 {
                match self.generate_samples(learner, counter) {
                    Err(e) if e.kind() == ErrorKind::Cancelled => {
                        cancelled = true;
                        break;
                    }
                    other => {
                        other?;
                    }
                }
            }

            let batch = self
                .sampler
                .sample_batch(self.config.batch_size, self.config.context_length)?;
            let loss = learner.train_step(&batch)?;
            let avg = running.update(loss);
            last_loss = Some(loss);

            log::debug!(
                "[{} | {:.2}s] loss={:.4} avg={:.4}",
                counter,
                start_time.elapsed().as_secs_f32(),
                loss,
                avg
            );
            if let Some(logger) = self.logger.as_mut() {
                logger.log(counter, loss, avg)?;
            }

            counter += 1;
        }

        if cancelled {
            log::info!("Interrupted");
        }
        let last_step = counter - 1;
        self.save(learner, last_step)?;

        Ok(TrainingSummary {
            first_step,
            last_step,
            steps_run: counter - first_step,
            last_loss,
            average_loss: running.value(),
            cancelled,
        })
    }
}
