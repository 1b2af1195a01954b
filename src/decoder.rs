//! Autoregressive decoding
//!
//! The decoder extends a batch of prompts one token at a time. It does not
//! know anything about the network producing the logits: that lives behind
//! the [`Scorer`] trait, so a real transformer and a ten-line test stub are
//! driven the same way.
//!
//! ## The past
//!
//! A transformer re-reads every earlier position on every step unless it keeps
//! the attention keys and values around. The scorer hands those back as a
//! `present` value per call; the decoder accumulates them into a `past`
//! ([`PastState::extend`]) and passes the past into the next call. The decoder
//! never looks inside.
//!
//! ## States
//!
//! ```text
//!   begin()                 step() × n                   step()
//! ──────────► Seeded ───────────► Stepping ─── ... ───────────► Done
//!   prompt[..len-1]          last token + past        length == target
//!   scored once
//! ```
//!
//! Seeding feeds the prompt minus its final token in a single call to build
//! the initial past. Each step then feeds only the most recent token, samples
//! one new token per row with [`sample_next_token`], and appends it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rand::SeedableRng;
//! use touchstone::{DecodeParams, Decoder, Scorer};
//!
//! fn complete<S: Scorer>(scorer: &mut S, prompt: &[u32]) -> touchstone::Result<Vec<Vec<u32>>> {
//!     let decoder = Decoder::new(DecodeParams::new(64, 0.8, 40))?.with_context_window(1024);
//!     let mut rng = rand::rngs::StdRng::seed_from_u64(1);
//!     decoder.generate_repeated(scorer, prompt, 4, &mut rng)
//! }
//! ```

use crate::config::DecodeParams;
use crate::error::{Error, Result, ScorerError};
use crate::sampling::sample_next_token;
use crate::TokenId;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Accumulated per-position state threaded between scorer calls
pub trait PastState {
    /// Append the positions of `present` after the ones already held
    fn extend(&mut self, present: Self);
}

/// Output of one scorer call
#[derive(Debug, Clone)]
pub struct Scored<P> {
    /// One row of vocabulary logits per batch element, for the last position
    pub logits: Vec<Vec<f32>>,
    /// State for the positions scored by this call
    pub present: P,
}

/// The model boundary
///
/// `tokens` is a `[batch][sequence]` block of new positions. `past`, when
/// present, covers every earlier position of the same rows.
pub trait Scorer {
    type Past: PastState;

    fn score(
        &mut self,
        tokens: &[Vec<TokenId>],
        past: Option<&Self::Past>,
    ) -> std::result::Result<Scored<Self::Past>, ScorerError>;
}

/// Where a decode run is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Prompt processed, no token generated yet
    Seeded,
    /// At least one token generated, more to go
    Stepping,
    /// Every row reached the target length
    Done,
}

/// In-flight decode run
#[derive(Debug)]
pub struct DecodeState<P> {
    phase: Phase,
    target: usize,
    sequences: Vec<Vec<TokenId>>,
    past: Option<P>,
}

impl<P> DecodeState<P> {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Total length every row will have when done
    pub fn target(&self) -> usize {
        self.target
    }

    /// Current length of every row
    pub fn len(&self) -> usize {
        self.sequences.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sequences(&self) -> &[Vec<TokenId>] {
        &self.sequences
    }

    pub fn into_sequences(self) -> Vec<Vec<TokenId>> {
        self.sequences
    }
}

/// Batch autoregressive decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    params: DecodeParams,
    n_ctx: Option<usize>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Decoder {
    /// Create a decoder
    ///
    /// # Arguments
    ///
    /// * `params` - Target length (prompt included), temperature and top-k
    ///
    /// # Returns
    ///
    /// `InvalidInput` if the temperature is not a positive number or the
    /// length is zero.
    pub fn new(params: DecodeParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            n_ctx: None,
            cancel: None,
        })
    }

    /// Refuse target lengths longer than the model's context window
    pub fn with_context_window(mut self, n_ctx: usize) -> Self {
        self.n_ctx = Some(n_ctx);
        self
    }

    /// Stop with [`Error::Cancelled`] once `flag` is set
    ///
    /// The flag is checked before every scorer call, never during one.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn params(&self) -> &DecodeParams {
        &self.params
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    /// Validate the prompts and run the seeding call
    ///
    /// A prompt that already has `target` tokens comes back in
    /// [`Phase::Done`] without touching the scorer. A single-token prompt has
    /// nothing to seed, so the first step runs without a past.
    pub fn begin<S: Scorer>(
        &self,
        scorer: &mut S,
        prompts: &[Vec<TokenId>],
        target: usize,
    ) -> Result<DecodeState<S::Past>> {
        let prompt_len = match prompts.first() {
            Some(first) => first.len(),
            None => return Err(Error::InvalidInput("prompt batch is empty".into())),
        };
        if prompt_len == 0 {
            return Err(Error::InvalidInput("prompt has no tokens".into()));
        }
        if prompts.iter().any(|row| row.len() != prompt_len) {
            return Err(Error::InvalidInput(
                "prompts in a batch must all have the same length".into(),
            ));
        }
        if let Some(n_ctx) = self.n_ctx {
            if target > n_ctx {
                return Err(Error::InvalidInput(format!(
                    "can't get samples longer than window size: {n_ctx}"
                )));
            }
        }
        if prompt_len > target {
            return Err(Error::InvalidInput(format!(
                "prompt of {prompt_len} tokens is longer than the target length {target}"
            )));
        }

        let mut state = DecodeState {
            phase: Phase::Seeded,
            target,
            sequences: prompts.to_vec(),
            past: None,
        };

        if prompt_len == target {
            state.phase = Phase::Done;
            return Ok(state);
        }

        if prompt_len > 1 {
            self.check_cancelled()?;
            let context: Vec<Vec<TokenId>> = prompts
                .iter()
                .map(|row| row[..prompt_len - 1].to_vec())
                .collect();
            let scored = scorer.score(&context, None)?;
            state.past = Some(scored.present);
            log::debug!(
                "Seeded {} sequences with {} prompt tokens",
                prompts.len(),
                prompt_len - 1
            );
        }

        Ok(state)
    }

    /// Generate one token for every row
    pub fn step<S: Scorer, R: Rng + ?Sized>(
        &self,
        scorer: &mut S,
        state: &mut DecodeState<S::Past>,
        rng: &mut R,
    ) -> Result<Phase> {
        if state.phase == Phase::Done {
            return Ok(Phase::Done);
        }

        let last: Vec<Vec<TokenId>> = state
            .sequences
            .iter()
            .map(|row| row[row.len() - 1..].to_vec())
            .collect();
        let scored = scorer.score(&last, state.past.as_ref())?;

        if scored.logits.len() != state.sequences.len() {
            return Err(ScorerError::Failed(format!(
                "scorer returned {} logit rows for a batch of {}",
                scored.logits.len(),
                state.sequences.len()
            ))
            .into());
        }

        // A failed draw must leave every row untouched
        let mut next = Vec::with_capacity(scored.logits.len());
        for logits in &scored.logits {
            next.push(sample_next_token(logits, &self.params, rng)?);
        }
        for (row, token) in state.sequences.iter_mut().zip(next) {
            row.push(token);
        }

        match state.past.as_mut() {
            Some(past) => past.extend(scored.present),
            None => state.past = Some(scored.present),
        }

        state.phase = if state.len() >= state.target {
            Phase::Done
        } else {
            Phase::Stepping
        };
        Ok(state.phase)
    }

    fn run<S: Scorer, R: Rng + ?Sized>(
        &self,
        scorer: &mut S,
        prompts: &[Vec<TokenId>],
        target: usize,
        rng: &mut R,
    ) -> Result<Vec<Vec<TokenId>>> {
        let mut state = self.begin(scorer, prompts, target)?;
        while state.phase != Phase::Done {
            self.check_cancelled()?;
            self.step(scorer, &mut state, rng)?;
        }
        Ok(state.into_sequences())
    }

    /// Extend every prompt to the configured length
    ///
    /// Returns full sequences, prompt included. If the scorer reports
    /// resource exhaustion, the run is retried once with the target shortened
    /// by the prompt length; a second failure is returned as is.
    pub fn generate<S: Scorer, R: Rng + ?Sized>(
        &self,
        scorer: &mut S,
        prompts: &[Vec<TokenId>],
        rng: &mut R,
    ) -> Result<Vec<Vec<TokenId>>> {
        let target = self.params.length;
        match self.run(scorer, prompts, target, rng) {
            Err(Error::Scorer(ScorerError::ResourceExhausted(reason))) => {
                let prompt_len = prompts.first().map_or(0, Vec::len);
                let reduced = target.saturating_sub(prompt_len);
                if reduced <= prompt_len {
                    return Err(ScorerError::ResourceExhausted(reason).into());
                }
                log::warn!(
                    "Scorer ran out of resources at length {target} ({reason}), retrying with length {reduced}"
                );
                self.run(scorer, prompts, reduced, rng)
            }
            other => other,
        }
    }

    /// Decode `batch_size` independent continuations of one prompt
    pub fn generate_repeated<S: Scorer, R: Rng + ?Sized>(
        &self,
        scorer: &mut S,
        prompt: &[TokenId],
        batch_size: usize,
        rng: &mut R,
    ) -> Result<Vec<Vec<TokenId>>> {
        if batch_size == 0 {
            return Err(Error::InvalidInput("batch size must be positive".into()));
        }
        let prompts = vec![prompt.to_vec(); batch_size];
        self.generate(scorer, &prompts, rng)
    }
}
