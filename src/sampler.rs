//! Training Window Sampler
//!
//! Draws fixed-length token windows uniformly from a [`Dataset`] without ever
//! crossing a chunk boundary.
//!
//! ## How a Draw Works
//!
//! ```text
//! boundaries: [0, 100, 105, 305]     length: 50
//!
//! 1. index ~ U[0, 305 - 50)           say 83
//! 2. chunk  = locate(83)              0
//! 3. 83 + 50 <= boundaries[1] = 100?  no → draw again
//!
//! 1. index ~ U[0, 255)                say 140
//! 2. chunk  = locate(140)             2
//! 3. 140 + 50 <= 305?                 yes → chunk 2, offset 35..85
//! ```
//!
//! This is rejection sampling: every window that fits inside one chunk is
//! equally likely. The loop has no retry cap. It terminates quickly when
//! windows are short relative to chunks, but nothing stops a corpus of many
//! tiny chunks and one just-long-enough chunk from spinning for a long time.
//!
//! The [`ChunkTooSmall`](crate::Error::ChunkTooSmall) guard rejects windows of
//! at least the average chunk length up front. It is an estimate, not a
//! proof that some chunk can hold the window.

use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::TokenId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// First index in `lo..=hi` where `pred` turns true
///
/// `pred` must be monotonic (false, ..., false, true, ..., true) with
/// `pred(lo) == false` and `pred(hi) == true`.
///
/// # Example
///
/// ```rust
/// use touchstone::sampler::binary_search;
///
/// let boundaries = [0, 100, 105, 305];
/// // Chunk holding position 102
/// let chunk = binary_search(|j| boundaries[j] > 102, 0, 3) - 1;
/// assert_eq!(chunk, 1);
/// ```
pub fn binary_search<F: Fn(usize) -> bool>(pred: F, mut lo: usize, mut hi: usize) -> usize {
    debug_assert!(!pred(lo) && pred(hi), "predicate must flip between lo and hi");
    while hi > lo + 1 {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    hi
}

/// Uniform window sampler over a dataset
pub struct TrainingSampler<R = StdRng> {
    dataset: Dataset,
    rng: R,
}

impl TrainingSampler<StdRng> {
    /// Reproducible sampler
    pub fn seeded(dataset: Dataset, seed: u64) -> Self {
        Self::new(dataset, StdRng::seed_from_u64(seed))
    }

    /// Sampler seeded from the thread-local generator
    pub fn from_thread_rng(dataset: Dataset) -> Self {
        Self::new(dataset, StdRng::from_rng(&mut rand::rng()))
    }
}

impl<R: Rng> TrainingSampler<R> {
    pub fn new(dataset: Dataset, rng: R) -> Self {
        Self { dataset, rng }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn token_count(&self) -> usize {
        self.dataset.token_count()
    }

    /// Draw one window of `length` tokens from inside a single chunk
    ///
    /// # Returns
    ///
    /// - [`Error::ChunkTooSmall`] if `length` is at least the average chunk
    ///   length; no draw is attempted
    /// - [`Error::InvalidInput`] for a zero length
    pub fn sample(&mut self, length: usize) -> Result<&[TokenId]> {
        if length == 0 {
            return Err(Error::InvalidInput("sample length must be positive".into()));
        }
        let maximum = self.dataset.max_sample_length();
        if length > maximum {
            return Err(Error::ChunkTooSmall {
                requested: length,
                maximum,
            });
        }

        let token_count = self.dataset.token_count();
        loop {
            let index = self.rng.random_range(0..token_count - length);
            let chunk = self.dataset.locate(index);
            let boundaries = self.dataset.boundaries();
            if index + length <= boundaries[chunk + 1] {
                let offset = index - boundaries[chunk];
                let tokens = &self.dataset.chunks()[chunk];
                return Ok(&tokens[offset..offset + length]);
            }
        }
    }

    /// Draw `batch_size` independent windows
    pub fn sample_batch(&mut self, batch_size: usize, length: usize) -> Result<Vec<Vec<TokenId>>> {
        (0..batch_size)
            .map(|_| self.sample(length).map(<[TokenId]>::to_vec))
            .collect()
    }
}
