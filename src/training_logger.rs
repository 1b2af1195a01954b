//! Training Logger
//!
//! Records training progress in a CSV file and mirrors each row to the `log`
//! facade, so a run can be followed live and analyzed afterwards.
//!
//! ## Example
//!
//! ```rust,no_run
//! use touchstone::TrainingLogger;
//!
//! let mut logger = TrainingLogger::new("training_log.csv")?;
//! logger.log(100, 3.2, 3.5)?;
//! # Ok::<(), touchstone::Error>(())
//! ```
//!
//! ## CSV Format
//!
//! - `step`: Training step number
//! - `elapsed_seconds`: Time since the logger was created
//! - `loss`: Loss of this step's batch
//! - `avg_loss`: Exponentially decayed average loss
//! - `avg_perplexity`: exp(avg_loss)
//!
//! ## Perplexity
//!
//! Perplexity measures how "surprised" the model is by the data:
//! ```text
//! perplexity = exp(loss)
//! ```
//!
//! A model guessing uniformly over GPT-2's 50257 tokens sits near 50257
//! (loss ≈ 10.8). Lower is better; 1.0 would be a perfect predictor.

use crate::error::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

/// CSV header written at the top of every log file
pub const CSV_HEADER: &str = "step,elapsed_seconds,loss,avg_loss,avg_perplexity";

/// Training logger for tracking metrics over time
pub struct TrainingLogger {
    log_file: BufWriter<File>,
    start_time: Instant,
    last_log_time: Instant,
}

impl TrainingLogger {
    /// Create the CSV file (truncating any previous one) and write the header
    pub fn new<P: AsRef<Path>>(log_path: P) -> Result<Self> {
        let mut log_file = BufWriter::new(File::create(log_path)?);
        writeln!(log_file, "{CSV_HEADER}")?;
        log_file.flush()?;

        let now = Instant::now();
        Ok(Self {
            log_file,
            start_time: now,
            last_log_time: now,
        })
    }

    /// Log one training step
    ///
    /// # Arguments
    ///
    /// * `step` - Training step number
    /// * `loss` - Loss of this step
    /// * `avg_loss` - Running average loss
    pub fn log(&mut self, step: u64, loss: f32, avg_loss: f32) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        let avg_perplexity = avg_loss.exp();

        writeln!(
            self.log_file,
            "{},{:.2},{:.4},{:.4},{:.2}",
            step, elapsed, loss, avg_loss, avg_perplexity
        )?;
        // Rows survive a crash mid-run
        self.log_file.flush()?;

        let step_time = self.last_log_time.elapsed().as_secs_f32();
        log::info!(
            "[{:5} | {:7.1}s (+{:.1}s)] loss={:.4} avg={:.4} perplexity={:.2}",
            step,
            elapsed,
            step_time,
            loss,
            avg_loss,
            avg_perplexity
        );

        self.last_log_time = Instant::now();
        Ok(())
    }

    /// Report a generated sample (log only; samples are long for a CSV cell)
    pub fn log_sample(&self, step: u64, index: usize, text: &str) {
        log::info!("[{step:5}] sample {index}: {text:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut logger = TrainingLogger::new(&path).unwrap();
        logger.log(1, 2.0, 2.0).unwrap();
        logger.log(2, 1.0, 1.5).unwrap();
        logger.log_sample(2, 1, "Hello");

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);

        let fields: Vec<&str> = lines[2].split(',').collect();
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[0], "2");
        assert_eq!(fields[2], "1.0000");
        assert_eq!(fields[3], "1.5000");
        // exp(1.5) = 4.48
        assert_eq!(fields[4], "4.48");
    }

    #[test]
    fn test_new_fails_for_missing_directory() {
        assert!(TrainingLogger::new("/definitely/not/here/log.csv").is_err());
    }
}
