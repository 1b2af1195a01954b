//! Training Corpus
//!
//! A [`Dataset`] is an ordered list of token chunks. Chunks are kept apart on
//! purpose: a chunk is usually one source document (or a pack of short ones),
//! and training windows must never straddle two of them.
//!
//! ## Boundaries
//!
//! Alongside the chunks the dataset keeps the running prefix sum of their
//! lengths, with a leading zero:
//!
//! ```text
//! chunk lengths:  [100, 5, 200]
//! boundaries:     [0, 100, 105, 305]
//!
//! global token 102 → chunk 1, offset 2
//! ```
//!
//! Global position `p` lives in chunk `i` when
//! `boundaries[i] <= p < boundaries[i + 1]`, which
//! [`locate`](Dataset::locate) finds by binary search.
//!
//! ## Sources
//!
//! - [`Dataset::load`]: a text file, a JSON file of pre-encoded chunks, or a
//!   directory of either (searched recursively, encoded in parallel)
//! - [`Dataset::from_texts`]: many short texts packed into large chunks,
//!   separated by the end-of-text token
//! - [`Dataset::save`] / [`Dataset::load_encoded`]: JSON round trip

use crate::error::{Error, Result};
use crate::sampler::binary_search;
use crate::tokenizer::{Gpt2Tokenizer, END_OF_TEXT};
use crate::TokenId;
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Characters per packed chunk before a new one is started (16 MiB)
pub const TRIM_AFTER: usize = 16 * 1024 * 1024;

/// Token sequences plus the prefix sum of their lengths
#[derive(Debug, Clone)]
pub struct Dataset {
    chunks: Vec<Vec<TokenId>>,
    /// `chunks.len() + 1` entries, strictly increasing, starting at 0
    boundaries: Vec<usize>,
}

impl Dataset {
    /// Build a dataset from token chunks
    ///
    /// Empty chunks carry no trainable positions and are dropped, which keeps
    /// the boundaries strictly increasing.
    ///
    /// # Returns
    ///
    /// [`Error::EmptyDataset`] if the chunks hold no tokens at all.
    ///
    /// # Example
    ///
    /// ```rust
    /// use touchstone::Dataset;
    ///
    /// let dataset = Dataset::new(vec![vec![1, 2, 3], vec![], vec![4, 5]])?;
    /// assert_eq!(dataset.token_count(), 5);
    /// assert_eq!(dataset.chunk_count(), 2);
    /// assert_eq!(dataset.boundaries(), &[0, 3, 5]);
    /// # Ok::<(), touchstone::Error>(())
    /// ```
    pub fn new(chunks: Vec<Vec<TokenId>>) -> Result<Self> {
        let total = chunks.len();
        let chunks: Vec<Vec<TokenId>> = chunks.into_iter().filter(|c| !c.is_empty()).collect();
        if chunks.len() < total {
            log::debug!("Dropped {} empty chunks", total - chunks.len());
        }
        if chunks.is_empty() {
            return Err(Error::EmptyDataset);
        }

        let mut boundaries = Vec::with_capacity(chunks.len() + 1);
        boundaries.push(0);
        for chunk in &chunks {
            boundaries.push(boundaries[boundaries.len() - 1] + chunk.len());
        }

        let dataset = Self { chunks, boundaries };
        log::info!(
            "Dataset has {} tokens in {} chunks",
            dataset.token_count(),
            dataset.chunk_count()
        );
        Ok(dataset)
    }

    /// Total number of tokens across all chunks
    pub fn token_count(&self) -> usize {
        self.boundaries[self.boundaries.len() - 1]
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> &[Vec<TokenId>] {
        &self.chunks
    }

    pub fn chunk(&self, index: usize) -> Option<&[TokenId]> {
        self.chunks.get(index).map(Vec::as_slice)
    }

    pub fn boundaries(&self) -> &[usize] {
        &self.boundaries
    }

    /// Longest window the sampler accepts
    ///
    /// One less than the average chunk length. This is an estimate, not a
    /// guarantee that every chunk can hold such a window.
    pub fn max_sample_length(&self) -> usize {
        (self.token_count() / self.chunk_count()).saturating_sub(1)
    }

    /// Index of the chunk holding global position `position`
    ///
    /// `position` must be below [`token_count`](Self::token_count).
    pub fn locate(&self, position: usize) -> usize {
        debug_assert!(position < self.token_count());
        let boundaries = &self.boundaries;
        binary_search(|j| boundaries[j] > position, 0, boundaries.len() - 1) - 1
    }

    /// Load a corpus from a file or a directory tree
    ///
    /// Files ending in `.json` hold pre-encoded chunks (see
    /// [`save`](Self::save)). Any other file is read as UTF-8 text and becomes
    /// one chunk; whitespace-only files are skipped.
    ///
    /// # Arguments
    ///
    /// * `tokenizer` - Used for text files
    /// * `path` - A single file, or a directory searched recursively
    /// * `extension` - Only take files with this extension from a directory
    ///   (e.g. `Some("txt")`); ignored for a single file
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use touchstone::{Dataset, Gpt2Tokenizer};
    /// let tokenizer = Gpt2Tokenizer::load("models/117M/encoder.json", "models/117M/vocab.bpe")?;
    /// let dataset = Dataset::load(&tokenizer, "data/shakespeare", Some("txt"))?;
    /// println!("{} tokens", dataset.token_count());
    /// # Ok::<(), touchstone::Error>(())
    /// ```
    pub fn load<P: AsRef<Path>>(
        tokenizer: &Gpt2Tokenizer,
        path: P,
        extension: Option<&str>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let files = if path.is_dir() {
            let mut files = Vec::new();
            collect_files(path, extension, &mut files)?;
            files.sort();
            files
        } else {
            vec![path.to_path_buf()]
        };
        log::info!("Reading {} dataset files from {}", files.len(), path.display());

        let per_file: Vec<Vec<Vec<TokenId>>> = files
            .par_iter()
            .map(|file| read_chunks(tokenizer, file))
            .collect::<Result<_>>()?;

        Self::new(per_file.into_iter().flatten().collect())
    }

    /// Pack short texts into chunks, each text followed by end-of-text
    ///
    /// Whitespace-only texts are skipped. A new chunk is started before a
    /// chunk's running character count (texts plus separators) would reach
    /// [`TRIM_AFTER`].
    pub fn from_texts<S: AsRef<str> + Sync>(
        tokenizer: &Gpt2Tokenizer,
        texts: &[S],
    ) -> Result<Self> {
        Self::from_texts_with_limit(tokenizer, texts, TRIM_AFTER)
    }

    /// [`from_texts`](Self::from_texts) with an explicit chunk size limit
    pub fn from_texts_with_limit<S: AsRef<str> + Sync>(
        tokenizer: &Gpt2Tokenizer,
        texts: &[S],
        trim_after: usize,
    ) -> Result<Self> {
        let end_of_text = tokenizer.end_of_text()?;
        let texts: Vec<&str> = texts
            .iter()
            .map(|text| text.as_ref())
            .filter(|text| !text.trim().is_empty())
            .collect();
        let encoded = tokenizer.encode_batch(&texts)?;

        let mut chunks = Vec::new();
        let mut chunk: Vec<TokenId> = Vec::new();
        let mut chunk_size = 0;
        for (text, ids) in texts.iter().zip(encoded) {
            let size = text.chars().count() + END_OF_TEXT.len();
            if chunk_size + size >= trim_after && !chunk.is_empty() {
                chunks.push(std::mem::take(&mut chunk));
                chunk_size = 0;
            }
            chunk_size += size;
            chunk.extend(ids);
            chunk.push(end_of_text);
        }
        if !chunk.is_empty() {
            chunks.push(chunk);
        }

        Self::new(chunks)
    }

    /// Write the chunks as a JSON array of token arrays
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer(&mut writer, &self.chunks)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        writer.flush()?;
        Ok(())
    }

    /// Read a dataset written by [`save`](Self::save)
    pub fn load_encoded<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(read_encoded(path.as_ref())?)
    }
}

fn read_encoded(path: &Path) -> Result<Vec<Vec<TokenId>>> {
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(|e| Error::config_load(path.display().to_string(), e))
}

fn read_chunks(tokenizer: &Gpt2Tokenizer, file: &Path) -> Result<Vec<Vec<TokenId>>> {
    log::debug!("Reading {}", file.display());
    if file.extension().is_some_and(|ext| ext == "json") {
        return read_encoded(file);
    }

    let text = fs::read_to_string(file)?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![tokenizer.encode(&text)?])
}

fn collect_files(dir: &Path, extension: Option<&str>, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, extension, out)?;
        } else {
            let matches = extension.map_or(true, |wanted| {
                path.extension().is_some_and(|ext| ext == wanted)
            });
            if matches {
                out.push(path);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn tokenizer() -> Gpt2Tokenizer {
        Gpt2Tokenizer::from_merges(vec![("h".into(), "i".into())]).unwrap()
    }

    #[test]
    fn test_boundaries_are_prefix_sums() {
        let dataset = Dataset::new(vec![vec![0; 100], vec![1; 5], vec![2; 200]]).unwrap();
        assert_eq!(dataset.boundaries(), &[0, 100, 105, 305]);
        assert_eq!(dataset.token_count(), 305);
        assert_eq!(dataset.max_sample_length(), 100);
    }

    #[test]
    fn test_empty_dataset() {
        let err = Dataset::new(vec![]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyDataset);
        let err = Dataset::new(vec![vec![], vec![]]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyDataset);
    }

    #[test]
    fn test_locate() {
        let dataset = Dataset::new(vec![vec![0; 100], vec![1; 5], vec![2; 200]]).unwrap();
        assert_eq!(dataset.locate(0), 0);
        assert_eq!(dataset.locate(99), 0);
        assert_eq!(dataset.locate(100), 1);
        assert_eq!(dataset.locate(104), 1);
        assert_eq!(dataset.locate(105), 2);
        assert_eq!(dataset.locate(304), 2);

        let single = Dataset::new(vec![vec![7; 3]]).unwrap();
        assert_eq!(single.locate(2), 0);
    }

    #[test]
    fn test_from_texts_separates_with_end_of_text() {
        let tokenizer = tokenizer();
        let eot = tokenizer.end_of_text().unwrap();
        let dataset = Dataset::from_texts(&tokenizer, &["hi", "  ", "hi!"]).unwrap();

        assert_eq!(dataset.chunk_count(), 1);
        let hi = tokenizer.encode("hi").unwrap();
        let mut expected = hi.clone();
        expected.push(eot);
        expected.extend(tokenizer.encode("hi!").unwrap());
        expected.push(eot);
        assert_eq!(dataset.chunk(0).unwrap(), expected.as_slice());
    }

    #[test]
    fn test_from_texts_starts_new_chunks() {
        let tokenizer = tokenizer();
        // Each text costs 1 + 13 characters; two fit under 30, a third does not
        let texts = ["a", "b", "c", "d", "e"];
        let dataset = Dataset::from_texts_with_limit(&tokenizer, &texts, 30).unwrap();
        assert_eq!(dataset.chunk_count(), 3);
        assert_eq!(dataset.token_count(), 10);
        assert_eq!(dataset.chunk(2).unwrap().len(), 2);
    }

    #[test]
    fn test_from_blank_texts_is_empty() {
        let err = Dataset::from_texts(&tokenizer(), &["", " \n\t"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyDataset);
    }

    #[test]
    fn test_load_directory() {
        let tokenizer = tokenizer();
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("a.txt"), "hi there").unwrap();
        fs::write(dir.path().join("nested/b.txt"), "hi").unwrap();
        fs::write(dir.path().join("blank.txt"), "   \n").unwrap();
        fs::write(dir.path().join("notes.md"), "ignored").unwrap();

        let dataset = Dataset::load(&tokenizer, dir.path(), Some("txt")).unwrap();
        assert_eq!(dataset.chunk_count(), 2);
        assert_eq!(dataset.chunk(0).unwrap(), tokenizer.encode("hi there").unwrap().as_slice());
        assert_eq!(dataset.chunk(1).unwrap(), tokenizer.encode("hi").unwrap().as_slice());

        let everything = Dataset::load(&tokenizer, dir.path(), None).unwrap();
        assert_eq!(everything.chunk_count(), 3);
    }

    #[test]
    fn test_save_and_reload_preserves_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.json");
        let dataset = Dataset::new(vec![vec![1, 2, 3], vec![4], vec![5, 6]]).unwrap();
        dataset.save(&path).unwrap();

        let reloaded = Dataset::load_encoded(&path).unwrap();
        assert_eq!(reloaded.chunks(), dataset.chunks());
        assert_eq!(reloaded.boundaries(), dataset.boundaries());

        // Pre-encoded files also load through the generic loader
        let via_load = Dataset::load(&tokenizer(), &path, None).unwrap();
        assert_eq!(via_load.chunks(), dataset.chunks());
    }

    #[test]
    fn test_missing_file() {
        let err = Dataset::load(&tokenizer(), "/definitely/not/here.txt", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
