//! GPT-2 Byte Pair Encoding (BPE) Tokenizer
//!
//! Turns text into vocabulary token IDs and back, using merge rules learned
//! ahead of time (see [`vocab`](crate::vocab) for the file formats).
//!
//! ## How Encoding Works
//!
//! 1. **Pre-tokenize**: split the text with a fixed pattern into words,
//!    numbers, punctuation runs and whitespace runs. A single leading space
//!    sticks to the following word, so `" world"` is one piece.
//! 2. **Byte-encode**: map every UTF-8 byte of a piece to its visible
//!    symbol through the [byte codec](crate::byte_codec).
//! 3. **Merge**: starting from single symbols, repeatedly merge the adjacent
//!    pair with the lowest rank until no ranked pair is left.
//! 4. **Look up**: every merged group is a vocabulary entry.
//!
//! ## Example
//!
//! Given merges `[("Ġ", "w"), ("o", "r"), ("Ġw", "or"), ("l", "d")]`:
//!
//! ```text
//! " world" → "Ġworld" → Ġ w o r l d
//!          → Ġw o r l d      (rank 0)
//!          → Ġw or l d       (rank 1)
//!          → Ġwor l d        (rank 2)
//!          → Ġwor ld         (rank 3)
//! ```
//!
//! ## Decoding
//!
//! Decoding is a table lookup per ID, followed by the inverse byte mapping.
//! Byte sequences that are not valid UTF-8 (a model can emit half of a
//! multi-byte character) are replaced with U+FFFD rather than failing.
//!
//! ## Implementation Notes
//!
//! - **BPE cache**: merge results are memoized per byte-encoded piece. Text
//!   repeats words constantly, so most pieces hit the cache. The cache sits
//!   behind a mutex so one tokenizer can serve several threads.
//! - **Parallel encoding**: long texts have their pieces merged across CPU
//!   cores with Rayon, and [`Gpt2Tokenizer::encode_batch`] encodes whole
//!   documents in parallel.

use crate::byte_codec::byte_codec;
use crate::config::ModelFiles;
use crate::error::{Error, Result};
use crate::vocab::{MergeRanks, Vocabulary};
use crate::TokenId;
use fancy_regex::Regex;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{LazyLock, Mutex, PoisonError};

/// Document separator GPT-2 was trained with
pub const END_OF_TEXT: &str = "<|endoftext|>";

/// Contractions, letter runs, digit runs, other symbols (each optionally after
/// one space), then whitespace. `\s+(?!\S)` leaves the last space of a run for
/// the next word.
const PRETOKENIZE_PATTERN: &str =
    r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+";

static PRETOKENIZER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PRETOKENIZE_PATTERN).expect("pre-tokenizer pattern is valid"));

/// Pieces per text above which merging runs in parallel
const PARALLEL_PIECES: usize = 4096;

/// Whitespace runs at least this many chars long are split without the regex
const LONG_WHITESPACE: usize = 256;

/// Split text into pre-tokens, left to right, covering the whole input
///
/// The backtracking engine walks `\s+(?!\S)` one char at a time, so a long
/// whitespace run is cut here instead: everything but its last char is one
/// pre-token, and the last char is left for the regex to attach to the next
/// word. A run that ends the text is a single pre-token.
pub fn pretokenize(text: &str) -> Result<Vec<&str>> {
    let mut pieces = Vec::new();
    let mut from = 0;
    while let Some((start, end, last)) = next_long_whitespace(text, from) {
        regex_pieces(&text[from..start], &mut pieces)?;
        let split = if end == text.len() { end } else { last };
        pieces.push(&text[start..split]);
        from = split;
    }
    regex_pieces(&text[from..], &mut pieces)?;
    Ok(pieces)
}

fn regex_pieces<'t>(segment: &'t str, pieces: &mut Vec<&'t str>) -> Result<()> {
    for m in PRETOKENIZER.find_iter(segment) {
        pieces.push(m?.as_str());
    }
    Ok(())
}

/// Find the next maximal whitespace run of at least [`LONG_WHITESPACE`] chars
/// starting at or after `from`.
///
/// Returns the byte offsets of its start, its end and its last char.
fn next_long_whitespace(text: &str, from: usize) -> Option<(usize, usize, usize)> {
    let mut run: Option<(usize, usize)> = None;
    let mut last = from;
    for (offset, c) in text[from..].char_indices() {
        let at = from + offset;
        if c.is_whitespace() {
            let (start, count) = run.unwrap_or((at, 0));
            run = Some((start, count + 1));
            last = at;
        } else if let Some((start, count)) = run.take() {
            if count >= LONG_WHITESPACE {
                return Some((start, at, last));
            }
        }
    }
    match run {
        Some((start, count)) if count >= LONG_WHITESPACE => Some((start, text.len(), last)),
        _ => None,
    }
}

/// A GPT-2 tokenizer
///
/// Holds the vocabulary, the merge ranks and a cache of merge results.
pub struct Gpt2Tokenizer {
    vocab: Vocabulary,
    ranks: MergeRanks,

    /// Byte-encoded piece → space-separated merged groups
    cache: Mutex<HashMap<String, String>>,
}

impl Gpt2Tokenizer {
    pub fn new(vocab: Vocabulary, ranks: MergeRanks) -> Self {
        Self {
            vocab,
            ranks,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load `encoder.json` and `vocab.bpe`
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use touchstone::Gpt2Tokenizer;
    ///
    /// let tokenizer = Gpt2Tokenizer::load("models/117M/encoder.json", "models/117M/vocab.bpe")?;
    /// let ids = tokenizer.encode("Hello world!")?;
    /// assert_eq!(tokenizer.decode(&ids)?, "Hello world!");
    /// # Ok::<(), touchstone::Error>(())
    /// ```
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(encoder_json: P, merges: Q) -> Result<Self> {
        let vocab = Vocabulary::load(encoder_json)?;
        let ranks = MergeRanks::load(merges)?;
        Ok(Self::new(vocab, ranks))
    }

    /// Load the tokenizer files of a released model
    pub fn from_model_files(files: &ModelFiles) -> Result<Self> {
        Self::load(files.encoder_json(), files.merges())
    }

    /// Build a tokenizer whose vocabulary is derived from its merge rules
    ///
    /// This is how GPT-2's own table was laid out: the 256 byte symbols first
    /// (in byte order), then one token per merge in rank order, then
    /// [`END_OF_TEXT`]. Every merge result is therefore in the vocabulary.
    ///
    /// # Example
    ///
    /// ```rust
    /// use touchstone::Gpt2Tokenizer;
    ///
    /// let tokenizer = Gpt2Tokenizer::from_merges(vec![
    ///     ("h".to_string(), "e".to_string()),
    ///     ("l".to_string(), "l".to_string()),
    /// ])?;
    /// assert_eq!(tokenizer.vocab_size(), 256 + 2 + 1);
    /// assert_eq!(tokenizer.encode("hell")?, vec![256, 257]);
    /// # Ok::<(), touchstone::Error>(())
    /// ```
    pub fn from_merges(merges: Vec<(String, String)>) -> Result<Self> {
        let ranks = MergeRanks::from_pairs(merges, "merge list")?;
        let codec = byte_codec();

        let mut entries = HashMap::new();
        for byte in 0..=255u8 {
            entries.insert(codec.encode_byte(byte).to_string(), entries.len() as TokenId);
        }
        for (left, right) in ranks.merges() {
            let merged = format!("{left}{right}");
            let next = entries.len() as TokenId;
            entries.entry(merged).or_insert(next);
        }
        let next = entries.len() as TokenId;
        entries.entry(END_OF_TEXT.to_string()).or_insert(next);

        let vocab = Vocabulary::from_entries(entries, "merge list")?;
        Ok(Self::new(vocab, ranks))
    }

    /// Write `encoder.json` and `vocab.bpe` into `dir`
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let files = ModelFiles::in_dir(dir.as_ref());
        fs::create_dir_all(files.dir())?;
        self.vocab.save(files.encoder_json())?;
        self.ranks.save(files.merges())?;
        Ok(())
    }

    /// Merge a byte-encoded piece into sub-tokens
    ///
    /// Returns the merged groups joined by single spaces. Symbols never
    /// contain a raw space (the byte codec maps it to `Ġ`), so the join is
    /// unambiguous.
    ///
    /// When several candidate pairs share the lowest rank (a malformed table;
    /// ranks are unique when loaded through [`MergeRanks`]) the
    /// lexicographically smallest pair wins.
    pub fn bpe(&self, symbols: &str) -> String {
        if let Some(hit) = self.lock_cache().get(symbols) {
            return hit.clone();
        }

        let merged = self.merge_word(symbols).join(" ");
        self.lock_cache()
            .insert(symbols.to_string(), merged.clone());
        merged
    }

    fn merge_word(&self, symbols: &str) -> Vec<String> {
        let mut word: Vec<String> = symbols.chars().map(String::from).collect();
        // Buffer reused across passes
        let mut merged: Vec<String> = Vec::with_capacity(word.len());

        while word.len() > 1 {
            let best = word
                .windows(2)
                .filter_map(|pair| {
                    self.ranks
                        .rank(&pair[0], &pair[1])
                        .map(|rank| (rank, pair[0].as_str(), pair[1].as_str()))
                })
                .min();
            let Some((_, first, second)) = best else {
                break;
            };
            let (first, second) = (first.to_string(), second.to_string());

            // Replace every non-overlapping occurrence, scanning left to right
            merged.clear();
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == first && word[i + 1] == second {
                    merged.push(format!("{first}{second}"));
                    i += 2;
                } else {
                    merged.push(std::mem::take(&mut word[i]));
                    i += 1;
                }
            }
            std::mem::swap(&mut word, &mut merged);
        }

        word
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // The cache is only an optimisation; a poisoned one is still consistent
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encode one pre-token, appending IDs to `out`
    fn encode_piece(&self, piece: &str, out: &mut Vec<TokenId>) -> Result<()> {
        let symbols = byte_codec().encode_bytes(piece.as_bytes());
        for sub_token in self.bpe(&symbols).split(' ') {
            let id = self
                .vocab
                .id(sub_token)
                .ok_or_else(|| Error::MissingSubToken(sub_token.to_string()))?;
            out.push(id);
        }
        Ok(())
    }

    /// Encode text to token IDs
    ///
    /// Fails only if the vocabulary cannot represent a merge result (a
    /// mismatched vocabulary/merge pair), or if the pre-tokenizer hits its
    /// backtracking limit on pathological input.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use touchstone::Gpt2Tokenizer;
    /// # let tokenizer = Gpt2Tokenizer::from_merges(vec![])?;
    /// let ids = tokenizer.encode("Hi!")?;
    /// assert_eq!(ids.len(), 3); // no merges: one token per byte
    /// # Ok::<(), touchstone::Error>(())
    /// ```
    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        let pieces = pretokenize(text)?;

        if pieces.len() > PARALLEL_PIECES {
            // Merge pieces in parallel, then stitch them back in order
            let encoded: Vec<Vec<TokenId>> = pieces
                .par_iter()
                .map(|piece| -> Result<Vec<TokenId>> {
                    let mut ids = Vec::new();
                    self.encode_piece(piece, &mut ids)?;
                    Ok(ids)
                })
                .collect::<Result<_>>()?;
            Ok(encoded.concat())
        } else {
            let mut ids = Vec::with_capacity(text.len() / 3);
            for piece in pieces {
                self.encode_piece(piece, &mut ids)?;
            }
            Ok(ids)
        }
    }

    /// Encode many documents in parallel
    pub fn encode_batch<S: AsRef<str> + Sync>(&self, texts: &[S]) -> Result<Vec<Vec<TokenId>>> {
        texts
            .par_iter()
            .map(|text| self.encode(text.as_ref()))
            .collect()
    }

    /// Decode token IDs back to text
    ///
    /// Invalid UTF-8 is replaced, never rejected. An ID with no vocabulary
    /// entry means the IDs came from a different model and is an error.
    pub fn decode(&self, ids: &[TokenId]) -> Result<String> {
        let codec = byte_codec();
        let mut bytes = Vec::with_capacity(ids.len() * 4);
        for &id in ids {
            let token = self.vocab.token(id).ok_or(Error::UnknownToken(id))?;
            // Vocabulary entries are checked against the alphabet on load
            codec
                .decode_into(token, &mut bytes)
                .map_err(|_| Error::UnknownToken(id))?;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// ID of the [`END_OF_TEXT`] separator
    pub fn end_of_text(&self) -> Result<TokenId> {
        self.vocab
            .id(END_OF_TEXT)
            .ok_or_else(|| Error::MissingSubToken(END_OF_TEXT.to_string()))
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn merge_ranks(&self) -> &MergeRanks {
        &self.ranks
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Number of memoized merge results
    pub fn cache_len(&self) -> usize {
        self.lock_cache().len()
    }

    pub fn stats(&self) -> TokenizerStats {
        TokenizerStats {
            vocab_size: self.vocab.len(),
            num_merges: self.ranks.len(),
            cached_pieces: self.cache_len(),
        }
    }
}

/// Statistics about a tokenizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerStats {
    /// Total vocabulary size
    pub vocab_size: usize,
    /// Number of ranked merge rules
    pub num_merges: usize,
    /// Pieces currently held in the BPE cache
    pub cached_pieces: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    /// Small English-flavoured merge table
    fn english() -> Gpt2Tokenizer {
        Gpt2Tokenizer::from_merges(pairs(&[
            ("Ġ", "w"),
            ("o", "r"),
            ("Ġw", "or"),
            ("l", "d"),
            ("Ġwor", "ld"),
            ("H", "e"),
            ("l", "l"),
            ("He", "ll"),
            ("Hell", "o"),
            ("Ġ", "t"),
            ("h", "e"),
            ("Ġt", "he"),
        ]))
        .unwrap()
    }

    #[test]
    fn test_pretokenize_words_and_spaces() {
        let pieces = pretokenize("Hello world!").unwrap();
        assert_eq!(pieces, vec!["Hello", " world", "!"]);
    }

    #[test]
    fn test_pretokenize_contractions_and_numbers() {
        let pieces = pretokenize("I'll pay 42 dollars").unwrap();
        assert_eq!(pieces, vec!["I", "'ll", " pay", " 42", " dollars"]);
    }

    #[test]
    fn test_pretokenize_whitespace_runs() {
        // The last space of a run attaches to the following word
        let pieces = pretokenize("a   b").unwrap();
        assert_eq!(pieces, vec!["a", "  ", " b"]);

        // A trailing run stays whole
        let pieces = pretokenize("a  ").unwrap();
        assert_eq!(pieces, vec!["a", "  "]);

        let pieces = pretokenize("x\n\ny").unwrap();
        assert_eq!(pieces, vec!["x", "\n", "\n", "y"]);
    }

    #[test]
    fn test_pretokenize_covers_input() {
        let text = "Héllo, wörld!!  日本語 123abc\t\n 'sx";
        let pieces = pretokenize(text).unwrap();
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_long_whitespace_split_matches_regex() {
        let run = " ".repeat(LONG_WHITESPACE + 10);
        let texts = [
            format!("a{run}b"),
            format!("{run}b"),
            format!("a{run}"),
            format!("x{run}\ny"),
            format!("x{run}\t\n 'll"),
            format!("one{run}two{run}three {run}"),
            format!("{run}"),
        ];
        for text in &texts {
            let expected: Vec<&str> = PRETOKENIZER
                .find_iter(text)
                .map(|m| m.unwrap().as_str())
                .collect();
            assert_eq!(pretokenize(text).unwrap(), expected);
        }
    }

    #[test]
    fn test_huge_whitespace_run_round_trips() {
        let tokenizer = english();
        let spaces = 2_000_000;
        let text = format!("a{}b", " ".repeat(spaces));

        let pieces = pretokenize(&text).unwrap();
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[1].len(), spaces - 1);
        assert_eq!(pieces[2], " b");

        let ids = tokenizer.encode(&text).unwrap();
        assert_eq!(tokenizer.decode(&ids).unwrap(), text);
    }

    #[test]
    fn test_bpe_merges_by_rank() {
        let tokenizer = english();
        assert_eq!(tokenizer.bpe("Ġworld"), "Ġworld");
        assert_eq!(tokenizer.bpe("Hello"), "Hello");
        assert_eq!(tokenizer.bpe("Ġthe"), "Ġthe");
        assert_eq!(tokenizer.bpe("Ġwords"), "Ġwor d s");
    }

    #[test]
    fn test_bpe_merges_all_occurrences_in_one_pass() {
        let tokenizer = Gpt2Tokenizer::from_merges(pairs(&[("a", "a")])).unwrap();
        // Non-overlapping, left to right
        assert_eq!(tokenizer.bpe("aaaaa"), "aa aa a");
    }

    #[test]
    fn test_bpe_without_mergeable_pairs() {
        let tokenizer = english();
        assert_eq!(tokenizer.bpe("xyz"), "x y z");
        assert_eq!(tokenizer.bpe("q"), "q");
    }

    #[test]
    fn test_bpe_cache_is_transparent() {
        let tokenizer = english();
        assert_eq!(tokenizer.cache_len(), 0);
        let first = tokenizer.bpe("Ġworld");
        assert_eq!(tokenizer.cache_len(), 1);
        let second = tokenizer.bpe("Ġworld");
        assert_eq!(first, second);
        assert_eq!(tokenizer.cache_len(), 1);
    }

    #[test]
    fn test_hello_world_round_trip() {
        let tokenizer = english();
        let ids = tokenizer.encode("Hello world!").unwrap();
        let vocab = tokenizer.vocab();
        assert_eq!(
            ids,
            vec![
                vocab.id("Hello").unwrap(),
                vocab.id("Ġworld").unwrap(),
                vocab.id("!").unwrap()
            ]
        );
        assert_eq!(tokenizer.decode(&ids).unwrap(), "Hello world!");
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let tokenizer = english();

        let test_cases = vec![
            "",
            "hello",
            "Hello, world!",
            "the world the world",
            "123 456 789",
            "special chars: !@#$%^&*()",
            "newline\nand\ttab",
            "trailing spaces   ",
            "UTF-8: café, naïve, 日本語",
            "emoji 🦀 and it's done",
        ];

        for text in test_cases {
            let encoded = tokenizer.encode(text).unwrap();
            let decoded = tokenizer.decode(&encoded).unwrap();
            assert_eq!(decoded, text, "Failed roundtrip for: {}", text);
        }
    }

    #[test]
    fn test_long_text_uses_parallel_path() {
        let tokenizer = english();
        let text = "Hello world the end. ".repeat(2000);
        let ids = tokenizer.encode(&text).unwrap();
        assert!(pretokenize(&text).unwrap().len() > PARALLEL_PIECES);
        assert_eq!(tokenizer.decode(&ids).unwrap(), text);
    }

    #[test]
    fn test_encode_batch_matches_encode() {
        let tokenizer = english();
        let texts = ["Hello world", "the world", "xyz"];
        let batch = tokenizer.encode_batch(&texts).unwrap();
        for (text, ids) in texts.iter().zip(&batch) {
            assert_eq!(ids, &tokenizer.encode(text).unwrap());
        }
    }

    #[test]
    fn test_decode_unknown_token() {
        let tokenizer = english();
        let err = tokenizer.decode(&[72, 999_999]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownToken);
    }

    #[test]
    fn test_decode_replaces_invalid_utf8() {
        let tokenizer = english();
        // A lone continuation byte
        let id = tokenizer
            .vocab()
            .id(&byte_codec().encode_byte(0x80).to_string())
            .unwrap();
        assert_eq!(tokenizer.decode(&[id]).unwrap(), "\u{FFFD}");
    }

    #[test]
    fn test_missing_sub_token_is_config_error() {
        // A merge the vocabulary does not know about
        let vocab = Vocabulary::from_json(r#"{"a": 0, "b": 1}"#, "test").unwrap();
        let ranks = MergeRanks::from_pairs(pairs(&[("a", "b")]), "test").unwrap();
        let tokenizer = Gpt2Tokenizer::new(vocab, ranks);
        let err = tokenizer.encode("ab").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigLoad);
    }

    #[test]
    fn test_end_of_text() {
        let tokenizer = english();
        let eot = tokenizer.end_of_text().unwrap();
        assert_eq!(eot as usize, tokenizer.vocab_size() - 1);
        assert_eq!(tokenizer.decode(&[eot]).unwrap(), END_OF_TEXT);
    }

    #[test]
    fn test_save_and_load() {
        let tokenizer = english();
        let dir = tempfile::tempdir().unwrap();
        tokenizer.save(dir.path()).unwrap();

        let files = ModelFiles::in_dir(dir.path());
        let reloaded = Gpt2Tokenizer::from_model_files(&files).unwrap();
        let text = "Hello world, the world.";
        assert_eq!(
            reloaded.encode(text).unwrap(),
            tokenizer.encode(text).unwrap()
        );
        assert_eq!(reloaded.stats().num_merges, tokenizer.stats().num_merges);
    }

    #[test]
    fn test_stats() {
        let tokenizer = english();
        tokenizer.encode("Hello world").unwrap();
        let stats = tokenizer.stats();
        assert_eq!(stats.vocab_size, 256 + 12 + 1);
        assert_eq!(stats.num_merges, 12);
        assert_eq!(stats.cached_pieces, 2);
    }
}
