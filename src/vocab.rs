//! Vocabulary and merge rank tables
//!
//! A GPT-2 tokenizer is defined by two resources:
//!
//! - `encoder.json`: a JSON object mapping token strings (written in the
//!   [byte codec](crate::byte_codec) alphabet) to dense integer IDs
//! - `vocab.bpe`: the ordered merge rules, one `"<left> <right>"` pair per
//!   line after a version header. A rule's rank is its 0-based line index
//!   after the header; lower ranks merge first.
//!
//! Both are immutable once loaded.

use crate::byte_codec::byte_codec;
use crate::error::{Error, Result};
use crate::TokenId;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Header line written at the top of merge files
pub const MERGES_HEADER: &str = "#version: 0.2";

/// Token string ⟷ token ID table
#[derive(Debug, Clone)]
pub struct Vocabulary {
    ids: HashMap<String, TokenId>,
    tokens: Vec<String>,
}

impl Vocabulary {
    /// Build a vocabulary from token → ID entries
    ///
    /// IDs must be unique and dense (`0..len`), and every token must be
    /// written in the byte codec alphabet so that decoding can never fail on
    /// a known ID.
    pub fn from_entries(entries: HashMap<String, TokenId>, origin: &str) -> Result<Self> {
        let mut tokens: Vec<Option<String>> = vec![None; entries.len()];
        let codec = byte_codec();

        for (token, &id) in &entries {
            if !codec.is_symbol_string(token) {
                return Err(Error::config_load(
                    origin,
                    format!("token {token:?} contains characters outside the byte alphabet"),
                ));
            }
            let slot = tokens.get_mut(id as usize).ok_or_else(|| {
                Error::config_load(
                    origin,
                    format!("token id {id} is out of range for {} entries", entries.len()),
                )
            })?;
            if let Some(existing) = slot.replace(token.clone()) {
                return Err(Error::config_load(
                    origin,
                    format!("token id {id} assigned to both {existing:?} and {token:?}"),
                ));
            }
        }

        // Unique IDs inside 0..len cover the whole range, so every slot is filled
        let tokens = tokens.into_iter().flatten().collect();
        Ok(Self { ids: entries, tokens })
    }

    /// Parse the JSON form of `encoder.json`
    pub fn from_json(json: &str, origin: &str) -> Result<Self> {
        let entries: HashMap<String, TokenId> =
            serde_json::from_str(json).map_err(|e| Error::config_load(origin, e))?;
        Self::from_entries(entries, origin)
    }

    /// Load `encoder.json` from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let json = fs::read_to_string(path).map_err(|e| Error::config_load(&origin, e))?;
        let vocab = Self::from_json(&json, &origin)?;
        log::info!("Loaded vocabulary of {} tokens from {}", vocab.len(), origin);
        Ok(vocab)
    }

    /// Write the vocabulary as `encoder.json`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string(&self.ids)
            .map_err(|e| Error::config_load(path.as_ref().display().to_string(), e))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// ID of a token string
    pub fn id(&self, token: &str) -> Option<TokenId> {
        self.ids.get(token).copied()
    }

    /// Token string of an ID
    pub fn token(&self, id: TokenId) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Ranked merge rules
///
/// Lookups go through a two-level map so that a pair of borrowed symbols can
/// be ranked without allocating a key.
#[derive(Debug, Clone, Default)]
pub struct MergeRanks {
    ranks: HashMap<String, HashMap<String, u32>>,
    merges: Vec<(String, String)>,
}

impl MergeRanks {
    /// Build from pairs in priority order (first pair gets rank 0)
    ///
    /// A pair listed twice is rejected: its rank would be ambiguous.
    pub fn from_pairs<I>(pairs: I, origin: &str) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut table = Self::default();
        for (left, right) in pairs {
            let rank = table.merges.len() as u32;
            let by_right = table.ranks.entry(left.clone()).or_default();
            if by_right.insert(right.clone(), rank).is_some() {
                return Err(Error::config_load(
                    origin,
                    format!("merge {left:?} {right:?} is listed more than once"),
                ));
            }
            table.merges.push((left, right));
        }
        Ok(table)
    }

    /// Parse the text of a `vocab.bpe` file
    ///
    /// The first line is a header and is ignored. Blank lines (including the
    /// one left by a trailing newline) are skipped.
    pub fn parse(text: &str, origin: &str) -> Result<Self> {
        let mut pairs = Vec::new();
        for (line_no, line) in text.lines().enumerate().skip(1) {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split(' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(left), Some(right), None) if !left.is_empty() && !right.is_empty() => {
                    pairs.push((left.to_string(), right.to_string()));
                }
                _ => {
                    return Err(Error::config_load(
                        origin,
                        format!("line {}: expected \"<left> <right>\", got {line:?}", line_no + 1),
                    ))
                }
            }
        }
        Self::from_pairs(pairs, origin)
    }

    /// Load `vocab.bpe` from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let text = fs::read_to_string(path).map_err(|e| Error::config_load(&origin, e))?;
        let ranks = Self::parse(&text, &origin)?;
        log::info!("Loaded {} merge rules from {}", ranks.len(), origin);
        Ok(ranks)
    }

    /// Write the rules in `vocab.bpe` format
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut text = String::from(MERGES_HEADER);
        text.push('\n');
        for (left, right) in &self.merges {
            text.push_str(left);
            text.push(' ');
            text.push_str(right);
            text.push('\n');
        }
        fs::write(path, text)?;
        Ok(())
    }

    /// Rank of merging `left` followed by `right`, if the rule exists
    #[inline]
    pub fn rank(&self, left: &str, right: &str) -> Option<u32> {
        self.ranks.get(left)?.get(right).copied()
    }

    /// Rules in rank order
    pub fn merges(&self) -> &[(String, String)] {
        &self.merges
    }

    pub fn len(&self) -> usize {
        self.merges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }
}
