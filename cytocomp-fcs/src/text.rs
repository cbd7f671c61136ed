//! Delimited key/value TEXT segment.
//!
//! The first byte of the segment is the delimiter. Two consecutive
//! delimiters inside a token stand for one literal delimiter byte. Tokens
//! alternate key, value, key, value; keys are matched case-insensitively.

use crate::{Error, Result};
use std::collections::HashMap;

/// Keyword/value pairs in first-seen order, last write wins.
///
/// Values keep every byte: each byte maps to the char with the same code
/// point (Latin-1), so nothing outside ASCII is lost.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextSegment {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl TextSegment {
    /// Inserts or overwrites a keyword. The key is trimmed and uppercased.
    pub fn insert(&mut self, key: &str, value: String) {
        let key = key.trim().to_uppercase();
        if key.is_empty() {
            return;
        }
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    /// Raw value for `key`, matched case-insensitively.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.index
            .get(&key.to_uppercase())
            .map(|&i| self.entries[i].1.as_str())
    }

    /// Trimmed value, `None` when absent or blank.
    #[must_use]
    pub fn get_trimmed(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    /// Value parsed as an integer. Absent and unparsable values are `None`.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_trimmed(key)?.parse().ok()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Splits raw segment bytes (delimiter first) into tokens.
fn tokenize(raw: &[u8]) -> Vec<Vec<u8>> {
    let delim = raw[0];
    let mut tokens = Vec::new();
    let mut current = Vec::new();
    let mut i = 1;
    while i < raw.len() {
        let b = raw[i];
        if b != delim {
            current.push(b);
        } else if raw.get(i + 1) == Some(&delim) {
            current.push(delim);
            i += 1;
        } else {
            tokens.push(std::mem::take(&mut current));
        }
        i += 1;
    }
    tokens.push(current);
    tokens
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Parses the TEXT segment occupying `bytes[start..=end]`.
///
/// An unpaired trailing token is discarded.
///
/// # Errors
/// Returns [`Error::MalformedTextSegment`] if the range lies outside `bytes`
/// or holds fewer than 2 bytes.
pub fn parse_text_segment(bytes: &[u8], start: u64, end: u64) -> Result<TextSegment> {
    let (Ok(start), Ok(end)) = (usize::try_from(start), usize::try_from(end)) else {
        return Err(Error::MalformedTextSegment(format!(
            "range {start}..={end} is not addressable"
        )));
    };
    if end < start || end >= bytes.len() {
        return Err(Error::MalformedTextSegment(format!(
            "range {start}..={end} is outside the {}-byte file",
            bytes.len()
        )));
    }
    let raw = &bytes[start..=end];
    if raw.len() < 2 {
        return Err(Error::MalformedTextSegment(format!(
            "segment of {} byte(s) is too short",
            raw.len()
        )));
    }

    let tokens = tokenize(raw);
    let mut text = TextSegment::default();
    for pair in tokens.chunks_exact(2) {
        text.insert(&latin1(&pair[0]), latin1(&pair[1]));
    }
    log::debug!(
        "TEXT segment: {} bytes, {} tokens, {} keywords",
        raw.len(),
        tokens.len(),
        text.len()
    );
    Ok(text)
}
