//! Knowledge base loading
//!
//! The knowledge base is a plain text file with one retrieval unit per line.
//! Blank lines are dropped and every kept line is trimmed; the resulting order
//! defines the paragraph ids used by the similarity index.


use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

use crate::{RagError, Result};

/// Ordered, immutable list of paragraphs plus a fingerprint of their content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corpus {
    paragraphs: Vec<String>,
    fingerprint: String,
}

impl Corpus {
    /// Build a corpus from in-memory paragraphs, applying the same trimming
    /// rules as [`load_paragraphs`]
    #[inline]
    pub fn from_paragraphs<I, S>(paragraphs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paragraphs: Vec<String> = paragraphs
            .into_iter()
            .map(|p| p.as_ref().trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let fingerprint = fingerprint(&paragraphs);

        Self {
            paragraphs,
            fingerprint,
        }
    }

    /// Split raw text into one paragraph per non-blank line
    #[inline]
    pub fn from_text(text: &str) -> Self {
        Self::from_paragraphs(text.lines())
    }

    #[inline]
    pub fn paragraphs(&self) -> &[String] {
        &self.paragraphs
    }

    #[inline]
    pub fn get(&self, id: usize) -> Option<&str> {
        self.paragraphs.get(id).map(String::as_str)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.paragraphs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.paragraphs.is_empty()
    }

    /// Hex SHA-256 over the kept paragraphs, used to detect a stale index
    #[inline]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Load the knowledge base at `path`.
///
/// A missing or unreadable file is a [`RagError::MissingResource`]. A file with
/// only blank lines loads as an empty corpus; callers decide whether that is
/// fatal.
#[inline]
pub fn load_paragraphs<P: AsRef<Path>>(path: P) -> Result<Corpus> {
    let path = path.as_ref();

    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => {
            RagError::MissingResource(format!("knowledge base not found: {}", path.display()))
        }
        _ => RagError::MissingResource(format!(
            "knowledge base could not be read: {} ({})",
            path.display(),
            e
        )),
    })?;

    let corpus = Corpus::from_text(&text);
    debug!(
        "Loaded {} paragraphs from {} (fingerprint {})",
        corpus.len(),
        path.display(),
        &corpus.fingerprint()[..12]
    );

    Ok(corpus)
}

fn fingerprint(paragraphs: &[String]) -> String {
    let mut hasher = Sha256::new();
    for paragraph in paragraphs {
        hasher.update(paragraph.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
