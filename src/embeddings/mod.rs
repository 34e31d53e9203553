// Embeddings module
// Context/question encoders over a pluggable embedding model, plus the Ollama backend

pub mod ollama;


use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{RagError, Result};

pub use ollama::{OllamaClient, OllamaEmbedder, OllamaGenerator, missing_models};

/// A dense vector produced by an embedding model
pub type Embedding = Vec<f32>;

/// A loaded embedding model. Implementations map each input text to one
/// embedding, in input order.
pub trait EmbeddingModel: Send + Sync {
    fn model_name(&self) -> &str;

    fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>>;
}

/// Everything that decides what a context encoder actually embeds. Two indexes
/// built with different settings are not interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub model: String,
    pub prefix: String,
    pub max_tokens: usize,
}

/// Encodes knowledge base paragraphs for indexing
pub struct ContextEncoder {
    model: Box<dyn EmbeddingModel>,
    prefix: String,
    max_tokens: usize,
    batch_size: usize,
    show_progress: bool,
}

/// Encodes user questions for searching. Kept distinct from [`ContextEncoder`]
/// because dense retrievers are usually asymmetric.
pub struct QuestionEncoder {
    model: Box<dyn EmbeddingModel>,
    prefix: String,
    max_tokens: usize,
}

impl ContextEncoder {
    #[inline]
    pub fn new(model: Box<dyn EmbeddingModel>) -> Self {
        Self {
            model,
            prefix: String::new(),
            max_tokens: 256,
            batch_size: 16,
            show_progress: false,
        }
    }

    #[inline]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    #[inline]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[inline]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[inline]
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    #[inline]
    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    #[inline]
    pub fn settings(&self) -> EncoderSettings {
        EncoderSettings {
            model: self.model_name().to_string(),
            prefix: self.prefix.clone(),
            max_tokens: self.max_tokens,
        }
    }

    /// One embedding per paragraph, same order. Paragraphs longer than the
    /// token limit are truncated, not chunked.
    pub fn encode_paragraphs(&self, paragraphs: &[String]) -> Result<Vec<Embedding>> {
        if paragraphs.is_empty() {
            return Ok(Vec::new());
        }

        let bar = if self.show_progress {
            ProgressBar::new(paragraphs.len() as u64).with_style(
                ProgressStyle::with_template("{spinner} [{pos}/{len}] Encoding paragraphs {wide_bar}")
                    .expect("style template is valid"),
            )
        } else {
            ProgressBar::hidden()
        };

        let mut embeddings = Vec::with_capacity(paragraphs.len());
        for batch in paragraphs.chunks(self.batch_size) {
            let inputs: Vec<String> = batch
                .iter()
                .map(|p| prepare_input(&self.prefix, p, self.max_tokens))
                .collect();

            let batch_embeddings = self.model.embed(&inputs)?;
            if batch_embeddings.len() != inputs.len() {
                return Err(RagError::Encoding(format!(
                    "{} returned {} embeddings for {} paragraphs",
                    self.model_name(),
                    batch_embeddings.len(),
                    inputs.len()
                )));
            }

            embeddings.extend(batch_embeddings);
            bar.inc(batch.len() as u64);
        }
        bar.finish_and_clear();

        check_dimensions(self.model_name(), &embeddings)?;
        debug!(
            "Encoded {} paragraphs into {}-dimensional embeddings",
            embeddings.len(),
            embeddings[0].len()
        );

        Ok(embeddings)
    }
}

impl QuestionEncoder {
    #[inline]
    pub fn new(model: Box<dyn EmbeddingModel>) -> Self {
        Self {
            model,
            prefix: String::new(),
            max_tokens: 64,
        }
    }

    #[inline]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    #[inline]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[inline]
    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    pub fn encode_question(&self, question: &str) -> Result<Embedding> {
        let input = prepare_input(&self.prefix, question.trim(), self.max_tokens);

        let embedding = self
            .model
            .embed(&[input])?
            .into_iter()
            .next()
            .ok_or_else(|| {
                RagError::Encoding(format!("{} returned no embedding", self.model_name()))
            })?;

        check_dimensions(self.model_name(), std::slice::from_ref(&embedding))?;
        Ok(embedding)
    }
}

/// Rough token estimate: ~0.75 words per token, plus a little for punctuation
#[inline]
pub fn estimate_token_count(text: &str) -> usize {
    let word_count = text.split_whitespace().count();
    let punct_count = text.chars().filter(|c| c.is_ascii_punctuation()).count();

    estimate(word_count, punct_count)
}

/// Longest whitespace-delimited prefix of `text` whose estimated token count
/// fits in `max_tokens`
#[inline]
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> &str {
    if estimate_token_count(text) <= max_tokens {
        return text;
    }

    let mut offset = 0;
    let mut kept_end = 0;
    let mut words = 0;
    let mut punct = 0;

    for piece in text.split_inclusive(char::is_whitespace) {
        let start = offset;
        offset += piece.len();

        let word = piece.trim_end();
        if word.trim_start().is_empty() {
            continue;
        }

        words += 1;
        punct += word.chars().filter(|c| c.is_ascii_punctuation()).count();
        if estimate(words, punct) > max_tokens {
            break;
        }
        kept_end = start + word.len();
    }

    &text[..kept_end]
}

fn estimate(words: usize, punct: usize) -> usize {
    (punct as f64).mul_add(0.1, words as f64 / 0.75) as usize
}

fn prepare_input(prefix: &str, text: &str, max_tokens: usize) -> String {
    let budget = max_tokens.saturating_sub(estimate_token_count(prefix));
    format!("{prefix}{}", truncate_to_tokens(text, budget))
}

fn check_dimensions(model: &str, embeddings: &[Embedding]) -> Result<()> {
    let Some(first) = embeddings.first() else {
        return Ok(());
    };

    if first.is_empty() {
        return Err(RagError::Encoding(format!("{model} returned an empty embedding")));
    }

    if let Some((row, other)) = embeddings
        .iter()
        .enumerate()
        .find(|(_, e)| e.len() != first.len())
    {
        return Err(RagError::Encoding(format!(
            "{model} returned inconsistent dimensions: row 0 has {}, row {row} has {}",
            first.len(),
            other.len()
        )));
    }

    Ok(())
}
