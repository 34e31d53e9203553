//! Answer generation
//!
//! Two prompt families are supported, selected with [`ModelChoice`]:
//!
//! - `causal`: a completion-style prompt ending in `Answer:`
//! - `seq2seq`: the `question: ... context: ...` form used by encoder-decoder models
//!
//! The context is truncated so the whole prompt fits the input budget, and the
//! decoded output has special-token markers and any echoed prompt removed.

#[cfg(test)]
mod tests;

use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::debug;

use crate::embeddings::{estimate_token_count, truncate_to_tokens};
use crate::{RagError, Result};

static SPECIAL_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<\|[^|<>]*\|>|</?s>|<pad>|<unk>|<mask>|<extra_id_\d+>|\[(?:CLS|SEP|PAD|MASK|UNK)\]")
        .expect("special token pattern is valid")
});

/// A loaded text generation model
pub trait TextGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    /// Complete `prompt` with at most `max_new_tokens` new tokens
    fn generate(&self, prompt: &str, max_new_tokens: u32) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelChoice {
    #[serde(rename = "causal")]
    Causal,
    #[serde(rename = "seq2seq")]
    Seq2Seq,
}

impl ModelChoice {
    pub const ALL: [ModelChoice; 2] = [Self::Causal, Self::Seq2Seq];

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Causal => "causal",
            Self::Seq2Seq => "seq2seq",
        }
    }

    #[inline]
    pub fn prompt(self, question: &str, context: &str) -> String {
        match self {
            Self::Causal => format!("Context: {context}\n\nQuestion: {question}\nAnswer:"),
            Self::Seq2Seq => format!("question: {question} context: {context}"),
        }
    }
}

impl fmt::Display for ModelChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelChoice {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "causal" | "gpt2" => Ok(Self::Causal),
            "seq2seq" | "bart" => Ok(Self::Seq2Seq),
            _ => Err(RagError::InvalidModelChoice(s.to_string())),
        }
    }
}

pub struct AnswerGenerator {
    causal: Box<dyn TextGenerator>,
    seq2seq: Box<dyn TextGenerator>,
    max_input_tokens: usize,
    max_new_tokens: u32,
}

impl AnswerGenerator {
    #[inline]
    pub fn new(causal: Box<dyn TextGenerator>, seq2seq: Box<dyn TextGenerator>) -> Self {
        Self {
            causal,
            seq2seq,
            max_input_tokens: 512,
            max_new_tokens: 50,
        }
    }

    #[inline]
    pub fn with_max_input_tokens(mut self, max_input_tokens: usize) -> Self {
        self.max_input_tokens = max_input_tokens;
        self
    }

    #[inline]
    pub fn with_max_new_tokens(mut self, max_new_tokens: u32) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    #[inline]
    pub fn model(&self, choice: ModelChoice) -> &dyn TextGenerator {
        match choice {
            ModelChoice::Causal => self.causal.as_ref(),
            ModelChoice::Seq2Seq => self.seq2seq.as_ref(),
        }
    }

    /// Prompt for `choice`, with the context cut so the estimated prompt size
    /// stays within the input budget
    pub fn build_prompt(&self, question: &str, context: &str, choice: ModelChoice) -> String {
        let question = truncate_to_tokens(question.trim(), self.max_input_tokens / 2);
        let overhead = estimate_token_count(&choice.prompt(question, ""));
        // Estimates are floored per piece, so leave one token of slack
        let budget = self.max_input_tokens.saturating_sub(overhead + 1);

        choice.prompt(question, truncate_to_tokens(context.trim(), budget))
    }

    pub fn generate(&self, question: &str, context: &str, choice: ModelChoice) -> Result<String> {
        let prompt = self.build_prompt(question, context, choice);
        let model = self.model(choice);

        debug!(
            "Generating answer with {} ({}), prompt ~{} tokens",
            model.model_name(),
            choice,
            estimate_token_count(&prompt)
        );

        let raw = model.generate(&prompt, self.max_new_tokens)?;
        let answer = clean_output(&raw, &prompt, choice);

        if answer.is_empty() {
            return Err(RagError::Generation(format!(
                "{} returned an empty answer",
                model.model_name()
            )));
        }

        Ok(answer)
    }
}

/// Remove special-token markers such as `<|endoftext|>`, `</s>` or `[SEP]`
#[inline]
pub fn strip_special_tokens(text: &str) -> String {
    SPECIAL_TOKENS.replace_all(text, "").into_owned()
}

fn clean_output(raw: &str, prompt: &str, choice: ModelChoice) -> String {
    let text = strip_special_tokens(raw);
    let mut text = text.trim_start().strip_prefix(prompt).unwrap_or(&text);

    if choice == ModelChoice::Causal {
        // Causal models tend to continue with another made-up question
        if let Some(end) = text.find("\nQuestion:") {
            text = &text[..end];
        }
    }

    text.trim().to_string()
}
