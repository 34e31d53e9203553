use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Missing resource: {0}")]
    MissingResource(String),

    #[error("Invalid model choice: '{0}' (expected 'causal' or 'seq2seq')")]
    InvalidModelChoice(String),

    #[error("Question must not be empty")]
    EmptyQuestion,

    #[error("At least one paragraph must be retrieved to answer a question (top_k = {0})")]
    InvalidTopK(usize),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Index is locked by another builder: {0}")]
    IndexLocked(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub mod commands;
pub mod config;
pub mod corpus;
pub mod embeddings;
pub mod generation;
pub mod index;
pub mod mcp;
pub mod pipeline;
