//! Question answering orchestration
//!
//! [`RagPipeline`] owns everything a query needs: the corpus, its index, the
//! question encoder and the answer generator. It is read-only once started, so
//! one instance can be shared behind an `Arc` by every serving surface.


use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::corpus::{Corpus, load_paragraphs};
use crate::embeddings::{
    ContextEncoder, EmbeddingModel, OllamaClient, OllamaEmbedder, OllamaGenerator,
    QuestionEncoder,
};
use crate::generation::{AnswerGenerator, ModelChoice, TextGenerator};
use crate::index::{FlatIndex, IndexManifest, IndexStore, Metric};
use crate::{RagError, Result};

/// The loaded model handles, created once per process and handed to the pipeline
pub struct Models {
    pub context_encoder: Box<dyn EmbeddingModel>,
    pub question_encoder: Box<dyn EmbeddingModel>,
    pub causal: Box<dyn TextGenerator>,
    pub seq2seq: Box<dyn TextGenerator>,
}

impl Models {
    /// Ollama-backed handles for every model named in `config`, sharing one client
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = Arc::new(OllamaClient::new(&config.ollama)?);
        let context_window = u32::try_from(config.generation.max_input_tokens)
            .unwrap_or(u32::MAX)
            .saturating_add(config.generation.max_new_tokens);
        let models = &config.models;

        Ok(Self {
            context_encoder: Box::new(OllamaEmbedder::new(
                Arc::clone(&client),
                &models.context_encoder,
            )),
            question_encoder: Box::new(OllamaEmbedder::new(
                Arc::clone(&client),
                &models.question_encoder,
            )),
            causal: Box::new(
                OllamaGenerator::new(Arc::clone(&client), &models.causal)
                    .with_context_window(context_window),
            ),
            seq2seq: Box::new(
                OllamaGenerator::new(client, &models.seq2seq).with_context_window(context_window),
            ),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Re-encode the corpus even if the persisted index is current
    pub force_rebuild: bool,
    /// Draw a progress bar while encoding paragraphs
    pub show_progress: bool,
}

/// A paragraph returned by retrieval, best first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedParagraph {
    pub id: usize,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub question: String,
    pub model: ModelChoice,
    pub model_name: String,
    /// Retrieved paragraphs the answer was generated from
    pub context: Vec<RetrievedParagraph>,
    pub answer: String,
}

impl Answer {
    /// The retrieved paragraphs as they were passed to the generator
    #[inline]
    pub fn context_text(&self) -> String {
        join_context(&self.context)
    }
}

/// What a running pipeline is serving
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineInfo {
    pub context_encoder: String,
    pub question_encoder: String,
    pub causal: String,
    pub seq2seq: String,
    pub metric: Metric,
    pub paragraphs: usize,
    pub dimension: usize,
    pub top_k: usize,
    pub index_path: PathBuf,
    pub index_built_at: DateTime<Utc>,
}

pub struct RagPipeline {
    corpus: Corpus,
    index: FlatIndex,
    manifest: IndexManifest,
    index_path: PathBuf,
    rebuilt: bool,
    question_encoder: QuestionEncoder,
    generator: AnswerGenerator,
    top_k: usize,
}

impl PipelineInfo {
    #[inline]
    pub fn model_for(&self, choice: ModelChoice) -> &str {
        match choice {
            ModelChoice::Causal => &self.causal,
            ModelChoice::Seq2Seq => &self.seq2seq,
        }
    }
}

impl RagPipeline {
    #[inline]
    pub fn start(config: &Config, models: Models) -> Result<Self> {
        Self::start_with(config, models, StartOptions::default())
    }

    /// Load the knowledge base, then load or build its index
    pub fn start_with(config: &Config, models: Models, options: StartOptions) -> Result<Self> {
        let kb_path = config.knowledge_base_path();
        let corpus = load_paragraphs(&kb_path)?;
        if corpus.is_empty() {
            return Err(RagError::MissingResource(format!(
                "knowledge base has no paragraphs: {}",
                kb_path.display()
            )));
        }

        let Models {
            context_encoder,
            question_encoder,
            causal,
            seq2seq,
        } = models;

        let context_encoder = ContextEncoder::new(context_encoder)
            .with_prefix(config.models.context_prefix.as_str())
            .with_max_tokens(config.retrieval.max_context_tokens)
            .with_batch_size(config.ollama.batch_size as usize)
            .with_progress(options.show_progress);

        let store = IndexStore::new(config.index_path());
        let metric = config.retrieval.metric;
        let loaded = if options.force_rebuild {
            store.rebuild(&corpus, &context_encoder, metric)?
        } else {
            store.load_or_build(&corpus, &context_encoder, metric)?
        };

        let question_encoder = QuestionEncoder::new(question_encoder)
            .with_prefix(config.models.question_prefix.as_str())
            .with_max_tokens(config.retrieval.max_question_tokens);
        let generator = AnswerGenerator::new(causal, seq2seq)
            .with_max_input_tokens(config.generation.max_input_tokens)
            .with_max_new_tokens(config.generation.max_new_tokens);

        info!(
            "Pipeline ready: {} paragraphs, {} index of {} dimensions",
            corpus.len(),
            loaded.index.metric(),
            loaded.index.dimension()
        );

        Ok(Self {
            corpus,
            index: loaded.index,
            manifest: loaded.manifest,
            index_path: store.index_path().to_path_buf(),
            rebuilt: loaded.rebuilt,
            question_encoder,
            generator,
            top_k: config.retrieval.top_k,
        })
    }

    #[inline]
    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    #[inline]
    pub fn index(&self) -> &FlatIndex {
        &self.index
    }

    #[inline]
    pub fn manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    #[inline]
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Whether the index was re-encoded during start-up
    #[inline]
    pub fn rebuilt(&self) -> bool {
        self.rebuilt
    }

    #[inline]
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn info(&self) -> PipelineInfo {
        PipelineInfo {
            context_encoder: self.manifest.context_encoder.clone(),
            question_encoder: self.question_encoder.model_name().to_string(),
            causal: self.generator.model(ModelChoice::Causal).model_name().to_string(),
            seq2seq: self.generator.model(ModelChoice::Seq2Seq).model_name().to_string(),
            metric: self.index.metric(),
            paragraphs: self.corpus.len(),
            dimension: self.index.dimension(),
            top_k: self.top_k,
            index_path: self.index_path.clone(),
            index_built_at: self.manifest.built_at,
        }
    }

    /// The `k` paragraphs closest to `question`, best first
    pub fn retrieve(&self, question: &str, k: usize) -> Result<Vec<RetrievedParagraph>> {
        let question = non_blank(question)?;
        let query = self.question_encoder.encode_question(question)?;
        let hits = self.index.search(&query, k)?;

        hits.into_iter()
            .map(|hit| {
                let text = self.corpus.get(hit.id).ok_or_else(|| {
                    RagError::Index(format!("hit {} is outside the knowledge base", hit.id))
                })?;
                Ok(RetrievedParagraph {
                    id: hit.id,
                    text: text.to_string(),
                    score: hit.score,
                })
            })
            .collect()
    }

    #[inline]
    pub fn ask(&self, question: &str, choice: ModelChoice) -> Result<Answer> {
        self.ask_with_top_k(question, choice, self.top_k)
    }

    /// Retrieve `top_k` paragraphs, join them with single spaces and generate
    /// an answer from them. `top_k` must be at least 1.
    pub fn ask_with_top_k(&self, question: &str, choice: ModelChoice, top_k: usize) -> Result<Answer> {
        let question = non_blank(question)?;
        if top_k == 0 {
            return Err(RagError::InvalidTopK(top_k));
        }
        let context = self.retrieve(question, top_k)?;
        debug!(
            "Retrieved paragraphs {:?} for question",
            context.iter().map(|p| p.id).collect::<Vec<_>>()
        );

        let answer = self
            .generator
            .generate(question, &join_context(&context), choice)?;

        Ok(Answer {
            question: question.to_string(),
            model: choice,
            model_name: self.generator.model(choice).model_name().to_string(),
            context,
            answer,
        })
    }
}

fn non_blank(question: &str) -> Result<&str> {
    let question = question.trim();
    if question.is_empty() {
        Err(RagError::EmptyQuestion)
    } else {
        Ok(question)
    }
}

fn join_context(context: &[RetrievedParagraph]) -> String {
    context.iter().map(|p| p.text.as_str()).join(" ")
}
