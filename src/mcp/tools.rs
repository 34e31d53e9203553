//! MCP Tools Implementation
//!
//! Tools exposed over MCP: `ask`, `retrieve` and `model_info`. Pipeline calls
//! block on model requests, so they run on tokio's blocking pool.

use crate::generation::ModelChoice;
use crate::mcp::protocol::*;
use crate::mcp::server::{McpServer, ToolHandler};
use crate::pipeline::RagPipeline;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

const MAX_TOP_K: usize = 50;

pub struct AskHandler {
    pipeline: Arc<RagPipeline>,
}

pub struct RetrieveHandler {
    pipeline: Arc<RagPipeline>,
}

pub struct ModelInfoHandler {
    pipeline: Arc<RagPipeline>,
}

#[derive(Debug, Deserialize)]
struct AskArgs {
    question: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RetrieveArgs {
    question: String,
    #[serde(default)]
    top_k: Option<usize>,
}

impl AskHandler {
    #[inline]
    pub fn new(pipeline: Arc<RagPipeline>) -> Self {
        Self { pipeline }
    }

    #[inline]
    pub fn tool_definition() -> Tool {
        Tool {
            name: "ask".to_string(),
            description: Some(
                "Answer a question from the knowledge base using retrieved paragraphs".to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "question": {
                        "type": "string",
                        "description": "Question to answer"
                    },
                    "model": {
                        "type": "string",
                        "enum": ModelChoice::ALL.map(ModelChoice::as_str),
                        "description": "Generation model family (default: causal)"
                    },
                    "top_k": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": MAX_TOP_K,
                        "description": "Number of paragraphs to retrieve (default: configured top_k)"
                    }
                },
                "required": ["question"],
                "additionalProperties": false
            }),
        }
    }
}

#[async_trait]
impl ToolHandler for AskHandler {
    async fn handle(&self, params: CallToolParams) -> Result<CallToolResult> {
        let args: AskArgs = parse_arguments(params)?;
        let choice = match args.model.as_deref() {
            Some(model) => model.parse::<ModelChoice>()?,
            None => ModelChoice::Causal,
        };
        let top_k = check_top_k(args.top_k.unwrap_or(self.pipeline.top_k()))?;

        debug!("ask: model={}, top_k={}", choice, top_k);

        let pipeline = Arc::clone(&self.pipeline);
        let answer = tokio::task::spawn_blocking(move || {
            pipeline.ask_with_top_k(&args.question, choice, top_k)
        })
        .await
        .context("ask task panicked")??;

        Ok(CallToolResult::text(serde_json::to_string_pretty(&answer)?))
    }
}

impl RetrieveHandler {
    #[inline]
    pub fn new(pipeline: Arc<RagPipeline>) -> Self {
        Self { pipeline }
    }

    #[inline]
    pub fn tool_definition() -> Tool {
        Tool {
            name: "retrieve".to_string(),
            description: Some(
                "Return the knowledge base paragraphs most similar to a question".to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "question": {
                        "type": "string",
                        "description": "Question or search text"
                    },
                    "top_k": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": MAX_TOP_K,
                        "description": "Maximum number of paragraphs (default: configured top_k)"
                    }
                },
                "required": ["question"],
                "additionalProperties": false
            }),
        }
    }
}

#[async_trait]
impl ToolHandler for RetrieveHandler {
    async fn handle(&self, params: CallToolParams) -> Result<CallToolResult> {
        let args: RetrieveArgs = parse_arguments(params)?;
        let top_k = check_top_k(args.top_k.unwrap_or(self.pipeline.top_k()))?;

        let pipeline = Arc::clone(&self.pipeline);
        let results =
            tokio::task::spawn_blocking(move || pipeline.retrieve(&args.question, top_k))
                .await
                .context("retrieve task panicked")??;

        let response = json!({ "results": results });
        Ok(CallToolResult::text(serde_json::to_string_pretty(&response)?))
    }
}

impl ModelInfoHandler {
    #[inline]
    pub fn new(pipeline: Arc<RagPipeline>) -> Self {
        Self { pipeline }
    }

    #[inline]
    pub fn tool_definition() -> Tool {
        Tool {
            name: "model_info".to_string(),
            description: Some("Describe the loaded models and index".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        }
    }
}

#[async_trait]
impl ToolHandler for ModelInfoHandler {
    async fn handle(&self, _params: CallToolParams) -> Result<CallToolResult> {
        let info = self.pipeline.info();
        Ok(CallToolResult::text(serde_json::to_string_pretty(&info)?))
    }
}

/// Register every tool backed by `pipeline`
pub async fn register_pipeline_tools(server: &McpServer, pipeline: &Arc<RagPipeline>) {
    server
        .register_tool(
            AskHandler::tool_definition(),
            AskHandler::new(Arc::clone(pipeline)),
        )
        .await;
    server
        .register_tool(
            RetrieveHandler::tool_definition(),
            RetrieveHandler::new(Arc::clone(pipeline)),
        )
        .await;
    server
        .register_tool(
            ModelInfoHandler::tool_definition(),
            ModelInfoHandler::new(Arc::clone(pipeline)),
        )
        .await;
}

fn parse_arguments<T: DeserializeOwned>(params: CallToolParams) -> Result<T> {
    let arguments = Value::Object(params.arguments.unwrap_or_default().into_iter().collect());
    serde_json::from_value(arguments)
        .with_context(|| format!("Invalid arguments for tool {}", params.name))
}

fn check_top_k(top_k: usize) -> Result<usize> {
    if (1..=MAX_TOP_K).contains(&top_k) {
        Ok(top_k)
    } else {
        Err(anyhow!("top_k must be between 1 and {MAX_TOP_K}, got {top_k}"))
    }
}
