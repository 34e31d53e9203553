#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

// MCP tools served from a real pipeline over in-memory models

use kb_rag::config::Config;
use kb_rag::embeddings::{Embedding, EmbeddingModel};
use kb_rag::generation::TextGenerator;
use kb_rag::mcp::{McpServer, register_pipeline_tools};
use kb_rag::pipeline::{Models, RagPipeline};
use serde_json::{Value, json};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

const VOCABULARY: [&str; 3] = ["vacation", "sick", "remote"];

const KNOWLEDGE_BASE: &str = "Employees get 15 vacation days per year.\n\
    Sick leave is 10 days per year.\n\
    Remote work is allowed two days a week.\n";

struct KeywordModel;

impl EmbeddingModel for KeywordModel {
    fn model_name(&self) -> &str {
        "keywords"
    }

    fn embed(&self, texts: &[String]) -> kb_rag::Result<Vec<Embedding>> {
        Ok(texts
            .iter()
            .map(|text| {
                let text = text.to_lowercase();
                VOCABULARY
                    .iter()
                    .map(|word| text.matches(word).count() as f32)
                    .collect()
            })
            .collect())
    }
}

struct FixedGenerator(&'static str);

impl TextGenerator for FixedGenerator {
    fn model_name(&self) -> &str {
        self.0
    }

    fn generate(&self, _prompt: &str, _max_new_tokens: u32) -> kb_rag::Result<String> {
        Ok(format!("answer from {}", self.0))
    }
}

async fn server_with_pipeline() -> (McpServer, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let config = Config {
        base_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let kb_path = config.knowledge_base_path();
    fs::create_dir_all(kb_path.parent().expect("knowledge base has a parent"))
        .expect("create data dir");
    fs::write(&kb_path, KNOWLEDGE_BASE).expect("write knowledge base");

    let models = Models {
        context_encoder: Box::new(KeywordModel),
        question_encoder: Box::new(KeywordModel),
        causal: Box::new(FixedGenerator("gen-causal")),
        seq2seq: Box::new(FixedGenerator("gen-seq2seq")),
    };
    let pipeline = Arc::new(RagPipeline::start(&config, models).expect("pipeline starts"));

    let server = McpServer::new("kb-rag".to_string(), "0.0.1".to_string());
    register_pipeline_tools(&server, &pipeline).await;
    (server, dir)
}

async fn call_tool(server: &McpServer, name: &str, arguments: Value) -> Value {
    let request = json!({
        "jsonrpc": "2.0",
        "id": 7,
        "method": "tools/call",
        "params": { "name": name, "arguments": arguments }
    });
    let message = server
        .handle_line(&request.to_string())
        .await
        .expect("tool calls get a response");
    serde_json::to_value(message).expect("response serializes")
}

fn tool_text(response: &Value) -> Value {
    let text = response["result"]["content"][0]["text"]
        .as_str()
        .expect("tool result carries text");
    serde_json::from_str(text).expect("tool text is JSON")
}

#[tokio::test]
async fn pipeline_tools_are_listed() {
    let (server, _dir) = server_with_pipeline().await;
    assert_eq!(server.tool_names().await, vec!["ask", "model_info", "retrieve"]);
}

#[tokio::test]
async fn ask_tool_returns_answer_and_context() {
    let (server, _dir) = server_with_pipeline().await;

    let response = call_tool(
        &server,
        "ask",
        json!({ "question": "Can I work remote?", "model": "seq2seq", "top_k": 1 }),
    )
    .await;

    assert_eq!(response["result"]["isError"], false);
    let answer = tool_text(&response);
    assert_eq!(answer["answer"], "answer from gen-seq2seq");
    assert_eq!(answer["model"], "seq2seq");
    assert_eq!(answer["context"][0]["id"], 2);
    assert_eq!(answer["context"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn ask_tool_defaults_to_causal() {
    let (server, _dir) = server_with_pipeline().await;

    let response = call_tool(&server, "ask", json!({ "question": "vacation days?" })).await;

    let answer = tool_text(&response);
    assert_eq!(answer["model"], "causal");
    assert_eq!(answer["model_name"], "gen-causal");
    assert_eq!(answer["context"][0]["id"], 0);
    assert_eq!(answer["context"].as_array().map(Vec::len), Some(3));
}

#[tokio::test]
async fn ask_tool_accepts_model_alias() {
    let (server, _dir) = server_with_pipeline().await;

    let response = call_tool(
        &server,
        "ask",
        json!({ "question": "sick leave?", "model": "bart" }),
    )
    .await;

    assert_eq!(tool_text(&response)["model"], "seq2seq");
}

#[tokio::test]
async fn ask_tool_reports_bad_input_as_tool_errors() {
    let (server, _dir) = server_with_pipeline().await;

    for arguments in [
        json!({ "question": "vacation?", "model": "unsupported" }),
        json!({ "question": "   " }),
        json!({ "question": "vacation?", "top_k": 0 }),
        json!({ "model": "causal" }),
    ] {
        let response = call_tool(&server, "ask", arguments.clone()).await;
        assert_eq!(response["result"]["isError"], true, "{arguments}");
        assert!(response.get("error").is_none(), "{arguments}");
    }
}

#[tokio::test]
async fn retrieve_tool_returns_ranked_paragraphs() {
    let (server, _dir) = server_with_pipeline().await;

    let response = call_tool(
        &server,
        "retrieve",
        json!({ "question": "sick leave", "top_k": 2 }),
    )
    .await;

    let results = tool_text(&response)["results"].clone();
    assert_eq!(results.as_array().map(Vec::len), Some(2));
    assert_eq!(results[0]["id"], 1);
    assert_eq!(results[0]["text"], "Sick leave is 10 days per year.");
}

#[tokio::test]
async fn model_info_tool_describes_pipeline() {
    let (server, _dir) = server_with_pipeline().await;

    let response = call_tool(&server, "model_info", json!({})).await;

    let info = tool_text(&response);
    assert_eq!(info["context_encoder"], "keywords");
    assert_eq!(info["causal"], "gen-causal");
    assert_eq!(info["seq2seq"], "gen-seq2seq");
    assert_eq!(info["paragraphs"], 3);
    assert_eq!(info["dimension"], 3);
    assert_eq!(info["metric"], "inner_product");
}

#[tokio::test]
async fn full_session_over_buffers() {
    let (server, _dir) = server_with_pipeline().await;

    let input = [
        json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": { "name": "test", "version": "1" }
            }
        }),
        json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
        json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
        json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": { "name": "retrieve", "arguments": { "question": "vacation" } }
        }),
    ]
    .iter()
    .map(Value::to_string)
    .collect::<Vec<_>>()
    .join("\n");

    let mut output = Vec::new();
    server
        .serve(input.as_bytes(), &mut output)
        .await
        .expect("session completes");

    let responses: Vec<Value> = String::from_utf8(output)
        .expect("output is UTF-8")
        .lines()
        .map(|line| serde_json::from_str(line).expect("each line is JSON"))
        .collect();

    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0]["result"]["protocolVersion"], "2025-06-18");
    assert_eq!(
        responses[1]["result"]["tools"].as_array().map(Vec::len),
        Some(3)
    );
    assert_eq!(responses[2]["id"], 3);
    assert_eq!(tool_text(&responses[2])["results"][0]["id"], 0);
}
