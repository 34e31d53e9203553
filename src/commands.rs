use anyhow::{Context, Result};
use console::style;
use dialoguer::{Input, Select};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::config::Config;
use crate::corpus::load_paragraphs;
use crate::embeddings::{OllamaClient, missing_models};
use crate::generation::ModelChoice;
use crate::index::{FlatIndex, IndexManifest};
use crate::mcp::{McpServer, register_pipeline_tools};
use crate::pipeline::{Answer, Models, RagPipeline, StartOptions};

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Load config and models, then start the pipeline (loading or building the index)
pub fn start_pipeline(config_dir: &Path, options: StartOptions) -> Result<RagPipeline> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;
    let models = Models::from_config(&config).context("Failed to set up models")?;
    let pipeline =
        RagPipeline::start_with(&config, models, options).context("Failed to start pipeline")?;
    Ok(pipeline)
}

/// Build the index if it is missing or stale (always with `force`) and report it
#[inline]
pub fn build_index(config_dir: &Path, force: bool) -> Result<()> {
    let options = StartOptions {
        force_rebuild: force,
        show_progress: true,
    };
    let pipeline = start_pipeline(config_dir, options)?;
    let manifest = pipeline.manifest();

    if pipeline.rebuilt() {
        println!("✅ Index built");
    } else {
        println!("✅ Index is up to date");
    }
    println!("   📄 Paragraphs: {}", manifest.paragraph_count);
    println!("   📐 Dimensions: {}", manifest.dimension);
    println!("   📏 Metric: {}", manifest.metric);
    println!("   🧠 Context encoder: {}", manifest.context_encoder);
    println!(
        "   🕒 Built: {}",
        manifest.built_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("   💾 Path: {}", pipeline.index_path().display());

    Ok(())
}

/// Answer one question and print the retrieved context and the answer
#[inline]
pub fn ask(config_dir: &Path, question: &str, model: &str, top_k: Option<usize>) -> Result<()> {
    // Parse before anything is loaded so a bad choice fails fast
    let choice: ModelChoice = model.parse()?;

    let pipeline = start_pipeline(config_dir, StartOptions::default())?;
    let top_k = top_k.unwrap_or(pipeline.top_k());
    let answer = pipeline.ask_with_top_k(question, choice, top_k)?;

    print_answer(&answer);
    Ok(())
}

/// Interactive question loop. An empty question exits; failed questions are
/// reported and the loop continues.
#[inline]
pub fn chat(config_dir: &Path) -> Result<()> {
    let pipeline = start_pipeline(
        config_dir,
        StartOptions {
            show_progress: true,
            ..StartOptions::default()
        },
    )?;

    println!("{}", style("💬 Knowledge Base Q&A").bold().cyan());
    println!(
        "{}",
        style(format!(
            "{} paragraphs loaded. Submit an empty question to quit.",
            pipeline.corpus().len()
        ))
        .dim()
    );

    let info = pipeline.info();
    let labels = ModelChoice::ALL.map(|choice| format!("{} ({})", choice, info.model_for(choice)));
    let mut selected = 0;

    loop {
        println!();
        let question: String = Input::new()
            .with_prompt("Question")
            .allow_empty(true)
            .interact_text()?;

        if question.trim().is_empty() {
            break;
        }

        selected = Select::new()
            .with_prompt("Model")
            .default(selected)
            .items(&labels)
            .interact()?;
        let choice = ModelChoice::ALL[selected];

        match pipeline.ask(&question, choice) {
            Ok(answer) => print_answer(&answer),
            Err(e) => {
                error!("Question failed: {}", e);
                println!("{} {}", style("❌ Error:").red().bold(), e);
            }
        }
    }

    Ok(())
}

/// Report config, knowledge base, Ollama and index state without encoding anything
#[inline]
pub fn show_status(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;

    println!("{}", style("📊 kb-rag Status").bold().cyan());
    println!();

    println!("📚 Knowledge Base:");
    let kb_path = config.knowledge_base_path();
    let corpus = match load_paragraphs(&kb_path) {
        Ok(corpus) => {
            println!("   ✅ {} ({} paragraphs)", kb_path.display(), corpus.len());
            if corpus.is_empty() {
                println!("   ⚠️  The file has no non-blank lines");
            }
            Some(corpus)
        }
        Err(e) => {
            println!("   ❌ {}", e);
            None
        }
    };

    println!();
    println!("🤖 Ollama:");
    match check_ollama(&config) {
        Ok(missing) if missing.is_empty() => {
            println!("   ✅ Connected to {}", config.ollama_url()?);
            println!("   ✅ All configured models are available");
        }
        Ok(missing) => {
            println!("   ✅ Connected to {}", config.ollama_url()?);
            for model in missing {
                println!("   ⚠️  Missing model {} (run `ollama pull {}`)", model, model);
            }
        }
        Err(e) => {
            println!("   ❌ Cannot reach Ollama: {:#}", e);
        }
    }

    println!();
    println!("🗂️  Index:");
    let index_path = config.index_path();
    match (IndexManifest::load(&index_path), FlatIndex::load(&index_path)) {
        (_, Ok(None)) => {
            println!("   📭 Not built yet ({})", index_path.display());
        }
        (_, Err(e)) => {
            println!("   ❌ Unreadable: {}", e);
        }
        (Err(e), Ok(Some(_))) => {
            println!("   ❌ Manifest unreadable: {}", e);
        }
        (Ok(None), Ok(Some(_))) => {
            println!("   ⚠️  No manifest, it will be rebuilt on next start");
        }
        (Ok(Some(manifest)), Ok(Some(index))) => {
            println!(
                "   📄 {} rows of {} dimensions, built {}",
                index.len(),
                index.dimension(),
                manifest.built_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            let encoder = config.context_encoder_settings();
            let reason = corpus.as_ref().and_then(|corpus| {
                manifest.mismatch(corpus, config.retrieval.metric, &encoder)
            });
            match reason {
                None if corpus.is_some() => println!("   ✅ Up to date"),
                None => println!("   ⚠️  Freshness unknown without a knowledge base"),
                Some(reason) => println!("   ⚠️  Stale: {}", reason),
            }
        }
    }

    println!();
    println!("💡 Next Steps:");
    println!("   • Use 'kb-rag index' to build the index");
    println!("   • Use 'kb-rag ask \"<question>\"' or 'kb-rag chat' to ask questions");
    println!("   • Use 'kb-rag serve' to start the MCP server for AI assistants");

    Ok(())
}

/// Start the pipeline, then serve it over MCP on stdio until EOF
#[inline]
pub async fn serve_mcp(config_dir: &Path) -> Result<()> {
    info!("Starting MCP server");

    let config_dir = config_dir.to_path_buf();
    let pipeline = tokio::task::spawn_blocking(move || {
        start_pipeline(&config_dir, StartOptions::default())
    })
    .await
    .context("Pipeline start-up panicked")??;
    let pipeline = Arc::new(pipeline);

    let server = Arc::new(
        McpServer::new(
            env!("CARGO_PKG_NAME").to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        )
        .with_instructions(
            "Answers questions from a plain-text knowledge base. Use `retrieve` to see the \
             most relevant paragraphs and `ask` to generate an answer from them.",
        ),
    );
    register_pipeline_tools(&server, &pipeline).await;

    // stdout carries the protocol, so status goes to stderr
    eprintln!(
        "kb-rag MCP server ready: {} paragraphs, tools: {}",
        pipeline.corpus().len(),
        server.tool_names().await.join(", ")
    );

    server.serve_stdio().await
}

fn print_answer(answer: &Answer) {
    println!();
    println!("{}", style("Retrieved Context").bold().yellow());
    for paragraph in &answer.context {
        println!(
            "  {} {}",
            style(format!("[{} | {:.3}]", paragraph.id, paragraph.score)).dim(),
            paragraph.text
        );
    }
    println!();
    println!(
        "{} {}",
        style("Answer").bold().green(),
        style(format!("({}, {})", answer.model, answer.model_name)).dim()
    );
    println!("  {}", answer.answer);
}

fn check_ollama(config: &Config) -> Result<Vec<String>> {
    let client = OllamaClient::new(&config.ollama)?
        .with_timeout(STATUS_TIMEOUT)
        .with_retry_attempts(1);
    let available = client.list_models()?;

    let models = &config.models;
    let wanted = [
        models.context_encoder.as_str(),
        models.question_encoder.as_str(),
        models.causal.as_str(),
        models.seq2seq.as_str(),
    ];

    Ok(missing_models(&available, &wanted)
        .into_iter()
        .map(str::to_string)
        .collect())
}
