
use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, Input, Select};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{Config, ConfigError, ModelRole, ModelsConfig, OllamaConfig, RetrievalConfig};
use crate::embeddings::{OllamaClient, missing_models};
use crate::index::Metric;

const CONNECTION_TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[inline]
pub fn run_interactive_config(config_dir: &Path) -> Result<()> {
    eprintln!("{}", style("🔧 kb-rag Configuration Setup").bold().cyan());
    eprintln!();

    let mut config = load_existing_config(config_dir)?;

    eprintln!("{}", style("Knowledge Base").bold().yellow());
    eprintln!("Relative paths are resolved against {}", config_dir.display());
    eprintln!();
    configure_knowledge_base(&mut config)?;

    eprintln!();
    eprintln!("{}", style("Ollama Configuration").bold().yellow());
    eprintln!("Configure the local Ollama instance serving the encoders and generators.");
    eprintln!();
    configure_ollama(&mut config.ollama)?;

    eprintln!();
    eprintln!("{}", style("Models").bold().yellow());
    configure_models(&mut config.models)?;

    eprintln!();
    eprintln!("{}", style("Retrieval").bold().yellow());
    configure_retrieval(&mut config.retrieval)?;

    eprintln!();
    eprintln!("{}", style("Testing configuration...").yellow());

    match test_ollama_connection(&config) {
        Ok(missing) if missing.is_empty() => {
            eprintln!("{}", style("✓ Ollama connection successful!").green());
        }
        Ok(missing) => {
            eprintln!(
                "{}",
                style("⚠ Connected, but some models are not pulled yet:").yellow()
            );
            for model in missing {
                eprintln!("  ollama pull {model}");
            }
        }
        Err(e) => {
            eprintln!(
                "{}",
                style("⚠ Warning: Could not connect to Ollama").yellow()
            );
            eprintln!("  {e:#}");
            eprintln!("You can continue, but make sure Ollama is running before indexing.");
        }
    }

    eprintln!();
    if Confirm::new()
        .with_prompt("Save configuration?")
        .default(true)
        .interact()?
    {
        config.save().context("Failed to save configuration")?;
        eprintln!("{}", style("✓ Configuration saved successfully!").green());
        eprintln!(
            "Configuration saved to: {}",
            style(config.config_file_path().display()).cyan()
        );
    } else {
        eprintln!("Configuration not saved.");
    }

    Ok(())
}

#[inline]
pub fn show_config(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;

    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Knowledge Base:").bold().yellow());
    eprintln!(
        "  File: {}",
        style(config.knowledge_base_path().display()).cyan()
    );
    eprintln!("  Index: {}", style(config.index_path().display()).cyan());

    eprintln!();
    eprintln!("{}", style("Ollama Settings:").bold().yellow());
    match config.ollama_url() {
        Ok(url) => eprintln!("  URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  URL: {} ({})", style("Invalid").red(), e),
    }
    eprintln!("  Batch Size: {}", style(config.ollama.batch_size).cyan());
    eprintln!(
        "  Timeout: {}",
        style(format!("{}s", config.ollama.timeout_seconds)).cyan()
    );
    eprintln!("  Retries: {}", style(config.ollama.retry_attempts).cyan());

    eprintln!();
    eprintln!("{}", style("Models:").bold().yellow());
    for role in ModelRole::ALL {
        eprintln!("  {}: {}", role.label(), style(model_for(&config.models, role)).cyan());
    }

    eprintln!();
    eprintln!("{}", style("Retrieval:").bold().yellow());
    eprintln!("  Metric: {}", style(config.retrieval.metric).cyan());
    eprintln!("  Top K: {}", style(config.retrieval.top_k).cyan());
    eprintln!(
        "  Max answer tokens: {}",
        style(config.generation.max_new_tokens).cyan()
    );

    eprintln!();
    eprintln!("Config file: {}", style(config.config_file_path().display()).dim());

    Ok(())
}

fn load_existing_config(config_dir: &Path) -> Result<Config> {
    if config_dir.join(super::settings::CONFIG_FILE_NAME).exists() {
        let config = Config::load(config_dir)?;
        eprintln!("{}", style("Found existing configuration.").green());
        Ok(config)
    } else {
        eprintln!(
            "{}",
            style("No existing configuration found. Using defaults.").yellow()
        );
        Config::load(config_dir)
    }
}

fn configure_knowledge_base(config: &mut Config) -> Result<()> {
    let path: String = Input::new()
        .with_prompt("Knowledge base file (one paragraph per line)")
        .default(config.knowledge_base.path.display().to_string())
        .validate_with(non_empty("Path"))
        .interact_text()?;

    let index_path: String = Input::new()
        .with_prompt("Index file")
        .default(config.knowledge_base.index_path.display().to_string())
        .validate_with(non_empty("Path"))
        .interact_text()?;

    config.knowledge_base.path = PathBuf::from(path.trim());
    config.knowledge_base.index_path = PathBuf::from(index_path.trim());
    config.knowledge_base.validate()?;
    Ok(())
}

fn configure_ollama(ollama: &mut OllamaConfig) -> Result<()> {
    let protocols = &["http", "https"];
    let default_index = protocols
        .iter()
        .position(|&p| p == ollama.protocol)
        .unwrap_or(0);

    let protocol_index = Select::new()
        .with_prompt("Ollama protocol")
        .default(default_index)
        .items(protocols)
        .interact()?;

    let protocol = protocols[protocol_index].to_string();

    let host: String = Input::new()
        .with_prompt("Ollama host")
        .default(ollama.host.clone())
        .validate_with(|input: &String| -> Result<(), ConfigError> {
            let temp_config = OllamaConfig {
                protocol: protocol.clone(),
                host: input.clone(),
                ..OllamaConfig::default()
            };
            temp_config.validate()
        })
        .interact_text()?;

    let port: u16 = Input::new()
        .with_prompt("Ollama port")
        .default(ollama.port)
        .validate_with(|input: &u16| -> Result<(), &str> {
            if *input == 0 {
                Err("Port must be greater than 0")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let batch_size: u32 = Input::new()
        .with_prompt("Batch size for paragraph encoding")
        .default(ollama.batch_size)
        .validate_with(|input: &u32| -> Result<(), &str> {
            if *input == 0 {
                Err("Batch size must be greater than 0")
            } else if *input > 1000 {
                Err("Batch size must be 1000 or less")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    ollama.set_protocol(protocol)?;
    ollama.set_host(host)?;
    ollama.set_port(port)?;
    ollama.set_batch_size(batch_size)?;

    Ok(())
}

fn configure_models(models: &mut ModelsConfig) -> Result<()> {
    for role in ModelRole::ALL {
        let model: String = Input::new()
            .with_prompt(format!("{} model", role.label()))
            .default(model_for(models, role).to_string())
            .validate_with(non_empty("Model name"))
            .interact_text()?;

        models.set_model(role, model.trim().to_string())?;
    }
    Ok(())
}

fn configure_retrieval(retrieval: &mut RetrievalConfig) -> Result<()> {
    let metrics = [Metric::InnerProduct, Metric::Euclidean];
    let labels = ["inner product (cosine)", "euclidean (L2)"];
    let default_index = metrics
        .iter()
        .position(|&m| m == retrieval.metric)
        .unwrap_or(0);

    let metric_index = Select::new()
        .with_prompt("Similarity metric")
        .default(default_index)
        .items(&labels)
        .interact()?;

    let top_k: usize = Input::new()
        .with_prompt("Paragraphs retrieved per question")
        .default(retrieval.top_k)
        .validate_with(|input: &usize| -> Result<(), &str> {
            if (1..=50).contains(input) {
                Ok(())
            } else {
                Err("Must be between 1 and 50")
            }
        })
        .interact_text()?;

    retrieval.metric = metrics[metric_index];
    retrieval.top_k = top_k;
    retrieval.validate()?;
    Ok(())
}

fn model_for(models: &ModelsConfig, role: ModelRole) -> &str {
    match role {
        ModelRole::ContextEncoder => &models.context_encoder,
        ModelRole::QuestionEncoder => &models.question_encoder,
        ModelRole::Causal => &models.causal,
        ModelRole::Seq2Seq => &models.seq2seq,
    }
}

fn non_empty(what: &'static str) -> impl Fn(&String) -> Result<(), String> {
    move |input: &String| {
        if input.trim().is_empty() {
            Err(format!("{what} cannot be empty"))
        } else {
            Ok(())
        }
    }
}

/// Configured models the server does not have. Errors if it cannot be reached.
fn test_ollama_connection(config: &Config) -> Result<Vec<String>> {
    let client = OllamaClient::new(&config.ollama)?
        .with_timeout(CONNECTION_TEST_TIMEOUT)
        .with_retry_attempts(1);
    let available = client.list_models()?;

    let wanted: Vec<&str> = ModelRole::ALL
        .iter()
        .map(|&role| model_for(&config.models, role))
        .collect();

    Ok(missing_models(&available, &wanted)
        .into_iter()
        .map(str::to_string)
        .collect())
}
