use anyhow::Result;
use clap::{Parser, Subcommand};
use kb_rag::commands::{ask, build_index, chat, serve_mcp, show_status};
use kb_rag::config::{get_config_dir, run_interactive_config, show_config};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kb-rag")]
#[command(about = "Question answering over a plain-text knowledge base with retrieval and Ollama")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml (default: platform config dir)
    #[arg(long, global = true, env = "KB_RAG_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the knowledge base, Ollama connection and models
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Build the paragraph index, or confirm the persisted one is current
    Index {
        /// Re-encode every paragraph even if the index is current
        #[arg(long)]
        force: bool,
    },
    /// Answer a single question
    Ask {
        question: String,
        /// Generation model family: causal or seq2seq
        #[arg(long, short, default_value = "causal")]
        model: String,
        /// Number of paragraphs to retrieve, 1 to 50 (default: from config)
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..=50))]
        top_k: Option<u16>,
    },
    /// Ask questions interactively
    Chat,
    /// Show knowledge base, Ollama and index status
    Status,
    /// Start MCP server on stdio
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout is reserved for command output and the MCP protocol
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_dir = get_config_dir(cli.config_dir)?;

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&config_dir)?;
            } else {
                run_interactive_config(&config_dir)?;
            }
        }
        Commands::Index { force } => {
            build_index(&config_dir, force)?;
        }
        Commands::Ask {
            question,
            model,
            top_k,
        } => {
            ask(&config_dir, &question, &model, top_k.map(usize::from))?;
        }
        Commands::Chat => {
            chat(&config_dir)?;
        }
        Commands::Status => {
            show_status(&config_dir)?;
        }
        Commands::Serve => {
            serve_mcp(&config_dir).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use serial_test::serial;

    const CONFIG_DIR_VAR: &str = "KB_RAG_CONFIG_DIR";

    #[test]
    fn ask_command_defaults() {
        let cli = Cli::try_parse_from(["kb-rag", "ask", "How many vacation days?"])
            .expect("ask parses");

        match cli.command {
            Commands::Ask {
                question,
                model,
                top_k,
            } => {
                assert_eq!(question, "How many vacation days?");
                assert_eq!(model, "causal");
                assert_eq!(top_k, None);
            }
            _ => panic!("expected ask"),
        }
    }

    #[test]
    fn ask_command_with_options() {
        let cli = Cli::try_parse_from([
            "kb-rag", "ask", "Sick leave?", "--model", "seq2seq", "--top-k", "1",
        ])
        .expect("ask parses");

        match cli.command {
            Commands::Ask { model, top_k, .. } => {
                assert_eq!(model, "seq2seq");
                assert_eq!(top_k, Some(1));
            }
            _ => panic!("expected ask"),
        }
    }

    #[test]
    fn ask_rejects_top_k_out_of_range() {
        for top_k in ["0", "51"] {
            let err = Cli::try_parse_from(["kb-rag", "ask", "Sick leave?", "--top-k", top_k])
                .err()
                .expect("out-of-range top_k is an error");
            assert_eq!(err.kind(), ErrorKind::ValueValidation);
        }
    }

    #[test]
    fn index_force_flag() {
        let cli = Cli::try_parse_from(["kb-rag", "index", "--force"]).expect("index parses");
        assert!(matches!(cli.command, Commands::Index { force: true }));
    }

    #[test]
    fn global_config_dir_after_subcommand() {
        let cli = Cli::try_parse_from(["kb-rag", "status", "--config-dir", "/tmp/kb"])
            .expect("status parses");
        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/kb")));
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    #[serial]
    fn config_dir_from_environment() {
        // SAFETY: every test touching this variable is serialized
        unsafe { std::env::set_var(CONFIG_DIR_VAR, "/tmp/kb-env") };
        let parsed = Cli::try_parse_from(["kb-rag", "status"]);
        let overridden = Cli::try_parse_from(["kb-rag", "--config-dir", "/tmp/kb-flag", "status"]);
        // SAFETY: as above
        unsafe { std::env::remove_var(CONFIG_DIR_VAR) };

        let cli = parsed.expect("status parses");
        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/kb-env")));
        let cli = overridden.expect("status parses");
        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/kb-flag")));
    }

    #[test]
    #[serial]
    fn config_dir_defaults_to_platform_dir() {
        // SAFETY: every test touching this variable is serialized
        unsafe { std::env::remove_var(CONFIG_DIR_VAR) };
        let cli = Cli::try_parse_from(["kb-rag", "status"]).expect("status parses");
        assert_eq!(cli.config_dir, None);
    }

    #[test]
    fn config_show_flag() {
        let cli = Cli::try_parse_from(["kb-rag", "config", "--show"]).expect("config parses");
        assert!(matches!(cli.command, Commands::Config { show: true }));
    }

    #[test]
    fn serve_and_chat_commands() {
        let cli = Cli::try_parse_from(["kb-rag", "serve"]).expect("serve parses");
        assert!(matches!(cli.command, Commands::Serve));

        let cli = Cli::try_parse_from(["kb-rag", "chat"]).expect("chat parses");
        assert!(matches!(cli.command, Commands::Chat));
    }

    #[test]
    fn ask_requires_question() {
        let err = Cli::try_parse_from(["kb-rag", "ask"])
            .err()
            .expect("missing question is an error");
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn invalid_command() {
        let err = Cli::try_parse_from(["kb-rag", "invalid"])
            .err()
            .expect("unknown subcommand is an error");
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
    }

    #[test]
    fn help_message() {
        let err = Cli::try_parse_from(["kb-rag", "--help"])
            .err()
            .expect("help short-circuits parsing");
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    }
}
