// Configuration management module
// TOML settings plus the interactive setup flow

pub mod interactive;
pub mod settings;


pub use interactive::{run_interactive_config, show_config};
pub use settings::{
    Config, ConfigError, GenerationConfig, KnowledgeBaseConfig, ModelRole, ModelsConfig,
    OllamaConfig, RetrievalConfig,
};

/// Resolve the configuration directory: an explicit override wins over the platform default
#[inline]
pub fn get_config_dir(
    override_dir: Option<std::path::PathBuf>,
) -> Result<std::path::PathBuf, ConfigError> {
    match override_dir {
        Some(dir) => Ok(dir),
        None => Config::default_dir(),
    }
}
