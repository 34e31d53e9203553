use super::*;
use tempfile::TempDir;

#[test]
fn default_config() {
    let config = Config::default();
    assert_eq!(config.ollama.protocol, "http");
    assert_eq!(config.ollama.host, "localhost");
    assert_eq!(config.ollama.port, 11434);
    assert_eq!(config.ollama.batch_size, 16);
    assert_eq!(config.models.context_encoder, "nomic-embed-text:latest");
    assert_eq!(config.retrieval.metric, Metric::InnerProduct);
    assert_eq!(config.retrieval.top_k, 3);
    assert_eq!(config.generation.max_input_tokens, 512);
    assert_eq!(config.generation.max_new_tokens, 50);
}

#[test]
fn config_validation() {
    let config = Config::default();
    assert!(config.validate().is_ok());

    let mut invalid_config = config.clone();
    invalid_config.ollama.protocol = "ftp".to_string();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.ollama.port = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.models.causal = String::new();
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::InvalidModel("causal", _))
    ));

    let mut invalid_config = config.clone();
    invalid_config.ollama.batch_size = 1001;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.retrieval.top_k = 0;
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::InvalidTopK(0))
    ));

    let mut invalid_config = config.clone();
    invalid_config.generation.max_new_tokens = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config;
    invalid_config.knowledge_base.index_path = PathBuf::new();
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::EmptyPath("index path"))
    ));
}

#[test]
fn ollama_url_generation() {
    let config = Config::default();
    let url = config
        .ollama_url()
        .expect("should generate ollama_url successfully");
    assert_eq!(url.as_str(), "http://localhost:11434/");
}

#[test]
fn toml_serialization() {
    let config = Config::default();
    let toml_str = toml::to_string(&config).expect("should serialize toml correctly");
    let parsed_config: Config = toml::from_str(&toml_str).expect("should parse toml correctly");
    assert_eq!(config, parsed_config);
}

#[test]
fn metric_serializes_as_snake_case() {
    let toml_str = r#"
        [retrieval]
        metric = "euclidean"
        top_k = 5
    "#;
    let config: Config = toml::from_str(toml_str).expect("should parse toml correctly");
    assert_eq!(config.retrieval.metric, Metric::Euclidean);
    assert_eq!(config.retrieval.top_k, 5);
    assert_eq!(config.retrieval.max_context_tokens, 256);
}

#[test]
fn setter_validation() {
    let mut config = OllamaConfig::default();

    assert!(config.set_protocol("https".to_string()).is_ok());
    assert!(config.set_host("example.com".to_string()).is_ok());
    assert!(config.set_port(8080).is_ok());
    assert!(config.set_batch_size(128).is_ok());

    assert!(config.set_protocol("ftp".to_string()).is_err());
    assert!(config.set_port(0).is_err());
    assert!(config.set_batch_size(0).is_err());
    assert!(config.set_batch_size(1001).is_err());

    let mut models = ModelsConfig::default();
    assert!(
        models
            .set_model(ModelRole::Seq2Seq, "flan-t5".to_string())
            .is_ok()
    );
    assert_eq!(models.seq2seq, "flan-t5");
    assert!(
        models
            .set_model(ModelRole::QuestionEncoder, "  ".to_string())
            .is_err()
    );
}

#[test]
fn load_missing_config_uses_defaults() {
    let temp_dir = TempDir::new().expect("should create temp dir");

    let config = Config::load(temp_dir.path()).expect("should load default config");
    assert_eq!(config.base_dir, temp_dir.path());
    assert_eq!(config.ollama, OllamaConfig::default());
    assert_eq!(
        config.knowledge_base_path(),
        temp_dir.path().join("data/knowledge_base.txt")
    );
    assert_eq!(
        config.index_path(),
        temp_dir.path().join("vector_store/kb.index")
    );
}

#[test]
fn save_then_load() {
    let temp_dir = TempDir::new().expect("should create temp dir");

    let mut config = Config {
        base_dir: temp_dir.path().join("nested"),
        ..Config::default()
    };
    config.retrieval.top_k = 1;
    config.models.causal = "qwen2.5:0.5b".to_string();
    config.save().expect("should save config");

    let loaded = Config::load(temp_dir.path().join("nested")).expect("should load config");
    assert_eq!(loaded, config);
}

#[test]
fn absolute_paths_are_not_rebased() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let kb = temp_dir.path().join("kb.txt");

    let mut config = Config {
        base_dir: PathBuf::from("/somewhere/else"),
        ..Config::default()
    };
    config.knowledge_base.path = kb.clone();

    assert_eq!(config.knowledge_base_path(), kb);
}

#[test]
fn https_url_generation() {
    let mut config = Config::default();
    config.ollama.protocol = "https".to_string();
    config.ollama.host = "secure.example.com".to_string();
    config.ollama.port = 443;

    let url = config
        .ollama_url()
        .expect("should generate https url successfully");
    assert_eq!(url.as_str(), "https://secure.example.com/");
}

#[test]
fn invalid_config_file_is_rejected() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    std::fs::write(
        temp_dir.path().join(CONFIG_FILE_NAME),
        "[ollama]\nport = 0\n",
    )
    .expect("should write config");

    assert!(Config::load(temp_dir.path()).is_err());
}

#[test]
fn context_encoder_settings_follow_models_and_retrieval() {
    let mut config = Config::default();
    config.models.context_prefix = "passage: ".to_string();
    config.retrieval.max_context_tokens = 128;

    let settings = config.context_encoder_settings();
    assert_eq!(settings.model, "nomic-embed-text:latest");
    assert_eq!(settings.prefix, "passage: ");
    assert_eq!(settings.max_tokens, 128);
}
