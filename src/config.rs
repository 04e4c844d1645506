//! TOML configuration.
//!
//! Configuration is read from `$RAGCHAT_CONFIG` or `./ragchat.toml`. The file
//! is optional: every section and field falls back to a default, so a bare
//! `ragchat` run works against `./data` with a local embedding model and a
//! local Ollama server.
//!
//! ```toml
//! [corpus]
//! dir = "data"
//!
//! [index]
//! store_dir = "index_store"
//!
//! [retrieval]
//! mode = "hybrid"
//! top_k = 2
//!
//! [embedding]
//! provider = "local"
//! model = "bge-base-en-v1.5"
//!
//! [generation]
//! provider = "ollama"
//! model = "llama3.2"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "RAGCHAT_CONFIG";

/// Config file looked up in the working directory when no override is set.
pub const DEFAULT_CONFIG_FILE: &str = "ragchat.toml";

/// Default system instruction: chat casually, reach for the documents only when asked.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly, helpful assistant. \
Chat casually with the user. Only draw on the provided documents when the user \
explicitly asks about their documents or files, or when the question clearly \
depends on them.";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub corpus: CorpusConfig,
    pub index: IndexConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CorpusConfig {
    pub dir: PathBuf,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
    /// Binary documents (PDF, Office) larger than this are skipped.
    pub max_extract_bytes: u64,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_extract_bytes: 50 * 1024 * 1024,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    [
        "**/*.md", "**/*.markdown", "**/*.txt", "**/*.rst", "**/*.csv", "**/*.json",
        "**/*.html", "**/*.htm", "**/*.pdf", "**/*.docx", "**/*.pptx", "**/*.xlsx",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    pub store_dir: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("index_store"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            overlap_tokens: 0,
        }
    }
}

/// How passages are scored at query time.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Keyword,
    Semantic,
    Hybrid,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub mode: SearchMode,
    pub hybrid_alpha: f64,
    pub candidate_k: usize,
    pub top_k: usize,
    pub max_chunks_per_doc: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: SearchMode::Hybrid,
            hybrid_alpha: 0.6,
            candidate_k: 80,
            top_k: 2,
            max_chunks_per_doc: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: Option<String>,
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    pub url: Option<String>,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: Some("bge-base-en-v1.5".to_string()),
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn disabled() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    pub provider: String,
    pub model: String,
    pub url: Option<String>,
    /// Request timeout handed to the HTTP client. Not enforced by the chat loop.
    pub timeout_secs: u64,
    /// Set to `false` to force single-shot responses.
    pub stream: bool,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "llama3.2".to_string(),
            url: None,
            timeout_secs: 360,
            stream: true,
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            temperature: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn tracing_level(&self) -> Result<tracing::Level> {
        self.level
            .parse::<tracing::Level>()
            .map_err(|_| anyhow::anyhow!("Unknown logging.level: '{}'", self.level))
    }
}

/// Resolve the config path: `$RAGCHAT_CONFIG`, else `./ragchat.toml`.
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load and validate configuration. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    } else {
        Config::default()
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
    }

    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.max_chunks_per_doc < 1 {
        bail!("retrieval.max_chunks_per_doc must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, local, ollama, or openai.",
            other
        ),
    }

    if config.retrieval.mode != SearchMode::Keyword && !config.embedding.is_enabled() {
        bail!(
            "retrieval.mode '{:?}' requires embeddings. Set [embedding] provider or use mode = \"keyword\".",
            config.retrieval.mode
        );
    }

    match config.generation.provider.as_str() {
        "ollama" | "openai" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be ollama or openai.",
            other
        ),
    }

    config.logging.tracing_level()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/ragchat.toml")).unwrap();
        assert_eq!(config.corpus.dir, PathBuf::from("data"));
        assert_eq!(config.index.store_dir, PathBuf::from("index_store"));
        assert_eq!(config.generation.model, "llama3.2");
        assert_eq!(config.generation.timeout_secs, 360);
        assert_eq!(config.retrieval.mode, SearchMode::Hybrid);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config = parse(
            r#"
            [embedding]
            provider = "disabled"

            [retrieval]
            mode = "keyword"
            top_k = 4
            "#,
        )
        .unwrap();
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.retrieval.top_k, 4);
        assert_eq!(config.chunking.max_tokens, 512);
    }

    #[test]
    fn semantic_mode_requires_embeddings() {
        let err = parse(
            r#"
            [embedding]
            provider = "disabled"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("requires embeddings"));
    }

    #[test]
    fn remote_embedding_requires_dims() {
        let err = parse(
            r#"
            [embedding]
            provider = "ollama"
            model = "nomic-embed-text"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn unknown_generation_provider_rejected() {
        let err = parse(
            r#"
            [generation]
            provider = "mystery"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown generation provider"));
    }

    #[test]
    fn bad_alpha_rejected() {
        let err = parse(
            r#"
            [retrieval]
            hybrid_alpha = 1.5
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("hybrid_alpha"));
    }

    #[test]
    fn bad_log_level_rejected() {
        let err = parse(
            r#"
            [logging]
            level = "chatty"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("logging.level"));
    }
}
