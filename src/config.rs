use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub log: LogConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub splitter: SplitterConfig,
    pub embedding: EmbeddingConfig,
    pub vector_store: VectorStoreConfig,
    pub completion: CompletionConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// Path of the SQLite database holding the answer log.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_source_plugin")]
    pub plugin_id: String,
    /// Content API endpoint, e.g. `https://api.example.org/v1`.
    pub api_url: String,
    /// Search converter endpoint that turns a river URL into an API request.
    pub converter_url: String,
    #[serde(default = "default_appname")]
    pub appname: String,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_lifetime_secs")]
    pub cache_lifetime_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_source_plugin() -> String {
    "river".to_string()
}
fn default_appname() -> String {
    "docchat".to_string()
}
fn default_true() -> bool {
    true
}
fn default_cache_lifetime_secs() -> u64 {
    300
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SplitterConfig {
    #[serde(default = "default_splitter_plugin")]
    pub plugin_id: String,
    /// Number of sentences per chunk.
    #[serde(default = "default_group_length")]
    pub group_length: usize,
    /// Number of preceding sentences prepended to each chunk after the first.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            plugin_id: default_splitter_plugin(),
            group_length: default_group_length(),
            overlap: default_overlap(),
        }
    }
}

fn default_splitter_plugin() -> String {
    "sentence".to_string()
}
fn default_group_length() -> usize {
    2
}
fn default_overlap() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_openai_plugin")]
    pub plugin_id: String,
    /// Embeddings endpoint, e.g. `https://api.openai.com/v1/embeddings`.
    pub endpoint: String,
    pub model: String,
    /// Vector width produced by the model.
    pub dimensions: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Model token budget per request; batches stay under this minus a
    /// safety margin.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_openai_plugin() -> String {
    "openai".to_string()
}
fn default_batch_size() -> usize {
    16
}
fn default_max_tokens() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    #[serde(default = "default_vector_store_plugin")]
    pub plugin_id: String,
    /// URL of the Elasticsearch cluster.
    pub url: String,
    /// Number of documents per bulk indexing request.
    #[serde(default = "default_indexing_batch_size")]
    pub indexing_batch_size: usize,
    /// Maximum number of nearest neighbours per similarity search.
    #[serde(default = "default_topk")]
    pub topk: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_vector_store_plugin() -> String {
    "elasticsearch".to_string()
}
fn default_indexing_batch_size() -> usize {
    10
}
fn default_topk() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_openai_plugin")]
    pub plugin_id: String,
    /// Chat completions endpoint, e.g. `https://api.openai.com/v1/chat/completions`.
    pub endpoint: String,
    pub model: String,
    /// Maximum number of tokens in the generated answer.
    #[serde(default = "default_completion_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_completion_max_tokens() -> usize {
    512
}
fn default_completion_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Rerank retrieved passages by similarity with the generated answer.
    #[serde(default = "default_true")]
    pub rerank: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { rerank: true }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractorConfig {
    /// Path to the mutool executable, required when a mimetype maps to the
    /// `mutool` extractor.
    #[serde(default)]
    pub mutool: Option<PathBuf>,
    /// Extractor plugin per mimetype. Attachments with an unmapped
    /// mimetype are skipped.
    #[serde(default = "default_extractor_plugins")]
    pub plugins: BTreeMap<String, String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            mutool: None,
            plugins: default_extractor_plugins(),
        }
    }
}

fn default_extractor_plugins() -> BTreeMap<String, String> {
    let mut plugins = BTreeMap::new();
    plugins.insert("application/pdf".to_string(), "pdf-extract".to_string());
    plugins
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.source.api_url.trim().is_empty() {
        anyhow::bail!("source.api_url must not be empty");
    }
    if config.source.converter_url.trim().is_empty() {
        anyhow::bail!("source.converter_url must not be empty");
    }

    if config.splitter.group_length == 0 {
        anyhow::bail!("splitter.group_length must be > 0");
    }

    if config.embedding.endpoint.trim().is_empty() {
        anyhow::bail!("embedding.endpoint must not be empty");
    }
    if config.embedding.dimensions == 0 {
        anyhow::bail!("embedding.dimensions must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    // The batching margin eats 30 tokens per request.
    if config.embedding.max_tokens <= 30 {
        anyhow::bail!("embedding.max_tokens must be > 30");
    }

    if config.vector_store.url.trim().is_empty() {
        anyhow::bail!("vector_store.url must not be empty");
    }
    if config.vector_store.indexing_batch_size == 0 {
        anyhow::bail!("vector_store.indexing_batch_size must be > 0");
    }
    if config.vector_store.topk == 0 {
        anyhow::bail!("vector_store.topk must be > 0");
    }

    if config.completion.endpoint.trim().is_empty() {
        anyhow::bail!("completion.endpoint must not be empty");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const MINIMAL: &str = r#"
[log]
path = "/tmp/docchat.sqlite"

[source]
api_url = "https://api.example.org/v1"
converter_url = "https://api.example.org/v1/search/converter/json"

[embedding]
endpoint = "https://api.openai.com/v1/embeddings"
model = "text-embedding-3-small"
dimensions = 1536

[vector_store]
url = "http://localhost:9200"

[completion]
endpoint = "https://api.openai.com/v1/chat/completions"
model = "gpt-4o-mini"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let file = write_config(MINIMAL);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.source.plugin_id, "river");
        assert_eq!(config.source.cache_lifetime_secs, 300);
        assert!(config.source.cache_enabled);
        assert_eq!(config.splitter.plugin_id, "sentence");
        assert_eq!(config.splitter.group_length, 2);
        assert_eq!(config.splitter.overlap, 1);
        assert_eq!(config.embedding.plugin_id, "openai");
        assert_eq!(config.embedding.batch_size, 16);
        assert_eq!(config.embedding.max_tokens, 256);
        assert_eq!(config.vector_store.indexing_batch_size, 10);
        assert_eq!(config.vector_store.topk, 5);
        assert_eq!(config.completion.max_tokens, 512);
        assert!(config.pipeline.rerank);
        assert_eq!(
            config.extractor.plugins.get("application/pdf").unwrap(),
            "pdf-extract"
        );
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        let file = write_config(&MINIMAL.replace("dimensions = 1536", "dimensions = 0"));
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("dimensions"));
    }

    #[test]
    fn test_small_max_tokens_rejected() {
        let content =
            MINIMAL.replace("dimensions = 1536", "dimensions = 1536\nmax_tokens = 20");
        let file = write_config(&content);
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("max_tokens"));
    }

    #[test]
    fn test_missing_section_rejected() {
        let file = write_config("[log]\npath = \"/tmp/db.sqlite\"\n");
        assert!(load_config(file.path()).is_err());
    }
}
