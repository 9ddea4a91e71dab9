//! Configuration for stores, providers, and retrieval tuning
//!
//! Loads configuration from config.yml file

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::{Error, Result};

/// Default constants (fallback if config.yml not found)
pub const DEFAULT_NEO4J_URI: &str = "bolt://localhost:7687";
pub const DEFAULT_NEO4J_USER: &str = "neo4j";
pub const DEFAULT_QDRANT_URL: &str = "http://localhost:6333";
pub const DEFAULT_COLLECTION: &str = "forum_posts";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_DIMENSION: usize = 1536;
pub const DEFAULT_EMBED_BATCH_SIZE: usize = 100;
pub const DEFAULT_DECAY: f32 = 0.8;
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_ACCEPT_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MAX_VISITED: usize = 1000;
pub const DEFAULT_RESULT_CAP: usize = 20;
pub const DEFAULT_K_VECTOR: usize = 5;
pub const DEFAULT_K_GRAPH: usize = 10;
pub const DEFAULT_MAX_HOPS: usize = 2;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;

/// Which embedding implementation to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackendKind {
    OpenAi,
    Local,
}

/// Which extractor implementation to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorBackendKind {
    Http,
    Heuristic,
}

/// Which store implementations to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackendKind {
    Remote,
    Memory,
}

/// YAML config structures
#[derive(Debug, Deserialize)]
struct YamlConfig {
    neo4j: Option<Neo4jSection>,
    qdrant: Option<QdrantSection>,
    embedding: Option<EmbeddingSection>,
    extractor: Option<ExtractorSection>,
    retrieval: Option<RetrievalSection>,
    runtime: Option<RuntimeSection>,
}

#[derive(Debug, Default, Deserialize)]
struct Neo4jSection {
    uri: Option<String>,
    user: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct QdrantSection {
    url: Option<String>,
    collection: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EmbeddingSection {
    backend: Option<String>,
    model: Option<String>,
    dimension: Option<usize>,
    batch_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ExtractorSection {
    backend: Option<String>,
    endpoint: Option<String>,
    accept_threshold: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrievalSection {
    decay: Option<f32>,
    min_confidence: Option<f32>,
    max_visited: Option<usize>,
    result_cap: Option<usize>,
    k_vector: Option<usize>,
    k_graph: Option<usize>,
    max_hops: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimeSection {
    store_backend: Option<String>,
    store_timeout_ms: Option<u64>,
    provider_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct Config {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub qdrant_url: String,
    pub collection: String,
    pub embedding_backend: EmbeddingBackendKind,
    pub embedding_model: String,
    pub dimension: usize,
    pub embed_batch_size: usize,
    pub extractor_backend: ExtractorBackendKind,
    pub extractor_endpoint: String,
    pub accept_threshold: f32,
    pub store_backend: StoreBackendKind,
    pub decay: f32,
    pub min_confidence: f32,
    pub max_visited: usize,
    pub result_cap: usize,
    pub k_vector: usize,
    pub k_graph: usize,
    pub max_hops: usize,
    pub store_timeout_ms: u64,
    pub provider_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Load configuration from config.yml or use defaults
    /// Environment variables take precedence over config.yml values
    pub fn new() -> Self {
        Self::load_from_file("config.yml")
            .or_else(|_| Self::load_from_file("../config.yml"))
            .unwrap_or_else(|_| Self::defaults())
    }

    /// Resolve a value: prefer env var if config value looks like ${VAR}
    fn resolve_env_string(value: Option<String>, env_key: &str) -> Option<String> {
        if let Some(ref v) = value {
            if v.starts_with("${") && v.ends_with('}') {
                let var_name = &v[2..v.len() - 1];
                if let Ok(env_val) = std::env::var(var_name) {
                    return Some(env_val);
                }
                // Placeholder with no matching variable resolves to nothing
                return std::env::var(env_key).ok();
            }
        }
        if let Ok(env_val) = std::env::var(env_key) {
            return Some(env_val);
        }
        value
    }

    /// Load .env file into environment variables using dotenvy
    fn load_dotenv() {
        // Try to load from current directory first, then parent
        if dotenvy::dotenv().is_err() {
            let _ = dotenvy::from_filename("../.env");
        }
    }

    fn parse_embedding_backend(value: Option<String>) -> Result<EmbeddingBackendKind> {
        match value.as_deref() {
            None | Some("openai") => Ok(EmbeddingBackendKind::OpenAi),
            Some("local") => Ok(EmbeddingBackendKind::Local),
            Some(other) => Err(Error::ConfigError(format!(
                "unknown embedding backend: {}",
                other
            ))),
        }
    }

    fn parse_extractor_backend(value: Option<String>) -> Result<ExtractorBackendKind> {
        match value.as_deref() {
            None | Some("heuristic") => Ok(ExtractorBackendKind::Heuristic),
            Some("http") => Ok(ExtractorBackendKind::Http),
            Some(other) => Err(Error::ConfigError(format!(
                "unknown extractor backend: {}",
                other
            ))),
        }
    }

    fn parse_store_backend(value: Option<String>) -> Result<StoreBackendKind> {
        match value.as_deref() {
            None | Some("remote") => Ok(StoreBackendKind::Remote),
            Some("memory") => Ok(StoreBackendKind::Memory),
            Some(other) => Err(Error::ConfigError(format!(
                "unknown store backend: {}",
                other
            ))),
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        // Load .env file first
        Self::load_dotenv();

        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::ConfigError(format!("Failed to read config file: {}", e)))?;

        let yaml: YamlConfig = serde_yaml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config file: {}", e)))?;

        let neo4j = yaml.neo4j.unwrap_or_default();
        let qdrant = yaml.qdrant.unwrap_or_default();
        let embedding = yaml.embedding.unwrap_or_default();
        let extractor = yaml.extractor.unwrap_or_default();
        let retrieval = yaml.retrieval.unwrap_or_default();
        let runtime = yaml.runtime.unwrap_or_default();

        // Resolve credentials with env var precedence
        let neo4j_uri = Self::resolve_env_string(neo4j.uri, "NEO4J_URI")
            .unwrap_or_else(|| DEFAULT_NEO4J_URI.to_string());
        let neo4j_user = Self::resolve_env_string(neo4j.user, "NEO4J_USER")
            .unwrap_or_else(|| DEFAULT_NEO4J_USER.to_string());
        let neo4j_password =
            Self::resolve_env_string(neo4j.password, "NEO4J_PASSWORD").unwrap_or_default();
        let qdrant_url = Self::resolve_env_string(qdrant.url, "QDRANT_URL")
            .unwrap_or_else(|| DEFAULT_QDRANT_URL.to_string());
        let extractor_endpoint =
            Self::resolve_env_string(extractor.endpoint, "EXTRACTOR_URL").unwrap_or_default();

        let config = Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            qdrant_url,
            collection: qdrant
                .collection
                .unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
            embedding_backend: Self::parse_embedding_backend(embedding.backend)?,
            embedding_model: embedding
                .model
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            dimension: embedding.dimension.unwrap_or(DEFAULT_DIMENSION),
            embed_batch_size: embedding.batch_size.unwrap_or(DEFAULT_EMBED_BATCH_SIZE),
            extractor_backend: Self::parse_extractor_backend(extractor.backend)?,
            extractor_endpoint,
            accept_threshold: extractor
                .accept_threshold
                .unwrap_or(DEFAULT_ACCEPT_THRESHOLD),
            store_backend: Self::parse_store_backend(runtime.store_backend)?,
            decay: retrieval.decay.unwrap_or(DEFAULT_DECAY),
            min_confidence: retrieval.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
            max_visited: retrieval.max_visited.unwrap_or(DEFAULT_MAX_VISITED),
            result_cap: retrieval.result_cap.unwrap_or(DEFAULT_RESULT_CAP),
            k_vector: retrieval.k_vector.unwrap_or(DEFAULT_K_VECTOR),
            k_graph: retrieval.k_graph.unwrap_or(DEFAULT_K_GRAPH),
            max_hops: retrieval.max_hops.unwrap_or(DEFAULT_MAX_HOPS),
            store_timeout_ms: runtime.store_timeout_ms.unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
            provider_timeout_ms: runtime
                .provider_timeout_ms
                .unwrap_or(DEFAULT_PROVIDER_TIMEOUT_MS),
            max_retries: runtime.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_backoff_ms: runtime.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
        };

        config.validate()?;
        Ok(config)
    }

    /// Create config with local defaults (fallback)
    pub fn defaults() -> Self {
        Self {
            neo4j_uri: DEFAULT_NEO4J_URI.to_string(),
            neo4j_user: DEFAULT_NEO4J_USER.to_string(),
            neo4j_password: String::new(),
            qdrant_url: DEFAULT_QDRANT_URL.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            embedding_backend: EmbeddingBackendKind::OpenAi,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimension: DEFAULT_DIMENSION,
            embed_batch_size: DEFAULT_EMBED_BATCH_SIZE,
            extractor_backend: ExtractorBackendKind::Heuristic,
            extractor_endpoint: String::new(),
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
            store_backend: StoreBackendKind::Remote,
            decay: DEFAULT_DECAY,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            max_visited: DEFAULT_MAX_VISITED,
            result_cap: DEFAULT_RESULT_CAP,
            k_vector: DEFAULT_K_VECTOR,
            k_graph: DEFAULT_K_GRAPH,
            max_hops: DEFAULT_MAX_HOPS,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            provider_timeout_ms: DEFAULT_PROVIDER_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }

    /// Reject values the retrieval algorithm cannot work with
    pub fn validate(&self) -> Result<()> {
        if !(self.decay > 0.0 && self.decay < 1.0) {
            return Err(Error::ConfigError(format!(
                "decay must be in (0, 1), got {}",
                self.decay
            )));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(Error::ConfigError(format!(
                "min_confidence must be in [0, 1], got {}",
                self.min_confidence
            )));
        }
        if !(0.0..=1.0).contains(&self.accept_threshold) {
            return Err(Error::ConfigError(format!(
                "accept_threshold must be in [0, 1], got {}",
                self.accept_threshold
            )));
        }
        if self.dimension == 0 {
            return Err(Error::ConfigError(
                "embedding dimension must be non-zero".to_string(),
            ));
        }
        if self.embed_batch_size == 0 {
            return Err(Error::ConfigError(
                "embed batch size must be non-zero".to_string(),
            ));
        }
        if self.max_visited == 0 {
            return Err(Error::ConfigError(
                "max_visited must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.store_timeout_ms)
    }

    pub fn provider_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.provider_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(value) => std::env::set_var(&self.key, value),
                None => std::env::remove_var(&self.key),
            }
        }
    }

    fn set_envs(vars: &[(&str, &str)]) -> Vec<EnvGuard> {
        vars.iter().map(|(k, v)| EnvGuard::set(k, v)).collect()
    }

    #[test]
    fn test_defaults_has_correct_values() {
        let config = Config::defaults();

        assert_eq!(config.neo4j_uri, DEFAULT_NEO4J_URI);
        assert_eq!(config.qdrant_url, DEFAULT_QDRANT_URL);
        assert_eq!(config.collection, DEFAULT_COLLECTION);
        assert_eq!(config.dimension, DEFAULT_DIMENSION);
        assert_eq!(config.decay, DEFAULT_DECAY);
        assert_eq!(config.k_vector, DEFAULT_K_VECTOR);
        assert_eq!(config.k_graph, DEFAULT_K_GRAPH);
        assert_eq!(config.max_hops, DEFAULT_MAX_HOPS);
    }

    #[test]
    fn test_defaults_pass_validation() {
        assert!(Config::defaults().validate().is_ok());
    }

    #[test]
    fn test_load_from_yaml() {
        let yaml = r#"
qdrant:
  url: "http://qdrant.internal:6333"
  collection: "course_forum"

embedding:
  backend: "local"
  dimension: 64

retrieval:
  decay: 0.7
  k_vector: 3
  max_hops: 1
"#;
        let temp_file = std::env::temp_dir().join("test_graphrag_config.yml");
        std::fs::write(&temp_file, yaml).unwrap();

        let config = Config::load_from_file(&temp_file).unwrap();

        assert_eq!(config.collection, "course_forum");
        assert_eq!(config.embedding_backend, EmbeddingBackendKind::Local);
        assert_eq!(config.dimension, 64);
        assert_eq!(config.decay, 0.7);
        assert_eq!(config.k_vector, 3);
        assert_eq!(config.max_hops, 1);
        // Untouched sections keep their defaults
        assert_eq!(config.k_graph, DEFAULT_K_GRAPH);
        assert_eq!(config.result_cap, DEFAULT_RESULT_CAP);

        std::fs::remove_file(temp_file).ok();
    }

    #[test]
    fn env_placeholders_are_resolved_from_environment() {
        let _lock = ENV_LOCK.lock().unwrap();
        let yaml = r#"
neo4j:
  uri: "${NEO4J_URI}"
  password: "${NEO4J_PASSWORD}"
"#;
        let temp_file = std::env::temp_dir().join("graphrag_config_env.yml");
        std::fs::write(&temp_file, yaml).unwrap();

        let _guards = set_envs(&[
            ("NEO4J_URI", "bolt://graph.internal:7687"),
            ("NEO4J_PASSWORD", "secret_from_env"),
        ]);

        let config = Config::load_from_file(&temp_file).unwrap();

        assert_eq!(config.neo4j_uri, "bolt://graph.internal:7687");
        assert_eq!(config.neo4j_password, "secret_from_env");

        std::fs::remove_file(temp_file).ok();
    }

    #[test]
    fn explicit_yaml_strings_survive_without_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        let yaml = r#"
neo4j:
  uri: "bolt://from-yaml:7687"
"#;
        let temp_file = std::env::temp_dir().join("graphrag_config_yaml_uri.yml");
        std::fs::write(&temp_file, yaml).unwrap();

        // No NEO4J_URI in the environment for this test
        let original = std::env::var("NEO4J_URI").ok();
        std::env::remove_var("NEO4J_URI");

        let config = Config::load_from_file(&temp_file).unwrap();
        assert_eq!(config.neo4j_uri, "bolt://from-yaml:7687");

        if let Some(value) = original {
            std::env::set_var("NEO4J_URI", value);
        }
        std::fs::remove_file(temp_file).ok();
    }

    #[test]
    fn rejects_unknown_embedding_backend() {
        let yaml = r#"
embedding:
  backend: "sentencepiece"
"#;
        let temp_file = std::env::temp_dir().join("graphrag_config_bad_backend.yml");
        std::fs::write(&temp_file, yaml).unwrap();

        let result = Config::load_from_file(&temp_file);
        assert!(result.is_err());

        std::fs::remove_file(temp_file).ok();
    }

    #[test]
    fn rejects_decay_out_of_range() {
        for decay in ["0.0", "1.0", "1.5"] {
            let yaml = format!("retrieval:\n  decay: {}\n", decay);
            let temp_file = std::env::temp_dir().join(format!("graphrag_decay_{}.yml", decay));
            std::fs::write(&temp_file, yaml).unwrap();

            let result = Config::load_from_file(&temp_file);
            assert!(result.is_err(), "decay {} should be rejected", decay);

            std::fs::remove_file(temp_file).ok();
        }
    }

    #[test]
    fn rejects_zero_dimension() {
        let yaml = r#"
embedding:
  dimension: 0
"#;
        let temp_file = std::env::temp_dir().join("graphrag_config_zero_dim.yml");
        std::fs::write(&temp_file, yaml).unwrap();

        let result = Config::load_from_file(&temp_file);
        assert!(result.is_err());

        std::fs::remove_file(temp_file).ok();
    }

    #[test]
    fn parses_store_backend_memory() {
        let yaml = r#"
runtime:
  store_backend: "memory"
"#;
        let temp_file = std::env::temp_dir().join("graphrag_config_memory.yml");
        std::fs::write(&temp_file, yaml).unwrap();

        let config = Config::load_from_file(&temp_file).unwrap();
        assert_eq!(config.store_backend, StoreBackendKind::Memory);

        std::fs::remove_file(temp_file).ok();
    }

    #[test]
    fn load_from_file_fails_on_missing_file() {
        let result = Config::load_from_file("/nonexistent/path/config.yml");
        assert!(result.is_err());
    }

    #[test]
    fn load_from_file_fails_on_invalid_yaml() {
        let temp_file = std::env::temp_dir().join("graphrag_config_invalid.yml");
        std::fs::write(&temp_file, "{ invalid yaml [").unwrap();

        let result = Config::load_from_file(&temp_file);
        assert!(result.is_err());

        std::fs::remove_file(temp_file).ok();
    }

    #[test]
    fn timeout_helpers_convert_to_durations() {
        let config = Config::defaults();
        assert_eq!(
            config.store_timeout(),
            std::time::Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS)
        );
        assert_eq!(
            config.provider_timeout(),
            std::time::Duration::from_millis(DEFAULT_PROVIDER_TIMEOUT_MS)
        );
    }

    #[test]
    fn config_clone_and_debug() {
        let config = Config::defaults();
        let cloned = config.clone();

        assert_eq!(cloned.collection, config.collection);
        let debug_str = format!("{:?}", config);
        assert!(debug_str.contains("Config"));
    }
}
