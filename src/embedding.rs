//! Embedding generation: OpenAI service or deterministic local fallback

use async_openai::{
    config::OpenAIConfig,
    types::{CreateEmbeddingRequestArgs, EmbeddingInput},
    Client as OpenAIClient,
};
use tracing::{debug, info, warn};

use crate::config::{Config, EmbeddingBackendKind};
use crate::{Error, Result};

/// Longest text sent to the embeddings API, in bytes
const MAX_EMBED_CHARS: usize = 8000;

/// Service for generating text embeddings via the OpenAI API
#[derive(Clone)]
pub struct EmbeddingService {
    client: OpenAIClient<OpenAIConfig>,
    model: String,
    dimension: usize,
}

impl EmbeddingService {
    /// Create a new embedding service; requires OPENAI_API_KEY
    pub fn new(model: impl Into<String>, dimension: usize) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::ConfigError("OPENAI_API_KEY not set".to_string()))?;

        let config = OpenAIConfig::new().with_api_key(api_key);
        let client = OpenAIClient::with_config(config);

        Ok(Self {
            client,
            model: model.into(),
            dimension,
        })
    }

    /// Generate embedding for a single text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::ProviderUnavailable("no embedding returned".to_string()))
    }

    /// Generate embeddings for multiple texts in batch.
    /// Blank texts map to zero vectors; positions stay aligned with input.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let processed: Vec<String> = texts
            .iter()
            .map(|t| truncate_chars(t.trim(), MAX_EMBED_CHARS).to_string())
            .filter(|t| !t.is_empty())
            .collect();

        if processed.is_empty() {
            return Ok(vec![vec![0.0; self.dimension]; texts.len()]);
        }

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::StringArray(processed))
            .build()
            .map_err(|e| Error::ProviderUnavailable(e.to_string()))?;

        let response = self.client.embeddings().create(request).await?;

        info!(
            "Generated {} embeddings, tokens used: {}",
            response.data.len(),
            response.usage.total_tokens
        );

        // Map back to original indices (blank texts get zero vectors)
        let mut result = Vec::with_capacity(texts.len());
        let mut embed_iter = response.data.into_iter();

        for text in texts {
            if text.trim().is_empty() {
                result.push(vec![0.0; self.dimension]);
            } else if let Some(embed) = embed_iter.next() {
                result.push(embed.embedding);
            } else {
                return Err(Error::ProviderUnavailable(
                    "embedding count does not match input count".to_string(),
                ));
            }
        }

        Ok(result)
    }

    /// Embedding dimension this service is configured for
    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic hash-bucket embedder for offline and test use
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dim: usize,
}

impl LocalEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut vec = vec![0.0f32; self.dim];
        for token in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            let idx = (hasher.finish() as usize) % self.dim;
            vec[idx] += 1.0;
        }

        l2_normalize(&mut vec);
        vec
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }
}

/// Embedding backend selected at construction time
#[derive(Clone)]
pub enum EmbedBackend {
    OpenAi(EmbeddingService),
    Local(LocalEmbedder),
}

impl EmbedBackend {
    /// Build the backend named by the configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.embedding_backend {
            EmbeddingBackendKind::OpenAi => {
                let service = EmbeddingService::new(&config.embedding_model, config.dimension)?;
                info!(model = %config.embedding_model, "using OpenAI embeddings");
                Ok(EmbedBackend::OpenAi(service))
            }
            EmbeddingBackendKind::Local => {
                warn!("using local hash embeddings; retrieval quality is reduced");
                Ok(EmbedBackend::Local(LocalEmbedder::new(config.dimension)))
            }
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match self {
            EmbedBackend::OpenAi(service) => service.embed(text).await,
            EmbedBackend::Local(local) => Ok(local.embed(text)),
        }
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match self {
            EmbedBackend::OpenAi(service) => service.embed_batch(texts).await,
            EmbedBackend::Local(local) => Ok(texts.iter().map(|t| local.embed(t)).collect()),
        }
    }

    pub fn dimension(&self) -> usize {
        match self {
            EmbedBackend::OpenAi(service) => service.dimension(),
            EmbedBackend::Local(local) => local.dimension(),
        }
    }
}

/// Cosine similarity; mismatched or zero-magnitude vectors score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;

    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Scale to unit length in place; zero vectors stay zero
pub fn l2_normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

/// Truncate on a char boundary at or below `max_bytes`
fn truncate_chars(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OpenAiKeyGuard {
        original: Option<String>,
    }

    impl OpenAiKeyGuard {
        fn set_dummy() -> Self {
            let original = std::env::var("OPENAI_API_KEY").ok();
            std::env::set_var("OPENAI_API_KEY", "test_key");
            Self { original }
        }
    }

    impl Drop for OpenAiKeyGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.original {
                std::env::set_var("OPENAI_API_KEY", value);
            } else {
                std::env::remove_var("OPENAI_API_KEY");
            }
        }
    }

    #[test]
    fn service_reports_configured_dimension() {
        let _guard = OpenAiKeyGuard::set_dummy();

        let service = EmbeddingService::new("text-embedding-3-small", 1536).unwrap();
        assert_eq!(service.dimension(), 1536);

        let small = EmbeddingService::new("text-embedding-3-small", 512).unwrap();
        assert_eq!(small.dimension(), 512);
    }

    #[tokio::test]
    async fn embed_batch_maps_blank_texts_to_zero_vectors() {
        let _guard = OpenAiKeyGuard::set_dummy();
        let service = EmbeddingService::new("text-embedding-3-small", 16).unwrap();

        let embeddings = service
            .embed_batch(&["   ".to_string(), "\n".to_string()])
            .await
            .unwrap();

        assert_eq!(embeddings.len(), 2);
        for embedding in &embeddings {
            assert_eq!(embedding.len(), 16);
            assert!(embedding.iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn local_embedder_is_deterministic() {
        let embedder = LocalEmbedder::new(64);
        let text = "Wie wird das Portfolio bewertet";

        assert_eq!(embedder.embed(text), embedder.embed(text));
        assert_eq!(embedder.embed(text).len(), 64);
    }

    #[test]
    fn local_embedder_separates_different_texts() {
        let embedder = LocalEmbedder::new(64);

        let a = embedder.embed("Portfolio Bewertung Kriterien");
        let b = embedder.embed("Mensa Essen heute");

        assert_ne!(a, b);
    }

    #[test]
    fn local_embedder_similar_texts_share_buckets() {
        let embedder = LocalEmbedder::new(64);

        let query = embedder.embed("portfolio bewertung");
        let on_topic = embedder.embed("Portfolio Bewertung und Abgabe");
        let off_topic = embedder.embed("Mensa Speiseplan Montag");

        assert!(cosine_similarity(&query, &on_topic) > cosine_similarity(&query, &off_topic));
    }

    #[test]
    fn local_embedder_blank_text_is_zero_vector() {
        let embedder = LocalEmbedder::new(32);
        let embedding = embedder.embed("   ");

        assert_eq!(embedding.len(), 32);
        assert!(embedding.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn local_embedder_respects_minimum_dimension() {
        let embedder = LocalEmbedder::new(0);
        assert_eq!(embedder.dimension(), 8);
    }

    #[tokio::test]
    async fn local_backend_batch_matches_single_calls() {
        let backend = EmbedBackend::Local(LocalEmbedder::new(32));
        let texts = vec![
            "erste Frage".to_string(),
            String::new(),
            "zweite Antwort".to_string(),
        ];

        let batch = backend.embed_batch(&texts).await.unwrap();

        assert_eq!(batch.len(), texts.len());
        for (text, expected) in texts.iter().zip(&batch) {
            let single = backend.embed(text).await.unwrap();
            assert_eq!(&single, expected);
        }
    }

    #[test]
    fn backend_from_config_local() {
        let mut config = Config::defaults();
        config.embedding_backend = EmbeddingBackendKind::Local;
        config.dimension = 48;

        let backend = EmbedBackend::from_config(&config).unwrap();
        assert_eq!(backend.dimension(), 48);
        assert!(matches!(backend, EmbedBackend::Local(_)));
    }

    #[test]
    fn cosine_similarity_handles_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);

        let aligned = cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]);
        assert!((aligned - 1.0).abs() < 1e-6);

        let orthogonal = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]);
        assert!(orthogonal.abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_scales_to_unit_length() {
        let mut vec = vec![3.0, 4.0];
        l2_normalize(&mut vec);
        let norm = (vec[0].powi(2) + vec[1].powi(2)).sqrt();

        assert!((norm - 1.0).abs() < 1e-6);
        assert!(vec[1] > vec[0]);
    }

    #[test]
    fn l2_normalize_leaves_zero_vector() {
        let mut vec = vec![0.0, 0.0, 0.0];
        l2_normalize(&mut vec);
        assert!(vec.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "Prüfungsfragen zur Bewertung";
        // Cut inside the two-byte 'ü'
        let cut = truncate_chars(text, 3);

        assert!(text.is_char_boundary(cut.len()));
        assert!(cut.len() <= 3);

        let untouched = truncate_chars("abc", 10);
        assert_eq!(untouched, "abc");
    }

    #[tokio::test]
    #[ignore] // Requires API key
    async fn test_embed_single_against_api() {
        dotenvy::dotenv().ok();
        let service = EmbeddingService::new("text-embedding-3-small", 1536).unwrap();
        let embedding = service.embed("Hallo Welt").await.unwrap();
        assert_eq!(embedding.len(), 1536);
    }
}
