//! Relation triple extraction: HTTP NLP service or heuristic fallback

use std::collections::HashSet;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{Config, ExtractorBackendKind};
use crate::{Error, Result};

/// Confidence assigned to heuristic co-occurrence triples
const HEURISTIC_CONFIDENCE: f32 = 0.6;

/// Predicate substituted when a provider returns a blank one
const DEFAULT_PREDICATE: &str = "related_to";

/// Subject-predicate-object relation extracted from post text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub confidence: f32,
}

#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    triples: Vec<Triple>,
}

/// Client for an external NLP extraction service
#[derive(Debug, Clone)]
pub struct HttpExtractor {
    http: Client,
    base_url: String,
}

impl HttpExtractor {
    pub fn new<S: Into<String>>(endpoint: S) -> Result<Self> {
        let base_url = endpoint.into();
        if base_url.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "extractor endpoint is empty".to_string(),
            ));
        }

        let http = Client::builder()
            .user_agent("forum_graphrag/0.1.0")
            .build()
            .map_err(|e| Error::InvalidArgument(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Request triples for one text from the extraction service
    pub async fn extract(&self, text: &str) -> Result<Vec<Triple>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let request = ExtractRequest { text };

        let response = self
            .http
            .post(format!("{}/extract", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::ProviderUnavailable(format!("extractor request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::ProviderUnavailable(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(Error::ProviderUnavailable(format!(
                "extractor error {}: {}",
                status, body
            )));
        }

        let parsed: ExtractResponse = serde_json::from_str(&body)
            .map_err(|e| Error::ProviderUnavailable(format!("invalid extractor response: {}", e)))?;

        debug!("Extractor returned {} triples", parsed.triples.len());
        Ok(parsed.triples)
    }
}

/// Offline extractor built on capitalization and sentence co-occurrence.
/// German text works well here since nouns are capitalized.
#[derive(Debug, Default, Clone)]
pub struct HeuristicExtractor {
    stopwords: HashSet<String>,
}

impl HeuristicExtractor {
    pub fn new() -> Self {
        let mut stopwords = HashSet::new();
        for w in [
            "und", "oder", "aber", "der", "die", "das", "den", "dem", "des", "ein", "eine",
            "einen", "einer", "ist", "sind", "wird", "werden", "wie", "was", "wer", "wann",
            "nicht", "auch", "noch", "nur", "bei", "nach", "vor", "über", "durch", "ohne",
            "als", "dass", "wenn", "dann", "schon", "sehr", "für", "mit", "von", "zum", "zur",
            "sich", "hat", "haben", "kann", "man", "siehe", "hallo", "danke", "bitte", "and",
            "or", "but", "the", "for", "with", "this", "that", "from", "are", "was", "were",
            "has", "have", "will", "can", "not", "you", "all",
        ] {
            stopwords.insert(w.to_string());
        }
        Self { stopwords }
    }

    /// Emit co-occurrence triples between neighboring candidate terms.
    /// Terms never pair across sentence boundaries.
    pub fn extract(&self, text: &str) -> Vec<Triple> {
        let mut triples = Vec::new();

        for sentence in text.split(|c| matches!(c, '.' | '!' | '?' | '\n')) {
            let mut terms = Vec::new();
            let mut seen = HashSet::new();

            for raw_token in sentence.split_whitespace() {
                let token =
                    raw_token.trim_matches(|c: char| !c.is_alphanumeric() && c != '@' && c != '#');
                if token.len() < 3 {
                    continue;
                }
                let normalized = token.to_lowercase();
                if self.stopwords.contains(&normalized) {
                    continue;
                }

                // Keep capitalized words, handles, hashtags, or tokens with digits
                let is_candidate = token
                    .chars()
                    .next()
                    .map(|c| c.is_uppercase())
                    .unwrap_or(false)
                    || token.contains('@')
                    || token.contains('#')
                    || token.chars().any(|c| c.is_numeric());

                if !is_candidate {
                    continue;
                }

                if seen.insert(normalized.clone()) {
                    terms.push(normalized);
                }
            }

            for pair in terms.windows(2) {
                if let [a, b] = pair {
                    triples.push(Triple {
                        subject: a.clone(),
                        predicate: "co_occurs".to_string(),
                        object: b.clone(),
                        confidence: HEURISTIC_CONFIDENCE,
                    });
                }
            }
        }

        triples
    }
}

/// Extraction backend selected at construction time
#[derive(Debug, Clone)]
pub enum ExtractBackend {
    Http(HttpExtractor),
    Heuristic(HeuristicExtractor),
}

impl ExtractBackend {
    /// Build the backend named by the configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.extractor_backend {
            ExtractorBackendKind::Http => {
                let client = HttpExtractor::new(&config.extractor_endpoint)?;
                info!(endpoint = %config.extractor_endpoint, "using HTTP triple extractor");
                Ok(ExtractBackend::Http(client))
            }
            ExtractorBackendKind::Heuristic => {
                Ok(ExtractBackend::Heuristic(HeuristicExtractor::new()))
            }
        }
    }

    pub async fn extract(&self, text: &str) -> Result<Vec<Triple>> {
        match self {
            ExtractBackend::Http(client) => client.extract(text).await,
            ExtractBackend::Heuristic(heuristic) => Ok(heuristic.extract(text)),
        }
    }
}

/// Lowercase and collapse runs of whitespace
pub fn normalize_surface(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalize surface forms and drop unusable triples.
/// Returns the kept triples and how many were discarded.
pub fn sanitize_triples(raw: Vec<Triple>) -> (Vec<Triple>, usize) {
    let total = raw.len();
    let mut kept = Vec::with_capacity(total);

    for triple in raw {
        let subject = normalize_surface(&triple.subject);
        let object = normalize_surface(&triple.object);
        if subject.is_empty() || object.is_empty() {
            continue;
        }

        let mut predicate = normalize_surface(&triple.predicate);
        if predicate.is_empty() {
            predicate = DEFAULT_PREDICATE.to_string();
        }

        kept.push(Triple {
            subject,
            predicate,
            object,
            confidence: triple.confidence.clamp(0.0, 1.0),
        });
    }

    let discarded = total - kept.len();
    (kept, discarded)
}
