//! Hybrid GraphRAG retrieval for discussion-forum archives
//!
//! This library provides tools to:
//! - Normalize raw forum records into versioned post units
//! - Embed post content (OpenAI API or a deterministic local fallback)
//! - Extract entity and relation triples from post text
//! - Maintain a typed post/author/entity graph in Neo4j
//! - Index embeddings in Qdrant with stale-version tracking
//! - Answer queries by fusing vector similarity with graph expansion

pub mod config;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod graph;
pub mod ingest;
pub mod metrics;
pub mod record;
pub mod retriever;
pub mod vector;

// Re-export common types
pub use config::Config;
pub use error::{Error, Result};
pub use ingest::{IngestPipeline, IngestSummary};
pub use retriever::{HybridRetriever, QueryOpts, QueryResponse, RetrievedPost};

// Commands module uses re-exported types, so it must be declared after the re-exports
pub mod commands;
