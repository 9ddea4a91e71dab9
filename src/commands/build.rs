//! Ingest a JSON export of forum records into the stores

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::embedding::EmbedBackend;
use crate::extractor::ExtractBackend;
use crate::graph::GraphBackend;
use crate::ingest::{IngestPipeline, IngestSummary};
use crate::metrics;
use crate::record::RawRecord;
use crate::vector::VectorBackend;

/// Read records from `file`, connect the stores, and run the pipeline
pub async fn run(config: &Config, file: &Path, limit: Option<usize>) -> Result<IngestSummary> {
    let records = load_records(file, limit).await?;
    info!(file = %file.display(), records = records.len(), "starting ingest");

    let graph = GraphBackend::from_config(config).await?;
    graph.init_schema().await?;

    let vector = VectorBackend::from_config(config)?;
    vector.init_collection().await?;

    let embedder = EmbedBackend::from_config(config)?;
    let extractor = ExtractBackend::from_config(config)?;

    let pipeline = IngestPipeline::new(embedder, extractor, graph, vector, config);
    let summary = pipeline.build(records).await?;

    metrics::record_ingest_summary(&summary);
    if summary.failed > 0 {
        warn!(failed = summary.failed, "some records were not ingested");
    }
    Ok(summary)
}

/// Parse a JSON array of raw records, optionally truncated to the first `limit`
async fn load_records(file: &Path, limit: Option<usize>) -> Result<Vec<RawRecord>> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let mut records: Vec<RawRecord> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array of records", file.display()))?;

    if let Some(limit) = limit {
        records.truncate(limit);
    }
    Ok(records)
}
