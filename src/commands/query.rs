//! Run one hybrid retrieval against the stores

use std::time::Instant;

use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::embedding::EmbedBackend;
use crate::graph::GraphBackend;
use crate::metrics;
use crate::retriever::{HybridRetriever, QueryOpts, QueryResponse};
use crate::vector::VectorBackend;

/// Embed the question, retrieve seeds plus graph context, and rank
pub async fn run(config: &Config, text: &str, opts: &QueryOpts) -> Result<QueryResponse> {
    info!(
        k_vector = opts.k_vector,
        k_graph = opts.k_graph,
        max_hops = opts.max_hops,
        "running query"
    );

    let graph = GraphBackend::from_config(config).await?;
    let vector = VectorBackend::from_config(config)?;
    let embedder = EmbedBackend::from_config(config)?;
    let retriever = HybridRetriever::new(embedder, graph, vector, config);

    let start = Instant::now();
    let outcome = retriever.query(text, opts).await;
    let elapsed = start.elapsed();

    match outcome {
        Ok(response) => {
            metrics::record_query(elapsed, response.partial, true);
            info!(
                results = response.results.len(),
                partial = response.partial,
                "query finished"
            );
            Ok(response)
        }
        Err(e) => {
            metrics::record_query(elapsed, false, false);
            Err(e.into())
        }
    }
}

/// Human-readable listing of ranked results
pub fn print_results(response: &QueryResponse) {
    if response.partial {
        println!("(partial results: some graph expansions were unavailable)");
    }
    if response.results.is_empty() {
        println!("No matching posts.");
        return;
    }
    for (rank, post) in response.results.iter().enumerate() {
        let origin = match &post.anchor_post_id {
            Some(anchor) => format!(
                "{}, {} hop(s) from {}",
                post.source, post.hop_distance, anchor
            ),
            None => post.source.to_string(),
        };
        println!(
            "{:>2}. [{:.3}] {} ({})",
            rank + 1,
            post.score,
            post.post_id,
            origin
        );
        println!("    {}", preview(&post.content, 160));
    }
}

/// Single-line excerpt, cut at a character boundary
fn preview(text: &str, max_chars: usize) -> String {
    let flattened = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flattened.chars().count() <= max_chars {
        return flattened;
    }
    let cut: String = flattened.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::{EmbeddingBackendKind, StoreBackendKind};

    fn memory_config() -> Config {
        Config {
            store_backend: StoreBackendKind::Memory,
            embedding_backend: EmbeddingBackendKind::Local,
            dimension: 8,
            ..Config::defaults()
        }
    }

    #[tokio::test]
    async fn query_against_empty_stores_returns_no_results() {
        let config = memory_config();
        let opts = QueryOpts::from_config(&config);

        let response = run(&config, "Wann ist die Klausur?", &opts).await.unwrap();

        assert!(response.results.is_empty());
        assert!(!response.partial);
    }

    #[test]
    fn preview_keeps_short_text_intact() {
        assert_eq!(preview("Kurzer Satz.", 160), "Kurzer Satz.");
    }

    #[test]
    fn preview_collapses_internal_whitespace() {
        assert_eq!(preview("a\n b\t  c", 160), "a b c");
    }

    #[test]
    fn preview_cuts_on_character_boundaries() {
        let text = "äöü".repeat(100);
        let cut = preview(&text, 10);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), 13);
    }
}
