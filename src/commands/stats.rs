//! Inspect node and point counts across both stores

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::graph::{GraphBackend, GraphStats};
use crate::vector::{CollectionStats, VectorBackend};

/// Combined counters from the graph store and the vector index
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub graph: GraphStats,
    pub vector: CollectionStats,
}

pub async fn run(config: &Config) -> Result<StoreStats> {
    let graph = GraphBackend::from_config(config).await?;
    let vector = VectorBackend::from_config(config)?;

    Ok(StoreStats {
        graph: graph.stats().await?,
        vector: vector.stats().await?,
    })
}

/// Formatted table for terminal output
pub fn print_stats(stats: &StoreStats) {
    println!("Graph store");
    println!("  posts:           {}", stats.graph.post_count);
    println!("  authors:         {}", stats.graph.author_count);
    println!("  entities:        {}", stats.graph.entity_count);
    println!("  versions:        {}", stats.graph.version_count);
    println!("  relations:       {}", stats.graph.relation_count);
    println!("  pending replies: {}", stats.graph.pending_reply_count);
    println!("Vector index");
    println!("  points:          {}", stats.vector.points_count);
    println!("  dimension:       {}", stats.vector.dimension);
}
