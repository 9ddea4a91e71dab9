//! Hybrid retrieval: vector seeds expanded through the forum graph

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{
    Config, DEFAULT_K_GRAPH, DEFAULT_K_VECTOR, DEFAULT_MAX_HOPS,
};
use crate::embedding::EmbedBackend;
use crate::graph::{GraphBackend, Neighbor, TraversalOpts, EXPANSION_EDGE_TYPES};
use crate::vector::{VectorBackend, VectorHit};
use crate::{Error, Result};

/// Per-query knobs, defaulting to the configured retrieval shape
#[derive(Debug, Clone)]
pub struct QueryOpts {
    /// Seed count from the vector index
    pub k_vector: usize,
    /// Cap on additional posts admitted from graph expansion
    pub k_graph: usize,
    /// Expansion radius around each seed
    pub max_hops: usize,
}

impl Default for QueryOpts {
    fn default() -> Self {
        Self {
            k_vector: DEFAULT_K_VECTOR,
            k_graph: DEFAULT_K_GRAPH,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

impl QueryOpts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            k_vector: config.k_vector,
            k_graph: config.k_graph,
            max_hops: config.max_hops,
        }
    }
}

/// How a result entered the candidate set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalSource {
    Vector,
    Graph,
}

impl fmt::Display for RetrievalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalSource::Vector => write!(f, "vector"),
            RetrievalSource::Graph => write!(f, "graph"),
        }
    }
}

/// One ranked result with its provenance
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedPost {
    pub post_id: String,
    pub content: String,
    pub score: f32,
    pub source: RetrievalSource,
    pub hop_distance: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_post_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Ranked results plus a flag set when some seed expansions were lost
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub results: Vec<RetrievedPost>,
    pub partial: bool,
}

impl QueryResponse {
    fn empty() -> Self {
        Self {
            results: Vec::new(),
            partial: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    score: f32,
    source: RetrievalSource,
    hop_distance: usize,
    anchor_post_id: Option<String>,
}

struct Expansion {
    seed_id: String,
    seed_score: f32,
    neighbors: Vec<Neighbor>,
}

/// Retrieval facade over the embedding, graph, and vector backends
pub struct HybridRetriever {
    embedder: EmbedBackend,
    graph: GraphBackend,
    vector: VectorBackend,
    decay: f32,
    min_confidence: f32,
    max_visited: usize,
    result_cap: usize,
    store_timeout: Duration,
    provider_timeout: Duration,
}

impl HybridRetriever {
    pub fn new(
        embedder: EmbedBackend,
        graph: GraphBackend,
        vector: VectorBackend,
        config: &Config,
    ) -> Self {
        Self {
            embedder,
            graph,
            vector,
            decay: config.decay,
            min_confidence: config.min_confidence,
            max_visited: config.max_visited,
            result_cap: config.result_cap,
            store_timeout: config.store_timeout(),
            provider_timeout: config.provider_timeout(),
        }
    }

    /// Embed the query, collect vector seeds, expand each seed through the
    /// graph, and fuse both candidate sets into one ranked list.
    pub async fn query(&self, text: &str, opts: &QueryOpts) -> Result<QueryResponse> {
        if opts.k_vector == 0 {
            return Ok(QueryResponse::empty());
        }

        let embedding = with_timeout(
            "embed_query",
            self.provider_timeout,
            self.embedder.embed(text),
        )
        .await?;

        let seeds = with_timeout(
            "vector_query",
            self.store_timeout,
            self.vector.query(embedding, opts.k_vector, true),
        )
        .await?;

        if seeds.is_empty() {
            return Ok(QueryResponse::empty());
        }

        debug!(seeds = seeds.len(), "vector seeds collected");

        let (expansions, partial) = if opts.max_hops > 0 && opts.k_graph > 0 {
            self.expand_seeds(&seeds, opts.max_hops).await
        } else {
            (Vec::new(), false)
        };

        let candidates = fuse(&seeds, &expansions, self.decay, opts.k_graph);

        let mut ids: Vec<String> = candidates.keys().cloned().collect();
        ids.sort();

        let posts = with_timeout(
            "fetch_posts",
            self.store_timeout,
            self.graph.fetch_posts(&ids),
        )
        .await?;

        let mut results: Vec<RetrievedPost> = candidates
            .into_iter()
            .filter_map(|(post_id, candidate)| match posts.get(&post_id) {
                Some(post) => Some(RetrievedPost {
                    post_id,
                    content: post.text.clone(),
                    score: candidate.score,
                    source: candidate.source,
                    hop_distance: candidate.hop_distance,
                    anchor_post_id: candidate.anchor_post_id,
                    timestamp: post.timestamp,
                }),
                None => {
                    debug!(post_id = %post_id, "candidate has no live node, dropped");
                    None
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(b.timestamp.cmp(&a.timestamp))
                .then(a.post_id.cmp(&b.post_id))
        });
        results.truncate(self.result_cap);

        Ok(QueryResponse { results, partial })
    }

    /// Run every seed expansion concurrently; a lost expansion drops that
    /// seed's graph contribution and marks the response partial.
    async fn expand_seeds(&self, seeds: &[VectorHit], max_hops: usize) -> (Vec<Expansion>, bool) {
        let traversal = TraversalOpts {
            max_hops,
            min_confidence: self.min_confidence,
            max_visited: self.max_visited,
            include_unverified: false,
        };

        let futures: Vec<_> = seeds
            .iter()
            .map(|seed| {
                let graph = self.graph.clone();
                let seed_id = seed.post_id.clone();
                let seed_score = seed.score;
                let opts = traversal.clone();
                let timeout = self.store_timeout;
                async move {
                    let outcome = tokio::time::timeout(
                        timeout,
                        graph.neighbors(&seed_id, EXPANSION_EDGE_TYPES, &opts),
                    )
                    .await;
                    (seed_id, seed_score, outcome)
                }
            })
            .collect();

        let mut expansions = Vec::with_capacity(seeds.len());
        let mut partial = false;

        for (seed_id, seed_score, outcome) in futures::future::join_all(futures).await {
            match outcome {
                Ok(Ok(neighbors)) => expansions.push(Expansion {
                    seed_id,
                    seed_score,
                    neighbors,
                }),
                Ok(Err(e)) => {
                    warn!(seed = %seed_id, error = %e, "seed expansion failed, result marked partial");
                    partial = true;
                }
                Err(_) => {
                    warn!(seed = %seed_id, timeout_ms = self.store_timeout.as_millis() as u64,
                        "seed expansion timed out, result marked partial");
                    partial = true;
                }
            }
        }

        (expansions, partial)
    }
}

/// Merge seeds and graph expansions into one candidate map.
///
/// Seeds enter with their raw similarity. Graph paths score
/// `seed_similarity * decay^hop_distance`; a post reachable over several
/// paths keeps the highest composite and that path's provenance. At most
/// `k_graph` posts beyond the seed set are admitted, preferring shorter
/// hops and then stronger edges.
fn fuse(
    seeds: &[VectorHit],
    expansions: &[Expansion],
    decay: f32,
    k_graph: usize,
) -> HashMap<String, Candidate> {
    let mut candidates: HashMap<String, Candidate> = HashMap::new();

    for seed in seeds {
        match candidates.entry(seed.post_id.clone()) {
            Entry::Occupied(mut entry) => {
                if seed.score > entry.get().score {
                    entry.get_mut().score = seed.score;
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Candidate {
                    score: seed.score,
                    source: RetrievalSource::Vector,
                    hop_distance: 0,
                    anchor_post_id: None,
                });
            }
        }
    }

    let seed_ids: HashSet<&str> = seeds.iter().map(|s| s.post_id.as_str()).collect();

    // Admission order across all seeds: hop ascending, confidence
    // descending, then ids for a stable outcome.
    let mut paths: Vec<(usize, f32, &str, usize)> = Vec::new();
    for (idx, expansion) in expansions.iter().enumerate() {
        for neighbor in &expansion.neighbors {
            paths.push((
                neighbor.hop_distance,
                neighbor.confidence,
                neighbor.post_id.as_str(),
                idx,
            ));
        }
    }
    paths.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then(b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal))
            .then(a.2.cmp(b.2))
            .then(a.3.cmp(&b.3))
    });

    let mut admitted: HashSet<&str> = HashSet::new();

    for (hop, _confidence, post_id, idx) in paths {
        if !seed_ids.contains(post_id) && !admitted.contains(post_id) {
            if admitted.len() >= k_graph {
                continue;
            }
            admitted.insert(post_id);
        }

        let expansion = &expansions[idx];
        let composite = expansion.seed_score * decay.powi(hop as i32);

        match candidates.entry(post_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if composite > entry.get().score {
                    entry.insert(Candidate {
                        score: composite,
                        source: RetrievalSource::Graph,
                        hop_distance: hop,
                        anchor_post_id: Some(expansion.seed_id.clone()),
                    });
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Candidate {
                    score: composite,
                    source: RetrievalSource::Graph,
                    hop_distance: hop,
                    anchor_post_id: Some(expansion.seed_id.clone()),
                });
            }
        }
    }

    candidates
}

async fn with_timeout<T, F>(operation: &str, duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation, duration)),
    }
}
