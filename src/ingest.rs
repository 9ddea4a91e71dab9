//! Batch ingestion: normalize, embed, extract, and store forum records

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embedding::EmbedBackend;
use crate::extractor::{sanitize_triples, ExtractBackend};
use crate::graph::{GraphBackend, UpsertOutcome};
use crate::record::{normalize_record, Author, Post, RawRecord};
use crate::vector::VectorBackend;
use crate::{Error, Result};

/// Store writes in flight at once; same-id records still serialize
const INGEST_PARALLELISM: usize = 8;

/// Counters for one ingestion batch
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    /// Posts stored for the first time
    pub ingested: usize,
    /// Posts whose content hash matched the stored version
    pub unchanged: usize,
    /// Posts whose content changed, extending their version chain
    pub new_versions: usize,
    /// Records rejected at normalization
    pub skipped: usize,
    /// Records lost to errors that survived retrying
    pub failed: usize,
    /// Reply links parked because the parent is not ingested yet
    pub deferred_replies: usize,
    pub triples_accepted: usize,
    pub triples_discarded: usize,
}

impl fmt::Display for IngestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ingested, {} unchanged, {} new versions, {} skipped, {} failed, \
             {} deferred replies, {} triples ({} discarded)",
            self.ingested,
            self.unchanged,
            self.new_versions,
            self.skipped,
            self.failed,
            self.deferred_replies,
            self.triples_accepted,
            self.triples_discarded,
        )
    }
}

struct ProcessedPost {
    outcome: UpsertOutcome,
    triples_accepted: usize,
    triples_discarded: usize,
}

/// Orchestrates the full path from raw records to graph and vector stores
pub struct IngestPipeline {
    embedder: EmbedBackend,
    extractor: ExtractBackend,
    graph: GraphBackend,
    vector: VectorBackend,
    accept_threshold: f32,
    embed_batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
    store_timeout: Duration,
    provider_timeout: Duration,
    /// Serializes version bookkeeping per post id
    id_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IngestPipeline {
    pub fn new(
        embedder: EmbedBackend,
        extractor: ExtractBackend,
        graph: GraphBackend,
        vector: VectorBackend,
        config: &Config,
    ) -> Self {
        Self {
            embedder,
            extractor,
            graph,
            vector,
            accept_threshold: config.accept_threshold,
            embed_batch_size: config.embed_batch_size,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            store_timeout: config.store_timeout(),
            provider_timeout: config.provider_timeout(),
            id_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Ingest one batch of raw records. A bad record never aborts the
    /// batch; the summary reports what happened to each.
    pub async fn build(&self, records: Vec<RawRecord>) -> Result<IngestSummary> {
        let total = records.len();
        let mut summary = IngestSummary::default();

        let mut posts: Vec<Post> = Vec::with_capacity(records.len());
        for record in records {
            match normalize_record(&record) {
                Ok(post) => posts.push(post),
                Err(e) => {
                    warn!(record_id = %record.id, error = %e, "skipping malformed record");
                    summary.skipped += 1;
                }
            }
        }

        let embedded = self.embed_posts(posts, &mut summary).await;

        let outcomes: Vec<(Post, Result<ProcessedPost>)> =
            stream::iter(embedded.into_iter().map(|(post, embedding)| async move {
                let result = self.process_post(&post, embedding).await;
                (post, result)
            }))
            .buffer_unordered(INGEST_PARALLELISM)
            .collect()
            .await;

        let mut written: Vec<Post> = Vec::new();
        for (post, result) in outcomes {
            match result {
                Ok(processed) => {
                    summary.triples_accepted += processed.triples_accepted;
                    summary.triples_discarded += processed.triples_discarded;
                    match processed.outcome {
                        UpsertOutcome::Created => {
                            summary.ingested += 1;
                            written.push(post);
                        }
                        UpsertOutcome::NewVersion { .. } => {
                            summary.new_versions += 1;
                            written.push(post);
                        }
                        UpsertOutcome::Unchanged => summary.unchanged += 1,
                    }
                }
                Err(e) => {
                    warn!(post_id = %post.id, error = %e, "record failed after retries");
                    summary.failed += 1;
                }
            }
        }

        // Reply linking runs once every post of the batch is in place, so
        // in-batch parents resolve regardless of record order.
        written.sort_by(|a, b| a.id.cmp(&b.id));
        for post in &written {
            if let Some(parent_id) = &post.parent_id {
                match self
                    .with_retry("link_reply", self.store_timeout, || {
                        self.graph.link_reply(&post.id, parent_id)
                    })
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(post_id = %post.id, parent_id = %parent_id, "parent missing, reply link parked");
                        summary.deferred_replies += 1;
                    }
                    Err(e) => {
                        warn!(post_id = %post.id, error = %e, "reply link failed");
                    }
                }
            }
        }

        match self
            .with_retry("resolve_pending", self.store_timeout, || {
                self.graph.resolve_pending()
            })
            .await
        {
            Ok(resolved) if resolved > 0 => {
                info!(resolved, "linked parked replies whose parents have arrived");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "pending reply resolution failed"),
        }

        info!(
            total,
            ingested = summary.ingested,
            unchanged = summary.unchanged,
            new_versions = summary.new_versions,
            skipped = summary.skipped,
            failed = summary.failed,
            deferred = summary.deferred_replies,
            "batch complete"
        );

        Ok(summary)
    }

    /// Embed normalized posts in provider-sized batches. A batch that
    /// fails after retries takes its posts out of the run as failed.
    async fn embed_posts(
        &self,
        posts: Vec<Post>,
        summary: &mut IngestSummary,
    ) -> Vec<(Post, Vec<f32>)> {
        let mut embedded = Vec::with_capacity(posts.len());

        for chunk in posts.chunks(self.embed_batch_size) {
            let texts: Vec<String> = chunk.iter().map(|p| p.text.clone()).collect();
            match self
                .with_retry("embed_batch", self.provider_timeout, || {
                    self.embedder.embed_batch(&texts)
                })
                .await
            {
                Ok(vectors) => {
                    for (post, vector) in chunk.iter().cloned().zip(vectors) {
                        embedded.push((post, vector));
                    }
                }
                Err(e) => {
                    warn!(batch = chunk.len(), error = %e, "embedding batch failed");
                    summary.failed += chunk.len();
                }
            }
        }

        embedded
    }

    async fn process_post(&self, post: &Post, embedding: Vec<f32>) -> Result<ProcessedPost> {
        let lock = self.id_lock(&post.id).await;
        let _guard = lock.lock().await;

        let outcome = self
            .with_retry("upsert_post", self.store_timeout, || {
                self.graph.upsert_post(post)
            })
            .await?;

        let version = match outcome {
            UpsertOutcome::Unchanged => {
                debug!(post_id = %post.id, "content hash unchanged");
                return Ok(ProcessedPost {
                    outcome,
                    triples_accepted: 0,
                    triples_discarded: 0,
                });
            }
            UpsertOutcome::Created => 1,
            UpsertOutcome::NewVersion { previous } => {
                self.with_retry("mark_stale", self.store_timeout, || {
                    self.vector.mark_stale(&post.id, previous)
                })
                .await?;
                previous + 1
            }
        };

        if let Some(author_id) = post.author_id() {
            let author = Author {
                id: author_id.to_string(),
                name: post.author.clone(),
            };
            self.with_retry("upsert_author", self.store_timeout, || {
                self.graph.upsert_author(&post.id, &author)
            })
            .await?;
        }

        let raw_triples = self
            .with_retry("extract", self.provider_timeout, || {
                self.extractor.extract(&post.text)
            })
            .await?;
        let (triples, discarded) = sanitize_triples(raw_triples);

        if !triples.is_empty() {
            self.with_retry("upsert_triples", self.store_timeout, || {
                self.graph
                    .upsert_triples(&post.id, &triples, self.accept_threshold)
            })
            .await?;
        }

        self.with_retry("vector_upsert", self.store_timeout, || {
            self.vector.upsert(post, version, embedding.clone())
        })
        .await?;

        debug!(post_id = %post.id, version, triples = triples.len(), "post stored");

        Ok(ProcessedPost {
            outcome,
            triples_accepted: triples.len(),
            triples_discarded: discarded,
        })
    }

    async fn id_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.id_locks.lock().await;
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Run a fallible call under a deadline, retrying transient failures
    /// with exponential backoff and jitter.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        timeout: Duration,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(operation, timeout)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let backoff = self.retry_backoff * 2u32.saturating_pow(attempt);
                    let jitter_ceiling = (self.retry_backoff.as_millis() as u64 / 2).max(1);
                    let jitter =
                        Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ceiling));
                    attempt += 1;
                    warn!(
                        operation,
                        attempt,
                        backoff_ms = (backoff + jitter).as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(backoff + jitter).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
