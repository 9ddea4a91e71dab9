//! Vector index for post embeddings, backed by Qdrant or an in-memory scan

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use qdrant_client::qdrant::{
    CreateCollectionBuilder, Distance, FieldCondition, Filter, Match, PointStruct,
    PointsIdsList, SearchPointsBuilder, SetPayloadPointsBuilder, UpsertPointsBuilder,
    Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{Config, StoreBackendKind};
use crate::embedding::cosine_similarity;
use crate::record::Post;
use crate::{Error, Result};

/// Multiplier applied to the limit when part of a filter runs client-side
const OVER_QUERY_FACTOR: usize = 5;

/// Scored hit from a similarity search
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub post_id: String,
    pub version: usize,
    pub score: f32,
    pub timestamp: DateTime<Utc>,
}

/// Constraints narrowing a similarity search
#[derive(Debug, Default, Clone)]
pub struct SearchFilter {
    pub thread_id: Option<String>,
    pub author: Option<String>,
    pub only_roots: bool,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn roots_only(mut self) -> Self {
        self.only_roots = true;
        self
    }

    pub fn after(mut self, after: DateTime<Utc>) -> Self {
        self.after = Some(after);
        self
    }

    pub fn before(mut self, before: DateTime<Utc>) -> Self {
        self.before = Some(before);
        self
    }

    fn has_time_window(&self) -> bool {
        self.after.is_some() || self.before.is_some()
    }

    fn time_matches(&self, timestamp: &DateTime<Utc>) -> bool {
        if let Some(after) = &self.after {
            if timestamp < after {
                return false;
            }
        }
        if let Some(before) = &self.before {
            if timestamp > before {
                return false;
            }
        }
        true
    }
}

/// Similarity descending, then recency descending, then post id
fn rank_hits(hits: &mut [VectorHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.timestamp.cmp(&a.timestamp))
            .then(a.post_id.cmp(&b.post_id))
    });
}

/// Deterministic point id for one post version
fn point_uuid(post_id: &str, version: usize) -> Uuid {
    let digest = Sha256::digest(format!("{}@v{}", post_id, version).as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

fn match_condition(key: &str, value: qdrant_client::qdrant::r#match::MatchValue) -> FieldCondition {
    FieldCondition {
        key: key.to_string(),
        r#match: Some(Match {
            match_value: Some(value),
        }),
        ..Default::default()
    }
}

/// Vector store backed by Qdrant
#[derive(Clone)]
pub struct QdrantVector {
    client: Arc<Qdrant>,
    collection: String,
    dimension: usize,
}

impl QdrantVector {
    /// Connect to Qdrant server
    pub fn new(url: &str, collection: impl Into<String>, dimension: usize) -> Result<Self> {
        let client = Qdrant::from_url(url).build()?;

        Ok(Self {
            client: Arc::new(client),
            collection: collection.into(),
            dimension,
        })
    }

    /// Initialize the collection if it doesn't exist
    pub async fn init_collection(&self) -> Result<()> {
        let collections = self.client.list_collections().await?;

        let exists = collections
            .collections
            .iter()
            .any(|c| c.name == self.collection);

        if !exists {
            info!("Creating collection '{}'", self.collection);

            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection).vectors_config(
                        VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
                    ),
                )
                .await?;

            info!("Collection created successfully");
        } else {
            debug!("Collection '{}' already exists", self.collection);
        }

        Ok(())
    }

    /// Store the embedding for one post version
    pub async fn upsert(&self, post: &Post, version: usize, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::InvalidArgument(format!(
                "embedding dimension {} does not match collection dimension {}",
                vector.len(),
                self.dimension
            )));
        }

        let mut payload: HashMap<String, QdrantValue> = HashMap::new();
        payload.insert("post_id".into(), post.id.clone().into());
        payload.insert("version".into(), (version as i64).into());
        payload.insert("timestamp".into(), post.timestamp.to_rfc3339().into());
        payload.insert("author".into(), post.author.clone().into());
        if let Some(thread_id) = &post.thread_id {
            payload.insert("thread_id".into(), thread_id.clone().into());
        }
        payload.insert("is_thread_root".into(), post.is_thread_root.into());
        payload.insert("stale".into(), false.into());

        let point = PointStruct::new(
            point_uuid(&post.id, version).to_string(),
            vector,
            payload,
        );

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]))
            .await?;

        debug!("Upserted embedding for {} v{}", post.id, version);
        Ok(())
    }

    /// Flag a superseded version so default searches skip it
    pub async fn mark_stale(&self, post_id: &str, version: usize) -> Result<()> {
        let mut payload: HashMap<String, QdrantValue> = HashMap::new();
        payload.insert("stale".into(), true.into());

        self.client
            .set_payload(
                SetPayloadPointsBuilder::new(&self.collection, payload).points_selector(
                    PointsIdsList {
                        ids: vec![point_uuid(post_id, version).to_string().into()],
                    },
                ),
            )
            .await?;

        debug!("Marked {} v{} stale", post_id, version);
        Ok(())
    }

    /// Top-k similarity search
    pub async fn query(&self, vector: Vec<f32>, k: usize, exclude_stale: bool) -> Result<Vec<VectorHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut builder =
            SearchPointsBuilder::new(&self.collection, vector, k as u64).with_payload(true);

        if exclude_stale {
            builder = builder.filter(Filter {
                must_not: vec![match_condition(
                    "stale",
                    qdrant_client::qdrant::r#match::MatchValue::Boolean(true),
                )
                .into()],
                ..Default::default()
            });
        }

        let results = self.client.search_points(builder).await?;
        let mut hits = decode_hits(results.result);
        rank_hits(&mut hits);
        Ok(hits)
    }

    /// Similarity search narrowed by metadata.
    /// Time-window constraints run client-side over an over-queried candidate set.
    pub async fn query_filtered(
        &self,
        vector: Vec<f32>,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let limit = if filter.has_time_window() {
            k * OVER_QUERY_FACTOR
        } else {
            k
        };

        let mut conditions = vec![];
        if let Some(thread_id) = &filter.thread_id {
            conditions.push(
                match_condition(
                    "thread_id",
                    qdrant_client::qdrant::r#match::MatchValue::Keyword(thread_id.clone()),
                )
                .into(),
            );
        }
        if let Some(author) = &filter.author {
            conditions.push(
                match_condition(
                    "author",
                    qdrant_client::qdrant::r#match::MatchValue::Keyword(author.clone()),
                )
                .into(),
            );
        }
        if filter.only_roots {
            conditions.push(
                match_condition(
                    "is_thread_root",
                    qdrant_client::qdrant::r#match::MatchValue::Boolean(true),
                )
                .into(),
            );
        }

        let qdrant_filter = Filter {
            must: conditions,
            must_not: vec![match_condition(
                "stale",
                qdrant_client::qdrant::r#match::MatchValue::Boolean(true),
            )
            .into()],
            ..Default::default()
        };

        let builder = SearchPointsBuilder::new(&self.collection, vector, limit as u64)
            .with_payload(true)
            .filter(qdrant_filter);

        let results = self.client.search_points(builder).await?;

        let mut hits: Vec<VectorHit> = decode_hits(results.result)
            .into_iter()
            .filter(|hit| filter.time_matches(&hit.timestamp))
            .collect();
        rank_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    /// Get collection statistics
    pub async fn stats(&self) -> Result<CollectionStats> {
        let info = self.client.collection_info(&self.collection).await?;

        Ok(CollectionStats {
            points_count: info
                .result
                .map(|r| r.points_count.unwrap_or(0))
                .unwrap_or(0),
            dimension: self.dimension,
        })
    }
}

fn decode_hits(points: Vec<qdrant_client::qdrant::ScoredPoint>) -> Vec<VectorHit> {
    points
        .into_iter()
        .filter_map(|point| {
            let payload = point.payload;
            Some(VectorHit {
                post_id: payload.get("post_id")?.as_str()?.to_string(),
                version: payload.get("version")?.as_integer()?.max(0) as usize,
                score: point.score,
                timestamp: chrono::DateTime::parse_from_rfc3339(
                    payload.get("timestamp")?.as_str()?,
                )
                .ok()?
                .with_timezone(&Utc),
            })
        })
        .collect()
}

/// Collection statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CollectionStats {
    pub points_count: u64,
    pub dimension: usize,
}

trait QdrantValueExt {
    fn as_integer(&self) -> Option<i64>;
    fn as_str(&self) -> Option<&str>;
}

impl QdrantValueExt for QdrantValue {
    fn as_integer(&self) -> Option<i64> {
        match &self.kind {
            Some(qdrant_client::qdrant::value::Kind::IntegerValue(v)) => Some(*v),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match &self.kind {
            Some(qdrant_client::qdrant::value::Kind::StringValue(v)) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredPoint {
    post_id: String,
    version: usize,
    vector: Vec<f32>,
    timestamp: DateTime<Utc>,
    author: String,
    thread_id: Option<String>,
    is_thread_root: bool,
    stale: bool,
}

/// In-memory vector index with the same ordering semantics as Qdrant
#[derive(Debug, Clone)]
pub struct MemoryVector {
    points: Arc<RwLock<HashMap<(String, usize), StoredPoint>>>,
    dimension: usize,
}

impl MemoryVector {
    pub fn new(dimension: usize) -> Self {
        Self {
            points: Arc::new(RwLock::new(HashMap::new())),
            dimension,
        }
    }

    pub async fn upsert(&self, post: &Post, version: usize, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::InvalidArgument(format!(
                "embedding dimension {} does not match collection dimension {}",
                vector.len(),
                self.dimension
            )));
        }

        let mut points = self.points.write().await;
        points.insert(
            (post.id.clone(), version),
            StoredPoint {
                post_id: post.id.clone(),
                version,
                vector,
                timestamp: post.timestamp,
                author: post.author.clone(),
                thread_id: post.thread_id.clone(),
                is_thread_root: post.is_thread_root,
                stale: false,
            },
        );
        Ok(())
    }

    pub async fn mark_stale(&self, post_id: &str, version: usize) -> Result<()> {
        let mut points = self.points.write().await;
        if let Some(point) = points.get_mut(&(post_id.to_string(), version)) {
            point.stale = true;
        }
        Ok(())
    }

    pub async fn query(&self, vector: Vec<f32>, k: usize, exclude_stale: bool) -> Result<Vec<VectorHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let points = self.points.read().await;
        let mut hits: Vec<VectorHit> = points
            .values()
            .filter(|p| !(exclude_stale && p.stale))
            .map(|p| VectorHit {
                post_id: p.post_id.clone(),
                version: p.version,
                score: cosine_similarity(&vector, &p.vector),
                timestamp: p.timestamp,
            })
            .collect();

        rank_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    pub async fn query_filtered(
        &self,
        vector: Vec<f32>,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let points = self.points.read().await;
        let mut hits: Vec<VectorHit> = points
            .values()
            .filter(|p| !p.stale)
            .filter(|p| {
                filter
                    .thread_id
                    .as_ref()
                    .map(|t| p.thread_id.as_deref() == Some(t.as_str()))
                    .unwrap_or(true)
            })
            .filter(|p| {
                filter
                    .author
                    .as_ref()
                    .map(|a| &p.author == a)
                    .unwrap_or(true)
            })
            .filter(|p| !filter.only_roots || p.is_thread_root)
            .filter(|p| filter.time_matches(&p.timestamp))
            .map(|p| VectorHit {
                post_id: p.post_id.clone(),
                version: p.version,
                score: cosine_similarity(&vector, &p.vector),
                timestamp: p.timestamp,
            })
            .collect();

        rank_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    pub async fn stats(&self) -> Result<CollectionStats> {
        let points = self.points.read().await;
        Ok(CollectionStats {
            points_count: points.len() as u64,
            dimension: self.dimension,
        })
    }
}

/// Vector backend selected at construction time
#[derive(Clone)]
pub enum VectorBackend {
    Qdrant(QdrantVector),
    Memory(MemoryVector),
}

impl VectorBackend {
    /// Build the backend named by the configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.store_backend {
            StoreBackendKind::Remote => {
                let store =
                    QdrantVector::new(&config.qdrant_url, &config.collection, config.dimension)?;
                info!(url = %config.qdrant_url, collection = %config.collection, "connected to Qdrant");
                Ok(VectorBackend::Qdrant(store))
            }
            StoreBackendKind::Memory => Ok(VectorBackend::Memory(MemoryVector::new(
                config.dimension,
            ))),
        }
    }

    pub async fn init_collection(&self) -> Result<()> {
        match self {
            VectorBackend::Qdrant(v) => v.init_collection().await,
            VectorBackend::Memory(_) => Ok(()),
        }
    }

    pub async fn upsert(&self, post: &Post, version: usize, vector: Vec<f32>) -> Result<()> {
        match self {
            VectorBackend::Qdrant(v) => v.upsert(post, version, vector).await,
            VectorBackend::Memory(v) => v.upsert(post, version, vector).await,
        }
    }

    pub async fn mark_stale(&self, post_id: &str, version: usize) -> Result<()> {
        match self {
            VectorBackend::Qdrant(v) => v.mark_stale(post_id, version).await,
            VectorBackend::Memory(v) => v.mark_stale(post_id, version).await,
        }
    }

    pub async fn query(&self, vector: Vec<f32>, k: usize, exclude_stale: bool) -> Result<Vec<VectorHit>> {
        match self {
            VectorBackend::Qdrant(v) => v.query(vector, k, exclude_stale).await,
            VectorBackend::Memory(v) => v.query(vector, k, exclude_stale).await,
        }
    }

    pub async fn query_filtered(
        &self,
        vector: Vec<f32>,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorHit>> {
        match self {
            VectorBackend::Qdrant(v) => v.query_filtered(vector, k, filter).await,
            VectorBackend::Memory(v) => v.query_filtered(vector, k, filter).await,
        }
    }

    pub async fn stats(&self) -> Result<CollectionStats> {
        match self {
            VectorBackend::Qdrant(v) => v.stats().await,
            VectorBackend::Memory(v) => v.stats().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::content_hash;
    use chrono::TimeZone;

    fn post(id: &str, minute: u32) -> Post {
        Post {
            id: id.to_string(),
            author: "u1".to_string(),
            text: format!("text {}", id),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 10, 12, minute, 0).unwrap(),
            parent_id: None,
            thread_id: None,
            thread_title: None,
            is_thread_root: false,
            url: None,
            content_hash: content_hash(id),
        }
    }

    fn store() -> MemoryVector {
        MemoryVector::new(4)
    }

    #[test]
    fn point_uuid_is_deterministic() {
        assert_eq!(point_uuid("p1", 1), point_uuid("p1", 1));
        assert_ne!(point_uuid("p1", 1), point_uuid("p1", 2));
        assert_ne!(point_uuid("p1", 1), point_uuid("p2", 1));
    }

    #[tokio::test]
    async fn upsert_rejects_dimension_mismatch() {
        let store = store();
        let err = store
            .upsert(&post("p1", 0), 1, vec![1.0, 0.0])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn query_orders_by_similarity() {
        let store = store();
        store
            .upsert(&post("exact", 0), 1, vec![1.0, 0.0, 0.0, 0.0])
            .await
            .unwrap();
        store
            .upsert(&post("close", 1), 1, vec![1.0, 1.0, 0.0, 0.0])
            .await
            .unwrap();
        store
            .upsert(&post("orthogonal", 2), 1, vec![0.0, 1.0, 0.0, 0.0])
            .await
            .unwrap();

        let hits = store
            .query(vec![1.0, 0.0, 0.0, 0.0], 10, true)
            .await
            .unwrap();

        let ids: Vec<&str> = hits.iter().map(|h| h.post_id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "close", "orthogonal"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn equal_scores_break_ties_by_recency_then_id() {
        let store = store();
        let vector = vec![1.0, 0.0, 0.0, 0.0];
        store.upsert(&post("b_old", 0), 1, vector.clone()).await.unwrap();
        store.upsert(&post("newest", 30), 1, vector.clone()).await.unwrap();
        store.upsert(&post("a_old", 0), 1, vector.clone()).await.unwrap();

        let hits = store.query(vector, 10, true).await.unwrap();

        let ids: Vec<&str> = hits.iter().map(|h| h.post_id.as_str()).collect();
        assert_eq!(ids, vec!["newest", "a_old", "b_old"]);
    }

    #[tokio::test]
    async fn k_zero_and_empty_index_return_empty() {
        let store = store();
        assert!(store
            .query(vec![1.0, 0.0, 0.0, 0.0], 0, true)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .query(vec![1.0, 0.0, 0.0, 0.0], 5, true)
            .await
            .unwrap()
            .is_empty());

        store
            .upsert(&post("p1", 0), 1, vec![1.0, 0.0, 0.0, 0.0])
            .await
            .unwrap();
        assert!(store
            .query(vec![1.0, 0.0, 0.0, 0.0], 0, true)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn stale_versions_hidden_by_default() {
        let store = store();
        let p = post("p1", 0);
        store.upsert(&p, 1, vec![1.0, 0.0, 0.0, 0.0]).await.unwrap();
        store.mark_stale("p1", 1).await.unwrap();
        store.upsert(&p, 2, vec![1.0, 0.0, 0.0, 0.0]).await.unwrap();

        let live = store
            .query(vec![1.0, 0.0, 0.0, 0.0], 10, true)
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].version, 2);

        let all = store
            .query(vec![1.0, 0.0, 0.0, 0.0], 10, false)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn reupsert_same_version_replaces_point() {
        let store = store();
        let p = post("p1", 0);
        store.upsert(&p, 1, vec![1.0, 0.0, 0.0, 0.0]).await.unwrap();
        store.upsert(&p, 1, vec![0.0, 1.0, 0.0, 0.0]).await.unwrap();

        assert_eq!(store.stats().await.unwrap().points_count, 1);
    }

    #[tokio::test]
    async fn filtered_search_honors_thread() {
        let store = store();
        let mut in_thread = post("p1", 0);
        in_thread.thread_id = Some("t1".to_string());
        let mut other_thread = post("p2", 1);
        other_thread.thread_id = Some("t2".to_string());

        store.upsert(&in_thread, 1, vec![1.0, 0.0, 0.0, 0.0]).await.unwrap();
        store.upsert(&other_thread, 1, vec![1.0, 0.0, 0.0, 0.0]).await.unwrap();

        let hits = store
            .query_filtered(
                vec![1.0, 0.0, 0.0, 0.0],
                10,
                &SearchFilter::new().thread("t1"),
            )
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].post_id, "p1");
    }

    #[tokio::test]
    async fn filtered_search_honors_roots_and_author() {
        let store = store();
        let mut root = post("root", 0);
        root.is_thread_root = true;
        let mut reply = post("reply", 1);
        reply.author = "u2".to_string();

        store.upsert(&root, 1, vec![1.0, 0.0, 0.0, 0.0]).await.unwrap();
        store.upsert(&reply, 1, vec![1.0, 0.0, 0.0, 0.0]).await.unwrap();

        let roots = store
            .query_filtered(vec![1.0, 0.0, 0.0, 0.0], 10, &SearchFilter::new().roots_only())
            .await
            .unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].post_id, "root");

        let by_author = store
            .query_filtered(vec![1.0, 0.0, 0.0, 0.0], 10, &SearchFilter::new().author("u2"))
            .await
            .unwrap();
        assert_eq!(by_author.len(), 1);
        assert_eq!(by_author[0].post_id, "reply");
    }

    #[tokio::test]
    async fn filtered_search_honors_time_window() {
        let store = store();
        store.upsert(&post("early", 0), 1, vec![1.0, 0.0, 0.0, 0.0]).await.unwrap();
        store.upsert(&post("late", 45), 1, vec![1.0, 0.0, 0.0, 0.0]).await.unwrap();

        let cutoff = Utc.with_ymd_and_hms(2024, 5, 10, 12, 20, 0).unwrap();

        let recent = store
            .query_filtered(vec![1.0, 0.0, 0.0, 0.0], 10, &SearchFilter::new().after(cutoff))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].post_id, "late");

        let older = store
            .query_filtered(vec![1.0, 0.0, 0.0, 0.0], 10, &SearchFilter::new().before(cutoff))
            .await
            .unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].post_id, "early");
    }

    #[tokio::test]
    async fn filtered_search_excludes_stale() {
        let store = store();
        let p = post("p1", 0);
        store.upsert(&p, 1, vec![1.0, 0.0, 0.0, 0.0]).await.unwrap();
        store.mark_stale("p1", 1).await.unwrap();

        let hits = store
            .query_filtered(vec![1.0, 0.0, 0.0, 0.0], 10, &SearchFilter::new())
            .await
            .unwrap();

        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn stats_report_point_count_and_dimension() {
        let store = store();
        store.upsert(&post("p1", 0), 1, vec![1.0, 0.0, 0.0, 0.0]).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.points_count, 1);
        assert_eq!(stats.dimension, 4);
    }
}
