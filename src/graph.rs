//! Graph persistence for posts, authors, entities, and typed relations

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use neo4rs::{query, Graph, Node};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{
    Config, StoreBackendKind, DEFAULT_MAX_HOPS, DEFAULT_MAX_VISITED, DEFAULT_MIN_CONFIDENCE,
};
use crate::extractor::Triple;
use crate::record::{Author, Post};
use crate::{Error, Result};

/// Relationship types the store knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeType {
    ReplyTo,
    AuthoredBy,
    Mentions,
    RelatesTo,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::ReplyTo => "REPLY_TO",
            EdgeType::AuthoredBy => "AUTHORED_BY",
            EdgeType::Mentions => "MENTIONS",
            EdgeType::RelatesTo => "RELATES_TO",
        }
    }
}

/// Edge types followed during retrieval expansion
pub const EXPANSION_EDGE_TYPES: &[EdgeType] =
    &[EdgeType::ReplyTo, EdgeType::Mentions, EdgeType::RelatesTo];

/// What happened to a post on upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Unchanged,
    NewVersion { previous: usize },
}

/// Post reachable from a traversal start node
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub post_id: String,
    pub hop_distance: usize,
    /// Best confidence on an edge entering the node at this distance
    pub confidence: f32,
}

/// Bounds applied to a traversal
#[derive(Debug, Clone)]
pub struct TraversalOpts {
    pub max_hops: usize,
    pub min_confidence: f32,
    /// Ceiling on visited nodes, the start node included
    pub max_visited: usize,
    pub include_unverified: bool,
}

impl Default for TraversalOpts {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            max_visited: DEFAULT_MAX_VISITED,
            include_unverified: false,
        }
    }
}

/// One entry in a post's revision chain, newest first
#[derive(Debug, Clone, PartialEq)]
pub struct VersionEntry {
    pub version: usize,
    pub content_hash: String,
}

/// Node and edge counts
#[derive(Debug, Default, Clone, Serialize)]
pub struct GraphStats {
    pub post_count: u64,
    pub author_count: u64,
    pub entity_count: u64,
    pub version_count: u64,
    pub relation_count: u64,
    pub pending_reply_count: u64,
}

/// Outgoing or incoming edge seen from one node
#[derive(Debug, Clone)]
struct AdjacentEdge {
    target: String,
    confidence: f32,
    is_post: bool,
}

fn version_node_id(post_id: &str, version: usize) -> String {
    format!("{}@v{}", post_id, version)
}

/// Graph store backed by Neo4j
#[derive(Clone)]
pub struct Neo4jGraph {
    graph: Graph,
}

impl Neo4jGraph {
    /// Connect to Neo4j server
    pub async fn new(uri: &str, user: &str, password: &str) -> Result<Self> {
        let graph = Graph::new(uri, user, password).await?;

        Ok(Self { graph })
    }

    /// Initialize schema with constraints and indexes
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing Neo4j schema...");

        let constraints = [
            "CREATE CONSTRAINT post_id IF NOT EXISTS FOR (p:Post) REQUIRE p.id IS UNIQUE",
            "CREATE CONSTRAINT author_id IF NOT EXISTS FOR (a:Author) REQUIRE a.id IS UNIQUE",
            "CREATE CONSTRAINT entity_id IF NOT EXISTS FOR (e:Entity) REQUIRE e.id IS UNIQUE",
            "CREATE CONSTRAINT version_id IF NOT EXISTS FOR (v:PostVersion) REQUIRE v.id IS UNIQUE",
        ];

        for constraint in constraints {
            self.graph.run(query(constraint)).await?;
        }

        let indexes = [
            "CREATE INDEX post_timestamp IF NOT EXISTS FOR (p:Post) ON (p.timestamp)",
            "CREATE INDEX post_thread IF NOT EXISTS FOR (p:Post) ON (p.thread_id)",
            "CREATE INDEX post_pending IF NOT EXISTS FOR (p:Post) ON (p.pending_parent)",
        ];

        for index in indexes {
            self.graph.run(query(index)).await?;
        }

        info!("Schema initialized successfully");
        Ok(())
    }

    /// Create or revise a post node; revisions snapshot the prior content
    pub async fn upsert_post(&self, post: &Post) -> Result<UpsertOutcome> {
        let lookup = query("MATCH (p:Post {id: $id}) RETURN p.content_hash AS hash, p.version AS version")
            .param("id", post.id.clone());

        let mut result = self.graph.execute(lookup).await?;
        let current = match result.next().await? {
            Some(row) => Some((
                row.get::<String>("hash").unwrap_or_default(),
                row.get::<i64>("version").unwrap_or(1).max(1) as usize,
            )),
            None => None,
        };

        match current {
            Some((hash, _)) if hash == post.content_hash => {
                debug!("Post {} unchanged, skipping", post.id);
                Ok(UpsertOutcome::Unchanged)
            }
            Some((_, previous)) => {
                let version = previous + 1;
                self.write_live_post(post, version).await?;
                self.write_snapshot(post, version).await?;
                self.chain_snapshots(&post.id, version, previous).await?;
                debug!("Post {} revised to version {}", post.id, version);
                Ok(UpsertOutcome::NewVersion { previous })
            }
            None => {
                self.write_live_post(post, 1).await?;
                self.write_snapshot(post, 1).await?;
                debug!("Created post {}", post.id);
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn write_live_post(&self, post: &Post, version: usize) -> Result<()> {
        // Absent optional fields are bound as empty strings and stored as nulls
        let q = query(
            "MERGE (p:Post {id: $id})
             SET p.text = $text,
                 p.content_hash = $content_hash,
                 p.version = $version,
                 p.author_id = $author_id,
                 p.timestamp = $timestamp,
                 p.parent_id = CASE WHEN $parent_id = '' THEN null ELSE $parent_id END,
                 p.thread_id = CASE WHEN $thread_id = '' THEN null ELSE $thread_id END,
                 p.thread_title = CASE WHEN $thread_title = '' THEN null ELSE $thread_title END,
                 p.is_thread_root = $is_thread_root,
                 p.url = CASE WHEN $url = '' THEN null ELSE $url END,
                 p.updated_at = datetime()",
        )
        .param("id", post.id.clone())
        .param("text", post.text.clone())
        .param("content_hash", post.content_hash.clone())
        .param("version", version as i64)
        .param("author_id", post.author.clone())
        .param("timestamp", post.timestamp.to_rfc3339())
        .param("parent_id", post.parent_id.clone().unwrap_or_default())
        .param("thread_id", post.thread_id.clone().unwrap_or_default())
        .param("thread_title", post.thread_title.clone().unwrap_or_default())
        .param("is_thread_root", post.is_thread_root)
        .param("url", post.url.clone().unwrap_or_default());

        self.graph.run(q).await?;
        Ok(())
    }

    async fn write_snapshot(&self, post: &Post, version: usize) -> Result<()> {
        let q = query(
            "MERGE (v:PostVersion {id: $id})
             SET v.post_id = $post_id,
                 v.version = $version,
                 v.content_hash = $content_hash,
                 v.text = $text,
                 v.created_at = $timestamp",
        )
        .param("id", version_node_id(&post.id, version))
        .param("post_id", post.id.clone())
        .param("version", version as i64)
        .param("content_hash", post.content_hash.clone())
        .param("text", post.text.clone())
        .param("timestamp", post.timestamp.to_rfc3339());

        self.graph.run(q).await?;
        Ok(())
    }

    async fn chain_snapshots(&self, post_id: &str, version: usize, previous: usize) -> Result<()> {
        let q = query(
            "MATCH (new:PostVersion {id: $new_id})
             MATCH (old:PostVersion {id: $old_id})
             MERGE (new)-[:SUPERSEDES]->(old)",
        )
        .param("new_id", version_node_id(post_id, version))
        .param("old_id", version_node_id(post_id, previous));

        self.graph.run(q).await?;
        Ok(())
    }

    /// Create the author on first reference and attach the post to it
    pub async fn upsert_author(&self, post_id: &str, author: &Author) -> Result<()> {
        let q = query(
            "MATCH (p:Post {id: $post_id})
             MERGE (a:Author {id: $author_id})
             ON CREATE SET a.name = $name
             MERGE (p)-[r:AUTHORED_BY]->(a)
             SET r.confidence = 1.0",
        )
        .param("post_id", post_id)
        .param("author_id", author.id.clone())
        .param("name", author.name.clone());

        self.graph.run(q).await?;
        debug!("Upserted author {} for post {}", author.id, post_id);
        Ok(())
    }

    /// Store extracted triples as entity nodes plus MENTIONS and RELATES_TO edges
    pub async fn upsert_triples(
        &self,
        post_id: &str,
        triples: &[Triple],
        accept_threshold: f32,
    ) -> Result<()> {
        for triple in triples {
            if triple.subject == triple.object {
                continue;
            }

            for entity_id in [&triple.subject, &triple.object] {
                let merge_entity = query(
                    "MERGE (e:Entity {id: $id})
                     ON CREATE SET e.name = $id, e.created_at = datetime()",
                )
                .param("id", entity_id.clone());

                self.graph.run(merge_entity).await?;

                let mention = query(
                    "MATCH (p:Post {id: $post_id})
                     MATCH (e:Entity {id: $entity_id})
                     MERGE (p)-[r:MENTIONS]->(e)
                     ON CREATE SET r.confidence = $confidence
                     ON MATCH SET r.confidence = CASE
                         WHEN r.confidence >= $confidence THEN r.confidence
                         ELSE $confidence END
                     SET r.unverified = r.confidence < $threshold",
                )
                .param("post_id", post_id)
                .param("entity_id", entity_id.clone())
                .param("confidence", triple.confidence as f64)
                .param("threshold", accept_threshold as f64);

                self.graph.run(mention).await?;
            }

            let relation = query(
                "MATCH (s:Entity {id: $subject})
                 MATCH (o:Entity {id: $object})
                 MERGE (s)-[r:RELATES_TO {predicate: $predicate, source_post_id: $post_id}]->(o)
                 ON CREATE SET r.confidence = $confidence
                 ON MATCH SET r.confidence = CASE
                     WHEN r.confidence >= $confidence THEN r.confidence
                     ELSE $confidence END
                 SET r.unverified = r.confidence < $threshold",
            )
            .param("subject", triple.subject.clone())
            .param("object", triple.object.clone())
            .param("predicate", triple.predicate.clone())
            .param("post_id", post_id)
            .param("confidence", triple.confidence as f64)
            .param("threshold", accept_threshold as f64);

            self.graph.run(relation).await?;
        }

        debug!("Stored {} triples for post {}", triples.len(), post_id);
        Ok(())
    }

    /// Attach a reply edge, or park it when the parent is not ingested yet
    pub async fn link_reply(&self, post_id: &str, parent_id: &str) -> Result<bool> {
        let q = query(
            "MATCH (child:Post {id: $post_id})
             OPTIONAL MATCH (parent:Post {id: $parent_id})
             FOREACH (p IN CASE WHEN parent IS NULL THEN [] ELSE [parent] END |
                 MERGE (child)-[:REPLY_TO {confidence: 1.0}]->(p))
             SET child.pending_parent = CASE WHEN parent IS NULL THEN $parent_id ELSE null END
             RETURN parent IS NOT NULL AS linked",
        )
        .param("post_id", post_id)
        .param("parent_id", parent_id);

        let mut result = self.graph.execute(q).await?;
        match result.next().await? {
            Some(row) => Ok(row.get::<bool>("linked").unwrap_or(false)),
            None => Ok(false),
        }
    }

    /// Attach parked reply edges whose parents have arrived since
    pub async fn resolve_pending(&self) -> Result<u64> {
        let q = query(
            "MATCH (child:Post) WHERE child.pending_parent IS NOT NULL
             MATCH (parent:Post {id: child.pending_parent})
             MERGE (child)-[:REPLY_TO {confidence: 1.0}]->(parent)
             SET child.pending_parent = null
             RETURN count(child) AS resolved",
        );

        let mut result = self.graph.execute(q).await?;
        match result.next().await? {
            Some(row) => Ok(row.get::<i64>("resolved").unwrap_or(0) as u64),
            None => Ok(0),
        }
    }

    async fn adjacency(
        &self,
        node_id: &str,
        edge_types: &[EdgeType],
        min_confidence: f32,
        include_unverified: bool,
    ) -> Result<Vec<AdjacentEdge>> {
        let types: Vec<String> = edge_types.iter().map(|t| t.as_str().to_string()).collect();

        let q = query(
            "MATCH (n {id: $id})-[r]-(m)
             WHERE type(r) IN $types
               AND coalesce(r.confidence, 1.0) >= $min_confidence
               AND ($include_unverified OR NOT coalesce(r.unverified, false))
             RETURN m.id AS id,
                    'Post' IN labels(m) AS is_post,
                    coalesce(r.confidence, 1.0) AS confidence",
        )
        .param("id", node_id)
        .param("types", types)
        .param("min_confidence", min_confidence as f64)
        .param("include_unverified", include_unverified);

        let mut result = self.graph.execute(q).await?;
        let mut edges = Vec::new();

        while let Some(row) = result.next().await? {
            if let Ok(target) = row.get::<String>("id") {
                edges.push(AdjacentEdge {
                    target,
                    confidence: row.get::<f64>("confidence").unwrap_or(0.0) as f32,
                    is_post: row.get::<bool>("is_post").unwrap_or(false),
                });
            }
        }

        Ok(edges)
    }

    /// Load live posts by id
    pub async fn fetch_posts(&self, ids: &[String]) -> Result<HashMap<String, Post>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let q = query("MATCH (p:Post) WHERE p.id IN $ids RETURN p").param("ids", ids.to_vec());

        let mut result = self.graph.execute(q).await?;
        let mut posts = HashMap::new();

        while let Some(row) = result.next().await? {
            if let Ok(node) = row.get::<Node>("p") {
                let post = Post {
                    id: node.get::<String>("id").unwrap_or_default(),
                    author: node.get::<String>("author_id").unwrap_or_default(),
                    text: node.get::<String>("text").unwrap_or_default(),
                    timestamp: chrono::DateTime::parse_from_rfc3339(
                        &node.get::<String>("timestamp").unwrap_or_default(),
                    )
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                    parent_id: node.get::<String>("parent_id").ok(),
                    thread_id: node.get::<String>("thread_id").ok(),
                    thread_title: node.get::<String>("thread_title").ok(),
                    is_thread_root: node.get::<bool>("is_thread_root").unwrap_or(false),
                    url: node.get::<String>("url").ok(),
                    content_hash: node.get::<String>("content_hash").unwrap_or_default(),
                };
                posts.insert(post.id.clone(), post);
            }
        }

        Ok(posts)
    }

    /// Walk a post's SUPERSEDES chain, newest first
    pub async fn version_history(&self, post_id: &str) -> Result<Vec<VersionEntry>> {
        let head = query("MATCH (p:Post {id: $id}) RETURN p.version AS version")
            .param("id", post_id);

        let mut result = self.graph.execute(head).await?;
        let head_version = match result.next().await? {
            Some(row) => row.get::<i64>("version").unwrap_or(1).max(1) as usize,
            None => return Ok(Vec::new()),
        };

        let q = query(
            "MATCH (head:PostVersion {id: $head_id})
             MATCH path = (head)-[:SUPERSEDES*0..]->(tail:PostVersion)
             WHERE NOT (tail)-[:SUPERSEDES]->()
             UNWIND nodes(path) AS v
             RETURN v.version AS version, v.content_hash AS content_hash",
        )
        .param("head_id", version_node_id(post_id, head_version));

        let mut result = self.graph.execute(q).await?;
        let mut entries = Vec::new();

        while let Some(row) = result.next().await? {
            entries.push(VersionEntry {
                version: row.get::<i64>("version").unwrap_or(0).max(0) as usize,
                content_hash: row.get::<String>("content_hash").unwrap_or_default(),
            });
        }

        Ok(entries)
    }

    /// Get graph statistics
    pub async fn stats(&self) -> Result<GraphStats> {
        let counts = query(
            "OPTIONAL MATCH (p:Post) WITH count(p) AS posts
             OPTIONAL MATCH (a:Author) WITH posts, count(a) AS authors
             OPTIONAL MATCH (e:Entity) WITH posts, authors, count(e) AS entities
             OPTIONAL MATCH (v:PostVersion) WITH posts, authors, entities, count(v) AS versions
             OPTIONAL MATCH ()-[r]->()
             WITH posts, authors, entities, versions, count(r) AS relations
             OPTIONAL MATCH (d:Post) WHERE d.pending_parent IS NOT NULL
             RETURN posts, authors, entities, versions, relations, count(d) AS pending",
        );

        let mut result = self.graph.execute(counts).await?;

        if let Some(row) = result.next().await? {
            return Ok(GraphStats {
                post_count: row.get::<i64>("posts").unwrap_or(0) as u64,
                author_count: row.get::<i64>("authors").unwrap_or(0) as u64,
                entity_count: row.get::<i64>("entities").unwrap_or(0) as u64,
                version_count: row.get::<i64>("versions").unwrap_or(0) as u64,
                relation_count: row.get::<i64>("relations").unwrap_or(0) as u64,
                pending_reply_count: row.get::<i64>("pending").unwrap_or(0) as u64,
            });
        }

        Ok(GraphStats::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EdgeKey {
    from: String,
    edge_type: EdgeType,
    to: String,
    /// Empty for structural edges
    predicate: String,
    /// Empty for structural edges
    source_post_id: String,
}

impl EdgeKey {
    fn structural(from: &str, edge_type: EdgeType, to: &str) -> Self {
        Self {
            from: from.to_string(),
            edge_type,
            to: to.to_string(),
            predicate: String::new(),
            source_post_id: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEdge {
    confidence: f32,
    unverified: bool,
}

#[derive(Debug, Clone)]
struct StoredPost {
    post: Post,
    version: usize,
}

#[derive(Debug, Clone)]
struct Snapshot {
    version: usize,
    content_hash: String,
}

#[derive(Debug, Default)]
struct GraphState {
    posts: HashMap<String, StoredPost>,
    snapshots: HashMap<String, Vec<Snapshot>>,
    authors: HashMap<String, Author>,
    entities: HashSet<String>,
    edges: HashMap<EdgeKey, StoredEdge>,
    pending_replies: HashMap<String, String>,
}

fn merge_edge(
    edges: &mut HashMap<EdgeKey, StoredEdge>,
    key: EdgeKey,
    confidence: f32,
    accept_threshold: f32,
) {
    let entry = edges.entry(key).or_insert(StoredEdge {
        confidence,
        unverified: false,
    });
    if confidence > entry.confidence {
        entry.confidence = confidence;
    }
    entry.unverified = entry.confidence < accept_threshold;
}

/// In-memory graph store with the same semantics as the Neo4j adapter
#[derive(Debug, Clone, Default)]
pub struct MemoryGraph {
    state: Arc<RwLock<GraphState>>,
}

impl MemoryGraph {
    pub async fn upsert_post(&self, post: &Post) -> Result<UpsertOutcome> {
        let mut state = self.state.write().await;

        let existing = match state.posts.get(&post.id) {
            None => None,
            Some(stored) if stored.post.content_hash == post.content_hash => {
                return Ok(UpsertOutcome::Unchanged);
            }
            Some(stored) => Some(stored.version),
        };

        match existing {
            None => {
                state.posts.insert(
                    post.id.clone(),
                    StoredPost {
                        post: post.clone(),
                        version: 1,
                    },
                );
                state.snapshots.entry(post.id.clone()).or_default().push(Snapshot {
                    version: 1,
                    content_hash: post.content_hash.clone(),
                });
                Ok(UpsertOutcome::Created)
            }
            Some(previous) => {
                let version = previous + 1;
                state.posts.insert(
                    post.id.clone(),
                    StoredPost {
                        post: post.clone(),
                        version,
                    },
                );
                state.snapshots.entry(post.id.clone()).or_default().push(Snapshot {
                    version,
                    content_hash: post.content_hash.clone(),
                });
                Ok(UpsertOutcome::NewVersion { previous })
            }
        }
    }

    pub async fn upsert_author(&self, post_id: &str, author: &Author) -> Result<()> {
        let mut state = self.state.write().await;

        state
            .authors
            .entry(author.id.clone())
            .or_insert_with(|| author.clone());

        if state.posts.contains_key(post_id) {
            merge_edge(
                &mut state.edges,
                EdgeKey::structural(post_id, EdgeType::AuthoredBy, &author.id),
                1.0,
                0.0,
            );
        }
        Ok(())
    }

    pub async fn upsert_triples(
        &self,
        post_id: &str,
        triples: &[Triple],
        accept_threshold: f32,
    ) -> Result<()> {
        let mut state = self.state.write().await;

        for triple in triples {
            if triple.subject == triple.object {
                continue;
            }

            state.entities.insert(triple.subject.clone());
            state.entities.insert(triple.object.clone());

            if state.posts.contains_key(post_id) {
                for entity_id in [&triple.subject, &triple.object] {
                    merge_edge(
                        &mut state.edges,
                        EdgeKey::structural(post_id, EdgeType::Mentions, entity_id),
                        triple.confidence,
                        accept_threshold,
                    );
                }
            }

            merge_edge(
                &mut state.edges,
                EdgeKey {
                    from: triple.subject.clone(),
                    edge_type: EdgeType::RelatesTo,
                    to: triple.object.clone(),
                    predicate: triple.predicate.clone(),
                    source_post_id: post_id.to_string(),
                },
                triple.confidence,
                accept_threshold,
            );
        }

        Ok(())
    }

    pub async fn link_reply(&self, post_id: &str, parent_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;

        if !state.posts.contains_key(post_id) {
            return Ok(false);
        }

        if state.posts.contains_key(parent_id) {
            merge_edge(
                &mut state.edges,
                EdgeKey::structural(post_id, EdgeType::ReplyTo, parent_id),
                1.0,
                0.0,
            );
            state.pending_replies.remove(post_id);
            Ok(true)
        } else {
            state
                .pending_replies
                .insert(post_id.to_string(), parent_id.to_string());
            Ok(false)
        }
    }

    pub async fn resolve_pending(&self) -> Result<u64> {
        let mut state = self.state.write().await;

        let resolvable: Vec<(String, String)> = state
            .pending_replies
            .iter()
            .filter(|(_, parent)| state.posts.contains_key(*parent))
            .map(|(child, parent)| (child.clone(), parent.clone()))
            .collect();

        for (child, parent) in &resolvable {
            merge_edge(
                &mut state.edges,
                EdgeKey::structural(child, EdgeType::ReplyTo, parent),
                1.0,
                0.0,
            );
            state.pending_replies.remove(child);
        }

        Ok(resolvable.len() as u64)
    }

    async fn adjacency(
        &self,
        node_id: &str,
        edge_types: &[EdgeType],
        min_confidence: f32,
        include_unverified: bool,
    ) -> Result<Vec<AdjacentEdge>> {
        let state = self.state.read().await;
        let mut edges = Vec::new();

        for (key, edge) in &state.edges {
            if !edge_types.contains(&key.edge_type) {
                continue;
            }
            if edge.confidence < min_confidence {
                continue;
            }
            if edge.unverified && !include_unverified {
                continue;
            }

            let target = if key.from == node_id {
                &key.to
            } else if key.to == node_id {
                &key.from
            } else {
                continue;
            };

            edges.push(AdjacentEdge {
                target: target.clone(),
                confidence: edge.confidence,
                is_post: state.posts.contains_key(target),
            });
        }

        Ok(edges)
    }

    pub async fn fetch_posts(&self, ids: &[String]) -> Result<HashMap<String, Post>> {
        let state = self.state.read().await;

        Ok(ids
            .iter()
            .filter_map(|id| state.posts.get(id))
            .map(|stored| (stored.post.id.clone(), stored.post.clone()))
            .collect())
    }

    pub async fn version_history(&self, post_id: &str) -> Result<Vec<VersionEntry>> {
        let state = self.state.read().await;

        Ok(state
            .snapshots
            .get(post_id)
            .map(|snapshots| {
                snapshots
                    .iter()
                    .rev()
                    .map(|s| VersionEntry {
                        version: s.version,
                        content_hash: s.content_hash.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn stats(&self) -> Result<GraphStats> {
        let state = self.state.read().await;

        let supersedes: u64 = state
            .snapshots
            .values()
            .map(|s| s.len().saturating_sub(1) as u64)
            .sum();

        Ok(GraphStats {
            post_count: state.posts.len() as u64,
            author_count: state.authors.len() as u64,
            entity_count: state.entities.len() as u64,
            version_count: state.snapshots.values().map(|s| s.len() as u64).sum(),
            relation_count: state.edges.len() as u64 + supersedes,
            pending_reply_count: state.pending_replies.len() as u64,
        })
    }
}

/// Graph backend selected at construction time
#[derive(Clone)]
pub enum GraphBackend {
    Neo4j(Neo4jGraph),
    Memory(MemoryGraph),
}

impl GraphBackend {
    /// Build the backend named by the configuration
    pub async fn from_config(config: &Config) -> Result<Self> {
        match config.store_backend {
            StoreBackendKind::Remote => {
                if config.neo4j_password.trim().is_empty() {
                    return Err(Error::ConfigError("NEO4J_PASSWORD not set".to_string()));
                }
                let graph =
                    Neo4jGraph::new(&config.neo4j_uri, &config.neo4j_user, &config.neo4j_password)
                        .await?;
                info!(uri = %config.neo4j_uri, "connected to Neo4j");
                Ok(GraphBackend::Neo4j(graph))
            }
            StoreBackendKind::Memory => Ok(GraphBackend::Memory(MemoryGraph::default())),
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        match self {
            GraphBackend::Neo4j(g) => g.init_schema().await,
            GraphBackend::Memory(_) => Ok(()),
        }
    }

    pub async fn upsert_post(&self, post: &Post) -> Result<UpsertOutcome> {
        if post.id.trim().is_empty() {
            return Err(Error::InvalidEntity("post id is empty".to_string()));
        }
        match self {
            GraphBackend::Neo4j(g) => g.upsert_post(post).await,
            GraphBackend::Memory(g) => g.upsert_post(post).await,
        }
    }

    pub async fn upsert_author(&self, post_id: &str, author: &Author) -> Result<()> {
        if author.id.trim().is_empty() {
            return Err(Error::InvalidEntity("author id is empty".to_string()));
        }
        match self {
            GraphBackend::Neo4j(g) => g.upsert_author(post_id, author).await,
            GraphBackend::Memory(g) => g.upsert_author(post_id, author).await,
        }
    }

    pub async fn upsert_triples(
        &self,
        post_id: &str,
        triples: &[Triple],
        accept_threshold: f32,
    ) -> Result<()> {
        match self {
            GraphBackend::Neo4j(g) => g.upsert_triples(post_id, triples, accept_threshold).await,
            GraphBackend::Memory(g) => g.upsert_triples(post_id, triples, accept_threshold).await,
        }
    }

    /// Returns true when the edge was created now, false when parked
    pub async fn link_reply(&self, post_id: &str, parent_id: &str) -> Result<bool> {
        match self {
            GraphBackend::Neo4j(g) => g.link_reply(post_id, parent_id).await,
            GraphBackend::Memory(g) => g.link_reply(post_id, parent_id).await,
        }
    }

    pub async fn resolve_pending(&self) -> Result<u64> {
        match self {
            GraphBackend::Neo4j(g) => g.resolve_pending().await,
            GraphBackend::Memory(g) => g.resolve_pending().await,
        }
    }

    async fn adjacency(
        &self,
        node_id: &str,
        edge_types: &[EdgeType],
        min_confidence: f32,
        include_unverified: bool,
    ) -> Result<Vec<AdjacentEdge>> {
        match self {
            GraphBackend::Neo4j(g) => {
                g.adjacency(node_id, edge_types, min_confidence, include_unverified)
                    .await
            }
            GraphBackend::Memory(g) => {
                g.adjacency(node_id, edge_types, min_confidence, include_unverified)
                    .await
            }
        }
    }

    /// Breadth-first search over the requested edge types, undirected.
    /// Entity and Author nodes are traversed but only posts are returned.
    /// Results come back hop-ascending, then confidence-descending, then by id.
    pub async fn neighbors(
        &self,
        start: &str,
        edge_types: &[EdgeType],
        opts: &TraversalOpts,
    ) -> Result<Vec<Neighbor>> {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(start.to_string());

        let mut frontier = vec![start.to_string()];
        let mut found = Vec::new();
        let mut capped = false;

        for hop in 1..=opts.max_hops {
            if frontier.is_empty() {
                break;
            }

            // Best entering confidence per unvisited node at this distance
            let mut level: HashMap<String, (f32, bool)> = HashMap::new();
            for node in &frontier {
                let edges = self
                    .adjacency(node, edge_types, opts.min_confidence, opts.include_unverified)
                    .await?;
                for edge in edges {
                    if visited.contains(&edge.target) {
                        continue;
                    }
                    let entry = level
                        .entry(edge.target.clone())
                        .or_insert((edge.confidence, edge.is_post));
                    if edge.confidence > entry.0 {
                        entry.0 = edge.confidence;
                    }
                }
            }

            let mut targets: Vec<(String, (f32, bool))> = level.into_iter().collect();
            targets.sort_by(|a, b| a.0.cmp(&b.0));

            let mut next = Vec::new();
            for (target, (confidence, is_post)) in targets {
                if visited.len() >= opts.max_visited {
                    warn!(
                        node = start,
                        ceiling = opts.max_visited,
                        "traversal reached visited ceiling"
                    );
                    capped = true;
                    break;
                }
                visited.insert(target.clone());
                if is_post {
                    found.push(Neighbor {
                        post_id: target.clone(),
                        hop_distance: hop,
                        confidence,
                    });
                }
                next.push(target);
            }

            if capped {
                break;
            }
            frontier = next;
        }

        found.sort_by(|a, b| {
            a.hop_distance
                .cmp(&b.hop_distance)
                .then(
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.post_id.cmp(&b.post_id))
        });

        Ok(found)
    }

    pub async fn fetch_posts(&self, ids: &[String]) -> Result<HashMap<String, Post>> {
        match self {
            GraphBackend::Neo4j(g) => g.fetch_posts(ids).await,
            GraphBackend::Memory(g) => g.fetch_posts(ids).await,
        }
    }

    pub async fn version_history(&self, post_id: &str) -> Result<Vec<VersionEntry>> {
        match self {
            GraphBackend::Neo4j(g) => g.version_history(post_id).await,
            GraphBackend::Memory(g) => g.version_history(post_id).await,
        }
    }

    pub async fn stats(&self) -> Result<GraphStats> {
        match self {
            GraphBackend::Neo4j(g) => g.stats().await,
            GraphBackend::Memory(g) => g.stats().await,
        }
    }
}
