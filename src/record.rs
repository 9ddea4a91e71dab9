//! Data model for forum posts and ingestion-boundary normalization

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Raw forum record as it arrives from the ingestion input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    /// Post identifier (required, non-blank)
    pub id: String,
    /// Author display name
    #[serde(default)]
    pub author: String,
    /// Post text content (required, non-blank)
    pub text: String,
    /// Creation timestamp: RFC 3339 string or epoch seconds
    pub timestamp: RawTimestamp,
    /// Parent post id when this is a reply
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Thread/topic id
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Thread title
    #[serde(default)]
    pub thread_title: Option<String>,
    /// Whether the post opens its thread
    #[serde(default)]
    pub is_thread_root: Option<bool>,
    /// Permalink to the post
    #[serde(default)]
    pub url: Option<String>,
}

/// Timestamps arrive either as RFC 3339 strings or integer epoch seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Epoch(i64),
    Text(String),
}

/// Normalized post unit: one paragraph-level chunk with metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    /// Globally unique post identifier
    pub id: String,
    /// Author display name (blank when the source omitted it)
    pub author: String,
    /// Normalized text content
    pub text: String,
    /// Creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Parent post id when this is a reply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Thread/topic id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Thread title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_title: Option<String>,
    /// Whether the post opens its thread
    pub is_thread_root: bool,
    /// Permalink to the post
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// SHA-256 of the normalized text, lowercase hex
    pub content_hash: String,
}

impl Post {
    /// Author node identifier for this post, if the author is known
    pub fn author_id(&self) -> Option<&str> {
        if self.author.is_empty() {
            None
        } else {
            Some(self.author.as_str())
        }
    }
}

/// Author node referenced by posts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Author {
    /// Unique author identifier
    pub id: String,
    /// Display name
    pub name: String,
}

/// Collapse whitespace, strip control characters, trim
pub fn normalize_text(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable content hash over normalized text
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn parse_timestamp(raw: &RawTimestamp, id: &str) -> Result<DateTime<Utc>> {
    match raw {
        RawTimestamp::Epoch(secs) => Utc
            .timestamp_opt(*secs, 0)
            .single()
            .ok_or_else(|| Error::MalformedRecord(format!("{}: epoch out of range: {}", id, secs))),
        RawTimestamp::Text(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::MalformedRecord(format!("{}: bad timestamp {:?}: {}", id, s, e))),
    }
}

/// Validate a raw record and produce the normalized Post
pub fn normalize_record(raw: &RawRecord) -> Result<Post> {
    let id = raw.id.trim();
    if id.is_empty() {
        return Err(Error::MalformedRecord("record without id".to_string()));
    }

    let text = normalize_text(&raw.text);
    if text.is_empty() {
        return Err(Error::MalformedRecord(format!(
            "{}: record without text",
            id
        )));
    }

    let timestamp = parse_timestamp(&raw.timestamp, id)?;
    let hash = content_hash(&text);

    let parent_id = raw
        .parent_id
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);

    // A post replying to itself carries no usable link
    let parent_id = parent_id.filter(|p| p != id);

    Ok(Post {
        id: id.to_string(),
        author: raw.author.trim().to_string(),
        text,
        timestamp,
        parent_id,
        thread_id: raw
            .thread_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string),
        thread_title: raw
            .thread_title
            .as_deref()
            .map(normalize_text)
            .filter(|t| !t.is_empty()),
        is_thread_root: raw.is_thread_root.unwrap_or(false),
        url: raw.url.clone().filter(|u| !u.trim().is_empty()),
        content_hash: hash,
    })
}
