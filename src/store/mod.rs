//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the storage seam for the pipeline, with a
//! SQLite backend ([`sqlite::SqliteIndex`]) for persistent use and an
//! in-memory backend ([`memory::InMemoryIndex`]) for tests.
//!
//! Collections are independent namespaces; no operation spans two of them.
//! Upserts are idempotent on `(collection, platform, conversation_id,
//! content_hash)`, so identical text in two conversations stays two entries.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert`](VectorIndex::upsert) | Insert new entries, refresh metadata of known ones |
//! | [`query`](VectorIndex::query) | Cosine-similarity nearest neighbours |
//! | [`keyword_candidates`](VectorIndex::keyword_candidates) | Lexical candidate fetch |
//! | [`delete`](VectorIndex::delete) | Remove entries matching a filter |
//! | [`prune`](VectorIndex::prune) | Remove matching entries not in a keep set |
//! | [`stats`](VectorIndex::stats) | Entry count and stored size |
//! | [`reset`](VectorIndex::reset) | Drop every entry in every collection |

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::Serialize;
use std::cmp::Ordering;

use crate::error::Result;
use crate::models::{Collection, EntryMetadata, IndexEntry, Platform, StoredEntry};

/// Metadata constraints applied inside a single collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub platform: Option<Platform>,
    pub conversation_id: Option<String>,
    /// Compared against the lowercased fence language of code entries.
    pub language: Option<String>,
}

impl MetadataFilter {
    pub fn platform(platform: Option<Platform>) -> Self {
        Self {
            platform,
            ..Self::default()
        }
    }

    /// Every entry of one conversation.
    pub fn conversation(platform: Platform, conversation_id: &str) -> Self {
        Self {
            platform: Some(platform),
            conversation_id: Some(conversation_id.to_string()),
            language: None,
        }
    }

    pub fn with_language(mut self, language: Option<&str>) -> Self {
        self.language = language.map(|l| l.trim().to_lowercase());
        self
    }

    pub fn matches(&self, metadata: &EntryMetadata) -> bool {
        self.platform.map_or(true, |p| p == metadata.platform)
            && self
                .conversation_id
                .as_deref()
                .map_or(true, |id| id == metadata.conversation_id)
            && self
                .language
                .as_deref()
                .map_or(true, |l| metadata.language.as_deref() == Some(l))
    }
}

/// A ranked entry. `score` is cosine similarity for [`VectorIndex::query`]
/// and a backend-specific relevance for [`VectorIndex::keyword_candidates`].
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub entry: StoredEntry,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    pub count: u64,
    /// Bytes of stored text plus vector data.
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformStats {
    pub platform: Platform,
    pub conversations: u64,
    pub entries: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub inserted: usize,
    /// Entries whose content hash was already present.
    pub existing: usize,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert entries keyed by platform, conversation and content hash.
    /// A key already in the collection keeps one row; its metadata and
    /// vector are replaced by the newest.
    async fn upsert(&self, collection: Collection, entries: &[IndexEntry]) -> Result<UpsertReport>;

    /// Top `k` entries by cosine similarity to `vector`, considering only
    /// entries embedded by `model` (an embedding cache namespace).
    async fn query(
        &self,
        collection: Collection,
        vector: &[f32],
        model: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<Hit>>;

    /// Top `k` entries sharing terms with `query`, without vectors.
    async fn keyword_candidates(
        &self,
        collection: Collection,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<Hit>>;

    /// Remove matching entries; returns how many were removed.
    async fn delete(&self, collection: Collection, filter: &MetadataFilter) -> Result<u64>;

    /// Remove entries matching `filter` whose content hash is not in
    /// `keep`; returns how many were removed.
    async fn prune(
        &self,
        collection: Collection,
        filter: &MetadataFilter,
        keep: &[String],
    ) -> Result<u64>;

    async fn stats(&self, collection: Collection) -> Result<CollectionStats>;

    /// Per-platform conversation and entry counts across all collections.
    async fn platform_stats(&self) -> Result<Vec<PlatformStats>>;

    /// Remove every entry from every collection.
    async fn reset(&self) -> Result<()>;
}

/// Ranking order shared by every backend: score desc, newer first,
/// then content hash and source for a total order.
pub fn rank_order(a: &Hit, b: &Hit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(b.entry.metadata.timestamp.cmp(&a.entry.metadata.timestamp))
        .then(a.entry.content_hash.cmp(&b.entry.content_hash))
        .then(a.entry.metadata.platform.cmp(&b.entry.metadata.platform))
        .then(
            a.entry
                .metadata
                .conversation_id
                .cmp(&b.entry.metadata.conversation_id),
        )
}
