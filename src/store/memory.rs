//! In-memory [`VectorIndex`] for tests and ephemeral runs.
//!
//! Entries live in a `BTreeMap` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity; keyword candidates are ranked by the
//! fraction of query terms each entry contains.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use super::{
    rank_order, CollectionStats, Hit, MetadataFilter, PlatformStats, UpsertReport, VectorIndex,
};
use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::lexical;
use crate::models::{Collection, IndexEntry, Platform, StoredEntry};

/// `(collection, platform, conversation_id, content_hash)`
type EntryKey = (Collection, Platform, String, String);
type EntryMap = BTreeMap<EntryKey, StoredVector>;

struct StoredVector {
    entry: StoredEntry,
    vector: Vec<f32>,
    model: String,
}

#[derive(Default)]
pub struct InMemoryIndex {
    entries: RwLock<EntryMap>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, EntryMap>> {
        self.entries
            .read()
            .map_err(|_| Error::Index("in-memory index lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, EntryMap>> {
        self.entries
            .write()
            .map_err(|_| Error::Index("in-memory index lock poisoned".to_string()))
    }
}

fn ranked(mut hits: Vec<Hit>, k: usize) -> Vec<Hit> {
    hits.sort_by(rank_order);
    hits.truncate(k);
    hits
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, collection: Collection, entries: &[IndexEntry]) -> Result<UpsertReport> {
        let mut map = self.write()?;
        let mut report = UpsertReport::default();
        for e in entries {
            let key = (
                collection,
                e.metadata.platform,
                e.metadata.conversation_id.clone(),
                e.chunk.content_hash.clone(),
            );
            let mut metadata = e.metadata.clone();
            metadata.collection = collection;
            let stored = StoredVector {
                entry: StoredEntry {
                    content_hash: e.chunk.content_hash.clone(),
                    text: e.chunk.text.clone(),
                    position: e.chunk.position,
                    metadata,
                },
                vector: e.vector.values.clone(),
                model: e.vector.model.clone(),
            };
            if map.insert(key, stored).is_some() {
                report.existing += 1;
            } else {
                report.inserted += 1;
            }
        }
        Ok(report)
    }

    async fn query(
        &self,
        collection: Collection,
        vector: &[f32],
        model: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<Hit>> {
        let map = self.read()?;
        let hits = map
            .iter()
            .filter(|((c, ..), sv)| {
                *c == collection && sv.model == model && filter.matches(&sv.entry.metadata)
            })
            .map(|(_, sv)| Hit {
                entry: sv.entry.clone(),
                score: cosine_similarity(vector, &sv.vector) as f64,
            })
            .collect();
        Ok(ranked(hits, k))
    }

    async fn keyword_candidates(
        &self,
        collection: Collection,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<Hit>> {
        let terms = lexical::query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let map = self.read()?;
        let hits = map
            .iter()
            .filter(|((c, ..), sv)| *c == collection && filter.matches(&sv.entry.metadata))
            .filter_map(|(_, sv)| {
                let score = lexical::term_overlap(&terms, &sv.entry.text);
                (score > 0.0).then(|| Hit {
                    entry: sv.entry.clone(),
                    score,
                })
            })
            .collect();
        Ok(ranked(hits, k))
    }

    async fn delete(&self, collection: Collection, filter: &MetadataFilter) -> Result<u64> {
        let mut map = self.write()?;
        let before = map.len();
        map.retain(|(c, ..), sv| !(*c == collection && filter.matches(&sv.entry.metadata)));
        Ok((before - map.len()) as u64)
    }

    async fn prune(
        &self,
        collection: Collection,
        filter: &MetadataFilter,
        keep: &[String],
    ) -> Result<u64> {
        let keep: BTreeSet<&str> = keep.iter().map(String::as_str).collect();
        let mut map = self.write()?;
        let before = map.len();
        map.retain(|(c, _, _, hash), sv| {
            !(*c == collection
                && filter.matches(&sv.entry.metadata)
                && !keep.contains(hash.as_str()))
        });
        Ok((before - map.len()) as u64)
    }

    async fn stats(&self, collection: Collection) -> Result<CollectionStats> {
        let map = self.read()?;
        let mut stats = CollectionStats::default();
        for ((c, ..), sv) in map.iter() {
            if *c == collection {
                stats.count += 1;
                stats.size_bytes += (sv.entry.text.len() + sv.vector.len() * 4) as u64;
            }
        }
        Ok(stats)
    }

    async fn platform_stats(&self) -> Result<Vec<PlatformStats>> {
        let map = self.read()?;
        let mut per: HashMap<_, (BTreeSet<String>, u64)> = HashMap::new();
        for sv in map.values() {
            let m = &sv.entry.metadata;
            let slot = per.entry(m.platform).or_default();
            slot.0.insert(m.conversation_id.clone());
            slot.1 += 1;
        }
        let mut stats: Vec<PlatformStats> = per
            .into_iter()
            .map(|(platform, (convs, entries))| PlatformStats {
                platform,
                conversations: convs.len() as u64,
                entries,
            })
            .collect();
        stats.sort_by_key(|s| s.platform);
        Ok(stats)
    }

    async fn reset(&self) -> Result<()> {
        self.write()?.clear();
        Ok(())
    }
}
