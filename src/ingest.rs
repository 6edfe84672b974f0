//! Ingestion pipeline: parse → chunk → embed → upsert.
//!
//! Each platform is ingested independently; a broken export only fails its
//! own platform. Within a platform, conversations are embedded
//! concurrently (bounded by `ingest.concurrency`, results kept in input
//! order) and their entries are upserted by a single consumer, so writes
//! into a collection never race.
//!
//! A conversation whose embedding keeps failing with `ProviderUnavailable`
//! is skipped and counted; vectors computed before the failure stay in the
//! embedding cache, so a re-run picks up where this one stopped.
//!
//! Re-ingesting a conversation replaces it: entries from an earlier
//! ingestion whose text no longer occurs in the conversation are pruned
//! from every collection.

use anyhow::bail;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::chunk::Chunker;
use crate::config::{Config, IngestConfig};
use crate::db;
use crate::embedding::cache::{CachedEmbedder, EmbedOutcome, EmbeddingCache};
use crate::embedding::create_provider;
use crate::error::{Error, Result};
use crate::migrate;
use crate::models::{
    Chunk, Collection, ConversationRecord, EmbeddingVector, EntryMetadata, IndexEntry, Platform,
};
use crate::parsers::parser_for;
use crate::progress::{IngestEvent, IngestProgress, NoProgress, ProgressMode};
use crate::store::sqlite::SqliteIndex;
use crate::store::{MetadataFilter, VectorIndex};

/// Outcome of ingesting one platform's export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformReport {
    pub platform: Platform,
    pub conversations: usize,
    pub messages: usize,
    pub code_snippets: usize,
    pub chunks: usize,
    /// Entries that were not in the index before.
    pub inserted: usize,
    /// Entries whose content hash was already indexed.
    pub existing: usize,
    /// Entries left over from an earlier version of a conversation.
    pub removed: u64,
    pub cache_hits: usize,
    pub computed: usize,
    pub failed_conversations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_error: Option<String>,
}

impl PlatformReport {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            conversations: 0,
            messages: 0,
            code_snippets: 0,
            chunks: 0,
            inserted: 0,
            existing: 0,
            removed: 0,
            cache_hits: 0,
            computed: 0,
            failed_conversations: 0,
            parse_error: None,
            index_error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.parse_error.is_none() && self.index_error.is_none()
    }
}

struct PreparedChunk {
    collection: Collection,
    /// Fence language, for `code` chunks.
    language: Option<String>,
    chunk: Chunk,
}

/// One conversation's chunks, tagged with their target collection.
struct Prepared {
    conversation_id: String,
    chunks: Vec<PreparedChunk>,
    metadata: EntryMetadata,
}

impl Prepared {
    fn texts(&self) -> Vec<String> {
        self.chunks.iter().map(|p| p.chunk.text.clone()).collect()
    }
}

/// Text indexed in the `code` collection for one snippet.
pub fn code_snippet_text(language: &str, title: &str, source: &str) -> String {
    format!(
        "Language: {}\nContext: From: {}\n\nCode:\n{}",
        language, title, source
    )
}

pub struct Ingestor {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<CachedEmbedder>,
    chunker: Chunker,
    settings: IngestConfig,
    progress: Box<dyn IngestProgress>,
}

impl Ingestor {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<CachedEmbedder>,
        chunker: Chunker,
        settings: IngestConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            chunker,
            settings,
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn IngestProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// Parse and index one platform's export. Never fails as a whole:
    /// problems are recorded in the report.
    pub async fn ingest_platform(&self, platform: Platform, path: &Path) -> PlatformReport {
        self.progress.report(IngestEvent::Parsing {
            platform: platform.to_string(),
        });

        let parser = parser_for(platform);
        debug!(parser = %parser.platform(), path = %path.display(), "parsing export");
        let owned: PathBuf = path.to_path_buf();
        let parsed = tokio::task::spawn_blocking(move || parser.parse(&owned))
            .await
            .unwrap_or_else(|e| Err(Error::parse(platform, format!("parser task failed: {}", e))));

        match parsed {
            Ok(records) => {
                info!(%platform, conversations = records.len(), "parsed export");
                self.ingest_records(platform, records).await
            }
            Err(e) => {
                error!(%platform, error = %e, "export could not be parsed");
                let mut report = PlatformReport::new(platform);
                report.parse_error = Some(e.to_string());
                report
            }
        }
    }

    /// Chunk, embed and index already-parsed records.
    pub async fn ingest_records(
        &self,
        platform: Platform,
        records: Vec<ConversationRecord>,
    ) -> PlatformReport {
        let mut report = PlatformReport::new(platform);
        let total = records.len() as u64;

        let prepared: Vec<Prepared> = records
            .iter()
            .map(|r| {
                report.conversations += 1;
                report.messages += r.messages.len();
                report.code_snippets += r.code_snippets().count();
                self.prepare(r)
            })
            .collect();
        report.chunks = prepared.iter().map(|p| p.chunks.len()).sum();

        let mut embedded = stream::iter(prepared.into_iter().map(|p| async move {
            let outcome = self.embed_with_retry(&p.texts()).await;
            (p, outcome)
        }))
        .buffered(self.settings.concurrency.max(1));

        let mut done = 0u64;
        while let Some((prepared, outcome)) = embedded.next().await {
            done += 1;
            match outcome {
                Ok(outcome) => {
                    report.cache_hits += outcome.cache_hits;
                    report.computed += outcome.computed;
                    if let Err(e) = self.store(prepared, outcome, &mut report).await {
                        error!(%platform, error = %e, "index write failed; stopping platform");
                        report.index_error = Some(e.to_string());
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        %platform,
                        conversation = %prepared.conversation_id,
                        error = %e,
                        "embedding failed; skipping conversation"
                    );
                    report.failed_conversations += 1;
                }
            }
            self.progress.report(IngestEvent::Indexing {
                platform: platform.to_string(),
                n: done,
                total,
            });
        }

        report
    }

    fn prepare(&self, record: &ConversationRecord) -> Prepared {
        let mut chunks: Vec<PreparedChunk> = self
            .chunker
            .chunks(record)
            .map(|chunk| PreparedChunk {
                collection: Collection::Conversations,
                language: None,
                chunk,
            })
            .collect();

        for snippet in record.code_snippets() {
            let text = code_snippet_text(&snippet.language, &record.title, &snippet.source);
            let language = snippet.language.to_lowercase();
            chunks.extend(
                self.chunker
                    .chunk_text(&text, &record.conversation_id, record.platform)
                    .map(|chunk| PreparedChunk {
                        collection: Collection::Code,
                        language: Some(language.clone()),
                        chunk,
                    }),
            );
        }

        Prepared {
            conversation_id: record.conversation_id.clone(),
            chunks,
            metadata: EntryMetadata {
                platform: record.platform,
                conversation_id: record.conversation_id.clone(),
                title: record.title.clone(),
                timestamp: record.created_at,
                collection: Collection::Conversations,
                language: None,
            },
        }
    }

    async fn embed_with_retry(&self, texts: &[String]) -> Result<EmbedOutcome> {
        let mut attempt = 0u32;
        loop {
            match self.embedder.embed(texts).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < self.settings.max_batch_retries => {
                    let delay = self.settings.retry_base_ms.saturating_mul(1u64 << attempt.min(10));
                    debug!(attempt, delay_ms = delay, error = %e, "retrying embedding batch");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Upsert one conversation's entries, one call per collection, then
    /// prune whatever an earlier ingestion left behind.
    async fn store(
        &self,
        prepared: Prepared,
        outcome: EmbedOutcome,
        report: &mut PlatformReport,
    ) -> Result<()> {
        let model = self.embedder.provider().cache_namespace();
        let owner = MetadataFilter::conversation(
            prepared.metadata.platform,
            &prepared.metadata.conversation_id,
        );
        for collection in Collection::ALL {
            let entries: Vec<IndexEntry> = prepared
                .chunks
                .iter()
                .zip(outcome.vectors.iter())
                .filter(|(p, _)| p.collection == collection)
                .map(|(p, vector)| IndexEntry {
                    chunk: p.chunk.clone(),
                    vector: EmbeddingVector {
                        values: vector.clone(),
                        content_hash: p.chunk.content_hash.clone(),
                        model: model.clone(),
                    },
                    metadata: EntryMetadata {
                        collection,
                        language: p.language.clone(),
                        ..prepared.metadata.clone()
                    },
                })
                .collect();
            if !entries.is_empty() {
                let upserted = self.index.upsert(collection, &entries).await?;
                report.inserted += upserted.inserted;
                report.existing += upserted.existing;
            }

            let keep: Vec<String> = entries.iter().map(|e| e.chunk.content_hash.clone()).collect();
            let removed = self.index.prune(collection, &owner, &keep).await?;
            if removed > 0 {
                debug!(
                    conversation = %prepared.conversation_id,
                    %collection,
                    removed,
                    "pruned stale entries"
                );
                report.removed += removed;
            }
        }
        Ok(())
    }
}

// ============ CLI entry point ============

/// `conductor ingest`: ingest every given export, printing one report per
/// platform on stdout.
pub async fn run_ingest(
    config: &Config,
    sources: &[(Platform, PathBuf)],
    reset: bool,
    progress: ProgressMode,
) -> anyhow::Result<()> {
    if sources.is_empty() {
        bail!("Nothing to ingest. Pass at least one of --chatgpt, --gemini, --grok, --antigravity.");
    }

    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let index: Arc<dyn VectorIndex> = Arc::new(SqliteIndex::new(pool.clone()));
    if reset {
        index.reset().await?;
        println!("index reset");
    }

    let provider = create_provider(&config.embedding)?;
    let cache = Arc::new(EmbeddingCache::sqlite(pool.clone()));
    let embedder = Arc::new(CachedEmbedder::new(
        provider,
        cache,
        config.embedding.batch_size,
    ));
    let ingestor = Ingestor::new(
        index,
        embedder,
        Chunker::new(&config.chunking),
        config.ingest.clone(),
    )
    .with_progress(progress.reporter());

    let mut failed = 0;
    for (platform, path) in sources {
        let report = ingestor.ingest_platform(*platform, path).await;
        print_report(&report);
        if !report.is_ok() {
            failed += 1;
        }
    }

    pool.close().await;
    if failed > 0 {
        bail!("{} of {} platform(s) failed to ingest", failed, sources.len());
    }
    println!("ok");
    Ok(())
}

/// `conductor reset`: discard derived data. Raw exports are never touched.
///
/// With a platform, only that platform's entries are removed (from every
/// collection) and the embedding cache is left alone, since cached vectors
/// are keyed by content rather than by source.
pub async fn run_reset(
    config: &Config,
    platform: Option<Platform>,
    keep_cache: bool,
) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let index = SqliteIndex::new(pool.clone());

    match platform {
        Some(p) => {
            let filter = MetadataFilter::platform(Some(p));
            let mut removed = 0;
            for collection in Collection::ALL {
                removed += index.delete(collection, &filter).await?;
            }
            println!("reset {}: removed {} entries", p, removed);
        }
        None => {
            index.reset().await?;
            println!("reset: index cleared");
            if !keep_cache {
                let cleared = EmbeddingCache::sqlite(pool.clone()).clear().await?;
                println!("reset: removed {} cached embeddings", cleared);
            }
        }
    }

    pool.close().await;
    Ok(())
}

fn print_report(report: &PlatformReport) {
    println!("ingest {}", report.platform);
    if let Some(ref e) = report.parse_error {
        println!("  error: {}", e);
        return;
    }
    println!("  conversations: {}", report.conversations);
    println!("  messages: {}", report.messages);
    println!("  code snippets: {}", report.code_snippets);
    println!("  chunks: {}", report.chunks);
    println!("  new entries: {}", report.inserted);
    println!("  already indexed: {}", report.existing);
    if report.removed > 0 {
        println!("  stale entries removed: {}", report.removed);
    }
    println!("  embeddings computed: {}", report.computed);
    println!("  embedding cache hits: {}", report.cache_hits);
    if report.failed_conversations > 0 {
        println!("  failed conversations: {}", report.failed_conversations);
    }
    if let Some(ref e) = report.index_error {
        println!("  index error: {}", e);
    }
}
