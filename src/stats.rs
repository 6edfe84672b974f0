//! Index statistics.
//!
//! Summarizes what is indexed: entries and stored size per collection,
//! conversations and entries per platform, and cached vectors per model.
//! Used by `conductor stats`.

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::db;
use crate::embedding::cache::EmbeddingCache;
use crate::migrate;
use crate::models::Collection;
use crate::store::sqlite::SqliteIndex;
use crate::store::{CollectionStats, PlatformStats, VectorIndex};

#[derive(Debug, Clone, Serialize)]
pub struct CollectionSummary {
    pub collection: Collection,
    #[serde(flatten)]
    pub stats: CollectionStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheSummary {
    pub model: String,
    pub vectors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub collections: Vec<CollectionSummary>,
    pub platforms: Vec<PlatformStats>,
    pub cache: Vec<CacheSummary>,
}

impl IndexSummary {
    pub fn total_entries(&self) -> u64 {
        self.collections.iter().map(|c| c.stats.count).sum()
    }
}

/// Gather statistics from any index backend and cache.
pub async fn summarize(
    index: &dyn VectorIndex,
    cache: &EmbeddingCache,
) -> crate::error::Result<IndexSummary> {
    let mut collections = Vec::with_capacity(Collection::ALL.len());
    for collection in Collection::ALL {
        collections.push(CollectionSummary {
            collection,
            stats: index.stats(collection).await?,
        });
    }
    let cache = cache
        .counts()
        .await?
        .into_iter()
        .map(|(model, vectors)| CacheSummary { model, vectors })
        .collect();

    Ok(IndexSummary {
        collections,
        platforms: index.platform_stats().await?,
        cache,
    })
}

/// `conductor stats`: print a summary of the index.
pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let index = SqliteIndex::new(pool.clone());
    let cache = EmbeddingCache::sqlite(pool.clone());
    let summary = summarize(&index, &cache).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        pool.close().await;
        return Ok(());
    }

    let last_write: Option<i64> = sqlx::query_scalar("SELECT MAX(created_at) FROM index_entries")
        .fetch_one(&pool)
        .await?;
    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Conductor Index Stats");
    println!("=====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Entries:     {}", summary.total_entries());
    println!(
        "  Last write:  {}",
        last_write
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );

    println!();
    println!("  {:<16} {:>8} {:>12}", "COLLECTION", "ENTRIES", "SIZE");
    println!("  {}", "-".repeat(38));
    for c in &summary.collections {
        println!(
            "  {:<16} {:>8} {:>12}",
            c.collection.as_str(),
            c.stats.count,
            format_bytes(c.stats.size_bytes)
        );
    }

    if !summary.platforms.is_empty() {
        println!();
        println!("  {:<16} {:>14} {:>8}", "PLATFORM", "CONVERSATIONS", "ENTRIES");
        println!("  {}", "-".repeat(40));
        for p in &summary.platforms {
            println!(
                "  {:<16} {:>14} {:>8}",
                p.platform.as_str(),
                p.conversations,
                p.entries
            );
        }
    }

    if !summary.cache.is_empty() {
        println!();
        println!("  Embedding cache:");
        for c in &summary.cache {
            println!("    {:<40} {:>8} vectors", c.model, c.vectors);
        }
    }
    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Relative time for recent timestamps ("3 hours ago"), a date otherwise.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        format_ts_iso(ts)
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;
    use crate::store::memory::InMemoryIndex;
    use crate::store::test_support::entry;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn old_timestamps_render_as_dates() {
        assert_eq!(format_ts_relative(0), "1970-01-01 00:00");
        let recent = chrono::Utc::now().timestamp() - 7200;
        assert_eq!(format_ts_relative(recent), "2 hours ago");
    }

    #[tokio::test]
    async fn summary_covers_every_collection() {
        let index = InMemoryIndex::new();
        let c = Collection::Conversations;
        index
            .upsert(
                c,
                &[
                    entry(c, Platform::ChatGpt, "a", "one", vec![1.0, 0.0, 0.0], 0),
                    entry(c, Platform::ChatGpt, "a", "two", vec![1.0, 0.0, 0.0], 0),
                    entry(c, Platform::Grok, "b", "three", vec![1.0, 0.0, 0.0], 0),
                ],
            )
            .await
            .unwrap();
        let cache = EmbeddingCache::in_memory();
        cache.put("m@3", "h", &[0.1, 0.2, 0.3]).await.unwrap();

        let s = summarize(&index, &cache).await.unwrap();
        assert_eq!(s.collections.len(), Collection::ALL.len());
        assert_eq!(s.total_entries(), 3);
        let chatgpt = s.platforms.iter().find(|p| p.platform == Platform::ChatGpt).unwrap();
        assert_eq!((chatgpt.conversations, chatgpt.entries), (1, 2));
        assert_eq!(s.cache.len(), 1);
        assert_eq!(s.cache[0].vectors, 1);
    }
}
