//! SQLite-backed [`VectorIndex`].
//!
//! Entries live in `index_entries` with their vector as a little-endian
//! `f32` BLOB; `entries_fts` mirrors the text for FTS5 keyword lookup.
//! Similarity is computed in Rust over the rows of one collection.
//!
//! Writes go through a single async mutex so upserts into the index are
//! serialized; the `UNIQUE(collection, platform, conversation_id,
//! content_hash)` constraint backs that up if another process writes
//! concurrently.

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    rank_order, CollectionStats, Hit, MetadataFilter, PlatformStats, UpsertReport, VectorIndex,
};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Error, Result};
use crate::lexical;
use crate::models::{Collection, EntryMetadata, IndexEntry, Platform, StoredEntry};

pub struct SqliteIndex {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteIndex {
    /// Wrap a pool whose schema has been created by
    /// [`run_migrations`](crate::migrate::run_migrations).
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }
}

const FILTER_CLAUSE: &str = "collection = ? \
     AND (? IS NULL OR platform = ?) \
     AND (? IS NULL OR conversation_id = ?) \
     AND (? IS NULL OR language = ?)";

const ENTRY_COLUMNS: &str = "collection, content_hash, text, platform, conversation_id, title, \
     position, timestamp, language";

/// Bind the parameters of [`FILTER_CLAUSE`], in order.
fn bind_filter<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    collection: Collection,
    filter: &'q MetadataFilter,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let platform = filter.platform.map(|p| p.as_str());
    query
        .bind(collection.as_str())
        .bind(platform)
        .bind(platform)
        .bind(filter.conversation_id.as_deref())
        .bind(filter.conversation_id.as_deref())
        .bind(filter.language.as_deref())
        .bind(filter.language.as_deref())
}

fn stored_entry(row: &SqliteRow) -> Result<StoredEntry> {
    let platform: String = row.get("platform");
    let collection: String = row.get("collection");
    Ok(StoredEntry {
        content_hash: row.get("content_hash"),
        text: row.get("text"),
        position: row.get::<i64, _>("position") as usize,
        metadata: EntryMetadata {
            platform: platform.parse::<Platform>().map_err(Error::Index)?,
            conversation_id: row.get("conversation_id"),
            title: row.get("title"),
            timestamp: row.get("timestamp"),
            collection: collection.parse::<Collection>().map_err(Error::Index)?,
            language: row.get("language"),
        },
    })
}

/// Quote each term so user text cannot inject FTS5 syntax.
fn fts_query(query: &str) -> Option<String> {
    let terms = lexical::query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert(&self, collection: Collection, entries: &[IndexEntry]) -> Result<UpsertReport> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut report = UpsertReport::default();
        let now = chrono::Utc::now().timestamp();

        for e in entries {
            let existing: Option<String> = sqlx::query_scalar(
                "SELECT id FROM index_entries \
                 WHERE collection = ? AND platform = ? AND conversation_id = ? AND content_hash = ?",
            )
            .bind(collection.as_str())
            .bind(e.metadata.platform.as_str())
            .bind(&e.metadata.conversation_id)
            .bind(&e.chunk.content_hash)
            .fetch_optional(&mut *tx)
            .await?;

            let is_new = existing.is_none();
            let id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());

            sqlx::query(
                r#"
                INSERT INTO index_entries (id, collection, content_hash, text, platform,
                                           conversation_id, title, position, overlap,
                                           timestamp, language, model, dims, embedding,
                                           created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, platform, conversation_id, content_hash) DO UPDATE SET
                    title = excluded.title,
                    position = excluded.position,
                    overlap = excluded.overlap,
                    timestamp = excluded.timestamp,
                    language = excluded.language,
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&id)
            .bind(collection.as_str())
            .bind(&e.chunk.content_hash)
            .bind(&e.chunk.text)
            .bind(e.metadata.platform.as_str())
            .bind(&e.metadata.conversation_id)
            .bind(&e.metadata.title)
            .bind(e.chunk.position as i64)
            .bind(e.chunk.overlap as i64)
            .bind(e.metadata.timestamp)
            .bind(e.metadata.language.as_deref())
            .bind(&e.vector.model)
            .bind(e.vector.values.len() as i64)
            .bind(vec_to_blob(&e.vector.values))
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if is_new {
                sqlx::query("INSERT INTO entries_fts (entry_id, collection, text) VALUES (?, ?, ?)")
                    .bind(&id)
                    .bind(collection.as_str())
                    .bind(&e.chunk.text)
                    .execute(&mut *tx)
                    .await?;
                report.inserted += 1;
            } else {
                report.existing += 1;
            }
        }

        tx.commit().await?;
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
        let sql = format!(
            "SELECT {}, embedding FROM index_entries WHERE {} AND model = ?",
            ENTRY_COLUMNS, FILTER_CLAUSE
        );
        let rows = bind_filter(sqlx::query(&sql), collection, filter)
            .bind(model)
            .fetch_all(&self.pool)
            .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            hits.push(Hit {
                entry: stored_entry(row)?,
                score: cosine_similarity(vector, &blob_to_vec(&blob)) as f64,
            });
        }
        hits.sort_by(rank_order);
        hits.truncate(k);
        Ok(hits)
    }

    async fn keyword_candidates(
        &self,
        collection: Collection,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<Hit>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let platform = filter.platform.map(|p| p.as_str());

        let rows = sqlx::query(
            r#"
            SELECT e.collection, e.content_hash, e.text, e.platform, e.conversation_id,
                   e.title, e.position, e.timestamp, e.language, m.rank AS rank
            FROM (
                SELECT entry_id, rank FROM entries_fts
                WHERE entries_fts MATCH ?
            ) m
            JOIN index_entries e ON e.id = m.entry_id
            WHERE e.collection = ?
              AND (? IS NULL OR e.platform = ?)
              AND (? IS NULL OR e.conversation_id = ?)
              AND (? IS NULL OR e.language = ?)
            ORDER BY m.rank
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(collection.as_str())
        .bind(platform)
        .bind(platform)
        .bind(filter.conversation_id.as_deref())
        .bind(filter.conversation_id.as_deref())
        .bind(filter.language.as_deref())
        .bind(filter.language.as_deref())
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                Ok(Hit {
                    entry: stored_entry(row)?,
                    // FTS5 rank is negated BM25: lower is better.
                    score: -rank,
                })
            })
            .collect()
    }

    async fn delete(&self, collection: Collection, filter: &MetadataFilter) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let fts_sql = format!(
            "DELETE FROM entries_fts WHERE entry_id IN (SELECT id FROM index_entries WHERE {})",
            FILTER_CLAUSE
        );
        bind_filter(sqlx::query(&fts_sql), collection, filter)
            .execute(&mut *tx)
            .await?;

        let sql = format!("DELETE FROM index_entries WHERE {}", FILTER_CLAUSE);
        let res = bind_filter(sqlx::query(&sql), collection, filter)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(res.rows_affected())
    }

    async fn prune(
        &self,
        collection: Collection,
        filter: &MetadataFilter,
        keep: &[String],
    ) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT id, content_hash FROM index_entries WHERE {}", FILTER_CLAUSE);
        let rows = bind_filter(sqlx::query(&sql), collection, filter)
            .fetch_all(&mut *tx)
            .await?;

        let mut removed = 0;
        for row in &rows {
            let hash: String = row.get("content_hash");
            if keep.contains(&hash) {
                continue;
            }
            let id: String = row.get("id");
            sqlx::query("DELETE FROM entries_fts WHERE entry_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            removed += sqlx::query("DELETE FROM index_entries WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(removed)
    }

    async fn stats(&self, collection: Collection) -> Result<CollectionStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n,
                   COALESCE(SUM(LENGTH(CAST(text AS BLOB)) + LENGTH(embedding)), 0) AS bytes
            FROM index_entries
            WHERE collection = ?
            "#,
        )
        .bind(collection.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(CollectionStats {
            count: row.get::<i64, _>("n") as u64,
            size_bytes: row.get::<i64, _>("bytes") as u64,
        })
    }

    async fn platform_stats(&self) -> Result<Vec<PlatformStats>> {
        let rows = sqlx::query(
            r#"
            SELECT platform,
                   COUNT(DISTINCT conversation_id) AS conversations,
                   COUNT(*) AS entries
            FROM index_entries
            GROUP BY platform
            ORDER BY platform
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = rows
            .iter()
            .map(|row| {
                let platform: String = row.get("platform");
                Ok(PlatformStats {
                    platform: platform.parse::<Platform>().map_err(Error::Index)?,
                    conversations: row.get::<i64, _>("conversations") as u64,
                    entries: row.get::<i64, _>("entries") as u64,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        stats.sort_by_key(|s| s.platform);
        Ok(stats)
    }

    async fn reset(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM entries_fts")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM index_entries")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::test_support::entry;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn open() -> (TempDir, SqliteIndex) {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("index.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, SqliteIndex::new(pool))
    }

    #[tokio::test]
    async fn upsert_twice_keeps_one_row() {
        let (_tmp, index) = open().await;
        let c = Collection::Conversations;
        let e = entry(c, Platform::ChatGpt, "c1", "USER: hello there", vec![1.0, 0.0, 0.0], 5);
        assert_eq!(index.upsert(c, &[e.clone()]).await.unwrap().inserted, 1);
        assert_eq!(index.upsert(c, &[e]).await.unwrap().existing, 1);
        assert_eq!(index.stats(c).await.unwrap().count, 1);

        let fts_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries_fts")
            .fetch_one(&index.pool)
            .await
            .unwrap();
        assert_eq!(fts_rows, 1);
    }

    #[tokio::test]
    async fn concurrent_duplicate_upserts_converge() {
        let (_tmp, index) = open().await;
        let index = std::sync::Arc::new(index);
        let c = Collection::Conversations;
        let e = entry(c, Platform::Grok, "c1", "same text", vec![0.0, 1.0, 0.0], 1);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let idx = index.clone();
            let e = e.clone();
            handles.push(tokio::spawn(async move { idx.upsert(c, &[e]).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(index.stats(c).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn query_filters_by_platform() {
        let (_tmp, index) = open().await;
        let c = Collection::Conversations;
        index
            .upsert(
                c,
                &[
                    entry(c, Platform::ChatGpt, "a", "alpha", vec![1.0, 0.0, 0.0], 1),
                    entry(c, Platform::Gemini, "b", "beta", vec![1.0, 0.0, 0.0], 2),
                ],
            )
            .await
            .unwrap();
        let hits = index
            .query(
                c,
                &[1.0, 0.0, 0.0],
                "test@3",
                10,
                &MetadataFilter::platform(Some(Platform::ChatGpt)),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.metadata.platform, Platform::ChatGpt);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn keyword_candidates_use_fts() {
        let (_tmp, index) = open().await;
        let c = Collection::Conversations;
        index
            .upsert(
                c,
                &[
                    entry(c, Platform::ChatGpt, "a", "kubernetes ingress controller", vec![1.0, 0.0, 0.0], 1),
                    entry(c, Platform::ChatGpt, "b", "pasta carbonara", vec![0.0, 1.0, 0.0], 2),
                ],
            )
            .await
            .unwrap();
        let hits = index
            .keyword_candidates(c, "ingress \"OR\" (kubernetes", 10, &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.metadata.conversation_id, "a");
    }

    #[tokio::test]
    async fn delete_and_reset() {
        let (_tmp, index) = open().await;
        let c = Collection::Conversations;
        index
            .upsert(
                c,
                &[
                    entry(c, Platform::ChatGpt, "a", "one", vec![1.0, 0.0, 0.0], 1),
                    entry(c, Platform::Grok, "b", "two", vec![1.0, 0.0, 0.0], 2),
                ],
            )
            .await
            .unwrap();
        index
            .upsert(
                Collection::Code,
                &[entry(Collection::Code, Platform::Grok, "b", "fn x() {}", vec![1.0, 0.0, 0.0], 2)],
            )
            .await
            .unwrap();

        let removed = index
            .delete(c, &MetadataFilter::platform(Some(Platform::Grok)))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.stats(c).await.unwrap().count, 1);
        assert_eq!(index.stats(Collection::Code).await.unwrap().count, 1);

        index.reset().await.unwrap();
        assert_eq!(index.stats(c).await.unwrap().count, 0);
        assert_eq!(index.stats(Collection::Code).await.unwrap().count, 0);
        assert!(index.platform_stats().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_text_in_two_conversations_keeps_both_sources() {
        let (_tmp, index) = open().await;
        let c = Collection::Conversations;
        let report = index
            .upsert(
                c,
                &[
                    entry(c, Platform::ChatGpt, "a", "hello there friend", vec![1.0, 0.0, 0.0], 1),
                    entry(c, Platform::Grok, "b", "hello there friend", vec![1.0, 0.0, 0.0], 2),
                ],
            )
            .await
            .unwrap();
        assert_eq!(report.inserted, 2);

        let filter = MetadataFilter::platform(Some(Platform::ChatGpt));
        let hits = index
            .query(c, &[1.0, 0.0, 0.0], "test@3", 5, &filter)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.metadata.conversation_id, "a");
        let keyword = index.keyword_candidates(c, "friend", 5, &filter).await.unwrap();
        assert_eq!(keyword.len(), 1);
        assert_eq!(keyword[0].entry.metadata.platform, Platform::ChatGpt);
    }

    #[tokio::test]
    async fn query_ignores_vectors_from_another_model() {
        let (_tmp, index) = open().await;
        let c = Collection::Conversations;
        let mut wide = entry(c, Platform::ChatGpt, "b", "wider vector", vec![1.0, 0.0, 0.0, 0.0], 0);
        wide.vector.model = "test@4".to_string();
        index
            .upsert(
                c,
                &[entry(c, Platform::ChatGpt, "a", "narrow vector", vec![1.0, 0.0, 0.0], 0), wide],
            )
            .await
            .unwrap();
        let hits = index
            .query(c, &[1.0, 0.0, 0.0], "test@3", 5, &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.metadata.conversation_id, "a");
    }

    #[tokio::test]
    async fn prune_drops_stale_rows_and_their_fts_text() {
        let (_tmp, index) = open().await;
        let c = Collection::Conversations;
        let kept = entry(c, Platform::ChatGpt, "a", "USER: kept turn", vec![1.0, 0.0, 0.0], 0);
        index
            .upsert(
                c,
                &[
                    kept.clone(),
                    entry(c, Platform::ChatGpt, "a", "USER: stale turn", vec![1.0, 0.0, 0.0], 0),
                    entry(c, Platform::Grok, "a", "USER: stale elsewhere", vec![1.0, 0.0, 0.0], 0),
                ],
            )
            .await
            .unwrap();

        let removed = index
            .prune(
                c,
                &MetadataFilter::conversation(Platform::ChatGpt, "a"),
                &[kept.chunk.content_hash],
            )
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.stats(c).await.unwrap().count, 2);
        let stale = index
            .keyword_candidates(c, "stale", 5, &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].entry.metadata.platform, Platform::Grok);
    }

    #[tokio::test]
    async fn language_round_trips_and_filters() {
        let (_tmp, index) = open().await;
        let c = Collection::Code;
        let mut rust = entry(c, Platform::Grok, "a", "fn main() {}", vec![1.0, 0.0, 0.0], 0);
        rust.metadata.language = Some("rust".into());
        let mut python = entry(c, Platform::Grok, "a", "def main(): pass", vec![1.0, 0.0, 0.0], 0);
        python.metadata.language = Some("python".into());
        index.upsert(c, &[rust, python]).await.unwrap();

        let filter = MetadataFilter::default().with_language(Some("Rust"));
        let hits = index
            .query(c, &[1.0, 0.0, 0.0], "test@3", 5, &filter)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.metadata.language.as_deref(), Some("rust"));
        let keyword = index.keyword_candidates(c, "main", 5, &filter).await.unwrap();
        assert_eq!(keyword.len(), 1);
        assert_eq!(keyword[0].entry.text, "fn main() {}");
    }
}
