use sqlx::SqlitePool;

use crate::error::Result;

/// Create every table and index. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per (collection, platform, conversation, content hash);
    // re-ingesting a conversation hits the unique constraint instead of
    // duplicating, while identical text in another conversation keeps its own
    // row and metadata.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_entries (
            id TEXT PRIMARY KEY,
            collection TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            text TEXT NOT NULL,
            platform TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            title TEXT NOT NULL,
            position INTEGER NOT NULL,
            overlap INTEGER NOT NULL DEFAULT 0,
            timestamp INTEGER NOT NULL,
            language TEXT,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(collection, platform, conversation_id, content_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_cache (
            model TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (model, content_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='entries_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE entries_fts USING fts5(
                entry_id UNINDEXED,
                collection UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_collection_platform ON index_entries(collection, platform)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_conversation ON index_entries(platform, conversation_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
