use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Calls and their utterances
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS calls (
            id TEXT PRIMARY KEY,
            title TEXT,
            started_at INTEGER,
            ingested_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS utterances (
            call_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            speaker TEXT NOT NULL,
            start_ms INTEGER NOT NULL,
            end_ms INTEGER NOT NULL,
            text TEXT NOT NULL,
            PRIMARY KEY (call_id, seq),
            FOREIGN KEY (call_id) REFERENCES calls(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Durable analysis cache
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_cache (
            cache_key TEXT PRIMARY KEY,
            dimension TEXT NOT NULL,
            rubric_version TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            call_id TEXT NOT NULL,
            status TEXT NOT NULL,
            result_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Lookup log for hit-rate reporting
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_lookups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cache_key TEXT NOT NULL,
            dimension TEXT NOT NULL,
            rubric_version TEXT NOT NULL,
            outcome TEXT NOT NULL,
            looked_up_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_analysis_cache_dim_version ON analysis_cache(dimension, rubric_version)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_analysis_cache_content_hash ON analysis_cache(content_hash)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cache_lookups_dimension ON cache_lookups(dimension, looked_up_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
