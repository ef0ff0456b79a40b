use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema in the configured database. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_documents (
            tenant_id TEXT NOT NULL,
            module TEXT NOT NULL,
            source_id TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (tenant_id, module, source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vectors are little-endian f32 blobs
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            module TEXT NOT NULL,
            source_id TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            order_index INTEGER NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_logs (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            query TEXT NOT NULL,
            source TEXT NOT NULL,
            found INTEGER NOT NULL,
            sources_used TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            processed_at INTEGER,
            processed_run_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // UNIQUE(tenant_id, run_date) is the once-per-day guard
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS magic_runs (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            run_date TEXT NOT NULL,
            status TEXT NOT NULL,
            period_from INTEGER NOT NULL,
            period_to INTEGER NOT NULL,
            created_by TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(tenant_id, run_date)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS magic_suggestions (
            tenant_id TEXT NOT NULL,
            run_date TEXT NOT NULL,
            run_id TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, run_date)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS drafts (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            run_id TEXT,
            cluster_ref TEXT,
            status TEXT NOT NULL DEFAULT 'draft',
            question TEXT NOT NULL,
            answer TEXT NOT NULL,
            confidence INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_entries (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            normalized_question TEXT NOT NULL,
            question TEXT NOT NULL,
            answer TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(tenant_id, normalized_question)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_state (
            tenant_id TEXT PRIMARY KEY,
            dirty INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(tenant_id, module, source_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_search_logs_window ON search_logs(tenant_id, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_drafts_tenant ON drafts(tenant_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
