//! SQLite-backed [`Store`] implementation.
//!
//! Timestamps are stored as Unix milliseconds, run dates as `YYYY-MM-DD`
//! text, vectors as little-endian `f32` blobs. Similarity search is a
//! brute-force cosine scan over the tenant's chunks.
//!
//! The daily mining guard relies on `UNIQUE(tenant_id, run_date)` on
//! `magic_runs`: a unique violation on insert is reported as
//! [`RunInsert::Conflict`].

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::config::Config;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{
    normalize_question, Chunk, ChunkMatch, Draft, DraftStatus, EmbeddedChunk, KnowledgeEntry,
    LogSource, MagicRun, MagicSuggestionPayload, Module, RunStatus, SearchLog, SourceDocument,
    SuggestionRecord,
};
use crate::{db, migrate};

use super::{RunInsert, Store};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and apply the schema.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_module(s: &str) -> Result<Module> {
    Module::parse(s).ok_or_else(|| anyhow!("unknown module in database: {}", s))
}

fn log_from_row(row: &SqliteRow) -> Result<SearchLog> {
    let source: String = row.get("source");
    let sources_json: String = row.get("sources_used");
    let processed_at: Option<i64> = row.get("processed_at");
    Ok(SearchLog {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        query: row.get("query"),
        source: LogSource::parse(&source)
            .ok_or_else(|| anyhow!("unknown log source in database: {}", source))?,
        found: row.get::<i64, _>("found") != 0,
        sources_used: serde_json::from_str(&sources_json)?,
        created_at: from_millis(row.get("created_at"))?,
        processed_at: processed_at.map(from_millis).transpose()?,
        processed_run_id: row.get("processed_run_id"),
    })
}

fn run_from_row(row: &SqliteRow) -> Result<MagicRun> {
    let status: String = row.get("status");
    let run_date: String = row.get("run_date");
    Ok(MagicRun {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        run_date: NaiveDate::parse_from_str(&run_date, DATE_FORMAT)?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown run status in database: {}", status))?,
        period_from: from_millis(row.get("period_from"))?,
        period_to: from_millis(row.get("period_to"))?,
        created_by: row.get("created_by"),
        created_at: from_millis(row.get("created_at"))?,
    })
}

fn draft_from_row(row: &SqliteRow) -> Result<Draft> {
    let confidence: i64 = row.get("confidence");
    Ok(Draft {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        run_id: row.get("run_id"),
        cluster_ref: row.get("cluster_ref"),
        status: DraftStatus::Draft,
        question: row.get("question"),
        answer: row.get("answer"),
        confidence: confidence.clamp(0, 100) as u8,
        created_at: from_millis(row.get("created_at"))?,
    })
}

fn knowledge_from_row(row: &SqliteRow) -> Result<KnowledgeEntry> {
    Ok(KnowledgeEntry {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        question: row.get("question"),
        answer: row.get("answer"),
        updated_at: from_millis(row.get("updated_at"))?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_source(&self, doc: &SourceDocument) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source_documents (tenant_id, module, source_id, title, body)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, module, source_id) DO UPDATE SET
                title = excluded.title,
                body = excluded.body
            "#,
        )
        .bind(&doc.tenant_id)
        .bind(doc.module.as_str())
        .bind(&doc.source_id)
        .bind(&doc.title)
        .bind(&doc.body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_sources(&self, tenant_id: &str) -> Result<Vec<SourceDocument>> {
        let rows = sqlx::query(
            "SELECT tenant_id, module, source_id, title, body FROM source_documents WHERE tenant_id = ? ORDER BY module, source_id",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let module: String = row.get("module");
                Ok(SourceDocument {
                    tenant_id: row.get("tenant_id"),
                    module: parse_module(&module)?,
                    source_id: row.get("source_id"),
                    title: row.get("title"),
                    body: row.get("body"),
                })
            })
            .collect()
    }

    async fn delete_chunks(
        &self,
        tenant_id: &str,
        module: Module,
        source_id: &str,
    ) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM chunks WHERE tenant_id = ? AND module = ? AND source_id = ?")
                .bind(tenant_id)
                .bind(module.as_str())
                .bind(source_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn insert_chunks(&self, rows: &[EmbeddedChunk]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO chunks (id, tenant_id, module, source_id, title, content, order_index, hash, embedding) ",
        );
        builder.push_values(rows, |mut b, row| {
            let c = &row.chunk;
            b.push_bind(c.id.clone())
                .push_bind(c.tenant_id.clone())
                .push_bind(c.module.as_str())
                .push_bind(c.source_id.clone())
                .push_bind(c.title.clone())
                .push_bind(c.content.clone())
                .push_bind(c.order_index)
                .push_bind(c.hash.clone())
                .push_bind(vec_to_blob(&row.embedding));
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn list_chunks(
        &self,
        tenant_id: &str,
        module: Module,
        source_id: &str,
    ) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, module, source_id, title, content, order_index, hash
            FROM chunks
            WHERE tenant_id = ? AND module = ? AND source_id = ?
            ORDER BY order_index ASC
            "#,
        )
        .bind(tenant_id)
        .bind(module.as_str())
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let module: String = row.get("module");
                Ok(Chunk {
                    id: row.get("id"),
                    tenant_id: row.get("tenant_id"),
                    module: parse_module(&module)?,
                    source_id: row.get("source_id"),
                    title: row.get("title"),
                    content: row.get("content"),
                    order_index: row.get("order_index"),
                    hash: row.get("hash"),
                })
            })
            .collect()
    }

    async fn match_chunks(
        &self,
        tenant_id: &str,
        query_vec: &[f32],
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<ChunkMatch>> {
        let rows = sqlx::query(
            "SELECT id, module, source_id, title, content, embedding FROM chunks WHERE tenant_id = ?",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut matches = Vec::new();
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob));
            if similarity < threshold {
                continue;
            }
            let module: String = row.get("module");
            matches.push(ChunkMatch {
                chunk_id: row.get("id"),
                module: parse_module(&module)?,
                source_id: row.get("source_id"),
                title: row.get("title"),
                content: row.get("content"),
                similarity,
            });
        }

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn insert_search_log(&self, log: &SearchLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO search_logs (id, tenant_id, query, source, found, sources_used,
                                     created_at, processed_at, processed_run_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.id)
        .bind(&log.tenant_id)
        .bind(&log.query)
        .bind(log.source.as_str())
        .bind(log.found as i64)
        .bind(serde_json::to_string(&log.sources_used)?)
        .bind(to_millis(log.created_at))
        .bind(log.processed_at.map(to_millis))
        .bind(&log.processed_run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn search_logs(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SearchLog>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM search_logs
            WHERE tenant_id = ? AND created_at >= ? AND created_at <= ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(tenant_id)
        .bind(to_millis(from))
        .bind(to_millis(to))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(log_from_row).collect()
    }

    async fn unprocessed_logs(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SearchLog>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM search_logs
            WHERE tenant_id = ? AND created_at >= ? AND created_at <= ?
              AND processed_at IS NULL
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(tenant_id)
        .bind(to_millis(from))
        .bind(to_millis(to))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(log_from_row).collect()
    }

    async fn mark_unanswered_processed(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        run_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE search_logs
            SET processed_at = ?, processed_run_id = ?
            WHERE tenant_id = ? AND found = 0 AND processed_at IS NULL
              AND created_at >= ? AND created_at <= ?
            "#,
        )
        .bind(to_millis(at))
        .bind(run_id)
        .bind(tenant_id)
        .bind(to_millis(from))
        .bind(to_millis(to))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn try_insert_run(&self, run: &MagicRun) -> Result<RunInsert> {
        let result = sqlx::query(
            r#"
            INSERT INTO magic_runs (id, tenant_id, run_date, status, period_from, period_to,
                                    created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.tenant_id)
        .bind(format_date(run.run_date))
        .bind(run.status.as_str())
        .bind(to_millis(run.period_from))
        .bind(to_millis(run.period_to))
        .bind(&run.created_by)
        .bind(to_millis(run.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(RunInsert::Inserted),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(RunInsert::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_run(&self, tenant_id: &str, run_date: NaiveDate) -> Result<Option<MagicRun>> {
        let row = sqlx::query("SELECT * FROM magic_runs WHERE tenant_id = ? AND run_date = ?")
            .bind(tenant_id)
            .bind(format_date(run_date))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn set_run_status(
        &self,
        tenant_id: &str,
        run_id: &str,
        status: RunStatus,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE magic_runs SET status = ? WHERE tenant_id = ? AND id = ?")
            .bind(status.as_str())
            .bind(tenant_id)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("mining run not found: {}", run_id);
        }
        Ok(())
    }

    async fn save_suggestions(&self, record: &SuggestionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO magic_suggestions (tenant_id, run_date, run_id, payload_json, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, run_date) DO UPDATE SET
                run_id = excluded.run_id,
                payload_json = excluded.payload_json,
                created_at = excluded.created_at
            "#,
        )
        .bind(&record.tenant_id)
        .bind(format_date(record.run_date))
        .bind(&record.run_id)
        .bind(serde_json::to_string(&record.payload)?)
        .bind(to_millis(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_suggestions(
        &self,
        tenant_id: &str,
        run_date: NaiveDate,
    ) -> Result<Option<SuggestionRecord>> {
        let row = sqlx::query(
            "SELECT run_id, payload_json, created_at FROM magic_suggestions WHERE tenant_id = ? AND run_date = ?",
        )
        .bind(tenant_id)
        .bind(format_date(run_date))
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let payload_json: String = row.get("payload_json");
        let payload: MagicSuggestionPayload = serde_json::from_str(&payload_json)?;
        Ok(Some(SuggestionRecord {
            run_id: row.get("run_id"),
            tenant_id: tenant_id.to_string(),
            run_date,
            payload,
            created_at: from_millis(row.get("created_at"))?,
        }))
    }

    async fn insert_draft(&self, draft: &Draft) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO drafts (id, tenant_id, run_id, cluster_ref, status, question, answer,
                                confidence, created_at)
            VALUES (?, ?, ?, ?, 'draft', ?, ?, ?, ?)
            "#,
        )
        .bind(&draft.id)
        .bind(&draft.tenant_id)
        .bind(&draft.run_id)
        .bind(&draft.cluster_ref)
        .bind(&draft.question)
        .bind(&draft.answer)
        .bind(draft.confidence as i64)
        .bind(to_millis(draft.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_drafts(&self, tenant_id: &str) -> Result<Vec<Draft>> {
        let rows =
            sqlx::query("SELECT * FROM drafts WHERE tenant_id = ? ORDER BY created_at DESC, id")
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(draft_from_row).collect()
    }

    async fn delete_draft(&self, tenant_id: &str, draft_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM drafts WHERE tenant_id = ? AND id = ?")
            .bind(tenant_id)
            .bind(draft_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_knowledge(
        &self,
        tenant_id: &str,
        question: &str,
        answer: &str,
        at: DateTime<Utc>,
    ) -> Result<KnowledgeEntry> {
        let question = question.trim();
        let row = sqlx::query(
            r#"
            INSERT INTO knowledge_entries (id, tenant_id, normalized_question, question, answer, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, normalized_question) DO UPDATE SET
                question = excluded.question,
                answer = excluded.answer,
                updated_at = excluded.updated_at
            RETURNING id, tenant_id, question, answer, updated_at
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(tenant_id)
        .bind(normalize_question(question))
        .bind(question)
        .bind(answer)
        .bind(to_millis(at))
        .fetch_one(&self.pool)
        .await?;
        knowledge_from_row(&row)
    }

    async fn recent_knowledge(&self, tenant_id: &str, limit: usize) -> Result<Vec<KnowledgeEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, question, answer, updated_at FROM knowledge_entries
            WHERE tenant_id = ?
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(tenant_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(knowledge_from_row).collect()
    }

    async fn list_knowledge(&self, tenant_id: &str) -> Result<Vec<KnowledgeEntry>> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, question, answer, updated_at FROM knowledge_entries WHERE tenant_id = ? ORDER BY question",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(knowledge_from_row).collect()
    }

    async fn set_index_dirty(&self, tenant_id: &str, dirty: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO index_state (tenant_id, dirty) VALUES (?, ?)
            ON CONFLICT(tenant_id) DO UPDATE SET dirty = excluded.dirty
            "#,
        )
        .bind(tenant_id)
        .bind(dirty as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_index_dirty(&self, tenant_id: &str) -> Result<bool> {
        let dirty: Option<i64> =
            sqlx::query_scalar("SELECT dirty FROM index_state WHERE tenant_id = ?")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(dirty.unwrap_or(0) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store(tmp: &TempDir) -> SqliteStore {
        let config = Config::with_db_path(tmp.path().join("data").join("faq.sqlite"));
        SqliteStore::open(&config).await.unwrap()
    }

    fn embedded(tenant: &str, source_id: &str, idx: i64, vec: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: Chunk {
                id: uuid::Uuid::new_v4().to_string(),
                tenant_id: tenant.to_string(),
                module: Module::Kb,
                source_id: source_id.to_string(),
                title: "Doc".to_string(),
                content: format!("passage {}", idx),
                order_index: idx,
                hash: crate::chunk::hash_text(&format!("passage {}", idx)),
            },
            embedding: vec,
        }
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        migrate::apply(store.pool()).await.unwrap();
        migrate::apply(store.pool()).await.unwrap();
    }

    #[tokio::test]
    async fn test_chunks_round_trip_and_match() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let rows = vec![
            embedded("t1", "doc", 0, vec![1.0, 0.0]),
            embedded("t1", "doc", 1, vec![0.0, 1.0]),
            embedded("t2", "doc", 0, vec![1.0, 0.0]),
        ];
        store.insert_chunks(&rows).await.unwrap();

        let listed = store.list_chunks("t1", Module::Kb, "doc").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].order_index, 0);

        let matches = store.match_chunks("t1", &[1.0, 0.1], 0.5, 5).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].chunk_id, rows[0].chunk.id);

        assert_eq!(store.delete_chunks("t1", Module::Kb, "doc").await.unwrap(), 2);
        assert_eq!(store.list_chunks("t2", Module::Kb, "doc").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_unique_violation_maps_to_conflict() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let now = Utc::now();
        let day = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let make = || MagicRun {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: "t1".to_string(),
            run_date: day,
            status: RunStatus::Started,
            period_from: now,
            period_to: now,
            created_by: "u1".to_string(),
            created_at: now,
        };
        assert_eq!(store.try_insert_run(&make()).await.unwrap(), RunInsert::Inserted);
        assert_eq!(store.try_insert_run(&make()).await.unwrap(), RunInsert::Conflict);

        let run = store.get_run("t1", day).await.unwrap().unwrap();
        store.set_run_status("t1", &run.id, RunStatus::Empty).await.unwrap();
        let run = store.get_run("t1", day).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Empty);
    }

    #[tokio::test]
    async fn test_index_dirty_flag_defaults_to_clean() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        assert!(!store.is_index_dirty("t1").await.unwrap());
        store.set_index_dirty("t1", true).await.unwrap();
        assert!(store.is_index_dirty("t1").await.unwrap());
        assert!(!store.is_index_dirty("t2").await.unwrap());
    }
}
