//! Storage abstraction for the pipeline.
//!
//! The [`Store`] trait defines every read and write the indexer, search
//! engine, mining orchestrator, and draft manager need, enabling pluggable
//! backends:
//!
//! - [`memory::InMemoryStore`] — `RwLock`-guarded maps, used by tests.
//! - [`sqlite::SqliteStore`] — `sqlx` SQLite with WAL.
//!
//! Every operation takes the tenant it acts for; implementations must never
//! return or modify another tenant's rows.
//!
//! The once-per-day mining guard is [`Store::try_insert_run`]: an atomic,
//! conflict-checked insert keyed by `(tenant_id, run_date)`. Correctness
//! under concurrent requests comes from this constraint alone.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::models::{
    Chunk, ChunkMatch, Draft, EmbeddedChunk, KnowledgeEntry, MagicRun, Module, RunStatus,
    SearchLog, SourceDocument, SuggestionRecord,
};

/// Outcome of the conflict-checked mining run insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunInsert {
    Inserted,
    /// A run already exists for this tenant and day.
    Conflict,
}

/// Abstract storage backend.
///
/// | Area | Methods |
/// |------|---------|
/// | Sources | [`upsert_source`](Store::upsert_source), [`list_sources`](Store::list_sources) |
/// | Chunks | [`delete_chunks`](Store::delete_chunks), [`insert_chunks`](Store::insert_chunks), [`list_chunks`](Store::list_chunks), [`match_chunks`](Store::match_chunks) |
/// | Search logs | [`insert_search_log`](Store::insert_search_log), [`search_logs`](Store::search_logs), [`unprocessed_logs`](Store::unprocessed_logs), [`mark_unanswered_processed`](Store::mark_unanswered_processed) |
/// | Mining | [`try_insert_run`](Store::try_insert_run), [`get_run`](Store::get_run), [`set_run_status`](Store::set_run_status), [`save_suggestions`](Store::save_suggestions), [`get_suggestions`](Store::get_suggestions) |
/// | Drafts | [`insert_draft`](Store::insert_draft), [`list_drafts`](Store::list_drafts), [`delete_draft`](Store::delete_draft) |
/// | Knowledge | [`upsert_knowledge`](Store::upsert_knowledge), [`recent_knowledge`](Store::recent_knowledge), [`list_knowledge`](Store::list_knowledge) |
/// | Index state | [`set_index_dirty`](Store::set_index_dirty), [`is_index_dirty`](Store::is_index_dirty) |
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_source(&self, doc: &SourceDocument) -> Result<()>;

    async fn list_sources(&self, tenant_id: &str) -> Result<Vec<SourceDocument>>;

    /// Delete every chunk of one source. Returns the number removed.
    async fn delete_chunks(&self, tenant_id: &str, module: Module, source_id: &str)
        -> Result<u64>;

    /// Insert one batch of chunks with their embeddings in a single write.
    async fn insert_chunks(&self, rows: &[EmbeddedChunk]) -> Result<()>;

    /// Chunks of one source, ordered by `order_index`.
    async fn list_chunks(
        &self,
        tenant_id: &str,
        module: Module,
        source_id: &str,
    ) -> Result<Vec<Chunk>>;

    /// Nearest-neighbour query: chunks with cosine similarity at or above
    /// `threshold`, best first, at most `top_k`.
    async fn match_chunks(
        &self,
        tenant_id: &str,
        query_vec: &[f32],
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<ChunkMatch>>;

    async fn insert_search_log(&self, log: &SearchLog) -> Result<()>;

    /// All logs created in `[from, to]`, oldest first.
    async fn search_logs(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SearchLog>>;

    /// Logs created in `[from, to]` with no `processed_at`, oldest first.
    async fn unprocessed_logs(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SearchLog>>;

    /// Stamp every unprocessed `found = false` log in `[from, to]` with
    /// `run_id`. Answered logs are left untouched. Returns rows updated.
    async fn mark_unanswered_processed(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        run_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    async fn try_insert_run(&self, run: &MagicRun) -> Result<RunInsert>;

    async fn get_run(&self, tenant_id: &str, run_date: NaiveDate) -> Result<Option<MagicRun>>;

    async fn set_run_status(&self, tenant_id: &str, run_id: &str, status: RunStatus)
        -> Result<()>;

    async fn save_suggestions(&self, record: &SuggestionRecord) -> Result<()>;

    async fn get_suggestions(
        &self,
        tenant_id: &str,
        run_date: NaiveDate,
    ) -> Result<Option<SuggestionRecord>>;

    async fn insert_draft(&self, draft: &Draft) -> Result<()>;

    async fn list_drafts(&self, tenant_id: &str) -> Result<Vec<Draft>>;

    /// Returns whether a row was deleted.
    async fn delete_draft(&self, tenant_id: &str, draft_id: &str) -> Result<bool>;

    /// Insert or update the entry whose normalized question matches.
    async fn upsert_knowledge(
        &self,
        tenant_id: &str,
        question: &str,
        answer: &str,
        at: DateTime<Utc>,
    ) -> Result<KnowledgeEntry>;

    /// Most recently updated entries first.
    async fn recent_knowledge(&self, tenant_id: &str, limit: usize) -> Result<Vec<KnowledgeEntry>>;

    async fn list_knowledge(&self, tenant_id: &str) -> Result<Vec<KnowledgeEntry>>;

    async fn set_index_dirty(&self, tenant_id: &str, dirty: bool) -> Result<()>;

    async fn is_index_dirty(&self, tenant_id: &str) -> Result<bool>;
}
