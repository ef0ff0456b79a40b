//! In-memory [`Store`] implementation for tests.
//!
//! Uses `Vec`s and `HashMap`s behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity over the tenant's stored vectors. The
//! mining-run uniqueness check and insert happen under one write lock, so
//! the guard holds for concurrent tasks in the same process.
//!
//! [`InMemoryStore::inject_fault`] makes selected writes fail, for
//! exercising partial-failure paths.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::embedding::cosine_similarity;
use crate::models::{
    normalize_question, Chunk, ChunkMatch, Draft, EmbeddedChunk, KnowledgeEntry, MagicRun, Module,
    RunStatus, SearchLog, SourceDocument, SuggestionRecord,
};

use super::{RunInsert, Store};

/// Writes that [`InMemoryStore::inject_fault`] can make fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Every chunk insert batch containing this source id.
    ChunkInsert { source_id: String },
    /// Every draft delete.
    DraftDelete,
}

#[derive(Default)]
struct Tables {
    sources: Vec<SourceDocument>,
    chunks: Vec<EmbeddedChunk>,
    logs: Vec<SearchLog>,
    runs: Vec<MagicRun>,
    suggestions: Vec<SuggestionRecord>,
    drafts: Vec<Draft>,
    knowledge: Vec<KnowledgeEntry>,
    dirty: HashMap<String, bool>,
}

/// In-memory store for tests.
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    faults: RwLock<HashSet<Fault>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            faults: RwLock::new(HashSet::new()),
        }
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.faults
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fault);
    }

    fn has_fault(&self, fault: &Fault) -> bool {
        self.faults
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(fault)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn in_window(log: &SearchLog, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
    log.created_at >= from && log.created_at <= to
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_source(&self, doc: &SourceDocument) -> Result<()> {
        let mut t = self.write();
        t.sources.retain(|s| {
            !(s.tenant_id == doc.tenant_id && s.module == doc.module && s.source_id == doc.source_id)
        });
        t.sources.push(doc.clone());
        Ok(())
    }

    async fn list_sources(&self, tenant_id: &str) -> Result<Vec<SourceDocument>> {
        Ok(self
            .read()
            .sources
            .iter()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn delete_chunks(
        &self,
        tenant_id: &str,
        module: Module,
        source_id: &str,
    ) -> Result<u64> {
        let mut t = self.write();
        let before = t.chunks.len();
        t.chunks.retain(|r| {
            !(r.chunk.tenant_id == tenant_id
                && r.chunk.module == module
                && r.chunk.source_id == source_id)
        });
        Ok((before - t.chunks.len()) as u64)
    }

    async fn insert_chunks(&self, rows: &[EmbeddedChunk]) -> Result<()> {
        for row in rows {
            let fault = Fault::ChunkInsert {
                source_id: row.chunk.source_id.clone(),
            };
            if self.has_fault(&fault) {
                bail!("injected chunk insert failure for {}", row.chunk.source_id);
            }
        }
        self.write().chunks.extend(rows.iter().cloned());
        Ok(())
    }

    async fn list_chunks(
        &self,
        tenant_id: &str,
        module: Module,
        source_id: &str,
    ) -> Result<Vec<Chunk>> {
        let mut chunks: Vec<Chunk> = self
            .read()
            .chunks
            .iter()
            .filter(|r| {
                r.chunk.tenant_id == tenant_id
                    && r.chunk.module == module
                    && r.chunk.source_id == source_id
            })
            .map(|r| r.chunk.clone())
            .collect();
        chunks.sort_by_key(|c| c.order_index);
        Ok(chunks)
    }

    async fn match_chunks(
        &self,
        tenant_id: &str,
        query_vec: &[f32],
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<ChunkMatch>> {
        let t = self.read();
        let mut matches: Vec<ChunkMatch> = t
            .chunks
            .iter()
            .filter(|r| r.chunk.tenant_id == tenant_id)
            .filter_map(|r| {
                let similarity = cosine_similarity(query_vec, &r.embedding);
                (similarity >= threshold).then(|| ChunkMatch {
                    chunk_id: r.chunk.id.clone(),
                    module: r.chunk.module,
                    source_id: r.chunk.source_id.clone(),
                    title: r.chunk.title.clone(),
                    content: r.chunk.content.clone(),
                    similarity,
                })
            })
            .collect();
        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn insert_search_log(&self, log: &SearchLog) -> Result<()> {
        self.write().logs.push(log.clone());
        Ok(())
    }

    async fn search_logs(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SearchLog>> {
        let mut logs: Vec<SearchLog> = self
            .read()
            .logs
            .iter()
            .filter(|l| l.tenant_id == tenant_id && in_window(l, from, to))
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.created_at);
        Ok(logs)
    }

    async fn unprocessed_logs(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SearchLog>> {
        let mut logs = self.search_logs(tenant_id, from, to).await?;
        logs.retain(|l| l.processed_at.is_none());
        Ok(logs)
    }

    async fn mark_unanswered_processed(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        run_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut t = self.write();
        let mut updated = 0u64;
        for log in t.logs.iter_mut().filter(|l| {
            l.tenant_id == tenant_id && !l.found && l.processed_at.is_none() && in_window(l, from, to)
        }) {
            log.processed_at = Some(at);
            log.processed_run_id = Some(run_id.to_string());
            updated += 1;
        }
        Ok(updated)
    }

    async fn try_insert_run(&self, run: &MagicRun) -> Result<RunInsert> {
        let mut t = self.write();
        if t
            .runs
            .iter()
            .any(|r| r.tenant_id == run.tenant_id && r.run_date == run.run_date)
        {
            return Ok(RunInsert::Conflict);
        }
        t.runs.push(run.clone());
        Ok(RunInsert::Inserted)
    }

    async fn get_run(&self, tenant_id: &str, run_date: NaiveDate) -> Result<Option<MagicRun>> {
        Ok(self
            .read()
            .runs
            .iter()
            .find(|r| r.tenant_id == tenant_id && r.run_date == run_date)
            .cloned())
    }

    async fn set_run_status(
        &self,
        tenant_id: &str,
        run_id: &str,
        status: RunStatus,
    ) -> Result<()> {
        let mut t = self.write();
        match t
            .runs
            .iter_mut()
            .find(|r| r.tenant_id == tenant_id && r.id == run_id)
        {
            Some(run) => {
                run.status = status;
                Ok(())
            }
            None => bail!("mining run not found: {}", run_id),
        }
    }

    async fn save_suggestions(&self, record: &SuggestionRecord) -> Result<()> {
        let mut t = self.write();
        t.suggestions
            .retain(|s| !(s.tenant_id == record.tenant_id && s.run_date == record.run_date));
        t.suggestions.push(record.clone());
        Ok(())
    }

    async fn get_suggestions(
        &self,
        tenant_id: &str,
        run_date: NaiveDate,
    ) -> Result<Option<SuggestionRecord>> {
        Ok(self
            .read()
            .suggestions
            .iter()
            .find(|s| s.tenant_id == tenant_id && s.run_date == run_date)
            .cloned())
    }

    async fn insert_draft(&self, draft: &Draft) -> Result<()> {
        self.write().drafts.push(draft.clone());
        Ok(())
    }

    async fn list_drafts(&self, tenant_id: &str) -> Result<Vec<Draft>> {
        let mut drafts: Vec<Draft> = self
            .read()
            .drafts
            .iter()
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .collect();
        drafts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(drafts)
    }

    async fn delete_draft(&self, tenant_id: &str, draft_id: &str) -> Result<bool> {
        if self.has_fault(&Fault::DraftDelete) {
            bail!("injected draft delete failure for {}", draft_id);
        }
        let mut t = self.write();
        let before = t.drafts.len();
        t.drafts
            .retain(|d| !(d.tenant_id == tenant_id && d.id == draft_id));
        Ok(t.drafts.len() < before)
    }

    async fn upsert_knowledge(
        &self,
        tenant_id: &str,
        question: &str,
        answer: &str,
        at: DateTime<Utc>,
    ) -> Result<KnowledgeEntry> {
        let key = normalize_question(question);
        let mut t = self.write();
        if let Some(entry) = t
            .knowledge
            .iter_mut()
            .find(|k| k.tenant_id == tenant_id && normalize_question(&k.question) == key)
        {
            entry.question = question.trim().to_string();
            entry.answer = answer.to_string();
            entry.updated_at = at;
            return Ok(entry.clone());
        }
        let entry = KnowledgeEntry {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            question: question.trim().to_string(),
            answer: answer.to_string(),
            updated_at: at,
        };
        t.knowledge.push(entry.clone());
        Ok(entry)
    }

    async fn recent_knowledge(&self, tenant_id: &str, limit: usize) -> Result<Vec<KnowledgeEntry>> {
        let mut entries = self.list_knowledge(tenant_id).await?;
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn list_knowledge(&self, tenant_id: &str) -> Result<Vec<KnowledgeEntry>> {
        Ok(self
            .read()
            .knowledge
            .iter()
            .filter(|k| k.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn set_index_dirty(&self, tenant_id: &str, dirty: bool) -> Result<()> {
        self.write().dirty.insert(tenant_id.to_string(), dirty);
        Ok(())
    }

    async fn is_index_dirty(&self, tenant_id: &str) -> Result<bool> {
        Ok(self.read().dirty.get(tenant_id).copied().unwrap_or(false))
    }
}
