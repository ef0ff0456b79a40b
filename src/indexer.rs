//! Source re-indexing.
//!
//! A re-index is a full replace: the source's existing chunks are deleted,
//! the text is re-chunked and batch-embedded, and the rows are inserted in
//! fixed-size batches. If any batch insert fails the rows already written
//! for that source are deleted again, so a source is never left partially
//! indexed.
//!
//! [`Indexer::reindex_all`] sweeps every source document of a tenant plus
//! its published knowledge entries (as module `faq`). Failures are
//! recorded per source and never stop the sweep.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::chunk::Chunker;
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::error::PipelineError;
use crate::models::{EmbeddedChunk, KnowledgeEntry, Module, SourceDocument};
use crate::store::Store;

/// Per-source failure recorded by a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub module: Module,
    pub source_id: String,
    pub error: String,
}

/// Result of [`Indexer::reindex_all`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReindexSummary {
    pub succeeded: usize,
    pub chunks: usize,
    pub failed: Vec<SourceFailure>,
}

impl ReindexSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Indexer {
    store: Arc<dyn Store>,
    embedder: EmbeddingClient,
    chunker: Chunker,
    insert_batch_size: usize,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: EmbeddingClient,
        chunker: Chunker,
        insert_batch_size: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            chunker,
            insert_batch_size: insert_batch_size.max(1),
        }
    }

    pub fn from_config(store: Arc<dyn Store>, embedder: EmbeddingClient, config: &Config) -> Self {
        Self::new(
            store,
            embedder,
            Chunker::new(config.chunking.max_chars),
            config.indexing.insert_batch_size,
        )
    }

    /// Store a source document and index it.
    pub async fn add_source(&self, doc: &SourceDocument) -> Result<usize, PipelineError> {
        if doc.source_id.trim().is_empty() {
            return Err(PipelineError::InvalidData("source_id is required".to_string()));
        }
        self.store.upsert_source(doc).await?;
        self.reindex_source(&doc.tenant_id, doc.module, &doc.source_id, &doc.title, &doc.body)
            .await
    }

    /// Replace every chunk of one source. Returns the number of chunks
    /// written.
    pub async fn reindex_source(
        &self,
        tenant_id: &str,
        module: Module,
        source_id: &str,
        title: &str,
        text: &str,
    ) -> Result<usize, PipelineError> {
        let removed = self.store.delete_chunks(tenant_id, module, source_id).await?;

        let chunks = self
            .chunker
            .build_chunks(tenant_id, module, source_id, title, text);
        if chunks.is_empty() {
            info!(tenant = tenant_id, %module, source_id, removed, "source has no content; cleared");
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        let rows: Vec<EmbeddedChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| EmbeddedChunk { chunk, embedding })
            .collect();

        for batch in rows.chunks(self.insert_batch_size) {
            if let Err(e) = self.store.insert_chunks(batch).await {
                warn!(
                    tenant = tenant_id,
                    %module,
                    source_id,
                    error = %e,
                    "chunk insert failed; removing partial rows"
                );
                if let Err(cleanup) = self.store.delete_chunks(tenant_id, module, source_id).await {
                    warn!(tenant = tenant_id, source_id, error = %cleanup, "cleanup after failed insert also failed");
                }
                return Err(PipelineError::Storage(e));
            }
        }

        info!(tenant = tenant_id, %module, source_id, removed, chunks = rows.len(), "source reindexed");
        Ok(rows.len())
    }

    /// Re-index every source document and knowledge entry of a tenant.
    pub async fn reindex_all(&self, tenant_id: &str) -> Result<ReindexSummary, PipelineError> {
        let sources = self.store.list_sources(tenant_id).await?;
        let knowledge = self.store.list_knowledge(tenant_id).await?;

        let mut summary = ReindexSummary::default();

        for doc in &sources {
            let result = self
                .reindex_source(tenant_id, doc.module, &doc.source_id, &doc.title, &doc.body)
                .await;
            record(&mut summary, doc.module, &doc.source_id, result);
        }

        for entry in &knowledge {
            let result = self
                .reindex_source(
                    tenant_id,
                    Module::Faq,
                    &entry.id,
                    &entry.question,
                    &knowledge_text(entry),
                )
                .await;
            record(&mut summary, Module::Faq, &entry.id, result);
        }

        info!(
            tenant = tenant_id,
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            chunks = summary.chunks,
            "reindex sweep finished"
        );
        Ok(summary)
    }

    /// Run [`reindex_all`](Self::reindex_all) if the tenant's index is marked
    /// dirty. The flag is cleared only when every source succeeded.
    pub async fn reindex_if_dirty(
        &self,
        tenant_id: &str,
    ) -> Result<Option<ReindexSummary>, PipelineError> {
        if !self.store.is_index_dirty(tenant_id).await? {
            return Ok(None);
        }
        let summary = self.reindex_all(tenant_id).await?;
        if summary.is_complete() {
            self.store.set_index_dirty(tenant_id, false).await?;
        } else {
            warn!(tenant = tenant_id, failed = summary.failed.len(), "index left dirty after partial sweep");
        }
        Ok(Some(summary))
    }
}

fn record(
    summary: &mut ReindexSummary,
    module: Module,
    source_id: &str,
    result: Result<usize, PipelineError>,
) {
    match result {
        Ok(n) => {
            summary.succeeded += 1;
            summary.chunks += n;
        }
        Err(e) => {
            warn!(%module, source_id, error = %e, "source reindex failed");
            summary.failed.push(SourceFailure {
                module,
                source_id: source_id.to_string(),
                error: e.to_string(),
            });
        }
    }
}

fn knowledge_text(entry: &KnowledgeEntry) -> String {
    format!("{}\n\n{}", entry.question, entry.answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingProvider, RetryPolicy};
    use crate::error::ProviderError;
    use crate::store::memory::{Fault, InMemoryStore};
    use async_trait::async_trait;

    struct LengthProvider;

    #[async_trait]
    impl EmbeddingProvider for LengthProvider {
        fn model_name(&self) -> &str {
            "length"
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            Ok(vec![text.len() as f32, 1.0, 0.5])
        }
    }

    fn indexer(store: Arc<InMemoryStore>, batch: usize) -> Indexer {
        let client = EmbeddingClient::new(Arc::new(LengthProvider), 3, RetryPolicy::default(), 2);
        Indexer::new(store, client, Chunker::new(30), batch)
    }

    fn doc(id: &str, paragraphs: usize) -> SourceDocument {
        SourceDocument {
            tenant_id: "t1".to_string(),
            module: Module::Kb,
            source_id: id.to_string(),
            title: id.to_string(),
            body: (0..paragraphs)
                .map(|i| format!("Paragraph number {} here.", i))
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }

    #[tokio::test]
    async fn test_reindex_replaces_instead_of_merging() {
        let store = Arc::new(InMemoryStore::new());
        let idx = indexer(store.clone(), 2);
        idx.add_source(&doc("a", 7)).await.unwrap();
        assert_eq!(store.list_chunks("t1", Module::Kb, "a").await.unwrap().len(), 7);

        idx.add_source(&doc("a", 3)).await.unwrap();
        let chunks = store.list_chunks("t1", Module::Kb, "a").await.unwrap();
        assert_eq!(chunks.len(), 3);
        let order: Vec<i64> = chunks.iter().map(|c| c.order_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_partial_source() {
        let store = Arc::new(InMemoryStore::new());
        let idx = indexer(store.clone(), 2);
        idx.add_source(&doc("a", 5)).await.unwrap();

        store.inject_fault(Fault::ChunkInsert {
            source_id: "a".to_string(),
        });
        let err = idx.add_source(&doc("a", 5)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
        assert!(store.list_chunks("t1", Module::Kb, "a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_continues_past_failed_source() {
        let store = Arc::new(InMemoryStore::new());
        let idx = indexer(store.clone(), 100);
        for id in ["a", "b", "c"] {
            idx.add_source(&doc(id, 2)).await.unwrap();
        }
        store.inject_fault(Fault::ChunkInsert {
            source_id: "b".to_string(),
        });

        let summary = idx.reindex_all("t1").await.unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].source_id, "b");
        assert_eq!(store.list_chunks("t1", Module::Kb, "c").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reindex_if_dirty_consumes_flag() {
        let store = Arc::new(InMemoryStore::new());
        let idx = indexer(store.clone(), 100);
        assert!(idx.reindex_if_dirty("t1").await.unwrap().is_none());

        store
            .upsert_knowledge("t1", "Delivery cost?", "See tariffs.", chrono::Utc::now())
            .await
            .unwrap();
        store.set_index_dirty("t1", true).await.unwrap();

        let summary = idx.reindex_if_dirty("t1").await.unwrap().unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(!store.is_index_dirty("t1").await.unwrap());

        let entry = &store.list_knowledge("t1").await.unwrap()[0];
        assert!(!store
            .list_chunks("t1", Module::Faq, &entry.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_empty_body_clears_source() {
        let store = Arc::new(InMemoryStore::new());
        let idx = indexer(store.clone(), 100);
        idx.add_source(&doc("a", 3)).await.unwrap();
        let n = idx
            .reindex_source("t1", Module::Kb, "a", "a", "   ")
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert!(store.list_chunks("t1", Module::Kb, "a").await.unwrap().is_empty());
    }
}
