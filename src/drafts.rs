//! Draft review: publish into the canonical knowledge store or discard.
//!
//! Publishing commits the knowledge entry first. Deleting the draft row
//! afterwards is best effort: a failed delete is logged and the publish
//! still succeeds. The tenant's index is then marked dirty so the next
//! [`reindex_if_dirty`](crate::indexer::Indexer::reindex_if_dirty) picks up
//! the new entry.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::models::{Draft, KnowledgeEntry};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct PublishResult {
    pub entry: KnowledgeEntry,
    /// False when the draft row could not be removed.
    pub draft_removed: bool,
}

pub struct DraftManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl DraftManager {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn list(&self, tenant_id: &str) -> Result<Vec<Draft>, PipelineError> {
        Ok(self.store.list_drafts(tenant_id).await?)
    }

    /// Publish a reviewed question/answer pair. `draft_id` need not exist
    /// any more; republishing an already-published draft just updates the
    /// entry's answer.
    pub async fn publish(
        &self,
        tenant_id: &str,
        draft_id: &str,
        question: &str,
        answer: &str,
    ) -> Result<PublishResult, PipelineError> {
        let question = question.trim();
        let answer = answer.trim();
        if question.is_empty() {
            return Err(PipelineError::InvalidData("question is required".to_string()));
        }
        if answer.is_empty() {
            return Err(PipelineError::InvalidData("answer is required".to_string()));
        }

        let entry = self
            .store
            .upsert_knowledge(tenant_id, question, answer, self.clock.now())
            .await?;

        let draft_removed = match self.store.delete_draft(tenant_id, draft_id).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(tenant = tenant_id, draft_id, error = %e, "draft delete failed after publish");
                false
            }
        };

        self.store.set_index_dirty(tenant_id, true).await?;
        info!(tenant = tenant_id, draft_id, entry_id = %entry.id, "draft published");

        Ok(PublishResult {
            entry,
            draft_removed,
        })
    }

    /// Delete a draft. Discarding a draft that is already gone succeeds.
    pub async fn discard(&self, tenant_id: &str, draft_id: &str) -> Result<bool, PipelineError> {
        let removed = self.store.delete_draft(tenant_id, draft_id).await?;
        info!(tenant = tenant_id, draft_id, removed, "draft discarded");
        Ok(removed)
    }
}
