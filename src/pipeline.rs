//! Component wiring.
//!
//! [`Pipeline`] owns one instance of each service, all sharing the same
//! store, providers, and clock. The CLI and HTTP server both go through it.

use std::sync::Arc;

use anyhow::Result;

use crate::clock::{Clock, SystemClock};
use crate::completion::{create_completion, CompletionProvider};
use crate::config::Config;
use crate::drafts::DraftManager;
use crate::embedding::{create_provider, EmbeddingClient, EmbeddingProvider, RetryPolicy};
use crate::indexer::Indexer;
use crate::mining::MiningOrchestrator;
use crate::search::SearchEngine;
use crate::store::sqlite::SqliteStore;
use crate::store::Store;

pub struct Pipeline {
    pub store: Arc<dyn Store>,
    pub indexer: Indexer,
    pub search: SearchEngine,
    pub mining: MiningOrchestrator,
    pub drafts: DraftManager,
}

impl Pipeline {
    /// Open the configured SQLite database and build providers from config.
    pub async fn open(config: &Config) -> Result<Self> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(config).await?);
        let embedder = create_provider(&config.embedding)?;
        let completion = create_completion(&config.completion)?;
        Ok(Self::from_parts(
            config,
            store,
            embedder,
            completion,
            Arc::new(SystemClock),
        ))
    }

    /// Assemble a pipeline from explicit collaborators.
    pub fn from_parts(
        config: &Config,
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        completion: Arc<dyn CompletionProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let client = EmbeddingClient::new(
            embedder,
            config.embedding.dims,
            RetryPolicy::from_config(&config.embedding),
            config.embedding.concurrency,
        );

        let indexer = Indexer::from_config(store.clone(), client.clone(), config);
        let search = SearchEngine::new(
            store.clone(),
            client,
            completion.clone(),
            clock.clone(),
            config,
        );
        let mining = MiningOrchestrator::new(store.clone(), completion, clock.clone(), config);
        let drafts = DraftManager::new(store.clone(), clock);

        Self {
            store,
            indexer,
            search,
            mining,
            drafts,
        }
    }
}
