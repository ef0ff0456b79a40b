//! Retrieval-augmented answering over a tenant's indexed chunks.
//!
//! # Answer Pipeline
//!
//! 1. Embed the query through the retrying [`EmbeddingClient`].
//! 2. Fetch the best `top_k` chunks at or above `threshold` for the tenant.
//! 3. No chunks: return a fixed "not found" reply in the query's language.
//! 4. Otherwise build a grounded prompt (language and list-intent aware) and
//!    call the completion provider once.
//! 5. Log the query with `found` and the source ids used, for mining.
//!
//! An embedding failure fails the whole call as
//! [`PipelineError::ServiceUnavailable`]. A completion failure does not: the
//! retrieved sources are still returned with `answer: None` and the
//! failure described in `error`.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::completion::{ChatMessage, CompletionOptions, CompletionProvider};
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::error::{EmbeddingError, PipelineError};
use crate::models::{ChunkMatch, LogSource, SearchLog};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Kazakh,
    Russian,
    English,
}

impl Language {
    fn instruction(&self) -> &'static str {
        match self {
            Language::Kazakh => "Answer in Kazakh.",
            Language::Russian => "Answer in Russian.",
            Language::English => "Answer in English.",
        }
    }

    pub fn not_found_reply(&self) -> &'static str {
        match self {
            Language::Kazakh => {
                "Кешіріңіз, білім базасынан бұл сұраққа жауап таба алмадым. Сұрақты басқаша тұжырымдап көріңіз."
            }
            Language::Russian => {
                "К сожалению, в базе знаний не нашлось ответа на этот вопрос. Попробуйте переформулировать запрос."
            }
            Language::English => {
                "Sorry, I couldn't find an answer to that in the knowledge base. Try rephrasing the question."
            }
        }
    }
}

const KAZAKH_LETTERS: &str = "әғқңөұүһіӘҒҚҢӨҰҮҺІ";

/// Guess the reply language of a query.
///
/// Any Kazakh-specific Cyrillic letter selects Kazakh; otherwise a majority
/// of Latin letters selects English; everything else is Russian.
pub fn detect_language(query: &str) -> Language {
    if query.chars().any(|c| KAZAKH_LETTERS.contains(c)) {
        return Language::Kazakh;
    }
    let mut latin = 0usize;
    let mut other = 0usize;
    for c in query.chars().filter(|c| c.is_alphabetic()) {
        if c.is_ascii_alphabetic() {
            latin += 1;
        } else {
            other += 1;
        }
    }
    if latin > other {
        Language::English
    } else {
        Language::Russian
    }
}

const LIST_PATTERNS: &[&str] = &[
    "какие виды",
    "какие варианты",
    "какие способы",
    "какие есть",
    "перечисли",
    "список",
    "түрлері",
    "тізім",
    "what types",
    "what kinds",
    "what options",
    "list ",
];

/// Whether the query asks for an enumeration.
///
/// Patterns match only at the start of a word.
pub fn is_list_intent(query: &str) -> bool {
    let q = format!("{} ", query.to_lowercase());
    LIST_PATTERNS.iter().any(|p| {
        q.match_indices(p)
            .any(|(i, _)| !q[..i].chars().next_back().is_some_and(char::is_alphanumeric))
    })
}

/// Build the grounded prompt for one query.
pub fn build_prompt(query: &str, chunks: &[ChunkMatch]) -> Vec<ChatMessage> {
    let language = detect_language(query);
    let mut system = String::from(
        "You are a support assistant. Answer strictly from the context passages provided. \
         If the context does not contain the answer, say so plainly. \
         Never invent prices, dates, numbers, or policies that are not in the context.",
    );
    system.push(' ');
    system.push_str(language.instruction());
    if is_list_intent(query) {
        system.push_str(" Present the answer as an itemized list, one item per line.");
    }

    let mut context = String::new();
    for (i, c) in chunks.iter().enumerate() {
        context.push_str(&format!(
            "[{}] {} ({}:{})\n{}\n\n",
            i + 1,
            c.title,
            c.module,
            c.source_id,
            c.content
        ));
    }

    vec![
        ChatMessage::system(system),
        ChatMessage::user(format!("Context:\n{}Question: {}", context, query.trim())),
    ]
}

/// Result of [`SearchEngine::answer`].
#[derive(Debug, Clone, Serialize)]
pub struct SearchAnswer {
    /// Generated or fixed reply. `None` when context was found but the
    /// completion call failed.
    pub answer: Option<String>,
    pub found: bool,
    pub language: Language,
    pub sources: Vec<ChunkMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SearchEngine {
    store: Arc<dyn Store>,
    embedder: EmbeddingClient,
    completion: Arc<dyn CompletionProvider>,
    clock: Arc<dyn Clock>,
    top_k: usize,
    threshold: f32,
    options: CompletionOptions,
}

impl SearchEngine {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: EmbeddingClient,
        completion: Arc<dyn CompletionProvider>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            embedder,
            completion,
            clock,
            top_k: config.retrieval.top_k,
            threshold: config.retrieval.threshold,
            options: CompletionOptions {
                temperature: config.completion.temperature,
                max_tokens: config.completion.max_tokens,
            },
        }
    }

    pub async fn answer(&self, tenant_id: &str, query: &str) -> Result<SearchAnswer, PipelineError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(PipelineError::InvalidData("query is empty".to_string()));
        }
        let language = detect_language(query);

        let query_vec = self.embedder.embed(query).await.map_err(|e| match e {
            EmbeddingError::Provider(p) => {
                PipelineError::ServiceUnavailable(format!("search is unavailable right now: {}", p))
            }
            other => PipelineError::from(other),
        })?;

        let sources = self
            .store
            .match_chunks(tenant_id, &query_vec, self.threshold, self.top_k)
            .await?;

        if sources.is_empty() {
            self.log(tenant_id, query, false, Vec::new()).await?;
            info!(tenant = tenant_id, "no context found for query");
            return Ok(SearchAnswer {
                answer: Some(language.not_found_reply().to_string()),
                found: false,
                language,
                sources,
                error: None,
            });
        }

        let mut used: Vec<String> = Vec::new();
        for s in &sources {
            let id = format!("{}:{}", s.module, s.source_id);
            if !used.contains(&id) {
                used.push(id);
            }
        }

        let messages = build_prompt(query, &sources);
        let (answer, error) = match self.completion.complete(&messages, self.options).await {
            Ok(text) => (Some(text.trim().to_string()), None),
            Err(e) => {
                warn!(
                    tenant = tenant_id,
                    model = self.completion.model_name(),
                    error = %e,
                    "completion failed; returning sources only"
                );
                (None, Some(format!("answer generation failed: {}", e)))
            }
        };

        self.log(tenant_id, query, true, used).await?;
        info!(tenant = tenant_id, sources = sources.len(), "query answered");

        Ok(SearchAnswer {
            answer,
            found: true,
            language,
            sources,
            error,
        })
    }

    /// Log a query that came from a non-AI search path.
    pub async fn record_manual_query(
        &self,
        tenant_id: &str,
        query: &str,
        found: bool,
    ) -> Result<SearchLog, PipelineError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(PipelineError::InvalidData("query is empty".to_string()));
        }
        let log = SearchLog::new(
            tenant_id,
            query,
            LogSource::Manual,
            found,
            Vec::new(),
            self.clock.now(),
        );
        self.store.insert_search_log(&log).await?;
        Ok(log)
    }

    async fn log(
        &self,
        tenant_id: &str,
        query: &str,
        found: bool,
        sources_used: Vec<String>,
    ) -> Result<(), PipelineError> {
        let log = SearchLog::new(
            tenant_id,
            query,
            LogSource::AiSearch,
            found,
            sources_used,
            self.clock.now(),
        );
        self.store.insert_search_log(&log).await?;
        Ok(())
    }
}
