#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use faq_harness::clock::FixedClock;
use faq_harness::completion::{ChatMessage, CompletionOptions, CompletionProvider};
use faq_harness::config::Config;
use faq_harness::embedding::EmbeddingProvider;
use faq_harness::error::ProviderError;
use faq_harness::pipeline::Pipeline;
use faq_harness::store::Store;

pub const DIMS: usize = 64;

/// Bag-of-words embedding: each lowercased word bumps one hashed bucket.
/// Texts sharing words point in similar directions.
pub struct WordEmbedder {
    pub calls: AtomicUsize,
    fail_with: Mutex<Option<ProviderError>>,
}

impl WordEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_with: Mutex::new(None),
        }
    }

    pub fn fail_with(&self, err: Option<ProviderError>) {
        *self.fail_with.lock().unwrap() = err;
    }
}

pub fn word_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut h = DefaultHasher::new();
        word.to_lowercase().hash(&mut h);
        v[(h.finish() % DIMS as u64) as usize] += 1.0;
    }
    v[DIMS - 1] += 0.01;
    v
}

#[async_trait]
impl EmbeddingProvider for WordEmbedder {
    fn model_name(&self) -> &str {
        "words"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(word_vector(text))
    }
}

type Responder = Box<dyn Fn(&[ChatMessage]) -> Result<String, ProviderError> + Send + Sync>;

/// Completion fake driven by a closure; counts calls.
pub struct ScriptedCompletion {
    pub calls: AtomicUsize,
    responder: Mutex<Responder>,
}

impl ScriptedCompletion {
    pub fn new(
        f: impl Fn(&[ChatMessage]) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            responder: Mutex::new(Box::new(f)),
        }
    }

    pub fn respond_with(
        &self,
        f: impl Fn(&[ChatMessage]) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) {
        *self.responder.lock().unwrap() = Box::new(f);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedCompletion {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _options: CompletionOptions,
    ) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let responder = self.responder.lock().unwrap();
        (*responder)(messages)
    }
}

/// Question entries (`id`, `text`, `asked`, `answered`) from a mining prompt.
pub fn prompt_questions(messages: &[ChatMessage]) -> Vec<Value> {
    let user = &messages[1].content;
    let json_part = user.split("Questions:\n").nth(1).expect("questions section");
    serde_json::from_str(json_part).expect("questions json")
}

/// A well-behaved mining model: one item per question shown, drafts for
/// unanswered ones, answers fenced in a ```json block.
pub fn miner_reply(messages: &[ChatMessage]) -> Result<String, ProviderError> {
    let items: Vec<Value> = prompt_questions(messages)
        .into_iter()
        .map(|q| {
            let answered = q["answered"].as_bool().unwrap_or(false);
            let mut item = json!({
                "canonical_question": q["text"],
                "merged_questions": [q["text"]],
                "source_question_ids": [q["id"]],
                "decision": if answered { "skip_as_already_answered" } else { "create_draft" },
                "confidence": 0.8,
            });
            if !answered {
                item["answer_draft"] = json!("Please see [LINK] for details.");
            }
            item
        })
        .collect();
    let payload = json!({
        "clusters": [{ "cluster_title": "Today", "reason": "asked by customers", "items": items }]
    });
    Ok(format!("```json\n{}\n```", payload))
}

/// Chat reply for search: echoes the first context passage.
pub fn echo_reply(messages: &[ChatMessage]) -> Result<String, ProviderError> {
    Ok(format!("Based on the docs: {}", messages[1].content.lines().nth(2).unwrap_or("")))
}

pub fn morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 10, 0, 0).unwrap()
}

pub fn test_config(db_path: &Path) -> Config {
    let mut cfg = Config::with_db_path(db_path);
    cfg.embedding.dims = DIMS;
    cfg.embedding.base_delay_ms = 1;
    cfg.embedding.max_delay_ms = 4;
    cfg.embedding.jitter_ms = 0;
    cfg.chunking.max_chars = 200;
    cfg.retrieval.threshold = 0.3;
    cfg
}

pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub embedder: Arc<WordEmbedder>,
    pub completion: Arc<ScriptedCompletion>,
    pub clock: Arc<FixedClock>,
}

impl Harness {
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.pipeline.store
    }
}

pub fn harness(config: &Config, store: Arc<dyn Store>, clock: Arc<FixedClock>) -> Harness {
    let embedder = Arc::new(WordEmbedder::new());
    let completion = Arc::new(ScriptedCompletion::new(miner_reply));
    let pipeline = Pipeline::from_parts(
        config,
        store,
        embedder.clone(),
        completion.clone(),
        clock.clone(),
    );
    Harness {
        pipeline: Arc::new(pipeline),
        embedder,
        completion,
        clock,
    }
}
