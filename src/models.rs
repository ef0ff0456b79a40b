//! Core data models that flow through indexing, search, and mining.
//!
//! Every persisted row carries a `tenant_id`; stores scope every read and
//! write by it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Content area a source document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    Scripts,
    Training,
    Faq,
    Kb,
}

impl Module {
    pub const ALL: [Module; 4] = [Module::Scripts, Module::Training, Module::Faq, Module::Kb];

    pub fn as_str(&self) -> &'static str {
        match self {
            Module::Scripts => "scripts",
            Module::Training => "training",
            Module::Faq => "faq",
            Module::Kb => "kb",
        }
    }

    pub fn parse(s: &str) -> Option<Module> {
        Module::ALL.into_iter().find(|m| m.as_str() == s)
    }
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document to be indexed, as supplied by the content modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub tenant_id: String,
    pub module: Module,
    pub source_id: String,
    pub title: String,
    pub body: String,
}

/// A bounded passage of a source document. Immutable once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub tenant_id: String,
    pub module: Module,
    pub source_id: String,
    pub title: String,
    pub content: String,
    pub order_index: i64,
    /// SHA-256 of `content`.
    pub hash: String,
}

/// A chunk paired with its validated embedding, ready for bulk insert.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

/// A chunk returned by a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkMatch {
    pub chunk_id: String,
    pub module: Module,
    pub source_id: String,
    pub title: String,
    pub content: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    AiSearch,
    Manual,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::AiSearch => "ai_search",
            LogSource::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<LogSource> {
        match s {
            "ai_search" => Some(LogSource::AiSearch),
            "manual" => Some(LogSource::Manual),
            _ => None,
        }
    }
}

/// One user query and whether the index could answer it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchLog {
    pub id: String,
    pub tenant_id: String,
    pub query: String,
    pub source: LogSource,
    pub found: bool,
    /// Source ids (`module:source_id`) of the chunks used for the answer.
    pub sources_used: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_run_id: Option<String>,
}

impl SearchLog {
    pub fn new(
        tenant_id: &str,
        query: &str,
        source: LogSource,
        found: bool,
        sources_used: Vec<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            query: query.to_string(),
            source,
            found,
            sources_used,
            created_at,
            processed_at: None,
            processed_run_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Started,
    Completed,
    /// The window held no questions; the attempt still counts for the day.
    Empty,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Completed => "completed",
            RunStatus::Empty => "empty",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "started" => Some(RunStatus::Started),
            "completed" => Some(RunStatus::Completed),
            "empty" => Some(RunStatus::Empty),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// The daily mining guard row. At most one per `(tenant_id, run_date)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MagicRun {
    pub id: String,
    pub tenant_id: String,
    pub run_date: NaiveDate,
    pub status: RunStatus,
    pub period_from: DateTime<Utc>,
    pub period_to: DateTime<Utc>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    CreateDraft,
    SkipAsDuplicate,
    SkipAsAlreadyAnswered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionItem {
    pub canonical_question: String,
    pub merged_questions: Vec<String>,
    pub source_question_ids: Vec<String>,
    pub decision: Decision,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_draft: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionCluster {
    pub cluster_title: String,
    pub reason: String,
    pub items: Vec<SuggestionItem>,
}

/// Parsed result of one mining run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MagicSuggestionPayload {
    pub clusters: Vec<SuggestionCluster>,
}

/// A payload as persisted for a tenant and day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuggestionRecord {
    pub run_id: String,
    pub tenant_id: String,
    pub run_date: NaiveDate,
    pub payload: MagicSuggestionPayload,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    Draft,
}

/// An unpublished question/answer pair proposed by a mining run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Draft {
    pub id: String,
    pub tenant_id: String,
    pub run_id: Option<String>,
    /// Title of the cluster the item came from.
    pub cluster_ref: Option<String>,
    pub status: DraftStatus,
    pub question: String,
    pub answer: String,
    /// 0–100.
    pub confidence: u8,
    pub created_at: DateTime<Utc>,
}

/// A published question/answer pair in the long-lived knowledge store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub tenant_id: String,
    pub question: String,
    pub answer: String,
    pub updated_at: DateTime<Utc>,
}

/// Normalize question text for grouping and keyed upserts: trimmed,
/// lowercased, inner whitespace collapsed to single spaces.
pub fn normalize_question(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_question() {
        assert_eq!(
            normalize_question("  Сколько   стоит\tДОСТАВКА "),
            "сколько стоит доставка"
        );
        assert_eq!(normalize_question("   "), "");
    }

    #[test]
    fn test_module_round_trip_names() {
        for m in Module::ALL {
            assert_eq!(Module::parse(m.as_str()), Some(m));
        }
        assert_eq!(Module::parse("wiki"), None);
    }

    #[test]
    fn test_decision_wire_names() {
        let d: Decision = serde_json::from_str("\"skip_as_already_answered\"").unwrap();
        assert_eq!(d, Decision::SkipAsAlreadyAnswered);
        assert!(serde_json::from_str::<Decision>("\"maybe\"").is_err());
    }
}
