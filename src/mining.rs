//! Daily FAQ mining ("magic") runs.
//!
//! # Run Lifecycle
//!
//! ```text
//! try_insert_run(tenant, today) ──Conflict──▶ AlreadyRan { next_eligible_at }
//!        │ Inserted (status = started)
//!        ▼
//! collect unprocessed questions for [start of today, now]
//!        │ none ──▶ status = empty, Err(NothingToMine)
//!        ▼
//! recent knowledge entries + questions ──▶ one completion call
//!        │ provider error ──▶ status = failed, Err(ServiceUnavailable)
//!        ▼
//! strict JSON parse + id expansion
//!        │ invalid ──▶ status = failed, Err(ContractViolation)
//!        ▼
//! save payload, insert drafts, mark unanswered logs processed
//!        ▼
//! status = completed, Completed(report)
//! ```
//!
//! The only guard against two runs on the same day is the store's
//! conflict-checked insert keyed by `(tenant_id, run_date)`. Every run row
//! counts for the day whatever its final status, so an empty or failed
//! attempt also blocks a same-day retry.
//!
//! "Today" is the calendar day at `mining.utc_offset_minutes`.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::{collect_unprocessed, PriorityCaps, QuestionGroup};
use crate::clock::Clock;
use crate::completion::{ChatMessage, CompletionOptions, CompletionProvider};
use crate::config::Config;
use crate::error::PipelineError;
use crate::models::{
    Decision, Draft, DraftStatus, KnowledgeEntry, MagicRun, MagicSuggestionPayload, RunStatus,
    SuggestionRecord,
};
use crate::store::{RunInsert, Store};

/// Whether a tenant may start a run now.
#[derive(Debug, Clone, Serialize)]
pub struct Eligibility {
    pub allowed: bool,
    pub run_date: NaiveDate,
    /// Now when allowed, otherwise the start of the next local day.
    pub next_eligible_at: DateTime<Utc>,
    pub last_run: Option<MagicRun>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MiningReport {
    pub run_id: String,
    pub run_date: NaiveDate,
    pub payload: MagicSuggestionPayload,
    pub drafts_created: usize,
    pub logs_marked: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MiningOutcome {
    Completed(MiningReport),
    AlreadyRan {
        run_date: NaiveDate,
        next_eligible_at: DateTime<Utc>,
    },
}

/// Local day containing `now`: its date and the UTC instants at which it
/// starts and the next one starts.
pub fn day_bounds(
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> (NaiveDate, DateTime<Utc>, DateTime<Utc>) {
    let date = now.with_timezone(&offset).date_naive();
    let local_midnight = date.and_time(NaiveTime::MIN);
    let start = Utc.from_utc_datetime(
        &(local_midnight - Duration::seconds(i64::from(offset.local_minus_utc()))),
    );
    (date, start, start + Duration::days(1))
}

pub struct MiningOrchestrator {
    store: Arc<dyn Store>,
    completion: Arc<dyn CompletionProvider>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    caps: PriorityCaps,
    knowledge_limit: usize,
    options: CompletionOptions,
}

impl MiningOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        completion: Arc<dyn CompletionProvider>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        let offset = FixedOffset::east_opt(config.mining.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        Self {
            store,
            completion,
            clock,
            offset,
            caps: PriorityCaps::from_config(&config.mining),
            knowledge_limit: config.mining.knowledge_context_limit,
            options: CompletionOptions {
                temperature: config.completion.temperature,
                max_tokens: config.completion.mining_max_tokens,
            },
        }
    }

    pub async fn can_run_today(&self, tenant_id: &str) -> Result<Eligibility, PipelineError> {
        let now = self.clock.now();
        let (run_date, _, next_day) = day_bounds(now, self.offset);
        let last_run = self.store.get_run(tenant_id, run_date).await?;
        Ok(Eligibility {
            allowed: last_run.is_none(),
            run_date,
            next_eligible_at: if last_run.is_none() { now } else { next_day },
            last_run,
        })
    }

    /// Today's persisted payload, if a run has completed.
    pub async fn get_today_suggestions(
        &self,
        tenant_id: &str,
    ) -> Result<Option<SuggestionRecord>, PipelineError> {
        let (run_date, _, _) = day_bounds(self.clock.now(), self.offset);
        Ok(self.store.get_suggestions(tenant_id, run_date).await?)
    }

    pub async fn run_for_today(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<MiningOutcome, PipelineError> {
        let now = self.clock.now();
        let (run_date, day_start, next_day) = day_bounds(now, self.offset);

        let run = MagicRun {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            run_date,
            status: RunStatus::Started,
            period_from: day_start,
            period_to: now,
            created_by: user_id.to_string(),
            created_at: now,
        };

        if self.store.try_insert_run(&run).await? == RunInsert::Conflict {
            info!(tenant = tenant_id, %run_date, "mining already ran today");
            return Ok(MiningOutcome::AlreadyRan {
                run_date,
                next_eligible_at: next_day,
            });
        }
        info!(tenant = tenant_id, run_id = %run.id, %run_date, "mining run started");

        match self.execute(&run).await {
            Ok(report) => {
                self.store
                    .set_run_status(tenant_id, &run.id, RunStatus::Completed)
                    .await?;
                info!(
                    tenant = tenant_id,
                    run_id = %run.id,
                    drafts = report.drafts_created,
                    marked = report.logs_marked,
                    "mining run completed"
                );
                Ok(MiningOutcome::Completed(report))
            }
            Err(e) => {
                let status = match e {
                    PipelineError::NothingToMine => RunStatus::Empty,
                    _ => RunStatus::Failed,
                };
                if status == RunStatus::Failed {
                    error!(tenant = tenant_id, run_id = %run.id, error = %e, "mining run aborted");
                } else {
                    info!(tenant = tenant_id, run_id = %run.id, "nothing to mine today");
                }
                if let Err(se) = self.store.set_run_status(tenant_id, &run.id, status).await {
                    warn!(tenant = tenant_id, run_id = %run.id, error = %se, "could not record run status");
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, run: &MagicRun) -> Result<MiningReport, PipelineError> {
        let tenant_id = run.tenant_id.as_str();

        let groups = collect_unprocessed(
            self.store.as_ref(),
            tenant_id,
            run.period_from,
            run.period_to,
            self.caps,
        )
        .await?;
        if groups.is_empty() {
            return Err(PipelineError::NothingToMine);
        }

        let knowledge = self
            .store
            .recent_knowledge(tenant_id, self.knowledge_limit)
            .await?;

        let messages = build_mining_prompt(&groups, &knowledge)?;
        let raw = self
            .completion
            .complete(&messages, self.options)
            .await
            .map_err(|e| PipelineError::ServiceUnavailable(format!("mining model call failed: {}", e)))?;

        let payload = parse_model_output(&raw)?;
        let payload = expand_items(payload, &groups)?;

        let now = self.clock.now();
        self.store
            .save_suggestions(&SuggestionRecord {
                run_id: run.id.clone(),
                tenant_id: tenant_id.to_string(),
                run_date: run.run_date,
                payload: payload.clone(),
                created_at: now,
            })
            .await?;

        let mut drafts_created = 0usize;
        for cluster in &payload.clusters {
            for item in &cluster.items {
                if item.decision != Decision::CreateDraft {
                    continue;
                }
                let answer = match item.answer_draft.as_deref().map(str::trim) {
                    Some(a) if !a.is_empty() => a,
                    _ => continue,
                };
                self.store
                    .insert_draft(&Draft {
                        id: Uuid::new_v4().to_string(),
                        tenant_id: tenant_id.to_string(),
                        run_id: Some(run.id.clone()),
                        cluster_ref: Some(cluster.cluster_title.clone()),
                        status: DraftStatus::Draft,
                        question: item.canonical_question.trim().to_string(),
                        answer: answer.to_string(),
                        confidence: confidence_percent(item.confidence),
                        created_at: now,
                    })
                    .await?;
                drafts_created += 1;
            }
        }

        let logs_marked = self
            .store
            .mark_unanswered_processed(tenant_id, run.period_from, run.period_to, &run.id, now)
            .await?;

        Ok(MiningReport {
            run_id: run.id.clone(),
            run_date: run.run_date,
            payload,
            drafts_created,
            logs_marked,
        })
    }
}

fn confidence_percent(confidence: f64) -> u8 {
    (confidence * 100.0).round().clamp(0.0, 100.0) as u8
}

const MINING_INSTRUCTIONS: &str = r#"You turn a day's support search questions into FAQ suggestions.

Input: a JSON list of questions, each with an "id", the question "text", how many times it was "asked", and whether search "answered" it; plus the existing FAQ entries.

Rules:
- Normalize phrasing and merge near-duplicate questions into one canonical item. List every merged question text in "merged_questions" and every id you merged in "source_question_ids". Use only ids from the input.
- Set "decision" to one of:
  "create_draft" (a new FAQ entry is worth writing),
  "skip_as_duplicate" (repeats another item in this output),
  "skip_as_already_answered" (an existing FAQ entry already covers it).
- Set "confidence" to a number between 0 and 1.
- Include "answer_draft" only when decision is "create_draft". Write it as a neutral template. Never invent numbers, dates, prices or policies; use placeholders like [PRICE] or [DATE] instead.

Respond with JSON only, no commentary, matching exactly:
{"clusters":[{"cluster_title":"...","reason":"...","items":[{"canonical_question":"...","merged_questions":["..."],"source_question_ids":["..."],"decision":"create_draft","confidence":0.8,"answer_draft":"..."}]}]}"#;

#[derive(Serialize)]
struct PromptQuestion<'a> {
    id: &'a str,
    text: &'a str,
    asked: usize,
    answered: bool,
}

#[derive(Serialize)]
struct PromptKnowledge<'a> {
    question: &'a str,
    answer: &'a str,
}

/// Build the strict-JSON mining prompt.
pub fn build_mining_prompt(
    groups: &[QuestionGroup],
    knowledge: &[KnowledgeEntry],
) -> Result<Vec<ChatMessage>, PipelineError> {
    let questions: Vec<PromptQuestion> = groups
        .iter()
        .map(|g| PromptQuestion {
            id: &g.representative_id,
            text: g.text.trim(),
            asked: g.count,
            answered: g.found,
        })
        .collect();
    let existing: Vec<PromptKnowledge> = knowledge
        .iter()
        .map(|k| PromptKnowledge {
            question: &k.question,
            answer: &k.answer,
        })
        .collect();

    let questions_json = serde_json::to_string_pretty(&questions)
        .map_err(|e| PipelineError::InvalidData(format!("could not encode questions: {}", e)))?;
    let knowledge_json = serde_json::to_string_pretty(&existing)
        .map_err(|e| PipelineError::InvalidData(format!("could not encode knowledge: {}", e)))?;

    Ok(vec![
        ChatMessage::system(MINING_INSTRUCTIONS),
        ChatMessage::user(format!(
            "Existing FAQ entries:\n{}\n\nQuestions:\n{}",
            knowledge_json, questions_json
        )),
    ])
}

/// Remove a surrounding Markdown code fence, with or without a language tag.
pub fn strip_code_fence(raw: &str) -> &str {
    let text = raw.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parse and validate the model's reply.
///
/// Unparseable JSON, missing fields, and empty questions or id lists are a
/// [`PipelineError::ContractViolation`]; nothing is partially accepted.
/// Confidence is clamped into `[0, 1]` (values up to 100 are read as
/// percentages) and `answer_draft` is dropped from items that do not create
/// a draft.
pub fn parse_model_output(raw: &str) -> Result<MagicSuggestionPayload, PipelineError> {
    let body = strip_code_fence(raw);
    let mut payload: MagicSuggestionPayload = serde_json::from_str(body).map_err(|e| {
        PipelineError::ContractViolation(format!("could not parse model output: {}", e))
    })?;

    for (ci, cluster) in payload.clusters.iter_mut().enumerate() {
        for (ii, item) in cluster.items.iter_mut().enumerate() {
            let at = format!("clusters[{}].items[{}]", ci, ii);
            if item.canonical_question.trim().is_empty() {
                return Err(PipelineError::ContractViolation(format!(
                    "{}: canonical_question is empty",
                    at
                )));
            }
            if item.source_question_ids.is_empty() {
                return Err(PipelineError::ContractViolation(format!(
                    "{}: source_question_ids is empty",
                    at
                )));
            }
            if !item.confidence.is_finite() {
                return Err(PipelineError::ContractViolation(format!(
                    "{}: confidence is not a number",
                    at
                )));
            }
            item.confidence = clamp_confidence(item.confidence);
            if item.decision != Decision::CreateDraft && item.answer_draft.is_some() {
                debug!(at = %at, decision = ?item.decision, "dropping answer_draft on non-draft item");
                item.answer_draft = None;
            }
        }
    }
    Ok(payload)
}

fn clamp_confidence(confidence: f64) -> f64 {
    let scaled = if confidence > 1.0 && confidence <= 100.0 {
        confidence / 100.0
    } else {
        confidence
    };
    scaled.clamp(0.0, 1.0)
}

/// Replace each item's ids and merged texts with every member of the
/// groups it references. Ids not shown in the prompt are rejected.
pub fn expand_items(
    mut payload: MagicSuggestionPayload,
    groups: &[QuestionGroup],
) -> Result<MagicSuggestionPayload, PipelineError> {
    for cluster in &mut payload.clusters {
        for item in &mut cluster.items {
            let mut seen_groups: HashSet<&str> = HashSet::new();
            let mut ids = Vec::new();
            let mut texts = Vec::new();
            for id in &item.source_question_ids {
                let group = groups
                    .iter()
                    .find(|g| g.representative_id == *id || g.member_ids.contains(id))
                    .ok_or_else(|| {
                        PipelineError::ContractViolation(format!(
                            "model referenced unknown question id: {}",
                            id
                        ))
                    })?;
                if seen_groups.insert(group.representative_id.as_str()) {
                    ids.extend(group.member_ids.iter().cloned());
                    texts.extend(group.member_texts.iter().map(|t| t.trim().to_string()));
                }
            }
            item.source_question_ids = ids;
            item.merged_questions = texts;
        }
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: &str, members: &[&str], text: &str) -> QuestionGroup {
        QuestionGroup {
            representative_id: id.to_string(),
            normalized: text.to_lowercase(),
            text: text.to_string(),
            member_ids: members.iter().map(|m| m.to_string()).collect(),
            member_texts: members.iter().map(|_| text.to_string()).collect(),
            found: false,
            count: members.len(),
        }
    }

    #[test]
    fn test_day_bounds_with_offset() {
        let offset = FixedOffset::east_opt(5 * 3600).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 20, 30, 0).unwrap();
        let (date, start, next) = day_bounds(now, offset);
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 10, 16).unwrap());
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 10, 15, 19, 0, 0).unwrap());
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 10, 16, 19, 0, 0).unwrap());
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{}\n```\n"), "{}");
        assert_eq!(strip_code_fence("  {\"clusters\":[]} "), "{\"clusters\":[]}");
    }

    #[test]
    fn test_parse_rejects_malformed_output() {
        assert!(matches!(
            parse_model_output("Sure! Here are your clusters."),
            Err(PipelineError::ContractViolation(_))
        ));
        assert!(matches!(
            parse_model_output(r#"{"clusters":[{"cluster_title":"x","items":[]}]}"#),
            Err(PipelineError::ContractViolation(_))
        ));
    }

    fn single_item(decision: &str, confidence: &str, answer: &str) -> String {
        format!(
            r#"{{"clusters":[{{"cluster_title":"c","reason":"r","items":[
            {{"canonical_question":"q","merged_questions":["q"],"source_question_ids":["a"],
             "decision":"{}","confidence":{},"answer_draft":{}}}]}}]}}"#,
            decision, confidence, answer
        )
    }

    #[test]
    fn test_parse_drops_answer_on_skip() {
        let raw = single_item("skip_as_duplicate", "0.4", "\"text\"");
        let payload = parse_model_output(&raw).unwrap();
        let item = &payload.clusters[0].items[0];
        assert_eq!(item.decision, Decision::SkipAsDuplicate);
        assert!(item.answer_draft.is_none());

        let raw = single_item("create_draft", "0.4", "\"text\"");
        let payload = parse_model_output(&raw).unwrap();
        assert_eq!(payload.clusters[0].items[0].answer_draft.as_deref(), Some("text"));
    }

    #[test]
    fn test_parse_clamps_confidence() {
        for (given, expected) in [("85", 85), ("-0.2", 0), ("250", 100), ("0.7", 70)] {
            let raw = single_item("create_draft", given, "\"text\"");
            let payload = parse_model_output(&raw).unwrap();
            let confidence = payload.clusters[0].items[0].confidence;
            assert!((0.0..=1.0).contains(&confidence), "{} -> {}", given, confidence);
            assert_eq!(confidence_percent(confidence), expected, "{}", given);
        }
    }

    #[test]
    fn test_expand_items_covers_all_members() {
        let raw = r#"```json
{"clusters":[{"cluster_title":"Delivery","reason":"asked often","items":[
  {"canonical_question":"How much is delivery?","merged_questions":["how much is delivery"],
   "source_question_ids":["g1","g2","g1"],"decision":"create_draft","confidence":0.9,
   "answer_draft":"Delivery costs [PRICE]."}]}]}
```"#;
        let groups = vec![
            group("g1", &["g1", "m1", "m2"], "how much is delivery"),
            group("g2", &["g2"], "delivery price"),
        ];
        let payload = expand_items(parse_model_output(raw).unwrap(), &groups).unwrap();
        let item = &payload.clusters[0].items[0];
        assert_eq!(item.source_question_ids, vec!["g1", "m1", "m2", "g2"]);
        assert_eq!(item.merged_questions.len(), 4);
    }

    #[test]
    fn test_expand_items_rejects_unknown_ids() {
        let raw = r#"{"clusters":[{"cluster_title":"c","reason":"r","items":[
            {"canonical_question":"q","merged_questions":["q"],"source_question_ids":["nope"],
             "decision":"skip_as_duplicate","confidence":0.2}]}]}"#;
        let groups = vec![group("g1", &["g1"], "q")];
        let err = expand_items(parse_model_output(raw).unwrap(), &groups).unwrap_err();
        assert!(matches!(err, PipelineError::ContractViolation(_)));
    }

    #[test]
    fn test_confidence_percent_clamps() {
        assert_eq!(confidence_percent(0.873), 87);
        assert_eq!(confidence_percent(1.0), 100);
        assert_eq!(confidence_percent(0.0), 0);
    }
}
