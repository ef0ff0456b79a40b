//! End-to-end mining runs against both store backends.

mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use common::{harness, morning, test_config, Harness};
use faq_harness::clock::FixedClock;
use faq_harness::error::{PipelineError, ProviderError};
use faq_harness::mining::MiningOutcome;
use faq_harness::models::{Decision, LogSource, RunStatus, SearchLog};
use faq_harness::store::memory::InMemoryStore;
use faq_harness::store::sqlite::SqliteStore;
use faq_harness::store::Store;

const TENANT: &str = "tenant-a";

async fn memory_harness(tmp: &TempDir) -> Harness {
    let cfg = test_config(&tmp.path().join("unused.sqlite"));
    harness(&cfg, Arc::new(InMemoryStore::new()), Arc::new(FixedClock::new(morning())))
}

async fn sqlite_harness(tmp: &TempDir) -> Harness {
    let cfg = test_config(&tmp.path().join("faq.sqlite"));
    let store = SqliteStore::open(&cfg).await.unwrap();
    harness(&cfg, Arc::new(store), Arc::new(FixedClock::new(morning())))
}

async fn log(h: &Harness, tenant: &str, query: &str, found: bool, at: DateTime<Utc>) -> SearchLog {
    let entry = SearchLog::new(tenant, query, LogSource::AiSearch, found, vec![], at);
    h.store().insert_search_log(&entry).await.unwrap();
    entry
}

fn window() -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap();
    (start, start + Duration::days(1))
}

// ─── Duplicate delivery question ────────────────────────────────────

async fn three_duplicates_make_one_item(h: Harness) {
    let base = morning() - Duration::hours(3);
    let ids = [
        log(&h, TENANT, "Сколько стоит доставка", false, base).await.id,
        log(&h, TENANT, "  сколько стоит   доставка", false, base + Duration::minutes(20)).await.id,
        log(&h, TENANT, "СКОЛЬКО СТОИТ ДОСТАВКА", false, base + Duration::hours(1)).await.id,
    ];

    let outcome = h.pipeline.mining.run_for_today(TENANT, "manager").await.unwrap();
    let report = match outcome {
        MiningOutcome::Completed(r) => r,
        other => panic!("expected completed run, got {:?}", other),
    };

    assert_eq!(report.payload.clusters.len(), 1);
    let items = &report.payload.clusters[0].items;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].merged_questions.len(), 3);
    for id in &ids {
        assert!(items[0].source_question_ids.contains(id));
    }
    assert_eq!(items[0].decision, Decision::CreateDraft);
    assert_eq!(report.drafts_created, 1);
    assert_eq!(report.logs_marked, 3);

    let drafts = h.pipeline.drafts.list(TENANT).await.unwrap();
    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0].confidence, 80);
    assert_eq!(drafts[0].run_id.as_deref(), Some(report.run_id.as_str()));

    let stored = h.pipeline.mining.get_today_suggestions(TENANT).await.unwrap().unwrap();
    assert_eq!(stored.payload, report.payload);

    let run = h.store().get_run(TENANT, report.run_date).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.created_by, "manager");
}

#[tokio::test]
async fn test_duplicate_questions_memory() {
    let tmp = TempDir::new().unwrap();
    three_duplicates_make_one_item(memory_harness(&tmp).await).await;
}

#[tokio::test]
async fn test_duplicate_questions_sqlite() {
    let tmp = TempDir::new().unwrap();
    three_duplicates_make_one_item(sqlite_harness(&tmp).await).await;
}

// ─── Processed-flag asymmetry ───────────────────────────────────────

async fn only_unanswered_logs_are_marked(h: Harness) {
    let at = morning() - Duration::hours(1);
    let missed = log(&h, TENANT, "Do you ship to Astana?", false, at).await;
    let answered = log(&h, TENANT, "What are your opening hours?", true, at).await;
    let answered_twice = log(&h, TENANT, "Where is the office?", true, at).await;
    log(&h, TENANT, "where is the office?", true, at).await;

    let outcome = h.pipeline.mining.run_for_today(TENANT, "u1").await.unwrap();
    assert!(matches!(outcome, MiningOutcome::Completed(_)));

    let (from, to) = window();
    let logs = h.store().search_logs(TENANT, from, to).await.unwrap();
    for l in &logs {
        if l.found {
            assert!(l.processed_at.is_none(), "answered log {} was marked", l.query);
        } else {
            assert!(l.processed_at.is_some());
            assert!(l.processed_run_id.is_some());
        }
    }

    let unprocessed: Vec<String> = h
        .store()
        .unprocessed_logs(TENANT, from, to)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.id)
        .collect();
    assert!(unprocessed.contains(&answered.id));
    assert!(unprocessed.contains(&answered_twice.id));
    assert!(!unprocessed.contains(&missed.id));
}

#[tokio::test]
async fn test_processed_asymmetry_memory() {
    let tmp = TempDir::new().unwrap();
    only_unanswered_logs_are_marked(memory_harness(&tmp).await).await;
}

#[tokio::test]
async fn test_processed_asymmetry_sqlite() {
    let tmp = TempDir::new().unwrap();
    only_unanswered_logs_are_marked(sqlite_harness(&tmp).await).await;
}

// ─── Empty window ───────────────────────────────────────────────────

async fn empty_window_still_blocks_the_day(h: Harness) {
    // Yesterday's question and another tenant's are outside the window.
    log(&h, TENANT, "old question", false, morning() - Duration::days(1)).await;
    log(&h, "tenant-b", "other tenant", false, morning()).await;

    let err = h.pipeline.mining.run_for_today(TENANT, "u1").await.unwrap_err();
    assert!(matches!(err, PipelineError::NothingToMine));
    assert_eq!(h.completion.call_count(), 0);
    assert!(h.pipeline.mining.get_today_suggestions(TENANT).await.unwrap().is_none());

    let status = h.pipeline.mining.can_run_today(TENANT).await.unwrap();
    assert!(!status.allowed);
    assert_eq!(status.last_run.as_ref().map(|r| r.status), Some(RunStatus::Empty));
    assert_eq!(
        status.next_eligible_at,
        Utc.with_ymd_and_hms(2026, 10, 17, 0, 0, 0).unwrap()
    );

    log(&h, TENANT, "fresh question", false, morning() + Duration::minutes(5)).await;
    h.clock.advance(Duration::minutes(10));
    let again = h.pipeline.mining.run_for_today(TENANT, "u1").await.unwrap();
    assert!(matches!(again, MiningOutcome::AlreadyRan { .. }));

    h.clock.advance(Duration::days(1));
    assert!(h.pipeline.mining.can_run_today(TENANT).await.unwrap().allowed);
}

#[tokio::test]
async fn test_empty_window_memory() {
    let tmp = TempDir::new().unwrap();
    empty_window_still_blocks_the_day(memory_harness(&tmp).await).await;
}

#[tokio::test]
async fn test_empty_window_sqlite() {
    let tmp = TempDir::new().unwrap();
    empty_window_still_blocks_the_day(sqlite_harness(&tmp).await).await;
}

// ─── Concurrent runs ────────────────────────────────────────────────

async fn race(a: &Harness, b: &Harness) {
    log(a, TENANT, "Can I pay by card?", false, morning() - Duration::hours(2)).await;

    let pa = a.pipeline.clone();
    let pb = b.pipeline.clone();
    let ta = tokio::spawn(async move { pa.mining.run_for_today(TENANT, "u1").await });
    let tb = tokio::spawn(async move { pb.mining.run_for_today(TENANT, "u2").await });
    let (ra, rb) = tokio::join!(ta, tb);
    let outcomes = [ra.unwrap().unwrap(), rb.unwrap().unwrap()];
    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, MiningOutcome::Completed(_)))
        .count();
    let conflicts = outcomes
        .iter()
        .filter(|o| matches!(o, MiningOutcome::AlreadyRan { .. }))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(conflicts, 1);
    assert_eq!(a.completion.call_count() + b.completion.call_count(), 1);
    assert_eq!(a.pipeline.drafts.list(TENANT).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_memory() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp.path().join("unused.sqlite"));
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let clock = Arc::new(FixedClock::new(morning()));
    let a = harness(&cfg, store.clone(), clock.clone());
    let b = harness(&cfg, store, clock);
    race(&a, &b).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_sqlite_separate_pools() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp.path().join("faq.sqlite"));
    let clock = Arc::new(FixedClock::new(morning()));
    let a = harness(&cfg, Arc::new(SqliteStore::open(&cfg).await.unwrap()), clock.clone());
    let b = harness(&cfg, Arc::new(SqliteStore::open(&cfg).await.unwrap()), clock);
    race(&a, &b).await;
}

// ─── Failure paths ──────────────────────────────────────────────────

#[tokio::test]
async fn test_unparseable_output_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let h = sqlite_harness(&tmp).await;
    log(&h, TENANT, "Is there a warranty?", false, morning() - Duration::hours(1)).await;
    h.completion
        .respond_with(|_| Ok("Here are some great FAQ ideas!".to_string()));

    let err = h.pipeline.mining.run_for_today(TENANT, "u1").await.unwrap_err();
    assert!(matches!(err, PipelineError::ContractViolation(_)));

    assert!(h.pipeline.mining.get_today_suggestions(TENANT).await.unwrap().is_none());
    assert!(h.pipeline.drafts.list(TENANT).await.unwrap().is_empty());
    let (from, to) = window();
    assert_eq!(h.store().unprocessed_logs(TENANT, from, to).await.unwrap().len(), 1);

    let status = h.pipeline.mining.can_run_today(TENANT).await.unwrap();
    assert_eq!(status.last_run.map(|r| r.status), Some(RunStatus::Failed));
}

#[tokio::test]
async fn test_unknown_question_id_is_contract_violation() {
    let tmp = TempDir::new().unwrap();
    let h = memory_harness(&tmp).await;
    log(&h, TENANT, "Is there a warranty?", false, morning() - Duration::hours(1)).await;
    h.completion.respond_with(|_| {
        Ok(r#"{"clusters":[{"cluster_title":"x","reason":"y","items":[
            {"canonical_question":"Warranty?","merged_questions":["Warranty?"],
             "source_question_ids":["made-up-id"],"decision":"create_draft",
             "confidence":0.9,"answer_draft":"[TERMS]"}]}]}"#
            .to_string())
    });

    let err = h.pipeline.mining.run_for_today(TENANT, "u1").await.unwrap_err();
    assert!(matches!(err, PipelineError::ContractViolation(_)));
    assert!(h.pipeline.drafts.list(TENANT).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_completion_timeout_is_not_retried() {
    let tmp = TempDir::new().unwrap();
    let h = memory_harness(&tmp).await;
    log(&h, TENANT, "Is there a warranty?", false, morning() - Duration::hours(1)).await;
    h.completion
        .respond_with(|_| Err(ProviderError::Timeout("deadline exceeded".to_string())));

    let err = h.pipeline.mining.run_for_today(TENANT, "u1").await.unwrap_err();
    assert!(matches!(err, PipelineError::ServiceUnavailable(_)));
    assert_eq!(h.completion.call_count(), 1);

    let again = h.pipeline.mining.run_for_today(TENANT, "u1").await.unwrap();
    assert!(matches!(again, MiningOutcome::AlreadyRan { .. }));
    assert_eq!(h.completion.call_count(), 1);
}
