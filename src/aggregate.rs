//! Question log aggregation for mining.
//!
//! Unprocessed logs in a window are grouped by normalized query text
//! ([`normalize_question`]) and prioritised: unanswered groups first, then
//! answered groups that repeated, then answered singletons. Each tier and
//! the total are capped.

use chrono::{DateTime, Utc};

use crate::config::MiningConfig;
use crate::models::{normalize_question, SearchLog};
use crate::store::Store;

/// Repetitions of one normalized question.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionGroup {
    /// Id of the first occurrence; the id shown to the model.
    pub representative_id: String,
    pub normalized: String,
    /// Raw text of the first occurrence.
    pub text: String,
    pub member_ids: Vec<String>,
    pub member_texts: Vec<String>,
    /// `found` of the first occurrence.
    pub found: bool,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityCaps {
    pub total: usize,
    pub unanswered: usize,
    pub repeated: usize,
    pub singleton: usize,
}

impl Default for PriorityCaps {
    fn default() -> Self {
        Self {
            total: 200,
            unanswered: 100,
            repeated: 50,
            singleton: 50,
        }
    }
}

impl PriorityCaps {
    pub fn from_config(config: &MiningConfig) -> Self {
        Self {
            total: config.max_questions,
            unanswered: config.unanswered_cap,
            repeated: config.repeated_cap,
            singleton: config.singleton_cap,
        }
    }
}

/// Group logs by normalized text, keeping first-seen order. Logs whose
/// text normalizes to nothing are dropped.
pub fn group_questions(logs: &[SearchLog]) -> Vec<QuestionGroup> {
    let mut groups: Vec<QuestionGroup> = Vec::new();
    for log in logs {
        let normalized = normalize_question(&log.query);
        if normalized.is_empty() {
            continue;
        }
        match groups.iter_mut().find(|g| g.normalized == normalized) {
            Some(g) => {
                g.member_ids.push(log.id.clone());
                g.member_texts.push(log.query.clone());
                g.count += 1;
            }
            None => groups.push(QuestionGroup {
                representative_id: log.id.clone(),
                normalized,
                text: log.query.clone(),
                member_ids: vec![log.id.clone()],
                member_texts: vec![log.query.clone()],
                found: log.found,
                count: 1,
            }),
        }
    }
    groups
}

/// Order groups for the model and apply the caps.
///
/// Within a tier, more frequent groups come first; ties keep first-seen
/// order.
pub fn prioritize(groups: Vec<QuestionGroup>, caps: PriorityCaps) -> Vec<QuestionGroup> {
    let mut unanswered = Vec::new();
    let mut repeated = Vec::new();
    let mut singletons = Vec::new();
    for g in groups {
        if !g.found {
            unanswered.push(g);
        } else if g.count > 1 {
            repeated.push(g);
        } else {
            singletons.push(g);
        }
    }
    unanswered.sort_by(|a, b| b.count.cmp(&a.count));
    repeated.sort_by(|a, b| b.count.cmp(&a.count));

    unanswered
        .into_iter()
        .take(caps.unanswered)
        .chain(repeated.into_iter().take(caps.repeated))
        .chain(singletons.into_iter().take(caps.singleton))
        .take(caps.total)
        .collect()
}

/// Read unprocessed logs in `[from, to]`, group and prioritise them.
pub async fn collect_unprocessed(
    store: &dyn Store,
    tenant_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    caps: PriorityCaps,
) -> anyhow::Result<Vec<QuestionGroup>> {
    let logs = store.unprocessed_logs(tenant_id, from, to).await?;
    Ok(prioritize(group_questions(&logs), caps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogSource;

    fn log(query: &str, found: bool) -> SearchLog {
        SearchLog::new("t1", query, LogSource::AiSearch, found, vec![], Utc::now())
    }

    #[test]
    fn test_grouping_is_case_and_space_insensitive() {
        let logs = vec![
            log("Сколько стоит доставка", false),
            log("  сколько СТОИТ  доставка ", true),
            log("Где офис?", true),
        ];
        let groups = group_questions(&logs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[0].representative_id, logs[0].id);
        assert_eq!(groups[0].member_ids, vec![logs[0].id.clone(), logs[1].id.clone()]);
        assert!(!groups[0].found);
    }

    #[test]
    fn test_priority_tiers_and_caps() {
        let mut logs = Vec::new();
        for i in 0..5 {
            logs.push(log(&format!("answered single {}", i), true));
        }
        for i in 0..3 {
            logs.push(log(&format!("answered twice {}", i), true));
            logs.push(log(&format!("answered twice {}", i), true));
        }
        for i in 0..4 {
            logs.push(log(&format!("missed {}", i), false));
        }

        let caps = PriorityCaps {
            total: 8,
            unanswered: 3,
            repeated: 2,
            singleton: 10,
        };
        let picked = prioritize(group_questions(&logs), caps);
        assert_eq!(picked.len(), 8);
        assert!(picked[..3].iter().all(|g| !g.found));
        assert!(picked[3..5].iter().all(|g| g.found && g.count == 2));
        assert!(picked[5..].iter().all(|g| g.found && g.count == 1));
    }

    #[test]
    fn test_blank_queries_are_dropped() {
        let groups = group_questions(&[log("   ", false)]);
        assert!(groups.is_empty());
    }
}
