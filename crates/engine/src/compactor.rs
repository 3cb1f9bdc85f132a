//! Structured history compaction.
//!
//! Only the part of history older than the tail is compacted, and only
//! the slice not already covered by a previous compaction pass. The
//! LLM path produces a structured summary; without an LLM (or on
//! failure) a deterministic merger extends the previous compact.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use sf_domain::snapshot::{CompactionMeta, HistoryCompact, HistoryTurn};
use sf_llm::LlmClient;

const COMPACTION_VERSION: &str = "1.0";
const MAX_LIST_ITEMS: usize = 10;

/// Context for the deterministic fallback path.
#[derive(Debug, Default)]
pub struct FallbackContext {
    pub collected_data: serde_json::Map<String, serde_json::Value>,
    pub objection_intents: Vec<String>,
}

pub struct HistoryCompactor;

impl HistoryCompactor {
    /// Compact history, returning `(compact, meta)`.
    pub async fn compact(
        history_full: &[HistoryTurn],
        tail_size: usize,
        previous_compact: Option<&HistoryCompact>,
        previous_meta: Option<&CompactionMeta>,
        llm: Option<&Arc<LlmClient>>,
        fallback_context: &FallbackContext,
    ) -> (HistoryCompact, CompactionMeta) {
        let tail = tail_size.min(history_full.len());
        let history_old = &history_full[..history_full.len() - tail];

        let already_compacted = previous_meta
            .map(|m| m.compacted_turns.min(history_old.len()))
            .unwrap_or(0);
        let new_old = &history_old[already_compacted..];

        let mut compact: Option<HistoryCompact> = None;
        let mut llm_model = None;

        if !new_old.is_empty() {
            if let Some(llm) = llm {
                llm_model = Some(llm.model().to_owned());
                let prompt = build_prompt(previous_compact, new_old);
                match llm.generate_structured::<HistoryCompact>(&prompt).await {
                    Ok(result) => compact = Some(cap_lists(result)),
                    Err(err) => {
                        tracing::warn!(error = %err, "history compaction via LLM failed");
                    }
                }
            }
        }

        let compact = compact.unwrap_or_else(|| {
            deterministic_compact(history_old, previous_compact, fallback_context)
        });

        let meta = CompactionMeta {
            compacted_turns: history_old.len(),
            tail_size: tail,
            compacted_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            compaction_version: COMPACTION_VERSION.into(),
            llm_model,
        };

        (compact, meta)
    }
}

fn build_prompt(previous: Option<&HistoryCompact>, new_old: &[HistoryTurn]) -> String {
    let previous_json =
        serde_json::to_string(&previous).unwrap_or_else(|_| "null".into());
    let messages_json = serde_json::to_string(new_old).unwrap_or_else(|_| "[]".into());
    format!(
        "Ты суммаризатор CRM-диалога. Обнови сжатую историю.\n\
         Верни JSON с ключами: summary, key_facts, objections, decisions, \
         open_questions, next_steps (каждый — список строк, не больше 10).\n\
         - summary: 5-10 коротких утверждений.\n\
         - сохраняй факты о клиенте и договорённости.\n\
         - последние сообщения не включай, они переданы отдельно.\n\n\
         Предыдущая сжатая история (JSON или null):\n{previous_json}\n\n\
         Новые старые сообщения (хронологически):\n{messages_json}\n"
    )
}

/// Deterministic merger: extend the previous compact with counted facts
/// and objections from the session state.
fn deterministic_compact(
    history_old: &[HistoryTurn],
    previous: Option<&HistoryCompact>,
    ctx: &FallbackContext,
) -> HistoryCompact {
    let mut compact = previous.cloned().unwrap_or_default();

    if !history_old.is_empty() {
        compact
            .summary
            .push(format!("Сжато {} ранних ходов диалога.", history_old.len()));
    }

    for (key, value) in &ctx.collected_data {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            other => other.to_string(),
        };
        if !rendered.is_empty() {
            compact.key_facts.push(format!("{key}: {rendered}"));
        }
    }

    for objection in &ctx.objection_intents {
        compact.objections.push(objection.clone());
    }

    cap_lists(compact)
}

/// De-duplicate preserving order and cap every list at 10.
fn cap_lists(mut compact: HistoryCompact) -> HistoryCompact {
    for list in [
        &mut compact.summary,
        &mut compact.key_facts,
        &mut compact.objections,
        &mut compact.decisions,
        &mut compact.open_questions,
        &mut compact.next_steps,
    ] {
        let mut seen = std::collections::HashSet::new();
        list.retain(|item| seen.insert(item.clone()));
        list.truncate(MAX_LIST_ITEMS);
    }
    compact
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(n: usize) -> Vec<HistoryTurn> {
        (0..n)
            .map(|i| HistoryTurn {
                user: format!("вопрос {i}"),
                bot: format!("ответ {i}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn deterministic_path_counts_and_merges() {
        let mut ctx = FallbackContext::default();
        ctx.collected_data.insert(
            "company_name".into(),
            serde_json::Value::String("ТехноМаркет".into()),
        );
        ctx.objection_intents.push("objection_price".into());

        let (compact, meta) =
            HistoryCompactor::compact(&history(10), 4, None, None, None, &ctx).await;

        assert_eq!(meta.compacted_turns, 6);
        assert_eq!(meta.tail_size, 4);
        assert!(meta.llm_model.is_none());
        assert!(compact.summary.iter().any(|s| s.contains("6")));
        assert!(compact.key_facts.iter().any(|f| f.contains("ТехноМаркет")));
        assert_eq!(compact.objections, vec!["objection_price"]);
    }

    #[tokio::test]
    async fn incremental_compaction_skips_already_compacted() {
        let full = history(12);
        let ctx = FallbackContext::default();
        let (first, meta1) = HistoryCompactor::compact(&full[..8], 4, None, None, None, &ctx).await;
        assert_eq!(meta1.compacted_turns, 4);

        let (second, meta2) =
            HistoryCompactor::compact(&full, 4, Some(&first), Some(&meta1), None, &ctx).await;
        assert_eq!(meta2.compacted_turns, 8);
        // The merged summary dedups the previous entry.
        assert!(second.summary.len() <= 10);
    }

    #[tokio::test]
    async fn lists_are_deduped_and_capped() {
        let mut ctx = FallbackContext::default();
        for _ in 0..3 {
            ctx.objection_intents.push("objection_price".into());
        }
        let mut previous = HistoryCompact::default();
        for i in 0..15 {
            previous.key_facts.push(format!("факт {i}"));
        }

        let (compact, _) =
            HistoryCompactor::compact(&history(8), 4, Some(&previous), None, None, &ctx).await;
        assert_eq!(compact.objections, vec!["objection_price"]);
        assert!(compact.key_facts.len() <= 10);
    }

    #[tokio::test]
    async fn short_history_compacts_nothing() {
        let ctx = FallbackContext::default();
        let (compact, meta) =
            HistoryCompactor::compact(&history(3), 4, None, None, None, &ctx).await;
        assert_eq!(meta.compacted_turns, 0);
        assert_eq!(meta.tail_size, 3);
        assert!(compact.summary.is_empty());
    }
}
