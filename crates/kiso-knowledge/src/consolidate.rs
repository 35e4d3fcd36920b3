//! Consolidation safety gates.
//!
//! The facts summarizer is an LLM; before its output replaces the table, a
//! set of mechanical gates protects against a model having a bad day. All
//! gates are pure functions so they are testable without a model.

use tracing::warn;

use kiso_brain::types::ConsolidatedFact;
use kiso_core::types::{FactCategory, FactSource};
use kiso_store::{FactRow, NewFact};

/// Minimum length (in trimmed characters) for a consolidated fact to be kept.
const MIN_FACT_CHARS: usize = 3;

/// Apply all gates. Returns `None` when consolidation must be aborted and
/// the original facts kept.
///
/// Gates, in order:
/// 1. size floor — fewer than `min_ratio × |original|` survivors aborts the
///    whole consolidation (a collapse that sharp is a model failure, not a
///    cleanup);
/// 2. per-entry length floor — entries under 3 characters are dropped;
/// 3. confidence clamped into `[0.0, 1.0]`;
/// 4. provenance — a `user` fact may only carry a session that already
///    existed among the original user facts (None counts as a scope);
///    entries that would silently globalize or re-scope are dropped.
pub fn apply_consolidation_gates(
    original: &[FactRow],
    proposed: Vec<ConsolidatedFact>,
    min_ratio: f64,
) -> Option<Vec<NewFact>> {
    let floor = (original.len() as f64 * min_ratio).ceil() as usize;
    if proposed.len() < floor {
        warn!(
            original = original.len(),
            proposed = proposed.len(),
            floor,
            "consolidation aborted: result set too small"
        );
        return None;
    }

    let user_scopes: Vec<Option<&str>> = original
        .iter()
        .filter(|f| f.category == FactCategory::User)
        .map(|f| f.session.as_deref())
        .collect();

    let mut kept = Vec::with_capacity(proposed.len());
    for fact in proposed {
        if fact.content.trim().len() < MIN_FACT_CHARS {
            continue;
        }
        if fact.category == FactCategory::User
            && !user_scopes.contains(&fact.session.as_deref())
        {
            warn!(content = %fact.content, "dropping consolidated user fact with invented scope");
            continue;
        }
        kept.push(NewFact {
            content: fact.content.trim().to_string(),
            source: FactSource::Summarizer,
            session: fact.session,
            category: fact.category,
            confidence: fact.confidence.clamp(0.0, 1.0),
        });
    }

    Some(kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn original(n: usize) -> Vec<FactRow> {
        (0..n)
            .map(|i| FactRow {
                id: i as i64 + 1,
                content: format!("fact number {i}"),
                source: FactSource::Curator,
                session: None,
                category: FactCategory::General,
                confidence: 0.8,
                last_used: None,
                use_count: 0,
                created_at: "2026-01-01T00:00:00+00:00".to_string(),
            })
            .collect()
    }

    fn proposed(contents: &[&str]) -> Vec<ConsolidatedFact> {
        contents
            .iter()
            .map(|c| ConsolidatedFact {
                content: c.to_string(),
                category: FactCategory::General,
                confidence: 0.8,
                session: None,
            })
            .collect()
    }

    #[test]
    fn under_ratio_aborts() {
        // 10 originals, 0.30 ratio → floor is 3; two survivors abort.
        let result = apply_consolidation_gates(&original(10), proposed(&["one", "two"]), 0.3);
        assert!(result.is_none());
    }

    #[test]
    fn at_ratio_proceeds() {
        let result =
            apply_consolidation_gates(&original(10), proposed(&["one", "two", "three"]), 0.3);
        assert_eq!(result.unwrap().len(), 3);
    }

    #[test]
    fn short_content_dropped() {
        let result =
            apply_consolidation_gates(&original(3), proposed(&["ok fact", "ab", "abc"]), 0.3);
        let kept = result.unwrap();
        // Length 2 dropped, length 3 retained.
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().any(|f| f.content == "abc"));
        assert!(!kept.iter().any(|f| f.content == "ab"));
    }

    #[test]
    fn confidence_clamped() {
        let mut p = proposed(&["overconfident", "underconfident"]);
        p[0].confidence = 1.5;
        p[1].confidence = -0.1;
        let kept = apply_consolidation_gates(&original(2), p, 0.3).unwrap();
        assert_eq!(kept[0].confidence, 1.0);
        assert_eq!(kept[1].confidence, 0.0);
    }

    #[test]
    fn user_fact_scope_preserved() {
        let mut orig = original(2);
        orig[0].category = FactCategory::User;
        orig[0].session = Some("s1".to_string());

        let mut p = proposed(&["alice prefers rust", "general note"]);
        p[0].category = FactCategory::User;
        p[0].session = Some("s1".to_string());

        let kept = apply_consolidation_gates(&orig, p, 0.3).unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].session.as_deref(), Some("s1"));
    }

    #[test]
    fn globalized_user_fact_dropped() {
        let mut orig = original(2);
        orig[0].category = FactCategory::User;
        orig[0].session = Some("s1".to_string());

        // The model "forgot" the session — silently globalizing is refused.
        let mut p = proposed(&["alice prefers rust", "general note"]);
        p[0].category = FactCategory::User;
        p[0].session = None;

        let kept = apply_consolidation_gates(&orig, p, 0.3).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].content, "general note");
    }
}
