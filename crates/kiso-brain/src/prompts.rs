//! Role system prompts — package-shipped defaults with per-deployment
//! overrides.
//!
//! The default for each role is compiled in via `include_str!`; an operator
//! can replace any of them by dropping a file at
//! `<kiso-dir>/prompts/<role>.md`. Overrides are read fresh on every call so
//! prompt tuning needs no restart.

use std::path::Path;

pub const CLASSIFIER: &str = "classifier";
pub const PLANNER: &str = "planner";
pub const EXEC_TRANSLATOR: &str = "exec_translator";
pub const REVIEWER: &str = "reviewer";
pub const SEARCHER: &str = "searcher";
pub const MESSENGER: &str = "messenger";
pub const CURATOR: &str = "curator";
pub const SESSION_SUMMARIZER: &str = "session_summarizer";
pub const FACTS_SUMMARIZER: &str = "facts_summarizer";
pub const PARAPHRASER: &str = "paraphraser";

/// Shipped default for a role. Panics only on an unknown role name, which is
/// a programming error — role names are the constants above.
fn default_prompt(role: &str) -> &'static str {
    match role {
        CLASSIFIER => include_str!("../prompts/classifier.md"),
        PLANNER => include_str!("../prompts/planner.md"),
        EXEC_TRANSLATOR => include_str!("../prompts/exec_translator.md"),
        REVIEWER => include_str!("../prompts/reviewer.md"),
        SEARCHER => include_str!("../prompts/searcher.md"),
        MESSENGER => include_str!("../prompts/messenger.md"),
        CURATOR => include_str!("../prompts/curator.md"),
        SESSION_SUMMARIZER => include_str!("../prompts/session_summarizer.md"),
        FACTS_SUMMARIZER => include_str!("../prompts/facts_summarizer.md"),
        PARAPHRASER => include_str!("../prompts/paraphraser.md"),
        other => panic!("unknown role: {other}"),
    }
}

/// System prompt for `role`: the operator override when present and
/// non-empty, the shipped default otherwise.
pub fn system_prompt(kiso_dir: &Path, role: &str) -> String {
    let override_path = kiso_dir.join("prompts").join(format!("{role}.md"));
    if let Ok(content) = std::fs::read_to_string(&override_path) {
        if !content.trim().is_empty() {
            return content;
        }
    }
    default_prompt(role).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_exist_for_all_roles() {
        for role in [
            CLASSIFIER,
            PLANNER,
            EXEC_TRANSLATOR,
            REVIEWER,
            SEARCHER,
            MESSENGER,
            CURATOR,
            SESSION_SUMMARIZER,
            FACTS_SUMMARIZER,
            PARAPHRASER,
        ] {
            assert!(!default_prompt(role).trim().is_empty(), "empty default for {role}");
        }
    }

    #[test]
    fn override_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("prompts")).unwrap();
        std::fs::write(dir.path().join("prompts/reviewer.md"), "custom reviewer").unwrap();
        assert_eq!(system_prompt(dir.path(), REVIEWER), "custom reviewer");
        // Roles without an override fall back to the default.
        assert!(system_prompt(dir.path(), PLANNER).contains("planner"));
    }

    #[test]
    fn empty_override_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("prompts")).unwrap();
        std::fs::write(dir.path().join("prompts/planner.md"), "  \n").unwrap();
        assert!(system_prompt(dir.path(), PLANNER).contains("planner"));
    }
}
