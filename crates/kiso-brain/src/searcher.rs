//! Searcher — web search role with digested results.

use std::path::Path;

use serde_json::json;

use kiso_llm::{CallBudget, ChatMessage, LlmGateway};

use crate::prompts;
use crate::retry::structured_with_validation;
use crate::types::{RoleReply, SearchOutput, SearchParams};

const DEFAULT_MAX_RESULTS: i64 = 5;
const MAX_RESULTS_CAP: i64 = 100;

/// Clamp a requested result count into `[1, 100]`, defaulting when absent.
pub fn clamp_max_results(requested: Option<i64>) -> i64 {
    requested.unwrap_or(DEFAULT_MAX_RESULTS).clamp(1, MAX_RESULTS_CAP)
}

fn search_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "results": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "url": { "type": "string" },
                        "snippet": { "type": "string" }
                    },
                    "required": ["title", "url", "snippet"]
                }
            },
            "summary": { "type": "string" },
            "sources": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["results", "summary"]
    })
}

/// Run a search. The call is re-attempted once on malformed output, then
/// the failure surfaces as a task failure.
pub async fn search(
    gateway: &LlmGateway,
    kiso_dir: &Path,
    budget: &CallBudget,
    session: &str,
    query: &str,
    params: &SearchParams,
) -> crate::error::Result<RoleReply<SearchOutput>> {
    let max_results = clamp_max_results(params.max_results);

    let mut request = format!("## Query\n{query}\n\n## Limits\n- max_results: {max_results}\n");
    if let Some(lang) = &params.lang {
        request.push_str(&format!("- language: {lang}\n"));
    }
    if let Some(country) = &params.country {
        request.push_str(&format!("- country: {country}\n"));
    }

    let messages = vec![
        ChatMessage::system(prompts::system_prompt(kiso_dir, prompts::SEARCHER)),
        ChatMessage::user(request),
    ];

    structured_with_validation(
        gateway,
        prompts::SEARCHER,
        messages,
        &search_schema(),
        budget,
        Some(session),
        1,
        move |json| {
            let mut output: SearchOutput =
                serde_json::from_value(json.clone()).map_err(|e| format!("bad shape: {e}"))?;
            output.results.truncate(max_results as usize);
            Ok(output)
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_zero_negative_and_huge() {
        assert_eq!(clamp_max_results(Some(0)), 1);
        assert_eq!(clamp_max_results(Some(-1)), 1);
        assert_eq!(clamp_max_results(Some(10_000)), 100);
    }

    #[test]
    fn clamp_in_range_passthrough() {
        assert_eq!(clamp_max_results(Some(7)), 7);
        assert_eq!(clamp_max_results(None), DEFAULT_MAX_RESULTS);
    }
}
