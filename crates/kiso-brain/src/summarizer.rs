//! Summarizers — the session's rolling summary and fact-store consolidation.

use std::path::Path;

use serde_json::json;

use kiso_llm::{CallBudget, ChatMessage, LlmGateway};
use kiso_store::{FactRow, MessageRow};

use crate::prompts;
use crate::retry::structured_with_validation;
use crate::types::{ConsolidatedFact, RoleReply, Usage};

/// Rebuild the session summary from the current one plus the messages (and
/// replies) accumulated since. Free-form output; the store overwrites the
/// session's summary with it verbatim.
pub async fn summarize_session(
    gateway: &LlmGateway,
    kiso_dir: &Path,
    budget: &CallBudget,
    session: &str,
    current_summary: &str,
    messages_since: &[MessageRow],
    msg_outputs: &[String],
) -> crate::error::Result<RoleReply<String>> {
    let mut context = String::new();
    if current_summary.trim().is_empty() {
        context.push_str("## Existing summary\n(none — first summary for this session)\n");
    } else {
        context.push_str(&format!("## Existing summary\n{current_summary}\n"));
    }

    context.push_str("\n## New messages\n");
    for msg in messages_since {
        context.push_str(&format!("[{}] {}\n", msg.role, msg.content));
    }

    if !msg_outputs.is_empty() {
        context.push_str("\n## Replies sent in the same span\n");
        for out in msg_outputs {
            context.push_str(&format!("- {out}\n"));
        }
    }

    let chat = vec![
        ChatMessage::system(prompts::system_prompt(kiso_dir, prompts::SESSION_SUMMARIZER)),
        ChatMessage::user(context),
    ];

    let reply = gateway
        .complete(
            prompts::SESSION_SUMMARIZER,
            &chat,
            None,
            budget,
            Some(session),
        )
        .await?;

    let mut usage = Usage::default();
    usage.add(&reply);
    Ok(RoleReply {
        value: reply.content,
        usage,
    })
}

fn facts_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "content": { "type": "string" },
                        "category": { "type": "string", "enum": ["project", "user", "tool", "general"] },
                        "confidence": { "type": "number" },
                        "session": { "type": ["string", "null"] }
                    },
                    "required": ["content", "category", "confidence"]
                }
            }
        },
        "required": ["facts"]
    })
}

/// Consolidate the full fact list into a smaller one.
///
/// Confidence is clamped to `[0.0, 1.0]` on return; the knowledge keeper
/// applies the remaining safety gates (min ratio, min length, provenance)
/// before anything touches the table.
pub async fn summarize_facts(
    gateway: &LlmGateway,
    kiso_dir: &Path,
    budget: &CallBudget,
    max_validation_retries: u32,
    facts: &[FactRow],
) -> crate::error::Result<RoleReply<Vec<ConsolidatedFact>>> {
    let mut context = String::from("## Current facts\n");
    for f in facts {
        let scope = f.session.as_deref().unwrap_or("global");
        context.push_str(&format!(
            "- [{} | {} | conf {:.2}] {}\n",
            f.category, scope, f.confidence, f.content
        ));
    }
    context.push_str(
        "\nEcho each fact's scope back in `session` (null for global). \
         Never move a user fact to a different scope.\n",
    );

    let chat = vec![
        ChatMessage::system(prompts::system_prompt(kiso_dir, prompts::FACTS_SUMMARIZER)),
        ChatMessage::user(context),
    ];

    structured_with_validation(
        gateway,
        prompts::FACTS_SUMMARIZER,
        chat,
        &facts_schema(),
        budget,
        None,
        max_validation_retries,
        |json| {
            #[derive(serde::Deserialize)]
            struct Wrapper {
                facts: Vec<ConsolidatedFact>,
            }
            let wrapper: Wrapper =
                serde_json::from_value(json.clone()).map_err(|e| format!("bad shape: {e}"))?;
            let mut facts = wrapper.facts;
            for fact in &mut facts {
                fact.confidence = fact.confidence.clamp(0.0, 1.0);
            }
            Ok(facts)
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consolidated_confidence_is_clamped() {
        // Exercise the same clamp the parse closure applies.
        let mut f = ConsolidatedFact {
            content: "x".to_string(),
            category: kiso_core::types::FactCategory::General,
            confidence: 1.5,
            session: None,
        };
        f.confidence = f.confidence.clamp(0.0, 1.0);
        assert_eq!(f.confidence, 1.0);
        let mut g = f.clone();
        g.confidence = (-0.1f64).clamp(0.0, 1.0);
        assert_eq!(g.confidence, 0.0);
    }
}
