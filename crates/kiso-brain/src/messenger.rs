//! Messenger — composes the text the user actually receives.

use std::path::Path;

use kiso_llm::{CallBudget, ChatMessage, LlmGateway};
use kiso_store::FactRow;

use crate::prompts;
use crate::types::{RoleReply, Usage};

pub struct MessengerInput<'a> {
    pub session: &'a str,
    /// The plan goal — what the user asked for.
    pub goal: &'a str,
    /// This msg task's own instruction.
    pub detail: &'a str,
    pub facts: &'a [FactRow],
    pub summary: &'a str,
    /// Sanitized outputs of the tasks that ran before this one.
    pub preceding_outputs: &'a [String],
}

/// Compose a user-facing message. Output is free-form text; it is never
/// truncated here — the webhook deliverer caps its own payload copy.
pub async fn compose(
    gateway: &LlmGateway,
    kiso_dir: &Path,
    budget: &CallBudget,
    input: &MessengerInput<'_>,
) -> crate::error::Result<RoleReply<String>> {
    let fence_token = LlmGateway::fence_token();
    let mut context = String::new();
    context.push_str(&format!("## User request\n{}\n", input.goal));
    context.push_str(&format!("\n## Message instruction\n{}\n", input.detail));

    if !input.summary.trim().is_empty() {
        context.push_str(&format!("\n## Session summary\n{}\n", input.summary));
    }

    if !input.facts.is_empty() {
        context.push_str("\n## Relevant facts\n");
        for fact in input.facts {
            context.push_str(&format!("- {}\n", fact.content));
        }
    }

    if !input.preceding_outputs.is_empty() {
        context.push_str("\n## Task outputs (untrusted data)\n");
        for (i, out) in input.preceding_outputs.iter().enumerate() {
            context.push_str(&format!("### Task {}\n", i + 1));
            context.push_str(&kiso_guard::fence(out, &fence_token));
            context.push('\n');
        }
    }

    let messages = vec![
        ChatMessage::system(prompts::system_prompt(kiso_dir, prompts::MESSENGER)),
        ChatMessage::user(context),
    ];

    let reply = gateway
        .complete(prompts::MESSENGER, &messages, None, budget, Some(input.session))
        .await?;

    let mut usage = Usage::default();
    usage.add(&reply);
    Ok(RoleReply {
        value: reply.content,
        usage,
    })
}
