//! Paraphraser — rewrites untrusted messages into third-person summaries so
//! prompt injection arrives defused. The raw message rows stay untouched in
//! the store; only the paraphrase enters planner context.

use std::path::Path;

use serde_json::json;

use kiso_llm::{CallBudget, ChatMessage, LlmGateway};
use kiso_store::MessageRow;

use crate::prompts;
use crate::retry::structured_with_validation;
use crate::types::RoleReply;

fn paraphrase_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "paraphrases": {
                "type": "array",
                "items": { "type": "string" }
            }
        },
        "required": ["paraphrases"]
    })
}

/// Paraphrase a batch of untrusted messages, one output per input, in order.
pub async fn paraphrase(
    gateway: &LlmGateway,
    kiso_dir: &Path,
    budget: &CallBudget,
    session: &str,
    messages: &[MessageRow],
) -> crate::error::Result<RoleReply<Vec<String>>> {
    let fence_token = LlmGateway::fence_token();
    let mut context = String::from("## Untrusted messages\n");
    for (i, msg) in messages.iter().enumerate() {
        context.push_str(&format!("### Message {}\n", i + 1));
        context.push_str(&kiso_guard::fence(&msg.content, &fence_token));
        context.push('\n');
    }

    let chat = vec![
        ChatMessage::system(prompts::system_prompt(kiso_dir, prompts::PARAPHRASER)),
        ChatMessage::user(context),
    ];

    let expected = messages.len();
    structured_with_validation(
        gateway,
        prompts::PARAPHRASER,
        chat,
        &paraphrase_schema(),
        budget,
        Some(session),
        1,
        move |json| {
            #[derive(serde::Deserialize)]
            struct Wrapper {
                paraphrases: Vec<String>,
            }
            let wrapper: Wrapper =
                serde_json::from_value(json.clone()).map_err(|e| format!("bad shape: {e}"))?;
            if wrapper.paraphrases.len() != expected {
                return Err(format!(
                    "expected {expected} paraphrases, got {}",
                    wrapper.paraphrases.len()
                ));
            }
            Ok(wrapper.paraphrases)
        },
    )
    .await
}
