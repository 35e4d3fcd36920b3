//! Shared validation-retry loop for structured roles.
//!
//! A role call is retried up to `max_retries` times when the model's output
//! fails schema parsing or the role's semantic rules. Each retry appends the
//! prior (truncated) response and a targeted error message, which in
//! practice fixes most violations on the first retry.

use tracing::warn;

use kiso_llm::{CallBudget, ChatMessage, LlmError, LlmGateway};

use crate::error::{BrainError, Result};
use crate::types::{RoleReply, Usage};

/// Cap on how much of a bad response is echoed back as context.
const FEEDBACK_SNIPPET_CHARS: usize = 2000;

pub(crate) async fn structured_with_validation<T, F>(
    gateway: &LlmGateway,
    role: &str,
    base_messages: Vec<ChatMessage>,
    schema: &serde_json::Value,
    budget: &CallBudget,
    session: Option<&str>,
    max_retries: u32,
    parse: F,
) -> Result<RoleReply<T>>
where
    F: Fn(&serde_json::Value) -> std::result::Result<T, String>,
{
    let mut messages = base_messages;
    let mut usage = Usage::default();
    let mut last_error = String::new();

    for attempt in 0..=max_retries {
        let reply = match gateway
            .complete(role, &messages, Some(schema), budget, session)
            .await
        {
            Ok(r) => r,
            Err(LlmError::Schema(detail)) if attempt < max_retries => {
                warn!(role, attempt, error = %detail, "schema failure; retrying with feedback");
                last_error = detail.clone();
                messages.push(ChatMessage::user(format!(
                    "Your previous response was not valid JSON for the required schema: \
                     {detail}. Respond again with only the JSON object."
                )));
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        usage.add(&reply);
        let json = reply
            .json
            .as_ref()
            .ok_or_else(|| BrainError::Validation("gateway returned no JSON body".into()))?;

        match parse(json) {
            Ok(value) => return Ok(RoleReply { value, usage }),
            Err(e) if attempt < max_retries => {
                warn!(role, attempt, error = %e, "validation failure; retrying with feedback");
                last_error = e.clone();
                let snippet: String = reply.content.chars().take(FEEDBACK_SNIPPET_CHARS).collect();
                messages.push(ChatMessage::assistant(snippet));
                messages.push(ChatMessage::user(format!(
                    "That response violates the rules: {e}. Fix exactly this and respond \
                     again with only the corrected JSON object."
                )));
            }
            Err(e) => last_error = e,
        }
    }

    Err(BrainError::Validation(format!(
        "{role} output still invalid after {max_retries} retries: {last_error}"
    )))
}
