//! Classifier — the fast-path gate. One cheap call decides whether a
//! message needs planning at all.

use std::path::Path;

use tracing::{debug, warn};

use kiso_llm::{CallBudget, ChatMessage, LlmGateway};

use crate::prompts;
use crate::types::{RoleReply, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Plan,
    Chat,
}

/// Classify a message as `plan` or `chat`.
///
/// Anything other than a literal `chat` — including transport errors —
/// coerces to [`Route::Plan`]: the full path handles everything the fast
/// path would, just slower.
pub async fn classify(
    gateway: &LlmGateway,
    kiso_dir: &Path,
    budget: &CallBudget,
    session: &str,
    content: &str,
) -> RoleReply<Route> {
    let messages = vec![
        ChatMessage::system(prompts::system_prompt(kiso_dir, prompts::CLASSIFIER)),
        ChatMessage::user(content.to_string()),
    ];

    match gateway
        .complete(prompts::CLASSIFIER, &messages, None, budget, Some(session))
        .await
    {
        Ok(reply) => {
            let mut usage = Usage::default();
            usage.add(&reply);
            let route = match reply.content.trim().to_lowercase().as_str() {
                "chat" => Route::Chat,
                "plan" => Route::Plan,
                other => {
                    debug!(answer = %other, "classifier returned neither token; coercing to plan");
                    Route::Plan
                }
            };
            RoleReply { value: route, usage }
        }
        Err(e) => {
            warn!(error = %e, "classifier call failed; coercing to plan");
            RoleReply {
                value: Route::Plan,
                usage: Usage::default(),
            }
        }
    }
}
