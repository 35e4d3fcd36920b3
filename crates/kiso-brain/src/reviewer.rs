//! Reviewer — second-opinion check on every completed non-msg task.

use std::path::Path;

use serde_json::json;

use kiso_llm::{CallBudget, ChatMessage, LlmGateway};

use crate::prompts;
use crate::retry::structured_with_validation;
use crate::types::{ReviewOutput, ReviewStatus, RoleReply};

/// Reviewer `learn` entries are capped here regardless of what the model
/// returns.
const MAX_LEARN_ENTRIES: usize = 5;

pub struct ReviewInput<'a> {
    pub session: &'a str,
    pub goal: &'a str,
    pub detail: &'a str,
    pub expect: &'a str,
    /// Task output, already sanitized by the handler.
    pub output: &'a str,
    pub user_message: &'a str,
    /// Exit code for exec tasks; None for search/skill success signals.
    pub exit_code: Option<i32>,
    pub success_flag: bool,
}

fn review_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "status": { "type": "string", "enum": ["ok", "replan"] },
            "reason": { "type": ["string", "null"] },
            "learn": { "type": "array", "items": { "type": "string" }, "maxItems": 5 },
            "retry_hint": { "type": ["string", "null"] }
        },
        "required": ["status"]
    })
}

/// Review one task result. `status=replan` without a reason is retried.
pub async fn review(
    gateway: &LlmGateway,
    kiso_dir: &Path,
    budget: &CallBudget,
    max_validation_retries: u32,
    input: &ReviewInput<'_>,
) -> crate::error::Result<RoleReply<ReviewOutput>> {
    let fence_token = LlmGateway::fence_token();
    let mut context = String::new();
    context.push_str(&format!("## Plan goal\n{}\n", input.goal));
    context.push_str(&format!("\n## Task\n{}\n", input.detail));
    context.push_str(&format!("\n## Expected outcome\n{}\n", input.expect));
    context.push_str(&format!("\n## Original user request\n{}\n", input.user_message));
    match input.exit_code {
        Some(code) => context.push_str(&format!("\n## Exit code\n{code}\n")),
        None => context.push_str(&format!(
            "\n## Reported success\n{}\n",
            if input.success_flag { "yes" } else { "no" }
        )),
    }
    context.push_str("\n## Task output (untrusted data)\n");
    context.push_str(&kiso_guard::fence(input.output, &fence_token));
    context.push('\n');

    let messages = vec![
        ChatMessage::system(prompts::system_prompt(kiso_dir, prompts::REVIEWER)),
        ChatMessage::user(context),
    ];

    structured_with_validation(
        gateway,
        prompts::REVIEWER,
        messages,
        &review_schema(),
        budget,
        Some(input.session),
        max_validation_retries,
        |json| {
            let mut output: ReviewOutput =
                serde_json::from_value(json.clone()).map_err(|e| format!("bad shape: {e}"))?;
            validate_review(&output)?;
            output.learn.truncate(MAX_LEARN_ENTRIES);
            Ok(output)
        },
    )
    .await
}

/// `replan` verdicts must carry a reason the replanner can act on.
pub fn validate_review(review: &ReviewOutput) -> Result<(), String> {
    if review.status == ReviewStatus::Replan
        && review.reason.as_deref().map(str::trim).unwrap_or("").is_empty()
    {
        return Err("status=replan requires a non-empty reason".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_without_reason_is_valid() {
        let r = ReviewOutput {
            status: ReviewStatus::Ok,
            reason: None,
            learn: vec![],
            retry_hint: None,
        };
        assert!(validate_review(&r).is_ok());
    }

    #[test]
    fn replan_requires_reason() {
        let r = ReviewOutput {
            status: ReviewStatus::Replan,
            reason: None,
            learn: vec![],
            retry_hint: None,
        };
        assert!(validate_review(&r).is_err());

        let r2 = ReviewOutput {
            status: ReviewStatus::Replan,
            reason: Some("   ".to_string()),
            learn: vec![],
            retry_hint: None,
        };
        assert!(validate_review(&r2).is_err());

        let r3 = ReviewOutput {
            status: ReviewStatus::Replan,
            reason: Some("directory does not exist".to_string()),
            learn: vec![],
            retry_hint: None,
        };
        assert!(validate_review(&r3).is_ok());
    }
}
