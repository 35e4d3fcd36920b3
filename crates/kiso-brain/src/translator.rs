//! Exec translator — task description in, shell command line out.

use std::path::Path;

use kiso_llm::{CallBudget, ChatMessage, LlmGateway};

use crate::prompts;
use crate::types::{RoleReply, SystemEnvironment, Usage};

/// Literal token the translator emits when a task has no shell rendering.
pub const CANNOT_TRANSLATE: &str = "CANNOT_TRANSLATE";

pub struct TranslatorInput<'a> {
    pub session: &'a str,
    pub detail: &'a str,
    pub environment: &'a SystemEnvironment,
    /// Present on a worker-level retry: prior command, stderr snippet, hint.
    pub retry_hint: Option<&'a str>,
    /// Outputs of preceding tasks in the plan, for chaining.
    pub preceding_outputs: &'a [String],
}

/// Translate a task description into a raw shell string.
///
/// The result may be [`CANNOT_TRANSLATE`]; the exec handler turns that into
/// a fixed-reason failure. Markdown fences around the command are stripped —
/// models add them no matter how often the prompt forbids it.
pub async fn translate(
    gateway: &LlmGateway,
    kiso_dir: &Path,
    budget: &CallBudget,
    input: &TranslatorInput<'_>,
) -> crate::error::Result<RoleReply<String>> {
    let mut context = String::new();
    context.push_str("## Task\n");
    context.push_str(input.detail);
    context.push('\n');

    let env = input.environment;
    context.push_str("\n## Environment\n");
    context.push_str(&format!("- OS: {}\n", env.os));
    context.push_str(&format!("- Working directory: {}\n", env.exec_cwd));
    if !env.binaries.is_empty() {
        context.push_str(&format!("- Available binaries: {}\n", env.binaries.join(", ")));
    }

    if !input.preceding_outputs.is_empty() {
        context.push_str("\n## Outputs of earlier tasks\n");
        for (i, out) in input.preceding_outputs.iter().enumerate() {
            context.push_str(&format!("### Task {}\n{}\n", i + 1, out));
        }
        context.push_str(
            "\nThe same outputs are available to the command as JSON at \
             .kiso/plan_outputs.json in the working directory.\n",
        );
    }

    if let Some(hint) = input.retry_hint {
        context.push_str("\n## Retry\nThe previous attempt failed:\n");
        context.push_str(hint);
        context.push_str("\nProduce a corrected command.\n");
    }

    let messages = vec![
        ChatMessage::system(prompts::system_prompt(kiso_dir, prompts::EXEC_TRANSLATOR)),
        ChatMessage::user(context),
    ];

    let reply = gateway
        .complete(
            prompts::EXEC_TRANSLATOR,
            &messages,
            None,
            budget,
            Some(input.session),
        )
        .await?;

    let mut usage = Usage::default();
    usage.add(&reply);
    Ok(RoleReply {
        value: strip_code_fences(reply.content.trim()),
        usage,
    })
}

fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    // Drop an optional language tag on the first line.
    let inner = match inner.split_once('\n') {
        Some((first, rest)) if !first.trim().contains(' ') => rest,
        _ => inner,
    };
    inner.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_command_unchanged() {
        assert_eq!(strip_code_fences("ls -la"), "ls -la");
    }

    #[test]
    fn fenced_command_stripped() {
        assert_eq!(strip_code_fences("```sh\nls -la\n```"), "ls -la");
        assert_eq!(strip_code_fences("```\nls -la\n```"), "ls -la");
    }

    #[test]
    fn cannot_translate_survives() {
        assert_eq!(strip_code_fences(CANNOT_TRANSLATE), CANNOT_TRANSLATE);
    }
}
