//! Curator — evaluates pending learnings for promotion into the fact store.

use std::collections::HashSet;
use std::path::Path;

use serde_json::json;

use kiso_llm::{CallBudget, ChatMessage, LlmGateway};
use kiso_store::LearningRow;

use crate::prompts;
use crate::retry::structured_with_validation;
use crate::types::{CuratorOutput, CuratorVerdict, RoleReply};

fn curator_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "evaluations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "learning_id": { "type": "integer" },
                        "verdict": { "type": "string", "enum": ["promote", "ask", "discard"] },
                        "fact": { "type": ["string", "null"] },
                        "category": {
                            "type": ["string", "null"],
                            "enum": ["project", "user", "tool", "general", null]
                        },
                        "question": { "type": ["string", "null"] },
                        "reason": { "type": "string" }
                    },
                    "required": ["learning_id", "verdict", "reason"]
                }
            }
        },
        "required": ["evaluations"]
    })
}

/// Evaluate all pending learnings in one call.
pub async fn curate(
    gateway: &LlmGateway,
    kiso_dir: &Path,
    budget: &CallBudget,
    max_validation_retries: u32,
    learnings: &[LearningRow],
) -> crate::error::Result<RoleReply<CuratorOutput>> {
    let mut context = String::from("## Pending learnings\n");
    for l in learnings {
        context.push_str(&format!(
            "- id {} (session {}): {}\n",
            l.id, l.session, l.content
        ));
    }

    let messages = vec![
        ChatMessage::system(prompts::system_prompt(kiso_dir, prompts::CURATOR)),
        ChatMessage::user(context),
    ];

    let known_ids: HashSet<i64> = learnings.iter().map(|l| l.id).collect();
    structured_with_validation(
        gateway,
        prompts::CURATOR,
        messages,
        &curator_schema(),
        budget,
        None,
        max_validation_retries,
        move |json| {
            let output: CuratorOutput =
                serde_json::from_value(json.clone()).map_err(|e| format!("bad shape: {e}"))?;
            validate_curation(&output, &known_ids)?;
            Ok(output)
        },
    )
    .await
}

/// Curator rules: promote needs a fact, ask needs a question, everything
/// needs a reason, and ids must refer to real learnings.
pub fn validate_curation(
    output: &CuratorOutput,
    known_ids: &HashSet<i64>,
) -> Result<(), String> {
    for eval in &output.evaluations {
        if !known_ids.contains(&eval.learning_id) {
            return Err(format!("unknown learning_id {}", eval.learning_id));
        }
        if eval.reason.trim().is_empty() {
            return Err(format!(
                "evaluation for learning {} has an empty reason",
                eval.learning_id
            ));
        }
        match eval.verdict {
            CuratorVerdict::Promote => {
                if eval.fact.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(format!(
                        "promote verdict for learning {} requires a non-empty fact",
                        eval.learning_id
                    ));
                }
            }
            CuratorVerdict::Ask => {
                if eval.question.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(format!(
                        "ask verdict for learning {} requires a non-empty question",
                        eval.learning_id
                    ));
                }
            }
            CuratorVerdict::Discard => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CuratorEvaluation;

    fn eval(id: i64, verdict: CuratorVerdict) -> CuratorEvaluation {
        CuratorEvaluation {
            learning_id: id,
            verdict,
            fact: None,
            category: None,
            question: None,
            reason: "because".to_string(),
        }
    }

    fn ids(list: &[i64]) -> HashSet<i64> {
        list.iter().copied().collect()
    }

    #[test]
    fn promote_without_fact_rejected() {
        let out = CuratorOutput {
            evaluations: vec![eval(1, CuratorVerdict::Promote)],
        };
        assert!(validate_curation(&out, &ids(&[1])).is_err());
    }

    #[test]
    fn promote_with_fact_passes() {
        let mut e = eval(1, CuratorVerdict::Promote);
        e.fact = Some("the repo uses trunk-based development".to_string());
        let out = CuratorOutput { evaluations: vec![e] };
        assert!(validate_curation(&out, &ids(&[1])).is_ok());
    }

    #[test]
    fn ask_without_question_rejected() {
        let out = CuratorOutput {
            evaluations: vec![eval(2, CuratorVerdict::Ask)],
        };
        assert!(validate_curation(&out, &ids(&[2])).is_err());
    }

    #[test]
    fn empty_reason_rejected() {
        let mut e = eval(3, CuratorVerdict::Discard);
        e.reason = " ".to_string();
        let out = CuratorOutput { evaluations: vec![e] };
        assert!(validate_curation(&out, &ids(&[3])).is_err());
    }

    #[test]
    fn unknown_id_rejected() {
        let out = CuratorOutput {
            evaluations: vec![eval(99, CuratorVerdict::Discard)],
        };
        assert!(validate_curation(&out, &ids(&[1])).is_err());
    }
}
