//! Knowledge maintenance — runs after a message finishes processing.
//!
//! Order matters: curator first (so fresh learnings can become facts before
//! anything summarizes over them), then session summarization, then fact
//! consolidation with its decay/archival cycle, then usage accounting for
//! the facts the planner actually saw.
//!
//! Every step is best-effort: a knowledge failure is logged and skipped,
//! never surfaced to the user — the message itself already succeeded.

use std::sync::Arc;

use tracing::{info, warn};

use kiso_brain::types::{CuratorVerdict, Usage};
use kiso_core::config::ConfigHandle;
use kiso_core::types::{FactCategory, FactSource, LearningStatus};
use kiso_llm::{CallBudget, LlmGateway};
use kiso_store::{NewFact, Store};

use crate::consolidate::apply_consolidation_gates;

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error(transparent)]
    Store(#[from] kiso_store::StoreError),
    #[error(transparent)]
    Brain(#[from] kiso_brain::BrainError),
}

type Result<T> = std::result::Result<T, KnowledgeError>;

pub struct KnowledgeKeeper {
    store: Arc<Store>,
    gateway: Arc<LlmGateway>,
    config: Arc<ConfigHandle>,
}

impl KnowledgeKeeper {
    pub fn new(store: Arc<Store>, gateway: Arc<LlmGateway>, config: Arc<ConfigHandle>) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    /// Full maintenance pass for one processed message.
    pub async fn maintain(
        &self,
        session: &str,
        budget: &CallBudget,
        shown_fact_ids: &[i64],
        plan_succeeded: bool,
    ) -> Usage {
        let mut usage = Usage::default();

        if let Err(e) = self.curate_learnings(&mut usage, budget).await {
            warn!(error = %e, "curator pass failed; learnings stay pending");
        }
        if let Err(e) = self.summarize_if_due(&mut usage, budget, session).await {
            warn!(error = %e, "session summarization failed; summary unchanged");
        }
        if let Err(e) = self.consolidate_if_due(&mut usage, budget).await {
            warn!(error = %e, "fact consolidation failed; facts unchanged");
        }
        if plan_succeeded {
            if let Err(e) = self.store.update_fact_usage(shown_fact_ids) {
                warn!(error = %e, "fact usage update failed");
            }
        }

        usage
    }

    /// Learning → fact promotion via the curator role.
    async fn curate_learnings(
        &self,
        usage: &mut Usage,
        budget: &CallBudget,
    ) -> Result<()> {
        let pending = self.store.pending_learnings()?;
        if pending.is_empty() {
            return Ok(());
        }

        let config = self.config.load();
        let reply = kiso_brain::curator::curate(
            &self.gateway,
            &config.kiso_dir(),
            budget,
            config.settings.max_validation_retries,
            &pending,
        )
        .await?;
        usage.merge(reply.usage);

        for eval in reply.value.evaluations {
            let learning = match pending.iter().find(|l| l.id == eval.learning_id) {
                Some(l) => l,
                None => continue,
            };
            match eval.verdict {
                CuratorVerdict::Promote => {
                    let category = eval.category.unwrap_or(FactCategory::General);
                    // User facts carry the learning's session as provenance;
                    // everything else is global.
                    let provenance = match category {
                        FactCategory::User => Some(learning.session.clone()),
                        _ => None,
                    };
                    self.store.save_fact(&NewFact {
                        content: eval.fact.unwrap_or_default(),
                        source: FactSource::Curator,
                        session: provenance,
                        category,
                        confidence: 0.8,
                    })?;
                    self.store.resolve_learning(
                        eval.learning_id,
                        LearningStatus::Promoted,
                        Some(&eval.reason),
                    )?;
                }
                CuratorVerdict::Ask => {
                    let question = eval.question.unwrap_or_default();
                    self.store
                        .save_pending_item(&question, &learning.session, "curator")?;
                    self.store.resolve_learning(
                        eval.learning_id,
                        LearningStatus::Discarded,
                        Some(&format!("asked instead: {question}")),
                    )?;
                }
                CuratorVerdict::Discard => {
                    self.store.resolve_learning(
                        eval.learning_id,
                        LearningStatus::Discarded,
                        Some(&eval.reason),
                    )?;
                }
            }
        }
        info!(count = pending.len(), "learnings curated");
        Ok(())
    }

    /// Overwrite the session summary when enough messages accumulated.
    async fn summarize_if_due(
        &self,
        usage: &mut Usage,
        budget: &CallBudget,
        session: &str,
    ) -> Result<()> {
        let config = self.config.load();
        let since = self.store.messages_since_summary(session)?;
        if since.len() < config.settings.summarize_threshold {
            return Ok(());
        }

        let current = self
            .store
            .get_session(session)?
            .map(|s| s.summary)
            .unwrap_or_default();
        let msg_outputs = self.store.recent_msg_outputs(session, since.len())?;

        let reply = kiso_brain::summarizer::summarize_session(
            &self.gateway,
            &config.kiso_dir(),
            budget,
            session,
            &current,
            &since,
            &msg_outputs,
        )
        .await?;
        usage.merge(reply.usage);

        if !reply.value.trim().is_empty() {
            self.store.update_session_summary(session, &reply.value)?;
            info!(session, messages = since.len(), "session summarized");
        }
        Ok(())
    }

    /// Consolidate facts when the table outgrows its cap; decay and archive
    /// run on the same cycle.
    async fn consolidate_if_due(
        &self,
        usage: &mut Usage,
        budget: &CallBudget,
    ) -> Result<()> {
        let config = self.config.load();
        let settings = &config.settings;
        if self.store.count_facts()? <= settings.knowledge_max_facts {
            return Ok(());
        }

        let original = self.store.all_facts()?;
        let reply = kiso_brain::summarizer::summarize_facts(
            &self.gateway,
            &config.kiso_dir(),
            budget,
            settings.max_validation_retries,
            &original,
        )
        .await?;
        usage.merge(reply.usage);

        match apply_consolidation_gates(
            &original,
            reply.value,
            settings.fact_consolidation_min_ratio,
        ) {
            Some(consolidated) => {
                self.store.replace_facts(&consolidated)?;
                info!(
                    before = original.len(),
                    after = consolidated.len(),
                    "facts consolidated"
                );
            }
            None => {
                warn!("consolidation gates rejected the result; originals kept");
                return Ok(());
            }
        }

        let decayed = self
            .store
            .decay_facts(settings.fact_decay_days, settings.fact_decay_rate)?;
        let archived = self
            .store
            .archive_low_confidence_facts(settings.fact_archive_threshold)?;
        if decayed > 0 || archived > 0 {
            info!(decayed, archived, "fact decay cycle complete");
        }
        Ok(())
    }
}
