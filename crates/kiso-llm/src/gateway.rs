//! LLM gateway — the only path from Kiso to a model endpoint.
//!
//! Resolves `(provider, model)` per role from config, speaks the
//! OpenAI-compatible chat completions protocol, enforces the per-message
//! call budget, requests JSON-schema structured output when the role has a
//! schema, and emits one audit record per call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use kiso_core::audit::{AuditEntry, AuditLog};
use kiso_core::config::{ConfigHandle, ProviderConfig};
use kiso_core::types::LlmCallAudit;
use kiso_core::DeploySecrets;

use crate::budget::CallBudget;
use crate::error::{LlmError, Result};

/// Transient-failure retry attempts per call (on 429/5xx).
const TRANSIENT_RETRIES: u32 = 2;
const CHAT_PATH: &str = "/v1/chat/completions";

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system", content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user", content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant", content: content.into() }
    }
}

/// Outcome of one gateway call.
#[derive(Debug)]
pub struct LlmReply {
    pub content: String,
    /// Parsed JSON body — present when a schema was requested.
    pub json: Option<serde_json::Value>,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
    pub call_audit: LlmCallAudit,
}

pub struct LlmGateway {
    client: reqwest::Client,
    config: Arc<ConfigHandle>,
    secrets: Arc<DeploySecrets>,
    audit: Arc<AuditLog>,
}

impl LlmGateway {
    pub fn new(config: Arc<ConfigHandle>, secrets: Arc<DeploySecrets>, audit: Arc<AuditLog>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            secrets,
            audit,
        }
    }

    /// Fresh 128-bit fence token for wrapping untrusted prompt content.
    pub fn fence_token() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Resolve the `(provider name, provider config, model)` triple for a role.
    ///
    /// The role's model comes from `[models]`, falling back to the `default`
    /// entry — a miss there is `ProviderNotFound`. The provider is the first
    /// whose `models` list carries the resolved model; when none does, the
    /// model itself is the problem and the error is `ModelNotSupported`.
    pub fn resolve(&self, role: &str) -> Result<(String, ProviderConfig, String)> {
        let config = self.config.load();
        let model = config
            .models
            .get(role)
            .or_else(|| config.models.get("default"))
            .cloned()
            .ok_or_else(|| LlmError::ProviderNotFound {
                role: role.to_string(),
            })?;

        for (name, provider) in &config.providers {
            if provider.models.iter().any(|m| m == &model) {
                return Ok((name.clone(), provider.clone(), model));
            }
        }
        Err(LlmError::ModelNotSupported { model })
    }

    /// Run one chat completion for `role`.
    ///
    /// When `schema` is present the request asks for structured output and
    /// the reply body must parse as JSON; a malformed body raises
    /// [`LlmError::Schema`] so the caller can retry with feedback.
    pub async fn complete(
        &self,
        role: &str,
        messages: &[ChatMessage],
        schema: Option<&serde_json::Value>,
        budget: &CallBudget,
        session: Option<&str>,
    ) -> Result<LlmReply> {
        budget.charge()?;
        let (provider_name, provider, model) = self.resolve(role)?;
        let api_key = self.secrets.get(&provider.api_key_env).ok_or_else(|| {
            LlmError::MissingApiKey {
                provider: provider_name.clone(),
                var: provider.api_key_env.clone(),
            }
        })?;

        let mut body = json!({
            "model": model,
            "messages": messages
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content}))
                .collect::<Vec<_>>(),
        });
        if let Some(schema) = schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": format!("{role}_output"),
                    "schema": schema,
                    "strict": true,
                }
            });
        }

        let url = format!("{}{CHAT_PATH}", provider.base_url);
        let timeout = Duration::from_secs(provider.timeout_secs);
        let started = Instant::now();

        let result = self
            .send_with_retries(&url, &api_key, &body, timeout, role, &model)
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (status_label, reply) = match result {
            Ok(resp) => {
                let content = resp
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default();
                let prompt_tokens = resp.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0);
                let completion_tokens =
                    resp.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0);

                let json_value = match schema {
                    Some(_) => match serde_json::from_str(&content) {
                        Ok(v) => Some(v),
                        Err(e) => {
                            self.audit_call(role, &model, 0, 0, latency_ms, "schema_error", session, messages, &content);
                            return Err(LlmError::Schema(format!(
                                "response is not valid JSON: {e}"
                            )));
                        }
                    },
                    None => None,
                };

                let call_audit = LlmCallAudit {
                    role: role.to_string(),
                    model: model.clone(),
                    prompt_tokens,
                    completion_tokens,
                    latency_ms,
                    status: "ok".to_string(),
                };
                (
                    "ok",
                    Ok(LlmReply {
                        content,
                        json: json_value,
                        model: model.clone(),
                        prompt_tokens,
                        completion_tokens,
                        latency_ms,
                        call_audit,
                    }),
                )
            }
            Err(e) => ("error", Err(e)),
        };

        match &reply {
            Ok(r) => self.audit_call(
                role,
                &model,
                r.prompt_tokens,
                r.completion_tokens,
                latency_ms,
                status_label,
                session,
                messages,
                &r.content,
            ),
            Err(_) => self.audit_call(role, &model, 0, 0, latency_ms, status_label, session, messages, ""),
        }
        reply
    }

    /// POST with bounded retry on 429/5xx. Backoff: 1s, then 3s.
    async fn send_with_retries(
        &self,
        url: &str,
        api_key: &str,
        body: &serde_json::Value,
        timeout: Duration,
        role: &str,
        model: &str,
    ) -> Result<ApiResponse> {
        let mut attempt = 0;
        loop {
            debug!(role, model, attempt, "LLM request");
            match self.send_once(url, api_key, body, timeout).await {
                Ok(resp) => return Ok(resp),
                Err(e @ (LlmError::RateLimited { .. } | LlmError::Api { status: 500..=599, .. }))
                    if attempt < TRANSIENT_RETRIES =>
                {
                    let backoff = Duration::from_secs(1 + 2 * attempt as u64);
                    warn!(role, error = %e, backoff_secs = backoff.as_secs(), "transient LLM failure; retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(
        &self,
        url: &str,
        api_key: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<ApiResponse> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .header("content-type", "application/json")
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(LlmError::RateLimited { retry_after_ms: retry });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message: text });
        }
        resp.json::<ApiResponse>()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    fn audit_call(
        &self,
        role: &str,
        model: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
        latency_ms: u64,
        status: &str,
        session: Option<&str>,
        messages: &[ChatMessage],
        response: &str,
    ) {
        let mut detail = json!({
            "role": role,
            "model": model,
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "latency_ms": latency_ms,
            "status": status,
        });
        // Raw prompts/responses only in verbose mode, with deploy secrets
        // stripped before they can touch disk.
        if self.config.load().settings.verbose_llm_audit {
            let mask = self.secrets.values();
            let prompt_text = messages
                .iter()
                .map(|m| format!("[{}] {}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n");
            detail["prompt"] = json!(kiso_guard::sanitize(&prompt_text, &mask));
            detail["response"] = json!(kiso_guard::sanitize(response, &mask));
        }
        self.audit.append(&AuditEntry::new("llm_call", session, detail));
    }
}

// OpenAI-compatible response types.

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiso_core::config::KisoConfig;

    fn gateway_with(models: &[(&str, &str)], providers: &[(&str, &[&str])]) -> LlmGateway {
        let mut config = KisoConfig::default();
        for (role, model) in models {
            config.models.insert(role.to_string(), model.to_string());
        }
        for (name, served) in providers {
            config.providers.insert(
                name.to_string(),
                ProviderConfig {
                    base_url: "https://api.example.test".to_string(),
                    api_key_env: "EXAMPLE_KEY".to_string(),
                    timeout_secs: 30,
                    models: served.iter().map(|m| m.to_string()).collect(),
                },
            );
        }
        let dir = std::env::temp_dir().join("kiso-llm-test-audit");
        LlmGateway::new(
            Arc::new(ConfigHandle::new(config)),
            Arc::new(DeploySecrets::empty()),
            Arc::new(AuditLog::new(dir)),
        )
    }

    #[test]
    fn resolve_role_specific_model() {
        let gw = gateway_with(
            &[("default", "big-model"), ("classifier", "small-model")],
            &[("main", &["big-model", "small-model"])],
        );
        let (provider, _, model) = gw.resolve("classifier").unwrap();
        assert_eq!(provider, "main");
        assert_eq!(model, "small-model");
    }

    #[test]
    fn resolve_falls_back_to_default() {
        let gw = gateway_with(&[("default", "big-model")], &[("main", &["big-model"])]);
        let (_, _, model) = gw.resolve("reviewer").unwrap();
        assert_eq!(model, "big-model");
    }

    #[test]
    fn unserved_model_is_model_not_supported() {
        let gw = gateway_with(&[("default", "ghost-model")], &[("main", &["big-model"])]);
        assert!(matches!(
            gw.resolve("planner"),
            Err(LlmError::ModelNotSupported { model }) if model == "ghost-model"
        ));
    }

    #[test]
    fn unconfigured_role_is_provider_not_found() {
        let gw = gateway_with(&[], &[("main", &["big-model"])]);
        assert!(matches!(
            gw.resolve("planner"),
            Err(LlmError::ProviderNotFound { role }) if role == "planner"
        ));
    }

    #[test]
    fn fence_tokens_are_unique_and_128_bit() {
        let a = LlmGateway::fence_token();
        let b = LlmGateway::fence_token();
        assert_eq!(a.len(), 32); // 128 bits as hex
        assert_ne!(a, b);
    }
}
