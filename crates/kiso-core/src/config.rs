use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Wire-contract constants — clients depend on these exactly.
pub const DEFAULT_PORT: u16 = 18600;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Hard cap on `POST /msg` body content before a 413 is returned.
pub const MAX_CONTENT_BYTES: usize = 256 * 1024;
/// Maximum serialized size of a skill task's `args` JSON string.
pub const MAX_SKILL_ARGS_BYTES: usize = 64 * 1024;
/// Maximum nesting depth of a skill task's `args` JSON value.
pub const MAX_SKILL_ARGS_DEPTH: usize = 5;
/// Planner may extend the replan budget by at most this much.
pub const MAX_EXTEND_REPLAN: u32 = 3;

/// Top-level config (kiso.toml + KISO_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KisoConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Role name -> model name. The `default` entry is the fallback route.
    #[serde(default)]
    pub models: HashMap<String, String>,
    /// Provider name -> endpoint + key config.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Whitelisted usernames and their grants.
    #[serde(default)]
    pub users: HashMap<String, UserConfig>,
    /// Connector handle -> (external id -> username).
    #[serde(default)]
    pub aliases: HashMap<String, HashMap<String, String>>,
    /// Optional skill registry URL surfaced to the planner.
    pub registry_url: Option<String>,
    /// Root state directory. Defaults to ~/.kiso.
    #[serde(default = "default_kiso_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer tokens. The token name doubles as the connector handle used to
    /// resolve `aliases.<name>`.
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
    /// Externally reachable base URL for pub-file links. Defaults to the
    /// bind address.
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            tokens: Vec::new(),
            public_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub name: String,
    pub token: String,
    /// Admin tokens may call /admin/* routes.
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL without trailing slash; the chat completions path is appended.
    pub base_url: String,
    /// Name of the env var (or .env deploy secret) holding the API key.
    pub api_key_env: String,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    /// Models served by this provider. A model resolves to the first provider
    /// that lists it.
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_max_llm_calls")]
    pub max_llm_calls_per_message: u32,
    #[serde(default = "default_validation_retries")]
    pub max_validation_retries: u32,
    #[serde(default = "default_worker_retries")]
    pub max_worker_retries: u32,
    #[serde(default = "default_replan_depth")]
    pub max_replan_depth: u32,
    #[serde(default = "default_plan_tasks")]
    pub max_plan_tasks: usize,
    /// How many recent messages the planner sees.
    #[serde(default = "default_recent_messages")]
    pub recent_messages: usize,
    #[serde(default = "default_summarize_threshold")]
    pub summarize_threshold: usize,
    #[serde(default = "default_max_facts")]
    pub knowledge_max_facts: usize,
    #[serde(default = "default_fact_decay_days")]
    pub fact_decay_days: i64,
    #[serde(default = "default_fact_decay_rate")]
    pub fact_decay_rate: f64,
    #[serde(default = "default_fact_archive_threshold")]
    pub fact_archive_threshold: f64,
    #[serde(default = "default_consolidation_min_ratio")]
    pub fact_consolidation_min_ratio: f64,
    #[serde(default = "default_idle_timeout")]
    pub worker_idle_timeout_secs: u64,
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,
    #[serde(default = "default_skill_timeout")]
    pub skill_timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Per-session inbound queue depth; enqueue past this returns retry-later.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "bool_true")]
    pub fast_path_enabled: bool,
    /// When true, audit entries include raw prompts and responses.
    #[serde(default)]
    pub verbose_llm_audit: bool,
    /// Per-token requests/minute on /msg and /sessions.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_llm_calls_per_message: default_max_llm_calls(),
            max_validation_retries: default_validation_retries(),
            max_worker_retries: default_worker_retries(),
            max_replan_depth: default_replan_depth(),
            max_plan_tasks: default_plan_tasks(),
            recent_messages: default_recent_messages(),
            summarize_threshold: default_summarize_threshold(),
            knowledge_max_facts: default_max_facts(),
            fact_decay_days: default_fact_decay_days(),
            fact_decay_rate: default_fact_decay_rate(),
            fact_archive_threshold: default_fact_archive_threshold(),
            fact_consolidation_min_ratio: default_consolidation_min_ratio(),
            worker_idle_timeout_secs: default_idle_timeout(),
            exec_timeout_secs: default_exec_timeout(),
            skill_timeout_secs: default_skill_timeout(),
            max_output_bytes: default_max_output_bytes(),
            queue_capacity: default_queue_capacity(),
            fast_path_enabled: true,
            verbose_llm_audit: false,
            rate_limit_per_minute: default_rate_limit(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// HMAC-SHA256 signing secret for X-Kiso-Signature. None = unsigned.
    pub secret: Option<String>,
    #[serde(default = "bool_true")]
    pub require_https: bool,
    #[serde(default = "default_webhook_max_payload")]
    pub max_payload: usize,
    /// Hosts exempt from the https/private-IP checks (localhost dev path).
    #[serde(default)]
    pub allow_list: Vec<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            require_https: true,
            max_payload: default_webhook_max_payload(),
            allow_list: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// When set, exec/skill subprocesses for non-admin users run as this uid.
    pub uid: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub admin: bool,
    /// Skill names this user may invoke; "*" grants all discovered skills.
    #[serde(default)]
    pub skills: Vec<String>,
}

impl KisoConfig {
    /// Load config from a TOML file with KISO_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. $KISO_CONFIG
    ///   3. ~/.kiso/config.toml
    pub fn load(config_path: Option<&str>) -> crate::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("KISO_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: KisoConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("KISO_").split("__"))
            .extract()
            .map_err(|e| crate::KisoError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Fail-fast sanity checks. A config that passes here never aborts later
    /// for reasons the operator could have seen at startup.
    pub fn validate(&self) -> crate::Result<()> {
        for (role, model) in &self.models {
            if model.trim().is_empty() {
                return Err(crate::KisoError::Config(format!(
                    "models.{role} is empty"
                )));
            }
        }
        for (name, p) in &self.providers {
            if p.base_url.trim().is_empty() {
                return Err(crate::KisoError::Config(format!(
                    "providers.{name}.base_url is empty"
                )));
            }
            if p.api_key_env.trim().is_empty() {
                return Err(crate::KisoError::Config(format!(
                    "providers.{name}.api_key_env is empty"
                )));
            }
        }
        for (connector, map) in &self.aliases {
            for user in map.values() {
                if !self.users.contains_key(user) {
                    return Err(crate::KisoError::Config(format!(
                        "aliases.{connector} maps to unknown user '{user}'"
                    )));
                }
            }
        }
        let s = &self.settings;
        if !(0.0..=1.0).contains(&s.fact_archive_threshold) {
            return Err(crate::KisoError::Config(
                "settings.fact_archive_threshold must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&s.fact_consolidation_min_ratio) {
            return Err(crate::KisoError::Config(
                "settings.fact_consolidation_min_ratio must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Root state directory as a path.
    pub fn kiso_dir(&self) -> PathBuf {
        PathBuf::from(&self.dir)
    }

    /// Per-session workspace directory.
    pub fn workspace_dir(&self, session: &str) -> PathBuf {
        self.kiso_dir().join("sessions").join(session)
    }

    /// Directory holding per-skill subdirectories with manifests.
    pub fn skills_dir(&self) -> PathBuf {
        self.kiso_dir().join("skills")
    }

    /// User-writable git/ssh/bin directory injected into the exec env.
    pub fn sys_dir(&self) -> PathBuf {
        self.kiso_dir().join("sys")
    }

    /// Resolve a connector's external identifier to a whitelisted username.
    pub fn resolve_alias(&self, connector: &str, external_id: &str) -> Option<&str> {
        self.aliases
            .get(connector)
            .and_then(|m| m.get(external_id))
            .map(String::as_str)
    }

    /// True when the user exists and carries the admin grant.
    pub fn is_admin(&self, user: &str) -> bool {
        self.users.get(user).map(|u| u.admin).unwrap_or(false)
    }

    /// Skill names the user may invoke, expanding the "*" grant.
    pub fn allowed_skills<'a>(&'a self, user: &str, discovered: &'a [String]) -> Vec<String> {
        match self.users.get(user) {
            None => Vec::new(),
            Some(u) if u.skills.iter().any(|s| s == "*") => discovered.to_vec(),
            Some(u) => u
                .skills
                .iter()
                .filter(|s| discovered.contains(s))
                .cloned()
                .collect(),
        }
    }
}

impl Default for KisoConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            models: HashMap::new(),
            providers: HashMap::new(),
            settings: Settings::default(),
            webhook: WebhookConfig::default(),
            sandbox: SandboxConfig::default(),
            users: HashMap::new(),
            aliases: HashMap::new(),
            registry_url: None,
            dir: default_kiso_dir(),
        }
    }
}

/// Atomically swappable view of the live configuration.
///
/// Readers call `load()` and get an Arc snapshot; `/admin/reload-env`
/// replaces the whole config in one store. Workers re-read on every message
/// so permission revocations take effect without a restart.
pub struct ConfigHandle {
    inner: RwLock<Arc<KisoConfig>>,
}

impl ConfigHandle {
    pub fn new(config: KisoConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    pub fn load(&self) -> Arc<KisoConfig> {
        self.inner.read().unwrap().clone()
    }

    pub fn replace(&self, config: KisoConfig) {
        *self.inner.write().unwrap() = Arc::new(config);
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_provider_timeout() -> u64 {
    120
}
fn default_max_llm_calls() -> u32 {
    40
}
fn default_validation_retries() -> u32 {
    3
}
fn default_worker_retries() -> u32 {
    1
}
fn default_replan_depth() -> u32 {
    5
}
fn default_plan_tasks() -> usize {
    20
}
fn default_recent_messages() -> usize {
    7
}
fn default_summarize_threshold() -> usize {
    20
}
fn default_max_facts() -> usize {
    200
}
fn default_fact_decay_days() -> i64 {
    30
}
fn default_fact_decay_rate() -> f64 {
    0.1
}
fn default_fact_archive_threshold() -> f64 {
    0.3
}
fn default_consolidation_min_ratio() -> f64 {
    0.3
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_exec_timeout() -> u64 {
    120
}
fn default_skill_timeout() -> u64 {
    300
}
fn default_max_output_bytes() -> usize {
    1024 * 1024
}
fn default_queue_capacity() -> usize {
    32
}
fn default_rate_limit() -> u32 {
    30
}
fn default_shutdown_grace() -> u64 {
    20
}
fn default_webhook_max_payload() -> usize {
    1024 * 1024
}
fn default_kiso_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.kiso")
}
fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.kiso/config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = KisoConfig::default();
        assert!(c.settings.fast_path_enabled);
        assert_eq!(c.settings.max_replan_depth, 5);
        assert_eq!(c.settings.max_output_bytes, 1024 * 1024);
        assert_eq!(c.webhook.max_payload, 1024 * 1024);
        assert!(c.webhook.require_https);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn alias_to_unknown_user_fails_validation() {
        let mut c = KisoConfig::default();
        let mut map = HashMap::new();
        map.insert("123".to_string(), "ghost".to_string());
        c.aliases.insert("telegram".to_string(), map);
        assert!(c.validate().is_err());
    }

    #[test]
    fn allowed_skills_star_expands() {
        let mut c = KisoConfig::default();
        c.users.insert(
            "alice".to_string(),
            UserConfig {
                admin: false,
                skills: vec!["*".to_string()],
            },
        );
        let discovered = vec!["weather".to_string(), "notes".to_string()];
        assert_eq!(c.allowed_skills("alice", &discovered), discovered);
        assert!(c.allowed_skills("nobody", &discovered).is_empty());
    }

    #[test]
    fn allowed_skills_filters_to_discovered() {
        let mut c = KisoConfig::default();
        c.users.insert(
            "bob".to_string(),
            UserConfig {
                admin: false,
                skills: vec!["weather".to_string(), "revoked".to_string()],
            },
        );
        let discovered = vec!["weather".to_string()];
        assert_eq!(c.allowed_skills("bob", &discovered), vec!["weather"]);
    }

    #[test]
    fn config_handle_swaps_atomically() {
        let handle = ConfigHandle::new(KisoConfig::default());
        assert_eq!(handle.load().server.port, DEFAULT_PORT);
        let mut next = KisoConfig::default();
        next.server.port = 9999;
        handle.replace(next);
        assert_eq!(handle.load().server.port, 9999);
    }
}
