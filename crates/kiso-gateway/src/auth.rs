//! Bearer-token auth and user identity resolution.
//!
//! A token authenticates a CONNECTOR (its name); the message's `user` field
//! identifies a person, resolved through `aliases.<connector>` into a
//! whitelisted username. Messages whose author cannot be resolved are
//! accepted but untrusted — stored, paraphrased for context, never executed.

use axum::http::HeaderMap;
use chrono::Utc;

use crate::app::AppState;

/// The authenticated connector behind a request.
pub struct Caller {
    pub connector: String,
    pub admin: bool,
}

pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Authenticate the request; None means 401.
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> Option<Caller> {
    let presented = extract_bearer(headers)?;
    let config = state.config.load();
    config
        .server
        .tokens
        .iter()
        .find(|t| t.token == presented)
        .map(|t| Caller {
            connector: t.name.clone(),
            admin: t.admin,
        })
}

/// Resolve the message's `user` field into a whitelisted username.
///
/// Resolution order: `aliases.<connector>.<user>`, then a direct whitelist
/// hit on the name itself. `None` marks the message untrusted.
pub fn resolve_user(state: &AppState, connector: &str, user: &str) -> Option<String> {
    let config = state.config.load();
    if let Some(resolved) = config.resolve_alias(connector, user) {
        return Some(resolved.to_string());
    }
    if config.users.contains_key(user) {
        return Some(user.to_string());
    }
    None
}

/// Fixed-window per-token rate limit. Returns false when the caller is over
/// budget for the current minute.
pub fn check_rate_limit(state: &AppState, connector: &str) -> bool {
    let limit = state.config.load().settings.rate_limit_per_minute;
    if limit == 0 {
        return true;
    }
    let minute = Utc::now().timestamp() / 60;
    let mut entry = state
        .rate_windows
        .entry(connector.to_string())
        .or_insert((minute, 0));
    let (window, count) = *entry;
    if window != minute {
        *entry = (minute, 1);
        return true;
    }
    if count >= limit {
        return false;
    }
    *entry = (window, count + 1);
    true
}
