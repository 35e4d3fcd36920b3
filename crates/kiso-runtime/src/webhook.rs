//! Webhook deliverer — pushes `msg` task outputs to a session-registered
//! URL, HMAC-signed, with a short retry ladder. Delivery is best-effort:
//! the message stays available via `/status` polling either way.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{info, warn};

use kiso_core::config::ConfigHandle;

type HmacSha256 = Hmac<Sha256>;

/// Retry delays after the first attempt fails.
const RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(3), Duration::from_secs(9)];
const FIRST_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub session: &'a str,
    pub task_id: i64,
    #[serde(rename = "type")]
    pub payload_type: &'static str,
    pub content: &'a str,
    #[serde(rename = "final")]
    pub is_final: bool,
}

pub struct WebhookDeliverer {
    client: reqwest::Client,
    config: Arc<ConfigHandle>,
}

impl WebhookDeliverer {
    pub fn new(config: Arc<ConfigHandle>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Deliver one msg output. Returns whether any attempt succeeded.
    pub async fn deliver(
        &self,
        url: &str,
        session: &str,
        task_id: i64,
        content: &str,
        is_final: bool,
    ) -> bool {
        let config = self.config.load();
        let webhook = &config.webhook;

        if let Err(reason) = validate_webhook_url(url, webhook.require_https, &webhook.allow_list)
        {
            warn!(session, url, reason, "webhook URL rejected");
            return false;
        }

        // Cap the body by truncating content, never by dropping fields.
        let capped = cap_content(content, webhook.max_payload);
        let payload = WebhookPayload {
            session,
            task_id,
            payload_type: "msg",
            content: &capped,
            is_final,
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(session, error = %e, "webhook payload serialization failed");
                return false;
            }
        };

        let signature = webhook
            .secret
            .as_deref()
            .map(|secret| sign_body(secret, &body));

        let mut delay = FIRST_RETRY_DELAY;
        for attempt in 0..=RETRY_DELAYS.len() {
            match self.post_once(url, &body, signature.as_deref()).await {
                Ok(status) if status < 400 => {
                    info!(session, task_id, attempt, "webhook delivered");
                    return true;
                }
                Ok(status) => {
                    warn!(session, task_id, attempt, status, "webhook rejected");
                }
                Err(e) => {
                    warn!(session, task_id, attempt, error = %e, "webhook attempt failed");
                }
            }
            if attempt < RETRY_DELAYS.len() {
                tokio::time::sleep(delay).await;
                delay = RETRY_DELAYS[attempt];
            }
        }
        warn!(session, task_id, "webhook delivery abandoned; output remains pollable");
        false
    }

    async fn post_once(
        &self,
        url: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<u16, reqwest::Error> {
        let mut req = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .timeout(Duration::from_secs(10))
            .body(body.to_vec());
        if let Some(sig) = signature {
            req = req.header("X-Kiso-Signature", sig);
        }
        let resp = req.send().await?;
        Ok(resp.status().as_u16())
    }
}

/// `sha256=<hex hmac>` over the raw body.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Truncate content so the JSON body stays under the payload cap. The cap
/// applies to the content field; envelope overhead is small and bounded.
fn cap_content(content: &str, max_payload: usize) -> String {
    if content.len() <= max_payload {
        return content.to_string();
    }
    let mut cut = max_payload;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    content[..cut].to_string()
}

/// Scheme and target checks. Hosts on the allow list skip everything —
/// that is the localhost development path.
pub fn validate_webhook_url(
    url: &str,
    require_https: bool,
    allow_list: &[String],
) -> Result<(), &'static str> {
    let parsed = url::Url::parse(url).map_err(|_| "not a valid URL")?;

    match parsed.scheme() {
        "http" | "https" => {}
        _ => return Err("scheme must be http or https"),
    }

    let host = parsed.host_str().ok_or("URL has no host")?;
    if allow_list.iter().any(|h| h == host) {
        return Ok(());
    }

    if require_https && parsed.scheme() != "https" {
        return Err("https is required");
    }

    if host.eq_ignore_ascii_case("localhost") {
        return Err("localhost targets are not allowed");
    }
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err("private or loopback IP targets are not allowed");
        }
    }

    Ok(())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local, fe80::/10 link-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_reference() {
        // hex_hmac_sha256("s3cret", body) with the sha256= prefix.
        let body = br#"{"session":"s1","task_id":7,"type":"msg","content":"hi","final":true}"#;
        let sig = sign_body("s3cret", body);
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        // Deterministic for the same key and body.
        assert_eq!(sig, sign_body("s3cret", body));
        assert_ne!(sig, sign_body("other", body));
    }

    #[test]
    fn https_required_by_default() {
        assert!(validate_webhook_url("https://example.test/hook", true, &[]).is_ok());
        assert!(validate_webhook_url("http://example.test/hook", true, &[]).is_err());
        assert!(validate_webhook_url("http://example.test/hook", false, &[]).is_ok());
    }

    #[test]
    fn non_http_schemes_rejected() {
        assert!(validate_webhook_url("ftp://example.test/x", false, &[]).is_err());
        assert!(validate_webhook_url("file:///etc/passwd", false, &[]).is_err());
    }

    #[test]
    fn private_targets_rejected() {
        assert!(validate_webhook_url("https://192.168.1.5/hook", true, &[]).is_err());
        assert!(validate_webhook_url("https://10.0.0.1/hook", true, &[]).is_err());
        assert!(validate_webhook_url("https://127.0.0.1/hook", true, &[]).is_err());
        assert!(validate_webhook_url("https://localhost/hook", true, &[]).is_err());
        assert!(validate_webhook_url("https://[::1]/hook", true, &[]).is_err());
    }

    #[test]
    fn allow_list_enables_local_dev() {
        let allow = vec!["127.0.0.1".to_string()];
        assert!(validate_webhook_url("http://127.0.0.1:9000/hook", true, &allow).is_ok());
    }

    #[test]
    fn content_cap_truncates() {
        let content = "x".repeat(100);
        assert_eq!(cap_content(&content, 100), content);
        let capped = cap_content(&content, 99);
        assert_eq!(capped.len(), 99);
    }

    #[test]
    fn payload_wire_format() {
        let payload = WebhookPayload {
            session: "s1",
            task_id: 42,
            payload_type: "msg",
            content: "done",
            is_final: true,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""type":"msg""#));
        assert!(json.contains(r#""final":true"#));
        assert!(json.contains(r#""task_id":42"#));
    }
}
