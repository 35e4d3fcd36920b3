//! Secret stripping — every known secret value is removed from text before
//! it reaches the store, the audit log, or an LLM prompt.
//!
//! Three encodings are covered per secret: the literal value, its base64
//! form, and its URL-encoded form. Shell output routinely re-encodes
//! credentials (auth headers, query strings), so stripping only the literal
//! value would leak through the first `curl -v`.

use base64::Engine;

/// Replacement marker. Guillemets keep it visually distinct from anything a
/// shell or LLM is likely to emit on its own.
pub const REDACTED: &str = "«REDACTED»";

/// Replace every occurrence of every secret in `text` with [`REDACTED`].
///
/// Idempotent: sanitizing already-sanitized text is a no-op, and secrets
/// shorter than 4 characters are skipped — masking "a" would shred
/// unrelated text and such values are not real credentials.
pub fn sanitize(text: &str, secrets: &[String]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        if secret.len() < 4 {
            continue;
        }
        for variant in variants(secret) {
            if variant.len() >= 4 {
                out = out.replace(&variant, REDACTED);
            }
        }
    }
    out
}

/// The encodings of a secret we strip: raw, base64, URL-encoded.
fn variants(secret: &str) -> Vec<String> {
    let mut v = vec![secret.to_string()];

    let b64 = base64::engine::general_purpose::STANDARD.encode(secret);
    if b64 != secret {
        v.push(b64);
    }

    let url = urlencoding::encode(secret).into_owned();
    if url != secret {
        v.push(url);
    }

    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn strips_literal_value() {
        let out = sanitize("token is hunter2-pass here", &secrets(&["hunter2-pass"]));
        assert_eq!(out, format!("token is {REDACTED} here"));
    }

    #[test]
    fn strips_base64_form() {
        let b64 = base64::engine::general_purpose::STANDARD.encode("hunter2-pass");
        let input = format!("Authorization: Basic {b64}");
        let out = sanitize(&input, &secrets(&["hunter2-pass"]));
        assert!(!out.contains(&b64));
        assert!(out.contains(REDACTED));
    }

    #[test]
    fn strips_urlencoded_form() {
        let raw = "p@ss w0rd";
        let encoded = urlencoding::encode(raw).into_owned();
        let input = format!("https://example.test/login?pw={encoded}");
        let out = sanitize(&input, &secrets(&[raw]));
        assert!(!out.contains(&encoded));
        assert!(out.contains(REDACTED));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let s = secrets(&["hunter2-pass"]);
        let once = sanitize("x hunter2-pass y", &s);
        let twice = sanitize(&once, &s);
        assert_eq!(once, twice);
    }

    #[test]
    fn short_secrets_skipped() {
        let out = sanitize("cat sat on a mat", &secrets(&["a"]));
        assert_eq!(out, "cat sat on a mat");
    }

    #[test]
    fn multiple_secrets_all_stripped() {
        let out = sanitize(
            "key1=alpha-secret key2=beta-secret",
            &secrets(&["alpha-secret", "beta-secret"]),
        );
        assert!(!out.contains("alpha-secret"));
        assert!(!out.contains("beta-secret"));
    }

    #[test]
    fn empty_secret_list_is_identity() {
        assert_eq!(sanitize("unchanged", &[]), "unchanged");
    }
}
