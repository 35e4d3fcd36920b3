//! Publishable files — anything a task drops into `<workspace>/pub/` becomes
//! downloadable through an HMAC-tokenized URL.
//!
//! The token IS the capability: `hex(hmac_sha256(secret, "session/filename"))`.
//! No database row backs it; the gateway re-derives the expected token per
//! session directory when serving `GET /pub/{token}/{filename}`.

use std::collections::HashSet;
use std::path::Path;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Download token authorizing exactly one `(session, filename)` pair.
pub fn pub_token(secret: &str, session: &str, filename: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(session.as_bytes());
    mac.update(b"/");
    mac.update(filename.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time-ish verification via the Mac API.
pub fn verify_pub_token(secret: &str, session: &str, filename: &str, token: &str) -> bool {
    let Ok(expected) = hex::decode(token) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(session.as_bytes());
    mac.update(b"/");
    mac.update(filename.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Render the download URL for one pub file.
pub fn pub_url(base_url: &str, secret: &str, session: &str, filename: &str) -> String {
    let token = pub_token(secret, session, filename);
    format!("{base_url}/pub/{token}/{filename}")
}

/// Names currently present in `pub/` — snapshot taken before a task runs.
pub fn snapshot_pub_dir(workspace: &Path) -> HashSet<String> {
    std::fs::read_dir(workspace.join("pub"))
        .map(|rd| {
            rd.flatten()
                .filter(|e| e.path().is_file())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Files that appeared since the snapshot, sorted for stable output.
pub fn new_pub_files(workspace: &Path, before: &HashSet<String>) -> Vec<String> {
    let mut fresh: Vec<String> = snapshot_pub_dir(workspace)
        .into_iter()
        .filter(|name| !before.contains(name))
        .collect();
    fresh.sort();
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let t = pub_token("secret", "s1", "report.pdf");
        assert!(verify_pub_token("secret", "s1", "report.pdf", &t));
    }

    #[test]
    fn token_binds_session_and_filename() {
        let t = pub_token("secret", "s1", "report.pdf");
        assert!(!verify_pub_token("secret", "s2", "report.pdf", &t));
        assert!(!verify_pub_token("secret", "s1", "other.pdf", &t));
        assert!(!verify_pub_token("other-secret", "s1", "report.pdf", &t));
    }

    #[test]
    fn malformed_token_rejected() {
        assert!(!verify_pub_token("secret", "s1", "report.pdf", "zz-not-hex"));
    }

    #[test]
    fn ambiguous_boundary_does_not_collide() {
        // ("ab", "c.txt") and ("a", "bc.txt") must not produce the same token
        // just because their concatenation matches.
        let t1 = pub_token("secret", "ab", "c.txt");
        let t2 = pub_token("secret", "a", "bc.txt");
        assert_ne!(t1, t2);
    }

    #[test]
    fn new_files_detected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("pub")).unwrap();
        std::fs::write(dir.path().join("pub/old.txt"), "x").unwrap();
        let before = snapshot_pub_dir(dir.path());
        std::fs::write(dir.path().join("pub/new.txt"), "y").unwrap();
        assert_eq!(new_pub_files(dir.path(), &before), vec!["new.txt"]);
    }
}
