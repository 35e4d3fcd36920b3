use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use tracing::{info, warn};

/// Deploy secrets loaded from `<kiso-dir>/.env`.
///
/// Values stay in this map rather than the process environment so that
/// `/admin/reload-env` can swap the whole set atomically and so subprocesses
/// never inherit them by accident. Lookups fall back to the process
/// environment for keys the operator exported directly.
pub struct DeploySecrets {
    values: RwLock<HashMap<String, String>>,
}

impl DeploySecrets {
    pub fn empty() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Parse the .env file at `path`. A missing file is not an error — a
    /// fresh install has no secrets yet.
    pub fn load(path: &Path) -> Self {
        let secrets = Self::empty();
        secrets.reload(path);
        secrets
    }

    /// Re-read the .env file, replacing the in-memory set.
    pub fn reload(&self, path: &Path) {
        if !path.is_file() {
            info!(path = %path.display(), "no .env file; deploy secrets empty");
            *self.values.write().unwrap() = HashMap::new();
            return;
        }
        match dotenvy::from_path_iter(path) {
            Ok(iter) => {
                let mut map = HashMap::new();
                for item in iter {
                    match item {
                        Ok((k, v)) => {
                            map.insert(k, v);
                        }
                        Err(e) => warn!(error = %e, "skipping malformed .env line"),
                    }
                }
                info!(count = map.len(), "deploy secrets loaded");
                *self.values.write().unwrap() = map;
            }
            Err(e) => warn!(error = %e, "failed to read .env; keeping previous secrets"),
        }
    }

    /// Resolve a key from the .env set, falling back to the process env.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(v) = self.values.read().unwrap().get(key) {
            return Some(v.clone());
        }
        std::env::var(key).ok()
    }

    /// All secret VALUES currently loaded — the sanitizer masks these in
    /// audit entries. Never expose keys alongside values to callers that log.
    pub fn values(&self) -> Vec<String> {
        self.values.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_and_reload() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "API_KEY=sk-test-123").unwrap();
        writeln!(f, "OTHER=v2").unwrap();
        f.flush().unwrap();

        let s = DeploySecrets::load(f.path());
        assert_eq!(s.get("API_KEY").as_deref(), Some("sk-test-123"));
        assert_eq!(s.values().len(), 2);

        let mut f2 = tempfile::NamedTempFile::new().unwrap();
        writeln!(f2, "API_KEY=sk-rotated").unwrap();
        f2.flush().unwrap();
        s.reload(f2.path());
        assert_eq!(s.get("API_KEY").as_deref(), Some("sk-rotated"));
        assert_eq!(s.values().len(), 1);
    }

    #[test]
    fn missing_file_yields_empty_set() {
        let s = DeploySecrets::load(Path::new("/nonexistent/.env"));
        assert!(s.values().is_empty());
    }
}
