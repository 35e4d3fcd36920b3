//! Skill manifests — per-skill directories the planner can dispatch to.
//!
//! A skill lives at `<kiso-dir>/skills/<name>/` and carries a
//! `manifest.toml` describing its argument schema plus a `run.py` entry
//! point executed inside the skill's own virtualenv. The core only reads
//! the manifest; authoring and installation are external concerns.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{MAX_SKILL_ARGS_BYTES, MAX_SKILL_ARGS_DEPTH};
use crate::error::KisoError;

/// Declared type of one skill argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    String,
    Int,
    Number,
    Bool,
    Object,
    Array,
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArgType::String => "string",
            ArgType::Int => "int",
            ArgType::Number => "number",
            ArgType::Bool => "bool",
            ArgType::Object => "object",
            ArgType::Array => "array",
        };
        f.write_str(s)
    }
}

/// One argument in a skill's declared schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub arg_type: ArgType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub description: String,
}

/// Parsed `manifest.toml` for one skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManifest {
    /// Must be "skill"; other manifest types (connectors) are skipped.
    #[serde(rename = "type")]
    pub manifest_type: String,
    pub name: String,
    pub summary: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    /// Ephemeral-secret keys this skill may receive on stdin.
    #[serde(default)]
    pub session_secrets: Vec<String>,
    /// Deploy-secret env var names injected into the subprocess.
    #[serde(default)]
    pub env: Vec<String>,
    /// Filled during discovery; not part of the manifest file.
    #[serde(skip)]
    pub dir: PathBuf,
}

impl SkillManifest {
    /// Render the `args` schema the planner prompt shows for this skill.
    pub fn args_summary(&self) -> String {
        if self.args.is_empty() {
            return "(no args)".to_string();
        }
        self.args
            .iter()
            .map(|a| {
                let req = if a.required { ", required" } else { "" };
                format!("{} ({}{req}): {}", a.name, a.arg_type, a.description)
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Scan `skills_dir` for subdirectories containing a valid `manifest.toml`.
///
/// Invalid manifests are skipped with a debug log rather than failing
/// discovery — one broken skill must not take down planning.
pub fn discover_skills(skills_dir: &Path) -> Vec<SkillManifest> {
    let mut seen = HashSet::new();
    let mut skills = Vec::new();

    let entries = match std::fs::read_dir(skills_dir) {
        Ok(e) => e,
        Err(_) => return skills,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let manifest_file = path.join("manifest.toml");
        if !manifest_file.is_file() {
            continue;
        }
        let raw = match std::fs::read_to_string(&manifest_file) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let mut manifest: SkillManifest = match toml::from_str(&raw) {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %manifest_file.display(), error = %e, "skipping skill: bad manifest");
                continue;
            }
        };
        if manifest.manifest_type != "skill" {
            continue;
        }
        if seen.contains(&manifest.name) {
            continue;
        }
        seen.insert(manifest.name.clone());
        manifest.dir = path;
        skills.push(manifest);
    }

    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

/// Validate a task's `args` JSON string against a skill's declared schema.
///
/// Enforced, in order: size cap, well-formed JSON object, nesting depth,
/// required args present, declared types match. Unknown extra args are
/// rejected so a planner typo fails loudly instead of being ignored.
pub fn validate_args(manifest: &SkillManifest, args_json: &str) -> crate::Result<serde_json::Value> {
    if args_json.len() > MAX_SKILL_ARGS_BYTES {
        return Err(KisoError::SkillArgs(format!(
            "args exceed {MAX_SKILL_ARGS_BYTES} bytes ({} given)",
            args_json.len()
        )));
    }

    let value: serde_json::Value = serde_json::from_str(args_json)
        .map_err(|e| KisoError::SkillArgs(format!("args are not valid JSON: {e}")))?;

    let depth = json_depth(&value);
    if depth > MAX_SKILL_ARGS_DEPTH {
        return Err(KisoError::SkillArgs(format!(
            "args nest {depth} levels deep (max {MAX_SKILL_ARGS_DEPTH})"
        )));
    }

    let obj = value
        .as_object()
        .ok_or_else(|| KisoError::SkillArgs("args must be a JSON object".to_string()))?;

    for spec in &manifest.args {
        match obj.get(&spec.name) {
            None if spec.required && spec.default.is_none() => {
                return Err(KisoError::SkillArgs(format!(
                    "missing required arg '{}'",
                    spec.name
                )));
            }
            None => {}
            Some(v) if !type_matches(spec.arg_type, v) => {
                return Err(KisoError::SkillArgs(format!(
                    "arg '{}' must be {} (got {})",
                    spec.name,
                    spec.arg_type,
                    json_type_name(v)
                )));
            }
            Some(_) => {}
        }
    }

    let declared: HashSet<&str> = manifest.args.iter().map(|a| a.name.as_str()).collect();
    for key in obj.keys() {
        if !declared.contains(key.as_str()) {
            return Err(KisoError::SkillArgs(format!(
                "unknown arg '{key}' for skill '{}'",
                manifest.name
            )));
        }
    }

    Ok(value)
}

fn type_matches(t: ArgType, v: &serde_json::Value) -> bool {
    match t {
        ArgType::String => v.is_string(),
        ArgType::Int => v.is_i64() || v.is_u64(),
        ArgType::Number => v.is_number(),
        ArgType::Bool => v.is_boolean(),
        ArgType::Object => v.is_object(),
        ArgType::Array => v.is_array(),
    }
}

fn json_type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Depth of a JSON value: scalars are 1, each object/array level adds 1.
fn json_depth(v: &serde_json::Value) -> usize {
    match v {
        serde_json::Value::Object(map) => {
            1 + map.values().map(json_depth).max().unwrap_or(0)
        }
        serde_json::Value::Array(items) => {
            1 + items.iter().map(json_depth).max().unwrap_or(0)
        }
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> SkillManifest {
        SkillManifest {
            manifest_type: "skill".to_string(),
            name: "weather".to_string(),
            summary: "Fetch a weather report".to_string(),
            args: vec![
                ArgSpec {
                    name: "city".to_string(),
                    arg_type: ArgType::String,
                    required: true,
                    default: None,
                    description: "City name".to_string(),
                },
                ArgSpec {
                    name: "days".to_string(),
                    arg_type: ArgType::Int,
                    required: false,
                    default: Some(serde_json::json!(1)),
                    description: "Forecast days".to_string(),
                },
            ],
            session_secrets: vec![],
            env: vec![],
            dir: PathBuf::new(),
        }
    }

    #[test]
    fn valid_args_pass() {
        let v = validate_args(&manifest(), r#"{"city":"Berlin","days":3}"#).unwrap();
        assert_eq!(v["city"], "Berlin");
    }

    #[test]
    fn missing_required_rejected() {
        assert!(validate_args(&manifest(), r#"{"days":3}"#).is_err());
    }

    #[test]
    fn wrong_type_rejected() {
        assert!(validate_args(&manifest(), r#"{"city":42}"#).is_err());
    }

    #[test]
    fn unknown_arg_rejected() {
        assert!(validate_args(&manifest(), r#"{"city":"Berlin","zip":"10115"}"#).is_err());
    }

    #[test]
    fn size_boundary_64k() {
        let mut m = manifest();
        m.args = vec![ArgSpec {
            name: "blob".to_string(),
            arg_type: ArgType::String,
            required: true,
            default: None,
            description: String::new(),
        }];
        // {"blob":"aaa...a"} — pad the payload so the whole string is exactly 64 KiB.
        let overhead = r#"{"blob":""}"#.len();
        let exactly = format!(r#"{{"blob":"{}"}}"#, "a".repeat(MAX_SKILL_ARGS_BYTES - overhead));
        assert_eq!(exactly.len(), MAX_SKILL_ARGS_BYTES);
        assert!(validate_args(&m, &exactly).is_ok());

        let over = format!(r#"{{"blob":"{}"}}"#, "a".repeat(MAX_SKILL_ARGS_BYTES - overhead + 1));
        assert!(validate_args(&m, &over).is_err());
    }

    #[test]
    fn depth_boundary() {
        let mut m = manifest();
        m.args = vec![ArgSpec {
            name: "tree".to_string(),
            arg_type: ArgType::Object,
            required: true,
            default: None,
            description: String::new(),
        }];
        // {"tree":{"a":{"b":{"c":1}}}} — object, 3 nested objects = depth 5 total... the
        // outer args object is level 1, so four more levels stay within the cap.
        let depth5 = r#"{"tree":{"a":{"b":{"c":1}}}}"#;
        assert!(validate_args(&m, depth5).is_ok());
        let depth6 = r#"{"tree":{"a":{"b":{"c":{"d":1}}}}}"#;
        assert!(validate_args(&m, depth6).is_err());
    }

    #[test]
    fn discovery_skips_non_skill_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let skill = dir.path().join("weather");
        std::fs::create_dir(&skill).unwrap();
        std::fs::write(
            skill.join("manifest.toml"),
            "type = \"skill\"\nname = \"weather\"\nsummary = \"Weather\"\n",
        )
        .unwrap();
        let other = dir.path().join("slackbot");
        std::fs::create_dir(&other).unwrap();
        std::fs::write(
            other.join("manifest.toml"),
            "type = \"connector\"\nname = \"slackbot\"\nsummary = \"Slack\"\n",
        )
        .unwrap();

        let found = discover_skills(dir.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "weather");
        assert_eq!(found[0].dir, skill);
    }
}
