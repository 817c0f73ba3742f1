use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{error, warn};

/// Base configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "sandrunner.json";

/// Agents may be configured as a name-addressed map or as a plain list.
/// Only the map form supports per-request overlays and allow-lists.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentsConfig {
    Map(serde_json::Map<String, Value>),
    List(Vec<Value>),
}

/// Validated contents of `sandrunner.json`.
///
/// Every field is independently type-checked at load time; unknown or
/// mistyped fields are dropped with a one-line diagnostic, never fatal.
#[derive(Debug, Clone, Default)]
pub struct BaseConfig {
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub max_turns: Option<u64>,
    pub output_format: Option<Value>,
    pub agents: Option<AgentsConfig>,
    pub mcp_servers: Option<serde_json::Map<String, Value>>,
    /// Absolute path to the skills directory (existence verified at load).
    pub skills_dir: Option<PathBuf>,
    pub allowed_tools: Option<Vec<String>>,
    pub webhook_url: Option<String>,
    /// Set when the sandbox template ships with skills pre-baked.
    pub template_skills: bool,
}

impl BaseConfig {
    /// Loads `sandrunner.json` from `dir`. A missing file, invalid JSON, or a
    /// non-object top level all yield the default (empty) config.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(CONFIG_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Self::default(),
        };

        let value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                error!("{CONFIG_FILE}: invalid JSON — {e}");
                return Self::default();
            }
        };

        match value {
            Value::Object(map) => Self::validate(map, dir),
            other => {
                error!(
                    "{CONFIG_FILE}: expected a JSON object, got {}",
                    type_name(&other)
                );
                Self::default()
            }
        }
    }

    /// Type-checks every recognized field and drops everything else.
    pub fn validate(raw: serde_json::Map<String, Value>, dir: &Path) -> Self {
        let mut config = Self::default();

        for (key, value) in raw {
            match key.as_str() {
                "system_prompt" => config.system_prompt = take_string(&key, value),
                "model" => config.model = take_string(&key, value),
                "max_turns" => config.max_turns = take_integer(&key, value),
                "output_format" => {
                    config.output_format = take_object(&key, value).map(Value::Object)
                }
                "agents" => {
                    config.agents = match value {
                        Value::Object(map) => Some(AgentsConfig::Map(map)),
                        Value::Array(list) => Some(AgentsConfig::List(list)),
                        other => {
                            drop_field(&key, "object or array", &other);
                            None
                        }
                    }
                }
                "mcp_servers" => config.mcp_servers = take_object(&key, value),
                "skills_dir" => {
                    config.skills_dir = take_string(&key, value).and_then(|s| {
                        let path = dir.join(&s);
                        if path.is_dir() {
                            Some(path)
                        } else {
                            warn!("{CONFIG_FILE}: skills_dir {s:?} does not exist — ignoring");
                            None
                        }
                    })
                }
                "allowed_tools" => config.allowed_tools = take_string_list(&key, value),
                "webhook_url" => config.webhook_url = take_string(&key, value),
                "template_skills" => {
                    config.template_skills = match value {
                        Value::Bool(b) => b,
                        other => {
                            drop_field(&key, "bool", &other);
                            false
                        }
                    }
                }
                _ => warn!("{CONFIG_FILE}: unknown field {key:?} — ignoring"),
            }
        }

        config
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn drop_field(key: &str, expected: &str, got: &Value) {
    warn!(
        "{CONFIG_FILE}: field {key:?} should be {expected}, got {} — skipping",
        type_name(got)
    );
}

fn take_string(key: &str, value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        other => {
            drop_field(key, "string", &other);
            None
        }
    }
}

fn take_integer(key: &str, value: Value) -> Option<u64> {
    match &value {
        // A JSON boolean never satisfies an integer-typed field
        Value::Number(n) if n.is_u64() => n.as_u64(),
        other => {
            drop_field(key, "integer", other);
            None
        }
    }
}

fn take_object(key: &str, value: Value) -> Option<serde_json::Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        other => {
            drop_field(key, "object", &other);
            None
        }
    }
}

fn take_string_list(key: &str, value: Value) -> Option<Vec<String>> {
    let list = match value {
        Value::Array(list) => list,
        other => {
            drop_field(key, "array", &other);
            return None;
        }
    };
    let mut out = Vec::with_capacity(list.len());
    for entry in list {
        match entry {
            Value::String(s) => out.push(s),
            _ => {
                warn!("{CONFIG_FILE}: {key} entries must be strings — skipping the field");
                return None;
            }
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validate(value: Value, dir: &Path) -> BaseConfig {
        match value {
            Value::Object(map) => BaseConfig::validate(map, dir),
            _ => panic!("test input must be an object"),
        }
    }

    #[test]
    fn test_valid_fields_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let config = validate(
            json!({
                "system_prompt": "be terse",
                "model": "sonnet",
                "max_turns": 12,
                "allowed_tools": ["Bash", "Read"],
                "template_skills": true,
            }),
            dir.path(),
        );
        assert_eq!(config.system_prompt.as_deref(), Some("be terse"));
        assert_eq!(config.model.as_deref(), Some("sonnet"));
        assert_eq!(config.max_turns, Some(12));
        assert_eq!(
            config.allowed_tools,
            Some(vec!["Bash".to_string(), "Read".to_string()])
        );
        assert!(config.template_skills);
    }

    #[test]
    fn test_unknown_field_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let config = validate(json!({"frobnicate": 1, "model": "opus"}), dir.path());
        assert_eq!(config.model.as_deref(), Some("opus"));
    }

    #[test]
    fn test_mistyped_fields_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let config = validate(
            json!({
                "system_prompt": 42,
                "max_turns": "five",
                "mcp_servers": [],
                "agents": "nope",
            }),
            dir.path(),
        );
        assert!(config.system_prompt.is_none());
        assert!(config.max_turns.is_none());
        assert!(config.mcp_servers.is_none());
        assert!(config.agents.is_none());
    }

    #[test]
    fn test_bool_never_satisfies_integer() {
        let dir = tempfile::tempdir().unwrap();
        let config = validate(json!({"max_turns": true}), dir.path());
        assert!(config.max_turns.is_none());
    }

    #[test]
    fn test_skills_dir_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let config = validate(json!({"skills_dir": "no-such-dir"}), dir.path());
        assert!(config.skills_dir.is_none());

        std::fs::create_dir(dir.path().join("skills")).unwrap();
        let config = validate(json!({"skills_dir": "skills"}), dir.path());
        assert_eq!(config.skills_dir, Some(dir.path().join("skills")));
    }

    #[test]
    fn test_allowed_tools_rejects_non_string_entries() {
        let dir = tempfile::tempdir().unwrap();
        let config = validate(json!({"allowed_tools": ["Bash", 3]}), dir.path());
        assert!(config.allowed_tools.is_none());
    }

    #[test]
    fn test_agents_accepts_both_forms() {
        let dir = tempfile::tempdir().unwrap();
        let config = validate(json!({"agents": {"reviewer": {}}}), dir.path());
        assert!(matches!(config.agents, Some(AgentsConfig::Map(_))));

        let config = validate(json!({"agents": [{"name": "reviewer"}]}), dir.path());
        assert!(matches!(config.agents, Some(AgentsConfig::List(_))));
    }

    #[test]
    fn test_load_missing_or_invalid_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = BaseConfig::load(dir.path());
        assert!(config.model.is_none());

        std::fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();
        let config = BaseConfig::load(dir.path());
        assert!(config.model.is_none());

        std::fs::write(dir.path().join(CONFIG_FILE), "[1,2]").unwrap();
        let config = BaseConfig::load(dir.path());
        assert!(config.model.is_none());
    }
}
