use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, SandboxError};

/// Hard caps on the uploaded file map.
const MAX_FILES: usize = 20;
const MAX_TOTAL_FILE_BYTES: usize = 10_000_000;
const MAX_PROMPT_CHARS: usize = 1_000_000;

/// Env vars that flip the agent SDK onto an alternate model provider.
const PROVIDER_TOGGLE_KEYS: [&str; 3] = [
    "CLAUDE_CODE_USE_VERTEX",
    "CLAUDE_CODE_USE_BEDROCK",
    "CLAUDE_CODE_USE_FOUNDRY",
];

/// Host env vars auto-forwarded into the sandbox when set.
const FORWARDED_ENV_KEYS: [&str; 16] = [
    // Google Vertex AI
    "CLAUDE_CODE_USE_VERTEX",
    "CLOUD_ML_REGION",
    "ANTHROPIC_VERTEX_PROJECT_ID",
    // Amazon Bedrock
    "CLAUDE_CODE_USE_BEDROCK",
    "AWS_REGION",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    // Microsoft Azure / Foundry
    "CLAUDE_CODE_USE_FOUNDRY",
    "AZURE_FOUNDRY_RESOURCE",
    "AZURE_API_KEY",
    // Custom base URL (proxy, self-hosted, OpenRouter)
    "ANTHROPIC_BASE_URL",
    "ANTHROPIC_AUTH_TOKEN",
    // Model name overrides (remap SDK aliases to provider model IDs)
    "ANTHROPIC_DEFAULT_SONNET_MODEL",
    "ANTHROPIC_DEFAULT_OPUS_MODEL",
    "ANTHROPIC_DEFAULT_HAIKU_MODEL",
];

/// One inbound execution: the prompt plus every per-call override.
///
/// Allow-list semantics throughout: `None` means unrestricted, an empty list
/// means "keep nothing".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecutionRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub max_turns: Option<u64>,
    /// Present-even-if-empty overrides the base config; an empty object is a
    /// valid "disable structured output" signal distinct from absent.
    pub output_format: Option<Value>,
    /// Sandbox lifetime in seconds (5–3600).
    pub timeout_secs: Option<u64>,
    /// Files to upload, keyed by path relative to the sandbox home.
    pub files: Option<BTreeMap<String, String>>,
    /// Inline skill definitions, name to raw manifest content.
    pub extra_skills: BTreeMap<String, String>,
    /// Inline agent definitions overlaid onto the base agents map.
    pub extra_agents: serde_json::Map<String, Value>,
    pub allowed_mcp_servers: Option<Vec<String>>,
    pub allowed_skills: Option<Vec<String>>,
    pub allowed_tools: Option<Vec<String>>,
    pub allowed_agents: Option<Vec<String>>,
    pub anthropic_api_key: Option<String>,
    pub sandbox_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
}

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

impl ExecutionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    /// Normalizes file paths, enforces size caps, and falls back to env vars
    /// for credentials. Must be called once before the request is executed.
    pub fn validate(&mut self) -> Result<()> {
        if self.prompt.is_empty() || self.prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(SandboxError::ConfigValidation(format!(
                "prompt must be 1..={MAX_PROMPT_CHARS} characters"
            )));
        }

        if let Some(timeout) = self.timeout_secs {
            if !(5..=3600).contains(&timeout) {
                return Err(SandboxError::ConfigValidation(format!(
                    "timeout_secs must be within 5..=3600, got {timeout}"
                )));
            }
        }

        if let Some(files) = self.files.take() {
            if files.len() > MAX_FILES {
                return Err(SandboxError::ConfigValidation(format!(
                    "too many files: {} (max {MAX_FILES})",
                    files.len()
                )));
            }
            let total: usize = files.values().map(|c| c.len()).sum();
            if total > MAX_TOTAL_FILE_BYTES {
                return Err(SandboxError::ConfigValidation(format!(
                    "total file size {total} bytes exceeds {MAX_TOTAL_FILE_BYTES} byte limit"
                )));
            }
            let mut safe = BTreeMap::new();
            for (path, content) in files {
                safe.insert(normalize_path(&path)?, content);
            }
            self.files = Some(safe);
        }

        // Credential fallback to env vars
        if self.anthropic_api_key.is_none() {
            self.anthropic_api_key = non_empty_env("ANTHROPIC_API_KEY");
        }
        if self.openrouter_api_key.is_none() {
            self.openrouter_api_key = non_empty_env("OPENROUTER_API_KEY");
        }
        if self.sandbox_api_key.is_none() {
            self.sandbox_api_key = non_empty_env("SANDBOX_API_KEY");
        }

        let uses_alternate_provider = PROVIDER_TOGGLE_KEYS
            .iter()
            .any(|k| non_empty_env(k).is_some());
        let uses_custom_base_url = non_empty_env("ANTHROPIC_BASE_URL").is_some();
        if self.anthropic_api_key.is_none() && !uses_alternate_provider && !uses_custom_base_url {
            return Err(SandboxError::ConfigValidation(
                "anthropic_api_key is required — pass it in the request \
                 or set ANTHROPIC_API_KEY in the environment"
                    .to_string(),
            ));
        }
        if self.sandbox_api_key.is_none() {
            return Err(SandboxError::ConfigValidation(
                "sandbox_api_key is required — pass it in the request \
                 or set SANDBOX_API_KEY in the environment"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Env vars injected into the sandbox: the API key plus any provider
    /// vars present on the host.
    pub fn sandbox_envs(&self) -> BTreeMap<String, String> {
        let mut envs = BTreeMap::new();
        if let Some(key) = &self.anthropic_api_key {
            envs.insert("ANTHROPIC_API_KEY".to_string(), key.clone());
        }
        for key in FORWARDED_ENV_KEYS {
            if let Some(val) = non_empty_env(key) {
                envs.insert(key.to_string(), val);
            }
        }

        // Per-request OpenRouter key overrides the forwarded auth token
        if let Some(key) = &self.openrouter_api_key {
            envs.insert("ANTHROPIC_AUTH_TOKEN".to_string(), key.clone());
        }

        // With a custom base URL + auth token the SDK must not see a real
        // API key, or it validates model names against the default API.
        if envs.contains_key("ANTHROPIC_BASE_URL") && envs.contains_key("ANTHROPIC_AUTH_TOKEN") {
            envs.insert("ANTHROPIC_API_KEY".to_string(), String::new());
        }

        envs
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// POSIX-style path normalization: strips leading slashes, resolves `.` and
/// `..` segments, and rejects anything escaping the sandbox home.
fn normalize_path(path: &str) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(SandboxError::ConfigValidation(format!(
                        "path traversal not allowed: {path}"
                    )));
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(SandboxError::ConfigValidation(format!(
            "path traversal not allowed: {path}"
        )));
    }
    Ok(parts.join("/"))
}
