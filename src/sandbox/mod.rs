pub mod provider;
pub mod provisioner;
pub mod run;
pub mod stream;

#[cfg(test)]
pub mod mock;

/// Template with the agent SDK pre-baked. Overridable per deployment;
/// when the provider does not know it, creation falls back to
/// [`FALLBACK_TEMPLATE`] plus a runtime SDK install.
pub const DEFAULT_TEMPLATE: &str = "sandrunner";
pub const TEMPLATE_ENV: &str = "SANDRUNNER_TEMPLATE";
pub const FALLBACK_TEMPLATE: &str = "claude-code";

/// Agent SDK version installed on the fallback path. Single source of truth,
/// also consumed by the template build script.
pub const SDK_VERSION: &str = "0.2.42";

/// In-sandbox layout.
pub const RUNNER_DIR: &str = "/opt/agent-runner";
pub const RUNNER_PATH: &str = "/opt/agent-runner/runner.mjs";
pub const AGENT_CONFIG_PATH: &str = "/opt/agent-runner/agent_config.json";
pub const SETTINGS_PATH: &str = "/home/user/.claude/settings.json";
pub const SKILLS_ROOT: &str = "/home/user/.claude/skills";

/// The script that drives the agent SDK inside the sandbox, embedded at
/// compile time and uploaded with the other infrastructure files.
pub const RUNNER_SCRIPT: &str = include_str!("runner.mjs");

/// Max agent execution time (30 minutes).
pub const RUNNER_TIMEOUT_SECS: u64 = 1800;

/// Fallback npm install timeout.
pub const SDK_INSTALL_TIMEOUT_SECS: u64 = 120;

pub fn primary_template() -> String {
    std::env::var(TEMPLATE_ENV)
        .ok()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string())
}
