use serde::Serialize;
use serde_json::Value;

use crate::config::{AgentsConfig, BaseConfig};
use crate::error::{Result, SandboxError};
use crate::request::ExecutionRequest;
use crate::skills::{is_valid_name, SkillBundle, SkillSet};

/// Implicit tool the agent invokes skills through. Appended to base-sourced
/// tool lists when skills are enabled; never touched on explicit request
/// lists.
pub const SKILL_TOOL: &str = "Skill";

/// Working directory of the agent inside the sandbox.
pub const SANDBOX_HOME: &str = "/home/user";

/// The resolved structure shipped to the in-sandbox runner as
/// `agent_config.json`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionSpec {
    pub prompt: String,
    pub cwd: String,
    pub model: Option<String>,
    pub max_turns: Option<u64>,
    pub system_prompt: Option<String>,
    pub output_format: Option<Value>,
    pub agents: Option<Value>,
    pub mcp_servers: Option<Value>,
    pub has_skills: bool,
    pub allowed_tools: Option<Vec<String>>,
}

/// Merges the base config, per-request overrides, and allow-lists into the
/// spec sent to the sandbox, plus the final skill set to upload.
///
/// Name validation and the list-form agents check happen here, synchronously,
/// before any provisioning.
pub fn resolve(
    base: &BaseConfig,
    request: &ExecutionRequest,
    disk_skills: SkillSet,
) -> Result<(ExecutionSpec, SkillSet)> {
    for name in request.extra_skills.keys() {
        if !is_valid_name(name) {
            return Err(SandboxError::ConfigValidation(format!(
                "invalid skill name {name:?} (allowed: letters, digits, '_', '-')"
            )));
        }
    }
    for name in request.extra_agents.keys() {
        if !is_valid_name(name) {
            return Err(SandboxError::ConfigValidation(format!(
                "invalid agent name {name:?} (allowed: letters, digits, '_', '-')"
            )));
        }
    }

    // Skills: disk first, inline extras win on collision, allow-list last —
    // so an allow-listed inline skill with no disk counterpart survives.
    let mut skills = disk_skills;
    for (name, raw) in &request.extra_skills {
        skills.insert(name.clone(), SkillBundle::inline(raw.clone()));
    }
    if let Some(allowed) = &request.allowed_skills {
        skills.retain(|name, _| allowed.iter().any(|a| a == name));
    }

    let has_skills = !skills.is_empty() || base.template_skills;

    let mcp_servers = base.mcp_servers.clone().map(|mut servers| {
        if let Some(allowed) = &request.allowed_mcp_servers {
            servers.retain(|name, _| allowed.iter().any(|a| a == name));
        }
        Value::Object(servers)
    });

    let agents = resolve_agents(base, request)?;
    let allowed_tools = resolve_allowed_tools(base, request, has_skills);

    let spec = ExecutionSpec {
        prompt: request.prompt.clone(),
        cwd: SANDBOX_HOME.to_string(),
        model: request.model.clone().or_else(|| base.model.clone()),
        max_turns: request.max_turns.or(base.max_turns),
        system_prompt: base.system_prompt.clone(),
        // Present-even-if-empty request override wins; absent falls back
        output_format: request
            .output_format
            .clone()
            .or_else(|| base.output_format.clone()),
        agents,
        mcp_servers,
        has_skills,
        allowed_tools,
    };

    Ok((spec, skills))
}

fn resolve_agents(base: &BaseConfig, request: &ExecutionRequest) -> Result<Option<Value>> {
    let wants_overlay = !request.extra_agents.is_empty() || request.allowed_agents.is_some();

    let mut agents = match &base.agents {
        Some(AgentsConfig::Map(map)) => map.clone(),
        Some(AgentsConfig::List(list)) => {
            // Name-addressed operations require the map form
            if wants_overlay {
                return Err(SandboxError::ConfigValidation(
                    "extra_agents/allowed_agents require the agents config to be \
                     a name-addressed object, not a list"
                        .to_string(),
                ));
            }
            return Ok(Some(Value::Array(list.clone())));
        }
        None => {
            if !wants_overlay {
                return Ok(None);
            }
            serde_json::Map::new()
        }
    };

    for (name, definition) in &request.extra_agents {
        agents.insert(name.clone(), definition.clone());
    }
    if let Some(allowed) = &request.allowed_agents {
        agents.retain(|name, _| allowed.iter().any(|a| a == name));
    }
    Ok(Some(Value::Object(agents)))
}

fn resolve_allowed_tools(
    base: &BaseConfig,
    request: &ExecutionRequest,
    has_skills: bool,
) -> Option<Vec<String>> {
    // An explicit request list (including empty) passes through verbatim
    if let Some(tools) = &request.allowed_tools {
        return Some(tools.clone());
    }
    let mut tools = base.allowed_tools.clone()?;
    if has_skills && !tools.iter().any(|t| t == SKILL_TOOL) {
        tools.push(SKILL_TOOL.to_string());
    }
    Some(tools)
}
