use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use serde_json::json;
use tracing::{info, warn};

use crate::config::BaseConfig;
use crate::error::Result;
use crate::request::ExecutionRequest;
use crate::resolver::{self, ExecutionSpec};
use crate::sandbox::provider::{FileEntry, Sandbox, SandboxProvider};
use crate::sandbox::provisioner::{
    create_sandbox, upload_files, upload_skills, write_batch, CleanupGuard,
};
use crate::sandbox::stream::StreamBridge;
use crate::sandbox::{
    AGENT_CONFIG_PATH, RUNNER_PATH, RUNNER_SCRIPT, RUNNER_TIMEOUT_SECS, SETTINGS_PATH,
};
use crate::skills::{load_skills_dir, SkillSet};

/// The lazy output sequence of one execution: trimmed non-blank lines,
/// terminated by the runner's exit. Single-pass.
pub type OutputStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// A started execution. Dropping `output` before it ends cancels the
/// background command task and releases the sandbox.
pub struct AgentRun {
    pub sandbox_id: String,
    pub output: OutputStream,
}

/// Orchestrates one agent execution: resolve, provision, upload, run, stream.
pub struct AgentRunner {
    provider: Arc<dyn SandboxProvider>,
    base: BaseConfig,
}

impl AgentRunner {
    pub fn new(provider: Arc<dyn SandboxProvider>, base: BaseConfig) -> Self {
        Self { provider, base }
    }

    pub fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn resolve(&self, request: &ExecutionRequest) -> Result<(ExecutionSpec, SkillSet)> {
        let disk_skills = self
            .base
            .skills_dir
            .as_deref()
            .map(load_skills_dir)
            .unwrap_or_default();
        resolver::resolve(&self.base, request, disk_skills)
    }

    /// Creates a fresh sandbox and starts the agent in it. Any failure here
    /// happens before output streams and surfaces as `Err`; once `AgentRun`
    /// is returned, failures travel as `error` events inside the sequence.
    pub async fn launch(
        &self,
        request: &ExecutionRequest,
        run_id: &str,
        keep_alive: bool,
    ) -> Result<AgentRun> {
        let (spec, skills) = self.resolve(request)?;
        let api_key = request.sandbox_api_key.clone().unwrap_or_default();
        let envs = request.sandbox_envs();

        let sandbox = create_sandbox(
            self.provider.as_ref(),
            &api_key,
            request.timeout_secs(),
            &envs,
            run_id,
        )
        .await?;

        if let Err(e) = provision_fresh(sandbox.as_ref(), &spec, &skills, request, run_id).await {
            // Still pre-stream: tear down eagerly rather than leaking the
            // sandbox until its timeout
            if let Err(destroy_err) = sandbox.destroy().await {
                warn!("[{run_id}] Failed to destroy sandbox after upload error: {destroy_err}");
            }
            return Err(e);
        }

        Ok(self.start(sandbox, &spec, run_id, keep_alive))
    }

    /// Reconnects to a pooled sandbox (refreshing its lifetime) and starts
    /// the agent, uploading only the artifacts that are not already resident:
    /// the per-call config, any new request files, and this request's inline
    /// skills. Disk skills and the runner script survive from the first
    /// execution.
    pub async fn resume(
        &self,
        request: &ExecutionRequest,
        run_id: &str,
        sandbox_id: &str,
        keep_alive: bool,
    ) -> Result<AgentRun> {
        let (spec, skills) = self.resolve(request)?;
        let api_key = request.sandbox_api_key.clone().unwrap_or_default();

        let sandbox = self
            .provider
            .connect(sandbox_id, &api_key, request.timeout_secs())
            .await?;
        info!("[{run_id}] Reconnected to sandbox {sandbox_id}");

        // Inline extras are per-call and not resident; disk skills were
        // uploaded when the sandbox was first provisioned
        let inline: SkillSet = skills
            .into_iter()
            .filter(|(name, _)| request.extra_skills.contains_key(name))
            .collect();
        upload_skills(sandbox.as_ref(), &inline, run_id).await?;

        if let Some(files) = &request.files {
            upload_files(sandbox.as_ref(), files, run_id).await?;
        }
        write_batch(
            sandbox.as_ref(),
            &[FileEntry::new(
                AGENT_CONFIG_PATH,
                serde_json::to_string(&spec)?,
            )],
        )
        .await?;

        Ok(self.start(sandbox, &spec, run_id, keep_alive))
    }

    /// Spawns the background command task and wires it to the output stream
    /// through the bridge, with the cleanup guard owned by the stream.
    fn start(
        &self,
        sandbox: Arc<dyn Sandbox>,
        spec: &ExecutionSpec,
        run_id: &str,
        keep_alive: bool,
    ) -> AgentRun {
        info!(
            "[{run_id}] Starting agent (model={}, max_turns={})",
            spec.model.as_deref().unwrap_or("default"),
            spec.max_turns
                .map_or("default".to_string(), |t| t.to_string()),
        );

        let (sink, mut bridge) = StreamBridge::new(run_id);
        let task = {
            let sandbox = sandbox.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                let out = sink.clone();
                let err = sink.clone();
                let result = sandbox
                    .run_command(
                        &format!("node {RUNNER_PATH}"),
                        RUNNER_TIMEOUT_SECS,
                        Box::new(move |line| out.stdout(line)),
                        Box::new(move |line| err.stderr(line)),
                    )
                    .await;
                // Guaranteed sentinel: the consumer loop always terminates
                sink.finish().await;
                result
            })
        };

        let sandbox_id = sandbox.id().to_string();
        let guard = CleanupGuard::new(sandbox, task, run_id, keep_alive);
        let output = Box::pin(async_stream::stream! {
            while let Some(line) = bridge.next_line().await {
                yield line;
            }
            // Normal completion: reconcile the task and destroy inline.
            // Early consumer drop skips this and the guard's Drop takes over.
            guard.finish().await;
        });

        AgentRun { sandbox_id, output }
    }
}

/// Writes everything a fresh sandbox needs: agent settings, the runner
/// script, the resolved config, skills, and the request's files.
async fn provision_fresh(
    sandbox: &dyn Sandbox,
    spec: &ExecutionSpec,
    skills: &SkillSet,
    request: &ExecutionRequest,
    run_id: &str,
) -> Result<()> {
    let mut settings = json!({
        "permissions": {"allow": [], "deny": []},
    });
    if !spec.has_skills {
        settings["env"] = json!({"CLAUDE_CODE_DISABLE_EXPERIMENTAL_BETAS": "1"});
    }

    sandbox
        .run_command(
            "mkdir -p /home/user/.claude",
            5,
            Box::new(|_| {}),
            Box::new(|_| {}),
        )
        .await?;

    upload_skills(sandbox, skills, run_id).await?;
    if let Some(files) = &request.files {
        upload_files(sandbox, files, run_id).await?;
    }

    // One batched call for all infrastructure files
    write_batch(
        sandbox,
        &[
            FileEntry::new(SETTINGS_PATH, serde_json::to_string_pretty(&settings)?),
            FileEntry::new(RUNNER_PATH, RUNNER_SCRIPT),
            FileEntry::new(AGENT_CONFIG_PATH, serde_json::to_string(spec)?),
        ],
    )
    .await
}
