use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{Result, SandboxError};
use crate::resolver::SANDBOX_HOME;
use crate::sandbox::provider::{FileEntry, Sandbox, SandboxProvider};
use crate::sandbox::{
    primary_template, FALLBACK_TEMPLATE, RUNNER_DIR, SDK_INSTALL_TIMEOUT_SECS, SDK_VERSION,
    SKILLS_ROOT,
};
use crate::skills::SkillSet;

/// Creates a sandbox, failing over once to the generic template plus a
/// runtime SDK install when the primary template is unknown to the provider.
/// Either path tags the sandbox with the caller's run id.
pub async fn create_sandbox(
    provider: &dyn SandboxProvider,
    api_key: &str,
    timeout_secs: u64,
    envs: &BTreeMap<String, String>,
    run_id: &str,
) -> Result<Arc<dyn Sandbox>> {
    let template = primary_template();
    let mut metadata = BTreeMap::new();
    metadata.insert("run_id".to_string(), run_id.to_string());

    info!("[{run_id}] Creating sandbox template={template}");
    let sandbox = match provider
        .create(&template, api_key, timeout_secs, envs, &metadata)
        .await
    {
        Ok(sandbox) => sandbox,
        Err(SandboxError::TemplateNotFound(_)) => {
            warn!(
                "[{run_id}] Template {template:?} not found, falling back to \
                 {FALLBACK_TEMPLATE:?} (adds ~15s overhead)"
            );
            let sandbox = provider
                .create(FALLBACK_TEMPLATE, api_key, timeout_secs, envs, &metadata)
                .await?;
            sandbox
                .run_command(
                    &format!(
                        "mkdir -p {RUNNER_DIR} && cd {RUNNER_DIR} && npm init -y \
                         && npm install @anthropic-ai/claude-agent-sdk@{SDK_VERSION}"
                    ),
                    SDK_INSTALL_TIMEOUT_SECS,
                    Box::new(|_| {}),
                    Box::new(|_| {}),
                )
                .await?;
            sandbox
        }
        Err(e) => return Err(e),
    };

    info!("[{run_id}] Sandbox created: {}", sandbox.id());
    Ok(sandbox)
}

/// POSIX shell quoting for paths embedded in a `mkdir -p` command.
fn shell_quote(path: &str) -> String {
    if !path.is_empty()
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./".contains(c))
    {
        return path.to_string();
    }
    format!("'{}'", path.replace('\'', r"'\''"))
}

/// One `mkdir -p` invocation covering every directory, deterministically
/// ordered.
pub fn mkdir_command(dirs: &BTreeSet<String>) -> String {
    dirs.iter()
        .map(|d| format!("mkdir -p {}", shell_quote(d)))
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Parent directories a batch of file entries needs, deduplicated.
pub fn parent_dirs(entries: &[FileEntry]) -> BTreeSet<String> {
    entries
        .iter()
        .filter_map(|entry| {
            let parent = entry.path.rsplit_once('/')?.0;
            (!parent.is_empty()).then(|| parent.to_string())
        })
        .collect()
}

pub(crate) async fn write_batch(sandbox: &dyn Sandbox, entries: &[FileEntry]) -> Result<()> {
    sandbox.write_files(entries).await.map_err(|e| {
        // Paths only: file contents never reach the logs
        let paths = entries
            .iter()
            .map(|entry| entry.path.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        warn!("batched write failed: {e}");
        SandboxError::Upload {
            count: entries.len(),
            paths,
        }
    })
}

/// Uploads a batch under the sandbox home: one mkdir command for the needed
/// parents, then one batched write.
pub async fn upload_files(
    sandbox: &dyn Sandbox,
    files: &BTreeMap<String, String>,
    run_id: &str,
) -> Result<()> {
    if files.is_empty() {
        return Ok(());
    }
    info!("[{run_id}] Uploading {} files", files.len());

    let entries: Vec<FileEntry> = files
        .iter()
        .map(|(path, content)| FileEntry::new(format!("{SANDBOX_HOME}/{path}"), content))
        .collect();

    let dirs = parent_dirs(&entries);
    if !dirs.is_empty() {
        sandbox
            .run_command(&mkdir_command(&dirs), 10, Box::new(|_| {}), Box::new(|_| {}))
            .await?;
    }
    write_batch(sandbox, &entries).await
}

/// Uploads every skill bundle to `/home/user/.claude/skills/<name>/<relpath>`,
/// again as one mkdir command plus one batched write.
pub async fn upload_skills(sandbox: &dyn Sandbox, skills: &SkillSet, run_id: &str) -> Result<()> {
    if skills.is_empty() {
        return Ok(());
    }
    info!("[{run_id}] Uploading {} skills", skills.len());

    let mut entries = Vec::new();
    for (name, bundle) in skills {
        for (rel, content) in &bundle.files {
            entries.push(FileEntry::new(format!("{SKILLS_ROOT}/{name}/{rel}"), content));
        }
    }

    let mut dirs = parent_dirs(&entries);
    // Every skill needs its own directory even if it only holds SKILL.md
    for name in skills.keys() {
        dirs.insert(format!("{SKILLS_ROOT}/{name}"));
    }
    sandbox
        .run_command(&mkdir_command(&dirs), 5, Box::new(|_| {}), Box::new(|_| {}))
        .await?;
    write_batch(sandbox, &entries).await
}

// ── Cleanup guard ────────────────────────────────────────────────────────────

/// Owns the sandbox handle and the background command task for one execution.
///
/// `finish()` is the normal path, awaited when the output stream is fully
/// consumed. If the consumer drops the stream early instead, `Drop` spawns
/// the same reconciliation so the task is cancelled-and-awaited and the
/// sandbox destroyed without an orphaned writer.
pub struct CleanupGuard {
    sandbox: Option<Arc<dyn Sandbox>>,
    task: Option<JoinHandle<Result<()>>>,
    run_id: String,
    keep_alive: bool,
}

impl CleanupGuard {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        task: JoinHandle<Result<()>>,
        run_id: &str,
        keep_alive: bool,
    ) -> Self {
        Self {
            sandbox: Some(sandbox),
            task: Some(task),
            run_id: run_id.to_string(),
            keep_alive,
        }
    }

    pub async fn finish(mut self) {
        let sandbox = self.sandbox.take();
        let task = self.task.take();
        reconcile(task, sandbox, self.keep_alive, &self.run_id).await;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let sandbox = self.sandbox.take();
        let task = self.task.take();
        if sandbox.is_none() && task.is_none() {
            return;
        }
        let keep_alive = self.keep_alive;
        let run_id = self.run_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                reconcile(task, sandbox, keep_alive, &run_id).await;
            });
        }
    }
}

/// Cancel-and-await (or consume the result of) the command task, then destroy
/// the sandbox unless it is being kept alive for pooling. Never fails.
async fn reconcile(
    task: Option<JoinHandle<Result<()>>>,
    sandbox: Option<Arc<dyn Sandbox>>,
    keep_alive: bool,
    run_id: &str,
) {
    if let Some(task) = task {
        if !task.is_finished() {
            task.abort();
        }
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // Expected: the runner streams its own error line before exit
                warn!("[{run_id}] Command task error suppressed: {e}");
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!("[{run_id}] Command task panicked: {e}"),
        }
    }

    if let Some(sandbox) = sandbox {
        if keep_alive {
            return;
        }
        info!("[{run_id}] Destroying sandbox {}", sandbox.id());
        if let Err(e) = sandbox.destroy().await {
            warn!("[{run_id}] Failed to destroy sandbox {}: {e}", sandbox.id());
        }
    }
}
