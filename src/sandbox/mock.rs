//! Scripted in-memory sandbox provider for orchestration tests.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, SandboxError};
use crate::sandbox::provider::{FileEntry, LineCallback, Sandbox, SandboxProvider};

/// Shared recorder. Tests inspect the logs after driving the orchestration
/// code against the provider.
#[derive(Default)]
pub struct MockState {
    /// Templates the provider pretends not to know.
    pub unknown_templates: Mutex<HashSet<String>>,
    /// Template of every create call, including failed ones.
    pub create_attempts: Mutex<Vec<String>>,
    pub created: Mutex<Vec<String>>,
    /// (sandbox_id, timeout_secs) of every connect call.
    pub connected: Mutex<Vec<(String, u64)>>,
    pub destroyed: Mutex<Vec<String>>,
    /// (sandbox_id, command) of every run_command call.
    pub commands: Mutex<Vec<(String, String)>>,
    /// (sandbox_id, paths) of every successful write_files call.
    pub writes: Mutex<Vec<(String, Vec<String>)>>,
    /// Env maps passed to create, by call order.
    pub create_envs: Mutex<Vec<BTreeMap<String, String>>>,
    /// stdout scripts consumed by runner invocations, oldest first.
    scripts: Mutex<VecDeque<Vec<String>>>,
    fail_writes: AtomicBool,
    fail_connect: AtomicBool,
    next_id: AtomicU64,
}

pub struct MockProvider {
    pub state: Arc<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
        }
    }

    pub fn forget_template(&self, template: &str) {
        self.state
            .unknown_templates
            .lock()
            .unwrap()
            .insert(template.to_string());
    }

    pub fn fail_writes(&self) {
        self.state.fail_writes.store(true, Ordering::Relaxed);
    }

    pub fn fail_connects(&self) {
        self.state.fail_connect.store(true, Ordering::Relaxed);
    }

    /// Queues the stdout lines the next runner invocation will emit.
    /// Lines of the form `!sleep:<ms>` pause the producer instead.
    pub fn push_script(&self, lines: &[&str]) {
        self.state
            .scripts
            .lock()
            .unwrap()
            .push_back(lines.iter().map(|l| l.to_string()).collect());
    }
}

#[async_trait]
impl SandboxProvider for MockProvider {
    async fn create(
        &self,
        template: &str,
        _api_key: &str,
        _timeout_secs: u64,
        envs: &BTreeMap<String, String>,
        _metadata: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn Sandbox>> {
        self.state
            .create_attempts
            .lock()
            .unwrap()
            .push(template.to_string());
        if self
            .state
            .unknown_templates
            .lock()
            .unwrap()
            .contains(template)
        {
            return Err(SandboxError::TemplateNotFound(template.to_string()));
        }
        self.state.create_envs.lock().unwrap().push(envs.clone());

        let id = format!("sbx-{}", self.state.next_id.fetch_add(1, Ordering::Relaxed));
        self.state.created.lock().unwrap().push(id.clone());
        Ok(Arc::new(MockSandbox {
            state: self.state.clone(),
            id,
        }))
    }

    async fn connect(
        &self,
        sandbox_id: &str,
        _api_key: &str,
        timeout_secs: u64,
    ) -> Result<Arc<dyn Sandbox>> {
        let alive = self
            .state
            .created
            .lock()
            .unwrap()
            .contains(&sandbox_id.to_string())
            && !self
                .state
                .destroyed
                .lock()
                .unwrap()
                .contains(&sandbox_id.to_string());
        if !alive || self.state.fail_connect.load(Ordering::Relaxed) {
            return Err(SandboxError::Provisioning(format!(
                "cannot reconnect to sandbox {sandbox_id}: gone"
            )));
        }
        self.state
            .connected
            .lock()
            .unwrap()
            .push((sandbox_id.to_string(), timeout_secs));
        Ok(Arc::new(MockSandbox {
            state: self.state.clone(),
            id: sandbox_id.to_string(),
        }))
    }
}

struct MockSandbox {
    state: Arc<MockState>,
    id: String,
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run_command(
        &self,
        command: &str,
        _timeout_secs: u64,
        on_stdout: LineCallback,
        _on_stderr: LineCallback,
    ) -> Result<()> {
        self.state
            .commands
            .lock()
            .unwrap()
            .push((self.id.clone(), command.to_string()));

        if command.contains("runner.mjs") {
            let script = self
                .state
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    vec![r#"{"type":"result","subtype":"success","num_turns":1}"#.to_string()]
                });
            for line in script {
                if let Some(ms) = line.strip_prefix("!sleep:") {
                    let ms: u64 = ms.parse().unwrap_or(10);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                } else {
                    on_stdout(&line);
                }
            }
        }
        Ok(())
    }

    async fn write_files(&self, batch: &[FileEntry]) -> Result<()> {
        if self.state.fail_writes.load(Ordering::Relaxed) {
            return Err(SandboxError::Api {
                status: 500,
                detail: "write rejected".to_string(),
            });
        }
        let paths = batch.iter().map(|entry| entry.path.clone()).collect();
        self.state
            .writes
            .lock()
            .unwrap()
            .push((self.id.clone(), paths));
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.state.destroyed.lock().unwrap().push(self.id.clone());
        Ok(())
    }
}
