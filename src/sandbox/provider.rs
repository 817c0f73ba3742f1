use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SandboxError};

/// One entry of a batched write. All-or-nothing per call on the provider side.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileEntry {
    pub path: String,
    pub data: String,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }
}

pub type LineCallback = Box<dyn Fn(&str) + Send + Sync>;

/// A live remote environment bound to a network session.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Runs a shell command to completion, feeding output lines to the
    /// callbacks as they arrive. A non-zero exit is `SandboxError::Execution`.
    async fn run_command(
        &self,
        command: &str,
        timeout_secs: u64,
        on_stdout: LineCallback,
        on_stderr: LineCallback,
    ) -> Result<()>;

    async fn write_files(&self, batch: &[FileEntry]) -> Result<()>;

    async fn destroy(&self) -> Result<()>;
}

/// Remote sandbox service. The production implementation talks to the
/// provider REST API; tests use a scripted in-memory double.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Creates a fresh environment. An unknown template is
    /// `SandboxError::TemplateNotFound`, which the provisioner turns into the
    /// one documented fallback.
    async fn create(
        &self,
        template: &str,
        api_key: &str,
        timeout_secs: u64,
        envs: &BTreeMap<String, String>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn Sandbox>>;

    /// Binds to a still-alive environment, refreshing (not extending) its
    /// remaining lifetime.
    async fn connect(
        &self,
        sandbox_id: &str,
        api_key: &str,
        timeout_secs: u64,
    ) -> Result<Arc<dyn Sandbox>>;
}

// ── HTTP client ──────────────────────────────────────────────────────────────

const DEFAULT_API_URL: &str = "https://api.e2b.app";

/// Provider REST client. Command output arrives as an NDJSON stream of
/// `{"stream":"stdout"|"stderr","data":...}` records.
pub struct HttpProvider {
    client: Client,
    base_url: String,
}

impl HttpProvider {
    pub fn new() -> Self {
        let base_url = std::env::var("SANDBOX_API_URL")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        Self {
            client: Client::new(),
            base_url,
        }
    }
}

impl Default for HttpProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct SandboxInfo {
    sandbox_id: String,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    template: &'a str,
    timeout_secs: u64,
    envs: &'a BTreeMap<String, String>,
    metadata: &'a BTreeMap<String, String>,
}

async fn error_from_response(response: reqwest::Response) -> SandboxError {
    let status = response.status().as_u16();
    let detail = response.text().await.unwrap_or_default();
    SandboxError::Api { status, detail }
}

#[async_trait]
impl SandboxProvider for HttpProvider {
    async fn create(
        &self,
        template: &str,
        api_key: &str,
        timeout_secs: u64,
        envs: &BTreeMap<String, String>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn Sandbox>> {
        let response = self
            .client
            .post(format!("{}/v2/sandboxes", self.base_url))
            .header("X-API-Key", api_key)
            .json(&CreateRequest {
                template,
                timeout_secs,
                envs,
                metadata,
            })
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SandboxError::TemplateNotFound(template.to_string()));
        }
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let info: SandboxInfo = response.json().await?;
        Ok(Arc::new(HttpSandbox {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: api_key.to_string(),
            id: info.sandbox_id,
        }))
    }

    async fn connect(
        &self,
        sandbox_id: &str,
        api_key: &str,
        timeout_secs: u64,
    ) -> Result<Arc<dyn Sandbox>> {
        let response = self
            .client
            .post(format!(
                "{}/v2/sandboxes/{sandbox_id}/connect",
                self.base_url
            ))
            .header("X-API-Key", api_key)
            .json(&serde_json::json!({ "timeout_secs": timeout_secs }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let detail = response.text().await.unwrap_or_default();
            return Err(SandboxError::Provisioning(format!(
                "cannot reconnect to sandbox {sandbox_id}: {status} {detail}"
            )));
        }

        Ok(Arc::new(HttpSandbox {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: api_key.to_string(),
            id: sandbox_id.to_string(),
        }))
    }
}

struct HttpSandbox {
    client: Client,
    base_url: String,
    api_key: String,
    id: String,
}

#[async_trait]
impl Sandbox for HttpSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run_command(
        &self,
        command: &str,
        timeout_secs: u64,
        on_stdout: LineCallback,
        on_stderr: LineCallback,
    ) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/v2/sandboxes/{}/commands", self.base_url, self.id))
            .header("X-API-Key", &self.api_key)
            .json(&serde_json::json!({
                "command": command,
                "timeout_secs": timeout_secs,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let mut exit_code: Option<i64> = None;
        let mut body = response.bytes_stream();
        let mut buffer = Vec::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]);
                if line.trim().is_empty() {
                    continue;
                }
                dispatch_record(&line, &on_stdout, &on_stderr, &mut exit_code);
            }
        }
        if !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer).to_string();
            dispatch_record(&line, &on_stdout, &on_stderr, &mut exit_code);
        }

        exit_result(exit_code)
    }

    async fn write_files(&self, batch: &[FileEntry]) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/v2/sandboxes/{}/files", self.base_url, self.id))
            .header("X-API-Key", &self.api_key)
            .json(&serde_json::json!({ "files": batch }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        debug!("DELETE sandbox {}", self.id);
        let response = self
            .client
            .delete(format!("{}/v2/sandboxes/{}", self.base_url, self.id))
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;

        // Already-gone is fine: the environment expired on its own
        if !response.status().is_success()
            && response.status() != reqwest::StatusCode::NOT_FOUND
        {
            return Err(error_from_response(response).await);
        }
        Ok(())
    }
}

/// Maps the final exit record to the command's outcome. A stream that ended
/// without one (truncated response) is a failure, not a silent success.
fn exit_result(exit_code: Option<i64>) -> Result<()> {
    match exit_code {
        Some(0) => Ok(()),
        Some(code) => Err(SandboxError::Execution(format!(
            "command exited with status {code}"
        ))),
        None => Err(SandboxError::Execution(
            "command stream ended without an exit status".to_string(),
        )),
    }
}

/// Routes one NDJSON record from the command stream to the right callback.
fn dispatch_record(
    line: &str,
    on_stdout: &LineCallback,
    on_stderr: &LineCallback,
    exit_code: &mut Option<i64>,
) {
    let record: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        // Not a framing record — treat as raw stdout
        Err(_) => {
            on_stdout(line);
            return;
        }
    };

    if let Some(code) = record.get("exit_code").and_then(Value::as_i64) {
        *exit_code = Some(code);
        return;
    }
    let data = record.get("data").and_then(Value::as_str).unwrap_or("");
    match record.get("stream").and_then(Value::as_str) {
        Some("stderr") => on_stderr(data),
        _ => on_stdout(data),
    }
}
