use thiserror::Error;

/// Errors surfaced by the sandbox orchestration core.
///
/// `ConfigValidation` is always raised before provisioning; `Provisioning`,
/// `Upload` and `Api` can only occur before any output has streamed (failures
/// after that point travel as structured `error` events inside the output
/// sequence instead).
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Bad request shape: invalid skill/agent name, name-addressed operations
    /// against a list-form agents config, oversized file map, path traversal.
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    /// Sandbox create/reconnect failed after the one template-fallback retry.
    #[error("failed to provision sandbox: {0}")]
    Provisioning(String),

    /// The requested template does not exist on the provider.
    /// Triggers the one documented fallback in the provisioner.
    #[error("sandbox template not found: {0}")]
    TemplateNotFound(String),

    /// A batched file write failed. Reports the attempted paths, never
    /// file contents.
    #[error("failed to upload {count} files to sandbox ({paths})")]
    Upload { count: usize, paths: String },

    /// The in-sandbox command exited non-zero. Expected and suppressed at the
    /// task level — the runner emits its own structured error line first.
    #[error("sandbox command failed: {0}")]
    Execution(String),

    /// Provider API rejected a request.
    #[error("sandbox provider returned {status}: {detail}")]
    Api { status: u16, detail: String },

    #[error("sandbox provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
