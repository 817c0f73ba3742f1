use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::events::AgentEvent;
use crate::request::ExecutionRequest;
use crate::sandbox::run::{AgentRunner, OutputStream};

/// Max pool entries (one per active conversation).
pub const MAX_POOL_ENTRIES: usize = 1000;

/// The stored sandbox id lives inside its own async mutex: holding the lock
/// is what serializes two interactions targeting the same conversation.
type Slot = Arc<AsyncMutex<Option<String>>>;

struct PoolEntry {
    slot: Slot,
    last_used: Instant,
}

/// Keyed sandbox-reuse registry: conversation key to `(sandbox_id | none,
/// mutex)`. Entries are bookkeeping only — evicting one never destroys the
/// underlying environment, which expires via its own timeout.
pub struct ExecutionPool {
    entries: Mutex<HashMap<String, PoolEntry>>,
    max_entries: usize,
}

impl Default for ExecutionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionPool {
    pub fn new() -> Self {
        Self::with_capacity(MAX_POOL_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    /// Get-or-create the entry for `key`, refresh its recency, and evict the
    /// least-recently-used entries past the size bound.
    fn slot(&self, key: &str) -> Slot {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let entry = entries.entry(key.to_string()).or_insert_with(|| PoolEntry {
            slot: Arc::new(AsyncMutex::new(None)),
            last_used: now,
        });
        entry.last_used = now;
        let slot = entry.slot.clone();

        while entries.len() > self.max_entries {
            let victim = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            if let Some(entry) = entries.remove(&victim) {
                if let Ok(id) = entry.slot.try_lock() {
                    if let Some(id) = id.as_ref() {
                        debug!("Evicted sandbox {id} from pool (will auto-expire)");
                    }
                }
            }
        }

        slot
    }

    /// Runs one pooled interaction. The per-key lock is held for the whole
    /// returned stream, so a second interaction on the same key waits rather
    /// than racing; the stored id is re-read only after the lock is held.
    ///
    /// Reuse path: reconnect and run; if the run reports an `error` event or
    /// the reconnect fails, the id is cleared (the environment is left to
    /// expire on its own) and a fresh sandbox is provisioned in the same
    /// interaction. Provisioning failures after this point surface as an
    /// `error` event in the stream, matching what chat surfaces render.
    pub async fn execute(
        &self,
        runner: Arc<AgentRunner>,
        key: &str,
        request: ExecutionRequest,
        run_id: &str,
    ) -> OutputStream {
        let slot = self.slot(key);
        let guard = slot.lock_owned().await;
        let run_id = run_id.to_string();
        let key = key.to_string();

        Box::pin(async_stream::stream! {
            let mut guard = guard;
            let mut done = false;

            if let Some(id) = guard.clone() {
                info!("[{run_id}] Reusing sandbox {id} for key {key}");
                match runner.resume(&request, &run_id, &id, true).await {
                    Ok(run) => {
                        let mut saw_error = false;
                        let mut output = run.output;
                        while let Some(line) = output.next().await {
                            if AgentEvent::parse(&line).is_some_and(|e| e.is_error()) {
                                saw_error = true;
                            }
                            yield line;
                        }
                        if saw_error {
                            warn!("[{run_id}] Sandbox {id} failed, creating new");
                            *guard = None;
                        } else {
                            done = true;
                        }
                    }
                    Err(e) => {
                        warn!("[{run_id}] Reuse of sandbox {id} failed: {e}");
                        *guard = None;
                    }
                }
            }

            if !done {
                match runner.launch(&request, &run_id, true).await {
                    Ok(run) => {
                        *guard = Some(run.sandbox_id.clone());
                        let mut output = run.output;
                        while let Some(line) = output.next().await {
                            yield line;
                        }
                    }
                    Err(e) => {
                        error!("[{run_id}] Failed to start execution: {e}");
                        yield json!({"type": "error", "error": e.to_string()}).to_string();
                    }
                }
            }
            // guard drops here, releasing the key for the next interaction
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaseConfig;
    use crate::sandbox::mock::MockProvider;
    use crate::sandbox::provider::SandboxProvider;

    fn request() -> ExecutionRequest {
        let mut request = ExecutionRequest::new("do a thing");
        request.anthropic_api_key = Some("sk-test".to_string());
        request.sandbox_api_key = Some("sb-test".to_string());
        request
    }

    fn setup() -> (MockProvider, Arc<AgentRunner>) {
        let provider = MockProvider::new();
        let shared: Arc<dyn SandboxProvider> = Arc::new(MockProvider {
            state: provider.state.clone(),
        });
        let runner = Arc::new(AgentRunner::new(shared, BaseConfig::default()));
        (provider, runner)
    }

    #[tokio::test]
    async fn test_concurrent_interactions_share_one_sandbox() {
        let (provider, runner) = setup();
        let pool = Arc::new(ExecutionPool::new());

        // Both arrive with no sandbox id stored for the key
        let (first, second) = tokio::join!(
            async {
                pool.execute(runner.clone(), "chan:1700", request(), "r1")
                    .await
                    .collect::<Vec<_>>()
                    .await
            },
            async {
                pool.execute(runner.clone(), "chan:1700", request(), "r2")
                    .await
                    .collect::<Vec<_>>()
                    .await
            },
        );
        assert!(!first.is_empty() && !second.is_empty());

        // Exactly one create; the later interaction reused the stored id
        assert_eq!(provider.state.created.lock().unwrap().len(), 1);
        assert_eq!(provider.state.connected.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_event_clears_id_and_reprovisions() {
        let (provider, runner) = setup();
        let pool = ExecutionPool::new();

        let lines = pool
            .execute(runner.clone(), "chan:1700", request(), "r1")
            .await
            .collect::<Vec<_>>()
            .await;
        assert!(lines[0].contains("result"));
        assert_eq!(provider.state.created.lock().unwrap().len(), 1);

        // Reused sandbox reports an error: same interaction falls through to
        // a fresh create after clearing the dead id
        provider.push_script(&[r#"{"type":"error","error":"sandbox expired"}"#]);
        let lines = pool
            .execute(runner.clone(), "chan:1700", request(), "r2")
            .await
            .collect::<Vec<_>>()
            .await;
        assert!(lines.iter().any(|l| l.contains("\"error\"")));
        assert!(lines.iter().any(|l| l.contains("result")));
        assert_eq!(provider.state.created.lock().unwrap().len(), 2);
        assert_eq!(provider.state.connected.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_reconnect_falls_through_to_create() {
        let (provider, runner) = setup();
        let pool = ExecutionPool::new();

        pool.execute(runner.clone(), "chan:1700", request(), "r1")
            .await
            .collect::<Vec<_>>()
            .await;
        provider.fail_connects();

        let lines = pool
            .execute(runner.clone(), "chan:1700", request(), "r2")
            .await
            .collect::<Vec<_>>()
            .await;
        assert!(lines.iter().any(|l| l.contains("result")));
        assert_eq!(provider.state.created.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_different_keys_get_different_sandboxes() {
        let (provider, runner) = setup();
        let pool = ExecutionPool::new();

        pool.execute(runner.clone(), "chan:1", request(), "r1")
            .await
            .collect::<Vec<_>>()
            .await;
        pool.execute(runner.clone(), "chan:2", request(), "r2")
            .await
            .collect::<Vec<_>>()
            .await;

        assert_eq!(provider.state.created.lock().unwrap().len(), 2);
        assert!(provider.state.connected.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_eviction_is_recency_based_and_bounded() {
        let (_provider, runner) = setup();
        let pool = ExecutionPool::with_capacity(2);

        for key in ["a", "b", "c"] {
            pool.execute(runner.clone(), key, request(), key)
                .await
                .collect::<Vec<_>>()
                .await;
        }

        assert_eq!(pool.len(), 2);
        assert!(!pool.contains("a"));
        assert!(pool.contains("b") && pool.contains("c"));
    }

    #[tokio::test]
    async fn test_eviction_never_destroys_sandboxes() {
        let (provider, runner) = setup();
        let pool = ExecutionPool::with_capacity(1);

        pool.execute(runner.clone(), "a", request(), "r1")
            .await
            .collect::<Vec<_>>()
            .await;
        pool.execute(runner.clone(), "b", request(), "r2")
            .await
            .collect::<Vec<_>>()
            .await;

        assert_eq!(pool.len(), 1);
        // keep_alive executions: nothing was ever destroyed, evicted or not
        assert!(provider.state.destroyed.lock().unwrap().is_empty());
    }
}
