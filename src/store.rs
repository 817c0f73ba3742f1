use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// JSONL file the store appends to, relative to the working directory.
pub const DEFAULT_STORE_PATH: &str = ".sandrunner/runs.jsonl";

/// In-memory bound; the JSONL file keeps full history.
const MAX_RUNS: usize = 200;

const PROMPT_PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub prompt: String,
    pub model: Option<String>,
    /// "running", "completed", or "error".
    pub status: String,
    pub started_at: String,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub num_turns: Option<u64>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub files_count: usize,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub feedback_user: Option<String>,
}

#[derive(Default)]
struct Inner {
    order: VecDeque<String>,
    index: HashMap<String, RunRecord>,
}

/// Bounded in-memory run history backed by a JSONL file. Each state change
/// appends the full record; reload applies lines last-write-wins.
pub struct RunStore {
    path: PathBuf,
    max_runs: usize,
    inner: Mutex<Inner>,
}

impl RunStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_capacity(path, MAX_RUNS)
    }

    pub fn with_capacity(path: impl Into<PathBuf>, max_runs: usize) -> Self {
        let store = Self {
            path: path.into(),
            max_runs,
            inner: Mutex::new(Inner::default()),
        };
        store.load();
        store
    }

    pub fn create(&self, id: &str, prompt: &str, model: Option<&str>, files_count: usize) {
        let record = RunRecord {
            id: id.to_string(),
            prompt: prompt.chars().take(PROMPT_PREVIEW_CHARS).collect(),
            model: model.map(str::to_string),
            status: "running".to_string(),
            started_at: Utc::now().to_rfc3339(),
            cost_usd: None,
            num_turns: None,
            duration_secs: None,
            error: None,
            files_count,
            feedback: None,
            feedback_user: None,
        };
        let mut inner = self.inner.lock().unwrap();
        self.append(&record);
        push_bounded(&mut inner, record, self.max_runs);
    }

    pub fn complete(
        &self,
        id: &str,
        cost_usd: Option<f64>,
        num_turns: Option<u64>,
        duration_secs: Option<f64>,
        model: Option<&str>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.index.get_mut(id) else {
            warn!("RunStore::complete: unknown run id={id}");
            return;
        };
        record.status = "completed".to_string();
        record.cost_usd = cost_usd;
        record.num_turns = num_turns;
        record.duration_secs = duration_secs;
        if let Some(model) = model {
            record.model = Some(model.to_string());
        }
        self.append(record);
    }

    pub fn fail(&self, id: &str, error: &str, duration_secs: Option<f64>) {
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.index.get_mut(id) else {
            warn!("RunStore::fail: unknown run id={id}");
            return;
        };
        record.status = "error".to_string();
        record.error = Some(error.to_string());
        record.duration_secs = duration_secs;
        self.append(record);
    }

    pub fn set_feedback(&self, id: &str, feedback: &str, user: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.index.get_mut(id) else {
            warn!("RunStore::set_feedback: unknown run id={id}");
            return;
        };
        record.feedback = Some(feedback.to_string());
        record.feedback_user = Some(user.to_string());
        self.append(record);
    }

    /// Newest first.
    pub fn list(&self, limit: usize) -> Vec<RunRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| inner.index.get(id).cloned())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<RunRecord> {
        self.inner.lock().unwrap().index.get(id).cloned()
    }

    fn append(&self, record: &RunRecord) {
        if let Err(e) = append_line(&self.path, record) {
            warn!("RunStore: failed to write to {}: {e}", self.path.display());
        }
    }

    fn load(&self) {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("RunStore: failed to read {}: {e}", self.path.display());
                return;
            }
        };

        let mut inner = self.inner.lock().unwrap();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: RunRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(_) => {
                    warn!("RunStore: skipping malformed line in {}", self.path.display());
                    continue;
                }
            };
            // Last-write-wins: later lines for the same id update in place
            if let Some(existing) = inner.index.get_mut(&record.id) {
                merge(existing, record);
            } else {
                push_bounded(&mut inner, record, self.max_runs);
            }
        }
    }
}

fn push_bounded(inner: &mut Inner, record: RunRecord, max_runs: usize) {
    if inner.order.len() == max_runs {
        if let Some(evicted) = inner.order.pop_front() {
            inner.index.remove(&evicted);
        }
    }
    inner.order.push_back(record.id.clone());
    inner.index.insert(record.id.clone(), record);
}

fn merge(existing: &mut RunRecord, update: RunRecord) {
    existing.status = update.status;
    if update.cost_usd.is_some() {
        existing.cost_usd = update.cost_usd;
    }
    if update.num_turns.is_some() {
        existing.num_turns = update.num_turns;
    }
    if update.duration_secs.is_some() {
        existing.duration_secs = update.duration_secs;
    }
    if update.error.is_some() {
        existing.error = update.error;
    }
    if update.model.is_some() {
        existing.model = update.model;
    }
    if update.feedback.is_some() {
        existing.feedback = update.feedback;
    }
    if update.feedback_user.is_some() {
        existing.feedback_user = update.feedback_user;
    }
}

fn append_line(path: &Path, record: &RunRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", serde_json::to_string(record)?)?;
    Ok(())
}
