use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

/// Buffer between the provider's synchronous output callbacks and the async
/// consumer. Producers never block; the consumer pulls at its own pace and
/// lines are dropped past this point.
pub const QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug)]
enum QueueItem {
    Line(String),
    /// Terminal sentinel — enqueued exactly once when the command task ends.
    Eof,
}

/// Producer half: cheap to clone, safe to call from synchronous callbacks.
#[derive(Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<QueueItem>,
    run_id: String,
    capacity: usize,
    overflow_warned: Arc<AtomicBool>,
    warning_pending: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl OutputSink {
    /// Primary output: enqueued verbatim.
    pub fn stdout(&self, data: &str) {
        self.enqueue(data.to_string());
    }

    /// Diagnostic output: wrapped as a structured side-channel event so the
    /// consumer can tell it apart from primary output.
    pub fn stderr(&self, data: &str) {
        let text = data.trim();
        if !text.is_empty() {
            self.enqueue(json!({"type": "stderr", "data": text}).to_string());
        }
    }

    /// Non-blocking enqueue. On overflow the line is dropped and, on the
    /// first overflow only, a warning event is scheduled for the consumer;
    /// every later drop is counted silently.
    fn enqueue(&self, line: String) {
        if self.tx.try_send(QueueItem::Line(line)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if !self.overflow_warned.swap(true, Ordering::Relaxed) {
                warn!(
                    "[{}] Output queue full (capacity={}), dropping lines — consumer can't keep up",
                    self.run_id, self.capacity
                );
                self.warning_pending.store(true, Ordering::Release);
            }
        }
    }

    /// Enqueues the terminal sentinel. Waits for queue space so the sentinel
    /// itself is never lost; a gone consumer just makes this a no-op.
    pub async fn finish(&self) {
        let _ = self.tx.send(QueueItem::Eof).await;
    }

    /// Total lines dropped to overflow during this execution.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer half: a single-pass pull source of trimmed, non-blank lines.
pub struct StreamBridge {
    rx: mpsc::Receiver<QueueItem>,
    warning_pending: Arc<AtomicBool>,
    finished: bool,
}

impl StreamBridge {
    pub fn new(run_id: &str) -> (OutputSink, StreamBridge) {
        Self::with_capacity(run_id, QUEUE_CAPACITY)
    }

    pub fn with_capacity(run_id: &str, capacity: usize) -> (OutputSink, StreamBridge) {
        let (tx, rx) = mpsc::channel(capacity);
        let warning_pending = Arc::new(AtomicBool::new(false));
        let sink = OutputSink {
            tx,
            run_id: run_id.to_string(),
            capacity,
            overflow_warned: Arc::new(AtomicBool::new(false)),
            warning_pending: warning_pending.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let bridge = StreamBridge {
            rx,
            warning_pending,
            finished: false,
        };
        (sink, bridge)
    }

    /// Pulls the next non-blank line, or `None` once the sentinel arrives.
    /// The pending overflow warning, if any, is delivered before further
    /// lines so the consumer learns about the loss losslessly.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if self.take_pending_warning() {
                return Some(overflow_warning_line());
            }
            if self.finished {
                return None;
            }
            match self.rx.recv().await {
                Some(QueueItem::Line(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Some(trimmed.to_string());
                }
                Some(QueueItem::Eof) | None => {
                    self.finished = true;
                    // Deliver a warning that raced with the sentinel
                    if self.take_pending_warning() {
                        return Some(overflow_warning_line());
                    }
                    return None;
                }
            }
        }
    }

    fn take_pending_warning(&self) -> bool {
        self.warning_pending.swap(false, Ordering::Acquire)
    }
}

fn overflow_warning_line() -> String {
    json!({
        "type": "warning",
        "message": "Output buffer full, some messages may be dropped",
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AgentEvent;

    #[tokio::test]
    async fn test_lines_flow_in_order() {
        let (sink, mut bridge) = StreamBridge::with_capacity("test", 16);
        sink.stdout("one");
        sink.stdout("two");
        sink.finish().await;

        assert_eq!(bridge.next_line().await.as_deref(), Some("one"));
        assert_eq!(bridge.next_line().await.as_deref(), Some("two"));
        assert_eq!(bridge.next_line().await, None);
        // Single-pass: stays terminated
        assert_eq!(bridge.next_line().await, None);
    }

    #[tokio::test]
    async fn test_blank_lines_discarded_and_trimmed() {
        let (sink, mut bridge) = StreamBridge::with_capacity("test", 16);
        sink.stdout("   ");
        sink.stdout("");
        sink.stdout("  payload \n");
        sink.finish().await;

        assert_eq!(bridge.next_line().await.as_deref(), Some("payload"));
        assert_eq!(bridge.next_line().await, None);
    }

    #[tokio::test]
    async fn test_stderr_wrapped_with_type_tag() {
        let (sink, mut bridge) = StreamBridge::with_capacity("test", 16);
        sink.stderr("  npm WARN deprecated  ");
        sink.stderr("   ");
        sink.finish().await;

        let line = bridge.next_line().await.unwrap();
        match AgentEvent::parse(&line) {
            Some(AgentEvent::Stderr { data }) => assert_eq!(data, "npm WARN deprecated"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(bridge.next_line().await, None);
    }

    #[tokio::test]
    async fn test_overflow_never_blocks_and_warns_once() {
        let (sink, mut bridge) = StreamBridge::with_capacity("test", 4);
        for i in 0..100 {
            // Synchronous, must never block or panic even when full
            sink.stdout(&format!("line-{i}"));
        }
        assert_eq!(sink.dropped(), 96);

        // Drain the buffered lines (plus the injected warning) so the
        // sentinel has room, then terminate
        let mut collected = Vec::new();
        for _ in 0..5 {
            collected.push(bridge.next_line().await.unwrap());
        }
        sink.finish().await;
        assert_eq!(bridge.next_line().await, None);

        let warnings = collected
            .iter()
            .filter(|l| matches!(AgentEvent::parse(l), Some(AgentEvent::Warning { .. })))
            .count();
        assert_eq!(warnings, 1);
        assert_eq!(collected.len() - warnings, 4);
    }

    #[tokio::test]
    async fn test_no_warning_without_overflow() {
        let (sink, mut bridge) = StreamBridge::with_capacity("test", 16);
        sink.stdout("fine");
        sink.finish().await;

        assert_eq!(bridge.next_line().await.as_deref(), Some("fine"));
        assert_eq!(bridge.next_line().await, None);
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn test_sentinel_terminates_even_after_drops() {
        let (sink, mut bridge) = StreamBridge::with_capacity("test", 1);
        sink.stdout("kept");
        sink.stdout("dropped");

        // Consumer drains concurrently so finish() can enqueue the sentinel
        let consumer = tokio::spawn(async move {
            let mut collected = Vec::new();
            while let Some(line) = bridge.next_line().await {
                collected.push(line);
            }
            collected
        });
        sink.finish().await;

        let collected = consumer.await.unwrap();
        assert!(collected.iter().any(|l| l == "kept"));
        assert!(collected.iter().any(|l| l.contains("\"warning\"")));
    }
}
