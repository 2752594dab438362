//! Flight recorder: bounded, async capture of everything a turn did.
//!
//! Records go onto an in-memory queue; a background task flushes them
//! in batches to an append-only sink. Nothing here ever blocks the
//! user-visible path, and recorder failures never reach it either.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use aide_core::id::{PageId, TurnId};
use aide_core::primitive::Primitive;
use aide_core::state::PageState;
use aide_core::{Source, TierLevel, Timestamp};
use aide_util_error::{BoxedErrorResult, FmtCompact as _};

use crate::LOG_TARGET;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelCall {
    pub tier: TierLevel,
    pub model: String,
    pub prompt: String,
    pub response_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    pub latency_ms: u64,
    #[serde(default)]
    pub shadow: bool,
    /// Primitives this call emitted. For shadow calls they are recorded
    /// here and nowhere else; they never mutate state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primitives: Vec<Primitive>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlightRecord {
    pub turn_id: TurnId,
    pub page_id: PageId,
    pub actor: String,
    pub source: Source,
    pub started_at: Timestamp,
    pub user_message: String,
    pub snapshot_before: PageState,
    pub snapshot_after: PageState,
    pub model_calls: Vec<ModelCall>,
    pub primitives: Vec<Primitive>,
    pub applied_count: usize,
    pub rejected_count: usize,
    pub total_latency_ms: u64,
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn append(&self, records: Vec<FlightRecord>) -> BoxedErrorResult<()>;
}

/// Append-only JSONL file sink. A record that fails to serialize is
/// skipped alone; the rest of the batch still lands.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordSink for JsonlSink {
    async fn append(&self, records: Vec<FlightRecord>) -> BoxedErrorResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut lines = String::new();
        for record in &records {
            match serde_json::to_string(record) {
                Ok(line) => {
                    lines.push_str(&line);
                    lines.push('\n');
                }
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        turn_id = %record.turn_id,
                        err = %err.fmt_compact(),
                        "Skipping unserializable flight record"
                    );
                }
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySink {
    pub records: Mutex<Vec<FlightRecord>>,
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn append(&self, records: Vec<FlightRecord>) -> BoxedErrorResult<()> {
        self.records
            .lock()
            .expect("Locking failed")
            .extend(records);
        Ok(())
    }
}

struct RecorderShared {
    queue: Mutex<VecDeque<FlightRecord>>,
    notify: Notify,
    capacity: usize,
    batch: usize,
    sink: Arc<dyn RecordSink>,
    shutdown: AtomicBool,
}

pub struct FlightRecorder {
    shared: Arc<RecorderShared>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl FlightRecorder {
    /// Spawns the background flusher; requires a tokio runtime.
    pub fn spawn(
        sink: Arc<dyn RecordSink>,
        capacity: usize,
        batch: usize,
        flush_interval: Duration,
    ) -> Self {
        let shared = Arc::new(RecorderShared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            batch,
            sink,
            shutdown: AtomicBool::new(false),
        });
        let flusher = tokio::spawn(run_flusher(shared.clone(), flush_interval));
        Self {
            shared,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Enqueue one record; never blocks. Overflow drops the oldest.
    pub fn enqueue(&self, record: FlightRecord) {
        let mut queue = self.shared.queue.lock().expect("Locking failed");
        if self.shared.capacity <= queue.len() {
            let dropped = queue.pop_front();
            warn!(
                target: LOG_TARGET,
                dropped_turn = %dropped.map(|r| r.turn_id.to_string()).unwrap_or_default(),
                "Flight recorder queue full, dropping oldest record"
            );
        }
        queue.push_back(record);
        let pending = queue.len();
        drop(queue);

        if self.shared.batch <= pending {
            self.shared.notify.notify_one();
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().expect("Locking failed").len()
    }

    /// Drain everything queued right now, bypassing the timer.
    pub async fn flush(&self) {
        flush_all(&self.shared).await;
    }

    /// Stop the flusher and drain the queue.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
        let handle = self
            .flusher
            .lock()
            .expect("Locking failed")
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(target: LOG_TARGET, err = %err, "Flight recorder flusher panicked");
            }
        }
        self.flush().await;
    }
}

#[instrument(name = "flight-recorder", skip_all)]
async fn run_flusher(shared: Arc<RecorderShared>, flush_interval: Duration) {
    debug!(target: LOG_TARGET, "Flight recorder flusher started");
    loop {
        tokio::select! {
            _ = shared.notify.notified() => {}
            _ = tokio::time::sleep(flush_interval) => {}
        }
        let stop = shared.shutdown.load(Ordering::SeqCst);
        flush_all(&shared).await;
        if stop {
            break;
        }
    }
    debug!(target: LOG_TARGET, "Flight recorder flusher stopped");
}

/// Drain the queue in batch-sized chunks until it is empty.
async fn flush_all(shared: &RecorderShared) {
    loop {
        let batch: Vec<FlightRecord> = {
            let mut queue = shared.queue.lock().expect("Locking failed");
            let take = queue.len().min(shared.batch);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        if let Err(err) = shared.sink.append(batch).await {
            // Recorder errors never reach the user path; the records
            // in this batch are gone, which the log has to own.
            warn!(
                target: LOG_TARGET,
                count,
                err = %(&*err as &dyn std::error::Error).fmt_compact(),
                "Failed to flush flight records"
            );
            return;
        }
        debug!(target: LOG_TARGET, count, "Flushed flight records");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(turn_id: TurnId) -> FlightRecord {
        FlightRecord {
            turn_id,
            page_id: PageId::generate(),
            actor: "user_1".into(),
            source: Source::Web,
            started_at: Timestamp::now(),
            user_message: "add milk".into(),
            snapshot_before: PageState::new(),
            snapshot_after: PageState::new(),
            model_calls: Vec::new(),
            primitives: Vec::new(),
            applied_count: 0,
            rejected_count: 0,
            total_latency_ms: 12,
        }
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn batch_threshold_triggers_flush() {
        let sink = Arc::new(MemorySink::default());
        let recorder =
            FlightRecorder::spawn(sink.clone(), 100, 2, Duration::from_secs(3600));

        recorder.enqueue(record(TurnId::generate()));
        assert_eq!(recorder.pending(), 1);
        recorder.enqueue(record(TurnId::generate()));

        // The flusher runs on notify; give it a moment.
        for _ in 0..50 {
            if recorder.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.records.lock().expect("Locking failed").len(), 2);
        recorder.shutdown().await;
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn overflow_drops_oldest() {
        let sink = Arc::new(MemorySink::default());
        let recorder =
            FlightRecorder::spawn(sink.clone(), 2, 100, Duration::from_secs(3600));

        let first = TurnId::generate();
        let second = TurnId::generate();
        let third = TurnId::generate();
        recorder.enqueue(record(first));
        recorder.enqueue(record(second));
        recorder.enqueue(record(third));
        assert_eq!(recorder.pending(), 2);

        recorder.shutdown().await;
        let records = sink.records.lock().expect("Locking failed");
        let turns: Vec<TurnId> = records.iter().map(|r| r.turn_id).collect();
        assert_eq!(turns, vec![second, third]);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("flight/records.jsonl");
        let sink = JsonlSink::new(&path);

        sink.append(vec![record(TurnId::generate())])
            .await
            .expect("appends");
        sink.append(vec![record(TurnId::generate())])
            .await
            .expect("appends");

        let content = std::fs::read_to_string(&path).expect("file exists");
        assert_eq!(content.lines().count(), 2);
        let parsed: FlightRecord =
            serde_json::from_str(content.lines().next().expect("line")).expect("parses");
        assert_eq!(parsed.user_message, "add milk");
    }
}
