use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use gattkit_protocol::{TraceEvent, TraceEventKind};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, instrument, warn};

pub const DEFAULT_TAIL_CAPACITY: usize = 1000;
const STREAM_BUFFER: usize = 1024;

#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn append(&self, event: &TraceEvent) -> Result<()>;
    async fn read_from(&self, from_sequence: u64, limit: usize) -> Result<Vec<TraceEvent>>;
    async fn latest_sequence(&self) -> Result<u64>;
}

/// Append-only jsonl trace file. Appends must carry the next sequence number.
#[derive(Debug)]
pub struct FileTraceStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
    sequence_cache: Mutex<Option<u64>>,
}

impl FileTraceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
            sequence_cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create trace dir {parent:?}"))?;
        }
        Ok(())
    }

    async fn scan_latest_sequence(path: &Path) -> Result<u64> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(0);
        }

        let file = OpenOptions::new().read(true).open(path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut latest = 0_u64;

        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: TraceEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed parsing trace line in {path:?}"))?;
            latest = latest.max(event.seq);
        }
        Ok(latest)
    }
}

#[async_trait]
impl TraceStore for FileTraceStore {
    #[instrument(skip(self, event), fields(seq = event.seq, event = event.kind.name()))]
    async fn append(&self, event: &TraceEvent) -> Result<()> {
        Self::ensure_parent(&self.path).await?;
        let _guard = self.write_lock.lock().await;

        let cached = *self.sequence_cache.lock();
        let latest = match cached {
            Some(latest) => latest,
            None => Self::scan_latest_sequence(&self.path).await?,
        };

        let expected_sequence = latest.saturating_add(1);
        if event.seq != expected_sequence {
            warn!(
                expected_sequence,
                actual_sequence = event.seq,
                "sequence conflict while appending trace event"
            );
            bail!(
                "trace sequence conflict: expected {}, got {}",
                expected_sequence,
                event.seq
            );
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed opening trace file {:?}", self.path))?;

        let line = serde_json::to_string(event).context("failed serializing trace event")?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        *self.sequence_cache.lock() = Some(event.seq);
        debug!("trace event appended");
        Ok(())
    }

    async fn read_from(&self, from_sequence: u64, limit: usize) -> Result<Vec<TraceEvent>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&self.path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut out = Vec::new();

        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: TraceEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed parsing trace line in {:?}", self.path))?;
            if event.seq >= from_sequence {
                out.push(event);
            }
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn latest_sequence(&self) -> Result<u64> {
        let cached = *self.sequence_cache.lock();
        if let Some(latest) = cached {
            return Ok(latest);
        }
        let latest = Self::scan_latest_sequence(&self.path).await?;
        *self.sequence_cache.lock() = Some(latest);
        Ok(latest)
    }
}

#[derive(Clone, Debug)]
pub struct EventStreamHub {
    sender: broadcast::Sender<TraceEvent>,
}

impl EventStreamHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, event: TraceEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<TraceEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceStatus {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub events_recorded: u64,
    pub tail_len: usize,
    pub tail_capacity: usize,
}

struct JournalState {
    last_seq: u64,
    tail: VecDeque<TraceEvent>,
}

/// Numbers, keeps, persists and broadcasts trace events.
///
/// The in-memory tail holds at most `tail_capacity` events. Persistence
/// failures are logged and do not fail the caller.
#[derive(Clone)]
pub struct TraceJournal {
    store: Option<Arc<dyn TraceStore>>,
    path: Option<PathBuf>,
    stream: EventStreamHub,
    tail_capacity: usize,
    state: Arc<tokio::sync::Mutex<JournalState>>,
}

impl TraceJournal {
    pub fn in_memory(tail_capacity: usize) -> Self {
        Self {
            store: None,
            path: None,
            stream: EventStreamHub::new(STREAM_BUFFER),
            tail_capacity: tail_capacity.max(1),
            state: Arc::new(tokio::sync::Mutex::new(JournalState {
                last_seq: 0,
                tail: VecDeque::new(),
            })),
        }
    }

    /// Open a journal backed by a jsonl file, resuming its numbering and tail.
    pub async fn with_file(path: impl Into<PathBuf>, tail_capacity: usize) -> Result<Self> {
        let path = path.into();
        let store = Arc::new(FileTraceStore::new(path.clone()));
        let mut journal = Self::in_memory(tail_capacity);
        let last_seq = store.latest_sequence().await?;
        let from = last_seq.saturating_sub(journal.tail_capacity as u64) + 1;
        let tail = store.read_from(from, journal.tail_capacity).await?;
        {
            let mut state = journal.state.lock().await;
            state.last_seq = last_seq;
            state.tail = tail.into();
        }
        debug!(path = ?path, last_seq, "trace journal opened");
        journal.store = Some(store);
        journal.path = Some(path);
        Ok(journal)
    }

    pub async fn append_and_publish(&self, kind: TraceEventKind) -> TraceEvent {
        let mut state = self.state.lock().await;
        let event = TraceEvent {
            seq: state.last_seq + 1,
            ts: Utc::now(),
            kind,
        };
        if let Some(store) = &self.store
            && let Err(err) = store.append(&event).await
        {
            warn!(error = %err, seq = event.seq, "failed to persist trace event");
        }
        state.last_seq = event.seq;
        state.tail.push_back(event.clone());
        while state.tail.len() > self.tail_capacity {
            state.tail.pop_front();
        }
        drop(state);
        self.stream.publish(event.clone());
        event
    }

    /// The most recent `n` events, oldest first.
    pub async fn tail(&self, n: usize) -> Vec<TraceEvent> {
        let state = self.state.lock().await;
        let skip = state.tail.len().saturating_sub(n);
        state.tail.iter().skip(skip).cloned().collect()
    }

    pub async fn status(&self) -> TraceStatus {
        let state = self.state.lock().await;
        TraceStatus {
            enabled: self.store.is_some(),
            path: self.path.clone(),
            events_recorded: state.last_seq,
            tail_len: state.tail.len(),
            tail_capacity: self.tail_capacity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.stream.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<TraceEvent> {
        self.stream.subscribe_stream()
    }
}
